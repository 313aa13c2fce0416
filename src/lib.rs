#![deny(clippy::all)]

//! A library for building telemetry collector and publisher plugins that run
//! as long-lived processes and speak a streaming gRPC protocol to a host
//! agent.
//!
//! A plugin author implements [`Collector`] (or [`Publisher`]) and hands it
//! to [`runner::start_collector`]; the library wraps it in a standard
//! process, validates every emitted metric against the declared schema and
//! the host-supplied filter, streams results in bounded chunks, and
//! arbitrates the task lifecycle (ping, load, collect, unload, kill).

pub mod config;
pub mod context;
pub mod manager;
pub mod metric;
pub mod modifier;
pub mod namespace;
pub mod plugin;
pub mod runner;
pub mod service;
pub mod stats;
pub mod test_util;

pub use config::ConfigError;
pub use context::{CollectContext, MetricError, PublishContext, StoreError, TaskContext};
pub use manager::{ContextManager, PluginInfo, PublisherContextManager, TaskError};
pub use metric::{Metric, Tags, Value, Warning};
pub use modifier::{Modifier, Saturator};
pub use namespace::{Namespace, NamespaceElement, ParseError};
pub use plugin::{
    Collector, CollectorDefinition, MetricDefinition, PluginError, PluginType, Publisher,
    StreamingCollector,
};
pub use runner::{start_collector, start_publisher, start_streaming_collector, Options};
pub use service::ShutdownReason;
