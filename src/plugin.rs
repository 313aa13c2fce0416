//! Traits implemented by plugin authors, and the schema declaration surface.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::error;

use crate::context::{CollectContext, PublishContext};
use crate::namespace::TreeValidator;

/// Errors returned by user-supplied hooks.
pub type PluginError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginType {
    Collector,
    StreamingCollector,
    Publisher,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::Collector => f.write_str("collector"),
            PluginType::StreamingCollector => f.write_str("streaming-collector"),
            PluginType::Publisher => f.write_str("publisher"),
        }
    }
}

/// Metadata attached to a declared metric selector.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDefinition {
    pub unit: String,
    pub is_default: bool,
    pub description: String,
}

/// The declared metric schema of a collector: which selectors may be
/// emitted, with their metadata, plus descriptions of dynamic groups.
///
/// Built once during plugin startup and read-only afterwards.
#[derive(Debug)]
pub struct CollectorDefinition {
    validator: TreeValidator,
    metrics: IndexMap<String, MetricDefinition>,
    groups: HashMap<String, String>,
}

impl CollectorDefinition {
    pub(crate) fn new() -> Self {
        Self {
            validator: TreeValidator::definition(),
            metrics: IndexMap::new(),
            groups: HashMap::new(),
        }
    }

    /// Declares a supported metric selector with its unit, default flag and
    /// description. Malformed selectors are logged and skipped.
    pub fn define_metric(
        &mut self,
        selector: &str,
        unit: &str,
        is_default: bool,
        description: &str,
    ) {
        if let Err(error) = self.validator.add_rule(selector) {
            error!(%error, selector, "wrong metric definition");
            return;
        }

        self.metrics.insert(
            selector.to_string(),
            MetricDefinition {
                unit: unit.to_string(),
                is_default,
                description: description.to_string(),
            },
        );
    }

    /// Declares the description of a dynamic (group) namespace element.
    pub fn define_group(&mut self, name: &str, description: &str) {
        self.groups.insert(name.to_string(), description.to_string());
    }

    pub(crate) fn validator(&self) -> &TreeValidator {
        &self.validator
    }

    pub(crate) fn metric_definition(&self, selector: &str) -> Option<&MetricDefinition> {
        self.metrics.get(selector)
    }

    pub(crate) fn group_description(&self, group: &str) -> Option<&str> {
        self.groups.get(group).map(String::as_str)
    }

    pub(crate) fn metric_selectors(&self) -> Vec<String> {
        self.metrics.keys().cloned().collect()
    }

    pub(crate) fn groups(&self) -> &HashMap<String, String> {
        &self.groups
    }
}

/// A metric-producing plugin.
///
/// Only `collect` is mandatory; the remaining hooks are capabilities with
/// no-op defaults, queried by the context manager at runtime.
pub trait Collector: Send + Sync + 'static {
    /// Declares the supported metrics and groups.
    fn define(&self, definition: &mut CollectorDefinition) -> Result<(), PluginError> {
        let _ = definition;
        Ok(())
    }

    /// Called when the host loads a task.
    fn load(&self, context: &CollectContext) -> Result<(), PluginError> {
        let _ = context;
        Ok(())
    }

    /// Called when the host unloads a task.
    fn unload(&self, context: &CollectContext) -> Result<(), PluginError> {
        let _ = context;
        Ok(())
    }

    /// Produces metrics for one collection cycle via `context.add_metric`.
    fn collect(&self, context: &CollectContext) -> Result<(), PluginError>;
}

/// A collector whose collect call emits metrics continuously; chunks are
/// streamed to the host while the call is still running.
pub trait StreamingCollector: Send + Sync + 'static {
    fn define(&self, definition: &mut CollectorDefinition) -> Result<(), PluginError> {
        let _ = definition;
        Ok(())
    }

    fn load(&self, context: &CollectContext) -> Result<(), PluginError> {
        let _ = context;
        Ok(())
    }

    fn unload(&self, context: &CollectContext) -> Result<(), PluginError> {
        let _ = context;
        Ok(())
    }

    fn streaming_collect(&self, context: &CollectContext) -> Result<(), PluginError>;
}

/// A metric-consuming plugin.
pub trait Publisher: Send + Sync + 'static {
    fn load(&self, context: &PublishContext) -> Result<(), PluginError> {
        let _ = context;
        Ok(())
    }

    fn unload(&self, context: &PublishContext) -> Result<(), PluginError> {
        let _ = context;
        Ok(())
    }

    /// Consumes the metrics of one publish stream.
    fn publish(&self, context: &PublishContext) -> Result<(), PluginError>;
}
