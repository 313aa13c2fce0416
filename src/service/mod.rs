//! The gRPC services exposed to the host agent, the ping watchdog, and the
//! server orchestrator.

mod collect;
mod control;
mod convert;
mod http;
mod publish;
mod server;

use tonic::Status;

use crate::manager::TaskError;

pub use collect::{CollectService, MAX_COLLECT_CHUNK_SIZE};
pub use control::{
    ControlService, ShutdownReason, DEFAULT_MAX_MISSED_PINGS, DEFAULT_PING_TIMEOUT,
};
pub use http::{InfoSource, StatsServer};
pub use publish::PublishService;
pub use server::{serve_collector, serve_publisher, GRACEFUL_STOP_TIMEOUT};

pub(crate) fn into_status(error: TaskError) -> Status {
    let message = error.to_string();
    match error {
        TaskError::InProgress { .. } => Status::aborted(message),
        TaskError::AlreadyLoaded { .. } => Status::already_exists(message),
        TaskError::UnknownTask { .. } => Status::not_found(message),
        TaskError::InvalidConfig { .. } => Status::invalid_argument(message),
        TaskError::User { .. } => Status::internal(message),
    }
}
