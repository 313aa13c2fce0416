//! Per-plugin context managers: one independent context per task, with
//! at-most-one in-flight operation per task id.

mod collector;
mod publisher;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use snafu::Snafu;

use crate::config::ConfigError;
use crate::plugin::{PluginError, PluginType};
use crate::stats::StatsSnapshot;

pub use collector::ContextManager;
pub use publisher::PublisherContextManager;

#[derive(Debug, Snafu)]
pub enum TaskError {
    #[snafu(display("can't process request, other request for the same id ({task_id}) is in progress"))]
    InProgress { task_id: String },

    #[snafu(display("context with id {task_id} was already defined"))]
    AlreadyLoaded { task_id: String },

    #[snafu(display("context with id {task_id} is not defined"))]
    UnknownTask { task_id: String },

    #[snafu(display("can't load task: {source}"))]
    InvalidConfig { source: ConfigError },

    #[snafu(display("user-defined {hook} method ended with error: {message}"))]
    User { hook: &'static str, message: String },
}

/// Static plugin description returned by the Info RPC.
#[derive(Debug, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub metrics: Vec<String>,
    pub groups: BTreeMap<String, String>,
    pub loaded_tasks: usize,
    pub stats: StatsSnapshot,
}

/// The set of task ids with an operation in flight. Activation is a
/// compare-and-insert under the mutex; completion removes the entry when the
/// guard drops.
#[derive(Debug, Default)]
pub(crate) struct ActiveTasks {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveTasks {
    pub(crate) fn activate(&self, task_id: &str) -> Result<ActivationGuard, TaskError> {
        let mut active = self.inner.lock().expect("poisoned lock");
        if !active.insert(task_id.to_string()) {
            return InProgressSnafu { task_id }.fail();
        }
        Ok(ActivationGuard {
            active: Arc::clone(&self.inner),
            task_id: task_id.to_string(),
        })
    }
}

pub(crate) struct ActivationGuard {
    active: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("poisoned lock")
            .remove(&self.task_id);
    }
}

/// Runs a user hook on a blocking thread, converting returned errors and
/// panics into [`TaskError::User`] so they never take the process down.
pub(crate) async fn run_user_hook(
    hook: &'static str,
    f: Box<dyn FnOnce() -> Result<(), PluginError> + Send + 'static>,
) -> Result<(), TaskError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => UserSnafu {
            hook,
            message: error.to_string(),
        }
        .fail(),
        Err(join_error) => UserSnafu {
            hook,
            message: join_error.to_string(),
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_is_exclusive_per_task_id() {
        let active = ActiveTasks::default();

        let first = active.activate("7").unwrap();
        assert!(matches!(
            active.activate("7"),
            Err(TaskError::InProgress { .. })
        ));

        // Distinct task ids are unaffected.
        let _other = active.activate("8").unwrap();

        drop(first);
        assert!(active.activate("7").is_ok());
    }

    #[tokio::test]
    async fn user_panics_become_task_errors() {
        let result = run_user_hook("Collect", Box::new(|| panic!("boom"))).await;
        assert!(matches!(result, Err(TaskError::User { .. })));
    }

    #[tokio::test]
    async fn user_errors_become_task_errors() {
        let result = run_user_hook("Load", Box::new(|| Err("bad input".into()))).await;
        match result {
            Err(TaskError::User { hook, message }) => {
                assert_eq!(hook, "Load");
                assert!(message.contains("bad input"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
