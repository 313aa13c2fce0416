use std::ops::Deref;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::TaskContext;
use crate::config::ConfigError;
use crate::metric::Metric;

/// Task context handed to publisher hooks. The metrics of the current
/// publish stream are reassembled into an in-memory list before user code
/// runs.
#[derive(Debug)]
pub struct PublishContext {
    task_id: String,
    inner: TaskContext,
    session: Mutex<Vec<Metric>>,
}

impl PublishContext {
    pub(crate) fn new(
        task_id: &str,
        raw_config: &[u8],
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            task_id: task_id.to_string(),
            inner: TaskContext::new(raw_config, cancel)?,
            session: Mutex::new(Vec::new()),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// All metrics received on the current publish stream, in wire order.
    pub fn list_all_metrics(&self) -> Vec<Metric> {
        self.session.lock().expect("poisoned lock").clone()
    }

    pub fn count(&self) -> usize {
        self.session.lock().expect("poisoned lock").len()
    }

    pub(crate) fn begin_session(&self, metrics: Vec<Metric>) {
        *self.session.lock().expect("poisoned lock") = metrics;
    }

    pub(crate) fn end_session(&self) {
        self.session.lock().expect("poisoned lock").clear();
    }
}

impl Deref for PublishContext {
    type Target = TaskContext;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
