//! Per-task state shared by collector and publisher plugins: configuration,
//! the user object store, bounded warnings, and cancellation.

mod collect;
mod publish;

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use snafu::{OptionExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{flatten_json, ConfigError};
use crate::metric::Warning;

pub use collect::{CollectContext, MetricError};
pub use publish::PublishContext;

/// Maximum length of a single warning message, in characters.
pub const MAX_WARNING_MESSAGE_LEN: usize = 256;
/// Maximum number of warnings retained per task.
pub const MAX_WARNINGS: usize = 40;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("couldn't find an object with the given key ({key})"))]
    KeyNotFound { key: String },

    #[snafu(display("type of the destination doesn't match the type of the stored value ({key})"))]
    TypeMismatch { key: String },
}

/// State common to every task context.
#[derive(Debug)]
pub struct TaskContext {
    raw_config: Vec<u8>,
    flat_config: BTreeMap<String, String>,
    store: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    warnings: Mutex<Vec<Warning>>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(raw_config: &[u8], cancel: CancellationToken) -> Result<Self, ConfigError> {
        let flat_config = flatten_json(raw_config)?;
        Ok(Self {
            raw_config: raw_config.to_vec(),
            flat_config,
            store: RwLock::new(HashMap::new()),
            warnings: Mutex::new(Vec::new()),
            cancel,
        })
    }

    /// Looks up a flattened (dotted-key) configuration value.
    pub fn config(&self, key: &str) -> Option<&str> {
        self.flat_config.get(key).map(String::as_str)
    }

    pub fn config_keys(&self) -> Vec<String> {
        self.flat_config.keys().cloned().collect()
    }

    pub fn raw_config(&self) -> &[u8] {
        &self.raw_config
    }

    /// Stores a task-scoped object under the given key.
    pub fn store_value(&self, key: &str, value: impl Any + Send + Sync) {
        self.store
            .write()
            .expect("poisoned lock")
            .insert(key.to_string(), Arc::new(value));
    }

    pub fn load_value(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.store.read().expect("poisoned lock").get(key).cloned()
    }

    /// Typed load: copies the stored value into `dest`, failing when the key
    /// is absent or the stored type doesn't match the destination.
    pub fn load_value_into<T>(&self, key: &str, dest: &mut T) -> Result<(), StoreError>
    where
        T: Any + Clone,
    {
        let store = self.store.read().expect("poisoned lock");
        let stored = store.get(key).context(KeyNotFoundSnafu { key })?;
        let value = stored
            .downcast_ref::<T>()
            .context(TypeMismatchSnafu { key })?;
        *dest = value.clone();
        Ok(())
    }

    /// Records a warning for the current task. Warnings are dropped once the
    /// task is canceled or the per-task ceiling is reached; messages are
    /// truncated to [`MAX_WARNING_MESSAGE_LEN`] characters.
    pub fn add_warning(&self, message: &str) {
        if self.is_done() {
            warn!("task has been canceled; warning dropped");
            return;
        }

        let mut warnings = self.warnings.lock().expect("poisoned lock");
        if warnings.len() >= MAX_WARNINGS {
            warn!("maximum number of warnings logged; new warning has been ignored");
            return;
        }

        let message = match message.char_indices().nth(MAX_WARNING_MESSAGE_LEN) {
            Some((boundary, _)) => {
                info!("warning message exceeds the maximum allowed size and will be cut off");
                &message[..boundary]
            }
            None => message,
        };

        warnings.push(Warning {
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Returns the accumulated warnings, emptying the buffer when `clear` is
    /// set.
    pub fn warnings(&self, clear: bool) -> Vec<Warning> {
        let mut warnings = self.warnings.lock().expect("poisoned lock");
        if clear {
            std::mem::take(&mut warnings)
        } else {
            warnings.clone()
        }
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that completes when the task is canceled; suitable for
    /// `done().cancelled().await` in user code.
    pub fn done(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}
