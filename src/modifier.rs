//! Metric modifiers: transformations applied to a metric at emission time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::metric::{Metric, Tags};

/// A transformation applied to a metric before it enters the session buffer.
#[derive(Debug, Clone)]
pub enum Modifier {
    /// Merge the given tags into the metric, overwriting existing keys.
    Tags(Tags),
    /// Override the declared unit.
    Unit(String),
    /// Stamp an explicit timestamp instead of the emission time.
    Timestamp(DateTime<Utc>),
    /// Override the declared description.
    Description(String),
}

impl Modifier {
    pub fn tags<K, V>(tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Modifier::Tags(
            tags.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn unit(unit: impl Into<String>) -> Self {
        Modifier::Unit(unit.into())
    }

    pub fn timestamp(timestamp: DateTime<Utc>) -> Self {
        Modifier::Timestamp(timestamp)
    }

    pub fn description(description: impl Into<String>) -> Self {
        Modifier::Description(description.into())
    }

    pub(crate) fn apply(&self, metric: &mut Metric) {
        match self {
            Modifier::Tags(tags) => {
                metric
                    .tags
                    .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Modifier::Unit(unit) => metric.unit = unit.clone(),
            Modifier::Timestamp(timestamp) => metric.timestamp = *timestamp,
            Modifier::Description(description) => metric.description = description.clone(),
        }
    }
}

/// Handle returned by `always_apply`; invoking it disables the registered
/// modifiers for the rest of the task's lifetime.
#[derive(Debug, Clone)]
pub struct Saturator {
    saturated: Arc<AtomicBool>,
}

impl Saturator {
    pub(crate) fn new() -> Self {
        Self {
            saturated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Disables the modifiers guarded by this handle.
    pub fn saturate(&self) {
        self.saturated.store(true, Ordering::Release);
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Acquire)
    }
}
