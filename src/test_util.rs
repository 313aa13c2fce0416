//! Test doubles for exercising plugin code without a host agent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::context::{CollectContext, PublishContext};
use crate::metric::Metric;
use crate::namespace::parse_concrete_namespace;
use crate::plugin::{
    Collector, CollectorDefinition, PluginError, Publisher, StreamingCollector,
};

/// Builds a concrete metric for assertions and publisher-side tests.
pub fn test_metric(namespace: &str, value: i64) -> Metric {
    Metric::new(
        parse_concrete_namespace(namespace).expect("test namespace must be concrete"),
        value.into(),
    )
}

/// A collector emitting a fixed list of metrics under the `/test/**` schema.
pub struct TestCollector {
    metrics: Vec<(String, i64)>,
    collect_calls: AtomicUsize,
}

impl TestCollector {
    pub fn emitting(metrics: &[(&str, i64)]) -> Self {
        Self {
            metrics: metrics
                .iter()
                .map(|(namespace, value)| (namespace.to_string(), *value))
                .collect(),
            collect_calls: AtomicUsize::new(0),
        }
    }

    /// Emits `/test/group/m0` .. `/test/group/m{count-1}` with their index
    /// as the value.
    pub fn emitting_sequence(count: usize) -> Self {
        Self {
            metrics: (0..count)
                .map(|index| (format!("/test/group/m{index}"), index as i64))
                .collect(),
            collect_calls: AtomicUsize::new(0),
        }
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }
}

impl Collector for TestCollector {
    fn define(&self, definition: &mut CollectorDefinition) -> Result<(), PluginError> {
        definition.define_metric("/test/**", "b", true, "test metrics");
        Ok(())
    }

    fn collect(&self, context: &CollectContext) -> Result<(), PluginError> {
        self.collect_calls.fetch_add(1, Ordering::SeqCst);
        for (namespace, value) in &self.metrics {
            context.add_metric(namespace, *value)?;
        }
        Ok(())
    }
}

/// A streaming collector emitting a numbered metric sequence.
pub struct TestStreamingCollector {
    count: usize,
}

impl TestStreamingCollector {
    pub fn emitting_sequence(count: usize) -> Self {
        Self { count }
    }
}

impl StreamingCollector for TestStreamingCollector {
    fn define(&self, definition: &mut CollectorDefinition) -> Result<(), PluginError> {
        definition.define_metric("/test/**", "b", true, "test metrics");
        Ok(())
    }

    fn streaming_collect(&self, context: &CollectContext) -> Result<(), PluginError> {
        for index in 0..self.count {
            context.add_metric(&format!("/test/group/m{index}"), index as i64)?;
        }
        Ok(())
    }
}

/// A collector whose collect hook always fails.
pub struct FailingCollector;

impl Collector for FailingCollector {
    fn define(&self, definition: &mut CollectorDefinition) -> Result<(), PluginError> {
        definition.define_metric("/test/**", "b", true, "test metrics");
        Ok(())
    }

    fn collect(&self, _context: &CollectContext) -> Result<(), PluginError> {
        Err("collect failed".into())
    }
}

struct Gate {
    started: AtomicUsize,
    released: Mutex<bool>,
    condvar: Condvar,
}

/// Observer side of a [`GatedCollector`].
#[derive(Clone)]
pub struct GateHandle {
    gate: Arc<Gate>,
}

impl GateHandle {
    /// Number of collect calls that have entered user code.
    pub fn started(&self) -> usize {
        self.gate.started.load(Ordering::SeqCst)
    }

    /// Lets every blocked (and future) collect call return.
    pub fn release(&self) {
        *self.gate.released.lock().unwrap() = true;
        self.gate.condvar.notify_all();
    }
}

/// A collector whose collect hook blocks until released, for driving
/// concurrency scenarios.
pub struct GatedCollector {
    gate: Arc<Gate>,
}

impl GatedCollector {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Gate {
                started: AtomicUsize::new(0),
                released: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn handle(&self) -> GateHandle {
        GateHandle {
            gate: Arc::clone(&self.gate),
        }
    }
}

impl Collector for GatedCollector {
    fn collect(&self, _context: &CollectContext) -> Result<(), PluginError> {
        self.gate.started.fetch_add(1, Ordering::SeqCst);
        let mut released = self.gate.released.lock().unwrap();
        while !*released {
            released = self.gate.condvar.wait(released).unwrap();
        }
        Ok(())
    }
}

/// A publisher that copies every received metric into a shared vector.
pub struct CollectingPublisher {
    received: Arc<Mutex<Vec<Metric>>>,
    publish_calls: AtomicUsize,
}

impl CollectingPublisher {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            publish_calls: AtomicUsize::new(0),
        }
    }

    pub fn received(&self) -> Arc<Mutex<Vec<Metric>>> {
        Arc::clone(&self.received)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }
}

impl Publisher for CollectingPublisher {
    fn publish(&self, context: &PublishContext) -> Result<(), PluginError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap()
            .extend(context.list_all_metrics());
        Ok(())
    }
}
