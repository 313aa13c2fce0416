use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::TaskContext;
use crate::config::ConfigError;
use crate::metric::{Metric, Value};
use crate::modifier::{Modifier, Saturator};
use crate::namespace::{
    parse_concrete_namespace, parse_namespace, Namespace, ParseError, TreeValidator,
};
use crate::plugin::CollectorDefinition;
use crate::stats::Stats;

#[derive(Debug, Snafu)]
pub enum MetricError {
    #[snafu(display("invalid metric namespace: {source}"))]
    InvalidNamespace { source: ParseError },

    #[snafu(display("metric `{namespace}` is not defined by the plugin"))]
    UndefinedMetric { namespace: String },

    #[snafu(display("collect session is closed"))]
    SessionClosed,
}

/// Where emitted metrics go during the current collect session.
#[derive(Debug)]
enum SessionSink {
    Buffer(Vec<Metric>),
    Stream(mpsc::Sender<Metric>),
}

#[derive(Debug)]
struct AlwaysApplied {
    selector: Namespace,
    modifiers: Vec<Modifier>,
    saturator: Saturator,
}

/// Task context handed to collector hooks. Every emitted metric is validated
/// against the plugin schema and the host-supplied filter before it reaches
/// the session buffer.
#[derive(Debug)]
pub struct CollectContext {
    task_id: String,
    inner: TaskContext,
    schema: Arc<CollectorDefinition>,
    filter: TreeValidator,
    requested: Vec<String>,
    always: Mutex<Vec<AlwaysApplied>>,
    session: Mutex<SessionSink>,
    filter_cache: Mutex<HashMap<String, bool>>,
    stats: Arc<Stats>,
}

impl CollectContext {
    pub(crate) fn new(
        task_id: &str,
        raw_config: &[u8],
        selectors: &[String],
        schema: Arc<CollectorDefinition>,
        stats: Arc<Stats>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let inner = TaskContext::new(raw_config, cancel)?;

        let mut filter = TreeValidator::filter();
        for selector in selectors {
            if let Err(error) = filter.add_rule(selector) {
                warn!(%error, rule = %selector, "can't add filtering rule, it will be ignored");
            }
        }

        Ok(Self {
            task_id: task_id.to_string(),
            inner,
            schema,
            filter,
            requested: selectors.to_vec(),
            always: Mutex::new(Vec::new()),
            session: Mutex::new(SessionSink::Buffer(Vec::new())),
            filter_cache: Mutex::new(HashMap::new()),
            stats,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Adds a concrete metric with an already calculated value.
    pub fn add_metric(
        &self,
        namespace: &str,
        value: impl Into<Value>,
    ) -> Result<(), MetricError> {
        self.add_metric_with(namespace, value, [])
    }

    /// Adds a concrete metric, applying the given modifiers after any
    /// matching always-apply modifiers.
    pub fn add_metric_with(
        &self,
        namespace: &str,
        value: impl Into<Value>,
        modifiers: impl IntoIterator<Item = Modifier>,
    ) -> Result<(), MetricError> {
        let parsed = parse_concrete_namespace(namespace).context(InvalidNamespaceSnafu)?;

        let outcome = self.schema.validator().is_valid(&parsed);
        if !outcome.matched {
            return UndefinedMetricSnafu { namespace }.fail();
        }

        if !self.filter_allows(namespace, &parsed) {
            self.stats.inc_metrics_filtered();
            return Ok(());
        }

        let mut metric = Metric::new(parsed, value.into());
        if let Some(definition) = outcome
            .definition
            .as_deref()
            .and_then(|selector| self.schema.metric_definition(selector))
        {
            metric.unit = definition.unit.clone();
            metric.description = definition.description.clone();
        }

        {
            let always = self.always.lock().expect("poisoned lock");
            for applied in always.iter() {
                if applied.saturator.is_saturated() {
                    continue;
                }
                if applied.selector.matches(metric.namespace()) {
                    for modifier in &applied.modifiers {
                        modifier.apply(&mut metric);
                    }
                }
            }
        }
        for modifier in modifiers {
            modifier.apply(&mut metric);
        }

        self.push(metric)
    }

    pub fn add_metric_with_tags<K, V>(
        &self,
        namespace: &str,
        value: impl Into<Value>,
        tags: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), MetricError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.add_metric_with(namespace, value, [Modifier::tags(tags)])
    }

    /// Registers modifiers applied to every subsequent metric matching the
    /// selector. The returned saturator disables them when invoked.
    pub fn always_apply(
        &self,
        selector: &str,
        modifiers: impl IntoIterator<Item = Modifier>,
    ) -> Result<Saturator, ParseError> {
        let parsed = parse_namespace(selector, false)?;
        let saturator = Saturator::new();
        self.always
            .lock()
            .expect("poisoned lock")
            .push(AlwaysApplied {
                selector: parsed,
                modifiers: modifiers.into_iter().collect(),
                saturator: saturator.clone(),
            });
        Ok(saturator)
    }

    /// Whether a metric with this namespace would pass the schema and the
    /// task filter. Useful when computing the metric is expensive.
    pub fn should_process(&self, namespace: &str) -> bool {
        let Ok(parsed) = parse_concrete_namespace(namespace) else {
            return false;
        };
        self.schema.validator().is_valid(&parsed).matched
            && self.filter_allows(namespace, &parsed)
    }

    /// The raw metric selectors requested by the host at task load.
    pub fn requested_metrics(&self) -> &[String] {
        &self.requested
    }

    fn filter_allows(&self, raw: &str, parsed: &Namespace) -> bool {
        if let Some(&allowed) = self
            .filter_cache
            .lock()
            .expect("poisoned lock")
            .get(raw)
        {
            return allowed;
        }

        let allowed = self.filter.is_valid(parsed).matched;
        self.filter_cache
            .lock()
            .expect("poisoned lock")
            .insert(raw.to_string(), allowed);
        allowed
    }

    fn push(&self, metric: Metric) -> Result<(), MetricError> {
        let mut session = self.session.lock().expect("poisoned lock");
        match &mut *session {
            SessionSink::Buffer(buffer) => buffer.push(metric),
            SessionSink::Stream(sender) => {
                if sender.blocking_send(metric).is_err() {
                    return SessionClosedSnafu.fail();
                }
            }
        }
        self.stats.inc_metrics_collected();
        Ok(())
    }

    pub(crate) fn begin_buffered_session(&self) {
        *self.session.lock().expect("poisoned lock") = SessionSink::Buffer(Vec::new());
    }

    pub(crate) fn begin_streaming_session(&self, sender: mpsc::Sender<Metric>) {
        *self.session.lock().expect("poisoned lock") = SessionSink::Stream(sender);
    }

    pub(crate) fn end_session(&self) -> Vec<Metric> {
        let mut session = self.session.lock().expect("poisoned lock");
        match std::mem::replace(&mut *session, SessionSink::Buffer(Vec::new())) {
            SessionSink::Buffer(buffer) => buffer,
            SessionSink::Stream(_) => Vec::new(),
        }
    }
}

impl Deref for CollectContext {
    type Target = TaskContext;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(definitions: &[&str]) -> Arc<CollectorDefinition> {
        let mut definition = CollectorDefinition::new();
        for selector in definitions {
            definition.define_metric(selector, "b", false, "test metric");
        }
        Arc::new(definition)
    }

    fn context(definitions: &[&str], selectors: &[&str]) -> CollectContext {
        let selectors: Vec<String> = selectors.iter().map(ToString::to_string).collect();
        CollectContext::new(
            "task-1",
            b"{}",
            &selectors,
            schema(definitions),
            Arc::new(Stats::default()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_metrics_outside_the_schema() {
        let ctx = context(&["/plugin/group/m1"], &[]);
        ctx.begin_buffered_session();

        assert!(matches!(
            ctx.add_metric("/plugin/group/m2", 1i64),
            Err(MetricError::UndefinedMetric { .. })
        ));
        ctx.add_metric("/plugin/group/m1", 7i64).unwrap();

        let metrics = ctx.end_session();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].namespace().to_string(), "/plugin/group/m1");
        assert_eq!(metrics[0].value(), &Value::Int(7));
    }

    #[test]
    fn rejects_non_concrete_namespaces() {
        let ctx = context(&["/plugin/group/m1"], &[]);
        ctx.begin_buffered_session();

        assert!(matches!(
            ctx.add_metric("/plugin/*/m1", 1i64),
            Err(MetricError::InvalidNamespace { .. })
        ));
    }

    #[test]
    fn filtered_metrics_are_silently_dropped() {
        let ctx = context(&["/plugin/group/m1", "/plugin/group/m2"], &["/plugin/group/m1"]);
        ctx.begin_buffered_session();

        ctx.add_metric("/plugin/group/m1", 7i64).unwrap();
        ctx.add_metric("/plugin/group/m2", 9i64).unwrap();

        let metrics = ctx.end_session();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].namespace().to_string(), "/plugin/group/m1");
    }

    #[test]
    fn dynamic_bindings_pass_schema_and_filter() {
        let ctx = context(&["/plugin/[grp]/m"], &["/plugin/[grp=alpha]/m"]);
        ctx.begin_buffered_session();

        ctx.add_metric("/plugin/[grp=alpha]/m", 1i64).unwrap();
        ctx.add_metric("/plugin/[grp=beta]/m", 2i64).unwrap();

        let metrics = ctx.end_session();
        assert_eq!(metrics.len(), 1);
        assert_eq!(
            metrics[0].namespace().to_string(),
            "/plugin/[grp=alpha]/m"
        );
    }

    #[test]
    fn picks_up_declared_unit_and_description() {
        let ctx = context(&["/plugin/group/m1"], &[]);
        ctx.begin_buffered_session();

        ctx.add_metric("/plugin/group/m1", 1i64).unwrap();

        let metrics = ctx.end_session();
        assert_eq!(metrics[0].unit(), "b");
        assert_eq!(metrics[0].description(), "test metric");
    }

    #[test]
    fn always_apply_modifiers_run_before_call_site_ones() {
        let ctx = context(&["/plugin/group/m1"], &[]);
        ctx.begin_buffered_session();

        ctx.always_apply("/plugin/group/m1", [Modifier::tags([("origin", "always")])])
            .unwrap();
        ctx.add_metric_with(
            "/plugin/group/m1",
            1i64,
            [Modifier::tags([("origin", "call-site")])],
        )
        .unwrap();

        let metrics = ctx.end_session();
        assert_eq!(
            metrics[0].tags().get("origin").map(String::as_str),
            Some("call-site")
        );
    }

    #[test]
    fn saturated_modifiers_stop_applying() {
        let ctx = context(&["/plugin/group/m1"], &[]);
        ctx.begin_buffered_session();

        let saturator = ctx
            .always_apply("/plugin/group/m1", [Modifier::tags([("k", "v")])])
            .unwrap();

        ctx.add_metric("/plugin/group/m1", 1i64).unwrap();
        saturator.saturate();
        ctx.add_metric("/plugin/group/m1", 2i64).unwrap();

        let metrics = ctx.end_session();
        assert_eq!(metrics[0].tags().get("k").map(String::as_str), Some("v"));
        assert!(metrics[1].tags().get("k").is_none());
    }

    #[test]
    fn should_process_combines_schema_and_filter() {
        let ctx = context(&["/plugin/group/m1", "/plugin/group/m2"], &["/plugin/group/m1"]);

        assert!(ctx.should_process("/plugin/group/m1"));
        assert!(!ctx.should_process("/plugin/group/m2"));
        assert!(!ctx.should_process("/plugin/group/unknown"));
        assert!(!ctx.should_process("not-a-namespace"));
        // Cached decision stays stable.
        assert!(ctx.should_process("/plugin/group/m1"));
    }

    #[test]
    fn requested_metrics_returns_the_raw_selector_list() {
        let ctx = context(&["/plugin/group/m1"], &["/plugin/group/m1", "/plugin/**"]);
        assert_eq!(
            ctx.requested_metrics(),
            &["/plugin/group/m1".to_string(), "/plugin/**".to_string()]
        );
    }

    #[test]
    fn session_reset_discards_previous_metrics() {
        let ctx = context(&["/plugin/group/m1"], &[]);

        ctx.begin_buffered_session();
        ctx.add_metric("/plugin/group/m1", 1i64).unwrap();

        ctx.begin_buffered_session();
        assert!(ctx.end_session().is_empty());
    }
}
