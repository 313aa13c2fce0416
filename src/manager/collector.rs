use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use snafu::{OptionExt, ResultExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{
    run_user_hook, ActiveTasks, AlreadyLoadedSnafu, InvalidConfigSnafu, PluginInfo, TaskError,
    UnknownTaskSnafu,
};
use crate::context::CollectContext;
use crate::metric::Metric;
use crate::plugin::{Collector, CollectorDefinition, PluginType, StreamingCollector};
use crate::stats::Stats;

#[derive(Clone)]
enum CollectorPlugin {
    Batch(Arc<dyn Collector>),
    Streaming(Arc<dyn StreamingCollector>),
}

/// Maps task ids to their contexts and arbitrates the task lifecycle for a
/// collector plugin.
pub struct ContextManager {
    plugin: CollectorPlugin,
    name: String,
    version: String,
    schema: Arc<CollectorDefinition>,
    contexts: Mutex<HashMap<String, Arc<CollectContext>>>,
    active: ActiveTasks,
    stats: Arc<Stats>,
    cancel_root: CancellationToken,
}

impl ContextManager {
    pub fn new(collector: impl Collector, name: &str, version: &str) -> Self {
        Self::with_plugin(CollectorPlugin::Batch(Arc::new(collector)), name, version)
    }

    pub fn new_streaming(
        collector: impl StreamingCollector,
        name: &str,
        version: &str,
    ) -> Self {
        Self::with_plugin(
            CollectorPlugin::Streaming(Arc::new(collector)),
            name,
            version,
        )
    }

    fn with_plugin(plugin: CollectorPlugin, name: &str, version: &str) -> Self {
        let mut definition = CollectorDefinition::new();
        let defined = match &plugin {
            CollectorPlugin::Batch(collector) => collector.define(&mut definition),
            CollectorPlugin::Streaming(collector) => collector.define(&mut definition),
        };
        if let Err(error) = defined {
            error!(%error, "error occurred during plugin definition");
        }

        Self {
            plugin,
            name: name.to_string(),
            version: version.to_string(),
            schema: Arc::new(definition),
            contexts: Mutex::new(HashMap::new()),
            active: ActiveTasks::default(),
            stats: Arc::new(Stats::default()),
            cancel_root: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn plugin_type(&self) -> PluginType {
        match self.plugin {
            CollectorPlugin::Batch(_) => PluginType::Collector,
            CollectorPlugin::Streaming(_) => PluginType::StreamingCollector,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.plugin, CollectorPlugin::Streaming(_))
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub fn schema(&self) -> Arc<CollectorDefinition> {
        Arc::clone(&self.schema)
    }

    /// Creates the task context, installs its filter rules and runs the
    /// user's load hook. Rejected when the id is loaded or busy.
    pub async fn load(
        &self,
        task_id: &str,
        raw_config: &[u8],
        selectors: &[String],
    ) -> Result<(), TaskError> {
        let _active = self.active.activate(task_id)?;

        if self
            .contexts
            .lock()
            .expect("poisoned lock")
            .contains_key(task_id)
        {
            return AlreadyLoadedSnafu { task_id }.fail();
        }

        let context = Arc::new(
            CollectContext::new(
                task_id,
                raw_config,
                selectors,
                Arc::clone(&self.schema),
                Arc::clone(&self.stats),
                self.cancel_root.child_token(),
            )
            .context(InvalidConfigSnafu)?,
        );

        self.run_load_hook(&context).await?;

        self.contexts
            .lock()
            .expect("poisoned lock")
            .insert(task_id.to_string(), context);
        self.stats.inc_tasks_loaded();
        Ok(())
    }

    /// Runs the user's unload hook and removes the context. A hook error
    /// leaves the task loaded.
    pub async fn unload(&self, task_id: &str) -> Result<(), TaskError> {
        let _active = self.active.activate(task_id)?;
        let context = self.context(task_id)?;

        self.run_unload_hook(&context).await?;

        self.contexts
            .lock()
            .expect("poisoned lock")
            .remove(task_id);
        context.cancel();
        self.stats.inc_tasks_unloaded();
        Ok(())
    }

    /// Invokes the user's collect hook and returns the session buffer. The
    /// buffer is reset on entry, so a failed collect leaves nothing behind.
    pub async fn collect(&self, task_id: &str) -> Result<Vec<Metric>, TaskError> {
        let _active = self.active.activate(task_id)?;
        let context = self.context(task_id)?;

        self.stats.inc_collect_requests();
        context.begin_buffered_session();
        self.run_collect_hook(&context).await?;
        Ok(context.end_session())
    }

    /// Invokes the user's collect hook with metrics draining through the
    /// given channel, so the RPC layer can flush chunks while user code is
    /// still running.
    pub async fn streaming_collect(
        &self,
        task_id: &str,
        sender: mpsc::Sender<Metric>,
    ) -> Result<(), TaskError> {
        let _active = self.active.activate(task_id)?;
        let context = self.context(task_id)?;

        self.stats.inc_collect_requests();
        context.begin_streaming_session(sender);
        let result = self.run_collect_hook(&context).await;
        context.end_session();
        result
    }

    pub fn request_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            plugin_type: self.plugin_type(),
            metrics: self.schema.metric_selectors(),
            groups: self
                .schema
                .groups()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            loaded_tasks: self.contexts.lock().expect("poisoned lock").len(),
            stats: self.stats.snapshot(),
        }
    }

    /// Cancels every task context and drops them. Called once after the
    /// server stops serving.
    pub fn shutdown(&self) {
        self.cancel_root.cancel();
        self.contexts.lock().expect("poisoned lock").clear();
    }

    fn context(&self, task_id: &str) -> Result<Arc<CollectContext>, TaskError> {
        self.contexts
            .lock()
            .expect("poisoned lock")
            .get(task_id)
            .cloned()
            .context(UnknownTaskSnafu { task_id })
    }

    async fn run_load_hook(&self, context: &Arc<CollectContext>) -> Result<(), TaskError> {
        let context = Arc::clone(context);
        let call: Box<dyn FnOnce() -> Result<(), crate::plugin::PluginError> + Send> =
            match &self.plugin {
                CollectorPlugin::Batch(collector) => {
                    let collector = Arc::clone(collector);
                    Box::new(move || collector.load(&context))
                }
                CollectorPlugin::Streaming(collector) => {
                    let collector = Arc::clone(collector);
                    Box::new(move || collector.load(&context))
                }
            };
        run_user_hook("Load", call).await
    }

    async fn run_unload_hook(&self, context: &Arc<CollectContext>) -> Result<(), TaskError> {
        let context = Arc::clone(context);
        let call: Box<dyn FnOnce() -> Result<(), crate::plugin::PluginError> + Send> =
            match &self.plugin {
                CollectorPlugin::Batch(collector) => {
                    let collector = Arc::clone(collector);
                    Box::new(move || collector.unload(&context))
                }
                CollectorPlugin::Streaming(collector) => {
                    let collector = Arc::clone(collector);
                    Box::new(move || collector.unload(&context))
                }
            };
        run_user_hook("Unload", call).await
    }

    async fn run_collect_hook(&self, context: &Arc<CollectContext>) -> Result<(), TaskError> {
        let context = Arc::clone(context);
        let call: Box<dyn FnOnce() -> Result<(), crate::plugin::PluginError> + Send> =
            match &self.plugin {
                CollectorPlugin::Batch(collector) => {
                    let collector = Arc::clone(collector);
                    Box::new(move || collector.collect(&context))
                }
                CollectorPlugin::Streaming(collector) => {
                    let collector = Arc::clone(collector);
                    Box::new(move || collector.streaming_collect(&context))
                }
            };
        run_user_hook("Collect", call).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{FailingCollector, GatedCollector, TestCollector};

    fn manager(collector: impl Collector) -> Arc<ContextManager> {
        Arc::new(ContextManager::new(collector, "test-plugin", "0.1.0"))
    }

    #[tokio::test]
    async fn load_collect_unload_cycle() {
        let manager = manager(TestCollector::emitting(&[("/test/group/m1", 7)]));

        manager.load("1", b"{}", &[]).await.unwrap();
        let metrics = manager.collect("1").await.unwrap();
        assert_eq!(metrics.len(), 1);
        manager.unload("1").await.unwrap();

        assert!(matches!(
            manager.collect("1").await,
            Err(TaskError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn double_load_is_rejected() {
        let manager = manager(TestCollector::emitting(&[("/test/group/m1", 7)]));

        manager.load("1", b"{}", &[]).await.unwrap();
        assert!(matches!(
            manager.load("1", b"{}", &[]).await,
            Err(TaskError::AlreadyLoaded { .. })
        ));
    }

    #[tokio::test]
    async fn unload_of_unknown_task_is_rejected() {
        let manager = manager(TestCollector::emitting(&[]));

        assert!(matches!(
            manager.unload("1").await,
            Err(TaskError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_config_fails_the_load() {
        let manager = manager(TestCollector::emitting(&[]));

        assert!(matches!(
            manager.load("1", b"not json", &[]).await,
            Err(TaskError::InvalidConfig { .. })
        ));
        // The slot stays free.
        manager.load("1", b"{}", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn user_collect_errors_are_surfaced_and_leave_the_task_loaded() {
        let manager = manager(FailingCollector);

        manager.load("1", b"{}", &[]).await.unwrap();
        assert!(matches!(
            manager.collect("1").await,
            Err(TaskError::User { .. })
        ));
        // Still loaded; unload succeeds.
        manager.unload("1").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_collects_for_the_same_task_conflict() {
        let collector = GatedCollector::new();
        let gate = collector.handle();
        let manager = manager(collector);

        manager.load("7", b"{}", &[]).await.unwrap();
        manager.load("8", b"{}", &[]).await.unwrap();

        let first = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.collect("7").await }
        });

        // Wait for the first collect to enter user code.
        while gate.started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(
            manager.collect("7").await,
            Err(TaskError::InProgress { .. })
        ));

        // A different task id proceeds in parallel.
        let other = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.collect("8").await }
        });
        while gate.started() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        gate.release();
        first.await.unwrap().unwrap();
        other.await.unwrap().unwrap();

        // The slot is free again.
        manager.collect("7").await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_task_contexts() {
        let manager = manager(TestCollector::emitting(&[]));
        manager.load("1", b"{}", &[]).await.unwrap();

        manager.shutdown();
        assert!(matches!(
            manager.collect("1").await,
            Err(TaskError::UnknownTask { .. })
        ));
    }
}
