use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use snafu::{OptionExt, ResultExt};
use tokio_util::sync::CancellationToken;

use super::{
    run_user_hook, ActiveTasks, AlreadyLoadedSnafu, InvalidConfigSnafu, PluginInfo, TaskError,
    UnknownTaskSnafu,
};
use crate::context::PublishContext;
use crate::metric::Metric;
use crate::plugin::{PluginType, Publisher};
use crate::stats::Stats;

/// Maps task ids to their contexts and arbitrates the task lifecycle for a
/// publisher plugin.
pub struct PublisherContextManager {
    plugin: Arc<dyn Publisher>,
    name: String,
    version: String,
    contexts: Mutex<HashMap<String, Arc<PublishContext>>>,
    active: ActiveTasks,
    stats: Arc<Stats>,
    cancel_root: CancellationToken,
}

impl PublisherContextManager {
    pub fn new(publisher: impl Publisher, name: &str, version: &str) -> Self {
        Self {
            plugin: Arc::new(publisher),
            name: name.to_string(),
            version: version.to_string(),
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

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub async fn load(&self, task_id: &str, raw_config: &[u8]) -> Result<(), TaskError> {
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
            PublishContext::new(task_id, raw_config, self.cancel_root.child_token())
                .context(InvalidConfigSnafu)?,
        );

        let plugin = Arc::clone(&self.plugin);
        let hook_context = Arc::clone(&context);
        run_user_hook("Load", Box::new(move || plugin.load(&hook_context))).await?;

        self.contexts
            .lock()
            .expect("poisoned lock")
            .insert(task_id.to_string(), context);
        self.stats.inc_tasks_loaded();
        Ok(())
    }

    pub async fn unload(&self, task_id: &str) -> Result<(), TaskError> {
        let _active = self.active.activate(task_id)?;
        let context = self.context(task_id)?;

        let plugin = Arc::clone(&self.plugin);
        let hook_context = Arc::clone(&context);
        run_user_hook("Unload", Box::new(move || plugin.unload(&hook_context))).await?;

        self.contexts
            .lock()
            .expect("poisoned lock")
            .remove(task_id);
        context.cancel();
        self.stats.inc_tasks_unloaded();
        Ok(())
    }

    /// Hands the reassembled metric list to the user's publish hook.
    pub async fn publish(&self, task_id: &str, metrics: Vec<Metric>) -> Result<(), TaskError> {
        let _active = self.active.activate(task_id)?;
        let context = self.context(task_id)?;

        self.stats.inc_publish_requests();
        context.begin_session(metrics);

        let plugin = Arc::clone(&self.plugin);
        let hook_context = Arc::clone(&context);
        let result = run_user_hook("Publish", Box::new(move || plugin.publish(&hook_context))).await;

        context.end_session();
        result
    }

    pub fn request_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            plugin_type: PluginType::Publisher,
            metrics: Vec::new(),
            groups: Default::default(),
            loaded_tasks: self.contexts.lock().expect("poisoned lock").len(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn shutdown(&self) {
        self.cancel_root.cancel();
        self.contexts.lock().expect("poisoned lock").clear();
    }

    fn context(&self, task_id: &str) -> Result<Arc<PublishContext>, TaskError> {
        self.contexts
            .lock()
            .expect("poisoned lock")
            .get(task_id)
            .cloned()
            .context(UnknownTaskSnafu { task_id })
    }
}
