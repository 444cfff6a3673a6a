//! Job plugin hooks ("jobtap").
//!
//! Plugins observe every posted event and every state transition, and may
//! supply a job's priority. Hooks can request follow-up posts through the
//! [`HookContext`]; the engine runs them after the current event.

use job_core::{Context, EventEntry, Job, JobId, JobState, URGENCY_EXPEDITE, URGENCY_HOLD};
use serde_json::json;
use thiserror::Error;

use crate::engine::{PostFlags, QueuedPost};

/// Lowest job priority.
pub const PRIORITY_MIN: i64 = 0;
/// Highest job priority.
pub const PRIORITY_MAX: i64 = u32::MAX as i64;

/// A plugin callback failed. Logged by the engine, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("plugin {plugin}: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Collects posts requested from inside a hook.
#[derive(Debug, Default)]
pub struct HookContext {
    posts: Vec<QueuedPost>,
}

impl HookContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for `job_id`.
    pub fn post_event(&mut self, job_id: JobId, name: impl Into<String>, context: Option<Context>) {
        self.post_event_with_flags(job_id, name, context, PostFlags::default());
    }

    /// Queue an event for `job_id` with explicit post flags.
    pub fn post_event_with_flags(
        &mut self,
        job_id: JobId,
        name: impl Into<String>,
        context: Option<Context>,
        flags: PostFlags,
    ) {
        self.posts.push(QueuedPost {
            job_id,
            entry: EventEntry::now(name, context),
            flags,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub(crate) fn into_posts(self) -> Vec<QueuedPost> {
        self.posts
    }
}

/// Engine-facing plugin hook surface.
pub trait Jobtap: Send {
    /// Called for every successfully applied event.
    fn on_event(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        hooks: &mut HookContext,
    ) -> Result<(), PluginError>;

    /// Called when a job enters a new state. `topic` is `job.state.<name>`
    /// and `entry` is the event that caused the transition.
    fn on_transition(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        topic: &str,
        prev: JobState,
        hooks: &mut HookContext,
    ) -> Result<(), PluginError>;

    /// Current priority for `job`, or None if it is not available yet.
    fn get_priority(&mut self, job: &Job) -> Result<Option<i64>, PluginError>;
}

impl<J: Jobtap + ?Sized> Jobtap for Box<J> {
    fn on_event(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        hooks: &mut HookContext,
    ) -> Result<(), PluginError> {
        (**self).on_event(job, entry, hooks)
    }

    fn on_transition(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        topic: &str,
        prev: JobState,
        hooks: &mut HookContext,
    ) -> Result<(), PluginError> {
        (**self).on_transition(job, entry, topic, prev, hooks)
    }

    fn get_priority(&mut self, job: &Job) -> Result<Option<i64>, PluginError> {
        (**self).get_priority(job)
    }
}

/// A single named plugin. Every callback is optional.
pub trait JobtapPlugin: Send + 'static {
    fn name(&self) -> &str;

    fn on_event(
        &mut self,
        _job: &Job,
        _entry: &EventEntry,
        _hooks: &mut HookContext,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_transition(
        &mut self,
        _job: &Job,
        _entry: &EventEntry,
        _topic: &str,
        _prev: JobState,
        _hooks: &mut HookContext,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn get_priority(&mut self, _job: &Job) -> Result<Option<i64>, PluginError> {
        Ok(None)
    }
}

/// Priority used when no plugin supplies one.
pub fn default_priority(urgency: i32) -> i64 {
    match urgency {
        URGENCY_HOLD => PRIORITY_MIN,
        URGENCY_EXPEDITE => PRIORITY_MAX,
        other => other as i64,
    }
}

/// Ordered set of plugins plus the built-in priority behaviour.
///
/// On entering PRIORITY the registry asks its plugins for a priority,
/// falling back to [`default_priority`], and posts a `priority` event.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn JobtapPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. Plugins are called in registration order.
    pub fn register<P: JobtapPlugin>(&mut self, plugin: P) {
        self.plugins.push(Box::new(plugin));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_plugin<P: JobtapPlugin>(mut self, plugin: P) -> Self {
        self.register(plugin);
        self
    }

    /// Whether a plugin named `name` is registered.
    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

impl Jobtap for PluginRegistry {
    fn on_event(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        hooks: &mut HookContext,
    ) -> Result<(), PluginError> {
        let mut first_err = None;
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.on_event(job, entry, hooks) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn on_transition(
        &mut self,
        job: &Job,
        entry: &EventEntry,
        topic: &str,
        prev: JobState,
        hooks: &mut HookContext,
    ) -> Result<(), PluginError> {
        let mut first_err = None;
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.on_transition(job, entry, topic, prev, hooks) {
                first_err.get_or_insert(e);
            }
        }

        if job.state == JobState::Priority {
            match self.get_priority(job) {
                Ok(Some(priority)) => hooks.post_event(
                    job.id,
                    "priority",
                    EventEntry::context_from(json!({ "priority": priority })),
                ),
                Ok(None) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    fn get_priority(&mut self, job: &Job) -> Result<Option<i64>, PluginError> {
        for plugin in self.plugins.iter_mut() {
            if let Some(priority) = plugin.get_priority(job)? {
                return Ok(Some(priority));
            }
        }
        Ok(Some(default_priority(job.urgency)))
    }
}

/// A function-based priority plugin.
pub struct FnPriority<F>
where
    F: FnMut(&Job) -> Option<i64> + Send + 'static,
{
    name: String,
    priority: F,
}

impl<F> FnPriority<F>
where
    F: FnMut(&Job) -> Option<i64> + Send + 'static,
{
    pub fn new(name: impl Into<String>, priority: F) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

impl<F> JobtapPlugin for FnPriority<F>
where
    F: FnMut(&Job) -> Option<i64> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn get_priority(&mut self, job: &Job) -> Result<Option<i64>, PluginError> {
        Ok((self.priority)(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl JobtapPlugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_event(
            &mut self,
            _job: &Job,
            _entry: &EventEntry,
            _hooks: &mut HookContext,
        ) -> Result<(), PluginError> {
            Err(PluginError::new("failing", "boom"))
        }
    }

    fn job_entering_priority(urgency: i32) -> Job {
        let mut job = Job::new(JobId(9));
        job.urgency = urgency;
        job.state = JobState::Priority;
        job
    }

    #[test]
    fn default_priority_follows_urgency() {
        assert_eq!(default_priority(0), PRIORITY_MIN);
        assert_eq!(default_priority(31), PRIORITY_MAX);
        assert_eq!(default_priority(16), 16);
    }

    #[test]
    fn entering_priority_posts_default() {
        let mut registry = PluginRegistry::new();
        let job = job_entering_priority(7);
        let mut hooks = HookContext::new();
        let entry = EventEntry::new(1.0, "depend", None);
        registry
            .on_transition(&job, &entry, "job.state.priority", JobState::Depend, &mut hooks)
            .unwrap();
        let posts = hooks.into_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].entry.name, "priority");
        assert_eq!(posts[0].entry.get("priority"), Some(&json!(7)));
    }

    #[test]
    fn plugin_priority_wins_over_default() {
        let mut registry =
            PluginRegistry::new().with_plugin(FnPriority::new("fixed", |_job: &Job| Some(500)));
        assert!(registry.has_plugin("fixed"));
        let job = job_entering_priority(16);
        assert_eq!(registry.get_priority(&job).unwrap(), Some(500));
    }

    #[test]
    fn failing_plugin_does_not_stop_others() {
        let mut registry = PluginRegistry::new().with_plugin(Failing);
        let job = job_entering_priority(16);
        let mut hooks = HookContext::new();
        let entry = EventEntry::new(1.0, "memo", None);
        assert!(registry.on_event(&job, &entry, &mut hooks).is_err());
        registry
            .on_transition(&job, &entry, "job.state.priority", JobState::Depend, &mut hooks)
            .unwrap();
        assert!(!hooks.is_empty());
        assert_eq!(registry.plugin_names(), vec!["failing"]);
    }
}
