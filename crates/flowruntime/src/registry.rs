use crate::script::{ScriptScope, SharedActionState};
use crate::session::Session;
use crate::store::{lock, RuntimeStore};
use async_trait::async_trait;
use flowcore::{Action, ActionState, ActionToken, LogLevel, LogScope, Outcome, Stage, StepError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Names tried, in order, when no runner matches an action's own name.
const FALLBACK_NAMES: [&str; 3] = ["common", "*", ""];

/// Everything a runner can see while handling one delivery
pub struct ActionContext<'a> {
    pub session: &'a Session,
    pub token: &'a ActionToken,
    pub action: &'a Action,
    /// Record of the attempt in progress
    pub state: &'a SharedActionState,
}

impl ActionContext<'_> {
    pub fn store(&self) -> &RuntimeStore {
        self.session.store()
    }

    /// Lock the record of this attempt. A poisoned lock is recovered.
    pub fn record(&self) -> MutexGuard<'_, ActionState> {
        lock(self.state)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.action.param(key)
    }

    /// Run a script against this action through the session's evaluator.
    pub async fn evaluate(&self, source: &str) -> Result<Value, StepError> {
        let scope = ScriptScope::action(self.store().clone(), self.token, self.state.clone());
        self.session
            .runner()
            .evaluate(source, scope)
            .await
            .map_err(|e| StepError::Script {
                stage: Stage::Handler,
                message: e.to_string(),
            })
    }

    pub fn log(&self, content: impl Into<String>) {
        self.store().log(
            LogLevel::Info,
            LogScope::Action,
            &self.action.name,
            &self.action.title,
            content,
        );
    }

    pub fn is_halted(&self) -> bool {
        self.session.is_halted()
    }

    /// Cancelled when the run times out or is stopped.
    pub fn halt_token(&self) -> CancellationToken {
        self.session.halt_token()
    }
}

/// A handler for one action type
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Optional: description and declared properties for tooling
    fn metadata(&self) -> RunnerMetadata {
        RunnerMetadata::default()
    }

    /// Called once per iteration item. `Err` counts as FAILURE.
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError>;
}

/// Metadata about an action type
#[derive(Debug, Clone)]
pub struct RunnerMetadata {
    pub description: String,
    pub category: String,
    pub properties: Vec<Prop>,
}

impl Default for RunnerMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            properties: Vec::new(),
        }
    }
}

/// One configurable parameter of an action type
#[derive(Debug, Clone, Default)]
pub struct Prop {
    pub name: String,
    pub label: String,
    pub default: String,
    pub required: bool,
}

impl Prop {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Registry of available action runners
#[derive(Default)]
pub struct ActionRegistry {
    runners: HashMap<String, Arc<dyn ActionRunner>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner; an existing entry under the same name is replaced.
    pub fn register(&mut self, name: impl Into<String>, runner: Arc<dyn ActionRunner>) {
        let name = name.into();
        tracing::info!("Registering action runner: {:?}", name);
        self.runners.insert(name, runner);
    }

    /// Look up the runner for an action name, falling back to `common`,
    /// `*` and the empty name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ActionRunner>> {
        std::iter::once(name)
            .chain(FALLBACK_NAMES)
            .find_map(|candidate| self.runners.get(candidate))
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn metadata(&self, name: &str) -> Option<RunnerMetadata> {
        self.runners.get(name).map(|r| r.metadata())
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl ActionRunner for Fixed {
        fn metadata(&self) -> RunnerMetadata {
            RunnerMetadata {
                description: self.0.to_string(),
                ..Default::default()
            }
        }

        async fn execute(&self, _ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
            Ok(Outcome::Success)
        }
    }

    fn described(registry: &ActionRegistry, name: &str) -> Option<String> {
        registry.resolve(name).map(|r| r.metadata().description)
    }

    #[test]
    fn resolves_through_fallback_chain() {
        let mut registry = ActionRegistry::new();
        assert!(registry.resolve("http").is_none());

        registry.register("", Arc::new(Fixed("empty")));
        assert_eq!(described(&registry, "http").as_deref(), Some("empty"));

        registry.register("*", Arc::new(Fixed("star")));
        assert_eq!(described(&registry, "http").as_deref(), Some("star"));

        registry.register("common", Arc::new(Fixed("common")));
        assert_eq!(described(&registry, "http").as_deref(), Some("common"));

        registry.register("http", Arc::new(Fixed("http")));
        assert_eq!(described(&registry, "http").as_deref(), Some("http"));
        assert_eq!(described(&registry, "other").as_deref(), Some("common"));
    }

    #[test]
    fn register_overwrites() {
        let mut registry = ActionRegistry::new();
        registry.register("x", Arc::new(Fixed("first")));
        registry.register("x", Arc::new(Fixed("second")));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.metadata("x").map(|m| m.description).as_deref(),
            Some("second")
        );
        assert_eq!(registry.metadata("x").map(|m| m.category).as_deref(), Some("general"));
        assert_eq!(registry.names(), vec!["x".to_string()]);
    }
}
