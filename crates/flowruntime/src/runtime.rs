use crate::registry::ActionRegistry;
use crate::runner::FlowRunner;
use crate::session::{ExecutionResult, Session, SessionConfig};
use crate::store::{RuntimeStore, StoreObserver};
use flowcore::{DataMap, EventBus, ExecutionEvent, Flow, RuntimeState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Main entry point for running flows
pub struct FlowRuntime {
    runner: Arc<FlowRunner>,
    event_bus: EventBus,
    config: RuntimeConfig,
    observer: Option<Arc<dyn StoreObserver>>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(ActionRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<ActionRegistry>, config: RuntimeConfig) -> Self {
        Self::with_runner(Arc::new(FlowRunner::new(registry)), config)
    }

    /// Create a new runtime around a fully configured runner
    pub fn with_runner(runner: Arc<FlowRunner>, config: RuntimeConfig) -> Self {
        let event_bus = EventBus::new(config.event_buffer_size);
        Self {
            runner,
            event_bus,
            config,
            observer: None,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Attach an observer to every store this runtime creates.
    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        self.runner.registry()
    }

    /// Parse a flow definition from JSON
    pub fn parse_flow(&self, json: &str) -> flowcore::Result<Flow> {
        Ok(serde_json::from_str(json)?)
    }

    /// Fresh runtime state for a flow; `params` override declared defaults.
    pub fn create_runtime(&self, flow: impl Into<Arc<Flow>>, params: DataMap) -> RuntimeState {
        RuntimeState::new(flow, params)
    }

    /// Execute (or resume) a runtime and hand back its state.
    ///
    /// The deadline is `timeout`, else the flow's own timeout, else the
    /// configured default.
    pub async fn execute(
        &self,
        state: RuntimeState,
        timeout: Option<Duration>,
    ) -> flowcore::Result<(RuntimeState, ExecutionResult)> {
        let timeout = timeout
            .or_else(|| state.flow.timeout.map(Duration::from_millis))
            .or(self.config.default_timeout);

        let store = match &self.observer {
            Some(observer) => RuntimeStore::with_observer(state, observer.clone()),
            None => RuntimeStore::new(state),
        };
        let session = Session::builder(store.clone())
            .runner(self.runner.clone())
            .events(self.event_bus.clone())
            .config(SessionConfig {
                inbox_capacity: self.config.inbox_capacity,
                timeout,
            })
            .build();

        let id = session.id().to_string();
        self.sessions.write().await.insert(id.clone(), session.clone());
        let result = session.execute().await;
        self.sessions.write().await.remove(&id);

        Ok((store.snapshot(), result?))
    }

    /// Create a runtime for `flow` and execute it once.
    pub async fn execute_flow(
        &self,
        flow: impl Into<Arc<Flow>>,
        params: DataMap,
        timeout: Option<Duration>,
    ) -> flowcore::Result<(RuntimeState, ExecutionResult)> {
        self.execute(self.create_runtime(flow, params), timeout)
            .await
    }

    /// Ids of runtimes currently executing
    pub async fn running_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Halt a running runtime as if its deadline had fired.
    pub async fn stop(&self, runtime_id: &str) -> bool {
        match self.sessions.read().await.get(runtime_id) {
            Some(session) => session.stop(),
            None => false,
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub inbox_capacity: usize,
    pub event_buffer_size: usize,
    /// Used when neither the caller nor the flow sets a timeout
    pub default_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 100,
            event_buffer_size: 1000,
            default_timeout: None,
        }
    }
}
