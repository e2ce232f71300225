use flowcore::{
    ActionState, ActionToken, DataMap, Flow, FlowStatus, LinkState, LinkToken, LogLevel, LogScope,
    RuntimeState,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Kind of mutation reported to a [`StoreObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    ParamChanged,
    DataChanged,
    PendingChanged,
    ActionRecorded,
    LinkRecorded,
    Logged,
    Started,
    Finished,
    HistoryReset,
    MessageChanged,
}

/// Hook invoked after every mutation, while the store is still locked.
///
/// Persistence layers plug in here.
pub trait StoreObserver: Send + Sync {
    fn on_change(&self, event: StoreEvent, state: &RuntimeState);
}

/// Serialized read/write access to one [`RuntimeState`].
///
/// Clones share the same state.
#[derive(Clone)]
pub struct RuntimeStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<RuntimeState>,
    observer: Option<Arc<dyn StoreObserver>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuntimeStore {
    pub fn new(state: RuntimeState) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                observer: None,
            }),
        }
    }

    pub fn with_observer(state: RuntimeState, observer: Arc<dyn StoreObserver>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                observer: Some(observer),
            }),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&RuntimeState) -> R) -> R {
        f(&lock(&self.inner.state))
    }

    fn write<R>(&self, event: StoreEvent, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        let mut state = lock(&self.inner.state);
        let result = f(&mut state);
        if let Some(observer) = &self.inner.observer {
            observer.on_change(event, &state);
        }
        result
    }

    pub fn id(&self) -> String {
        self.read(|s| s.id.clone())
    }

    pub fn flow(&self) -> Arc<Flow> {
        self.read(|s| s.flow.clone())
    }

    pub fn status(&self) -> FlowStatus {
        self.read(|s| s.status)
    }

    /// Point-in-time copy of the whole state.
    pub fn snapshot(&self) -> RuntimeState {
        self.read(RuntimeState::clone)
    }

    pub fn get_param(&self, key: &str) -> Option<Value> {
        self.read(|s| s.params.get(key).cloned())
    }

    pub fn set_param(&self, key: impl Into<String>, value: Value) {
        self.write(StoreEvent::ParamChanged, |s| {
            s.params.insert(key.into(), value);
        });
    }

    pub fn params(&self) -> DataMap {
        self.read(|s| s.params.clone())
    }

    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.read(|s| s.data.get(key).cloned())
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.write(StoreEvent::DataChanged, |s| {
            s.data.insert(key.into(), value);
        });
    }

    pub fn data(&self) -> DataMap {
        self.read(|s| s.data.clone())
    }

    pub fn add_running_action(&self, token: ActionToken) -> bool {
        self.write(StoreEvent::PendingChanged, |s| s.add_running_action(token))
    }

    pub fn remove_running_action(&self, token: &ActionToken) -> bool {
        self.write(StoreEvent::PendingChanged, |s| s.remove_running_action(token))
    }

    pub fn add_running_link(&self, token: LinkToken) -> bool {
        self.write(StoreEvent::PendingChanged, |s| s.add_running_link(token))
    }

    pub fn remove_running_link(&self, token: &LinkToken) -> bool {
        self.write(StoreEvent::PendingChanged, |s| s.remove_running_link(token))
    }

    pub fn running_actions(&self) -> Vec<ActionToken> {
        self.read(|s| s.running_actions.clone())
    }

    pub fn running_links(&self) -> Vec<LinkToken> {
        self.read(|s| s.running_links.clone())
    }

    pub fn append_action_state(&self, state: ActionState) {
        self.write(StoreEvent::ActionRecorded, |s| s.action_states.push(state));
    }

    pub fn append_link_state(&self, state: LinkState) {
        self.write(StoreEvent::LinkRecorded, |s| s.link_states.push(state));
    }

    /// Append a link record and evaluate its target's join barrier under the
    /// same lock, so the last sibling to arrive sees every other record.
    pub fn append_link_state_and_join(&self, state: LinkState) -> bool {
        self.write(StoreEvent::LinkRecorded, |s| {
            let source_id = state.source_id.clone();
            let target_id = state.target_id.clone();
            s.link_states.push(state);
            s.join_satisfied(&source_id, &target_id)
        })
    }

    pub fn last_action_state(&self, action_id: &str) -> Option<ActionState> {
        self.read(|s| s.last_action_state(action_id).cloned())
    }

    pub fn last_link_state(&self, source_id: &str, target_id: &str) -> Option<LinkState> {
        self.read(|s| s.last_link_state(source_id, target_id).cloned())
    }

    /// Private data recorded by the latest run of an action.
    pub fn action_data(&self, action_id: &str, key: &str) -> Option<Value> {
        self.read(|s| s.action_data(action_id, key).cloned())
    }

    pub fn action_data_map(&self, action_id: &str) -> DataMap {
        self.read(|s| s.action_data_map(action_id).cloned().unwrap_or_default())
    }

    pub fn log(
        &self,
        level: LogLevel,
        scope: LogScope,
        name: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.write(StoreEvent::Logged, |s| {
            s.add_log(level, scope, name, title, content)
        });
    }

    pub fn set_begin(&self, fresh: bool) {
        self.write(StoreEvent::Started, |s| s.mark_begin(fresh));
    }

    pub fn set_end(&self) {
        self.write(StoreEvent::Finished, RuntimeState::mark_end);
    }

    pub fn reset_history(&self) {
        self.write(StoreEvent::HistoryReset, RuntimeState::reset_history);
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.write(StoreEvent::MessageChanged, |s| s.message = message.into());
    }
}
