//! Execution session: one worker per action and per link, driven by tokens.
//!
//! A session wraps one [`RuntimeStore`] for a single `execute` call. Every
//! delivery is mirrored in the store's pending sets before it is routed, so
//! whatever is still pending when the run drains, times out or is stopped
//! can be picked up by a later session over the same state.

use crate::router::{FlowRouter, LocalRouter};
use crate::runner::FlowRunner;
use crate::script::{SharedActionState, SharedLinkState};
use crate::store::{lock, RuntimeStore};
use chrono::Utc;
use flowcore::{
    ActionState, ActionToken, EventBus, ExecutionEvent, Flow, FlowError, FlowStatus, LinkState,
    LinkToken, LogLevel, LogScope, Outcome, Result,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Inbox key of a link worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey(pub String, pub String);

impl From<&LinkToken> for LinkKey {
    fn from(token: &LinkToken) -> Self {
        LinkKey(token.source_id.clone(), token.target_id.clone())
    }
}

/// Message in a worker inbox
#[derive(Debug)]
pub enum Envelope<T> {
    Deliver(T),
    Shutdown,
}

/// Configuration for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub inbox_capacity: usize,
    /// Deadline for the whole `execute` call
    pub timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 100,
            timeout: None,
        }
    }
}

/// Summary of one `execute` call
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub runtime_id: String,
    pub status: FlowStatus,
    pub timed_out: bool,
    pub is_error: bool,
    pub elapsed_ms: i64,
    pub action_records: usize,
    pub link_records: usize,
    pub pending_actions: usize,
    pub pending_links: usize,
}

/// Run-wide count of deliveries routed but not yet processed.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_one();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Leaves the in-flight count exactly once, however processing ends.
struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

struct Receivers {
    actions: Vec<mpsc::Receiver<Envelope<ActionToken>>>,
    links: Vec<mpsc::Receiver<Envelope<LinkToken>>>,
}

struct Shared {
    id: String,
    flow: Arc<Flow>,
    store: RuntimeStore,
    runner: Arc<FlowRunner>,
    router: Arc<dyn FlowRouter>,
    events: EventBus,
    config: SessionConfig,
    action_inboxes: HashMap<String, mpsc::Sender<Envelope<ActionToken>>>,
    link_inboxes: HashMap<LinkKey, mpsc::Sender<Envelope<LinkToken>>>,
    receivers: Mutex<Option<Receivers>>,
    halt: CancellationToken,
    in_flight: InFlight,
    timed_out: AtomicBool,
}

/// Per-run concurrency coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn builder(store: RuntimeStore) -> SessionBuilder {
        SessionBuilder {
            store,
            runner: None,
            router: None,
            events: None,
            config: SessionConfig::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.shared.flow
    }

    pub fn store(&self) -> &RuntimeStore {
        &self.shared.store
    }

    pub fn runner(&self) -> &FlowRunner {
        &self.shared.runner
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halt.is_cancelled()
    }

    pub fn halt_token(&self) -> CancellationToken {
        self.shared.halt.clone()
    }

    pub fn is_timed_out(&self) -> bool {
        self.shared.timed_out.load(Ordering::SeqCst)
    }

    /// Halt a running session as if its deadline had fired. Returns false
    /// when it was already halted.
    pub fn stop(&self) -> bool {
        if self.is_halted() {
            return false;
        }
        tracing::info!(runtime = %self.shared.id, "Stopping flow execution");
        self.shared.store.log(
            LogLevel::Info,
            LogScope::Flow,
            &self.shared.flow.code,
            &self.shared.flow.name,
            "stopped",
        );
        self.shared.halt.cancel();
        true
    }

    fn emit(&self, event: ExecutionEvent) {
        self.shared.events.emit(event);
    }

    /// Record an action delivery as pending and route it.
    pub async fn to_action(&self, token: ActionToken) {
        let shared = &self.shared;
        if shared.flow.action(&token.action_id).is_none() {
            tracing::warn!(runtime = %shared.id, "Action not found: {}", token.action_id);
            shared.store.log(
                LogLevel::Error,
                LogScope::Flow,
                &shared.flow.code,
                &shared.flow.name,
                format!("action not found: {}", token.action_id),
            );
            return;
        }

        shared.store.add_running_action(token.clone());
        if self.is_halted() {
            return;
        }

        tracing::debug!(action = %token.action_id, from = %token.pre_action_id, "dispatch action");
        shared.in_flight.enter();
        if !shared.router.route_action(self, token).await {
            shared.in_flight.leave();
        }
    }

    /// Record a link delivery as pending and route it.
    pub async fn to_link(&self, token: LinkToken) {
        let shared = &self.shared;
        if shared.flow.link(&token.source_id, &token.target_id).is_none() {
            tracing::warn!(
                runtime = %shared.id,
                "Link not found: {} -> {}",
                token.source_id,
                token.target_id
            );
            shared.store.log(
                LogLevel::Error,
                LogScope::Flow,
                &shared.flow.code,
                &shared.flow.name,
                format!("link not found: {} -> {}", token.source_id, token.target_id),
            );
            return;
        }

        shared.store.add_running_link(token.clone());
        if self.is_halted() {
            return;
        }

        tracing::debug!(source = %token.source_id, target = %token.target_id, "dispatch link");
        shared.in_flight.enter();
        if !shared.router.route_link(self, token).await {
            shared.in_flight.leave();
        }
    }

    /// Hand a token to its action worker's inbox.
    pub async fn push_action(&self, token: ActionToken) -> bool {
        match self.shared.action_inboxes.get(&token.action_id) {
            Some(inbox) => inbox.send(Envelope::Deliver(token)).await.is_ok(),
            None => false,
        }
    }

    /// Hand a token to its link worker's inbox.
    pub async fn push_link(&self, token: LinkToken) -> bool {
        match self.shared.link_inboxes.get(&LinkKey::from(&token)) {
            Some(inbox) => inbox.send(Envelope::Deliver(token)).await.is_ok(),
            None => false,
        }
    }

    /// Run until every delivery is processed, the deadline passes or the
    /// session is stopped. After a halt, handlers already running are
    /// awaited before the state is sealed. A session executes at most once.
    pub async fn execute(&self) -> Result<ExecutionResult> {
        let shared = &self.shared;
        if shared.store.status() == FlowStatus::Complete {
            return Err(FlowError::AlreadyComplete(shared.id.clone()));
        }
        let receivers = lock(&shared.receivers).take().ok_or_else(|| {
            FlowError::Execution(format!("session {} has already executed", shared.id))
        })?;

        let pending_actions = shared.store.running_actions();
        let pending_links = shared.store.running_links();
        let resumed = !pending_actions.is_empty() || !pending_links.is_empty();
        if !resumed {
            shared.store.reset_history();
        }
        shared.store.set_begin(!resumed);

        tracing::info!(
            runtime = %shared.id,
            flow = %shared.flow.code,
            resumed,
            "Starting flow execution"
        );
        self.emit(ExecutionEvent::FlowStarted {
            runtime_id: shared.id.clone(),
            flow_code: shared.flow.code.clone(),
            resumed,
            timestamp: Utc::now(),
        });

        let mut workers = Vec::with_capacity(receivers.actions.len() + receivers.links.len());
        for rx in receivers.actions {
            workers.push(tokio::spawn(self.clone().action_worker(rx)));
        }
        for rx in receivers.links {
            workers.push(tokio::spawn(self.clone().link_worker(rx)));
        }
        if let Some(timeout) = shared.config.timeout {
            tokio::spawn(self.clone().watch(timeout));
        }

        // Held while seeding so an early finisher cannot drain the count.
        shared.in_flight.enter();
        {
            let _seeding = InFlightGuard(&shared.in_flight);
            if resumed {
                for token in pending_actions {
                    self.to_action(token).await;
                }
                for token in pending_links {
                    self.to_link(token).await;
                }
            } else {
                for id in shared.flow.start_action_ids() {
                    self.to_action(ActionToken::start(id)).await;
                }
            }
        }

        tokio::select! {
            _ = shared.in_flight.wait() => {}
            _ = shared.halt.cancelled() => {}
        }

        shared.halt.cancel();
        for inbox in shared.action_inboxes.values() {
            let _ = inbox.try_send(Envelope::Shutdown);
        }
        for inbox in shared.link_inboxes.values() {
            let _ = inbox.try_send(Envelope::Shutdown);
        }
        // Halted workers take no new deliveries but finish the one in hand,
        // so its record lands before the snapshot.
        futures::future::join_all(workers).await;

        shared.store.set_end();
        let state = shared.store.snapshot();
        let result = ExecutionResult {
            runtime_id: state.id.clone(),
            status: state.status,
            timed_out: self.is_timed_out(),
            is_error: state.is_error,
            elapsed_ms: state.elapsed_ms,
            action_records: state.action_states.len(),
            link_records: state.link_states.len(),
            pending_actions: state.running_actions.len(),
            pending_links: state.running_links.len(),
        };

        tracing::info!(
            runtime = %result.runtime_id,
            status = ?result.status,
            is_error = result.is_error,
            "Flow execution finished in {}ms",
            result.elapsed_ms
        );
        self.emit(ExecutionEvent::FlowCompleted {
            runtime_id: result.runtime_id.clone(),
            status: result.status,
            is_error: result.is_error,
            elapsed_ms: result.elapsed_ms,
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    async fn watch(self, timeout: Duration) {
        tokio::select! {
            _ = self.shared.halt.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                let shared = &self.shared;
                shared.timed_out.store(true, Ordering::SeqCst);
                tracing::warn!(runtime = %shared.id, "Flow execution timed out after {:?}", timeout);
                shared.store.log(
                    LogLevel::Error,
                    LogScope::Flow,
                    &shared.flow.code,
                    &shared.flow.name,
                    "timeout",
                );
                self.emit(ExecutionEvent::FlowTimedOut {
                    runtime_id: shared.id.clone(),
                    timestamp: Utc::now(),
                });
                shared.halt.cancel();
            }
        }
    }

    async fn action_worker(self, mut inbox: mpsc::Receiver<Envelope<ActionToken>>) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shared.halt.cancelled() => break,
                envelope = inbox.recv() => envelope,
            };
            match envelope {
                Some(Envelope::Deliver(token)) => self.process_action(token).await,
                Some(Envelope::Shutdown) | None => break,
            }
        }
    }

    async fn link_worker(self, mut inbox: mpsc::Receiver<Envelope<LinkToken>>) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shared.halt.cancelled() => break,
                envelope = inbox.recv() => envelope,
            };
            match envelope {
                Some(Envelope::Deliver(token)) => self.process_link(token).await,
                Some(Envelope::Shutdown) | None => break,
            }
        }
    }

    async fn process_action(&self, token: ActionToken) {
        let shared = &self.shared;
        let _guard = InFlightGuard(&shared.in_flight);
        if self.is_halted() {
            return;
        }
        let Some(action) = shared.flow.action(&token.action_id) else {
            return;
        };

        let state: SharedActionState =
            Arc::new(Mutex::new(ActionState::begin(action, &token.pre_action_id)));
        self.emit(ExecutionEvent::ActionStarted {
            runtime_id: shared.id.clone(),
            action_id: action.id.clone(),
            action_name: action.name.clone(),
            pre_action_id: token.pre_action_id.clone(),
            timestamp: Utc::now(),
        });

        let outcome = match shared.runner.execute_action(self, &token, &state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(runtime = %shared.id, action = %action.id, "Action failed: {}", e);
                shared.store.log(
                    LogLevel::Error,
                    LogScope::Action,
                    &action.name,
                    &action.title,
                    e.to_string(),
                );
                self.emit(ExecutionEvent::ActionFailed {
                    runtime_id: shared.id.clone(),
                    action_id: action.id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Outcome::Failure
            }
        };

        if !outcome.is_complete() {
            tracing::debug!(action = %action.id, "action rejected, left pending");
            return;
        }

        let mut record = lock(&state).clone();
        record.finish(outcome);
        let next_action_ids = record.next_action_ids.clone();
        let elapsed_ms = record.elapsed_ms;
        shared.store.append_action_state(record);

        if outcome.is_success() {
            for link in shared.flow.links_from(&action.id).filter(|l| l.active) {
                if !next_action_ids.is_empty() && !next_action_ids.contains(&link.target_id) {
                    continue;
                }
                self.to_link(LinkToken::new(&link.source_id, &link.target_id))
                    .await;
            }
        }

        shared.store.remove_running_action(&token);
        self.emit(ExecutionEvent::ActionCompleted {
            runtime_id: shared.id.clone(),
            action_id: action.id.clone(),
            outcome,
            elapsed_ms,
            timestamp: Utc::now(),
        });
    }

    async fn process_link(&self, token: LinkToken) {
        let shared = &self.shared;
        let _guard = InFlightGuard(&shared.in_flight);
        if self.is_halted() {
            return;
        }
        let Some(link) = shared.flow.link(&token.source_id, &token.target_id) else {
            return;
        };

        let state: SharedLinkState =
            Arc::new(Mutex::new(LinkState::begin(&token, link.title.clone())));

        let outcome = match shared.runner.execute_link(self, &token, &state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let name = format!("{} -> {}", token.source_id, token.target_id);
                tracing::error!(runtime = %shared.id, link = %name, "Link failed: {}", e);
                shared
                    .store
                    .log(LogLevel::Error, LogScope::Link, name, &link.title, e.to_string());
                self.emit(ExecutionEvent::LinkFailed {
                    runtime_id: shared.id.clone(),
                    source_id: token.source_id.clone(),
                    target_id: token.target_id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
                Outcome::Failure
            }
        };

        if !outcome.is_complete() {
            tracing::debug!(source = %token.source_id, target = %token.target_id, "link rejected, left pending");
            return;
        }

        let mut record = lock(&state).clone();
        record.finish(outcome);
        if outcome.is_success() {
            if shared.store.append_link_state_and_join(record) {
                self.to_action(ActionToken::new(&token.target_id, &token.source_id))
                    .await;
            } else {
                tracing::debug!(target = %token.target_id, "waiting for remaining incoming links");
            }
        } else {
            shared.store.append_link_state(record);
        }

        shared.store.remove_running_link(&token);
        self.emit(ExecutionEvent::LinkCompleted {
            runtime_id: shared.id.clone(),
            source_id: token.source_id.clone(),
            target_id: token.target_id.clone(),
            outcome,
            timestamp: Utc::now(),
        });
    }
}

pub struct SessionBuilder {
    store: RuntimeStore,
    runner: Option<Arc<FlowRunner>>,
    router: Option<Arc<dyn FlowRouter>>,
    events: Option<EventBus>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn runner(mut self, runner: Arc<FlowRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn router(mut self, router: Arc<dyn FlowRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Create one bounded inbox per action id and per link key.
    pub fn build(self) -> Session {
        let flow = self.store.flow();
        let capacity = self.config.inbox_capacity.max(1);

        let mut action_inboxes = HashMap::new();
        let mut actions = Vec::new();
        for action in &flow.actions {
            if action_inboxes.contains_key(&action.id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(capacity);
            action_inboxes.insert(action.id.clone(), tx);
            actions.push(rx);
        }

        let mut link_inboxes = HashMap::new();
        let mut links = Vec::new();
        for link in &flow.links {
            let key = LinkKey(link.source_id.clone(), link.target_id.clone());
            if link_inboxes.contains_key(&key) {
                continue;
            }
            let (tx, rx) = mpsc::channel(capacity);
            link_inboxes.insert(key, tx);
            links.push(rx);
        }

        Session {
            shared: Arc::new(Shared {
                id: self.store.id(),
                flow,
                runner: self
                    .runner
                    .unwrap_or_else(|| Arc::new(FlowRunner::builder().build())),
                router: self.router.unwrap_or_else(|| Arc::new(LocalRouter)),
                events: self.events.unwrap_or_default(),
                config: self.config,
                store: self.store,
                action_inboxes,
                link_inboxes,
                receivers: Mutex::new(Some(Receivers { actions, links })),
                halt: CancellationToken::new(),
                in_flight: InFlight::default(),
                timed_out: AtomicBool::new(false),
            }),
        }
    }
}
