use crate::flow::{Action, ActionContent, Flow};
use crate::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub type DataMap = BTreeMap<String, Value>;

/// Dispatch token for an action: which action, reached from which predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionToken {
    pub action_id: String,
    /// Empty for start actions
    #[serde(default)]
    pub pre_action_id: String,
}

impl ActionToken {
    pub fn new(action_id: impl Into<String>, pre_action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            pre_action_id: pre_action_id.into(),
        }
    }

    pub fn start(action_id: impl Into<String>) -> Self {
        Self::new(action_id, "")
    }
}

/// Dispatch token for a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkToken {
    pub source_id: String,
    pub target_id: String,
}

impl LinkToken {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
        }
    }
}

/// Record of one execution attempt of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionState {
    pub action_id: String,
    pub action_name: String,
    pub action_title: String,
    pub action_des: String,
    pub action_icon: String,
    pub pre_action_id: String,
    pub is_error: bool,
    pub state: Outcome,
    /// Values private to this invocation
    pub data: DataMap,
    pub content: Option<ActionContent>,
    /// When non-empty, only links towards these targets are followed
    #[serde(default)]
    pub next_action_ids: Vec<String>,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
}

impl ActionState {
    pub fn begin(action: &Action, pre_action_id: impl Into<String>) -> Self {
        Self {
            action_id: action.id.clone(),
            action_name: action.name.clone(),
            action_title: action.title.clone(),
            action_des: action.des.clone(),
            action_icon: action.icon.clone(),
            pre_action_id: pre_action_id.into(),
            is_error: false,
            state: Outcome::Reject,
            data: DataMap::new(),
            content: action.content.clone(),
            next_action_ids: Vec::new(),
            begin_time: Utc::now(),
            end_time: None,
            elapsed_ms: 0,
        }
    }

    /// Stamp the final outcome and timing.
    pub fn finish(&mut self, outcome: Outcome) {
        let now = Utc::now();
        self.state = outcome;
        self.is_error = outcome == Outcome::Failure;
        self.end_time = Some(now);
        self.elapsed_ms = (now - self.begin_time).num_milliseconds();
    }
}

/// Record of one execution attempt of a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkState {
    pub source_id: String,
    pub target_id: String,
    pub title: String,
    pub is_error: bool,
    pub state: Outcome,
    pub begin_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
}

impl LinkState {
    pub fn begin(token: &LinkToken, title: impl Into<String>) -> Self {
        Self {
            source_id: token.source_id.clone(),
            target_id: token.target_id.clone(),
            title: title.into(),
            is_error: false,
            state: Outcome::Reject,
            begin_time: Utc::now(),
            end_time: None,
            elapsed_ms: 0,
        }
    }

    pub fn finish(&mut self, outcome: Outcome) {
        let now = Utc::now();
        self.state = outcome;
        self.is_error = outcome == Outcome::Failure;
        self.end_time = Some(now);
        self.elapsed_ms = (now - self.begin_time).num_milliseconds();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogScope {
    Flow,
    Action,
    Link,
}

/// Human-readable log line kept with the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub scope: LogScope,
    pub name: String,
    pub title: String,
    pub content: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Created or suspended with pending work
    #[default]
    Pending,
    Running,
    /// Drained with nothing pending; no further runs
    Complete,
}

/// Mutable, serializable record of one flow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub id: String,
    pub flow: Arc<Flow>,
    pub des: String,
    pub status: FlowStatus,
    pub is_running: bool,
    pub is_error: bool,
    #[serde(default)]
    pub running_actions: Vec<ActionToken>,
    #[serde(default)]
    pub running_links: Vec<LinkToken>,
    #[serde(default)]
    pub action_states: Vec<ActionState>,
    #[serde(default)]
    pub link_states: Vec<LinkState>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub params: DataMap,
    #[serde(default)]
    pub data: DataMap,
    #[serde(default)]
    pub message: String,
    pub create_time: DateTime<Utc>,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_ms: i64,
}

impl RuntimeState {
    /// Fresh runtime for a flow. Declared flow params seed the param store,
    /// caller params override them.
    pub fn new(flow: impl Into<Arc<Flow>>, params: DataMap) -> Self {
        let flow = flow.into();
        let mut seeded = DataMap::new();
        for p in &flow.params {
            seeded.insert(p.name.clone(), Value::String(p.value.clone()));
        }
        seeded.extend(params);

        Self {
            id: Uuid::new_v4().simple().to_string(),
            des: flow.name.clone(),
            flow,
            status: FlowStatus::Pending,
            is_running: false,
            is_error: false,
            running_actions: Vec::new(),
            running_links: Vec::new(),
            action_states: Vec::new(),
            link_states: Vec::new(),
            logs: Vec::new(),
            params: seeded,
            data: DataMap::new(),
            message: String::new(),
            create_time: Utc::now(),
            begin_time: None,
            end_time: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == FlowStatus::Complete
    }

    pub fn has_pending(&self) -> bool {
        !self.running_actions.is_empty() || !self.running_links.is_empty()
    }

    /// Returns false when the token was already pending.
    pub fn add_running_action(&mut self, token: ActionToken) -> bool {
        if self.running_actions.contains(&token) {
            return false;
        }
        self.running_actions.push(token);
        true
    }

    pub fn remove_running_action(&mut self, token: &ActionToken) -> bool {
        match self.running_actions.iter().position(|t| t == token) {
            Some(index) => {
                self.running_actions.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn add_running_link(&mut self, token: LinkToken) -> bool {
        if self.running_links.contains(&token) {
            return false;
        }
        self.running_links.push(token);
        true
    }

    pub fn remove_running_link(&mut self, token: &LinkToken) -> bool {
        match self.running_links.iter().position(|t| t == token) {
            Some(index) => {
                self.running_links.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn last_action_state(&self, action_id: &str) -> Option<&ActionState> {
        self.action_states
            .iter()
            .rev()
            .find(|s| s.action_id == action_id)
    }

    pub fn last_link_state(&self, source_id: &str, target_id: &str) -> Option<&LinkState> {
        self.link_states
            .iter()
            .rev()
            .find(|s| s.source_id == source_id && s.target_id == target_id)
    }

    /// Whether a successful arrival over `source_id -> target_id` lets the
    /// target run.
    ///
    /// Non-collect targets always pass, unknown targets too so that delivery
    /// can report them. A collect target with more than one active incoming
    /// link needs the latest record of every other active incoming link to
    /// be a success.
    pub fn join_satisfied(&self, source_id: &str, target_id: &str) -> bool {
        let Some(target) = self.flow.action(target_id) else {
            return true;
        };
        if !target.collect {
            return true;
        }

        let active: Vec<_> = self.flow.links_to(target_id).filter(|l| l.active).collect();
        if active.len() <= 1 {
            return true;
        }

        let passed = active
            .iter()
            .filter(|l| l.source_id != source_id)
            .filter(|l| {
                self.last_link_state(&l.source_id, &l.target_id)
                    .is_some_and(|s| s.state.is_success())
            })
            .count();

        passed + 1 >= active.len()
    }

    pub fn action_data(&self, action_id: &str, key: &str) -> Option<&Value> {
        self.last_action_state(action_id)
            .and_then(|s| s.data.get(key))
    }

    pub fn action_data_map(&self, action_id: &str) -> Option<&DataMap> {
        self.last_action_state(action_id).map(|s| &s.data)
    }

    pub fn add_log(
        &mut self,
        level: LogLevel,
        scope: LogScope,
        name: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) {
        self.logs.push(LogEntry {
            level,
            scope,
            name: name.into(),
            title: title.into(),
            content: content.into(),
            time: Utc::now(),
        });
    }

    /// Drop execution history ahead of a run from scratch.
    pub fn reset_history(&mut self) {
        self.action_states.clear();
        self.link_states.clear();
    }

    pub fn mark_begin(&mut self, fresh: bool) {
        if fresh || self.begin_time.is_none() {
            self.begin_time = Some(Utc::now());
        }
        self.is_running = true;
        self.status = FlowStatus::Running;
    }

    /// Stamp timing, derive the error flag from history and settle the status.
    pub fn mark_end(&mut self) {
        let now = Utc::now();
        self.is_running = false;
        self.end_time = Some(now);
        if let Some(begin) = self.begin_time {
            self.elapsed_ms = (now - begin).num_milliseconds();
        }
        self.is_error = self.action_states.iter().any(|s| s.is_error)
            || self.link_states.iter().any(|s| s.is_error);
        self.status = if self.has_pending() {
            FlowStatus::Pending
        } else {
            FlowStatus::Complete
        };
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Link;

    fn join_flow() -> Flow {
        let mut flow = Flow::new("join", "Join");
        flow.add_action(Action::new("b", "noop"));
        flow.add_action(Action::new("c", "noop"));
        flow.add_action(Action::new("x", "noop"));
        flow.add_action(Action::new("d", "noop").with_collect(true));
        flow.connect("b", "d");
        flow.connect("c", "d");
        flow.add_link(Link::new("x", "d").inactive());
        flow
    }

    fn record(source: &str, target: &str, outcome: Outcome) -> LinkState {
        let mut state = LinkState::begin(&LinkToken::new(source, target), "");
        state.finish(outcome);
        state
    }

    #[test]
    fn pending_tokens_are_idempotent() {
        let mut rt = RuntimeState::new(join_flow(), DataMap::new());
        assert!(rt.add_running_action(ActionToken::new("d", "b")));
        assert!(!rt.add_running_action(ActionToken::new("d", "b")));
        assert!(rt.add_running_action(ActionToken::new("d", "c")));
        assert!(rt.remove_running_action(&ActionToken::new("d", "c")));
        assert_eq!(rt.running_actions, vec![ActionToken::new("d", "b")]);
        assert!(!rt.remove_running_link(&LinkToken::new("b", "d")));
    }

    #[test]
    fn join_waits_for_every_active_sibling() {
        let mut rt = RuntimeState::new(join_flow(), DataMap::new());
        assert!(!rt.join_satisfied("b", "d"));

        rt.link_states.push(record("c", "d", Outcome::Failure));
        assert!(!rt.join_satisfied("b", "d"));

        rt.link_states.push(record("c", "d", Outcome::Success));
        assert!(rt.join_satisfied("b", "d"));
    }

    #[test]
    fn mark_end_settles_status_and_error() {
        let mut rt = RuntimeState::new(join_flow(), DataMap::new());
        rt.mark_begin(true);
        assert_eq!(rt.status, FlowStatus::Running);

        rt.link_states.push(record("b", "d", Outcome::Failure));
        rt.add_running_action(ActionToken::start("b"));
        rt.mark_end();
        assert_eq!(rt.status, FlowStatus::Pending);
        assert!(rt.is_error);

        rt.running_actions.clear();
        rt.mark_end();
        assert!(rt.is_complete());
    }

    #[test]
    fn declared_params_are_overridden_by_caller() {
        let mut flow = join_flow();
        flow.params.push(crate::flow::FlowParam {
            name: "who".into(),
            value: "default".into(),
        });
        let mut params = DataMap::new();
        params.insert("who".into(), Value::from("caller"));
        let rt = RuntimeState::new(flow, params);
        assert_eq!(rt.params["who"], Value::from("caller"));

        let json = rt.to_json().unwrap();
        let back: RuntimeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, rt.id);
        assert_eq!(back.flow.actions.len(), 4);
    }
}
