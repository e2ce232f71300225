//! Script hooks: the evaluator boundary and its Rhai implementation.
//!
//! Guard, body and error scripts all go through [`ScriptEvaluator`]. The
//! value a script returns is coerced with [`flowcore::Outcome::from_value`].

use crate::store::{lock, RuntimeStore};
use base64::Engine as _;
use flowcore::{ActionContent, ActionState, ActionToken, LinkState, LinkToken, LogLevel, LogScope};
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub type SharedActionState = Arc<Mutex<ActionState>>;
pub type SharedLinkState = Arc<Mutex<LinkState>>;

const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script error: {0}")]
    Eval(String),

    #[error("Task join error: {0}")]
    Join(String),
}

/// What a script is attached to
#[derive(Clone)]
pub enum ScriptTarget {
    Action {
        action_id: String,
        pre_action_id: String,
        state: SharedActionState,
    },
    Link {
        source_id: String,
        target_id: String,
        state: SharedLinkState,
    },
}

/// Bindings handed to an evaluator
#[derive(Clone)]
pub struct ScriptScope {
    pub store: RuntimeStore,
    pub target: ScriptTarget,
}

impl ScriptScope {
    pub fn action(store: RuntimeStore, token: &ActionToken, state: SharedActionState) -> Self {
        Self {
            store,
            target: ScriptTarget::Action {
                action_id: token.action_id.clone(),
                pre_action_id: token.pre_action_id.clone(),
                state,
            },
        }
    }

    pub fn link(store: RuntimeStore, token: &LinkToken, state: SharedLinkState) -> Self {
        Self {
            store,
            target: ScriptTarget::Link {
                source_id: token.source_id.clone(),
                target_id: token.target_id.clone(),
                state,
            },
        }
    }
}

/// Evaluates one script source against a scope. Runs on the blocking pool.
pub trait ScriptEvaluator: Send + Sync {
    fn evaluate(&self, source: &str, scope: &ScriptScope) -> Result<Value, ScriptError>;
}

/// [`ScriptEvaluator`] backed by the Rhai engine.
#[derive(Debug, Clone)]
pub struct RhaiEvaluator {
    cmd_timeout: Duration,
}

impl RhaiEvaluator {
    pub fn new() -> Self {
        Self {
            cmd_timeout: DEFAULT_CMD_TIMEOUT,
        }
    }

    /// Default deadline for each line run by `cmd`.
    pub fn with_cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    /// Create a Rhai engine with the host functions for this scope.
    fn create_engine(&self, scope: &ScriptScope) -> Engine {
        let mut engine = Engine::new();
        engine.on_print(|msg| tracing::info!(target: "rhai", "{}", msg));

        register_common(&mut engine, &scope.store, self.cmd_timeout);
        match &scope.target {
            ScriptTarget::Action {
                action_id,
                pre_action_id,
                state,
            } => register_action(&mut engine, &scope.store, action_id, pre_action_id, state),
            ScriptTarget::Link {
                source_id, state, ..
            } => register_link(&mut engine, &scope.store, source_id, state),
        }

        engine
    }

    /// Expose `flow`, and `action` or `link`, as script variables.
    fn build_scope(&self, scope: &ScriptScope) -> Scope<'static> {
        let flow = scope.store.flow();
        let mut vars = Scope::new();

        let mut flow_map = rhai::Map::new();
        flow_map.insert("code".into(), Dynamic::from(flow.code.clone()));
        flow_map.insert("name".into(), Dynamic::from(flow.name.clone()));
        vars.push("flow", flow_map);

        match &scope.target {
            ScriptTarget::Action { action_id, .. } => {
                let mut map = rhai::Map::new();
                map.insert("id".into(), Dynamic::from(action_id.clone()));
                if let Some(action) = flow.action(action_id) {
                    map.insert("name".into(), Dynamic::from(action.name.clone()));
                    map.insert("title".into(), Dynamic::from(action.title.clone()));
                    let params: rhai::Map = action
                        .params
                        .iter()
                        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
                        .collect();
                    map.insert("params".into(), Dynamic::from(params));
                }
                vars.push("action", map);
            }
            ScriptTarget::Link {
                source_id,
                target_id,
                ..
            } => {
                let mut map = rhai::Map::new();
                map.insert("source_id".into(), Dynamic::from(source_id.clone()));
                map.insert("target_id".into(), Dynamic::from(target_id.clone()));
                if let Some(link) = flow.link(source_id, target_id) {
                    map.insert("name".into(), Dynamic::from(link.name.clone()));
                    map.insert("title".into(), Dynamic::from(link.title.clone()));
                }
                vars.push("link", map);
            }
        }

        vars
    }
}

impl Default for RhaiEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEvaluator for RhaiEvaluator {
    fn evaluate(&self, source: &str, scope: &ScriptScope) -> Result<Value, ScriptError> {
        if source.trim().is_empty() {
            return Ok(Value::Null);
        }

        let engine = self.create_engine(scope);
        let mut vars = self.build_scope(scope);

        let result = engine
            .eval_with_scope::<Dynamic>(&mut vars, source)
            .map_err(|e| ScriptError::Eval(e.to_string()))?;
        Ok(dynamic_to_json(&result))
    }
}

fn register_common(engine: &mut Engine, store: &RuntimeStore, cmd_timeout: Duration) {
    let s = store.clone();
    engine.register_fn("set_param", move |key: &str, value: Dynamic| {
        s.set_param(key, dynamic_to_json(&value))
    });
    let s = store.clone();
    engine.register_fn("get_param", move |key: &str| -> Dynamic {
        s.get_param(key).map(|v| json_to_dynamic(&v)).unwrap_or(Dynamic::UNIT)
    });
    let s = store.clone();
    engine.register_fn("params", move || -> Dynamic { map_to_dynamic(&s.params()) });

    let s = store.clone();
    engine.register_fn("set_data", move |key: &str, value: Dynamic| {
        s.set_data(key, dynamic_to_json(&value))
    });
    let s = store.clone();
    engine.register_fn("get_data", move |key: &str| -> Dynamic {
        s.get_data(key).map(|v| json_to_dynamic(&v)).unwrap_or(Dynamic::UNIT)
    });
    let s = store.clone();
    engine.register_fn("data", move || -> Dynamic { map_to_dynamic(&s.data()) });
    let s = store.clone();
    engine.register_fn("set_datas", move |values: rhai::Map| {
        for (key, value) in values {
            s.set_data(key.to_string(), dynamic_to_json(&value));
        }
    });

    engine.register_fn("parse_json", |s: &str| -> Dynamic {
        match serde_json::from_str::<Value>(s) {
            Ok(v) => json_to_dynamic(&v),
            Err(_) => Dynamic::UNIT,
        }
    });
    engine.register_fn("to_json", |value: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(&value)).unwrap_or_else(|_| "null".to_string())
    });

    engine.register_fn("base64_encode", |s: &str| -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    });
    engine.register_fn("base64_decode", |s: &str| -> Dynamic {
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("sha256", |s: &str| -> String {
        Sha256::digest(s.as_bytes())
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    });

    engine.register_fn("substr", |s: &str, start: rhai::INT| -> String {
        let count = s.chars().count() as rhai::INT;
        substr(s, start, count)
    });
    engine.register_fn("substr", substr);
    engine.register_fn("trim_str", |s: &str| -> String { s.trim().to_string() });

    engine.register_fn("sleep", |millis: rhai::INT| {
        std::thread::sleep(Duration::from_millis(millis.max(0) as u64));
    });

    engine.register_fn("cmd", move |commands: &str| -> Dynamic {
        run_commands(commands, cmd_timeout)
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("cmd", |commands: &str, timeout_ms: rhai::INT| -> Dynamic {
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        run_commands(commands, timeout)
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    });
}

fn register_action(
    engine: &mut Engine,
    store: &RuntimeStore,
    action_id: &str,
    pre_action_id: &str,
    state: &SharedActionState,
) {
    let (s, st) = (store.clone(), state.clone());
    engine.register_fn("log", move |value: Dynamic| {
        let state = lock(&st);
        let text = dynamic_to_text(&value);
        tracing::info!(target: "rhai", action = %state.action_id, "{}", text);
        s.log(
            LogLevel::Info,
            LogScope::Action,
            &state.action_name,
            &state.action_title,
            text,
        );
    });

    let st = state.clone();
    engine.register_fn("set_content", move |value: Dynamic| {
        lock(&st).content = Some(ActionContent {
            content_type: "msg".to_string(),
            content: dynamic_to_text(&value),
        });
    });
    let st = state.clone();
    engine.register_fn("set_content", move |value: Dynamic, content_type: &str| {
        lock(&st).content = Some(ActionContent {
            content_type: content_type.to_string(),
            content: dynamic_to_text(&value),
        });
    });
    let st = state.clone();
    engine.register_fn("set_title", move |title: &str| {
        lock(&st).action_title = title.to_string();
    });
    let st = state.clone();
    engine.register_fn("set_icon", move |icon: &str| {
        lock(&st).action_icon = icon.to_string();
    });

    let st = state.clone();
    engine.register_fn("set_action_data", move |key: &str, value: Dynamic| {
        lock(&st).data.insert(key.to_string(), dynamic_to_json(&value));
    });
    let st = state.clone();
    engine.register_fn("get_action_data", move |key: &str| -> Dynamic {
        lock(&st)
            .data
            .get(key)
            .map(json_to_dynamic)
            .unwrap_or(Dynamic::UNIT)
    });
    let st = state.clone();
    engine.register_fn("action_data", move || -> Dynamic { map_to_dynamic(&lock(&st).data) });

    register_pre_action_data(engine, store, pre_action_id);

    let st = state.clone();
    engine.register_fn("set_next_actions", move |ids: rhai::Array| {
        lock(&st).next_action_ids = ids.iter().map(dynamic_to_text).collect();
    });

    tracing::trace!(action = action_id, "action script functions registered");
}

fn register_link(
    engine: &mut Engine,
    store: &RuntimeStore,
    source_id: &str,
    state: &SharedLinkState,
) {
    let (s, st) = (store.clone(), state.clone());
    engine.register_fn("log", move |value: Dynamic| {
        let state = lock(&st);
        let text = dynamic_to_text(&value);
        let name = format!("{} -> {}", state.source_id, state.target_id);
        tracing::info!(target: "rhai", link = %name, "{}", text);
        s.log(LogLevel::Info, LogScope::Link, name, &state.title, text);
    });

    let st = state.clone();
    engine.register_fn("set_title", move |title: &str| {
        lock(&st).title = title.to_string();
    });

    register_pre_action_data(engine, store, source_id);
}

/// Reads of the predecessor's private data. For links the predecessor is
/// the source action.
fn register_pre_action_data(engine: &mut Engine, store: &RuntimeStore, pre_action_id: &str) {
    let (s, pre) = (store.clone(), pre_action_id.to_string());
    engine.register_fn("get_pre_action_data", move |key: &str| -> Dynamic {
        s.action_data(&pre, key)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    });
    let (s, pre) = (store.clone(), pre_action_id.to_string());
    engine.register_fn("pre_action_data", move || -> Dynamic {
        map_to_dynamic(&s.action_data_map(&pre))
    });
}

/// Character-based `[start, end)` slice, clamped to the string.
fn substr(s: &str, start: rhai::INT, end: rhai::INT) -> String {
    let start = start.max(0) as usize;
    let end = end.max(0) as usize;
    if end <= start {
        return String::new();
    }
    s.chars().skip(start).take(end - start).collect()
}

/// Run each non-empty line as one command and concatenate stdout.
///
/// `None` when a command cannot start or outlives `timeout`; the child is
/// killed on timeout. Blocks the calling thread, which is the blocking pool
/// when called from a script.
fn run_commands(commands: &str, timeout: Duration) -> Option<String> {
    let task = async {
        let mut output = String::new();

        for line in commands.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split_whitespace();
            let program = parts.next()?;

            let run = tokio::process::Command::new(program)
                .args(parts)
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output();

            match tokio::time::timeout(timeout, run).await {
                Ok(Ok(out)) => output.push_str(&String::from_utf8_lossy(&out.stdout)),
                Ok(Err(e)) => {
                    tracing::error!("cmd {:?} failed to start: {}", line, e);
                    return None;
                }
                Err(_) => {
                    tracing::warn!("cmd {:?} timed out after {:?}", line, timeout);
                    return None;
                }
            }
        }

        Some(output)
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(task),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .ok()?
            .block_on(task),
    }
}

// JSON <-> Dynamic conversion

fn map_to_dynamic(map: &flowcore::DataMap) -> Dynamic {
    let out: rhai::Map = map
        .iter()
        .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
        .collect();
    Dynamic::from(out)
}

/// Strings as-is, everything else as JSON text.
fn dynamic_to_text(value: &Dynamic) -> String {
    if value.is_string() || value.is_char() {
        value.to_string()
    } else {
        dynamic_to_json(value).to_string()
    }
}

pub(crate) fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => {
            let rhai_arr: rhai::Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(rhai_arr)
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

pub(crate) fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() || value.is_char() {
        Value::String(value.to_string())
    } else if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(&v)))
                .collect(),
        )
    } else {
        Value::String(value.to_string())
    }
}
