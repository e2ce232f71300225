// crates/flowruntime/tests/session_test.rs

use async_trait::async_trait;
use flowcore::{
    Action, ActionToken, DataMap, Flow, FlowError, FlowStatus, Link, LinkToken, LogLevel,
    Outcome, RuntimeState, StepError,
};
use flowruntime::{
    ActionContext, ActionRegistry, ActionRunner, FlowRouter, FlowRunner, FlowRuntime,
    LocalRouter, RuntimeConfig, RuntimeStore, Session,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn millis(ctx: &ActionContext<'_>) -> u64 {
    ctx.param("ms").and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Sleeps `params["ms"]` and succeeds; rejects when the run is halted first
struct Sleep;

#[async_trait]
impl ActionRunner for Sleep {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let halt = ctx.halt_token();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis(ctx))) => Ok(Outcome::Success),
            _ = halt.cancelled() => Ok(Outcome::Reject),
        }
    }
}

/// Sleeps `params["ms"]` regardless of halts and counts its calls
#[derive(Default)]
struct Stubborn {
    calls: AtomicUsize,
}

#[async_trait]
impl ActionRunner for Stubborn {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        tokio::time::sleep(Duration::from_millis(millis(ctx))).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Outcome::Success)
    }
}

/// Records each bound `item` and rejects on `params["hold"]`
#[derive(Default)]
struct HoldOn {
    seen: Mutex<Vec<Value>>,
}

#[async_trait]
impl ActionRunner for HoldOn {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let item = ctx.store().get_param("item").unwrap_or(Value::Null);
        self.seen.lock().unwrap().push(item.clone());
        if ctx.param("hold") == item.as_str() {
            return Ok(Outcome::Reject);
        }
        Ok(Outcome::Success)
    }
}

/// Writes into its record after poisoning the record's lock
struct Poisoner;

#[async_trait]
impl ActionRunner for Poisoner {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let state = ctx.state.clone();
        let _ = std::thread::spawn(move || {
            let _held = state.lock().unwrap();
            panic!("poison the record");
        })
        .join();
        ctx.record().data.insert("written".to_string(), json!(true));
        Ok(Outcome::Success)
    }
}

struct Fail;

#[async_trait]
impl ActionRunner for Fail {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        Err(StepError::handler(&ctx.action.id, "boom"))
    }
}

/// Remembers which action ran and the bound `item` param
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Option<Value>)>>,
}

#[async_trait]
impl ActionRunner for Recorder {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let item = ctx.store().get_param("item");
        self.seen
            .lock()
            .unwrap()
            .push((ctx.action.id.clone(), item));
        Ok(Outcome::Success)
    }
}

fn runtime(recorder: &Arc<Recorder>) -> FlowRuntime {
    let mut registry = ActionRegistry::new();
    registry.register("sleep", Arc::new(Sleep));
    registry.register("fail", Arc::new(Fail));
    registry.register("record", recorder.clone());
    FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default())
}

fn linear() -> Flow {
    let mut flow = Flow::new("linear", "Linear");
    for id in ["a", "b", "c"] {
        flow.add_action(Action::new(id, "noop"));
    }
    flow.connect("a", "b");
    flow.connect("b", "c");
    flow
}

fn count_runs(state: &RuntimeState, action_id: &str) -> usize {
    state
        .action_states
        .iter()
        .filter(|s| s.action_id == action_id)
        .count()
}

#[tokio::test]
async fn linear_flow_completes() {
    init_tracing();
    let rt = FlowRuntime::new();

    let (state, result) = rt
        .execute_flow(linear(), DataMap::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert_eq!(result.status, FlowStatus::Complete);
    assert!(!state.is_error);
    assert!(!result.timed_out);
    assert_eq!(state.action_states.len(), 3);
    assert_eq!(state.link_states.len(), 2);
    assert!(state.action_states.iter().all(|s| s.state == Outcome::Success));
    assert!(state.link_states.iter().all(|s| s.state == Outcome::Success));
    assert!(state.running_actions.is_empty());
    assert!(state.running_links.is_empty());

    let order: Vec<_> = state.action_states.iter().map(|s| s.action_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(state.action_states[1].pre_action_id, "a");
}

#[tokio::test]
async fn diamond_join_runs_once_in_either_order() {
    init_tracing();

    for (b_ms, c_ms, last) in [("60", "0", "b"), ("0", "60", "c")] {
        let recorder = Arc::new(Recorder::default());
        let rt = runtime(&recorder);

        let mut flow = Flow::new("diamond", "Diamond");
        flow.add_action(Action::new("a", "noop"));
        flow.add_action(Action::new("b", "sleep").with_param("ms", b_ms));
        flow.add_action(Action::new("c", "sleep").with_param("ms", c_ms));
        flow.add_action(Action::new("d", "record").with_collect(true));
        flow.connect("a", "b");
        flow.connect("a", "c");
        flow.connect("b", "d");
        flow.connect("c", "d");

        let (state, _) = rt
            .execute_flow(flow, DataMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(state.status, FlowStatus::Complete);
        assert_eq!(count_runs(&state, "d"), 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);

        let d = state.last_action_state("d").unwrap();
        assert_eq!(d.pre_action_id, last);
        for source in ["b", "c"] {
            let link = state.last_link_state(source, "d").unwrap();
            assert_eq!(link.state, Outcome::Success);
            assert!(link.end_time.unwrap() <= d.begin_time);
        }
    }
}

#[tokio::test]
async fn inactive_link_is_never_traversed() {
    let mut flow = Flow::new("inactive", "Inactive");
    for id in ["a", "b", "c"] {
        flow.add_action(Action::new(id, "noop"));
    }
    flow.add_link(Link::new("a", "b").inactive().with_filter("true"));
    flow.connect("a", "c");

    let (state, _) = FlowRuntime::new()
        .execute_flow(flow, DataMap::new(), None)
        .await
        .unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert_eq!(count_runs(&state, "b"), 0);
    assert_eq!(count_runs(&state, "c"), 1);
    assert!(state.last_link_state("a", "b").is_none());
}

#[tokio::test]
async fn guard_reject_keeps_action_pending_until_resumed() {
    init_tracing();
    let mut flow = linear();
    flow.actions[0].script_before =
        r#"if type_of(get_param("ready")) == "()" { "0" } else { true }"#.to_string();
    let rt = FlowRuntime::new();

    let (mut state, result) = rt
        .execute_flow(flow, DataMap::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(result.status, FlowStatus::Pending);
    assert_eq!(state.running_actions, vec![ActionToken::start("a")]);
    assert!(state.action_states.is_empty());
    assert!(!state.is_error);

    state.params.insert("ready".to_string(), json!(true));
    let (state, result) = rt.execute(state, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(result.status, FlowStatus::Complete);
    assert_eq!(state.action_states.len(), 3);
    assert!(state.running_actions.is_empty());
}

#[tokio::test]
async fn link_reject_resumes_the_same_link() {
    let mut flow = Flow::new("approval", "Approval");
    flow.add_action(Action::new("a", "noop"));
    flow.add_action(Action::new("b", "noop"));
    flow.add_link(
        Link::new("a", "b")
            .with_filter(r#"if type_of(get_param("approved")) == "()" { 0 } else { 1 }"#),
    );
    let rt = FlowRuntime::new();

    let (mut state, _) = rt.execute_flow(flow, DataMap::new(), None).await.unwrap();

    assert_eq!(state.status, FlowStatus::Pending);
    assert_eq!(state.running_links, vec![LinkToken::new("a", "b")]);
    assert_eq!(count_runs(&state, "a"), 1);
    assert_eq!(count_runs(&state, "b"), 0);

    state.params.insert("approved".to_string(), json!(true));
    let (state, result) = rt.execute(state, None).await.unwrap();

    assert_eq!(result.status, FlowStatus::Complete);
    assert_eq!(count_runs(&state, "a"), 1);
    assert_eq!(count_runs(&state, "b"), 1);
    assert_eq!(state.link_states.len(), 1);
}

#[tokio::test]
async fn timeout_returns_with_pending_work() {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(&recorder);

    let mut flow = linear();
    flow.actions[0].name = "sleep".to_string();
    flow.actions[0].params.insert("ms".to_string(), "5000".to_string());

    let started = Instant::now();
    let (state, result) = rt
        .execute_flow(flow, DataMap::new(), Some(Duration::from_millis(100)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(result.timed_out);
    assert_ne!(state.status, FlowStatus::Complete);
    assert_eq!(state.running_actions, vec![ActionToken::start("a")]);
    assert!(state
        .logs
        .iter()
        .any(|l| l.content == "timeout" && l.level == LogLevel::Error));
}

#[tokio::test]
async fn timeout_waits_for_running_handlers_before_resume() {
    init_tracing();
    let stubborn = Arc::new(Stubborn::default());
    let mut registry = ActionRegistry::new();
    registry.register("stubborn", stubborn.clone());
    let rt = FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());

    let mut flow = Flow::new("slow", "Slow");
    flow.add_action(Action::new("a", "stubborn").with_param("ms", "300"));
    flow.add_action(Action::new("b", "noop"));
    flow.connect("a", "b");

    let (state, result) = rt
        .execute_flow(flow, DataMap::new(), Some(Duration::from_millis(50)))
        .await
        .unwrap();

    assert!(result.timed_out);
    assert_eq!(stubborn.calls.load(Ordering::SeqCst), 1);
    assert_eq!(count_runs(&state, "a"), 1);
    assert!(state.running_actions.is_empty());
    assert_eq!(state.running_links, vec![LinkToken::new("a", "b")]);
    assert_eq!(state.status, FlowStatus::Pending);

    let (state, result) = rt.execute(state, Some(Duration::from_secs(5))).await.unwrap();

    assert!(!result.timed_out);
    assert_eq!(result.status, FlowStatus::Complete);
    assert_eq!(stubborn.calls.load(Ordering::SeqCst), 1);
    assert_eq!(count_runs(&state, "a"), 1);
    assert_eq!(count_runs(&state, "b"), 1);
}

#[tokio::test]
async fn after_script_reject_keeps_action_pending() {
    let mut flow = linear();
    flow.actions[0].script_after =
        r#"if type_of(get_param("go")) == "()" { "0" } else { true }"#.to_string();
    let rt = FlowRuntime::new();

    let (mut state, result) = rt.execute_flow(flow, DataMap::new(), None).await.unwrap();

    assert_eq!(result.status, FlowStatus::Pending);
    assert_eq!(state.running_actions, vec![ActionToken::start("a")]);
    assert!(state.action_states.is_empty());
    assert!(!state.is_error);

    state.params.insert("go".to_string(), json!(1));
    let (state, result) = rt.execute(state, None).await.unwrap();

    assert_eq!(result.status, FlowStatus::Complete);
    assert_eq!(state.action_states.len(), 3);
}

#[tokio::test]
async fn after_script_failure_fails_the_action() {
    let mut flow = linear();
    flow.actions[0].script_after = "false".to_string();

    let (state, result) = FlowRuntime::new()
        .execute_flow(flow, DataMap::new(), None)
        .await
        .unwrap();

    assert_eq!(result.status, FlowStatus::Complete);
    assert!(state.is_error);
    let a = state.last_action_state("a").unwrap();
    assert_eq!(a.state, Outcome::Failure);
    assert!(a.is_error);
    assert!(state.link_states.is_empty());
    assert_eq!(count_runs(&state, "b"), 0);
}

#[tokio::test]
async fn handler_reject_stops_iteration_and_stays_pending() {
    let hold_on = Arc::new(HoldOn::default());
    let mut registry = ActionRegistry::new();
    registry.register("hold", hold_on.clone());
    let rt = FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());

    let mut flow = Flow::new("loop", "Loop");
    flow.add_action(
        Action::new("a", "hold")
            .with_iterator("items", "item")
            .with_param("hold", "y"),
    );
    let mut params = DataMap::new();
    params.insert("items".to_string(), json!(["x", "y", "z"]));

    let (state, result) = rt.execute_flow(flow, params, None).await.unwrap();

    assert_eq!(result.status, FlowStatus::Pending);
    assert_eq!(*hold_on.seen.lock().unwrap(), vec![json!("x"), json!("y")]);
    assert!(state.action_states.is_empty());
    assert_eq!(state.running_actions, vec![ActionToken::start("a")]);
    assert!(!state.is_error);
}

#[tokio::test]
async fn record_survives_a_poisoned_lock() {
    let mut registry = ActionRegistry::new();
    registry.register("poison", Arc::new(Poisoner));
    let rt = FlowRuntime::with_registry(Arc::new(registry), RuntimeConfig::default());

    let mut flow = Flow::new("poison", "Poison");
    flow.add_action(Action::new("a", "poison"));

    let (state, _) = rt.execute_flow(flow, DataMap::new(), None).await.unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert_eq!(
        state.last_action_state("a").unwrap().data.get("written"),
        Some(&json!(true))
    );
}

#[tokio::test]
async fn failure_stops_only_its_branch() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(&recorder);

    let mut flow = Flow::new("branches", "Branches");
    flow.add_action(Action::new("a", "noop"));
    flow.add_action(
        Action::new("b", "fail")
            .with_title("Broken")
            .with_error_script(r#"set_data("recovered", true)"#),
    );
    flow.add_action(Action::new("c", "record"));
    flow.add_action(Action::new("d", "record"));
    flow.connect("a", "b");
    flow.connect("b", "c");
    flow.connect("a", "d");

    let (state, result) = rt.execute_flow(flow, DataMap::new(), None).await.unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert!(state.is_error);
    assert!(result.is_error);

    let b = state.last_action_state("b").unwrap();
    assert_eq!(b.state, Outcome::Failure);
    assert!(b.is_error);
    assert_eq!(count_runs(&state, "c"), 0);
    assert_eq!(count_runs(&state, "d"), 1);
    assert_eq!(state.data.get("recovered"), Some(&json!(true)));
    assert!(state
        .logs
        .iter()
        .any(|l| l.level == LogLevel::Error && l.content.contains("boom")));
}

#[tokio::test]
async fn iteration_binds_each_item() {
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(&recorder);

    let mut flow = Flow::new("loop", "Loop");
    flow.add_action(Action::new("a", "record").with_iterator("items", "item"));
    let mut params = DataMap::new();
    params.insert("items".to_string(), json!("[\"x\", \"y\", \"z\"]"));

    let (state, _) = rt.execute_flow(flow, params, None).await.unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert_eq!(count_runs(&state, "a"), 1);
    let items: Vec<_> = recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(_, item)| item.clone())
        .collect();
    assert_eq!(items, vec![Some(json!("x")), Some(json!("y")), Some(json!("z"))]);
}

#[tokio::test]
async fn next_actions_restrict_outgoing_links() {
    let mut flow = Flow::new("choice", "Choice");
    flow.add_action(Action::new("a", "noop").with_script(r#"set_next_actions(["c"]); true"#));
    flow.add_action(Action::new("b", "noop"));
    flow.add_action(Action::new("c", "noop"));
    flow.connect("a", "b");
    flow.connect("a", "c");

    let (state, _) = FlowRuntime::new()
        .execute_flow(flow, DataMap::new(), None)
        .await
        .unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert_eq!(count_runs(&state, "b"), 0);
    assert_eq!(count_runs(&state, "c"), 1);
    assert_eq!(
        state.last_action_state("a").unwrap().next_action_ids,
        vec!["c".to_string()]
    );
}

#[tokio::test]
async fn dangling_target_is_logged_and_skipped() {
    let mut flow = linear();
    flow.connect("c", "ghost");

    let (state, _) = FlowRuntime::new()
        .execute_flow(flow, DataMap::new(), None)
        .await
        .unwrap();

    assert_eq!(state.status, FlowStatus::Complete);
    assert_eq!(state.action_states.len(), 3);
    assert!(state
        .logs
        .iter()
        .any(|l| l.content == "action not found: ghost"));
}

#[tokio::test]
async fn completed_runtime_cannot_run_again() {
    let rt = FlowRuntime::new();
    let (state, _) = rt.execute_flow(linear(), DataMap::new(), None).await.unwrap();

    let err = rt.execute(state, None).await.unwrap_err();
    assert!(matches!(err, FlowError::AlreadyComplete(_)));
}

#[tokio::test]
async fn events_follow_the_run() {
    let rt = FlowRuntime::new();
    let mut events = rt.subscribe_events();

    rt.execute_flow(linear(), DataMap::new(), None).await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        let json = serde_json::to_value(&event).unwrap();
        names.push(json["type"].as_str().unwrap().to_string());
    }
    assert_eq!(names.first().map(String::as_str), Some("FlowStarted"));
    assert_eq!(names.last().map(String::as_str), Some("FlowCompleted"));
    assert_eq!(names.iter().filter(|n| *n == "ActionCompleted").count(), 3);
    assert_eq!(names.iter().filter(|n| *n == "LinkCompleted").count(), 2);
}

#[tokio::test]
async fn stop_halts_a_running_session() {
    let recorder = Arc::new(Recorder::default());
    let rt = Arc::new(runtime(&recorder));

    let mut flow = linear();
    flow.actions[0].name = "sleep".to_string();
    flow.actions[0].params.insert("ms".to_string(), "5000".to_string());

    let handle = {
        let rt = rt.clone();
        tokio::spawn(async move { rt.execute_flow(flow, DataMap::new(), None).await })
    };

    let mut id = None;
    for _ in 0..100 {
        if let Some(running) = rt.running_ids().await.into_iter().next() {
            id = Some(running);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let id = id.expect("session never registered");
    assert!(rt.stop(&id).await);

    let (state, result) = handle.await.unwrap().unwrap();
    assert!(!result.timed_out);
    assert_eq!(state.status, FlowStatus::Pending);
    assert!(state.logs.iter().any(|l| l.content == "stopped"));
    assert!(rt.running_ids().await.is_empty());
}

/// Counts every routed token before delivering it locally
#[derive(Default)]
struct CountingRouter {
    routed: AtomicUsize,
}

#[async_trait]
impl FlowRouter for CountingRouter {
    async fn route_action(&self, session: &Session, token: ActionToken) -> bool {
        self.routed.fetch_add(1, Ordering::SeqCst);
        LocalRouter.route_action(session, token).await
    }

    async fn route_link(&self, session: &Session, token: LinkToken) -> bool {
        self.routed.fetch_add(1, Ordering::SeqCst);
        LocalRouter.route_link(session, token).await
    }
}

#[tokio::test]
async fn session_routes_through_custom_router() {
    let router = Arc::new(CountingRouter::default());
    let store = RuntimeStore::new(RuntimeState::new(linear(), DataMap::new()));
    let session = Session::builder(store.clone())
        .runner(Arc::new(FlowRunner::builder().build()))
        .router(router.clone())
        .build();

    let result = session.execute().await.unwrap();

    assert_eq!(result.status, FlowStatus::Complete);
    assert_eq!(result.action_records, 3);
    assert_eq!(router.routed.load(Ordering::SeqCst), 5);
    assert!(session.execute().await.is_err());
    assert_eq!(store.status(), FlowStatus::Complete);
}
