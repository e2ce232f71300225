//! Flow execution runtime
//!
//! This crate provides the engine that runs flows: the serialized state
//! store, the action runner registry, script hooks, and the per-run session
//! with one worker per action and per link.

mod registry;
mod router;
mod runner;
mod runtime;
mod script;
mod session;
mod store;
mod validate;

pub use registry::{ActionContext, ActionRegistry, ActionRunner, Prop, RunnerMetadata};
pub use router::{FlowRouter, LocalRouter};
pub use runner::{iteration_items, FlowRunner, FlowRunnerBuilder};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use script::{
    RhaiEvaluator, ScriptError, ScriptEvaluator, ScriptScope, ScriptTarget, SharedActionState,
    SharedLinkState,
};
pub use session::{
    Envelope, ExecutionResult, LinkKey, Session, SessionBuilder, SessionConfig,
};
pub use store::{RuntimeStore, StoreEvent, StoreObserver};
pub use validate::validate_flow;
