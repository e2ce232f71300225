//! Core abstractions for the flow engine
//!
//! Flow definitions, the tri-state outcome, the serializable runtime record
//! and the event types every other crate builds on. No execution lives here.

mod error;
pub mod events;
pub mod flow;
mod outcome;
pub mod runtime;

pub use error::{FlowError, GraphError, Stage, StepError};
pub use events::*;
pub use flow::{Action, ActionContent, ActionId, Flow, FlowDict, FlowParam, Group, Link};
pub use outcome::Outcome;
pub use runtime::{
    ActionState, ActionToken, DataMap, FlowStatus, LinkState, LinkToken, LogEntry, LogLevel,
    LogScope, RuntimeState,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
