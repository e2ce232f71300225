use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Runtime {0} is already complete")]
    AlreadyComplete(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where inside an action or link protocol a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Guard script of an action or a link
    Filter,
    /// Registered action runner
    Handler,
    /// Body script that runs after the handler
    After,
    /// Error-handler script
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Filter => "filter",
            Stage::Handler => "handler",
            Stage::After => "after",
            Stage::Error => "error",
        };
        f.write_str(name)
    }
}

/// Failure of a single action or link execution attempt.
///
/// Any `Err` of this type is treated as a FAILURE outcome by the session.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error("{stage} script failed: {message}")]
    Script { stage: Stage, message: String },

    #[error("{stage} script declined to proceed")]
    Declined { stage: Stage },

    #[error("Action '{action}' failed: {message}")]
    Handler { action: String, message: String },

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Link not found: {0} -> {1}")]
    LinkNotFound(String, String),

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    pub fn handler(action: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Handler {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Stage the error is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StepError::Script { stage, .. } | StepError::Declined { stage } => Some(*stage),
            StepError::Handler { .. } => Some(Stage::Handler),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Flow not found: {0}")]
    NotFound(String),

    #[error("Invalid flow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Duplicate action id: {0}")]
    DuplicateAction(String),

    #[error("Invalid link: {0}")]
    InvalidLink(String),
}
