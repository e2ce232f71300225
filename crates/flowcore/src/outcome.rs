use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tri-state result of an action or link execution attempt.
///
/// Serialized as the integers used in persisted runtimes: `1`, `-1` and `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum Outcome {
    /// Proceed and mark the attempt complete
    Success,
    /// Stop this branch, mark the attempt complete and flag an error
    Failure,
    /// Not ready yet: the pending token is kept for a later run
    Reject,
}

impl Outcome {
    /// SUCCESS and FAILURE complete an attempt; REJECT leaves it pending.
    pub fn is_complete(self) -> bool {
        !matches!(self, Outcome::Reject)
    }

    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Coerce a script return value into an outcome.
    ///
    /// `true`, `"true"`, `"1"` and positive numbers succeed; `false`,
    /// `"false"`, `"-1"` and negative numbers fail; `"0"` and zero reject.
    /// Everything else, including `null`, succeeds.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Outcome::Success,
            Value::Bool(false) => Outcome::Failure,
            Value::String(s) => match s.as_str() {
                "false" | "-1" => Outcome::Failure,
                "0" => Outcome::Reject,
                _ => Outcome::Success,
            },
            Value::Number(n) => match n.as_f64() {
                Some(f) if f < 0.0 => Outcome::Failure,
                Some(f) if f == 0.0 => Outcome::Reject,
                _ => Outcome::Success,
            },
            _ => Outcome::Success,
        }
    }
}

impl Default for Outcome {
    fn default() -> Self {
        Outcome::Reject
    }
}

impl From<i8> for Outcome {
    fn from(code: i8) -> Self {
        match code {
            c if c > 0 => Outcome::Success,
            c if c < 0 => Outcome::Failure,
            _ => Outcome::Reject,
        }
    }
}

impl From<Outcome> for i8 {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => 1,
            Outcome::Failure => -1,
            Outcome::Reject => 0,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Reject => "reject",
        };
        f.write_str(name)
    }
}
