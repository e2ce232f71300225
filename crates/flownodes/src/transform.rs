use async_trait::async_trait;
use flowcore::{Outcome, StepError};
use flowruntime::{ActionContext, ActionRunner, Prop, RunnerMetadata};
use serde_json::Value;

/// Name of the run param to read, from the action's `input` param.
fn input_param<'a>(ctx: &'a ActionContext<'_>) -> Result<&'a str, StepError> {
    ctx.param("input")
        .filter(|name| !name.is_empty())
        .ok_or_else(|| StepError::handler(&ctx.action.id, "missing 'input' param"))
}

/// Parse a JSON string param into run data
pub struct JsonParseRunner;

#[async_trait]
impl ActionRunner for JsonParseRunner {
    fn metadata(&self) -> RunnerMetadata {
        RunnerMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            properties: vec![
                Prop::new("input", "Input param").required(),
                Prop::new("output", "Output data key").with_default("parsed"),
            ],
        }
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let input = input_param(ctx)?;
        let raw = match ctx.store().get_param(input) {
            Some(Value::String(raw)) => raw,
            Some(_) => {
                return Err(StepError::handler(
                    &ctx.action.id,
                    format!("param '{}' is not a string", input),
                ))
            }
            None => {
                return Err(StepError::handler(
                    &ctx.action.id,
                    format!("param '{}' is not set", input),
                ))
            }
        };

        let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
            StepError::handler(&ctx.action.id, format!("JSON parse error: {}", e))
        })?;

        let output = ctx.param("output").unwrap_or("parsed");
        ctx.store().set_data(output, parsed);
        Ok(Outcome::Success)
    }
}

/// Stringify a param into run data
pub struct JsonStringifyRunner;

#[async_trait]
impl ActionRunner for JsonStringifyRunner {
    fn metadata(&self) -> RunnerMetadata {
        RunnerMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            properties: vec![
                Prop::new("input", "Input param").required(),
                Prop::new("output", "Output data key").with_default("json"),
            ],
        }
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let input = input_param(ctx)?;
        let value = ctx.store().get_param(input).unwrap_or(Value::Null);

        let json_str = serde_json::to_string_pretty(&value).map_err(|e| {
            StepError::handler(&ctx.action.id, format!("JSON stringify error: {}", e))
        })?;

        let output = ctx.param("output").unwrap_or("json");
        ctx.store().set_data(output, Value::String(json_str));
        Ok(Outcome::Success)
    }
}
