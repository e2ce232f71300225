use async_trait::async_trait;
use flowcore::{Outcome, StepError};
use flowruntime::{ActionContext, ActionRunner, Prop, RunnerMetadata};
use serde_json::Value;

/// Writes the action's params and its predecessor's data to the run log
pub struct DebugRunner;

#[async_trait]
impl ActionRunner for DebugRunner {
    fn metadata(&self) -> RunnerMetadata {
        RunnerMetadata {
            description: "Logs params and predecessor data for debugging".to_string(),
            category: "debug".to_string(),
            properties: vec![Prop::new("message", "Message")],
        }
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let message = ctx.param("message").unwrap_or("(no message)");
        tracing::info!(action = %ctx.action.id, "DEBUG: {}", message);
        ctx.log(format!("DEBUG: {}", message));

        let mut params: Vec<_> = ctx.action.params.iter().collect();
        params.sort();
        for (key, value) in params {
            ctx.log(format!("  {}: {}", key, value));
        }

        let pre = ctx.store().action_data_map(&ctx.token.pre_action_id);
        for (key, value) in &pre {
            ctx.log(format!("  {}.{}: {}", ctx.token.pre_action_id, key, value));
        }

        ctx.record()
            .data
            .insert("message".to_string(), Value::String(message.to_string()));
        Ok(Outcome::Success)
    }
}
