use async_trait::async_trait;
use flowcore::{Outcome, StepError};
use flowruntime::{ActionContext, ActionRunner, Prop, RunnerMetadata};

/// Runs the script held in the action's `script` param
pub struct ScriptRunner;

#[async_trait]
impl ActionRunner for ScriptRunner {
    fn metadata(&self) -> RunnerMetadata {
        RunnerMetadata {
            description: "Evaluate a script; its return value decides the outcome".to_string(),
            category: "script".to_string(),
            properties: vec![Prop::new("script", "Script")],
        }
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let Some(script) = ctx.param("script") else {
            return Ok(Outcome::Success);
        };
        let value = ctx.evaluate(script).await?;
        Ok(Outcome::from_value(&value))
    }
}
