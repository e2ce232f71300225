use async_trait::async_trait;
use flowcore::{Outcome, StepError};
use flowruntime::{ActionContext, ActionRunner, Prop, RunnerMetadata};
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration
pub struct DelayRunner;

#[async_trait]
impl ActionRunner for DelayRunner {
    fn metadata(&self) -> RunnerMetadata {
        RunnerMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            properties: vec![Prop::new("delay_ms", "Delay (ms)").with_default("1000")],
        }
    }

    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Outcome, StepError> {
        let delay_ms = ctx
            .param("delay_ms")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(1000); // Default to 1 second if not specified

        ctx.log(format!("Delaying for {}ms", delay_ms));

        // A halted run leaves this delivery pending for the next one
        let halt = ctx.halt_token();
        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => Ok(Outcome::Success),
            _ = halt.cancelled() => Ok(Outcome::Reject),
        }
    }
}
