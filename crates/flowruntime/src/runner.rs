use crate::registry::{ActionContext, ActionRegistry};
use crate::script::{
    RhaiEvaluator, ScriptError, ScriptEvaluator, ScriptScope, SharedActionState, SharedLinkState,
};
use crate::session::Session;
use flowcore::{ActionToken, LinkToken, LogLevel, LogScope, Outcome, Stage, StepError};
use serde_json::Value;
use std::sync::Arc;

/// Runs the action and link protocols: guard, iteration, dispatch, scripts.
pub struct FlowRunner {
    registry: Arc<ActionRegistry>,
    evaluator: Arc<dyn ScriptEvaluator>,
}

impl FlowRunner {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self::builder().registry(registry).build()
    }

    pub fn builder() -> FlowRunnerBuilder {
        FlowRunnerBuilder::default()
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Evaluate a script on the blocking pool. An empty source yields `null`.
    pub async fn evaluate(&self, source: &str, scope: ScriptScope) -> Result<Value, ScriptError> {
        if source.trim().is_empty() {
            return Ok(Value::Null);
        }

        let evaluator = self.evaluator.clone();
        let source = source.to_string();
        tokio::task::spawn_blocking(move || evaluator.evaluate(&source, &scope))
            .await
            .map_err(|e| ScriptError::Join(e.to_string()))?
    }

    async fn guard(&self, source: &str, scope: ScriptScope) -> Result<Outcome, StepError> {
        let value = self
            .evaluate(source, scope)
            .await
            .map_err(|e| StepError::Script {
                stage: Stage::Filter,
                message: e.to_string(),
            })?;
        match Outcome::from_value(&value) {
            Outcome::Failure => Err(StepError::Declined {
                stage: Stage::Filter,
            }),
            outcome => Ok(outcome),
        }
    }

    /// Execute one action delivery.
    ///
    /// `Ok(Reject)` leaves the delivery pending; `Err` means FAILURE and
    /// names the stage that failed.
    pub async fn execute_action(
        &self,
        session: &Session,
        token: &ActionToken,
        state: &SharedActionState,
    ) -> Result<Outcome, StepError> {
        let store = session.store();
        let action = session
            .flow()
            .action(&token.action_id)
            .ok_or_else(|| StepError::ActionNotFound(token.action_id.clone()))?;
        let scope = || ScriptScope::action(store.clone(), token, state.clone());

        if !action.script_before.trim().is_empty() {
            let outcome = self.guard(&action.script_before, scope()).await?;
            if outcome != Outcome::Success {
                tracing::debug!(action = %action.id, "guard returned {}", outcome);
                return Ok(outcome);
            }
        }

        let items = if action.iterator_list.is_empty() {
            Vec::new()
        } else {
            iteration_items(
                store.get_param(&action.iterator_list).as_ref(),
                &action.iterator_list,
            )
        };

        match self.registry.resolve(&action.name) {
            Some(runner) => {
                let ctx = ActionContext {
                    session,
                    token,
                    action,
                    state,
                };
                let passes = items.len().max(1);

                for index in 0..passes {
                    if let Some(item) = items.get(index) {
                        if !action.iterator_item.is_empty() {
                            store.set_param(&action.iterator_item, item.clone());
                        }
                    }

                    let error = match runner.execute(&ctx).await {
                        Ok(Outcome::Success) => continue,
                        Ok(Outcome::Reject) => return Ok(Outcome::Reject),
                        Ok(Outcome::Failure) => {
                            StepError::handler(&action.id, "runner returned failure")
                        }
                        Err(e) => e,
                    };

                    store.log(
                        LogLevel::Error,
                        LogScope::Action,
                        &action.name,
                        &action.title,
                        error.to_string(),
                    );
                    if !action.script_error.trim().is_empty() {
                        if let Err(e) = self.evaluate(&action.script_error, scope()).await {
                            tracing::warn!(action = %action.id, "error script failed: {}", e);
                            store.log(
                                LogLevel::Error,
                                LogScope::Action,
                                &action.name,
                                &action.title,
                                format!("{} script failed: {}", Stage::Error, e),
                            );
                        }
                    }
                    return Err(error);
                }
            }
            None => {
                tracing::debug!(action = %action.id, "no runner for {:?}, passing through", action.name);
            }
        }

        if !action.script_after.trim().is_empty() {
            let value = self
                .evaluate(&action.script_after, scope())
                .await
                .map_err(|e| StepError::Script {
                    stage: Stage::After,
                    message: e.to_string(),
                })?;
            return match Outcome::from_value(&value) {
                Outcome::Failure => Err(StepError::Declined {
                    stage: Stage::After,
                }),
                outcome => Ok(outcome),
            };
        }

        Ok(Outcome::Success)
    }

    /// Execute one link delivery. A link without a filter always passes.
    pub async fn execute_link(
        &self,
        session: &Session,
        token: &LinkToken,
        state: &SharedLinkState,
    ) -> Result<Outcome, StepError> {
        let link = session
            .flow()
            .link(&token.source_id, &token.target_id)
            .ok_or_else(|| {
                StepError::LinkNotFound(token.source_id.clone(), token.target_id.clone())
            })?;

        if link.filter.trim().is_empty() {
            return Ok(Outcome::Success);
        }

        let scope = ScriptScope::link(session.store().clone(), token, state.clone());
        self.guard(&link.filter, scope).await
    }
}

#[derive(Default)]
pub struct FlowRunnerBuilder {
    registry: Option<Arc<ActionRegistry>>,
    evaluator: Option<Arc<dyn ScriptEvaluator>>,
}

impl FlowRunnerBuilder {
    pub fn registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Missing parts default to an empty registry and [`RhaiEvaluator`].
    pub fn build(self) -> FlowRunner {
        FlowRunner {
            registry: self.registry.unwrap_or_default(),
            evaluator: self
                .evaluator
                .unwrap_or_else(|| Arc::new(RhaiEvaluator::new())),
        }
    }
}

/// Items an action iterates over, read from the iterator-list param.
///
/// An empty result means one pass without binding an item.
pub fn iteration_items(param: Option<&Value>, list_name: &str) -> Vec<Value> {
    match param {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map.values().cloned().collect(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            Ok(Value::Object(map)) => map.into_values().collect(),
            _ if raw.is_empty() => Vec::new(),
            _ => vec![Value::String(raw.clone())],
        },
        Some(_) => Vec::new(),
        None => match serde_json::from_str::<Value>(list_name) {
            Ok(Value::Array(items)) => items,
            _ => Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn iterates_native_and_encoded_lists() {
        assert_eq!(iteration_items(Some(&json!([1, 2])), "items"), vec![json!(1), json!(2)]);
        assert_eq!(
            iteration_items(Some(&json!("[\"a\",\"b\"]")), "items"),
            vec![json!("a"), json!("b")]
        );
        assert_eq!(
            iteration_items(Some(&json!({"x": 1, "y": 2})), "items"),
            vec![json!(1), json!(2)]
        );
    }

    #[test]
    fn falls_back_to_single_values() {
        assert_eq!(
            iteration_items(Some(&json!("plain")), "items"),
            vec![json!("plain")]
        );
        assert!(iteration_items(Some(&json!("")), "items").is_empty());
        assert!(iteration_items(Some(&json!(7)), "items").is_empty());
        assert!(iteration_items(None, "items").is_empty());
        assert_eq!(iteration_items(None, "[3, 4]"), vec![json!(3), json!(4)]);
    }
}
