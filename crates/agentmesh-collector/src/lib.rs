//! Multi-turn data collection driven by LLM field
//! extraction, with sub-flow nesting via an explicit workflow stack.

mod merge;

pub use merge::merge_extracted;

use agentmesh_core::error::CoreError;
use agentmesh_core::model::{
    ActiveCollector, CollectorDescriptor, CollectorState, SessionContext, WorkflowFrame,
};
use agentmesh_core::ports::{LlmClient, Prompt};
use agentmesh_routing::is_cancel_vocabulary;

/// Result of advancing a collector by one user turn. An explicit tagged
/// variant rather than an exception; the sub-flow case carries a
/// "suspended" marker rather than mutating a step field mid-call.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorOutcome {
    Continue { prompt_text: String },
    Suspended { child_collector: String, prompt_text: String },
    Completed { collected_data: serde_json::Value },
    Cancelled,
}

pub struct CollectorEngine<'a> {
    llm: &'a dyn LlmClient,
    max_step_executions: u32,
}

impl<'a> CollectorEngine<'a> {
    pub fn new(llm: &'a dyn LlmClient, max_step_executions: u32) -> Self {
        Self { llm, max_step_executions }
    }

    /// Starts a new collector for `descriptor`, recording it as the session's
    /// active collector in the `collecting` state.
    pub fn start(&self, ctx: &mut SessionContext, descriptor: &CollectorDescriptor) {
        ctx.active_collector = Some(ActiveCollector {
            name: descriptor.name.clone(),
            state: CollectorState::Collecting,
            asking_for: descriptor.next_missing_required(&ctx.collected_data).map(|f| f.name.clone()),
        });
    }

    /// Advances the active collector by one user turn.
    pub async fn advance(
        &self,
        ctx: &mut SessionContext,
        descriptor: &CollectorDescriptor,
        message: &str,
    ) -> Result<CollectorOutcome, CoreError> {
        if is_cancel_vocabulary(message) {
            if let Some(active) = &mut ctx.active_collector {
                active.state = CollectorState::Cancelled;
            }
            return Ok(CollectorOutcome::Cancelled);
        }

        let state = ctx
            .active_collector
            .as_ref()
            .map(|a| a.state)
            .unwrap_or(CollectorState::Collecting);

        match state {
            CollectorState::AwaitingConfirmation => self.advance_confirmation(ctx, descriptor, message),
            CollectorState::Collecting => self.advance_collecting(ctx, descriptor, message).await,
            CollectorState::Completed => Ok(CollectorOutcome::Completed {
                collected_data: ctx.collected_data.clone(),
            }),
            CollectorState::Cancelled | CollectorState::Failed => Ok(CollectorOutcome::Cancelled),
        }
    }

    fn advance_confirmation(
        &self,
        ctx: &mut SessionContext,
        descriptor: &CollectorDescriptor,
        message: &str,
    ) -> Result<CollectorOutcome, CoreError> {
        let normalized = message.trim().to_lowercase();
        let affirmative = matches!(normalized.as_str(), "yes" | "yeah" | "yep" | "confirm" | "correct");
        if affirmative {
            if let Some(active) = &mut ctx.active_collector {
                active.state = CollectorState::Completed;
            }
            return Ok(CollectorOutcome::Completed {
                collected_data: ctx.collected_data.clone(),
            });
        }
        // A correction: drop back to collecting and let the next extraction
        // pass re-process the message.
        if let Some(active) = &mut ctx.active_collector {
            active.state = CollectorState::Collecting;
        }
        self.recompute_asking_for(ctx, descriptor);
        Ok(CollectorOutcome::Continue {
            prompt_text: "Got it — what would you like to change?".to_string(),
        })
    }

    async fn advance_collecting(
        &self,
        ctx: &mut SessionContext,
        descriptor: &CollectorDescriptor,
        message: &str,
    ) -> Result<CollectorOutcome, CoreError> {
        self.bump_step_counter(ctx, descriptor)?;

        let asking_for = ctx
            .active_collector
            .as_ref()
            .and_then(|a| a.asking_for.clone());
        let extracted = self.extract_fields(ctx, descriptor, asking_for.as_deref(), message).await;

        merge_extracted(&mut ctx.collected_data, &extracted, &descriptor.fields);

        if let Some(next_missing) = descriptor.next_missing_required(&ctx.collected_data) {
            if let Some(child) = &next_missing.child_flow {
                let field_name = next_missing.name.clone();
                let resolved = ctx
                    .collected_data
                    .get(&field_name)
                    .map(|v| !v.is_null())
                    .unwrap_or(false);
                if !resolved {
                    ctx.push_frame(WorkflowFrame {
                        workflow: descriptor.name.clone(),
                        step: field_name.clone(),
                        collected_data: ctx.collected_data.clone(),
                        parent_step: field_name.clone(),
                        step_prefix: Some(format!("{}.{}", descriptor.name, field_name)),
                    });
                    return Ok(CollectorOutcome::Suspended {
                        child_collector: child.clone(),
                        prompt_text: format!("Let's fill in {field_name} first."),
                    });
                }
            }
            self.recompute_asking_for(ctx, descriptor);
            return Ok(CollectorOutcome::Continue {
                prompt_text: next_missing.prompt.clone(),
            });
        }

        if let Some(active) = &mut ctx.active_collector {
            active.state = CollectorState::AwaitingConfirmation;
            active.asking_for = None;
        }
        Ok(CollectorOutcome::Continue {
            prompt_text: "Here's what I have — shall I go ahead?".to_string(),
        })
    }

    /// Pops the suspended parent frame, copies the resolved child entity id
    /// into the parent's `collected_data` under the field that launched the
    /// sub-flow, and restores the parent as the session's active collector
    /// so the next turn re-evaluates it rather than re-asking the same field.
    pub fn resume_parent(
        &self,
        ctx: &mut SessionContext,
        resolved_entity_id: &str,
        parent_descriptor: &CollectorDescriptor,
    ) -> Option<WorkflowFrame> {
        let frame = ctx.pop_frame()?;
        let mut collected_data = frame.collected_data.clone();
        if let Some(obj) = collected_data.as_object_mut() {
            obj.insert(frame.parent_step.clone(), serde_json::Value::String(resolved_entity_id.to_string()));
        }
        ctx.collected_data = collected_data;
        ctx.active_collector = Some(ActiveCollector {
            name: frame.workflow.clone(),
            state: CollectorState::Collecting,
            asking_for: parent_descriptor.next_missing_required(&ctx.collected_data).map(|f| f.name.clone()),
        });
        Some(frame)
    }

    fn recompute_asking_for(&self, ctx: &mut SessionContext, descriptor: &CollectorDescriptor) {
        let next = descriptor.next_missing_required(&ctx.collected_data).map(|f| f.name.clone());
        if let Some(active) = &mut ctx.active_collector {
            active.asking_for = next;
        }
    }

    fn bump_step_counter(&self, ctx: &mut SessionContext, descriptor: &CollectorDescriptor) -> Result<(), CoreError> {
        let step = ctx
            .active_collector
            .as_ref()
            .and_then(|a| a.asking_for.clone())
            .unwrap_or_else(|| "start".to_string());
        let key = format!("{}/{step}", descriptor.name);
        let count = ctx.step_execution_counts.entry(key).or_insert(0);
        *count += 1;
        if *count > self.max_step_executions {
            if let Some(active) = &mut ctx.active_collector {
                active.state = CollectorState::Failed;
            }
            return Err(CoreError::StepLoopExceeded {
                workflow: descriptor.name.clone(),
                step,
                limit: self.max_step_executions,
            });
        }
        Ok(())
    }

    async fn extract_fields(
        &self,
        ctx: &SessionContext,
        descriptor: &CollectorDescriptor,
        asking_for: Option<&str>,
        message: &str,
    ) -> serde_json::Value {
        let prompt = Prompt::new(format!(
            "Already collected: {}\nCurrently asking for: {}\nField schema: {:?}\n\
             Merge rules: scalars overwrite; arrays-of-objects merge by a human key; \
             a `<field>_remove` key drops matching items.\nUser message: {message}\n\n\
             Respond with strict JSON containing only the fields you can confidently extract.",
            ctx.collected_data,
            asking_for.unwrap_or("(nothing specific)"),
            descriptor.fields,
        ));

        match self.llm.complete(prompt).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or(serde_json::Value::Object(Default::default())),
            Err(_) => serde_json::Value::Object(Default::default()),
        }
    }
}
