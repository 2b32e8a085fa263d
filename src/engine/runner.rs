//! Execution runner: drives one workflow run step by step.

use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, instrument, warn, Span};

use crate::error::Result;
use crate::metrics;
use crate::steps::StepRegistry;
use crate::storage::{ExecutionStatus, SqliteStorage, TriggerSource, WorkflowExecution, WorkflowStep};
use crate::workflow::{merge_context, step_kind, Context};

/// Runs workflow executions against the store.
#[derive(Clone)]
pub struct ExecutionRunner {
    registry: StepRegistry,
    storage: SqliteStorage,
}

impl ExecutionRunner {
    pub fn new(registry: StepRegistry) -> Self {
        let storage = registry.services().storage.clone();
        Self { registry, storage }
    }

    /// Run a workflow to completion or first failure.
    ///
    /// Never returns an error: step failures end up on the execution and step
    /// records, and store failures are logged here. Returns the final
    /// execution record when one was created.
    #[instrument(
        name = "workflow.run",
        skip(self, initial_context),
        fields(
            workflow_id = %workflow_id,
            trigger = %source,
            execution_id = tracing::field::Empty,
        )
    )]
    pub async fn run(
        &self,
        workflow_id: &str,
        initial_context: Context,
        source: TriggerSource,
    ) -> Option<WorkflowExecution> {
        metrics::inc_active_runs();
        let started = Instant::now();

        let outcome = self.try_run(workflow_id, initial_context, source).await;

        metrics::dec_active_runs();
        match outcome {
            Ok(Some(execution)) => {
                metrics::record_run(
                    &execution.status.to_string(),
                    &source.to_string(),
                    started.elapsed(),
                );
                Some(execution)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Workflow run aborted by storage failure: {}", e);
                metrics::record_run("aborted", &source.to_string(), started.elapsed());
                None
            }
        }
    }

    async fn try_run(
        &self,
        workflow_id: &str,
        initial_context: Context,
        source: TriggerSource,
    ) -> Result<Option<WorkflowExecution>> {
        let Some(definition) = self.storage.get_workflow(workflow_id).await? else {
            warn!("Workflow {} not found, skipping run", workflow_id);
            return Ok(None);
        };

        let mut execution = WorkflowExecution {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            trigger_source: source,
            context: initial_context,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.storage.save_execution(&execution).await?;
        Span::current().record("execution_id", execution.id.as_str());

        info!(
            "Starting execution {} of workflow '{}' ({} steps)",
            execution.id,
            definition.name,
            definition.steps.len()
        );

        if let Err(e) = self.run_steps(&definition.steps, &mut execution).await {
            error!("Execution {} aborted: {}", execution.id, e);
            execution.status = ExecutionStatus::Failed;
            execution.finished_at = Some(Utc::now());
            execution.error = Some(e.to_string());
            if let Err(save_err) = self.storage.save_execution(&execution).await {
                error!(
                    "Could not mark execution {} failed: {}",
                    execution.id, save_err
                );
            }
        }
        Ok(Some(execution))
    }

    /// Run the steps in order, stopping at the first failure.
    ///
    /// Step failures are recorded and end the run with `Ok`; an `Err` means
    /// the store could not record progress and the caller must close the
    /// execution itself.
    async fn run_steps(&self, steps: &[Value], execution: &mut WorkflowExecution) -> Result<()> {
        for (index, raw) in steps.iter().enumerate() {
            let mut step = WorkflowStep {
                id: uuid::Uuid::new_v4().to_string(),
                execution_id: execution.id.clone(),
                step_number: index as u32 + 1,
                step_type: step_type(raw),
                status: ExecutionStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                result: None,
                error: None,
            };
            self.storage.save_step(&step).await?;

            match self.registry.execute(raw, &execution.context).await {
                Ok(update) => {
                    step.status = ExecutionStatus::Completed;
                    step.finished_at = Some(Utc::now());
                    step.result = Some(Value::Object(update.clone()));
                    merge_context(&mut execution.context, update);

                    self.storage.record_step_outcome(&step, execution).await?;
                    metrics::record_step(&step.step_type, "completed");
                    info!("Step {} [{}] completed", step.step_number, step.step_type);
                }
                Err(e) => {
                    let message = e.to_string();
                    let now = Utc::now();

                    step.status = ExecutionStatus::Failed;
                    step.finished_at = Some(now);
                    step.error = Some(message.clone());

                    execution.status = ExecutionStatus::Failed;
                    execution.finished_at = Some(now);
                    execution.error = Some(message);

                    metrics::record_step(&step.step_type, "failed");
                    error!(
                        code = e.code(),
                        "Step {} [{}] failed: {}", step.step_number, step.step_type, e
                    );
                    return self.storage.record_step_outcome(&step, execution).await;
                }
            }
        }

        execution.status = ExecutionStatus::Completed;
        execution.finished_at = Some(Utc::now());
        self.storage.save_execution(execution).await?;

        info!("Execution {} completed", execution.id);
        Ok(())
    }
}

/// Kind recorded on the step row, even when the step cannot be parsed.
fn step_type(raw: &Value) -> String {
    step_kind(raw)
        .map(str::to_string)
        .unwrap_or_else(|_| "unknown".to_string())
}
