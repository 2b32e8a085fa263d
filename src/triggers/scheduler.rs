//! Scheduler loop.
//!
//! Polls the trigger evaluator on a fixed interval and hands due runs to
//! the run pool. A failure evaluating one workflow is logged and the rest
//! of the tick continues.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::evaluator::TriggerEvaluator;
use crate::engine::RunPool;
use crate::error::Result;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{SqliteStorage, TriggerSource, WorkflowDefinition};
use crate::workflow::Context;

/// Runs counted in one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub scheduled: usize,
    pub events: usize,
    pub errors: usize,
}

pub struct Scheduler {
    storage: SqliteStorage,
    evaluator: TriggerEvaluator,
    pool: RunPool,
    shutdown: ShutdownCoordinator,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        storage: SqliteStorage,
        pool: RunPool,
        shutdown: ShutdownCoordinator,
        poll_interval: Duration,
    ) -> Self {
        Self {
            evaluator: TriggerEvaluator::new(storage.clone()),
            storage,
            pool,
            shutdown,
            poll_interval,
        }
    }

    /// Tick until shutdown is requested.
    pub async fn run(self) {
        info!(
            "Scheduler started (polling every {}s)",
            self.poll_interval.as_secs()
        );
        while !self.shutdown.is_shutdown_requested() {
            self.tick(Utc::now()).await;
            if !self.shutdown.sleep(self.poll_interval).await {
                break;
            }
        }
        info!("Scheduler stopped");
    }

    /// Evaluate every active workflow once and dispatch what is due.
    #[instrument(name = "scheduler.tick", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let definitions = match self.storage.list_active_workflows().await {
            Ok(definitions) => definitions,
            Err(e) => {
                error!("Failed to load active workflows: {}", e);
                summary.errors += 1;
                return summary;
            }
        };

        for definition in &definitions {
            match self.dispatch_scheduled(definition, now).await {
                Ok(true) => summary.scheduled += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.errors += 1;
                    error!(
                        workflow_id = %definition.id,
                        "Schedule evaluation failed for '{}': {}", definition.name, e
                    );
                }
            }

            match self.dispatch_events(definition, now).await {
                Ok(fired) => summary.events += fired,
                Err(e) => {
                    summary.errors += 1;
                    error!(
                        workflow_id = %definition.id,
                        "Event evaluation failed for '{}': {}", definition.name, e
                    );
                }
            }
        }

        debug!(?summary, "Scheduler tick complete");
        summary
    }

    async fn dispatch_scheduled(&self, definition: &WorkflowDefinition, now: DateTime<Utc>) -> Result<bool> {
        if self.pool.is_busy(&definition.id) {
            debug!(workflow_id = %definition.id, "Previous run still in flight, skipping schedule");
            return Ok(false);
        }
        if !self.evaluator.is_time_due(definition, now).await? {
            return Ok(false);
        }

        info!("Workflow '{}' is due", definition.name);
        Ok(self
            .pool
            .dispatch(&definition.id, Context::new(), TriggerSource::Schedule))
    }

    async fn dispatch_events(&self, definition: &WorkflowDefinition, now: DateTime<Utc>) -> Result<usize> {
        let Some(pending) = self.evaluator.pending_events(definition, now).await? else {
            return Ok(0);
        };
        let contexts = pending.contexts;

        let mut accepted = 0;
        for context in contexts.iter().cloned() {
            if self
                .pool
                .dispatch(&definition.id, context, TriggerSource::Event)
            {
                accepted += 1;
            }
        }

        if accepted == contexts.len() {
            self.evaluator
                .advance_checkpoint(&definition.id, &pending.checkpoint)
                .await?;
        } else {
            warn!(
                workflow_id = %definition.id,
                "{} of {} event runs rejected, keeping checkpoint",
                contexts.len() - accepted,
                contexts.len()
            );
        }
        if accepted > 0 {
            info!(
                "Fired {} event run(s) for workflow '{}'",
                accepted, definition.name
            );
        }
        Ok(accepted)
    }
}
