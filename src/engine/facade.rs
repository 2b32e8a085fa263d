//! Engine facade: lifecycle and workflow management entry points.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::pool::RunPool;
use super::rate_limiter::{RateLimitConfig, TargetRateLimiter};
use super::runner::ExecutionRunner;
use crate::collaborators::{ChatOracle, HttpContentExtractor, HttpQueryDispatcher};
use crate::config::{Config, EngineConfig};
use crate::error::{Error, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::steps::{StepRegistry, StepServices};
use crate::storage::{
    ExecutionTrace, SqliteStorage, TriggerSource, WorkflowDefinition, WorkflowExecution,
    WorkflowStep, WorkflowUpdate,
};
use crate::triggers::Scheduler;
use crate::workflow::{
    validate_definition, Context, DefinitionDraft, EventTriggerConfig, Schedule, TriggerType,
};

/// The workflow engine.
///
/// Owns the store, the run pool and the scheduler task. `start` and `stop`
/// are idempotent; calling either in the wrong state is logged and ignored.
pub struct WorkflowEngine {
    storage: SqliteStorage,
    pool: RunPool,
    shutdown: ShutdownCoordinator,
    poll_interval: Duration,
    stop_timeout: Duration,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(services: StepServices, config: &EngineConfig) -> Self {
        let storage = services.storage.clone();
        let shutdown = ShutdownCoordinator::new();
        let runner = ExecutionRunner::new(StepRegistry::new(services));
        let pool = RunPool::new(runner, config.max_concurrent_runs, shutdown.clone());

        Self {
            storage,
            pool,
            shutdown,
            poll_interval: config.poll_interval(),
            stop_timeout: config.stop_timeout(),
            scheduler: Mutex::new(None),
        }
    }

    /// Build an engine with the HTTP collaborators described by `config`.
    pub fn from_config(config: &Config, storage: SqliteStorage) -> Result<Self> {
        let services = StepServices {
            storage,
            dispatcher: Arc::new(HttpQueryDispatcher::new(Duration::from_secs(
                config.query.timeout_seconds,
            ))),
            oracle: Arc::new(ChatOracle::new(&config.oracle)),
            extractor: Arc::new(HttpContentExtractor::new(Duration::from_secs(
                config.scraper.timeout_seconds,
            ))?),
            rate_limiter: TargetRateLimiter::new(RateLimitConfig::per_minute(
                config.query.requests_per_minute,
            )),
            call_delay: Duration::from_millis(config.query.call_delay_ms),
        };
        Ok(Self::new(services, &config.engine))
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Start the scheduler loop.
    pub async fn start(&self) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Workflow engine is already running");
            return;
        }

        self.shutdown.reset();
        let loop_ = Scheduler::new(
            self.storage.clone(),
            self.pool.clone(),
            self.shutdown.clone(),
            self.poll_interval,
        );
        *scheduler = Some(tokio::spawn(loop_.run()));
        info!("Workflow engine started");
    }

    /// Stop the scheduler and wait for in-flight runs.
    ///
    /// Each run gets the configured stop timeout; runs still going after that
    /// keep running detached. Without a running scheduler this only waits
    /// for runs queued through `execute_workflow` and leaves the engine
    /// accepting new ones.
    pub async fn stop(&self) {
        let Some(handle) = self.scheduler.lock().await.take() else {
            warn!("Workflow engine is not running, waiting for manual runs only");
            self.pool.join(self.stop_timeout).await;
            return;
        };

        info!("Stopping workflow engine");
        self.shutdown.request_shutdown();
        if let Err(e) = handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        self.pool.join(self.stop_timeout).await;
        info!("Workflow engine stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Number of dispatched runs not yet finished.
    pub fn active_runs(&self) -> usize {
        self.pool.active_runs()
    }

    /// Validate and store a new workflow definition.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: &str,
        steps: Vec<Value>,
        schedule: Option<Schedule>,
        trigger_type: Option<TriggerType>,
        trigger_config: Option<EventTriggerConfig>,
    ) -> Result<WorkflowDefinition> {
        let trigger_type = trigger_type.unwrap_or_default();
        validate_definition(&DefinitionDraft {
            name,
            steps: &steps,
            schedule: schedule.as_ref(),
            trigger_type,
            trigger_config: trigger_config.as_ref(),
        })?;

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description: description.to_string(),
            steps,
            schedule,
            trigger_type,
            trigger_config,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_workflow(&definition).await?;
        info!("Created workflow '{}' ({})", definition.name, definition.id);
        Ok(definition)
    }

    /// Queue one manual run outside the schedule.
    ///
    /// Returns `false` if the engine is stopping and the run was rejected.
    pub fn execute_workflow(&self, workflow_id: &str, context: Context) -> bool {
        self.pool.dispatch(workflow_id, context, TriggerSource::Manual)
    }

    /// Run a workflow now and wait for its final record.
    pub async fn run_now(&self, workflow_id: &str, context: Context) -> Result<WorkflowExecution> {
        if self.storage.get_workflow(workflow_id).await?.is_none() {
            return Err(Error::NotFound(format!("Workflow {}", workflow_id)));
        }
        self.pool
            .run_now(workflow_id, context, TriggerSource::Manual)
            .await
            .ok_or_else(|| Error::Execution(format!("Run of workflow {} did not start", workflow_id)))
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        self.storage.get_workflow(id).await
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.storage.list_workflows().await
    }

    /// Apply `update` to a stored definition, re-validating the result.
    pub async fn update_workflow(&self, id: &str, update: WorkflowUpdate) -> Result<WorkflowDefinition> {
        let mut definition = self
            .storage
            .get_workflow(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Workflow {}", id)))?;

        update.apply(&mut definition);
        validate_definition(&DefinitionDraft {
            name: &definition.name,
            steps: &definition.steps,
            schedule: definition.schedule.as_ref(),
            trigger_type: definition.trigger_type,
            trigger_config: definition.trigger_config.as_ref(),
        })?;

        definition.updated_at = Utc::now();
        self.storage.update_workflow(&definition).await?;
        Ok(definition)
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<WorkflowDefinition> {
        self.update_workflow(
            id,
            WorkflowUpdate {
                is_active: Some(active),
                ..WorkflowUpdate::default()
            },
        )
        .await
    }

    /// Delete a definition with its executions. Returns whether it existed.
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        self.storage.delete_workflow(id).await
    }

    pub async fn list_executions(&self, workflow_id: &str, limit: usize) -> Result<Vec<WorkflowExecution>> {
        self.storage.list_executions(workflow_id, limit).await
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        self.storage.get_execution(id).await
    }

    pub async fn get_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStep>> {
        self.storage.list_steps(execution_id).await
    }

    pub async fn get_trace(&self, execution_id: &str) -> Result<Option<ExecutionTrace>> {
        self.storage.get_execution_trace(execution_id).await
    }
}
