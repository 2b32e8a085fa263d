//! Bounded pool of workflow runs.
//!
//! Runs of the same workflow never overlap: each workflow id has a FIFO lane
//! and later dispatches queue behind the running one. A global semaphore
//! caps how many runs execute at once across all workflows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runner::ExecutionRunner;
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{TriggerSource, WorkflowExecution};
use crate::workflow::Context;

type Lane = Arc<AsyncMutex<()>>;

#[derive(Clone)]
pub struct RunPool {
    runner: ExecutionRunner,
    permits: Arc<Semaphore>,
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
    in_flight: Arc<Mutex<HashMap<String, Vec<JoinHandle<()>>>>>,
    shutdown: ShutdownCoordinator,
}

impl RunPool {
    pub fn new(runner: ExecutionRunner, max_concurrent_runs: usize, shutdown: ShutdownCoordinator) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    fn lane(&self, workflow_id: &str) -> Lane {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.entry(workflow_id.to_string()).or_default().clone()
    }

    /// Queue a run in the background.
    ///
    /// Returns `false` when the pool is shutting down and the run was rejected.
    pub fn dispatch(&self, workflow_id: &str, context: Context, source: TriggerSource) -> bool {
        if self.shutdown.is_shutdown_requested() {
            warn!(workflow_id, "Engine is stopping, rejecting {} run", source);
            return false;
        }

        let pool = self.clone();
        let id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            pool.run_in_lane(&id, context, source).await;
        });
        self.track(workflow_id, handle);
        true
    }

    /// Run in the workflow's lane and wait for the result.
    ///
    /// The run is tracked like a dispatched one, so `is_busy` and `join` see
    /// it; dropping the returned future leaves it running.
    pub async fn run_now(
        &self,
        workflow_id: &str,
        context: Context,
        source: TriggerSource,
    ) -> Option<WorkflowExecution> {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        let id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            let _ = tx.send(pool.run_in_lane(&id, context, source).await);
        });
        self.track(workflow_id, handle);

        match rx.await {
            Ok(execution) => execution,
            Err(_) => {
                warn!(workflow_id, "Run task ended without a result");
                None
            }
        }
    }

    fn track(&self, workflow_id: &str, handle: JoinHandle<()>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let handles = in_flight.entry(workflow_id.to_string()).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        debug!(workflow_id, queued = handles.len(), "Run tracked");
    }

    async fn run_in_lane(
        &self,
        workflow_id: &str,
        context: Context,
        source: TriggerSource,
    ) -> Option<WorkflowExecution> {
        let lane = self.lane(workflow_id);
        let _turn = lane.lock().await;
        if self.shutdown.is_shutdown_requested() {
            info!(workflow_id, "Dropping queued run, engine is stopping");
            return None;
        }

        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return None;
        };
        if self.shutdown.is_shutdown_requested() {
            info!(workflow_id, "Dropping queued run, engine is stopping");
            return None;
        }

        self.runner.run(workflow_id, context, source).await
    }

    /// Whether a run of `workflow_id` is queued or running.
    pub fn is_busy(&self, workflow_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight
            .get(workflow_id)
            .is_some_and(|handles| handles.iter().any(|h| !h.is_finished()))
    }

    /// Number of dispatched runs not yet finished.
    pub fn active_runs(&self) -> usize {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight
            .values()
            .flatten()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for dispatched runs, giving each at most `timeout`.
    ///
    /// Runs still going after their timeout are left running detached.
    pub async fn join(&self, timeout: Duration) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight
                .drain()
                .flat_map(|(id, handles)| handles.into_iter().map(move |h| (id.clone(), h)))
                .filter(|(_, h)| !h.is_finished())
                .collect()
        };

        if handles.is_empty() {
            return;
        }
        info!("Waiting for {} in-flight runs", handles.len());

        for (workflow_id, handle) in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(workflow_id, "Run task ended abnormally: {}", e),
                Err(_) => warn!(
                    workflow_id,
                    "Run did not finish within {:?}, leaving it detached", timeout
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::collaborators::ContentExtractor;
    use crate::error::Result;
    use crate::steps::testing::services;
    use crate::steps::StepRegistry;
    use crate::storage::{ExecutionStatus, SqliteStorage, WorkflowDefinition};
    use crate::workflow::TriggerType;

    /// Sleeps on every call and tracks peak concurrency.
    struct SlowExtractor {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ContentExtractor for SlowExtractor {
        async fn extract(&self, _url: &str) -> Result<String> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok("done".into())
        }
    }

    async fn setup(delay: Duration, max: usize) -> (SqliteStorage, RunPool, Arc<SlowExtractor>, String) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let extractor = Arc::new(SlowExtractor {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut services = services(storage.clone());
        services.extractor = extractor.clone();

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: "wf".into(),
            name: "scrape".into(),
            description: String::new(),
            steps: vec![json!({"type": "web_scrape", "url": "https://example.com"})],
            schedule: None,
            trigger_type: TriggerType::Manual,
            trigger_config: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        storage.create_workflow(&definition).await.unwrap();

        let runner = ExecutionRunner::new(StepRegistry::new(services));
        let pool = RunPool::new(runner, max, ShutdownCoordinator::new());
        (storage, pool, extractor, definition.id)
    }

    #[tokio::test]
    async fn test_runs_of_one_workflow_do_not_overlap() {
        let (storage, pool, extractor, id) = setup(Duration::from_millis(30), 4).await;

        for _ in 0..3 {
            assert!(pool.dispatch(&id, Context::new(), TriggerSource::Manual));
        }
        assert!(pool.is_busy(&id));
        pool.join(Duration::from_secs(5)).await;

        assert_eq!(extractor.peak.load(Ordering::SeqCst), 1);
        let executions = storage.list_executions(&id, 10).await.unwrap();
        assert_eq!(executions.len(), 3);
        assert!(executions
            .iter()
            .all(|e| e.status == ExecutionStatus::Completed));
        assert!(!pool.is_busy(&id));
    }

    #[tokio::test]
    async fn test_dispatch_rejected_while_stopping() {
        let (_storage, pool, _extractor, id) = setup(Duration::ZERO, 2).await;
        pool.shutdown.request_shutdown();
        assert!(!pool.dispatch(&id, Context::new(), TriggerSource::Manual));
        assert_eq!(pool.active_runs(), 0);
    }

    #[tokio::test]
    async fn test_queued_runs_dropped_on_shutdown() {
        let (storage, pool, _extractor, id) = setup(Duration::from_millis(100), 2).await;

        assert!(pool.dispatch(&id, Context::new(), TriggerSource::Manual));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.dispatch(&id, Context::new(), TriggerSource::Manual));

        pool.shutdown.request_shutdown();
        pool.join(Duration::from_secs(5)).await;

        let executions = storage.list_executions(&id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_now_counts_as_busy() {
        let (storage, pool, _extractor, id) = setup(Duration::from_millis(150), 2).await;

        let waiter = {
            let pool = pool.clone();
            let id = id.clone();
            tokio::spawn(async move { pool.run_now(&id, Context::new(), TriggerSource::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pool.is_busy(&id));
        assert_eq!(pool.active_runs(), 1);

        let execution = waiter.await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        pool.join(Duration::from_secs(5)).await;
        assert!(!pool.is_busy(&id));
        assert_eq!(storage.list_executions(&id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_join_waits_for_abandoned_run_now() {
        let (storage, pool, _extractor, id) = setup(Duration::from_millis(100), 2).await;

        let waiter = {
            let pool = pool.clone();
            let id = id.clone();
            tokio::spawn(async move { pool.run_now(&id, Context::new(), TriggerSource::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();

        pool.join(Duration::from_secs(5)).await;
        let executions = storage.list_executions(&id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_join_leaves_stragglers_detached() {
        let (_storage, pool, _extractor, id) = setup(Duration::from_millis(500), 2).await;
        assert!(pool.dispatch(&id, Context::new(), TriggerSource::Manual));

        let started = std::time::Instant::now();
        pool.join(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
