//! Trigger evaluation: which workflows are due, and which records fire events.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::storage::{EventCheckpoint, EventCursor, SqliteStorage, WorkflowDefinition};
use crate::workflow::{Context, Schedule, TriggerType, WatchedKind};

/// Whether a schedule is due given the start of its last execution.
///
/// A workflow that never ran is due immediately. A next run time past the
/// representable range is never due.
pub fn is_due(
    schedule: &Schedule,
    last_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(last) = last_start else {
        return Ok(true);
    };
    let period = schedule.period()?;
    Ok(last
        .checked_add_signed(period)
        .is_some_and(|next| now >= next))
}

/// Event runs found for one workflow, and the checkpoint that marks them handled.
#[derive(Debug, Clone)]
pub struct PendingEvents {
    pub contexts: Vec<Context>,
    pub checkpoint: EventCheckpoint,
}

/// Evaluates time and event triggers against the store.
#[derive(Clone)]
pub struct TriggerEvaluator {
    storage: SqliteStorage,
}

impl TriggerEvaluator {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Whether `definition` is due on its schedule at `now`.
    ///
    /// Inactive definitions and definitions without a schedule never are.
    pub async fn is_time_due(&self, definition: &WorkflowDefinition, now: DateTime<Utc>) -> Result<bool> {
        let Some(schedule) = definition.schedule.as_ref().filter(|_| definition.is_active) else {
            return Ok(false);
        };
        let last_start = self.storage.latest_execution_start(&definition.id).await?;
        is_due(schedule, last_start, now)
    }

    /// Initial contexts for every record matching the event trigger of
    /// `definition` inserted since its last check.
    ///
    /// A workflow never checked before sees records stamped after its
    /// creation. `None` for definitions that are inactive or not
    /// event-triggered.
    pub async fn pending_events(
        &self,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingEvents>> {
        if !definition.is_active || definition.trigger_type != TriggerType::Event {
            return Ok(None);
        }
        let Some(config) = definition.trigger_config.as_ref() else {
            return Ok(None);
        };

        let previous = self.storage.get_checkpoint(&definition.id).await?;
        let mut checkpoint = previous.clone().unwrap_or(EventCheckpoint {
            checked_at: definition.created_at,
            case_seq: None,
            data_point_seq: None,
        });
        let since = checkpoint.checked_at;
        let cursor = move |seq: Option<i64>| match seq {
            Some(seq) => EventCursor::After(seq),
            None => EventCursor::CreatedAfter(since),
        };

        let contexts: Vec<Context> = match config.watch {
            WatchedKind::NewCase => {
                let batch = self.storage.new_cases(cursor(checkpoint.case_seq)).await?;
                checkpoint.case_seq = Some(batch.high_water);
                batch
                    .records
                    .into_iter()
                    .map(|case| {
                        let mut ctx = Context::new();
                        ctx.insert("case_id".into(), Value::String(case.id));
                        ctx
                    })
                    .collect()
            }
            WatchedKind::NewDatapoint => {
                let batch = self
                    .storage
                    .new_data_points(cursor(checkpoint.data_point_seq), config.data_kind.as_deref())
                    .await?;
                checkpoint.data_point_seq = Some(batch.high_water);
                batch
                    .records
                    .into_iter()
                    .map(|point| {
                        let mut ctx = Context::new();
                        ctx.insert("case_id".into(), Value::String(point.case_id));
                        ctx.insert("datapoint_id".into(), Value::String(point.id));
                        ctx
                    })
                    .collect()
            }
        };
        checkpoint.checked_at = now;

        debug!(
            workflow_id = %definition.id,
            previous = ?previous,
            matches = contexts.len(),
            "Evaluated event trigger"
        );
        Ok(Some(PendingEvents {
            contexts,
            checkpoint,
        }))
    }

    /// Mark the records covered by `checkpoint` as handled.
    pub async fn advance_checkpoint(&self, workflow_id: &str, checkpoint: &EventCheckpoint) -> Result<()> {
        self.storage.set_checkpoint(workflow_id, checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::storage::{Case, DataPoint, ExecutionStatus, TriggerSource, WorkflowExecution};
    use crate::workflow::{EventTriggerConfig, Frequency};

    fn definition(
        schedule: Option<Schedule>,
        trigger_type: TriggerType,
        trigger_config: Option<EventTriggerConfig>,
        created_at: DateTime<Utc>,
    ) -> WorkflowDefinition {
        WorkflowDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            name: "watch".into(),
            description: String::new(),
            steps: vec![json!({"type": "web_scrape", "url": "https://example.com"})],
            schedule,
            trigger_type,
            trigger_config,
            is_active: true,
            created_at,
            updated_at: created_at,
        }
    }

    fn case(id: &str, created_at: DateTime<Utc>) -> Case {
        Case {
            id: id.into(),
            name: id.into(),
            created_at,
            updated_at: created_at,
        }
    }

    fn point(id: &str, case_id: &str, kind: &str, created_at: DateTime<Utc>) -> DataPoint {
        DataPoint {
            id: id.into(),
            case_id: case_id.into(),
            data_type: kind.into(),
            value: "x".into(),
            created_at,
        }
    }

    #[test]
    fn test_daily_interval_two_boundary() {
        let schedule = Schedule {
            frequency: Frequency::Daily,
            interval: 2,
        };
        let t = Utc::now();
        let due = |at| is_due(&schedule, Some(t), at).unwrap();
        assert!(!due(t + Duration::hours(47)));
        assert!(!due(t + Duration::hours(48) - Duration::microseconds(1)));
        assert!(due(t + Duration::hours(48)));
        assert!(due(t + Duration::hours(72)));
        assert!(is_due(&schedule, None, t).unwrap());
    }

    #[test]
    fn test_oversized_interval_is_error_not_panic() {
        let huge = Schedule {
            frequency: Frequency::Weekly,
            interval: 1_000_000_000,
        };
        let t = Utc::now();
        assert!(is_due(&huge, Some(t), t).is_err());
        // Never ran: due without consulting the period
        assert!(is_due(&huge, None, t).unwrap());

        let wrapping = Schedule {
            frequency: Frequency::Minutes,
            interval: u32::MAX,
        };
        assert!(is_due(&wrapping, Some(t), t + Duration::minutes(1)).is_err());
    }

    #[test]
    fn test_next_run_past_calendar_range_is_never_due() {
        let century = Schedule {
            frequency: Frequency::Monthly,
            interval: 1_200,
        };
        let last = DateTime::<Utc>::MAX_UTC - Duration::days(10);
        assert!(!is_due(&century, Some(last), DateTime::<Utc>::MAX_UTC).unwrap());
    }

    #[tokio::test]
    async fn test_time_due_uses_last_execution() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let evaluator = TriggerEvaluator::new(storage.clone());
        let now = Utc::now();
        let schedule = Schedule {
            frequency: Frequency::Hourly,
            interval: 1,
        };
        let def = definition(Some(schedule), TriggerType::Schedule, None, now);
        storage.create_workflow(&def).await.unwrap();

        assert!(evaluator.is_time_due(&def, now).await.unwrap());

        storage
            .save_execution(&WorkflowExecution {
                id: "e1".into(),
                workflow_id: def.id.clone(),
                status: ExecutionStatus::Completed,
                trigger_source: TriggerSource::Schedule,
                context: Context::new(),
                started_at: now - Duration::minutes(30),
                finished_at: Some(now),
                error: None,
            })
            .await
            .unwrap();
        assert!(!evaluator.is_time_due(&def, now).await.unwrap());
        assert!(evaluator
            .is_time_due(&def, now + Duration::minutes(30))
            .await
            .unwrap());

        let mut inactive = def.clone();
        inactive.is_active = false;
        assert!(!evaluator
            .is_time_due(&inactive, now + Duration::days(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_manual_workflow_never_selected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let evaluator = TriggerEvaluator::new(storage.clone());
        let created = Utc::now() - Duration::hours(1);
        let def = definition(None, TriggerType::Manual, None, created);
        storage.create_workflow(&def).await.unwrap();
        storage
            .create_case(&Case {
                id: "c1".into(),
                name: "new".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let later = Utc::now() + Duration::days(400);
        assert!(!evaluator.is_time_due(&def, later).await.unwrap());
        assert!(evaluator.pending_events(&def, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_case_events_use_checkpoint() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let evaluator = TriggerEvaluator::new(storage.clone());
        let t0 = Utc::now() - Duration::hours(2);
        let def = definition(
            None,
            TriggerType::Event,
            Some(EventTriggerConfig {
                watch: WatchedKind::NewCase,
                data_kind: None,
            }),
            t0,
        );
        storage.create_workflow(&def).await.unwrap();

        for (id, offset) in [("before", -10), ("first", 10)] {
            storage.create_case(&case(id, t0 + Duration::minutes(offset))).await.unwrap();
        }

        let tick = t0 + Duration::minutes(15);
        let pending = evaluator.pending_events(&def, tick).await.unwrap().unwrap();
        assert_eq!(pending.contexts.len(), 1);
        assert_eq!(pending.contexts[0]["case_id"], "first");
        assert_eq!(pending.checkpoint.checked_at, tick);
        assert_eq!(pending.checkpoint.case_seq, Some(2));

        // Not advanced yet: the same record is offered again
        let again = evaluator.pending_events(&def, tick).await.unwrap().unwrap();
        assert_eq!(again.contexts.len(), 1);

        evaluator
            .advance_checkpoint(&def.id, &pending.checkpoint)
            .await
            .unwrap();
        let none = evaluator
            .pending_events(&def, t0 + Duration::minutes(20))
            .await
            .unwrap()
            .unwrap();
        assert!(none.contexts.is_empty());

        storage
            .create_case(&case("second", t0 + Duration::minutes(20)))
            .await
            .unwrap();
        let pending = evaluator
            .pending_events(&def, t0 + Duration::minutes(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.contexts.len(), 1);
        assert_eq!(pending.contexts[0]["case_id"], "second");
    }

    #[tokio::test]
    async fn test_record_committed_after_check_still_fires() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let evaluator = TriggerEvaluator::new(storage.clone());
        let t0 = Utc::now() - Duration::hours(1);
        let def = definition(
            None,
            TriggerType::Event,
            Some(EventTriggerConfig {
                watch: WatchedKind::NewDatapoint,
                data_kind: None,
            }),
            t0,
        );
        storage.create_workflow(&def).await.unwrap();
        storage.create_case(&case("c1", t0)).await.unwrap();

        let tick = Utc::now();
        let first = evaluator.pending_events(&def, tick).await.unwrap().unwrap();
        assert!(first.contexts.is_empty());
        evaluator
            .advance_checkpoint(&def.id, &first.checkpoint)
            .await
            .unwrap();

        // Stamped before the check, written after it
        storage
            .create_data_point(&point("late", "c1", "email", tick - Duration::milliseconds(5)))
            .await
            .unwrap();

        let second = evaluator
            .pending_events(&def, tick + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.contexts.len(), 1);
        assert_eq!(second.contexts[0]["datapoint_id"], "late");
    }

    #[tokio::test]
    async fn test_new_datapoint_events_filter_kind() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let evaluator = TriggerEvaluator::new(storage.clone());
        let t0 = Utc::now() - Duration::hours(1);
        let def = definition(
            None,
            TriggerType::Event,
            Some(EventTriggerConfig {
                watch: WatchedKind::NewDatapoint,
                data_kind: Some("email".into()),
            }),
            t0,
        );
        storage.create_workflow(&def).await.unwrap();
        storage
            .create_case(&Case {
                id: "c1".into(),
                name: "c".into(),
                created_at: t0,
                updated_at: t0,
            })
            .await
            .unwrap();
        for (id, kind) in [("p1", "phone"), ("p2", "email")] {
            storage
                .create_data_point(&DataPoint {
                    id: id.into(),
                    case_id: "c1".into(),
                    data_type: kind.into(),
                    value: "x".into(),
                    created_at: t0 + Duration::minutes(5),
                })
                .await
                .unwrap();
        }

        let events = evaluator
            .pending_events(&def, Utc::now())
            .await
            .unwrap()
            .unwrap()
            .contexts;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["datapoint_id"], "p2");
        assert_eq!(events[0]["case_id"], "c1");
    }
}
