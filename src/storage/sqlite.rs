//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};

/// Format a timestamp for storage.
///
/// Fixed-width microsecond precision keeps lexical and chronological order
/// identical, which the range queries below rely on.
pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

fn parse_json<T: DeserializeOwned>(s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn cursor_filter(cursor: EventCursor) -> (&'static str, SqlValue) {
    match cursor {
        EventCursor::After(seq) => ("rowid > ?", SqlValue::Integer(seq)),
        EventCursor::CreatedAfter(at) => ("created_at > ?", SqlValue::Text(format_ts(&at))),
    }
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const DEFINITION_COLUMNS: &str = "id, name, description, steps_json, schedule_json, trigger_type, \
     trigger_config_json, is_active, created_at, updated_at";

const EXECUTION_COLUMNS: &str =
    "id, workflow_id, status, trigger_source, context_json, start_time, end_time, error";

const STEP_COLUMNS: &str = "id, execution_id, step_number, step_type, status, start_time, \
     end_time, result_json, error";

const TARGET_COLUMNS: &str = "id, name, base_url, api_key_env, description, category, \
     endpoints_json, created_at, updated_at";

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflow_definition (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                steps_json TEXT NOT NULL,
                schedule_json TEXT,
                trigger_type TEXT NOT NULL,
                trigger_config_json TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_execution (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_source TEXT NOT NULL DEFAULT 'manual',
                context_json TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                error TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflow_definition(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS workflow_step (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                step_type TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                result_json TEXT,
                error TEXT,
                FOREIGN KEY (execution_id) REFERENCES workflow_execution(id) ON DELETE CASCADE,
                UNIQUE(execution_id, step_number)
            );

            CREATE TABLE IF NOT EXISTS trigger_checkpoint (
                workflow_id TEXT PRIMARY KEY,
                last_checked_at TEXT NOT NULL,
                case_seq INTEGER,
                data_point_seq INTEGER,
                FOREIGN KEY (workflow_id) REFERENCES workflow_definition(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS osint_case (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS data_point (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                case_id TEXT NOT NULL,
                data_type TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (case_id) REFERENCES osint_case(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS api_target (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                base_url TEXT NOT NULL,
                api_key_env TEXT,
                description TEXT NOT NULL DEFAULT '',
                category TEXT,
                endpoints_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS target_directory (
                category TEXT NOT NULL,
                target_id TEXT NOT NULL,
                PRIMARY KEY (category, target_id),
                FOREIGN KEY (target_id) REFERENCES api_target(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS api_result (
                id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                api_name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                query_params_json TEXT NOT NULL,
                result_json TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (case_id) REFERENCES osint_case(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_execution_workflow
                ON workflow_execution(workflow_id, start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_step_execution ON workflow_step(execution_id, step_number);
            CREATE INDEX IF NOT EXISTS idx_case_created ON osint_case(created_at);
            CREATE INDEX IF NOT EXISTS idx_data_point_case ON data_point(case_id, data_type);
            CREATE INDEX IF NOT EXISTS idx_data_point_created ON data_point(created_at);
            CREATE INDEX IF NOT EXISTS idx_api_result_case ON api_result(case_id);
            "#,
        )?;

        Self::ensure_trigger_source_column(conn)?;
        Self::ensure_checkpoint_seq_columns(conn)?;
        Ok(())
    }

    fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let sql = format!("PRAGMA table_info({})", table);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == column {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Databases created before executions recorded their trigger lack the column.
    fn ensure_trigger_source_column(conn: &Connection) -> Result<()> {
        if !Self::has_column(conn, "workflow_execution", "trigger_source")? {
            conn.execute(
                "ALTER TABLE workflow_execution ADD COLUMN trigger_source TEXT NOT NULL DEFAULT 'manual'",
                [],
            )?;
        }
        Ok(())
    }

    /// Checkpoints written before event scans followed insert order lack the
    /// sequence columns; those workflows fall back to their last check time.
    fn ensure_checkpoint_seq_columns(conn: &Connection) -> Result<()> {
        for column in ["case_seq", "data_point_seq"] {
            if !Self::has_column(conn, "trigger_checkpoint", column)? {
                conn.execute(
                    &format!("ALTER TABLE trigger_checkpoint ADD COLUMN {} INTEGER", column),
                    [],
                )?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Workflow definition operations
    // ========================================================================

    pub async fn create_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO workflow_definition ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                DEFINITION_COLUMNS
            ),
            params![
                definition.id,
                definition.name,
                definition.description,
                serde_json::to_string(&definition.steps)?,
                definition
                    .schedule
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                definition.trigger_type.to_string(),
                definition
                    .trigger_config
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                definition.is_active,
                format_ts(&definition.created_at),
                format_ts(&definition.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Overwrite every mutable field of an existing definition.
    pub async fn update_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workflow_definition
             SET name = ?1, description = ?2, steps_json = ?3, schedule_json = ?4,
                 trigger_type = ?5, trigger_config_json = ?6, is_active = ?7, updated_at = ?8
             WHERE id = ?9",
            params![
                definition.name,
                definition.description,
                serde_json::to_string(&definition.steps)?,
                definition
                    .schedule
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                definition.trigger_type.to_string(),
                definition
                    .trigger_config
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                definition.is_active,
                format_ts(&definition.updated_at),
                definition.id,
            ],
        )?;

        if changed == 0 {
            return Err(Error::NotFound(format!("Workflow '{}'", definition.id)));
        }
        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let definition = conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_definition WHERE id = ?1",
                    DEFINITION_COLUMNS
                ),
                [id],
                Self::row_to_definition,
            )
            .optional()?;
        Ok(definition)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workflow_definition ORDER BY created_at, id",
            DEFINITION_COLUMNS
        ))?;
        let definitions = stmt
            .query_map([], Self::row_to_definition)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(definitions)
    }

    pub async fn list_active_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workflow_definition WHERE is_active = 1 ORDER BY created_at, id",
            DEFINITION_COLUMNS
        ))?;
        let definitions = stmt
            .query_map([], Self::row_to_definition)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(definitions)
    }

    /// Delete a definition with its executions, steps and checkpoint.
    ///
    /// Returns `false` if no such definition existed.
    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM workflow_definition WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn row_to_definition(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowDefinition> {
        let schedule_json: Option<String> = row.get(4)?;
        let trigger_config_json: Option<String> = row.get(6)?;

        Ok(WorkflowDefinition {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            steps: parse_json(&row.get::<_, String>(3)?)?,
            schedule: schedule_json.as_deref().map(parse_json).transpose()?,
            trigger_type: parse_enum(&row.get::<_, String>(5)?)?,
            trigger_config: trigger_config_json.as_deref().map(parse_json).transpose()?,
            is_active: row.get(7)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
        })
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    pub async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_execution(&conn, execution)
    }

    fn upsert_execution(conn: &Connection, execution: &WorkflowExecution) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO workflow_execution ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    context_json = excluded.context_json,
                    end_time = excluded.end_time,
                    error = excluded.error",
                EXECUTION_COLUMNS
            ),
            params![
                execution.id,
                execution.workflow_id,
                execution.status.to_string(),
                execution.trigger_source.to_string(),
                serde_json::to_string(&execution.context)?,
                format_ts(&execution.started_at),
                execution.finished_at.as_ref().map(format_ts),
                execution.error,
            ],
        )?;
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let conn = self.conn.lock().await;
        let execution = conn
            .query_row(
                &format!(
                    "SELECT {} FROM workflow_execution WHERE id = ?1",
                    EXECUTION_COLUMNS
                ),
                [id],
                Self::row_to_execution,
            )
            .optional()?;
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>> {
        let query = ExecutionQuery {
            workflow_id: Some(workflow_id.to_string()),
            limit,
            ..ExecutionQuery::default()
        };
        self.query_executions(&query).await
    }

    pub async fn query_executions(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let conn = self.conn.lock().await;

        let mut sql = format!(
            "SELECT {} FROM workflow_execution WHERE 1=1",
            EXECUTION_COLUMNS
        );
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(workflow_id) = &query.workflow_id {
            sql.push_str(" AND workflow_id = ?");
            bind.push(SqlValue::Text(workflow_id.clone()));
        }

        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.to_string()));
        }

        if let Some(source) = &query.trigger_source {
            sql.push_str(" AND trigger_source = ?");
            bind.push(SqlValue::Text(source.to_string()));
        }

        sql.push_str(" ORDER BY start_time DESC, id LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        bind.push(SqlValue::Integer(limit as i64));
        bind.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(executions)
    }

    /// Start time of the most recent execution of a workflow, if any.
    pub async fn latest_execution_start(&self, workflow_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(start_time) FROM workflow_execution WHERE workflow_id = ?1",
            [workflow_id],
            |row| row.get(0),
        )?;
        Ok(parse_optional_datetime(latest)?)
    }

    pub async fn get_execution_trace(&self, execution_id: &str) -> Result<Option<ExecutionTrace>> {
        let Some(execution) = self.get_execution(execution_id).await? else {
            return Ok(None);
        };

        let steps = self.list_steps(execution_id).await?;
        Ok(Some(ExecutionTrace { execution, steps }))
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowExecution> {
        Ok(WorkflowExecution {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            status: parse_enum(&row.get::<_, String>(2)?)?,
            trigger_source: parse_enum(&row.get::<_, String>(3)?)?,
            context: parse_json(&row.get::<_, String>(4)?)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            finished_at: parse_optional_datetime(row.get(6)?)?,
            error: row.get(7)?,
        })
    }

    // ========================================================================
    // Step operations
    // ========================================================================

    pub async fn save_step(&self, step: &WorkflowStep) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::upsert_step(&conn, step)
    }

    fn upsert_step(conn: &Connection, step: &WorkflowStep) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO workflow_step ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    end_time = excluded.end_time,
                    result_json = excluded.result_json,
                    error = excluded.error",
                STEP_COLUMNS
            ),
            params![
                step.id,
                step.execution_id,
                step.step_number,
                step.step_type,
                step.status.to_string(),
                format_ts(&step.started_at),
                step.finished_at.as_ref().map(format_ts),
                step.result.as_ref().map(serde_json::to_string).transpose()?,
                step.error,
            ],
        )?;
        Ok(())
    }

    /// Persist a step's terminal state and the execution row in one transaction.
    pub async fn record_step_outcome(
        &self,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        Self::upsert_step(&tx, step)?;
        Self::upsert_execution(&tx, execution)?;
        tx.commit()?;
        Ok(())
    }

    pub async fn list_steps(&self, execution_id: &str) -> Result<Vec<WorkflowStep>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workflow_step WHERE execution_id = ?1 ORDER BY step_number",
            STEP_COLUMNS
        ))?;

        let steps = stmt
            .query_map([execution_id], |row| {
                let result_json: Option<String> = row.get(7)?;
                Ok(WorkflowStep {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    step_number: row.get(2)?,
                    step_type: row.get(3)?,
                    status: parse_enum(&row.get::<_, String>(4)?)?,
                    started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
                    finished_at: parse_optional_datetime(row.get(6)?)?,
                    result: result_json.as_deref().map(parse_json).transpose()?,
                    error: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(steps)
    }

    // ========================================================================
    // Trigger checkpoint operations
    // ========================================================================

    pub async fn get_checkpoint(&self, workflow_id: &str) -> Result<Option<EventCheckpoint>> {
        let conn = self.conn.lock().await;
        let checkpoint = conn
            .query_row(
                "SELECT last_checked_at, case_seq, data_point_seq
                 FROM trigger_checkpoint WHERE workflow_id = ?1",
                [workflow_id],
                |row| {
                    Ok(EventCheckpoint {
                        checked_at: parse_datetime_utc(&row.get::<_, String>(0)?)?,
                        case_seq: row.get(1)?,
                        data_point_seq: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    pub async fn set_checkpoint(&self, workflow_id: &str, checkpoint: &EventCheckpoint) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trigger_checkpoint (workflow_id, last_checked_at, case_seq, data_point_seq)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(workflow_id) DO UPDATE SET
                 last_checked_at = excluded.last_checked_at,
                 case_seq = excluded.case_seq,
                 data_point_seq = excluded.data_point_seq",
            params![
                workflow_id,
                format_ts(&checkpoint.checked_at),
                checkpoint.case_seq,
                checkpoint.data_point_seq,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Case and data point operations
    // ========================================================================

    pub async fn create_case(&self, case: &Case) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO osint_case (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                case.id,
                case.name,
                format_ts(&case.created_at),
                format_ts(&case.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_case(&self, id: &str) -> Result<Option<Case>> {
        let conn = self.conn.lock().await;
        let case = conn
            .query_row(
                "SELECT id, name, created_at, updated_at FROM osint_case WHERE id = ?1",
                [id],
                Self::row_to_case,
            )
            .optional()?;
        Ok(case)
    }

    /// Cases inserted after `cursor`, in insert order.
    ///
    /// The high-water mark is read before the scan, so a record committed
    /// while the scan runs is left for the next one instead of being skipped.
    pub async fn new_cases(&self, cursor: EventCursor) -> Result<EventBatch<Case>> {
        let conn = self.conn.lock().await;
        let high_water = Self::high_water(&conn, "osint_case")?;
        let (filter, bound) = cursor_filter(cursor);
        let mut stmt = conn.prepare(&format!(
            "SELECT id, name, created_at, updated_at FROM osint_case
             WHERE {} AND rowid <= ? ORDER BY rowid",
            filter
        ))?;
        let records = stmt
            .query_map(params![bound, high_water], Self::row_to_case)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(EventBatch {
            records,
            high_water,
        })
    }

    fn high_water(conn: &Connection, table: &str) -> Result<i64> {
        let seq: i64 = conn.query_row(
            &format!("SELECT COALESCE(MAX(rowid), 0) FROM {}", table),
            [],
            |row| row.get(0),
        )?;
        Ok(seq)
    }

    fn row_to_case(row: &rusqlite::Row<'_>) -> rusqlite::Result<Case> {
        Ok(Case {
            id: row.get(0)?,
            name: row.get(1)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(2)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(3)?)?,
        })
    }

    pub async fn create_data_point(&self, point: &DataPoint) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO data_point (id, case_id, data_type, value, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                point.id,
                point.case_id,
                point.data_type,
                point.value,
                format_ts(&point.created_at),
            ],
        )?;
        Ok(())
    }

    /// Data points of a case in creation order.
    pub async fn list_data_points(&self, case_id: &str) -> Result<Vec<DataPoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, case_id, data_type, value, created_at FROM data_point
             WHERE case_id = ?1 ORDER BY created_at, rowid",
        )?;
        let points = stmt
            .query_map([case_id], Self::row_to_data_point)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Oldest data point of the given kind in a case.
    pub async fn first_data_point(
        &self,
        case_id: &str,
        data_type: &str,
    ) -> Result<Option<DataPoint>> {
        let conn = self.conn.lock().await;
        let point = conn
            .query_row(
                "SELECT id, case_id, data_type, value, created_at FROM data_point
                 WHERE case_id = ?1 AND data_type = ?2
                 ORDER BY created_at, rowid LIMIT 1",
                [case_id, data_type],
                Self::row_to_data_point,
            )
            .optional()?;
        Ok(point)
    }

    /// Data points inserted after `cursor`, optionally of one kind.
    pub async fn new_data_points(
        &self,
        cursor: EventCursor,
        data_type: Option<&str>,
    ) -> Result<EventBatch<DataPoint>> {
        let conn = self.conn.lock().await;
        let high_water = Self::high_water(&conn, "data_point")?;
        let (filter, bound) = cursor_filter(cursor);

        let mut sql = format!(
            "SELECT id, case_id, data_type, value, created_at FROM data_point
             WHERE {} AND rowid <= ?",
            filter
        );
        let mut bind = vec![bound, SqlValue::Integer(high_water)];
        if let Some(data_type) = data_type {
            sql.push_str(" AND data_type = ?");
            bind.push(SqlValue::Text(data_type.to_string()));
        }
        sql.push_str(" ORDER BY rowid");

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_data_point)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(EventBatch {
            records,
            high_water,
        })
    }

    fn row_to_data_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataPoint> {
        Ok(DataPoint {
            id: row.get(0)?,
            case_id: row.get(1)?,
            data_type: row.get(2)?,
            value: row.get(3)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
        })
    }

    // ========================================================================
    // Query target operations
    // ========================================================================

    /// Insert a target, or replace the one with the same name (keeping its id).
    ///
    /// Returns the id the target is stored under.
    pub async fn save_target(&self, target: &ApiTarget) -> Result<String> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM api_target WHERE name = ?1",
                [target.name.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let endpoints = serde_json::to_string(&target.endpoints)?;

        if let Some(existing_id) = existing {
            conn.execute(
                "UPDATE api_target
                 SET base_url = ?1, api_key_env = ?2, description = ?3, category = ?4,
                     endpoints_json = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    target.base_url,
                    target.api_key_env,
                    target.description,
                    target.category,
                    endpoints,
                    format_ts(&target.updated_at),
                    existing_id,
                ],
            )?;
            return Ok(existing_id);
        }

        conn.execute(
            &format!(
                "INSERT INTO api_target ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                TARGET_COLUMNS
            ),
            params![
                target.id,
                target.name,
                target.base_url,
                target.api_key_env,
                target.description,
                target.category,
                endpoints,
                format_ts(&target.created_at),
                format_ts(&target.updated_at),
            ],
        )?;
        Ok(target.id.clone())
    }

    pub async fn get_target(&self, id: &str) -> Result<Option<ApiTarget>> {
        let conn = self.conn.lock().await;
        let target = conn
            .query_row(
                &format!("SELECT {} FROM api_target WHERE id = ?1", TARGET_COLUMNS),
                [id],
                Self::row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    pub async fn list_targets(&self) -> Result<Vec<ApiTarget>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_target ORDER BY name",
            TARGET_COLUMNS
        ))?;
        let targets = stmt
            .query_map([], Self::row_to_target)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    /// Register a target in the category directory. Re-adding is a no-op.
    pub async fn add_to_directory(&self, category: &str, target_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO target_directory (category, target_id) VALUES (?1, ?2)",
            params![category.to_lowercase(), target_id],
        )?;
        Ok(())
    }

    /// Targets registered in the directory under a category (case-insensitive).
    pub async fn directory_targets(&self, category: &str) -> Result<Vec<ApiTarget>> {
        let conn = self.conn.lock().await;
        let columns = TARGET_COLUMNS
            .split(", ")
            .map(|c| format!("t.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_target t
             JOIN target_directory d ON d.target_id = t.id
             WHERE d.category = ?1
             ORDER BY t.name",
            columns
        ))?;
        let targets = stmt
            .query_map([category.to_lowercase()], Self::row_to_target)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiTarget> {
        Ok(ApiTarget {
            id: row.get(0)?,
            name: row.get(1)?,
            base_url: row.get(2)?,
            api_key_env: row.get(3)?,
            description: row.get(4)?,
            category: row.get(5)?,
            endpoints: parse_json(&row.get::<_, String>(6)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
        })
    }

    // ========================================================================
    // Query result operations
    // ========================================================================

    pub async fn save_api_result(&self, result: &ApiResult) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO api_result
             (id, case_id, target_id, api_name, endpoint, query_params_json, result_json, status, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                result.id,
                result.case_id,
                result.target_id,
                result.api_name,
                result.endpoint,
                serde_json::to_string(&result.query_params)?,
                result.result.as_ref().map(serde_json::to_string).transpose()?,
                result.status.to_string(),
                result.error_message,
                format_ts(&result.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_api_results(&self, case_id: &str) -> Result<Vec<ApiResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, case_id, target_id, api_name, endpoint, query_params_json, result_json, status, error_message, created_at
             FROM api_result WHERE case_id = ?1 ORDER BY created_at, rowid",
        )?;
        let results = stmt
            .query_map([case_id], |row| {
                let result_json: Option<String> = row.get(6)?;
                Ok(ApiResult {
                    id: row.get(0)?,
                    case_id: row.get(1)?,
                    target_id: row.get(2)?,
                    api_name: row.get(3)?,
                    endpoint: row.get(4)?,
                    query_params: parse_json(&row.get::<_, String>(5)?)?,
                    result: result_json.as_deref().map(parse_json).transpose()?,
                    status: parse_enum(&row.get::<_, String>(7)?)?,
                    error_message: row.get(8)?,
                    created_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Context, Frequency, Schedule, TriggerType};
    use chrono::Duration;
    use serde_json::json;

    fn definition(id: &str) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: id.to_string(),
            name: format!("wf {}", id),
            description: String::new(),
            steps: vec![json!({"type": "web_scrape", "url": "https://example.com"})],
            schedule: Some(Schedule {
                frequency: Frequency::Daily,
                interval: 2,
            }),
            trigger_type: TriggerType::Schedule,
            trigger_config: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn execution(id: &str, workflow_id: &str, started_at: DateTime<Utc>) -> WorkflowExecution {
        WorkflowExecution {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            trigger_source: TriggerSource::Manual,
            context: Context::new(),
            started_at,
            finished_at: None,
            error: None,
        }
    }

    fn case(id: &str, created_at: DateTime<Utc>) -> Case {
        Case {
            id: id.to_string(),
            name: id.to_string(),
            created_at,
            updated_at: created_at,
        }
    }

    fn checkpoint(checked_at: DateTime<Utc>, case_seq: Option<i64>) -> EventCheckpoint {
        EventCheckpoint {
            checked_at,
            case_seq,
            data_point_seq: None,
        }
    }

    fn data_point(id: &str, case_id: &str, data_type: &str, created_at: DateTime<Utc>) -> DataPoint {
        DataPoint {
            id: id.to_string(),
            case_id: case_id.to_string(),
            data_type: data_type.to_string(),
            value: format!("{}-value", id),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_workflow(&definition("wf-1")).await.unwrap();

        let mut loaded = storage.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.schedule.unwrap().interval, 2);
        assert_eq!(loaded.trigger_type, TriggerType::Schedule);

        loaded.is_active = false;
        loaded.schedule = None;
        storage.update_workflow(&loaded).await.unwrap();

        let reloaded = storage.get_workflow("wf-1").await.unwrap().unwrap();
        assert!(!reloaded.is_active);
        assert!(reloaded.schedule.is_none());
        assert!(storage.list_active_workflows().await.unwrap().is_empty());
        assert_eq!(storage.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_workflow_is_not_found() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let err = storage
            .update_workflow(&definition("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_executions_and_steps() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_workflow(&definition("wf-1")).await.unwrap();
        storage
            .save_execution(&execution("exec-1", "wf-1", Utc::now()))
            .await
            .unwrap();
        storage
            .save_step(&WorkflowStep {
                id: "step-1".into(),
                execution_id: "exec-1".into(),
                step_number: 1,
                step_type: "web_scrape".into(),
                status: ExecutionStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                result: None,
                error: None,
            })
            .await
            .unwrap();
        storage
            .set_checkpoint("wf-1", &checkpoint(Utc::now(), Some(3)))
            .await
            .unwrap();

        assert!(storage.delete_workflow("wf-1").await.unwrap());
        assert!(!storage.delete_workflow("wf-1").await.unwrap());
        assert!(storage.get_execution("exec-1").await.unwrap().is_none());
        assert!(storage.list_steps("exec-1").await.unwrap().is_empty());
        assert!(storage.get_checkpoint("wf-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_for_unknown_workflow_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let result = storage
            .save_execution(&execution("exec-1", "missing", Utc::now()))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_record_step_outcome_updates_both_rows() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_workflow(&definition("wf-1")).await.unwrap();
        let mut exec = execution("exec-1", "wf-1", Utc::now());
        storage.save_execution(&exec).await.unwrap();

        let mut step = WorkflowStep {
            id: "step-1".into(),
            execution_id: "exec-1".into(),
            step_number: 1,
            step_type: "condition".into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        };
        storage.save_step(&step).await.unwrap();

        step.status = ExecutionStatus::Failed;
        step.error = Some("boom".into());
        step.finished_at = Some(Utc::now());
        exec.status = ExecutionStatus::Failed;
        exec.error = Some("boom".into());
        exec.finished_at = step.finished_at;
        exec.context.insert("seen".into(), json!(true));
        storage.record_step_outcome(&step, &exec).await.unwrap();

        let trace = storage.get_execution_trace("exec-1").await.unwrap().unwrap();
        assert_eq!(trace.execution.status, ExecutionStatus::Failed);
        assert_eq!(trace.execution.context["seen"], json!(true));
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_latest_execution_start_and_query() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.create_workflow(&definition("wf-1")).await.unwrap();
        assert!(storage
            .latest_execution_start("wf-1")
            .await
            .unwrap()
            .is_none());

        let base = Utc::now() - Duration::hours(3);
        for i in 0..3 {
            let mut exec = execution(&format!("exec-{}", i), "wf-1", base + Duration::hours(i));
            if i == 1 {
                exec.status = ExecutionStatus::Failed;
            }
            storage.save_execution(&exec).await.unwrap();
        }

        let latest = storage.latest_execution_start("wf-1").await.unwrap().unwrap();
        assert_eq!(format_ts(&latest), format_ts(&(base + Duration::hours(2))));

        let failed = storage
            .query_executions(&ExecutionQuery {
                status: Some(ExecutionStatus::Failed),
                ..ExecutionQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "exec-1");

        let recent = storage.list_executions("wf-1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "exec-2");
    }

    #[tokio::test]
    async fn test_new_cases_follow_insert_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t0 = Utc::now() - Duration::minutes(10);

        storage.create_case(&case("old", t0)).await.unwrap();
        storage
            .create_case(&case("recent", t0 + Duration::minutes(5)))
            .await
            .unwrap();

        let first = storage
            .new_cases(EventCursor::CreatedAfter(t0))
            .await
            .unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].id, "recent");
        assert_eq!(first.high_water, 2);

        // Stamped before everything seen so far, inserted after the scan
        storage
            .create_case(&case("late", t0 - Duration::minutes(1)))
            .await
            .unwrap();
        let next = storage
            .new_cases(EventCursor::After(first.high_water))
            .await
            .unwrap();
        assert_eq!(next.records.len(), 1);
        assert_eq!(next.records[0].id, "late");
        assert_eq!(next.high_water, 3);

        let empty = storage
            .new_cases(EventCursor::After(next.high_water))
            .await
            .unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.high_water, 3);
    }

    #[tokio::test]
    async fn test_new_data_points_filter_kind() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let t0 = Utc::now() - Duration::minutes(10);
        storage.create_case(&case("c1", t0)).await.unwrap();

        storage
            .create_data_point(&data_point("dp-1", "c1", "email", t0))
            .await
            .unwrap();
        storage
            .create_data_point(&data_point("dp-2", "c1", "phone", t0))
            .await
            .unwrap();

        let all = storage
            .new_data_points(EventCursor::After(0), None)
            .await
            .unwrap();
        assert_eq!(all.records.len(), 2);
        assert_eq!(all.high_water, 2);

        let emails = storage
            .new_data_points(EventCursor::After(0), Some("email"))
            .await
            .unwrap();
        assert_eq!(emails.records.len(), 1);
        assert_eq!(emails.records[0].id, "dp-1");
        assert_eq!(emails.high_water, 2);

        let after_first = storage
            .new_data_points(EventCursor::After(1), None)
            .await
            .unwrap();
        assert_eq!(after_first.records.len(), 1);
        assert_eq!(after_first.records[0].id, "dp-2");
    }

    #[tokio::test]
    async fn test_first_data_point_by_kind() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        storage.create_case(&case("c1", now)).await.unwrap();
        storage
            .create_data_point(&data_point("img-1", "c1", "image", now))
            .await
            .unwrap();
        storage
            .create_data_point(&data_point("img-2", "c1", "image", now + Duration::seconds(1)))
            .await
            .unwrap();

        let first = storage.first_data_point("c1", "image").await.unwrap().unwrap();
        assert_eq!(first.id, "img-1");
        assert!(storage
            .first_data_point("c1", "secondary_image")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_targets_and_directory() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let mut target = ApiTarget {
            id: "t-1".into(),
            name: "mailcheck".into(),
            base_url: "https://mail.example".into(),
            api_key_env: None,
            description: "Email lookup".into(),
            category: Some("Email".into()),
            endpoints: serde_json::from_value(json!({
                "lookup": {"path": "/v1/lookup", "type": "email"}
            }))
            .unwrap(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(storage.save_target(&target).await.unwrap(), "t-1");

        // Same name keeps the original id
        target.id = "t-other".into();
        target.description = "Updated".into();
        assert_eq!(storage.save_target(&target).await.unwrap(), "t-1");

        let loaded = storage.get_target("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.description, "Updated");
        assert_eq!(loaded.endpoints["lookup"].method, "GET");
        assert_eq!(loaded.endpoints["lookup"].param_name, "query");

        storage.add_to_directory("EMAIL", "t-1").await.unwrap();
        storage.add_to_directory("email", "t-1").await.unwrap();
        let listed = storage.directory_targets("Email").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "mailcheck");
    }

    #[tokio::test]
    async fn test_api_results_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        storage.create_case(&case("c1", now)).await.unwrap();
        storage
            .save_api_result(&ApiResult {
                id: "r-1".into(),
                case_id: "c1".into(),
                target_id: "t-1".into(),
                api_name: "mailcheck".into(),
                endpoint: "lookup".into(),
                query_params: json!({"query": "a@b.c"}),
                result: None,
                status: QueryStatus::Error,
                error_message: Some("HTTP 500".into()),
                created_at: now,
            })
            .await
            .unwrap();

        let results = storage.list_api_results("c1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, QueryStatus::Error);
        assert_eq!(results[0].query_params["query"], "a@b.c");
    }

    #[tokio::test]
    async fn test_checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("osintflow.db");
        let at = Utc::now();

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.create_workflow(&definition("wf-1")).await.unwrap();
            storage
                .set_checkpoint("wf-1", &checkpoint(at, Some(7)))
                .await
                .unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let loaded = storage.get_checkpoint("wf-1").await.unwrap().unwrap();
        assert_eq!(format_ts(&loaded.checked_at), format_ts(&at));
        assert_eq!(loaded.case_seq, Some(7));
        assert_eq!(loaded.data_point_seq, None);
    }
}
