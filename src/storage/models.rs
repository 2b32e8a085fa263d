//! Storage models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{Context, EventTriggerConfig, Schedule, TriggerType};

/// Stored workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Raw step objects, parsed when each step runs
    pub steps: Vec<Value>,
    pub schedule: Option<Schedule>,
    pub trigger_type: TriggerType,
    pub trigger_config: Option<EventTriggerConfig>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a workflow definition.
///
/// `None` leaves a field untouched; the doubly optional fields use
/// `Some(None)` to clear the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub steps: Option<Vec<Value>>,
    pub schedule: Option<Option<Schedule>>,
    pub trigger_type: Option<TriggerType>,
    pub trigger_config: Option<Option<EventTriggerConfig>>,
    pub is_active: Option<bool>,
}

impl WorkflowUpdate {
    pub fn apply(self, definition: &mut WorkflowDefinition) {
        if let Some(name) = self.name {
            definition.name = name;
        }
        if let Some(description) = self.description {
            definition.description = description;
        }
        if let Some(steps) = self.steps {
            definition.steps = steps;
        }
        if let Some(schedule) = self.schedule {
            definition.schedule = schedule;
        }
        if let Some(trigger_type) = self.trigger_type {
            definition.trigger_type = trigger_type;
        }
        if let Some(trigger_config) = self.trigger_config {
            definition.trigger_config = trigger_config;
        }
        if let Some(is_active) = self.is_active {
            definition.is_active = is_active;
        }
    }
}

/// Status of an execution or of one of its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Schedule,
    Event,
    Manual,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schedule => write!(f, "schedule"),
            Self::Event => write!(f, "event"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Self::Schedule),
            "event" => Ok(Self::Event),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown trigger source: {}", s)),
        }
    }
}

/// One run attempt of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub trigger_source: TriggerSource,
    /// Context accumulated so far
    pub context: Context,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Record of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub execution_id: String,
    /// 1-based position within the run
    pub step_number: u32,
    pub step_type: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Execution with its step records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowStep>,
}

/// Query filters for execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub trigger_source: Option<TriggerSource>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            workflow_id: None,
            status: None,
            trigger_source: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// An investigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One piece of information attached to a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: String,
    pub case_id: String,
    /// Kind of information: name, email, phone, image, ...
    pub data_type: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Where an event scan resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCursor {
    /// Records inserted after this insert sequence number
    After(i64),
    /// Records stamped after this time, for workflows never checked before
    CreatedAfter(DateTime<Utc>),
}

/// Records found by an event scan.
#[derive(Debug, Clone)]
pub struct EventBatch<T> {
    pub records: Vec<T>,
    /// Highest insert sequence number covered by the scan
    pub high_water: i64,
}

/// Persisted progress of an event-triggered workflow.
///
/// Sequence numbers follow insert order, so a record whose `created_at` was
/// stamped before an earlier check but committed after it is still seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCheckpoint {
    pub checked_at: DateTime<Utc>,
    pub case_seq: Option<i64>,
    pub data_point_seq: Option<i64>,
}

/// An endpoint declared by a query target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEndpoint {
    #[serde(default)]
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Data kinds this endpoint accepts, e.g. "email" or "phone,name"
    #[serde(rename = "type", default)]
    pub param_type: String,

    /// Request parameter the value is sent as
    #[serde(default = "default_param_name")]
    pub param_name: String,

    /// "header" sends the key as a header, anything else as a parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_param: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_param_name() -> String {
    "query".to_string()
}

/// A remote source the api_query step can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTarget {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Endpoints keyed by name
    #[serde(default)]
    pub endpoints: BTreeMap<String, TargetEndpoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one target call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for QueryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown query status: {}", s)),
        }
    }
}

/// Persisted result of one target call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult {
    pub id: String,
    pub case_id: String,
    pub target_id: String,
    pub api_name: String,
    pub endpoint: String,
    pub query_params: Value,
    pub result: Option<Value>,
    pub status: QueryStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
