//! Workflow type definitions.
//!
//! Step specifications arrive as JSON objects tagged by `type`. They are
//! stored raw and parsed into [`StepSpec`] right before a step runs, so a
//! definition written by an older build still loads even if one of its
//! steps can no longer be executed.

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Accumulating key/value state shared by the steps of one execution.
///
/// Merging is last-write-wins: a step output key replaces any earlier value.
pub type Context = Map<String, Value>;

/// Merge `update` into `context`, overwriting existing keys.
pub fn merge_context(context: &mut Context, update: Context) {
    for (key, value) in update {
        context.insert(key, value);
    }
}

/// A single step of a workflow.
///
/// # Example JSON
///
/// ```json
/// {"type": "condition", "condition": "$count > 3",
///  "then": [{"type": "web_scrape", "url": "$profile_url"}]}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    ApiQuery(ApiQuerySpec),
    LlmAnalysis(LlmAnalysisSpec),
    WebScrape(WebScrapeSpec),
    DataStore(DataStoreSpec),
    Condition(ConditionSpec),
}

impl StepSpec {
    /// The recognized step kinds.
    pub const KINDS: [&'static str; 5] = [
        "api_query",
        "llm_analysis",
        "web_scrape",
        "data_store",
        "condition",
    ];

    /// Parse one raw step object.
    ///
    /// An unrecognized or absent `type` is reported as [`Error::UnknownKind`];
    /// a known kind with bad fields is a [`Error::Validation`].
    pub fn from_value(raw: &Value) -> crate::error::Result<Self> {
        let kind = step_kind(raw)?;
        if !Self::KINDS.contains(&kind) {
            return Err(Error::UnknownKind(format!("step type '{}'", kind)));
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::Validation(format!("Invalid '{}' step: {}", kind, e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StepSpec::ApiQuery(_) => "api_query",
            StepSpec::LlmAnalysis(_) => "llm_analysis",
            StepSpec::WebScrape(_) => "web_scrape",
            StepSpec::DataStore(_) => "data_store",
            StepSpec::Condition(_) => "condition",
        }
    }
}

/// Read the `type` tag of a raw step without parsing the rest.
pub fn step_kind(raw: &Value) -> crate::error::Result<&str> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::Validation("Step must be a JSON object".into()))?;
    match obj.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => Ok(kind.as_str()),
        Some(_) => Err(Error::Validation("Step 'type' must be a string".into())),
        None => Err(Error::Validation("Step is missing its 'type'".into())),
    }
}

/// How an api_query step picks its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiSelection {
    /// The analysis oracle recommends target types and categories
    Auto,
    /// The step lists target ids itself
    #[default]
    Explicit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiQuerySpec {
    #[serde(default)]
    pub api_selection: ApiSelection,

    #[serde(default)]
    pub api_ids: Vec<String>,

    #[serde(default)]
    pub api_types: Vec<String>,

    #[serde(default)]
    pub api_categories: Vec<String>,

    /// Per-kind overrides of the parameters derived from the case
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    ProcessInput,
    AnalyzeResults,
    GenerateReport,
    AnalyzeImage,
}

impl AnalysisType {
    /// Context key the analysis output is stored under.
    pub fn output_key(&self) -> &'static str {
        match self {
            AnalysisType::ProcessInput => "llm_analysis",
            AnalysisType::AnalyzeResults => "data_analysis",
            AnalysisType::GenerateReport => "report",
            AnalysisType::AnalyzeImage => "image_analysis",
        }
    }
}

/// Which of the case images to analyze.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    #[default]
    Primary,
    Secondary,
}

impl ImageType {
    /// Data point kind that holds this image.
    pub fn data_type(&self) -> &'static str {
        match self {
            ImageType::Primary => "image",
            ImageType::Secondary => "secondary_image",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAnalysisSpec {
    pub analysis_type: AnalysisType,

    #[serde(default)]
    pub image_type: ImageType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebScrapeSpec {
    /// Literal URL or `$key` to read it from the context
    pub url: String,

    #[serde(default = "default_result_key")]
    pub result_key: String,
}

fn default_result_key() -> String {
    "scraped_content".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    Datapoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreSpec {
    pub store_type: StoreType,

    #[serde(default)]
    pub data_type: Option<String>,

    /// `$key` to read the value from the context, otherwise a literal
    #[serde(default)]
    pub value_source: Option<String>,

    /// Literal value used when `value_source` is not a context reference
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub condition: String,

    #[serde(default, rename = "then")]
    pub then_steps: Vec<Value>,

    #[serde(default, rename = "else")]
    pub else_steps: Vec<Value>,
}

/// If `reference` is a `$key` marker, return the key.
pub fn context_reference(reference: &str) -> Option<&str> {
    reference.strip_prefix('$').filter(|key| !key.is_empty())
}

/// Schedule frequency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Minutes,
    Hourly,
    Daily,
    Weekly,
    /// Approximated as 30 days
    Monthly,
}

impl Frequency {
    pub fn unit(&self) -> Duration {
        match self {
            Frequency::Minutes => Duration::minutes(1),
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
            Frequency::Monthly => Duration::days(30),
        }
    }
}

/// Recurring schedule of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default = "default_frequency")]
    pub frequency: Frequency,

    #[serde(default = "default_interval")]
    pub interval: u32,
}

fn default_frequency() -> Frequency {
    Frequency::Daily
}

fn default_interval() -> u32 {
    1
}

/// Longest period a schedule may have.
const MAX_PERIOD_DAYS: i64 = 36_500;

impl Schedule {
    /// Time between two runs.
    ///
    /// Periods longer than a century are rejected rather than overflowing
    /// the date arithmetic of the trigger evaluator.
    pub fn period(&self) -> crate::error::Result<Duration> {
        i32::try_from(self.interval)
            .ok()
            .and_then(|n| self.frequency.unit().checked_mul(n))
            .filter(|period| *period <= Duration::days(MAX_PERIOD_DAYS))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Schedule interval {} is too large (at most {} days)",
                    self.interval, MAX_PERIOD_DAYS
                ))
            })
    }
}

/// What starts a workflow automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    Event,
    #[default]
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schedule => write!(f, "schedule"),
            Self::Event => write!(f, "event"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(Self::Schedule),
            "event" => Ok(Self::Event),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown trigger type: {}", s)),
        }
    }
}

/// Record kinds an event trigger can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchedKind {
    NewCase,
    #[serde(alias = "new_data_point")]
    NewDatapoint,
}

/// Event trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTriggerConfig {
    #[serde(alias = "data_type")]
    pub watch: WatchedKind,

    /// Only fire for data points of this kind
    #[serde(default, alias = "specific_type", skip_serializing_if = "Option::is_none")]
    pub data_kind: Option<String>,
}
