//! Step executors.
//!
//! Each step kind is a function of (step spec, context) that returns the
//! keys to merge into the context. Executors never touch execution or step
//! records; the runner owns those.

mod api_query;
mod condition;
mod data_store;
pub mod input;
mod llm_analysis;
mod registry;
mod web_scrape;

pub use input::CaseInput;
pub use registry::StepRegistry;

use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{AnalysisOracle, ContentExtractor, QueryDispatcher};
use crate::engine::TargetRateLimiter;
use crate::storage::SqliteStorage;

/// Everything a step executor may call out to.
#[derive(Clone)]
pub struct StepServices {
    pub storage: SqliteStorage,
    pub dispatcher: Arc<dyn QueryDispatcher>,
    pub oracle: Arc<dyn AnalysisOracle>,
    pub extractor: Arc<dyn ContentExtractor>,
    /// Shared across executions so concurrent runs respect each target's budget
    pub rate_limiter: TargetRateLimiter,
    /// Pause after each target call within one step
    pub call_delay: Duration,
}
