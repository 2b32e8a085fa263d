//! Remote services the step executors call.
//!
//! Each collaborator is a trait so executions can be driven by fakes in
//! tests. The production implementations talk HTTP through `reqwest` and
//! carry their own per-request timeouts, independent of engine shutdown.

mod dispatcher;
mod extractor;
mod oracle;

pub use dispatcher::HttpQueryDispatcher;
pub use extractor::HttpContentExtractor;
pub use oracle::ChatOracle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::steps::CaseInput;
use crate::storage::{ApiTarget, TargetEndpoint};
use crate::workflow::ImageType;

/// Performs one call against a query target endpoint.
#[async_trait]
pub trait QueryDispatcher: Send + Sync {
    /// Call `endpoint` of `target` with request parameters `params`.
    ///
    /// Returns the decoded JSON body. Timeouts, non-success statuses and
    /// malformed bodies are errors.
    async fn dispatch(
        &self,
        target: &ApiTarget,
        endpoint: &TargetEndpoint,
        params: &Map<String, Value>,
    ) -> Result<Value>;
}

/// Which targets to query, and with what.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRecommendation {
    #[serde(default)]
    pub recommended_api_types: Vec<String>,

    #[serde(default)]
    pub recommended_api_categories: Vec<String>,

    /// Data kind to the values to query for it
    #[serde(default)]
    pub query_parameters: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Turns unstructured case material into structured interpretation.
#[async_trait]
pub trait AnalysisOracle: Send + Sync {
    /// Decide which kinds of targets are worth querying for this input.
    async fn recommend_queries(&self, input: &CaseInput) -> Result<QueryRecommendation>;

    /// Interpret the collected query results.
    async fn analyze_results(&self, results: &[Value], input: &CaseInput) -> Result<Value>;

    /// Produce the final report from an analysis and the raw results.
    async fn generate_report(
        &self,
        analysis: &Value,
        results: &[Value],
        input: &CaseInput,
    ) -> Result<Value>;

    /// Describe an image (base64 or URL, as stored on the data point).
    async fn analyze_image(&self, image: &str, image_type: ImageType) -> Result<Value>;
}

/// Fetches a page and returns its readable text.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<String>;
}
