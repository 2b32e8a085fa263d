//! Step dispatch over the fixed set of step kinds.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::{api_query, condition, data_store, llm_analysis, web_scrape, StepServices};
use crate::error::Result;
use crate::workflow::{Context, StepSpec};

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<Context>> + Send + 'a>>;

/// Runs raw step objects against the shared services.
#[derive(Clone)]
pub struct StepRegistry {
    services: StepServices,
}

impl StepRegistry {
    pub fn new(services: StepServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &StepServices {
        &self.services
    }

    /// Parse `raw` and execute it with `context`, returning the keys to merge.
    ///
    /// Boxed because condition steps execute their branches through here.
    pub fn execute<'a>(&'a self, raw: &'a Value, context: &'a Context) -> StepFuture<'a> {
        Box::pin(async move {
            let spec = StepSpec::from_value(raw)?;
            self.execute_spec(&spec, context).await
        })
    }

    pub async fn execute_spec(&self, spec: &StepSpec, context: &Context) -> Result<Context> {
        let services = &self.services;
        match spec {
            StepSpec::ApiQuery(s) => api_query::execute(s, context, services).await,
            StepSpec::LlmAnalysis(s) => llm_analysis::execute(s, context, services).await,
            StepSpec::WebScrape(s) => web_scrape::execute(s, context, services).await,
            StepSpec::DataStore(s) => data_store::execute(s, context, services).await,
            StepSpec::Condition(s) => condition::execute(s, context, self).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Error;
    use crate::steps::testing::services;
    use crate::storage::SqliteStorage;

    #[tokio::test]
    async fn test_unknown_kind_at_run_time() {
        let registry = StepRegistry::new(services(SqliteStorage::open_in_memory().unwrap()));
        let err = registry
            .execute(&json!({"type": "teleport"}), &Context::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKind(_)));
    }

    #[tokio::test]
    async fn test_dispatches_by_kind() {
        let registry = StepRegistry::new(services(SqliteStorage::open_in_memory().unwrap()));
        let out = registry
            .execute(
                &json!({"type": "web_scrape", "url": "https://example.com"}),
                &Context::new(),
            )
            .await
            .unwrap();
        assert_eq!(out["scraped_content"], "scraped text");
    }
}
