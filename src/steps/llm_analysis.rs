//! llm_analysis step: hand case material to the analysis oracle.

use serde_json::Value;
use tracing::debug;

use super::input::{case_id, resolve_case_input};
use super::StepServices;
use crate::error::{Error, Result};
use crate::workflow::{AnalysisType, Context, LlmAnalysisSpec};

pub async fn execute(
    spec: &LlmAnalysisSpec,
    context: &Context,
    services: &StepServices,
) -> Result<Context> {
    let oracle = &services.oracle;

    let output = match spec.analysis_type {
        AnalysisType::ProcessInput => {
            let input = resolve_case_input(&services.storage, context).await?;
            let recommendation = oracle.recommend_queries(&input).await?;
            serde_json::to_value(recommendation)?
        }
        AnalysisType::AnalyzeResults => {
            let input = resolve_case_input(&services.storage, context).await?;
            oracle
                .analyze_results(&api_results(context), &input)
                .await?
        }
        AnalysisType::GenerateReport => {
            let input = resolve_case_input(&services.storage, context).await?;
            let analysis = context
                .get("data_analysis")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            oracle
                .generate_report(&analysis, &api_results(context), &input)
                .await?
        }
        AnalysisType::AnalyzeImage => {
            let case_id = case_id(context)?;
            let kind = spec.image_type.data_type();
            let point = services
                .storage
                .first_data_point(&case_id, kind)
                .await?
                .filter(|p| !p.value.is_empty())
                .ok_or_else(|| {
                    Error::NotFound(format!("No {} data point for case {}", kind, case_id))
                })?;
            oracle.analyze_image(&point.value, spec.image_type).await?
        }
    };

    let key = spec.analysis_type.output_key();
    debug!(key, "Analysis complete");

    let mut out = Context::new();
    out.insert(key.to_string(), output);
    Ok(out)
}

/// Query results accumulated so far, or none.
fn api_results(context: &Context) -> Vec<Value> {
    context
        .get("api_results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::steps::testing::{ctx, seed_case, services, services_with, FakeDispatcher, FakeOracle};
    use crate::storage::SqliteStorage;
    use crate::workflow::ImageType;

    fn spec(analysis_type: AnalysisType) -> LlmAnalysisSpec {
        LlmAnalysisSpec {
            analysis_type,
            image_type: ImageType::Primary,
        }
    }

    #[tokio::test]
    async fn test_analyze_results_rebuilds_input_from_case() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "a@b.c")]).await;
        let context = ctx(json!({"case_id": "c1", "api_results": [{"status": "success"}]}));

        let out = execute(&spec(AnalysisType::AnalyzeResults), &context, &services(storage))
            .await
            .unwrap();
        assert_eq!(out["data_analysis"]["result_count"], 1);
        assert_eq!(out["data_analysis"]["email"], "a@b.c");
    }

    #[tokio::test]
    async fn test_generate_report_uses_prior_analysis() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let context = ctx(json!({"data_analysis": {"summary": "two hits"}}));

        let out = execute(&spec(AnalysisType::GenerateReport), &context, &services(storage))
            .await
            .unwrap();
        assert_eq!(out["report"]["based_on"], "two hits");
    }

    #[tokio::test]
    async fn test_process_input_stores_recommendation() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let context = ctx(json!({"input_data": {"phone": "+1 555"}}));
        let out = execute(&spec(AnalysisType::ProcessInput), &context, &services(storage))
            .await
            .unwrap();
        assert!(out["llm_analysis"]["recommended_api_types"].is_array());
    }

    #[tokio::test]
    async fn test_analyze_image_requires_image_point() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("image", "aGVsbG8=")]).await;
        let services = services(storage);
        let context = ctx(json!({"case_id": "c1"}));

        let out = execute(&spec(AnalysisType::AnalyzeImage), &context, &services)
            .await
            .unwrap();
        assert_eq!(out["image_analysis"]["kind"], "image");

        let secondary = LlmAnalysisSpec {
            analysis_type: AnalysisType::AnalyzeImage,
            image_type: ImageType::Secondary,
        };
        let err = execute(&secondary, &context, &services).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = execute(&spec(AnalysisType::AnalyzeImage), &Context::new(), &services)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingContextKey(_)));
    }

    #[tokio::test]
    async fn test_oracle_failure_fails_step() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let services = services_with(
            storage,
            Arc::new(FakeDispatcher::default()),
            Arc::new(FakeOracle {
                unreachable: true,
                ..FakeOracle::default()
            }),
        );
        let err = execute(&spec(AnalysisType::AnalyzeResults), &Context::new(), &services)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
    }
}
