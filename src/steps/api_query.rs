//! api_query step: query remote targets for the case's data.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::input::{case_id, load_case_input};
use super::StepServices;
use crate::collaborators::QueryRecommendation;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{ApiResult, ApiTarget, QueryStatus, TargetEndpoint};
use crate::workflow::{ApiQuerySpec, ApiSelection, Context};

pub async fn execute(
    spec: &ApiQuerySpec,
    context: &Context,
    services: &StepServices,
) -> Result<Context> {
    let case_id = case_id(context)?;
    let input = load_case_input(&services.storage, &case_id).await?;

    let (recommendation, targets) = match spec.api_selection {
        ApiSelection::Auto => {
            let recommendation = services.oracle.recommend_queries(&input).await?;
            let targets = select_targets(services, &recommendation).await?;
            (recommendation, targets)
        }
        ApiSelection::Explicit => {
            if spec.api_ids.is_empty() {
                return Err(Error::Step("No targets specified for query".into()));
            }

            let mut query_parameters = Map::new();
            for (kind, value) in input.fields() {
                query_parameters.insert(kind.to_string(), json!([value]));
            }
            for (kind, value) in &spec.parameters {
                let values = match value {
                    Value::Array(_) => value.clone(),
                    other => Value::Array(vec![other.clone()]),
                };
                query_parameters.insert(kind.clone(), values);
            }

            let mut targets = Vec::with_capacity(spec.api_ids.len());
            for id in &spec.api_ids {
                let target = services
                    .storage
                    .get_target(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("Query target {}", id)))?;
                targets.push(target);
            }

            let recommendation = QueryRecommendation {
                recommended_api_types: spec.api_types.clone(),
                recommended_api_categories: spec.api_categories.clone(),
                query_parameters,
                reasoning: None,
            };
            (recommendation, targets)
        }
    };

    info!(
        case_id = %case_id,
        targets = targets.len(),
        "Querying targets"
    );

    let mut results = Vec::new();
    for target in &targets {
        for (endpoint_name, endpoint) in &target.endpoints {
            let Some(params) = endpoint_params(endpoint, &recommendation.query_parameters) else {
                debug!(
                    api = %target.name,
                    endpoint = %endpoint_name,
                    "Skipping endpoint with no matching parameters"
                );
                continue;
            };

            services.rate_limiter.acquire(&target.id).await;
            let outcome = services.dispatcher.dispatch(target, endpoint, &params).await;

            let record = match outcome {
                Ok(body) => {
                    metrics::record_target_query("success");
                    api_result(&case_id, target, endpoint_name, &params, Ok(body))
                }
                Err(e) => {
                    metrics::record_target_query("error");
                    warn!(api = %target.name, endpoint = %endpoint_name, "Target query failed: {}", e);
                    api_result(&case_id, target, endpoint_name, &params, Err(e.to_string()))
                }
            };
            services.storage.save_api_result(&record).await?;
            results.push(serde_json::to_value(&record)?);

            if !services.call_delay.is_zero() {
                tokio::time::sleep(services.call_delay).await;
            }
        }
    }

    let mut output = Context::new();
    output.insert("api_results".into(), Value::Array(results));
    Ok(output)
}

/// Catalog targets matching the recommendation, plus directory targets
/// registered under a recommended category, without duplicates.
async fn select_targets(
    services: &StepServices,
    recommendation: &QueryRecommendation,
) -> Result<Vec<ApiTarget>> {
    let types: Vec<String> = recommendation
        .recommended_api_types
        .iter()
        .map(|t| t.to_lowercase())
        .collect();
    let categories: Vec<String> = recommendation
        .recommended_api_categories
        .iter()
        .map(|c| c.to_lowercase())
        .collect();

    let mut seen = HashSet::new();
    let mut selected = Vec::new();

    for target in services.storage.list_targets().await? {
        let category = target.category.as_deref().unwrap_or("").to_lowercase();
        let name = target.name.to_lowercase();
        let description = target.description.to_lowercase();

        let matches = (!category.is_empty()
            && (types.contains(&category) || categories.contains(&category)))
            || types
                .iter()
                .any(|t| name.contains(t.as_str()) || description.contains(t.as_str()));

        if matches && seen.insert(target.id.clone()) {
            selected.push(target);
        }
    }

    for category in types.iter().chain(categories.iter()) {
        for target in services.storage.directory_targets(category).await? {
            if seen.insert(target.id.clone()) {
                selected.push(target);
            }
        }
    }

    Ok(selected)
}

/// Request parameters for one endpoint.
///
/// A parameter kind applies when it appears in the endpoint's declared
/// type. The value is sent under the endpoint's parameter name; with
/// several applicable values the last one wins. `None` when nothing applies.
fn endpoint_params(
    endpoint: &TargetEndpoint,
    query_parameters: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let endpoint_type = endpoint.param_type.to_lowercase();
    let mut chosen = None;

    for (kind, values) in query_parameters {
        if kind.is_empty() || !endpoint_type.contains(&kind.to_lowercase()) {
            continue;
        }
        let values: Vec<&Value> = match values {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for value in values {
            let text = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            if !text.is_empty() {
                chosen = Some(text);
            }
        }
    }

    chosen.map(|value| {
        let mut params = Map::new();
        params.insert(endpoint.param_name.clone(), Value::String(value));
        params
    })
}

fn api_result(
    case_id: &str,
    target: &ApiTarget,
    endpoint_name: &str,
    params: &Map<String, Value>,
    outcome: std::result::Result<Value, String>,
) -> ApiResult {
    let (status, result, error_message) = match outcome {
        Ok(body) => (QueryStatus::Success, Some(body), None),
        Err(message) => (QueryStatus::Error, None, Some(message)),
    };
    ApiResult {
        id: uuid::Uuid::new_v4().to_string(),
        case_id: case_id.to_string(),
        target_id: target.id.clone(),
        api_name: target.name.clone(),
        endpoint: endpoint_name.to_string(),
        query_params: Value::Object(params.clone()),
        result,
        status,
        error_message,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::steps::testing::{
        ctx, seed_case, seed_target, services, services_with, FakeDispatcher, FakeOracle,
    };
    use crate::storage::SqliteStorage;

    fn explicit(ids: Vec<String>) -> ApiQuerySpec {
        ApiQuerySpec {
            api_ids: ids,
            ..ApiQuerySpec::default()
        }
    }

    #[test]
    fn test_endpoint_params_matching() {
        let endpoint = TargetEndpoint {
            path: "/".into(),
            method: "GET".into(),
            param_type: "Email,Phone".into(),
            param_name: "term".into(),
            auth_type: None,
            auth_header: None,
            auth_param: None,
        };
        let params = ctx(json!({
            "email": ["a@b.c"],
            "phone": "+1 555",
            "vehicle": ["AB-12-CD"]
        }));
        let chosen = endpoint_params(&endpoint, &params).unwrap();
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen["term"], "+1 555");

        let only_vehicle = ctx(json!({"vehicle": ["AB-12-CD"], "email": ["  "]}));
        assert!(endpoint_params(&endpoint, &only_vehicle).is_none());
    }

    #[tokio::test]
    async fn test_explicit_requires_targets() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "a@b.c")]).await;
        let err = execute(
            &explicit(vec![]),
            &ctx(json!({"case_id": "c1"})),
            &services(storage),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Step(_)));
    }

    #[tokio::test]
    async fn test_missing_case_id_and_unknown_case() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let services = services(storage);
        let spec = explicit(vec!["t".into()]);

        let err = execute(&spec, &Context::new(), &services).await.unwrap_err();
        assert!(matches!(err, Error::MissingContextKey(_)));

        let err = execute(&spec, &ctx(json!({"case_id": "ghost"})), &services)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_explicit_unknown_target_is_not_found() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "a@b.c")]).await;
        let err = execute(
            &explicit(vec!["missing".into()]),
            &ctx(json!({"case_id": "c1"})),
            &services(storage),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_explicit_per_target_errors_are_captured() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "a@b.c")]).await;
        let good = seed_target(&storage, "mailcheck", "email", "email").await;
        let bad = seed_target(&storage, "breachdb", "email", "email").await;

        let dispatcher = Arc::new(FakeDispatcher {
            failing: vec!["breachdb".into()],
            ..FakeDispatcher::default()
        });
        let services = services_with(
            storage.clone(),
            dispatcher.clone(),
            Arc::new(FakeOracle::default()),
        );

        let out = execute(
            &explicit(vec![good, bad]),
            &ctx(json!({"case_id": "c1"})),
            &services,
        )
        .await
        .unwrap();

        let results = out["api_results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["status"], "success");
        assert_eq!(results[1]["status"], "error");
        assert!(results[1]["error_message"]
            .as_str()
            .unwrap()
            .contains("503"));

        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls[0].1["q"], "a@b.c");
        drop(calls);

        assert_eq!(storage.list_api_results("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_step_parameters_override_case_input() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "case@b.c")]).await;
        let target = seed_target(&storage, "mailcheck", "email", "email").await;

        let dispatcher = Arc::new(FakeDispatcher::default());
        let services = services_with(
            storage,
            dispatcher.clone(),
            Arc::new(FakeOracle::default()),
        );
        let mut spec = explicit(vec![target]);
        spec.parameters = ctx(json!({"email": "override@b.c"}));

        execute(&spec, &ctx(json!({"case_id": "c1"})), &services)
            .await
            .unwrap();
        assert_eq!(dispatcher.calls.lock().unwrap()[0].1["q"], "override@b.c");
    }

    #[tokio::test]
    async fn test_auto_selects_by_category_and_directory() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "a@b.c"), ("phone", "+1 555")]).await;
        seed_target(&storage, "mailcheck", "email", "email").await;
        seed_target(&storage, "plates", "vehicle", "vehicle").await;
        let numbers = seed_target(&storage, "numbers", "telecom", "phone").await;
        storage.add_to_directory("Phone", &numbers).await.unwrap();

        let dispatcher = Arc::new(FakeDispatcher::default());
        let oracle = Arc::new(FakeOracle {
            recommendation: QueryRecommendation {
                recommended_api_types: vec!["email".into()],
                recommended_api_categories: vec!["phone".into()],
                query_parameters: ctx(json!({"email": ["a@b.c"], "phone": ["+1 555"]})),
                reasoning: None,
            },
            unreachable: false,
        });
        let services = services_with(storage, dispatcher.clone(), oracle);

        let out = execute(
            &ApiQuerySpec {
                api_selection: ApiSelection::Auto,
                ..ApiQuerySpec::default()
            },
            &ctx(json!({"case_id": "c1"})),
            &services,
        )
        .await
        .unwrap();

        assert_eq!(out["api_results"].as_array().unwrap().len(), 2);
        let called: Vec<String> = dispatcher
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        assert_eq!(called, vec!["mailcheck".to_string(), "numbers".to_string()]);
    }

    #[tokio::test]
    async fn test_auto_fails_when_oracle_unreachable() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        seed_case(&storage, "c1", &[("email", "a@b.c")]).await;
        let services = services_with(
            storage,
            Arc::new(FakeDispatcher::default()),
            Arc::new(FakeOracle {
                unreachable: true,
                ..FakeOracle::default()
            }),
        );
        let err = execute(
            &ApiQuerySpec {
                api_selection: ApiSelection::Auto,
                ..ApiQuerySpec::default()
            },
            &ctx(json!({"case_id": "c1"})),
            &services,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Collaborator(_)));
    }
}
