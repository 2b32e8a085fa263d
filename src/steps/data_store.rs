//! data_store step: attach a data point to the case.

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use super::input::case_id;
use super::StepServices;
use crate::error::{Error, Result};
use crate::storage::DataPoint;
use crate::workflow::{context_reference, Context, DataStoreSpec, StoreType};

pub async fn execute(
    spec: &DataStoreSpec,
    context: &Context,
    services: &StepServices,
) -> Result<Context> {
    match spec.store_type {
        StoreType::Datapoint => {}
    }

    let case_id = case_id(context)?;
    let data_type = spec
        .data_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Step("Data type is required for storing data points".into()))?;

    let value = resolve_value(spec, context)?;

    if services.storage.get_case(&case_id).await?.is_none() {
        return Err(Error::NotFound(format!("Case {}", case_id)));
    }

    let point = DataPoint {
        id: uuid::Uuid::new_v4().to_string(),
        case_id: case_id.clone(),
        data_type: data_type.to_string(),
        value,
        created_at: Utc::now(),
    };
    services.storage.create_data_point(&point).await?;
    info!(case_id = %case_id, data_type, "Stored data point {}", point.id);

    let mut out = Context::new();
    out.insert("datapoint_id".into(), Value::String(point.id));
    Ok(out)
}

/// The value to store: a referenced context value, the literal `value`, or
/// a non-reference `value_source` taken as a literal.
fn resolve_value(spec: &DataStoreSpec, context: &Context) -> Result<String> {
    let source = spec.value_source.as_deref();

    let value = match source.and_then(context_reference) {
        Some(key) => context
            .get(key)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| Error::MissingContextKey(key.to_string()))?,
        None => match (&spec.value, source) {
            (Some(value), _) => value.clone(),
            (None, Some(literal)) => Value::String(literal.to_string()),
            (None, None) => {
                return Err(Error::Step("No value to store".into()));
            }
        },
    };

    match value {
        Value::String(s) => Ok(s),
        Value::Null => Err(Error::Step("No value to store".into())),
        other => Ok(serde_json::to_string(&other)?),
    }
}
