//! Case input reconstruction shared by the query and analysis steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::storage::{DataPoint, SqliteStorage};
use crate::workflow::Context;

/// What is known about the subject of a case, flattened from its data points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_media: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
    #[serde(default)]
    pub has_image: bool,
    #[serde(default)]
    pub has_secondary_image: bool,
}

impl CaseInput {
    /// Build the input from a case's data points, in creation order.
    ///
    /// The last data point of each recognized kind wins. Images only set a
    /// presence flag; unrecognized kinds are ignored.
    pub fn from_data_points(points: &[DataPoint]) -> Self {
        let mut input = Self::default();
        for point in points {
            let value = Some(point.value.clone());
            match point.data_type.as_str() {
                "name" => input.name = value,
                "phone" => input.phone = value,
                "email" => input.email = value,
                "social_media" => input.social_media = value,
                "location" => input.location = value,
                "vehicle" => input.vehicle = value,
                "additional_info" => input.additional_info = value,
                "image" => input.has_image = true,
                "secondary_image" => input.has_secondary_image = true,
                _ => {}
            }
        }
        input
    }

    /// Non-empty text fields as `(kind, value)` pairs.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("name", &self.name),
            ("phone", &self.phone),
            ("email", &self.email),
            ("social_media", &self.social_media),
            ("location", &self.location),
            ("vehicle", &self.vehicle),
            ("additional_info", &self.additional_info),
        ]
        .into_iter()
        .filter_map(|(kind, value)| {
            value
                .as_deref()
                .filter(|v| !v.trim().is_empty())
                .map(|v| (kind, v))
        })
        .collect()
    }
}

/// The case id carried in the context.
pub fn case_id(context: &Context) -> Result<String> {
    match context.get("case_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::MissingContextKey("case_id".into())),
    }
}

/// Rebuild the input of a stored case.
pub async fn load_case_input(storage: &SqliteStorage, case_id: &str) -> Result<CaseInput> {
    if storage.get_case(case_id).await?.is_none() {
        return Err(Error::NotFound(format!("Case {}", case_id)));
    }
    let points = storage.list_data_points(case_id).await?;
    Ok(CaseInput::from_data_points(&points))
}

/// Input for analysis steps: `input_data` from the context if present,
/// otherwise rebuilt from the case, otherwise empty.
pub async fn resolve_case_input(storage: &SqliteStorage, context: &Context) -> Result<CaseInput> {
    if let Some(raw) = context.get("input_data").filter(|v| !v.is_null()) {
        return serde_json::from_value(raw.clone())
            .map_err(|e| Error::Step(format!("Malformed input_data in context: {}", e)));
    }
    match case_id(context) {
        Ok(id) => load_case_input(storage, &id).await,
        Err(_) => Ok(CaseInput::default()),
    }
}
