//! Analysis oracle backed by an OpenAI-compatible chat-completions API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{AnalysisOracle, QueryRecommendation};
use crate::config::OracleConfig;
use crate::error::{Error, Result};
use crate::steps::CaseInput;
use crate::workflow::ImageType;

const IMAGE_PROMPT: &str = "Analyze this image for OSINT purposes. Identify visible details \
    that could be useful for intelligence gathering such as location indicators, identifiable \
    objects, text and landmarks.";

/// Chat-completions client.
pub struct ChatOracle {
    client: Client,
    endpoint: String,
    model: String,
    vision_model: String,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatOracle {
    pub fn new(config: &OracleConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(
                "{} is not set; analysis requests will be sent without a key",
                config.api_key_env
            );
        }

        Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    async fn complete(&self, model: &str, messages: Value, json_mode: bool) -> Result<String> {
        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let start = std::time::Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| Error::Collaborator(format!("Oracle request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Collaborator(format!(
                "Oracle API error ({}): {}",
                status, error_text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Collaborator(format!("Failed to parse oracle response: {}", e)))?;

        info!(model, "Oracle response received ({}ms)", start.elapsed().as_millis());

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Collaborator("Oracle returned no content".into()))
    }

    async fn complete_json(&self, system: &str, prompt: String) -> Result<Value> {
        let messages = json!([
            {"role": "system", "content": system},
            {"role": "user", "content": prompt},
        ]);
        let content = self.complete(&self.model, messages, true).await?;
        parse_json_reply(&content)
    }
}

/// Parse a model reply as JSON, tolerating prose around the payload.
fn parse_json_reply(content: &str) -> Result<Value> {
    match serde_json::from_str(content) {
        Ok(parsed) => Ok(parsed),
        Err(e) => {
            debug!("Oracle reply is not bare JSON ({}), searching for an object", e);
            extract_json(content).ok_or_else(|| {
                Error::Collaborator("Oracle reply did not contain a JSON object".into())
            })
        }
    }
}

/// Try to extract JSON from a string that may contain extra text.
fn extract_json(s: &str) -> Option<Value> {
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (s.find(open), s.rfind(close)) {
            if start < end {
                if let Ok(parsed) = serde_json::from_str(&s[start..=end]) {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

fn describe_input(input: &CaseInput) -> String {
    let field = |v: &Option<String>| v.clone().unwrap_or_else(|| "Not provided".to_string());
    format!(
        "Name: {}\nPhone Number: {}\nEmail: {}\nSocial Media Handles: {}\n\
         Last Known Location: {}\nVehicle Information: {}\nAdditional Information: {}\n\
         Image Provided: {}",
        field(&input.name),
        field(&input.phone),
        field(&input.email),
        field(&input.social_media),
        field(&input.location),
        field(&input.vehicle),
        field(&input.additional_info),
        if input.has_image { "Yes" } else { "No" },
    )
}

#[async_trait]
impl AnalysisOracle for ChatOracle {
    async fn recommend_queries(&self, input: &CaseInput) -> Result<QueryRecommendation> {
        let prompt = format!(
            "Here is the input data:\n{}\n\nDetermine which types of APIs would be most useful \
             to query (email, phone, social_media, domain, location, vehicle, image, business).\n\
             Respond with JSON: {{\"recommended_api_types\": [...], \
             \"recommended_api_categories\": [...], \
             \"query_parameters\": {{\"<data kind>\": [\"values\"]}}, \"reasoning\": \"...\"}}",
            describe_input(input)
        );
        let reply = self
            .complete_json(
                "You are an OSINT specialist analyzing data to determine API query strategies.",
                prompt,
            )
            .await?;
        serde_json::from_value(reply)
            .map_err(|e| Error::Collaborator(format!("Malformed query recommendation: {}", e)))
    }

    async fn analyze_results(&self, results: &[Value], input: &CaseInput) -> Result<Value> {
        let prompt = format!(
            "Original input data:\n{}\n\nAPI results:\n{}\n\nAnalyze these results. Respond \
             with JSON containing \"summary\", \"key_findings\", \"connections\", \
             \"confidence_assessment\" and \"recommendations\".",
            describe_input(input),
            serde_json::to_string_pretty(results)?
        );
        self.complete_json(
            "You are an OSINT analyst reviewing intelligence data.",
            prompt,
        )
        .await
    }

    async fn generate_report(
        &self,
        analysis: &Value,
        results: &[Value],
        input: &CaseInput,
    ) -> Result<Value> {
        let prompt = format!(
            "Original input data:\n{}\n\nAnalysis:\n{}\n\nNumber of API results: {}\n\n\
             Write an intelligence report. Respond with JSON containing \"title\", \
             \"executive_summary\", \"subject_profile\", \"findings\", \"conclusions\" and \
             \"recommendations\".",
            describe_input(input),
            serde_json::to_string_pretty(analysis)?,
            results.len()
        );
        self.complete_json(
            "You are an OSINT specialist creating a professional intelligence report.",
            prompt,
        )
        .await
    }

    async fn analyze_image(&self, image: &str, image_type: ImageType) -> Result<Value> {
        let url = if image.starts_with("http://")
            || image.starts_with("https://")
            || image.starts_with("data:")
        {
            image.to_string()
        } else {
            format!("data:image/jpeg;base64,{}", image)
        };

        let messages = json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": IMAGE_PROMPT},
                {"type": "image_url", "image_url": {"url": url}},
            ]
        }]);
        let content = self.complete(&self.vision_model, messages, false).await?;
        debug!(?image_type, "Image analysis complete");
        Ok(Value::String(content))
    }
}
