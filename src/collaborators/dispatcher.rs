//! HTTP query dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::QueryDispatcher;
use crate::error::{Error, Result};
use crate::storage::{ApiTarget, TargetEndpoint};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Calls query targets over HTTP.
pub struct HttpQueryDispatcher {
    client: Client,
    timeout: Duration,
}

impl HttpQueryDispatcher {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self { client, timeout }
    }
}

/// Join the target base URL and endpoint path, filling `{param}` placeholders.
///
/// Placeholder values are percent-encoded as a single path segment.
/// Parameters consumed by a placeholder are removed from `params`.
fn build_url(base_url: &str, path: &str, params: &mut Map<String, Value>) -> String {
    let mut path = path.trim_start_matches('/').to_string();
    let keys: Vec<String> = params.keys().cloned().collect();
    for key in keys {
        let placeholder = format!("{{{}}}", key);
        if path.contains(&placeholder) {
            if let Some(value) = params.remove(&key) {
                path = path.replace(&placeholder, &encode_path_segment(&value_text(&value)));
            }
        }
    }

    if path.is_empty() {
        base_url.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }
}

/// Percent-encode every byte outside the unreserved set, `@` and `:`.
fn encode_path_segment(text: &str) -> String {
    let mut encoded = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'@' | b':' => {
                encoded.push(char::from(byte))
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl QueryDispatcher for HttpQueryDispatcher {
    async fn dispatch(
        &self,
        target: &ApiTarget,
        endpoint: &TargetEndpoint,
        params: &Map<String, Value>,
    ) -> Result<Value> {
        let mut params = params.clone();
        let url = build_url(&target.base_url, &endpoint.path, &mut params);

        let api_key = target
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());

        let mut header_auth = None;
        if let Some(key) = api_key {
            if endpoint.auth_type.as_deref() == Some("header") {
                let header = endpoint
                    .auth_header
                    .clone()
                    .unwrap_or_else(|| "x-api-key".to_string());
                header_auth = Some((header, key));
            } else {
                let param = endpoint
                    .auth_param
                    .clone()
                    .unwrap_or_else(|| "apiKey".to_string());
                params.insert(param, Value::String(key));
            }
        }

        let method = endpoint.method.to_uppercase();
        let mut request = match method.as_str() {
            "GET" => {
                let query: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| (k.clone(), value_text(v)))
                    .collect();
                self.client.get(&url).query(&query)
            }
            "POST" => self.client.post(&url).json(&params),
            other => {
                return Err(Error::Collaborator(format!(
                    "Unsupported HTTP method '{}' for {}",
                    other, target.name
                )))
            }
        };
        if let Some((header, key)) = header_auth {
            request = request.header(header, key);
        }

        debug!(api = %target.name, "{} {}", method, url);

        let response = request.timeout(self.timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Collaborator(format!("{} timed out after {:?}", target.name, self.timeout))
            } else {
                Error::Collaborator(format!("{} request failed: {}", target.name, e))
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::Collaborator(format!("Failed to read response from {}: {}", target.name, e))
        })?;

        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(Error::Collaborator(format!(
                "API error: {} - {}",
                status.as_u16(),
                snippet
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::Collaborator(format!("{} returned non-JSON body: {}", target.name, e))
        })
    }
}
