//! Web page text extraction.

use std::time::Duration;

use async_trait::async_trait;
use regex_lite::Regex;
use reqwest::Client;
use tracing::{debug, warn};

use super::ContentExtractor;
use crate::error::{Error, Result};

/// Strips markup from HTML down to its readable text.
struct TextCleaner {
    hidden: Regex,
    tags: Regex,
    numeric_entity: Regex,
    whitespace: Regex,
}

impl TextCleaner {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Internal(format!("Invalid pattern {}: {}", pattern, e)))
        };
        Ok(Self {
            hidden: compile(
                r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>|<noscript\b[^>]*>.*?</noscript\s*>|<!--.*?-->",
            )?,
            tags: compile(r"(?s)<[^>]*>")?,
            numeric_entity: compile(r"&#(x[0-9a-fA-F]+|[0-9]+);")?,
            whitespace: compile(r"\s+")?,
        })
    }

    fn clean(&self, html: &str) -> String {
        let text = self.hidden.replace_all(html, " ");
        let text = self.tags.replace_all(&text, " ");
        let text = self
            .numeric_entity
            .replace_all(&text, |caps: &regex_lite::Captures| {
                let raw = &caps[1];
                let code = match raw.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => raw.parse().ok(),
                };
                code.and_then(char::from_u32)
                    .map(String::from)
                    .unwrap_or_default()
            });
        let text = text
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&amp;", "&");
        self.whitespace.replace_all(&text, " ").trim().to_string()
    }
}

/// Fetches pages over HTTP and returns their visible text.
pub struct HttpContentExtractor {
    client: Client,
    cleaner: TextCleaner,
}

impl HttpContentExtractor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("osintflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });
        Ok(Self {
            client,
            cleaner: TextCleaner::new()?,
        })
    }
}

fn validate_url(url: &str) -> Result<()> {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(())
    } else {
        Err(Error::Collaborator(format!(
            "Invalid URL '{}': only http and https are supported",
            url
        )))
    }
}

#[async_trait]
impl ContentExtractor for HttpContentExtractor {
    async fn extract(&self, url: &str) -> Result<String> {
        validate_url(url)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Collaborator(format!("Failed to fetch {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Collaborator(format!(
                "Fetching {} returned {}",
                url, status
            )));
        }

        let html = response
            .text()
            .await
            .map_err(|e| Error::Collaborator(format!("Failed to read {}: {}", url, e)))?;

        let text = self.cleaner.clean(&html);
        if text.is_empty() {
            return Err(Error::Collaborator(format!(
                "No text content could be extracted from {}",
                url
            )));
        }

        debug!(url, chars = text.len(), "Extracted page text");
        Ok(text)
    }
}
