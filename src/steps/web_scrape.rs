//! web_scrape step.

use serde_json::Value;

use super::StepServices;
use crate::error::{Error, Result};
use crate::workflow::{context_reference, Context, WebScrapeSpec};

pub async fn execute(
    spec: &WebScrapeSpec,
    context: &Context,
    services: &StepServices,
) -> Result<Context> {
    let url = match context_reference(&spec.url) {
        Some(key) => match context.get(key) {
            Some(Value::String(url)) if !url.is_empty() => url.clone(),
            _ => return Err(Error::MissingContextKey(key.to_string())),
        },
        None => spec.url.clone(),
    };

    let text = services.extractor.extract(&url).await?;

    let mut out = Context::new();
    out.insert(spec.result_key.clone(), Value::String(text));
    Ok(out)
}
