//! Workflow definitions: typed step specifications, schedules and triggers,
//! validation, and the condition expression language.
//!
//! A workflow is an ordered list of steps. Each step is a JSON object whose
//! `type` selects one of the fixed step kinds:
//! - `api_query`: query remote targets for the case's data
//! - `llm_analysis`: ask the analysis oracle to interpret results
//! - `web_scrape`: extract text from a URL
//! - `data_store`: attach a new data point to the case
//! - `condition`: branch on an expression over the context

pub mod expression;
mod types;
mod validator;

pub use types::*;
pub use validator::{validate_definition, DefinitionDraft};
