//! osintflow - scheduled and event-driven OSINT workflow engine
//!
//! osintflow runs ordered investigation workflows against cases. A workflow
//! is a list of steps that share a JSON context; each step reads from it and
//! merges its output back in.
//!
//! ## Key Features
//!
//! - **Five step kinds**: `api_query`, `llm_analysis`, `web_scrape`,
//!   `data_store` and `condition` (with nested branches)
//! - **Triggers**: fixed-interval schedules and new-case / new-data-point events
//! - **Audit trail**: every execution and step is recorded in SQLite
//! - **Bounded concurrency**: at most one run per workflow at a time
//!
//! ## Example
//!
//! ```yaml
//! name: email-sweep
//! description: Look up every new email address and keep the profile text
//! trigger_type: event
//! trigger_config:
//!   watch: new_datapoint
//!   data_kind: email
//!
//! steps:
//!   - type: api_query
//!     api_selection: auto
//!
//!   - type: llm_analysis
//!     analysis_type: analyze_results
//!
//!   - type: web_scrape
//!     url: "$profile_url"
//!
//!   - type: condition
//!     condition: "$scraped_content != ''"
//!     then:
//!       - type: data_store
//!         store_type: datapoint
//!         data_type: profile_text
//!         value_source: "$scraped_content"
//! ```

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod shutdown;
pub mod steps;
pub mod storage;
pub mod triggers;
pub mod workflow;

pub use engine::WorkflowEngine;
pub use error::{Error, Result};
