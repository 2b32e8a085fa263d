//! Trigger implementations.
//!
//! Triggers decide when a workflow runs without being asked:
//! - Schedule: every `interval` units since the last run started
//! - Event: once per case or data point inserted since the last check
//! - Manual workflows only run through the engine facade

mod evaluator;
mod scheduler;

pub use evaluator::{is_due, PendingEvents, TriggerEvaluator};
pub use scheduler::{Scheduler, TickSummary};
