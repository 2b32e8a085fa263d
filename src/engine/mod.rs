//! Execution engine for workflows.

mod facade;
mod pool;
pub mod rate_limiter;
mod runner;

pub use facade::WorkflowEngine;
pub use pool::RunPool;
pub use rate_limiter::{RateLimitConfig, TargetRateLimiter};
pub use runner::ExecutionRunner;
