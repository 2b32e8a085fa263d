//! Error types for osintflow.
//!
//! Every variant maps to a stable code so execution records and CLI output
//! can be grepped or parsed without matching on free-form messages.

use thiserror::Error;

/// Result type alias for osintflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// osintflow error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Malformed workflow definition, rejected before anything is persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Step error: {0}")]
    Step(String),

    /// A step or sub-kind name outside the fixed set.
    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    #[error("Missing context key: {0}")]
    MissingContextKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Remote collaborator failure (query target, oracle, extractor).
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Step(_) => "STEP_ERROR",
            Error::UnknownKind(_) => "UNKNOWN_KIND",
            Error::MissingContextKey(_) => "MISSING_CONTEXT_KEY",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Collaborator(_) => "COLLABORATOR_ERROR",
            Error::Expression(_) => "EXPRESSION_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error came from the store rather than from step logic.
    ///
    /// Store failures are what the runner treats as catastrophic.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Database(_))
    }

    /// Convert to a JSON summary for CLI output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}
