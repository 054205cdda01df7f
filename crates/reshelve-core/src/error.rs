use crate::model::ExecutionReport;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Root directory not found: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] crate::rules::TemplateError),

    #[error("Malformed advisor response: {0}")]
    AdvisorResponseMalformed(String),

    #[error("Advisor error: {0}")]
    Advisor(String),

    /// The undo log could not be written. `report` covers everything that
    /// happened before and after the failure.
    #[error("Undo log unavailable, apply stopped: {reason}")]
    UndoLogFailed {
        reason: String,
        report: Box<ExecutionReport>,
    },

    #[error("{0}")]
    Other(String),
}
