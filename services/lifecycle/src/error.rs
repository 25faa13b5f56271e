//! Error taxonomy for the photo lifecycle pipeline.
//!
//! No synchronous caller ever sees these errors. Each one resolves into a
//! redelivery (transport failures, rejected formats), a dead-letter (once
//! the retry budget is spent), or a dropped message (malformed input).

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while processing pipeline messages
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Uploaded object has an extension outside the allowed set
    #[error("Rejected object {key}: extension {extension:?} is not allowed")]
    RejectedFormat { key: String, extension: String },

    /// Required fields are missing or have the wrong shape
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Status value outside `{Pass, Reject}`
    #[error("Invalid status value: {0:?}")]
    InvalidEnumValue(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error("Processing deadline of {0:?} exceeded")]
    Timeout(Duration),
}

impl PipelineError {
    /// Whether the error came from a collaborator (store, queue, mail) rather
    /// than from the message itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_)
                | PipelineError::ObjectStore(_)
                | PipelineError::Queue(_)
                | PipelineError::Mail(_)
                | PipelineError::Timeout(_)
        )
    }

    /// Short, stable label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::RejectedFormat { .. } => "rejected_format",
            PipelineError::MalformedMessage(_) => "malformed_message",
            PipelineError::InvalidEnumValue(_) => "invalid_enum_value",
            PipelineError::Database(_) => "database",
            PipelineError::ObjectStore(_) => "object_store",
            PipelineError::Queue(_) => "queue",
            PipelineError::Mail(_) => "mail",
            PipelineError::Timeout(_) => "timeout",
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
