//! Error taxonomy for the send pipeline.
//!
//! Two families: [`StoreError`] covers job-store failures (unknown rows,
//! rejected transitions, database errors); [`PipelineError`] covers worker
//! attempt failures and carries the retryability the broker and the failure
//! hook act on.

use thiserror::Error;
use uuid::Uuid;

use super::models::{JobStatus, SkipReason};

// ============================================================================
// Store errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pipeline job {0} not found")]
    JobNotFound(Uuid),

    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Worker errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The validator rejected the address; the worker skips, not fails.
    #[error("invalid recipient: {message}")]
    InvalidRecipient {
        reason: SkipReason,
        message: String,
    },

    #[error("template version {0} not found")]
    TemplateNotFound(Uuid),

    #[error("contact {0} not found")]
    ContactNotFound(Uuid),

    /// The job row vanished; nothing may be marked.
    #[error("pipeline job {0} not found")]
    PipelineJobNotFound(Uuid),

    /// Provider-level send failure. Retryable unless the provider said the
    /// request can never succeed.
    #[error("send failed: {message}")]
    SendFailed { message: String, retryable: bool },

    #[error("channel not supported: {0}")]
    ChannelNotSupported(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Collaborator infrastructure failure (contact or template service
    /// unreachable). Transient by definition.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the broker (or retry controller) should reschedule the job.
    pub fn retryable(&self) -> bool {
        match self {
            PipelineError::SendFailed { retryable, .. } => *retryable,
            // Infrastructure trouble is worth retrying.
            PipelineError::Store(StoreError::Database(_)) => true,
            PipelineError::Internal(_) => true,
            _ => false,
        }
    }

    /// Stable machine-readable code for logs and failure rows.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidRecipient { .. } => "invalid_recipient",
            PipelineError::TemplateNotFound(_) => "template_not_found",
            PipelineError::ContactNotFound(_) => "contact_not_found",
            PipelineError::PipelineJobNotFound(_) => "pipeline_job_not_found",
            PipelineError::SendFailed { .. } => "send_failed",
            PipelineError::ChannelNotSupported(_) => "channel_not_supported",
            PipelineError::Store(_) => "store_error",
            PipelineError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(PipelineError::SendFailed {
            message: "connection reset".to_string(),
            retryable: true,
        }
        .retryable());

        assert!(!PipelineError::SendFailed {
            message: "invalid recipient".to_string(),
            retryable: false,
        }
        .retryable());

        assert!(!PipelineError::ContactNotFound(Uuid::new_v4()).retryable());
        assert!(!PipelineError::TemplateNotFound(Uuid::new_v4()).retryable());
        assert!(!PipelineError::PipelineJobNotFound(Uuid::new_v4()).retryable());
        assert!(!PipelineError::ChannelNotSupported("fax".to_string()).retryable());
        assert!(!PipelineError::InvalidRecipient {
            reason: SkipReason::InvalidEmail,
            message: "no at sign".to_string(),
        }
        .retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            PipelineError::ChannelNotSupported("fax".to_string()).code(),
            "channel_not_supported"
        );
        assert_eq!(
            PipelineError::SendFailed {
                message: "x".to_string(),
                retryable: true
            }
            .code(),
            "send_failed"
        );
    }
}
