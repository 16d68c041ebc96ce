//! Append-only audit of failure events.
//!
//! A row is written when a job goes dead and when a webhook reports a hard
//! bounce. The core never updates or deletes these rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::job::JobStatus;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFailure {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub error_message: String,
    /// Status the job was observed in when the failure was recorded.
    pub last_status: JobStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a failure.
#[derive(Debug, Clone)]
pub struct NewPipelineFailure {
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub error_message: String,
    pub last_status: JobStatus,
    pub retry_count: i32,
}

impl NewPipelineFailure {
    /// Build a failure record from the job it audits.
    pub fn for_job(job: &super::job::PipelineJob, error_message: impl Into<String>) -> Self {
        Self {
            tenant_id: job.tenant_id,
            job_id: job.id,
            campaign_id: Some(job.campaign_id),
            contact_id: Some(job.contact_id),
            error_message: error_message.into(),
            last_status: job.status,
            retry_count: job.retry_count,
        }
    }
}
