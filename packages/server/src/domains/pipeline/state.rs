//! The job state machine.
//!
//! Every job mutation funnels through [`apply`]: it validates the edge
//! against the transition table, stamps the per-state timestamp, and merges
//! caller-supplied field updates into a new row image. Store implementations
//! persist the result under a row lock, which makes per-job transitions
//! linearizable.

use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::models::{JobStatus, PipelineJob, SkipReason};

/// Allowed outgoing edges per state. `Delivered` and `Skipped` are terminal;
/// `Dead -> Pending` and `Failed -> Pending` are the operator escape hatch.
pub fn allowed_transitions(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Pending => &[Queued, Skipped, Failed],
        Queued => &[Processing, Skipped, Failed],
        Processing => &[Sent, Failed, Skipped, Dead],
        Sent => &[Delivered, Failed],
        Delivered => &[],
        Failed => &[Retrying, Dead, Pending],
        Retrying => &[Queued, Processing, Sent, Failed, Dead],
        Dead => &[Pending],
        Skipped => &[],
    }
}

/// Whether `from -> to` is a legal edge. Self-transitions never are.
pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
    from != to && allowed_transitions(from).contains(&to)
}

/// Caller-supplied updates applied alongside a transition. `None` leaves the
/// column untouched.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub error_message: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub provider_message_id: Option<String>,
    pub retry_count: Option<i32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl TransitionFields {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Compute the row image a transition produces.
///
/// On success the returned job carries the new status, its per-state
/// timestamp stamped with `now` (on *every* entry, not only the first), the
/// merged field updates, and a refreshed `updated_at`. Re-entering `Pending`
/// clears `next_attempt_at` and `error_message` so the job reads as freshly
/// enqueueable.
pub fn apply(
    job: &PipelineJob,
    to: JobStatus,
    fields: TransitionFields,
    now: DateTime<Utc>,
) -> Result<PipelineJob, StoreError> {
    if !is_valid_transition(job.status, to) {
        return Err(StoreError::InvalidStateTransition {
            job_id: job.id,
            from: job.status,
            to,
        });
    }

    let mut next = job.clone();
    next.status = to;

    match to {
        JobStatus::Queued => next.queued_at = Some(now),
        JobStatus::Processing => next.processing_at = Some(now),
        JobStatus::Sent => next.sent_at = Some(now),
        JobStatus::Delivered => next.delivered_at = Some(now),
        JobStatus::Failed => next.failed_at = Some(now),
        JobStatus::Skipped => next.skipped_at = Some(now),
        // Pending, Retrying and Dead have no dedicated timestamp.
        JobStatus::Pending | JobStatus::Retrying | JobStatus::Dead => {}
    }

    if to == JobStatus::Pending {
        next.next_attempt_at = None;
        next.error_message = None;
    }

    if let Some(error_message) = fields.error_message {
        next.error_message = Some(error_message);
    }
    if let Some(skip_reason) = fields.skip_reason {
        next.skip_reason = Some(skip_reason);
    }
    if let Some(provider_message_id) = fields.provider_message_id {
        next.provider_message_id = Some(provider_message_id);
    }
    if let Some(retry_count) = fields.retry_count {
        next.retry_count = retry_count;
    }
    if let Some(next_attempt_at) = fields.next_attempt_at {
        next.next_attempt_at = Some(next_attempt_at);
    }

    next.updated_at = now;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::domains::pipeline::models::Channel;

    fn job_in(status: JobStatus) -> PipelineJob {
        let mut job = PipelineJob::builder()
            .tenant_id(Uuid::new_v4())
            .campaign_id(Uuid::new_v4())
            .campaign_run_id(Uuid::new_v4())
            .contact_id(Uuid::new_v4())
            .channel(Channel::Email)
            .build();
        job.status = status;
        job
    }

    #[test]
    fn every_edge_in_the_table_is_accepted() {
        for from in JobStatus::ALL {
            for to in allowed_transitions(from) {
                let result = apply(&job_in(from), *to, TransitionFields::default(), Utc::now());
                assert!(result.is_ok(), "{from} -> {to} should be allowed");
            }
        }
    }

    #[test]
    fn every_edge_outside_the_table_is_rejected() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                if allowed_transitions(from).contains(&to) && from != to {
                    continue;
                }
                let err = apply(&job_in(from), to, TransitionFields::default(), Utc::now())
                    .expect_err(&format!("{from} -> {to} should be rejected"));
                match err {
                    StoreError::InvalidStateTransition {
                        from: got_from,
                        to: got_to,
                        ..
                    } => {
                        assert_eq!(got_from, from);
                        assert_eq!(got_to, to);
                    }
                    other => panic!("unexpected error: {other}"),
                }
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        assert!(allowed_transitions(JobStatus::Delivered).is_empty());
        assert!(allowed_transitions(JobStatus::Skipped).is_empty());
    }

    #[test]
    fn self_transitions_are_rejected() {
        for status in JobStatus::ALL {
            assert!(!is_valid_transition(status, status));
        }
    }

    #[test]
    fn timestamps_are_stamped_on_entry() {
        let now = Utc::now();
        let next = apply(
            &job_in(JobStatus::Pending),
            JobStatus::Queued,
            TransitionFields::default(),
            now,
        )
        .unwrap();
        assert_eq!(next.queued_at, Some(now));
        assert_eq!(next.updated_at, now);
        assert!(next.processing_at.is_none());
    }

    #[test]
    fn timestamps_are_restamped_on_reentry() {
        let first = Utc::now();
        let job = apply(
            &job_in(JobStatus::Processing),
            JobStatus::Failed,
            TransitionFields::default(),
            first,
        )
        .unwrap();

        let job = apply(&job, JobStatus::Retrying, TransitionFields::default(), first).unwrap();
        let later = first + chrono::Duration::seconds(90);
        let job = apply(&job, JobStatus::Failed, TransitionFields::default(), later).unwrap();
        assert_eq!(job.failed_at, Some(later));
    }

    #[test]
    fn reentering_pending_clears_scheduling_state() {
        let mut job = job_in(JobStatus::Dead);
        job.error_message = Some("gateway exploded".to_string());
        job.next_attempt_at = Some(Utc::now());
        job.retry_count = 3;

        let fields = TransitionFields {
            retry_count: Some(0),
            ..Default::default()
        };
        let next = apply(&job, JobStatus::Pending, fields, Utc::now()).unwrap();
        assert!(next.next_attempt_at.is_none());
        assert!(next.error_message.is_none());
        assert_eq!(next.retry_count, 0);
    }

    #[test]
    fn fields_merge_into_the_new_image() {
        let now = Utc::now();
        let fields = TransitionFields {
            provider_message_id: Some("msg-42".to_string()),
            ..Default::default()
        };
        let next = apply(&job_in(JobStatus::Processing), JobStatus::Sent, fields, now).unwrap();
        assert_eq!(next.provider_message_id.as_deref(), Some("msg-42"));
        assert_eq!(next.sent_at, Some(now));
    }

    #[test]
    fn skip_records_reason_and_timestamp() {
        let fields = TransitionFields {
            skip_reason: Some(SkipReason::InvalidEmail),
            error_message: Some("no dot in domain".to_string()),
            ..Default::default()
        };
        let next = apply(
            &job_in(JobStatus::Processing),
            JobStatus::Skipped,
            fields,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(next.skip_reason, Some(SkipReason::InvalidEmail));
        assert!(next.skipped_at.is_some());
    }
}
