//! Campaign run model: one execution of a campaign against an audience.
//!
//! Owned upstream; the stats aggregator is the only pipeline component that
//! mutates its counters and terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub total_recipients: i32,
    pub processed_count: i32,
    pub sent_count: i32,
    pub failed_count: i32,
    pub skipped_count: i32,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignRun {
    /// A run is ready to finalize when every recipient has been accounted
    /// for and it has not already reached a terminal status.
    pub fn ready_to_finalize(&self) -> bool {
        self.total_recipients > 0
            && self.processed_count >= self.total_recipients
            && !self.status.is_terminal()
    }

    /// The terminal status a finalization should apply: completed when at
    /// least one message went out, failed otherwise.
    pub fn final_status(&self) -> RunStatus {
        if self.sent_count > 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(total: i32, processed: i32, sent: i32, status: RunStatus) -> CampaignRun {
        CampaignRun {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            total_recipients: total,
            processed_count: processed,
            sent_count: sent,
            failed_count: 0,
            skipped_count: 0,
            status,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn finalizes_only_when_all_recipients_processed() {
        assert!(!run(3, 2, 2, RunStatus::Running).ready_to_finalize());
        assert!(run(3, 3, 3, RunStatus::Running).ready_to_finalize());
        // Late increments past the total still finalize.
        assert!(run(3, 4, 3, RunStatus::Running).ready_to_finalize());
    }

    #[test]
    fn empty_runs_never_finalize() {
        assert!(!run(0, 0, 0, RunStatus::Running).ready_to_finalize());
    }

    #[test]
    fn terminal_runs_are_not_refinalized() {
        assert!(!run(3, 3, 3, RunStatus::Completed).ready_to_finalize());
        assert!(!run(3, 3, 0, RunStatus::Failed).ready_to_finalize());
    }

    #[test]
    fn final_status_depends_on_sent_count() {
        assert_eq!(run(3, 3, 1, RunStatus::Running).final_status(), RunStatus::Completed);
        assert_eq!(run(3, 3, 0, RunStatus::Running).final_status(), RunStatus::Failed);
    }
}
