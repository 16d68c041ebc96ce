pub mod models;
pub mod stats;

pub use models::{Campaign, CampaignRun, CampaignStatus, RunStatus};
pub use stats::{Counter, PgRunStore, RunCounts, RunStore, StatsAggregator};
