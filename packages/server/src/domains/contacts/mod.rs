pub mod models;
pub mod repository;

pub use models::{Contact, NewTimelineEvent, TimelineEventKind};
pub use repository::{ContactRepository, PgContactRepository};
