pub mod contact;

pub use contact::{Contact, NewTimelineEvent, TimelineEventKind};
