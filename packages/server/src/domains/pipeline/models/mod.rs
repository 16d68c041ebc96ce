pub mod failure;
pub mod job;

pub use failure::{NewPipelineFailure, PipelineFailure};
pub use job::{Channel, JobPayload, JobStatus, PipelineJob, SkipReason};
