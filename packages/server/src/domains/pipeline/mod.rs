//! The send pipeline: job state machine, producer, queue, worker, retry
//! controller, and webhook reconciler.

pub mod error;
pub mod events;
pub mod failure_log;
pub mod models;
pub mod poller;
pub mod processor;
pub mod producer;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod senders;
pub mod state;
pub mod store;

pub use error::{PipelineError, StoreError};
pub use events::PipelineEvent;
pub use failure_log::{FailureLog, PgFailureLog};
pub use models::{Channel, JobPayload, JobStatus, PipelineFailure, PipelineJob, SkipReason};
pub use poller::{PollingWorker, PollingWorkerConfig};
pub use processor::{JobProcessor, ProcessOutcome, ProcessorConfig};
pub use producer::{ContactRecord, Producer, RunInfo};
pub use queue::{
    QueueSnapshot, RetryPolicy, TenantConfigCache, TenantQueueConfig, WorkBroker,
};
pub use reconciler::{Applied, ProviderEvent, WebhookReconciler, WebhookVerifier};
pub use retry::{RetryController, RetryControllerConfig};
pub use state::TransitionFields;
pub use store::{JobFilter, JobStore, PgJobStore, StatusCounts};
