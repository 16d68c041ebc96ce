// TestDependencies - in-memory implementations for testing
//
// Provides fake collaborators that can be wired into PipelineDeps so the
// whole pipeline (producer -> queue -> worker -> stats -> reconciler) runs
// hermetically. The in-memory job store reuses the same state-machine
// `apply` as the Postgres store, so transition semantics are identical.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::Page;
use crate::domains::campaigns::models::{CampaignRun, CampaignStatus, RunStatus};
use crate::domains::campaigns::stats::{Counter, RunCounts, RunStore};
use crate::domains::contacts::{Contact, ContactRepository, NewTimelineEvent};
use crate::domains::pipeline::error::StoreError;
use crate::domains::pipeline::failure_log::FailureLog;
use crate::domains::pipeline::models::{
    Channel, JobStatus, NewPipelineFailure, PipelineFailure, PipelineJob, SkipReason,
};
use crate::domains::pipeline::queue::TenantConfigCache;
use crate::domains::pipeline::senders::{
    is_valid_email, ChannelSender, SendMetadata, SendOutcome, SenderRegistry, Validation,
};
use crate::domains::pipeline::state::{self, TransitionFields};
use crate::domains::pipeline::store::{JobFilter, JobStore, StatusCounts};
use crate::domains::templates::{Content, TemplateError, TemplateService};
use crate::kernel::deps::PipelineDeps;
use crate::kernel::events::EventPublisher;
use crate::kernel::nats::TestNats;

fn lock_poisoned() -> StoreError {
    StoreError::Database(sqlx::Error::WorkerCrashed)
}

// =============================================================================
// In-memory job store
// =============================================================================

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, PipelineJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored job, ordered by creation.
    pub fn all(&self) -> Vec<PipelineJob> {
        let mut jobs: Vec<_> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    pub fn insert(&self, job: PipelineJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_bulk(&self, jobs: Vec<PipelineJob>) -> Result<Vec<PipelineJob>, StoreError> {
        let mut map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        for job in &jobs {
            map.insert(job.id, job.clone());
        }
        Ok(jobs)
    }

    async fn find_by_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PipelineJob>, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        Ok(map
            .get(&id)
            .filter(|job| job.tenant_id == tenant_id)
            .cloned())
    }

    async fn get(&self, id: Uuid) -> Result<PipelineJob, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        map.get(&id).cloned().ok_or(StoreError::JobNotFound(id))
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<PipelineJob>, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        Ok(map
            .values()
            .find(|job| job.provider_message_id.as_deref() == Some(provider_message_id))
            .cloned())
    }

    async fn find_jobs(
        &self,
        tenant_id: Uuid,
        filter: &JobFilter,
        page: Page,
    ) -> Result<Vec<PipelineJob>, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        let mut jobs: Vec<_> = map
            .values()
            .filter(|job| job.tenant_id == tenant_id)
            .filter(|job| filter.campaign_id.is_none_or(|id| job.campaign_id == id))
            .filter(|job| {
                filter
                    .campaign_run_id
                    .is_none_or(|id| job.campaign_run_id == id)
            })
            .filter(|job| filter.contact_id.is_none_or(|id| job.contact_id == id))
            .filter(|job| filter.status.is_none_or(|s| job.status == s))
            .filter(|job| filter.channel.is_none_or(|c| job.channel == c))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn acquire_next_pending(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<PipelineJob>, StoreError> {
        let now = Utc::now();
        let mut map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        let candidate = map
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Pending | JobStatus::Retrying)
                    && job.next_attempt_at.is_none_or(|at| at <= now)
                    && tenant_id.is_none_or(|t| job.tenant_id == t)
            })
            .min_by_key(|job| (job.created_at, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = map.get_mut(&id).expect("candidate id present");
        // Claim-path exception: pending/retrying straight to processing,
        // mirroring the Postgres claim statement.
        job.status = JobStatus::Processing;
        job.processing_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<PipelineJob, StoreError> {
        let mut map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        let current = map.get(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        let next = state::apply(current, to, fields, Utc::now())?;
        map.insert(job_id, next.clone());
        Ok(next)
    }

    async fn mark_queued_bulk(&self, job_ids: &[Uuid]) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        let mut moved = 0;
        for id in job_ids {
            if let Some(job) = map.get(id) {
                if job.status == JobStatus::Pending {
                    let next = state::apply(job, JobStatus::Queued, TransitionFields::default(), now)?;
                    map.insert(*id, next);
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn jobs_due_for_retry(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<PipelineJob>, StoreError> {
        let now = Utc::now();
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        let mut jobs: Vec<_> = map
            .values()
            .filter(|job| {
                matches!(job.status, JobStatus::Failed | JobStatus::Retrying)
                    && job.retry_count <= max_retries
                    && job.next_attempt_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.next_attempt_at);
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn stuck_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PipelineJob>, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        let mut jobs: Vec<_> = map
            .values()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.processing_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.processing_at);
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn count_by_status(&self, tenant_id: Option<Uuid>) -> Result<StatusCounts, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        Ok(StatusCounts::from_rows(
            map.values()
                .filter(|job| tenant_id.is_none_or(|t| job.tenant_id == t))
                .map(|job| (job.status, 1)),
        ))
    }

    async fn run_status_counts(&self, campaign_run_id: Uuid) -> Result<StatusCounts, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        Ok(StatusCounts::from_rows(
            map.values()
                .filter(|job| job.campaign_run_id == campaign_run_id)
                .map(|job| (job.status, 1)),
        ))
    }

    async fn campaign_status_counts(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<StatusCounts, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        Ok(StatusCounts::from_rows(
            map.values()
                .filter(|job| job.tenant_id == tenant_id && job.campaign_id == campaign_id)
                .map(|job| (job.status, 1)),
        ))
    }

    async fn contact_ids_in_run(&self, campaign_run_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let map = self.jobs.lock().map_err(|_| lock_poisoned())?;
        Ok(map
            .values()
            .filter(|job| job.campaign_run_id == campaign_run_id)
            .map(|job| job.contact_id)
            .collect())
    }
}

// =============================================================================
// In-memory failure log
// =============================================================================

#[derive(Default)]
pub struct InMemoryFailureLog {
    rows: Mutex<Vec<PipelineFailure>>,
}

impl InMemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<PipelineFailure> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureLog for InMemoryFailureLog {
    async fn record(&self, failure: NewPipelineFailure) -> Result<PipelineFailure, StoreError> {
        let recorded = PipelineFailure {
            id: Uuid::now_v7(),
            tenant_id: failure.tenant_id,
            job_id: failure.job_id,
            campaign_id: failure.campaign_id,
            contact_id: failure.contact_id,
            error_message: failure.error_message,
            last_status: failure.last_status,
            retry_count: failure.retry_count,
            created_at: Utc::now(),
        };
        self.rows
            .lock()
            .map_err(|_| lock_poisoned())?
            .push(recorded.clone());
        Ok(recorded)
    }

    async fn list(
        &self,
        tenant_id: Uuid,
        page: Page,
    ) -> Result<Vec<PipelineFailure>, StoreError> {
        let rows = self.rows.lock().map_err(|_| lock_poisoned())?;
        Ok(rows
            .iter()
            .filter(|f| f.tenant_id == tenant_id)
            .rev()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn list_for_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<PipelineFailure>, StoreError> {
        let rows = self.rows.lock().map_err(|_| lock_poisoned())?;
        Ok(rows
            .iter()
            .filter(|f| f.tenant_id == tenant_id && f.job_id == job_id)
            .cloned()
            .collect())
    }
}

// =============================================================================
// In-memory run store
// =============================================================================

#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<Uuid, CampaignRun>>,
    campaigns: Mutex<HashMap<Uuid, CampaignStatus>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a running run (and its running campaign) for a test.
    pub fn seed(&self, tenant_id: Uuid, campaign_id: Uuid, total_recipients: i32) -> CampaignRun {
        let run = CampaignRun {
            id: Uuid::now_v7(),
            tenant_id,
            campaign_id,
            total_recipients,
            processed_count: 0,
            sent_count: 0,
            failed_count: 0,
            skipped_count: 0,
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.runs.lock().unwrap().insert(run.id, run.clone());
        self.campaigns
            .lock()
            .unwrap()
            .insert(campaign_id, CampaignStatus::Running);
        run
    }

    pub fn campaign_status(&self, campaign_id: Uuid) -> Option<CampaignStatus> {
        self.campaigns.lock().unwrap().get(&campaign_id).copied()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn find(&self, run_id: Uuid) -> Result<Option<CampaignRun>, StoreError> {
        Ok(self
            .runs
            .lock()
            .map_err(|_| lock_poisoned())?
            .get(&run_id)
            .cloned())
    }

    async fn increment(&self, run_id: Uuid, counter: Counter) -> Result<CampaignRun, StoreError> {
        let mut runs = self.runs.lock().map_err(|_| lock_poisoned())?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        match counter {
            Counter::Sent => run.sent_count += 1,
            Counter::Failed => run.failed_count += 1,
            Counter::Skipped => run.skipped_count += 1,
        }
        run.processed_count += 1;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn finalize(&self, run_id: Uuid, status: RunStatus) -> Result<bool, StoreError> {
        let mut runs = self.runs.lock().map_err(|_| lock_poisoned())?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = status;
        run.completed_at = Some(Utc::now());
        run.updated_at = Utc::now();

        let campaign_status = match status {
            RunStatus::Failed => CampaignStatus::Failed,
            _ => CampaignStatus::Completed,
        };
        self.campaigns
            .lock()
            .map_err(|_| lock_poisoned())?
            .insert(run.campaign_id, campaign_status);
        Ok(true)
    }

    async fn write_counts(
        &self,
        run_id: Uuid,
        counts: RunCounts,
    ) -> Result<CampaignRun, StoreError> {
        let mut runs = self.runs.lock().map_err(|_| lock_poisoned())?;
        let run = runs
            .get_mut(&run_id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        run.sent_count = counts.sent as i32;
        run.failed_count = counts.failed as i32;
        run.skipped_count = counts.skipped as i32;
        run.processed_count = counts.processed() as i32;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }
}

// =============================================================================
// Fake contact repository
// =============================================================================

#[derive(Default)]
pub struct FakeContactRepository {
    contacts: Mutex<HashMap<Uuid, Contact>>,
    timeline: Mutex<Vec<NewTimelineEvent>>,
}

impl FakeContactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, contact: Contact) {
        self.contacts.lock().unwrap().insert(contact.id, contact);
    }

    pub fn timeline(&self) -> Vec<NewTimelineEvent> {
        self.timeline.lock().unwrap().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Contact> {
        self.contacts.lock().unwrap().get(&id).cloned()
    }
}

/// Build a contact for tests.
pub fn make_contact(tenant_id: Uuid, email: Option<&str>, phone: Option<&str>) -> Contact {
    Contact {
        id: Uuid::now_v7(),
        tenant_id,
        email: email.map(str::to_string),
        phone: phone.map(str::to_string),
        full_name: Some("Test Contact".to_string()),
        attributes: serde_json::json!({}),
        unsubscribed: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl ContactRepository for FakeContactRepository {
    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Contact>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .get(&id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn create_timeline_event(&self, event: NewTimelineEvent) -> Result<()> {
        self.timeline.lock().unwrap().push(event);
        Ok(())
    }

    async fn revoke_consent(&self, tenant_id: Uuid, contact_id: Uuid) -> Result<()> {
        if let Some(contact) = self.contacts.lock().unwrap().get_mut(&contact_id) {
            if contact.tenant_id == tenant_id {
                contact.unsubscribed = true;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Fake template services
// =============================================================================

/// Renders minimal channel-shaped content without touching storage.
pub struct StaticTemplateService;

#[async_trait]
impl TemplateService for StaticTemplateService {
    async fn render_for_pipeline(
        &self,
        _template_version_id: Option<Uuid>,
        contact: &Contact,
        channel: Channel,
    ) -> Result<Content, TemplateError> {
        let name = contact.full_name.clone().unwrap_or_default();
        Ok(match channel {
            Channel::Email => Content::Email {
                subject: format!("Hello {name}"),
                html_body: format!("<p>Hello {name}</p>"),
                text_body: None,
            },
            Channel::Sms => Content::Sms {
                body: format!("Hello {name}"),
                sender_id: None,
            },
            Channel::Whatsapp => Content::Whatsapp {
                template_name: "generic".to_string(),
                language: "en".to_string(),
                body: format!("Hello {name}"),
            },
            Channel::Push => Content::Push {
                title: "Hello".to_string(),
                body: format!("Hello {name}"),
                image_url: None,
                action_url: None,
            },
        })
    }
}

/// Always fails rendering, for template-error paths.
pub struct FailingTemplateService;

#[async_trait]
impl TemplateService for FailingTemplateService {
    async fn render_for_pipeline(
        &self,
        _template_version_id: Option<Uuid>,
        _contact: &Contact,
        _channel: Channel,
    ) -> Result<Content, TemplateError> {
        Err(TemplateError::Render("template exploded".to_string()))
    }
}

// =============================================================================
// Scripted sender
// =============================================================================

/// Sender whose outcomes are scripted per call; once the script is empty,
/// sends succeed with generated provider message ids.
#[derive(Debug)]
pub struct ScriptedSender {
    channel: Channel,
    outcomes: Mutex<Vec<SendOutcome>>,
    sent: Mutex<Vec<(String, SendMetadata)>>,
    counter: AtomicU64,
}

impl ScriptedSender {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            outcomes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Queue the outcome for the next send call (FIFO).
    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.outcomes.lock().unwrap().push(outcome);
    }

    /// Every `(recipient, metadata)` pair that reached the provider.
    pub fn sends(&self) -> Vec<(String, SendMetadata)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn validate_recipient(&self, recipient: &str) -> Validation {
        let valid = match self.channel {
            Channel::Email => is_valid_email(recipient),
            _ => !recipient.trim().is_empty(),
        };
        if valid {
            Validation::ok()
        } else {
            Validation::invalid(format!("invalid recipient: {recipient}"))
        }
    }

    async fn send(&self, recipient: &str, _content: &Content, meta: &SendMetadata) -> SendOutcome {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), meta.clone()));

        let scripted = {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                None
            } else {
                Some(outcomes.remove(0))
            }
        };
        scripted.unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            SendOutcome::sent(format!("test-msg-{n}"))
        })
    }
}

// =============================================================================
// Full test wiring
// =============================================================================

/// Everything a pipeline test needs, pre-wired with in-memory fakes.
pub struct TestDependencies {
    pub store: Arc<InMemoryJobStore>,
    pub failures: Arc<InMemoryFailureLog>,
    pub runs: Arc<InMemoryRunStore>,
    pub contacts: Arc<FakeContactRepository>,
    pub nats: Arc<TestNats>,
    pub deps: PipelineDeps,
}

impl TestDependencies {
    /// Wire fakes around the given senders (usually [`ScriptedSender`]s).
    pub fn new(senders: SenderRegistry) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let failures = Arc::new(InMemoryFailureLog::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let contacts = Arc::new(FakeContactRepository::new());
        let nats = Arc::new(TestNats::new());

        let deps = PipelineDeps {
            store: store.clone(),
            failures: failures.clone(),
            runs: runs.clone(),
            contacts: contacts.clone(),
            templates: Arc::new(StaticTemplateService),
            senders: Arc::new(senders),
            events: EventPublisher::new(nats.clone()),
            tenant_configs: Arc::new(TenantConfigCache::new()),
        };

        Self {
            store,
            failures,
            runs,
            contacts,
            nats,
            deps,
        }
    }

    /// Convenience: a skip-reasoned view of one job.
    pub fn job_skip_reason(&self, job_id: Uuid) -> Option<SkipReason> {
        self.store
            .all()
            .into_iter()
            .find(|j| j.id == job_id)
            .and_then(|j| j.skip_reason)
    }
}
