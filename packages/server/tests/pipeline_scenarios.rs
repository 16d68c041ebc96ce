//! End-to-end pipeline scenarios against the in-memory fakes.
//!
//! These drive the real producer, processor, stats aggregator, and webhook
//! reconciler; only storage, providers, and the bus are faked, so the state
//! machine, accounting, and event semantics are exercised exactly as in
//! production.

use std::sync::Arc;
use std::time::Duration;

use server_core::config::PipelineConfig;
use server_core::domains::campaigns::models::RunStatus;
use server_core::domains::campaigns::{CampaignStatus, RunStore};
use server_core::domains::pipeline::JobStore;
use server_core::domains::pipeline::models::{Channel, JobStatus, SkipReason};
use server_core::domains::pipeline::processor::JobProcessor;
use server_core::domains::pipeline::reconciler::{Applied, ProviderEvent};
use server_core::domains::pipeline::senders::{SendOutcome, SenderRegistry};
use server_core::domains::pipeline::state::TransitionFields;
use server_core::domains::pipeline::{ContactRecord, PipelineError, Producer, RunInfo};
use server_core::kernel::test_dependencies::{
    make_contact, ScriptedSender, TestDependencies,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Harness helpers
// ============================================================================

struct Scenario {
    td: TestDependencies,
    sender: Arc<ScriptedSender>,
    processor: JobProcessor,
    producer: Producer,
    tenant_id: Uuid,
    campaign_id: Uuid,
}

impl Scenario {
    /// Email pipeline with zero retry backoff so retries are due instantly.
    fn email() -> Self {
        Self::with_channel(Channel::Email)
    }

    fn with_channel(channel: Channel) -> Self {
        let sender = Arc::new(ScriptedSender::new(channel));
        let mut registry = SenderRegistry::new();
        registry.register(sender.clone());

        let td = TestDependencies::new(registry);
        let config = PipelineConfig {
            retry_interval: Duration::ZERO,
            ..Default::default()
        };
        let processor = td.deps.processor(&config);
        let producer = Producer::new(
            td.deps.store.clone(),
            td.deps.stats(),
            td.deps.events.clone(),
            None,
        );

        Self {
            td,
            sender,
            processor,
            producer,
            tenant_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
        }
    }

    fn run_info(&self, run_id: Uuid, channel: &str) -> RunInfo {
        RunInfo {
            run_id,
            campaign_id: self.campaign_id,
            tenant_id: self.tenant_id,
            channel: channel.to_string(),
            template_version_id: None,
        }
    }

    fn contact_record(&self, email: Option<&str>) -> ContactRecord {
        let contact = make_contact(self.tenant_id, email, None);
        self.td.contacts.insert(contact.clone());
        ContactRecord {
            id: contact.id,
            email: contact.email,
            phone: contact.phone,
            full_name: contact.full_name,
            attributes: None,
        }
    }

    /// Poller-style drain: claim and process until no work is ready.
    async fn drain(&self) {
        let cancel = CancellationToken::new();
        for _ in 0..50 {
            let Ok(Some(job)) = self.td.deps.store.acquire_next_pending(None).await else {
                return;
            };
            let attempt = job.retry_count + 1;
            if let Err(e) = self.processor.process(job.id, false, &cancel).await {
                if !matches!(e, PipelineError::PipelineJobNotFound(_)) {
                    self.processor.on_failed(job.id, &e, attempt).await.unwrap();
                }
            }
        }
        panic!("drain did not settle after 50 claims");
    }
}

// ============================================================================
// Scenario 1: happy path, 3 recipients
// ============================================================================

#[tokio::test]
async fn happy_path_three_recipients() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 3);
    for id in ["m1", "m2", "m3"] {
        s.sender.push_outcome(SendOutcome::sent(id));
    }

    let contacts = vec![
        s.contact_record(Some("a@example.com")),
        s.contact_record(Some("b@example.com")),
        s.contact_record(Some("c@example.com")),
    ];
    let created = s
        .producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    assert_eq!(created.len(), 3);

    s.drain().await;

    let jobs = s.td.store.all();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Sent));
    let mut provider_ids: Vec<_> = jobs
        .iter()
        .map(|j| j.provider_message_id.clone().unwrap())
        .collect();
    provider_ids.sort();
    assert_eq!(provider_ids, vec!["m1", "m2", "m3"]);
    assert!(jobs.iter().all(|j| j.sent_at.is_some()));

    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.sent_count, 3);
    assert_eq!(run.processed_count, 3);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(
        s.td.runs.campaign_status(s.campaign_id),
        Some(CampaignStatus::Completed)
    );
    assert_eq!(s.td.nats.count_for("pipeline.campaign_run.completed"), 1);
    assert_eq!(s.td.nats.count_for("pipeline.batch.created"), 1);
    assert_eq!(s.td.nats.count_for("pipeline.job.created"), 3);
    assert_eq!(s.td.nats.count_for("pipeline.job.sent"), 3);
}

// ============================================================================
// Scenario 2: mixed partial failure
// ============================================================================

#[tokio::test]
async fn mixed_batch_skips_unsendable_recipients() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 5);

    let contacts = vec![
        s.contact_record(Some("ok1@example.com")),
        s.contact_record(Some("ok2@example.com")),
        s.contact_record(None),
        s.contact_record(None),
        s.contact_record(Some("not-an-email")),
    ];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let jobs = s.td.store.all();
    let sent = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Sent)
        .count();
    let skipped: Vec<_> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Skipped)
        .collect();
    assert_eq!(sent, 2);
    assert_eq!(skipped.len(), 3);

    let mut reasons: Vec<_> = skipped.iter().map(|j| j.skip_reason.unwrap()).collect();
    reasons.sort_by_key(|r| format!("{r:?}"));
    assert_eq!(
        reasons,
        vec![
            SkipReason::InvalidEmail,
            SkipReason::MissingEmail,
            SkipReason::MissingEmail
        ]
    );
    // Skips never reach the provider.
    assert_eq!(s.sender.send_count(), 2);

    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.sent_count, 2);
    assert_eq!(run.skipped_count, 3);
    assert_eq!(run.failed_count, 0);
    assert_eq!(run.status, RunStatus::Completed);
}

// ============================================================================
// Scenario 3: retry then success
// ============================================================================

#[tokio::test]
async fn retryable_failure_then_success() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    s.sender
        .push_outcome(SendOutcome::failed("provider timeout", true));
    s.sender.push_outcome(SendOutcome::sent("m99"));

    let contacts = vec![s.contact_record(Some("retry@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.provider_message_id.as_deref(), Some("m99"));

    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.sent_count, 1);
    assert_eq!(run.status, RunStatus::Completed);
    assert!(s.td.failures.all().is_empty());
    assert_eq!(s.td.nats.count_for("pipeline.job.retrying"), 1);
}

// ============================================================================
// Scenario 4: retry exhaustion
// ============================================================================

#[tokio::test]
async fn retry_exhaustion_dead_letters_once() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    for _ in 0..3 {
        s.sender
            .push_outcome(SendOutcome::failed("gateway unavailable", true));
    }

    let contacts = vec![s.contact_record(Some("doomed@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.retry_count, 3);

    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.failed_count, 1);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        s.td.runs.campaign_status(s.campaign_id),
        Some(CampaignStatus::Failed)
    );

    let failures = s.td.failures.all();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].last_status, JobStatus::Processing);
    assert_eq!(s.td.nats.count_for("pipeline.job.dead"), 1);
}

// ============================================================================
// Scenario 5: non-retryable sender error
// ============================================================================

#[tokio::test]
async fn unrecoverable_error_dead_letters_in_one_attempt() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    s.sender
        .push_outcome(SendOutcome::failed("invalid recipient", false));

    let contacts = vec![s.contact_record(Some("reject@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Dead);
    assert!(job.failed_at.is_some());
    assert_eq!(s.sender.send_count(), 1);

    // Exactly one failed increment, not two.
    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.failed_count, 1);
    assert_eq!(run.processed_count, 1);
    assert_eq!(s.td.nats.count_for("pipeline.job.dead"), 1);
    assert_eq!(s.td.nats.count_for("pipeline.job.failed"), 1);
}

// ============================================================================
// Scenario 6: webhook bounce after send
// ============================================================================

#[tokio::test]
async fn webhook_bounce_fails_a_sent_job() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    s.sender.push_outcome(SendOutcome::sent("m1"));

    let contacts = vec![s.contact_record(Some("bounce@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;
    assert_eq!(s.td.store.all()[0].status, JobStatus::Sent);

    let reconciler = s.td.deps.reconciler();
    let applied = reconciler
        .apply_event(&bounce_event("m1.filter001", "hard", "user unknown"))
        .await
        .unwrap();
    assert_eq!(applied, Applied::Failed);

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("Bounce(hard): user unknown"));

    assert_eq!(s.td.failures.all().len(), 1);
    let timeline = s.td.contacts.timeline();
    assert_eq!(timeline.len(), 1);
    assert_eq!(
        timeline[0].kind,
        server_core::domains::contacts::TimelineEventKind::EmailBounced
    );
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn empty_contact_list_is_a_no_op() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 0);

    let created = s
        .producer
        .dispatch_run(s.run_info(run.id, "email"), Vec::new())
        .await
        .unwrap();
    assert!(created.is_empty());
    assert!(s.td.store.all().is_empty());
    assert!(s.td.nats.published().is_empty());
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    let contacts = vec![s.contact_record(Some("a@example.com"))];

    let err = s
        .producer
        .dispatch_run(s.run_info(run.id, "fax"), contacts)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ChannelNotSupported(_)));
    assert!(s.td.store.all().is_empty());
}

#[tokio::test]
async fn unsubscribed_contacts_are_skipped() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);

    let record = s.contact_record(Some("optout@example.com"));
    let mut contact = s.td.contacts.get(record.id).unwrap();
    contact.unsubscribed = true;
    s.td.contacts.insert(contact);

    s.producer
        .dispatch_run(s.run_info(run.id, "email"), vec![record])
        .await
        .unwrap();
    s.drain().await;

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Skipped);
    assert_eq!(job.skip_reason, Some(SkipReason::Unsubscribed));
    assert_eq!(s.sender.send_count(), 0);
}

#[tokio::test]
async fn duplicate_contacts_in_a_rerun_are_skipped() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 2);
    let record = s.contact_record(Some("dup@example.com"));

    s.producer
        .dispatch_run(s.run_info(run.id, "email"), vec![record.clone()])
        .await
        .unwrap();
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), vec![record])
        .await
        .unwrap();
    s.drain().await;

    let jobs = s.td.store.all();
    assert_eq!(jobs.len(), 2);
    let duplicate = jobs
        .iter()
        .find(|j| j.skip_reason == Some(SkipReason::DuplicateSend))
        .expect("second job skipped as duplicate");
    assert_eq!(duplicate.status, JobStatus::Skipped);
    assert_eq!(s.sender.send_count(), 1);
}

#[tokio::test]
async fn manual_retry_requeues_a_dead_job() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    for _ in 0..3 {
        s.sender.push_outcome(SendOutcome::failed("down", true));
    }

    let contacts = vec![s.contact_record(Some("second-chance@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;
    let job_id = s.td.store.all()[0].id;
    assert_eq!(s.td.store.all()[0].status, JobStatus::Dead);

    // Operator escape hatch: dead -> pending, then normal re-pickup.
    let fields = TransitionFields {
        retry_count: Some(0),
        ..Default::default()
    };
    let job =
        s.td.deps
            .store
            .transition(job_id, JobStatus::Pending, fields)
            .await
            .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.next_attempt_at.is_none());

    s.drain().await;
    assert_eq!(s.td.store.all()[0].status, JobStatus::Sent);
}

#[tokio::test]
async fn webhook_for_unknown_provider_id_changes_nothing() {
    let s = Scenario::email();
    let reconciler = s.td.deps.reconciler();
    let applied = reconciler
        .apply_event(&bounce_event("unknown-id", "hard", "who dis"))
        .await
        .unwrap();
    assert_eq!(applied, Applied::Ignored);
    assert!(s.td.store.all().is_empty());
    assert!(s.td.failures.all().is_empty());
}

#[tokio::test]
async fn repeated_delivered_webhook_is_a_no_op() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    s.sender.push_outcome(SendOutcome::sent("m7"));
    let contacts = vec![s.contact_record(Some("deliver@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let reconciler = s.td.deps.reconciler();
    let delivered = ProviderEvent {
        event: "delivered".to_string(),
        sg_message_id: Some("m7".to_string()),
        email: None,
        timestamp: None,
        bounce_type: None,
        reason: None,
        ip: None,
        useragent: None,
        url: None,
    };

    assert_eq!(
        reconciler.apply_event(&delivered).await.unwrap(),
        Applied::Delivered
    );
    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Delivered);
    assert!(job.sent_at.is_some());
    assert!(job.delivered_at.is_some());

    // Second delivery of the same event: already terminal, dropped.
    assert_eq!(
        reconciler.apply_event(&delivered).await.unwrap(),
        Applied::Ignored
    );
    assert_eq!(s.td.store.all()[0].status, JobStatus::Delivered);
    assert_eq!(s.td.nats.count_for("pipeline.job.delivered"), 1);
}

#[tokio::test]
async fn open_and_click_record_timeline_without_touching_state() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    s.sender.push_outcome(SendOutcome::sent("m8"));
    let contacts = vec![s.contact_record(Some("opens@example.com"))];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let reconciler = s.td.deps.reconciler();
    let mut open = ProviderEvent {
        event: "open".to_string(),
        sg_message_id: Some("m8".to_string()),
        email: None,
        timestamp: None,
        bounce_type: None,
        reason: None,
        ip: Some("203.0.113.9".to_string()),
        useragent: Some("Mozilla/5.0".to_string()),
        url: None,
    };
    assert_eq!(reconciler.apply_event(&open).await.unwrap(), Applied::Recorded);
    open.event = "click".to_string();
    open.url = Some("https://example.com/offer".to_string());
    assert_eq!(reconciler.apply_event(&open).await.unwrap(), Applied::Recorded);

    assert_eq!(s.td.store.all()[0].status, JobStatus::Sent);
    assert_eq!(s.td.contacts.timeline().len(), 2);
}

#[tokio::test]
async fn spamreport_revokes_consent() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    s.sender.push_outcome(SendOutcome::sent("m9"));
    let record = s.contact_record(Some("spam@example.com"));
    let contact_id = record.id;
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), vec![record])
        .await
        .unwrap();
    s.drain().await;

    let reconciler = s.td.deps.reconciler();
    let spam = ProviderEvent {
        event: "spamreport".to_string(),
        sg_message_id: Some("m9".to_string()),
        email: Some("spam@example.com".to_string()),
        timestamp: None,
        bounce_type: None,
        reason: None,
        ip: None,
        useragent: None,
        url: None,
    };
    assert_eq!(reconciler.apply_event(&spam).await.unwrap(), Applied::Recorded);

    assert!(s.td.contacts.get(contact_id).unwrap().unsubscribed);
    // Job status is untouched by consent events.
    assert_eq!(s.td.store.all()[0].status, JobStatus::Sent);
}

#[tokio::test]
async fn recalculate_matches_the_incremental_counters() {
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 5);

    let contacts = vec![
        s.contact_record(Some("ok1@example.com")),
        s.contact_record(Some("ok2@example.com")),
        s.contact_record(None),
        s.contact_record(None),
        s.contact_record(Some("not-an-email")),
    ];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let incremental = s.td.runs.find(run.id).await.unwrap().unwrap();
    let recalculated = s.td.deps.stats().recalculate_stats(run.id).await.unwrap();

    assert_eq!(recalculated.sent_count, incremental.sent_count);
    assert_eq!(recalculated.failed_count, incremental.failed_count);
    assert_eq!(recalculated.skipped_count, incremental.skipped_count);
    assert_eq!(recalculated.processed_count, incremental.processed_count);
}

#[tokio::test]
async fn counters_always_reconcile() {
    // processed == sent + failed + skipped at every observation point.
    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 3);
    s.sender.push_outcome(SendOutcome::sent("a1"));
    s.sender.push_outcome(SendOutcome::failed("nope", false));

    let contacts = vec![
        s.contact_record(Some("one@example.com")),
        s.contact_record(Some("two@example.com")),
        s.contact_record(None),
    ];
    s.producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    s.drain().await;

    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(
        run.processed_count,
        run.sent_count + run.failed_count + run.skipped_count
    );
}

// ============================================================================
// Retry controller
// ============================================================================

#[tokio::test]
async fn retry_controller_promotes_due_failed_jobs() {
    use server_core::domains::pipeline::retry::{RetryController, RetryControllerConfig};

    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    let contacts = vec![s.contact_record(Some("later@example.com"))];
    let created = s
        .producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    let job_id = created[0].id;

    // Park the job in failed with a backoff that has already elapsed.
    let past = chrono::Utc::now() - chrono::Duration::seconds(10);
    s.td.deps
        .store
        .mark_failed(job_id, "provider blip", Some(past))
        .await
        .unwrap();

    let controller = RetryController::new(
        s.td.deps.store.clone(),
        s.td.deps.failures.clone(),
        s.td.deps.stats(),
        s.td.deps.events.clone(),
        None,
        RetryControllerConfig::default(),
    );
    controller.tick().await.unwrap();

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.retry_count, 1);
    assert!(job.next_attempt_at.unwrap() > chrono::Utc::now());
    assert_eq!(s.td.nats.count_for("pipeline.job.retrying"), 1);
}

#[tokio::test]
async fn retry_controller_escalates_exhausted_jobs_to_dead() {
    use server_core::domains::pipeline::retry::{RetryController, RetryControllerConfig};

    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    let contacts = vec![s.contact_record(Some("exhausted@example.com"))];
    let created = s
        .producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    let job_id = created[0].id;

    let past = chrono::Utc::now() - chrono::Duration::seconds(10);
    let fields = TransitionFields {
        error_message: Some("still down".to_string()),
        retry_count: Some(3),
        next_attempt_at: Some(past),
        ..Default::default()
    };
    s.td.deps
        .store
        .transition(job_id, JobStatus::Failed, fields)
        .await
        .unwrap();

    let controller = RetryController::new(
        s.td.deps.store.clone(),
        s.td.deps.failures.clone(),
        s.td.deps.stats(),
        s.td.deps.events.clone(),
        None,
        RetryControllerConfig::default(),
    );
    controller.tick().await.unwrap();

    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(s.td.failures.all().len(), 1);
    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.failed_count, 1);
    assert_eq!(s.td.nats.count_for("pipeline.job.dead"), 1);
}

#[tokio::test]
async fn stuck_processing_jobs_are_reaped_and_rescheduled() {
    use server_core::domains::pipeline::retry::{RetryController, RetryControllerConfig};

    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 1);
    let contacts = vec![s.contact_record(Some("stuck@example.com"))];
    let created = s
        .producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();
    let job_id = created[0].id;

    // Simulate a worker that claimed the job and crashed.
    let claimed = s.td.deps.store.acquire_next_pending(None).await.unwrap();
    assert_eq!(claimed.unwrap().id, job_id);

    let controller = RetryController::new(
        s.td.deps.store.clone(),
        s.td.deps.failures.clone(),
        s.td.deps.stats(),
        s.td.deps.events.clone(),
        None,
        RetryControllerConfig {
            stuck_threshold: Duration::ZERO,
            ..Default::default()
        },
    );
    controller.tick().await.unwrap();

    // Reaped to failed, then promoted back into the retry flow in the same
    // pass (its reschedule was due immediately).
    let job = &s.td.store.all()[0];
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.retry_count, 1);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("stuck-job reaper"));
    assert!(job.failed_at.is_some());
}

// ============================================================================
// Broker mode
// ============================================================================

#[tokio::test(start_paused = true)]
async fn broker_dispatches_a_paced_batch() {
    use server_core::domains::pipeline::queue::{
        RetryPolicy, TenantQueueConfig, WorkBroker,
    };

    let s = Scenario::email();
    let run = s.td.runs.seed(s.tenant_id, s.campaign_id, 2);
    s.td.deps.tenant_configs.set(
        s.tenant_id,
        TenantQueueConfig {
            rate_limit_per_second: 10,
            ..Default::default()
        },
    );

    let broker = WorkBroker::new(
        Arc::new(s.td.deps.processor(&PipelineConfig::default())),
        s.td.deps.tenant_configs.clone(),
        RetryPolicy::default(),
    );
    let shutdown = CancellationToken::new();
    let broker_task = tokio::spawn(broker.clone().run(shutdown.child_token()));

    let producer = Producer::new(
        s.td.deps.store.clone(),
        s.td.deps.stats(),
        s.td.deps.events.clone(),
        Some(broker.clone()),
    );
    let contacts = vec![
        s.contact_record(Some("b1@example.com")),
        s.contact_record(Some("b2@example.com")),
    ];
    producer
        .dispatch_run(s.run_info(run.id, "email"), contacts)
        .await
        .unwrap();

    // Jobs were flipped to queued during the hand-off.
    assert!(s
        .td
        .store
        .all()
        .iter()
        .all(|j| j.status == JobStatus::Queued));

    // Paused-clock auto-advance runs the delayed dispatches immediately.
    for _ in 0..200 {
        if s.td.store.all().iter().all(|j| j.status == JobStatus::Sent) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(s.td.store.all().iter().all(|j| j.status == JobStatus::Sent));

    let run = s.td.runs.find(run.id).await.unwrap().unwrap();
    assert_eq!(run.sent_count, 2);
    assert_eq!(run.status, RunStatus::Completed);

    shutdown.cancel();
    let _ = broker_task.await;
}

// ============================================================================
// Helpers
// ============================================================================

fn bounce_event(message_id: &str, bounce_type: &str, reason: &str) -> ProviderEvent {
    ProviderEvent {
        event: "bounce".to_string(),
        sg_message_id: Some(message_id.to_string()),
        email: None,
        timestamp: None,
        bounce_type: Some(bounce_type.to_string()),
        reason: Some(reason.to_string()),
        ip: None,
        useragent: None,
        url: None,
    }
}
