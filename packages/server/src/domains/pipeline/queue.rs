//! In-process work broker with per-tenant pacing.
//!
//! The broker is a transient coordinator over the durable job store: a delay
//! heap ordered by `(due_at, priority)`, per-tenant concurrency permits, and
//! bounded attempts with exponential backoff. Anything the broker loses on
//! restart is still `pending`/`retrying` in the store and gets re-picked by
//! the poller path, so nothing here needs to survive a crash.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::processor::JobProcessor;
use super::models::PipelineJob;

const COMPLETED_HISTORY: usize = 1_000;
const FAILED_HISTORY: usize = 5_000;

// ============================================================================
// Tenant configuration
// ============================================================================

/// Per-tenant queue settings.
#[derive(Debug, Clone, Copy)]
pub struct TenantQueueConfig {
    /// 1-10, lower is dispatched earlier among jobs due at the same time.
    pub priority: u8,
    /// Base inter-job delay applied to every enqueued job.
    pub delay_ms: u64,
    /// Cap on concurrently processing jobs for this tenant.
    pub max_concurrent: usize,
    /// 0 disables rate limiting.
    pub rate_limit_per_second: u32,
}

impl Default for TenantQueueConfig {
    fn default() -> Self {
        Self {
            priority: 5,
            delay_ms: 0,
            max_concurrent: 50,
            rate_limit_per_second: 100,
        }
    }
}

/// Process-wide tenant config cache. This is deliberately an explicit object
/// with `get`/`set`/`clear` rather than a module-level singleton.
#[derive(Default)]
pub struct TenantConfigCache {
    inner: Mutex<HashMap<Uuid, TenantQueueConfig>>,
}

impl TenantConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: Uuid) -> TenantQueueConfig {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tenant_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, tenant_id: Uuid, config: TenantQueueConfig) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant_id, config);
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Delay for the n-th job of a batch under the tenant's rate limit:
/// `position * ceil(1000 / rate) + delay_ms` when a rate limit is set,
/// `delay_ms` otherwise.
pub fn batch_delay(position: usize, config: &TenantQueueConfig) -> Duration {
    let spacing_ms = if config.rate_limit_per_second > 0 {
        let per_job = 1000u64.div_ceil(config.rate_limit_per_second as u64);
        position as u64 * per_job
    } else {
        0
    };
    Duration::from_millis(spacing_ms + config.delay_ms)
}

/// Bounded-attempt policy applied by the broker itself.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: i32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(2_000),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before re-dispatching the next attempt.
    pub fn backoff(&self, attempts_made: i32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).max(0) as u32;
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
    }
}

// ============================================================================
// Scheduling state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scheduled {
    due_at: Instant,
    priority: u8,
    seq: u64,
    job_id: Uuid,
    tenant_id: Uuid,
    attempt: i32,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then(self.priority.cmp(&other.priority))
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct ScheduleState {
    heap: BinaryHeap<Reverse<Scheduled>>,
    /// Job ids currently scheduled or running; enqueueing one of these is a
    /// no-op, which is what makes the broker idempotent by job id.
    tracked: HashSet<Uuid>,
    seq: u64,
}

/// A finished attempt kept in the visible history.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedJob {
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct History {
    completed: VecDeque<FinishedJob>,
    failed: VecDeque<FinishedJob>,
}

/// Read-only dashboard projection of the broker.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub scheduled: usize,
    pub active: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub recent_completed: Vec<FinishedJob>,
    pub recent_failed: Vec<FinishedJob>,
}

// ============================================================================
// Broker
// ============================================================================

struct BrokerInner {
    processor: Arc<JobProcessor>,
    tenant_configs: Arc<TenantConfigCache>,
    retry_policy: RetryPolicy,
    state: Mutex<ScheduleState>,
    notify: Notify,
    permits: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
    active: AtomicUsize,
    completed_total: AtomicU64,
    failed_total: AtomicU64,
    history: Mutex<History>,
}

/// The per-process work broker.
#[derive(Clone)]
pub struct WorkBroker {
    inner: Arc<BrokerInner>,
}

impl WorkBroker {
    pub fn new(
        processor: Arc<JobProcessor>,
        tenant_configs: Arc<TenantConfigCache>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                processor,
                tenant_configs,
                retry_policy,
                state: Mutex::new(ScheduleState::default()),
                notify: Notify::new(),
                permits: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                completed_total: AtomicU64::new(0),
                failed_total: AtomicU64::new(0),
                history: Mutex::new(History::default()),
            }),
        }
    }

    /// Schedule a batch with per-tenant rate-limit spacing. Jobs already
    /// tracked by the broker are skipped.
    pub fn enqueue_bulk(&self, jobs: &[PipelineJob]) {
        for (position, job) in jobs.iter().enumerate() {
            let config = self.inner.tenant_configs.get(job.tenant_id);
            let delay = batch_delay(position, &config);
            self.schedule(job.id, job.tenant_id, 1, delay, config.priority);
        }
    }

    /// Manually reschedule a job (operator retry). Runs on the next cycle.
    pub fn retry(&self, job: &PipelineJob) {
        let config = self.inner.tenant_configs.get(job.tenant_id);
        self.schedule(
            job.id,
            job.tenant_id,
            job.retry_count + 1,
            Duration::ZERO,
            config.priority,
        );
    }

    fn schedule(&self, job_id: Uuid, tenant_id: Uuid, attempt: i32, delay: Duration, priority: u8) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.tracked.insert(job_id) {
            // Already scheduled or running: idempotent no-op.
            return;
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Reverse(Scheduled {
            due_at: Instant::now() + delay,
            priority,
            seq,
            job_id,
            tenant_id,
            attempt,
        }));
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Dashboard projection.
    pub fn observe(&self) -> QueueSnapshot {
        let scheduled = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .heap
            .len();
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        QueueSnapshot {
            scheduled,
            active: self.inner.active.load(Ordering::Relaxed),
            completed_total: self.inner.completed_total.load(Ordering::Relaxed),
            failed_total: self.inner.failed_total.load(Ordering::Relaxed),
            recent_completed: history.completed.iter().rev().take(50).cloned().collect(),
            recent_failed: history.failed.iter().rev().take(50).cloned().collect(),
        }
    }

    /// Dispatcher loop. Pops due jobs and runs each attempt on its own task,
    /// gated by the tenant's concurrency permits. On shutdown, in-flight
    /// attempts are drained (bounded).
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("work broker starting");

        loop {
            let next_due = {
                let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.heap.peek().map(|Reverse(s)| s.due_at)
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.inner.notify.notified() => {}
                _ = sleep_until_or_forever(next_due) => {}
            }

            let due_now = self.pop_due();
            for item in due_now {
                let inner = self.inner.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_attempt(inner, item, shutdown).await;
                });
            }
        }

        // Drain in-flight attempts before exiting.
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while self.inner.active.load(Ordering::Relaxed) > 0
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::info!("work broker stopped");
    }

    fn pop_due(&self) -> Vec<Scheduled> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while state
            .heap
            .peek()
            .is_some_and(|Reverse(next)| next.due_at <= now)
        {
            if let Some(Reverse(item)) = state.heap.pop() {
                due.push(item);
            }
        }
        due
    }
}

impl BrokerInner {
    fn tenant_semaphore(&self, tenant_id: Uuid) -> Arc<Semaphore> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        permits
            .entry(tenant_id)
            .or_insert_with(|| {
                let config = self.tenant_configs.get(tenant_id);
                Arc::new(Semaphore::new(config.max_concurrent.max(1)))
            })
            .clone()
    }

    fn untrack(&self, job_id: Uuid) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tracked
            .remove(&job_id);
    }

    fn record_completed(&self, entry: FinishedJob) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.completed.push_back(entry);
        while history.completed.len() > COMPLETED_HISTORY {
            history.completed.pop_front();
        }
    }

    fn record_failed(&self, entry: FinishedJob) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.failed.push_back(entry);
        while history.failed.len() > FAILED_HISTORY {
            history.failed.pop_front();
        }
    }
}

async fn run_attempt(inner: Arc<BrokerInner>, item: Scheduled, shutdown: CancellationToken) {
    let semaphore = inner.tenant_semaphore(item.tenant_id);
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    inner.active.fetch_add(1, Ordering::Relaxed);
    let result = inner.processor.process(item.job_id, true, &shutdown).await;
    inner.active.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(outcome) => {
            inner.untrack(item.job_id);
            inner.record_completed(FinishedJob {
                job_id: item.job_id,
                tenant_id: item.tenant_id,
                finished_at: Utc::now(),
                skipped: outcome.skipped,
                error: None,
            });
        }
        Err(e) => {
            // A vanished job row must not be double-written.
            if matches!(e, super::error::PipelineError::PipelineJobNotFound(_)) {
                tracing::error!(job_id = %item.job_id, "job row vanished, dropping attempt");
                inner.untrack(item.job_id);
                return;
            }

            if let Err(hook_err) = inner
                .processor
                .on_failed(item.job_id, &e, item.attempt)
                .await
            {
                tracing::error!(
                    job_id = %item.job_id,
                    error = %hook_err,
                    "failed to record job failure"
                );
            }

            if e.retryable() && item.attempt < inner.retry_policy.attempts {
                let delay = inner.retry_policy.backoff(item.attempt);
                let config = inner.tenant_configs.get(item.tenant_id);
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.seq += 1;
                let seq = state.seq;
                state.heap.push(Reverse(Scheduled {
                    due_at: Instant::now() + delay,
                    priority: config.priority,
                    seq,
                    job_id: item.job_id,
                    tenant_id: item.tenant_id,
                    attempt: item.attempt + 1,
                }));
                drop(state);
                inner.notify.notify_one();
            } else {
                inner.untrack(item.job_id);
                inner.record_failed(FinishedJob {
                    job_id: item.job_id,
                    tenant_id: item.tenant_id,
                    finished_at: Utc::now(),
                    skipped: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tenant_config_matches_documented_defaults() {
        let config = TenantQueueConfig::default();
        assert_eq!(config.priority, 5);
        assert_eq!(config.delay_ms, 0);
        assert_eq!(config.max_concurrent, 50);
        assert_eq!(config.rate_limit_per_second, 100);
    }

    #[test]
    fn batch_delay_spaces_jobs_under_a_rate_limit() {
        let config = TenantQueueConfig {
            rate_limit_per_second: 10,
            delay_ms: 50,
            ..Default::default()
        };
        // ceil(1000 / 10) = 100ms spacing per position, plus the base delay.
        assert_eq!(batch_delay(0, &config), Duration::from_millis(50));
        assert_eq!(batch_delay(1, &config), Duration::from_millis(150));
        assert_eq!(batch_delay(4, &config), Duration::from_millis(450));
    }

    #[test]
    fn batch_delay_rounds_spacing_up() {
        let config = TenantQueueConfig {
            rate_limit_per_second: 3,
            delay_ms: 0,
            ..Default::default()
        };
        // ceil(1000 / 3) = 334ms.
        assert_eq!(batch_delay(1, &config), Duration::from_millis(334));
    }

    #[test]
    fn batch_delay_without_rate_limit_is_the_base_delay() {
        let config = TenantQueueConfig {
            rate_limit_per_second: 0,
            delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(batch_delay(0, &config), Duration::from_millis(250));
        assert_eq!(batch_delay(99, &config), Duration::from_millis(250));
    }

    #[test]
    fn retry_policy_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8_000));
    }

    #[test]
    fn tenant_config_cache_get_set_clear() {
        let cache = TenantConfigCache::new();
        let tenant = Uuid::new_v4();
        assert_eq!(cache.get(tenant).priority, 5);

        cache.set(
            tenant,
            TenantQueueConfig {
                priority: 1,
                delay_ms: 10,
                max_concurrent: 2,
                rate_limit_per_second: 5,
            },
        );
        assert_eq!(cache.get(tenant).priority, 1);
        assert_eq!(cache.get(tenant).max_concurrent, 2);

        cache.clear();
        assert_eq!(cache.get(tenant).priority, 5);
    }

    #[test]
    fn scheduled_ordering_prefers_earlier_then_priority() {
        let now = Instant::now();
        let a = Scheduled {
            due_at: now,
            priority: 5,
            seq: 1,
            job_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            attempt: 1,
        };
        let b = Scheduled {
            due_at: now,
            priority: 1,
            seq: 2,
            ..a.clone()
        };
        let c = Scheduled {
            due_at: now + Duration::from_millis(10),
            priority: 1,
            seq: 3,
            ..a.clone()
        };

        let mut heap = BinaryHeap::new();
        heap.push(Reverse(a.clone()));
        heap.push(Reverse(b.clone()));
        heap.push(Reverse(c.clone()));

        assert_eq!(heap.pop().unwrap().0.seq, b.seq);
        assert_eq!(heap.pop().unwrap().0.seq, a.seq);
        assert_eq!(heap.pop().unwrap().0.seq, c.seq);
    }
}
