//! Operator-facing pipeline surfaces: job listings, failure log, manual
//! retry, and pipeline health.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::pagination::{Page, PageParams};
use crate::domains::pipeline::failure_log::FailureLog;
use crate::domains::pipeline::models::{Channel, JobStatus, PipelineFailure, PipelineJob};
use crate::domains::pipeline::queue::QueueSnapshot;
use crate::domains::pipeline::state::TransitionFields;
use crate::domains::pipeline::store::{JobFilter, JobStore, StatusCounts};
use crate::server::app::AppState;

use super::{optional_tenant_id, tenant_id, ApiError};

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub campaign_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub status: Option<String>,
    pub channel: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl JobsQuery {
    fn filter(&self) -> Result<JobFilter, ApiError> {
        let status = self
            .status
            .as_deref()
            .map(JobStatus::from_str)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let channel = self
            .channel
            .as_deref()
            .map(Channel::from_str)
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        Ok(JobFilter {
            campaign_id: self.campaign_id,
            campaign_run_id: self.run_id,
            contact_id: self.contact_id,
            status,
            channel,
        })
    }
}

/// GET /pipeline/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<PipelineJob>>, ApiError> {
    let tenant = tenant_id(&headers)?;
    let filter = query.filter()?;
    let page = Page::new(query.limit, query.offset);
    let jobs = state.deps.store.find_jobs(tenant, &filter, page).await?;
    Ok(Json(jobs))
}

/// GET /pipeline/jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineJob>, ApiError> {
    let tenant = tenant_id(&headers)?;
    let job = state
        .deps
        .store
        .find_by_id(tenant, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;
    Ok(Json(job))
}

/// GET /pipeline/jobs/campaign/:campaign_id/stats
pub async fn campaign_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<StatusCounts>, ApiError> {
    let tenant = tenant_id(&headers)?;
    let counts = state
        .deps
        .store
        .campaign_status_counts(tenant, campaign_id)
        .await?;
    Ok(Json(counts))
}

/// GET /pipeline/failures
pub async fn list_failures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<PipelineFailure>>, ApiError> {
    let tenant = tenant_id(&headers)?;
    let failures = state.deps.failures.list(tenant, Page::from(page)).await?;
    Ok(Json(failures))
}

/// GET /pipeline/dead
pub async fn list_dead(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageParams>,
) -> Result<Json<Vec<PipelineJob>>, ApiError> {
    let tenant = tenant_id(&headers)?;
    let filter = JobFilter {
        status: Some(JobStatus::Dead),
        ..Default::default()
    };
    let jobs = state
        .deps
        .store
        .find_jobs(tenant, &filter, Page::from(page))
        .await?;
    Ok(Json(jobs))
}

/// POST /pipeline/retry/:id
///
/// Operator escape hatch: requeue a dead (or failed) job. Returns 400 when
/// the state machine refuses the transition.
pub async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<PipelineJob>, ApiError> {
    let tenant = tenant_id(&headers)?;
    // Scope the lookup before mutating anything.
    state
        .deps
        .store
        .find_by_id(tenant, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))?;

    let fields = TransitionFields {
        retry_count: Some(0),
        ..Default::default()
    };
    let job = state
        .deps
        .store
        .transition(id, JobStatus::Pending, fields)
        .await?;

    if let Some(broker) = &state.broker {
        broker.retry(&job);
    }

    tracing::info!(job_id = %id, "job requeued by operator");
    Ok(Json(job))
}

/// POST /pipeline/runs/:id/recalculate
///
/// Recovery path: recount jobs by status and overwrite the run counters.
pub async fn recalculate_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<Uuid>,
) -> Result<Json<crate::domains::campaigns::CampaignRun>, ApiError> {
    tenant_id(&headers)?;
    let run = state.stats.recalculate_stats(run_id).await?;
    Ok(Json(run))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineHealth {
    pub pending_jobs: i64,
    pub processing_jobs: i64,
    pub failed_jobs: i64,
    pub dead_jobs: i64,
    pub is_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueSnapshot>,
}

/// GET /pipeline/health
pub async fn pipeline_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<PipelineHealth>, ApiError> {
    let tenant = optional_tenant_id(&headers)?;
    let counts = state.deps.store.count_by_status(tenant).await?;

    let failed_jobs = counts.failed + counts.retrying;
    let is_healthy = counts.dead < 100 && failed_jobs < 1000;

    Ok(Json(PipelineHealth {
        pending_jobs: counts.pending + counts.queued,
        processing_jobs: counts.processing,
        failed_jobs,
        dead_jobs: counts.dead,
        is_healthy,
        queue: state.broker.as_ref().map(|b| b.observe()),
    }))
}
