//! Application setup and router construction.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::campaigns::StatsAggregator;
use crate::domains::pipeline::queue::WorkBroker;
use crate::domains::pipeline::reconciler::{WebhookReconciler, WebhookVerifier};
use crate::kernel::PipelineDeps;
use crate::server::routes::{health, pipeline, webhooks};

#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub deps: PipelineDeps,
    pub broker: Option<WorkBroker>,
    pub reconciler: Arc<WebhookReconciler>,
    pub verifier: WebhookVerifier,
    pub stats: StatsAggregator,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/pipeline/jobs", get(pipeline::list_jobs))
        .route("/pipeline/jobs/:id", get(pipeline::get_job))
        .route(
            "/pipeline/jobs/campaign/:campaign_id/stats",
            get(pipeline::campaign_stats),
        )
        .route("/pipeline/failures", get(pipeline::list_failures))
        .route("/pipeline/dead", get(pipeline::list_dead))
        .route("/pipeline/retry/:id", post(pipeline::retry_job))
        .route(
            "/pipeline/runs/:id/recalculate",
            post(pipeline::recalculate_run),
        )
        .route("/pipeline/health", get(pipeline::pipeline_health))
        .route("/webhooks/email", post(webhooks::email_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
