pub mod health;
pub mod jobs;
pub mod resumes;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Ranking
        .route("/api/v1/jobs/:id/rank", post(jobs::handle_rank_candidates))
        .route(
            "/api/v1/jobs/:id/ranking-status",
            get(jobs::handle_ranking_status),
        )
        // Resume ingestion
        .route(
            "/api/v1/resumes/:id/process",
            post(resumes::handle_queue_resume),
        )
        .route(
            "/api/v1/resumes/:id/processing-status",
            get(resumes::handle_processing_status),
        )
        .with_state(state)
}
