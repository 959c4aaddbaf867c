// ABOUTME: HTTP API layer for Drydock: case lifecycle, logs and diagnostics routes
// ABOUTME: Thin axum handlers over the case engine with a uniform response envelope

pub mod handlers;
pub mod sse;

use axum::{
    routing::{get, post},
    Router,
};
use drydock_cache::ArtifactCache;
use drydock_cases::CaseEngine;
use std::sync::Arc;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CaseEngine>,
    pub artifacts: Arc<ArtifactCache>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/cases", post(handlers::create_case))
        .route("/api/cases/{id}", get(handlers::get_case))
        .route("/api/cases/{id}/logs", get(handlers::case_logs))
        .route("/api/cases/{id}/logs/stream", get(sse::stream_case_logs))
        .route("/api/cases/{id}/preflight", get(handlers::case_preflight))
        .route("/api/cases/{id}/stop", post(handlers::stop_case))
        .route("/api/cases/{id}/restart", post(handlers::restart_case))
        .route("/api/cases/{id}/retry", post(handlers::retry_case))
        .route("/api/cases/{id}/archive", post(handlers::archive_case))
        .route(
            "/api/cases/{id}/analyze-status",
            post(handlers::report_analyze_status),
        )
        .route(
            "/api/cases/{id}/visual-status",
            post(handlers::report_visual_status),
        )
        .route("/api/cases/{id}/report", get(handlers::get_report))
        .route("/api/cases/{id}/report", post(handlers::store_report))
        .route("/api/cases/{id}/visual", get(handlers::get_visual))
        .route("/api/cases/{id}/visual", post(handlers::store_visual))
        .with_state(state)
}
