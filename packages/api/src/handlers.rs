use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use drydock_cases::{Case, CaseDescriptor, EngineError};
use drydock_logs::LogRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info};

/// Uniform response envelope for every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error<E: ToString>(error: E) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidState { .. }
        | EngineError::Archived(_)
        | EngineError::PipelineBusy(_) => StatusCode::CONFLICT,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type CaseReply = (StatusCode, Json<ApiResponse<Case>>);

fn case_reply(result: Result<Case, EngineError>) -> CaseReply {
    match result {
        Ok(case) => (StatusCode::OK, Json(ApiResponse::success(case))),
        Err(e) => {
            error!("Case operation failed: {}", e);
            (status_for(&e), Json(ApiResponse::error(e)))
        }
    }
}

/// Create a case and enqueue its pipeline.
pub async fn create_case(
    State(state): State<AppState>,
    Json(descriptor): Json<CaseDescriptor>,
) -> CaseReply {
    info!("Creating case for {}", descriptor.repo_url);
    match state.engine.submit(descriptor).await {
        Ok(case) => (StatusCode::CREATED, Json(ApiResponse::success(case))),
        Err(e) => {
            error!("Failed to create case: {}", e);
            (status_for(&e), Json(ApiResponse::error(e)))
        }
    }
}

/// Latest persisted snapshot including runtime fields and derived-job flags.
pub async fn get_case(Path(id): Path<String>, State(state): State<AppState>) -> CaseReply {
    case_reply(state.engine.get(&id).await)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// One wire log record: `{ts, stream, level, line}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    pub stream: String,
    pub level: String,
    pub line: String,
}

impl From<LogRecord> for LogEvent {
    fn from(record: LogRecord) -> Self {
        Self {
            ts: record.timestamp,
            stream: record.stream.as_str().to_string(),
            level: match record.level {
                drydock_logs::LogLevel::Info => "INFO".to_string(),
                drydock_logs::LogLevel::Error => "ERROR".to_string(),
            },
            line: record.line,
        }
    }
}

/// Historical logs: the retained record sequence for a case.
pub async fn case_logs(
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<Vec<LogEvent>>>) {
    if let Err(e) = state.engine.get(&id).await {
        return (status_for(&e), Json(ApiResponse::error(e)));
    }

    let records = state.engine.logs().replay(&id, query.limit).await;
    let events = records.into_iter().map(LogEvent::from).collect();
    (StatusCode::OK, Json(ApiResponse::success(events)))
}

/// Preflight diagnostics attached to the most recent build attempt.
pub async fn case_preflight(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<Option<serde_json::Value>>>) {
    match state.engine.preflight_diagnostics(&id).await {
        Ok(decision) => (StatusCode::OK, Json(ApiResponse::success(decision))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e))),
    }
}

pub async fn stop_case(Path(id): Path<String>, State(state): State<AppState>) -> CaseReply {
    info!("Stop requested for case {}", id);
    case_reply(state.engine.stop(&id).await)
}

pub async fn restart_case(Path(id): Path<String>, State(state): State<AppState>) -> CaseReply {
    info!("Restart requested for case {}", id);
    case_reply(state.engine.restart(&id).await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryRequest {
    /// Additional write-only environment values merged into the next attempt.
    pub env: Option<HashMap<String, String>>,
}

pub async fn retry_case(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> CaseReply {
    info!("Retry requested for case {}", id);
    case_reply(state.engine.retry(&id, request.env).await)
}

pub async fn archive_case(Path(id): Path<String>, State(state): State<AppState>) -> CaseReply {
    info!("Archive requested for case {}", id);
    case_reply(state.engine.archive(&id).await)
}

/// Status report from a derived-job collaborator.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStatusReport {
    pub status: Option<String>,
    #[serde(default)]
    pub ready: bool,
}

pub async fn report_analyze_status(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(report): Json<JobStatusReport>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state
        .engine
        .set_analyze_status(&id, report.status.as_deref(), report.ready)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e))),
    }
}

pub async fn report_visual_status(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(report): Json<JobStatusReport>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state
        .engine
        .set_visual_status(&id, report.status.as_deref(), report.ready)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(()))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e))),
    }
}

/// Resolve the artifact cache key for a case; requires a resolved commit.
async fn artifact_key(
    state: &AppState,
    id: &str,
    template_version: Option<String>,
) -> Result<drydock_cache::ArtifactKey, (StatusCode, String)> {
    let case = state
        .engine
        .get(id)
        .await
        .map_err(|e| (status_for(&e), e.to_string()))?;
    let Some(commit_sha) = case.commit_sha else {
        return Err((
            StatusCode::CONFLICT,
            "case has no resolved commit yet".to_string(),
        ));
    };
    Ok(drydock_cache::ArtifactKey {
        repo_url: case.repo_url,
        commit_sha,
        template_version,
    })
}

#[derive(Debug, Deserialize)]
pub struct VisualQuery {
    pub template_version: Option<String>,
}

/// Opaque artifact bundle posted by a derived-job collaborator.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactUpload {
    pub bundle: serde_json::Value,
    #[serde(default)]
    pub template_version: Option<String>,
}

type ArtifactReply = (StatusCode, Json<ApiResponse<serde_json::Value>>);

async fn fetch_artifact(state: &AppState, id: &str, template_version: Option<String>) -> ArtifactReply {
    let key = match artifact_key(state, id, template_version).await {
        Ok(key) => key,
        Err((status, message)) => return (status, Json(ApiResponse::error(message))),
    };

    match state.artifacts.get(&key).await {
        Some(artifact) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                serde_json::to_value(artifact.as_ref()).unwrap_or_default(),
            )),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("artifact not generated yet")),
        ),
    }
}

async fn store_artifact(state: &AppState, id: &str, upload: ArtifactUpload) -> ArtifactReply {
    let key = match artifact_key(state, id, upload.template_version).await {
        Ok(key) => key,
        Err((status, message)) => return (status, Json(ApiResponse::error(message))),
    };

    let bundle = upload.bundle;
    match state
        .artifacts
        .regenerate(key, move || async move { Ok(bundle) })
        .await
    {
        Ok(artifact) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                serde_json::to_value(artifact.as_ref()).unwrap_or_default(),
            )),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e)),
        ),
    }
}

/// Cached documentation artifact for the case's resolved commit.
pub async fn get_report(Path(id): Path<String>, State(state): State<AppState>) -> ArtifactReply {
    fetch_artifact(&state, &id, None).await
}

/// Documentation artifact written back by the Explain collaborator.
pub async fn store_report(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(upload): Json<ArtifactUpload>,
) -> ArtifactReply {
    store_artifact(&state, &id, ArtifactUpload { template_version: None, ..upload }).await
}

/// Cached visualization artifact, keyed additionally by template version.
pub async fn get_visual(
    Path(id): Path<String>,
    Query(query): Query<VisualQuery>,
    State(state): State<AppState>,
) -> ArtifactReply {
    fetch_artifact(&state, &id, query.template_version).await
}

/// Visualization artifact written back by the Visualize collaborator.
pub async fn store_visual(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(upload): Json<ArtifactUpload>,
) -> ArtifactReply {
    store_artifact(&state, &id, upload).await
}

#[derive(Debug, Serialize)]
pub struct HealthInfo {
    pub status: &'static str,
    pub ports_in_use: usize,
    pub ports_capacity: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthInfo>> {
    let ports = state.engine.ports();
    Json(ApiResponse::success(HealthInfo {
        status: "ok",
        ports_in_use: ports.occupancy(),
        ports_capacity: ports.capacity(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_cases::CaseStatus;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&EngineError::NotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&EngineError::Validation("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&EngineError::Archived("x".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::PipelineBusy("x".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EngineError::InvalidState {
                action: "retry",
                status: CaseStatus::Running
            }),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_retry_request_rejects_unknown_fields() {
        let raw = serde_json::json!({ "env": {}, "force": true });
        assert!(serde_json::from_value::<RetryRequest>(raw).is_err());

        let empty = serde_json::json!({});
        let parsed = serde_json::from_value::<RetryRequest>(empty).unwrap();
        assert!(parsed.env.is_none());
    }

    #[test]
    fn test_log_event_wire_shape() {
        let record = LogRecord {
            timestamp: Utc::now(),
            stream: drydock_logs::LogStream::Build,
            level: drydock_logs::LogLevel::Error,
            line: "step failed".to_string(),
        };
        let event = LogEvent::from(record);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["stream"], "build");
        assert_eq!(json["level"], "ERROR");
        assert_eq!(json["line"], "step failed");
        assert!(json.get("ts").is_some());
    }
}
