// ABOUTME: Router-level tests exercising the HTTP surface against a real engine
// ABOUTME: Fake runtime and fetch collaborators keep the pipeline out of Docker

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use drydock_api::{create_router, AppState};
use drydock_cache::ArtifactCache;
use drydock_cases::{
    CaseEngine, CaseStorage, EngineConfig, FetchError, ReadinessPolicy, RepoFetcher, RepoSnapshot,
};
use drydock_logs::CaseLogStore;
use drydock_ports::PortPool;
use drydock_runtime::{
    BuildRequest, ContainerExit, ContainerRuntime, Result as RuntimeResult, RunRequest,
    RunningContainer,
};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Default)]
struct FakeRuntime {
    counter: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(
        &self,
        case_id: &str,
        request: &BuildRequest,
        logs: &CaseLogStore,
    ) -> RuntimeResult<String> {
        logs.build_line(case_id, "Step 1/1 : FROM base").await;
        Ok(request.image_tag.clone())
    }

    async fn run_container(
        &self,
        _case_id: &str,
        request: RunRequest,
        _logs: Arc<CaseLogStore>,
    ) -> RuntimeResult<RunningContainer> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let host_port = request.lease.port();
        Ok(RunningContainer {
            container_id: format!("fake-container-{}", n),
            host_port,
            lease: request.lease,
        })
    }

    async fn stop_container(&self, _container_id: &str, _grace: Duration) -> RuntimeResult<()> {
        Ok(())
    }

    async fn remove_container(&self, _container_id: &str) -> RuntimeResult<()> {
        Ok(())
    }

    async fn inspect_exit(&self, _container_id: &str) -> RuntimeResult<ContainerExit> {
        Ok(ContainerExit::Running)
    }

    async fn compose_up(
        &self,
        _case_id: &str,
        _compose_file: &Path,
        _project: &str,
        _env: &HashMap<String, String>,
        _logs: Arc<CaseLogStore>,
    ) -> RuntimeResult<()> {
        Ok(())
    }

    async fn compose_down(&self, _compose_file: &Path, _project: &str) -> RuntimeResult<()> {
        Ok(())
    }
}

struct FakeFetcher {
    root: PathBuf,
}

#[async_trait]
impl RepoFetcher for FakeFetcher {
    async fn fetch(
        &self,
        _repo_url: &str,
        _git_ref: Option<&str>,
    ) -> Result<RepoSnapshot, FetchError> {
        Ok(RepoSnapshot {
            root: self.root.clone(),
            commit_sha: "feedface0000000000000000000000000000cafe".to_string(),
            default_branch: Some("main".to_string()),
        })
    }
}

struct TestApp {
    router: Router,
    engine: Arc<CaseEngine>,
    _tree: TempDir,
    _workdir: TempDir,
}

/// Build the app. Workers are only spawned when `run_pipelines` is set, so
/// state-validation tests can hold cases in PENDING deterministically.
async fn test_app(run_pipelines: bool) -> TestApp {
    let tree = TempDir::new().unwrap();
    std::fs::write(tree.path().join("Dockerfile"), "FROM alpine\nEXPOSE 3000\n").unwrap();
    let workdir = TempDir::new().unwrap();

    let storage = Arc::new(CaseStorage::connect("sqlite::memory:").await.unwrap());
    let ports = Arc::new(PortPool::new(9400, 9410).unwrap());
    let logs = Arc::new(CaseLogStore::new(1000));
    let runtime = Arc::new(FakeRuntime::default());
    let fetcher = Arc::new(FakeFetcher {
        root: tree.path().to_path_buf(),
    });

    let config = EngineConfig {
        workers: 2,
        workdir: workdir.path().to_path_buf(),
        readiness: ReadinessPolicy {
            grace: Duration::from_millis(50),
            probe_tcp: false,
            require_probe: false,
            poll_interval: Duration::from_millis(10),
        },
        monitor_interval: Duration::from_millis(20),
        ..Default::default()
    };

    let engine = Arc::new(CaseEngine::new(
        storage,
        runtime as Arc<dyn ContainerRuntime>,
        fetcher as Arc<dyn RepoFetcher>,
        ports,
        logs,
        config,
    ));
    if run_pipelines {
        engine.start();
    }

    let router = create_router(AppState {
        engine: Arc::clone(&engine),
        artifacts: Arc::new(ArtifactCache::new()),
    });

    TestApp {
        router,
        engine,
        _tree: tree,
        _workdir: workdir,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_case(app: &TestApp) -> String {
    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/cases",
            serde_json::json!({ "repo_url": "https://example.com/app.git" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    json["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_reports_pool_occupancy() {
    let app = test_app(false).await;

    let response = app.router.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "ok");
    assert_eq!(json["data"]["ports_in_use"], 0);
    assert_eq!(json["data"]["ports_capacity"], 10);
}

#[tokio::test]
async fn test_create_case_returns_snapshot() {
    let app = test_app(false).await;

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/cases",
            serde_json::json!({
                "repo_url": "https://example.com/app.git",
                "env": { "API_KEY": "secret-value" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "pending");
    assert_eq!(json["data"]["env_keys"][0], "API_KEY");
    // env values are write-only and never serialized back.
    assert!(!json.to_string().contains("secret-value"));
}

#[tokio::test]
async fn test_create_case_rejects_invalid_descriptor() {
    let app = test_app(false).await;

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/cases",
            serde_json::json!({ "repo_url": "" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown fields are rejected by deserialization, not ignored.
    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/cases",
            serde_json::json!({
                "repo_url": "https://example.com/app.git",
                "surprise": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_unknown_case_is_404() {
    let app = test_app(false).await;

    for uri in [
        "/api/cases/missing",
        "/api/cases/missing/logs",
        "/api/cases/missing/preflight",
    ] {
        let response = app.router.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
    }

    let response = app
        .router
        .clone()
        .oneshot(post_json("/api/cases/missing/retry", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_state_management_is_409() {
    let app = test_app(false).await;
    let id = create_case(&app).await;

    // Retry is only valid from FAILED; the case is still PENDING.
    let response = app
        .router
        .clone()
        .oneshot(post_json(
            &format!("/api/cases/{}/retry", id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("retry"));
}

#[tokio::test]
async fn test_archive_then_mutations_rejected() {
    let app = test_app(false).await;
    let id = create_case(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            &format!("/api/cases/{}/archive", id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["status"], "archived");

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            &format!("/api/cases/{}/stop", id),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_logs_replay_over_http() {
    let app = test_app(false).await;
    let id = create_case(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/cases/{}/logs", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let records = json["data"].as_array().unwrap();
    assert!(!records.is_empty());
    assert_eq!(records[0]["stream"], "system");
    assert_eq!(records[0]["level"], "INFO");
    assert!(records[0]["line"].as_str().unwrap().contains("Case created"));
    assert!(records[0].get("ts").is_some());
}

#[tokio::test]
async fn test_derived_job_status_round_trip() {
    let app = test_app(false).await;
    let id = create_case(&app).await;

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            &format!("/api/cases/{}/analyze-status", id),
            serde_json::json!({ "status": "ready", "ready": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/cases/{}", id)))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["analyze_status"], "ready");
    assert_eq!(json["data"]["report_ready"], true);
    // Lifecycle is untouched by collaborator reports.
    assert_eq!(json["data"]["status"], "pending");
}

#[tokio::test]
async fn test_artifact_requires_resolved_commit() {
    let app = test_app(false).await;
    let id = create_case(&app).await;

    // No clone has run, so there is no commit to key the cache with.
    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/cases/{}/report", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_artifact_store_and_fetch() {
    let app = test_app(true).await;
    let id = create_case(&app).await;

    // Wait for the pipeline to resolve a commit.
    for _ in 0..500 {
        let case = app.engine.get(&id).await.unwrap();
        if case.commit_sha.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/cases/{}/report", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            &format!("/api/cases/{}/report", id),
            serde_json::json!({ "bundle": { "pages": 4 } }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/api/cases/{}/report", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["bundle"]["pages"], 4);
    assert_eq!(
        json["data"]["key"]["commit_sha"],
        "feedface0000000000000000000000000000cafe"
    );
}
