// ABOUTME: Storage layer for cases providing CRUD and targeted lifecycle updates
// ABOUTME: Persists case state in SQLite; env values never touch this layer

use crate::case::{BuildParams, Case, CaseStage, CaseStatus, ErrorCode};
use chrono::{DateTime, Utc};
use drydock_preflight::RunMode;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Case not found: {0}")]
    NotFound(String),
    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cases (
    id TEXT PRIMARY KEY,
    repo_url TEXT NOT NULL,
    git_ref TEXT,
    commit_sha TEXT,
    run_mode TEXT NOT NULL,
    dockerfile_path TEXT,
    compose_file TEXT,
    context_path TEXT,
    build_network TEXT,
    build_no_cache INTEGER NOT NULL DEFAULT 0,
    build_args TEXT NOT NULL DEFAULT '{}',
    env_keys TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    access_url TEXT,
    host_port INTEGER,
    container_id TEXT,
    analyze_status TEXT,
    report_ready INTEGER NOT NULL DEFAULT 0,
    visual_status TEXT,
    visual_ready INTEGER NOT NULL DEFAULT 0,
    preflight TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cases_status ON cases(status);
"#;

const CASE_COLUMNS: &str = r#"
    id, repo_url, git_ref, commit_sha, run_mode,
    dockerfile_path, compose_file, context_path,
    build_network, build_no_cache, build_args, env_keys,
    status, stage, error_code, error_message,
    access_url, host_port, container_id,
    analyze_status, report_ready, visual_status, visual_ready,
    created_at, updated_at
"#;

pub struct CaseStorage {
    pool: SqlitePool,
}

impl CaseStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the given SQLite URL and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self> {
        // An in-memory database exists per connection, so it must not be pooled.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let storage = Self::new(pool);
        storage.init_schema().await?;
        Ok(storage)
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_case(&self, case: &Case) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cases (
                id, repo_url, git_ref, commit_sha, run_mode,
                dockerfile_path, compose_file, context_path,
                build_network, build_no_cache, build_args, env_keys,
                status, stage, error_code, error_message,
                access_url, host_port, container_id,
                analyze_status, report_ready, visual_status, visual_ready,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8,
                ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16,
                ?17, ?18, ?19,
                ?20, ?21, ?22, ?23,
                ?24, ?25
            )
            "#,
        )
        .bind(&case.id)
        .bind(&case.repo_url)
        .bind(&case.git_ref)
        .bind(&case.commit_sha)
        .bind(case.run_mode.as_str())
        .bind(&case.dockerfile_path)
        .bind(&case.compose_file)
        .bind(&case.context_path)
        .bind(&case.build.network)
        .bind(case.build.no_cache)
        .bind(serde_json::to_string(&case.build.build_args)?)
        .bind(serde_json::to_string(&case.env_keys)?)
        .bind(case.status.as_str())
        .bind(case.stage.as_str())
        .bind(case.error_code.map(|c| c.as_str()))
        .bind(&case.error_message)
        .bind(&case.access_url)
        .bind(case.host_port.map(|p| p as i64))
        .bind(&case.container_id)
        .bind(&case.analyze_status)
        .bind(case.report_ready)
        .bind(&case.visual_status)
        .bind(case.visual_ready)
        .bind(case.created_at.to_rfc3339())
        .bind(case.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_case(&self, id: &str) -> Result<Case> {
        let query = format!("SELECT {} FROM cases WHERE id = ?1", CASE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_case(row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    pub async fn list_by_status(&self, status: CaseStatus) -> Result<Vec<Case>> {
        let query = format!(
            "SELECT {} FROM cases WHERE status = ?1 ORDER BY created_at ASC",
            CASE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_case).collect()
    }

    pub async fn update_status(&self, id: &str, status: CaseStatus, stage: CaseStage) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET status = ?1, stage = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(stage.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn set_commit(&self, id: &str, commit_sha: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET commit_sha = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(commit_sha)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    /// Commit a failure: status, stage attribution and error fields move in
    /// one statement, and the runtime snapshot is cleared with them.
    pub async fn fail_case(
        &self,
        id: &str,
        stage: CaseStage,
        code: ErrorCode,
        message: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET status = 'failed', stage = ?1, error_code = ?2, error_message = ?3,
                access_url = NULL, host_port = NULL, container_id = NULL,
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(stage.as_str())
        .bind(code.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn set_runtime(
        &self,
        id: &str,
        access_url: Option<&str>,
        host_port: Option<u16>,
        container_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET access_url = ?1, host_port = ?2, container_id = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(access_url)
        .bind(host_port.map(|p| p as i64))
        .bind(container_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn clear_runtime(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET access_url = NULL, host_port = NULL, container_id = NULL, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    /// Re-enter PENDING for a retry: error fields, runtime snapshot and stage
    /// reset atomically with the status change so no stale error is ever
    /// visible once the new attempt begins.
    pub async fn reset_for_retry(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET status = 'pending', stage = 'system',
                error_code = NULL, error_message = NULL,
                access_url = NULL, host_port = NULL, container_id = NULL,
                updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn clear_error(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET error_code = NULL, error_message = NULL, updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn set_env_keys(&self, id: &str, env_keys: &[String]) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET env_keys = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(serde_json::to_string(env_keys)?)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn set_preflight(&self, id: &str, decision: &serde_json::Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET preflight = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(serde_json::to_string(decision)?)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn get_preflight(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query("SELECT preflight FROM cases WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let raw: Option<String> = row.get("preflight");
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_analyze_status(
        &self,
        id: &str,
        status: Option<&str>,
        ready: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET analyze_status = ?1, report_ready = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(status)
        .bind(ready)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }

    pub async fn set_visual_status(
        &self,
        id: &str,
        status: Option<&str>,
        ready: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cases SET visual_status = ?1, visual_ready = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(status)
        .bind(ready)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result, id)
    }
}

fn require_row(result: sqlx::sqlite::SqliteQueryResult, id: &str) -> Result<()> {
    if result.rows_affected() == 0 {
        Err(StorageError::NotFound(id.to_string()))
    } else {
        Ok(())
    }
}

fn row_to_case(row: sqlx::sqlite::SqliteRow) -> Result<Case> {
    let status_raw: String = row.get("status");
    let status = CaseStatus::parse(&status_raw)
        .ok_or_else(|| StorageError::InvalidValue(format!("status: {}", status_raw)))?;

    let stage_raw: String = row.get("stage");
    let stage = CaseStage::parse(&stage_raw)
        .ok_or_else(|| StorageError::InvalidValue(format!("stage: {}", stage_raw)))?;

    let run_mode_raw: String = row.get("run_mode");
    let run_mode = RunMode::parse(&run_mode_raw)
        .ok_or_else(|| StorageError::InvalidValue(format!("run_mode: {}", run_mode_raw)))?;

    let error_code = row
        .get::<Option<String>, _>("error_code")
        .map(|raw| {
            ErrorCode::parse(&raw)
                .ok_or_else(|| StorageError::InvalidValue(format!("error_code: {}", raw)))
        })
        .transpose()?;

    let build = BuildParams {
        network: row.get("build_network"),
        no_cache: row.get("build_no_cache"),
        build_args: serde_json::from_str(&row.get::<String, _>("build_args"))?,
    };

    Ok(Case {
        id: row.get("id"),
        repo_url: row.get("repo_url"),
        git_ref: row.get("git_ref"),
        commit_sha: row.get("commit_sha"),
        run_mode,
        dockerfile_path: row.get("dockerfile_path"),
        compose_file: row.get("compose_file"),
        context_path: row.get("context_path"),
        build,
        env_keys: serde_json::from_str(&row.get::<String, _>("env_keys"))?,
        status,
        stage,
        error_code,
        error_message: row.get("error_message"),
        access_url: row.get("access_url"),
        host_port: row.get::<Option<i64>, _>("host_port").map(|p| p as u16),
        container_id: row.get("container_id"),
        analyze_status: row.get("analyze_status"),
        report_ready: row.get("report_ready"),
        visual_status: row.get("visual_status"),
        visual_ready: row.get("visual_ready"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidValue(format!("timestamp {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::CaseDescriptor;

    async fn test_storage() -> CaseStorage {
        CaseStorage::connect("sqlite::memory:").await.unwrap()
    }

    fn descriptor(repo_url: &str) -> CaseDescriptor {
        serde_json::from_value(serde_json::json!({ "repo_url": repo_url })).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let storage = test_storage().await;
        let mut case = Case::new(&descriptor("https://example.com/repo.git"));
        case.env_keys = vec!["API_KEY".to_string()];
        storage.create_case(&case).await.unwrap();

        let loaded = storage.get_case(&case.id).await.unwrap();
        assert_eq!(loaded.repo_url, case.repo_url);
        assert_eq!(loaded.status, CaseStatus::Pending);
        assert_eq!(loaded.stage, CaseStage::System);
        assert_eq!(loaded.env_keys, vec!["API_KEY"]);
        assert!(loaded.error_code.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_case() {
        let storage = test_storage().await;
        assert!(matches!(
            storage.get_case("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_and_runtime_updates() {
        let storage = test_storage().await;
        let case = Case::new(&descriptor("https://example.com/repo.git"));
        storage.create_case(&case).await.unwrap();

        storage
            .update_status(&case.id, CaseStatus::Running, CaseStage::Run)
            .await
            .unwrap();
        storage
            .set_runtime(&case.id, Some("http://localhost:9000"), Some(9000), "abc123")
            .await
            .unwrap();

        let loaded = storage.get_case(&case.id).await.unwrap();
        assert_eq!(loaded.status, CaseStatus::Running);
        assert_eq!(loaded.host_port, Some(9000));
        assert_eq!(loaded.container_id.as_deref(), Some("abc123"));

        storage.clear_runtime(&case.id).await.unwrap();
        let loaded = storage.get_case(&case.id).await.unwrap();
        assert!(loaded.access_url.is_none());
        assert!(loaded.host_port.is_none());
        assert!(loaded.container_id.is_none());
    }

    #[tokio::test]
    async fn test_fail_case_clears_runtime_and_sets_error() {
        let storage = test_storage().await;
        let case = Case::new(&descriptor("https://example.com/repo.git"));
        storage.create_case(&case).await.unwrap();
        storage
            .set_runtime(&case.id, Some("http://localhost:9001"), Some(9001), "c1")
            .await
            .unwrap();

        storage
            .fail_case(
                &case.id,
                CaseStage::Run,
                ErrorCode::ContainerExitNonzero,
                "exited with 137",
            )
            .await
            .unwrap();

        let loaded = storage.get_case(&case.id).await.unwrap();
        assert_eq!(loaded.status, CaseStatus::Failed);
        assert_eq!(loaded.stage, CaseStage::Run);
        assert_eq!(loaded.error_code, Some(ErrorCode::ContainerExitNonzero));
        assert!(loaded.host_port.is_none());
    }

    #[tokio::test]
    async fn test_reset_for_retry_clears_error_atomically() {
        let storage = test_storage().await;
        let case = Case::new(&descriptor("https://example.com/repo.git"));
        storage.create_case(&case).await.unwrap();
        storage
            .fail_case(
                &case.id,
                CaseStage::Clone,
                ErrorCode::GitCloneFailed,
                "remote hung up",
            )
            .await
            .unwrap();

        storage.reset_for_retry(&case.id).await.unwrap();

        let loaded = storage.get_case(&case.id).await.unwrap();
        assert_eq!(loaded.status, CaseStatus::Pending);
        assert_eq!(loaded.stage, CaseStage::System);
        assert!(loaded.error_code.is_none());
        assert!(loaded.error_message.is_none());
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let storage = test_storage().await;
        let first = Case::new(&descriptor("https://example.com/a.git"));
        let second = Case::new(&descriptor("https://example.com/b.git"));
        storage.create_case(&first).await.unwrap();
        storage.create_case(&second).await.unwrap();
        storage
            .update_status(&second.id, CaseStatus::Cloning, CaseStage::Clone)
            .await
            .unwrap();

        let pending = storage.list_by_status(CaseStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first.id);
    }

    #[tokio::test]
    async fn test_preflight_record_round_trip() {
        let storage = test_storage().await;
        let case = Case::new(&descriptor("https://example.com/repo.git"));
        storage.create_case(&case).await.unwrap();

        assert!(storage.get_preflight(&case.id).await.unwrap().is_none());

        let decision = serde_json::json!({
            "reason": "root_dockerfile",
            "non_unique_primary": false
        });
        storage.set_preflight(&case.id, &decision).await.unwrap();

        let loaded = storage.get_preflight(&case.id).await.unwrap().unwrap();
        assert_eq!(loaded["reason"], "root_dockerfile");
    }

    #[tokio::test]
    async fn test_derived_job_flags() {
        let storage = test_storage().await;
        let case = Case::new(&descriptor("https://example.com/repo.git"));
        storage.create_case(&case).await.unwrap();

        storage
            .set_analyze_status(&case.id, Some("generating"), false)
            .await
            .unwrap();
        storage
            .set_visual_status(&case.id, Some("ready"), true)
            .await
            .unwrap();

        let loaded = storage.get_case(&case.id).await.unwrap();
        assert_eq!(loaded.analyze_status.as_deref(), Some("generating"));
        assert!(!loaded.report_ready);
        assert!(loaded.visual_ready);
    }
}
