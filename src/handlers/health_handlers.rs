//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness: metadata DB, managed storage, upload directory

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Runs every check and reports each one. HTTP 200 when all pass, 503
/// otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", check_sqlite(&state.store.db).await);
    checks.insert("storage", check_writable(&state.store.storage_root).await);
    checks.insert("uploads", check_directory(state.binder.upload_dir()).await);

    let overall_ok = checks.values().all(|check| check.ok);
    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_sqlite(db: &SqlitePool) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(db).await {
        Ok(1) => CheckStatus::pass(),
        Ok(v) => CheckStatus::fail(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::fail(format!("error: {}", e)),
    }
}

/// Write, read back and delete a probe file under `dir`.
async fn check_writable(dir: &Path) -> CheckStatus {
    let probe = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&probe, b"readyz").await {
        return CheckStatus::fail(format!("could not write probe file: {}", e));
    }

    let status = match fs::read(&probe).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::pass(),
        Ok(_) => CheckStatus::fail("probe file content mismatch".into()),
        Err(e) => CheckStatus::fail(format!("could not read probe file: {}", e)),
    };
    if let Err(e) = fs::remove_file(&probe).await {
        tracing::debug!("could not remove readiness probe {}: {}", probe.display(), e);
    }
    status
}

/// The upload directory is only read, so existence is enough.
async fn check_directory(dir: &Path) -> CheckStatus {
    match fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => CheckStatus::pass(),
        Ok(_) => CheckStatus::fail(format!("{} is not a directory", dir.display())),
        Err(e) => CheckStatus::fail(format!("{}: {}", dir.display(), e)),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize, Debug)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn pass() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn fail(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writable_check_cleans_up_probe() {
        let dir = tempdir().unwrap();
        assert!(check_writable(dir.path()).await.ok);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn directory_check_fails_for_missing_dir() {
        let dir = tempdir().unwrap();
        let check = check_directory(&dir.path().join("missing")).await;
        assert!(!check.ok);
        assert!(check.error.is_some());
    }
}
