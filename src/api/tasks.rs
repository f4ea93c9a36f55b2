//! Task endpoints.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use vertera_proto::{InstallPackagesParams, PackageKind, TaskSpec};

use super::{API_PREFIX, ApiError, ApiState};
use crate::controlplane::Task;
use crate::packages::resolve_artifacts;

/// POST /hosts/{host_id}/packages/install
pub(super) async fn install_packages(
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let host_id = host_id.trim();
    if host_id.is_empty() {
        return Err(ApiError::bad_request("hostId is required"));
    }

    let params: InstallPackagesParams = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?;
    if params.packages.is_empty() {
        return Err(ApiError::bad_request("at least one package must be specified"));
    }

    let task = state
        .registry
        .create(host_id, TaskSpec::InstallPackages(params));
    state.dispatch.enqueue(host_id, task.envelope());
    info!(host_id, task_id = %task.id, "Install task queued");

    let location = format!("{API_PREFIX}/tasks/{}", task.id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(task),
    ))
}

/// GET /tasks/{task_id}
pub(super) async fn get_task(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.registry.get(&task_id)?))
}

#[derive(Debug, Deserialize)]
pub(super) struct PackageInfoQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    version: Option<String>,
    os_version: Option<String>,
}

/// GET /packages/info?type=ovs&version=3.6.0&os_version=el9
pub(super) async fn package_info(
    Query(query): Query<PackageInfoQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = query
        .kind
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::bad_request("type parameter is required"))?;
    let kind: PackageKind = serde_json::from_value(json!(raw))
        .map_err(|_| ApiError::bad_request(format!("unsupported package type: {raw}")))?;

    let version = query.version.filter(|v| !v.is_empty());
    let os_version = query.os_version.filter(|v| !v.is_empty());
    let artifacts = resolve_artifacts(kind, version.as_deref(), os_version.as_deref());

    Ok(Json(json!({
        "package_type": kind,
        "version": version,
        "os_version": os_version,
        "packages": artifacts,
    })))
}
