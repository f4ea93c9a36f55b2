//! HTTP API, mounted under `/api/v1`.

mod enroll;
pub mod error;
mod tasks;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::controlplane::{DispatchManager, TaskRegistry};
use crate::pki::CertificateAuthority;

/// Versioned prefix of every route.
pub const API_PREFIX: &str = "/api/v1";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    /// Task table.
    pub registry: Arc<TaskRegistry>,
    /// Per-host queues.
    pub dispatch: Arc<DispatchManager>,
    /// Enrollment secret; `None` disables both enrollment endpoints.
    pub enroll_secret: Option<Arc<[u8]>>,
    /// CA that signs enrollment CSRs.
    pub signer: Option<Arc<CertificateAuthority>>,
    /// Lifetime of certificates signed for agents.
    pub cert_validity: Duration,
    /// TTL of tokens requested without one.
    pub default_token_ttl: Duration,
}

impl std::fmt::Debug for ApiState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiState")
            .field("tasks", &self.registry.len())
            .field("enrollment", &self.enroll_secret.is_some())
            .field("signer", &self.signer.is_some())
            .field("cert_validity", &self.cert_validity)
            .field("default_token_ttl", &self.default_token_ttl)
            .finish_non_exhaustive()
    }
}

/// Create the router
pub fn create_router(state: ApiState) -> Router {
    let v1 = Router::new()
        .route("/health", get(health_handler))
        .route("/agents/enroll/token", post(enroll::create_token))
        .route("/agents/enroll/csr", post(enroll::sign_csr))
        .route("/hosts/{host_id}/packages/install", post(tasks::install_packages))
        .route("/packages/info", get(tasks::package_info))
        .route("/tasks/{task_id}", get(tasks::get_task));

    #[allow(deprecated)]
    let timeout = TimeoutLayer::new(REQUEST_TIMEOUT);

    Router::new()
        .nest(API_PREFIX, v1)
        .fallback(not_found_handler)
        .layer(CatchPanicLayer::new())
        .layer(timeout)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found_handler(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "message": format!("No route for {uri}. Use a versioned path like {API_PREFIX}/..."),
            "supported": ["v1"],
        })),
    )
}
