//! HTTP API tests: enrollment and task endpoints driven through the router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use vertera::api::{ApiState, create_router};
use vertera::controlplane::{DispatchManager, TaskRegistry};
use vertera::enroll::{issue_token, verify_token};
use vertera::pki::{CertIdentity, CertificateAuthority, create_csr};

const SECRET: &[u8] = b"integration-secret";

struct Harness {
    router: Router,
    state: ApiState,
    ca: Arc<CertificateAuthority>,
    _dir: tempfile::TempDir,
}

fn harness(secret: Option<&[u8]>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(
        CertificateAuthority::ensure(dir.path(), "Test Root", Duration::from_secs(86_400)).unwrap(),
    );
    let state = ApiState {
        registry: Arc::new(TaskRegistry::new()),
        dispatch: Arc::new(DispatchManager::new(8)),
        enroll_secret: secret.map(Arc::<[u8]>::from),
        signer: Some(Arc::clone(&ca)),
        cert_validity: Duration::from_secs(3600),
        default_token_ttl: Duration::from_secs(900),
    };
    Harness {
        router: create_router(state.clone()),
        state,
        ca,
        _dir: dir,
    }
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Option<String>, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let location = response
        .headers()
        .get(header::LOCATION)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, location, json)
}

// ─────────────────────────────────────────────────────────────────────────────
// Enrollment
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_token_then_csr_yields_certificate_chained_to_ca() {
    // GIVEN: enrollment enabled
    let h = harness(Some(SECRET));

    // WHEN: a token is requested with a 2 minute ttl
    let (status, _, body) = call(
        &h.router,
        "POST",
        "/api/v1/agents/enroll/token",
        Some(json!({"ttl": "2m"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    let claims = verify_token(SECRET, &token).unwrap();
    assert_eq!(claims.exp - claims.iat, 120);
    assert!(body["expires_at"].as_str().unwrap().ends_with('Z'));

    // AND: a CSR for agent-test is submitted with it
    let csr = create_csr("agent-test", &["host-a".to_string()]).unwrap();
    let (status, _, body) = call(
        &h.router,
        "POST",
        "/api/v1/agents/enroll/csr",
        Some(json!({"token": token, "csr_pem": csr.csr_pem})),
    )
    .await;

    // THEN: a client certificate signed by our CA comes back
    assert_eq!(status, StatusCode::OK);
    let cert_pem = body["cert_pem"].as_str().unwrap();
    let (_, leaf_pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes()).unwrap();
    let (_, ca_pem) = x509_parser::pem::parse_x509_pem(h.ca.cert_pem().as_bytes()).unwrap();
    let leaf = leaf_pem.parse_x509().unwrap();
    let ca = ca_pem.parse_x509().unwrap();
    leaf.verify_signature(Some(ca.public_key())).unwrap();

    let identity = CertIdentity::from_der(&leaf_pem.contents).unwrap();
    assert_eq!(identity.common_name.as_deref(), Some("agent-test"));
    assert!(identity.client_auth);
    assert!(!identity.server_auth);
    assert_eq!(identity.san_dns_names, vec!["host-a".to_string()]);
}

#[tokio::test]
async fn test_token_with_empty_body_uses_default_ttl() {
    let h = harness(Some(SECRET));

    let (status, _, body) = call(&h.router, "POST", "/api/v1/agents/enroll/token", None).await;

    assert_eq!(status, StatusCode::OK);
    let claims = verify_token(SECRET, body["token"].as_str().unwrap()).unwrap();
    assert_eq!(claims.exp - claims.iat, 900);
}

#[tokio::test]
async fn test_token_rejects_bad_ttl() {
    let h = harness(Some(SECRET));

    for ttl in ["soon", "0s"] {
        let (status, _, body) = call(
            &h.router,
            "POST",
            "/api/v1/agents/enroll/token",
            Some(json!({"ttl": ttl})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "ttl {ttl}");
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn test_enrollment_disabled_without_secret() {
    // GIVEN: no secret configured
    let h = harness(None);
    let csr = create_csr("agent-test", &[]).unwrap();

    // THEN: both endpoints refuse with 403
    let (status, _, _) = call(&h.router, "POST", "/api/v1/agents/enroll/token", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = call(
        &h.router,
        "POST",
        "/api/v1/agents/enroll/csr",
        Some(json!({"token": "x", "csr_pem": csr.csr_pem})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_csr_with_foreign_token_is_unauthorized() {
    let h = harness(Some(SECRET));
    let foreign = issue_token(b"some-other-secret", Duration::from_secs(60)).unwrap();
    let csr = create_csr("agent-test", &[]).unwrap();

    let (status, _, body) = call(
        &h.router,
        "POST",
        "/api/v1/agents/enroll/csr",
        Some(json!({"token": foreign.token, "csr_pem": csr.csr_pem})),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_csr_request_validation() {
    let h = harness(Some(SECRET));
    let token = issue_token(SECRET, Duration::from_secs(60)).unwrap().token;

    // Missing fields
    let (status, _, _) = call(
        &h.router,
        "POST",
        "/api/v1/agents/enroll/csr",
        Some(json!({"token": token, "csr_pem": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Not a CSR
    let (status, _, _) = call(
        &h.router,
        "POST",
        "/api/v1/agents/enroll/csr",
        Some(json!({"token": token, "csr_pem": "garbage"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_install_queues_task_and_returns_location() {
    // GIVEN
    let h = harness(Some(SECRET));

    // WHEN: an install is requested for host-123
    let (status, location, body) = call(
        &h.router,
        "POST",
        "/api/v1/hosts/host-123/packages/install",
        Some(json!({"packages": ["ovs"], "version": "3.6.0", "os_version": "el9"})),
    )
    .await;

    // THEN: 202 with a Location for the new task
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(location.as_deref(), Some(format!("/api/v1/tasks/{id}").as_str()));
    assert_eq!(body["status"], "queued");
    assert_eq!(body["hostId"], "host-123");
    assert_eq!(h.state.dispatch.pending_len("host-123"), 1);

    // AND: it can be fetched
    let (status, _, fetched) = call(&h.router, "GET", &format!("/api/v1/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id.as_str());
    assert_eq!(fetched["status"], "queued");
}

#[tokio::test]
async fn test_install_requires_packages() {
    let h = harness(None);

    let (status, _, body) = call(
        &h.router,
        "POST",
        "/api/v1/hosts/host-123/packages/install",
        Some(json!({"packages": []})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");
    assert_eq!(h.state.registry.len(), 0);
    assert_eq!(h.state.dispatch.pending_len("host-123"), 0);
}

#[tokio::test]
async fn test_install_rejects_unknown_package() {
    let h = harness(None);

    let (status, _, _) = call(
        &h.router,
        "POST",
        "/api/v1/hosts/host-123/packages/install",
        Some(json!({"packages": ["nginx"]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let h = harness(None);

    let (status, _, body) = call(&h.router, "GET", "/api/v1/tasks/nope", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_package_info_lists_artifacts() {
    let h = harness(None);

    let (status, _, body) = call(
        &h.router,
        "GET",
        "/api/v1/packages/info?type=cloud-hypervisor&version=47.0&os_version=el9",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["package_type"], "cloud-hypervisor");
    assert_eq!(body["packages"].as_array().unwrap().len(), 1);

    let (status, _, _) = call(&h.router, "GET", "/api/v1/packages/info", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_fallback() {
    let h = harness(None);

    let (status, _, body) = call(&h.router, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, body) = call(&h.router, "GET", "/tasks/abc", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}
