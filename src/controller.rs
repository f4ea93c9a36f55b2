//! Controller process: PKI bootstrap, HTTP API and the agent session
//! listener, sharing one task registry and dispatcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{ApiState, create_router};
use crate::config::Config;
use crate::controlplane::{DispatchManager, TaskRegistry};
use crate::pki::tls::{DEFAULT_SERVER_NAME, server_tls_config};
use crate::pki::{
    CertificateAuthority, DEFAULT_CA_COMMON_NAME, IssueRequest, Role, issue_certificate,
};
use crate::session::{AgentService, SessionServer};
use crate::{Error, Result};

/// File stem of the controller's own identity.
pub const CONTROLLER_IDENTITY: &str = "controller";

/// TLS material the controller serves with.
#[derive(Debug, Clone)]
pub struct ControllerPki {
    /// Trust anchor for agent certificates.
    pub ca_cert: PathBuf,
    /// Controller certificate.
    pub server_cert: PathBuf,
    /// Controller key.
    pub server_key: PathBuf,
    /// CA used to sign enrollment CSRs.
    pub signer: Arc<CertificateAuthority>,
}

/// Resolve the CA and the controller identity, creating what is missing.
///
/// Signing uses the configured CA when both `ca_cert` and `ca_key` are
/// set, the managed CA in `pki_dir` otherwise. A complete BYO server
/// identity is used as is; else `controller.pem` is issued by the signer.
pub fn prepare_pki(config: &Config) -> Result<ControllerPki> {
    let signer = match config.byo_ca() {
        Some((cert, key)) => {
            info!(ca = %cert.display(), "Using provided CA for signing");
            CertificateAuthority::load(cert, key)?
        }
        None => CertificateAuthority::ensure(
            &config.pki_dir,
            DEFAULT_CA_COMMON_NAME,
            config.ca_validity,
        )?,
    };
    let signer = Arc::new(signer);

    if let Some(byo) = config.byo_server_identity() {
        info!(cert = %byo.cert.display(), "Using provided server identity");
        return Ok(ControllerPki {
            ca_cert: byo.ca_cert,
            server_cert: byo.cert,
            server_key: byo.key,
            signer,
        });
    }

    let hostnames = vec![
        DEFAULT_SERVER_NAME.to_string(),
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ];
    let issued = issue_certificate(
        &config.pki_dir,
        &signer,
        &IssueRequest {
            name: CONTROLLER_IDENTITY,
            common_name: DEFAULT_SERVER_NAME,
            role: Role::Server,
            validity: config.cert_validity,
            hostnames: &hostnames,
        },
    )?;

    Ok(ControllerPki {
        ca_cert: signer.cert_path().to_path_buf(),
        server_cert: issued.cert_path,
        server_key: issued.key_path,
        signer,
    })
}

/// A controller with both listeners bound.
#[derive(Debug)]
pub struct Controller {
    http: TcpListener,
    sessions: TcpListener,
    api: ApiState,
    session_server: SessionServer,
}

impl Controller {
    /// Prepare PKI and bind the HTTP and session listeners.
    pub async fn bind(config: &Config) -> Result<Self> {
        let pki = prepare_pki(config)?;

        let registry = Arc::new(TaskRegistry::new());
        let dispatch = Arc::new(DispatchManager::new(config.subscriber_capacity));

        let enroll_secret = config.enroll_secret().map(Arc::<[u8]>::from);
        if enroll_secret.is_none() {
            warn!("VERTERA_ENROLL_JWT_SECRET not set; enrollment endpoints are disabled");
        }

        let api = ApiState {
            registry: Arc::clone(&registry),
            dispatch: Arc::clone(&dispatch),
            enroll_secret,
            signer: Some(Arc::clone(&pki.signer)),
            cert_validity: config.cert_validity,
            default_token_ttl: config.default_token_ttl,
        };

        let tls = server_tls_config(&pki.ca_cert, &pki.server_cert, &pki.server_key)?;
        let session_server = SessionServer::new(AgentService::new(registry, dispatch), tls);

        let http = TcpListener::bind(&config.http_addr)
            .await
            .map_err(|e| Error::Config(format!("bind HTTP {}: {e}", config.http_addr)))?;
        let sessions = TcpListener::bind(&config.grpc_addr)
            .await
            .map_err(|e| Error::Config(format!("bind sessions {}: {e}", config.grpc_addr)))?;

        Ok(Self {
            http,
            sessions,
            api,
            session_server,
        })
    }

    /// Bound HTTP address.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    /// Bound session address.
    pub fn session_addr(&self) -> Result<SocketAddr> {
        Ok(self.sessions.local_addr()?)
    }

    /// Shared state behind the HTTP API.
    pub fn state(&self) -> &ApiState {
        &self.api
    }

    /// Serve until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            http,
            sessions,
            api,
            session_server,
        } = self;

        if let Ok(addr) = http.local_addr() {
            info!(%addr, "HTTP API listening");
        }

        let session_shutdown = shutdown.clone();
        let session_task =
            tokio::spawn(async move { session_server.serve(sessions, session_shutdown).await });

        let served = axum::serve(http, create_router(api))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        shutdown.cancel();
        match session_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Session listener failed"),
            Err(e) => warn!(error = %e, "Session listener panicked"),
        }
        info!("Controller stopped");
        served
    }
}

/// Bind and serve with `config` until `shutdown` fires.
pub async fn run(config: &Config, shutdown: CancellationToken) -> Result<()> {
    Controller::bind(config).await?.serve(shutdown).await
}
