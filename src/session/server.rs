//! Controller side of the mutual-TLS session transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vertera_proto::{AgentFrame, ControllerFrame};

use super::framing::pump;
use super::service::AgentService;
use super::{SESSION_BUFFER, SessionError};
use crate::pki::identity::CertIdentity;

/// Time allowed for a TLS handshake before the connection is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts agent connections. A client certificate signed by the CA is
/// required before any frame is read.
pub struct SessionServer {
    service: AgentService,
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for SessionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServer")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl SessionServer {
    /// Server over `service`, terminating TLS with `tls`.
    pub fn new(service: AgentService, tls: ServerConfig) -> Self {
        Self {
            service,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
        }
    }

    /// Accept connections until `shutdown` fires. Open sessions are
    /// cancelled with it.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Agent session listener started");
        }

        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let service = self.service.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(acceptor, service, stream, peer, cancel).await {
                    warn!(%peer, error = %e, "Agent session ended with error");
                }
            });
        }

        info!("Agent session listener stopped");
        Ok(())
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    service: AgentService,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
        .await
        .map_err(|_| SessionError::Transport("TLS handshake timed out".into()))?
        .map_err(|e| SessionError::Transport(format!("TLS handshake failed: {e}")))?;

    let agent = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|leaf| CertIdentity::from_der(leaf.as_ref()).ok());
    let (agent, org) = peer_labels(agent);
    info!(%peer, agent = %agent, org = %org, "Agent connected");

    let (in_tx, in_rx) = mpsc::channel::<AgentFrame>(SESSION_BUFFER);
    let (out_tx, out_rx) = mpsc::channel::<ControllerFrame>(SESSION_BUFFER);

    let session = {
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run_session(in_rx, out_tx, cancel).await })
    };

    let pumped = pump(tls, in_tx, out_rx, cancel.clone()).await;
    cancel.cancel();
    match session.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%peer, error = %e, "Session loop ended"),
        Err(e) => warn!(%peer, error = %e, "Session loop panicked"),
    }

    info!(%peer, agent = %agent, "Agent disconnected");
    pumped
}

/// Log labels for a verified peer: its display name and organisation.
fn peer_labels(identity: Option<CertIdentity>) -> (String, String) {
    match identity {
        Some(id) => (
            id.display_name,
            id.organization.unwrap_or_else(|| "-".to_string()),
        ),
        None => ("<unknown>".to_string(), "-".to_string()),
    }
}
