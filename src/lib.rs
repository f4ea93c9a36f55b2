//! Vertera Library
//!
//! Fleet control plane core: a controller hands work to agents running on
//! managed hosts.
//!
//! # Features
//!
//! - **PKI**: a managed (or bring-your-own) CA issues controller and agent
//!   identities; ECDSA P-384 keys, 128-bit random serials
//! - **Enrollment**: agents trade a short-lived HS256 token and a CSR for a
//!   signed client certificate
//! - **Dispatch**: per-host FIFO queues with best-effort live push to
//!   connected agents (at-least-once delivery)
//! - **Sessions**: register / watch / report over mutual TLS
//! - **HTTP API** under `/api/v1`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod controller;
pub mod controlplane;
pub mod enroll;
pub mod error;
pub mod packages;
pub mod pki;
pub mod session;

pub use error::{Error, Result};

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("tracing already initialised: {e}")))
}

/// Resolve on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
