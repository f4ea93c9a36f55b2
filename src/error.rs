//! Error types for Vertera

use std::io;

use thiserror::Error;

use crate::controlplane::tasks::RegistryError;
use crate::enroll::token::TokenError;
use crate::pki::PkiError;
use crate::pki::tls::TlsError;
use crate::session::SessionError;

/// Result type alias for Vertera
pub type Result<T> = std::result::Result<T, Error>;

/// Vertera errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate authority or issuance failure
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Enrollment token failure
    #[error(transparent)]
    Token(#[from] TokenError),

    /// TLS material could not be loaded
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Task registry rejected a mutation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Agent session failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Enrollment request to the controller failed
    #[error("Enrollment failed: {0}")]
    Enrollment(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
