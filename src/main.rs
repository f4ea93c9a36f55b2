//! Vertera - fleet control plane
//!
//! One binary: controller, host agent, and PKI / token helpers.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vertera::{
    agent,
    cli::{Cli, Command, PkiCommand, TokenCommand},
    config::{Config, parse_duration},
    controller,
    enroll::issue_token,
    setup_tracing, shutdown_signal,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Controller => run_service(&config, ServiceKind::Controller).await,
        Command::Agent => run_service(&config, ServiceKind::Agent).await,
        Command::Pki(PkiCommand::Init) => run_pki_init(&config),
        Command::Token(TokenCommand::Issue { ttl }) => run_token_issue(&config, ttl.as_deref()),
    }
}

#[derive(Clone, Copy)]
enum ServiceKind {
    Controller,
    Agent,
}

/// Run a long-lived process until Ctrl-C / SIGTERM
async fn run_service(config: &Config, kind: ServiceKind) -> ExitCode {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let result = match kind {
        ServiceKind::Controller => {
            info!(http = %config.http_addr, sessions = %config.grpc_addr, "Starting controller");
            controller::run(config, shutdown).await
        }
        ServiceKind::Agent => {
            info!(controller = %config.controller_addr, "Starting agent");
            agent::run(config, shutdown).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Create the CA and controller identity, then print where they live
fn run_pki_init(config: &Config) -> ExitCode {
    match controller::prepare_pki(config) {
        Ok(pki) => {
            println!("CA certificate:     {}", pki.ca_cert.display());
            println!("Server certificate: {}", pki.server_cert.display());
            println!("Server key:         {}", pki.server_key.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("PKI init failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Print an enrollment token for `token issue`
fn run_token_issue(config: &Config, ttl: Option<&str>) -> ExitCode {
    let Some(secret) = config.enroll_secret() else {
        error!("VERTERA_ENROLL_JWT_SECRET must be set to issue tokens");
        return ExitCode::FAILURE;
    };

    let ttl = match ttl {
        Some(raw) => match parse_duration(raw) {
            Ok(d) if !d.is_zero() => d,
            Ok(_) => {
                error!("ttl must be positive");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!("Invalid ttl: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => config.default_token_ttl,
    };

    match issue_token(secret, ttl) {
        Ok(issued) => {
            println!("{}", issued.token);
            eprintln!("expires at {}", issued.expires_at.to_rfc3339());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Token issuance failed: {e}");
            ExitCode::FAILURE
        }
    }
}
