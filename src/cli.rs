//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Vertera fleet control plane - controller, agent and PKI tooling
#[derive(Parser, Debug)]
#[command(name = "vertera")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VERTERA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VERTERA_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VERTERA_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// What to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller: HTTP API plus the agent session listener
    Controller,

    /// Run the host agent
    Agent,

    /// PKI management commands
    #[command(subcommand)]
    Pki(PkiCommand),

    /// Enrollment token commands
    #[command(subcommand)]
    Token(TokenCommand),
}

/// PKI subcommands
#[derive(Subcommand, Debug)]
pub enum PkiCommand {
    /// Create the CA and the controller identity in the PKI directory
    Init,
}

/// Token subcommands
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Print a new enrollment token
    Issue {
        /// Token lifetime, e.g. 15m or 2h (defaults to `default_token_ttl`)
        #[arg(long)]
        ttl: Option<String>,
    },
}
