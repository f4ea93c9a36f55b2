//! Host agent: obtains a client identity, keeps a session to the controller
//! open and executes the tasks it receives.

pub mod executor;
pub mod identity;
pub mod runtime;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub use executor::{ExecutorError, PlanExecutor, Progress, TaskExecutor};
pub use identity::{AgentIdentity, IdentitySource, resolve_identity};
pub use runtime::AgentRuntime;

use crate::Result;
use crate::config::Config;
use crate::pki::tls::client_tls_config;

/// Resolve identity and run the agent until `shutdown` fires.
pub async fn run(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let hostname = identity::resolve_hostname(config);
    let agent_id = identity::resolve_agent_id(config, &hostname);
    info!(agent_id = %agent_id, hostname = %hostname, controller = %config.controller_addr, "Starting agent");

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let identity = resolve_identity(config, &http, &agent_id, &hostname).await?;
    info!(source = ?identity.source, cert = %identity.cert.display(), "Agent identity ready");

    let tls = client_tls_config(
        &identity.ca_cert,
        &identity.cert,
        &identity.key,
        &config.controller_server_name,
    )?;

    let runtime = AgentRuntime::new(
        agent_id,
        hostname,
        Arc::new(PlanExecutor::new(config.cache_dir.clone())),
    );
    runtime.run(&config.controller_addr, &tls, shutdown).await;
    info!("Agent stopped");
    Ok(())
}
