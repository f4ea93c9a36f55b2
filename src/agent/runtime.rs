//! Agent session loop: connect, register, watch, execute, report.
//!
//! Frames are read by one loop and tasks run on a separate worker, so
//! acknowledgements keep flowing while a long task executes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vertera_proto::{RegisterRequest, ReportedStatus, TaskEnvelope, TaskResult};

use super::executor::{Progress, TaskExecutor};
use crate::pki::tls::ClientTls;
use crate::session::{Reporter, SessionClient, SessionError};

const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Drives one agent against the controller.
pub struct AgentRuntime {
    register: RegisterRequest,
    executor: Arc<dyn TaskExecutor>,
    completed: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("register", &self.register)
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    /// Runtime for `agent_id` on `hostname`.
    pub fn new(
        agent_id: impl Into<String>,
        hostname: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            register: RegisterRequest {
                agent_id: agent_id.into(),
                hostname: hostname.into(),
            },
            executor,
            completed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a final report for `task_id` reached the session.
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed.lock().contains(task_id)
    }

    /// Connect to `addr`, reconnecting with backoff, until `shutdown` fires.
    pub async fn run(&self, addr: &str, tls: &ClientTls, shutdown: CancellationToken) {
        loop {
            let connect = (|| SessionClient::connect(addr, tls))
                .retry(reconnect_backoff())
                .notify(|e: &SessionError, delay: Duration| {
                    warn!(addr, error = %e, retry_in_ms = delay.as_millis(), "Controller unreachable");
                });

            let client = tokio::select! {
                () = shutdown.cancelled() => return,
                client = connect => match client {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(addr, error = %e, "Giving up on controller");
                        return;
                    }
                },
            };

            match self.run_session(client, &shutdown).await {
                Ok(()) => info!("Controller session closed"),
                Err(e) => warn!(error = %e, "Controller session lost"),
            }
            if shutdown.is_cancelled() {
                return;
            }
        }
    }

    /// Register, watch and execute tasks on one session until it ends or
    /// `shutdown` fires. A shutdown returns `Ok`.
    pub async fn run_session(
        &self,
        mut client: SessionClient,
        shutdown: &CancellationToken,
    ) -> Result<(), SessionError> {
        let assigned = client.register(self.register.clone()).await?;
        client.watch_tasks(self.register.clone()).await?;
        info!(assigned_id = %assigned.assigned_id, "Watching for tasks");

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(work_loop(
            Arc::clone(&self.executor),
            client.reporter(),
            work_rx,
            Arc::clone(&self.completed),
        ));

        let mut queued = HashSet::new();
        let outcome = loop {
            let task = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                task = client.next_task() => match task {
                    Ok(task) => task,
                    Err(e) => break Err(e),
                },
            };

            if self.is_completed(&task.id) || !queued.insert(task.id.clone()) {
                debug!(task_id = %task.id, "Duplicate delivery skipped");
                continue;
            }
            info!(task_id = %task.id, task_type = task.spec.type_name(), "Received task");
            if work_tx.send(task).is_err() {
                break Err(SessionError::Closed);
            }
        };

        drop(work_tx);
        worker.abort();
        if let Err(e) = client.close().await {
            debug!(error = %e, "Session close");
        }
        outcome
    }
}

fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(MIN_RECONNECT_DELAY)
        .with_max_delay(MAX_RECONNECT_DELAY)
        .with_jitter()
        .without_max_times()
}

async fn work_loop(
    executor: Arc<dyn TaskExecutor>,
    reporter: Reporter,
    mut tasks: mpsc::UnboundedReceiver<TaskEnvelope>,
    completed: Arc<Mutex<HashSet<String>>>,
) {
    while let Some(task) = tasks.recv().await {
        let id = task.id.clone();
        if reporter
            .report(TaskResult::new(&id, ReportedStatus::Running))
            .await
            .is_err()
        {
            return;
        }

        let progress = Progress::new(reporter.clone(), &id);
        let result = match executor.execute(&task, &progress).await {
            Ok(()) => {
                info!(task_id = %id, "Task succeeded");
                TaskResult::new(&id, ReportedStatus::Succeeded)
            }
            Err(e) => {
                warn!(task_id = %id, error = %e, "Task failed");
                TaskResult::new(&id, ReportedStatus::Failed).with_error(e.to_string())
            }
        };

        if reporter.report(result).await.is_err() {
            return;
        }
        completed.lock().insert(id);
    }
}
