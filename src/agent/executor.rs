//! Task execution seam.
//!
//! The runtime hands each task to a [`TaskExecutor`]. The shipped
//! [`PlanExecutor`] resolves which artifacts an `INSTALL_PACKAGES` task
//! needs and reports that plan as progress; it does not download or
//! install anything.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};
use vertera_proto::{InstallPackagesParams, ReportedStatus, TaskEnvelope, TaskResult, TaskSpec};

use crate::packages::resolve_artifacts;
use crate::session::Reporter;

/// Why a task did not succeed. The message becomes the task's error text.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The task asked for something this executor cannot do.
    #[error("unsupported task: {0}")]
    Unsupported(String),

    /// Execution started and failed.
    #[error("{0}")]
    Failed(String),
}

/// Sends `running` progress reports for one task.
#[derive(Debug, Clone)]
pub struct Progress {
    reporter: Reporter,
    task_id: String,
}

impl Progress {
    /// Progress sink for `task_id`.
    pub fn new(reporter: Reporter, task_id: impl Into<String>) -> Self {
        Self {
            reporter,
            task_id: task_id.into(),
        }
    }

    /// Replace the task's log snippet with `line`.
    pub async fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(task_id = %self.task_id, line = %line, "Task progress");
        let report = TaskResult::new(&self.task_id, ReportedStatus::Running).with_logs(line);
        if let Err(e) = self.reporter.report(report).await {
            debug!(task_id = %self.task_id, error = %e, "Progress report dropped");
        }
    }
}

/// Runs one task to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task`, reporting progress through `progress`.
    async fn execute(&self, task: &TaskEnvelope, progress: &Progress) -> Result<(), ExecutorError>;
}

/// Resolves and reports the install plan without touching the host.
#[derive(Debug, Clone)]
pub struct PlanExecutor {
    cache_dir: PathBuf,
}

impl PlanExecutor {
    /// Executor that would place downloads under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    async fn install(
        &self,
        task_id: &str,
        params: &InstallPackagesParams,
        progress: &Progress,
    ) -> Result<(), ExecutorError> {
        if params.packages.is_empty() {
            return Err(ExecutorError::Unsupported("no packages requested".into()));
        }

        for kind in &params.packages {
            progress.log(format!("resolving package info: {kind}")).await;
            let artifacts =
                resolve_artifacts(*kind, params.version.as_deref(), params.os_version.as_deref());

            for artifact in artifacts.iter().filter(|a| a.required) {
                let target = self.cache_dir.join(&artifact.name);
                info!(
                    task_id,
                    package = %kind,
                    url = %artifact.url,
                    target = %target.display(),
                    "Planned download"
                );
                progress.log(format!("planned: {}", artifact.name)).await;
            }
            progress.log(format!("planned install: {kind}")).await;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for PlanExecutor {
    async fn execute(&self, task: &TaskEnvelope, progress: &Progress) -> Result<(), ExecutorError> {
        match &task.spec {
            TaskSpec::InstallPackages(params) => self.install(&task.id, params, progress).await,
        }
    }
}
