//! Wire types for the Vertera agent/controller session.
//!
//! Both sides exchange one JSON document per frame. The agent sends
//! [`AgentFrame`]s, the controller answers with [`ControllerFrame`]s.
//!
//! ```text
//! agent                         controller
//!   register            ─────▶
//!                       ◀─────  registered
//!   watch_tasks         ─────▶
//!                       ◀─────  task (drained backlog, then live pushes)
//!   report_task_result  ─────▶
//!                       ◀─────  ack
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// Package families an install task can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageKind {
    /// Open vSwitch.
    #[serde(rename = "ovs")]
    Ovs,
    /// Cloud Hypervisor daemon.
    #[serde(rename = "cloud-hypervisor")]
    CloudHypervisor,
}

impl PackageKind {
    /// Name used on the wire and in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ovs => "ovs",
            Self::CloudHypervisor => "cloud-hypervisor",
        }
    }
}

impl std::fmt::Display for PackageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of an `INSTALL_PACKAGES` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPackagesParams {
    /// Package families to install, in order.
    pub packages: Vec<PackageKind>,
    /// Requested upstream version (e.g. `3.6.0`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Target OS release (e.g. `el9`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

/// Typed task payload, keyed by the task type tag.
///
/// Serialises as `{"type": "INSTALL_PACKAGES", "params": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum TaskSpec {
    /// Install one or more host packages.
    #[serde(rename = "INSTALL_PACKAGES")]
    InstallPackages(InstallPackagesParams),
}

impl TaskSpec {
    /// The type tag as it appears on the wire.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::InstallPackages(_) => "INSTALL_PACKAGES",
        }
    }
}

/// A unit of work pushed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Task identifier assigned by the controller.
    pub id: String,
    /// Host the task belongs to.
    pub host_id: String,
    /// Type tag and parameters.
    #[serde(flatten)]
    pub spec: TaskSpec,
}

/// Identity an agent announces when it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Configured agent identifier; may be empty.
    #[serde(default)]
    pub agent_id: String,
    /// Hostname of the managed host.
    #[serde(default)]
    pub hostname: String,
}

impl RegisterRequest {
    /// The host key tasks are queued under: the agent id, or the hostname
    /// when no agent id was given.
    #[must_use]
    pub fn host_id(&self) -> &str {
        if self.agent_id.is_empty() {
            &self.hostname
        } else {
            &self.agent_id
        }
    }
}

/// Controller answer to a [`RegisterRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Identifier the controller will use for this agent.
    pub assigned_id: String,
}

/// Status values an agent may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    /// Work started or is making progress.
    Running,
    /// Work completed.
    Succeeded,
    /// Work failed.
    Failed,
}

impl ReportedStatus {
    /// Wire spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse the wire spelling; unknown values yield `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Progress or outcome report for a task.
///
/// `status` stays a raw string so that a newer agent reporting a status this
/// controller does not know is logged instead of breaking the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task identifier.
    pub id: String,
    /// One of `running`, `succeeded`, `failed`.
    pub status: String,
    /// Latest log snippet, replaces the stored one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
    /// Failure message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TaskResult {
    /// Build a report with the given status and no logs.
    #[must_use]
    pub fn new(id: impl Into<String>, status: ReportedStatus) -> Self {
        Self {
            id: id.into(),
            status: status.as_str().to_string(),
            logs: String::new(),
            error: String::new(),
        }
    }

    /// Attach a log snippet.
    #[must_use]
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    /// Attach a failure message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// Parsed status, `None` when unrecognised.
    #[must_use]
    pub fn reported_status(&self) -> Option<ReportedStatus> {
        ReportedStatus::parse(&self.status)
    }
}

/// Acknowledgement of a [`TaskResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAck {
    /// Task identifier that was reported.
    pub id: String,
}

/// Frames sent by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Announce identity.
    Register(RegisterRequest),
    /// Start the task stream for the given identity.
    WatchTasks(RegisterRequest),
    /// Report task progress or outcome.
    ReportTaskResult(TaskResult),
}

/// Frames sent by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ControllerFrame {
    /// Answer to [`AgentFrame::Register`].
    Registered(RegisterResponse),
    /// A task for the watching agent.
    Task(TaskEnvelope),
    /// Answer to [`AgentFrame::ReportTaskResult`].
    Ack(TaskAck),
    /// Protocol-level complaint; the session stays open.
    Error {
        /// Human-readable description.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_prefers_agent_id() {
        let req = RegisterRequest {
            agent_id: "agent-7".into(),
            hostname: "node7.lab".into(),
        };
        assert_eq!(req.host_id(), "agent-7");
    }

    #[test]
    fn host_id_falls_back_to_hostname() {
        let req = RegisterRequest {
            agent_id: String::new(),
            hostname: "node7.lab".into(),
        };
        assert_eq!(req.host_id(), "node7.lab");
    }

    #[test]
    fn task_envelope_uses_type_and_params_keys() {
        // GIVEN: an install task
        let env = TaskEnvelope {
            id: "t1".into(),
            host_id: "host-123".into(),
            spec: TaskSpec::InstallPackages(InstallPackagesParams {
                packages: vec![PackageKind::Ovs],
                version: Some("3.6.0".into()),
                os_version: None,
            }),
        };
        // WHEN: serialised
        let v = serde_json::to_value(&env).unwrap();
        // THEN: flat envelope with the type tag next to the id
        assert_eq!(v["hostId"], "host-123");
        assert_eq!(v["type"], "INSTALL_PACKAGES");
        assert_eq!(v["params"]["packages"][0], "ovs");
        assert!(v["params"].get("os_version").is_none());
    }

    #[test]
    fn task_envelope_parses_back() {
        let raw = r#"{"id":"t1","hostId":"h","type":"INSTALL_PACKAGES","params":{"packages":["cloud-hypervisor"]}}"#;
        let env: TaskEnvelope = serde_json::from_str(raw).unwrap();
        let TaskSpec::InstallPackages(p) = env.spec;
        assert_eq!(p.packages, vec![PackageKind::CloudHypervisor]);
        assert!(p.version.is_none());
    }

    #[test]
    fn unknown_package_kind_is_rejected() {
        let raw = r#"{"packages":["nginx"]}"#;
        assert!(serde_json::from_str::<InstallPackagesParams>(raw).is_err());
    }

    #[test]
    fn unknown_status_parses_to_none() {
        let r = TaskResult {
            id: "t".into(),
            status: "paused".into(),
            logs: String::new(),
            error: String::new(),
        };
        assert_eq!(r.reported_status(), None);
        assert_eq!(
            TaskResult::new("t", ReportedStatus::Failed).reported_status(),
            Some(ReportedStatus::Failed)
        );
    }

    #[test]
    fn agent_frame_is_kind_tagged() {
        let frame = AgentFrame::ReportTaskResult(
            TaskResult::new("t9", ReportedStatus::Running).with_logs("downloading: ovs"),
        );
        let line = serde_json::to_string(&frame).unwrap();
        assert!(line.contains(r#""kind":"report_task_result""#));
        let back: AgentFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(back, frame);
    }
}
