//! Controller-side session logic, independent of the transport.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vertera_proto::{
    AgentFrame, ControllerFrame, RegisterRequest, RegisterResponse, ReportedStatus, TaskAck,
    TaskResult,
};

use super::SessionError;
use crate::controlplane::{DispatchManager, TaskRegistry};

/// Message recorded when an agent reports a failure without a reason.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Handles register / watch / report for every connected agent.
#[derive(Debug, Clone)]
pub struct AgentService {
    registry: Arc<TaskRegistry>,
    dispatch: Arc<DispatchManager>,
}

impl AgentService {
    /// Service over the shared registry and dispatcher.
    pub fn new(registry: Arc<TaskRegistry>, dispatch: Arc<DispatchManager>) -> Self {
        Self { registry, dispatch }
    }

    /// Accept an agent identity; the assigned id is the agent id, or the
    /// hostname when no agent id was sent.
    pub fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, SessionError> {
        let assigned = req.host_id();
        if assigned.is_empty() {
            return Err(SessionError::Protocol(
                "register needs an agent_id or hostname".into(),
            ));
        }
        info!(agent_id = %req.agent_id, hostname = %req.hostname, assigned, "Agent registered");
        Ok(RegisterResponse {
            assigned_id: assigned.to_string(),
        })
    }

    /// Apply a task report to the registry. Always acknowledged: unknown
    /// statuses, unknown tasks and late reports are logged, not fatal.
    pub fn report_task_result(&self, result: &TaskResult) -> TaskAck {
        let id = result.id.as_str();

        if !result.logs.is_empty() {
            if let Err(e) = self.registry.append_log(id, &result.logs) {
                warn!(task_id = id, error = %e, "Log update rejected");
            }
        }

        let outcome = match result.reported_status() {
            Some(ReportedStatus::Running) => self.registry.mark_running(id).map(drop),
            Some(ReportedStatus::Succeeded) => self.registry.mark_succeeded(id).map(drop),
            Some(ReportedStatus::Failed) => {
                let message = if result.error.is_empty() {
                    UNKNOWN_ERROR
                } else {
                    result.error.as_str()
                };
                self.registry.mark_failed(id, message).map(drop)
            }
            None => {
                warn!(task_id = id, status = %result.status, "Unknown task status, ignored");
                Ok(())
            }
        };
        match outcome {
            Ok(()) => debug!(task_id = id, status = %result.status, "Task report applied"),
            Err(e) => warn!(task_id = id, status = %result.status, error = %e, "Task report rejected"),
        }

        TaskAck { id: id.to_string() }
    }

    /// Stream tasks for the requesting host: the pending backlog first, in
    /// FIFO order, then every live enqueue until `cancel` fires or the
    /// subscription closes. The live registration is removed on return.
    pub async fn watch_tasks(
        &self,
        req: &RegisterRequest,
        outbound: &mpsc::Sender<ControllerFrame>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let host_id = req.host_id();
        if host_id.is_empty() {
            return Err(SessionError::Protocol(
                "watch_tasks needs an agent_id or hostname".into(),
            ));
        }

        let (backlog, mut subscription) = self.dispatch.drain_and_subscribe(host_id);
        info!(host_id, backlog = backlog.len(), "Agent watching tasks");

        for task in backlog {
            send(outbound, ControllerFrame::Task(task)).await?;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(task) => send(outbound, ControllerFrame::Task(task)).await?,
                    None => break,
                },
            }
        }

        subscription.cancel();
        debug!(host_id, "Task watch ended");
        Ok(())
    }

    /// Serve one agent connection until the inbound stream ends or `cancel`
    /// fires. At most one task watch runs per session.
    pub async fn run_session(
        &self,
        mut inbound: mpsc::Receiver<AgentFrame>,
        outbound: mpsc::Sender<ControllerFrame>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let watch_cancel = cancel.child_token();
        let _stop_watch = watch_cancel.clone().drop_guard();
        let mut watcher: Option<JoinHandle<Result<(), SessionError>>> = None;

        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match frame {
                AgentFrame::Register(req) => {
                    let reply = match self.register(&req) {
                        Ok(resp) => ControllerFrame::Registered(resp),
                        Err(e) => ControllerFrame::Error {
                            message: e.to_string(),
                        },
                    };
                    send(&outbound, reply).await?;
                }
                AgentFrame::WatchTasks(req) => {
                    if watcher.as_ref().is_some_and(|w| !w.is_finished()) {
                        send(
                            &outbound,
                            ControllerFrame::Error {
                                message: "already watching tasks".into(),
                            },
                        )
                        .await?;
                        continue;
                    }
                    if req.host_id().is_empty() {
                        send(
                            &outbound,
                            ControllerFrame::Error {
                                message: "watch_tasks needs an agent_id or hostname".into(),
                            },
                        )
                        .await?;
                        continue;
                    }
                    let service = self.clone();
                    let outbound = outbound.clone();
                    let cancel = watch_cancel.clone();
                    watcher = Some(tokio::spawn(async move {
                        service.watch_tasks(&req, &outbound, &cancel).await
                    }));
                }
                AgentFrame::ReportTaskResult(result) => {
                    let ack = self.report_task_result(&result);
                    send(&outbound, ControllerFrame::Ack(ack)).await?;
                }
            }
        }

        watch_cancel.cancel();
        if let Some(watcher) = watcher {
            match watcher.await {
                Ok(Ok(()) | Err(SessionError::Closed)) => {}
                Ok(Err(e)) => warn!(error = %e, "Task watch failed"),
                Err(e) => warn!(error = %e, "Task watch panicked"),
            }
        }
        Ok(())
    }
}

async fn send(
    outbound: &mpsc::Sender<ControllerFrame>,
    frame: ControllerFrame,
) -> Result<(), SessionError> {
    outbound.send(frame).await.map_err(|_| SessionError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::TaskStatus;
    use std::time::Duration;
    use vertera_proto::{InstallPackagesParams, PackageKind, TaskSpec};

    fn service() -> (AgentService, Arc<TaskRegistry>, Arc<DispatchManager>) {
        let registry = Arc::new(TaskRegistry::new());
        let dispatch = Arc::new(DispatchManager::default());
        (
            AgentService::new(Arc::clone(&registry), Arc::clone(&dispatch)),
            registry,
            dispatch,
        )
    }

    fn spec() -> TaskSpec {
        TaskSpec::InstallPackages(InstallPackagesParams {
            packages: vec![PackageKind::Ovs],
            version: None,
            os_version: None,
        })
    }

    fn req(agent_id: &str, hostname: &str) -> RegisterRequest {
        RegisterRequest {
            agent_id: agent_id.into(),
            hostname: hostname.into(),
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ControllerFrame>) -> ControllerFrame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open")
    }

    #[test]
    fn register_falls_back_to_hostname() {
        let (svc, _, _) = service();
        assert_eq!(svc.register(&req("", "node1")).unwrap().assigned_id, "node1");
        assert_eq!(svc.register(&req("a1", "node1")).unwrap().assigned_id, "a1");
        assert!(svc.register(&req("", "")).is_err());
    }

    #[test]
    fn reports_drive_the_registry() {
        // GIVEN: a queued task
        let (svc, registry, _) = service();
        let id = registry.create("h", spec()).id;

        // WHEN: running with a log snippet, then failed without a message
        svc.report_task_result(
            &TaskResult::new(&id, ReportedStatus::Running).with_logs("downloading: ovs"),
        );
        let ack = svc.report_task_result(&TaskResult::new(&id, ReportedStatus::Failed));

        // THEN
        assert_eq!(ack.id, id);
        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.logs.as_deref(), Some("downloading: ovs"));
        assert_eq!(task.error.as_deref(), Some(UNKNOWN_ERROR));
    }

    #[test]
    fn unknown_status_leaves_task_untouched() {
        let (svc, registry, _) = service();
        let id = registry.create("h", spec()).id;

        let ack = svc.report_task_result(&TaskResult {
            id: id.clone(),
            status: "paused".into(),
            logs: String::new(),
            error: String::new(),
        });

        assert_eq!(ack.id, id);
        assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn late_report_does_not_reopen() {
        let (svc, registry, _) = service();
        let id = registry.create("h", spec()).id;
        svc.report_task_result(&TaskResult::new(&id, ReportedStatus::Succeeded));

        svc.report_task_result(&TaskResult::new(&id, ReportedStatus::Running));

        assert_eq!(registry.get(&id).unwrap().status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn watch_sends_backlog_then_live_tasks() {
        // GIVEN: two tasks queued before the agent connects
        let (svc, registry, dispatch) = service();
        let t1 = registry.create("h", spec());
        let t2 = registry.create("h", spec());
        dispatch.enqueue("h", t1.envelope());
        dispatch.enqueue("h", t2.envelope());

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let watch = {
            let svc = svc.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { svc.watch_tasks(&req("h", ""), &out_tx, &cancel).await })
        };

        // THEN: backlog arrives in order
        for expected in [&t1.id, &t2.id] {
            match next(&mut out_rx).await {
                ControllerFrame::Task(t) => assert_eq!(&t.id, expected),
                other => panic!("unexpected frame {other:?}"),
            }
        }

        // WHEN: a new task is enqueued while watching
        tokio::time::sleep(Duration::from_millis(20)).await;
        let t3 = registry.create("h", spec());
        dispatch.enqueue("h", t3.envelope());

        // THEN: it is pushed live
        match next(&mut out_rx).await {
            ControllerFrame::Task(t) => assert_eq!(t.id, t3.id),
            other => panic!("unexpected frame {other:?}"),
        }

        // WHEN: cancelled, the registration is gone
        cancel.cancel();
        watch.await.unwrap().unwrap();
        assert_eq!(dispatch.subscriber_count("h"), 0);
    }

    #[tokio::test]
    async fn session_handles_full_exchange() {
        // GIVEN: a running session over channels
        let (svc, registry, dispatch) = service();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = {
            let svc = svc.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { svc.run_session(in_rx, out_tx, cancel).await })
        };

        // WHEN: the agent registers and watches
        in_tx.send(AgentFrame::Register(req("a1", "node1"))).await.unwrap();
        assert!(matches!(
            next(&mut out_rx).await,
            ControllerFrame::Registered(r) if r.assigned_id == "a1"
        ));
        in_tx.send(AgentFrame::WatchTasks(req("a1", "node1"))).await.unwrap();

        // AND: work is enqueued for it
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = registry.create("a1", spec());
        dispatch.enqueue("a1", task.envelope());
        let ControllerFrame::Task(pushed) = next(&mut out_rx).await else {
            panic!("expected task frame");
        };
        assert_eq!(pushed.id, task.id);

        // AND: reports success
        in_tx
            .send(AgentFrame::ReportTaskResult(TaskResult::new(
                &task.id,
                ReportedStatus::Succeeded,
            )))
            .await
            .unwrap();
        assert!(matches!(next(&mut out_rx).await, ControllerFrame::Ack(a) if a.id == task.id));

        // THEN: the task is done and closing the session drops the watch
        assert_eq!(registry.get(&task.id).unwrap().status, TaskStatus::Succeeded);
        drop(in_tx);
        session.await.unwrap().unwrap();
        assert_eq!(dispatch.subscriber_count("a1"), 0);
    }

    #[tokio::test]
    async fn second_watch_is_refused() {
        let (svc, _, _) = service();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = {
            let svc = svc.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { svc.run_session(in_rx, out_tx, cancel).await })
        };

        in_tx.send(AgentFrame::WatchTasks(req("a1", ""))).await.unwrap();
        in_tx.send(AgentFrame::WatchTasks(req("a1", ""))).await.unwrap();

        assert!(matches!(next(&mut out_rx).await, ControllerFrame::Error { .. }));
        cancel.cancel();
        session.await.unwrap().unwrap();
    }
}
