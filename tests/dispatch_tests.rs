//! Dispatch and session behaviour without a network transport.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vertera::controlplane::{DispatchManager, TaskRegistry, TaskStatus};
use vertera::session::AgentService;
use vertera_proto::{
    AgentFrame, ControllerFrame, InstallPackagesParams, PackageKind, RegisterRequest, ReportedStatus,
    TaskEnvelope, TaskResult, TaskSpec,
};

fn ovs() -> TaskSpec {
    TaskSpec::InstallPackages(InstallPackagesParams {
        packages: vec![PackageKind::Ovs],
        version: None,
        os_version: None,
    })
}

fn register(host: &str) -> RegisterRequest {
    RegisterRequest {
        agent_id: host.to_string(),
        hostname: format!("{host}.lab"),
    }
}

async fn next_task(rx: &mut mpsc::Receiver<ControllerFrame>) -> TaskEnvelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("session open");
        if let ControllerFrame::Task(task) = frame {
            return task;
        }
    }
}

struct Session {
    tx: mpsc::Sender<AgentFrame>,
    rx: mpsc::Receiver<ControllerFrame>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), vertera::session::SessionError>>,
}

fn open(service: &AgentService) -> Session {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let svc = service.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { svc.run_session(in_rx, out_tx, token).await });
    Session {
        tx: in_tx,
        rx: out_rx,
        cancel,
        handle,
    }
}

#[tokio::test]
async fn test_live_pushed_task_is_drained_again() {
    // GIVEN: a subscriber for host-1
    let dispatch = DispatchManager::new(4);
    let registry = TaskRegistry::new();
    let mut sub = dispatch.subscribe("host-1");

    // WHEN: a task is enqueued
    let task = registry.create("host-1", ovs());
    dispatch.enqueue("host-1", task.envelope());

    // THEN: it was pushed live and is still queued
    let pushed = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .unwrap()
        .expect("live push");
    assert_eq!(pushed.id, task.id);
    let drained = dispatch.drain_pending("host-1");
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].id, task.id);
    assert_eq!(dispatch.pending_len("host-1"), 0);
}

#[test]
fn test_full_subscriber_does_not_lose_tasks() {
    // GIVEN: a subscriber with room for one task that never reads
    let dispatch = DispatchManager::new(1);
    let registry = TaskRegistry::new();
    let _sub = dispatch.subscribe("host-1");

    // WHEN: three tasks are enqueued
    let ids: Vec<String> = (0..3)
        .map(|_| {
            let task = registry.create("host-1", ovs());
            dispatch.enqueue("host-1", task.envelope());
            task.id
        })
        .collect();

    // THEN: the queue holds all of them in order
    let drained: Vec<String> = dispatch
        .drain_pending("host-1")
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(drained, ids);
}

#[tokio::test]
async fn test_two_sessions_for_one_host_both_receive_live_push() {
    // GIVEN: two watching sessions for host-2
    let registry = Arc::new(TaskRegistry::new());
    let dispatch = Arc::new(DispatchManager::new(8));
    let service = AgentService::new(Arc::clone(&registry), Arc::clone(&dispatch));

    let mut a = open(&service);
    let mut b = open(&service);
    for s in [&a, &b] {
        s.tx.send(AgentFrame::WatchTasks(register("host-2"))).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while dispatch.subscriber_count("host-2") < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // WHEN: a task is enqueued
    let task = registry.create("host-2", ovs());
    dispatch.enqueue("host-2", task.envelope());

    // THEN: both get it
    assert_eq!(next_task(&mut a.rx).await.id, task.id);
    assert_eq!(next_task(&mut b.rx).await.id, task.id);

    // AND: closing the sessions releases their subscriptions
    for s in [a, b] {
        s.cancel.cancel();
        s.handle.await.unwrap().unwrap();
    }
    assert_eq!(dispatch.subscriber_count("host-2"), 0);
}

#[tokio::test]
async fn test_reports_from_session_finalize_task() {
    // GIVEN: a task delivered over a session
    let registry = Arc::new(TaskRegistry::new());
    let dispatch = Arc::new(DispatchManager::new(8));
    let service = AgentService::new(Arc::clone(&registry), Arc::clone(&dispatch));
    let task = registry.create("host-3", ovs());
    dispatch.enqueue("host-3", task.envelope());

    let mut s = open(&service);
    s.tx.send(AgentFrame::WatchTasks(register("host-3"))).await.unwrap();
    let delivered = next_task(&mut s.rx).await;

    // WHEN: the agent reports failure without a message, then success
    s.tx.send(AgentFrame::ReportTaskResult(TaskResult::new(
        &delivered.id,
        ReportedStatus::Failed,
    )))
    .await
    .unwrap();
    s.tx.send(AgentFrame::ReportTaskResult(TaskResult::new(
        &delivered.id,
        ReportedStatus::Succeeded,
    )))
    .await
    .unwrap();

    // THEN: both are acked and the first terminal state sticks
    let mut acks = 0;
    while acks < 2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), s.rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let ControllerFrame::Ack(ack) = frame {
            assert_eq!(ack.id, delivered.id);
            acks += 1;
        }
    }
    let stored = registry.get(&delivered.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("unknown error"));

    s.cancel.cancel();
    s.handle.await.unwrap().unwrap();
}
