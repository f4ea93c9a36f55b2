//! Agent side of the session transport.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use vertera_proto::{
    AgentFrame, ControllerFrame, RegisterRequest, RegisterResponse, TaskEnvelope, TaskResult,
};

use super::framing::pump;
use super::{SESSION_BUFFER, SessionError};
use crate::pki::tls::ClientTls;

/// An open session with the controller.
///
/// Frames are only read while [`register`](Self::register) or
/// [`next_task`](Self::next_task) is awaited, so a caller running tasks
/// must keep polling `next_task` from its own loop.
#[derive(Debug)]
pub struct SessionClient {
    outbound: mpsc::Sender<AgentFrame>,
    inbound: mpsc::Receiver<ControllerFrame>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<Result<(), SessionError>>>,
}

impl SessionClient {
    /// Dial `addr` and complete the mutual-TLS handshake.
    pub async fn connect(addr: &str, tls: &ClientTls) -> Result<Self, SessionError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Transport(format!("connect {addr}: {e}")))?;
        let stream = TlsConnector::from(tls.config.clone())
            .connect(tls.server_name.clone(), tcp)
            .await
            .map_err(|e| SessionError::Transport(format!("TLS handshake with {addr}: {e}")))?;
        debug!(addr, "Controller session established");

        let (in_tx, in_rx) = mpsc::channel::<ControllerFrame>(SESSION_BUFFER);
        let (out_tx, out_rx) = mpsc::channel::<AgentFrame>(SESSION_BUFFER);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(stream, in_tx, out_rx, cancel.clone()));

        let mut client = Self::from_channels(out_tx, in_rx, cancel);
        client.pump = Some(pump);
        Ok(client)
    }

    /// Session over already-connected channels.
    pub fn from_channels(
        outbound: mpsc::Sender<AgentFrame>,
        inbound: mpsc::Receiver<ControllerFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            cancel,
            pump: None,
        }
    }

    /// Announce this agent and wait for the assigned id.
    pub async fn register(&mut self, req: RegisterRequest) -> Result<RegisterResponse, SessionError> {
        self.send(AgentFrame::Register(req)).await?;
        loop {
            match self.recv().await? {
                ControllerFrame::Registered(resp) => {
                    info!(assigned_id = %resp.assigned_id, "Registered with controller");
                    return Ok(resp);
                }
                ControllerFrame::Error { message } => return Err(SessionError::Protocol(message)),
                other => trace!(frame = ?other, "Frame before registration, ignored"),
            }
        }
    }

    /// Ask the controller to start streaming tasks for `req`'s host.
    pub async fn watch_tasks(&self, req: RegisterRequest) -> Result<(), SessionError> {
        self.send(AgentFrame::WatchTasks(req)).await
    }

    /// Wait for the next task. Acks are consumed here; controller error
    /// frames are logged and skipped.
    pub async fn next_task(&mut self) -> Result<TaskEnvelope, SessionError> {
        loop {
            match self.recv().await? {
                ControllerFrame::Task(task) => return Ok(task),
                ControllerFrame::Ack(ack) => trace!(task_id = %ack.id, "Report acknowledged"),
                ControllerFrame::Error { message } => warn!(message, "Controller reported an error"),
                ControllerFrame::Registered(resp) => {
                    debug!(assigned_id = %resp.assigned_id, "Late registration reply");
                }
            }
        }
    }

    /// A cloneable handle for sending task reports.
    pub fn reporter(&self) -> Reporter {
        Reporter::from_sender(self.outbound.clone())
    }

    /// Tear the session down and wait for the transport to finish.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.cancel.cancel();
        match self.pump.take() {
            Some(pump) => pump
                .await
                .map_err(|e| SessionError::Transport(format!("session pump panicked: {e}")))?,
            None => Ok(()),
        }
    }

    async fn send(&self, frame: AgentFrame) -> Result<(), SessionError> {
        self.outbound.send(frame).await.map_err(|_| SessionError::Closed)
    }

    async fn recv(&mut self) -> Result<ControllerFrame, SessionError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(SessionError::Closed),
            frame = self.inbound.recv() => frame.ok_or(SessionError::Closed),
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Sends task reports on a session.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::Sender<AgentFrame>,
}

impl Reporter {
    /// Reporter writing straight into `tx`.
    pub fn from_sender(tx: mpsc::Sender<AgentFrame>) -> Self {
        Self { tx }
    }

    /// Queue `result` for the controller.
    pub async fn report(&self, result: TaskResult) -> Result<(), SessionError> {
        self.tx
            .send(AgentFrame::ReportTaskResult(result))
            .await
            .map_err(|_| SessionError::Closed)
    }
}
