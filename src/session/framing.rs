//! JSON-lines framing between a byte stream and a pair of frame channels.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::SessionError;

/// Longest accepted line. Certificates never travel here, so frames stay small.
const MAX_FRAME_LEN: usize = 256 * 1024;

/// Move frames between `io` and the channels until the peer closes, the
/// local side drops `outbound`, or `cancel` fires.
pub(crate) async fn pump<S, In, Out>(
    io: S,
    inbound: mpsc::Sender<In>,
    mut outbound: mpsc::Receiver<Out>,
    cancel: CancellationToken,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    In: DeserializeOwned,
    Out: Serialize,
{
    let (mut sink, mut stream) =
        Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LEN)).split();

    // The halves run concurrently: a full inbound channel must not stop
    // outbound frames from draining.
    let read = async {
        while let Some(line) = stream.next().await {
            let line = line.map_err(|e| SessionError::Transport(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            trace!(len = line.len(), "Frame in");
            let frame: In = serde_json::from_str(&line)
                .map_err(|e| SessionError::Protocol(format!("malformed frame: {e}")))?;
            if inbound.send(frame).await.is_err() {
                break;
            }
        }
        Ok::<(), SessionError>(())
    };

    let write = async {
        while let Some(frame) = outbound.recv().await {
            let line = serde_json::to_string(&frame)
                .map_err(|e| SessionError::Protocol(format!("unencodable frame: {e}")))?;
            trace!(len = line.len(), "Frame out");
            sink.send(line)
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?;
        }
        Ok::<(), SessionError>(())
    };

    tokio::select! {
        () = cancel.cancelled() => Ok(()),
        read = read => read,
        written = write => written,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use vertera_proto::{AgentFrame, ControllerFrame, RegisterRequest, RegisterResponse};

    #[tokio::test]
    async fn frames_cross_as_json_lines() {
        // GIVEN: a pump on one end of an in-memory duplex
        let (local, remote) = tokio::io::duplex(4096);
        let (in_tx, mut in_rx) = mpsc::channel::<AgentFrame>(4);
        let (out_tx, out_rx) = mpsc::channel::<ControllerFrame>(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump(local, in_tx, out_rx, cancel.clone()));

        let (read_half, mut write_half) = tokio::io::split(remote);
        let mut lines = BufReader::new(read_half).lines();

        // WHEN: the far side writes a line and the local side sends a frame
        let req = AgentFrame::Register(RegisterRequest {
            agent_id: "a1".into(),
            hostname: "h1".into(),
        });
        let mut line = serde_json::to_string(&req).unwrap();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await.unwrap();
        out_tx
            .send(ControllerFrame::Registered(RegisterResponse {
                assigned_id: "a1".into(),
            }))
            .await
            .unwrap();

        // THEN: each arrives decoded on the other side
        assert_eq!(in_rx.recv().await.unwrap(), req);
        let got = lines.next_line().await.unwrap().unwrap();
        let frame: ControllerFrame = serde_json::from_str(&got).unwrap();
        assert!(matches!(frame, ControllerFrame::Registered(r) if r.assigned_id == "a1"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_line_is_protocol_error() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (in_tx, _in_rx) = mpsc::channel::<AgentFrame>(1);
        let (_out_tx, out_rx) = mpsc::channel::<ControllerFrame>(1);
        let task = tokio::spawn(pump(local, in_tx, out_rx, CancellationToken::new()));

        remote.write_all(b"{not json}\n").await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)), "{err}");
    }
}
