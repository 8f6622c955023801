//! Client side of the per-session IPC socket
//!
//! Used by the session manager when a session is not loaded in-process,
//! and by the forwarder's `--update-title` path.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::error::Result;
use crate::ipc::protocol::{encode_frame, ControlCommand, MessageType};

/// One connection to a session's `ipc.sock`.
pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self { stream })
    }

    /// Send input text as a `STDIN_DATA` frame.
    pub async fn send_stdin(&mut self, text: &str) -> Result<()> {
        self.send(MessageType::StdinData, text.as_bytes()).await
    }

    /// Send a control command as JSON in a `CONTROL_CMD` frame.
    pub async fn send_control(&mut self, cmd: &ControlCommand) -> Result<()> {
        let payload = serde_json::to_vec(cmd)?;
        self.send(MessageType::ControlCmd, &payload).await
    }

    pub async fn send_heartbeat(&mut self) -> Result<()> {
        self.send(MessageType::Heartbeat, b"").await
    }

    async fn send(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(msg_type, payload);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::ipc::endpoint::{IpcEndpoint, IpcRequest};

    #[tokio::test]
    async fn client_reaches_endpoint() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ipc.sock");
        let (tx, mut rx) = mpsc::channel(8);
        let _endpoint = IpcEndpoint::bind(&path, tx, CancellationToken::new()).unwrap();

        let mut client = IpcClient::connect(&path).await.unwrap();
        client.send_stdin("hello").await.unwrap();
        client
            .send_control(&ControlCommand::UpdateTitle {
                title: "renamed".into(),
            })
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            IpcRequest::Stdin(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            IpcRequest::Control(ControlCommand::UpdateTitle { title }) => {
                assert_eq!(title, "renamed");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
