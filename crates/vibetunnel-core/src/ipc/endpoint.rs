//! Per-session IPC endpoint
//!
//! Listens on `<sessionDir>/ipc.sock`, accepts any number of clients and
//! funnels their frames into the session's single serialized handler.
//! Message order is preserved per connection; there is no global order
//! across connections.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::ipc::protocol::{encode_frame, Frame, FrameParser, MessageType};
use crate::ipc::ControlCommand;
use crate::store::MAX_SOCKET_PATH;

const CLIENT_QUEUE_DEPTH: usize = 64;

/// A message read from some IPC client, ready for the session's input
/// serializer.
#[derive(Debug)]
pub enum IpcRequest {
    Stdin(String),
    Control(ControlCommand),
    /// Status request; the reply goes back to the asking client only.
    Status { reply: mpsc::Sender<Bytes> },
}

/// The listening side of one session's IPC socket.
pub struct IpcEndpoint {
    socket_path: PathBuf,
    clients: Arc<Mutex<HashMap<u64, mpsc::Sender<Bytes>>>>,
    cancel: CancellationToken,
}

impl IpcEndpoint {
    /// Bind the socket (mode 0666, stale file unlinked first) and start
    /// accepting clients. Parsed requests go to `requests`.
    pub fn bind(
        socket_path: &Path,
        requests: mpsc::Sender<IpcRequest>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let path_len = socket_path.as_os_str().len();
        if path_len > MAX_SOCKET_PATH {
            return Err(CoreError::PathTooLong {
                path: socket_path.display().to_string(),
                len: path_len,
                limit: MAX_SOCKET_PATH,
            });
        }

        match std::fs::remove_file(socket_path) {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::BindFailed {
                    path: socket_path.to_path_buf(),
                    source: e,
                })
            }
        }

        let listener = UnixListener::bind(socket_path).map_err(|source| CoreError::BindFailed {
            path: socket_path.to_path_buf(),
            source,
        })?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;

        let clients: Arc<Mutex<HashMap<u64, mpsc::Sender<Bytes>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let endpoint = Self {
            socket_path: socket_path.to_path_buf(),
            clients: clients.clone(),
            cancel: cancel.clone(),
        };

        let accept_path = socket_path.to_path_buf();
        tokio::spawn(async move {
            let next_id = AtomicU64::new(1);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let id = next_id.fetch_add(1, Ordering::Relaxed);
                                debug!(client = id, "ipc client connected");
                                spawn_client(
                                    id,
                                    stream,
                                    requests.clone(),
                                    clients.clone(),
                                    cancel.clone(),
                                );
                            }
                            Err(e) => {
                                warn!(path = %accept_path.display(), "accept failed: {e}");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(path = %accept_path.display(), "ipc acceptor stopped");
        });

        info!(path = %socket_path.display(), "ipc endpoint listening");
        Ok(endpoint)
    }

    /// Queue a frame to every connected client. Slow clients with full
    /// queues miss the broadcast rather than stalling the session.
    pub fn broadcast(&self, msg_type: MessageType, payload: &[u8]) {
        let frame = encode_frame(msg_type, payload);
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|id, tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(client = id, "broadcast dropped for slow client");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Stop accepting, disconnect clients and unlink the socket file.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.clients.lock().unwrap().clear();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), "failed to unlink socket: {e}");
            }
        }
    }
}

fn spawn_client(
    id: u64,
    stream: UnixStream,
    requests: mpsc::Sender<IpcRequest>,
    clients: Arc<Mutex<HashMap<u64, mpsc::Sender<Bytes>>>>,
    cancel: CancellationToken,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE_DEPTH);
    clients.lock().unwrap().insert(id, writer_tx.clone());

    // Writer: drains this client's queue.
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = writer_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: feeds the per-connection parser, dispatches in arrival order.
    tokio::spawn(async move {
        let mut parser = FrameParser::new();
        let mut buf = [0u8; 8192];
        'conn: loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break 'conn,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break 'conn,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(client = id, "ipc read error: {e}");
                        break 'conn;
                    }
                },
            };

            parser.push(&buf[..n]);
            loop {
                match parser.next_frame() {
                    Ok(Some(frame)) => {
                        if !dispatch_frame(id, frame, &requests, &writer_tx).await {
                            break 'conn;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(client = id, "dropping peer: {e}");
                        break 'conn;
                    }
                }
            }
        }
        clients.lock().unwrap().remove(&id);
        debug!(client = id, "ipc client disconnected");
    });
}

/// Handle one frame from one client. Returns false when the session side
/// is gone and the connection should close.
async fn dispatch_frame(
    client: u64,
    frame: Frame,
    requests: &mpsc::Sender<IpcRequest>,
    writer_tx: &mpsc::Sender<Bytes>,
) -> bool {
    match frame.message_type() {
        Some(MessageType::StdinData) => {
            let text = String::from_utf8_lossy(&frame.payload).into_owned();
            requests.send(IpcRequest::Stdin(text)).await.is_ok()
        }
        Some(MessageType::ControlCmd) => {
            match serde_json::from_slice::<ControlCommand>(&frame.payload) {
                Ok(cmd) => requests.send(IpcRequest::Control(cmd)).await.is_ok(),
                Err(e) => {
                    // Bad payloads are skipped; the connection stays open.
                    debug!(client, "skipping malformed control payload: {e}");
                    true
                }
            }
        }
        Some(MessageType::Heartbeat) => {
            let _ = writer_tx
                .send(encode_frame(MessageType::Heartbeat, b""))
                .await;
            true
        }
        Some(MessageType::StatusUpdate) => true, // reserved, accepted and ignored
        Some(MessageType::Error) => {
            warn!(
                client,
                "peer error frame: {}",
                String::from_utf8_lossy(&frame.payload)
            );
            true
        }
        Some(MessageType::StatusRequest) => requests
            .send(IpcRequest::Status {
                reply: writer_tx.clone(),
            })
            .await
            .is_ok(),
        Some(MessageType::GitEventNotify) => {
            let _ = writer_tx
                .send(encode_frame(MessageType::GitEventAck, b""))
                .await;
            true
        }
        Some(
            MessageType::StatusResponse
            | MessageType::GitFollowRequest
            | MessageType::GitFollowResponse
            | MessageType::GitEventAck,
        ) => {
            debug!(client, code = frame.code, "ignoring unsolicited frame");
            true
        }
        None => {
            debug!(client, code = frame.code, "skipping unknown frame type");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tempfile::TempDir;

    async fn bind_endpoint(
        dir: &TempDir,
    ) -> (IpcEndpoint, mpsc::Receiver<IpcRequest>, PathBuf) {
        let path = dir.path().join("ipc.sock");
        let (tx, rx) = mpsc::channel(64);
        let endpoint = IpcEndpoint::bind(&path, tx, CancellationToken::new()).unwrap();
        (endpoint, rx, path)
    }

    #[tokio::test]
    async fn stdin_frames_arrive_in_connection_order() {
        let dir = TempDir::new().unwrap();
        let (_endpoint, mut rx, path) = bind_endpoint(&dir).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        for text in ["a", "b", "c"] {
            client
                .write_all(&encode_frame(MessageType::StdinData, text.as_bytes()))
                .await
                .unwrap();
        }

        for expected in ["a", "b", "c"] {
            match rx.recv().await.unwrap() {
                IpcRequest::Stdin(text) => assert_eq!(text, expected),
                other => panic!("unexpected request: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn heartbeat_is_echoed() {
        let dir = TempDir::new().unwrap();
        let (_endpoint, _rx, path) = bind_endpoint(&dir).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(&encode_frame(MessageType::Heartbeat, b""))
            .await
            .unwrap();

        let mut reply = [0u8; 5];
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.read_exact(&mut reply),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply[0], MessageType::Heartbeat as u8);
        assert_eq!(u32::from_be_bytes(reply[1..5].try_into().unwrap()), 0);
    }

    #[tokio::test]
    async fn malformed_control_payload_keeps_connection_open() {
        let dir = TempDir::new().unwrap();
        let (_endpoint, mut rx, path) = bind_endpoint(&dir).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(&encode_frame(MessageType::ControlCmd, b"{not json"))
            .await
            .unwrap();
        client
            .write_all(&encode_frame(MessageType::StdinData, b"still here"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            IpcRequest::Stdin(text) => assert_eq!(text, "still here"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_commands_are_decoded() {
        let dir = TempDir::new().unwrap();
        let (_endpoint, mut rx, path) = bind_endpoint(&dir).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(&encode_frame(
                MessageType::ControlCmd,
                br#"{"cmd":"resize","cols":90,"rows":30}"#,
            ))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            IpcRequest::Control(ControlCommand::Resize { cols, rows }) => {
                assert_eq!((cols, rows), (90, 30));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_clients_do_not_interleave_within_a_message() {
        let dir = TempDir::new().unwrap();
        let (_endpoint, mut rx, path) = bind_endpoint(&dir).await;

        let mut c1 = UnixStream::connect(&path).await.unwrap();
        let mut c2 = UnixStream::connect(&path).await.unwrap();
        c1.write_all(&encode_frame(MessageType::StdinData, b"abc"))
            .await
            .unwrap();
        c2.write_all(&encode_frame(MessageType::StdinData, b"XYZ"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            if let IpcRequest::Stdin(text) = rx.recv().await.unwrap() {
                seen.push(text);
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["XYZ".to_string(), "abc".to_string()]);
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipc.sock");
        std::fs::write(&path, b"stale").unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let endpoint = IpcEndpoint::bind(&path, tx, CancellationToken::new()).unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
        endpoint.shutdown();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversized_path_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x".repeat(MAX_SOCKET_PATH));
        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            IpcEndpoint::bind(&path, tx, CancellationToken::new()),
            Err(CoreError::PathTooLong { .. })
        ));
    }
}
