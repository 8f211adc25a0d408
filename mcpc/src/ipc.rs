//! Length-prefixed JSON framing over the per-session bridge socket, plus the
//! client side of the protocol.
//!
//! On the wire every message is `<4-byte big-endian length><JSON body>`, the
//! body a single [`IpcMessage`]. Responses are correlated by `id`, so they
//! may arrive in any order; notifications are pushed by the bridge at any
//! time. A 16 MiB body cap guards against runaway allocations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result, is_ignorable_shutdown_error};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const CHANNEL_CAPACITY: usize = 128;

const CODE_CLIENT: i64 = -32001;
const CODE_TRANSPORT: i64 = -32003;
const CODE_AUTH: i64 = -32004;
const CODE_BUSY: i64 = -32005;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum IpcMessage {
    Request {
        id: u64,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<IpcError>,
    },
    Notification {
        notification: IpcNotification,
    },
    Shutdown,
    SetAuthCredentials {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl IpcError {
    /// Encode an error for the wire, preserving its kind so the far side can
    /// apply the right retry policy.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Client(message) => Self {
                code: CODE_CLIENT,
                message: message.clone(),
                data: Some(serde_json::json!({ "kind": "client" })),
            },
            Error::Server { code, message, data } => Self {
                code: *code,
                message: message.clone(),
                data: Some(serde_json::json!({ "kind": "server", "details": data })),
            },
            Error::Transport(message) => Self {
                code: CODE_TRANSPORT,
                message: message.clone(),
                data: Some(serde_json::json!({ "kind": "transport" })),
            },
            Error::Auth { message, command } => Self {
                code: CODE_AUTH,
                message: message.clone(),
                data: Some(serde_json::json!({ "kind": "auth", "command": command })),
            },
            Error::Busy { path } => Self {
                code: CODE_BUSY,
                message: err.to_string(),
                data: Some(serde_json::json!({
                    "kind": "busy",
                    "path": path.to_string_lossy(),
                })),
            },
        }
    }

    pub fn into_error(self) -> Error {
        let kind = self
            .data
            .as_ref()
            .and_then(|d| d.get("kind"))
            .and_then(|k| k.as_str())
            .map(str::to_owned);
        match kind.as_deref() {
            Some("client") => Error::Client(self.message),
            Some("transport") => Error::Transport(self.message),
            Some("auth") => Error::Auth {
                message: self.message,
                command: self
                    .data
                    .and_then(|d| d.get("command").and_then(|c| c.as_str().map(str::to_owned))),
            },
            Some("busy") => Error::Busy {
                path: self
                    .data
                    .as_ref()
                    .and_then(|d| d.get("path"))
                    .and_then(|p| p.as_str())
                    .map(std::path::PathBuf::from)
                    .unwrap_or_default(),
            },
            Some("server") => Error::Server {
                code: self.code,
                message: self.message,
                data: self
                    .data
                    .and_then(|mut d| d.as_object_mut().and_then(|obj| obj.remove("details")))
                    .filter(|v| !v.is_null()),
            },
            _ => match self.code {
                CODE_CLIENT => Error::Client(self.message),
                CODE_TRANSPORT => Error::Transport(self.message),
                CODE_AUTH => Error::Auth { message: self.message, command: None },
                _ => Error::Server { code: self.code, message: self.message, data: self.data },
            },
        }
    }
}

pub fn encode_frame(msg: &IpcMessage) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)
        .map_err(|e| Error::transport(format!("encode ipc message: {e}")))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(Error::transport(format!(
            "ipc message of {} bytes exceeds the {MAX_FRAME_SIZE} byte frame cap",
            body.len()
        )));
    }
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental decoder. Feed arbitrary chunks; frames come out exactly as
/// they were encoded regardless of where the chunk boundaries fell.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next(&mut self) -> Result<Option<IpcMessage>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::transport(format!(
                "ipc frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte cap"
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let body = self.buf.split_to(len);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| Error::transport(format!("decode ipc message: {e}")))
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &IpcMessage) -> Result<()> {
    let bytes = encode_frame(msg)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` is a clean end of stream at a frame boundary;
/// an EOF in the middle of a frame is a transport error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<IpcMessage>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::transport(format!("read ipc frame: {e}"))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::transport(format!(
            "ipc frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte cap"
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::transport(format!("read ipc frame body: {e}")))?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| Error::transport(format!("decode ipc message: {e}")))
}

pub type NotificationHandler = Arc<dyn Fn(IpcNotification) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Client end of a bridge connection. Cheap to clone; all clones share the
/// same connection, pending map and id counter.
#[derive(Clone)]
pub struct BridgeClient {
    outgoing_tx: mpsc::Sender<IpcMessage>,
    pending: PendingMap,
    next_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    default_timeout: Duration,
}

impl BridgeClient {
    #[cfg(unix)]
    pub async fn connect(
        path: &std::path::Path,
        handler: Option<NotificationHandler>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| Error::transport(format!("connect {}: {e}", path.display())))?;
        Ok(Self::from_stream(stream, handler, default_timeout))
    }

    #[cfg(windows)]
    pub async fn connect(
        path: &std::path::Path,
        handler: Option<NotificationHandler>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let name = path.to_string_lossy().into_owned();
        let stream = tokio::net::windows::named_pipe::ClientOptions::new()
            .open(&name)
            .map_err(|e| Error::transport(format!("connect {name}: {e}")))?;
        Ok(Self::from_stream(stream, handler, default_timeout))
    }

    /// Build a client over any byte stream. Spawns the reader and writer
    /// tasks; both end when the stream closes or the client is dropped.
    pub fn from_stream<S>(
        stream: S,
        handler: Option<NotificationHandler>,
        default_timeout: Duration,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<IpcMessage>(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let closed_for_writer = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if let Err(err) = write_frame(&mut write_half, &msg).await {
                    if !is_ignorable_shutdown_error(&err.to_string()) {
                        debug!(target: "ipc", error = %err, "failed to write ipc frame");
                    }
                    closed_for_writer.store(true, Ordering::SeqCst);
                    break;
                }
            }
            // Half-close so the bridge sees EOF once this client is dropped;
            // without it the connection would pin the daemon's idle timer.
            let _ = write_half.shutdown().await;
        });

        let pending_for_reader = pending.clone();
        let closed_for_reader = closed.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(IpcMessage::Response { id, result, error })) => {
                        let sender = pending_for_reader.lock().await.remove(&id);
                        match sender {
                            Some(tx) => {
                                let outcome = match error {
                                    Some(err) => Err(err.into_error()),
                                    None => Ok(result.unwrap_or(Value::Null)),
                                };
                                let _ = tx.send(outcome);
                            }
                            // A reply for a request that already timed out.
                            None => debug!(target: "ipc", id, "discarding late response"),
                        }
                    }
                    Ok(Some(IpcMessage::Notification { notification })) => {
                        if let Some(handler) = &handler {
                            handler(notification);
                        }
                    }
                    Ok(Some(other)) => {
                        warn!(target: "ipc", message = ?other, "unexpected message from bridge");
                    }
                    Ok(None) => break,
                    Err(err) => {
                        if !is_ignorable_shutdown_error(&err.to_string()) {
                            debug!(target: "ipc", error = %err, "ipc read failed");
                        }
                        break;
                    }
                }
            }
            closed_for_reader.store(true, Ordering::SeqCst);
            fail_all_pending(&pending_for_reader).await;
        });

        Self {
            outgoing_tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            closed,
            default_timeout,
        }
    }

    /// True once the connection has failed or closed; later requests fail
    /// fast instead of waiting out their deadline.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.default_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::transport("bridge connection closed"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Register before sending so an immediate reply cannot be lost.
        self.pending.lock().await.insert(id, tx);

        let message = IpcMessage::Request { id, method: method.to_string(), params };
        if self.outgoing_tx.send(message).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::transport("bridge connection closed"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::transport(
                "bridge connection closed before a reply was received",
            )),
            Err(_) => {
                // Deregister so a reply arriving later is discarded.
                self.pending.lock().await.remove(&id);
                Err(Error::transport(format!("request `{method}` timed out")))
            }
        }
    }

    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.request_with_timeout("ping", None, timeout).await?;
        Ok(())
    }

    pub async fn send_shutdown(&self) -> Result<()> {
        self.outgoing_tx
            .send(IpcMessage::Shutdown)
            .await
            .map_err(|_| Error::transport("bridge connection closed"))
    }

    pub async fn send_auth_credentials(
        &self,
        headers: Option<HashMap<String, String>>,
        refresh_token: Option<String>,
    ) -> Result<()> {
        self.outgoing_tx
            .send(IpcMessage::SetAuthCredentials { headers, refresh_token })
            .await
            .map_err(|_| Error::transport("bridge connection closed"))
    }
}

async fn fail_all_pending(pending: &PendingMap) {
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(Error::transport("bridge connection closed")));
    }
}

/// Listener side of the bridge socket.
#[cfg(unix)]
pub type IpcServerStream = tokio::net::UnixStream;

#[cfg(unix)]
pub struct IpcListener {
    inner: tokio::net::UnixListener,
}

#[cfg(unix)]
impl IpcListener {
    /// Bind the socket and restrict it to the owning user.
    pub fn bind(path: &std::path::Path) -> Result<Self> {
        let inner = tokio::net::UnixListener::bind(path)
            .map_err(|e| Error::transport(format!("bind {}: {e}", path.display())))?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::transport(format!("chmod {}: {e}", path.display())))?;
        Ok(Self { inner })
    }

    pub async fn accept(&mut self) -> Result<IpcServerStream> {
        let (stream, _addr) = self
            .inner
            .accept()
            .await
            .map_err(|e| Error::transport(format!("accept: {e}")))?;
        Ok(stream)
    }
}

#[cfg(windows)]
pub type IpcServerStream = tokio::net::windows::named_pipe::NamedPipeServer;

#[cfg(windows)]
pub struct IpcListener {
    name: String,
    next: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(windows)]
impl IpcListener {
    pub fn bind(path: &std::path::Path) -> Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let name = path.to_string_lossy().into_owned();
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|e| Error::transport(format!("create pipe {name}: {e}")))?;
        Ok(Self { name, next: Some(first) })
    }

    pub async fn accept(&mut self) -> Result<IpcServerStream> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let server = match self.next.take() {
            Some(server) => server,
            None => ServerOptions::new()
                .create(&self.name)
                .map_err(|e| Error::transport(format!("create pipe {}: {e}", self.name)))?,
        };
        server
            .connect()
            .await
            .map_err(|e| Error::transport(format!("pipe accept: {e}")))?;
        self.next = ServerOptions::new().create(&self.name).ok();
        Ok(server)
    }
}
