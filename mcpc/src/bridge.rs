//! The bridge daemon: one per session, owns the upstream MCP connection and
//! multiplexes any number of CLI clients over the session socket.
//!
//! The daemon is handed a [`BridgeConfig`] blob on its handshake pipe,
//! connects upstream, binds the derived socket and then serves connections
//! until something tells it to stop: a `shutdown` message, a signal, the idle
//! timer, or the upstream connection going away for good.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rmcp::ErrorData;
use rmcp::model::{
    ClientCapabilities, ClientInfo, ClientRequest, ClientResult, Implementation, ProtocolVersion,
    ServerNotification, ServerRequest,
};
use rmcp::service::{
    NotificationContext, Peer, RequestContext, RoleClient, Service, ServiceError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, is_ignorable_shutdown_error};
use crate::ipc::{IpcError, IpcListener, IpcMessage, IpcNotification, read_frame, write_frame};
use crate::oauth::{OAuthTokenManager, OAuthTokenManagerParams, OnRefresh};
use crate::paths::{McpcHome, validate_profile_name, validate_session_name};
use crate::profiles::{TokenInfo, load_client_info, load_token_info, save_token_info, stamp_refreshed_at};
use crate::registry::{SessionRegistry, is_process_alive, save_session_headers};
use crate::secrets::SecretStore;
use crate::transport::{self, ServerConfig};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const NOTIFY_CHANNEL_CAPACITY: usize = 256;
const CONNECTION_CHANNEL_CAPACITY: usize = 64;

/// Startup blob the parent writes to the daemon's handshake pipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub session_name: String,
    pub server_config: ServerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

/// Snapshot of the upstream server gathered once at startup and served from
/// cache for `getServerDetails`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDetails {
    pub server_info: Value,
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub protocol_version: String,
}

/// Loads credentials for the session and owns the token manager the bridge
/// consults on every request.
pub struct AuthCoordinator {
    manager: Option<Arc<OAuthTokenManager>>,
}

impl AuthCoordinator {
    /// Build from the handshake config. For OAuth sessions the keychain must
    /// hold both client info and a refresh token, otherwise the bridge
    /// refuses to start and names the login command to run.
    pub fn new(
        home: &McpcHome,
        secrets: &Arc<dyn SecretStore>,
        config: &BridgeConfig,
    ) -> Result<Self> {
        let Some(profile) = &config.profile_name else {
            return Ok(Self { manager: None });
        };
        validate_profile_name(profile)?;
        let server_url = config
            .server_config
            .url()
            .ok_or_else(|| Error::client("an oauth profile requires an http server"))?
            .to_string();
        let command = format!("login {server_url} --profile {profile}");

        let client_info = load_client_info(secrets.as_ref(), &server_url, profile)?
            .ok_or_else(|| {
                Error::auth(
                    format!("no client registration stored for profile {profile}"),
                    Some(command.clone()),
                )
            })?;
        let tokens = load_token_info(secrets.as_ref(), &server_url, profile)?.ok_or_else(|| {
            Error::auth(
                format!("no tokens stored for profile {profile}"),
                Some(command.clone()),
            )
        })?;
        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            Error::auth(
                format!("no refresh token stored for profile {profile}"),
                Some(command),
            )
        })?;

        let on_refresh: OnRefresh = {
            let secrets = secrets.clone();
            let home = home.clone();
            let server_url = server_url.clone();
            let profile = profile.clone();
            Box::new(move |info: &TokenInfo| {
                save_token_info(secrets.as_ref(), &server_url, &profile, info)?;
                stamp_refreshed_at(&home, &server_url, &profile)?;
                Ok(())
            })
        };

        let manager = OAuthTokenManager::new(OAuthTokenManagerParams {
            server_url,
            profile_name: Some(profile.clone()),
            client_id: client_info.client_id,
            refresh_token,
            access_token: Some(tokens.access_token),
            access_token_expires_at: tokens.expires_at,
            on_refresh: Some(on_refresh),
        });
        Ok(Self { manager: Some(Arc::new(manager)) })
    }

    pub fn manager(&self) -> Option<Arc<OAuthTokenManager>> {
        self.manager.clone()
    }
}

/// IPC method → MCP wire method. `getServerDetails` is handled locally.
fn mcp_method(method: &str) -> Option<&'static str> {
    Some(match method {
        "ping" => "ping",
        "listTools" => "tools/list",
        "callTool" => "tools/call",
        "listResources" => "resources/list",
        "listResourceTemplates" => "resources/templates/list",
        "readResource" => "resources/read",
        "subscribeResource" => "resources/subscribe",
        "unsubscribeResource" => "resources/unsubscribe",
        "listPrompts" => "prompts/list",
        "getPrompt" => "prompts/get",
        "setLoggingLevel" => "logging/setLevel",
        _ => return None,
    })
}

fn map_service_error(err: ServiceError) -> Error {
    match err {
        ServiceError::McpError(data) => Error::Server {
            code: data.code.0 as i64,
            message: data.message.to_string(),
            data: data.data,
        },
        other => Error::transport(other.to_string()),
    }
}

/// Client-side service handed to rmcp: its only job is to forward upstream
/// notifications into the fan-out channel.
#[derive(Clone)]
struct UpstreamEvents {
    notify_tx: broadcast::Sender<IpcNotification>,
}

impl Service<RoleClient> for UpstreamEvents {
    async fn handle_request(
        &self,
        request: ServerRequest,
        _context: RequestContext<RoleClient>,
    ) -> std::result::Result<ClientResult, ErrorData> {
        match request {
            ServerRequest::PingRequest(_) => Ok(ClientResult::empty(())),
            other => {
                debug!(target: "bridge", request = ?other, "ignoring server-initiated request");
                Err(ErrorData::internal_error(
                    "server-initiated requests are not supported",
                    None,
                ))
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: ServerNotification,
        _context: NotificationContext<RoleClient>,
    ) -> std::result::Result<(), ErrorData> {
        match serde_json::to_value(&notification) {
            Ok(value) => {
                let method = value
                    .get("method")
                    .and_then(|m| m.as_str())
                    .unwrap_or("notifications/unknown")
                    .to_string();
                let params = value.get("params").cloned();
                // Nobody connected is fine; the send just reports zero receivers.
                let _ = self.notify_tx.send(IpcNotification { method, params });
            }
            Err(err) => warn!(target: "bridge", error = %err, "undeliverable notification"),
        }
        Ok(())
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "mcpc-bridge".into(),
                title: Some("mcpc session bridge".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
        }
    }
}

struct Upstream {
    peer: Peer<RoleClient>,
    cancel: CancellationToken,
    details: ServerDetails,
}

struct BridgeState {
    session_name: String,
    secrets: Arc<dyn SecretStore>,
    registry: SessionRegistry,
    auth: AuthCoordinator,
    profile_name: Option<String>,
    server_config: RwLock<ServerConfig>,
    upstream: RwLock<Upstream>,
    epoch: AtomicU64,
    notify_tx: broadcast::Sender<IpcNotification>,
    upstream_gone_tx: mpsc::UnboundedSender<u64>,
    shutdown: CancellationToken,
    expired: AtomicBool,
    connections: AtomicUsize,
    conn_changed: Notify,
    tracker: TaskTracker,
    conn_tracker: TaskTracker,
    idle_timeout: Duration,
}

/// Run a bridge daemon to completion. `on_ready` fires once the socket is
/// bound and accepting, which is the moment the parent may stop waiting.
pub async fn run(
    home: McpcHome,
    secrets: Arc<dyn SecretStore>,
    config: BridgeConfig,
    on_ready: impl FnOnce(),
) -> Result<()> {
    validate_session_name(&config.session_name)?;
    home.ensure_layout()?;
    let registry = SessionRegistry::new(home.clone());

    let auth = AuthCoordinator::new(&home, &secrets, &config)?;
    let server_config = match &config.headers {
        Some(headers) => config.server_config.with_headers(headers.clone()),
        None => config.server_config.clone(),
    };

    info!(
        target: "bridge",
        session = %config.session_name,
        server = %server_config.redacted().target(),
        "starting bridge"
    );

    let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
    let (upstream_gone_tx, mut upstream_gone_rx) = mpsc::unbounded_channel();

    let upstream =
        connect_upstream(&server_config, &auth, &notify_tx, 0, &upstream_gone_tx).await?;

    let socket_path = home.socket_path(&config.session_name);
    #[cfg(unix)]
    prepare_socket_path(&registry, &config.session_name, &socket_path)?;
    let mut listener = IpcListener::bind(&socket_path)?;

    registry.record_bridge_start(
        &config.session_name,
        config.server_config.clone(),
        config.profile_name.clone(),
        std::process::id(),
    )?;

    let state = Arc::new(BridgeState {
        session_name: config.session_name.clone(),
        secrets,
        registry,
        auth,
        profile_name: config.profile_name.clone(),
        server_config: RwLock::new(server_config),
        upstream: RwLock::new(upstream),
        epoch: AtomicU64::new(0),
        notify_tx,
        upstream_gone_tx,
        shutdown: CancellationToken::new(),
        expired: AtomicBool::new(false),
        connections: AtomicUsize::new(0),
        conn_changed: Notify::new(),
        tracker: TaskTracker::new(),
        conn_tracker: TaskTracker::new(),
        idle_timeout: config
            .idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT),
    });

    spawn_signal_handlers(state.shutdown.clone());
    on_ready();
    info!(target: "bridge", session = %state.session_name, "accepting connections");

    loop {
        let idle = idle_watch(state.clone());
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    state.conn_tracker.spawn(handle_connection(state.clone(), stream));
                }
                Err(err) => {
                    if state.shutdown.is_cancelled() {
                        break;
                    }
                    warn!(target: "bridge", error = %err, "accept failed");
                }
            },
            _ = state.shutdown.cancelled() => break,
            Some(epoch) = upstream_gone_rx.recv() => {
                if epoch == state.epoch.load(Ordering::SeqCst)
                    && !state.shutdown.is_cancelled()
                {
                    warn!(
                        target: "bridge",
                        session = %state.session_name,
                        "upstream mcp connection is gone; marking session expired"
                    );
                    state.expired.store(true, Ordering::SeqCst);
                    state.shutdown.cancel();
                    break;
                }
            }
            _ = idle => {
                info!(
                    target: "bridge",
                    session = %state.session_name,
                    idle_secs = state.idle_timeout.as_secs(),
                    "idle timeout reached"
                );
                state.shutdown.cancel();
                break;
            }
        }
    }

    drop(listener);
    finalize(state, &socket_path).await
}

/// Resolves when the bridge has had zero connections for the idle timeout.
async fn idle_watch(state: Arc<BridgeState>) {
    loop {
        if state.connections.load(Ordering::SeqCst) == 0 {
            tokio::select! {
                _ = tokio::time::sleep(state.idle_timeout) => return,
                _ = state.conn_changed.notified() => {}
            }
        } else {
            state.conn_changed.notified().await;
        }
    }
}

async fn finalize(state: Arc<BridgeState>, socket_path: &Path) -> Result<()> {
    // Connection tasks finish once their read loop has observed the shutdown
    // and their writer has flushed any responses the drained requests queued.
    state.tracker.close();
    state.conn_tracker.close();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        state.tracker.wait().await;
        state.conn_tracker.wait().await;
    })
    .await;
    if drained.is_err() {
        warn!(target: "bridge", "in-flight requests did not drain in time");
    }
    state.upstream.read().await.cancel.cancel();
    #[cfg(unix)]
    let _ = std::fs::remove_file(socket_path);
    #[cfg(windows)]
    let _ = socket_path;
    if state.expired.load(Ordering::SeqCst) {
        if let Err(err) = state.registry.mark_expired(&state.session_name) {
            warn!(target: "bridge", error = %err, "failed to record expired status");
        }
    }
    info!(target: "bridge", session = %state.session_name, "bridge stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handlers(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(target: "bridge", error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    warn!(target: "bridge", error = %err, "failed to wait for ctrl_c");
                }
            }
        }
        shutdown.cancel();
    });
}

#[cfg(windows)]
fn spawn_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
}

/// Remove a stale socket file, but only after proving no live bridge owns it.
#[cfg(unix)]
fn prepare_socket_path(
    registry: &SessionRegistry,
    session_name: &str,
    path: &Path,
) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let owner = registry.get(session_name)?.and_then(|r| r.pid);
    if let Some(pid) = owner
        && pid != std::process::id()
        && is_process_alive(pid)
    {
        return Err(Error::transport(format!(
            "a live bridge (pid {pid}) already owns {}",
            path.display()
        )));
    }
    std::fs::remove_file(path)
        .map_err(|e| Error::transport(format!("remove stale socket {}: {e}", path.display())))?;
    info!(target: "bridge", socket = %path.display(), "removed stale socket");
    Ok(())
}

async fn connect_upstream(
    server_config: &ServerConfig,
    auth: &AuthCoordinator,
    notify_tx: &broadcast::Sender<IpcNotification>,
    epoch: u64,
    gone_tx: &mpsc::UnboundedSender<u64>,
) -> Result<Upstream> {
    let service = UpstreamEvents { notify_tx: notify_tx.clone() };
    let running = transport::connect_upstream(server_config, auth.manager(), service).await?;
    let peer = running.peer().clone();
    let details = snapshot_details(&peer);
    let running_cancel = running.cancellation_token();
    let cancel = CancellationToken::new();
    {
        let cancel_child = cancel.clone();
        tokio::spawn(async move {
            cancel_child.cancelled().await;
            running_cancel.cancel();
        });
    }
    let gone = gone_tx.clone();
    tokio::spawn(async move {
        let _ = running.waiting().await;
        let _ = gone.send(epoch);
    });
    Ok(Upstream { peer, cancel, details })
}

fn snapshot_details(peer: &Peer<RoleClient>) -> ServerDetails {
    match peer.peer_info() {
        Some(info) => ServerDetails {
            server_info: serde_json::to_value(&info.server_info).unwrap_or(Value::Null),
            capabilities: serde_json::to_value(&info.capabilities).unwrap_or(Value::Null),
            instructions: info.instructions.clone(),
            protocol_version: info.protocol_version.to_string(),
        },
        None => ServerDetails::default(),
    }
}

async fn handle_connection<S>(state: Arc<BridgeState>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    state.connections.fetch_add(1, Ordering::SeqCst);
    state.conn_changed.notify_waiters();
    debug!(target: "bridge", session = %state.session_name, "client connected");

    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<IpcMessage>(CONNECTION_CHANNEL_CAPACITY);

    // One writer per connection serializes responses and notifications.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &msg).await {
                if !is_ignorable_shutdown_error(&err.to_string()) {
                    debug!(target: "bridge", error = %err, "failed to write to client");
                }
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Clients joining later never see historical notifications: the
    // subscription starts here.
    let fanout = tokio::spawn(notification_fanout(
        state.notify_tx.subscribe(),
        tx.clone(),
    ));

    loop {
        tokio::select! {
            frame = read_frame(&mut read_half) => match frame {
                Ok(Some(IpcMessage::Request { id, method, params })) => {
                    let state = state.clone();
                    let tx = tx.clone();
                    self_tracked_request(state, tx, id, method, params);
                }
                Ok(Some(IpcMessage::Shutdown)) => {
                    info!(target: "bridge", session = %state.session_name, "shutdown requested");
                    state.shutdown.cancel();
                }
                Ok(Some(IpcMessage::SetAuthCredentials { headers, refresh_token })) => {
                    let state = state.clone();
                    state.tracker.clone().spawn(async move {
                        apply_credentials(state, headers, refresh_token).await;
                    });
                }
                Ok(Some(other)) => {
                    debug!(target: "bridge", message = ?other, "ignoring unexpected client message");
                }
                Ok(None) => break,
                Err(err) => {
                    if !is_ignorable_shutdown_error(&err.to_string()) {
                        debug!(target: "bridge", error = %err, "client read failed");
                    }
                    break;
                }
            },
            _ = state.shutdown.cancelled() => break,
        }
    }

    fanout.abort();
    drop(tx);
    let _ = writer.await;
    state.connections.fetch_sub(1, Ordering::SeqCst);
    state.conn_changed.notify_waiters();
    debug!(target: "bridge", session = %state.session_name, "client disconnected");
}

fn self_tracked_request(
    state: Arc<BridgeState>,
    tx: mpsc::Sender<IpcMessage>,
    id: u64,
    method: String,
    params: Option<Value>,
) {
    let tracker = state.tracker.clone();
    tracker.spawn(async move {
        let outcome = dispatch(&state, &method, params).await;
        let message = match outcome {
            Ok(result) => IpcMessage::Response { id, result: Some(result), error: None },
            Err(err) => {
                debug!(target: "bridge", method = %method, error = %err, "request failed");
                IpcMessage::Response {
                    id,
                    result: None,
                    error: Some(IpcError::from_error(&err)),
                }
            }
        };
        // The client may already be gone during shutdown; that race is fine.
        let _ = tx.send(message).await;
    });
}

async fn notification_fanout(
    mut rx: broadcast::Receiver<IpcNotification>,
    tx: mpsc::Sender<IpcMessage>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if tx
                    .send(IpcMessage::Notification { notification })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "bridge", skipped, "notification fan-out lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn dispatch(state: &Arc<BridgeState>, method: &str, params: Option<Value>) -> Result<Value> {
    if method == "getServerDetails" {
        let upstream = state.upstream.read().await;
        return serde_json::to_value(&upstream.details)
            .map_err(|e| Error::client(format!("encode server details: {e}")));
    }

    let wire_method = mcp_method(method)
        .ok_or_else(|| Error::client(format!("unknown method `{method}`")))?;

    // Consult the token manager before every upstream call so auth failures
    // keep their kind (and their re-login command) instead of surfacing as
    // opaque transport errors from inside the HTTP stack.
    if let Some(manager) = state.auth.manager() {
        manager.get_valid_access_token().await?;
    }

    let mut body = serde_json::Map::new();
    body.insert("method".to_string(), Value::String(wire_method.to_string()));
    if let Some(params) = params {
        body.insert("params".to_string(), params);
    }
    let request: ClientRequest = serde_json::from_value(Value::Object(body))
        .map_err(|e| Error::client(format!("invalid params for `{method}`: {e}")))?;

    let (peer, timeout) = {
        let upstream = state.upstream.read().await;
        let config = state.server_config.read().await;
        (upstream.peer.clone(), config.request_timeout())
    };

    let result = tokio::time::timeout(timeout, peer.send_request(request))
        .await
        .map_err(|_| Error::transport(format!("request `{method}` to upstream timed out")))?
        .map_err(map_service_error)?;
    serde_json::to_value(&result)
        .map_err(|e| Error::client(format!("encode result for `{method}`: {e}")))
}

/// `set-auth-credentials`: rotate the refresh token in place; a changed
/// header map is persisted and forces one upstream reconnect, since static
/// headers are baked into the HTTP client.
async fn apply_credentials(
    state: Arc<BridgeState>,
    headers: Option<HashMap<String, String>>,
    refresh_token: Option<String>,
) {
    if let Some(refresh_token) = refresh_token
        && let Some(manager) = state.auth.manager()
        && manager.current_refresh_token().await != refresh_token
    {
        manager.set_refresh_token(refresh_token.clone()).await;
        if let (Some(server_url), Some(profile)) = (
            state.server_config.read().await.url().map(str::to_owned),
            state.profile_name.clone(),
        ) {
            let update = load_token_info(state.secrets.as_ref(), &server_url, &profile)
                .and_then(|stored| match stored {
                    Some(mut info) => {
                        info.refresh_token = Some(refresh_token.clone());
                        save_token_info(state.secrets.as_ref(), &server_url, &profile, &info)
                    }
                    None => Ok(()),
                });
            if let Err(err) = update {
                warn!(target: "bridge", error = %err, "failed to persist rotated refresh token");
            }
        }
        info!(target: "bridge", session = %state.session_name, "refresh token updated");
    }

    let Some(headers) = headers else { return };
    let changed = {
        let current = state.server_config.read().await;
        match &*current {
            ServerConfig::Http { headers: existing, .. } => *existing != headers,
            ServerConfig::Stdio { .. } => false,
        }
    };
    if !changed {
        return;
    }
    if let Err(err) = save_session_headers(state.secrets.as_ref(), &state.session_name, &headers) {
        warn!(target: "bridge", error = %err, "failed to persist headers");
    }
    let redacted = state
        .server_config
        .read()
        .await
        .with_headers(headers.clone())
        .redacted();
    if let Err(err) = state
        .registry
        .update(&state.session_name, |record| record.server = redacted.clone())
    {
        warn!(target: "bridge", error = %err, "failed to update session record");
    }
    if let Err(err) = reconnect_with_headers(&state, headers).await {
        warn!(target: "bridge", error = %err, "reconnect with new headers failed");
    } else {
        info!(target: "bridge", session = %state.session_name, "reconnected with new headers");
    }
}

async fn reconnect_with_headers(
    state: &Arc<BridgeState>,
    headers: HashMap<String, String>,
) -> Result<()> {
    let epoch = state.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let new_config = state.server_config.read().await.with_headers(headers);
    let replacement = connect_upstream(
        &new_config,
        &state.auth,
        &state.notify_tx,
        epoch,
        &state.upstream_gone_tx,
    )
    .await?;
    {
        let mut upstream = state.upstream.write().await;
        let old = std::mem::replace(&mut *upstream, replacement);
        old.cancel.cancel();
    }
    *state.server_config.write().await = new_config;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_map_covers_the_ipc_surface() {
        for (ipc, wire) in [
            ("ping", "ping"),
            ("listTools", "tools/list"),
            ("callTool", "tools/call"),
            ("listResources", "resources/list"),
            ("listResourceTemplates", "resources/templates/list"),
            ("readResource", "resources/read"),
            ("subscribeResource", "resources/subscribe"),
            ("unsubscribeResource", "resources/unsubscribe"),
            ("listPrompts", "prompts/list"),
            ("getPrompt", "prompts/get"),
            ("setLoggingLevel", "logging/setLevel"),
        ] {
            assert_eq!(mcp_method(ipc), Some(wire));
        }
        assert_eq!(mcp_method("initialize"), None);
        assert_eq!(mcp_method("getServerDetails"), None, "served from cache");
    }

    #[test]
    fn bridge_config_uses_camel_case_on_the_wire() {
        let config = BridgeConfig {
            session_name: "@work".into(),
            server_config: ServerConfig::Http {
                url: "https://srv.example".into(),
                headers: HashMap::new(),
                timeout: None,
            },
            headers: None,
            profile_name: Some("default".into()),
            verbose: true,
            idle_timeout_secs: Some(60),
        };
        let raw = serde_json::to_value(&config).unwrap();
        assert_eq!(raw["sessionName"], "@work");
        assert_eq!(raw["profileName"], "default");
        assert_eq!(raw["idleTimeoutSecs"], 60);
        assert_eq!(raw["serverConfig"]["url"], "https://srv.example");
        let parsed: BridgeConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed, config);
    }

    #[cfg(unix)]
    #[test]
    fn stale_socket_files_are_removed_only_without_a_live_owner() {
        use crate::secrets::MemorySecretStore;
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mcpc-bridge-sock-{}-{stamp}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let home = McpcHome::from_root(&dir);
        home.ensure_layout().unwrap();
        let registry = SessionRegistry::new(home.clone());
        let secrets = MemorySecretStore::new();
        registry
            .create(
                &secrets,
                "@s",
                ServerConfig::Http {
                    url: "https://srv.example".into(),
                    headers: HashMap::new(),
                    timeout: None,
                },
                None,
            )
            .unwrap();

        let socket = home.socket_path("@s");
        std::fs::write(&socket, b"").unwrap();

        // No recorded pid: the file is stale and gets removed.
        prepare_socket_path(&registry, "@s", &socket).unwrap();
        assert!(!socket.exists());

        // A live foreign owner blocks the second bridge.
        std::fs::write(&socket, b"").unwrap();
        registry
            .update("@s", |r| r.pid = Some(std::process::id()))
            .unwrap();
        // Fake "another process" by treating our own (alive) pid as the owner
        // from a different daemon: the guard must refuse.
        let our_pid_is_not_us = {
            // prepare_socket_path exempts our own pid, so point the record at
            // the parent process instead, which is alive as well.
            let ppid = unsafe { libc::getppid() } as u32;
            registry.update("@s", |r| r.pid = Some(ppid)).unwrap();
            prepare_socket_path(&registry, "@s", &socket)
        };
        assert!(our_pid_is_not_us.is_err());
        assert!(socket.exists());
    }
}
