//! CLI-side lifecycle of bridge daemons: spawn with a readiness handshake,
//! probe-and-reuse, graceful stop with escalation, and the single-attempt
//! restart used by the session client's recovery path.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::bridge::BridgeConfig;
use crate::error::{Error, Result};
use crate::ipc::BridgeClient;
use crate::paths::{self, McpcHome};
use crate::registry::{SessionRegistry, SessionStatus, is_process_alive, load_session_headers};
use crate::secrets::SecretStore;
use crate::transport::ServerConfig;

pub const READY_TOKEN: &str = "ready";
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const SIGKILL_GRACE: Duration = Duration::from_secs(3);

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Environment override for the bridge executable, used by tests and
/// unusual install layouts. Defaults to `mcpc-bridge` next to the current
/// executable.
pub const BRIDGE_BIN_ENV: &str = "MCPC_BRIDGE_BIN";

#[derive(Clone, Debug)]
pub struct BridgeOptions {
    pub session_name: String,
    pub server: ServerConfig,
    pub headers: Option<std::collections::HashMap<String, String>>,
    pub profile_name: Option<String>,
    pub verbose: bool,
    pub idle_timeout_secs: Option<u64>,
}

fn bridge_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(BRIDGE_BIN_ENV)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()
        .map_err(|e| Error::client(format!("locate current executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::client("current executable has no parent directory"))?;
    let name = if cfg!(windows) { "mcpc-bridge.exe" } else { "mcpc-bridge" };
    Ok(dir.join(name))
}

async fn probe(home: &McpcHome, session_name: &str, timeout: Duration) -> bool {
    let path = home.socket_path(session_name);
    match BridgeClient::connect(&path, None, timeout).await {
        Ok(client) => client.ping(timeout).await.is_ok(),
        Err(_) => false,
    }
}

/// Start the bridge for a session, or reuse a live one. Returns the bridge
/// PID. The child is fully detached: it survives this process exiting.
pub async fn start_bridge(
    home: &McpcHome,
    registry: &SessionRegistry,
    opts: &BridgeOptions,
) -> Result<u32> {
    paths::validate_session_name(&opts.session_name)?;
    home.ensure_layout()?;

    if probe(home, &opts.session_name, PROBE_TIMEOUT).await {
        if let Some(pid) = registry.get(&opts.session_name)?.and_then(|r| r.pid) {
            debug!(target: "bridge", session = %opts.session_name, pid, "reusing live bridge");
            return Ok(pid);
        }
        return Err(Error::transport(format!(
            "a bridge is serving {} but its pid is not recorded",
            opts.session_name
        )));
    }

    let log_path = home.bridge_log_path(&opts.session_name);
    let stderr_log = open_log_for_stderr(&log_path)?;

    let mut cmd = tokio::process::Command::new(bridge_binary()?);
    cmd.arg("--session")
        .arg(&opts.session_name)
        .env(paths::HOME_DIR_ENV, home.root())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(stderr_log)
        .kill_on_drop(false);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::transport(format!("spawn bridge: {e}")))?;

    let config = BridgeConfig {
        session_name: opts.session_name.clone(),
        server_config: opts.server.clone(),
        headers: opts.headers.clone(),
        profile_name: opts.profile_name.clone(),
        verbose: opts.verbose,
        idle_timeout_secs: opts.idle_timeout_secs,
    };
    let mut blob = serde_json::to_vec(&config)
        .map_err(|e| Error::client(format!("encode bridge config: {e}")))?;
    blob.push(b'\n');
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::transport("bridge stdin not captured"))?;
    stdin
        .write_all(&blob)
        .await
        .map_err(|e| Error::transport(format!("write bridge config: {e}")))?;
    drop(stdin);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::transport("bridge stdout not captured"))?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let readiness = tokio::time::timeout(READY_TIMEOUT, async {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim() == READY_TOKEN => Ok(()),
                Ok(Some(line)) => Err(Error::transport(format!(
                    "unexpected bridge handshake output: {line}"
                ))),
                Ok(None) => Err(Error::transport("bridge closed its handshake pipe")),
                Err(e) => Err(Error::transport(format!("read bridge handshake: {e}"))),
            },
            status = child.wait() => Err(Error::transport(match status {
                Ok(status) => format!("bridge exited during startup: {status}"),
                Err(e) => format!("bridge exited during startup: {e}"),
            })),
        }
    })
    .await;

    match readiness {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let _ = child.start_kill();
            return Err(err);
        }
        Err(_) => {
            let _ = child.start_kill();
            return Err(Error::transport(format!(
                "bridge for {} did not become ready within {}s",
                opts.session_name,
                READY_TIMEOUT.as_secs()
            )));
        }
    }

    let pid = child.id().unwrap_or_default();
    debug!(target: "bridge", session = %opts.session_name, pid, "bridge ready");
    Ok(pid)
}

fn open_log_for_stderr(path: &std::path::Path) -> Result<Stdio> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::client(format!("create {}: {e}", parent.display())))?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options
        .open(path)
        .map_err(|e| Error::client(format!("open {}: {e}", path.display())))?;
    Ok(Stdio::from(file))
}

/// Stop a session's bridge: graceful IPC shutdown first, then SIGTERM, then
/// SIGKILL. Safe to call when nothing is running; calling it twice is the
/// same as calling it once.
pub async fn stop_bridge(
    home: &McpcHome,
    registry: &SessionRegistry,
    session_name: &str,
) -> Result<()> {
    paths::validate_session_name(session_name)?;
    let socket = home.socket_path(session_name);
    let pid = registry.get(session_name)?.and_then(|r| r.pid);

    if let Ok(client) = BridgeClient::connect(&socket, None, PING_TIMEOUT).await {
        let _ = client.send_shutdown().await;
    }

    if let Some(pid) = pid
        && !wait_for_exit(pid, SHUTDOWN_GRACE).await
    {
        send_signal(pid, Signal::Term);
        if !wait_for_exit(pid, SIGKILL_GRACE).await {
            send_signal(pid, Signal::Kill);
        }
    }

    #[cfg(unix)]
    let _ = std::fs::remove_file(&socket);
    Ok(())
}

/// Make sure a live, pingable bridge backs the session and return its socket
/// path. A dead bridge gets exactly one restart attempt; a second failure
/// propagates to the caller.
pub async fn ensure_bridge_ready(
    home: &McpcHome,
    registry: &SessionRegistry,
    secrets: &dyn SecretStore,
    session_name: &str,
) -> Result<PathBuf> {
    let record = registry
        .get(session_name)?
        .ok_or_else(|| Error::client(format!("unknown session {session_name}")))?;
    if record.status == SessionStatus::Expired {
        return Err(Error::client(format!(
            "session {session_name} has expired; run `connect` again to re-establish it"
        )));
    }
    let socket = home.socket_path(session_name);
    if let Some(pid) = record.pid
        && is_process_alive(pid)
        && probe(home, session_name, PING_TIMEOUT).await
    {
        return Ok(socket);
    }
    restart_bridge(home, registry, secrets, session_name).await
}

/// `stop_bridge` followed by `start_bridge` with the stored session config
/// and freshly read credentials. One attempt only.
pub async fn restart_bridge(
    home: &McpcHome,
    registry: &SessionRegistry,
    secrets: &dyn SecretStore,
    session_name: &str,
) -> Result<PathBuf> {
    stop_bridge(home, registry, session_name).await?;
    let record = registry
        .get(session_name)?
        .ok_or_else(|| Error::client(format!("unknown session {session_name}")))?;
    let headers = load_session_headers(secrets, session_name)?;
    let opts = BridgeOptions {
        session_name: session_name.to_string(),
        server: record.server.clone(),
        headers,
        profile_name: record.profile_name.clone(),
        verbose: paths::verbose_enabled(),
        idle_timeout_secs: None,
    };
    start_bridge(home, registry, &opts).await?;
    Ok(home.socket_path(session_name))
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signum = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, signum);
    }
}

#[cfg(windows)]
fn send_signal(_pid: u32, _signal: Signal) {
    // The IPC shutdown message is the only lever on Windows.
}

async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
