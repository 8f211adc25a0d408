//! End-to-end bridge lifecycle: a real `mcpc-bridge` daemon is spawned
//! against an in-process MCP server and driven through the session client.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rmcp::model as mcp;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};

use mcpc::manager::{self, BRIDGE_BIN_ENV};
use mcpc::paths::McpcHome;
use mcpc::registry::{SessionRegistry, is_process_alive};
use mcpc::secrets::{MemorySecretStore, SecretStore};
use mcpc::session::{McpClientApi, SessionClient};
use mcpc::transport::ServerConfig;

#[derive(Clone)]
struct Upstream;

impl rmcp::handler::server::ServerHandler for Upstream {
    fn get_info(&self) -> mcp::ServerInfo {
        mcp::ServerInfo {
            protocol_version: mcp::ProtocolVersion::V_2025_03_26,
            capabilities: mcp::ServerCapabilities::builder().enable_tools().build(),
            server_info: mcp::Implementation {
                name: "upstream-under-test".into(),
                title: None,
                version: "0.0.1".into(),
                icons: None,
                website_url: None,
            },
            instructions: Some("test server".into()),
        }
    }

    fn list_tools(
        &self,
        _request: Option<mcp::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl core::future::Future<Output = Result<mcp::ListToolsResult, mcp::ErrorData>> + Send + '_
    {
        let schema: mcp::JsonObject = Default::default();
        std::future::ready(Ok(mcp::ListToolsResult {
            tools: vec![mcp::Tool::new("echo", "echo", schema)],
            next_cursor: None,
        }))
    }
}

/// Bind the upstream MCP server on a loopback port, or `None` where the
/// sandbox forbids binding sockets.
async fn start_upstream() -> Option<String> {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping test: {err}");
            return None;
        }
        Err(err) => panic!("failed to bind upstream listener: {err}"),
    };
    let addr = listener.local_addr().unwrap();
    let service: StreamableHttpService<Upstream, LocalSessionManager> =
        StreamableHttpService::new(
            || Ok(Upstream),
            Default::default(),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(Duration::from_secs(15)),
            },
        );
    let router = axum::Router::new().nest_service("/mcp", service);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Some(format!("http://{addr}/mcp"))
}

struct TestEnv {
    home: McpcHome,
    registry: SessionRegistry,
    secrets: Arc<dyn SecretStore>,
}

impl TestEnv {
    fn new(tag: &str) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "mcpc-e2e-{tag}-{}-{stamp}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        unsafe { std::env::set_var(BRIDGE_BIN_ENV, env!("CARGO_BIN_EXE_mcpc-bridge")) };
        let home = McpcHome::from_root(dir);
        let registry = SessionRegistry::new(home.clone());
        Self {
            home,
            registry,
            secrets: Arc::new(MemorySecretStore::new()),
        }
    }

    fn create_session(&self, name: &str, url: &str) {
        self.registry
            .create(
                self.secrets.as_ref(),
                name,
                ServerConfig::Http {
                    url: url.into(),
                    headers: HashMap::new(),
                    timeout: Some(10),
                },
                None,
            )
            .unwrap();
    }

    async fn stop(&self, name: &str) {
        let _ = manager::stop_bridge(&self.home, &self.registry, name).await;
    }
}

fn socket_mode(path: &PathBuf) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn connect_ping_and_registry_state() {
    let Some(url) = start_upstream().await else { return };
    let env = TestEnv::new("happy");
    env.create_session("@s", &url);

    let client = SessionClient::connect(env.home.clone(), env.secrets.clone(), "@s")
        .await
        .expect("bridge comes up");

    // Ping within the 2 second contract.
    tokio::time::timeout(Duration::from_secs(2), client.ping())
        .await
        .expect("ping deadline")
        .expect("ping succeeds");

    let record = env.registry.get("@s").unwrap().unwrap();
    let pid = record.pid.expect("bridge pid recorded");
    assert!(is_process_alive(pid));

    let socket = env.home.socket_path("@s");
    assert!(socket.exists());
    assert_eq!(socket_mode(&socket), 0o600, "socket must be owner-only");

    let details = client.get_server_details().await.unwrap();
    assert_eq!(details.server_info["name"], "upstream-under-test");
    assert!(!details.protocol_version.is_empty());

    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools["tools"][0]["name"], "echo");

    // An upstream MCP error propagates as a server error and must not
    // trigger the transport-recovery restart.
    let err = client
        .call_tool(serde_json::json!({ "name": "no-such-tool", "arguments": {} }))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 2, "mcp errors keep their kind: {err:?}");
    assert_eq!(
        env.registry.get("@s").unwrap().unwrap().pid,
        Some(pid),
        "server errors are propagated, not retried via restart"
    );

    // Unknown IPC methods are client errors, straight from the bridge.
    let raw = mcpc::ipc::BridgeClient::connect(&socket, None, Duration::from_secs(5))
        .await
        .unwrap();
    let err = raw.request("bogusMethod", None).await.unwrap_err();
    assert_eq!(err.exit_code(), 1, "unknown method is a client error: {err:?}");

    env.stop("@s").await;
    assert!(!env.home.socket_path("@s").exists());
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn killed_bridge_is_restarted_exactly_once_by_the_next_call() {
    let Some(url) = start_upstream().await else { return };
    let env = TestEnv::new("crash");
    env.create_session("@s", &url);

    let client = SessionClient::connect(env.home.clone(), env.secrets.clone(), "@s")
        .await
        .unwrap();
    client.ping().await.unwrap();
    let old_pid = env.registry.get("@s").unwrap().unwrap().pid.unwrap();

    unsafe { libc::kill(old_pid as libc::pid_t, libc::SIGKILL) };
    // Wait for the kill to land.
    for _ in 0..50 {
        if !is_process_alive(old_pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!is_process_alive(old_pid), "SIGKILL must have landed");

    // The next request observes the dead bridge, restarts it and succeeds.
    let tools = client.list_tools(None).await.expect("recovered call");
    assert_eq!(tools["tools"][0]["name"], "echo");

    let new_pid = env.registry.get("@s").unwrap().unwrap().pid.unwrap();
    assert_ne!(new_pid, old_pid, "a fresh bridge took over");
    assert!(is_process_alive(new_pid));

    env.stop("@s").await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial_test::serial]
async fn stop_bridge_twice_equals_once() {
    let Some(url) = start_upstream().await else { return };
    let env = TestEnv::new("stop");
    env.create_session("@s", &url);

    let client = SessionClient::connect(env.home.clone(), env.secrets.clone(), "@s")
        .await
        .unwrap();
    client.ping().await.unwrap();
    let pid = env.registry.get("@s").unwrap().unwrap().pid.unwrap();

    manager::stop_bridge(&env.home, &env.registry, "@s")
        .await
        .unwrap();
    assert!(!env.home.socket_path("@s").exists());
    for _ in 0..50 {
        if !is_process_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!is_process_alive(pid), "bridge exits on shutdown");

    // Second stop: nothing to do, no error.
    manager::stop_bridge(&env.home, &env.registry, "@s")
        .await
        .unwrap();
}
