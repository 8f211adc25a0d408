//! Token manager behavior against a canned HTTP token endpoint: discovery
//! fallback, refresh + rotation, failure taxonomy, and the single-flight
//! guarantee under concurrency.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use mcpc::Error;
use mcpc::oauth::{OAuthTokenManager, OAuthTokenManagerParams};
use mcpc::paths::McpcHome;
use mcpc::profiles::{self, AuthProfile, TokenInfo};
use mcpc::secrets::{MemorySecretStore, SecretStore};

/// What the stub token endpoint should do with refresh POSTs.
#[derive(Clone, Copy, PartialEq)]
enum TokenBehavior {
    Grant,
    Reject400,
    Fail500,
}

struct Stub {
    base_url: String,
    posts: Arc<AtomicUsize>,
}

/// Minimal HTTP/1.1 responder: discovery documents on the two well-known
/// paths, a token endpoint at `/token`. `primary_discovery = false` 404s the
/// oauth-authorization-server path so the OIDC fallback has to kick in.
async fn start_stub(primary_discovery: bool, behavior: TokenBehavior, token_delay: Duration) -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind token stub");
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");
    let posts = Arc::new(AtomicUsize::new(0));

    let stub_posts = posts.clone();
    let stub_base = base_url.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let posts = stub_posts.clone();
            let base = stub_base.clone();
            tokio::spawn(async move {
                let Some((method, path)) = read_request(&mut stream).await else {
                    return;
                };
                let (status, body) = match (method.as_str(), path.as_str()) {
                    ("GET", "/.well-known/oauth-authorization-server") if primary_discovery => {
                        discovery_doc(&base)
                    }
                    ("GET", "/.well-known/oauth-authorization-server") => {
                        ("404 Not Found", String::from("{}"))
                    }
                    ("GET", "/.well-known/openid-configuration") => discovery_doc(&base),
                    ("POST", "/token") => {
                        posts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(token_delay).await;
                        match behavior {
                            TokenBehavior::Grant => (
                                "200 OK",
                                serde_json::json!({
                                    "access_token": "at-fresh",
                                    "token_type": "Bearer",
                                    "expires_in": 3600,
                                    "refresh_token": "rt-rotated",
                                })
                                .to_string(),
                            ),
                            TokenBehavior::Reject400 => (
                                "400 Bad Request",
                                serde_json::json!({ "error": "invalid_grant" }).to_string(),
                            ),
                            TokenBehavior::Fail500 => (
                                "500 Internal Server Error",
                                String::from("{}"),
                            ),
                        }
                    }
                    _ => ("404 Not Found", String::from("{}")),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    Stub { base_url, posts }
}

fn discovery_doc(base: &str) -> (&'static str, String) {
    (
        "200 OK",
        serde_json::json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
        })
        .to_string(),
    )
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body_len = buf.len() - header_end - 4;
    while body_len < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body_len += n;
    }
    let mut request_line = head.lines().next()?.split_whitespace();
    Some((
        request_line.next()?.to_string(),
        request_line.next()?.to_string(),
    ))
}

fn expired_manager(stub: &Stub, on_refresh: Option<mcpc::oauth::OnRefresh>) -> OAuthTokenManager {
    OAuthTokenManager::new(OAuthTokenManagerParams {
        server_url: stub.base_url.clone(),
        profile_name: Some("default".into()),
        client_id: "cid".into(),
        refresh_token: "rt-initial".into(),
        access_token: Some("at-stale".into()),
        access_token_expires_at: Some(chrono::Utc::now().timestamp() - 10),
        on_refresh,
    })
}

#[tokio::test]
async fn refresh_rotates_tokens_and_persists_before_returning() {
    let stub = start_stub(true, TokenBehavior::Grant, Duration::ZERO).await;
    let persisted: Arc<std::sync::Mutex<Option<TokenInfo>>> = Arc::default();
    let sink = persisted.clone();
    let manager = expired_manager(
        &stub,
        Some(Box::new(move |info: &TokenInfo| {
            *sink.lock().unwrap() = Some(info.clone());
            Ok(())
        })),
    );

    assert!(manager.is_expired().await);
    let token = manager.get_valid_access_token().await.unwrap();
    assert_eq!(token, "at-fresh");
    assert!(!manager.is_expired().await, "fresh token must not be expired");
    assert_eq!(manager.current_refresh_token().await, "rt-rotated");

    // The rotated refresh token was handed to the persistence callback
    // together with the new access token, not after it.
    let saved = persisted.lock().unwrap().clone().expect("on_refresh ran");
    assert_eq!(saved.access_token, "at-fresh");
    assert_eq!(saved.refresh_token.as_deref(), Some("rt-rotated"));
    assert!(saved.expires_at.unwrap() > chrono::Utc::now().timestamp());
}

#[tokio::test]
async fn discovery_falls_back_to_openid_configuration() {
    let stub = start_stub(false, TokenBehavior::Grant, Duration::ZERO).await;
    let manager = expired_manager(&stub, None);
    let token = manager.get_valid_access_token().await.unwrap();
    assert_eq!(token, "at-fresh");
}

#[tokio::test]
async fn http_400_is_a_recoverable_auth_error_with_a_login_command() {
    let stub = start_stub(true, TokenBehavior::Reject400, Duration::ZERO).await;
    let manager = expired_manager(&stub, None);
    let err = manager.get_valid_access_token().await.unwrap_err();
    match &err {
        Error::Auth { message, command } => {
            assert!(message.contains("refresh token invalid or expired"));
            let command = command.as_deref().expect("auth errors carry a command");
            assert!(command.starts_with("login "));
            assert!(command.contains("--profile default"));
        }
        other => panic!("expected auth error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 4);
    assert_eq!(stub.posts.load(Ordering::SeqCst), 1, "no silent retry");
}

#[tokio::test]
async fn other_http_failures_are_transport_errors() {
    let stub = start_stub(true, TokenBehavior::Fail500, Duration::ZERO).await;
    let manager = expired_manager(&stub, None);
    let err = manager.get_valid_access_token().await.unwrap_err();
    assert!(err.is_transport(), "got {err:?}");
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn ten_concurrent_callers_trigger_exactly_one_refresh() {
    // A slow token endpoint widens the race window.
    let stub = start_stub(true, TokenBehavior::Grant, Duration::from_millis(150)).await;
    let manager = Arc::new(expired_manager(&stub, None));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.get_valid_access_token().await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "at-fresh");
    }
    assert_eq!(
        stub.posts.load(Ordering::SeqCst),
        1,
        "concurrent refreshes must coalesce into one POST"
    );
}

#[tokio::test]
async fn bridge_style_on_refresh_updates_keychain_and_profile() {
    let stub = start_stub(true, TokenBehavior::Grant, Duration::ZERO).await;
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("mcpc-oauth-{}-{stamp}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let home = McpcHome::from_root(dir);
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    profiles::save_auth_profile(&home, &AuthProfile::new("default", &stub.base_url)).unwrap();

    let on_refresh: mcpc::oauth::OnRefresh = {
        let secrets = secrets.clone();
        let home = home.clone();
        let url = stub.base_url.clone();
        Box::new(move |info: &TokenInfo| {
            profiles::save_token_info(secrets.as_ref(), &url, "default", info)?;
            profiles::stamp_refreshed_at(&home, &url, "default")?;
            Ok(())
        })
    };
    let manager = expired_manager(&stub, Some(on_refresh));
    manager.get_valid_access_token().await.unwrap();

    let tokens = profiles::load_token_info(secrets.as_ref(), &stub.base_url, "default")
        .unwrap()
        .expect("tokens persisted to the keychain");
    assert_eq!(tokens.access_token, "at-fresh");
    assert_eq!(tokens.refresh_token.as_deref(), Some("rt-rotated"));

    let profile = profiles::load_auth_profile(&home, &stub.base_url, "default")
        .unwrap()
        .unwrap();
    assert!(profile.refreshed_at.is_some(), "refreshedAt stamped");
}
