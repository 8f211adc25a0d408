//! `ServerConfig` and the transport factory that turns one into a running
//! rmcp client. Exactly one of `command`/`url` is present; the enum makes the
//! invalid states unrepresentable and serde enforces the boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use rmcp::serve_client;
use rmcp::service::{RoleClient, RunningService, Service};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClient, StreamableHttpClientTransportConfig, StreamableHttpError,
    StreamableHttpPostResponse,
};
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::redact_headers;
use crate::oauth::OAuthTokenManager;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "RawServerConfig")]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
}

/// Flat shape that enforces exactly-one-of `command`/`url` at the
/// deserialization boundary, before a config can reach disk or a bridge.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawServerConfig {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    timeout: Option<u64>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = String;

    fn try_from(raw: RawServerConfig) -> std::result::Result<Self, Self::Error> {
        match (raw.command, raw.url) {
            (Some(command), None) => {
                if !raw.headers.is_empty() || raw.timeout.is_some() {
                    return Err("headers and timeout only apply to url servers".into());
                }
                Ok(ServerConfig::Stdio { command, args: raw.args, env: raw.env })
            }
            (None, Some(url)) => {
                if !raw.args.is_empty() || !raw.env.is_empty() {
                    return Err("args and env only apply to command servers".into());
                }
                Ok(ServerConfig::Http { url, headers: raw.headers, timeout: raw.timeout })
            }
            (Some(_), Some(_)) => Err("server config has both command and url".into()),
            (None, None) => Err("server config needs either command or url".into()),
        }
    }
}

impl ServerConfig {
    /// Validate and normalize at the boundary, before anything is persisted.
    pub fn validated(self) -> Result<Self> {
        match self {
            ServerConfig::Stdio { command, args, env } => {
                if command.trim().is_empty() {
                    return Err(Error::client("server config: command must not be empty"));
                }
                Ok(ServerConfig::Stdio { command, args, env })
            }
            ServerConfig::Http { url, headers, timeout } => Ok(ServerConfig::Http {
                url: normalize_server_url(&url)?,
                headers,
                timeout,
            }),
        }
    }

    /// Per-request deadline, from `timeout` (seconds) for HTTP servers.
    pub fn request_timeout(&self) -> Duration {
        let secs = match self {
            ServerConfig::Http { timeout: Some(t), .. } => *t,
            _ => DEFAULT_REQUEST_TIMEOUT_SECS,
        };
        Duration::from_secs(secs)
    }

    /// Copy safe to write to disk or logs: sensitive header values replaced.
    pub fn redacted(&self) -> Self {
        match self {
            ServerConfig::Http { url, headers, timeout } => ServerConfig::Http {
                url: url.clone(),
                headers: redact_headers(headers),
                timeout: *timeout,
            },
            stdio => stdio.clone(),
        }
    }

    /// Same config with the header map swapped out (used when real values
    /// come from the keychain rather than the registry's redacted copy).
    pub fn with_headers(&self, headers: HashMap<String, String>) -> Self {
        match self {
            ServerConfig::Http { url, timeout, .. } => ServerConfig::Http {
                url: url.clone(),
                headers,
                timeout: *timeout,
            },
            stdio => stdio.clone(),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ServerConfig::Http { url, .. } => Some(url),
            ServerConfig::Stdio { .. } => None,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            ServerConfig::Http { url, .. } => url,
            ServerConfig::Stdio { command, .. } => command,
        }
    }
}

/// Lowercased host, userinfo and fragment stripped, trailing `/` removed when
/// the path is empty. Only `http:`/`https:` schemes are accepted.
pub fn normalize_server_url(raw: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(raw)
        .map_err(|e| Error::client(format!("invalid server url `{raw}`: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::client(format!(
            "invalid server url `{raw}`: scheme must be http or https"
        )));
    }
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);
    let mut out = url.to_string();
    if url.path() == "/" && url.query().is_none() && out.ends_with('/') {
        out.pop();
    }
    Ok(out)
}

/// Connect an rmcp client for `config`, handing upstream traffic to
/// `service`. For HTTP servers an OAuth manager, when present, decorates
/// every request with a freshly validated bearer token.
pub async fn connect_upstream<S>(
    config: &ServerConfig,
    auth: Option<Arc<OAuthTokenManager>>,
    service: S,
) -> Result<RunningService<RoleClient, S>>
where
    S: Service<RoleClient> + Send + 'static,
{
    match config {
        ServerConfig::Stdio { command, args, env } => {
            let mut cmd = tokio::process::Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }
            let transport = TokioChildProcess::new(cmd)
                .map_err(|e| Error::transport(format!("spawn `{command}`: {e}")))?;
            serve_client(service, transport)
                .await
                .map_err(|e| Error::transport(format!("connect mcp server `{command}`: {e}")))
        }
        ServerConfig::Http { url, headers, .. } => {
            let client = build_http_client(headers)?;
            let transport_config = StreamableHttpClientTransportConfig::with_uri(url.clone());
            match auth {
                Some(manager) => {
                    let client = AuthorizedHttpClient::new(client, manager);
                    let transport =
                        StreamableHttpClientTransport::with_client(client, transport_config);
                    serve_client(service, transport)
                        .await
                        .map_err(|e| Error::transport(format!("connect mcp server `{url}`: {e}")))
                }
                None => {
                    let transport =
                        StreamableHttpClientTransport::with_client(client, transport_config);
                    serve_client(service, transport)
                        .await
                        .map_err(|e| Error::transport(format!("connect mcp server `{url}`: {e}")))
                }
            }
        }
    }
}

fn build_http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| Error::client(format!("invalid header name {k}: {e}")))?;
        let mut value = reqwest::header::HeaderValue::from_str(v)
            .map_err(|e| Error::client(format!("invalid header value for {k}: {e}")))?;
        if crate::logging::is_sensitive_header(k) {
            value.set_sensitive(true);
        }
        map.insert(name, value);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| Error::transport(format!("http client build: {e}")))
}

#[derive(Debug)]
pub enum AuthHttpError {
    Http(reqwest::Error),
    Auth(Error),
}

impl std::fmt::Display for AuthHttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "http error: {e}"),
            Self::Auth(e) => write!(f, "auth error: {e}"),
        }
    }
}

impl std::error::Error for AuthHttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e),
            Self::Auth(e) => Some(e),
        }
    }
}

/// HTTP client decorator that injects `Authorization: Bearer <token>` using
/// the token manager, refreshing through its single-flight path when the
/// cached token is expired.
#[derive(Clone)]
pub struct AuthorizedHttpClient {
    inner: reqwest::Client,
    manager: Arc<OAuthTokenManager>,
}

impl AuthorizedHttpClient {
    pub fn new(inner: reqwest::Client, manager: Arc<OAuthTokenManager>) -> Self {
        Self { inner, manager }
    }

    async fn bearer(&self) -> std::result::Result<String, StreamableHttpError<AuthHttpError>> {
        self.manager
            .get_valid_access_token()
            .await
            .map_err(|e| StreamableHttpError::Client(AuthHttpError::Auth(e)))
    }
}

fn convert_http_error(
    err: StreamableHttpError<reqwest::Error>,
) -> StreamableHttpError<AuthHttpError> {
    match err {
        StreamableHttpError::Client(e) => StreamableHttpError::Client(AuthHttpError::Http(e)),
        StreamableHttpError::AuthRequired(e) => StreamableHttpError::AuthRequired(e),
        StreamableHttpError::ServerDoesNotSupportSse => {
            StreamableHttpError::ServerDoesNotSupportSse
        }
        StreamableHttpError::UnexpectedContentType(ct) => {
            StreamableHttpError::UnexpectedContentType(ct)
        }
        StreamableHttpError::UnexpectedServerResponse(msg) => {
            StreamableHttpError::UnexpectedServerResponse(msg)
        }
        #[allow(unreachable_patterns)]
        other => StreamableHttpError::UnexpectedServerResponse(other.to_string().into()),
    }
}

impl StreamableHttpClient for AuthorizedHttpClient {
    type Error = AuthHttpError;

    async fn post_message(
        &self,
        uri: Arc<str>,
        message: rmcp::model::ClientJsonRpcMessage,
        session_id: Option<Arc<str>>,
        _auth_token: Option<String>,
    ) -> std::result::Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>> {
        let token = self.bearer().await?;
        <reqwest::Client as StreamableHttpClient>::post_message(
            &self.inner,
            uri,
            message,
            session_id,
            Some(token),
        )
        .await
        .map_err(convert_http_error)
    }

    async fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        _auth_token: Option<String>,
    ) -> std::result::Result<(), StreamableHttpError<Self::Error>> {
        let token = self.bearer().await?;
        <reqwest::Client as StreamableHttpClient>::delete_session(
            &self.inner,
            uri,
            session_id,
            Some(token),
        )
        .await
        .map_err(convert_http_error)
    }

    async fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: Arc<str>,
        last_event_id: Option<String>,
        _auth_token: Option<String>,
    ) -> std::result::Result<
        BoxStream<'static, std::result::Result<sse_stream::Sse, sse_stream::Error>>,
        StreamableHttpError<Self::Error>,
    > {
        let token = self.bearer().await?;
        <reqwest::Client as StreamableHttpClient>::get_stream(
            &self.inner,
            uri,
            session_id,
            last_event_id,
            Some(token),
        )
        .await
        .map_err(convert_http_error)
    }
}
