//! OAuth token manager for a bridge daemon.
//!
//! One manager serves one bridge. Concurrent callers that both observe an
//! expired token coalesce into a single refresh; independent bridges refresh
//! in parallel. The keychain stays the only durable home for tokens; the
//! manager's cache is process-local and handed back through `on_refresh` for
//! persistence.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::profiles::TokenInfo;

/// Tokens are treated as expired this long before their actual expiry.
pub const TOKEN_REFRESH_LEEWAY: Duration = Duration::from_secs(60);

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

const DISCOVERY_PATHS: &[&str] = &[
    "/.well-known/oauth-authorization-server",
    "/.well-known/openid-configuration",
];

pub type OnRefresh = Box<dyn Fn(&TokenInfo) -> Result<()> + Send + Sync>;

pub struct OAuthTokenManagerParams {
    pub server_url: String,
    pub profile_name: Option<String>,
    pub client_id: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<i64>,
    pub on_refresh: Option<OnRefresh>,
}

struct TokenCell {
    access_token: Option<String>,
    token_type: String,
    expires_at: Option<i64>,
    refresh_token: String,
    scope: Option<String>,
}

pub struct OAuthTokenManager {
    server_url: String,
    profile_name: Option<String>,
    client_id: String,
    http: reqwest::Client,
    tokens: Mutex<TokenCell>,
    // Serializes refreshes; losers of the race re-check and reuse the
    // winner's token instead of issuing a second POST.
    refresh_gate: Mutex<()>,
    on_refresh: Option<OnRefresh>,
}

#[derive(Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn expired(access_token: &Option<String>, expires_at: Option<i64>, now: i64) -> bool {
    if access_token.is_none() {
        return true;
    }
    match expires_at {
        Some(at) => now > at - TOKEN_REFRESH_LEEWAY.as_secs() as i64,
        None => false,
    }
}

impl OAuthTokenManager {
    pub fn new(params: OAuthTokenManagerParams) -> Self {
        Self {
            server_url: params.server_url,
            profile_name: params.profile_name,
            client_id: params.client_id,
            http: reqwest::Client::new(),
            tokens: Mutex::new(TokenCell {
                access_token: params.access_token,
                token_type: "Bearer".into(),
                expires_at: params.access_token_expires_at,
                refresh_token: params.refresh_token,
                scope: None,
            }),
            refresh_gate: Mutex::new(()),
            on_refresh: params.on_refresh,
        }
    }

    /// The exact command the user should run when silent refresh cannot help.
    pub fn reauth_command(&self) -> String {
        match &self.profile_name {
            Some(name) => format!("login {} --profile {name}", self.server_url),
            None => format!("login {}", self.server_url),
        }
    }

    /// True when there is no access token, or the 60-second buffer before
    /// `expires_at` has been entered.
    pub async fn is_expired(&self) -> bool {
        let cell = self.tokens.lock().await;
        expired(&cell.access_token, cell.expires_at, now_unix())
    }

    async fn cached_if_valid(&self) -> Option<String> {
        let cell = self.tokens.lock().await;
        if expired(&cell.access_token, cell.expires_at, now_unix()) {
            None
        } else {
            cell.access_token.clone()
        }
    }

    pub async fn current_refresh_token(&self) -> String {
        self.tokens.lock().await.refresh_token.clone()
    }

    /// Swap in a new refresh token (`set-auth-credentials` on a live bridge).
    /// The access token is dropped so the next request proves the new one.
    pub async fn set_refresh_token(&self, refresh_token: String) {
        let mut cell = self.tokens.lock().await;
        if cell.refresh_token != refresh_token {
            cell.refresh_token = refresh_token;
            cell.access_token = None;
            cell.expires_at = None;
        }
    }

    /// Return the cached token when still valid, otherwise refresh. Failures
    /// carry the re-authentication command for the user.
    pub async fn get_valid_access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_if_valid().await {
            return Ok(token);
        }
        let _gate = self.refresh_gate.lock().await;
        if let Some(token) = self.cached_if_valid().await {
            return Ok(token);
        }
        self.refresh().await
    }

    /// Discover the token endpoint, post the refresh grant and rotate state.
    /// HTTP 400/401 mean the refresh token itself is no longer usable; that
    /// is a recoverable auth error, never silently retried.
    async fn refresh(&self) -> Result<String> {
        let token_endpoint = self.discover_token_endpoint().await?;
        let refresh_token = self.current_refresh_token().await;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        let response = self
            .http
            .post(&token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::transport(format!("token refresh request: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(Error::auth(
                "refresh token invalid or expired",
                Some(self.reauth_command()),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("parse token response: {e}")))?;

        let expires_at = now_unix() + parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let info = {
            let mut cell = self.tokens.lock().await;
            cell.access_token = Some(parsed.access_token.clone());
            cell.token_type = parsed.token_type.unwrap_or_else(|| "Bearer".into());
            cell.expires_at = Some(expires_at);
            if let Some(rotated) = parsed.refresh_token {
                cell.refresh_token = rotated;
            }
            if parsed.scope.is_some() {
                cell.scope = parsed.scope;
            }
            TokenInfo {
                access_token: parsed.access_token.clone(),
                token_type: cell.token_type.clone(),
                expires_at: Some(expires_at),
                refresh_token: Some(cell.refresh_token.clone()),
                scope: cell.scope.clone(),
            }
        };

        if let Some(on_refresh) = &self.on_refresh
            && let Err(err) = on_refresh(&info)
        {
            tracing::warn!(target: "oauth", server = %self.server_url, error = %err,
                "failed to persist refreshed tokens");
        }

        tracing::debug!(target: "oauth", server = %self.server_url, "access token refreshed");
        Ok(parsed.access_token)
    }

    /// `${serverUrl}/.well-known/oauth-authorization-server`, then
    /// `${serverUrl}/.well-known/openid-configuration`; first document with a
    /// `token_endpoint` wins.
    async fn discover_token_endpoint(&self) -> Result<String> {
        let base = reqwest::Url::parse(&self.server_url)
            .map_err(|e| Error::client(format!("invalid server url {}: {e}", self.server_url)))?;
        for path in DISCOVERY_PATHS {
            let url = match base.join(path) {
                Ok(url) => url,
                Err(_) => continue,
            };
            let response = match self.http.get(url.clone()).send().await {
                Ok(r) => r,
                Err(err) => {
                    tracing::debug!(target: "oauth", url = %url, error = %err, "discovery failed");
                    continue;
                }
            };
            if !response.status().is_success() {
                continue;
            }
            if let Ok(doc) = response.json::<DiscoveryDocument>().await {
                return Ok(doc.token_endpoint);
            }
        }
        Err(Error::auth(
            format!("could not discover a token endpoint for {}", self.server_url),
            Some(self.reauth_command()),
        ))
    }
}
