//! IPC-backed MCP client for a named session.
//!
//! Every call is forwarded over the bridge socket. MCP-level errors (server
//! errors, auth errors) propagate as-is and are never retried; only a
//! transport failure triggers the one-shot recovery: restart the bridge,
//! reconnect, retry the operation exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bridge::ServerDetails;
use crate::error::{Error, Result};
use crate::ipc::{BridgeClient, NotificationHandler};
use crate::manager::{ensure_bridge_ready, restart_bridge};
use crate::paths::{McpcHome, validate_session_name};
use crate::registry::SessionRegistry;
use crate::secrets::SecretStore;

/// The capability set every MCP-facing client exposes, mirroring the methods
/// a bridge accepts. Parameters and results stay as JSON values; typed MCP
/// models live upstream of the bridge.
#[allow(async_fn_in_trait)]
pub trait McpClientApi {
    async fn ping(&self) -> Result<()>;
    async fn get_server_details(&self) -> Result<ServerDetails>;
    async fn list_tools(&self, params: Option<Value>) -> Result<Value>;
    async fn call_tool(&self, params: Value) -> Result<Value>;
    async fn list_resources(&self, params: Option<Value>) -> Result<Value>;
    async fn list_resource_templates(&self, params: Option<Value>) -> Result<Value>;
    async fn read_resource(&self, params: Value) -> Result<Value>;
    async fn subscribe_resource(&self, params: Value) -> Result<()>;
    async fn unsubscribe_resource(&self, params: Value) -> Result<()>;
    async fn list_prompts(&self, params: Option<Value>) -> Result<Value>;
    async fn get_prompt(&self, params: Value) -> Result<Value>;
    async fn set_logging_level(&self, params: Value) -> Result<()>;
}

pub struct SessionClient {
    home: McpcHome,
    registry: SessionRegistry,
    secrets: Arc<dyn SecretStore>,
    session_name: String,
    default_timeout: Duration,
    notification_handler: Option<NotificationHandler>,
    inner: tokio::sync::Mutex<Option<BridgeClient>>,
}

impl SessionClient {
    /// Attach to a session, starting or restarting its bridge when needed.
    pub async fn connect(
        home: McpcHome,
        secrets: Arc<dyn SecretStore>,
        session_name: &str,
    ) -> Result<Self> {
        Self::connect_with_notifications(home, secrets, session_name, None).await
    }

    pub async fn connect_with_notifications(
        home: McpcHome,
        secrets: Arc<dyn SecretStore>,
        session_name: &str,
        notification_handler: Option<NotificationHandler>,
    ) -> Result<Self> {
        validate_session_name(session_name)?;
        let registry = SessionRegistry::new(home.clone());
        let record = registry
            .get(session_name)?
            .ok_or_else(|| Error::client(format!("unknown session {session_name}")))?;
        let default_timeout = record.server.request_timeout();

        let client = Self {
            home,
            registry,
            secrets,
            session_name: session_name.to_string(),
            default_timeout,
            notification_handler,
            inner: tokio::sync::Mutex::new(None),
        };
        client.reconnect().await?;
        Ok(client)
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        // Drop the old connection first so its bridge-side slot is free.
        guard.take();
        let socket = ensure_bridge_ready(
            &self.home,
            &self.registry,
            self.secrets.as_ref(),
            &self.session_name,
        )
        .await?;
        let client = BridgeClient::connect(
            &socket,
            self.notification_handler.clone(),
            self.default_timeout,
        )
        .await?;
        *guard = Some(client);
        Ok(())
    }

    async fn current(&self) -> Result<BridgeClient> {
        self.inner
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::transport("not connected to a bridge"))
    }

    async fn call_once(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let client = self.current().await?;
        client.request(method, params).await
    }

    /// Forward one request, recovering exactly once from a transport error.
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match self.call_once(method, params.clone()).await {
            Err(err) if err.is_transport() => {
                tracing::debug!(
                    target: "session",
                    session = %self.session_name,
                    method,
                    error = %err,
                    "transport failure; restarting bridge once"
                );
                self.recover().await?;
                self.call_once(method, params).await
            }
            outcome => outcome,
        }
    }

    async fn recover(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.take();
        restart_bridge(
            &self.home,
            &self.registry,
            self.secrets.as_ref(),
            &self.session_name,
        )
        .await?;
        let socket = self.home.socket_path(&self.session_name);
        let client = BridgeClient::connect(
            &socket,
            self.notification_handler.clone(),
            self.default_timeout,
        )
        .await?;
        *guard = Some(client);
        Ok(())
    }

    /// Push updated credentials to the live bridge without a restart.
    pub async fn set_auth_credentials(
        &self,
        headers: Option<std::collections::HashMap<String, String>>,
        refresh_token: Option<String>,
    ) -> Result<()> {
        let client = self.current().await?;
        client.send_auth_credentials(headers, refresh_token).await
    }

    /// Ask the bridge to shut down; used by `close`.
    pub async fn shutdown_bridge(&self) -> Result<()> {
        let client = self.current().await?;
        client.send_shutdown().await
    }
}

impl McpClientApi for SessionClient {
    async fn ping(&self) -> Result<()> {
        self.call("ping", None).await?;
        Ok(())
    }

    async fn get_server_details(&self) -> Result<ServerDetails> {
        let raw = self.call("getServerDetails", None).await?;
        serde_json::from_value(raw)
            .map_err(|e| Error::client(format!("malformed server details: {e}")))
    }

    async fn list_tools(&self, params: Option<Value>) -> Result<Value> {
        self.call("listTools", params).await
    }

    async fn call_tool(&self, params: Value) -> Result<Value> {
        self.call("callTool", Some(params)).await
    }

    async fn list_resources(&self, params: Option<Value>) -> Result<Value> {
        self.call("listResources", params).await
    }

    async fn list_resource_templates(&self, params: Option<Value>) -> Result<Value> {
        self.call("listResourceTemplates", params).await
    }

    async fn read_resource(&self, params: Value) -> Result<Value> {
        self.call("readResource", Some(params)).await
    }

    async fn subscribe_resource(&self, params: Value) -> Result<()> {
        self.call("subscribeResource", Some(params)).await?;
        Ok(())
    }

    async fn unsubscribe_resource(&self, params: Value) -> Result<()> {
        self.call("unsubscribeResource", Some(params)).await?;
        Ok(())
    }

    async fn list_prompts(&self, params: Option<Value>) -> Result<Value> {
        self.call("listPrompts", params).await
    }

    async fn get_prompt(&self, params: Value) -> Result<Value> {
        self.call("getPrompt", Some(params)).await
    }

    async fn set_logging_level(&self, params: Value) -> Result<()> {
        self.call("setLoggingLevel", Some(params)).await?;
        Ok(())
    }
}
