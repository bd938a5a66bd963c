//! Realtime client core: identity and group keys, the persistent websocket
//! connection, and local message state synchronization.

pub mod connection;
pub mod sync;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use keys::KeyManager;
use shared::{
    domain::{ChatId, UserId},
    error::ApiError,
    protocol::{
        kind, Frame, GroupKeyEntryResponse, GroupKeyEnvelope, MessageAck, OutboundMessageBody,
        PublicKeyResponse, PublicKeyUploadRequest,
    },
};
use storage::{KeyValueStore, KvIdentityStore};

pub use connection::{
    outbound_action, reconnect_delay, ConnectionError, ConnectionManager, ConnectionOptions,
    ConnectionState, FrameSink, FrameStream, SendAction, Subscription, TungsteniteTransport,
    WireEvent, WireTransport, RECONNECT_DELAY_CAP,
};
pub use sync::{
    ChatKeyState, MessageSyncEngine, MessageView, PendingMessage, SyncError, SyncEvent,
};

/// REST collaborator for everything the realtime channel does not carry:
/// key publication and lookup, group-key envelopes, message posting.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn publish_public_key(&self, public_key: &[u8]) -> Result<()>;
    async fn fetch_public_key(&self, user_id: UserId) -> Result<Vec<u8>>;
    /// `None` when no envelope has been initialized for the chat yet.
    async fn fetch_group_key(&self, chat_id: ChatId) -> Result<Option<GroupKeyEntryResponse>>;
    /// Uploads an envelope; the server answers with the version it recorded.
    async fn init_group_key(&self, chat_id: ChatId, envelope: &GroupKeyEnvelope) -> Result<u64>;
    async fn post_message(&self, body: &OutboundMessageBody) -> Result<MessageAck>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitGroupKeyResponse {
    key_version: u64,
}

pub struct HttpMessageApi {
    http: reqwest::Client,
    server_url: String,
    token: String,
}

impl HttpMessageApi {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}

/// Prefers the server's structured error body over the bare status code.
async fn checked(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if let Ok(api_error) = response.json::<ApiError>().await {
        anyhow::bail!("{what} failed: {api_error}");
    }
    anyhow::bail!("{what} failed with status {status}");
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn publish_public_key(&self, public_key: &[u8]) -> Result<()> {
        let response = self
            .http
            .post(self.url("/api/users/public_key"))
            .bearer_auth(&self.token)
            .json(&PublicKeyUploadRequest {
                public_key: public_key.to_vec(),
            })
            .send()
            .await
            .context("public key upload request failed")?;
        checked(response, "public key upload").await?;
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: UserId) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("/api/users/{user_id}/public_key")))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("public key fetch request failed")?;
        let body: PublicKeyResponse = checked(response, "public key fetch")
            .await?
            .json()
            .await
            .context("malformed public key response")?;
        Ok(body.public_key)
    }

    async fn fetch_group_key(&self, chat_id: ChatId) -> Result<Option<GroupKeyEntryResponse>> {
        let response = self
            .http
            .get(self.url(&format!("/api/chats/{chat_id}/group_key")))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("group key fetch request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry: GroupKeyEntryResponse = checked(response, "group key fetch")
            .await?
            .json()
            .await
            .context("malformed group key response")?;
        Ok(Some(entry))
    }

    async fn init_group_key(&self, chat_id: ChatId, envelope: &GroupKeyEnvelope) -> Result<u64> {
        let response = self
            .http
            .post(self.url(&format!("/api/chats/{chat_id}/group_key")))
            .bearer_auth(&self.token)
            .json(envelope)
            .send()
            .await
            .context("group key upload request failed")?;
        let body: InitGroupKeyResponse = checked(response, "group key upload")
            .await?
            .json()
            .await
            .context("malformed group key upload response")?;
        Ok(body.key_version)
    }

    async fn post_message(&self, body: &OutboundMessageBody) -> Result<MessageAck> {
        let response = self
            .http
            .post(self.url("/api/messages"))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .context("message post request failed")?;
        let ack: MessageAck = checked(response, "message post")
            .await?
            .json()
            .await
            .context("malformed message ack")?;
        Ok(ack)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base http(s) url of the server; the websocket url is derived.
    pub server_url: String,
    pub token: String,
    pub user_id: UserId,
}

/// `http(s)://` base url to its `ws(s)://` counterpart.
pub fn ws_url_from_server(server_url: &str) -> Result<String> {
    let trimmed = server_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        anyhow::bail!("server url must start with http:// or https://: {server_url}")
    }
}

struct SessionRuntime {
    started: bool,
    frame_sub: Option<Subscription>,
    pump_task: Option<JoinHandle<()>>,
}

/// Owner object wiring the key manager, the connection and the sync engine
/// together into one client session.
pub struct RealtimeSession {
    keys: Arc<KeyManager>,
    connection: Arc<ConnectionManager>,
    sync: Arc<MessageSyncEngine>,
    api: Arc<dyn MessageApi>,
    runtime: tokio::sync::Mutex<SessionRuntime>,
}

impl RealtimeSession {
    /// Production wiring: sqlite-or-memory store for identity and outbox,
    /// HTTP api, tungstenite transport.
    pub fn new(config: SessionConfig, store: Arc<dyn KeyValueStore>) -> Result<Arc<Self>> {
        let ws_url = ws_url_from_server(&config.server_url)?;
        let api: Arc<dyn MessageApi> =
            Arc::new(HttpMessageApi::new(&config.server_url, &config.token));
        let transport: Arc<dyn WireTransport> = Arc::new(TungsteniteTransport);
        Ok(Self::from_parts(
            config.user_id,
            ConnectionOptions::new(ws_url, &config.token),
            store,
            api,
            transport,
        ))
    }

    /// Dependency-injected wiring, also used by tests with scripted
    /// transports and api doubles.
    pub fn from_parts(
        user_id: UserId,
        options: ConnectionOptions,
        store: Arc<dyn KeyValueStore>,
        api: Arc<dyn MessageApi>,
        transport: Arc<dyn WireTransport>,
    ) -> Arc<Self> {
        let keys = Arc::new(KeyManager::new(Arc::new(KvIdentityStore::new(
            Arc::clone(&store),
        ))));
        let connection = ConnectionManager::new(options, transport);
        let sync = Arc::new(MessageSyncEngine::new(
            user_id,
            Arc::clone(&keys),
            Arc::clone(&connection),
            Arc::clone(&api),
            store,
        ));
        Arc::new(Self {
            keys,
            connection,
            sync,
            api,
            runtime: tokio::sync::Mutex::new(SessionRuntime {
                started: false,
                frame_sub: None,
                pump_task: None,
            }),
        })
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn sync(&self) -> &Arc<MessageSyncEngine> {
        &self.sync
    }

    /// Ensures the identity exists and is published, starts pumping inbound
    /// frames into the sync engine, then connects.
    pub async fn init(&self) -> Result<()> {
        {
            let mut runtime = self.runtime.lock().await;
            if runtime.started {
                return Ok(());
            }

            let public_key = self
                .keys
                .ensure_identity()
                .await
                .context("identity initialization failed")?;
            self.api
                .publish_public_key(&public_key)
                .await
                .context("public key publication failed")?;

            let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
            let sub = self.connection.on(kind::WILDCARD, move |frame| {
                let _ = frame_tx.send(frame.clone());
            });
            let sync = Arc::clone(&self.sync);
            let pump = tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    handle_frame(&sync, frame).await;
                }
            });
            runtime.frame_sub = Some(sub);
            runtime.pump_task = Some(pump);
            runtime.started = true;
        }

        self.connection.connect().await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut runtime = self.runtime.lock().await;
        if !runtime.started {
            return;
        }
        runtime.started = false;
        if let Some(sub) = runtime.frame_sub.take() {
            self.connection.off(&sub);
        }
        self.connection.disconnect();
        if let Some(task) = runtime.pump_task.take() {
            task.abort();
        }
        let _ = self.sync.set_online(false).await;
    }

}

/// Routes one inbound frame into the sync engine.
async fn handle_frame(sync: &MessageSyncEngine, frame: Frame) {
    match frame.kind.as_str() {
        kind::CONNECTED => {
            if let Err(err) = sync.set_online(true).await {
                warn!("session: outbox replay failed: {err}");
                sync.report_error(err.to_string());
            }
        }
        kind::DISCONNECTED => {
            let _ = sync.set_online(false).await;
        }
        kind::PING | kind::PONG => {}
        // Signaling frames ride the pub-sub surface untouched.
        k if k.starts_with("webrtc:") || k.starts_with("voice:") => {}
        _ => {
            if let Err(err) = sync.reconcile(&frame).await {
                warn!(kind = %frame.kind, "session: reconcile failed: {err}");
                sync.report_error(err.to_string());
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod connection_tests;
#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod sync_tests;
#[cfg(test)]
#[path = "tests/http_api_tests.rs"]
mod http_api_tests;
