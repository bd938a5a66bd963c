//! Local message state kept consistent with the server: optimistic sends,
//! inbound reconciliation, the per-chat group-key lifecycle and a durable
//! offline outbox.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use keys::{KeyError, KeyManager, SymmetricKey, PUBLIC_KEY_LEN};
use shared::{
    domain::{ChatId, ChatKind, MessageId, UserId},
    protocol::{
        kind, EncryptedPayload, Frame, KeyRotatedPayload, MessageAck, MessageDeletePayload,
        MessagePayload, MessageUpdatePayload, OutboundMessageBody, PresencePayload, ReactionOp,
        ReactionPayload, TypingPayload,
    },
};
use storage::KeyValueStore;

use crate::{ConnectionManager, MessageApi};

const OUTBOX_INDEX_KEY: &str = "outbox:chats";
const EVENT_CHANNEL_CAPACITY: usize = 256;
const KEY_WAIT_POLL: Duration = Duration::from_millis(100);
const KEY_WAIT_ATTEMPTS: u32 = 100;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("message api failure: {0}")]
    Api(String),
    #[error("outbox storage failure: {0}")]
    Storage(String),
}

/// Snapshot of one message as the UI should render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub sent_at: DateTime<Utc>,
    /// True while the message awaits a server ack.
    pub pending: bool,
    pub edited: bool,
    pub deleted: bool,
    pub reactions: BTreeSet<(UserId, String)>,
}

/// Observable state changes, delivered over a broadcast channel.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    MessageAdded {
        message: MessageView,
    },
    /// The optimistic placeholder was replaced in place: same position,
    /// canonical id and timestamp.
    MessageAcknowledged {
        chat_id: ChatId,
        temp_id: MessageId,
        message_id: MessageId,
    },
    MessageUpdated {
        chat_id: ChatId,
        message_id: MessageId,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
    },
    ReactionChanged {
        chat_id: ChatId,
        message_id: MessageId,
    },
    SendFailed {
        chat_id: ChatId,
        temp_id: MessageId,
        reason: String,
    },
    Typing(TypingPayload),
    Presence(PresencePayload),
    Error(String),
}

/// Result of an accepted send. `queued_offline` means the message sits in
/// the durable outbox and will be posted on reconnect.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub temp_id: MessageId,
    pub chat_id: ChatId,
    pub queued_offline: bool,
}

/// Externally visible key lifecycle for a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKeyState {
    NoKey,
    Initializing,
    Ready { version: u64 },
    Stale { held: u64, current: u64 },
}

enum KeySlot {
    Initializing,
    Ready { key: SymmetricKey, version: u64 },
    Stale { held: u64, current: u64 },
}

#[derive(Default)]
struct ChatTimeline {
    /// Display order; ack replaces the temp id in place.
    order: Vec<MessageId>,
    entries: HashMap<MessageId, MessageView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboxItem {
    chat_id: ChatId,
    temp_id: MessageId,
    body: OutboundMessageBody,
    enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct SyncState {
    online: bool,
    encrypted_chats: HashSet<ChatId>,
    key_slots: HashMap<ChatId, KeySlot>,
    timelines: HashMap<ChatId, ChatTimeline>,
}

enum KeyProbe {
    Done(u64),
    Wait,
    Fetch,
}

pub struct MessageSyncEngine {
    local_user: UserId,
    keys: Arc<KeyManager>,
    connection: Arc<ConnectionManager>,
    api: Arc<dyn MessageApi>,
    store: Arc<dyn KeyValueStore>,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl MessageSyncEngine {
    pub fn new(
        local_user: UserId,
        keys: Arc<KeyManager>,
        connection: Arc<ConnectionManager>,
        api: Arc<dyn MessageApi>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_user,
            keys,
            connection,
            api,
            store,
            inner: Mutex::new(SyncState::default()),
            events,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Records what kind of chat this is. Group and channel chats are
    /// end-to-end encrypted: sends require a Ready key and plaintext is
    /// never posted for them.
    pub async fn set_chat_kind(&self, chat_id: ChatId, chat_kind: ChatKind) {
        let mut state = self.inner.lock().await;
        if chat_kind.uses_group_key() {
            state.encrypted_chats.insert(chat_id);
        } else {
            state.encrypted_chats.remove(&chat_id);
        }
    }

    pub async fn chat_key_state(&self, chat_id: ChatId) -> ChatKeyState {
        match self.inner.lock().await.key_slots.get(&chat_id) {
            None => ChatKeyState::NoKey,
            Some(KeySlot::Initializing) => ChatKeyState::Initializing,
            Some(KeySlot::Ready { version, .. }) => ChatKeyState::Ready { version: *version },
            Some(KeySlot::Stale { held, current }) => ChatKeyState::Stale {
                held: *held,
                current: *current,
            },
        }
    }

    /// Ordered snapshot of a chat's messages.
    pub async fn messages(&self, chat_id: ChatId) -> Vec<MessageView> {
        let state = self.inner.lock().await;
        state
            .timelines
            .get(&chat_id)
            .map(|timeline| {
                timeline
                    .order
                    .iter()
                    .filter_map(|id| timeline.entries.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fire-and-forget typing indicator over the realtime channel.
    pub fn send_typing(&self, chat_id: ChatId, is_typing: bool) -> bool {
        self.connection.send(
            kind::TYPING,
            serde_json::json!({
                "chatId": chat_id,
                "userId": self.local_user,
                "isTyping": is_typing,
            }),
        )
    }

    /// Optimistic send: the message appears in the timeline immediately
    /// under a temp id, then is posted (or queued to the offline outbox).
    /// For an encrypted chat the body is encrypted under the Ready group
    /// key; any key failure removes the placeholder and surfaces the error.
    pub async fn send(&self, chat_id: ChatId, text: &str) -> Result<PendingMessage, SyncError> {
        let temp_id = MessageId::random();
        let view = MessageView {
            id: temp_id,
            chat_id,
            sender_id: self.local_user,
            text: Some(text.to_string()),
            sent_at: Utc::now(),
            pending: true,
            edited: false,
            deleted: false,
            reactions: BTreeSet::new(),
        };
        let (encrypted, online) = {
            let mut state = self.inner.lock().await;
            let timeline = state.timelines.entry(chat_id).or_default();
            timeline.order.push(temp_id);
            timeline.entries.insert(temp_id, view.clone());
            (state.encrypted_chats.contains(&chat_id), state.online)
        };
        let _ = self.events.send(SyncEvent::MessageAdded { message: view });

        let body = if encrypted {
            match self.encrypted_body(chat_id, text).await {
                Ok(body) => body,
                Err(err) => {
                    self.remove_pending(chat_id, temp_id, &err.to_string()).await;
                    return Err(err);
                }
            }
        } else {
            OutboundMessageBody {
                chat_id,
                text: Some(text.to_string()),
                ciphertext: None,
                key_version: None,
            }
        };

        if !online {
            let item = OutboxItem {
                chat_id,
                temp_id,
                body,
                enqueued_at: Utc::now(),
            };
            if let Err(err) = self.push_outbox(item).await {
                self.remove_pending(chat_id, temp_id, &err.to_string()).await;
                return Err(err);
            }
            info!(chat_id = %chat_id, temp_id = %temp_id, "sync: offline, message queued to outbox");
            return Ok(PendingMessage {
                temp_id,
                chat_id,
                queued_offline: true,
            });
        }

        match self.api.post_message(&body).await {
            Ok(ack) => {
                self.acknowledge(chat_id, temp_id, ack).await;
                Ok(PendingMessage {
                    temp_id,
                    chat_id,
                    queued_offline: false,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                self.remove_pending(chat_id, temp_id, &reason).await;
                Err(SyncError::Api(reason))
            }
        }
    }

    /// Applies one inbound frame to local state. Malformed payloads and
    /// frames for unknown messages are logged and dropped; key failures
    /// during decryption are surfaced.
    pub async fn reconcile(&self, frame: &Frame) -> Result<(), SyncError> {
        match frame.kind.as_str() {
            kind::MESSAGE => {
                let Some(payload) = parse_payload::<MessagePayload>(frame) else {
                    return Ok(());
                };
                self.apply_message(payload).await
            }
            kind::MESSAGE_UPDATE => {
                let Some(payload) = parse_payload::<MessageUpdatePayload>(frame) else {
                    return Ok(());
                };
                self.apply_update(payload).await
            }
            kind::MESSAGE_DELETE => {
                let Some(payload) = parse_payload::<MessageDeletePayload>(frame) else {
                    return Ok(());
                };
                self.apply_delete(payload).await;
                Ok(())
            }
            kind::REACTION => {
                let Some(payload) = parse_payload::<ReactionPayload>(frame) else {
                    return Ok(());
                };
                self.apply_reaction(payload).await;
                Ok(())
            }
            kind::TYPING => {
                if let Some(payload) = parse_payload::<TypingPayload>(frame) {
                    let _ = self.events.send(SyncEvent::Typing(payload));
                }
                Ok(())
            }
            kind::PRESENCE => {
                if let Some(payload) = parse_payload::<PresencePayload>(frame) {
                    let _ = self.events.send(SyncEvent::Presence(payload));
                }
                Ok(())
            }
            kind::KEY_ROTATED => {
                let Some(payload) = parse_payload::<KeyRotatedPayload>(frame) else {
                    return Ok(());
                };
                self.note_remote_rotation(payload.chat_id, payload.key_version)
                    .await;
                if let Err(err) = self.reload_group_key(payload.chat_id).await {
                    warn!(chat_id = %payload.chat_id, "sync: key reload after rotation failed: {err}");
                }
                Ok(())
            }
            other => {
                debug!(kind = other, "sync: frame kind not reconciled");
                Ok(())
            }
        }
    }

    /// Transitions the online flag. Going online replays the outbox FIFO
    /// across chats; replay stops at the first failure and keeps the rest.
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        {
            let mut state = self.inner.lock().await;
            if state.online == online {
                return Ok(());
            }
            state.online = online;
        }
        if online {
            self.replay_outbox().await
        } else {
            Ok(())
        }
    }

    /// Ensures a usable group key for the chat, fetching and unwrapping the
    /// server envelope if none is held. Returns the Ready version.
    pub async fn ensure_chat_key(&self, chat_id: ChatId) -> Result<u64, SyncError> {
        let probe = {
            let mut state = self.inner.lock().await;
            match state.key_slots.get(&chat_id) {
                Some(KeySlot::Ready { version, .. }) => KeyProbe::Done(*version),
                Some(KeySlot::Initializing) => KeyProbe::Wait,
                Some(KeySlot::Stale { .. }) | None => {
                    state.key_slots.insert(chat_id, KeySlot::Initializing);
                    KeyProbe::Fetch
                }
            }
        };
        match probe {
            KeyProbe::Done(version) => Ok(version),
            KeyProbe::Fetch => self.fetch_and_install_key(chat_id).await,
            KeyProbe::Wait => self.wait_for_key(chat_id).await,
        }
    }

    /// Creates and uploads the first envelope for a chat (version 1) and
    /// installs the fresh key locally.
    pub async fn initialize_group_key(
        &self,
        chat_id: ChatId,
        members: &[(UserId, [u8; PUBLIC_KEY_LEN])],
    ) -> Result<u64, SyncError> {
        let (key, envelope) = self
            .keys
            .create_group_envelope(self.local_user, members)
            .await?;
        let version = self
            .api
            .init_group_key(chat_id, &envelope)
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        let mut state = self.inner.lock().await;
        state.encrypted_chats.insert(chat_id);
        state.key_slots.insert(chat_id, KeySlot::Ready { key, version });
        info!(chat_id = %chat_id, version, "sync: group key initialized");
        Ok(version)
    }

    /// Generates and uploads a superseding envelope for the given member
    /// set. Content encrypted before the rotation stays under the old
    /// version and is no longer readable.
    pub async fn rotate_group_key(
        &self,
        chat_id: ChatId,
        members: &[(UserId, [u8; PUBLIC_KEY_LEN])],
    ) -> Result<u64, SyncError> {
        let previous = {
            let state = self.inner.lock().await;
            match state.key_slots.get(&chat_id) {
                Some(KeySlot::Ready { version, .. }) => *version,
                Some(KeySlot::Stale { current, .. }) => *current,
                _ => 0,
            }
        };
        let (key, envelope) = self
            .keys
            .rotate_group_key(self.local_user, previous, members)
            .await?;
        let version = self
            .api
            .init_group_key(chat_id, &envelope)
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        let mut state = self.inner.lock().await;
        state.encrypted_chats.insert(chat_id);
        state.key_slots.insert(chat_id, KeySlot::Ready { key, version });
        info!(chat_id = %chat_id, version, "sync: group key rotated");
        Ok(version)
    }

    /// Records that the server advertises a newer key version than held.
    /// The held key becomes Stale; sends fail until a reload succeeds.
    pub async fn note_remote_rotation(&self, chat_id: ChatId, new_version: u64) {
        let mut state = self.inner.lock().await;
        state.encrypted_chats.insert(chat_id);
        let held = match state.key_slots.get(&chat_id) {
            Some(KeySlot::Ready { version, .. }) if *version >= new_version => return,
            Some(KeySlot::Ready { version, .. }) => *version,
            Some(KeySlot::Stale { held, .. }) => *held,
            _ => 0,
        };
        warn!(chat_id = %chat_id, held, current = new_version, "sync: held group key is stale");
        state.key_slots.insert(
            chat_id,
            KeySlot::Stale {
                held,
                current: new_version,
            },
        );
    }

    /// Discards whatever is held and re-fetches the active envelope.
    pub async fn reload_group_key(&self, chat_id: ChatId) -> Result<u64, SyncError> {
        {
            let mut state = self.inner.lock().await;
            state.key_slots.insert(chat_id, KeySlot::Initializing);
        }
        self.fetch_and_install_key(chat_id).await
    }

    pub(crate) fn report_error(&self, message: String) {
        let _ = self.events.send(SyncEvent::Error(message));
    }

    async fn encrypted_body(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> Result<OutboundMessageBody, SyncError> {
        let (key, version) = self.ready_key(chat_id).await?;
        let ciphertext = KeyManager::encrypt(&key, text.as_bytes())?;
        Ok(OutboundMessageBody {
            chat_id,
            text: None,
            ciphertext: Some(ciphertext),
            key_version: Some(version),
        })
    }

    /// Resolves a Ready key for sending, triggering a fetch when no key is
    /// held and waiting out a concurrent initialization. A Stale slot is an
    /// error here: rotation must complete before new content goes out.
    async fn ready_key(&self, chat_id: ChatId) -> Result<(SymmetricKey, u64), SyncError> {
        for _ in 0..KEY_WAIT_ATTEMPTS {
            let probe = {
                let state = self.inner.lock().await;
                match state.key_slots.get(&chat_id) {
                    Some(KeySlot::Ready { key, version }) => {
                        return Ok((key.clone(), *version));
                    }
                    Some(KeySlot::Stale { held, current }) => {
                        return Err(KeyError::StaleKey {
                            held: *held,
                            current: *current,
                        }
                        .into());
                    }
                    Some(KeySlot::Initializing) => KeyProbe::Wait,
                    None => KeyProbe::Fetch,
                }
            };
            match probe {
                KeyProbe::Fetch => {
                    self.ensure_chat_key(chat_id).await?;
                }
                _ => tokio::time::sleep(KEY_WAIT_POLL).await,
            }
        }
        Err(KeyError::Crypto("timed out waiting for group key".to_string()).into())
    }

    async fn wait_for_key(&self, chat_id: ChatId) -> Result<u64, SyncError> {
        for _ in 0..KEY_WAIT_ATTEMPTS {
            tokio::time::sleep(KEY_WAIT_POLL).await;
            let state = self.inner.lock().await;
            match state.key_slots.get(&chat_id) {
                Some(KeySlot::Initializing) => continue,
                Some(KeySlot::Ready { version, .. }) => return Ok(*version),
                Some(KeySlot::Stale { held, current }) => {
                    return Err(KeyError::StaleKey {
                        held: *held,
                        current: *current,
                    }
                    .into());
                }
                None => return Err(KeyError::KeyNotFound { chat_id }.into()),
            }
        }
        Err(KeyError::Crypto("timed out waiting for group key".to_string()).into())
    }

    /// Fetches this user's wrapped entry, unwraps it against the envelope
    /// creator's public key and installs it as Ready. On failure the slot
    /// is cleared so a later attempt starts from NoKey.
    async fn fetch_and_install_key(&self, chat_id: ChatId) -> Result<u64, SyncError> {
        let fetched = self.fetch_group_key(chat_id).await;
        let mut state = self.inner.lock().await;
        match fetched {
            Ok((key, version)) => {
                state.encrypted_chats.insert(chat_id);
                state.key_slots.insert(chat_id, KeySlot::Ready { key, version });
                Ok(version)
            }
            Err(err) => {
                state.key_slots.remove(&chat_id);
                Err(err)
            }
        }
    }

    async fn fetch_group_key(&self, chat_id: ChatId) -> Result<(SymmetricKey, u64), SyncError> {
        let entry = self
            .api
            .fetch_group_key(chat_id)
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?
            .ok_or(KeyError::KeyNotFound { chat_id })?;
        let creator_key = self
            .api
            .fetch_public_key(entry.created_by)
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        let creator_public = public_key_array(&creator_key)?;
        let key = self
            .keys
            .unwrap_group_key(&entry.wrapped_key, &creator_public)
            .await?;
        info!(chat_id = %chat_id, version = entry.key_version, "sync: group key ready");
        Ok((key, entry.key_version))
    }

    async fn apply_message(&self, payload: MessagePayload) -> Result<(), SyncError> {
        {
            let state = self.inner.lock().await;
            if state
                .timelines
                .get(&payload.chat_id)
                .is_some_and(|t| t.entries.contains_key(&payload.id))
            {
                debug!(message_id = %payload.id, "sync: duplicate message frame ignored");
                return Ok(());
            }
        }

        let text = match &payload.ciphertext {
            Some(ciphertext) => Some(
                self.decrypt_inbound(payload.chat_id, ciphertext, payload.key_version)
                    .await?,
            ),
            None => payload.text.clone(),
        };

        let view = MessageView {
            id: payload.id,
            chat_id: payload.chat_id,
            sender_id: payload.sender_id,
            text,
            sent_at: payload.sent_at,
            pending: false,
            edited: false,
            deleted: false,
            reactions: BTreeSet::new(),
        };
        {
            let mut state = self.inner.lock().await;
            let timeline = state.timelines.entry(payload.chat_id).or_default();
            // Revalidated under the lock: decryption ran unlocked.
            if timeline.entries.contains_key(&payload.id) {
                return Ok(());
            }
            timeline.order.push(payload.id);
            timeline.entries.insert(payload.id, view.clone());
        }
        let _ = self.events.send(SyncEvent::MessageAdded { message: view });
        Ok(())
    }

    async fn apply_update(&self, payload: MessageUpdatePayload) -> Result<(), SyncError> {
        let new_text = match &payload.ciphertext {
            Some(ciphertext) => Some(
                self.decrypt_inbound(payload.chat_id, ciphertext, payload.key_version)
                    .await?,
            ),
            None => payload.text.clone(),
        };
        let updated = {
            let mut state = self.inner.lock().await;
            match state
                .timelines
                .get_mut(&payload.chat_id)
                .and_then(|t| t.entries.get_mut(&payload.id))
            {
                Some(entry) => {
                    if new_text.is_some() {
                        entry.text = new_text;
                    }
                    entry.edited = true;
                    true
                }
                None => false,
            }
        };
        if updated {
            let _ = self.events.send(SyncEvent::MessageUpdated {
                chat_id: payload.chat_id,
                message_id: payload.id,
            });
        } else {
            debug!(message_id = %payload.id, "sync: update for unknown message ignored");
        }
        Ok(())
    }

    async fn apply_delete(&self, payload: MessageDeletePayload) {
        let deleted = {
            let mut state = self.inner.lock().await;
            match state
                .timelines
                .get_mut(&payload.chat_id)
                .and_then(|t| t.entries.get_mut(&payload.id))
            {
                Some(entry) => {
                    entry.deleted = true;
                    entry.text = None;
                    true
                }
                None => false,
            }
        };
        if deleted {
            let _ = self.events.send(SyncEvent::MessageDeleted {
                chat_id: payload.chat_id,
                message_id: payload.id,
            });
        } else {
            debug!(message_id = %payload.id, "sync: delete for unknown message ignored");
        }
    }

    /// Reactions are kept as a set, so re-applying the same add or remove
    /// is a no-op.
    async fn apply_reaction(&self, payload: ReactionPayload) {
        let changed = {
            let mut state = self.inner.lock().await;
            match state
                .timelines
                .get_mut(&payload.chat_id)
                .and_then(|t| t.entries.get_mut(&payload.message_id))
            {
                Some(entry) => {
                    let key = (payload.user_id, payload.emoji.clone());
                    match payload.op {
                        ReactionOp::Add => entry.reactions.insert(key),
                        ReactionOp::Remove => entry.reactions.remove(&key),
                    }
                }
                None => {
                    debug!(message_id = %payload.message_id, "sync: reaction for unknown message ignored");
                    false
                }
            }
        };
        if changed {
            let _ = self.events.send(SyncEvent::ReactionChanged {
                chat_id: payload.chat_id,
                message_id: payload.message_id,
            });
        }
    }

    /// Decrypts an inbound payload, reloading the group key once when the
    /// wire advertises a newer version than held.
    async fn decrypt_inbound(
        &self,
        chat_id: ChatId,
        ciphertext: &EncryptedPayload,
        key_version: Option<u64>,
    ) -> Result<String, SyncError> {
        let wire_version = key_version.unwrap_or(1);
        let held = self.ensure_chat_key(chat_id).await?;
        if held < wire_version {
            self.note_remote_rotation(chat_id, wire_version).await;
            let reloaded = self.reload_group_key(chat_id).await?;
            if reloaded < wire_version {
                return Err(KeyError::StaleKey {
                    held: reloaded,
                    current: wire_version,
                }
                .into());
            }
        }
        let key = {
            let state = self.inner.lock().await;
            match state.key_slots.get(&chat_id) {
                Some(KeySlot::Ready { key, .. }) => key.clone(),
                _ => return Err(KeyError::KeyNotFound { chat_id }.into()),
            }
        };
        let plaintext = KeyManager::decrypt(&key, ciphertext)?;
        String::from_utf8(plaintext)
            .map_err(|_| KeyError::Crypto("decrypted payload is not utf-8".to_string()).into())
    }

    /// Replaces the optimistic placeholder with the canonical id in place.
    /// If the realtime echo already delivered the canonical message the
    /// placeholder is dropped instead of duplicated.
    async fn acknowledge(&self, chat_id: ChatId, temp_id: MessageId, ack: MessageAck) {
        {
            let mut state = self.inner.lock().await;
            let Some(timeline) = state.timelines.get_mut(&chat_id) else {
                return;
            };
            if timeline.entries.contains_key(&ack.message_id) {
                timeline.order.retain(|id| *id != temp_id);
                timeline.entries.remove(&temp_id);
            } else if let Some(mut entry) = timeline.entries.remove(&temp_id) {
                entry.id = ack.message_id;
                entry.sent_at = ack.sent_at;
                entry.pending = false;
                if let Some(slot) = timeline.order.iter_mut().find(|id| **id == temp_id) {
                    *slot = ack.message_id;
                }
                timeline.entries.insert(ack.message_id, entry);
            } else {
                return;
            }
        }
        debug!(chat_id = %chat_id, temp_id = %temp_id, message_id = %ack.message_id, "sync: message acknowledged");
        let _ = self.events.send(SyncEvent::MessageAcknowledged {
            chat_id,
            temp_id,
            message_id: ack.message_id,
        });
    }

    async fn remove_pending(&self, chat_id: ChatId, temp_id: MessageId, reason: &str) {
        {
            let mut state = self.inner.lock().await;
            if let Some(timeline) = state.timelines.get_mut(&chat_id) {
                timeline.entries.remove(&temp_id);
                timeline.order.retain(|id| *id != temp_id);
            }
        }
        warn!(chat_id = %chat_id, temp_id = %temp_id, "sync: send failed: {reason}");
        let _ = self.events.send(SyncEvent::SendFailed {
            chat_id,
            temp_id,
            reason: reason.to_string(),
        });
    }

    async fn replay_outbox(&self) -> Result<(), SyncError> {
        let mut items = Vec::new();
        for chat_id in self.load_outbox_index().await? {
            items.extend(self.load_outbox(chat_id).await?);
        }
        if items.is_empty() {
            return Ok(());
        }
        items.sort_by_key(|item| item.enqueued_at);
        info!(count = items.len(), "sync: replaying offline outbox");
        for item in items {
            match self.api.post_message(&item.body).await {
                Ok(ack) => {
                    self.remove_outbox_item(item.chat_id, item.temp_id).await?;
                    self.acknowledge(item.chat_id, item.temp_id, ack).await;
                }
                Err(err) => {
                    warn!(
                        chat_id = %item.chat_id,
                        temp_id = %item.temp_id,
                        "sync: outbox replay stopped: {err}"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    async fn push_outbox(&self, item: OutboxItem) -> Result<(), SyncError> {
        let chat_id = item.chat_id;
        let mut items = self.load_outbox(chat_id).await?;
        items.push(item);
        self.save_outbox(chat_id, &items).await?;
        let mut index = self.load_outbox_index().await?;
        if !index.contains(&chat_id) {
            index.push(chat_id);
            self.store
                .set(OUTBOX_INDEX_KEY, &encode_json(&index)?)
                .await
                .map_err(|err| SyncError::Storage(err.to_string()))?;
        }
        Ok(())
    }

    async fn remove_outbox_item(
        &self,
        chat_id: ChatId,
        temp_id: MessageId,
    ) -> Result<(), SyncError> {
        let mut items = self.load_outbox(chat_id).await?;
        items.retain(|item| item.temp_id != temp_id);
        if items.is_empty() {
            self.store
                .remove(&outbox_key(chat_id))
                .await
                .map_err(|err| SyncError::Storage(err.to_string()))?;
            let mut index = self.load_outbox_index().await?;
            index.retain(|id| *id != chat_id);
            self.store
                .set(OUTBOX_INDEX_KEY, &encode_json(&index)?)
                .await
                .map_err(|err| SyncError::Storage(err.to_string()))?;
        } else {
            self.save_outbox(chat_id, &items).await?;
        }
        Ok(())
    }

    async fn load_outbox(&self, chat_id: ChatId) -> Result<Vec<OutboxItem>, SyncError> {
        let raw = self
            .store
            .get(&outbox_key(chat_id))
            .await
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        Ok(raw
            .map(|text| decode_json_or_warn(&text, "outbox entries"))
            .unwrap_or_default())
    }

    async fn save_outbox(&self, chat_id: ChatId, items: &[OutboxItem]) -> Result<(), SyncError> {
        self.store
            .set(&outbox_key(chat_id), &encode_json(&items)?)
            .await
            .map_err(|err| SyncError::Storage(err.to_string()))
    }

    async fn load_outbox_index(&self) -> Result<Vec<ChatId>, SyncError> {
        let raw = self
            .store
            .get(OUTBOX_INDEX_KEY)
            .await
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        Ok(raw
            .map(|text| decode_json_or_warn(&text, "outbox index"))
            .unwrap_or_default())
    }
}

fn outbox_key(chat_id: ChatId) -> String {
    format!("outbox:{chat_id}")
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, SyncError> {
    serde_json::to_string(value).map_err(|err| SyncError::Storage(err.to_string()))
}

/// Corrupt persisted state is treated as empty rather than wedging replay.
fn decode_json_or_warn<T: for<'de> Deserialize<'de> + Default>(text: &str, what: &str) -> T {
    match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!("sync: discarding corrupt {what}: {err}");
            T::default()
        }
    }
}

fn public_key_array(bytes: &[u8]) -> Result<[u8; PUBLIC_KEY_LEN], KeyError> {
    let array: [u8; PUBLIC_KEY_LEN] =
        bytes
            .try_into()
            .map_err(|_| KeyError::InvalidKeyMaterial {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
    Ok(array)
}

fn parse_payload<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Option<T> {
    match frame.payload::<T>() {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(kind = %frame.kind, "sync: dropping malformed frame: {err}");
            None
        }
    }
}
