use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Notify};

use crate::{
    connection::{ConnectionManager, ConnectionOptions},
    sync::{ChatKeyState, MessageSyncEngine, SyncError, SyncEvent},
    MessageApi,
};
use keys::{KeyError, KeyManager, SymmetricKey};
use shared::{
    domain::{ChatId, ChatKind, MessageId, UserId},
    protocol::{
        kind, Frame, GroupKeyEntryResponse, GroupKeyEnvelope, MessageAck, MessageDeletePayload,
        MessagePayload, MessageUpdatePayload, OutboundMessageBody, ReactionOp, ReactionPayload,
    },
};
use storage::{KeyValueStore, KvIdentityStore, MemoryKeyValueStore};

use self::support::null_transport;

// A transport that never connects; these tests exercise the engine alone.
mod support {
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::connection::{ConnectionError, FrameSink, FrameStream, WireTransport};

    struct NullTransport;

    #[async_trait]
    impl WireTransport for NullTransport {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ConnectionError> {
            Err(ConnectionError::Transport("unreachable".to_string()))
        }
    }

    pub fn null_transport() -> Arc<dyn WireTransport> {
        Arc::new(NullTransport)
    }
}

/// In-memory server double; group keys are served per-reader out of the
/// stored envelope.
struct TestApi {
    reader: UserId,
    posts: Mutex<Vec<OutboundMessageBody>>,
    fail_posts: AtomicBool,
    hold_posts: AtomicBool,
    release: Notify,
    next_ack_id: Mutex<Option<MessageId>>,
    envelopes: Mutex<HashMap<ChatId, GroupKeyEnvelope>>,
    public_keys: Mutex<HashMap<UserId, Vec<u8>>>,
}

impl TestApi {
    fn new(reader: UserId) -> Arc<Self> {
        Arc::new(Self {
            reader,
            posts: Mutex::new(Vec::new()),
            fail_posts: AtomicBool::new(false),
            hold_posts: AtomicBool::new(false),
            release: Notify::new(),
            next_ack_id: Mutex::new(None),
            envelopes: Mutex::new(HashMap::new()),
            public_keys: Mutex::new(HashMap::new()),
        })
    }

    fn posted(&self) -> Vec<OutboundMessageBody> {
        self.posts.lock().unwrap().clone()
    }

    fn set_envelope(&self, chat_id: ChatId, envelope: GroupKeyEnvelope) {
        self.envelopes.lock().unwrap().insert(chat_id, envelope);
    }

    fn set_public_key(&self, user_id: UserId, public_key: [u8; 32]) {
        self.public_keys
            .lock()
            .unwrap()
            .insert(user_id, public_key.to_vec());
    }
}

#[async_trait]
impl MessageApi for TestApi {
    async fn publish_public_key(&self, _public_key: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_public_key(&self, user_id: UserId) -> anyhow::Result<Vec<u8>> {
        self.public_keys
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no public key for {user_id}"))
    }

    async fn fetch_group_key(
        &self,
        chat_id: ChatId,
    ) -> anyhow::Result<Option<GroupKeyEntryResponse>> {
        let envelopes = self.envelopes.lock().unwrap();
        let Some(envelope) = envelopes.get(&chat_id) else {
            return Ok(None);
        };
        let wrapped_key = envelope
            .wrapped_keys
            .get(&self.reader)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("reader is not a member"))?;
        Ok(Some(GroupKeyEntryResponse {
            wrapped_key,
            key_version: envelope.version,
            created_by: envelope.created_by,
        }))
    }

    async fn init_group_key(
        &self,
        chat_id: ChatId,
        envelope: &GroupKeyEnvelope,
    ) -> anyhow::Result<u64> {
        self.envelopes
            .lock()
            .unwrap()
            .insert(chat_id, envelope.clone());
        Ok(envelope.version)
    }

    async fn post_message(&self, body: &OutboundMessageBody) -> anyhow::Result<MessageAck> {
        if self.hold_posts.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_posts.load(Ordering::SeqCst) {
            anyhow::bail!("server unavailable");
        }
        self.posts.lock().unwrap().push(body.clone());
        let message_id = self
            .next_ack_id
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(MessageId::random);
        Ok(MessageAck {
            message_id,
            sent_at: Utc::now(),
        })
    }
}

struct Harness {
    engine: Arc<MessageSyncEngine>,
    api: Arc<TestApi>,
    store: Arc<dyn KeyValueStore>,
    user: UserId,
    events: broadcast::Receiver<SyncEvent>,
}

fn build_engine(
    user: UserId,
    api: Arc<TestApi>,
    store: Arc<dyn KeyValueStore>,
) -> Arc<MessageSyncEngine> {
    let keys = Arc::new(KeyManager::new(Arc::new(KvIdentityStore::new(Arc::clone(
        &store,
    )))));
    let connection = ConnectionManager::new(
        ConnectionOptions::new("ws://localhost:9", "t"),
        null_transport(),
    );
    Arc::new(MessageSyncEngine::new(user, keys, connection, api, store))
}

fn harness() -> Harness {
    let user = UserId::random();
    let api = TestApi::new(user);
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
    let engine = build_engine(user, Arc::clone(&api), Arc::clone(&store));
    let events = engine.subscribe_events();
    Harness {
        engine,
        api,
        store,
        user,
        events,
    }
}

fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn message_frame(payload: &MessagePayload) -> Frame {
    Frame::from_payload(kind::MESSAGE, payload).expect("build frame")
}

fn inbound_text(chat_id: ChatId, text: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::random(),
        chat_id,
        sender_id: UserId::random(),
        text: Some(text.to_string()),
        ciphertext: None,
        key_version: None,
        sent_at: Utc::now(),
    }
}

/// Creates a creator-side envelope covering `member` and registers it with
/// the api together with the creator's public key. Returns the raw group
/// key so tests can encrypt traffic as the peer would.
async fn provision_group_key(
    api: &TestApi,
    chat_id: ChatId,
    member: UserId,
    member_public: [u8; 32],
    version: u64,
) -> SymmetricKey {
    let creator_id = UserId::random();
    let creator_keys = KeyManager::new(Arc::new(KvIdentityStore::new(Arc::new(
        MemoryKeyValueStore::default(),
    ))));
    let creator_public = creator_keys.ensure_identity().await.expect("creator identity");
    let (key, mut envelope) = creator_keys
        .create_group_envelope(creator_id, &[(member, member_public)])
        .await
        .expect("wrap group key");
    envelope.version = version;
    api.set_public_key(creator_id, creator_public);
    api.set_envelope(chat_id, envelope);
    key
}

#[tokio::test]
async fn optimistic_send_replaces_temp_id_in_place() {
    let mut h = harness();
    h.engine.set_online(true).await.expect("go online");
    let chat = ChatId::random();

    let first = h.engine.send(chat, "one").await.expect("send one");
    let second = h.engine.send(chat, "two").await.expect("send two");
    assert!(!first.queued_offline);

    let messages = h.engine.messages(chat).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text.as_deref(), Some("one"));
    assert_eq!(messages[1].text.as_deref(), Some("two"));
    assert!(messages.iter().all(|m| !m.pending));
    assert!(messages.iter().all(|m| m.id != first.temp_id));
    assert!(messages.iter().all(|m| m.id != second.temp_id));

    let events = drain_events(&mut h.events);
    let acked: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, SyncEvent::MessageAcknowledged { .. }))
        .collect();
    assert_eq!(acked.len(), 2);
}

#[tokio::test]
async fn duplicate_message_frames_apply_once() {
    let h = harness();
    let chat = ChatId::random();
    let payload = inbound_text(chat, "hello");
    let frame = message_frame(&payload);

    h.engine.reconcile(&frame).await.expect("first");
    h.engine.reconcile(&frame).await.expect("second");

    assert_eq!(h.engine.messages(chat).await.len(), 1);
}

#[tokio::test]
async fn realtime_echo_after_ack_is_deduped() {
    let mut h = harness();
    h.engine.set_online(true).await.expect("go online");
    let chat = ChatId::random();

    h.engine.send(chat, "hi").await.expect("send");
    let canonical = h.engine.messages(chat).await[0].clone();

    let echo = MessagePayload {
        id: canonical.id,
        chat_id: chat,
        sender_id: h.user,
        text: Some("hi".to_string()),
        ciphertext: None,
        key_version: None,
        sent_at: canonical.sent_at,
    };
    h.engine
        .reconcile(&message_frame(&echo))
        .await
        .expect("echo");

    assert_eq!(h.engine.messages(chat).await.len(), 1);
    drain_events(&mut h.events);
}

#[tokio::test]
async fn realtime_echo_before_ack_drops_placeholder() {
    let h = harness();
    h.engine.set_online(true).await.expect("go online");
    let chat = ChatId::random();
    let canonical_id = MessageId::random();
    *h.api.next_ack_id.lock().unwrap() = Some(canonical_id);
    h.api.hold_posts.store(true, Ordering::SeqCst);

    let engine = Arc::clone(&h.engine);
    let send = tokio::spawn(async move { engine.send(chat, "hi").await });
    // Let the send task progress to the held post.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The server broadcast lands before the post returns.
    let echo = MessagePayload {
        id: canonical_id,
        chat_id: chat,
        sender_id: h.user,
        text: Some("hi".to_string()),
        ciphertext: None,
        key_version: None,
        sent_at: Utc::now(),
    };
    h.engine
        .reconcile(&message_frame(&echo))
        .await
        .expect("echo");

    h.api.hold_posts.store(false, Ordering::SeqCst);
    h.api.release.notify_one();
    send.await.expect("join").expect("send");

    let messages = h.engine.messages(chat).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, canonical_id);
}

#[tokio::test]
async fn update_marks_edited_and_replaces_text() {
    let h = harness();
    let chat = ChatId::random();
    let payload = inbound_text(chat, "draft");
    h.engine
        .reconcile(&message_frame(&payload))
        .await
        .expect("insert");

    let update = MessageUpdatePayload {
        id: payload.id,
        chat_id: chat,
        text: Some("final".to_string()),
        ciphertext: None,
        key_version: None,
    };
    h.engine
        .reconcile(&Frame::from_payload(kind::MESSAGE_UPDATE, &update).expect("frame"))
        .await
        .expect("update");

    let messages = h.engine.messages(chat).await;
    assert_eq!(messages[0].text.as_deref(), Some("final"));
    assert!(messages[0].edited);
}

#[tokio::test]
async fn update_for_unknown_message_is_ignored() {
    let h = harness();
    let chat = ChatId::random();
    let update = MessageUpdatePayload {
        id: MessageId::random(),
        chat_id: chat,
        text: Some("x".to_string()),
        ciphertext: None,
        key_version: None,
    };
    h.engine
        .reconcile(&Frame::from_payload(kind::MESSAGE_UPDATE, &update).expect("frame"))
        .await
        .expect("update");
    assert!(h.engine.messages(chat).await.is_empty());
}

#[tokio::test]
async fn delete_tombstones_message() {
    let h = harness();
    let chat = ChatId::random();
    let payload = inbound_text(chat, "secret");
    h.engine
        .reconcile(&message_frame(&payload))
        .await
        .expect("insert");

    let delete = MessageDeletePayload {
        id: payload.id,
        chat_id: chat,
    };
    h.engine
        .reconcile(&Frame::from_payload(kind::MESSAGE_DELETE, &delete).expect("frame"))
        .await
        .expect("delete");

    let messages = h.engine.messages(chat).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].deleted);
    assert!(messages[0].text.is_none());
}

#[tokio::test]
async fn reactions_are_idempotent() {
    let h = harness();
    let chat = ChatId::random();
    let payload = inbound_text(chat, "react to me");
    h.engine
        .reconcile(&message_frame(&payload))
        .await
        .expect("insert");

    let reactor = UserId::random();
    let reaction = |op: ReactionOp| ReactionPayload {
        message_id: payload.id,
        chat_id: chat,
        user_id: reactor,
        emoji: "👍".to_string(),
        op,
    };

    for _ in 0..2 {
        h.engine
            .reconcile(&Frame::from_payload(kind::REACTION, &reaction(ReactionOp::Add)).expect("frame"))
            .await
            .expect("add");
    }
    assert_eq!(h.engine.messages(chat).await[0].reactions.len(), 1);

    for _ in 0..2 {
        h.engine
            .reconcile(
                &Frame::from_payload(kind::REACTION, &reaction(ReactionOp::Remove)).expect("frame"),
            )
            .await
            .expect("remove");
    }
    assert!(h.engine.messages(chat).await[0].reactions.is_empty());
}

#[tokio::test]
async fn offline_sends_queue_durably_and_replay_in_order() {
    let mut h = harness();
    let chat = ChatId::random();

    let first = h.engine.send(chat, "first").await.expect("send");
    let second = h.engine.send(chat, "second").await.expect("send");
    assert!(first.queued_offline && second.queued_offline);
    assert!(h.api.posted().is_empty());
    assert!(h.engine.messages(chat).await.iter().all(|m| m.pending));

    h.engine.set_online(true).await.expect("replay");

    let posts = h.api.posted();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].text.as_deref(), Some("first"));
    assert_eq!(posts[1].text.as_deref(), Some("second"));
    assert!(h.engine.messages(chat).await.iter().all(|m| !m.pending));

    // The outbox is empty once everything is delivered.
    assert!(h
        .store
        .get(&format!("outbox:{chat}"))
        .await
        .expect("read store")
        .is_none());
    drain_events(&mut h.events);
}

#[tokio::test]
async fn outbox_replay_stops_at_first_failure() {
    let h = harness();
    let chat = ChatId::random();
    h.engine.send(chat, "first").await.expect("send");
    h.engine.send(chat, "second").await.expect("send");

    h.api.fail_posts.store(true, Ordering::SeqCst);
    h.engine.set_online(true).await.expect("replay");

    // Nothing was delivered and both entries survive for the next attempt.
    assert!(h.api.posted().is_empty());
    let raw = h
        .store
        .get(&format!("outbox:{chat}"))
        .await
        .expect("read store")
        .expect("outbox still present");
    let entries: Vec<serde_json::Value> = serde_json::from_str(&raw).expect("outbox json");
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn outbox_survives_restart() {
    let user = UserId::random();
    let api = TestApi::new(user);
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::default());
    let chat = ChatId::random();

    {
        let engine = build_engine(user, Arc::clone(&api), Arc::clone(&store));
        engine.send(chat, "held back").await.expect("send");
    }

    let engine = build_engine(user, Arc::clone(&api), Arc::clone(&store));
    engine.set_online(true).await.expect("replay");

    let posts = api.posted();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].text.as_deref(), Some("held back"));
}

#[tokio::test]
async fn encrypted_send_uses_ready_group_key() {
    let h = harness();
    h.engine.set_online(true).await.expect("go online");
    let chat = ChatId::random();
    let identity_public = {
        let keys = KeyManager::new(Arc::new(KvIdentityStore::new(Arc::clone(&h.store))));
        keys.ensure_identity().await.expect("identity")
    };
    let group_key = provision_group_key(&h.api, chat, h.user, identity_public, 1).await;
    h.engine.set_chat_kind(chat, ChatKind::Group).await;

    h.engine.send(chat, "top secret").await.expect("send");

    let posts = h.api.posted();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].text.is_none());
    assert_eq!(posts[0].key_version, Some(1));
    let ciphertext = posts[0].ciphertext.clone().expect("ciphertext");
    let plaintext = KeyManager::decrypt(&group_key, &ciphertext).expect("decrypt");
    assert_eq!(plaintext, b"top secret");
    assert_eq!(
        h.engine.chat_key_state(chat).await,
        ChatKeyState::Ready { version: 1 }
    );
}

#[tokio::test]
async fn encrypted_send_without_envelope_fails_closed() {
    let mut h = harness();
    h.engine.set_online(true).await.expect("go online");
    let chat = ChatId::random();
    h.engine.set_chat_kind(chat, ChatKind::Group).await;

    let err = h.engine.send(chat, "never leaves").await.expect_err("send");
    assert!(matches!(
        err,
        SyncError::Key(KeyError::KeyNotFound { .. })
    ));

    // The placeholder is rolled back and nothing reached the server.
    assert!(h.engine.messages(chat).await.is_empty());
    assert!(h.api.posted().is_empty());
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::SendFailed { .. })));
    assert_eq!(h.engine.chat_key_state(chat).await, ChatKeyState::NoKey);
}

#[tokio::test]
async fn stale_key_blocks_sends_until_reload() {
    let h = harness();
    h.engine.set_online(true).await.expect("go online");
    let chat = ChatId::random();
    let identity_public = {
        let keys = KeyManager::new(Arc::new(KvIdentityStore::new(Arc::clone(&h.store))));
        keys.ensure_identity().await.expect("identity")
    };
    provision_group_key(&h.api, chat, h.user, identity_public, 1).await;
    h.engine.set_chat_kind(chat, ChatKind::Group).await;
    h.engine.send(chat, "under v1").await.expect("send");

    h.engine.note_remote_rotation(chat, 2).await;
    assert_eq!(
        h.engine.chat_key_state(chat).await,
        ChatKeyState::Stale { held: 1, current: 2 }
    );

    let err = h.engine.send(chat, "must not go out").await.expect_err("send");
    assert!(matches!(err, SyncError::Key(KeyError::StaleKey { .. })));
    assert_eq!(h.api.posted().len(), 1);

    provision_group_key(&h.api, chat, h.user, identity_public, 2).await;
    let version = h.engine.reload_group_key(chat).await.expect("reload");
    assert_eq!(version, 2);

    h.engine.send(chat, "under v2").await.expect("send");
    let posts = h.api.posted();
    assert_eq!(posts.last().and_then(|p| p.key_version), Some(2));
}

#[tokio::test]
async fn inbound_newer_version_triggers_key_reload() {
    let h = harness();
    let chat = ChatId::random();
    let identity_public = {
        let keys = KeyManager::new(Arc::new(KvIdentityStore::new(Arc::clone(&h.store))));
        keys.ensure_identity().await.expect("identity")
    };
    provision_group_key(&h.api, chat, h.user, identity_public, 1).await;
    h.engine.set_chat_kind(chat, ChatKind::Group).await;
    h.engine.ensure_chat_key(chat).await.expect("v1 ready");

    let v2_key = provision_group_key(&h.api, chat, h.user, identity_public, 2).await;
    let payload = MessagePayload {
        id: MessageId::random(),
        chat_id: chat,
        sender_id: UserId::random(),
        text: None,
        ciphertext: Some(KeyManager::encrypt(&v2_key, b"rotated content").expect("encrypt")),
        key_version: Some(2),
        sent_at: Utc::now(),
    };
    h.engine
        .reconcile(&message_frame(&payload))
        .await
        .expect("reconcile");

    let messages = h.engine.messages(chat).await;
    assert_eq!(messages[0].text.as_deref(), Some("rotated content"));
    assert_eq!(
        h.engine.chat_key_state(chat).await,
        ChatKeyState::Ready { version: 2 }
    );
}

#[tokio::test]
async fn initialize_and_rotate_bump_versions() {
    let h = harness();
    let chat = ChatId::random();
    let identity_public = {
        let keys = KeyManager::new(Arc::new(KvIdentityStore::new(Arc::clone(&h.store))));
        keys.ensure_identity().await.expect("identity")
    };
    let members = [(h.user, identity_public)];

    let v1 = h
        .engine
        .initialize_group_key(chat, &members)
        .await
        .expect("init");
    assert_eq!(v1, 1);
    let v2 = h
        .engine
        .rotate_group_key(chat, &members)
        .await
        .expect("rotate");
    assert_eq!(v2, 2);
    assert_eq!(
        h.engine.chat_key_state(chat).await,
        ChatKeyState::Ready { version: 2 }
    );
}

#[tokio::test]
async fn key_rotated_frame_reloads_key() {
    let h = harness();
    let chat = ChatId::random();
    let identity_public = {
        let keys = KeyManager::new(Arc::new(KvIdentityStore::new(Arc::clone(&h.store))));
        keys.ensure_identity().await.expect("identity")
    };
    provision_group_key(&h.api, chat, h.user, identity_public, 1).await;
    h.engine.ensure_chat_key(chat).await.expect("v1 ready");

    provision_group_key(&h.api, chat, h.user, identity_public, 2).await;
    let frame = Frame::new(
        kind::KEY_ROTATED,
        serde_json::json!({ "chatId": chat, "keyVersion": 2 }),
    );
    h.engine.reconcile(&frame).await.expect("reconcile");

    assert_eq!(
        h.engine.chat_key_state(chat).await,
        ChatKeyState::Ready { version: 2 }
    );
}

#[tokio::test]
async fn typing_and_presence_frames_surface_as_events() {
    let mut h = harness();
    let chat = ChatId::random();
    let peer = UserId::random();

    let typing = Frame::new(
        kind::TYPING,
        serde_json::json!({ "chatId": chat, "userId": peer, "isTyping": true }),
    );
    let presence = Frame::new(
        kind::PRESENCE,
        serde_json::json!({ "userId": peer, "online": false }),
    );
    h.engine.reconcile(&typing).await.expect("typing");
    h.engine.reconcile(&presence).await.expect("presence");

    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Typing(p) if p.is_typing && p.user_id == peer)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Presence(p) if !p.online)));
}

#[tokio::test]
async fn unhandled_frame_kinds_are_ignored() {
    let h = harness();
    let frame = Frame::new(kind::WILDCARD, serde_json::json!({}));
    h.engine.reconcile(&frame).await.expect("ignored");
    let frame = Frame::new("webrtc:offer", serde_json::json!({ "sdp": "v=0" }));
    h.engine.reconcile(&frame).await.expect("ignored");
}
