//! Persistent realtime connection with automatic reconnect, heartbeat and a
//! typed pub-sub dispatch surface.
//!
//! The socket itself lives behind the [`WireTransport`] seam so tests can
//! drive the manager with a scripted transport instead of a live server.

use std::{
    cmp,
    collections::{HashMap, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use shared::protocol::{kind, Frame};

/// Reconnect delays never grow past this, no matter the attempt count.
pub const RECONNECT_DELAY_CAP: Duration = Duration::from_secs(30);

pub const NORMAL_CLOSE_CODE: u16 = 1000;
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Only handshake failures surface; heartbeat timeouts and malformed
/// frames are absorbed by the reconnect and drop policies.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Base websocket url, e.g. `ws://host:port` (the `/ws` path is appended).
    pub ws_url: String,
    /// Auth token passed as a query parameter on the upgrade request.
    pub token: String,
    pub reconnect_base: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// When true, frames sent while offline are queued and flushed on the
    /// next successful connect instead of being dropped.
    pub queue_outbound: bool,
}

impl ConnectionOptions {
    pub fn new(ws_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: token.into(),
            reconnect_base: Duration::from_secs(1),
            max_reconnect_attempts: None,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            queue_outbound: true,
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at
/// [`RECONNECT_DELAY_CAP`]. `attempt` is 1-based.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent);
    cmp::min(delay, RECONNECT_DELAY_CAP)
}

/// What to do with an outbound frame given the current connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    Transmit,
    Enqueue,
    Drop,
}

pub fn outbound_action(state: ConnectionState, queue_outbound: bool) -> SendAction {
    match state {
        ConnectionState::Connected => SendAction::Transmit,
        _ if queue_outbound => SendAction::Enqueue,
        _ => SendAction::Drop,
    }
}

/// One event observed on the wire by the read half.
#[derive(Debug)]
pub enum WireEvent {
    Text(String),
    Closed { code: u16 },
    Failed(String),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;
    async fn close_normal(&mut self) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// `None` means the underlying stream ended without a close frame.
    async fn next_event(&mut self) -> Option<WireEvent>;
}

#[async_trait]
pub trait WireTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ConnectionError>;
}

/// Production transport over tokio-tungstenite.
pub struct TungsteniteTransport;

#[async_trait]
impl WireTransport for TungsteniteTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ConnectionError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))?;
        let (sink, stream) = socket.split();
        Ok((
            Box::new(TungsteniteSink { sink }),
            Box::new(TungsteniteStream { stream }),
        ))
    }
}

struct TungsteniteSink {
    sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))
    }

    async fn close_normal(&mut self) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))
    }
}

struct TungsteniteStream {
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl FrameStream for TungsteniteStream {
    async fn next_event(&mut self) -> Option<WireEvent> {
        loop {
            return Some(match self.stream.next().await? {
                Ok(Message::Text(text)) => WireEvent::Text(text),
                Ok(Message::Close(frame)) => WireEvent::Closed {
                    code: frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(ABNORMAL_CLOSE_CODE),
                },
                // Binary and control frames are not part of this protocol.
                Ok(_) => continue,
                Err(err) => WireEvent::Failed(err.to_string()),
            });
        }
    }
}

pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Handle returned by [`ConnectionManager::on`], used to unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    kind: String,
    id: u64,
}

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    by_kind: HashMap<String, Vec<(u64, FrameHandler)>>,
}

struct QueuedFrame {
    kind: String,
    data: Value,
    enqueued_at: DateTime<Utc>,
}

enum WriterCommand {
    Text(String),
    CloseNormal,
}

struct ConnState {
    state: ConnectionState,
    /// Consecutive failed reconnect attempts; reset on success.
    attempts: u32,
    explicit_disconnect: bool,
    /// Bumped on every connect and explicit disconnect. Tasks tagged with an
    /// older epoch must not touch the connection.
    epoch: u64,
    queue: VecDeque<QueuedFrame>,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    pong_tx: Option<mpsc::UnboundedSender<()>>,
}

/// Owns the websocket lifecycle: connect, teardown, backoff reconnect,
/// heartbeat, the outbound queue and handler dispatch.
///
/// All state lives behind a std `Mutex` that is never held across an await;
/// `send`, `on` and `off` are synchronous and callable from handlers.
pub struct ConnectionManager {
    transport: Arc<dyn WireTransport>,
    options: ConnectionOptions,
    inner: Mutex<ConnState>,
    handlers: Mutex<HandlerTable>,
    /// Self-handle for the spawned reader, heartbeat and reconnect tasks.
    me: Weak<Self>,
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions, transport: Arc<dyn WireTransport>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            transport,
            options,
            me: me.clone(),
            inner: Mutex::new(ConnState {
                state: ConnectionState::Disconnected,
                attempts: 0,
                explicit_disconnect: false,
                epoch: 0,
                queue: VecDeque::new(),
                writer: None,
                reader_task: None,
                writer_task: None,
                heartbeat_task: None,
                reconnect_task: None,
                pong_tx: None,
            }),
            handlers: Mutex::new(HandlerTable::default()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    pub fn queued_len(&self) -> usize {
        self.lock_inner().queue.len()
    }

    /// Drops all queued outbound frames without sending them.
    pub fn clear_queue(&self) {
        let dropped = {
            let mut state = self.lock_inner();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        if dropped > 0 {
            info!(dropped, "connection: outbound queue cleared");
        }
    }

    /// Opens the socket. No-op while already connecting or connected. A
    /// failed handshake is returned to the caller and does not start the
    /// backoff timer; automatic retries only follow a lost connection.
    ///
    /// A `disconnect()` issued while the handshake is in flight wins: the
    /// late socket is closed and the manager stays disconnected.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let attempt = {
            let mut state = self.lock_inner();
            match state.state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {}
            }
            state.state = ConnectionState::Connecting;
            state.explicit_disconnect = false;
            state.epoch += 1;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            state.epoch
        };

        let url = self.connection_url();
        match self.transport.connect(&url).await {
            Ok((mut sink, stream)) => {
                let superseded = {
                    let state = self.lock_inner();
                    state.epoch != attempt
                        || state.explicit_disconnect
                        || state.state != ConnectionState::Connecting
                };
                if superseded {
                    info!("connection: handshake superseded by disconnect, closing");
                    let _ = sink.close_normal().await;
                    return Ok(());
                }
                self.install_connection(sink, stream);
                Ok(())
            }
            Err(err) => {
                warn!("connection: handshake failed: {err}");
                let mut state = self.lock_inner();
                if state.epoch == attempt && state.state == ConnectionState::Connecting {
                    state.state = ConnectionState::Disconnected;
                }
                Err(err)
            }
        }
    }

    /// Closes the socket with a normal close and suppresses reconnects until
    /// the next explicit [`connect`](Self::connect). Queued frames are kept.
    pub fn disconnect(&self) {
        let writer = {
            let mut state = self.lock_inner();
            state.explicit_disconnect = true;
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            if state.state == ConnectionState::Disconnected {
                return;
            }
            state.state = ConnectionState::Disconnected;
            state.epoch += 1;
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            // The writer task stays alive long enough to flush the close.
            state.writer_task = None;
            state.pong_tx = None;
            state.writer.take()
        };
        if let Some(writer) = writer {
            let _ = writer.send(WriterCommand::CloseNormal);
        }
        info!("connection: disconnected");
        self.emit_synthetic(kind::DISCONNECTED);
    }

    /// Sends a frame of the given kind, or queues it while offline when
    /// queueing is enabled. Returns true only when the frame was handed to
    /// the socket writer.
    pub fn send(&self, kind_name: &str, data: Value) -> bool {
        let mut state = self.lock_inner();
        match outbound_action(state.state, self.options.queue_outbound) {
            SendAction::Transmit => {
                let frame = Frame::new(kind_name, data);
                match serde_json::to_string(&frame) {
                    Ok(text) => match &state.writer {
                        Some(writer) if writer.send(WriterCommand::Text(text)).is_ok() => true,
                        _ => {
                            warn!(kind = kind_name, "connection: writer gone, frame dropped");
                            false
                        }
                    },
                    Err(err) => {
                        warn!(kind = kind_name, "connection: unserializable frame: {err}");
                        false
                    }
                }
            }
            SendAction::Enqueue => {
                debug!(kind = kind_name, "connection: offline, frame queued");
                state.queue.push_back(QueuedFrame {
                    kind: kind_name.to_string(),
                    data,
                    enqueued_at: Utc::now(),
                });
                false
            }
            SendAction::Drop => {
                debug!(kind = kind_name, "connection: offline, frame dropped");
                false
            }
        }
    }

    /// Registers a handler for a frame kind. `kind::WILDCARD` matches every
    /// frame, including the synthetic `connected`/`disconnected` ones.
    pub fn on(
        &self,
        kind_name: &str,
        handler: impl Fn(&Frame) + Send + Sync + 'static,
    ) -> Subscription {
        let mut table = self.lock_handlers();
        table.next_id += 1;
        let id = table.next_id;
        table
            .by_kind
            .entry(kind_name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            kind: kind_name.to_string(),
            id,
        }
    }

    pub fn off(&self, subscription: &Subscription) {
        let mut table = self.lock_handlers();
        if let Some(handlers) = table.by_kind.get_mut(&subscription.kind) {
            handlers.retain(|(id, _)| *id != subscription.id);
            if handlers.is_empty() {
                table.by_kind.remove(&subscription.kind);
            }
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ConnState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, HandlerTable> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn connection_url(&self) -> String {
        let token: String =
            url::form_urlencoded::byte_serialize(self.options.token.as_bytes()).collect();
        format!(
            "{}/ws?token={}",
            self.options.ws_url.trim_end_matches('/'),
            token
        )
    }

    /// Wires up the writer, reader and heartbeat tasks for a fresh socket,
    /// then flushes the outbound queue strictly FIFO.
    fn install_connection(&self, mut sink: Box<dyn FrameSink>, mut stream: Box<dyn FrameStream>) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();

        let writer_task = tokio::spawn(async move {
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Text(text) => {
                        if let Err(err) = sink.send_text(text).await {
                            warn!("connection: transmit failed: {err}");
                            break;
                        }
                    }
                    WriterCommand::CloseNormal => {
                        let _ = sink.close_normal().await;
                        break;
                    }
                }
            }
        });

        let epoch;
        let queued: Vec<QueuedFrame> = {
            let mut state = self.lock_inner();
            state.epoch += 1;
            epoch = state.epoch;
            state.state = ConnectionState::Connected;
            state.attempts = 0;
            state.writer = Some(writer_tx.clone());
            state.writer_task = Some(writer_task);
            state.pong_tx = Some(pong_tx);
            state.queue.drain(..).collect()
        };

        let reader = Arc::clone(&manager);
        let reader_task = tokio::spawn(async move {
            let code = loop {
                match stream.next_event().await {
                    Some(WireEvent::Text(text)) => reader.dispatch_text(&text),
                    Some(WireEvent::Closed { code }) => break code,
                    Some(WireEvent::Failed(err)) => {
                        warn!("connection: read failed: {err}");
                        break ABNORMAL_CLOSE_CODE;
                    }
                    None => break ABNORMAL_CLOSE_CODE,
                }
            };
            reader.handle_connection_lost(epoch, code);
        });

        let heartbeat = manager;
        let heartbeat_writer = writer_tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            heartbeat.run_heartbeat(epoch, heartbeat_writer, pong_rx).await;
        });

        {
            let mut state = self.lock_inner();
            if state.epoch == epoch {
                state.reader_task = Some(reader_task);
                state.heartbeat_task = Some(heartbeat_task);
            }
        }

        info!("connection: established");

        // Queued frames go out before anything a connected-handler sends.
        for item in queued {
            debug!(
                kind = %item.kind,
                enqueued_at = %item.enqueued_at,
                "connection: flushing queued frame"
            );
            let frame = Frame::new(&item.kind, item.data);
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    let _ = writer_tx.send(WriterCommand::Text(text));
                }
                Err(err) => warn!(kind = %item.kind, "connection: queued frame dropped: {err}"),
            }
        }

        self.emit_synthetic(kind::CONNECTED);
    }

    async fn run_heartbeat(
        self: Arc<Self>,
        epoch: u64,
        writer: mpsc::UnboundedSender<WriterCommand>,
        mut pong_rx: mpsc::UnboundedReceiver<()>,
    ) {
        let ping = serde_json::json!({ "type": kind::PING }).to_string();
        loop {
            tokio::time::sleep(self.options.ping_interval).await;
            if self.lock_inner().epoch != epoch {
                return;
            }
            // Only pongs arriving after this ping count.
            while pong_rx.try_recv().is_ok() {}
            if writer.send(WriterCommand::Text(ping.clone())).is_err() {
                return;
            }
            match tokio::time::timeout(self.options.pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => {
                    warn!("connection: pong timeout, forcing close");
                    self.force_close(epoch);
                    return;
                }
            }
        }
    }

    /// Heartbeat-initiated teardown of an unresponsive socket.
    fn force_close(&self, epoch: u64) {
        {
            let mut state = self.lock_inner();
            if state.epoch != epoch || state.state != ConnectionState::Connected {
                return;
            }
            state.state = ConnectionState::Disconnected;
            if let Some(task) = state.reader_task.take() {
                task.abort();
            }
            if let Some(task) = state.writer_task.take() {
                task.abort();
            }
            state.heartbeat_task = None;
            state.writer = None;
            state.pong_tx = None;
            self.schedule_reconnect_locked(&mut state);
        }
        self.emit_synthetic(kind::DISCONNECTED);
    }

    /// Reader-observed closure. Reconnects unless the close was normal
    /// (code 1000) or an explicit disconnect is in progress.
    fn handle_connection_lost(&self, epoch: u64, code: u16) {
        {
            let mut state = self.lock_inner();
            if state.epoch != epoch || state.state == ConnectionState::Disconnected {
                return;
            }
            state.state = ConnectionState::Disconnected;
            state.reader_task = None;
            if let Some(task) = state.writer_task.take() {
                task.abort();
            }
            if let Some(task) = state.heartbeat_task.take() {
                task.abort();
            }
            state.writer = None;
            state.pong_tx = None;
            if code != NORMAL_CLOSE_CODE && !state.explicit_disconnect {
                self.schedule_reconnect_locked(&mut state);
            }
        }
        info!(code, "connection: closed");
        self.emit_synthetic(kind::DISCONNECTED);
    }

    fn schedule_reconnect_locked(&self, state: &mut ConnState) {
        if state.reconnect_task.is_some() || state.explicit_disconnect {
            return;
        }
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        if let Some(max) = self.options.max_reconnect_attempts {
            if state.attempts >= max {
                error!(attempts = state.attempts, "connection: reconnect attempts exhausted");
                return;
            }
        }
        state.attempts += 1;
        let attempt = state.attempts;
        let delay = reconnect_delay(self.options.reconnect_base, attempt);
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "connection: scheduling reconnect"
        );
        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = manager.lock_inner();
                state.reconnect_task = None;
                if state.explicit_disconnect {
                    return;
                }
            }
            if let Err(err) = manager.connect().await {
                warn!(attempt, "connection: reconnect failed: {err}");
                let mut state = manager.lock_inner();
                if !state.explicit_disconnect && state.state == ConnectionState::Disconnected {
                    manager.schedule_reconnect_locked(&mut state);
                }
            }
        }));
    }

    fn dispatch_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("connection: dropping malformed frame: {err}");
                return;
            }
        };
        if frame.kind == kind::PONG {
            if let Some(pong_tx) = self.lock_inner().pong_tx.as_ref() {
                let _ = pong_tx.send(());
            }
            return;
        }
        self.emit(&frame);
    }

    fn emit_synthetic(&self, kind_name: &str) {
        self.emit(&Frame::empty(kind_name));
    }

    /// Dispatches to kind-specific handlers, then wildcard handlers. The
    /// table is snapshotted first so a handler may subscribe, unsubscribe or
    /// send without deadlocking.
    fn emit(&self, frame: &Frame) {
        let snapshot: Vec<FrameHandler> = {
            let table = self.lock_handlers();
            table
                .by_kind
                .get(&frame.kind)
                .into_iter()
                .chain(table.by_kind.get(kind::WILDCARD))
                .flatten()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(frame))).is_err() {
                error!(kind = %frame.kind, "connection: frame handler panicked");
            }
        }
    }
}
