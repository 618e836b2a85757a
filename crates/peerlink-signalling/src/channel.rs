//! Reconnecting signalling channel.
//!
//! ```text
//!   connect(url) ──▶ Connecting ──handshake──▶ Open ──socket closed──▶ Closed
//!                        ▲                                              │
//!                        └──────── reconnect after fixed delay ◀────────┘
//!                                  (only if still Closed/Closing)
//! ```
//!
//! Every socket gets a generation number. Tearing a socket down bumps the generation, so
//! anything the old socket task still reports (messages, close, errors) is ignored.
//!
//! Requests (`request_identity`, `request_session_id`, ...) install a one-shot listener
//! first and only then send their question, so the answer can never overtake the
//! listener. Concurrent requests of the same kind are served first-come first-served.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use peerlink_common::config::SignallingConfig;
use peerlink_common::protocol::{
    Answer, AvailableStream, BindOffer, IceNegotiation, MediaNegotiation, PeerIdAnswer,
};
use peerlink_common::{IceCandidateInit, Message, Question, SessionBind, SessionDescription};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, trace, warn};

use crate::error::{SignallingError, SignallingResult};
use crate::listeners::{ListenerHandle, Listeners};
use crate::registry::{IceHandler, MediaHandler, RouteOutcome, SessionRegistry, SessionRoute};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Transport state of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lifecycle and status notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Error(String),
    /// Human-readable report of a swallowed failure (e.g. a send on a closed socket).
    Status(String),
}

/// Reconnection policy.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl From<&SignallingConfig> for ChannelOptions {
    fn from(cfg: &SignallingConfig) -> Self {
        Self {
            reconnect: cfg.reconnect,
            reconnect_delay: cfg.reconnect_delay(),
        }
    }
}

/// The socket currently owned by the channel.
struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<WsMessage>,
    task: JoinHandle<()>,
}

struct Inner {
    url: Mutex<Option<String>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    /// Configured policy, toggled by `set_reconnect`.
    reconnect: AtomicBool,
    /// Set by `close`, cleared by `connect`.
    closed: AtomicBool,
    reconnect_delay: Duration,
    /// At most one reconnect may be pending at a time.
    reconnect_pending: AtomicBool,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Listeners>,
    registry: SessionRegistry,
}

/// Persistent, reconnecting duplex channel to the signalling server.
///
/// Cheap to clone; all clones share the same socket, listeners and session registry.
///
/// ```rust,no_run
/// use peerlink_signalling::SignallingChannel;
///
/// # async fn run() -> peerlink_signalling::SignallingResult<()> {
/// let channel = SignallingChannel::new(Default::default());
/// channel.connect("ws://192.168.2.2:6021").await;
/// let consumer_id = channel.request_identity().await?;
/// let session_id = channel.request_session_id(&consumer_id, "producer-1").await?;
/// # let _ = session_id;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SignallingChannel {
    inner: Arc<Inner>,
}

impl SignallingChannel {
    pub fn new(options: ChannelOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                url: Mutex::new(None),
                state,
                events,
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnect: AtomicBool::new(options.reconnect),
                closed: AtomicBool::new(false),
                reconnect_delay: options.reconnect_delay,
                reconnect_pending: AtomicBool::new(false),
                reconnect_timer: Mutex::new(None),
                listeners: Mutex::new(Listeners::new()),
                registry: SessionRegistry::new(),
            }),
        }
    }

    /// Subscribe to lifecycle and status events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn set_reconnect(&self, enabled: bool) {
        self.inner.reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Resolves once the socket is open.
    pub async fn wait_until_open(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Open).await;
    }

    /// Number of one-shot listeners still waiting for a message.
    pub async fn pending_listeners(&self) -> usize {
        self.inner.listeners.lock().await.len()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    /// Open the channel. Never fails: an unusable URL is logged and leaves the channel
    /// closed, connection failures are reported as events and retried per policy.
    pub async fn connect(&self, url: &str) {
        if let Err(e) = validate_url(url) {
            error!(url, error = %e, "Cannot open signalling channel");
            self.emit(ChannelEvent::Error(e.to_string()));
            self.inner.state.send_replace(ConnectionState::Closed);
            return;
        }

        self.inner.closed.store(false, Ordering::SeqCst);
        *self.inner.url.lock().await = Some(url.to_owned());
        self.teardown().await;
        self.open(url.to_owned()).await;
    }

    /// Close the channel: drop every listener, stop reconnecting and close the socket.
    pub async fn close(&self, reason: &str) {
        info!(reason, "Closing signalling channel");
        self.inner.closed.store(true, Ordering::SeqCst);

        if let Some(timer) = self.inner.reconnect_timer.lock().await.take() {
            timer.abort();
        }
        self.inner.reconnect_pending.store(false, Ordering::SeqCst);
        self.inner.listeners.lock().await.clear();

        let was_open = self.state() == ConnectionState::Open;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = self.inner.connection.lock().await.take() {
            if was_open {
                self.inner.state.send_replace(ConnectionState::Closing);
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.to_owned().into(),
                };
                // Dropping `outbound` afterwards lets the socket task flush this and exit.
                let _ = conn.outbound.send(WsMessage::Close(Some(frame)));
            } else {
                conn.task.abort();
            }
        }
        self.inner.state.send_replace(ConnectionState::Closed);
    }

    async fn open(&self, url: String) {
        let mut slot = self.inner.connection.lock().await;
        // `close` sets the flag before it takes this lock, so a late reconnect stops here.
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!(%url, "Channel closed, not opening socket");
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, rx) = mpsc::unbounded_channel();
        self.inner.state.send_replace(ConnectionState::Connecting);

        debug!(%url, generation, "Opening signalling socket");
        let task = tokio::spawn(run_socket(self.clone(), url, generation, rx));
        *slot = Some(Connection {
            generation,
            outbound,
            task,
        });
    }

    /// Forget the current socket. Its task is aborted and anything it still reports is stale.
    async fn teardown(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = self.inner.connection.lock().await.take() {
            debug!(generation = conn.generation, "Tearing down signalling socket");
            conn.task.abort();
        }
    }

    /// Boxed: `open` spawns the socket task, which may land back here via `on_close`.
    fn reconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Some(url) = self.inner.url.lock().await.clone() else {
                return;
            };
            info!(%url, "Reconnecting to signalling server");
            self.teardown().await;
            self.open(url).await;
        })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn on_open(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        info!(generation, "Signalling channel open");
        self.inner.state.send_replace(ConnectionState::Open);
        self.emit(ChannelEvent::Open);
    }

    fn on_error(&self, generation: u64, reason: String) {
        if !self.is_current(generation) {
            return;
        }
        warn!(generation, error = %reason, "Signalling socket error");
        self.emit(ChannelEvent::Error(reason));
    }

    async fn on_close(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        {
            let mut slot = self.inner.connection.lock().await;
            if slot.as_ref().is_some_and(|c| c.generation == generation) {
                slot.take();
            }
        }
        info!(generation, "Signalling channel closed");
        self.inner.state.send_replace(ConnectionState::Closed);
        self.emit(ChannelEvent::Close);

        let wants_reconnect = self.inner.reconnect.load(Ordering::SeqCst)
            && !self.inner.closed.load(Ordering::SeqCst);
        if wants_reconnect {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(&self) {
        let mut timer = self.inner.reconnect_timer.lock().await;
        if self.inner.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already scheduled");
            return;
        }

        let delay = self.inner.reconnect_delay;
        info!(?delay, "Scheduling signalling reconnect");
        let channel = self.clone();
        *timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            channel.inner.reconnect_pending.store(false, Ordering::SeqCst);
            match channel.state() {
                ConnectionState::Closed | ConnectionState::Closing => channel.reconnect().await,
                state => debug!(?state, "Skipping reconnect, socket already active"),
            }
        }));
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Best-effort send. Failures are logged and reported as [`ChannelEvent::Status`].
    async fn send(&self, message: Message) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode signalling message");
                self.emit(ChannelEvent::Status(format!("Failed to encode message: {e}")));
                return false;
            }
        };

        let conn = self.inner.connection.lock().await;
        let result = match conn.as_ref() {
            Some(c) if self.state() == ConnectionState::Open => c
                .outbound
                .send(WsMessage::Text(text.into()))
                .map_err(|_| "socket task stopped".to_string()),
            _ => Err(format!("socket is {:?}", self.state())),
        };

        match result {
            Ok(()) => true,
            Err(reason) => {
                warn!(%reason, "Failed to send signalling message");
                self.emit(ChannelEvent::Status(format!("Failed to send message: {reason}")));
                false
            }
        }
    }

    /// Forward a local candidate. Returns whether it was queued on an open socket.
    pub async fn send_ice_candidate(
        &self,
        session_id: &str,
        consumer_id: &str,
        producer_id: &str,
        candidate: IceCandidateInit,
    ) -> bool {
        let msg = IceNegotiation {
            bind: SessionBind::new(session_id, consumer_id, producer_id),
            ice: candidate,
        };
        trace!(session = session_id, "Sending ICE candidate");
        self.send(msg.into()).await
    }

    /// Forward a local description. Returns whether it was queued on an open socket.
    pub async fn send_media_description(
        &self,
        session_id: &str,
        consumer_id: &str,
        producer_id: &str,
        sdp: SessionDescription,
    ) -> bool {
        let msg = MediaNegotiation {
            bind: SessionBind::new(session_id, consumer_id, producer_id),
            sdp,
        };
        debug!(session = session_id, kind = ?msg.sdp.kind, "Sending session description");
        self.send(msg.into()).await
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Ask the server for a consumer identity.
    pub async fn request_identity(&self) -> SignallingResult<String> {
        let (tx, rx) = oneshot::channel();
        self.listen(
            |msg| matches!(msg, Message::Answer(Answer::PeerId(_))),
            move |msg| {
                if let Message::Answer(Answer::PeerId(PeerIdAnswer { id })) = msg {
                    let _ = tx.send(id);
                }
            },
        )
        .await;

        let id = self.ask(Question::PeerId, rx).await?;
        info!(consumer = %id, "Received consumer identity");
        Ok(id)
    }

    /// Ask the server to open a session between `consumer_id` and `producer_id`.
    ///
    /// Answers without a `session_id`, or for a different consumer/producer pair, are ignored.
    pub async fn request_session_id(
        &self,
        consumer_id: &str,
        producer_id: &str,
    ) -> SignallingResult<String> {
        let (tx, rx) = oneshot::channel();
        let (consumer, producer) = (consumer_id.to_owned(), producer_id.to_owned());
        self.listen(
            move |msg| match msg {
                Message::Answer(Answer::StartSession(bind)) => {
                    bind.session_id.is_some()
                        && bind.consumer_id == consumer
                        && bind.producer_id == producer
                }
                _ => false,
            },
            move |msg| {
                if let Message::Answer(Answer::StartSession(bind)) = msg {
                    if let Some(session_id) = bind.session_id {
                        let _ = tx.send(session_id);
                    }
                }
            },
        )
        .await;

        let question = Question::StartSession(BindOffer {
            consumer_id: consumer_id.to_owned(),
            producer_id: producer_id.to_owned(),
        });
        let session_id = self.ask(question, rx).await?;
        info!(session = %session_id, consumer = consumer_id, producer = producer_id, "Session id assigned");
        Ok(session_id)
    }

    /// Ask the server for the producers it currently advertises.
    pub async fn request_available_streams(&self) -> SignallingResult<Vec<AvailableStream>> {
        let (tx, rx) = oneshot::channel();
        self.subscribe_available_streams(move |streams| {
            let _ = tx.send(streams);
        })
        .await;
        self.ask(Question::AvailableStreams, rx).await
    }

    /// Wait for the socket, send `question`, then wait for the listener behind `rx`.
    async fn ask<T>(&self, question: Question, mut rx: oneshot::Receiver<T>) -> SignallingResult<T> {
        tokio::select! {
            _ = self.wait_until_open() => {}
            answer = &mut rx => return answer.map_err(|_| SignallingError::Cancelled),
        }
        self.send(question.into()).await;
        rx.await.map_err(|_| SignallingError::Cancelled)
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    async fn listen(
        &self,
        accepts: impl Fn(&Message) -> bool + Send + Sync + 'static,
        deliver: impl FnOnce(Message) + Send + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.lock().await.insert(accepts, deliver)
    }

    /// Remove a listener before it fires. Idempotent.
    pub async fn unsubscribe(&self, handle: ListenerHandle) {
        self.inner.listeners.lock().await.remove(handle);
    }

    /// Fire `callback(session_id, reason)` once, when the server ends exactly this session.
    pub async fn subscribe_end_session(
        &self,
        consumer_id: &str,
        producer_id: &str,
        session_id: &str,
        callback: impl FnOnce(String, String) + Send + 'static,
    ) -> ListenerHandle {
        let expected = SessionBind::new(session_id, consumer_id, producer_id);
        self.listen(
            move |msg| matches!(msg, Message::Question(Question::EndSession(q)) if q.bind == expected),
            move |msg| {
                if let Message::Question(Question::EndSession(q)) = msg {
                    callback(q.bind.session_id, q.reason);
                }
            },
        )
        .await
    }

    /// Fire `callback` once with the next advertised stream list.
    pub async fn subscribe_available_streams(
        &self,
        callback: impl FnOnce(Vec<AvailableStream>) + Send + 'static,
    ) -> ListenerHandle {
        self.listen(
            |msg| matches!(msg, Message::Answer(Answer::AvailableStreams(_))),
            move |msg| {
                if let Message::Answer(Answer::AvailableStreams(streams)) = msg {
                    callback(streams);
                }
            },
        )
        .await
    }

    // ── Session registry ─────────────────────────────────────────────────────

    pub async fn register_session(
        &self,
        session_id: &str,
        consumer_id: &str,
        producer_id: &str,
        on_ice: Option<IceHandler>,
        on_media: Option<MediaHandler>,
    ) {
        let route = SessionRoute {
            consumer_id: consumer_id.to_owned(),
            producer_id: producer_id.to_owned(),
            on_ice,
            on_media,
        };
        if self.inner.registry.register(session_id.to_owned(), route).await {
            debug!(session = session_id, "Replaced existing session registration");
        } else {
            debug!(session = session_id, "Session registered");
        }
    }

    pub async fn unregister_session(&self, session_id: &str) {
        if self.inner.registry.remove(session_id).await {
            debug!(session = session_id, "Session unregistered");
        }
    }

    pub async fn is_session_registered(&self, session_id: &str) -> bool {
        self.inner.registry.contains(session_id).await
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Route one inbound text frame.
    ///
    /// Negotiation messages go to the registered session whose routing triple matches
    /// exactly; everything else is offered to the pending one-shot listeners. Malformed
    /// and unmatched messages are dropped.
    pub async fn handle_message(&self, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signalling message");
                return;
            }
        };

        match message {
            Message::Negotiation(negotiation) => {
                match self.inner.registry.route(negotiation).await {
                    RouteOutcome::Dispatched => {}
                    outcome => trace!(?outcome, "Negotiation message not dispatched"),
                }
            }
            other => {
                let matched = self.inner.listeners.lock().await.take_match(other);
                match matched {
                    Some(matched) => matched.deliver(),
                    None => trace!("No listener for signalling message"),
                }
            }
        }
    }
}

/// Drive one socket until it closes or is torn down.
async fn run_socket(
    channel: SignallingChannel,
    url: String,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            channel.on_error(generation, format!("Failed to connect to {url}: {e}"));
            channel.on_close(generation).await;
            return;
        }
    };
    channel.on_open(generation);

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        channel.on_error(generation, format!("Send failed: {e}"));
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if channel.is_current(generation) {
                        channel.handle_message(text.as_str()).await;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(generation, ?frame, "Server closed signalling socket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    channel.on_error(generation, e.to_string());
                    break;
                }
                None => break,
            },
        }
    }

    channel.on_close(generation).await;
}

fn validate_url(raw: &str) -> SignallingResult<url::Url> {
    let invalid = |reason: String| SignallingError::InvalidUrl {
        url: raw.to_owned(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSignallingServer;
    use std::sync::Mutex as StdMutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_options() -> ChannelOptions {
        ChannelOptions {
            reconnect: true,
            reconnect_delay: Duration::from_millis(100),
        }
    }

    async fn connected(server: &MockSignallingServer, options: ChannelOptions) -> SignallingChannel {
        let channel = SignallingChannel::new(options);
        channel.connect(&server.url()).await;
        timeout(WAIT, channel.wait_until_open()).await.expect("channel should open");
        channel
    }

    const PEER_ID_ANSWER: &str =
        r#"{"type":"answer","content":{"type":"peerId","content":{"id":"abc"}}}"#;

    #[tokio::test]
    async fn request_identity_resolves_and_removes_listener() {
        let mut server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_identity().await }
        });

        let question = server.next_frame().await.expect("question sent");
        let value: serde_json::Value = serde_json::from_str(&question).unwrap();
        assert_eq!(value["type"], "question");
        assert_eq!(value["content"]["type"], "peerId");

        server.send(PEER_ID_ANSWER).await;
        let id = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(id, "abc");
        assert_eq!(channel.pending_listeners().await, 0);

        // A duplicate answer finds nobody waiting.
        channel.handle_message(PEER_ID_ANSWER).await;
        assert_eq!(channel.pending_listeners().await, 0);
    }

    #[tokio::test]
    async fn request_identity_survives_noise() {
        let mut server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_identity().await }
        });
        server.next_frame().await.expect("question sent");

        server.send("this is not json").await;
        server
            .send(r#"{"type":"answer","content":{"type":"availableStreams","content":[]}}"#)
            .await;
        server.send(PEER_ID_ANSWER).await;

        let id = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(id, "abc");
    }

    #[tokio::test]
    async fn session_id_answer_without_id_is_ignored() {
        let mut server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_session_id("c", "p").await }
        });
        let question = server.next_frame().await.expect("question sent");
        let value: serde_json::Value = serde_json::from_str(&question).unwrap();
        assert_eq!(value["content"]["type"], "startSession");
        assert_eq!(value["content"]["content"]["producer_id"], "p");

        server
            .send(r#"{"type":"answer","content":{"type":"startSession","content":{"consumer_id":"c","producer_id":"p"}}}"#)
            .await;
        server
            .send(r#"{"type":"answer","content":{"type":"startSession","content":{"consumer_id":"c","producer_id":"p","session_id":"s1"}}}"#)
            .await;

        let session = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(session, "s1");
    }

    #[tokio::test]
    async fn end_session_requires_exact_triple() {
        let channel = SignallingChannel::new(fast_options());
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        channel
            .subscribe_end_session("c", "p", "s", move |session, reason| {
                sink.lock().unwrap().push((session, reason));
            })
            .await;

        let end = |c: &str, p: &str, s: &str| {
            format!(
                r#"{{"type":"question","content":{{"type":"endSession","content":{{"consumer_id":"{c}","producer_id":"{p}","session_id":"{s}","reason":"bye"}}}}}}"#
            )
        };
        channel.handle_message(&end("c", "p", "other")).await;
        channel.handle_message(&end("x", "p", "s")).await;
        assert!(fired.lock().unwrap().is_empty());

        channel.handle_message(&end("c", "p", "s")).await;
        channel.handle_message(&end("c", "p", "s")).await;
        assert_eq!(*fired.lock().unwrap(), vec![("s".to_string(), "bye".to_string())]);
    }

    #[tokio::test]
    async fn negotiation_routed_only_to_registered_triple() {
        let channel = SignallingChannel::new(fast_options());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_ice: IceHandler = Arc::new(move |c: IceCandidateInit| {
            sink.lock().unwrap().push(c.candidate_str().to_owned());
        });
        channel.register_session("s", "c", "p", Some(on_ice), None).await;

        let ice = |c: &str, p: &str| {
            format!(
                r#"{{"type":"negotiation","content":{{"type":"iceNegotiation","content":{{"session_id":"s","consumer_id":"{c}","producer_id":"{p}","ice":{{"candidate":"cand-{c}"}}}}}}}}"#
            )
        };
        channel.handle_message(&ice("intruder", "p")).await;
        channel.handle_message(&ice("c", "p")).await;
        assert_eq!(*seen.lock().unwrap(), vec!["cand-c".to_string()]);

        channel.unregister_session("s").await;
        channel.unregister_session("s").await;
        channel.handle_message(&ice("c", "p")).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_on_closed_socket_reports_status() {
        let channel = SignallingChannel::new(fast_options());
        let mut events = channel.subscribe();
        let sent = channel
            .send_ice_candidate("s", "c", "p", IceCandidateInit::new("candidate:1"))
            .await;
        assert!(!sent);
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ChannelEvent::Status(text) => assert!(text.contains("Failed to send")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_url_leaves_channel_closed() {
        let channel = SignallingChannel::new(fast_options());
        let mut events = channel.subscribe();
        channel.connect("not a url").await;
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert!(matches!(events.try_recv(), Ok(ChannelEvent::Error(_))));

        channel.connect("http://example.com/ws").await;
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn reconnects_once_after_server_drop() {
        let server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;
        let mut events = channel.subscribe();
        assert_eq!(server.wait_for_connections(1).await, 1);

        server.drop_connection().await;
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap().unwrap(), ChannelEvent::Close);
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap().unwrap(), ChannelEvent::Open);
        assert_eq!(server.wait_for_connections(2).await, 2);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(server.connections(), 2);
        assert_eq!(channel.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn pending_reconnect_skips_when_already_open() {
        let server = MockSignallingServer::start().await.unwrap();
        let options = ChannelOptions {
            reconnect: true,
            reconnect_delay: Duration::from_millis(400),
        };
        let channel = connected(&server, options).await;
        let mut events = channel.subscribe();

        server.drop_connection().await;
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap().unwrap(), ChannelEvent::Close);

        // Reopen by hand before the timer fires.
        channel.connect(&server.url()).await;
        timeout(WAIT, channel.wait_until_open()).await.unwrap();
        assert_eq!(server.wait_for_connections(2).await, 2);

        sleep(Duration::from_millis(700)).await;
        assert_eq!(server.connections(), 2);
        assert_eq!(channel.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn no_reconnect_when_disabled() {
        let server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;
        channel.set_reconnect(false);

        server.drop_connection().await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(server.connections(), 1);
        assert_eq!(channel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn close_cancels_pending_requests() {
        let mut server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_identity().await }
        });
        server.next_frame().await.expect("question sent");

        channel.close("user requested").await;
        let result = timeout(WAIT, request).await.unwrap().unwrap();
        assert!(matches!(result, Err(SignallingError::Cancelled)));
        assert_eq!(channel.state(), ConnectionState::Closed);

        // Closing twice is harmless.
        channel.close("again").await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn send_on_open_socket_reaches_server() {
        let mut server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        let sent = channel
            .send_media_description("s", "c", "p", SessionDescription::answer("v=0"))
            .await;
        assert!(sent);

        let frame = server.next_frame().await.expect("description sent");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["content"]["type"], "mediaNegotiation");
        assert_eq!(value["content"]["content"]["sdp"]["type"], "answer");
    }

    const STREAMS_ANSWER: &str = r#"{"type":"answer","content":{"type":"availableStreams","content":[{"id":"cam-1","name":"Front"}]}}"#;

    #[tokio::test]
    async fn request_available_streams_round_trip() {
        let mut server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        let request = tokio::spawn({
            let channel = channel.clone();
            async move { channel.request_available_streams().await }
        });

        let question = server.next_frame().await.expect("question sent");
        let value: serde_json::Value = serde_json::from_str(&question).unwrap();
        assert_eq!(value["type"], "question");
        assert_eq!(value["content"]["type"], "availableStreams");

        server.send(STREAMS_ANSWER).await;
        let streams = timeout(WAIT, request).await.unwrap().unwrap().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].id, "cam-1");
        assert_eq!(streams[0].name, "Front");
        assert_eq!(channel.pending_listeners().await, 0);
    }

    #[tokio::test]
    async fn available_streams_listener_fires_once() {
        let channel = SignallingChannel::new(fast_options());
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        channel
            .subscribe_available_streams(move |streams| {
                sink.lock().unwrap().push(streams.len());
            })
            .await;
        assert_eq!(channel.pending_listeners().await, 1);

        channel.handle_message(PEER_ID_ANSWER).await;
        assert!(fired.lock().unwrap().is_empty());

        channel.handle_message(STREAMS_ANSWER).await;
        channel.handle_message(STREAMS_ANSWER).await;
        assert_eq!(*fired.lock().unwrap(), vec![1]);
        assert_eq!(channel.pending_listeners().await, 0);
    }

    #[tokio::test]
    async fn unsubscribed_listener_never_fires() {
        let channel = SignallingChannel::new(fast_options());
        let fired = Arc::new(StdMutex::new(0));
        let sink = Arc::clone(&fired);
        let handle = channel
            .subscribe_available_streams(move |_| *sink.lock().unwrap() += 1)
            .await;

        channel.unsubscribe(handle).await;
        channel.unsubscribe(handle).await;
        channel.handle_message(STREAMS_ANSWER).await;
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn reconnect_after_close_does_not_reopen() {
        let server = MockSignallingServer::start().await.unwrap();
        let channel = connected(&server, fast_options()).await;

        channel.close("user requested").await;
        // A timer that already passed its sleep when `close` ran still gets here.
        channel.reconnect().await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(channel.state(), ConnectionState::Closed);
        assert_eq!(server.connections(), 1);
        assert!(channel.inner.connection.lock().await.is_none());
    }
}
