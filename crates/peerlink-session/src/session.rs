//! Negotiation session: one peer connection for one producer and one server-issued session id.
//!
//! ```text
//!   Creating ──remote offer──▶ Negotiating ──engine connected──▶ Connected
//!      │                           │  ▲                              │
//!      │                 step fails│  │next offer          ICE failed│──▶ ICE restart
//!      │                           ▼  │                              │
//!      │                       (stays open)                 conn failed
//!      │                                                             ▼
//!      └────────────── end() / server endSession ─────────────▶   Ended
//! ```
//!
//! Inbound negotiation (routed here by the signalling channel) and engine events are
//! handled on a single task per session, each event on its own. Nothing is assumed about
//! their relative order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use peerlink_common::config::SessionConfig;
use peerlink_common::{IceCandidateInit, SdpType, SessionBind, SessionDescription};
use peerlink_signalling::{IceHandler, ListenerHandle, MediaHandler, SignallingChannel};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::{
    EngineEvent, IceConnectionState, MediaKind, PeerConnection, PeerConnectionState, RemoteTrack,
};
use crate::ice::{CandidateFilter, CandidateVerdict, extract_ipv4};

/// Upper bound for the receiver playback delay.
pub const MAX_PLAYBACK_DELAY_MS: i64 = 4000;

const CONNECTION_FAILED: &str = "PeerConnection failed";

/// What a session reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(String),
    /// A remote IPv4 address seen for the first time in a candidate.
    AddressDiscovered(String),
    Connected,
    Track(RemoteTrack),
    /// The session is being torn down for `reason`. Not emitted for an explicit `end()`.
    Closed { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub address_filter: Vec<String>,
    pub protocol_filter: Vec<String>,
    pub playback_delay_ms: Option<i64>,
}

impl From<&SessionConfig> for SessionOptions {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            address_filter: cfg.ice_addresses.clone(),
            protocol_filter: cfg.ice_protocols.clone(),
            playback_delay_ms: Some(cfg.playback_delay_ms),
        }
    }
}

enum Inbound {
    Ice(IceCandidateInit),
    Media(SessionDescription),
    EndSession(String),
}

struct State {
    status: String,
    available_addresses: Vec<String>,
    filter: CandidateFilter,
    playback_delay_ms: Option<i64>,
}

struct Inner {
    bind: SessionBind,
    channel: SignallingChannel,
    engine: Arc<dyn PeerConnection>,
    state: RwLock<State>,
    ended: AtomicBool,
    cancel: CancellationToken,
    /// Dropped at `end()` so observers see the stream close.
    events: RwLock<Option<broadcast::Sender<SessionEvent>>>,
    end_listener: Mutex<Option<ListenerHandle>>,
}

/// Negotiation lifecycle for a single (consumer, producer, session) triple.
///
/// Cheap to clone; clones share the same peer connection.
#[derive(Clone)]
pub struct NegotiationSession {
    inner: Arc<Inner>,
}

impl NegotiationSession {
    /// Create the session, configure the engine and register with the channel.
    ///
    /// From here on, negotiation messages for `bind` are routed to this session.
    pub async fn start(
        bind: SessionBind,
        channel: SignallingChannel,
        engine: Arc<dyn PeerConnection>,
        options: SessionOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let engine_events = engine.subscribe();
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        let session = Self {
            inner: Arc::new(Inner {
                bind,
                channel,
                engine,
                state: RwLock::new(State {
                    status: "Creating".into(),
                    available_addresses: Vec::new(),
                    filter: CandidateFilter::new(options.address_filter, options.protocol_filter),
                    playback_delay_ms: None,
                }),
                ended: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                events: RwLock::new(Some(events)),
                end_listener: Mutex::new(None),
            }),
        };

        info!(
            session = %session.id(),
            consumer = %session.consumer_id(),
            producer = %session.producer_id(),
            "Creating negotiation session"
        );

        if let Err(e) = session.inner.engine.add_recv_only_video() {
            session
                .report(format!("Failed to add video transceiver: {e}"))
                .await;
        }

        session.register(inbox).await;
        if let Some(delay) = options.playback_delay_ms {
            session.set_playback_delay(delay).await;
        }

        tokio::spawn(session.clone().run(inbox_rx, engine_events));
        session
    }

    async fn register(&self, inbox: mpsc::UnboundedSender<Inbound>) {
        let bind = &self.inner.bind;

        let ice_tx = inbox.clone();
        let on_ice: IceHandler = Arc::new(move |candidate| {
            let _ = ice_tx.send(Inbound::Ice(candidate));
        });
        let media_tx = inbox.clone();
        let on_media: MediaHandler = Arc::new(move |desc| {
            let _ = media_tx.send(Inbound::Media(desc));
        });
        self.inner
            .channel
            .register_session(
                &bind.session_id,
                &bind.consumer_id,
                &bind.producer_id,
                Some(on_ice),
                Some(on_media),
            )
            .await;

        let handle = self
            .inner
            .channel
            .subscribe_end_session(
                &bind.consumer_id,
                &bind.producer_id,
                &bind.session_id,
                move |_, reason| {
                    let _ = inbox.send(Inbound::EndSession(reason));
                },
            )
            .await;
        *self.inner.end_listener.lock().await = Some(handle);
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.inner.bind.session_id
    }

    pub fn consumer_id(&self) -> &str {
        &self.inner.bind.consumer_id
    }

    pub fn producer_id(&self) -> &str {
        &self.inner.bind.producer_id
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> String {
        self.inner.state.read().await.status.clone()
    }

    /// Remote IPv4 addresses seen in candidates, in discovery order.
    pub async fn available_addresses(&self) -> Vec<String> {
        self.inner.state.read().await.available_addresses.clone()
    }

    /// Subscribe to session events. After `end()` the returned receiver is already closed.
    pub async fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        match self.inner.events.read().await.as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    // ── Runtime knobs ────────────────────────────────────────────────────────

    pub async fn set_address_filter(&self, addresses: impl IntoIterator<Item = impl Into<String>>) {
        self.inner.state.write().await.filter.set_addresses(addresses);
    }

    pub async fn set_protocol_filter(&self, protocols: impl IntoIterator<Item = impl Into<String>>) {
        self.inner.state.write().await.filter.set_protocols(protocols);
    }

    /// Trade latency for jitter resilience. The delay is clamped to `0..=4000` ms and
    /// applied to every active video receiver; it is re-applied when new tracks arrive.
    ///
    /// Returns the clamped delay.
    pub async fn set_playback_delay(&self, delay_ms: i64) -> Duration {
        let clamped = delay_ms.clamp(0, MAX_PLAYBACK_DELAY_MS);
        self.inner.state.write().await.playback_delay_ms = Some(clamped);
        let applied = self.apply_playback_delay(clamped);
        debug!(session = %self.id(), delay_ms = clamped, receivers = applied, "Playback delay set");
        Duration::from_millis(clamped.unsigned_abs())
    }

    fn apply_playback_delay(&self, delay_ms: i64) -> usize {
        let target = Duration::from_millis(delay_ms.unsigned_abs());
        let hint = (delay_ms > 0).then_some(target);
        let mut applied = 0;
        for receiver in self.inner.engine.receivers() {
            if receiver.kind() != MediaKind::Video {
                continue;
            }
            receiver.set_jitter_buffer_target(target);
            receiver.set_playout_delay_hint(hint);
            applied += 1;
        }
        applied
    }

    // ── Event loop ───────────────────────────────────────────────────────────

    async fn run(
        self,
        mut inbox: mpsc::UnboundedReceiver<Inbound>,
        mut engine_events: broadcast::Receiver<EngineEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                inbound = inbox.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound).await,
                    None => break,
                },
                event = engine_events.recv() => match event {
                    Ok(event) => self.handle_engine_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(session = %self.id(), missed, "Session lagged behind engine events");
                        self.resync_connection_state().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(session = %self.id(), "Engine event stream closed");
                        break;
                    }
                },
            }
        }
        debug!(session = %self.id(), "Session task stopped");
    }

    /// Skipped engine events may have included a terminal state change; read it back.
    async fn resync_connection_state(&self) {
        let state = self.inner.engine.connection_state();
        if state == PeerConnectionState::Failed {
            self.report(format!("Connection {state}")).await;
            self.close_with(CONNECTION_FAILED.into()).await;
        }
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Ice(candidate) => self.on_incoming_ice(candidate).await,
            Inbound::Media(desc) => self.on_remote_description(desc).await,
            Inbound::EndSession(reason) => {
                info!(session = %self.id(), %reason, "Server ended session");
                self.close_with(reason).await;
            }
        }
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        if self.is_ended() {
            return;
        }
        match event {
            EngineEvent::LocalCandidate(Some(candidate)) => {
                let bind = &self.inner.bind;
                let sent = self
                    .inner
                    .channel
                    .send_ice_candidate(
                        &bind.session_id,
                        &bind.consumer_id,
                        &bind.producer_id,
                        candidate,
                    )
                    .await;
                if !sent {
                    debug!(session = %self.id(), "Local candidate not forwarded");
                }
            }
            EngineEvent::LocalCandidate(None) => {
                trace!(session = %self.id(), "Local candidate gathering finished");
            }
            EngineEvent::Track(track) => {
                info!(session = %self.id(), track = %track.id, kind = ?track.kind, "Remote track added");
                if let Some(delay) = self.inner.state.read().await.playback_delay_ms {
                    self.apply_playback_delay(delay);
                }
                self.emit(SessionEvent::Track(track)).await;
            }
            EngineEvent::ConnectionState(state) => {
                self.report(format!("Connection {state}")).await;
                match state {
                    PeerConnectionState::Connected => self.emit(SessionEvent::Connected).await,
                    PeerConnectionState::Failed => self.close_with(CONNECTION_FAILED.into()).await,
                    _ => {}
                }
            }
            EngineEvent::IceConnectionState(state) => {
                self.report(format!("ICE connection {state}")).await;
                if state == IceConnectionState::Failed {
                    warn!(session = %self.id(), "ICE failed, restarting ICE");
                    self.inner.engine.restart_ice();
                }
            }
            EngineEvent::IceGatheringState(state) => {
                debug!(session = %self.id(), %state, "ICE gathering state changed");
            }
            EngineEvent::SignalingState(state) => {
                debug!(session = %self.id(), %state, "Signaling state changed");
            }
        }
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    /// Handle a remote description: set it, and for an offer, answer it.
    ///
    /// A failing step is reported and abandons this offer only; the session stays open
    /// for the next one.
    pub async fn on_remote_description(&self, desc: SessionDescription) {
        if self.is_ended() {
            return;
        }
        let engine = &self.inner.engine;
        let kind = desc.kind;

        self.report(format!("Received remote {kind:?}")).await;
        if let Err(e) = engine.set_remote_description(desc).await {
            self.report(format!("Failed to set remote description: {e}")).await;
            return;
        }
        if kind != SdpType::Offer || self.is_ended() {
            return;
        }

        let answer = match engine.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.report(format!("Failed to create answer: {e}")).await;
                return;
            }
        };
        if self.is_ended() {
            return;
        }

        if let Err(e) = engine.set_local_description(answer).await {
            self.report(format!("Failed to set local description: {e}")).await;
            return;
        }
        if self.is_ended() {
            return;
        }

        let Some(local) = engine.local_description() else {
            self.report("Local description missing after it was set").await;
            return;
        };
        let bind = &self.inner.bind;
        let sent = self
            .inner
            .channel
            .send_media_description(&bind.session_id, &bind.consumer_id, &bind.producer_id, local)
            .await;
        if sent {
            self.report("Answer sent").await;
        } else {
            self.report("Failed to send answer").await;
        }
    }

    /// Handle a remote ICE candidate: record its address, filter it, hand it to the engine.
    pub async fn on_incoming_ice(&self, candidate: IceCandidateInit) {
        if self.is_ended() {
            return;
        }
        let line = candidate.candidate_str().to_owned();

        if let Some(address) = extract_ipv4(&line) {
            let is_new = {
                let mut state = self.inner.state.write().await;
                let is_new = !state.available_addresses.iter().any(|a| a == address);
                if is_new {
                    state.available_addresses.push(address.to_owned());
                }
                is_new
            };
            if is_new {
                debug!(session = %self.id(), %address, "Discovered remote address");
                self.emit(SessionEvent::AddressDiscovered(address.to_owned())).await;
            }
        }

        let verdict = self.inner.state.read().await.filter.check(&line);
        match verdict {
            CandidateVerdict::EndOfCandidates => {
                trace!(session = %self.id(), "Remote end of candidates");
                return;
            }
            CandidateVerdict::FilteredByAddress => {
                self.report(format!("ICE candidate filtered by address: {line}")).await;
                return;
            }
            CandidateVerdict::FilteredByProtocol => {
                self.report(format!("ICE candidate filtered by protocol: {line}")).await;
                return;
            }
            CandidateVerdict::Accept => {}
        }

        match self.inner.engine.add_ice_candidate(candidate).await {
            Ok(()) => self.report(format!("ICE candidate added: {line}")).await,
            Err(e) => self.report(format!("Failed to add ICE candidate: {e}")).await,
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    async fn close_with(&self, reason: String) {
        if self.is_ended() {
            return;
        }
        self.emit(SessionEvent::Closed { reason }).await;
        self.end().await;
    }

    /// Tear the session down. Safe to call any number of times.
    pub async fn end(&self) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %self.id(), "Ending negotiation session");

        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.end_listener.lock().await.take() {
            self.inner.channel.unsubscribe(handle).await;
        }
        self.inner.channel.unregister_session(self.id()).await;
        self.inner.engine.close();

        self.inner.state.write().await.status = "Ended".into();
        self.inner.events.write().await.take();
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    async fn report(&self, status: impl Into<String>) {
        let status = status.into();
        debug!(session = %self.id(), %status, "Session status");
        self.inner.state.write().await.status = status.clone();
        self.emit(SessionEvent::Status(status)).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = self.inner.events.read().await.as_ref() {
            let _ = tx.send(event);
        }
    }
}
