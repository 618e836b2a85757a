//! Scriptable peer connection for session tests.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use peerlink_common::{IceCandidateInit, SessionDescription};
use tokio::sync::broadcast;

use crate::engine::{
    EngineError, EngineEvent, MediaKind, PeerConnection, PeerConnectionState, RtpReceiver,
};
use crate::session::SessionEvent;

/// Poll a condition (which may contain `.await`) until it holds, failing after a few seconds.
macro_rules! eventually {
    ($cond:expr) => {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !($cond) {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect(concat!("condition never held: ", stringify!($cond)))
    };
}
pub(crate) use eventually;

/// Next event matching `pred`, skipping the others.
pub async fn next_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("session events closed"),
            }
        }
    })
    .await
    .expect("no matching session event")
}

#[derive(Default)]
pub struct MockReceiver {
    kind: Option<MediaKind>,
    target: Mutex<Option<Duration>>,
    hint: Mutex<Option<Option<Duration>>>,
}

impl MockReceiver {
    fn new(kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            kind: Some(kind),
            ..Default::default()
        })
    }

    /// Last jitter buffer target set, if any.
    pub fn target(&self) -> Option<Duration> {
        *self.target.lock().unwrap()
    }

    /// Last playout hint set; the outer `None` means it was never touched.
    pub fn hint(&self) -> Option<Option<Duration>> {
        *self.hint.lock().unwrap()
    }
}

impl RtpReceiver for MockReceiver {
    fn kind(&self) -> MediaKind {
        self.kind.unwrap_or(MediaKind::Video)
    }

    fn set_jitter_buffer_target(&self, target: Duration) {
        *self.target.lock().unwrap() = Some(target);
    }

    fn set_playout_delay_hint(&self, delay: Option<Duration>) {
        *self.hint.lock().unwrap() = Some(delay);
    }
}

pub struct MockPeerConnection {
    calls: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    local: Mutex<Option<SessionDescription>>,
    fail_remote: AtomicBool,
    fail_candidates: AtomicBool,
    closes: AtomicUsize,
    state: Mutex<PeerConnectionState>,
    events: broadcast::Sender<EngineEvent>,
    video: Arc<MockReceiver>,
    audio: Arc<MockReceiver>,
    /// Receivers created by later remote tracks.
    added: Mutex<Vec<Arc<MockReceiver>>>,
}

impl MockPeerConnection {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            calls: Mutex::default(),
            candidates: Mutex::default(),
            local: Mutex::default(),
            fail_remote: AtomicBool::new(false),
            fail_candidates: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            state: Mutex::new(PeerConnectionState::New),
            events,
            video: MockReceiver::new(MediaKind::Video),
            audio: MockReceiver::new(MediaKind::Audio),
            added: Mutex::default(),
        })
    }

    pub fn emit(&self, event: EngineEvent) {
        if let EngineEvent::ConnectionState(state) = &event {
            self.set_connection_state(*state);
        }
        let _ = self.events.send(event);
    }

    /// Change the state without announcing it.
    pub fn set_connection_state(&self, state: PeerConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Attach a fresh receiver, as the engine does when a new track arrives.
    pub fn add_receiver(&self, kind: MediaKind) -> Arc<MockReceiver> {
        let receiver = MockReceiver::new(kind);
        self.added.lock().unwrap().push(Arc::clone(&receiver));
        receiver
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn fail_remote_description(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.fail_candidates.store(fail, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    pub fn video_receiver(&self) -> Arc<MockReceiver> {
        Arc::clone(&self.video)
    }

    pub fn audio_receiver(&self) -> Arc<MockReceiver> {
        Arc::clone(&self.audio)
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_owned());
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn add_recv_only_video(&self) -> Result<(), EngineError> {
        self.record("add_recv_only_video");
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record("set_remote_description");
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidDescription(desc.sdp));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record("create_answer");
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.record("set_local_description");
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError> {
        if self.fail_candidates.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidCandidate(candidate.candidate_str().to_owned()));
        }
        self.candidates
            .lock()
            .unwrap()
            .push(candidate.candidate_str().to_owned());
        Ok(())
    }

    fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>> {
        let mut receivers = vec![
            self.video.clone() as Arc<dyn RtpReceiver>,
            self.audio.clone() as Arc<dyn RtpReceiver>,
        ];
        for receiver in self.added.lock().unwrap().iter() {
            receivers.push(receiver.clone() as Arc<dyn RtpReceiver>);
        }
        receivers
    }

    fn restart_ice(&self) {
        self.record("restart_ice");
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock().unwrap()
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
