//! Signalling wire protocol — JSON messages exchanged with the signalling server.
//!
//! Every frame is an envelope `{ "type": ..., "content": ... }` whose `type` is one of
//! `question`, `answer` or `negotiation`. Each category is itself a closed, adjacently
//! tagged enum, so routing code matches exhaustively instead of poking at raw JSON.
//!
//! ```text
//!   question     client → server   peerId, availableStreams, startSession
//!   question     server → client   endSession
//!   answer       server → client   peerId, availableStreams, startSession
//!   negotiation  bidirectional     iceNegotiation, mediaNegotiation
//! ```
//!
//! Ids are opaque strings issued by the server.

use serde::{Deserialize, Serialize};

/// Top-level signalling envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum Message {
    Question(Question),
    Answer(Answer),
    Negotiation(Negotiation),
}

/// Requests. Sent by the client, except `EndSession` which the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum Question {
    /// Ask the server for a consumer identity.
    PeerId,
    /// Ask the server for the producers it knows about.
    AvailableStreams,
    /// Ask the server to open a session between a consumer and a producer.
    StartSession(BindOffer),
    /// Server → Client: the session was torn down on the server side.
    EndSession(EndSessionQuestion),
}

/// Responses from the server, correlated to a [`Question`] by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum Answer {
    PeerId(PeerIdAnswer),
    AvailableStreams(Vec<AvailableStream>),
    StartSession(BindAnswer),
}

/// Session-scoped negotiation payloads. Both carry the routing triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum Negotiation {
    IceNegotiation(IceNegotiation),
    MediaNegotiation(MediaNegotiation),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOffer {
    pub consumer_id: String,
    pub producer_id: String,
}

/// Server reply to `startSession`.
///
/// `session_id` is optional on the wire: a reply without it is ignored by the
/// requester rather than treated as a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindAnswer {
    pub consumer_id: String,
    pub producer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The `{session_id, consumer_id, producer_id}` routing triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionBind {
    pub session_id: String,
    pub consumer_id: String,
    pub producer_id: String,
}

impl SessionBind {
    pub fn new(
        session_id: impl Into<String>,
        consumer_id: impl Into<String>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            consumer_id: consumer_id.into(),
            producer_id: producer_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionQuestion {
    #[serde(flatten)]
    pub bind: SessionBind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdAnswer {
    pub id: String,
}

/// A producer as advertised over the signalling channel.
///
/// This is a lighter record than the HTTP discovery one; most fields are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableStream {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub encode: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceNegotiation {
    #[serde(flatten)]
    pub bind: SessionBind,
    pub ice: IceCandidateInit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaNegotiation {
    #[serde(flatten)]
    pub bind: SessionBind,
    pub sdp: SessionDescription,
}

/// ICE candidate as exchanged by browsers (`RTCIceCandidateInit`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: Some(candidate.into()),
            ..Default::default()
        }
    }

    /// Raw candidate line, or `""` for the end-of-candidates marker.
    pub fn candidate_str(&self) -> &str {
        self.candidate.as_deref().unwrap_or_default()
    }
}

/// SDP payload (`RTCSessionDescriptionInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl Message {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl From<Question> for Message {
    fn from(question: Question) -> Self {
        Message::Question(question)
    }
}

impl From<Answer> for Message {
    fn from(answer: Answer) -> Self {
        Message::Answer(answer)
    }
}

impl From<IceNegotiation> for Message {
    fn from(negotiation: IceNegotiation) -> Self {
        Message::Negotiation(Negotiation::IceNegotiation(negotiation))
    }
}

impl From<MediaNegotiation> for Message {
    fn from(negotiation: MediaNegotiation) -> Self {
        Message::Negotiation(Negotiation::MediaNegotiation(negotiation))
    }
}
