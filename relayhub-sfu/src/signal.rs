//! Signaling channel protocol
//!
//! Every message on the channel is a JSON envelope `{"event": ..., "data": ...}`
//! whose `data` is itself a JSON-encoded payload:
//!
//! - `offer` (hub → peer): serialized [`SessionDescription`]
//! - `answer` (peer → hub): serialized [`SessionDescription`]
//! - `candidate` (both directions): serialized [`IceCandidate`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::SignalingError;

pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_CANDIDATE: &str = "candidate";

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub event: String,
    pub data: String,
}

impl SignalMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    pub fn offer(desc: &SessionDescription) -> Result<Self, serde_json::Error> {
        Ok(Self::new(EVENT_OFFER, serde_json::to_string(desc)?))
    }

    pub fn candidate(candidate: &IceCandidate) -> Result<Self, serde_json::Error> {
        Ok(Self::new(EVENT_CANDIDATE, serde_json::to_string(candidate)?))
    }

    /// Decode an envelope from its JSON text
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|source| SignalingError::Malformed {
            what: "message",
            source,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode the payload according to the event tag
    pub fn parse(&self) -> Result<SignalEvent, SignalingError> {
        match self.event.as_str() {
            EVENT_CANDIDATE => serde_json::from_str(&self.data)
                .map(SignalEvent::Candidate)
                .map_err(|source| SignalingError::Malformed {
                    what: "candidate",
                    source,
                }),
            EVENT_ANSWER => serde_json::from_str(&self.data)
                .map(SignalEvent::Answer)
                .map_err(|source| SignalingError::Malformed {
                    what: "answer",
                    source,
                }),
            other => Ok(SignalEvent::Unknown(other.to_string())),
        }
    }
}

/// Inbound signaling event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    Candidate(IceCandidate),
    Answer(SessionDescription),
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Read half of a session's signaling channel
#[async_trait]
pub trait SignalSource: Send {
    /// Next message, `None` once the peer has gone away
    async fn recv(&mut self) -> Option<Result<SignalMessage, SignalingError>>;
}

/// Write half of a session's signaling channel
#[async_trait]
pub trait SignalSink: Send {
    async fn send(&mut self, message: SignalMessage) -> Result<(), SignalingError>;
}

/// Serializes concurrent writers onto one sink.
///
/// Offers come from synchronization passes while candidates are emitted by the
/// session's own loop, so both may write at the same time.
pub struct SignalWriter {
    sink: Mutex<Box<dyn SignalSink>>,
}

impl SignalWriter {
    pub fn new(sink: Box<dyn SignalSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        self.sink.lock().await.send(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_browser_candidate() {
        let data = r#"{"candidate":"candidate:1 1 UDP 2122252543 192.168.1.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let message = SignalMessage::new(EVENT_CANDIDATE, data);

        match message.parse().unwrap() {
            SignalEvent::Candidate(c) => {
                assert!(c.candidate.starts_with("candidate:1"));
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_answer() {
        let message = SignalMessage::new(EVENT_ANSWER, r#"{"type":"answer","sdp":"v=0\r\n"}"#);
        assert_eq!(
            message.parse().unwrap(),
            SignalEvent::Answer(SessionDescription::answer("v=0\r\n"))
        );
    }

    #[test]
    fn test_malformed_payload_is_error() {
        let message = SignalMessage::new(EVENT_CANDIDATE, "not json");
        assert!(matches!(
            message.parse(),
            Err(SignalingError::Malformed { what: "candidate", .. })
        ));
    }

    #[test]
    fn test_unknown_event_is_not_an_error() {
        let message = SignalMessage::new("mute", "{}");
        assert_eq!(
            message.parse().unwrap(),
            SignalEvent::Unknown("mute".to_string())
        );
    }

    #[test]
    fn test_offer_envelope_shape() {
        let message = SignalMessage::offer(&SessionDescription::offer("v=0")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "offer");

        let inner: serde_json::Value =
            serde_json::from_str(json["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner["type"], "offer");
        assert_eq!(inner["sdp"], "v=0");
    }

    #[test]
    fn test_envelope_from_json() {
        let message = SignalMessage::from_json(r#"{"event":"answer","data":"{}"}"#).unwrap();
        assert_eq!(message.event, "answer");
        assert!(SignalMessage::from_json("{").is_err());
    }
}
