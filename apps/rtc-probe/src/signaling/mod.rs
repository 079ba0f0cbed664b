//! Envelopes exchanged through the broadcast relay, and the link that
//! carries them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::{IceCandidate, SessionDescription};

mod link;

pub use link::{SignalingEvent, SignalingLink, parse_signaling_url};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("websocket connect failed: {0}")]
    Connect(String),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling link closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Server,
}

/// `{"type":"server","clientCount":n}`, sent by the relay to a party
/// when it joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantNotice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    #[serde(rename = "clientCount")]
    pub client_count: i64,
}

/// Everything that travels over the relay. Non-notice envelopes carry no
/// session identifier: with at most two parties they always belong to
/// "the other one".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingEnvelope {
    ParticipantCount(ParticipantNotice),
    Description { description: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl SignalingEnvelope {
    pub fn participant_count(client_count: i64) -> Self {
        SignalingEnvelope::ParticipantCount(ParticipantNotice {
            kind: NoticeKind::Server,
            client_count,
        })
    }

    pub fn description(description: SessionDescription) -> Self {
        SignalingEnvelope::Description { description }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingEnvelope::Candidate { candidate }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::ParticipantCount(_) => "participant_count",
            SignalingEnvelope::Description { description } if description.is_offer() => "offer",
            SignalingEnvelope::Description { .. } => "answer",
            SignalingEnvelope::Candidate { .. } => "candidate",
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Whether a relay-reported participant count may start negotiation.
pub fn starts_negotiation(client_count: i64) -> bool {
    matches!(client_count, 1 | 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SdpType;

    #[test]
    fn parses_relay_notice() {
        let envelope = SignalingEnvelope::from_json(r#"{"type":"server","clientCount":2}"#).unwrap();
        assert_eq!(envelope, SignalingEnvelope::participant_count(2));
    }

    #[test]
    fn parses_browser_description_and_candidate() {
        let offer = SignalingEnvelope::from_json(
            r#"{"description":{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"}}"#,
        )
        .unwrap();
        match offer {
            SignalingEnvelope::Description { description } => {
                assert_eq!(description.sdp_type, SdpType::Offer);
                assert!(description.sdp.starts_with("v=0"));
            }
            other => panic!("unexpected envelope {other:?}"),
        }

        let candidate = SignalingEnvelope::from_json(
            r#"{"candidate":{"candidate":"candidate:0 1 UDP 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
        )
        .unwrap();
        assert_eq!(candidate.kind(), "candidate");
    }

    #[test]
    fn serializes_without_extra_tags() {
        let json = SignalingEnvelope::description(SessionDescription::answer("x"))
            .to_json()
            .unwrap();
        assert_eq!(json, r#"{"description":{"type":"answer","sdp":"x"}}"#);
    }

    #[test]
    fn only_one_or_two_participants_start_negotiation() {
        assert!(starts_negotiation(1));
        assert!(starts_negotiation(2));
        assert!(!starts_negotiation(0));
        assert!(!starts_negotiation(3));
        assert!(!starts_negotiation(-1));
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(SignalingEnvelope::from_json(r#"{"type":"offer","offer":{}}"#).is_err());
        assert!(SignalingEnvelope::from_json(r#"{"type":"client","clientCount":1}"#).is_err());
    }
}
