//! Transport primitives consumed by the negotiation engine and the probes.
//!
//! The engine never talks to webrtc-rs directly: it drives a
//! [`PeerConnection`] and hands out [`DataChannel`]s. `webrtc` provides the
//! real implementation, `mock` an in-memory one for tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

pub mod mock;
pub mod webrtc;

/// Label of the reliable, ordered channel.
pub const ORDERED_LABEL: &str = "ordered";
/// Label of the unordered channel with zero retransmits.
pub const UNORDERED_LABEL: &str = "unordered";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid signaling state {state:?} for {operation}")]
    InvalidState {
        state: SignalingState,
        operation: &'static str,
    },
    #[error("rejected by peer connection: {0}")]
    Rejected(String),
    #[error("data channel {label} is {state}")]
    ChannelClosed { label: String, state: ChannelState },
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// `{"type": "offer" | "answer", "sdp": "..."}`; the sdp is opaque.
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

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// Network candidate in the browser's `RTCIceCandidate.toJSON()` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The peer connection capability the negotiation engine drives.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    /// The pending local description if one exists, else the current one.
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Create and adopt the description the current state calls for: an
    /// answer while a remote offer is pending, an offer otherwise.
    async fn set_local_description(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote description. An offer arriving while a local offer is
    /// pending discards the local offer first; implementations that cannot
    /// roll back replace the underlying connection and carry their
    /// pre-negotiated channels over.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A message-oriented data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Largest message the channel accepts in one `send`.
    fn max_message_size(&self) -> usize;

    async fn send(&self, payload: Bytes) -> Result<usize, TransportError>;

    async fn send_text(&self, text: String) -> Result<usize, TransportError>;

    /// Next inbound message, `None` once the channel is closed.
    async fn recv(&self) -> Option<Bytes>;

    /// Bytes queued for sending as reported by the channel itself.
    async fn buffered_amount(&self) -> usize;

    async fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Register `signal` to be notified whenever the buffered amount drops
    /// to or below the low threshold.
    async fn on_buffered_amount_low(&self, signal: Arc<Notify>);

    /// Resolves once the channel is open; immediately if it already is.
    async fn wait_open(&self);

    async fn close(&self) -> Result<(), TransportError>;
}

/// The two channels a negotiated session exposes.
#[derive(Clone)]
pub struct DataChannelPair {
    pub ordered: Arc<dyn DataChannel>,
    pub unordered: Arc<dyn DataChannel>,
}

impl DataChannelPair {
    pub fn new(ordered: Arc<dyn DataChannel>, unordered: Arc<dyn DataChannel>) -> Self {
        Self { ordered, unordered }
    }

    /// Close both channels, collecting the first failure.
    pub async fn close(&self) -> Result<(), TransportError> {
        let ordered = self.ordered.close().await;
        let unordered = self.unordered.close().await;
        ordered.and(unordered)
    }
}

impl fmt::Debug for DataChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelPair")
            .field("ordered", &self.ordered.ready_state())
            .field("unordered", &self.unordered.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_uses_browser_field_names() {
        let desc = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0\r\n"}));
    }

    #[test]
    fn candidate_accepts_browser_to_json_shape() {
        let raw = r#"{"candidate":"candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let candidate: IceCandidate = serde_json::from_str(raw).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));

        let minimal: IceCandidate = serde_json::from_str(r#"{"candidate":""}"#).unwrap();
        assert_eq!(minimal, IceCandidate::new(""));
    }
}
