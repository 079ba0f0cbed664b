//! Perfect negotiation with a symmetric tie-break.
//!
//! Neither party is designated caller or callee. Both may offer at any
//! time; when offers cross, each side compares the incoming SDP with its
//! own pending one and the side holding the lexicographically greater local
//! SDP ignores the incoming offer. Both sides run the same comparison with
//! the roles swapped, so exactly one of them yields regardless of delivery
//! order.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::SignalingEnvelope;
use crate::transport::{
    DataChannelPair, IceCandidate, PeerConnection, SessionDescription, SignalingState,
    TransportError,
};

const TARGET: &str = "rtc_probe::negotiation";

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("failed to apply remote candidate: {0}")]
    Candidate(#[source] TransportError),
    #[error("local offer failed: {0}")]
    Offer(#[source] TransportError),
    #[error("teardown failed: {0}")]
    Transport(#[from] TransportError),
}

/// Inputs the session driver serializes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    RemoteDescription(SessionDescription),
    RemoteCandidate(IceCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Negotiating,
    Stable,
    Closed,
}

/// What `on_remote_description` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptionOutcome {
    /// Lost the tie-break; `resent` when the local offer went out again.
    Ignored { resent: bool },
    /// A remote answer (or an offer whose answer failed) was applied.
    Applied,
    /// A remote offer was applied and answered.
    Answered,
    /// The peer connection rejected the description; logged, not fatal.
    Failed(TransportError),
}

/// Clears `making_offer` however the offer attempt ends.
struct MakingOffer<'a>(&'a AtomicBool);

impl<'a> MakingOffer<'a> {
    fn begin(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for MakingOffer<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One peer relationship: the connection, its negotiation flags and the
/// channels it produced.
pub struct NegotiationSession {
    label: String,
    pc: Arc<dyn PeerConnection>,
    signal: mpsc::UnboundedSender<SignalingEnvelope>,
    retry_offer: bool,
    making_offer: AtomicBool,
    ignore_offer: AtomicBool,
    phase: Mutex<SessionPhase>,
    channels: Mutex<Option<DataChannelPair>>,
    closed: AtomicBool,
}

impl NegotiationSession {
    pub fn new(
        label: impl Into<String>,
        pc: Arc<dyn PeerConnection>,
        signal: mpsc::UnboundedSender<SignalingEnvelope>,
        retry_offer: bool,
    ) -> Self {
        Self {
            label: label.into(),
            pc,
            signal,
            retry_offer,
            making_offer: AtomicBool::new(false),
            ignore_offer: AtomicBool::new(false),
            phase: Mutex::new(SessionPhase::Idle),
            channels: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer.load(Ordering::SeqCst)
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn attach_channels(&self, channels: DataChannelPair) {
        *self.channels.lock() = Some(channels);
    }

    pub fn channels(&self) -> Option<DataChannelPair> {
        self.channels.lock().clone()
    }

    fn set_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.lock();
        if *phase != SessionPhase::Closed {
            *phase = next;
        }
    }

    fn settle_phase(&self) {
        if self.pc.signaling_state() == SignalingState::Stable {
            self.set_phase(SessionPhase::Stable);
        }
    }

    fn send_signal(&self, envelope: SignalingEnvelope) {
        let kind = envelope.kind();
        if self.signal.send(envelope).is_err() {
            tracing::debug!(target: TARGET, role = %self.label, kind, "signaling link gone, envelope dropped");
        }
    }

    /// The connection wants (re)negotiation: produce, adopt and send an
    /// offer. `making_offer` is false again when this returns, on every path.
    pub async fn on_renegotiation_needed(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Ok(());
        }
        let _making_offer = MakingOffer::begin(&self.making_offer);
        self.set_phase(SessionPhase::Negotiating);
        tracing::debug!(target: TARGET, role = %self.label, "negotiation needed, creating offer");
        match self.pc.set_local_description().await {
            Ok(description) => {
                tracing::debug!(target: TARGET, role = %self.label, sdp_type = %description.sdp_type, "local description set, sending");
                self.send_signal(SignalingEnvelope::description(description));
                Ok(())
            }
            Err(err) => {
                tracing::warn!(target: TARGET, role = %self.label, error = %err, "creating local offer failed");
                Err(NegotiationError::Offer(err))
            }
        }
    }

    /// Forward a freshly gathered local candidate; never batched.
    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        tracing::trace!(target: TARGET, role = %self.label, candidate = %candidate.candidate, "sending local candidate");
        self.send_signal(SignalingEnvelope::candidate(candidate));
    }

    /// Collision resolution entry point. Errors from the connection are
    /// logged and reported in the outcome, never raised.
    pub async fn on_remote_description(&self, description: SessionDescription) -> DescriptionOutcome {
        let sdp_type = description.sdp_type;
        let state = self.pc.signaling_state();
        let offer_collision = description.is_offer()
            && (self.making_offer() || state != SignalingState::Stable);

        let local_sdp = if offer_collision {
            self.pc
                .local_description()
                .await
                .map(|local| local.sdp)
                .unwrap_or_default()
        } else {
            String::new()
        };
        let ignore = offer_collision && description.sdp < local_sdp;
        self.ignore_offer.store(ignore, Ordering::SeqCst);

        if ignore {
            tracing::info!(target: TARGET, role = %self.label, ?state, "offer collision: ignoring remote offer, local sdp sorts higher");
            let mut resent = false;
            if self.retry_offer {
                if let Some(local) = self.pc.local_description().await {
                    tracing::debug!(target: TARGET, role = %self.label, "resending local offer");
                    self.send_signal(SignalingEnvelope::description(local));
                    resent = true;
                }
            }
            return DescriptionOutcome::Ignored { resent };
        }
        if offer_collision {
            tracing::info!(target: TARGET, role = %self.label, ?state, "offer collision: accepting remote offer, local sdp sorts lower");
        }

        if let Err(err) = self.pc.set_remote_description(description).await {
            tracing::warn!(target: TARGET, role = %self.label, %sdp_type, error = %err, "applying remote description failed");
            return DescriptionOutcome::Failed(err);
        }
        tracing::debug!(target: TARGET, role = %self.label, %sdp_type, "remote description applied");

        if sdp_type != crate::transport::SdpType::Offer {
            self.settle_phase();
            return DescriptionOutcome::Applied;
        }

        self.set_phase(SessionPhase::Negotiating);
        match self.pc.set_local_description().await {
            Ok(answer) => {
                tracing::debug!(target: TARGET, role = %self.label, sdp_type = %answer.sdp_type, "sending answer");
                self.send_signal(SignalingEnvelope::description(answer));
                self.settle_phase();
                DescriptionOutcome::Answered
            }
            Err(err) => {
                tracing::warn!(target: TARGET, role = %self.label, error = %err, "creating answer failed");
                DescriptionOutcome::Failed(err)
            }
        }
    }

    /// Apply a remote candidate. Failures are expected, and swallowed, while
    /// the offer they belong to is being ignored; otherwise they are fatal.
    pub async fn on_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        match self.pc.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(err) if self.ignore_offer() => {
                tracing::debug!(target: TARGET, role = %self.label, error = %err, "candidate for ignored offer rejected, skipping");
                Ok(())
            }
            Err(err) => {
                tracing::error!(target: TARGET, role = %self.label, error = %err, "applying remote candidate failed");
                Err(NegotiationError::Candidate(err))
            }
        }
    }

    /// Dispatch one queued event. Only a fatal candidate failure is returned.
    pub async fn handle(&self, event: SessionEvent) -> Result<(), NegotiationError> {
        if self.is_closed() {
            tracing::trace!(target: TARGET, role = %self.label, ?event, "session closed, dropping event");
            return Ok(());
        }
        match event {
            SessionEvent::NegotiationNeeded => {
                // Logged inside; a failed offer leaves the session usable.
                let _ = self.on_renegotiation_needed().await;
                Ok(())
            }
            SessionEvent::LocalCandidate(candidate) => {
                self.on_local_candidate(candidate);
                Ok(())
            }
            SessionEvent::RemoteDescription(description) => {
                self.on_remote_description(description).await;
                Ok(())
            }
            SessionEvent::RemoteCandidate(candidate) => self.on_remote_candidate(candidate).await,
        }
    }

    /// Drain `events` one at a time until the queue closes, the session is
    /// closed, or a fatal error occurs.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Result<(), NegotiationError> {
        while let Some(event) = events.recv().await {
            self.handle(event).await?;
            if self.is_closed() {
                break;
            }
        }
        Ok(())
    }

    /// Close the data channels, then the connection. Only the first call
    /// does anything.
    pub async fn close(&self) -> Result<(), NegotiationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.phase.lock() = SessionPhase::Closed;
        let channels = self.channels.lock().take();
        if let Some(channels) = channels {
            if let Err(err) = channels.close().await {
                tracing::warn!(target: TARGET, role = %self.label, error = %err, "closing data channels failed");
            }
        }
        self.pc.close().await?;
        tracing::debug!(target: TARGET, role = %self.label, "session closed");
        Ok(())
    }
}

impl fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("label", &self.label)
            .field("phase", &self.phase())
            .field("making_offer", &self.making_offer())
            .field("ignore_offer", &self.ignore_offer())
            .field("retry_offer", &self.retry_offer)
            .finish()
    }
}
