//! In-memory transport doubles.
//!
//! [`MockPeerConnection`] models the signaling state machine the way the
//! webrtc-rs adapter exposes it, including replacing the connection when a
//! remote offer collides with a pending local one; [`MemoryChannel`] is a linked pair
//! of data channels with a scriptable buffered-amount model.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use super::{
    ChannelState, DataChannel, IceCandidate, PeerConnection, SdpType, SessionDescription,
    SignalingState, TransportError,
};

#[derive(Debug)]
struct MockPeerState {
    signaling: SignalingState,
    pending_local: Option<SessionDescription>,
    current_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    offers_created: usize,
    fail_local: bool,
    reject_candidates: bool,
    candidates: Vec<IceCandidate>,
    applied_remote: Vec<SessionDescription>,
    restarts: usize,
    close_calls: usize,
}

/// Scripted peer connection. Offers carry `offer_sdp` (suffixed with a
/// generation counter after the first one), answers carry `answer_sdp`.
#[derive(Debug)]
pub struct MockPeerConnection {
    offer_sdp: String,
    answer_sdp: String,
    state: Mutex<MockPeerState>,
}

impl MockPeerConnection {
    pub fn new(offer_sdp: impl Into<String>, answer_sdp: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            offer_sdp: offer_sdp.into(),
            answer_sdp: answer_sdp.into(),
            state: Mutex::new(MockPeerState {
                signaling: SignalingState::Stable,
                pending_local: None,
                current_local: None,
                remote: None,
                offers_created: 0,
                fail_local: false,
                reject_candidates: false,
                candidates: Vec::new(),
                applied_remote: Vec::new(),
                restarts: 0,
                close_calls: 0,
            }),
        })
    }

    /// Make the next `set_local_description` fail.
    pub fn fail_next_local_description(&self) {
        self.state.lock().fail_local = true;
    }

    /// Reject every candidate regardless of state.
    pub fn reject_candidates(&self, reject: bool) {
        self.state.lock().reject_candidates = reject;
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn applied_remote(&self) -> Vec<SessionDescription> {
        self.state.lock().applied_remote.clone()
    }

    /// How many colliding remote offers discarded the local offer by
    /// starting over on a fresh connection.
    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    async fn set_local_description(&self) -> Result<SessionDescription, TransportError> {
        let mut state = self.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        if std::mem::take(&mut state.fail_local) {
            return Err(TransportError::Rejected("scripted local description failure".into()));
        }
        match state.signaling {
            SignalingState::HaveRemoteOffer => {
                let answer = SessionDescription::answer(self.answer_sdp.clone());
                state.current_local = Some(answer.clone());
                state.pending_local = None;
                state.signaling = SignalingState::Stable;
                Ok(answer)
            }
            SignalingState::Stable | SignalingState::HaveLocalOffer => {
                let sdp = if state.offers_created == 0 {
                    self.offer_sdp.clone()
                } else {
                    format!("{}#{}", self.offer_sdp, state.offers_created)
                };
                state.offers_created += 1;
                let offer = SessionDescription::offer(sdp);
                state.pending_local = Some(offer.clone());
                state.signaling = SignalingState::HaveLocalOffer;
                Ok(offer)
            }
            other => Err(TransportError::InvalidState {
                state: other,
                operation: "set_local_description",
            }),
        }
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        match (description.sdp_type, state.signaling) {
            (_, SignalingState::Closed) => return Err(TransportError::Closed),
            (SdpType::Offer, SignalingState::Stable) => {
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                // Nothing from the discarded connection survives.
                state.pending_local = None;
                state.current_local = None;
                state.remote = None;
                state.candidates.clear();
                state.restarts += 1;
                state.signaling = SignalingState::HaveRemoteOffer;
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                state.current_local = state.pending_local.take();
                state.signaling = SignalingState::Stable;
            }
            (_, current) => {
                return Err(TransportError::InvalidState {
                    state: current,
                    operation: "set_remote_description",
                });
            }
        }
        state.remote = Some(description.clone());
        state.applied_remote.push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.reject_candidates {
            return Err(TransportError::Rejected(format!(
                "candidate {} rejected",
                candidate.candidate
            )));
        }
        if state.remote.is_none() {
            return Err(TransportError::Rejected(
                "no remote description for candidate".into(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// How a [`MemoryChannel`] reports its buffered amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferModel {
    /// Every send drains instantly; the buffered amount stays at zero and no
    /// low notification is ever raised.
    Drained,
    /// Every send adds to the buffered amount until [`MemoryChannel::drain`].
    Accumulate,
}

/// One end of an in-memory data channel pair.
pub struct MemoryChannel {
    label: String,
    max_message_size: usize,
    state: Mutex<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    buffer_model: BufferModel,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    low_signal: Mutex<Option<Arc<Notify>>>,
    opened: Notify,
    sent_messages: AtomicUsize,
    sent_bytes: AtomicUsize,
}

impl MemoryChannel {
    /// Two open, linked channel ends.
    pub fn pair(
        label: &str,
        max_message_size: usize,
        buffer_model: BufferModel,
    ) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self::new(label, max_message_size, buffer_model, b_tx, a_rx);
        let b = Self::new(label, max_message_size, buffer_model, a_tx, b_rx);
        (Arc::new(a), Arc::new(b))
    }

    fn new(
        label: &str,
        max_message_size: usize,
        buffer_model: BufferModel,
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            label: label.to_string(),
            max_message_size,
            state: Mutex::new(ChannelState::Open),
            outbound: Mutex::new(Some(outbound)),
            inbound: AsyncMutex::new(inbound),
            buffer_model,
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            low_signal: Mutex::new(None),
            opened: Notify::new(),
            sent_messages: AtomicUsize::new(0),
            sent_bytes: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
        if state == ChannelState::Open {
            self.opened.notify_waiters();
        }
    }

    pub fn sent_messages(&self) -> usize {
        self.sent_messages.load(Ordering::SeqCst)
    }

    pub fn sent_bytes(&self) -> usize {
        self.sent_bytes.load(Ordering::SeqCst)
    }

    pub fn low_threshold(&self) -> usize {
        self.low_threshold.load(Ordering::SeqCst)
    }

    /// Pretend the transport flushed `bytes`; raises the low notification
    /// when the buffered amount falls to or below the threshold.
    pub fn drain(&self, bytes: usize) {
        let before = self.buffered.load(Ordering::SeqCst);
        let after = before.saturating_sub(bytes);
        self.buffered.store(after, Ordering::SeqCst);
        if after <= self.low_threshold.load(Ordering::SeqCst) {
            if let Some(signal) = self.low_signal.lock().as_ref() {
                signal.notify_one();
            }
        }
    }

    fn enqueue(&self, payload: Bytes) -> Result<usize, TransportError> {
        let state = *self.state.lock();
        if state != ChannelState::Open {
            return Err(TransportError::ChannelClosed {
                label: self.label.clone(),
                state,
            });
        }
        let len = payload.len();
        if let Some(tx) = self.outbound.lock().as_ref() {
            // The far end may already be gone; the bytes are still "sent".
            let _ = tx.send(payload);
        }
        self.sent_messages.fetch_add(1, Ordering::SeqCst);
        self.sent_bytes.fetch_add(len, Ordering::SeqCst);
        if self.buffer_model == BufferModel::Accumulate {
            self.buffered.fetch_add(len, Ordering::SeqCst);
        }
        Ok(len)
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send(&self, payload: Bytes) -> Result<usize, TransportError> {
        self.enqueue(payload)
    }

    async fn send_text(&self, text: String) -> Result<usize, TransportError> {
        self.enqueue(Bytes::from(text))
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn on_buffered_amount_low(&self, signal: Arc<Notify>) {
        *self.low_signal.lock() = Some(signal);
    }

    async fn wait_open(&self) {
        let opened = self.opened.notified();
        if self.ready_state() == ChannelState::Open {
            return;
        }
        opened.await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.state.lock() = ChannelState::Closed;
        self.outbound.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn colliding_offer_restarts_connection() {
        let pc = MockPeerConnection::new("offer-a", "answer-a");
        let offer = pc.set_local_description().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);

        pc.set_remote_description(SessionDescription::offer("offer-b"))
            .await
            .unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::HaveRemoteOffer);
        assert_eq!(pc.restarts(), 1);
        assert_eq!(pc.local_description().await, None);

        let answer = pc.set_local_description().await.unwrap();
        assert_eq!(answer, SessionDescription::answer("answer-a"));
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_without_local_offer_is_rejected() {
        let pc = MockPeerConnection::new("offer-a", "answer-a");
        let err = pc
            .set_remote_description(SessionDescription::answer("answer-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState { .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn memory_channel_delivers_and_tracks_buffer() {
        let (a, b) = MemoryChannel::pair("ordered", 1024, BufferModel::Accumulate);
        a.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(a.buffered_amount().await, 5);

        let signal = Arc::new(Notify::new());
        a.set_buffered_amount_low_threshold(0).await;
        a.on_buffered_amount_low(signal.clone()).await;
        a.drain(5);
        signal.notified().await;
        assert_eq!(a.buffered_amount().await, 0);

        a.set_state(ChannelState::Closing);
        assert!(a.send(Bytes::from_static(b"late")).await.is_err());
    }
}
