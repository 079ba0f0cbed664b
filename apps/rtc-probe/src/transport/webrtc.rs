//! webrtc-rs implementation of the transport traits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    ChannelState, DataChannel, DataChannelPair, IceCandidate, ORDERED_LABEL, PeerConnection,
    SdpType, SessionDescription, SignalingState, TransportError, UNORDERED_LABEL,
};
use crate::negotiation::SessionEvent;

const TARGET: &str = "rtc_probe::transport::webrtc";

/// Stream ids of the pre-negotiated channels. Both parties create the same
/// pair, so neither waits for an in-band channel announcement.
const ORDERED_STREAM_ID: u16 = 0;
const UNORDERED_STREAM_ID: u16 = 1;

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_rejected<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Rejected(err.to_string())
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn map_channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
            ChannelState::Connecting
        }
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Option<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        _ => return None,
    };
    Some(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(to_rejected),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(to_rejected),
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

/// Everything needed to open a fresh `RTCPeerConnection` with the session
/// callbacks attached.
struct ConnectionFactory {
    label: String,
    api: API,
    ice_servers: Vec<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Bumped whenever the connection is replaced; callbacks of older
    /// connections compare against it and go quiet.
    generation: Arc<AtomicU64>,
}

impl ConnectionFactory {
    async fn open(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let negotiation_events = self.events.clone();
        let negotiation_current = Arc::clone(&self.generation);
        let negotiation_label = self.label.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let events = negotiation_events.clone();
            let current = Arc::clone(&negotiation_current);
            let role = negotiation_label.clone();
            Box::pin(async move {
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                tracing::debug!(target: TARGET, role = %role, generation, "negotiation needed");
                let _ = events.send(SessionEvent::NegotiationNeeded);
            })
        }));

        let candidate_events = self.events.clone();
        let candidate_current = Arc::clone(&self.generation);
        let candidate_label = self.label.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let current = Arc::clone(&candidate_current);
            let role = candidate_label.clone();
            Box::pin(async move {
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                let Some(candidate) = candidate else {
                    tracing::trace!(target: TARGET, role = %role, "candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(SessionEvent::LocalCandidate(from_candidate_init(init)));
                    }
                    Err(err) => {
                        tracing::warn!(target: TARGET, role = %role, error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_label = self.label.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let role = state_label.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
                        tracing::warn!(target: TARGET, role = %role, generation, ?state, "peer connection state changed");
                    }
                    _ => {
                        tracing::debug!(target: TARGET, role = %role, generation, ?state, "peer connection state changed");
                    }
                }
            })
        }));

        Ok(pc)
    }
}

/// `RTCPeerConnection` behind [`PeerConnection`].
///
/// webrtc-rs cannot roll back a pending local offer, so a remote offer that
/// arrives in have-local-offer replaces the whole connection: the old one is
/// closed, a fresh one applies the offer, and the pre-negotiated channels
/// are re-created on it behind the same [`RtcDataChannel`] handles.
pub struct RtcPeerConnection {
    factory: ConnectionFactory,
    pc: Mutex<Arc<RTCPeerConnection>>,
    channels: Mutex<Vec<Arc<RtcDataChannel>>>,
    replacements: AtomicUsize,
}

impl RtcPeerConnection {
    /// Build a connection whose negotiation-needed and local-candidate
    /// callbacks feed `events`.
    pub async fn new(
        label: impl Into<String>,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        let factory = ConnectionFactory {
            label: label.into(),
            api: build_api(setting)?,
            ice_servers: ice_servers.to_vec(),
            events,
            generation: Arc::new(AtomicU64::new(0)),
        };
        let pc = factory.open().await?;
        Ok(Arc::new(Self {
            factory,
            pc: Mutex::new(pc),
            channels: Mutex::new(Vec::new()),
            replacements: AtomicUsize::new(0),
        }))
    }

    fn current(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.lock())
    }

    /// How many times a colliding remote offer replaced the connection.
    pub fn replacements(&self) -> usize {
        self.replacements.load(Ordering::SeqCst)
    }

    /// Create both pre-negotiated channels. Creating the first one is what
    /// triggers the initial negotiation-needed callback.
    pub async fn create_channel_pair(
        &self,
        max_message_size: usize,
    ) -> Result<(Arc<RtcDataChannel>, Arc<RtcDataChannel>), TransportError> {
        let pc = self.current();
        let ordered = RtcDataChannel::create(
            &self.factory.label,
            &pc,
            ORDERED_LABEL,
            ordered_init(),
            max_message_size,
        )
        .await?;
        let unordered = RtcDataChannel::create(
            &self.factory.label,
            &pc,
            UNORDERED_LABEL,
            unordered_init(),
            max_message_size,
        )
        .await?;
        self.channels
            .lock()
            .extend([Arc::clone(&ordered), Arc::clone(&unordered)]);
        tracing::debug!(target: TARGET, role = %self.factory.label, "data channels created");
        Ok((ordered, unordered))
    }

    /// Convenience over [`Self::create_channel_pair`] for trait consumers.
    pub async fn data_channels(
        &self,
        max_message_size: usize,
    ) -> Result<DataChannelPair, TransportError> {
        let (ordered, unordered) = self.create_channel_pair(max_message_size).await?;
        Ok(DataChannelPair::new(ordered, unordered))
    }

    /// Drop the pending local offer by swapping in a fresh connection, apply
    /// `remote` to it, then move the channels over.
    async fn replace_and_apply(&self, remote: RTCSessionDescription) -> Result<(), TransportError> {
        self.factory.generation.fetch_add(1, Ordering::SeqCst);
        let fresh = self.factory.open().await?;
        let stale = std::mem::replace(&mut *self.pc.lock(), Arc::clone(&fresh));
        let replacements = self.replacements.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(target: TARGET, role = %self.factory.label, replacements, "discarding local offer, replacing peer connection");
        if let Err(err) = stale.close().await {
            tracing::debug!(target: TARGET, role = %self.factory.label, error = %err, "closing replaced peer connection failed");
        }

        fresh
            .set_remote_description(remote)
            .await
            .map_err(to_rejected)?;
        // Created after the offer is applied so the answer already covers
        // them and no extra negotiation round starts.
        let channels = self.channels.lock().clone();
        for channel in channels {
            channel.recreate_on(&fresh).await?;
        }
        Ok(())
    }
}

fn ordered_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        negotiated: Some(ORDERED_STREAM_ID),
        ..Default::default()
    }
}

fn unordered_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(false),
        max_retransmits: Some(0),
        negotiated: Some(UNORDERED_STREAM_ID),
        ..Default::default()
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.current().signaling_state())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.current()
            .local_description()
            .await
            .and_then(from_rtc_description)
    }

    async fn set_local_description(&self) -> Result<SessionDescription, TransportError> {
        let pc = self.current();
        let description = match pc.signaling_state() {
            RTCSignalingState::Closed => return Err(TransportError::Closed),
            RTCSignalingState::HaveRemoteOffer => pc.create_answer(None).await.map_err(to_rejected)?,
            _ => pc.create_offer(None).await.map_err(to_rejected)?,
        };
        pc.set_local_description(description.clone())
            .await
            .map_err(to_rejected)?;
        from_rtc_description(description).ok_or_else(|| {
            TransportError::Rejected("unexpected local description type".to_string())
        })
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = to_rtc_description(&description)?;
        let pc = self.current();
        if description.is_offer() && pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            return self.replace_and_apply(remote).await;
        }
        pc.set_remote_description(remote).await.map_err(to_rejected)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.current()
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(to_rejected)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Silence callbacks of the connection being torn down.
        self.factory.generation.fetch_add(1, Ordering::SeqCst);
        self.current().close().await.map_err(to_setup_error)
    }
}

/// `RTCDataChannel` behind [`DataChannel`]. Inbound messages are pumped into
/// a queue so `recv` can be awaited; the queue ends when the channel closes.
///
/// The underlying channel can be swapped by [`RtcPeerConnection`] when it
/// replaces its connection; callbacks of the previous channel are ignored.
pub struct RtcDataChannel {
    role: String,
    label: String,
    init: RTCDataChannelInit,
    max_message_size: usize,
    dc: Mutex<Arc<RTCDataChannel>>,
    generation: Arc<AtomicU64>,
    inbound_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    opened: Arc<Notify>,
    low_threshold: AtomicUsize,
    low_signal: Mutex<Option<Arc<Notify>>>,
}

impl RtcDataChannel {
    async fn create(
        role: &str,
        pc: &RTCPeerConnection,
        label: &str,
        init: RTCDataChannelInit,
        max_message_size: usize,
    ) -> Result<Arc<Self>, TransportError> {
        let dc = pc
            .create_data_channel(label, Some(init.clone()))
            .await
            .map_err(to_setup_error)?;
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let channel = Arc::new(Self {
            role: role.to_string(),
            label: label.to_string(),
            init,
            max_message_size,
            dc: Mutex::new(Arc::clone(&dc)),
            generation: Arc::new(AtomicU64::new(0)),
            inbound_tx: Arc::new(Mutex::new(Some(tx))),
            inbound: AsyncMutex::new(rx),
            opened: Arc::new(Notify::new()),
            low_threshold: AtomicUsize::new(0),
            low_signal: Mutex::new(None),
        });
        channel.attach(&dc, 0);
        Ok(channel)
    }

    fn current(&self) -> Arc<RTCDataChannel> {
        Arc::clone(&self.dc.lock())
    }

    /// Re-create this channel on a replacement connection and carry the
    /// low-buffer configuration over.
    async fn recreate_on(&self, pc: &RTCPeerConnection) -> Result<(), TransportError> {
        let dc = pc
            .create_data_channel(&self.label, Some(self.init.clone()))
            .await
            .map_err(to_setup_error)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.attach(&dc, generation);
        *self.dc.lock() = Arc::clone(&dc);

        let signal = self.low_signal.lock().clone();
        if let Some(signal) = signal {
            dc.set_buffered_amount_low_threshold(self.low_threshold.load(Ordering::SeqCst))
                .await;
            register_low_signal(&dc, signal).await;
        }
        tracing::debug!(target: TARGET, role = %self.role, channel = %self.label, generation, "data channel re-created");
        Ok(())
    }

    fn attach(&self, dc: &RTCDataChannel, generation: u64) {
        let message_current = Arc::clone(&self.generation);
        let message_tx = Arc::clone(&self.inbound_tx);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sender = if message_current.load(Ordering::SeqCst) == generation {
                message_tx.lock().clone()
            } else {
                None
            };
            Box::pin(async move {
                if let Some(sender) = sender {
                    let _ = sender.send(msg.data);
                }
            })
        }));

        let open_current = Arc::clone(&self.generation);
        let open_signal = Arc::clone(&self.opened);
        let open_role = self.role.clone();
        let open_label = self.label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                if open_current.load(Ordering::SeqCst) != generation {
                    return;
                }
                tracing::debug!(target: TARGET, role = %open_role, channel = %open_label, "data channel open");
                open_signal.notify_waiters();
            })
        }));

        let close_current = Arc::clone(&self.generation);
        let close_tx = Arc::clone(&self.inbound_tx);
        let close_role = self.role.clone();
        let close_label = self.label.clone();
        dc.on_close(Box::new(move || {
            let current = close_current.load(Ordering::SeqCst) == generation;
            if current {
                close_tx.lock().take();
            }
            let role = close_role.clone();
            let label = close_label.clone();
            Box::pin(async move {
                if current {
                    tracing::debug!(target: TARGET, role = %role, channel = %label, "data channel closed");
                }
            })
        }));

        let error_current = Arc::clone(&self.generation);
        let error_role = self.role.clone();
        let error_label = self.label.clone();
        dc.on_error(Box::new(move |err: webrtc::Error| {
            let current = error_current.load(Ordering::SeqCst) == generation;
            let role = error_role.clone();
            let label = error_label.clone();
            Box::pin(async move {
                if current {
                    tracing::warn!(target: TARGET, role = %role, channel = %label, error = %err, "data channel error");
                }
            })
        }));
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        let state = self.ready_state();
        if state == ChannelState::Open {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed {
                label: self.label.clone(),
                state,
            })
        }
    }
}

async fn register_low_signal(dc: &RTCDataChannel, signal: Arc<Notify>) {
    dc.on_buffered_amount_low(Box::new(move || {
        let signal = Arc::clone(&signal);
        Box::pin(async move {
            signal.notify_one();
        })
    }))
    .await;
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        map_channel_state(self.current().ready_state())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    async fn send(&self, payload: Bytes) -> Result<usize, TransportError> {
        self.ensure_open()?;
        self.current().send(&payload).await.map_err(to_rejected)
    }

    async fn send_text(&self, text: String) -> Result<usize, TransportError> {
        self.ensure_open()?;
        self.current().send_text(text).await.map_err(to_rejected)
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbound.lock().await.recv().await
    }

    async fn buffered_amount(&self) -> usize {
        self.current().buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
        self.current()
            .set_buffered_amount_low_threshold(threshold)
            .await;
    }

    async fn on_buffered_amount_low(&self, signal: Arc<Notify>) {
        *self.low_signal.lock() = Some(Arc::clone(&signal));
        register_low_signal(&self.current(), signal).await;
    }

    async fn wait_open(&self) {
        let opened = self.opened.notified();
        if self.ready_state() == ChannelState::Open {
            return;
        }
        opened.await;
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inbound_tx.lock().take();
        self.current().close().await.map_err(to_setup_error)
    }
}
