//! One party of a probe session: relay join, negotiation, open channels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ProbeConfig;
use crate::negotiation::{NegotiationError, NegotiationSession, SessionEvent};
use crate::signaling::{
    SignalingEnvelope, SignalingError, SignalingEvent, SignalingLink, starts_negotiation,
};
use crate::transport::webrtc::RtcPeerConnection;
use crate::transport::{DataChannelPair, PeerConnection, TransportError};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("signaling failed: {0}")]
    Signaling(#[from] SignalingError),
    #[error("relay reported {0} participants, expected 1 or 2")]
    UnexpectedParticipantCount(i64),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),
    #[error("signaling link closed before the data channels opened")]
    SignalingClosed,
}

/// Route inbound relay envelopes into the session queue. Returns false once
/// the queue is gone.
fn route_envelope(
    role: &str,
    envelope: SignalingEnvelope,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> bool {
    let event = match envelope {
        SignalingEnvelope::ParticipantCount(notice) => {
            tracing::info!(target = "rtc_probe::peer", role = %role, client_count = notice.client_count, "participant count");
            return true;
        }
        SignalingEnvelope::Description { description } => {
            tracing::debug!(target = "rtc_probe::peer", role = %role, sdp_type = %description.sdp_type, "remote description received");
            SessionEvent::RemoteDescription(description)
        }
        SignalingEnvelope::Candidate { candidate } => SessionEvent::RemoteCandidate(candidate),
    };
    events.send(event).is_ok()
}

/// Forward relay traffic to the session until the link goes away. A relay
/// disconnect is reported on `disconnected`; the session itself is left to
/// whoever owns it.
async fn route_signaling(
    role: String,
    mut signal_events: mpsc::UnboundedReceiver<SignalingEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
    disconnected: oneshot::Sender<()>,
) {
    while let Some(event) = signal_events.recv().await {
        match event {
            SignalingEvent::Envelope(envelope) => {
                if !route_envelope(&role, envelope, &events) {
                    return;
                }
            }
            SignalingEvent::Error(err) => {
                tracing::warn!(target = "rtc_probe::peer", role = %role, error = %err, "signal relay error");
            }
            SignalingEvent::Disconnected => break,
            SignalingEvent::Connected => {}
        }
    }
    tracing::info!(target = "rtc_probe::peer", role = %role, "signal relay disconnected");
    let _ = disconnected.send(());
}

/// Wait for the relay's join notice; envelopes that precede it are kept.
async fn await_participant_count(
    role: &str,
    events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    early: &mut Vec<SignalingEnvelope>,
) -> Result<i64, PeerError> {
    while let Some(event) = events.recv().await {
        match event {
            SignalingEvent::Connected => {
                tracing::info!(target = "rtc_probe::peer", role = %role, "connected to signal relay");
            }
            SignalingEvent::Envelope(SignalingEnvelope::ParticipantCount(notice)) => {
                return Ok(notice.client_count);
            }
            SignalingEvent::Envelope(other) => early.push(other),
            SignalingEvent::Error(err) => {
                tracing::warn!(target = "rtc_probe::peer", role = %role, error = %err, "signal relay error");
            }
            SignalingEvent::Disconnected => break,
        }
    }
    Err(PeerError::SignalingClosed)
}

pub struct Peer {
    label: String,
    pc: Arc<RtcPeerConnection>,
    session: Arc<NegotiationSession>,
    channels: DataChannelPair,
    signaling: Mutex<Option<Arc<SignalingLink>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Peer {
    /// Join the relay, negotiate, and return once both data channels are
    /// open. The signaling link is closed at that point.
    pub async fn connect(config: &ProbeConfig) -> Result<Self, PeerError> {
        let label = config.label.clone();
        let (link, mut signal_events) = SignalingLink::connect(config.signal_url.as_str()).await?;
        let link = Arc::new(link);

        let mut early = Vec::new();
        let count = match tokio::time::timeout(
            config.connect_timeout,
            await_participant_count(&label, &mut signal_events, &mut early),
        )
        .await
        {
            Ok(Ok(count)) => count,
            Ok(Err(err)) => {
                link.close().await;
                return Err(err);
            }
            Err(_) => {
                link.close().await;
                return Err(PeerError::Timeout(config.connect_timeout, "participant count"));
            }
        };
        if !starts_negotiation(count) {
            tracing::warn!(target = "rtc_probe::peer", role = %label, client_count = count, "unexpected participant count, leaving relay");
            link.close().await;
            return Err(PeerError::UnexpectedParticipantCount(count));
        }
        tracing::info!(target = "rtc_probe::peer", role = %label, client_count = count, "creating peer connection");

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let pc = match RtcPeerConnection::new(&label, &config.ice_servers, session_tx.clone()).await
        {
            Ok(pc) => pc,
            Err(err) => {
                link.close().await;
                return Err(err.into());
            }
        };
        let session = Arc::new(NegotiationSession::new(
            label.clone(),
            pc.clone(),
            link.sender(),
            config.retry_offer,
        ));

        for envelope in early {
            route_envelope(&label, envelope, &session_tx);
        }
        let (disconnected_tx, mut disconnected_rx) = oneshot::channel();
        let router = tokio::spawn(route_signaling(
            label.clone(),
            signal_events,
            session_tx.clone(),
            disconnected_tx,
        ));
        drop(session_tx);

        let (driver_done_tx, mut driver_done_rx) = oneshot::channel();
        let driver_session = Arc::clone(&session);
        let driver_role = label.clone();
        let driver = tokio::spawn(async move {
            let result = driver_session.run(session_rx).await;
            if let Err(err) = &result {
                tracing::error!(target = "rtc_probe::peer", role = %driver_role, error = %err, "negotiation driver stopped");
            }
            let _ = driver_done_tx.send(result);
        });

        let peer_tasks = vec![router, driver];
        let channels = match pc.data_channels(config.max_message_size).await {
            Ok(channels) => channels,
            Err(err) => {
                Self::abandon(&session, &link, peer_tasks).await;
                return Err(err.into());
            }
        };
        session.attach_channels(channels.clone());

        let opened = async {
            channels.ordered.wait_open().await;
            channels.unordered.wait_open().await;
        };
        let outcome = tokio::select! {
            result = tokio::time::timeout(config.connect_timeout, opened) => {
                result.map_err(|_| PeerError::Timeout(config.connect_timeout, "data channels to open"))
            }
            result = &mut driver_done_rx => match result {
                Ok(Err(err)) => Err(PeerError::Negotiation(err)),
                _ => Err(PeerError::Negotiation(NegotiationError::Transport(TransportError::Closed))),
            },
            Ok(()) = &mut disconnected_rx => Err(PeerError::SignalingClosed),
        };
        if let Err(err) = outcome {
            Self::abandon(&session, &link, peer_tasks).await;
            return Err(err);
        }

        tracing::info!(target = "rtc_probe::peer", role = %label, "data channels open, leaving signal relay");
        link.close().await;

        Ok(Self {
            label,
            pc,
            session,
            channels,
            signaling: Mutex::new(Some(link)),
            tasks: Mutex::new(peer_tasks),
            closed: AtomicBool::new(false),
        })
    }

    async fn abandon(
        session: &NegotiationSession,
        link: &SignalingLink,
        tasks: Vec<JoinHandle<()>>,
    ) {
        if let Err(err) = session.close().await {
            tracing::warn!(target = "rtc_probe::peer", role = %session.label(), error = %err, "teardown after failed connect");
        }
        link.close().await;
        for task in tasks {
            task.abort();
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channels(&self) -> &DataChannelPair {
        &self.channels
    }

    pub fn session(&self) -> &Arc<NegotiationSession> {
        &self.session
    }

    /// Times this party lost an offer collision and started over on a fresh
    /// connection.
    pub fn connection_replacements(&self) -> usize {
        self.pc.replacements()
    }

    /// Data channels, then the peer connection, then the signaling link.
    /// Only the first call does anything.
    pub async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.session.close().await;
        let link = self.signaling.lock().take();
        if let Some(link) = link {
            link.close().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(target = "rtc_probe::peer", role = %self.label, "peer closed");
        result.map_err(PeerError::from)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// The signaling-independent half of [`Peer::connect`], for drivers that
/// bring their own peer connection.
pub fn spawn_session(
    label: &str,
    pc: Arc<dyn PeerConnection>,
    signal: mpsc::UnboundedSender<SignalingEnvelope>,
    retry_offer: bool,
    events: mpsc::UnboundedReceiver<SessionEvent>,
) -> (
    Arc<NegotiationSession>,
    JoinHandle<Result<(), NegotiationError>>,
) {
    let session = Arc::new(NegotiationSession::new(label, pc, signal, retry_offer));
    let driver = tokio::spawn(Arc::clone(&session).run(events));
    (session, driver)
}
