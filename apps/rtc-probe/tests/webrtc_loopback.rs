//! Two real webrtc-rs peers in one process, signaling over plain queues.
//! Both usually offer at once, in which case the loser of the tie-break
//! replaces its connection.

use std::sync::Arc;
use std::time::Duration;

use rtc_probe::negotiation::{NegotiationSession, SessionEvent};
use rtc_probe::peer::spawn_session;
use rtc_probe::probe::{
    BandwidthTransfer, LatencyProbe, ProbeChannel, ProbeOptions, ReceiveMeter, StopSignal,
};
use rtc_probe::signaling::SignalingEnvelope;
use rtc_probe::transport::webrtc::RtcPeerConnection;
use rtc_probe::transport::{DataChannelPair, PeerConnection};
use tokio::sync::mpsc;

struct Side {
    pc: Arc<RtcPeerConnection>,
    session: Arc<NegotiationSession>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
}

async fn side(label: &str) -> Side {
    let (events, events_rx) = mpsc::unbounded_channel();
    let pc = RtcPeerConnection::new(label, &[], events.clone())
        .await
        .expect("peer connection");
    let (signal_tx, outbound) = mpsc::unbounded_channel();
    let (session, _driver) = spawn_session(label, pc.clone(), signal_tx, true, events_rx);
    Side {
        pc,
        session,
        events,
        outbound,
    }
}

fn forward(
    mut from: mpsc::UnboundedReceiver<SignalingEnvelope>,
    to: mpsc::UnboundedSender<SessionEvent>,
) {
    tokio::spawn(async move {
        while let Some(envelope) = from.recv().await {
            let event = match envelope {
                SignalingEnvelope::Description { description } => {
                    SessionEvent::RemoteDescription(description)
                }
                SignalingEnvelope::Candidate { candidate } => SessionEvent::RemoteCandidate(candidate),
                SignalingEnvelope::ParticipantCount(_) => continue,
            };
            if to.send(event).is_err() {
                break;
            }
        }
    });
}

async fn open(side: &Side) -> DataChannelPair {
    let channels = side.pc.data_channels(65536).await.expect("channels");
    side.session.attach_channels(channels.clone());
    channels
}

#[test_timeout::tokio_timeout_test(60)]
async fn peers_negotiate_ping_and_transfer() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut a = side("a").await;
    let mut b = side("b").await;
    let a_out = std::mem::replace(&mut a.outbound, mpsc::unbounded_channel().1);
    let b_out = std::mem::replace(&mut b.outbound, mpsc::unbounded_channel().1);
    forward(a_out, b.events.clone());
    forward(b_out, a.events.clone());

    // Both create channels at once, so both offer and the tie-break runs.
    let (a_channels, b_channels) = tokio::join!(open(&a), open(&b));
    let wait = async {
        a_channels.ordered.wait_open().await;
        a_channels.unordered.wait_open().await;
        b_channels.ordered.wait_open().await;
        b_channels.unordered.wait_open().await;
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("channels open");
    // Zero when one side answered before its own offer went out.
    assert!(a.pc.replacements() + b.pc.replacements() <= 1);

    let _responder = ProbeChannel::spawn("b", Arc::clone(&b_channels.unordered));
    let probe = LatencyProbe::new(
        ProbeChannel::spawn("a", Arc::clone(&a_channels.unordered)),
        ProbeOptions {
            interval: Duration::from_millis(500),
            max_attempts: Some(3),
        },
    );
    let report = probe.run(&StopSignal::new()).await;
    assert_eq!(report.attempts, 3);
    assert!(!report.samples.is_empty(), "{report:?}");

    let total = 4 * 1024 * 1024;
    let mut meter = ReceiveMeter::spawn("b", Arc::clone(&b_channels.ordered));
    let transfer = BandwidthTransfer::start("a", Arc::clone(&a_channels.ordered), total)
        .await
        .unwrap();
    let sent = transfer.run().await.unwrap();
    assert_eq!(sent.bytes, total);
    let received = meter.wait_for_bytes(total as u64).await;
    assert_eq!(received.bytes, total as u64);

    a.session.close().await.unwrap();
    b.session.close().await.unwrap();
    assert!(a.pc.signaling_state() == rtc_probe::transport::SignalingState::Closed);
}
