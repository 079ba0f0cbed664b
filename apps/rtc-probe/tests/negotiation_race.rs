use std::sync::Arc;
use std::time::Duration;

use rtc_probe::negotiation::{NegotiationSession, SessionEvent, SessionPhase};
use rtc_probe::peer::spawn_session;
use rtc_probe::signaling::SignalingEnvelope;
use rtc_probe::transport::mock::MockPeerConnection;
use rtc_probe::transport::{IceCandidate, PeerConnection, SignalingState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Party {
    session: Arc<NegotiationSession>,
    pc: Arc<MockPeerConnection>,
    events: mpsc::UnboundedSender<SessionEvent>,
    signal_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    _driver: JoinHandle<Result<(), rtc_probe::negotiation::NegotiationError>>,
}

fn party(label: &str, offer_sdp: &str, retry_offer: bool) -> Party {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pc = MockPeerConnection::new(offer_sdp, format!("answer-{label}"));
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let (session, driver) = spawn_session(label, pc.clone(), signal_tx, retry_offer, events_rx);
    Party {
        session,
        pc,
        events,
        signal_rx,
        _driver: driver,
    }
}

/// Relay one party's outbound envelopes into the other's session queue.
fn forward(
    mut from: mpsc::UnboundedReceiver<SignalingEnvelope>,
    to: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
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
    })
}

async fn wait_stable(parties: &[&Arc<MockPeerConnection>]) {
    for _ in 0..200 {
        if parties
            .iter()
            .all(|pc| pc.signaling_state() == SignalingState::Stable && !pc.applied_remote().is_empty())
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sessions never settled");
}

/// First party joins alone; its initial offer goes nowhere. The second party
/// joins and offers; the two offers collide and must still converge.
async fn late_joiner_scenario(a_sdp: &str, b_sdp: &str) -> (Party, Party) {
    let mut a = party("a", a_sdp, true);
    a.events.send(SessionEvent::NegotiationNeeded).unwrap();
    let lost = a.signal_rx.recv().await.unwrap();
    assert_eq!(lost.kind(), "offer");
    assert_eq!(a.pc.signaling_state(), SignalingState::HaveLocalOffer);

    let mut b = party("b", b_sdp, true);
    let a_out = std::mem::replace(&mut a.signal_rx, mpsc::unbounded_channel().1);
    let b_out = std::mem::replace(&mut b.signal_rx, mpsc::unbounded_channel().1);
    forward(a_out, b.events.clone());
    forward(b_out, a.events.clone());
    b.events.send(SessionEvent::NegotiationNeeded).unwrap();

    wait_stable(&[&a.pc, &b.pc]).await;
    (a, b)
}

#[test_timeout::tokio_timeout_test(20)]
async fn greater_first_offer_survives_the_collision() {
    let (a, b) = late_joiner_scenario("offer-zzz-a", "offer-aaa-b").await;

    // A ignored B's offer and re-sent its own; B started over on a fresh connection and answered.
    // The answer clears A's ignore flag again.
    assert!(!a.session.ignore_offer());
    assert!(!b.session.ignore_offer());
    assert_eq!(a.pc.restarts(), 0);
    assert_eq!(b.pc.restarts(), 1);
    assert_eq!(b.pc.applied_remote()[0].sdp, "offer-zzz-a");
    assert_eq!(
        a.pc.applied_remote(),
        vec![rtc_probe::transport::SessionDescription::answer("answer-b")]
    );
    assert_eq!(a.session.phase(), SessionPhase::Stable);
    assert_eq!(b.session.phase(), SessionPhase::Stable);
}

#[test_timeout::tokio_timeout_test(20)]
async fn greater_late_offer_wins_without_retry_round() {
    let (a, b) = late_joiner_scenario("offer-a-aaa", "offer-b-zzz").await;

    assert!(!a.session.ignore_offer());
    assert_eq!(a.pc.restarts(), 1);
    assert_eq!(a.pc.applied_remote()[0].sdp, "offer-b-zzz");
    assert_eq!(b.pc.applied_remote()[0].sdp, "answer-a");
    assert_eq!(b.pc.restarts(), 0);
}

#[test_timeout::tokio_timeout_test(20)]
async fn candidates_flow_once_settled_and_close_is_idempotent() {
    let (a, b) = late_joiner_scenario("offer-a-1", "offer-b-2").await;

    a.events
        .send(SessionEvent::LocalCandidate(IceCandidate::new("candidate:a")))
        .unwrap();
    b.events
        .send(SessionEvent::LocalCandidate(IceCandidate::new("candidate:b")))
        .unwrap();
    for _ in 0..200 {
        if a.pc.candidates().len() == 1 && b.pc.candidates().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.pc.candidates(), vec![IceCandidate::new("candidate:b")]);
    assert_eq!(b.pc.candidates(), vec![IceCandidate::new("candidate:a")]);

    a.session.close().await.unwrap();
    a.session.close().await.unwrap();
    assert_eq!(a.pc.close_calls(), 1);
    assert_eq!(a.session.phase(), SessionPhase::Closed);
}

#[test_timeout::tokio_timeout_test(20)]
async fn without_retry_a_lost_offer_stalls_the_greater_side() {
    let mut a = party("a", "offer-zzz-a", false);
    a.events.send(SessionEvent::NegotiationNeeded).unwrap();
    let _lost = a.signal_rx.recv().await.unwrap();

    let mut b = party("b", "offer-aaa-b", false);
    let a_out = std::mem::replace(&mut a.signal_rx, mpsc::unbounded_channel().1);
    let b_out = std::mem::replace(&mut b.signal_rx, mpsc::unbounded_channel().1);
    forward(a_out, b.events.clone());
    forward(b_out, a.events.clone());
    b.events.send(SessionEvent::NegotiationNeeded).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.session.ignore_offer());
    assert_eq!(a.pc.signaling_state(), SignalingState::HaveLocalOffer);
    assert_eq!(b.pc.signaling_state(), SignalingState::HaveLocalOffer);
}
