use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use signal_relay::{serve, RelayState, DEFAULT_PATH};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay() -> (SocketAddr, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new();
    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state, DEFAULT_PATH).await;
    });
    (addr, state)
}

async fn join(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{DEFAULT_PATH}"))
        .await
        .expect("connect to relay");
    ws
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            Message::Text(text) => return text,
            Message::Binary(data) => return String::from_utf8(data).unwrap(),
            _ => continue,
        }
    }
}

async fn expect_silence(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

async fn wait_for_count(state: &RelayState, expected: i64) {
    for _ in 0..100 {
        if state.client_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "client count stuck at {}, expected {expected}",
        state.client_count()
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn joiners_receive_running_count() {
    let (addr, state) = start_relay().await;

    let mut first = join(addr).await;
    assert_eq!(
        next_text(&mut first).await,
        r#"{"type":"server","clientCount":1}"#
    );

    let mut second = join(addr).await;
    assert_eq!(
        next_text(&mut second).await,
        r#"{"type":"server","clientCount":2}"#
    );
    // The notice goes to the new party only.
    expect_silence(&mut first).await;

    second.close(None).await.unwrap();
    wait_for_count(&state, 1).await;

    let mut third = join(addr).await;
    assert_eq!(
        next_text(&mut third).await,
        r#"{"type":"server","clientCount":2}"#
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn frames_reach_everyone_but_the_sender() {
    let (addr, state) = start_relay().await;
    let mut a = join(addr).await;
    let _ = next_text(&mut a).await;
    let mut b = join(addr).await;
    let _ = next_text(&mut b).await;
    let mut c = join(addr).await;
    let _ = next_text(&mut c).await;
    wait_for_count(&state, 3).await;

    let offer = r#"{"description":{"type":"offer","sdp":"v=0\r\n"}}"#;
    a.send(Message::Text(offer.to_string())).await.unwrap();
    assert_eq!(next_text(&mut b).await, offer);
    assert_eq!(next_text(&mut c).await, offer);
    expect_silence(&mut a).await;

    // Payloads are opaque to the relay, binary frames included.
    b.send(Message::Binary(b"not json".to_vec())).await.unwrap();
    assert_eq!(next_text(&mut a).await, "not json");
    assert_eq!(next_text(&mut c).await, "not json");
    expect_silence(&mut b).await;
}
