use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{SignalingEnvelope, SignalingError};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// What the link reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    Connected,
    Envelope(SignalingEnvelope),
    /// The relay went away. Terminal for the signaling phase only.
    Disconnected,
    Error(String),
}

/// JSON envelopes over a WebSocket to the relay.
///
/// Outbound envelopes are queued on an unbounded channel and written in
/// order by a writer task; inbound frames are decoded by a reader task and
/// surfaced as [`SignalingEvent`]s.
pub struct SignalingLink {
    url: Url,
    outbound: mpsc::UnboundedSender<SignalingEnvelope>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalingLink {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), SignalingError> {
        let url = parse_signaling_url(url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(target = "rtc_probe::signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        // Queued before the reader exists, so it is always the first event.
        let _ = events_tx.send(SignalingEvent::Connected);

        let writer_events = events_tx.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_envelope = outbound_rx.recv() => {
                        let Some(envelope) = maybe_envelope else { break };
                        let text = match envelope.to_json() {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(target = "rtc_probe::signaling", kind = envelope.kind(), error = %err, "dropping unencodable envelope");
                                continue;
                            }
                        };
                        tracing::trace!(target = "rtc_probe::signaling", event = "ws_out", kind = envelope.kind(), len = text.len());
                        if let Err(err) = ws_write.send(Message::Text(text)).await {
                            let _ = writer_events.send(SignalingEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!(target = "rtc_probe::signaling", "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "rtc_probe::signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "rtc_probe::signaling", "signaling websocket error: {err}");
                                let _ = events_tx.send(SignalingEvent::Error(err.to_string()));
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "rtc_probe::signaling", event = "ws_in", len = text.len());
                match SignalingEnvelope::from_json(&text) {
                    Ok(envelope) => {
                        if events_tx.send(SignalingEvent::Envelope(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "rtc_probe::signaling", error = %err, payload = %text, "ignoring undecodable signaling message");
                    }
                }
            }
            let _ = events_tx.send(SignalingEvent::Disconnected);
        });

        let link = Self {
            url,
            outbound,
            shutdown: Mutex::new(Some(shutdown_tx)),
            tasks: Mutex::new(vec![writer, reader]),
            closed: AtomicBool::new(false),
        };
        Ok((link, events_rx))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Queue an envelope for the relay.
    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        self.outbound
            .send(envelope)
            .map_err(|_| SignalingError::Closed)
    }

    /// A cloneable outbound sink, handed to the negotiation session.
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalingEnvelope> {
        self.outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a close frame and stop both tasks. Idempotent; does not emit
    /// [`SignalingEvent::Disconnected`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let mut tasks = tasks.into_iter();
        if let Some(mut writer) = tasks.next() {
            // Give the writer a moment to flush the close frame.
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
        tracing::debug!(target = "rtc_probe::signaling", url = %self.url, "signaling link closed");
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Parse a relay address, accepting `ws` and `wss` only.
pub fn parse_signaling_url(raw: &str) -> Result<Url, SignalingError> {
    let url = Url::parse(raw).map_err(|err| SignalingError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SignalingError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_websocket_urls_only() {
        assert!(parse_signaling_url("ws://127.0.0.1:8000/ws").is_ok());
        assert!(parse_signaling_url("wss://relay.example.com/ws").is_ok());
        assert!(matches!(
            parse_signaling_url("http://127.0.0.1:8000/ws"),
            Err(SignalingError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_signaling_url("not a url"),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }
}
