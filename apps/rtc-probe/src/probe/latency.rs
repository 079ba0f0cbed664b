//! Round-trip latency and loss over the unordered channel.
//!
//! One ping is outstanding at a time. Each attempt races the next pong
//! against the probe interval; a reply that arrives after its attempt timed
//! out finds no waiter and is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::StopSignal;
use crate::transport::{DataChannel, TransportError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("probe send failed: {0}")]
    Send(#[source] TransportError),
    #[error("undecodable probe message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("probe channel closed")]
    Closed,
}

/// `{"type":"ping","id":n}` / `{"type":"pong","id":n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeMessage {
    Ping { id: u64 },
    Pong { id: u64 },
}

impl ProbeMessage {
    pub fn id(&self) -> u64 {
        match self {
            ProbeMessage::Ping { id } | ProbeMessage::Pong { id } => *id,
        }
    }
}

type PendingReply = Mutex<Option<oneshot::Sender<ProbeMessage>>>;

/// Owns the receive side of a probe channel: answers every ping with a pong
/// and hands pongs to the single outstanding [`Self::send_and_wait`].
pub struct ProbeChannel {
    role: String,
    channel: Arc<dyn DataChannel>,
    pending: Arc<PendingReply>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeChannel {
    pub fn spawn(role: impl Into<String>, channel: Arc<dyn DataChannel>) -> Arc<Self> {
        let role = role.into();
        let pending: Arc<PendingReply> = Arc::new(Mutex::new(None));
        let dispatcher = tokio::spawn(dispatch(
            role.clone(),
            Arc::clone(&channel),
            Arc::clone(&pending),
        ));
        Arc::new(Self {
            role,
            channel,
            pending,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Send `message` and wait up to `timeout` for the next pong, whatever
    /// its id. A previous waiter, if any, is replaced.
    pub async fn send_and_wait(
        &self,
        message: ProbeMessage,
        timeout: Duration,
    ) -> Result<ProbeMessage, ProbeError> {
        let text = serde_json::to_string(&message)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.pending.lock() = Some(reply_tx);

        if let Err(err) = self.channel.send_text(text).await {
            self.pending.lock().take();
            return Err(ProbeError::Send(err));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProbeError::Closed),
            Err(_) => {
                self.pending.lock().take();
                Err(ProbeError::Timeout(timeout))
            }
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Stop answering and routing.
    pub fn shutdown(&self) {
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        self.pending.lock().take();
    }
}

impl Drop for ProbeChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn dispatch(role: String, channel: Arc<dyn DataChannel>, pending: Arc<PendingReply>) {
    while let Some(payload) = channel.recv().await {
        let message: ProbeMessage = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(target = "rtc_probe::probe", role = %role, error = %err, len = payload.len(), "ignoring non-probe message");
                continue;
            }
        };
        match message {
            ProbeMessage::Ping { id } => {
                tracing::trace!(target = "rtc_probe::probe", role = %role, id, "ping recv");
                let pong = ProbeMessage::Pong { id };
                match serde_json::to_string(&pong) {
                    Ok(text) => {
                        if let Err(err) = channel.send_text(text).await {
                            tracing::debug!(target = "rtc_probe::probe", role = %role, id, error = %err, "pong send failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "rtc_probe::probe", role = %role, id, error = %err, "pong encode failed");
                    }
                }
            }
            ProbeMessage::Pong { id } => match pending.lock().take() {
                Some(waiter) => {
                    let _ = waiter.send(message);
                }
                None => {
                    tracing::debug!(target = "rtc_probe::probe", role = %role, id, "late pong dropped");
                }
            },
        }
    }
    pending.lock().take();
    tracing::debug!(target = "rtc_probe::probe", role = %role, "probe channel closed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Per-attempt timeout and the pause between attempts.
    pub interval: Duration,
    /// Stop after this many attempts; `None` runs until stopped.
    pub max_attempts: Option<u64>,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_attempts: None,
        }
    }
}

pub struct LatencyProbe {
    channel: Arc<ProbeChannel>,
    options: ProbeOptions,
}

impl LatencyProbe {
    pub fn new(channel: Arc<ProbeChannel>, options: ProbeOptions) -> Self {
        Self { channel, options }
    }

    /// Probe until `stop` fires or the attempt budget is spent.
    pub async fn run(&self, stop: &StopSignal) -> LatencyReport {
        let role = self.channel.role().to_string();
        let interval = self.options.interval;
        let mut report = LatencyReport::default();
        let mut next_id: u64 = 1;

        while !stop.is_stopped() {
            if let Some(max) = self.options.max_attempts {
                if report.attempts >= max {
                    break;
                }
            }
            let id = next_id;
            next_id += 1;
            let sent_at = Instant::now();
            match self
                .channel
                .send_and_wait(ProbeMessage::Ping { id }, interval)
                .await
            {
                Ok(reply) => {
                    let latency = sent_at.elapsed();
                    if reply.id() != id {
                        tracing::debug!(target = "rtc_probe::probe", role = %role, id, reply_id = reply.id(), "pong id differs from ping id");
                    }
                    tracing::info!(target = "rtc_probe::probe", role = %role, id = reply.id(), latency_ms = millis(latency), "ping ok");
                    report.samples.push(latency);
                }
                Err(ProbeError::Timeout(_)) => {
                    tracing::info!(target = "rtc_probe::probe", role = %role, id, "ping timeout");
                    report.lost += 1;
                }
                Err(err) => {
                    tracing::warn!(target = "rtc_probe::probe", role = %role, id, error = %err, "ping fail");
                    report.lost += 1;
                }
            }
            report.attempts += 1;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.stopped() => break,
            }
        }
        report
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Statistics over one probe run. `attempts` counts completed cycles,
/// successful or not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyReport {
    pub samples: Vec<Duration>,
    pub attempts: u64,
    pub lost: u64,
}

impl LatencyReport {
    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Lost attempts over all attempts, in percent.
    pub fn loss_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.lost as f64 / self.attempts as f64 * 100.0
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min(), self.max(), self.mean()) {
            (Some(min), Some(max), Some(mean)) => {
                writeln!(f, "Ping statistics:")?;
                writeln!(f, "  minimum latency: {:.2} ms", millis(min))?;
                writeln!(f, "  maximum latency: {:.2} ms", millis(max))?;
                writeln!(f, "  average latency: {:.2} ms", millis(mean))?;
                write!(
                    f,
                    "  packet loss rate: {:.2}% ({} of {})",
                    self.loss_rate(),
                    self.lost,
                    self.attempts
                )
            }
            _ => write!(f, "No successful pings ({} attempts).", self.attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelState;
    use crate::transport::mock::{BufferModel, MemoryChannel};

    fn options(interval_ms: u64, max_attempts: u64) -> ProbeOptions {
        ProbeOptions {
            interval: Duration::from_millis(interval_ms),
            max_attempts: Some(max_attempts),
        }
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn silent_peer_means_total_loss() {
        let (near, _far) = MemoryChannel::pair("unordered", 1024, BufferModel::Drained);
        let probe = LatencyProbe::new(ProbeChannel::spawn("a", near), options(100, 5));

        let report = probe.run(&StopSignal::new()).await;
        assert_eq!(report.attempts, 5);
        assert_eq!(report.lost, 5);
        assert!(report.samples.is_empty());
        assert_eq!(report.loss_rate(), 100.0);
        assert!(report.to_string().starts_with("No successful pings"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn delayed_replies_bound_the_statistics() {
        let (near, far) = MemoryChannel::pair("unordered", 1024, BufferModel::Drained);
        let delays = [10u64, 40, 25, 5];
        let responder = tokio::spawn(async move {
            for delay in delays {
                let Some(payload) = far.recv().await else { return };
                let ping: ProbeMessage = serde_json::from_slice(&payload).unwrap();
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let pong = ProbeMessage::Pong { id: ping.id() };
                far.send_text(serde_json::to_string(&pong).unwrap())
                    .await
                    .unwrap();
            }
        });

        let probe = LatencyProbe::new(ProbeChannel::spawn("a", near), options(100, 4));
        let report = probe.run(&StopSignal::new()).await;
        responder.await.unwrap();

        assert_eq!(report.attempts, 4);
        assert_eq!(report.lost, 0);
        assert_eq!(report.loss_rate(), 0.0);
        let min = report.min().unwrap();
        let max = report.max().unwrap();
        let mean = report.mean().unwrap();
        assert!(min >= Duration::from_millis(5), "min {min:?}");
        assert!(max >= Duration::from_millis(40), "max {max:?}");
        assert!(max < Duration::from_millis(100), "max {max:?}");
        assert!(min <= mean && mean <= max);
        assert!(report.to_string().contains("packet loss rate: 0.00%"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn both_ends_answer_pings() {
        let (near, far) = MemoryChannel::pair("unordered", 1024, BufferModel::Drained);
        let _responder = ProbeChannel::spawn("b", far);
        let probe = LatencyProbe::new(ProbeChannel::spawn("a", near), options(50, 3));

        let report = probe.run(&StopSignal::new()).await;
        assert_eq!(report.attempts, 3);
        assert_eq!(report.lost, 0);
        assert_eq!(report.samples.len(), 3);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn late_reply_is_not_matched_to_next_attempt() {
        let (near, far) = MemoryChannel::pair("unordered", 1024, BufferModel::Drained);
        let channel = ProbeChannel::spawn("a", near);

        let err = channel
            .send_and_wait(ProbeMessage::Ping { id: 1 }, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));

        // The reply to ping 1 shows up after its attempt was abandoned.
        far.send_text(r#"{"type":"pong","id":1}"#.to_string())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let err = channel
            .send_and_wait(ProbeMessage::Ping { id: 2 }, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn send_failure_counts_as_loss() {
        let (near, _far) = MemoryChannel::pair("unordered", 1024, BufferModel::Drained);
        near.set_state(ChannelState::Closed);
        let probe = LatencyProbe::new(ProbeChannel::spawn("a", near), options(10, 2));

        let report = probe.run(&StopSignal::new()).await;
        assert_eq!(report.attempts, 2);
        assert_eq!(report.lost, 2);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn stop_signal_ends_the_run() {
        let (near, far) = MemoryChannel::pair("unordered", 1024, BufferModel::Drained);
        let _responder = ProbeChannel::spawn("b", far);
        let probe = LatencyProbe::new(
            ProbeChannel::spawn("a", near),
            ProbeOptions {
                interval: Duration::from_millis(100),
                max_attempts: None,
            },
        );
        let stop = StopSignal::new();
        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(450)).await;
                stop.stop();
            })
        };

        let report = probe.run(&stop).await;
        stopper.await.unwrap();
        assert!(report.attempts >= 4 && report.attempts <= 5, "{report:?}");
        assert_eq!(report.lost, 0);
    }

    #[test]
    fn wire_format_matches_browser_peer() {
        assert_eq!(
            serde_json::to_string(&ProbeMessage::Ping { id: 7 }).unwrap(),
            r#"{"type":"ping","id":7}"#
        );
        let pong: ProbeMessage = serde_json::from_str(r#"{"type":"pong","id":7}"#).unwrap();
        assert_eq!(pong, ProbeMessage::Pong { id: 7 });
    }

    #[test]
    fn loss_rate_divides_by_attempts() {
        let report = LatencyReport {
            samples: vec![Duration::from_millis(4), Duration::from_millis(8)],
            attempts: 4,
            lost: 2,
        };
        assert_eq!(report.loss_rate(), 50.0);
        assert_eq!(report.mean(), Some(Duration::from_millis(6)));
        let text = report.to_string();
        assert!(text.contains("minimum latency: 4.00 ms"));
        assert!(text.contains("maximum latency: 8.00 ms"));
        assert!(text.contains("average latency: 6.00 ms"));
        assert!(text.contains("50.00% (2 of 4)"));
    }
}
