//! Flow-controlled bulk transfer over the ordered channel.
//!
//! Pausing is decided on a locally tracked buffer estimate, since the
//! channel's own buffered amount lags behind real sends. Resumption listens
//! to two sources: the channel's buffered-amount-low notification and a
//! zero-delay retry armed only when the channel already reports less than
//! the low watermark at pause time. Both wake the same [`Notify`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::transport::{ChannelState, DataChannel, TransportError};

/// Upper bound on a single chunk regardless of what the channel accepts.
pub const MAX_CHUNK_SIZE: usize = 262_144;
/// Lower bound on the high watermark.
pub const MIN_HIGH_WATERMARK: usize = 1024 * 1024;

const FILLER: u8 = b'X';

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("channel {label} is {state}, transfer abandoned")]
    ChannelNotOpen { label: String, state: ChannelState },
    #[error("chunk send failed: {0}")]
    Send(#[source] TransportError),
    #[error("invalid transfer size: {0}")]
    InvalidSize(String),
}

/// Sender-side bookkeeping. Mutated only by [`BandwidthTransfer::send_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferState {
    pub chunk_size: usize,
    pub bytes_total: usize,
    pub bytes_sent: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

impl TransferState {
    pub fn new(max_message_size: usize, bytes_total: usize) -> Result<Self, TransferError> {
        if bytes_total == 0 {
            return Err(TransferError::InvalidSize("nothing to send".into()));
        }
        if max_message_size == 0 {
            return Err(TransferError::InvalidSize(
                "channel max message size is zero".into(),
            ));
        }
        let chunk_size = max_message_size.min(MAX_CHUNK_SIZE);
        Ok(Self {
            chunk_size,
            bytes_total,
            bytes_sent: 0,
            low_watermark: chunk_size,
            high_watermark: (chunk_size * 16).max(MIN_HIGH_WATERMARK),
        })
    }

    pub fn remaining(&self) -> usize {
        self.bytes_total - self.bytes_sent
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.bytes_total
    }

    /// Number of chunks a full transfer takes.
    pub fn chunk_count(&self) -> usize {
        self.bytes_total.div_ceil(self.chunk_size)
    }
}

/// Outcome of one [`BandwidthTransfer::send_data`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// The local estimate hit the high watermark.
    Paused {
        bytes_sent: usize,
        buffered_estimate: usize,
        retry_scheduled: bool,
    },
    Complete(TransferReport),
}

pub struct BandwidthTransfer {
    role: String,
    channel: Arc<dyn DataChannel>,
    state: TransferState,
    payload: Bytes,
    resume: Arc<Notify>,
    retry: Option<JoinHandle<()>>,
    chunks_sent: usize,
    started_at: Instant,
}

impl BandwidthTransfer {
    /// Derive chunk size and watermarks from the channel and arm its
    /// buffered-amount-low notification.
    pub async fn start(
        role: impl Into<String>,
        channel: Arc<dyn DataChannel>,
        bytes_total: usize,
    ) -> Result<Self, TransferError> {
        let role = role.into();
        let state = TransferState::new(channel.max_message_size(), bytes_total)?;
        let resume = Arc::new(Notify::new());
        channel
            .set_buffered_amount_low_threshold(state.low_watermark)
            .await;
        channel.on_buffered_amount_low(Arc::clone(&resume)).await;
        tracing::info!(
            target = "rtc_probe::bandwidth",
            role = %role,
            chunk_size = state.chunk_size,
            low_watermark = state.low_watermark,
            high_watermark = state.high_watermark,
            bytes_total,
            "starting bandwidth transfer"
        );
        Ok(Self {
            role,
            channel,
            payload: Bytes::from(vec![FILLER; state.chunk_size]),
            state,
            resume,
            retry: None,
            chunks_sent: 0,
            started_at: Instant::now(),
        })
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn chunks_sent(&self) -> usize {
        self.chunks_sent
    }

    /// Send chunks until the transfer completes or the local estimate
    /// reaches the high watermark. Any retry armed by an earlier call is
    /// cancelled first.
    pub async fn send_data(&mut self) -> Result<SendProgress, TransferError> {
        self.cancel_retry();

        let mut buffered = self.channel.buffered_amount().await;
        while !self.state.is_complete() {
            let ready = self.channel.ready_state();
            if ready != ChannelState::Open {
                tracing::warn!(target = "rtc_probe::bandwidth", role = %self.role, state = %ready, bytes_sent = self.state.bytes_sent, "channel not open, abandoning transfer");
                return Err(TransferError::ChannelNotOpen {
                    label: self.channel.label().to_string(),
                    state: ready,
                });
            }
            let len = self.state.chunk_size.min(self.state.remaining());
            let chunk = self.payload.slice(..len);
            if let Err(err) = self.channel.send(chunk).await {
                tracing::warn!(target = "rtc_probe::bandwidth", role = %self.role, error = %err, bytes_sent = self.state.bytes_sent, "chunk send failed, abandoning transfer");
                return Err(match err {
                    TransportError::ChannelClosed { label, state } => {
                        TransferError::ChannelNotOpen { label, state }
                    }
                    other => TransferError::Send(other),
                });
            }
            buffered += len;
            self.state.bytes_sent += len;
            self.chunks_sent += 1;

            if self.state.is_complete() {
                let report = TransferReport {
                    bytes: self.state.bytes_total,
                    chunks: self.chunks_sent,
                    elapsed: self.started_at.elapsed(),
                };
                tracing::info!(target = "rtc_probe::bandwidth", role = %self.role, bytes = report.bytes, elapsed_ms = report.elapsed_ms(), mb_per_sec = report.megabytes_per_sec(), "transfer completed");
                return Ok(SendProgress::Complete(report));
            }

            if buffered >= self.state.high_watermark {
                let reported = self.channel.buffered_amount().await;
                let retry_scheduled = reported < self.state.low_watermark;
                if retry_scheduled {
                    self.schedule_retry();
                }
                tracing::trace!(target = "rtc_probe::bandwidth", role = %self.role, buffered_estimate = buffered, reported, retry_scheduled, "paused at high watermark");
                return Ok(SendProgress::Paused {
                    bytes_sent: self.state.bytes_sent,
                    buffered_estimate: buffered,
                    retry_scheduled,
                });
            }
        }
        // Only reachable when called again after completion.
        Ok(SendProgress::Complete(TransferReport {
            bytes: self.state.bytes_total,
            chunks: self.chunks_sent,
            elapsed: self.started_at.elapsed(),
        }))
    }

    /// Drive `send_data` to completion, sleeping on the resume signal
    /// whenever it pauses.
    pub async fn run(mut self) -> Result<TransferReport, TransferError> {
        loop {
            match self.send_data().await? {
                SendProgress::Complete(report) => return Ok(report),
                SendProgress::Paused { .. } => self.resume.notified().await,
            }
        }
    }

    fn schedule_retry(&mut self) {
        let resume = Arc::clone(&self.resume);
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::ZERO).await;
            resume.notify_one();
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }
}

impl Drop for BandwidthTransfer {
    fn drop(&mut self) {
        self.cancel_retry();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

impl TransferReport {
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1000.0
    }

    /// Decimal megabytes per second: bytes / 1000 / milliseconds.
    pub fn megabytes_per_sec(&self) -> f64 {
        let ms = self.elapsed_ms();
        if ms <= 0.0 {
            return f64::INFINITY;
        }
        self.bytes as f64 / 1000.0 / ms
    }
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data transfer completed successfully!")?;
        writeln!(
            f,
            "  {} bytes in {} chunks, {:.2} ms",
            self.bytes,
            self.chunks,
            self.elapsed_ms()
        )?;
        write!(f, "  MBytes/sec: {:.2}", self.megabytes_per_sec())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub messages: u64,
    pub bytes: u64,
}

/// Drains a channel's inbound side and counts what arrives.
pub struct ReceiveMeter {
    summary: watch::Receiver<ReceiveSummary>,
    task: JoinHandle<()>,
}

const RECEIVE_LOG_EVERY: u64 = 8 * 1024 * 1024;

impl ReceiveMeter {
    pub fn spawn(role: impl Into<String>, channel: Arc<dyn DataChannel>) -> Self {
        let role = role.into();
        let (tx, rx) = watch::channel(ReceiveSummary::default());
        let task = tokio::spawn(async move {
            let mut next_log = RECEIVE_LOG_EVERY;
            while let Some(payload) = channel.recv().await {
                tx.send_modify(|summary| {
                    summary.messages += 1;
                    summary.bytes += payload.len() as u64;
                });
                let bytes = tx.borrow().bytes;
                if bytes >= next_log {
                    tracing::debug!(target = "rtc_probe::bandwidth", role = %role, bytes, "received");
                    next_log = bytes + RECEIVE_LOG_EVERY;
                }
            }
            let summary = *tx.borrow();
            tracing::info!(target = "rtc_probe::bandwidth", role = %role, messages = summary.messages, bytes = summary.bytes, "receive meter finished");
        });
        Self { summary: rx, task }
    }

    pub fn summary(&self) -> ReceiveSummary {
        *self.summary.borrow()
    }

    /// Resolves once at least `bytes` have arrived, or with the final count
    /// if the channel closes first.
    pub async fn wait_for_bytes(&mut self, bytes: u64) -> ReceiveSummary {
        if let Ok(summary) = self.summary.wait_for(|summary| summary.bytes >= bytes).await {
            return *summary;
        }
        *self.summary.borrow()
    }
}

impl Drop for ReceiveMeter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
