//! Diagnostic workloads that ride on an established channel pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub mod bandwidth;
pub mod latency;

pub use bandwidth::{
    BandwidthTransfer, ReceiveMeter, ReceiveSummary, SendProgress, TransferError, TransferReport,
    TransferState,
};
pub use latency::{LatencyProbe, LatencyReport, ProbeChannel, ProbeError, ProbeMessage, ProbeOptions};

/// Cooperative stop flag shared between a run loop and whoever ends it.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::stop`] has been called.
    pub async fn stopped(&self) {
        let notified = self.inner.notify.notified();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
