//! A single bridged edge session as seen by the registry.

use crate::data_plane::edge_stream::{BridgeFrame, OutboundFrame};
use crate::error::TeardownReason;
use crate::identity::ClusterId;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-cluster install counter. Strictly increases with every install.
pub type Generation = u64;

/// Fleet-wide install order of a cluster's connections: the bus sequence of
/// the install record. Comparable across replicas, unlike [`Generation`].
pub type FleetEpoch = u64;

/// Write side of an edge stream, handed to the registry on install.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    outbound: mpsc::Sender<OutboundFrame>,
}

impl StreamHandle {
    pub fn new(outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self { outbound }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("connection generation is no longer current")]
    StaleGeneration,
    #[error("edge stream closed")]
    StreamClosed,
    #[error("stream write timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug)]
pub struct Connection {
    cluster_id: ClusterId,
    generation: Generation,
    epoch: FleetEpoch,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    /// Shared with the registry slot; bumped before an older connection is closed.
    current_generation: Arc<AtomicU64>,
    stale: AtomicBool,
    close: CancellationToken,
    close_reason: OnceLock<TeardownReason>,
    stream: StreamHandle,
}

impl Connection {
    pub(crate) fn new(
        cluster_id: ClusterId,
        generation: Generation,
        epoch: FleetEpoch,
        current_generation: Arc<AtomicU64>,
        stream: StreamHandle,
    ) -> Self {
        Self {
            cluster_id,
            generation,
            epoch,
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            current_generation,
            stale: AtomicBool::new(false),
            close: CancellationToken::new(),
            close_reason: OnceLock::new(),
            stream,
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn epoch(&self) -> FleetEpoch {
        self.epoch
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Refreshes `last_activity`; called for every inbound frame.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// `false` once a newer generation was installed or the connection was evicted.
    pub fn is_current(&self) -> bool {
        !self.stale.load(Ordering::SeqCst)
            && self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Signals teardown without waiting for it. Returns `true` only for the call
    /// whose reason was recorded.
    pub fn close(&self, reason: TeardownReason) -> bool {
        let recorded = self.close_reason.set(reason).is_ok();
        self.close.cancel();
        recorded
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    pub fn reason(&self) -> Option<&TeardownReason> {
        self.close_reason.get()
    }

    /// Writes `frame` to the edge, refusing once this generation is superseded.
    ///
    /// Resolves once the transport confirmed the write, not when the frame was
    /// queued. `timeout` bounds both.
    pub async fn write(&self, frame: BridgeFrame, timeout: Duration) -> Result<(), WriteError> {
        if !self.is_current() {
            return Err(WriteError::StaleGeneration);
        }

        let (queued, confirmed) = OutboundFrame::with_receipt(frame);
        let written = async {
            self.stream
                .outbound
                .send(queued)
                .await
                .map_err(|_| WriteError::StreamClosed)?;
            confirmed.await.map_err(|_| WriteError::StreamClosed)
        };

        tokio::time::timeout(timeout, written)
            .await
            .unwrap_or(Err(WriteError::Timeout(timeout)))
    }

    /// Best-effort final frame to the edge; never waits for queue capacity.
    pub(crate) fn try_send_close(&self, reason: &TeardownReason) {
        let _ = self
            .stream
            .outbound
            .try_send(OutboundFrame::unconfirmed(BridgeFrame::Close {
                reason: reason.to_string(),
            }));
    }
}
