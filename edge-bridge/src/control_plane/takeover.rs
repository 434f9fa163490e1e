//! Fleet-wide takeover.
//!
//! The registry keeps one connection per cluster inside a process. Replicas
//! extend that to the fleet in two steps. Every accepted connection first
//! appends an install record to the cluster's durable `installs` subject;
//! the bus sequence of that record is the install's [`FleetEpoch`], ordered
//! the same way on every replica. The replica then broadcasts a notice
//! carrying the epoch, and whoever holds a connection from an earlier epoch
//! evicts it.

use crate::control_plane::connection::{FleetEpoch, Generation};
use crate::control_plane::connection_registry::ConnectionRegistry;
use crate::envelope::Subject;
use crate::identity::ClusterId;
use crate::message_bus::{BusAdapter, BusError, BusMessage};
use crate::observability::events;
use crate::runtime::backoff::RetryPolicy;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMPONENT: &str = "takeover";

/// Ephemeral subject every replica listens on.
pub const TAKEOVER_SUBJECT: &str = "bridge.control.takeover";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverNotice {
    pub cluster_id: ClusterId,
    pub replica_id: String,
    /// Sequence of the install record on the cluster's `installs` subject.
    pub epoch: FleetEpoch,
}

fn malformed(subject: impl ToString, err: serde_json::Error) -> BusError {
    BusError::Malformed {
        subject: subject.to_string(),
        reason: err.to_string(),
    }
}

/// Appends an install record for `cluster_id` and returns its epoch.
///
/// A record the backend reports as a duplicate may carry another replica's
/// sequence, so it counts as a failed attempt and is written again.
pub(crate) async fn record_install(
    bus: &BusAdapter,
    cluster_id: ClusterId,
    replica_id: &str,
) -> Result<FleetEpoch, BusError> {
    let subject = Subject::installs(cluster_id);
    let payload = serde_json::to_vec(&serde_json::json!({ "replica_id": replica_id }))
        .map_err(|err| malformed(subject, err))?;

    let ack = bus
        .publish(
            &subject,
            BusMessage::new(Some(replica_id.to_string()), Bytes::from(payload)),
        )
        .await?;
    if ack.duplicate {
        return Err(BusError::Unavailable(format!(
            "install record {} on {subject} was deduplicated",
            ack.sequence
        )));
    }
    Ok(ack.sequence)
}

pub(crate) async fn announce(bus: &BusAdapter, notice: &TakeoverNotice) -> Result<(), BusError> {
    let payload = serde_json::to_vec(notice).map_err(|err| malformed(TAKEOVER_SUBJECT, err))?;
    bus.broadcast(TAKEOVER_SUBJECT, Bytes::from(payload)).await
}

/// Applies a notice, local or remote. Only a connection installed at an
/// earlier epoch is evicted; wall clocks never take part. Returns the evicted
/// generation.
pub(crate) fn apply_notice(
    registry: &ConnectionRegistry,
    notice: &TakeoverNotice,
) -> Option<Generation> {
    registry.fence(notice.cluster_id, notice.epoch)
}

/// Re-establishes the notice subscription with backoff. `None` on shutdown.
async fn resubscribe(
    bus: &BusAdapter,
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
) -> Option<BoxStream<'static, Bytes>> {
    let mut backoff = policy.backoff();

    loop {
        let subscribed = tokio::select! {
            _ = shutdown.cancelled() => return None,
            subscribed = bus.subscribe_broadcast(TAKEOVER_SUBJECT) => subscribed,
        };
        let err = match subscribed {
            Ok(notices) => return Some(notices),
            Err(err) => err,
        };

        let delay = backoff.next_delay().unwrap_or_else(|| {
            backoff.reset();
            Duration::from_millis(policy.max_delay_ms)
        });
        warn!(
            event = events::BUS_SUBSCRIBE_FAILED,
            component = COMPONENT,
            subject = TAKEOVER_SUBJECT,
            delay_ms = delay.as_millis() as u64,
            err = %err,
            "takeover subscription failed, retrying"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Listens for notices on `initial` until `shutdown` fires, resubscribing when
/// the broadcast subscription is lost.
pub(crate) fn spawn_takeover_listener(
    bus: BusAdapter,
    registry: Arc<ConnectionRegistry>,
    replica_id: String,
    resubscribe_policy: RetryPolicy,
    shutdown: CancellationToken,
    initial: BoxStream<'static, Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut notices = initial;

        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = notices.next() => next,
            };

            let Some(payload) = payload else {
                warn!(
                    event = events::BUS_SUBSCRIPTION_LOST,
                    component = COMPONENT,
                    subject = TAKEOVER_SUBJECT,
                    "takeover subscription ended, resubscribing"
                );
                match resubscribe(&bus, &resubscribe_policy, &shutdown).await {
                    Some(resubscribed) => {
                        debug!(
                            event = events::BUS_SUBSCRIBE_OK,
                            component = COMPONENT,
                            subject = TAKEOVER_SUBJECT,
                            "listening for takeover notices again"
                        );
                        notices = resubscribed;
                        continue;
                    }
                    None => return,
                }
            };

            let notice = match serde_json::from_slice::<TakeoverNotice>(&payload) {
                Ok(notice) => notice,
                Err(err) => {
                    warn!(
                        event = events::TAKEOVER_NOTICE_MALFORMED,
                        component = COMPONENT,
                        err = %err,
                        "ignoring malformed takeover notice"
                    );
                    continue;
                }
            };

            match apply_notice(&registry, &notice) {
                Some(generation) if notice.replica_id != replica_id => info!(
                    event = events::TAKEOVER_REMOTE_EVICTION,
                    component = COMPONENT,
                    cluster_id = %notice.cluster_id,
                    generation,
                    remote_replica = %notice.replica_id,
                    epoch = notice.epoch,
                    "cluster connected to another replica, evicted local connection"
                ),
                Some(generation) => debug!(
                    event = events::TAKEOVER_REMOTE_EVICTION,
                    component = COMPONENT,
                    cluster_id = %notice.cluster_id,
                    generation,
                    epoch = notice.epoch,
                    "own notice evicted an older local connection"
                ),
                None => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{apply_notice, record_install, TakeoverNotice};
    use crate::config::BridgeConfig;
    use crate::control_plane::connection::StreamHandle;
    use crate::control_plane::connection_registry::ConnectionRegistry;
    use crate::error::TeardownReason;
    use crate::message_bus::{BusAdapter, InMemoryBus};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn notice(cluster_id: Uuid, replica_id: &str, epoch: u64) -> TakeoverNotice {
        TakeoverNotice {
            cluster_id,
            replica_id: replica_id.to_string(),
            epoch,
        }
    }

    fn stream() -> StreamHandle {
        let (tx, _rx) = mpsc::channel(1);
        StreamHandle::new(tx)
    }

    #[test]
    fn notice_for_the_same_install_keeps_the_connection() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();
        let connection = registry.install_at_epoch(cluster_id, stream(), 3).unwrap();

        assert_eq!(
            apply_notice(&registry, &notice(cluster_id, "replica-a", 3)),
            None
        );
        assert!(!connection.is_closed());
    }

    #[test]
    fn later_install_elsewhere_evicts_even_when_its_clock_lags() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();
        let connection = registry.install_at_epoch(cluster_id, stream(), 1).unwrap();

        // Nothing about the notice depends on when either replica thinks it installed.
        assert_eq!(
            apply_notice(&registry, &notice(cluster_id, "replica-b", 2)),
            Some(1)
        );
        assert!(!connection.is_current());
        assert_eq!(connection.reason(), Some(&TeardownReason::Superseded));
        assert!(registry.lookup(&cluster_id).is_none());
    }

    #[test]
    fn earlier_install_elsewhere_keeps_local_connection() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();
        let connection = registry.install_at_epoch(cluster_id, stream(), 5).unwrap();

        assert_eq!(
            apply_notice(&registry, &notice(cluster_id, "replica-b", 4)),
            None
        );
        assert!(connection.is_current());
    }

    #[tokio::test]
    async fn install_records_are_ordered_across_replicas() {
        let bus = InMemoryBus::new();
        let adapter = BusAdapter::new(Arc::new(bus.clone()), &BridgeConfig::default());
        let cluster_id = Uuid::new_v4();

        let first = record_install(&adapter, cluster_id, "replica-a").await.unwrap();
        let second = record_install(&adapter, cluster_id, "replica-b").await.unwrap();
        let other = record_install(&adapter, Uuid::new_v4(), "replica-a").await.unwrap();

        assert_eq!((first, second, other), (1, 2, 1));
    }

    #[test]
    fn notice_wire_format_is_json() {
        let encoded = serde_json::to_value(notice(Uuid::nil(), "replica-b", 5)).unwrap();

        assert_eq!(encoded["replica_id"], "replica-b");
        assert_eq!(encoded["epoch"], 5);
    }
}
