//! Bus to edge stream direction of a stream adapter.

use crate::control_plane::connection::{Connection, WriteError};
use crate::data_plane::edge_stream::BridgeFrame;
use crate::envelope::Subject;
use crate::error::TeardownReason;
use crate::message_bus::{BusAdapter, Delivery, DurableSubscription};
use crate::observability::events;
use crate::observability::fields::EnvelopeFields;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Level};

const COMPONENT: &str = "outbound_pump";

/// Relays the cluster's `to_cluster` subject to the edge. A delivery is acked
/// only after the edge transport confirmed the write and the connection is
/// still current. Every other outcome hands the delivery back to the bus.
pub(crate) async fn run_outbound(
    connection: Arc<Connection>,
    bus: BusAdapter,
    write_timeout: Duration,
) {
    let cluster_id = connection.cluster_id();
    let generation = connection.generation();
    let subject = Subject::to_cluster(cluster_id);
    let mut subscription = bus.subscribe_durable(subject, subject.consumer_name());

    loop {
        let delivery = tokio::select! {
            biased;
            _ = connection.closed() => return,
            delivery = subscription.next() => delivery,
        };

        let envelope = delivery.envelope();
        let frame = BridgeFrame::Data {
            sequence: envelope.sequence,
            correlation_id: envelope.correlation_id.clone(),
            payload: envelope.payload.clone(),
        };

        let written = tokio::select! {
            biased;
            _ = connection.closed() => {
                release(&connection, &mut subscription, delivery, "connection closed").await;
                return;
            }
            written = connection.write(frame, write_timeout) => written,
        };

        match written {
            Ok(()) => {}
            Err(WriteError::StaleGeneration) => {
                debug!(
                    event = events::OUTBOUND_STALE_WRITER,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    sequence = delivery.envelope().sequence,
                    "generation superseded before write"
                );
                release(&connection, &mut subscription, delivery, "superseded").await;
                return;
            }
            Err(WriteError::Timeout(timeout)) => {
                warn!(
                    event = events::OUTBOUND_WRITE_TIMEOUT,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    sequence = delivery.envelope().sequence,
                    timeout_ms = timeout.as_millis() as u64,
                    "edge did not take the frame in time"
                );
                connection.close(TeardownReason::StreamError(format!(
                    "write timed out after {}ms",
                    timeout.as_millis()
                )));
                release(&connection, &mut subscription, delivery, "write timed out").await;
                return;
            }
            Err(WriteError::StreamClosed) => {
                connection.close(TeardownReason::StreamClosed);
                release(&connection, &mut subscription, delivery, "stream closed").await;
                return;
            }
        }

        if !connection.is_current() {
            // Written, but the next generation owns the consumer now and
            // redelivers; the edge drops the duplicate by sequence.
            release(&connection, &mut subscription, delivery, "superseded after write").await;
            return;
        }

        if tracing::enabled!(Level::DEBUG) {
            let fields = EnvelopeFields::from_envelope(delivery.envelope());
            debug!(
                event = events::OUTBOUND_WRITE_OK,
                component = COMPONENT,
                cluster_id = %cluster_id,
                generation,
                subject = %fields.subject,
                sequence = fields.sequence,
                correlation_id = %fields.correlation_id,
                payload_len = fields.payload_len,
                "delivered to edge"
            );
        }

        let sequence = delivery.envelope().sequence;
        if let Err(err) = subscription.ack(delivery).await {
            // Redelivered after resubscribe; the edge sees a duplicate sequence.
            warn!(
                event = events::OUTBOUND_ACK_FAILED,
                component = COMPONENT,
                cluster_id = %cluster_id,
                generation,
                sequence,
                err = %err,
                "ack failed after successful write"
            );
        }
    }
}

async fn release(
    connection: &Connection,
    subscription: &mut DurableSubscription,
    delivery: Delivery,
    why: &'static str,
) {
    let sequence = delivery.envelope().sequence;
    let released = subscription.nak(delivery).await;
    debug!(
        event = events::OUTBOUND_RELEASED,
        component = COMPONENT,
        cluster_id = %connection.cluster_id(),
        generation = connection.generation(),
        sequence,
        why,
        nak_ok = released.is_ok(),
        "delivery handed back unacknowledged"
    );
}

#[cfg(test)]
mod tests {
    use super::run_outbound;
    use crate::config::BridgeConfig;
    use crate::control_plane::connection::{Connection, StreamHandle};
    use crate::data_plane::edge_stream::{BridgeFrame, OutboundFrame};
    use crate::envelope::{Envelope, Subject};
    use crate::error::TeardownReason;
    use crate::message_bus::{
        Acker, BusAdapter, BusError, BusMessage, Delivery, DurableConsumer, MessageBus,
        PublishAck,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const GUARD: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Outcomes {
        acks: AtomicUsize,
        naks: AtomicUsize,
    }

    struct CountingAcker(Arc<Outcomes>);

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self) -> Result<(), BusError> {
            self.0.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nak(&self) -> Result<(), BusError> {
            self.0.naks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out a single command, then stays silent.
    struct SingleCommand {
        outcomes: Arc<Outcomes>,
        pending: Option<Envelope>,
    }

    #[async_trait]
    impl DurableConsumer for SingleCommand {
        async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
            match self.pending.take() {
                Some(envelope) => Some(Ok(Delivery::new(
                    envelope,
                    Box::new(CountingAcker(self.outcomes.clone())),
                ))),
                None => futures::future::pending().await,
            }
        }
    }

    struct SingleCommandBus {
        outcomes: Arc<Outcomes>,
    }

    #[async_trait]
    impl MessageBus for SingleCommandBus {
        async fn publish(
            &self,
            _subject: &Subject,
            _message: BusMessage,
        ) -> Result<PublishAck, BusError> {
            Err(BusError::Unavailable("read only".to_string()))
        }

        async fn subscribe_durable(
            &self,
            subject: &Subject,
            _consumer_name: &str,
        ) -> Result<Box<dyn DurableConsumer>, BusError> {
            Ok(Box::new(SingleCommand {
                outcomes: self.outcomes.clone(),
                pending: Some(Envelope {
                    cluster_id: subject.cluster_id,
                    direction: subject.direction,
                    sequence: 1,
                    correlation_id: None,
                    payload: Bytes::from_static(b"cmd"),
                }),
            }))
        }

        async fn broadcast(&self, _subject: &str, _payload: Bytes) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe_broadcast(
            &self,
            _subject: &str,
        ) -> Result<BoxStream<'static, Bytes>, BusError> {
            Ok(Box::pin(futures::stream::pending::<Bytes>()))
        }
    }

    fn setup() -> (
        Arc<Outcomes>,
        BusAdapter,
        Arc<Connection>,
        mpsc::Receiver<OutboundFrame>,
    ) {
        let outcomes = Arc::new(Outcomes::default());
        let bus = BusAdapter::new(
            Arc::new(SingleCommandBus {
                outcomes: outcomes.clone(),
            }),
            &BridgeConfig::default(),
        );
        let (tx, rx) = mpsc::channel(4);
        let connection = Arc::new(Connection::new(
            Uuid::new_v4(),
            1,
            1,
            Arc::new(AtomicU64::new(1)),
            StreamHandle::new(tx),
        ));
        (outcomes, bus, connection, rx)
    }

    #[tokio::test]
    async fn confirmed_write_is_acked() {
        let (outcomes, bus, connection, mut rx) = setup();
        let pump = tokio::spawn(run_outbound(connection.clone(), bus, GUARD));

        let queued = tokio::time::timeout(GUARD, rx.recv()).await.unwrap().unwrap();
        assert!(matches!(
            queued.delivered(),
            BridgeFrame::Data { sequence: 1, .. }
        ));
        tokio::time::timeout(GUARD, async {
            while outcomes.acks.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        connection.close(TeardownReason::Shutdown);
        pump.await.unwrap();
        assert_eq!(outcomes.naks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unread_frame_is_never_acked_and_is_handed_back() {
        let (outcomes, bus, connection, _rx) = setup();

        tokio::time::timeout(
            GUARD,
            run_outbound(connection.clone(), bus, Duration::from_millis(30)),
        )
        .await
        .unwrap();

        assert_eq!(outcomes.acks.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes.naks.load(Ordering::SeqCst), 1);
        assert!(matches!(
            connection.reason(),
            Some(TeardownReason::StreamError(_))
        ));
    }

    #[tokio::test]
    async fn takeover_during_write_hands_the_delivery_back() {
        let (outcomes, bus, connection, mut rx) = setup();
        let pump = tokio::spawn(run_outbound(connection.clone(), bus, GUARD));

        // Queued, but the edge never confirms before the next generation arrives.
        let _queued = tokio::time::timeout(GUARD, rx.recv()).await.unwrap().unwrap();
        connection.mark_stale();
        connection.close(TeardownReason::Superseded);

        tokio::time::timeout(GUARD, pump).await.unwrap().unwrap();
        assert_eq!(outcomes.acks.load(Ordering::SeqCst), 0);
        assert_eq!(outcomes.naks.load(Ordering::SeqCst), 1);
    }
}
