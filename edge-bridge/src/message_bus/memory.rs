//! In-process durable bus.
//!
//! Every subject is an append-only log and every durable consumer a cursor over
//! it. Both outlive any [`DurableConsumer`] handle, so a subscriber that goes
//! away and comes back resumes after its last acknowledged sequence. An
//! availability switch simulates backend outages.

use crate::envelope::{Envelope, Subject};
use crate::message_bus::{
    Acker, BusError, BusMessage, Delivery, DurableConsumer, MessageBus, PublishAck,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

const BROADCAST_CAPACITY: usize = 1024;
const UNAVAILABLE_REASON: &str = "in-memory bus switched off";

#[derive(Default)]
struct MemoryState {
    logs: HashMap<Subject, Vec<Envelope>>,
    /// Last acknowledged sequence per `(subject, consumer_name)`.
    cursors: HashMap<(Subject, String), u64>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    available: AtomicBool,
    /// Bumped on every publish and availability change to wake consumers.
    changes: watch::Sender<u64>,
    broadcasts: broadcast::Sender<(String, Bytes)>,
    /// Cancelled and replaced on every outage so live subscriptions observe it.
    outage: Mutex<CancellationToken>,
}

impl MemoryInner {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outage_token(&self) -> CancellationToken {
        self.outage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable(UNAVAILABLE_REASON.to_string()))
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Durable [`MessageBus`] kept entirely in process memory.
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<MemoryInner>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                available: AtomicBool::new(true),
                changes,
                broadcasts,
                outage: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Switches the bus on or off. While off every operation fails with
    /// [`BusError::Unavailable`] and live durable consumers report the loss.
    pub fn set_available(&self, available: bool) {
        let was_available = self.inner.available.swap(available, Ordering::SeqCst);
        if was_available && !available {
            let mut outage = self
                .inner
                .outage
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            outage.cancel();
            *outage = CancellationToken::new();
        }
        self.inner.notify();
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Snapshot of everything persisted on `subject`, in sequence order.
    pub fn subject_log(&self, subject: &Subject) -> Vec<Envelope> {
        self.inner
            .state()
            .logs
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Last sequence acknowledged by `consumer_name` on `subject`, `0` if none.
    pub fn acked_sequence(&self, subject: &Subject, consumer_name: &str) -> u64 {
        self.inner
            .state()
            .cursors
            .get(&(*subject, consumer_name.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        subject: &Subject,
        message: BusMessage,
    ) -> Result<PublishAck, BusError> {
        self.inner.ensure_available()?;

        let sequence = {
            let mut state = self.inner.state();
            let log = state.logs.entry(*subject).or_default();
            let sequence = log.len() as u64 + 1;
            log.push(Envelope {
                cluster_id: subject.cluster_id,
                direction: subject.direction,
                sequence,
                correlation_id: message.correlation_id,
                payload: message.payload,
            });
            sequence
        };
        self.inner.notify();

        Ok(PublishAck {
            sequence,
            duplicate: false,
        })
    }

    async fn subscribe_durable(
        &self,
        subject: &Subject,
        consumer_name: &str,
    ) -> Result<Box<dyn DurableConsumer>, BusError> {
        self.inner.ensure_available()?;

        let key = (*subject, consumer_name.to_string());
        let acked = *self.inner.state().cursors.entry(key).or_insert(0);

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            subject: *subject,
            consumer_name: consumer_name.to_string(),
            next_sequence: acked + 1,
            changes: self.inner.changes.subscribe(),
            outage: self.inner.outage_token(),
        }))
    }

    async fn broadcast(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.inner.ensure_available()?;
        // No live subscriber is not an error for fan-out.
        let _ = self.inner.broadcasts.send((subject.to_string(), payload));
        Ok(())
    }

    async fn subscribe_broadcast(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Bytes>, BusError> {
        self.inner.ensure_available()?;

        let subject = subject.to_string();
        let receiver = self.inner.broadcasts.subscribe();
        let outage = self.inner.outage_token();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(item) => return Some((item, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter_map(move |(item_subject, payload)| {
            let matches = item_subject == subject;
            async move { matches.then_some(payload) }
        })
        .take_until(outage.cancelled_owned());

        Ok(stream.boxed())
    }
}

struct MemoryConsumer {
    inner: Arc<MemoryInner>,
    subject: Subject,
    consumer_name: String,
    next_sequence: u64,
    changes: watch::Receiver<u64>,
    outage: CancellationToken,
}

#[async_trait]
impl DurableConsumer for MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        loop {
            if self.outage.is_cancelled() {
                return Some(Err(BusError::Unavailable(UNAVAILABLE_REASON.to_string())));
            }
            self.changes.borrow_and_update();

            let next = self
                .inner
                .state()
                .logs
                .get(&self.subject)
                .and_then(|log| log.get((self.next_sequence - 1) as usize))
                .cloned();

            if let Some(envelope) = next {
                self.next_sequence += 1;
                let acker = MemoryAcker {
                    inner: self.inner.clone(),
                    key: (self.subject, self.consumer_name.clone()),
                    sequence: envelope.sequence,
                };
                return Some(Ok(Delivery::new(envelope, Box::new(acker))));
            }

            tokio::select! {
                changed = self.changes.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                _ = self.outage.cancelled() => {}
            }
        }
    }
}

struct MemoryAcker {
    inner: Arc<MemoryInner>,
    key: (Subject, String),
    sequence: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state();
        let cursor = state.cursors.entry(self.key.clone()).or_insert(0);
        *cursor = (*cursor).max(self.sequence);
        Ok(())
    }

    /// Cursors only move on ack, so the next subscription starts at this
    /// delivery anyway.
    async fn nak(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryBus;
    use crate::envelope::Subject;
    use crate::message_bus::{BusError, BusMessage, MessageBus};
    use bytes::Bytes;
    use futures::StreamExt;
    use std::time::Duration;
    use uuid::Uuid;

    fn message(payload: &'static str) -> BusMessage {
        BusMessage::new(None, Bytes::from_static(payload.as_bytes()))
    }

    #[tokio::test]
    async fn sequences_are_per_subject_and_gap_free() {
        let bus = InMemoryBus::new();
        let cluster_id = Uuid::new_v4();
        let to_cluster = Subject::to_cluster(cluster_id);
        let from_cluster = Subject::from_cluster(cluster_id);

        assert_eq!(bus.publish(&to_cluster, message("a")).await.unwrap().sequence, 1);
        assert_eq!(bus.publish(&from_cluster, message("b")).await.unwrap().sequence, 1);
        assert_eq!(bus.publish(&to_cluster, message("c")).await.unwrap().sequence, 2);

        let log = bus.subject_log(&to_cluster);
        assert_eq!(
            log.iter().map(|envelope| envelope.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn durable_consumer_resumes_after_last_ack() {
        let bus = InMemoryBus::new();
        let subject = Subject::to_cluster(Uuid::new_v4());
        for payload in ["one", "two", "three"] {
            bus.publish(&subject, message(payload)).await.unwrap();
        }

        let mut consumer = bus.subscribe_durable(&subject, "durable").await.unwrap();
        let first = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(first.envelope().sequence, 1);
        first.ack().await.unwrap();
        let second = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.envelope().sequence, 2);
        drop(second);
        drop(consumer);

        let mut resumed = bus.subscribe_durable(&subject, "durable").await.unwrap();
        let redelivered = resumed.next_delivery().await.unwrap().unwrap();
        assert_eq!(redelivered.envelope().sequence, 2);
        assert_eq!(bus.acked_sequence(&subject, "durable"), 1);
    }

    #[tokio::test]
    async fn consumer_wakes_up_on_publish() {
        let bus = InMemoryBus::new();
        let subject = Subject::to_cluster(Uuid::new_v4());
        let mut consumer = bus.subscribe_durable(&subject, "waiter").await.unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&subject, message("late")).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), consumer.next_delivery())
            .await
            .expect("consumer should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope().payload, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn outage_fails_publish_and_interrupts_consumers() {
        let bus = InMemoryBus::new();
        let subject = Subject::to_cluster(Uuid::new_v4());
        let mut consumer = bus.subscribe_durable(&subject, "outage").await.unwrap();

        bus.set_available(false);

        assert!(matches!(
            bus.publish(&subject, message("lost?")).await,
            Err(BusError::Unavailable(_))
        ));
        assert!(matches!(
            consumer.next_delivery().await,
            Some(Err(BusError::Unavailable(_)))
        ));
        assert!(bus.subscribe_durable(&subject, "outage").await.is_err());

        bus.set_available(true);
        assert!(bus.publish(&subject, message("back")).await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_only_reaches_matching_subject() {
        let bus = InMemoryBus::new();
        let mut control = bus.subscribe_broadcast("control").await.unwrap();

        bus.broadcast("other", Bytes::from_static(b"x")).await.unwrap();
        bus.broadcast("control", Bytes::from_static(b"y")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), control.next())
            .await
            .expect("broadcast should arrive");
        assert_eq!(received, Some(Bytes::from_static(b"y")));
    }

    #[tokio::test]
    async fn nak_leaves_the_delivery_for_the_next_subscriber() {
        let bus = InMemoryBus::new();
        let subject = Subject::to_cluster(Uuid::new_v4());
        bus.publish(&subject, message("cmd")).await.unwrap();

        let mut first = bus.subscribe_durable(&subject, "durable").await.unwrap();
        let delivery = first.next_delivery().await.unwrap().unwrap();
        delivery.nak().await.unwrap();
        drop(first);

        let mut second = bus.subscribe_durable(&subject, "durable").await.unwrap();
        let again = second.next_delivery().await.unwrap().unwrap();
        assert_eq!(again.envelope().sequence, 1);
        assert_eq!(bus.acked_sequence(&subject, "durable"), 0);
    }
}
