/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use crate::config::BridgeConfig;
use crate::envelope::Subject;
use crate::message_bus::{BusError, BusMessage, Delivery, DurableConsumer, MessageBus, PublishAck};
use crate::observability::events;
use crate::runtime::backoff::RetryPolicy;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const COMPONENT: &str = "bus_adapter";

/// Bridge-side view of a [`MessageBus`]. Every publish is bounded by the
/// configured timeout and every durable subscription heals itself.
#[derive(Clone)]
pub struct BusAdapter {
    bus: Arc<dyn MessageBus>,
    publish_timeout: Duration,
    resubscribe: RetryPolicy,
}

impl BusAdapter {
    pub fn new(bus: Arc<dyn MessageBus>, config: &BridgeConfig) -> Self {
        Self {
            bus,
            publish_timeout: config.publish_timeout(),
            resubscribe: config.resubscribe_backoff.clone(),
        }
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Publishes durably or fails. A backend that does not answer within the
    /// publish timeout yields [`BusError::Timeout`].
    pub async fn publish(
        &self,
        subject: &Subject,
        message: BusMessage,
    ) -> Result<PublishAck, BusError> {
        match tokio::time::timeout(self.publish_timeout, self.bus.publish(subject, message)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event = events::BUS_PUBLISH_TIMEOUT,
                    component = COMPONENT,
                    subject = %subject,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "publish did not complete in time"
                );
                Err(BusError::Timeout(self.publish_timeout))
            }
        }
    }

    /// Creates a durable subscription. Nothing is contacted until the first
    /// call to [`DurableSubscription::next`].
    pub fn subscribe_durable(
        &self,
        subject: Subject,
        consumer_name: impl Into<String>,
    ) -> DurableSubscription {
        DurableSubscription {
            bus: self.bus.clone(),
            subject,
            consumer_name: consumer_name.into(),
            resubscribe: self.resubscribe.clone(),
            consumer: None,
            last_acked: 0,
        }
    }

    /// Fans `payload` out to live subscribers, bounded by the publish timeout.
    pub async fn broadcast(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        tokio::time::timeout(self.publish_timeout, self.bus.broadcast(subject, payload))
            .await
            .unwrap_or(Err(BusError::Timeout(self.publish_timeout)))
    }

    pub async fn subscribe_broadcast(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Bytes>, BusError> {
        self.bus.subscribe_broadcast(subject).await
    }
}

/// Ordered, self-healing view over one durable consumer.
///
/// Deliveries at or below the highest sequence acknowledged through this
/// subscription are redeliveries; they are acknowledged again and skipped.
pub struct DurableSubscription {
    bus: Arc<dyn MessageBus>,
    subject: Subject,
    consumer_name: String,
    resubscribe: RetryPolicy,
    consumer: Option<Box<dyn DurableConsumer>>,
    last_acked: u64,
}

impl DurableSubscription {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    /// Waits for the next undelivered envelope. Never gives up: a lost
    /// subscription is re-established with backoff, so callers bound this with
    /// their own cancellation.
    pub async fn next(&mut self) -> Delivery {
        loop {
            let Some(consumer) = self.consumer.as_mut() else {
                self.connect().await;
                continue;
            };

            match consumer.next_delivery().await {
                Some(Ok(delivery)) => {
                    let sequence = delivery.envelope().sequence;
                    if sequence <= self.last_acked {
                        debug!(
                            event = events::BUS_DUPLICATE_SKIPPED,
                            component = COMPONENT,
                            subject = %self.subject,
                            sequence,
                            last_acked = self.last_acked,
                            "skipping redelivered message"
                        );
                        if let Err(err) = delivery.ack().await {
                            debug!(
                                event = events::BUS_DUPLICATE_SKIPPED,
                                component = COMPONENT,
                                subject = %self.subject,
                                sequence,
                                err = %err,
                                "re-ack of duplicate failed"
                            );
                        }
                        continue;
                    }
                    return delivery;
                }
                Some(Err(err)) => {
                    warn!(
                        event = events::BUS_SUBSCRIPTION_LOST,
                        component = COMPONENT,
                        subject = %self.subject,
                        consumer = %self.consumer_name,
                        err = %err,
                        "durable subscription lost"
                    );
                    self.consumer = None;
                }
                None => {
                    warn!(
                        event = events::BUS_SUBSCRIPTION_LOST,
                        component = COMPONENT,
                        subject = %self.subject,
                        consumer = %self.consumer_name,
                        "durable subscription ended"
                    );
                    self.consumer = None;
                }
            }
        }
    }

    /// Returns `delivery` to the bus without processing it.
    pub async fn nak(&mut self, delivery: Delivery) -> Result<(), BusError> {
        delivery.nak().await
    }

    /// Acknowledges `delivery`, advancing the deduplication watermark.
    pub async fn ack(&mut self, delivery: Delivery) -> Result<(), BusError> {
        let sequence = delivery.envelope().sequence;
        delivery.ack().await?;
        self.last_acked = self.last_acked.max(sequence);
        Ok(())
    }

    async fn connect(&mut self) {
        let mut backoff = self.resubscribe.backoff();

        loop {
            match self
                .bus
                .subscribe_durable(&self.subject, &self.consumer_name)
                .await
            {
                Ok(consumer) => {
                    info!(
                        event = events::BUS_SUBSCRIBE_OK,
                        component = COMPONENT,
                        subject = %self.subject,
                        consumer = %self.consumer_name,
                        attempts = backoff.attempts() + 1,
                        "durable subscription established"
                    );
                    self.consumer = Some(consumer);
                    return;
                }
                Err(err) => {
                    // A bounded resubscribe policy restarts its curve instead of giving up.
                    let delay = backoff.next_delay().unwrap_or_else(|| {
                        backoff.reset();
                        Duration::from_millis(self.resubscribe.max_delay_ms)
                    });
                    warn!(
                        event = events::BUS_SUBSCRIBE_FAILED,
                        component = COMPONENT,
                        subject = %self.subject,
                        consumer = %self.consumer_name,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "durable subscribe failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BusAdapter;
    use crate::config::BridgeConfig;
    use crate::envelope::{Envelope, Subject};
    use crate::message_bus::{
        Acker, BusError, BusMessage, Delivery, DurableConsumer, InMemoryBus, MessageBus,
        PublishAck,
    };
    use crate::runtime::backoff::RetryPolicy;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use uuid::Uuid;

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            publish_timeout_ms: 50,
            resubscribe_backoff: RetryPolicy {
                max_attempts: 0,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..BridgeConfig::default()
        }
    }

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn ack(&self) -> Result<(), BusError> {
            Ok(())
        }

        async fn nak(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    struct ScriptedConsumer {
        sequences: VecDeque<u64>,
        subject: Subject,
    }

    #[async_trait]
    impl DurableConsumer for ScriptedConsumer {
        async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
            let sequence = self.sequences.pop_front()?;
            let envelope = Envelope {
                cluster_id: self.subject.cluster_id,
                direction: self.subject.direction,
                sequence,
                correlation_id: None,
                payload: Bytes::new(),
            };
            Some(Ok(Delivery::new(envelope, Box::new(NoopAcker))))
        }
    }

    /// Publishes hang forever; each subscribe hands out the next script.
    struct ScriptedBus {
        scripts: Mutex<VecDeque<Vec<u64>>>,
    }

    #[async_trait]
    impl MessageBus for ScriptedBus {
        async fn publish(
            &self,
            _subject: &Subject,
            _message: BusMessage,
        ) -> Result<PublishAck, BusError> {
            futures::future::pending().await
        }

        async fn subscribe_durable(
            &self,
            subject: &Subject,
            _consumer_name: &str,
        ) -> Result<Box<dyn DurableConsumer>, BusError> {
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| BusError::Unavailable("no script left".to_string()))?;
            Ok(Box::new(ScriptedConsumer {
                sequences: script.into(),
                subject: *subject,
            }))
        }

        async fn broadcast(&self, _subject: &str, _payload: Bytes) -> Result<(), BusError> {
            Ok(())
        }

        async fn subscribe_broadcast(
            &self,
            _subject: &str,
        ) -> Result<BoxStream<'static, Bytes>, BusError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn publish_times_out_instead_of_hanging() {
        let bus = Arc::new(ScriptedBus {
            scripts: Mutex::new(VecDeque::new()),
        });
        let adapter = BusAdapter::new(bus, &fast_config());

        let result = adapter
            .publish(
                &Subject::from_cluster(Uuid::new_v4()),
                BusMessage::new(None, Bytes::from_static(b"x")),
            )
            .await;

        assert_eq!(result, Err(BusError::Timeout(Duration::from_millis(50))));
    }

    #[tokio::test]
    async fn redeliveries_after_resubscribe_are_skipped() {
        let bus = Arc::new(ScriptedBus {
            scripts: Mutex::new(VecDeque::from(vec![vec![1, 2], vec![1, 2, 3]])),
        });
        let adapter = BusAdapter::new(bus, &fast_config());
        let subject = Subject::to_cluster(Uuid::new_v4());
        let mut subscription = adapter.subscribe_durable(subject, subject.consumer_name());

        let mut seen = Vec::new();
        for _ in 0..3 {
            let delivery = subscription.next().await;
            seen.push(delivery.envelope().sequence);
            subscription.ack(delivery).await.unwrap();
        }

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(subscription.last_acked(), 3);
    }

    #[tokio::test]
    async fn subscription_recovers_after_bus_outage() {
        let bus = InMemoryBus::new();
        let adapter = BusAdapter::new(Arc::new(bus.clone()), &fast_config());
        let subject = Subject::to_cluster(Uuid::new_v4());
        let mut subscription = adapter.subscribe_durable(subject, subject.consumer_name());

        adapter
            .publish(&subject, BusMessage::new(None, Bytes::from_static(b"first")))
            .await
            .unwrap();
        let first = subscription.next().await;
        subscription.ack(first).await.unwrap();

        bus.set_available(false);
        let restorer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            restorer.set_available(true);
            restorer
                .publish(&subject, BusMessage::new(None, Bytes::from_static(b"second")))
                .await
                .unwrap();
        });

        let second = tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("subscription should heal");
        assert_eq!(second.envelope().sequence, 2);
        assert_eq!(second.envelope().payload, Bytes::from_static(b"second"));
    }
}
