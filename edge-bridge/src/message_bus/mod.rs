/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
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

//! Message-bus layer.
//!
//! [`MessageBus`] is the seam to a durable publish/subscribe backend. Backends
//! assign per-subject sequence numbers and keep durable consumer positions.
//! [`BusAdapter`] layers the bridge's delivery contract on top: fail-fast
//! publishes, lazy durable subscriptions that resubscribe with backoff, and
//! sequence-number deduplication of redeliveries.
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use edge_bridge::{BridgeConfig, BusAdapter, BusMessage, InMemoryBus, MessageBus, Subject};
//! use uuid::Uuid;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
//! let adapter = BusAdapter::new(bus, &BridgeConfig::default());
//! let subject = Subject::to_cluster(Uuid::new_v4());
//!
//! let ack = adapter
//!     .publish(&subject, BusMessage::new(None, Bytes::from_static(b"hello")))
//!     .await
//!     .unwrap();
//! assert_eq!(ack.sequence, 1);
//!
//! let mut subscription = adapter.subscribe_durable(subject, subject.consumer_name());
//! let delivery = subscription.next().await;
//! assert_eq!(delivery.envelope().payload, Bytes::from_static(b"hello"));
//! subscription.ack(delivery).await.unwrap();
//! # });
//! ```

pub(crate) mod adapter;
#[cfg(feature = "jetstream")]
pub(crate) mod jetstream;
pub(crate) mod memory;

use crate::envelope::{Envelope, Subject};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by a [`MessageBus`] backend or the [`BusAdapter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    #[error("message bus operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("durable subscription on {0} closed")]
    SubscriptionClosed(String),
    #[error("malformed message on {subject}: {reason}")]
    Malformed { subject: String, reason: String },
}

/// Payload and pass-through metadata handed to [`MessageBus::publish`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub correlation_id: Option<String>,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(correlation_id: Option<String>, payload: Bytes) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }
}

/// Acknowledgement of a durable publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Sequence assigned to the message on its subject.
    pub sequence: u64,
    /// The backend recognised the publish as a replay of an earlier one.
    pub duplicate: bool,
}

/// Backend-specific acknowledgement of one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;

    /// Gives the delivery back unprocessed so the backend can hand it to the
    /// next subscriber without waiting for its redelivery timeout.
    async fn nak(&self) -> Result<(), BusError>;
}

/// One envelope handed out by a durable consumer, pending acknowledgement.
pub struct Delivery {
    envelope: Envelope,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(envelope: Envelope, acker: Box<dyn Acker>) -> Self {
        Self { envelope, acker }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub(crate) async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub(crate) async fn nak(self) -> Result<(), BusError> {
        self.acker.nak().await
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Ordered, restartable cursor over one subject for one durable consumer name.
#[async_trait]
pub trait DurableConsumer: Send {
    /// Next delivery in subject order. `Some(Err(_))` or `None` means the
    /// subscription was lost and has to be re-established.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>>;
}

/// Durable publish/subscribe backend.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Appends `message` to `subject`, assigning the next subject sequence. Must
    /// fail instead of dropping when the backend cannot persist the message.
    async fn publish(&self, subject: &Subject, message: BusMessage)
        -> Result<PublishAck, BusError>;

    /// Attaches to `subject` as `consumer_name`, resuming after the last
    /// acknowledged sequence of that consumer.
    async fn subscribe_durable(
        &self,
        subject: &Subject,
        consumer_name: &str,
    ) -> Result<Box<dyn DurableConsumer>, BusError>;

    /// Fire-and-forget fan-out to every live subscriber of `subject`.
    async fn broadcast(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    async fn subscribe_broadcast(&self, subject: &str)
        -> Result<BoxStream<'static, Bytes>, BusError>;
}

pub use adapter::{BusAdapter, DurableSubscription};
#[cfg(feature = "jetstream")]
pub use jetstream::{JetStreamBus, JetStreamBusOptions};
pub use memory::InMemoryBus;
