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

//! # edge-bridge
//!
//! `edge-bridge` is the cloud side of a connectivity bridge: firewalled edge
//! clusters dial out, present their identity and keep one long-lived duplex
//! stream open. The bridge relays frames between that stream and a durable
//! message bus, so cloud services talk to clusters purely through per-cluster
//! subjects and never need inbound reachability to the edge.
//!
//! Typical usage is centered on [`BridgeService`], a [`MessageBus`] backend
//! and a [`ClusterManager`] that owns cluster identities.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use edge_bridge::{
//!     BootstrapToken, BridgeConfig, BridgeFrame, BridgeService, BusMessage, ClusterIdentity,
//!     ClusterManager, ClusterManagerError, DeployKey, EdgeStream, InMemoryBus, Subject,
//! };
//! use uuid::Uuid;
//!
//! # struct StaticClusterManager(ClusterIdentity);
//! #
//! # #[async_trait]
//! # impl ClusterManager for StaticClusterManager {
//! #     async fn register_deployment(
//! #         &self,
//! #         _token: &BootstrapToken,
//! #     ) -> Result<ClusterIdentity, ClusterManagerError> {
//! #         Ok(self.0.clone())
//! #     }
//! #     async fn validate_identity(
//! #         &self,
//! #         identity: &ClusterIdentity,
//! #     ) -> Result<(), ClusterManagerError> {
//! #         if identity.deploy_key.matches(&self.0.deploy_key) {
//! #             Ok(())
//! #         } else {
//! #             Err(ClusterManagerError::InvalidDeployKey(identity.cluster_id))
//! #         }
//! #     }
//! # }
//! #
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let issued = ClusterIdentity::new(Uuid::new_v4(), DeployKey::generate());
//! let bus = InMemoryBus::new();
//! let service = BridgeService::new(
//!     "replica-a",
//!     BridgeConfig::default(),
//!     Arc::new(bus.clone()),
//!     Arc::new(StaticClusterManager(issued)),
//! );
//! service.start().await.unwrap();
//!
//! // The edge registers once, then opens its stream.
//! let identity = service
//!     .register_deployment(&BootstrapToken::new("install-token"))
//!     .await
//!     .unwrap();
//! let (stream, mut edge) = EdgeStream::channel(16);
//! let handle = service.connect(identity.clone(), stream).await.unwrap();
//! assert_eq!(handle.generation(), 1);
//!
//! // Cloud services address the cluster through its to_cluster subject.
//! service
//!     .bus()
//!     .publish(
//!         &Subject::to_cluster(identity.cluster_id),
//!         BusMessage::new(None, Bytes::from_static(b"apply")),
//!     )
//!     .await
//!     .unwrap();
//! assert!(matches!(edge.recv().await, Some(BridgeFrame::Data { sequence: 1, .. })));
//!
//! service.shutdown().await;
//! # });
//! ```
//!
//! ## Delivery contract
//!
//! - One live connection per cluster. Installing a new stream supersedes the
//!   previous one; frames and writes of a superseded generation are discarded.
//! - Every data frame from the edge is published to
//!   `bridge.cluster.<uuid>.from_cluster` or the connection is torn down.
//! - Messages on `bridge.cluster.<uuid>.to_cluster` are acknowledged only once
//!   the edge transport of the current connection wrote them, so a
//!   reconnecting cluster resumes where the previous stream stopped.
//! - Across replicas, installs are ordered by the sequence of their record on
//!   `bridge.cluster.<uuid>.installs`; an earlier install never evicts a later one.
//!
//! ## Internal architecture map
//!
//! - API facade: [`BridgeService`] and the identity types
//! - Control plane: connection registry, registration flow, fleet takeover
//! - Data plane: stream adapter with inbound/outbound pumps and heartbeat
//! - Message bus: [`MessageBus`] backends behind the [`BusAdapter`]
//! - Runtime: retry and backoff policy
//!
//! ## Observability model
//!
//! The workspace uses `tracing` for logs/events.
//! Library code emits events/spans and does not unconditionally initialize a global
//! subscriber. Binaries and tests are responsible for one-time
//! `tracing_subscriber` initialization at process boundaries.

mod bridge_service;
pub use bridge_service::{BridgeService, AUTHENTICATION_FAILED, BRIDGE_UNAVAILABLE};

mod cluster_manager;
pub use cluster_manager::{ClusterManager, ClusterManagerError};

mod config;
pub use config::{BridgeConfig, ConfigError};

mod control_plane;
pub use control_plane::connection::{
    Connection, FleetEpoch, Generation, StreamHandle, WriteError,
};
pub use control_plane::connection_registry::{ClusterState, ConnectionRegistry};
pub use control_plane::registration::RegistrationFlow;
pub use control_plane::takeover::{TakeoverNotice, TAKEOVER_SUBJECT};

mod data_plane;
pub use data_plane::edge_stream::{
    BridgeFrame, EdgeFrame, EdgePeer, EdgeStream, OutboundFrame, StreamError, WriteReceipt,
};
pub use data_plane::stream_adapter::{ConnectionHandle, StreamAdapter};

mod envelope;
pub use envelope::{Direction, Envelope, Subject, SUBJECT_PREFIX};

mod error;
pub use error::{BridgeError, TeardownReason};

mod identity;
pub use identity::{BootstrapToken, ClusterId, ClusterIdentity, DeployKey};

mod message_bus;
#[cfg(feature = "jetstream")]
pub use message_bus::{JetStreamBus, JetStreamBusOptions};
pub use message_bus::{
    Acker, BusAdapter, BusError, BusMessage, Delivery, DurableConsumer, DurableSubscription,
    InMemoryBus, MessageBus, PublishAck,
};

#[doc(hidden)]
pub mod observability;
mod runtime;
pub use runtime::backoff::{Backoff, RetryPolicy};
