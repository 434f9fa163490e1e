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

use crate::cluster_manager::ClusterManager;
use crate::config::BridgeConfig;
use crate::control_plane::connection::{Connection, FleetEpoch, Generation, StreamHandle};
use crate::control_plane::connection_registry::{ClusterState, ConnectionRegistry};
use crate::control_plane::registration::RegistrationFlow;
use crate::control_plane::takeover::{self, TakeoverNotice, TAKEOVER_SUBJECT};
use crate::data_plane::edge_stream::{BridgeFrame, EdgeStream, OutboundFrame};
use crate::data_plane::stream_adapter::{ConnectionHandle, StreamAdapter};
use crate::error::{BridgeError, TeardownReason};
use crate::identity::{BootstrapToken, ClusterId, ClusterIdentity};
use crate::message_bus::{BusAdapter, BusError, MessageBus};
use crate::observability::events;
use crate::runtime::backoff::retry_with_backoff;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMPONENT: &str = "bridge_service";

/// Reason sent to an edge whose identity was refused.
pub const AUTHENTICATION_FAILED: &str = "authentication_failed";

/// Reason sent to an edge that could not be admitted because the bus is down.
pub const BRIDGE_UNAVAILABLE: &str = "bridge_unavailable";

/// Entry point of one bridge replica.
///
/// Authenticates edge clusters, installs their streams into the
/// [`ConnectionRegistry`] and runs a [`StreamAdapter`] per connection.
pub struct BridgeService {
    replica_id: String,
    config: BridgeConfig,
    bus: BusAdapter,
    registry: Arc<ConnectionRegistry>,
    cluster_manager: Arc<dyn ClusterManager>,
    registration: RegistrationFlow,
    handles: Arc<DashMap<(ClusterId, Generation), ConnectionHandle>>,
    shutdown: CancellationToken,
    takeover_listener: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeService {
    pub fn new(
        replica_id: impl Into<String>,
        config: BridgeConfig,
        bus: Arc<dyn MessageBus>,
        cluster_manager: Arc<dyn ClusterManager>,
    ) -> Self {
        Self::with_registry(
            replica_id,
            config,
            bus,
            cluster_manager,
            Arc::new(ConnectionRegistry::new()),
        )
    }

    pub fn with_registry(
        replica_id: impl Into<String>,
        config: BridgeConfig,
        bus: Arc<dyn MessageBus>,
        cluster_manager: Arc<dyn ClusterManager>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let registration = RegistrationFlow::new(
            cluster_manager.clone(),
            registry.clone(),
            config.validate_timeout(),
        );
        Self {
            replica_id: replica_id.into(),
            bus: BusAdapter::new(bus, &config),
            config,
            registry,
            cluster_manager,
            registration,
            handles: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            takeover_listener: Mutex::new(None),
        }
    }

    /// Joins the fleet: subscribes to takeover notices from other replicas.
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut listener = self.takeover_listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let notices = self.bus.subscribe_broadcast(TAKEOVER_SUBJECT).await?;
        *listener = Some(takeover::spawn_takeover_listener(
            self.bus.clone(),
            self.registry.clone(),
            self.replica_id.clone(),
            self.config.resubscribe_backoff.clone(),
            self.shutdown.clone(),
            notices,
        ));
        Ok(())
    }

    /// Authenticates `identity` and bridges `stream` to the cluster's subjects.
    ///
    /// A refused identity gets a `Close` frame and never reaches the registry.
    /// An accepted one is only installed after its install record and takeover
    /// notice reached the bus; if either fails within the publish retry budget
    /// the edge is turned away with [`BRIDGE_UNAVAILABLE`].
    pub async fn connect(
        &self,
        identity: ClusterIdentity,
        stream: EdgeStream,
    ) -> Result<ConnectionHandle, BridgeError> {
        let cluster_id = identity.cluster_id;
        debug!(
            event = events::CONNECT_START,
            component = COMPONENT,
            cluster_id = %cluster_id,
            "connect requested"
        );

        let (inbound, outbound) = stream.into_parts();
        let timeout = self.config.validate_timeout();
        let validation =
            tokio::time::timeout(timeout, self.cluster_manager.validate_identity(&identity)).await;
        let rejection = match validation {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(BridgeError::AuthenticationFailure { cluster_id, reason }),
            Err(_) => Some(BridgeError::ClusterManagerTimeout(timeout)),
        };
        if let Some(err) = rejection {
            return Err(reject(&outbound, cluster_id, err));
        }

        let epoch = match self.take_over(cluster_id).await {
            Ok(epoch) => epoch,
            Err(err) => return Err(reject(&outbound, cluster_id, err.into())),
        };
        let connection = match self.registry.install_at_epoch(
            cluster_id,
            StreamHandle::new(outbound.clone()),
            epoch,
        ) {
            Ok(connection) => connection,
            Err(_) => {
                let err = BridgeError::Superseded(cluster_id);
                return Err(reject(&outbound, cluster_id, err));
            }
        };

        let handle = StreamAdapter::spawn(
            connection.clone(),
            inbound,
            self.registry.clone(),
            self.bus.clone(),
            &self.config,
        );
        self.track(handle.clone());

        info!(
            event = events::CONNECT_OK,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation = connection.generation(),
            epoch,
            replica_id = %self.replica_id,
            "edge cluster connected"
        );
        Ok(handle)
    }

    /// Records the install on the bus and tells the fleet about it. Returns
    /// the epoch the new connection is installed at.
    async fn take_over(&self, cluster_id: ClusterId) -> Result<FleetEpoch, BusError> {
        let policy = &self.config.publish_retry;
        let (bus, replica_id, shutdown) = (&self.bus, self.replica_id.as_str(), &self.shutdown);
        let epoch = retry_with_backoff(
            policy,
            "record_install",
            move || !shutdown.is_cancelled(),
            move || takeover::record_install(bus, cluster_id, replica_id),
        )
        .await?;
        debug!(
            event = events::INSTALL_RECORDED,
            component = COMPONENT,
            cluster_id = %cluster_id,
            epoch,
            "install recorded"
        );

        let notice = &TakeoverNotice {
            cluster_id,
            replica_id: self.replica_id.clone(),
            epoch,
        };
        let announced = retry_with_backoff(
            policy,
            "announce_takeover",
            move || !shutdown.is_cancelled(),
            move || takeover::announce(bus, notice),
        )
        .await;
        match &announced {
            Ok(()) => debug!(
                event = events::TAKEOVER_ANNOUNCED,
                component = COMPONENT,
                cluster_id = %cluster_id,
                epoch,
                "takeover announced"
            ),
            Err(err) => warn!(
                event = events::TAKEOVER_ANNOUNCE_FAILED,
                component = COMPONENT,
                cluster_id = %cluster_id,
                epoch,
                err = %err,
                "takeover notice not sent, refusing the connection"
            ),
        }
        announced.map(|()| epoch)
    }

    /// Keeps the handle until its adapter finishes.
    fn track(&self, handle: ConnectionHandle) {
        let key = (handle.cluster_id(), handle.generation());
        self.handles.insert(key, handle.clone());

        let handles = self.handles.clone();
        tokio::spawn(async move {
            handle.closed().await;
            handles.remove(&key);
        });
    }

    /// Exchanges a bootstrap token for a cluster identity. Idempotent per token.
    pub async fn register_deployment(
        &self,
        token: &BootstrapToken,
    ) -> Result<ClusterIdentity, BridgeError> {
        self.registration.register(token).await
    }

    pub fn lookup(&self, cluster_id: &ClusterId) -> Option<Arc<Connection>> {
        self.registry.lookup(cluster_id)
    }

    pub fn cluster_state(&self, cluster_id: &ClusterId) -> ClusterState {
        self.registry.state(cluster_id)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &BusAdapter {
        &self.bus
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Stops the takeover listener and closes every connection, waiting up to
    /// twice the eviction grace period for adapters to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<ConnectionHandle> = self
            .handles
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let closed = self.registry.evict_all(TeardownReason::Shutdown);
        handles
            .iter()
            .for_each(|handle| handle.close(TeardownReason::Shutdown));

        let drained = tokio::time::timeout(
            self.config.eviction_grace() * 2,
            futures::future::join_all(handles.iter().map(ConnectionHandle::closed)),
        )
        .await
        .is_ok();

        if let Some(listener) = self.takeover_listener.lock().await.take() {
            let _ = listener.await;
        }
        self.handles.clear();

        info!(
            event = events::SHUTDOWN,
            component = COMPONENT,
            replica_id = %self.replica_id,
            closed,
            drained,
            "bridge service stopped"
        );
    }
}

fn reject(
    outbound: &mpsc::Sender<OutboundFrame>,
    cluster_id: ClusterId,
    err: BridgeError,
) -> BridgeError {
    warn!(
        event = events::CONNECT_REJECTED,
        component = COMPONENT,
        cluster_id = %cluster_id,
        err = %err,
        "rejecting edge connection"
    );
    let _ = outbound.try_send(OutboundFrame::unconfirmed(BridgeFrame::Close {
        reason: err.close_reason().to_string(),
    }));
    err
}
