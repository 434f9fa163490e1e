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
use crate::control_plane::connection::{Connection, Generation};
use crate::control_plane::connection_registry::ConnectionRegistry;
use crate::data_plane::edge_stream::{EdgeFrame, StreamError};
use crate::data_plane::heartbeat::run_heartbeat;
use crate::data_plane::inbound_pump::run_inbound;
use crate::data_plane::outbound_pump::run_outbound;
use crate::error::TeardownReason;
use crate::identity::ClusterId;
use crate::message_bus::BusAdapter;
use crate::observability::events;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const COMPONENT: &str = "stream_adapter";

/// Duplex pump between one edge stream and the cluster's subject pair.
///
/// Three tasks run per connection: inbound, outbound and the heartbeat
/// watchdog. Any of them closing the connection stops all three; a supervisor
/// then waits up to the eviction grace period, aborts stragglers and removes
/// the connection's generation from the registry.
pub struct StreamAdapter;

impl StreamAdapter {
    pub fn spawn(
        connection: Arc<Connection>,
        inbound: BoxStream<'static, Result<EdgeFrame, StreamError>>,
        registry: Arc<ConnectionRegistry>,
        bus: BusAdapter,
        config: &BridgeConfig,
    ) -> ConnectionHandle {
        let cluster_id = connection.cluster_id();
        let generation = connection.generation();

        info!(
            event = events::ADAPTER_START,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation,
            "starting stream adapter"
        );

        let pumps = [
            tokio::spawn(run_inbound(
                connection.clone(),
                inbound,
                bus.clone(),
                config.publish_retry.clone(),
            )),
            tokio::spawn(run_outbound(
                connection.clone(),
                bus,
                config.stream_write_timeout(),
            )),
            tokio::spawn(run_heartbeat(
                connection.clone(),
                config.heartbeat_timeout(),
                config.heartbeat_check_interval(),
            )),
        ];

        let (finished_tx, finished_rx) = watch::channel(None);
        let grace = config.eviction_grace();
        let supervised = connection.clone();

        tokio::spawn(async move {
            supervised.closed().await;
            let reason = supervised
                .reason()
                .cloned()
                .unwrap_or(TeardownReason::StreamClosed);

            info!(
                event = events::ADAPTER_TEARDOWN,
                component = COMPONENT,
                cluster_id = %cluster_id,
                generation,
                reason = %reason,
                "tearing down stream adapter"
            );

            let aborts: Vec<_> = pumps.iter().map(|pump| pump.abort_handle()).collect();
            if tokio::time::timeout(grace, futures::future::join_all(pumps))
                .await
                .is_err()
            {
                warn!(
                    event = events::ADAPTER_GRACE_EXPIRED,
                    component = COMPONENT,
                    cluster_id = %cluster_id,
                    generation,
                    grace_ms = grace.as_millis() as u64,
                    "pumps did not stop within grace period, aborting"
                );
                aborts.iter().for_each(|abort| abort.abort());
            }

            supervised.try_send_close(&reason);
            registry.remove(cluster_id, generation);
            let _ = finished_tx.send(Some(reason));
        });

        ConnectionHandle {
            cluster_id,
            generation,
            connection,
            finished: finished_rx,
        }
    }
}

/// Caller-side view of a running stream adapter.
#[derive(Clone)]
pub struct ConnectionHandle {
    cluster_id: ClusterId,
    generation: Generation,
    connection: Arc<Connection>,
    finished: watch::Receiver<Option<TeardownReason>>,
}

impl ConnectionHandle {
    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Requests teardown. Does not wait for it.
    pub fn close(&self, reason: TeardownReason) {
        self.connection.close(reason);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }

    /// Resolves once the adapter fully stopped and its generation left the registry.
    pub async fn closed(&self) -> TeardownReason {
        let mut finished = self.finished.clone();
        let reason = match finished.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason
            .or_else(|| self.connection.reason().cloned())
            .unwrap_or(TeardownReason::StreamClosed)
    }
}
