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

//! Registry of the single active connection per cluster.

use crate::control_plane::connection::{Connection, FleetEpoch, Generation, StreamHandle};
use crate::error::TeardownReason;
use crate::identity::ClusterId;
use crate::observability::events;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

const COMPONENT: &str = "connection_registry";

/// Lifecycle of one cluster as the registry sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterState {
    Unregistered,
    Registered,
    Connected {
        generation: Generation,
    },
    /// Connected, while superseded generations are still shutting down.
    Draining {
        generation: Generation,
        draining: Vec<Generation>,
    },
}

#[derive(Default)]
struct ClusterSlot {
    generation: Generation,
    current_generation: Arc<AtomicU64>,
    active: Option<Arc<Connection>>,
    draining: BTreeSet<Generation>,
    registered: bool,
    /// Highest install epoch seen for the cluster, local or remote.
    fleet_epoch: FleetEpoch,
}

impl ClusterSlot {
    /// Marks the active connection stale and signals it to close without waiting.
    fn retire_active(&mut self, reason: TeardownReason) -> Option<Arc<Connection>> {
        let previous = self.active.take()?;
        previous.mark_stale();
        previous.close(reason);
        self.draining.insert(previous.generation());
        Some(previous)
    }
}

/// Owner of every live [`Connection`].
///
/// Mutations are serialised per cluster; clusters never contend with each
/// other. The map itself is never handed out.
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: DashMap<ClusterId, Arc<Mutex<ClusterSlot>>>,
}

fn lock(slot: &Mutex<ClusterSlot>) -> MutexGuard<'_, ClusterSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn install_locked(
    slot: &mut ClusterSlot,
    cluster_id: ClusterId,
    stream: StreamHandle,
    epoch: FleetEpoch,
) -> Arc<Connection> {
    if let Some(previous) = slot.retire_active(TeardownReason::Superseded) {
        info!(
            event = events::CONNECTION_EVICTED,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation = previous.generation(),
            reason = %TeardownReason::Superseded,
            "evicting superseded connection"
        );
    }

    slot.generation += 1;
    let generation = slot.generation;
    slot.current_generation.store(generation, Ordering::SeqCst);
    slot.registered = true;

    let connection = Arc::new(Connection::new(
        cluster_id,
        generation,
        epoch,
        slot.current_generation.clone(),
        stream,
    ));
    slot.active = Some(connection.clone());

    info!(
        event = events::CONNECTION_INSTALLED,
        component = COMPONENT,
        cluster_id = %cluster_id,
        generation,
        epoch,
        "connection installed"
    );
    connection
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, cluster_id: ClusterId) -> Arc<Mutex<ClusterSlot>> {
        self.slots.entry(cluster_id).or_default().clone()
    }

    fn existing_slot(&self, cluster_id: &ClusterId) -> Option<Arc<Mutex<ClusterSlot>>> {
        self.slots.get(cluster_id).map(|slot| slot.clone())
    }

    /// Installs a new connection for `cluster_id` with the next generation.
    ///
    /// A connection already installed is marked stale and signalled to close
    /// before the new one becomes visible. The connection takes the highest
    /// fleet epoch seen so far; use [`install_at_epoch`](Self::install_at_epoch)
    /// when the install was recorded on the bus.
    pub fn install(&self, cluster_id: ClusterId, stream: StreamHandle) -> Arc<Connection> {
        let slot = self.slot(cluster_id);
        let mut slot = lock(&slot);
        let epoch = slot.fleet_epoch;
        install_locked(&mut slot, cluster_id, stream, epoch)
    }

    /// Like [`install`](Self::install) for an install recorded at `epoch`.
    ///
    /// Refused with the newer epoch when the fleet already saw a later install
    /// of the cluster.
    pub fn install_at_epoch(
        &self,
        cluster_id: ClusterId,
        stream: StreamHandle,
        epoch: FleetEpoch,
    ) -> Result<Arc<Connection>, FleetEpoch> {
        let slot = self.slot(cluster_id);
        let mut slot = lock(&slot);
        if epoch < slot.fleet_epoch {
            debug!(
                event = events::CONNECTION_INSTALL_FENCED,
                component = COMPONENT,
                cluster_id = %cluster_id,
                epoch,
                fleet_epoch = slot.fleet_epoch,
                "install already superseded elsewhere in the fleet"
            );
            return Err(slot.fleet_epoch);
        }
        slot.fleet_epoch = epoch;
        Ok(install_locked(&mut slot, cluster_id, stream, epoch))
    }

    /// Records that the cluster was installed at `epoch` somewhere in the
    /// fleet. An active connection from an earlier epoch is evicted as
    /// superseded; its generation is returned.
    pub fn fence(&self, cluster_id: ClusterId, epoch: FleetEpoch) -> Option<Generation> {
        let slot = self.slot(cluster_id);
        let mut slot = lock(&slot);
        slot.fleet_epoch = slot.fleet_epoch.max(epoch);

        let outdated = slot
            .active
            .as_ref()
            .is_some_and(|active| active.epoch() < epoch);
        if !outdated {
            return None;
        }
        let evicted = slot.retire_active(TeardownReason::Superseded)?;

        info!(
            event = events::CONNECTION_EVICTED,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation = evicted.generation(),
            epoch = evicted.epoch(),
            fleet_epoch = epoch,
            reason = %TeardownReason::Superseded,
            "connection superseded by a later install"
        );
        Some(evicted.generation())
    }

    /// Removes the connection of `generation` if it is still the active one.
    /// Returns `false` for a generation that was already superseded.
    pub fn remove(&self, cluster_id: ClusterId, generation: Generation) -> bool {
        let Some(slot) = self.existing_slot(&cluster_id) else {
            return false;
        };
        let mut slot = lock(&slot);
        slot.draining.remove(&generation);

        let is_active = slot
            .active
            .as_ref()
            .is_some_and(|active| active.generation() == generation);
        if !is_active {
            debug!(
                event = events::CONNECTION_REMOVE_STALE_IGNORED,
                component = COMPONENT,
                cluster_id = %cluster_id,
                generation,
                current_generation = slot.generation,
                "ignoring remove for non-current generation"
            );
            return false;
        }

        slot.active = None;
        info!(
            event = events::CONNECTION_REMOVED,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation,
            "connection removed"
        );
        true
    }

    /// Active, not yet closing connection for `cluster_id`.
    pub fn lookup(&self, cluster_id: &ClusterId) -> Option<Arc<Connection>> {
        let slot = self.existing_slot(cluster_id)?;
        let slot = lock(&slot);
        slot.active
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Closes the active connection of `cluster_id`, if any, returning its generation.
    pub fn evict(&self, cluster_id: &ClusterId, reason: TeardownReason) -> Option<Generation> {
        let slot = self.existing_slot(cluster_id)?;
        let mut slot = lock(&slot);
        let evicted = slot.retire_active(reason.clone())?;

        info!(
            event = events::CONNECTION_EVICTED,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation = evicted.generation(),
            reason = %reason,
            "connection evicted"
        );
        Some(evicted.generation())
    }

    /// Like [`evict`](Self::evict), but only while `generation` is still active.
    pub fn evict_generation(
        &self,
        cluster_id: &ClusterId,
        generation: Generation,
        reason: TeardownReason,
    ) -> bool {
        let Some(slot) = self.existing_slot(cluster_id) else {
            return false;
        };
        let mut slot = lock(&slot);
        let is_active = slot
            .active
            .as_ref()
            .is_some_and(|active| active.generation() == generation);
        if !is_active {
            return false;
        }
        slot.retire_active(reason.clone());

        info!(
            event = events::CONNECTION_EVICTED,
            component = COMPONENT,
            cluster_id = %cluster_id,
            generation,
            reason = %reason,
            "connection evicted"
        );
        true
    }

    /// Evicts every active connection. Returns how many were closed.
    pub fn evict_all(&self, reason: TeardownReason) -> usize {
        let clusters: Vec<ClusterId> = self.slots.iter().map(|entry| *entry.key()).collect();
        clusters
            .iter()
            .filter(|cluster_id| self.evict(cluster_id, reason.clone()).is_some())
            .count()
    }

    pub fn mark_registered(&self, cluster_id: ClusterId) {
        let slot = self.slot(cluster_id);
        let mut slot = lock(&slot);
        if !slot.registered {
            slot.registered = true;
            info!(
                event = events::CLUSTER_REGISTERED,
                component = COMPONENT,
                cluster_id = %cluster_id,
                "cluster registered"
            );
        }
    }

    pub fn state(&self, cluster_id: &ClusterId) -> ClusterState {
        let Some(slot) = self.existing_slot(cluster_id) else {
            return ClusterState::Unregistered;
        };
        let slot = lock(&slot);

        match (&slot.active, slot.registered) {
            (Some(active), _) if slot.draining.is_empty() => ClusterState::Connected {
                generation: active.generation(),
            },
            (Some(active), _) => ClusterState::Draining {
                generation: active.generation(),
                draining: slot.draining.iter().copied().collect(),
            },
            (None, true) => ClusterState::Registered,
            (None, false) => ClusterState::Unregistered,
        }
    }

    pub fn active_connections(&self) -> Vec<Arc<Connection>> {
        let slots: Vec<_> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        slots
            .iter()
            .filter_map(|slot| lock(slot).active.clone())
            .collect()
    }

    /// Number of clusters with an active connection.
    pub fn len(&self) -> usize {
        self.active_connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterState, ConnectionRegistry};
    use crate::control_plane::connection::{StreamHandle, WriteError};
    use crate::data_plane::edge_stream::{BridgeFrame, OutboundFrame};
    use crate::error::TeardownReason;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn handle() -> (StreamHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (StreamHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn second_install_supersedes_first() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();
        let (first_handle, mut first_rx) = handle();
        let (second_handle, _second_rx) = handle();

        let first = registry.install(cluster_id, first_handle);
        let second = registry.install(cluster_id, second_handle);

        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 2);
        assert_eq!(registry.lookup(&cluster_id).unwrap().generation(), 2);
        assert!(!first.is_current());
        assert_eq!(first.reason(), Some(&TeardownReason::Superseded));

        let write = first
            .write(
                BridgeFrame::Close {
                    reason: "late".to_string(),
                },
                Duration::from_millis(10),
            )
            .await;
        assert_eq!(write, Err(WriteError::StaleGeneration));
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn remove_ignores_superseded_generation() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();
        registry.install(cluster_id, handle().0);
        registry.install(cluster_id, handle().0);

        assert_eq!(
            registry.state(&cluster_id),
            ClusterState::Draining {
                generation: 2,
                draining: vec![1],
            }
        );
        assert!(!registry.remove(cluster_id, 1));
        assert_eq!(
            registry.state(&cluster_id),
            ClusterState::Connected { generation: 2 }
        );
        assert!(registry.remove(cluster_id, 2));
        assert!(registry.lookup(&cluster_id).is_none());
        assert_eq!(registry.state(&cluster_id), ClusterState::Registered);
    }

    #[test]
    fn state_machine_starts_unregistered() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();

        assert_eq!(registry.state(&cluster_id), ClusterState::Unregistered);
        registry.mark_registered(cluster_id);
        assert_eq!(registry.state(&cluster_id), ClusterState::Registered);
        registry.install(cluster_id, handle().0);
        assert_eq!(
            registry.state(&cluster_id),
            ClusterState::Connected { generation: 1 }
        );
    }

    #[test]
    fn generations_keep_increasing_after_remove() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();

        let first = registry.install(cluster_id, handle().0);
        assert!(registry.remove(cluster_id, first.generation()));
        let second = registry.install(cluster_id, handle().0);

        assert!(second.generation() > first.generation());
    }

    #[test]
    fn clusters_are_independent() {
        let registry = ConnectionRegistry::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let conn_a = registry.install(a, handle().0);
        let conn_b = registry.install(b, handle().0);

        assert_eq!(conn_a.generation(), 1);
        assert_eq!(conn_b.generation(), 1);
        assert!(!registry.evict_generation(&a, 7, TeardownReason::Superseded));
        assert_eq!(registry.evict(&a, TeardownReason::Shutdown), Some(1));
        assert!(registry.lookup(&a).is_none());
        assert!(registry.lookup(&b).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn evict_all_closes_every_connection() {
        let registry = ConnectionRegistry::new();
        let connections: Vec<_> = (0..3)
            .map(|_| registry.install(Uuid::new_v4(), handle().0))
            .collect();

        assert_eq!(registry.evict_all(TeardownReason::Shutdown), 3);
        assert!(connections.iter().all(|connection| connection.is_closed()));
        assert!(registry.is_empty());
    }

    #[test]
    fn later_fleet_epoch_evicts_regardless_of_install_order() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();
        let local = registry
            .install_at_epoch(cluster_id, handle().0, 4)
            .unwrap();

        assert_eq!(registry.fence(cluster_id, 4), None);
        assert_eq!(registry.fence(cluster_id, 3), None);
        assert!(local.is_current());

        assert_eq!(registry.fence(cluster_id, 5), Some(1));
        assert!(!local.is_current());
        assert_eq!(local.reason(), Some(&TeardownReason::Superseded));
        assert!(registry.lookup(&cluster_id).is_none());
    }

    #[test]
    fn install_older_than_a_seen_epoch_is_refused() {
        let registry = ConnectionRegistry::new();
        let cluster_id = Uuid::new_v4();

        // The remote install's notice overtook the local install.
        assert_eq!(registry.fence(cluster_id, 7), None);
        assert_eq!(
            registry
                .install_at_epoch(cluster_id, handle().0, 6)
                .map(|connection| connection.generation()),
            Err(7)
        );
        assert!(registry.lookup(&cluster_id).is_none());

        let accepted = registry
            .install_at_epoch(cluster_id, handle().0, 7)
            .unwrap();
        assert_eq!(accepted.epoch(), 7);
    }
}
