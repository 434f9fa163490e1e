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

use edge_bridge::BridgeConfig;
#[cfg(feature = "jetstream")]
use edge_bridge::JetStreamBusOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub(crate) replica_id: String,
    #[serde(default)]
    pub(crate) bridge: BridgeConfig,
    pub(crate) listener: ListenerConfig,
    #[serde(default)]
    pub(crate) bus: BusConfig,
    pub(crate) cluster_manager: ClusterManagerConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub(crate) bridge_address: String,
    pub(crate) health_address: String,
    /// An edge must send its handshake frame within this window.
    #[serde(default = "default_handshake_timeout_ms")]
    pub(crate) handshake_timeout_ms: u64,
}

impl ListenerConfig {
    pub(crate) fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusConfig {
    #[default]
    Memory,
    #[cfg(feature = "jetstream")]
    Jetstream(JetStreamBusOptions),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClusterManagerConfig {
    #[serde(default)]
    pub(crate) mode: ClusterManagerMode,
    pub(crate) file_path: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterManagerMode {
    #[default]
    StaticFile,
}
