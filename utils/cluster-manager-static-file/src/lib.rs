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

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edge_bridge::{
    BootstrapToken, ClusterId, ClusterIdentity, ClusterManager, ClusterManagerError, DeployKey,
};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{self, canonicalize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StaticFileError {
    #[error("static cluster file {path:?} not readable: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("static cluster file {path:?} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Layout of the static cluster file.
///
/// ```json
/// {
///   "bootstrap_tokens": ["install-token-a"],
///   "clusters": [{ "cluster_id": "<uuid>", "deploy_key": "<key>" }]
/// }
/// ```
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ClusterFile {
    #[serde(default)]
    pub bootstrap_tokens: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<ClusterIdentity>,
}

/// [`ClusterManager`] backed by a file read once at startup.
///
/// Accepted bootstrap tokens each yield one fresh identity, remembered for the
/// life of the process so replays get the same answer. Identities listed in
/// the file are accepted as they are.
pub struct ClusterManagerStaticFile {
    bootstrap_tokens: HashSet<String>,
    issued: DashMap<String, ClusterIdentity>,
    clusters: DashMap<ClusterId, DeployKey>,
}

impl ClusterManagerStaticFile {
    pub fn new(static_file: impl AsRef<Path>) -> Result<Self, StaticFileError> {
        let path = static_file.as_ref();
        debug!("cluster file: {path:?}");

        let path = canonicalize(path).map_err(|source| StaticFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let data = fs::read_to_string(&path).map_err(|source| StaticFileError::Read {
            path: path.clone(),
            source,
        })?;
        let file: ClusterFile = serde_json::from_str(&data)
            .map_err(|source| StaticFileError::Parse { path, source })?;

        Ok(Self::from_file(file))
    }

    pub fn from_file(file: ClusterFile) -> Self {
        info!(
            bootstrap_tokens = file.bootstrap_tokens.len(),
            clusters = file.clusters.len(),
            "loaded static cluster file"
        );
        let clusters = DashMap::new();
        for identity in file.clusters {
            if clusters
                .insert(identity.cluster_id, identity.deploy_key)
                .is_some()
            {
                warn!(cluster_id = %identity.cluster_id, "cluster listed twice, keeping the last key");
            }
        }

        Self {
            bootstrap_tokens: file.bootstrap_tokens.into_iter().collect(),
            issued: DashMap::new(),
            clusters,
        }
    }
}

#[async_trait]
impl ClusterManager for ClusterManagerStaticFile {
    async fn register_deployment(
        &self,
        token: &BootstrapToken,
    ) -> Result<ClusterIdentity, ClusterManagerError> {
        if !self.bootstrap_tokens.contains(token.expose()) {
            return Err(ClusterManagerError::UnknownBootstrapToken);
        }

        let identity = match self.issued.entry(token.expose().to_string()) {
            Entry::Occupied(issued) => issued.get().clone(),
            Entry::Vacant(slot) => {
                let identity = ClusterIdentity::new(Uuid::new_v4(), DeployKey::generate());
                self.clusters
                    .insert(identity.cluster_id, identity.deploy_key.clone());
                info!(cluster_id = %identity.cluster_id, "issued cluster identity");
                slot.insert(identity).clone()
            }
        };
        Ok(identity)
    }

    async fn validate_identity(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<(), ClusterManagerError> {
        let known = self
            .clusters
            .get(&identity.cluster_id)
            .ok_or(ClusterManagerError::UnknownCluster(identity.cluster_id))?;
        if known.matches(&identity.deploy_key) {
            Ok(())
        } else {
            Err(ClusterManagerError::InvalidDeployKey(identity.cluster_id))
        }
    }
}
