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

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use uuid::Uuid;

/// Routing key of an edge cluster.
pub type ClusterId = Uuid;

const DEPLOY_KEY_BYTES: usize = 32;
const REDACTED: &str = "<redacted>";

///
/// [`DeployKey`] is the opaque secret an edge cluster presents when it opens a
/// bridge stream. It is issued once by the cluster manager and never logged.
///
/// # Examples
///
/// ```
/// use edge_bridge::DeployKey;
///
/// let key = DeployKey::new("s3cr3t");
/// assert!(key.matches(&DeployKey::new("s3cr3t")));
/// assert_eq!(format!("{key:?}"), "DeployKey(<redacted>)");
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeployKey(String);

impl DeployKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generates a fresh random key, hex encoded.
    pub fn generate() -> Self {
        let mut raw = [0u8; DEPLOY_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        Self(raw.iter().map(|byte| format!("{byte:02x}")).collect())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Compares two keys without short-circuiting on the first mismatching byte.
    pub fn matches(&self, other: &DeployKey) -> bool {
        let (left, right) = (self.0.as_bytes(), other.0.as_bytes());
        if left.len() != right.len() {
            return false;
        }
        left.iter()
            .zip(right.iter())
            .fold(0u8, |acc, (l, r)| acc | (l ^ r))
            == 0
    }
}

impl Debug for DeployKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeployKey({REDACTED})")
    }
}

/// One-time token handed to an edge cluster at install time, exchanged for a
/// [`ClusterIdentity`] through the registration flow.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootstrapToken(String);

impl BootstrapToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for BootstrapToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BootstrapToken({REDACTED})")
    }
}

/// Immutable identity of a registered edge cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub cluster_id: ClusterId,
    pub deploy_key: DeployKey,
}

impl ClusterIdentity {
    pub fn new(cluster_id: ClusterId, deploy_key: DeployKey) -> Self {
        Self {
            cluster_id,
            deploy_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BootstrapToken, ClusterIdentity, DeployKey};
    use uuid::Uuid;

    #[test]
    fn generated_deploy_keys_are_hex_and_distinct() {
        let first = DeployKey::generate();
        let second = DeployKey::generate();

        assert_eq!(first.expose().len(), 64);
        assert!(first.expose().chars().all(|ch| ch.is_ascii_hexdigit()));
        assert!(!first.matches(&second));
    }

    #[test]
    fn deploy_key_match_rejects_prefixes_and_different_lengths() {
        let key = DeployKey::new("abcdef");

        assert!(key.matches(&DeployKey::new("abcdef")));
        assert!(!key.matches(&DeployKey::new("abcde")));
        assert!(!key.matches(&DeployKey::new("abcdeg")));
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let identity = ClusterIdentity::new(Uuid::new_v4(), DeployKey::new("hunter2"));
        let token = BootstrapToken::new("bootstrap-secret");

        assert!(!format!("{identity:?}").contains("hunter2"));
        assert!(!format!("{token:?}").contains("bootstrap-secret"));
    }
}
