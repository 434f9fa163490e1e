//! Seam to the service that issues and validates cluster identities.

use crate::identity::{BootstrapToken, ClusterId, ClusterIdentity};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClusterManagerError {
    #[error("bootstrap token not recognised")]
    UnknownBootstrapToken,
    #[error("cluster {0} is not provisioned")]
    UnknownCluster(ClusterId),
    #[error("deploy key rejected for cluster {0}")]
    InvalidDeployKey(ClusterId),
    #[error("cluster manager unavailable: {0}")]
    Unavailable(String),
}

/// Identity authority consulted by the bridge.
///
/// Implementations own the deploy keys; the bridge never stores them beyond a
/// single validation call.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// Provisions (or returns the already provisioned) identity for a bootstrap token.
    async fn register_deployment(
        &self,
        token: &BootstrapToken,
    ) -> Result<ClusterIdentity, ClusterManagerError>;

    async fn validate_identity(&self, identity: &ClusterIdentity)
        -> Result<(), ClusterManagerError>;
}
