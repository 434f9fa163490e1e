use async_trait::async_trait;
use dashmap::DashMap;
use edge_bridge::{
    BootstrapToken, ClusterId, ClusterIdentity, ClusterManager, ClusterManagerError, DeployKey,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// In-memory identity authority with switches for outage and slowness.
#[derive(Default)]
pub struct FakeClusterManager {
    issued: DashMap<String, ClusterIdentity>,
    clusters: DashMap<ClusterId, DeployKey>,
    unavailable: AtomicBool,
    delay_ms: AtomicU64,
    register_calls: AtomicUsize,
}

impl FakeClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cluster that can connect without registering first.
    pub fn provision(&self) -> ClusterIdentity {
        let identity = ClusterIdentity::new(Uuid::new_v4(), DeployKey::generate());
        self.clusters
            .insert(identity.cluster_id, identity.deploy_key.clone());
        identity
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `register_deployment` calls that reached this fake.
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> Result<(), ClusterManagerError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterManagerError::Unavailable("fake outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterManager for FakeClusterManager {
    async fn register_deployment(
        &self,
        token: &BootstrapToken,
    ) -> Result<ClusterIdentity, ClusterManagerError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.answer().await?;
        if token.expose().is_empty() {
            return Err(ClusterManagerError::UnknownBootstrapToken);
        }

        let identity = self
            .issued
            .entry(token.expose().to_string())
            .or_insert_with(|| {
                ClusterIdentity::new(Uuid::new_v4(), DeployKey::generate())
            })
            .clone();
        self.clusters
            .insert(identity.cluster_id, identity.deploy_key.clone());
        Ok(identity)
    }

    async fn validate_identity(
        &self,
        identity: &ClusterIdentity,
    ) -> Result<(), ClusterManagerError> {
        self.answer().await?;
        match self.clusters.get(&identity.cluster_id) {
            Some(key) if key.matches(&identity.deploy_key) => Ok(()),
            Some(_) => Err(ClusterManagerError::InvalidDeployKey(identity.cluster_id)),
            None => Err(ClusterManagerError::UnknownCluster(identity.cluster_id)),
        }
    }
}
