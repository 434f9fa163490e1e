//! One-shot provisioning of cluster identities.

use crate::cluster_manager::ClusterManager;
use crate::control_plane::connection_registry::ConnectionRegistry;
use crate::error::BridgeError;
use crate::identity::{BootstrapToken, ClusterIdentity};
use crate::observability::events;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

const COMPONENT: &str = "registration";

/// Exchanges bootstrap tokens for identities.
///
/// Each token is sent to the cluster manager at most once while it succeeds:
/// replays return the cached identity and concurrent requests for one token
/// share a single call. Failures are not cached.
pub struct RegistrationFlow {
    cluster_manager: Arc<dyn ClusterManager>,
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    issued: DashMap<BootstrapToken, Arc<OnceCell<ClusterIdentity>>>,
}

impl RegistrationFlow {
    pub fn new(
        cluster_manager: Arc<dyn ClusterManager>,
        registry: Arc<ConnectionRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            cluster_manager,
            registry,
            timeout,
            issued: DashMap::new(),
        }
    }

    pub async fn register(&self, token: &BootstrapToken) -> Result<ClusterIdentity, BridgeError> {
        let cell = self.issued.entry(token.clone()).or_default().clone();

        let result = cell
            .get_or_try_init(|| async {
                match tokio::time::timeout(
                    self.timeout,
                    self.cluster_manager.register_deployment(token),
                )
                .await
                {
                    Ok(Ok(identity)) => Ok(identity),
                    Ok(Err(err)) => Err(BridgeError::Registration(err)),
                    Err(_) => Err(BridgeError::ClusterManagerTimeout(self.timeout)),
                }
            })
            .await;

        match result {
            Ok(identity) => {
                self.registry.mark_registered(identity.cluster_id);
                info!(
                    event = events::REGISTER_DEPLOYMENT_OK,
                    component = COMPONENT,
                    cluster_id = %identity.cluster_id,
                    "deployment registered"
                );
                Ok(identity.clone())
            }
            Err(err) => {
                self.issued.remove_if(token, |_, cell| !cell.initialized());
                warn!(
                    event = events::REGISTER_DEPLOYMENT_FAILED,
                    component = COMPONENT,
                    err = %err,
                    "deployment registration failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RegistrationFlow;
    use crate::cluster_manager::{ClusterManager, ClusterManagerError};
    use crate::control_plane::connection_registry::{ClusterState, ConnectionRegistry};
    use crate::error::BridgeError;
    use crate::identity::{BootstrapToken, ClusterIdentity, DeployKey};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    /// Issues a fresh identity per call after a short delay; fails `failures` times first.
    struct CountingClusterManager {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl CountingClusterManager {
        fn new(failures: usize, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                delay,
            }
        }
    }

    #[async_trait]
    impl ClusterManager for CountingClusterManager {
        async fn register_deployment(
            &self,
            _token: &BootstrapToken,
        ) -> Result<ClusterIdentity, ClusterManagerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                return Err(ClusterManagerError::Unavailable("flaky".to_string()));
            }
            Ok(ClusterIdentity::new(Uuid::new_v4(), DeployKey::generate()))
        }

        async fn validate_identity(
            &self,
            _identity: &ClusterIdentity,
        ) -> Result<(), ClusterManagerError> {
            Ok(())
        }
    }

    fn flow(manager: Arc<CountingClusterManager>) -> (RegistrationFlow, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        (
            RegistrationFlow::new(manager, registry.clone(), Duration::from_millis(200)),
            registry,
        )
    }

    #[tokio::test]
    async fn replay_returns_same_identity() {
        let manager = Arc::new(CountingClusterManager::new(0, Duration::ZERO));
        let (flow, registry) = flow(manager.clone());
        let token = BootstrapToken::new("token-a");

        let first = flow.register(&token).await.unwrap();
        let second = flow.register(&token).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state(&first.cluster_id), ClusterState::Registered);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_call() {
        let manager = Arc::new(CountingClusterManager::new(0, Duration::from_millis(20)));
        let (flow, _registry) = flow(manager.clone());
        let flow = Arc::new(flow);
        let token = BootstrapToken::new("token-b");

        let requests: Vec<_> = (0..8)
            .map(|_| {
                let flow = flow.clone();
                let token = token.clone();
                tokio::spawn(async move { flow.register(&token).await })
            })
            .collect();

        let mut identities = Vec::new();
        for request in requests {
            identities.push(request.await.unwrap().unwrap());
        }

        assert!(identities.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(manager.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let manager = Arc::new(CountingClusterManager::new(1, Duration::ZERO));
        let (flow, _registry) = flow(manager.clone());
        let token = BootstrapToken::new("token-c");

        assert!(matches!(
            flow.register(&token).await,
            Err(BridgeError::Registration(ClusterManagerError::Unavailable(_)))
        ));
        assert!(flow.register(&token).await.is_ok());
        assert_eq!(manager.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_cluster_manager_times_out() {
        let manager = Arc::new(CountingClusterManager::new(0, Duration::from_secs(5)));
        let (flow, _registry) = flow(manager);

        assert!(matches!(
            flow.register(&BootstrapToken::new("token-d")).await,
            Err(BridgeError::ClusterManagerTimeout(_))
        ));
    }
}
