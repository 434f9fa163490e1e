use cluster_manager_static_file::ClusterManagerStaticFile;
use edge_bridge::{BridgeConfig, BridgeService, ClusterManager, InMemoryBus};
use std::sync::Arc;

const CLUSTER_FILE: &str = "../utils/cluster-manager-static-file/testdata/clusters.json";

pub(crate) async fn make_service(
    replica_id: &str,
    bus: &InMemoryBus,
    cluster_manager: Arc<dyn ClusterManager>,
    config: BridgeConfig,
) -> Arc<BridgeService> {
    let service = Arc::new(BridgeService::new(
        replica_id,
        config,
        Arc::new(bus.clone()),
        cluster_manager,
    ));
    service
        .start()
        .await
        .expect("bridge service should join the fleet");
    service
}

#[allow(dead_code)]
pub(crate) fn static_cluster_manager() -> Arc<dyn ClusterManager> {
    Arc::new(
        ClusterManagerStaticFile::new(CLUSTER_FILE).expect("test cluster file should load"),
    )
}
