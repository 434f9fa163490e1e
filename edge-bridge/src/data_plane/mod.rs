//! Data-plane layer.
//!
//! Owns the per-connection stream adapter: an inbound pump publishing edge
//! frames to the cluster's `from_cluster` subject, an outbound pump relaying
//! the `to_cluster` subject back to the edge, and the heartbeat watchdog.
//!
//! ```
//! use std::sync::Arc;
//! use edge_bridge::{
//!     BridgeConfig, BusAdapter, ConnectionRegistry, EdgeStream, InMemoryBus, StreamAdapter,
//!     StreamHandle, Subject, TeardownReason,
//! };
//! use uuid::Uuid;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = InMemoryBus::new();
//! let config = BridgeConfig::default();
//! let registry = Arc::new(ConnectionRegistry::new());
//! let cluster_id = Uuid::new_v4();
//!
//! let (stream, peer) = EdgeStream::channel(8);
//! let (inbound, outbound) = stream.into_parts();
//! let connection = registry.install(cluster_id, StreamHandle::new(outbound));
//! let handle = StreamAdapter::spawn(
//!     connection,
//!     inbound,
//!     registry.clone(),
//!     BusAdapter::new(Arc::new(bus.clone()), &config),
//!     &config,
//! );
//!
//! // Frames from the edge land on the cluster's from_cluster subject.
//! peer.send_data(None, "status").await.unwrap();
//! drop(peer);
//! assert_eq!(handle.closed().await, TeardownReason::StreamClosed);
//! assert_eq!(bus.subject_log(&Subject::from_cluster(cluster_id)).len(), 1);
//! # });
//! ```

pub(crate) mod edge_stream;
pub(crate) mod heartbeat;
pub(crate) mod inbound_pump;
pub(crate) mod outbound_pump;
pub(crate) mod stream_adapter;
