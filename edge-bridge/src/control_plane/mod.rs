//! Control-plane layer.
//!
//! Owns connection identity and lifecycle: the per-cluster registry with its
//! generation counter, the registration flow that provisions identities, and
//! the fleet-wide takeover notices that keep one live connection per cluster.
//!
//! ```
//! use edge_bridge::{ClusterState, ConnectionRegistry, StreamHandle};
//! use tokio::sync::mpsc;
//! use uuid::Uuid;
//!
//! let registry = ConnectionRegistry::new();
//! let cluster_id = Uuid::new_v4();
//! let (first_tx, _first_rx) = mpsc::channel(1);
//! let (second_tx, _second_rx) = mpsc::channel(1);
//!
//! let first = registry.install(cluster_id, StreamHandle::new(first_tx));
//! let second = registry.install(cluster_id, StreamHandle::new(second_tx));
//!
//! // The second install supersedes the first; removing the old generation is a no-op.
//! assert!(!first.is_current());
//! assert!(!registry.remove(cluster_id, first.generation()));
//! assert_eq!(
//!     registry.state(&cluster_id),
//!     ClusterState::Connected { generation: second.generation() }
//! );
//! ```

pub(crate) mod connection;
pub(crate) mod connection_registry;
pub(crate) mod registration;
pub(crate) mod takeover;
