use crate::integration_test_utils::GUARD;
use bytes::Bytes;
use edge_bridge::{
    BridgeError, BridgeFrame, BridgeService, ClusterIdentity, ConnectionHandle, EdgePeer,
    EdgeStream, Generation, StreamError,
};
use std::time::Duration;
use tracing::debug;

/// Simulated edge cluster holding one in-process stream to a bridge replica.
pub struct EdgeClient {
    name: String,
    handle: ConnectionHandle,
    peer: EdgePeer,
}

impl EdgeClient {
    pub async fn connect(
        name: &str,
        service: &BridgeService,
        identity: &ClusterIdentity,
    ) -> Result<Self, BridgeError> {
        let (stream, peer) = EdgeStream::channel(64);
        let handle = service.connect(identity.clone(), stream).await?;
        debug!(
            "{name}: connected as generation {} of {}",
            handle.generation(),
            identity.cluster_id
        );
        Ok(Self {
            name: name.to_string(),
            handle,
            peer,
        })
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn generation(&self) -> Generation {
        self.handle.generation()
    }

    /// Sends one data frame whose correlation id equals its payload.
    pub async fn send(&self, payload: &str) -> Result<(), StreamError> {
        self.peer
            .send_data(Some(payload), Bytes::copy_from_slice(payload.as_bytes()))
            .await
    }

    /// Sends `count` data frames with payloads `"{prefix}-{n}"`.
    pub async fn send_numbered(&self, prefix: &str, count: usize) {
        for n in 0..count {
            let payload = format!("{prefix}-{n}");
            self.send(&payload)
                .await
                .unwrap_or_else(|err| panic!("{}: send of {payload} failed: {err}", self.name));
        }
    }

    pub async fn keepalive(&self) {
        let _ = self.peer.send_keepalive().await;
    }

    pub async fn next_frame(&mut self, timeout: Duration) -> Option<BridgeFrame> {
        tokio::time::timeout(timeout, self.peer.recv()).await.ok().flatten()
    }

    /// Collects `count` data frames as `(sequence, payload)`, panicking on a
    /// close or on silence longer than the guard.
    pub async fn receive_data(&mut self, count: usize) -> Vec<(u64, Bytes)> {
        let mut received = Vec::with_capacity(count);
        while received.len() < count {
            match self.next_frame(GUARD).await {
                Some(BridgeFrame::Data {
                    sequence, payload, ..
                }) => received.push((sequence, payload)),
                other => panic!(
                    "{}: expected data frame {} of {count}, got {other:?}",
                    self.name,
                    received.len() + 1
                ),
            }
        }
        received
    }

    /// Waits for the bridge to close this stream and returns the close reason.
    pub async fn expect_close(&mut self) -> String {
        loop {
            match self.next_frame(GUARD).await {
                Some(BridgeFrame::Close { reason }) => return reason,
                Some(BridgeFrame::Data { .. }) => continue,
                None => panic!("{}: stream ended without a close frame", self.name),
            }
        }
    }

    /// Drops the edge side of the stream, as a network partition would.
    pub fn disconnect(self) -> ConnectionHandle {
        debug!("{}: disconnecting", self.name);
        self.handle
    }
}
