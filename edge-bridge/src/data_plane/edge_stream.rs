//! Transport-neutral duplex stream to one edge cluster.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Frame sent by the edge once a session is established.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeFrame {
    Data {
        #[serde(default)]
        correlation_id: Option<String>,
        payload: Bytes,
    },
    Keepalive,
}

/// Frame sent by the bridge once a session is established.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Data {
        sequence: u64,
        #[serde(default)]
        correlation_id: Option<String>,
        payload: Bytes,
    },
    Close {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,
    #[error("stream transport error: {0}")]
    Transport(String),
}

/// A [`BridgeFrame`] queued for the edge.
///
/// Data frames carry a receipt. The bridge acknowledges the bus delivery
/// behind a frame only after the transport confirmed the receipt, so a frame
/// still sitting in a queue when the edge goes away is redelivered later.
#[derive(Debug)]
pub struct OutboundFrame {
    frame: BridgeFrame,
    receipt: WriteReceipt,
}

impl OutboundFrame {
    /// Frame nobody waits on, such as a final `Close`.
    pub fn unconfirmed(frame: BridgeFrame) -> Self {
        Self {
            frame,
            receipt: WriteReceipt(None),
        }
    }

    pub(crate) fn with_receipt(frame: BridgeFrame) -> (Self, oneshot::Receiver<()>) {
        let (written, confirmed) = oneshot::channel();
        (
            Self {
                frame,
                receipt: WriteReceipt(Some(written)),
            },
            confirmed,
        )
    }

    pub fn frame(&self) -> &BridgeFrame {
        &self.frame
    }

    /// Splits off the receipt. Confirm it once the frame was written.
    pub fn into_parts(self) -> (BridgeFrame, WriteReceipt) {
        (self.frame, self.receipt)
    }

    /// For transports where handing the frame over is the write.
    pub fn delivered(self) -> BridgeFrame {
        let (frame, receipt) = self.into_parts();
        receipt.confirm();
        frame
    }
}

/// Write confirmation for one [`OutboundFrame`]. Dropping it unconfirmed
/// reports the frame as lost.
#[derive(Debug)]
pub struct WriteReceipt(Option<oneshot::Sender<()>>);

impl WriteReceipt {
    pub fn confirm(self) {
        if let Some(written) = self.0 {
            let _ = written.send(());
        }
    }
}

/// Bridge-side half of an edge session: frames read from the edge and a
/// bounded sink for frames written to it.
pub struct EdgeStream {
    inbound: BoxStream<'static, Result<EdgeFrame, StreamError>>,
    outbound: mpsc::Sender<OutboundFrame>,
}

impl EdgeStream {
    pub fn new(
        inbound: BoxStream<'static, Result<EdgeFrame, StreamError>>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self { inbound, outbound }
    }

    /// In-process stream pair. The [`EdgePeer`] plays the edge cluster.
    pub fn channel(buffer: usize) -> (EdgeStream, EdgePeer) {
        let (to_bridge, from_edge) = mpsc::channel(buffer);
        let (to_edge, from_bridge) = mpsc::channel(buffer);

        let inbound = futures::stream::unfold(from_edge, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed();

        (
            EdgeStream::new(inbound, to_edge),
            EdgePeer {
                to_bridge,
                from_bridge,
            },
        )
    }

    pub fn into_parts(
        self,
    ) -> (
        BoxStream<'static, Result<EdgeFrame, StreamError>>,
        mpsc::Sender<OutboundFrame>,
    ) {
        (self.inbound, self.outbound)
    }
}

/// Edge side of [`EdgeStream::channel`].
pub struct EdgePeer {
    to_bridge: mpsc::Sender<Result<EdgeFrame, StreamError>>,
    from_bridge: mpsc::Receiver<OutboundFrame>,
}

impl EdgePeer {
    pub async fn send(&self, frame: EdgeFrame) -> Result<(), StreamError> {
        self.to_bridge
            .send(Ok(frame))
            .await
            .map_err(|_| StreamError::Closed)
    }

    pub async fn send_data(
        &self,
        correlation_id: Option<&str>,
        payload: impl Into<Bytes>,
    ) -> Result<(), StreamError> {
        self.send(EdgeFrame::Data {
            correlation_id: correlation_id.map(str::to_string),
            payload: payload.into(),
        })
        .await
    }

    pub async fn send_keepalive(&self) -> Result<(), StreamError> {
        self.send(EdgeFrame::Keepalive).await
    }

    /// Injects a transport failure into the bridge's inbound stream.
    pub async fn fail(&self, detail: impl Into<String>) -> Result<(), StreamError> {
        self.to_bridge
            .send(Err(StreamError::Transport(detail.into())))
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Next frame written by the bridge, `None` once the bridge dropped its side.
    /// Receiving a frame confirms its write.
    pub async fn recv(&mut self) -> Option<BridgeFrame> {
        self.from_bridge.recv().await.map(OutboundFrame::delivered)
    }

    /// Splits into the sender and receiver halves, e.g. to drive them from separate tasks.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Sender<Result<EdgeFrame, StreamError>>,
        mpsc::Receiver<OutboundFrame>,
    ) {
        (self.to_bridge, self.from_bridge)
    }
}
