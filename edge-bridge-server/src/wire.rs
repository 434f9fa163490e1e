//! Length-delimited JSON framing spoken on the edge listener.
//!
//! Every frame is a big-endian `u32` length followed by one JSON document.
//! The first frame an edge sends is a [`Handshake`]; after a successful
//! `connect` the session carries `EdgeFrame`s in and `BridgeFrame`s out.

use bytes::{Bytes, BytesMut};
use edge_bridge::{BootstrapToken, ClusterId, DeployKey, Generation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest accepted frame. Larger frames fail the connection.
pub(crate) const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub(crate) enum WireError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Handshake {
    Register {
        bootstrap_token: BootstrapToken,
    },
    Connect {
        cluster_id: ClusterId,
        deploy_key: DeployKey,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum HandshakeReply {
    Registered {
        cluster_id: ClusterId,
        deploy_key: DeployKey,
    },
    Connected {
        generation: Generation,
    },
    Rejected {
        reason: String,
    },
}

/// Splits the byte stream into raw frames and serializes any outgoing value.
///
/// Decoding stays raw so one reader can move from handshake frames to session
/// frames without rebuilding the codec.
#[derive(Debug)]
pub(crate) struct WireCodec {
    framing: LengthDelimitedCodec,
}

impl WireCodec {
    pub(crate) fn new() -> Self {
        Self {
            framing: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = BytesMut;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.framing.decode(src)?)
    }
}

impl<T: Serialize> Encoder<T> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        self.framing.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}

pub(crate) fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(frame)?)
}
