/********************************************************************************
 * Copyright (c) 2025 Contributors to the Eclipse Foundation
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

use crate::wire::{self, Handshake, HandshakeReply, WireCodec, WireError};
use edge_bridge::{
    BootstrapToken, BridgeFrame, BridgeService, ClusterId, ClusterIdentity, ConnectionHandle,
    DeployKey, EdgeFrame, EdgeStream, OutboundFrame, StreamError, TeardownReason,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

const COMPONENT: &str = "edge_session";

pub(crate) const HANDSHAKE_TIMEOUT: &str = "handshake_timeout";
pub(crate) const MALFORMED_HANDSHAKE: &str = "malformed_handshake";
pub(crate) const REGISTRATION_FAILED: &str = "registration_failed";

/// Drives one accepted edge socket: reads the handshake and then either
/// answers a registration or runs the bridged session until teardown.
pub(crate) async fn serve<R, W>(
    service: Arc<BridgeService>,
    reader: R,
    writer: W,
    peer: SocketAddr,
    handshake_timeout: Duration,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FramedRead::new(reader, WireCodec::new());
    let mut writer = FramedWrite::new(writer, WireCodec::new());

    let handshake = match tokio::time::timeout(handshake_timeout, reader.next()).await {
        Ok(Some(frame)) => wire::decode::<Handshake>(&frame?),
        Ok(None) => return Ok(()),
        Err(_) => {
            warn!(
                component = COMPONENT,
                peer = %peer,
                timeout_ms = handshake_timeout.as_millis() as u64,
                "edge sent no handshake in time"
            );
            return reject(&mut writer, HANDSHAKE_TIMEOUT).await;
        }
    };

    match handshake {
        Ok(Handshake::Register { bootstrap_token }) => {
            register(&service, &mut writer, &bootstrap_token, peer).await
        }
        Ok(Handshake::Connect {
            cluster_id,
            deploy_key,
        }) => run_session(service, reader, writer, cluster_id, deploy_key).await,
        Err(err) => {
            warn!(component = COMPONENT, peer = %peer, err = %err, "malformed handshake");
            reject(&mut writer, MALFORMED_HANDSHAKE).await
        }
    }
}

async fn reject<W>(writer: &mut FramedWrite<W, WireCodec>, reason: &str) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .send(HandshakeReply::Rejected {
            reason: reason.to_string(),
        })
        .await
}

async fn register<W>(
    service: &BridgeService,
    writer: &mut FramedWrite<W, WireCodec>,
    token: &BootstrapToken,
    peer: SocketAddr,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    match service.register_deployment(token).await {
        Ok(identity) => {
            writer
                .send(HandshakeReply::Registered {
                    cluster_id: identity.cluster_id,
                    deploy_key: identity.deploy_key,
                })
                .await
        }
        Err(err) => {
            warn!(component = COMPONENT, peer = %peer, err = %err, "registration refused");
            reject(writer, REGISTRATION_FAILED).await
        }
    }
}

async fn run_session<R, W>(
    service: Arc<BridgeService>,
    reader: FramedRead<R, WireCodec>,
    mut writer: FramedWrite<W, WireCodec>,
    cluster_id: ClusterId,
    deploy_key: DeployKey,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let inbound = reader
        .map(|frame| match frame {
            Ok(frame) => wire::decode::<EdgeFrame>(&frame)
                .map_err(|err| StreamError::Transport(err.to_string())),
            Err(err) => Err(StreamError::Transport(err.to_string())),
        })
        .boxed();
    let (outbound, mut frames) = mpsc::channel(service.config().outbound_queue_size.max(1));

    let identity = ClusterIdentity::new(cluster_id, deploy_key);
    let handle = match service
        .connect(identity, EdgeStream::new(inbound, outbound))
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            debug!(component = COMPONENT, cluster_id = %cluster_id, err = %err, "connect refused");
            return reject(&mut writer, err.close_reason()).await;
        }
    };

    // Data queued by the outbound pump meanwhile stays in `frames` until the
    // edge has seen the generation it is talking to.
    writer
        .send(HandshakeReply::Connected {
            generation: handle.generation(),
        })
        .await
        .map_err(|err| {
            handle.close(TeardownReason::StreamError(err.to_string()));
            err
        })?;

    let result = pump_to_edge(&handle, &mut frames, &mut writer).await;
    if let Err(err) = &result {
        handle.close(TeardownReason::StreamError(err.to_string()));
    }
    let reason = handle.closed().await;
    info!(
        component = COMPONENT,
        cluster_id = %cluster_id,
        generation = handle.generation(),
        reason = %reason,
        "edge session ended"
    );
    result
}

/// Writes bridge frames to the socket until a `Close` frame went out or the
/// adapter finished.
async fn pump_to_edge<W>(
    handle: &ConnectionHandle,
    frames: &mut mpsc::Receiver<OutboundFrame>,
    writer: &mut FramedWrite<W, WireCodec>,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            frame = frames.recv() => frame,
            reason = handle.closed() => {
                // Flush whatever the adapter queued before it finished.
                while let Ok(frame) = frames.try_recv() {
                    if write_frame(writer, frame).await? {
                        return Ok(());
                    }
                }
                return writer
                    .send(BridgeFrame::Close {
                        reason: reason.to_string(),
                    })
                    .await;
            }
        };

        match next {
            Some(frame) => {
                if write_frame(writer, frame).await? {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}

/// Confirms the frame to its sender once the socket took it. Returns `true`
/// once the frame written was the final `Close`.
async fn write_frame<W>(
    writer: &mut FramedWrite<W, WireCodec>,
    frame: OutboundFrame,
) -> Result<bool, WireError>
where
    W: AsyncWrite + Unpin,
{
    let (frame, receipt) = frame.into_parts();
    let closing = matches!(frame, BridgeFrame::Close { .. });
    writer.send(frame).await?;
    receipt.confirm();
    Ok(closing)
}
