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

mod config;
mod health;
mod session;
mod wire;

use crate::config::{BusConfig, ClusterManagerMode, Config};
use clap::Parser;
use cluster_manager_static_file::{ClusterManagerStaticFile, StaticFileError};
use edge_bridge::{BridgeService, BusError, ClusterManager, ConfigError, InMemoryBus, MessageBus};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command()]
struct BridgeArgs {
    #[arg(short, long, value_name = "FILE")]
    config: String,
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("unable to read config file {path}: {source}")]
    ReadConfig {
        path: String,
        source: std::io::Error,
    },
    #[error("unable to parse config file: {0}")]
    ParseConfig(#[from] json5::Error),
    #[error("invalid bridge config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("unable to load cluster manager: {0}")]
    ClusterManager(#[from] StaticFileError),
    #[error("message bus unavailable at startup: {0}")]
    Bus(#[from] BusError),
    #[error("unable to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    info!("Started edge-bridge-server");

    let args = BridgeArgs::parse();
    let contents =
        std::fs::read_to_string(&args.config).map_err(|source| StartupError::ReadConfig {
            path: args.config.clone(),
            source,
        })?;
    let config: Config = json5::from_str(&contents)?;
    config.bridge.validate()?;
    debug!("Loaded config {config:?}");

    let cluster_manager: Arc<dyn ClusterManager> = match config.cluster_manager.mode {
        ClusterManagerMode::StaticFile => Arc::new(ClusterManagerStaticFile::new(
            &config.cluster_manager.file_path,
        )?),
    };
    let bus = connect_bus(&config.bus).await?;

    let service = Arc::new(BridgeService::new(
        config.replica_id.clone(),
        config.bridge.clone(),
        bus,
        cluster_manager,
    ));
    service.start().await?;

    let bridge_listener = bind(&config.listener.bridge_address).await?;
    let health_listener = bind(&config.listener.health_address).await?;
    let shutdown = CancellationToken::new();

    let health = tokio::spawn(health::serve(health_listener, shutdown.clone()));
    let acceptor = tokio::spawn(accept_edges(
        service.clone(),
        bridge_listener,
        config.listener.handshake_timeout(),
        shutdown.clone(),
    ));

    info!(
        replica_id = %config.replica_id,
        bridge_address = %config.listener.bridge_address,
        health_address = %config.listener.health_address,
        "edge-bridge-server ready"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("unable to listen for ctrl-c, shutting down: {err}");
    }
    info!("shutting down edge-bridge-server");

    shutdown.cancel();
    let _ = acceptor.await;
    service.shutdown().await;
    match health.await {
        Ok(Err(err)) => warn!("health endpoint stopped with error: {err}"),
        Err(err) => warn!("health endpoint task failed: {err}"),
        Ok(Ok(())) => {}
    }
    Ok(())
}

async fn connect_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>, StartupError> {
    match config {
        BusConfig::Memory => {
            warn!("using the in-memory bus, messages do not survive a restart or reach other replicas");
            Ok(Arc::new(InMemoryBus::new()))
        }
        #[cfg(feature = "jetstream")]
        BusConfig::Jetstream(options) => {
            let bus = edge_bridge::JetStreamBus::connect(options).await?;
            Ok(Arc::new(bus))
        }
    }
}

async fn bind(address: &str) -> Result<TcpListener, StartupError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| StartupError::Bind {
            address: address.to_string(),
            source,
        })
}

async fn accept_edges(
    service: Arc<BridgeService>,
    listener: TcpListener,
    handshake_timeout: std::time::Duration,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("failed to accept edge connection: {err}");
                continue;
            }
        };
        if let Err(err) = socket.set_nodelay(true) {
            debug!(peer = %peer, "unable to set TCP_NODELAY: {err}");
        }

        let service = service.clone();
        tokio::spawn(async move {
            let (reader, writer) = socket.into_split();
            if let Err(err) =
                session::serve(service, reader, writer, peer, handshake_timeout).await
            {
                debug!(peer = %peer, "edge session ended with error: {err}");
            }
        });
    }
}
