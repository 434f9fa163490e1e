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

use crate::bridge_service::{AUTHENTICATION_FAILED, BRIDGE_UNAVAILABLE};
use crate::cluster_manager::ClusterManagerError;
use crate::identity::ClusterId;
use crate::message_bus::BusError;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by [`BridgeService`](crate::BridgeService) entry points.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The presented identity was refused. The registry was not touched.
    #[error("authentication failed for cluster {cluster_id}: {reason}")]
    AuthenticationFailure {
        cluster_id: ClusterId,
        reason: ClusterManagerError,
    },
    #[error("deployment registration failed: {0}")]
    Registration(ClusterManagerError),
    #[error("cluster manager did not answer within {0:?}")]
    ClusterManagerTimeout(Duration),
    /// The install could not be recorded or announced on the bus.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// A later install of the same cluster won while this one was admitted.
    #[error("cluster {0} was taken over by a later connection")]
    Superseded(ClusterId),
}

impl BridgeError {
    /// Reason put in the `Close` frame of a refused edge.
    pub fn close_reason(&self) -> &'static str {
        match self {
            BridgeError::Bus(_) => BRIDGE_UNAVAILABLE,
            BridgeError::Superseded(_) => TeardownReason::Superseded.as_str(),
            BridgeError::AuthenticationFailure { .. }
            | BridgeError::Registration(_)
            | BridgeError::ClusterManagerTimeout(_) => AUTHENTICATION_FAILED,
        }
    }
}

/// Why a connection ended. The first recorded reason wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeardownReason {
    /// The edge closed its stream.
    StreamClosed,
    StreamError(String),
    /// A newer connection for the same cluster was installed, here or on another replica.
    Superseded,
    /// Publishing an inbound frame failed after the whole retry budget.
    BusUnavailable(String),
    HeartbeatTimeout(Duration),
    Shutdown,
}

impl TeardownReason {
    /// Stable label for logs and `Close` frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            TeardownReason::StreamClosed => "stream_closed",
            TeardownReason::StreamError(_) => "stream_error",
            TeardownReason::Superseded => "superseded",
            TeardownReason::BusUnavailable(_) => "bus_unavailable",
            TeardownReason::HeartbeatTimeout(_) => "heartbeat_timeout",
            TeardownReason::Shutdown => "shutdown",
        }
    }
}

impl Display for TeardownReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownReason::StreamError(detail) | TeardownReason::BusUnavailable(detail) => {
                write!(f, "{}: {detail}", self.as_str())
            }
            TeardownReason::HeartbeatTimeout(timeout) => {
                write!(f, "{} after {}ms", self.as_str(), timeout.as_millis())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}
