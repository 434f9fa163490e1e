/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
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

use crate::identity::ClusterId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const SUBJECT_PREFIX: &str = "bridge.cluster";

/// Which way an envelope travels relative to the edge cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Cloud to cluster commands.
    ToCluster,
    /// Cluster to cloud results.
    FromCluster,
    /// Install records, one per accepted connection anywhere in the fleet.
    /// Their sequence orders installs across replicas.
    Installs,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToCluster => "to_cluster",
            Direction::FromCluster => "from_cluster",
            Direction::Installs => "installs",
        }
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_cluster" => Ok(Direction::ToCluster),
            "from_cluster" => Ok(Direction::FromCluster),
            "installs" => Ok(Direction::Installs),
            _ => Err(()),
        }
    }
}

///
/// A durable bus subject for one `(cluster, direction)` pair.
///
/// Names are derived from the cluster id alone so that every bridge replica
/// attaches to the same subjects.
///
/// ```
/// use edge_bridge::{Direction, Subject};
/// use uuid::Uuid;
///
/// let cluster_id = Uuid::nil();
/// let subject = Subject::new(cluster_id, Direction::FromCluster);
/// assert_eq!(
///     subject.to_string(),
///     "bridge.cluster.00000000-0000-0000-0000-000000000000.from_cluster"
/// );
/// assert_eq!(subject.to_string().parse::<Subject>(), Ok(subject));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subject {
    pub cluster_id: ClusterId,
    pub direction: Direction,
}

impl Subject {
    pub fn new(cluster_id: ClusterId, direction: Direction) -> Self {
        Self {
            cluster_id,
            direction,
        }
    }

    pub fn to_cluster(cluster_id: ClusterId) -> Self {
        Self::new(cluster_id, Direction::ToCluster)
    }

    pub fn from_cluster(cluster_id: ClusterId) -> Self {
        Self::new(cluster_id, Direction::FromCluster)
    }

    pub fn installs(cluster_id: ClusterId) -> Self {
        Self::new(cluster_id, Direction::Installs)
    }

    /// Durable consumer name used by whichever replica currently bridges the cluster.
    pub fn consumer_name(&self) -> String {
        format!("bridge-{}-{}", self.cluster_id.simple(), self.direction.as_str())
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{SUBJECT_PREFIX}.{}.{}",
            self.cluster_id.hyphenated(),
            self.direction.as_str()
        )
    }
}

impl FromStr for Subject {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SUBJECT_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .ok_or(())?;
        let (cluster_id, direction) = rest.split_once('.').ok_or(())?;
        let cluster_id = ClusterId::parse_str(cluster_id).map_err(|_| ())?;
        Ok(Self::new(cluster_id, direction.parse()?))
    }
}

/// Unit exchanged between a connection and the message bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub cluster_id: ClusterId,
    pub direction: Direction,
    /// Monotonic per `(cluster_id, direction)`, assigned by the bus on publish.
    pub sequence: u64,
    pub correlation_id: Option<String>,
    pub payload: Bytes,
}

impl Envelope {
    pub fn subject(&self) -> Subject {
        Subject::new(self.cluster_id, self.direction)
    }
}
