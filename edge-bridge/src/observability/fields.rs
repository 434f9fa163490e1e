/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
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

//! Canonical structured field keys and value-format helpers.

use crate::envelope::Envelope;
use crate::identity::ClusterId;

pub const EVENT: &str = "event";
pub const COMPONENT: &str = "component";
pub const CLUSTER_ID: &str = "cluster_id";
pub const GENERATION: &str = "generation";
pub const REPLICA_ID: &str = "replica_id";

pub const SUBJECT: &str = "subject";
pub const SEQUENCE: &str = "sequence";
pub const CORRELATION_ID: &str = "correlation_id";
pub const PAYLOAD_LEN: &str = "payload_len";

pub const REASON: &str = "reason";
pub const ERR: &str = "err";
pub const ATTEMPT: &str = "attempt";

pub const NONE: &str = "none";

/// Short form of a cluster id used in log lines.
pub fn format_cluster_id(cluster_id: &ClusterId) -> String {
    cluster_id.hyphenated().to_string()
}

pub fn format_correlation_id(correlation_id: Option<&str>) -> String {
    correlation_id.unwrap_or(NONE).to_string()
}

/// Preformatted envelope fields, built only when the log level needs them.
pub struct EnvelopeFields {
    pub subject: String,
    pub sequence: u64,
    pub correlation_id: String,
    pub payload_len: usize,
}

impl EnvelopeFields {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            subject: envelope.subject().to_string(),
            sequence: envelope.sequence,
            correlation_id: format_correlation_id(envelope.correlation_id.as_deref()),
            payload_len: envelope.payload.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{format_correlation_id, EnvelopeFields, NONE};
    use crate::envelope::{Direction, Envelope};
    use bytes::Bytes;
    use uuid::Uuid;

    #[test]
    fn correlation_id_falls_back_when_absent() {
        assert_eq!(format_correlation_id(None), NONE);
        assert_eq!(format_correlation_id(Some("req-1")), "req-1");
    }

    #[test]
    fn envelope_fields_use_subject_naming() {
        let envelope = Envelope {
            cluster_id: Uuid::nil(),
            direction: Direction::FromCluster,
            sequence: 7,
            correlation_id: None,
            payload: Bytes::from_static(b"abc"),
        };

        let fields = EnvelopeFields::from_envelope(&envelope);

        assert!(fields.subject.ends_with(".from_cluster"));
        assert_eq!(fields.sequence, 7);
        assert_eq!(fields.correlation_id, NONE);
        assert_eq!(fields.payload_len, 3);
    }
}
