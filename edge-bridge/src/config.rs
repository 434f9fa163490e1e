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

use crate::runtime::backoff::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tunables for one bridge replica. Every blocking operation has a bound here.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct BridgeConfig {
    /// A connection with no inbound frame for this long is torn down.
    pub heartbeat_timeout_ms: u64,
    pub heartbeat_check_interval_ms: u64,
    /// Upper bound for a single publish call before it counts as a failure.
    pub publish_timeout_ms: u64,
    /// Budget for republishing one inbound frame before the connection is failed.
    pub publish_retry: RetryPolicy,
    /// Curve for re-establishing a lost durable subscription. Usually unbounded.
    pub resubscribe_backoff: RetryPolicy,
    pub stream_write_timeout_ms: u64,
    pub validate_timeout_ms: u64,
    /// Time an evicted or failed connection gets to finish in-flight work.
    pub eviction_grace_ms: u64,
    pub outbound_queue_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            heartbeat_check_interval_ms: 5_000,
            publish_timeout_ms: 5_000,
            publish_retry: RetryPolicy::default(),
            resubscribe_backoff: RetryPolicy {
                max_attempts: 0,
                initial_delay_ms: 100,
                max_delay_ms: 10_000,
                ..RetryPolicy::default()
            },
            stream_write_timeout_ms: 5_000,
            validate_timeout_ms: 5_000,
            eviction_grace_ms: 2_000,
            outbound_queue_size: 64,
        }
    }
}

impl BridgeConfig {
    /// Checks what serde cannot: retry curves and sizes that would stall or
    /// panic at runtime. Call after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.publish_retry.validate("publish_retry")?;
        self.resubscribe_backoff.validate("resubscribe_backoff")?;
        if self.outbound_queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "outbound_queue_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_check_interval_ms.max(1))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn stream_write_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_write_timeout_ms)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{BridgeConfig, ConfigError};
    use std::time::Duration;

    #[test]
    fn partial_config_keeps_defaults_for_missing_fields() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "heartbeat_timeout_ms": 1500, "publish_retry": { "max_attempts": 2 } }"#)
                .expect("partial config should parse");

        assert_eq!(config.heartbeat_timeout(), Duration::from_millis(1500));
        assert_eq!(config.publish_retry.max_attempts, 2);
        assert_eq!(config.publish_retry.initial_delay_ms, 100);
        assert_eq!(config.outbound_queue_size, 64);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let parsed = serde_json::from_str::<BridgeConfig>(r#"{ "heartbeat_timeout": 10 }"#);

        assert!(parsed.is_err());
    }

    #[test]
    fn resubscribe_backoff_is_unbounded_by_default() {
        assert_eq!(BridgeConfig::default().resubscribe_backoff.max_attempts, 0);
    }

    #[test]
    fn negative_multiplier_fails_validation() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "publish_retry": { "multiplier": -1.0 } }"#).unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "publish_retry",
                ..
            })
        ));
        assert_eq!(BridgeConfig::default().validate(), Ok(()));
    }
}
