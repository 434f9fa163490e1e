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

use bytes::Bytes;
use edge_bridge::{BridgeConfig, Envelope, RetryPolicy};
use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Upper bound for any single wait in an integration test.
pub const GUARD: Duration = Duration::from_secs(10);

static LOGGING: Once = Once::new();

/// Installs a `RUST_LOG` driven fmt subscriber once per test binary.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Bridge tunables shrunk so failure paths resolve in milliseconds.
pub fn fast_config() -> BridgeConfig {
    let fast = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 10,
        multiplier: 2.0,
        jitter: 0.0,
    };
    BridgeConfig {
        publish_timeout_ms: 200,
        publish_retry: fast.clone(),
        resubscribe_backoff: RetryPolicy {
            max_attempts: 0,
            ..fast
        },
        stream_write_timeout_ms: 200,
        validate_timeout_ms: 200,
        eviction_grace_ms: 300,
        ..BridgeConfig::default()
    }
}

/// Polls `condition` every few milliseconds, panicking after `timeout`.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("timed out after {timeout:?} waiting for {what}");
    }
}

/// Asserts that `envelopes` carry the sequences `1..=n` in order.
pub fn check_sequences_gap_free(envelopes: &[Envelope]) {
    for (index, envelope) in envelopes.iter().enumerate() {
        let expected = index as u64 + 1;
        debug!(subject = %envelope.subject(), sequence = envelope.sequence, expected);
        if envelope.sequence != expected {
            panic!(
                "!! -- Sequence gap on {}: expected {expected}, found {} -- !!",
                envelope.subject(),
                envelope.sequence
            );
        }
    }
}

pub fn payloads(envelopes: &[Envelope]) -> Vec<Bytes> {
    envelopes
        .iter()
        .map(|envelope| envelope.payload.clone())
        .collect()
}
