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

mod edge_client;
pub use edge_client::EdgeClient;
mod fake_cluster_manager;
pub use fake_cluster_manager::FakeClusterManager;
mod integration_test_utils;

pub use integration_test_utils::{
    check_sequences_gap_free, fast_config, init_logging, payloads, wait_until, GUARD,
};
