// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use crate::common::app_config::config;

pub fn vector_chunk_size() -> usize {
    config().runtime.vector_chunk_size
}

pub fn max_transmit_batched_bytes() -> usize {
    config().runtime.max_transmit_batched_bytes
}

pub fn compress_rowbatches() -> bool {
    config().runtime.compress_rowbatches
}

pub fn rpc_compress_ratio_threshold() -> f64 {
    config().runtime.rpc_compress_ratio_threshold
}

pub fn join_push_down_max_table_size() -> usize {
    config().runtime.join_push_down_max_table_size
}

pub fn driver_time_slice_ms() -> u64 {
    config().runtime.driver_time_slice_ms
}

pub fn driver_worker_threads() -> usize {
    let configured = config().runtime.driver_worker_threads;
    if configured > 0 {
        return configured;
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn exchange_wait_ms() -> u64 {
    config().runtime.exchange_wait_ms
}

pub fn log_level() -> String {
    config().log.level.clone()
}
