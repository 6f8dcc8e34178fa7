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
//! Process configuration loaded once from a TOML file.
//!
//! Lookup order: `$GNEISS_CONFIG`, then `./gneiss.toml`. Every knob has a
//! compiled default so a missing file is not an error for library embedders;
//! accessors live in [`crate::common::config`].

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GneissConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Max rows per column chunk flowing between operators.
    #[serde(default = "default_vector_chunk_size")]
    pub vector_chunk_size: usize,
    /// Serialized bytes accumulated per exchange channel before an RPC is issued.
    #[serde(default = "default_max_transmit_batched_bytes")]
    pub max_transmit_batched_bytes: usize,
    /// Compress exchange payloads when no codec is named by the query options.
    #[serde(default = "default_compress_rowbatches")]
    pub compress_rowbatches: bool,
    /// A chunk is shipped compressed only if uncompressed/compressed exceeds this.
    #[serde(default = "default_rpc_compress_ratio_threshold")]
    pub rpc_compress_ratio_threshold: f64,
    /// Joins with more build rows than this do not synthesize IN-filter pushdown.
    #[serde(default = "default_join_push_down_max_table_size")]
    pub join_push_down_max_table_size: usize,
    /// Driver time slice before a voluntary yield, in milliseconds.
    #[serde(default = "default_driver_time_slice_ms")]
    pub driver_time_slice_ms: u64,
    /// Worker threads in the driver dispatcher; 0 means one per CPU.
    #[serde(default)]
    pub driver_worker_threads: usize,
    /// How long an exchange receiver waits for lagging senders, in milliseconds.
    #[serde(default = "default_exchange_wait_ms")]
    pub exchange_wait_ms: u64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_vector_chunk_size() -> usize {
    4096
}

fn default_max_transmit_batched_bytes() -> usize {
    262_144
}

fn default_compress_rowbatches() -> bool {
    true
}

fn default_rpc_compress_ratio_threshold() -> f64 {
    1.1
}

fn default_join_push_down_max_table_size() -> usize {
    1024
}

fn default_driver_time_slice_ms() -> u64 {
    100
}

fn default_exchange_wait_ms() -> u64 {
    120_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            vector_chunk_size: default_vector_chunk_size(),
            max_transmit_batched_bytes: default_max_transmit_batched_bytes(),
            compress_rowbatches: default_compress_rowbatches(),
            rpc_compress_ratio_threshold: default_rpc_compress_ratio_threshold(),
            join_push_down_max_table_size: default_join_push_down_max_table_size(),
            driver_time_slice_ms: default_driver_time_slice_ms(),
            driver_worker_threads: 0,
            exchange_wait_ms: default_exchange_wait_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

static CONFIG: OnceLock<GneissConfig> = OnceLock::new();

fn locate_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("GNEISS_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from("gneiss.toml");
    local.exists().then_some(local)
}

fn load() -> anyhow::Result<GneissConfig> {
    let Some(path) = locate_config_file() else {
        return Ok(GneissConfig::default());
    };
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: GneissConfig =
        toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
    Ok(cfg)
}

/// Process-wide configuration; loaded on first access.
pub fn config() -> &'static GneissConfig {
    CONFIG.get_or_init(|| match load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("gneiss: falling back to default config: {err:#}");
            GneissConfig::default()
        }
    })
}

/// Install an explicit configuration (first caller wins). Used by embedders
/// and tests that cannot rely on a config file on disk.
pub fn init_from_str(s: &str) -> anyhow::Result<()> {
    let cfg: GneissConfig = toml::from_str(s).context("parse toml")?;
    let _ = CONFIG.set(cfg);
    Ok(())
}
