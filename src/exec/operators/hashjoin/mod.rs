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
//! Hash join: a build sink draining the right child into a chained hash
//! table, and a probe processor streaming the left child against it.

pub mod build;
pub mod join_hash_table;
pub mod probe;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, OnceLock};

use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::DependencyHandle;
use join_hash_table::JoinHashTable;

pub use build::HashJoinBuildSinkFactory;
pub use probe::HashJoinProbeFactory;

/// Everything the probe side needs once the build is complete. Heap
/// allocated and shared through the dependency handle, so no task can
/// outlive the completion object it reports into.
pub(crate) struct JoinBuildArtifact {
    pub(crate) build_chunks: Vec<Chunk>,
    pub(crate) table: JoinHashTable,
    pub(crate) build_row_count: usize,
}

/// State shared between the build sink and probe operator instances of one
/// join node.
pub(crate) struct JoinSharedState {
    pub(crate) dependency: DependencyHandle,
    pub(crate) artifact: OnceLock<Arc<JoinBuildArtifact>>,
    pub(crate) collected: Mutex<Vec<Chunk>>,
    pub(crate) build_instances: AtomicUsize,
    pub(crate) probe_instances: AtomicUsize,
}

impl JoinSharedState {
    pub(crate) fn new(node_id: crate::common::ids::PlanNodeId) -> Arc<Self> {
        Arc::new(Self {
            dependency: DependencyHandle::new(format!("hash_join_build (id={node_id})")),
            artifact: OnceLock::new(),
            collected: Mutex::new(Vec::new()),
            build_instances: AtomicUsize::new(0),
            probe_instances: AtomicUsize::new(0),
        })
    }
}
