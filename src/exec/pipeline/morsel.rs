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
//! Morsels: scan-range shards, the unit of source parallelism.

use crate::common::ids::PlanNodeId;
use crate::plan::ScanRangeParams;

/// One scan-range shard bound to exactly one driver.
#[derive(Clone, Debug)]
pub struct Morsel {
    node_id: PlanNodeId,
    scan_range: ScanRangeParams,
}

impl Morsel {
    pub fn new(node_id: PlanNodeId, scan_range: ScanRangeParams) -> Self {
        Self {
            node_id,
            scan_range,
        }
    }

    pub fn node_id(&self) -> PlanNodeId {
        self.node_id
    }

    pub fn scan_range(&self) -> &ScanRangeParams {
        &self.scan_range
    }
}

/// Wrap a scan node's assigned ranges into morsels.
pub fn convert_scan_ranges_to_morsels(
    scan_ranges: &[ScanRangeParams],
    node_id: PlanNodeId,
) -> Vec<Morsel> {
    scan_ranges
        .iter()
        .map(|range| Morsel::new(node_id, range.clone()))
        .collect()
}
