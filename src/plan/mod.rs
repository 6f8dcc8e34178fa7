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
//! Plan-fragment contract between the coordinator and this worker.
//!
//! These are the shapes the coordinator RPC carries: a plan-node tree with
//! scan ranges and exchange fan-in counts, the output sink, descriptors and
//! query options. Scan sources surface as in-memory chunk ranges; storage
//! formats live behind the scan boundary and are not modeled here.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::common::ids::{PlanNodeId, SlotId};
use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::exec::chunk::{field_with_slot_id, Chunk};
use crate::exec::expr::Expr;
use crate::runtime::transmit::CompressType;

#[derive(Clone, Debug)]
pub struct SlotDescriptor {
    pub id: SlotId,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

/// Slot descriptors for every column flowing through the fragment.
#[derive(Clone, Debug, Default)]
pub struct DescriptorTbl {
    slots: HashMap<SlotId, SlotDescriptor>,
}

impl DescriptorTbl {
    pub fn new(slots: Vec<SlotDescriptor>) -> Self {
        Self {
            slots: slots.into_iter().map(|s| (s.id, s)).collect(),
        }
    }

    pub fn slot(&self, id: SlotId) -> Result<&SlotDescriptor> {
        self.slots
            .get(&id)
            .ok_or_else(|| Status::not_found(format!("slot descriptor {id} missing")))
    }

    /// Arrow schema for an ordered slot list, slot ids in field metadata.
    pub fn schema_for(&self, slot_ids: &[SlotId]) -> Result<SchemaRef> {
        let mut fields = Vec::with_capacity(slot_ids.len());
        for id in slot_ids {
            let slot = self.slot(*id)?;
            fields.push(field_with_slot_id(
                Field::new(slot.name.clone(), slot.data_type.clone(), slot.nullable),
                slot.id,
            ));
        }
        Ok(Arc::new(Schema::new(fields)))
    }
}

#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub mem_limit: i64,
    pub query_timeout_s: i32,
    pub query_threads: i32,
    pub transmission_compression_type: Option<CompressType>,
    pub batch_size: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            mem_limit: -1,
            query_timeout_s: 300,
            query_threads: 1,
            transmission_compression_type: None,
            batch_size: None,
        }
    }
}

/// Scan-range payload behind the scan boundary: already-decoded chunks.
#[derive(Clone, Debug, Default)]
pub struct ScanRangeParams {
    pub range_id: i64,
    pub chunks: Vec<Chunk>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinOp {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    LeftSemi,
    RightSemi,
    LeftAnti,
    RightAnti,
}

impl JoinOp {
    pub fn keeps_unmatched_probe(self) -> bool {
        matches!(self, JoinOp::LeftOuter | JoinOp::FullOuter)
    }

    pub fn keeps_unmatched_build(self) -> bool {
        matches!(self, JoinOp::RightOuter | JoinOp::FullOuter | JoinOp::RightAnti)
    }

    pub fn needs_build_match_bits(self) -> bool {
        matches!(
            self,
            JoinOp::RightOuter | JoinOp::FullOuter | JoinOp::RightSemi | JoinOp::RightAnti
        )
    }
}

#[derive(Clone, Debug)]
pub struct EqJoinCondition {
    pub left: Expr,
    pub right: Expr,
    pub null_safe: bool,
}

#[derive(Clone, Debug)]
pub enum PlanNode {
    Scan {
        node_id: PlanNodeId,
        slot_ids: Vec<SlotId>,
        conjuncts: Vec<Expr>,
    },
    Exchange {
        node_id: PlanNodeId,
        slot_ids: Vec<SlotId>,
    },
    HashJoin {
        node_id: PlanNodeId,
        join_op: JoinOp,
        eq_join_conjuncts: Vec<EqJoinCondition>,
        other_join_conjuncts: Vec<Expr>,
        conjuncts: Vec<Expr>,
        is_push_down: bool,
        children: Vec<PlanNode>,
    },
}

impl PlanNode {
    pub fn node_id(&self) -> PlanNodeId {
        match self {
            PlanNode::Scan { node_id, .. }
            | PlanNode::Exchange { node_id, .. }
            | PlanNode::HashJoin { node_id, .. } => *node_id,
        }
    }

    pub fn children(&self) -> &[PlanNode] {
        match self {
            PlanNode::HashJoin { children, .. } => children,
            _ => &[],
        }
    }

    pub fn is_exchange(&self) -> bool {
        matches!(self, PlanNode::Exchange { .. })
    }

    /// Slot ids of the rows this node emits, in output order.
    pub fn output_slot_ids(&self) -> Vec<SlotId> {
        match self {
            PlanNode::Scan { slot_ids, .. } | PlanNode::Exchange { slot_ids, .. } => {
                slot_ids.clone()
            }
            PlanNode::HashJoin {
                join_op, children, ..
            } => match join_op {
                JoinOp::LeftSemi | JoinOp::LeftAnti => children[0].output_slot_ids(),
                JoinOp::RightSemi | JoinOp::RightAnti => children[1].output_slot_ids(),
                _ => {
                    let mut out = children[0].output_slot_ids();
                    out.extend(children[1].output_slot_ids());
                    out
                }
            },
        }
    }

    pub fn collect_scan_nodes<'a>(&'a self, out: &mut Vec<&'a PlanNode>) {
        if matches!(self, PlanNode::Scan { .. }) {
            out.push(self);
        }
        for child in self.children() {
            child.collect_scan_nodes(out);
        }
    }

    pub fn collect_exchange_nodes<'a>(&'a self, out: &mut Vec<&'a PlanNode>) {
        if self.is_exchange() {
            out.push(self);
        }
        for child in self.children() {
            child.collect_exchange_nodes(out);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionType {
    Unpartitioned,
    Random,
    HashPartitioned,
    BucketShuffleHashPartitioned,
    RangePartitioned,
}

/// One endpoint of a partition range. Infinite endpoints order below/above
/// every key so the comparator is a strict weak order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PartRangeKey {
    NegInfinite,
    Key(i64),
    PosInfinite,
}

#[derive(Clone, Copy, Debug)]
pub struct PartRange {
    pub start: PartRangeKey,
    pub end: PartRangeKey,
    pub include_start: bool,
    pub include_end: bool,
}

impl PartRange {
    /// `Less` when the whole range sorts below `key`, `Greater` when above,
    /// `Equal` when `key` falls inside.
    pub fn compare_key(&self, key: PartRangeKey) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let below = match self.end.cmp(&key) {
            Ordering::Less => true,
            Ordering::Equal => !self.include_end,
            Ordering::Greater => false,
        };
        if below {
            return Ordering::Less;
        }
        let above = match self.start.cmp(&key) {
            Ordering::Greater => true,
            Ordering::Equal => !self.include_start,
            Ordering::Less => false,
        };
        if above {
            return Ordering::Greater;
        }
        Ordering::Equal
    }
}

#[derive(Clone, Debug)]
pub struct PartitionInfo {
    pub id: i64,
    pub range: PartRange,
    pub distribution_exprs: Vec<Expr>,
    pub distributed_bucket: u32,
}

#[derive(Clone, Debug)]
pub struct OutputPartition {
    pub part_type: PartitionType,
    pub partition_exprs: Vec<Expr>,
    pub partition_infos: Vec<PartitionInfo>,
}

impl OutputPartition {
    pub fn unpartitioned() -> Self {
        Self {
            part_type: PartitionType::Unpartitioned,
            partition_exprs: Vec::new(),
            partition_infos: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamSink {
    pub dest_node_id: PlanNodeId,
    pub output_partition: OutputPartition,
    pub ignore_not_found: bool,
}

#[derive(Clone, Debug)]
pub enum DataSinkDesc {
    Result,
    Stream(StreamSink),
}

#[derive(Clone, Debug)]
pub struct PlanFragmentDestination {
    pub fragment_instance_id: UniqueId,
    pub address: String,
}

#[derive(Clone, Debug)]
pub struct PlanFragment {
    pub plan: PlanNode,
    pub output_sink: Option<DataSinkDesc>,
}

#[derive(Clone, Debug)]
pub struct PlanFragmentExecParams {
    pub query_id: UniqueId,
    pub fragment_instance_id: UniqueId,
    pub per_node_scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeParams>>,
    pub per_exch_num_senders: HashMap<PlanNodeId, i32>,
    pub destinations: Vec<PlanFragmentDestination>,
    pub sender_id: i32,
    pub instances_number: i32,
}

#[derive(Clone, Debug)]
pub struct ExecPlanFragmentParams {
    pub params: PlanFragmentExecParams,
    pub fragment: PlanFragment,
    pub desc_tbl: DescriptorTbl,
    pub query_options: QueryOptions,
    pub backend_num: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_range_comparator_handles_endpoints() {
        use std::cmp::Ordering;
        let range = PartRange {
            start: PartRangeKey::Key(10),
            end: PartRangeKey::Key(20),
            include_start: true,
            include_end: false,
        };
        assert_eq!(range.compare_key(PartRangeKey::Key(5)), Ordering::Greater);
        assert_eq!(range.compare_key(PartRangeKey::Key(10)), Ordering::Equal);
        assert_eq!(range.compare_key(PartRangeKey::Key(19)), Ordering::Equal);
        assert_eq!(range.compare_key(PartRangeKey::Key(20)), Ordering::Less);
        assert_eq!(
            range.compare_key(PartRangeKey::NegInfinite),
            Ordering::Greater
        );

        let open_ended = PartRange {
            start: PartRangeKey::NegInfinite,
            end: PartRangeKey::PosInfinite,
            include_start: false,
            include_end: false,
        };
        assert_eq!(open_ended.compare_key(PartRangeKey::Key(0)), Ordering::Equal);
    }

    #[test]
    fn join_output_slots_follow_the_variant() {
        let probe = PlanNode::Scan {
            node_id: 0,
            slot_ids: vec![SlotId::new(1)],
            conjuncts: vec![],
        };
        let build = PlanNode::Scan {
            node_id: 1,
            slot_ids: vec![SlotId::new(2)],
            conjuncts: vec![],
        };
        let join = |op| PlanNode::HashJoin {
            node_id: 2,
            join_op: op,
            eq_join_conjuncts: vec![],
            other_join_conjuncts: vec![],
            conjuncts: vec![],
            is_push_down: false,
            children: vec![probe.clone(), build.clone()],
        };
        assert_eq!(
            join(JoinOp::Inner).output_slot_ids(),
            vec![SlotId::new(1), SlotId::new(2)]
        );
        assert_eq!(join(JoinOp::LeftSemi).output_slot_ids(), vec![SlotId::new(1)]);
        assert_eq!(
            join(JoinOp::RightAnti).output_slot_ids(),
            vec![SlotId::new(2)]
        );
    }
}
