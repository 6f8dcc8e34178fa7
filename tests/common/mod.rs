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
//! Shared helpers for integration tests: chunk/plan builders, a
//! nested-loop reference join and result-row extraction.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

use gneiss::common::ids::{PlanNodeId, SlotId};
use gneiss::exec::chunk::{field_with_slot_id, Chunk};
use gneiss::exec::pipeline::fragment_context::FragmentContext;
use gneiss::plan::{
    DataSinkDesc, DescriptorTbl, EqJoinCondition, ExecPlanFragmentParams, JoinOp, PlanFragment,
    PlanFragmentExecParams, PlanNode, QueryOptions, ScanRangeParams, SlotDescriptor,
};
use gneiss::{ExecEnv, Result, UniqueId};

pub const WAIT: Duration = Duration::from_secs(20);

/// One cell of a materialized result row, ordered so multisets can be
/// compared by sorting.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cell {
    Null,
    Int(i64),
    Str(String),
}

pub type Row = Vec<Cell>;

pub fn int_utf8_schema(int_slot: i32, str_slot: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        field_with_slot_id(Field::new("k", DataType::Int32, true), SlotId::new(int_slot)),
        field_with_slot_id(Field::new("v", DataType::Utf8, true), SlotId::new(str_slot)),
    ]))
}

pub fn int_utf8_chunk(int_slot: i32, str_slot: i32, rows: &[(Option<i32>, Option<&str>)]) -> Chunk {
    let schema = int_utf8_schema(int_slot, str_slot);
    let keys: Int32Array = rows.iter().map(|(k, _)| *k).collect();
    let values: StringArray = rows.iter().map(|(_, v)| *v).collect();
    let batch =
        RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(values)]).expect("batch");
    Chunk::try_new(batch).expect("chunk")
}

pub fn int_chunk(slot: i32, values: &[Option<i32>]) -> Chunk {
    let schema = Arc::new(Schema::new(vec![field_with_slot_id(
        Field::new("k", DataType::Int32, true),
        SlotId::new(slot),
    )]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
        .expect("batch");
    Chunk::try_new(batch).expect("chunk")
}

pub fn int_utf8_slots(int_slot: i32, str_slot: i32, prefix: &str) -> Vec<SlotDescriptor> {
    vec![
        SlotDescriptor {
            id: SlotId::new(int_slot),
            name: format!("{prefix}_k"),
            data_type: DataType::Int32,
            nullable: true,
        },
        SlotDescriptor {
            id: SlotId::new(str_slot),
            name: format!("{prefix}_v"),
            data_type: DataType::Utf8,
            nullable: true,
        },
    ]
}

pub fn scan_node(node_id: PlanNodeId, slot_ids: Vec<i32>) -> PlanNode {
    PlanNode::Scan {
        node_id,
        slot_ids: slot_ids.into_iter().map(SlotId::new).collect(),
        conjuncts: vec![],
    }
}

/// A single-key equi-join plan over two scans: probe is node 0, build is
/// node 1, join is node 2.
pub fn join_plan(
    join_op: JoinOp,
    probe_key: i32,
    build_key: i32,
    null_safe: bool,
    is_push_down: bool,
) -> PlanNode {
    PlanNode::HashJoin {
        node_id: 2,
        join_op,
        eq_join_conjuncts: vec![EqJoinCondition {
            left: gneiss::exec::expr::Expr::ColumnRef(SlotId::new(probe_key)),
            right: gneiss::exec::expr::Expr::ColumnRef(SlotId::new(build_key)),
            null_safe,
        }],
        other_join_conjuncts: vec![],
        conjuncts: vec![],
        is_push_down,
        children: vec![scan_node(0, vec![1, 2]), scan_node(1, vec![3, 4])],
    }
}

pub fn exec_params(
    query_id: UniqueId,
    fragment_instance_id: UniqueId,
    plan: PlanNode,
    scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeParams>>,
    slots: Vec<SlotDescriptor>,
    output_sink: Option<DataSinkDesc>,
    query_options: QueryOptions,
) -> ExecPlanFragmentParams {
    ExecPlanFragmentParams {
        params: PlanFragmentExecParams {
            query_id,
            fragment_instance_id,
            per_node_scan_ranges: scan_ranges,
            per_exch_num_senders: HashMap::new(),
            destinations: vec![],
            sender_id: 0,
            instances_number: 1,
        },
        fragment: PlanFragment {
            plan,
            output_sink,
        },
        desc_tbl: DescriptorTbl::new(slots),
        query_options,
        backend_num: 0,
    }
}

/// Submit, wait for completion and return the result rows projected over
/// `slots` in order.
pub fn run_fragment(
    env: &ExecEnv,
    params: &ExecPlanFragmentParams,
    slots: &[i32],
) -> Result<Vec<Row>> {
    let ctx = gneiss::submit_exec_plan_fragment(env, params)?;
    ctx.wait_finish(WAIT)?;
    Ok(result_rows(&ctx, slots))
}

pub fn result_rows(ctx: &Arc<FragmentContext>, slots: &[i32]) -> Vec<Row> {
    let mut rows = Vec::new();
    for chunk in ctx.result_buffer().chunks() {
        rows.extend(chunk_rows(&chunk, slots));
    }
    rows
}

pub fn chunk_rows(chunk: &Chunk, slots: &[i32]) -> Vec<Row> {
    let columns: Vec<ArrayRef> = slots
        .iter()
        .map(|slot| {
            chunk
                .column_by_slot_id(SlotId::new(*slot))
                .expect("result slot")
        })
        .collect();
    (0..chunk.len())
        .map(|row| columns.iter().map(|col| cell_at(col, row)).collect())
        .collect()
}

fn cell_at(array: &ArrayRef, row: usize) -> Cell {
    if array.is_null(row) {
        return Cell::Null;
    }
    match array.data_type() {
        DataType::Int32 => Cell::Int(
            array
                .as_any()
                .downcast_ref::<Int32Array>()
                .unwrap()
                .value(row) as i64,
        ),
        DataType::Utf8 => Cell::Str(
            array
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(row)
                .to_string(),
        ),
        other => panic!("unexpected result column type {other:?}"),
    }
}

pub fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort();
    rows
}

/// Reference semantics: nested-loop single-key equi-join over option rows
/// `(key, payload)`.
pub fn reference_join(
    join_op: JoinOp,
    probe: &[(Option<i32>, Option<&str>)],
    build: &[(Option<i32>, Option<&str>)],
    null_safe: bool,
) -> Vec<Row> {
    let key_match = |p: &Option<i32>, b: &Option<i32>| -> bool {
        match (p, b) {
            (Some(x), Some(y)) => x == y,
            (None, None) => null_safe,
            _ => false,
        }
    };
    let probe_row = |r: &(Option<i32>, Option<&str>)| -> Vec<Cell> {
        vec![
            r.0.map(|v| Cell::Int(v as i64)).unwrap_or(Cell::Null),
            r.1.map(|v| Cell::Str(v.to_string())).unwrap_or(Cell::Null),
        ]
    };
    let mut out = Vec::new();
    let mut build_matched = vec![false; build.len()];
    match join_op {
        JoinOp::Inner | JoinOp::LeftOuter | JoinOp::RightOuter | JoinOp::FullOuter => {
            for p in probe {
                let mut matched = false;
                for (bi, b) in build.iter().enumerate() {
                    if key_match(&p.0, &b.0) {
                        matched = true;
                        build_matched[bi] = true;
                        let mut row = probe_row(p);
                        row.extend(probe_row(b));
                        out.push(row);
                    }
                }
                if !matched && matches!(join_op, JoinOp::LeftOuter | JoinOp::FullOuter) {
                    let mut row = probe_row(p);
                    row.extend(vec![Cell::Null, Cell::Null]);
                    out.push(row);
                }
            }
            if matches!(join_op, JoinOp::RightOuter | JoinOp::FullOuter) {
                for (bi, b) in build.iter().enumerate() {
                    if !build_matched[bi] {
                        let mut row = vec![Cell::Null, Cell::Null];
                        row.extend(probe_row(b));
                        out.push(row);
                    }
                }
            }
        }
        JoinOp::LeftSemi => {
            for p in probe {
                if build.iter().any(|b| key_match(&p.0, &b.0)) {
                    out.push(probe_row(p));
                }
            }
        }
        JoinOp::LeftAnti => {
            for p in probe {
                if !build.iter().any(|b| key_match(&p.0, &b.0)) {
                    out.push(probe_row(p));
                }
            }
        }
        JoinOp::RightSemi => {
            for b in build {
                if probe.iter().any(|p| key_match(&p.0, &b.0)) {
                    out.push(probe_row(b));
                }
            }
        }
        JoinOp::RightAnti => {
            for b in build {
                if !probe.iter().any(|p| key_match(&p.0, &b.0)) {
                    out.push(probe_row(b));
                }
            }
        }
    }
    out
}

pub const ALL_JOIN_OPS: [JoinOp; 8] = [
    JoinOp::Inner,
    JoinOp::LeftOuter,
    JoinOp::RightOuter,
    JoinOp::FullOuter,
    JoinOp::LeftSemi,
    JoinOp::RightSemi,
    JoinOp::LeftAnti,
    JoinOp::RightAnti,
];

/// Output slot projection per join variant for `join_plan`.
pub fn join_output_slots(join_op: JoinOp) -> Vec<i32> {
    match join_op {
        JoinOp::LeftSemi | JoinOp::LeftAnti => vec![1, 2],
        JoinOp::RightSemi | JoinOp::RightAnti => vec![3, 4],
        _ => vec![1, 2, 3, 4],
    }
}

/// Build one transmit frame the way a sender channel would: meta rides on
/// the channel's first chunk only.
pub fn transmit_frame(
    finst: UniqueId,
    node_id: PlanNodeId,
    sender_id: i32,
    sequence: i64,
    eos: bool,
    chunk: Option<&Chunk>,
    meta_cache: &mut Option<Vec<u8>>,
) -> (
    gneiss::runtime::transmit::TransmitChunkParams,
    bytes::Bytes,
) {
    use gneiss::runtime::exchange::encode_chunk;
    use gneiss::runtime::transmit::{
        construct_attachment, ChunkPb, CompressType, PUniqueId, TransmitChunkParams,
    };

    let mut chunks = Vec::new();
    if let Some(chunk) = chunk {
        let (meta, payload) = encode_chunk(chunk).expect("encode chunk");
        let send_meta = if meta_cache.is_none() {
            *meta_cache = Some(meta.clone());
            meta
        } else {
            Vec::new()
        };
        chunks.push(ChunkPb {
            slot_id_map: chunk.slot_ids().iter().map(|s| s.raw()).collect(),
            meta: send_meta,
            uncompressed_size: payload.len() as i64,
            compress_type: CompressType::None as i32,
            data_size: 0,
            data: payload,
        });
    }
    let mut params = TransmitChunkParams {
        finst_id: Some(PUniqueId {
            hi: finst.hi,
            lo: finst.lo,
        }),
        node_id,
        sender_id,
        be_number: 0,
        sequence,
        eos,
        chunks,
    };
    let attachment = construct_attachment(&mut params);
    (params, attachment)
}
