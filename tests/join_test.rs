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
//! Hash-join correctness over the full fragment runtime.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::*;
use gneiss::common::ids::SlotId;
use gneiss::exec::expr::{CmpOp, Expr};
use gneiss::plan::{
    DataSinkDesc, EqJoinCondition, JoinOp, PlanNode, QueryOptions, ScanRangeParams,
};
use gneiss::{ExecEnv, StatusCode, UniqueId};

fn scan_ranges_for_join(
    probe: &[(Option<i32>, Option<&str>)],
    build: &[(Option<i32>, Option<&str>)],
) -> HashMap<i32, Vec<ScanRangeParams>> {
    let mut ranges = HashMap::new();
    ranges.insert(
        0,
        vec![ScanRangeParams {
            range_id: 0,
            chunks: vec![int_utf8_chunk(1, 2, probe)],
        }],
    );
    ranges.insert(
        1,
        vec![ScanRangeParams {
            range_id: 1,
            chunks: vec![int_utf8_chunk(3, 4, build)],
        }],
    );
    ranges
}

fn join_slots() -> Vec<gneiss::plan::SlotDescriptor> {
    let mut slots = int_utf8_slots(1, 2, "probe");
    slots.extend(int_utf8_slots(3, 4, "build"));
    slots
}

fn run_join(
    env: &ExecEnv,
    join_op: JoinOp,
    probe: &[(Option<i32>, Option<&str>)],
    build: &[(Option<i32>, Option<&str>)],
    null_safe: bool,
    is_push_down: bool,
    query_seq: &mut i64,
) -> Vec<Row> {
    *query_seq += 1;
    let params = exec_params(
        UniqueId::new(100, *query_seq),
        UniqueId::new(200, *query_seq),
        join_plan(join_op, 1, 3, null_safe, is_push_down),
        scan_ranges_for_join(probe, build),
        join_slots(),
        Some(DataSinkDesc::Result),
        QueryOptions::default(),
    );
    run_fragment(env, &params, &join_output_slots(join_op)).expect("join fragment")
}

#[test]
fn inner_join_on_integer_key() {
    let env = ExecEnv::new();
    let mut seq = 0;
    let build = [(Some(1), Some("a")), (Some(2), Some("b")), (Some(2), Some("c"))];
    let probe = [(Some(2), Some("x")), (Some(3), Some("y"))];
    let rows = run_join(&env, JoinOp::Inner, &probe, &build, false, false, &mut seq);
    let expected = vec![
        vec![
            Cell::Int(2),
            Cell::Str("x".into()),
            Cell::Int(2),
            Cell::Str("b".into()),
        ],
        vec![
            Cell::Int(2),
            Cell::Str("x".into()),
            Cell::Int(2),
            Cell::Str("c".into()),
        ],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn full_outer_join_with_null_safe_equality() {
    let env = ExecEnv::new();
    let mut seq = 10;
    let build = [(None, Some("b")), (Some(1), Some("a"))];
    let probe = [(None, Some("x")), (Some(2), Some("y"))];
    let rows = run_join(&env, JoinOp::FullOuter, &probe, &build, true, false, &mut seq);
    let expected = vec![
        vec![Cell::Null, Cell::Str("x".into()), Cell::Null, Cell::Str("b".into())],
        vec![Cell::Int(2), Cell::Str("y".into()), Cell::Null, Cell::Null],
        vec![Cell::Null, Cell::Null, Cell::Int(1), Cell::Str("a".into())],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn null_safe_flag_controls_null_matching() {
    let env = ExecEnv::new();
    let mut seq = 20;
    let build = [(None, Some("b"))];
    let probe = [(None, Some("x"))];

    let with_null_safe = run_join(&env, JoinOp::Inner, &probe, &build, true, false, &mut seq);
    assert_eq!(with_null_safe.len(), 1, "NULL <=> NULL must match");

    let without = run_join(&env, JoinOp::Inner, &probe, &build, false, false, &mut seq);
    assert!(without.is_empty(), "NULL = NULL must not match");
}

#[test]
fn right_anti_resumes_across_output_batches() {
    let env = ExecEnv::new();
    let build: Vec<(Option<i32>, Option<&str>)> =
        vec![(Some(1), Some("a")), (Some(2), Some("b")), (Some(3), Some("c"))];
    let probe: Vec<(Option<i32>, Option<&str>)> = vec![(Some(2), Some("x"))];

    let mut options = QueryOptions::default();
    // A one-row output batch forces the unmatched-build replay to resume
    // across many pulls.
    options.batch_size = Some(1);
    let params = exec_params(
        UniqueId::new(101, 1),
        UniqueId::new(201, 1),
        join_plan(JoinOp::RightAnti, 1, 3, false, false),
        scan_ranges_for_join(&probe, &build),
        join_slots(),
        Some(DataSinkDesc::Result),
        options,
    );
    let ctx = gneiss::submit_exec_plan_fragment(&env, &params).expect("submit");
    ctx.wait_finish(WAIT).expect("finish");

    let chunks = ctx.result_buffer().chunks();
    assert!(
        chunks.len() >= 2,
        "emission must span multiple one-row batches, got {}",
        chunks.len()
    );
    let rows: Vec<Row> = chunks.iter().flat_map(|c| chunk_rows(c, &[3, 4])).collect();
    let expected = vec![
        vec![Cell::Int(1), Cell::Str("a".into())],
        vec![Cell::Int(3), Cell::Str("c".into())],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn every_variant_matches_reference_on_random_tables() {
    let env = ExecEnv::new();
    let mut rng = StdRng::seed_from_u64(0x9eb1);
    let mut seq = 1000;
    let payloads = ["p", "q", "r", "s"];

    for round in 0..4 {
        // Key cardinality shrinks over rounds to force heavy chaining; null
        // density rises to cover all-null corners.
        let cardinality = [7, 3, 2, 1][round];
        let null_pct = [0.1, 0.3, 0.5, 1.0][round];
        let gen_rows = |rng: &mut StdRng, n: usize| -> Vec<(Option<i32>, Option<&str>)> {
            (0..n)
                .map(|_| {
                    let key = if rng.gen_bool(null_pct) {
                        None
                    } else {
                        Some(rng.gen_range(0..cardinality))
                    };
                    (key, Some(payloads[rng.gen_range(0..payloads.len())]))
                })
                .collect()
        };
        let probe = gen_rows(&mut rng, 40);
        let build = gen_rows(&mut rng, 25);

        for join_op in ALL_JOIN_OPS {
            for null_safe in [false, true] {
                let rows = run_join(&env, join_op, &probe, &build, null_safe, false, &mut seq);
                let expected = reference_join(join_op, &probe, &build, null_safe);
                assert_eq!(
                    sorted(rows),
                    sorted(expected),
                    "round={round} join_op={join_op:?} null_safe={null_safe}"
                );
            }
        }
    }
}

#[test]
fn runtime_filter_pushdown_is_result_transparent() {
    let env = ExecEnv::new();
    let mut rng = StdRng::seed_from_u64(0x51ab);
    let mut seq = 2000;
    let probe: Vec<(Option<i32>, Option<&str>)> = (0..60)
        .map(|_| {
            (
                (!rng.gen_bool(0.15)).then(|| rng.gen_range(0..10)),
                Some("pp"),
            )
        })
        .collect();
    let build: Vec<(Option<i32>, Option<&str>)> = (0..8)
        .map(|_| ((!rng.gen_bool(0.15)).then(|| rng.gen_range(0..10)), Some("bb")))
        .collect();

    for join_op in ALL_JOIN_OPS {
        let plain = run_join(&env, join_op, &probe, &build, false, false, &mut seq);
        let pushed = run_join(&env, join_op, &probe, &build, false, true, &mut seq);
        assert_eq!(
            sorted(plain),
            sorted(pushed),
            "pushdown changed {join_op:?} results"
        );
    }
}

#[test]
fn other_join_conjuncts_filter_pairs_not_rows() {
    let env = ExecEnv::new();
    let build = [(Some(1), Some("bb")), (Some(1), Some("aa"))];
    let probe = [(Some(1), Some("ab")), (Some(2), Some("zz"))];

    // LEFT OUTER with pair predicate probe_v < build_v: probe row 0 keeps
    // only the ("ab" < "bb") pair; probe row 1 pads with NULLs.
    let plan = PlanNode::HashJoin {
        node_id: 2,
        join_op: JoinOp::LeftOuter,
        eq_join_conjuncts: vec![EqJoinCondition {
            left: Expr::ColumnRef(SlotId::new(1)),
            right: Expr::ColumnRef(SlotId::new(3)),
            null_safe: false,
        }],
        other_join_conjuncts: vec![Expr::cmp(
            CmpOp::Lt,
            Expr::ColumnRef(SlotId::new(2)),
            Expr::ColumnRef(SlotId::new(4)),
        )],
        conjuncts: vec![],
        is_push_down: false,
        children: vec![scan_node(0, vec![1, 2]), scan_node(1, vec![3, 4])],
    };
    let params = exec_params(
        UniqueId::new(102, 1),
        UniqueId::new(202, 1),
        plan,
        scan_ranges_for_join(&probe, &build),
        join_slots(),
        Some(DataSinkDesc::Result),
        QueryOptions::default(),
    );
    let rows = run_fragment(&env, &params, &[1, 2, 3, 4]).expect("join");
    let expected = vec![
        vec![
            Cell::Int(1),
            Cell::Str("ab".into()),
            Cell::Int(1),
            Cell::Str("bb".into()),
        ],
        vec![Cell::Int(2), Cell::Str("zz".into()), Cell::Null, Cell::Null],
    ];
    assert_eq!(sorted(rows), sorted(expected));
}

#[test]
fn empty_build_short_circuits_inner_join() {
    let env = ExecEnv::new();
    let mut seq = 3000;
    let probe = [(Some(1), Some("x")); 1];
    let rows = run_join(&env, JoinOp::Inner, &probe, &[], false, false, &mut seq);
    assert!(rows.is_empty());
}

#[test]
fn build_mem_limit_exceeded_fails_the_fragment() {
    let env = ExecEnv::new();
    let build: Vec<(Option<i32>, Option<&str>)> = (0..2000)
        .map(|i| (Some(i), Some("some-reasonably-long-payload-string")))
        .collect();
    let probe = vec![(Some(1), Some("x"))];

    let mut options = QueryOptions::default();
    options.mem_limit = 1024;
    let params = exec_params(
        UniqueId::new(103, 1),
        UniqueId::new(203, 1),
        join_plan(JoinOp::Inner, 1, 3, false, false),
        scan_ranges_for_join(&probe, &build),
        join_slots(),
        Some(DataSinkDesc::Result),
        options,
    );
    let ctx = gneiss::submit_exec_plan_fragment(&env, &params).expect("submit");
    let err = ctx.wait_finish(WAIT).expect_err("must exceed the limit");
    assert_eq!(err.code, StatusCode::MemLimitExceeded, "got {err}");
}

#[test]
fn cancellation_mid_probe_drains_within_a_batch() {
    let env = ExecEnv::new();
    let query_id = UniqueId::new(104, 1);
    let finst = UniqueId::new(204, 1);

    // Probe side arrives over an exchange the test feeds by hand, so the
    // join is mid-probe, with more input possible, when the flag flips.
    let plan = PlanNode::HashJoin {
        node_id: 2,
        join_op: JoinOp::Inner,
        eq_join_conjuncts: vec![EqJoinCondition {
            left: Expr::ColumnRef(SlotId::new(1)),
            right: Expr::ColumnRef(SlotId::new(3)),
            null_safe: false,
        }],
        other_join_conjuncts: vec![],
        conjuncts: vec![],
        is_push_down: false,
        children: vec![
            PlanNode::Exchange {
                node_id: 10,
                slot_ids: vec![SlotId::new(1), SlotId::new(2)],
            },
            scan_node(1, vec![3, 4]),
        ],
    };
    let mut ranges = HashMap::new();
    ranges.insert(
        1,
        vec![ScanRangeParams {
            range_id: 1,
            chunks: vec![int_utf8_chunk(3, 4, &[(Some(7), Some("b"))])],
        }],
    );
    let mut params = exec_params(
        query_id,
        finst,
        plan,
        ranges,
        join_slots(),
        Some(DataSinkDesc::Result),
        QueryOptions::default(),
    );
    params.params.per_exch_num_senders.insert(10, 1);

    let ctx = gneiss::submit_exec_plan_fragment(&env, &params).expect("submit");

    // Feed a few probe chunks, never eos.
    let mut meta_cache = None;
    for seq in 0..3i64 {
        let chunk = int_utf8_chunk(1, 2, &[(Some(7), Some("x")), (Some(8), Some("y"))]);
        let (frame, attachment) =
            transmit_frame(finst, 10, 0, seq, false, Some(&chunk), &mut meta_cache);
        env.exchange_registry()
            .deliver(&frame, &attachment)
            .expect("deliver probe chunk");
    }

    // Wait until the join demonstrably emitted rows mid-probe.
    let deadline = Instant::now() + WAIT;
    while ctx.result_buffer().total_rows() == 0 {
        assert!(Instant::now() < deadline, "join produced no rows");
        std::thread::sleep(Duration::from_millis(5));
    }

    env.cancel_query(query_id);
    let err = ctx.wait_finish(WAIT).expect_err("must cancel");
    assert!(err.is_cancelled(), "got {err}");
}
