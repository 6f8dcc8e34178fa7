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
//! Exchange sender properties: ordering, in-flight discipline, broadcast
//! accounting, compression threshold and shuffle determinism.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use arrow::array::{ArrayRef, Int64Array};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::*;
use gneiss::common::ids::SlotId;
use gneiss::exec::operators::exchange_sink::{
    build_channel_row_indexes, compute_crc32_row_hashes, compute_fnv_row_hashes,
};
use gneiss::plan::{
    DataSinkDesc, OutputPartition, PartitionType, PlanFragmentDestination, QueryOptions,
    ScanRangeParams, StreamSink,
};
use gneiss::runtime::exchange::ExchangeRegistry;
use gneiss::runtime::profile::RuntimeProfile;
use gneiss::runtime::transmit::{
    CompressType, ExchangeTransport, RpcHandle, TransmitChunkParams,
};
use gneiss::{ExecEnv, UniqueId};

/// Frames flush often so in-flight and ordering behavior is exercised with
/// small inputs.
fn init_config() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        gneiss::gneiss_config::init_from_str(
            r#"
[runtime]
max_transmit_batched_bytes = 512
"#,
        )
        .expect("test config");
    });
}

#[derive(Clone)]
struct RecordedFrame {
    address: String,
    params: TransmitChunkParams,
    attachment: Bytes,
}

/// Delivers like the loopback transport but keeps a copy of every frame
/// for wire-level assertions.
struct RecordingTransport {
    registry: Arc<ExchangeRegistry>,
    frames: Mutex<Vec<RecordedFrame>>,
}

impl RecordingTransport {
    fn new(registry: Arc<ExchangeRegistry>) -> Self {
        Self {
            registry,
            frames: Mutex::new(Vec::new()),
        }
    }

    fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().unwrap().clone()
    }
}

impl ExchangeTransport for RecordingTransport {
    fn transmit_chunk(
        &self,
        address: &str,
        params: TransmitChunkParams,
        attachment: Bytes,
    ) -> RpcHandle {
        self.frames.lock().unwrap().push(RecordedFrame {
            address: address.to_string(),
            params: params.clone(),
            attachment: attachment.clone(),
        });
        let result = self
            .registry
            .deliver(&params, &attachment)
            .map_err(|e| gneiss::Status::rpc_error(e.to_string()));
        RpcHandle::completed(result)
    }
}

struct PendingRpc {
    params: TransmitChunkParams,
    attachment: Bytes,
    handle: RpcHandle,
    channel: (i64, i64, i32),
}

/// Stalls the receiver: frames queue until the test releases them, and any
/// second RPC issued on a channel before the first completed is recorded as
/// a violation.
struct GatedTransport {
    registry: Arc<ExchangeRegistry>,
    pending: Mutex<Vec<PendingRpc>>,
    outstanding: Mutex<HashMap<(i64, i64, i32), usize>>,
    violated: AtomicBool,
    issued: Mutex<usize>,
}

impl GatedTransport {
    fn new(registry: Arc<ExchangeRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(Vec::new()),
            outstanding: Mutex::new(HashMap::new()),
            violated: AtomicBool::new(false),
            issued: Mutex::new(0),
        }
    }

    fn release_one(&self) -> bool {
        let Some(rpc) = ({
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        }) else {
            return false;
        };
        let result = self
            .registry
            .deliver(&rpc.params, &rpc.attachment)
            .map_err(|e| gneiss::Status::rpc_error(e.to_string()));
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            *outstanding.entry(rpc.channel).or_insert(1) -= 1;
        }
        rpc.handle.complete(result);
        true
    }

    fn issued(&self) -> usize {
        *self.issued.lock().unwrap()
    }
}

impl ExchangeTransport for GatedTransport {
    fn transmit_chunk(
        &self,
        _address: &str,
        params: TransmitChunkParams,
        attachment: Bytes,
    ) -> RpcHandle {
        let finst = params.finst_id.unwrap_or_default();
        let channel = (finst.hi, finst.lo, params.sender_id);
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            let slot = outstanding.entry(channel).or_insert(0);
            if *slot > 0 {
                self.violated.store(true, Ordering::Release);
            }
            *slot += 1;
        }
        *self.issued.lock().unwrap() += 1;
        let handle = RpcHandle::pending();
        self.pending.lock().unwrap().push(PendingRpc {
            params,
            attachment,
            handle: handle.clone(),
            channel,
        });
        handle
    }
}

fn sender_fragment(
    query_lo: i64,
    rows: &[(Option<i32>, Option<&str>)],
    part_type: PartitionType,
    partition_exprs: Vec<gneiss::exec::expr::Expr>,
    destinations: Vec<PlanFragmentDestination>,
) -> gneiss::plan::ExecPlanFragmentParams {
    let mut ranges = HashMap::new();
    ranges.insert(
        0,
        vec![ScanRangeParams {
            range_id: 0,
            chunks: rows
                .chunks(100)
                .map(|part| int_utf8_chunk(1, 2, part))
                .collect(),
        }],
    );
    let mut params = exec_params(
        UniqueId::new(500, query_lo),
        UniqueId::new(600, query_lo),
        scan_node(0, vec![1, 2]),
        ranges,
        int_utf8_slots(1, 2, "s"),
        Some(DataSinkDesc::Stream(StreamSink {
            dest_node_id: 77,
            output_partition: OutputPartition {
                part_type,
                partition_exprs,
                partition_infos: vec![],
            },
            ignore_not_found: true,
        })),
        QueryOptions::default(),
    );
    params.params.destinations = destinations;
    params
}

fn receiver_fragment(
    query_lo: i64,
    finst: UniqueId,
    num_senders: i32,
) -> gneiss::plan::ExecPlanFragmentParams {
    let plan = gneiss::plan::PlanNode::Exchange {
        node_id: 77,
        slot_ids: vec![SlotId::new(1), SlotId::new(2)],
    };
    let mut params = exec_params(
        UniqueId::new(500, query_lo),
        finst,
        plan,
        HashMap::new(),
        int_utf8_slots(1, 2, "r"),
        Some(DataSinkDesc::Result),
        QueryOptions::default(),
    );
    params.params.per_exch_num_senders.insert(77, num_senders);
    params
}

fn test_rows(n: usize) -> Vec<(Option<i32>, Option<String>)> {
    (0..n)
        .map(|i| (Some(i as i32), Some(format!("payload-{i:04}"))))
        .collect()
}

fn as_refs(rows: &[(Option<i32>, Option<String>)]) -> Vec<(Option<i32>, Option<&str>)> {
    rows.iter().map(|(k, v)| (*k, v.as_deref())).collect()
}

#[test]
fn per_channel_sequences_are_gapless_with_single_eos() {
    init_config();
    let registry = Arc::new(ExchangeRegistry::new());
    let recording = Arc::new(RecordingTransport::new(Arc::clone(&registry)));
    let env = ExecEnv::with_transport(Arc::clone(&registry), recording.clone());

    let dest = UniqueId::new(700, 1);
    let receiver = receiver_fragment(1, dest, 1);
    let recv_ctx = gneiss::submit_exec_plan_fragment(&env, &receiver).expect("receiver");

    let rows = test_rows(1500);
    let sender = sender_fragment(
        1,
        &as_refs(&rows),
        PartitionType::Unpartitioned,
        vec![],
        vec![PlanFragmentDestination {
            fragment_instance_id: dest,
            address: "local".to_string(),
        }],
    );
    let send_ctx = gneiss::submit_exec_plan_fragment(&env, &sender).expect("sender");
    send_ctx.wait_finish(WAIT).expect("sender finish");
    recv_ctx.wait_finish(WAIT).expect("receiver finish");

    let frames = recording.frames();
    assert!(frames.len() >= 2, "expected several frames");
    let sequences: Vec<i64> = frames.iter().map(|f| f.params.sequence).collect();
    let expected: Vec<i64> = (0..frames.len() as i64).collect();
    assert_eq!(sequences, expected, "strictly increasing, no gaps");
    let eos_flags: Vec<bool> = frames.iter().map(|f| f.params.eos).collect();
    assert_eq!(eos_flags.iter().filter(|e| **e).count(), 1);
    assert!(eos_flags.last().copied().unwrap_or(false), "eos is last");

    assert_eq!(recv_ctx.result_buffer().total_rows(), rows.len());
}

#[test]
fn at_most_one_rpc_in_flight_per_channel_under_stall() {
    init_config();
    let registry = Arc::new(ExchangeRegistry::new());
    let gated = Arc::new(GatedTransport::new(Arc::clone(&registry)));
    let env = ExecEnv::with_transport(Arc::clone(&registry), gated.clone());

    let dest = UniqueId::new(700, 2);
    let receiver = receiver_fragment(2, dest, 1);
    let recv_ctx = gneiss::submit_exec_plan_fragment(&env, &receiver).expect("receiver");

    let rows = test_rows(3000);
    let sender = sender_fragment(
        2,
        &as_refs(&rows),
        PartitionType::Unpartitioned,
        vec![],
        vec![PlanFragmentDestination {
            fragment_instance_id: dest,
            address: "local".to_string(),
        }],
    );
    let send_ctx = gneiss::submit_exec_plan_fragment(&env, &sender).expect("sender");

    // Drip-feed the stalled receiver; the sender must never stack RPCs.
    let deadline = Instant::now() + WAIT;
    while !send_ctx.is_done() {
        assert!(Instant::now() < deadline, "sender wedged under stall");
        if !gated.release_one() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    while gated.release_one() {}
    send_ctx.wait_finish(WAIT).expect("sender finish");
    recv_ctx.wait_finish(WAIT).expect("receiver finish");

    assert!(gated.issued() >= 2, "stall test needs several RPCs");
    assert!(
        !gated.violated.load(Ordering::Acquire),
        "second RPC issued before the previous completed"
    );
    assert_eq!(recv_ctx.result_buffer().total_rows(), rows.len());
}

fn find_counter(profile: &RuntimeProfile, name: &str) -> i64 {
    if let Some(counter) = profile.counter(name) {
        return counter.value();
    }
    profile
        .children()
        .iter()
        .map(|child| find_counter(child, name))
        .find(|v| *v != 0)
        .unwrap_or(0)
}

#[test]
fn broadcast_accounts_bytes_per_receiver() {
    init_config();
    let registry = Arc::new(ExchangeRegistry::new());
    let recording = Arc::new(RecordingTransport::new(Arc::clone(&registry)));
    let env = ExecEnv::with_transport(Arc::clone(&registry), recording.clone());

    let dests: Vec<UniqueId> = (0..4).map(|i| UniqueId::new(700, 10 + i)).collect();
    let mut recv_ctxs = Vec::new();
    for (i, dest) in dests.iter().enumerate() {
        let receiver = receiver_fragment(10 + i as i64, *dest, 1);
        recv_ctxs.push(gneiss::submit_exec_plan_fragment(&env, &receiver).expect("receiver"));
    }

    let rows = test_rows(1000);
    let sender = sender_fragment(
        3,
        &as_refs(&rows),
        PartitionType::Unpartitioned,
        vec![],
        dests
            .iter()
            .map(|dest| PlanFragmentDestination {
                fragment_instance_id: *dest,
                address: "local".to_string(),
            })
            .collect(),
    );
    let send_ctx = gneiss::submit_exec_plan_fragment(&env, &sender).expect("sender");
    send_ctx.wait_finish(WAIT).expect("sender finish");
    for ctx in &recv_ctxs {
        ctx.wait_finish(WAIT).expect("receiver finish");
        assert_eq!(ctx.result_buffer().total_rows(), rows.len());
    }

    // Broadcast serializes once and accounts bytes × receiver count.
    let frames = recording.frames();
    let per_dest_payload: i64 = frames
        .iter()
        .filter(|f| f.params.finst_id.map(|id| id.lo) == Some(dests[0].lo))
        .flat_map(|f| f.params.chunks.iter())
        .map(|c| c.data_size)
        .sum();
    let uncompressed_per_dest: i64 = frames
        .iter()
        .filter(|f| f.params.finst_id.map(|id| id.lo) == Some(dests[0].lo))
        .flat_map(|f| f.params.chunks.iter())
        .map(|c| c.uncompressed_size)
        .sum();
    assert!(per_dest_payload > 0);

    let bytes_sent = find_counter(send_ctx.profile(), "BytesSent");
    let uncompressed = find_counter(send_ctx.profile(), "UncompressedBytes");
    assert_eq!(bytes_sent, per_dest_payload * 4);
    assert_eq!(uncompressed, uncompressed_per_dest * 4);

    // Every receiver observed identical payload bytes.
    for dest in &dests[1..] {
        let payload: Vec<u8> = frames
            .iter()
            .filter(|f| f.params.finst_id.map(|id| id.lo) == Some(dest.lo))
            .flat_map(|f| f.attachment.to_vec())
            .collect();
        let first: Vec<u8> = frames
            .iter()
            .filter(|f| f.params.finst_id.map(|id| id.lo) == Some(dests[0].lo))
            .flat_map(|f| f.attachment.to_vec())
            .collect();
        assert_eq!(payload, first);
    }
}

#[test]
fn compression_threshold_decides_the_wire_encoding() {
    init_config();
    let registry = Arc::new(ExchangeRegistry::new());
    let recording = Arc::new(RecordingTransport::new(Arc::clone(&registry)));
    let env = ExecEnv::with_transport(Arc::clone(&registry), recording.clone());

    // Constant payloads compress far past the ratio threshold.
    let dest = UniqueId::new(700, 20);
    let recv_ctx =
        gneiss::submit_exec_plan_fragment(&env, &receiver_fragment(20, dest, 1)).expect("recv");
    let compressible: Vec<(Option<i32>, Option<String>)> = (0..2000)
        .map(|i| (Some(i as i32 % 3), Some("constant-constant-constant".to_string())))
        .collect();
    let sender = sender_fragment(
        20,
        &as_refs(&compressible),
        PartitionType::Unpartitioned,
        vec![],
        vec![PlanFragmentDestination {
            fragment_instance_id: dest,
            address: "local".to_string(),
        }],
    );
    gneiss::submit_exec_plan_fragment(&env, &sender)
        .expect("sender")
        .wait_finish(WAIT)
        .expect("finish");
    recv_ctx.wait_finish(WAIT).expect("recv finish");

    let data_frames: Vec<_> = recording
        .frames()
        .into_iter()
        .flat_map(|f| f.params.chunks)
        .collect();
    assert!(!data_frames.is_empty());
    assert!(
        data_frames
            .iter()
            .all(|c| c.compress_type() == CompressType::Lz4),
        "compressible chunks must ship compressed"
    );
    assert!(data_frames.iter().all(|c| c.data_size < c.uncompressed_size));

    // Pre-hashed noise stays below the ratio threshold and ships raw.
    let registry2 = Arc::new(ExchangeRegistry::new());
    let recording2 = Arc::new(RecordingTransport::new(Arc::clone(&registry2)));
    let env2 = ExecEnv::with_transport(Arc::clone(&registry2), recording2.clone());
    let dest2 = UniqueId::new(700, 21);
    let recv_ctx2 =
        gneiss::submit_exec_plan_fragment(&env2, &receiver_fragment(21, dest2, 1)).expect("recv");
    let mut rng = StdRng::seed_from_u64(0xc0de);
    let incompressible: Vec<(Option<i32>, Option<String>)> = (0..2000)
        .map(|i| {
            let payload: String = (0..32)
                .map(|_| char::from(rng.sample(rand::distributions::Alphanumeric)))
                .collect();
            (Some(i as i32), Some(payload))
        })
        .collect();
    let sender2 = sender_fragment(
        21,
        &as_refs(&incompressible),
        PartitionType::Unpartitioned,
        vec![],
        vec![PlanFragmentDestination {
            fragment_instance_id: dest2,
            address: "local".to_string(),
        }],
    );
    gneiss::submit_exec_plan_fragment(&env2, &sender2)
        .expect("sender")
        .wait_finish(WAIT)
        .expect("finish");
    recv_ctx2.wait_finish(WAIT).expect("recv finish");

    let raw_frames: Vec<_> = recording2
        .frames()
        .into_iter()
        .flat_map(|f| f.params.chunks)
        .collect();
    assert!(!raw_frames.is_empty());
    assert!(
        raw_frames
            .iter()
            .any(|c| c.compress_type() == CompressType::None),
        "low-ratio chunks must ship uncompressed"
    );
    for chunk in raw_frames
        .iter()
        .filter(|c| c.compress_type() == CompressType::None)
    {
        assert_eq!(chunk.data_size, chunk.uncompressed_size);
    }
}

#[test]
fn hash_shuffle_permutation_is_deterministic() {
    init_config();
    let values: ArrayRef = Arc::new(Int64Array::from(
        (0..997i64).map(|i| i * 31 % 101).collect::<Vec<_>>(),
    ));
    let arrays = vec![values];

    let fnv_a = compute_fnv_row_hashes(&arrays, 997).expect("fnv");
    let fnv_b = compute_fnv_row_hashes(&arrays, 997).expect("fnv");
    assert_eq!(fnv_a, fnv_b);

    let crc_a = compute_crc32_row_hashes(&arrays, 997).expect("crc");
    let crc_b = compute_crc32_row_hashes(&arrays, 997).expect("crc");
    assert_eq!(crc_a, crc_b);

    let channels_a: Vec<usize> = fnv_a.iter().map(|h| *h as usize % 5).collect();
    let (starts_a, rows_a) = build_channel_row_indexes(&channels_a, 5);
    let (starts_b, rows_b) = build_channel_row_indexes(&channels_a, 5);
    assert_eq!(starts_a, starts_b);
    assert_eq!(rows_a, rows_b, "row_indexes permutation must be stable");
}

#[test]
fn hash_partition_spreads_rows_across_receivers() {
    init_config();
    let registry = Arc::new(ExchangeRegistry::new());
    let transport = Arc::new(RecordingTransport::new(Arc::clone(&registry)));
    let env = ExecEnv::with_transport(Arc::clone(&registry), transport);

    let dests: Vec<UniqueId> = (0..3).map(|i| UniqueId::new(700, 30 + i)).collect();
    let mut recv_ctxs = Vec::new();
    for (i, dest) in dests.iter().enumerate() {
        let receiver = receiver_fragment(30 + i as i64, *dest, 1);
        recv_ctxs.push(gneiss::submit_exec_plan_fragment(&env, &receiver).expect("receiver"));
    }

    let rows = test_rows(900);
    let sender = sender_fragment(
        31,
        &as_refs(&rows),
        PartitionType::HashPartitioned,
        vec![gneiss::exec::expr::Expr::ColumnRef(SlotId::new(1))],
        dests
            .iter()
            .map(|dest| PlanFragmentDestination {
                fragment_instance_id: *dest,
                address: "local".to_string(),
            })
            .collect(),
    );
    gneiss::submit_exec_plan_fragment(&env, &sender)
        .expect("sender")
        .wait_finish(WAIT)
        .expect("sender finish");

    let mut all_rows = Vec::new();
    let mut nonempty = 0;
    for ctx in &recv_ctxs {
        ctx.wait_finish(WAIT).expect("receiver finish");
        let rows = result_rows(ctx, &[1, 2]);
        if !rows.is_empty() {
            nonempty += 1;
        }
        all_rows.extend(rows);
    }
    assert!(nonempty >= 2, "hash shuffle should hit several receivers");

    let mut expected = Vec::new();
    for (k, v) in &rows {
        expected.push(vec![
            Cell::Int(k.unwrap() as i64),
            Cell::Str(v.clone().unwrap()),
        ]);
    }
    assert_eq!(sorted(all_rows), sorted(expected));
}
