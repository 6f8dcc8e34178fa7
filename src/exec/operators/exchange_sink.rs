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
//! Exchange sink: partitions, serializes, compresses and ships chunks to
//! peer fragment instances.
//!
//! One channel exists per destination fragment instance; destinations that
//! share an instance id share the channel. A channel accumulates rows until
//! the serialized request exceeds the transmit threshold, keeps at most one
//! RPC in flight, and tags frames with a per-channel monotone sequence.
//! Close is two-phase: `set_finishing` sends every channel's final `eos`
//! frame without waiting, `close` joins the in-flight RPCs so the channels
//! drain in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray, TimestampMicrosecondArray, UInt32Array,
};
use arrow::compute::take;
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::common::config;
use crate::common::ids::PlanNodeId;
use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::exec::chunk::Chunk;
use crate::exec::expr::Expr;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::gneiss_logging::warn;
use crate::plan::{
    PartRangeKey, PartitionInfo, PartitionType, PlanFragmentDestination, StreamSink,
};
use crate::runtime::compress::BlockCompression;
use crate::runtime::exchange::encode_chunk;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_state::RuntimeState;
use crate::runtime::transmit::{
    construct_attachment, ChunkPb, CompressType, ExchangeTransport, PUniqueId, RpcHandle,
    TransmitChunkParams,
};

const FNV_SEED: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x100_0000_01b3;

/// Bucket-shuffle hash ids must be unreachable when the planner says so.
const UNREACHABLE_INSTANCE_LO: i64 = -1;

fn fnv_hash_bytes(bytes: &[u8], mut hash: u64) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn zlib_crc32(bytes: &[u8], init: u32) -> u32 {
    let mut crc = !init;
    for byte in bytes {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xedb8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Little-endian value bytes for partition hashing; `None` for null rows.
fn partition_value_bytes(array: &ArrayRef, row: usize) -> Result<Option<Vec<u8>>> {
    if array.is_null(row) {
        return Ok(None);
    }
    let bytes = match array.data_type() {
        DataType::Boolean => {
            let arr = array.as_any().downcast_ref::<BooleanArray>().unwrap();
            vec![arr.value(row) as u8]
        }
        DataType::Int8 => {
            let arr = array.as_any().downcast_ref::<Int8Array>().unwrap();
            arr.value(row).to_le_bytes().to_vec()
        }
        DataType::Int16 => {
            let arr = array.as_any().downcast_ref::<Int16Array>().unwrap();
            arr.value(row).to_le_bytes().to_vec()
        }
        DataType::Int32 => {
            let arr = array.as_any().downcast_ref::<Int32Array>().unwrap();
            arr.value(row).to_le_bytes().to_vec()
        }
        DataType::Int64 => {
            let arr = array.as_any().downcast_ref::<Int64Array>().unwrap();
            arr.value(row).to_le_bytes().to_vec()
        }
        DataType::Date32 => {
            let arr = array.as_any().downcast_ref::<Date32Array>().unwrap();
            arr.value(row).to_le_bytes().to_vec()
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let arr = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .unwrap();
            arr.value(row).to_le_bytes().to_vec()
        }
        DataType::Float32 => {
            let arr = array.as_any().downcast_ref::<Float32Array>().unwrap();
            arr.value(row).to_bits().to_le_bytes().to_vec()
        }
        DataType::Float64 => {
            let arr = array.as_any().downcast_ref::<Float64Array>().unwrap();
            arr.value(row).to_bits().to_le_bytes().to_vec()
        }
        DataType::Utf8 => {
            let arr = array.as_any().downcast_ref::<StringArray>().unwrap();
            arr.value(row).as_bytes().to_vec()
        }
        other => {
            return Err(Status::unimplemented(format!(
                "partition hash over {other:?}"
            )))
        }
    };
    Ok(Some(bytes))
}

/// FNV over partition columns; the seed chains across columns so a row's
/// hash mixes every key.
pub fn compute_fnv_row_hashes(arrays: &[ArrayRef], num_rows: usize) -> Result<Vec<u64>> {
    let mut hashes = vec![FNV_SEED; num_rows];
    for array in arrays {
        for (row, hash) in hashes.iter_mut().enumerate().take(num_rows) {
            match partition_value_bytes(array, row)? {
                Some(bytes) => *hash = fnv_hash_bytes(&bytes, *hash),
                None => *hash = hash.wrapping_mul(FNV_PRIME),
            }
        }
    }
    Ok(hashes)
}

/// zlib CRC32 chained across partition columns; must stay aligned with the
/// storage-layer bucketing function.
pub fn compute_crc32_row_hashes(arrays: &[ArrayRef], num_rows: usize) -> Result<Vec<u32>> {
    let mut hashes = vec![0u32; num_rows];
    for array in arrays {
        for (row, hash) in hashes.iter_mut().enumerate().take(num_rows) {
            match partition_value_bytes(array, row)? {
                Some(bytes) => *hash = zlib_crc32(&bytes, *hash),
                None => {
                    // Nulls hash as the integer 0.
                    *hash = zlib_crc32(&0i32.to_le_bytes(), *hash);
                }
            }
        }
    }
    Ok(hashes)
}

/// Group rows by destination channel: per-channel prefix-sum start points
/// plus one permutation of row indexes, so each channel gets a single
/// selective append.
pub fn build_channel_row_indexes(
    channel_ids: &[usize],
    num_channels: usize,
) -> (Vec<usize>, Vec<u32>) {
    let num_rows = channel_ids.len();
    let mut start_points = vec![0usize; num_channels + 1];
    for channel in channel_ids {
        start_points[*channel] += 1;
    }
    for i in 1..=num_channels {
        start_points[i] += start_points[i - 1];
    }
    let mut row_indexes = vec![0u32; num_rows];
    for row in (0..num_rows).rev() {
        let channel = channel_ids[row];
        start_points[channel] -= 1;
        row_indexes[start_points[channel]] = row as u32;
    }
    (start_points, row_indexes)
}

struct SenderCounters {
    bytes_sent: CounterRef,
    uncompressed_bytes: CounterRef,
    ignore_rows: CounterRef,
    serialize_batch_timer: CounterRef,
    compress_timer: CounterRef,
    send_request_timer: CounterRef,
    wait_response_timer: CounterRef,
    shuffle_dispatch_timer: CounterRef,
    shuffle_hash_timer: CounterRef,
    overall_throughput: CounterRef,
    total_time: CounterRef,
}

impl SenderCounters {
    fn new(profile: &RuntimeProfile) -> Self {
        Self {
            bytes_sent: profile.add_counter("BytesSent", CounterUnit::Bytes),
            uncompressed_bytes: profile.add_counter("UncompressedBytes", CounterUnit::Bytes),
            ignore_rows: profile.add_counter("IgnoreRows", CounterUnit::Unit),
            serialize_batch_timer: profile.add_timer("SerializeBatchTime"),
            compress_timer: profile.add_timer("CompressTime"),
            send_request_timer: profile.add_timer("SendRequestTime"),
            wait_response_timer: profile.add_timer("WaitResponseTime"),
            shuffle_dispatch_timer: profile.add_timer("ShuffleDispatchTime"),
            shuffle_hash_timer: profile.add_timer("ShuffleHashTime"),
            overall_throughput: profile.add_counter("OverallThroughput", CounterUnit::Bytes),
            total_time: profile.add_timer("TotalTime"),
        }
    }
}

struct SenderContext {
    transport: Arc<dyn ExchangeTransport>,
    codec: Option<BlockCompression>,
    compress_ratio_threshold: f64,
    request_bytes_threshold: usize,
    chunk_capacity: usize,
    sender_id: i32,
    be_number: i32,
    dest_node_id: PlanNodeId,
    rpc_timeout: Duration,
    counters: SenderCounters,
}

impl SenderContext {
    /// Serialize one chunk into a frame chunk, compressing when the ratio
    /// clears the threshold. `sent_meta` implements meta-once per channel.
    fn serialize_chunk(
        &self,
        chunk: &Chunk,
        sent_meta: &mut bool,
        num_receivers: usize,
    ) -> Result<ChunkPb> {
        let (meta, payload) = {
            let _t = ScopedTimer::new(&self.counters.serialize_batch_timer);
            encode_chunk(chunk)?
        };
        let uncompressed_size = payload.len();

        let mut pb = ChunkPb {
            slot_id_map: chunk.slot_ids().iter().map(|s| s.raw()).collect(),
            meta: Vec::new(),
            uncompressed_size: uncompressed_size as i64,
            compress_type: CompressType::None as i32,
            data_size: 0,
            data: payload,
        };
        if !*sent_meta {
            pb.meta = meta;
            *sent_meta = true;
        }

        if let Some(codec) = self.codec {
            if codec.exceed_max_input_size(uncompressed_size) {
                return Err(Status::internal(format!(
                    "chunk of {} bytes exceeds compression input limit {}",
                    uncompressed_size,
                    codec.max_input_size()
                )));
            }
            if uncompressed_size > 0 {
                let _t = ScopedTimer::new(&self.counters.compress_timer);
                let compressed = codec.compress(&pb.data)?;
                let ratio = uncompressed_size as f64 / compressed.len().max(1) as f64;
                if ratio > self.compress_ratio_threshold {
                    pb.data = compressed;
                    pb.compress_type = codec.compress_type() as i32;
                }
            }
        }

        self.counters
            .bytes_sent
            .add((pb.data.len() * num_receivers) as i64);
        self.counters
            .uncompressed_bytes
            .add((uncompressed_size * num_receivers) as i64);
        Ok(pb)
    }
}

/// Per-destination sender state; not thread-safe, owned by one driver.
struct Channel {
    fragment_instance_id: UniqueId,
    address: String,
    accum: Vec<Chunk>,
    accum_rows: usize,
    sent_meta: bool,
    request_chunks: Vec<ChunkPb>,
    current_request_bytes: usize,
    sequence: i64,
    in_flight: Option<RpcHandle>,
    eos_requested: bool,
    eos_sent: bool,
    need_close: bool,
}

impl Channel {
    fn new(fragment_instance_id: UniqueId, address: String) -> Self {
        Self {
            fragment_instance_id,
            address,
            accum: Vec::new(),
            accum_rows: 0,
            sent_meta: false,
            request_chunks: Vec::new(),
            current_request_bytes: 0,
            sequence: 0,
            in_flight: None,
            eos_requested: false,
            eos_sent: false,
            need_close: false,
        }
    }

    fn is_unreachable(&self) -> bool {
        self.fragment_instance_id.lo == UNREACHABLE_INSTANCE_LO
    }

    fn rpc_busy(&self) -> bool {
        self.in_flight.as_ref().map(|h| !h.is_done()).unwrap_or(false)
    }

    /// A frame is due when enough bytes accumulated or eos must go out.
    fn wants_send(&self, ctx: &SenderContext) -> bool {
        if self.is_unreachable() || self.eos_sent {
            return false;
        }
        self.current_request_bytes > ctx.request_bytes_threshold || self.eos_requested
    }

    /// Buffer rows; a full accumulation chunk is sealed into the request.
    fn append_chunk(&mut self, ctx: &SenderContext, chunk: Chunk) -> Result<()> {
        if self.is_unreachable() || chunk.is_empty() {
            return Ok(());
        }
        self.need_close = true;
        self.accum_rows += chunk.len();
        self.accum.push(chunk);
        if self.accum_rows >= ctx.chunk_capacity {
            self.seal_accum(ctx)?;
        }
        Ok(())
    }

    /// Serialize buffered rows into the pending request.
    fn seal_accum(&mut self, ctx: &SenderContext) -> Result<()> {
        if self.accum.is_empty() {
            return Ok(());
        }
        let chunk = concat_chunks(std::mem::take(&mut self.accum))?;
        self.accum_rows = 0;
        let pb = ctx.serialize_chunk(&chunk, &mut self.sent_meta, 1)?;
        self.current_request_bytes += pb.data.len();
        self.request_chunks.push(pb);
        Ok(())
    }

    /// Issue the pending frame if the slot is free. The previous RPC must
    /// have completed (its status propagates) before the next one starts.
    fn try_send(&mut self, ctx: &SenderContext) -> Result<bool> {
        if !self.wants_send(ctx) {
            return Ok(false);
        }
        if let Some(handle) = self.in_flight.as_ref() {
            match handle.try_result() {
                None => return Ok(false),
                Some(result) => {
                    result?;
                    self.in_flight = None;
                }
            }
        }
        self.send_now(ctx)?;
        Ok(true)
    }

    /// Join the previous RPC, blocking; used on the close path.
    fn wait_prev(&mut self, ctx: &SenderContext) -> Result<()> {
        if let Some(handle) = self.in_flight.take() {
            let _t = ScopedTimer::new(&ctx.counters.wait_response_timer);
            handle.wait(ctx.rpc_timeout)?;
        }
        Ok(())
    }

    fn send_now(&mut self, ctx: &SenderContext) -> Result<()> {
        let eos = self.eos_requested;
        let mut params = TransmitChunkParams {
            finst_id: Some(PUniqueId {
                hi: self.fragment_instance_id.hi,
                lo: self.fragment_instance_id.lo,
            }),
            node_id: ctx.dest_node_id,
            sender_id: ctx.sender_id,
            be_number: ctx.be_number,
            sequence: self.sequence,
            eos,
            chunks: std::mem::take(&mut self.request_chunks),
        };
        self.current_request_bytes = 0;
        let attachment = construct_attachment(&mut params);
        let handle = {
            let _t = ScopedTimer::new(&ctx.counters.send_request_timer);
            ctx.transport
                .transmit_chunk(&self.address, params, attachment)
        };
        self.sequence += 1;
        if eos {
            self.eos_sent = true;
        }
        self.in_flight = Some(handle);
        Ok(())
    }

    /// Close phase one: flush whatever remains plus the `eos` frame, without
    /// waiting for its response.
    fn close(&mut self, ctx: &SenderContext) -> Result<()> {
        if self.is_unreachable() || self.eos_sent {
            return Ok(());
        }
        self.seal_accum(ctx)?;
        self.eos_requested = true;
        self.wait_prev(ctx)?;
        self.send_now(ctx)
    }

    /// Close phase two: join the final in-flight RPC.
    fn close_wait(&mut self, ctx: &SenderContext) -> Result<()> {
        if !self.need_close && self.in_flight.is_none() {
            return Ok(());
        }
        self.wait_prev(ctx)
    }
}

fn concat_chunks(chunks: Vec<Chunk>) -> Result<Chunk> {
    if chunks.len() == 1 {
        return Ok(chunks.into_iter().next().unwrap());
    }
    let schema = chunks[0].schema();
    let batches: Vec<RecordBatch> = chunks.iter().map(|c| c.batch.clone()).collect();
    let merged = arrow::compute::concat_batches(&schema, batches.iter())?;
    Chunk::try_new(merged)
}

/// Broadcast dispatch state: one serialized request fanned out to every
/// channel as their RPC slots free up.
struct BroadcastDispatch {
    chunks: Vec<ChunkPb>,
    eos: bool,
    remaining: Vec<usize>,
}

pub struct ExchangeSinkOperator {
    name: String,
    part_type: PartitionType,
    partition_exprs: Vec<Expr>,
    partition_infos: Vec<PartitionInfo>,
    ignore_not_found: bool,
    channels: Vec<Channel>,
    dest_channel_index: Vec<usize>,
    ctx: SenderContext,
    current_channel_idx: usize,
    broadcast_sent_meta: bool,
    broadcast_chunks: Vec<ChunkPb>,
    broadcast_bytes: usize,
    broadcast_dispatch: Option<BroadcastDispatch>,
    finished: bool,
    cancelled: bool,
    close_status: Option<Status>,
}

impl ExchangeSinkOperator {
    fn new(
        sink: &StreamSink,
        destinations: &[PlanFragmentDestination],
        sender_id: i32,
        be_number: i32,
        transport: Arc<dyn ExchangeTransport>,
        codec: Option<BlockCompression>,
        profile: RuntimeProfile,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        if destinations.is_empty() {
            return Err(Status::invalid_argument("exchange sink without destinations"));
        }
        let mut partition_infos = sink.output_partition.partition_infos.clone();
        if sink.output_partition.part_type == PartitionType::RangePartitioned {
            if partition_infos.is_empty() {
                return Err(Status::invalid_argument("empty partition info"));
            }
            // Binary search requires ranges in ascending order.
            partition_infos.sort_by(|a, b| {
                (a.range.start, a.range.end).cmp(&(b.range.start, b.range.end))
            });
        }

        // Destinations sharing a fragment instance id share one channel.
        let mut channels: Vec<Channel> = Vec::new();
        let mut dest_channel_index = Vec::with_capacity(destinations.len());
        let mut instance_to_channel: HashMap<i64, usize> = HashMap::new();
        for dest in destinations {
            let idx = *instance_to_channel
                .entry(dest.fragment_instance_id.lo)
                .or_insert_with(|| {
                    channels.push(Channel::new(
                        dest.fragment_instance_id,
                        dest.address.clone(),
                    ));
                    channels.len() - 1
                });
            dest_channel_index.push(idx);
        }

        let counters = SenderCounters::new(&profile);
        profile.add_info_string("PartType", format!("{:?}", sink.output_partition.part_type));

        Ok(Self {
            name: format!("EXCHANGE_SINK (dst_id={})", sink.dest_node_id),
            part_type: sink.output_partition.part_type,
            partition_exprs: sink.output_partition.partition_exprs.clone(),
            partition_infos,
            ignore_not_found: sink.ignore_not_found,
            channels,
            dest_channel_index,
            ctx: SenderContext {
                transport,
                codec,
                compress_ratio_threshold: config::rpc_compress_ratio_threshold(),
                request_bytes_threshold: config::max_transmit_batched_bytes(),
                chunk_capacity: config::vector_chunk_size(),
                sender_id,
                be_number,
                dest_node_id: sink.dest_node_id,
                rpc_timeout,
                counters,
            },
            current_channel_idx: 0,
            broadcast_sent_meta: false,
            broadcast_chunks: Vec::new(),
            broadcast_bytes: 0,
            broadcast_dispatch: None,
            finished: false,
            cancelled: false,
            close_status: None,
        })
    }

    fn num_receivers(&self) -> usize {
        self.dest_channel_index.len()
    }

    /// Push any pending per-channel or broadcast frames whose slot freed.
    fn advance_pending(&mut self) -> Result<()> {
        if let Some(mut dispatch) = self.broadcast_dispatch.take() {
            let mut still_waiting = Vec::new();
            for channel_idx in dispatch.remaining.drain(..) {
                let channel = &mut self.channels[channel_idx];
                if channel.rpc_busy() {
                    still_waiting.push(channel_idx);
                    continue;
                }
                if let Some(handle) = channel.in_flight.take() {
                    if let Some(result) = handle.try_result() {
                        result?;
                    }
                }
                channel.request_chunks = dispatch.chunks.clone();
                channel.current_request_bytes =
                    dispatch.chunks.iter().map(|c| c.data.len()).sum();
                channel.eos_requested = dispatch.eos;
                channel.need_close = true;
                channel.send_now(&self.ctx)?;
            }
            if !still_waiting.is_empty() {
                dispatch.remaining = still_waiting;
                self.broadcast_dispatch = Some(dispatch);
            }
        }

        for channel in self.channels.iter_mut() {
            channel.try_send(&self.ctx)?;
        }
        Ok(())
    }

    fn blocked_on_rpc(&self) -> bool {
        // Pending work whose RPC slot is busy blocks the sink; pending work
        // with a free slot is dispatched at the head of the next push.
        if let Some(dispatch) = self.broadcast_dispatch.as_ref() {
            return dispatch
                .remaining
                .iter()
                .any(|idx| self.channels[*idx].rpc_busy());
        }
        self.channels
            .iter()
            .any(|c| c.wants_send(&self.ctx) && c.rpc_busy())
    }

    /// Queue one serialized request for every channel; channels with a free
    /// slot send immediately.
    fn start_broadcast(&mut self, eos: bool) -> Result<()> {
        let chunks = std::mem::take(&mut self.broadcast_chunks);
        self.broadcast_bytes = 0;
        self.broadcast_dispatch = Some(BroadcastDispatch {
            chunks,
            eos,
            remaining: (0..self.channels.len()).collect(),
        });
        self.advance_pending()
    }

    fn push_unpartitioned(&mut self, chunk: &Chunk) -> Result<()> {
        let num_receivers = self.num_receivers();
        let pb = self
            .ctx
            .serialize_chunk(chunk, &mut self.broadcast_sent_meta, num_receivers)?;
        self.broadcast_bytes += pb.data.len();
        self.broadcast_chunks.push(pb);
        if self.broadcast_bytes > self.ctx.request_bytes_threshold
            && self.broadcast_dispatch.is_none()
        {
            self.start_broadcast(false)?;
        }
        Ok(())
    }

    fn push_random(&mut self, chunk: Chunk) -> Result<()> {
        let idx = self.current_channel_idx;
        let channel = &mut self.channels[idx];
        channel.append_chunk(&self.ctx, chunk)?;
        channel.seal_accum(&self.ctx)?;
        // Advance the cursor only when the channel really flushed an RPC.
        if channel.try_send(&self.ctx)? {
            self.current_channel_idx = (self.current_channel_idx + 1) % self.channels.len();
        }
        Ok(())
    }

    fn push_hash_partitioned(&mut self, chunk: &Chunk, use_crc32: bool) -> Result<()> {
        let dispatch_timer = self.ctx.counters.shuffle_dispatch_timer.clone();
        let _dispatch = ScopedTimer::new(&dispatch_timer);
        let num_rows = chunk.len();
        let num_channels = self.channels.len();

        let channel_ids: Vec<usize> = {
            let _hash = ScopedTimer::new(&self.ctx.counters.shuffle_hash_timer);
            let mut arrays = Vec::with_capacity(self.partition_exprs.len());
            for expr in &self.partition_exprs {
                arrays.push(expr.eval(chunk)?);
            }
            if use_crc32 {
                compute_crc32_row_hashes(&arrays, num_rows)?
                    .into_iter()
                    .map(|h| h as usize % num_channels)
                    .collect()
            } else {
                compute_fnv_row_hashes(&arrays, num_rows)?
                    .into_iter()
                    .map(|h| h as usize % num_channels)
                    .collect()
            }
        };

        let (start_points, row_indexes) = build_channel_row_indexes(&channel_ids, num_channels);
        self.append_selected_rows(chunk, &start_points, &row_indexes)
    }

    fn push_range_partitioned(&mut self, chunk: &Chunk, state: &RuntimeState) -> Result<()> {
        let dispatch_timer = self.ctx.counters.shuffle_dispatch_timer.clone();
        let _dispatch = ScopedTimer::new(&dispatch_timer);
        let num_rows = chunk.len();
        let num_channels = self.channels.len();

        let part_key_array = self
            .partition_exprs
            .first()
            .ok_or_else(|| Status::invalid_argument("range partition without exprs"))?
            .eval(chunk)?;

        let mut dist_arrays: Vec<Vec<ArrayRef>> = Vec::with_capacity(self.partition_infos.len());
        for info in &self.partition_infos {
            let mut arrays = Vec::with_capacity(info.distribution_exprs.len());
            for expr in &info.distribution_exprs {
                arrays.push(expr.eval(chunk)?);
            }
            dist_arrays.push(arrays);
        }

        let mut channel_ids = vec![usize::MAX; num_rows];
        let mut ignored = 0i64;
        for row in 0..num_rows {
            state.check_cancelled()?;
            let key = if part_key_array.is_null(row) {
                PartRangeKey::NegInfinite
            } else {
                PartRangeKey::Key(crate::exec::expr::agg::numeric::value_i64(
                    &part_key_array,
                    row,
                )?)
            };
            let Some(part_index) = self.binary_find_partition(key) else {
                if self.ignore_not_found {
                    ignored += 1;
                    continue;
                }
                return Err(Status::internal(format!(
                    "no corresponding partition for key {key:?}"
                )));
            };
            let info = &self.partition_infos[part_index];
            let mut hash = 0u32;
            for array in &dist_arrays[part_index] {
                match partition_value_bytes(array, row)? {
                    Some(bytes) => hash = zlib_crc32(&bytes, hash),
                    None => hash = zlib_crc32(&0i32.to_le_bytes(), hash),
                }
            }
            let bucket = hash % info.distributed_bucket.max(1);
            // Distribute within a partition by mixing the partition id over
            // the bucket hash.
            let code = fnv_hash_bytes(&info.id.to_le_bytes(), bucket as u64);
            channel_ids[row] = code as usize % num_channels;
        }
        self.ctx.counters.ignore_rows.add(ignored);

        // Compact out ignored rows before grouping.
        let kept: Vec<usize> = (0..num_rows)
            .filter(|row| channel_ids[*row] != usize::MAX)
            .collect();
        if kept.is_empty() {
            return Ok(());
        }
        let kept_ids: Vec<usize> = kept.iter().map(|r| channel_ids[*r]).collect();
        let indices =
            UInt32Array::from(kept.iter().map(|r| *r as u32).collect::<Vec<_>>());
        let mut columns = Vec::with_capacity(chunk.columns().len());
        for column in chunk.columns() {
            columns.push(take(column, &indices, None)?);
        }
        let kept_chunk = Chunk::try_new(RecordBatch::try_new(chunk.schema(), columns)?)?;
        let (start_points, row_indexes) =
            build_channel_row_indexes(&kept_ids, num_channels);
        self.append_selected_rows(&kept_chunk, &start_points, &row_indexes)
    }

    fn binary_find_partition(&self, key: PartRangeKey) -> Option<usize> {
        let mut low = 0i64;
        let mut high = self.partition_infos.len() as i64 - 1;
        while low <= high {
            let mid = (low + (high - low) / 2) as usize;
            match self.partition_infos[mid].range.compare_key(key) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => low = mid as i64 + 1,
                std::cmp::Ordering::Greater => high = mid as i64 - 1,
            }
        }
        None
    }

    fn append_selected_rows(
        &mut self,
        chunk: &Chunk,
        start_points: &[usize],
        row_indexes: &[u32],
    ) -> Result<()> {
        let num_channels = self.channels.len();
        for channel_idx in 0..num_channels {
            let from = start_points[channel_idx];
            let size = start_points[channel_idx + 1] - from;
            if size == 0 {
                continue;
            }
            if self.channels[channel_idx].is_unreachable() {
                continue;
            }
            let indices = UInt32Array::from(row_indexes[from..from + size].to_vec());
            let mut columns = Vec::with_capacity(chunk.columns().len());
            for column in chunk.columns() {
                columns.push(take(column, &indices, None)?);
            }
            let selected = Chunk::try_new(RecordBatch::try_new(chunk.schema(), columns)?)?;
            let channel = &mut self.channels[channel_idx];
            channel.append_chunk(&self.ctx, selected)?;
            channel.try_send(&self.ctx)?;
        }
        Ok(())
    }
}

impl Operator for ExchangeSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn pending_finish(&self) -> bool {
        self.channels.iter().any(|c| c.rpc_busy())
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn close(&mut self) -> Result<()> {
        // Every channel gets close_wait so no RPC leaks; the first failure
        // is stashed and returned.
        for channel in self.channels.iter_mut() {
            if let Err(err) = channel.close_wait(&self.ctx) {
                warn!(
                    "exchange channel close failed: dest={} err={}",
                    channel.fragment_instance_id, err
                );
                if self.close_status.is_none() {
                    self.close_status = Some(err);
                }
            }
        }
        match self.close_status.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for ExchangeSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished && !self.blocked_on_rpc()
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let total_time = self.ctx.counters.total_time.clone();
        let _t = ScopedTimer::new(&total_time);
        state.check_cancelled()?;
        if self.cancelled {
            return Err(Status::cancelled("exchange sink cancelled"));
        }
        self.advance_pending()?;
        if chunk.is_empty() {
            return Ok(());
        }
        match self.part_type {
            PartitionType::Unpartitioned => self.push_unpartitioned(&chunk),
            PartitionType::Random => self.push_random(chunk),
            PartitionType::HashPartitioned => self.push_hash_partitioned(&chunk, false),
            PartitionType::BucketShuffleHashPartitioned => {
                self.push_hash_partitioned(&chunk, true)
            }
            PartitionType::RangePartitioned => self.push_range_partitioned(&chunk, state),
        }
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        let total_time = self.ctx.counters.total_time.clone();
        let _t = ScopedTimer::new(&total_time);
        if self.finished {
            return Ok(());
        }
        state.check_cancelled()?;

        if self.part_type == PartitionType::Unpartitioned && !self.broadcast_chunks.is_empty() {
            // Remaining broadcast data rides with the eos frame.
            if let Some(dispatch) = self.broadcast_dispatch.take() {
                // An earlier dispatch is still fanning out; finish it first.
                for channel_idx in dispatch.remaining {
                    let channel = &mut self.channels[channel_idx];
                    channel.wait_prev(&self.ctx)?;
                    channel.request_chunks = dispatch.chunks.clone();
                    channel.current_request_bytes =
                        dispatch.chunks.iter().map(|c| c.data.len()).sum();
                    channel.need_close = true;
                    channel.send_now(&self.ctx)?;
                }
            }
            let chunks = std::mem::take(&mut self.broadcast_chunks);
            self.broadcast_bytes = 0;
            for channel in self.channels.iter_mut() {
                if channel.is_unreachable() {
                    continue;
                }
                channel.wait_prev(&self.ctx)?;
                channel.request_chunks = chunks.clone();
                channel.current_request_bytes = chunks.iter().map(|c| c.data.len()).sum();
                channel.eos_requested = true;
                channel.need_close = true;
                channel.send_now(&self.ctx)?;
            }
        } else {
            if let Some(dispatch) = self.broadcast_dispatch.take() {
                for channel_idx in dispatch.remaining {
                    let channel = &mut self.channels[channel_idx];
                    channel.wait_prev(&self.ctx)?;
                    channel.request_chunks = dispatch.chunks.clone();
                    channel.current_request_bytes =
                        dispatch.chunks.iter().map(|c| c.data.len()).sum();
                    channel.need_close = true;
                    channel.send_now(&self.ctx)?;
                }
            }
            // Phase one of the close protocol: flush remainders and the eos
            // frame on every channel without waiting on the responses.
            for channel in self.channels.iter_mut() {
                channel.close(&self.ctx)?;
            }
        }

        self.ctx.counters.overall_throughput.set(
            RuntimeProfile::units_per_second(
                &self.ctx.counters.bytes_sent,
                &self.ctx.counters.total_time,
            ),
        );
        self.finished = true;
        Ok(())
    }
}

pub struct ExchangeSinkFactory {
    sink: StreamSink,
    destinations: Vec<PlanFragmentDestination>,
    sender_id: i32,
    be_number: i32,
    transport: Arc<dyn ExchangeTransport>,
    codec: Option<BlockCompression>,
    profile: RuntimeProfile,
    rpc_timeout: Duration,
}

impl ExchangeSinkFactory {
    pub fn new(
        sink: StreamSink,
        destinations: Vec<PlanFragmentDestination>,
        sender_id: i32,
        be_number: i32,
        transport: Arc<dyn ExchangeTransport>,
        codec: Option<BlockCompression>,
        profile: RuntimeProfile,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            destinations,
            sender_id,
            be_number,
            transport,
            codec,
            profile,
            rpc_timeout,
        }
    }
}

impl OperatorFactory for ExchangeSinkFactory {
    fn name(&self) -> &str {
        "EXCHANGE_SINK"
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.sink.dest_node_id
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn create(&self, _degree_of_parallelism: usize, instance_index: usize) -> Box<dyn Operator> {
        let profile = self
            .profile
            .child(format!("ExchangeSink (instance={instance_index})"));
        match ExchangeSinkOperator::new(
            &self.sink,
            &self.destinations,
            self.sender_id,
            self.be_number,
            Arc::clone(&self.transport),
            self.codec,
            profile,
            self.rpc_timeout,
        ) {
            Ok(op) => Box::new(op),
            Err(err) => Box::new(crate::exec::operators::FailedOperator::new(
                "EXCHANGE_SINK",
                err,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_row_index_permutation_groups_rows_in_order() {
        let channel_ids = vec![1usize, 0, 1, 2, 0, 1];
        let (starts, rows) = build_channel_row_indexes(&channel_ids, 3);
        assert_eq!(starts, vec![0, 2, 5, 6]);
        // Rows per channel keep their original relative order.
        assert_eq!(&rows[0..2], &[1, 4]);
        assert_eq!(&rows[2..5], &[0, 2, 5]);
        assert_eq!(&rows[5..6], &[3]);
    }

    #[test]
    fn fnv_hashes_are_deterministic() {
        let arrays: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![1, 2, 3, 1]))];
        let a = compute_fnv_row_hashes(&arrays, 4).expect("hash");
        let b = compute_fnv_row_hashes(&arrays, 4).expect("hash");
        assert_eq!(a, b);
        assert_eq!(a[0], a[3]);
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn crc32_matches_zlib_reference_values() {
        // CRC-32 of "123456789" under the zlib polynomial.
        assert_eq!(zlib_crc32(b"123456789", 0), 0xcbf4_3926);
    }
}
