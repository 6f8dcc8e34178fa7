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
//! Exchange receiver registry.
//!
//! One receiver exists per `(fragment instance, exchange node)`. Senders
//! deliver framed requests; frames from one channel are reassembled in
//! strict sequence order (out-of-order frames wait in a pending map), eos
//! is tracked per `(sender_id, be_number)`, and a receiver is drained once
//! every expected sender finished. Chunk payloads are Arrow IPC: the first
//! frame on a channel carries the schema meta, later frames reuse it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{write_message, DictionaryTracker, IpcDataGenerator, IpcWriteOptions};
use bytes::Bytes;

use crate::common::ids::PlanNodeId;
use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::exec::chunk::Chunk;
use crate::gneiss_logging::debug;
use crate::runtime::compress::BlockCompression;
use crate::runtime::transmit::{split_attachment, TransmitChunkParams};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    pub fragment_instance_id: UniqueId,
    pub node_id: PlanNodeId,
}

// Canceled keys are remembered so late frames from in-flight senders are
// dropped instead of recreating a receiver nobody will drain. The memory is
// bounded by a TTL plus a hard cap, swept opportunistically on access.
const CANCELED_KEYS_TTL: Duration = Duration::from_secs(600);
const CANCELED_KEYS_MAX_SIZE: usize = 8192;

fn cleanup_canceled_keys_locked(keys: &mut HashMap<ExchangeKey, Instant>, now: Instant) {
    keys.retain(|_, ts| now.duration_since(*ts) <= CANCELED_KEYS_TTL);
    if keys.len() > CANCELED_KEYS_MAX_SIZE {
        keys.clear();
    }
}

type SenderId = (i32, i32);

struct PendingFrame {
    chunks: Vec<Chunk>,
    eos: bool,
}

#[derive(Default)]
struct SenderStream {
    next_sequence: i64,
    pending: BTreeMap<i64, PendingFrame>,
    staged: Option<PendingFrame>,
    eos_seen: bool,
    meta: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default)]
pub struct ExchangeRecvStats {
    pub requests_received: u64,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub rows_received: u64,
}

#[derive(Clone, Debug)]
pub struct SenderSnapshot {
    pub sender_id: i32,
    pub be_number: i32,
    pub next_sequence: i64,
    pub eos_seen: bool,
    pub pending_frames: usize,
}

#[derive(Clone, Debug)]
pub struct ExchangeReceiverSnapshot {
    pub expected_senders: usize,
    pub finished_senders: usize,
    pub queued_chunks: usize,
    pub queued_rows: usize,
    pub senders: Vec<SenderSnapshot>,
}

#[derive(Default)]
struct ReceiverState {
    expected_senders: usize,
    finished: HashSet<SenderId>,
    streams: HashMap<SenderId, SenderStream>,
    queue: VecDeque<Chunk>,
    stats: ExchangeRecvStats,
    canceled: bool,
}

struct Receiver {
    mu: Mutex<ReceiverState>,
    cv: Condvar,
}

pub enum ExchangePop {
    Chunk(Chunk),
    Finished(ExchangeRecvStats),
}

/// All live receivers in this process.
pub struct ExchangeRegistry {
    receivers: Mutex<HashMap<ExchangeKey, Arc<Receiver>>>,
    canceled_keys: Mutex<HashMap<ExchangeKey, Instant>>,
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self {
            receivers: Mutex::new(HashMap::new()),
            canceled_keys: Mutex::new(HashMap::new()),
        }
    }

    fn mark_key_canceled(&self, key: ExchangeKey) {
        let now = Instant::now();
        let mut guard = self
            .canceled_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        cleanup_canceled_keys_locked(&mut guard, now);
        guard.insert(key, now);
    }

    fn is_key_canceled(&self, key: &ExchangeKey) -> bool {
        let now = Instant::now();
        let mut guard = self
            .canceled_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        cleanup_canceled_keys_locked(&mut guard, now);
        guard.contains_key(key)
    }

    fn get_or_create(&self, key: ExchangeKey) -> Arc<Receiver> {
        let mut guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(key).or_insert_with(|| {
            debug!(
                "exchange receiver created: finst={} node_id={}",
                key.fragment_instance_id, key.node_id
            );
            Arc::new(Receiver {
                mu: Mutex::new(ReceiverState::default()),
                cv: Condvar::new(),
            })
        }))
    }

    pub fn set_expected_senders(&self, key: ExchangeKey, expected_senders: usize) {
        if self.is_key_canceled(&key) {
            return;
        }
        let receiver = self.get_or_create(key);
        let mut st = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        st.expected_senders = st.expected_senders.max(expected_senders);
        receiver.cv.notify_all();
    }

    pub fn handle(&self, key: ExchangeKey, expected_senders: usize) -> ExchangeReceiverHandle {
        if self.is_key_canceled(&key) {
            let receiver = self.get_or_create(key);
            receiver
                .mu
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .canceled = true;
            return ExchangeReceiverHandle { key, receiver };
        }
        self.set_expected_senders(key, expected_senders);
        ExchangeReceiverHandle {
            key,
            receiver: self.get_or_create(key),
        }
    }

    /// Deliver one transmit request. Frames are applied in sequence order
    /// per sender; out-of-order frames wait, regressions are an error.
    /// Frames for canceled keys are dropped quietly so a late sender never
    /// recreates a receiver nobody will drain.
    pub fn deliver(&self, params: &TransmitChunkParams, attachment: &Bytes) -> Result<()> {
        let finst = params
            .finst_id
            .ok_or_else(|| Status::invalid_argument("transmit without finst_id"))?;
        let key = ExchangeKey {
            fragment_instance_id: UniqueId::new(finst.hi, finst.lo),
            node_id: params.node_id,
        };
        if self.is_key_canceled(&key) {
            debug!(
                "exchange dropped frame for canceled key: finst={} node_id={}",
                key.fragment_instance_id, key.node_id
            );
            return Ok(());
        }
        let sender: SenderId = (params.sender_id, params.be_number);
        let payloads = split_attachment(params, attachment)?;

        let receiver = self.get_or_create(key);
        let mut st = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        if st.canceled {
            debug!(
                "exchange dropped frame for canceled receiver: finst={} node_id={}",
                key.fragment_instance_id, key.node_id
            );
            return Ok(());
        }

        st.stats.requests_received += 1;
        st.stats.bytes_received += attachment.len() as u64;

        {
            let stream = st.streams.entry(sender).or_default();
            if params.sequence < stream.next_sequence {
                return Err(Status::rpc_error(format!(
                    "stale sequence {} from sender {:?} (expected {})",
                    params.sequence, sender, stream.next_sequence
                )));
            }
            if stream.eos_seen || stream.pending.values().any(|f| f.eos) {
                return Err(Status::rpc_error(format!(
                    "frame after eos from sender {sender:?}"
                )));
            }

            // Decode under the stream's cached meta before queueing.
            let mut chunks = Vec::with_capacity(params.chunks.len());
            for (pb, payload) in params.chunks.iter().zip(payloads.iter()) {
                if !pb.meta.is_empty() {
                    stream.meta = Some(pb.meta.clone());
                }
                let meta = stream.meta.as_deref().ok_or_else(|| {
                    Status::rpc_error("chunk payload before channel meta".to_string())
                })?;
                let chunk = decode_chunk(meta, pb, payload)?;
                chunks.push(chunk);
            }

            if params.sequence > stream.next_sequence {
                stream.pending.insert(
                    params.sequence,
                    PendingFrame {
                        chunks,
                        eos: params.eos,
                    },
                );
                return Ok(());
            }

            stream.staged = Some(PendingFrame {
                chunks,
                eos: params.eos,
            });
        }

        // In order: apply the staged frame, then drain whatever became
        // contiguous behind it.
        loop {
            let frame = {
                let stream = st.streams.get_mut(&sender).expect("stream exists");
                let Some(frame) = stream.staged.take() else {
                    break;
                };
                stream.next_sequence += 1;
                if frame.eos {
                    stream.eos_seen = true;
                }
                frame
            };
            let eos = frame.eos;
            for chunk in frame.chunks {
                st.stats.chunks_received += 1;
                st.stats.rows_received += chunk.len() as u64;
                st.queue.push_back(chunk);
            }
            if eos {
                st.finished.insert(sender);
                break;
            }
            let stream = st.streams.get_mut(&sender).expect("stream exists");
            let seq = stream.next_sequence;
            stream.staged = stream.pending.remove(&seq);
        }
        receiver.cv.notify_all();
        Ok(())
    }

    /// Reclaim every receiver of a fragment instance: the keys are marked
    /// canceled (so late frames drop), blocked consumers wake, and the
    /// entries leave the registry. Receivers are never auto-removed on
    /// driver completion alone — under high DOP several drivers share one
    /// receiver, and an early removal would let a straggler recreate an
    /// empty receiver and hang — so this call at fragment completion,
    /// failure or coordinator cancel is the cleanup path, with the
    /// canceled-key TTL as the backstop.
    pub fn cancel_fragment(&self, fragment_instance_id: UniqueId) {
        // The key must read as canceled before its entry leaves the map, or
        // a racing deliver could recreate the receiver in between.
        let removed: Vec<Arc<Receiver>> = {
            let mut guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<ExchangeKey> = guard
                .keys()
                .copied()
                .filter(|k| k.fragment_instance_id == fragment_instance_id)
                .collect();
            keys.into_iter()
                .filter_map(|k| {
                    self.mark_key_canceled(k);
                    guard.remove(&k)
                })
                .collect()
        };
        for receiver in removed {
            let mut st = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
            st.canceled = true;
            receiver.cv.notify_all();
        }
    }

    pub fn snapshot(&self, key: ExchangeKey) -> Option<ExchangeReceiverSnapshot> {
        let receiver = {
            let guard = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
            guard.get(&key).cloned()
        }?;
        let st = receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        let mut senders: Vec<SenderSnapshot> = st
            .streams
            .iter()
            .map(|((sender_id, be_number), stream)| SenderSnapshot {
                sender_id: *sender_id,
                be_number: *be_number,
                next_sequence: stream.next_sequence,
                eos_seen: stream.eos_seen,
                pending_frames: stream.pending.len(),
            })
            .collect();
        senders.sort_by_key(|s| (s.sender_id, s.be_number));
        Some(ExchangeReceiverSnapshot {
            expected_senders: st.expected_senders,
            finished_senders: st.finished.len(),
            queued_chunks: st.queue.len(),
            queued_rows: st.queue.iter().map(|c| c.len()).sum(),
            senders,
        })
    }
}

/// Handle one exchange-source operator holds on its receiver.
pub struct ExchangeReceiverHandle {
    key: ExchangeKey,
    receiver: Arc<Receiver>,
}

impl ExchangeReceiverHandle {
    pub fn key(&self) -> ExchangeKey {
        self.key
    }

    pub fn try_pop(&self) -> Result<Option<ExchangePop>> {
        let mut st = self.receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        if st.canceled {
            return Err(Status::cancelled("exchange canceled"));
        }
        if let Some(chunk) = st.queue.pop_front() {
            return Ok(Some(ExchangePop::Chunk(chunk)));
        }
        // Zero expected senders means a degenerate exchange that is already
        // complete.
        if st.finished.len() >= st.expected_senders {
            return Ok(Some(ExchangePop::Finished(st.stats.clone())));
        }
        Ok(None)
    }

    pub fn has_output_or_finished(&self) -> bool {
        let st = self.receiver.mu.lock().unwrap_or_else(|e| e.into_inner());
        st.canceled || !st.queue.is_empty() || st.finished.len() >= st.expected_senders
    }
}

/// Serialize one chunk into `(meta, payload)` IPC bytes. The meta is the
/// schema message and is identical for every chunk of a channel, so it is
/// shipped only once per channel.
pub fn encode_chunk(chunk: &Chunk) -> Result<(Vec<u8>, Vec<u8>)> {
    let generator = IpcDataGenerator::default();
    let options = IpcWriteOptions::default();

    let schema = chunk.schema();
    let schema_data = generator.schema_to_bytes(schema.as_ref(), &options);
    let mut meta = Vec::new();
    write_message(&mut meta, schema_data, &options)?;

    let mut tracker = DictionaryTracker::new(false);
    let (dictionaries, batch_data) = generator.encoded_batch(&chunk.batch, &mut tracker, &options)?;
    let mut payload = Vec::new();
    for dictionary in dictionaries {
        write_message(&mut payload, dictionary, &options)?;
    }
    write_message(&mut payload, batch_data, &options)?;
    Ok((meta, payload))
}

/// Rebuild a chunk from a channel's cached meta and one frame payload,
/// undoing compression first.
pub fn decode_chunk(
    meta: &[u8],
    pb: &crate::runtime::transmit::ChunkPb,
    payload: &[u8],
) -> Result<Chunk> {
    let uncompressed_size = usize::try_from(pb.uncompressed_size)
        .map_err(|_| Status::internal("negative uncompressed_size"))?;
    let raw: Vec<u8> = match BlockCompression::for_compress_type(pb.compress_type())? {
        None => {
            if payload.len() != uncompressed_size {
                return Err(Status::internal(format!(
                    "uncompressed payload size mismatch: tagged {} got {}",
                    uncompressed_size,
                    payload.len()
                )));
            }
            payload.to_vec()
        }
        Some(codec) => codec.decompress(payload, uncompressed_size)?,
    };

    let mut stream = Vec::with_capacity(meta.len() + raw.len());
    stream.extend_from_slice(meta);
    stream.extend_from_slice(&raw);
    let reader = StreamReader::try_new(Cursor::new(stream), None)
        .map_err(|e| Status::internal(format!("bad chunk meta: {e}")))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| Status::internal(format!("bad chunk payload: {e}")))?);
    }
    let batch = batches
        .pop()
        .ok_or_else(|| Status::internal("chunk payload held no record batch"))?;
    Chunk::try_new(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::field_with_slot_id;
    use crate::runtime::transmit::{construct_attachment, ChunkPb, CompressType, PUniqueId};
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn chunk_of(values: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("v", DataType::Int64, true),
            SlotId::new(1),
        )]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch");
        Chunk::try_new(batch).expect("chunk")
    }

    fn frame(seq: i64, eos: bool, chunk: Option<&Chunk>, meta_cache: &mut Option<Vec<u8>>) -> (TransmitChunkParams, Bytes) {
        let mut chunks = Vec::new();
        if let Some(chunk) = chunk {
            let (meta, payload) = encode_chunk(chunk).expect("encode");
            let send_meta = if meta_cache.is_none() {
                *meta_cache = Some(meta.clone());
                meta
            } else {
                Vec::new()
            };
            chunks.push(ChunkPb {
                slot_id_map: vec![1],
                meta: send_meta,
                uncompressed_size: payload.len() as i64,
                compress_type: CompressType::None as i32,
                data_size: 0,
                data: payload,
            });
        }
        let mut params = TransmitChunkParams {
            finst_id: Some(PUniqueId { hi: 7, lo: 7 }),
            node_id: 3,
            sender_id: 0,
            be_number: 0,
            sequence: seq,
            eos,
            chunks,
        };
        let attachment = construct_attachment(&mut params);
        (params, attachment)
    }

    #[test]
    fn out_of_order_frames_are_reassembled() {
        let registry = ExchangeRegistry::new();
        let key = ExchangeKey {
            fragment_instance_id: UniqueId::new(7, 7),
            node_id: 3,
        };
        let handle = registry.handle(key, 1);

        let mut meta_cache = None;
        let c0 = chunk_of(vec![1]);
        let c1 = chunk_of(vec![2]);
        let (p0, a0) = frame(0, false, Some(&c0), &mut meta_cache);
        let (p1, a1) = frame(1, false, Some(&c1), &mut meta_cache);
        let (p2, a2) = frame(2, true, None, &mut meta_cache);

        // Deliver 1 and 2 before 0; nothing surfaces until 0 arrives.
        registry.deliver(&p1, &a1).expect("frame 1");
        registry.deliver(&p2, &a2).expect("frame 2");
        assert!(matches!(handle.try_pop().expect("pop"), None));

        registry.deliver(&p0, &a0).expect("frame 0");
        let first = handle.try_pop().expect("pop").expect("chunk");
        let second = handle.try_pop().expect("pop").expect("chunk");
        assert!(matches!(first, ExchangePop::Chunk(c) if c.len() == 1));
        assert!(matches!(second, ExchangePop::Chunk(_)));
        assert!(matches!(
            handle.try_pop().expect("pop"),
            Some(ExchangePop::Finished(_))
        ));

        let snapshot = registry.snapshot(key).expect("snapshot");
        assert_eq!(snapshot.senders.len(), 1);
        assert_eq!(snapshot.senders[0].next_sequence, 3);
        assert!(snapshot.senders[0].eos_seen);
    }

    #[test]
    fn stale_sequence_is_an_rpc_error() {
        let registry = ExchangeRegistry::new();
        let mut meta_cache = None;
        let chunk = chunk_of(vec![1]);
        let (p0, a0) = frame(0, false, Some(&chunk), &mut meta_cache);
        registry.deliver(&p0, &a0).expect("frame 0");
        let err = registry.deliver(&p0, &a0).expect_err("duplicate");
        assert_eq!(err.code, crate::common::status::StatusCode::RpcError);
    }

    #[test]
    fn encode_decode_round_trips_chunk_bytes() {
        let chunk = chunk_of(vec![5, 6, 7]);
        let (meta, payload) = encode_chunk(&chunk).expect("encode");
        let pb = ChunkPb {
            uncompressed_size: payload.len() as i64,
            compress_type: CompressType::None as i32,
            ..Default::default()
        };
        let decoded = decode_chunk(&meta, &pb, &payload).expect("decode");
        assert_eq!(decoded.len(), 3);
        let col = decoded
            .column_by_slot_id(SlotId::new(1))
            .expect("slot 1");
        let arr = col.as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(arr.values(), &[5, 6, 7]);
    }
}
