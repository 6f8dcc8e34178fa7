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
//! The transmit-chunk RPC surface.
//!
//! Wire messages are prost messages; bulk chunk bytes ride out of band in
//! an attachment so the protobuf stays small. The transport is a trait so
//! the runtime can run against an in-process loopback; a networked
//! implementation plugs in behind the same contract.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::common::status::{Result, Status};
use crate::runtime::exchange::ExchangeRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum CompressType {
    None = 0,
    Lz4 = 1,
    Snappy = 2,
    Zlib = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct PUniqueId {
    #[prost(int64, tag = "1")]
    pub hi: i64,
    #[prost(int64, tag = "2")]
    pub lo: i64,
}

/// One serialized chunk. The first chunk on a channel carries column meta
/// (the serialized schema plus the slot-id map); later chunks are payload
/// only and the receiver reuses the channel's cached meta. `data` is moved
/// into the request attachment before send; `data_size` locates it there.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChunkPb {
    #[prost(int32, repeated, tag = "1")]
    pub slot_id_map: Vec<i32>,
    #[prost(bytes = "vec", tag = "2")]
    pub meta: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub uncompressed_size: i64,
    #[prost(enumeration = "CompressType", tag = "4")]
    pub compress_type: i32,
    #[prost(int64, tag = "5")]
    pub data_size: i64,
    #[prost(bytes = "vec", tag = "6")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TransmitChunkParams {
    #[prost(message, optional, tag = "1")]
    pub finst_id: Option<PUniqueId>,
    #[prost(int32, tag = "2")]
    pub node_id: i32,
    #[prost(int32, tag = "3")]
    pub sender_id: i32,
    #[prost(int32, tag = "4")]
    pub be_number: i32,
    #[prost(int64, tag = "5")]
    pub sequence: i64,
    #[prost(bool, tag = "6")]
    pub eos: bool,
    #[prost(message, repeated, tag = "7")]
    pub chunks: Vec<ChunkPb>,
}

/// Move every chunk's payload bytes into one attachment buffer, recording
/// per-chunk sizes in the message.
pub fn construct_attachment(params: &mut TransmitChunkParams) -> Bytes {
    let mut attachment = Vec::new();
    for chunk in params.chunks.iter_mut() {
        chunk.data_size = chunk.data.len() as i64;
        attachment.extend_from_slice(&chunk.data);
        chunk.data.clear();
    }
    Bytes::from(attachment)
}

/// Split an attachment back into per-chunk payloads.
pub fn split_attachment(params: &TransmitChunkParams, attachment: &Bytes) -> Result<Vec<Bytes>> {
    let mut out = Vec::with_capacity(params.chunks.len());
    let mut offset = 0usize;
    for chunk in &params.chunks {
        let size = usize::try_from(chunk.data_size)
            .map_err(|_| Status::internal("negative chunk data_size"))?;
        if offset + size > attachment.len() {
            return Err(Status::internal(format!(
                "attachment too short: need {} have {}",
                offset + size,
                attachment.len()
            )));
        }
        out.push(attachment.slice(offset..offset + size));
        offset += size;
    }
    if offset != attachment.len() {
        return Err(Status::internal(format!(
            "attachment has {} trailing bytes",
            attachment.len() - offset
        )));
    }
    Ok(out)
}

#[derive(Default)]
struct RpcShared {
    result: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

/// Completion handle for one in-flight transmit RPC.
#[derive(Clone)]
pub struct RpcHandle {
    shared: Arc<RpcShared>,
}

impl RpcHandle {
    pub fn pending() -> Self {
        Self {
            shared: Arc::new(RpcShared::default()),
        }
    }

    pub fn completed(result: Result<()>) -> Self {
        let handle = Self::pending();
        handle.complete(result);
        handle
    }

    pub fn complete(&self, result: Result<()>) {
        let mut guard = self
            .shared
            .result
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(result);
        }
        self.shared.cv.notify_all();
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.shared
            .result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_done(&self) -> bool {
        self.try_result().is_some()
    }

    /// Join the RPC, propagating its status.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut guard = self
            .shared
            .result
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Status::timeout("transmit rpc timed out"));
            }
            let (next, _) = self
                .shared
                .cv
                .wait_timeout(guard, timeout - elapsed)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
    }
}

/// Worker-to-worker chunk transmission.
pub trait ExchangeTransport: Send + Sync {
    /// Issue one transmit RPC; the handle completes with the receiver's
    /// status. Callers enforce at most one in-flight call per channel.
    fn transmit_chunk(
        &self,
        address: &str,
        params: TransmitChunkParams,
        attachment: Bytes,
    ) -> RpcHandle;
}

/// In-process transport: delivers straight into this process's receiver
/// registry. Every worker address resolves to the local registry.
pub struct LoopbackTransport {
    registry: Arc<ExchangeRegistry>,
}

impl LoopbackTransport {
    pub fn new(registry: Arc<ExchangeRegistry>) -> Self {
        Self { registry }
    }
}

impl ExchangeTransport for LoopbackTransport {
    fn transmit_chunk(
        &self,
        _address: &str,
        params: TransmitChunkParams,
        attachment: Bytes,
    ) -> RpcHandle {
        let result = self
            .registry
            .deliver(&params, &attachment)
            .map_err(|e| Status::rpc_error(e.to_string()));
        RpcHandle::completed(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_round_trip_preserves_chunk_payloads() {
        let mut params = TransmitChunkParams {
            finst_id: Some(PUniqueId { hi: 1, lo: 2 }),
            node_id: 3,
            sender_id: 0,
            be_number: 0,
            sequence: 0,
            eos: false,
            chunks: vec![
                ChunkPb {
                    data: vec![1, 2, 3],
                    ..Default::default()
                },
                ChunkPb {
                    data: vec![9, 8],
                    ..Default::default()
                },
            ],
        };
        let attachment = construct_attachment(&mut params);
        assert!(params.chunks.iter().all(|c| c.data.is_empty()));
        assert_eq!(attachment.as_ref(), &[1, 2, 3, 9, 8]);

        let payloads = split_attachment(&params, &attachment).expect("split");
        assert_eq!(payloads[0].as_ref(), &[1, 2, 3]);
        assert_eq!(payloads[1].as_ref(), &[9, 8]);
    }

    #[test]
    fn rpc_handle_completes_once() {
        let handle = RpcHandle::pending();
        assert!(!handle.is_done());
        handle.complete(Ok(()));
        handle.complete(Err(Status::rpc_error("late")));
        assert_eq!(handle.try_result(), Some(Ok(())));
        handle.wait(Duration::from_millis(10)).expect("ok result");
    }
}
