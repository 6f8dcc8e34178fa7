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
//! Block compression codecs for exchange payloads.

use crate::common::status::{Result, Status};
use crate::runtime::transmit::CompressType;

const LZ4_MAX_INPUT_SIZE: usize = 0x7E00_0000;
const SNAPPY_MAX_INPUT_SIZE: usize = u32::MAX as usize;

/// A whole-buffer codec; framing (sizes, type tag) travels in the chunk
/// metadata, not the compressed bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockCompression {
    Lz4,
    Snappy,
}

impl BlockCompression {
    /// Codec for a wire tag; `None` yields no codec, `Zlib` is not linked.
    pub fn for_compress_type(compress_type: CompressType) -> Result<Option<Self>> {
        match compress_type {
            CompressType::None => Ok(None),
            CompressType::Lz4 => Ok(Some(Self::Lz4)),
            CompressType::Snappy => Ok(Some(Self::Snappy)),
            CompressType::Zlib => Err(Status::unimplemented("zlib exchange compression")),
        }
    }

    pub fn compress_type(&self) -> CompressType {
        match self {
            Self::Lz4 => CompressType::Lz4,
            Self::Snappy => CompressType::Snappy,
        }
    }

    pub fn max_input_size(&self) -> usize {
        match self {
            Self::Lz4 => LZ4_MAX_INPUT_SIZE,
            Self::Snappy => SNAPPY_MAX_INPUT_SIZE,
        }
    }

    pub fn exceed_max_input_size(&self, size: usize) -> bool {
        size > self.max_input_size()
    }

    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if self.exceed_max_input_size(input.len()) {
            return Err(Status::internal(format!(
                "compression input of {} bytes exceeds codec max {}",
                input.len(),
                self.max_input_size()
            )));
        }
        match self {
            Self::Lz4 => Ok(lz4_flex::block::compress(input)),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(input)
                .map_err(|e| Status::internal(format!("snappy compress: {e}"))),
        }
    }

    pub fn decompress(&self, input: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let out = match self {
            Self::Lz4 => lz4_flex::block::decompress(input, uncompressed_size)
                .map_err(|e| Status::internal(format!("lz4 decompress: {e}")))?,
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(input)
                .map_err(|e| Status::internal(format!("snappy decompress: {e}")))?,
        };
        if out.len() != uncompressed_size {
            return Err(Status::internal(format!(
                "decompressed size mismatch: expected {} got {}",
                uncompressed_size,
                out.len()
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_and_snappy_round_trip() {
        let input: Vec<u8> = (0..4096u32).map(|i| (i % 7) as u8).collect();
        for codec in [BlockCompression::Lz4, BlockCompression::Snappy] {
            let compressed = codec.compress(&input).expect("compress");
            assert!(compressed.len() < input.len());
            let out = codec.decompress(&compressed, input.len()).expect("decompress");
            assert_eq!(out, input);
        }
    }

    #[test]
    fn zlib_tag_is_unimplemented() {
        let err = BlockCompression::for_compress_type(CompressType::Zlib).unwrap_err();
        assert_eq!(err.code, crate::common::status::StatusCode::Unimplemented);
    }
}
