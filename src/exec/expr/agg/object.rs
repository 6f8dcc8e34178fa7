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
//! Object-typed aggregates over composite states: HyperLogLog sketches,
//! roaring bitmaps and percentile samples.
//!
//! The HLL wire format is tagged `EMPTY | EXPLICIT | FULL`: explicit keeps
//! up to 160 raw hashes, full is the dense 16K register file.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BinaryArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::DataType;
use roaring::RoaringBitmap;

use crate::common::status::{Result, Status};
use crate::exec::expr::agg::function::{state_mut, state_ref, AggStatePtr, AggregateFunction};
use crate::exec::expr::agg::numeric::value_f64;
use crate::exec::hash_table::key_set::canonical_key_bits;

const HLL_DATA_EMPTY: u8 = 0;
const HLL_DATA_EXPLICIT: u8 = 1;
const HLL_DATA_FULL: u8 = 3;

const HLL_COLUMN_PRECISION: usize = 14;
const HLL_REGISTERS_COUNT: usize = 16 * 1024;
const HLL_EXPLICIT_MAX: usize = 160;

const MURMUR_PRIME: u64 = 0xc6a4_a793_5bd1_e995;
const MURMUR_SEED: u32 = 0xadc8_3b19;

fn murmur_hash64a(data: &[u8], seed: u32) -> u64 {
    let mut h: u64 = (seed as u64) ^ (data.len() as u64).wrapping_mul(MURMUR_PRIME);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(MURMUR_PRIME);
        k ^= k >> 47;
        k = k.wrapping_mul(MURMUR_PRIME);
        h ^= k;
        h = h.wrapping_mul(MURMUR_PRIME);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut k = 0u64;
        for (i, byte) in rest.iter().enumerate() {
            k |= (*byte as u64) << (8 * i);
        }
        h ^= k;
        h = h.wrapping_mul(MURMUR_PRIME);
    }
    h ^= h >> 47;
    h = h.wrapping_mul(MURMUR_PRIME);
    h ^= h >> 47;
    h
}

#[derive(Default)]
struct HllState {
    explicit: Option<Vec<u64>>,
    registers: Option<Box<[u8]>>,
}

impl HllState {
    fn add_hash(&mut self, hash: u64) {
        if hash == 0 {
            return;
        }
        if self.registers.is_none() {
            let explicit = self.explicit.get_or_insert_with(Vec::new);
            if !explicit.contains(&hash) {
                explicit.push(hash);
            }
            if explicit.len() <= HLL_EXPLICIT_MAX {
                return;
            }
            // Promote to the dense register file.
            let hashes = self.explicit.take().unwrap_or_default();
            self.registers = Some(vec![0u8; HLL_REGISTERS_COUNT].into_boxed_slice());
            for h in hashes {
                self.update_register(h);
            }
            return;
        }
        self.update_register(hash);
    }

    fn update_register(&mut self, hash: u64) {
        let registers = self
            .registers
            .get_or_insert_with(|| vec![0u8; HLL_REGISTERS_COUNT].into_boxed_slice());
        let idx = (hash % HLL_REGISTERS_COUNT as u64) as usize;
        let mut shifted = hash >> HLL_COLUMN_PRECISION;
        shifted |= 1_u64 << (64 - HLL_COLUMN_PRECISION);
        let rank = shifted.trailing_zeros() as u8 + 1;
        if registers[idx] < rank {
            registers[idx] = rank;
        }
    }

    fn merge_serialized(&mut self, bytes: &[u8]) -> Result<()> {
        let tag = *bytes
            .first()
            .ok_or_else(|| Status::internal("empty hll payload"))?;
        match tag {
            HLL_DATA_EMPTY => Ok(()),
            HLL_DATA_EXPLICIT => {
                if bytes.len() < 2 {
                    return Err(Status::internal("malformed explicit hll payload"));
                }
                let count = bytes[1] as usize;
                if bytes.len() != 2 + count * 8 {
                    return Err(Status::internal("malformed explicit hll payload"));
                }
                for chunk in bytes[2..].chunks_exact(8) {
                    self.add_hash(u64::from_le_bytes(chunk.try_into().unwrap()));
                }
                Ok(())
            }
            HLL_DATA_FULL => {
                if bytes.len() != 1 + HLL_REGISTERS_COUNT {
                    return Err(Status::internal("malformed full hll payload"));
                }
                if let Some(explicit) = self.explicit.take() {
                    self.registers =
                        Some(vec![0u8; HLL_REGISTERS_COUNT].into_boxed_slice());
                    for h in explicit {
                        self.update_register(h);
                    }
                }
                let registers = self
                    .registers
                    .get_or_insert_with(|| vec![0u8; HLL_REGISTERS_COUNT].into_boxed_slice());
                for (reg, other) in registers.iter_mut().zip(bytes[1..].iter()) {
                    if *reg < *other {
                        *reg = *other;
                    }
                }
                Ok(())
            }
            other => Err(Status::internal(format!("unknown hll payload tag {other}"))),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        if let Some(registers) = self.registers.as_ref() {
            let mut out = Vec::with_capacity(1 + HLL_REGISTERS_COUNT);
            out.push(HLL_DATA_FULL);
            out.extend_from_slice(registers);
            return out;
        }
        match self.explicit.as_ref() {
            None => vec![HLL_DATA_EMPTY],
            Some(hashes) => {
                let mut out = Vec::with_capacity(2 + hashes.len() * 8);
                out.push(HLL_DATA_EXPLICIT);
                out.push(hashes.len() as u8);
                for h in hashes {
                    out.extend_from_slice(&h.to_le_bytes());
                }
                out
            }
        }
    }

    fn estimate(&self) -> i64 {
        if let Some(explicit) = self.explicit.as_ref() {
            return explicit.len() as i64;
        }
        let Some(registers) = self.registers.as_ref() else {
            return 0;
        };
        let m = HLL_REGISTERS_COUNT as f64;
        let mut sum = 0.0f64;
        let mut zeros = 0usize;
        for reg in registers.iter() {
            sum += 1.0 / (1u64 << *reg) as f64;
            if *reg == 0 {
                zeros += 1;
            }
        }
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let mut estimate = alpha * m * m / sum;
        if estimate <= 2.5 * m && zeros > 0 {
            estimate = m * (m / zeros as f64).ln();
        }
        estimate.round() as i64
    }
}

/// HLL-backed aggregates: `ndv` / `approx_count_distinct` hash raw values,
/// `hll_union` / `hll_raw_agg` fold serialized sketches, `hll_union_agg`
/// folds sketches and finalizes to a count.
pub struct HllAgg {
    display_name: &'static str,
    arg_type: DataType,
    input_is_hll: bool,
    output_count: bool,
}

impl HllAgg {
    pub fn ndv(display_name: &'static str, arg_type: DataType) -> Self {
        Self {
            display_name,
            arg_type,
            input_is_hll: false,
            output_count: true,
        }
    }

    pub fn union(display_name: &'static str) -> Self {
        Self {
            display_name,
            arg_type: DataType::Binary,
            input_is_hll: true,
            output_count: false,
        }
    }

    pub fn union_count(display_name: &'static str) -> Self {
        Self {
            display_name,
            arg_type: DataType::Binary,
            input_is_hll: true,
            output_count: true,
        }
    }

    fn hash_value(&self, array: &ArrayRef, row: usize) -> Result<u64> {
        if self.arg_type == DataType::Utf8 {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Status::internal("ndv expects Utf8 argument"))?;
            return Ok(murmur_hash64a(arr.value(row).as_bytes(), MURMUR_SEED));
        }
        let bits = canonical_key_bits(array, row)?;
        Ok(murmur_hash64a(&bits.to_le_bytes(), MURMUR_SEED))
    }
}

impl AggregateFunction for HllAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        if self.output_count {
            DataType::Int64
        } else {
            DataType::Binary
        }
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<HllState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<HllState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut HllState).write(HllState::default()) };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut HllState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = input
            .first()
            .ok_or_else(|| Status::internal("hll aggregate expects one argument"))?;
        if states.len() != arg.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        if self.input_is_hll {
            let arr = arg
                .as_any()
                .downcast_ref::<BinaryArray>()
                .ok_or_else(|| Status::internal("hll union expects Binary argument"))?;
            for (row, state) in states.iter().enumerate() {
                let st = unsafe { state_mut::<HllState>(*state) };
                st.merge_serialized(arr.value(row))?;
            }
        } else {
            for (row, state) in states.iter().enumerate() {
                let hash = self.hash_value(arg, row)?;
                let st = unsafe { state_mut::<HllState>(*state) };
                st.add_hash(hash);
            }
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        if states.len() != input.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        let arr = input
            .as_any()
            .downcast_ref::<BinaryArray>()
            .ok_or_else(|| Status::internal("hll intermediate must be Binary"))?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let st = unsafe { state_mut::<HllState>(*state) };
            st.merge_serialized(arr.value(row))?;
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Vec<u8>> = states
            .iter()
            .map(|s| unsafe { state_ref::<HllState>(*s) }.serialize())
            .collect();
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        if self.output_count {
            let values: Vec<i64> = states
                .iter()
                .map(|s| unsafe { state_ref::<HllState>(*s) }.estimate())
                .collect();
            Ok(Arc::new(Int64Array::from(values)))
        } else {
            self.serialize_states(states)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitmapMode {
    Union,
    UnionCount,
    Intersect,
    IntersectCount,
}

struct BitmapAggState {
    bitmap: Option<RoaringBitmap>,
}

/// Bitmap aggregates over serialized roaring bitmaps. Intersect semantics
/// treat the first input as the initial set.
pub struct BitmapAgg {
    display_name: &'static str,
    mode: BitmapMode,
}

impl BitmapAgg {
    pub fn new(display_name: &'static str, mode: BitmapMode) -> Self {
        Self { display_name, mode }
    }

    fn is_intersect(&self) -> bool {
        matches!(self.mode, BitmapMode::Intersect | BitmapMode::IntersectCount)
    }

    fn fold(&self, st: &mut BitmapAggState, other: RoaringBitmap) {
        match st.bitmap.as_mut() {
            None => st.bitmap = Some(other),
            Some(current) => {
                if self.is_intersect() {
                    *current &= other;
                } else {
                    *current |= other;
                }
            }
        }
    }
}

impl AggregateFunction for BitmapAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        match self.mode {
            BitmapMode::Union | BitmapMode::Intersect => DataType::Binary,
            BitmapMode::UnionCount | BitmapMode::IntersectCount => DataType::Int64,
        }
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<BitmapAggState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<BitmapAggState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut BitmapAggState).write(BitmapAggState { bitmap: None }) };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut BitmapAggState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = input
            .first()
            .ok_or_else(|| Status::internal("bitmap aggregate expects one argument"))?;
        if states.len() != arg.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        let arr = arg
            .as_any()
            .downcast_ref::<BinaryArray>()
            .ok_or_else(|| Status::internal("bitmap aggregate expects Binary argument"))?;
        for (row, state) in states.iter().enumerate() {
            let other = RoaringBitmap::deserialize_from(arr.value(row))
                .map_err(|e| Status::internal(format!("bad bitmap payload: {e}")))?;
            let st = unsafe { state_mut::<BitmapAggState>(*state) };
            self.fold(st, other);
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        if states.len() != input.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        let arr = input
            .as_any()
            .downcast_ref::<BinaryArray>()
            .ok_or_else(|| Status::internal("bitmap intermediate must be Binary"))?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let other = RoaringBitmap::deserialize_from(arr.value(row))
                .map_err(|e| Status::internal(format!("bad bitmap intermediate: {e}")))?;
            let st = unsafe { state_mut::<BitmapAggState>(*state) };
            self.fold(st, other);
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let mut values = Vec::with_capacity(states.len());
        for state in states {
            let st = unsafe { state_ref::<BitmapAggState>(*state) };
            let bitmap = st.bitmap.clone().unwrap_or_default();
            let mut bytes = Vec::with_capacity(bitmap.serialized_size());
            bitmap
                .serialize_into(&mut bytes)
                .map_err(|e| Status::internal(format!("bitmap serialize: {e}")))?;
            values.push(bytes);
        }
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        match self.mode {
            BitmapMode::Union | BitmapMode::Intersect => self.serialize_states(states),
            BitmapMode::UnionCount | BitmapMode::IntersectCount => {
                let values: Vec<i64> = states
                    .iter()
                    .map(|s| unsafe { state_ref::<BitmapAggState>(*s) }
                        .bitmap
                        .as_ref()
                        .map(|b| b.len() as i64)
                        .unwrap_or(0))
                    .collect();
                Ok(Arc::new(Int64Array::from(values)))
            }
        }
    }
}

struct PercentileState {
    percentile: f64,
    values: Vec<f64>,
}

/// `percentile_approx(value, p)` and `percentile_union`. The state keeps the
/// exact collected sample; the serialized form is `p` followed by the sorted
/// sample.
pub struct PercentileAgg {
    display_name: &'static str,
    union_mode: bool,
}

impl PercentileAgg {
    pub fn approx() -> Self {
        Self {
            display_name: "percentile_approx",
            union_mode: false,
        }
    }

    pub fn union() -> Self {
        Self {
            display_name: "percentile_union",
            union_mode: true,
        }
    }

    fn quantile(st: &PercentileState) -> Option<f64> {
        if st.values.is_empty() {
            return None;
        }
        let mut sorted = st.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let p = st.percentile.clamp(0.0, 1.0);
        let rank = p * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        if lo == hi {
            return Some(sorted[lo]);
        }
        let frac = rank - lo as f64;
        Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
    }

    fn serialize_state(st: &PercentileState) -> Vec<u8> {
        let mut sorted = st.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mut out = Vec::with_capacity(12 + sorted.len() * 8);
        out.extend_from_slice(&st.percentile.to_le_bytes());
        out.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
        for v in sorted {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn merge_bytes(st: &mut PercentileState, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 12 {
            return Err(Status::internal("bad percentile payload"));
        }
        let p = f64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        if bytes.len() != 12 + count * 8 {
            return Err(Status::internal("bad percentile payload length"));
        }
        if st.values.is_empty() {
            st.percentile = p;
        }
        for chunk in bytes[12..].chunks_exact(8) {
            st.values
                .push(f64::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(())
    }
}

impl AggregateFunction for PercentileAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        if self.union_mode {
            DataType::Binary
        } else {
            DataType::Float64
        }
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<PercentileState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<PercentileState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe {
            (state as *mut PercentileState).write(PercentileState {
                percentile: 0.5,
                values: Vec::new(),
            })
        };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut PercentileState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = input
            .first()
            .ok_or_else(|| Status::internal("percentile aggregate expects arguments"))?;
        if states.len() != arg.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        if self.union_mode {
            let arr = arg
                .as_any()
                .downcast_ref::<BinaryArray>()
                .ok_or_else(|| Status::internal("percentile_union expects Binary argument"))?;
            for (row, state) in states.iter().enumerate() {
                let st = unsafe { state_mut::<PercentileState>(*state) };
                Self::merge_bytes(st, arr.value(row))?;
            }
            return Ok(());
        }
        let percentile_arg = input.get(1);
        for (row, state) in states.iter().enumerate() {
            let st = unsafe { state_mut::<PercentileState>(*state) };
            if let Some(parr) = percentile_arg {
                if !parr.is_null(row) {
                    st.percentile = value_f64(parr, row)?;
                }
            }
            st.values.push(value_f64(arg, row)?);
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        if states.len() != input.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        let arr = input
            .as_any()
            .downcast_ref::<BinaryArray>()
            .ok_or_else(|| Status::internal("percentile intermediate must be Binary"))?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let st = unsafe { state_mut::<PercentileState>(*state) };
            Self::merge_bytes(st, arr.value(row))?;
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Vec<u8>> = states
            .iter()
            .map(|s| Self::serialize_state(unsafe { state_ref::<PercentileState>(*s) }))
            .collect();
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        if self.union_mode {
            return self.serialize_states(states);
        }
        let values: Vec<Option<f64>> = states
            .iter()
            .map(|s| Self::quantile(unsafe { state_ref::<PercentileState>(*s) }))
            .collect();
        Ok(Arc::new(Float64Array::from(values)))
    }
}
