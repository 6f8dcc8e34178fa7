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
//! Numeric-typed aggregate functions.
//!
//! Each function dispatches on the declared argument type once per batch;
//! states are plain PODs except where a set or string accumulates.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Float32Array, Float64Array,
    Int8Array, Int16Array, Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use roaring::RoaringBitmap;

use crate::common::status::{Result, Status};
use crate::exec::expr::agg::function::{state_mut, state_ref, AggStatePtr, AggregateFunction};
use crate::exec::hash_table::key_set::canonical_key_bits;

pub(crate) fn is_float_type(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Float32 | DataType::Float64)
}

pub(crate) fn value_f64(array: &ArrayRef, row: usize) -> Result<f64> {
    let v = match array.data_type() {
        DataType::Int8 => downcast::<Int8Array>(array)?.value(row) as f64,
        DataType::Int16 => downcast::<Int16Array>(array)?.value(row) as f64,
        DataType::Int32 => downcast::<Int32Array>(array)?.value(row) as f64,
        DataType::Int64 => downcast::<Int64Array>(array)?.value(row) as f64,
        DataType::Float32 => downcast::<Float32Array>(array)?.value(row) as f64,
        DataType::Float64 => downcast::<Float64Array>(array)?.value(row),
        DataType::Date32 => downcast::<Date32Array>(array)?.value(row) as f64,
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            downcast::<TimestampMicrosecondArray>(array)?.value(row) as f64
        }
        DataType::Boolean => downcast::<BooleanArray>(array)?.value(row) as i64 as f64,
        other => {
            return Err(Status::internal(format!(
                "not a numeric aggregate argument: {other:?}"
            )))
        }
    };
    Ok(v)
}

pub(crate) fn value_i64(array: &ArrayRef, row: usize) -> Result<i64> {
    let v = match array.data_type() {
        DataType::Int8 => downcast::<Int8Array>(array)?.value(row) as i64,
        DataType::Int16 => downcast::<Int16Array>(array)?.value(row) as i64,
        DataType::Int32 => downcast::<Int32Array>(array)?.value(row) as i64,
        DataType::Int64 => downcast::<Int64Array>(array)?.value(row),
        DataType::Date32 => downcast::<Date32Array>(array)?.value(row) as i64,
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            downcast::<TimestampMicrosecondArray>(array)?.value(row)
        }
        DataType::Boolean => downcast::<BooleanArray>(array)?.value(row) as i64,
        other => {
            return Err(Status::internal(format!(
                "not an integer aggregate argument: {other:?}"
            )))
        }
    };
    Ok(v)
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Status::internal("aggregate argument downcast failed"))
}

fn arg0<'a>(input: &'a [ArrayRef]) -> Result<&'a ArrayRef> {
    input
        .first()
        .ok_or_else(|| Status::internal("aggregate expects at least one argument"))
}

fn check_rows(states: &[AggStatePtr], rows: usize) -> Result<()> {
    if states.len() != rows {
        return Err(Status::internal("aggregate state/row count mismatch"));
    }
    Ok(())
}

fn binary_rows<'a>(input: &'a ArrayRef) -> Result<&'a BinaryArray> {
    input
        .as_any()
        .downcast_ref::<BinaryArray>()
        .ok_or_else(|| Status::internal("intermediate aggregate column must be Binary"))
}

/// `count` / `count(*)`: one per row; the nullable rendition skips nulls but
/// still finalizes to 0, never NULL.
pub struct CountAgg {
    skip_nulls: bool,
}

impl CountAgg {
    pub fn new(skip_nulls: bool) -> Self {
        Self { skip_nulls }
    }
}

impl AggregateFunction for CountAgg {
    fn name(&self) -> &str {
        "count"
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Int64
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<i64>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<i64>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut i64).write(0) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        if let Some(arg) = input.first() {
            check_rows(states, arg.len())?;
            for (row, state) in states.iter().enumerate() {
                if self.skip_nulls && arg.is_null(row) {
                    continue;
                }
                unsafe { *state_mut::<i64>(*state) += 1 };
            }
        } else {
            for state in states {
                unsafe { *state_mut::<i64>(*state) += 1 };
            }
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = downcast::<Int64Array>(input)?;
        for (row, state) in states.iter().enumerate() {
            if !arr.is_null(row) {
                unsafe { *state_mut::<i64>(*state) += arr.value(row) };
            }
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<i64> = states.iter().map(|s| unsafe { *state_ref::<i64>(*s) }).collect();
        Ok(Arc::new(Int64Array::from(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}

#[derive(Clone, Copy, Default)]
struct SumState {
    i: i64,
    f: f64,
}

/// `sum`: integer arguments sum to BIGINT, float arguments to DOUBLE.
pub struct SumAgg {
    float: bool,
}

impl SumAgg {
    pub fn new(arg_type: &DataType) -> Self {
        Self {
            float: is_float_type(arg_type),
        }
    }

    fn acc_type(&self) -> DataType {
        if self.float {
            DataType::Float64
        } else {
            DataType::Int64
        }
    }
}

impl AggregateFunction for SumAgg {
    fn name(&self) -> &str {
        "sum"
    }

    fn intermediate_type(&self) -> DataType {
        self.acc_type()
    }

    fn output_type(&self) -> DataType {
        self.acc_type()
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<SumState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<SumState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut SumState).write(SumState::default()) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let st = unsafe { state_mut::<SumState>(*state) };
            if self.float {
                st.f += value_f64(arg, row)?;
            } else {
                st.i = st.i.wrapping_add(value_i64(arg, row)?);
            }
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        for (row, state) in states.iter().enumerate() {
            if input.is_null(row) {
                continue;
            }
            let st = unsafe { state_mut::<SumState>(*state) };
            if self.float {
                st.f += value_f64(input, row)?;
            } else {
                st.i = st.i.wrapping_add(value_i64(input, row)?);
            }
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        if self.float {
            let values: Vec<f64> = states
                .iter()
                .map(|s| unsafe { state_ref::<SumState>(*s).f })
                .collect();
            Ok(Arc::new(Float64Array::from(values)))
        } else {
            let values: Vec<i64> = states
                .iter()
                .map(|s| unsafe { state_ref::<SumState>(*s).i })
                .collect();
            Ok(Arc::new(Int64Array::from(values)))
        }
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}

#[derive(Clone, Copy, Default)]
struct AvgState {
    sum: f64,
    count: i64,
}

/// `avg`: DOUBLE mean; the intermediate carries `(sum, count)`.
pub struct AvgAgg;

impl AggregateFunction for AvgAgg {
    fn name(&self) -> &str {
        "avg"
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<AvgState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<AvgState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut AvgState).write(AvgState::default()) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let st = unsafe { state_mut::<AvgState>(*state) };
            st.sum += value_f64(arg, row)?;
            st.count += 1;
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = binary_rows(input)?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let bytes = arr.value(row);
            if bytes.len() != 16 {
                return Err(Status::internal("bad avg intermediate length"));
            }
            let st = unsafe { state_mut::<AvgState>(*state) };
            st.sum += f64::from_le_bytes(bytes[0..8].try_into().unwrap());
            st.count += i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Vec<u8>> = states
            .iter()
            .map(|s| {
                let st = unsafe { state_ref::<AvgState>(*s) };
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&st.sum.to_le_bytes());
                out.extend_from_slice(&st.count.to_le_bytes());
                out
            })
            .collect();
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Option<f64>> = states
            .iter()
            .map(|s| {
                let st = unsafe { state_ref::<AvgState>(*s) };
                if st.count == 0 {
                    None
                } else {
                    Some(st.sum / st.count as f64)
                }
            })
            .collect();
        Ok(Arc::new(Float64Array::from(values)))
    }
}

#[derive(Clone, Copy, Default)]
struct MinMaxState {
    valid: bool,
    bits: u64,
}

/// `min` / `max` over fixed-width arguments; ordering is by the argument's
/// natural order, not the bit pattern.
pub struct MinMaxAgg {
    arg_type: DataType,
    is_min: bool,
}

impl MinMaxAgg {
    pub fn new(arg_type: DataType, is_min: bool) -> Self {
        Self { arg_type, is_min }
    }

    fn better(&self, candidate: u64, current: u64) -> bool {
        use std::cmp::Ordering;
        let ord = if is_float_type(&self.arg_type) {
            let (cand, cur) = if self.arg_type == DataType::Float32 {
                (
                    f32::from_bits(candidate as u32) as f64,
                    f32::from_bits(current as u32) as f64,
                )
            } else {
                (f64::from_bits(candidate), f64::from_bits(current))
            };
            cand.partial_cmp(&cur).unwrap_or(Ordering::Equal)
        } else {
            (candidate as i64).cmp(&(current as i64))
        };
        if self.is_min {
            ord == Ordering::Less
        } else {
            ord == Ordering::Greater
        }
    }
}

impl AggregateFunction for MinMaxAgg {
    fn name(&self) -> &str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }

    fn intermediate_type(&self) -> DataType {
        self.arg_type.clone()
    }

    fn output_type(&self) -> DataType {
        self.arg_type.clone()
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<MinMaxState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<MinMaxState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut MinMaxState).write(MinMaxState::default()) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let bits = canonical_key_bits(arg, row)?;
            let st = unsafe { state_mut::<MinMaxState>(*state) };
            if !st.valid || self.better(bits, st.bits) {
                st.valid = true;
                st.bits = bits;
            }
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        for (row, state) in states.iter().enumerate() {
            if input.is_null(row) {
                continue;
            }
            let bits = canonical_key_bits(input, row)?;
            let st = unsafe { state_mut::<MinMaxState>(*state) };
            if !st.valid || self.better(bits, st.bits) {
                st.valid = true;
                st.bits = bits;
            }
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let mut bits = Vec::with_capacity(states.len());
        let mut valid = Vec::with_capacity(states.len());
        for state in states {
            let st = unsafe { state_ref::<MinMaxState>(*state) };
            bits.push(st.bits);
            valid.push(st.valid);
        }
        crate::exec::expr::agg::bits_array(&self.arg_type, &bits, &valid)
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}

struct MinMaxStringState {
    value: Option<String>,
}

/// `min` / `max` over UTF-8 arguments.
pub struct MinMaxStringAgg {
    is_min: bool,
}

impl MinMaxStringAgg {
    pub fn new(is_min: bool) -> Self {
        Self { is_min }
    }

    fn consider(&self, st: &mut MinMaxStringState, candidate: &str) {
        let replace = match st.value.as_deref() {
            None => true,
            Some(current) => {
                if self.is_min {
                    candidate < current
                } else {
                    candidate > current
                }
            }
        };
        if replace {
            st.value = Some(candidate.to_string());
        }
    }
}

impl AggregateFunction for MinMaxStringAgg {
    fn name(&self) -> &str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Utf8
    }

    fn output_type(&self) -> DataType {
        DataType::Utf8
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<MinMaxStringState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<MinMaxStringState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut MinMaxStringState).write(MinMaxStringState { value: None }) };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut MinMaxStringState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        let arr = downcast::<StringArray>(arg)?;
        for (row, state) in states.iter().enumerate() {
            let st = unsafe { state_mut::<MinMaxStringState>(*state) };
            self.consider(st, arr.value(row));
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = downcast::<StringArray>(input)?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let st = unsafe { state_mut::<MinMaxStringState>(*state) };
            self.consider(st, arr.value(row));
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Option<String>> = states
            .iter()
            .map(|s| unsafe { state_ref::<MinMaxStringState>(*s).value.clone() })
            .collect();
        Ok(Arc::new(StringArray::from(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}

#[derive(Clone, Copy, Default)]
struct VarState {
    count: i64,
    mean: f64,
    m2: f64,
}

impl VarState {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn merge(&mut self, other: &VarState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.mean += delta * other.count as f64 / total as f64;
        self.count = total;
    }
}

/// Welford-style `variance` / `stddev` family; `sample` picks the `n-1`
/// denominator, `stddev` takes the square root at finalize.
pub struct VarianceAgg {
    display_name: &'static str,
    sample: bool,
    stddev: bool,
}

impl VarianceAgg {
    pub fn new(display_name: &'static str, sample: bool, stddev: bool) -> Self {
        Self {
            display_name,
            sample,
            stddev,
        }
    }
}

impl AggregateFunction for VarianceAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<VarState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<VarState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut VarState).write(VarState::default()) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let st = unsafe { state_mut::<VarState>(*state) };
            st.update(value_f64(arg, row)?);
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = binary_rows(input)?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let bytes = arr.value(row);
            if bytes.len() != 24 {
                return Err(Status::internal("bad variance intermediate length"));
            }
            let other = VarState {
                count: i64::from_le_bytes(bytes[0..8].try_into().unwrap()),
                mean: f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
                m2: f64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            };
            let st = unsafe { state_mut::<VarState>(*state) };
            st.merge(&other);
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Vec<u8>> = states
            .iter()
            .map(|s| {
                let st = unsafe { state_ref::<VarState>(*s) };
                let mut out = Vec::with_capacity(24);
                out.extend_from_slice(&st.count.to_le_bytes());
                out.extend_from_slice(&st.mean.to_le_bytes());
                out.extend_from_slice(&st.m2.to_le_bytes());
                out
            })
            .collect();
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Option<f64>> = states
            .iter()
            .map(|s| {
                let st = unsafe { state_ref::<VarState>(*s) };
                let denom = if self.sample {
                    st.count - 1
                } else {
                    st.count
                };
                if denom <= 0 {
                    if !self.sample && st.count == 1 {
                        return Some(0.0);
                    }
                    return None;
                }
                let var = st.m2 / denom as f64;
                Some(if self.stddev { var.sqrt() } else { var })
            })
            .collect();
        Ok(Arc::new(Float64Array::from(values)))
    }
}

struct DistinctState {
    set: hashbrown::HashSet<u64>,
}

/// `multi_distinct_count` / `multi_distinct_sum`: exact distinct via a value
/// set; the intermediate is the serialized set.
pub struct MultiDistinctAgg {
    display_name: &'static str,
    count_mode: bool,
    float: bool,
}

impl MultiDistinctAgg {
    pub fn new(display_name: &'static str, count_mode: bool, arg_type: &DataType) -> Self {
        Self {
            display_name,
            count_mode,
            float: is_float_type(arg_type),
        }
    }
}

impl AggregateFunction for MultiDistinctAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        if self.count_mode {
            DataType::Int64
        } else if self.float {
            DataType::Float64
        } else {
            DataType::Int64
        }
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<DistinctState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<DistinctState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe {
            (state as *mut DistinctState).write(DistinctState {
                set: hashbrown::HashSet::new(),
            })
        };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut DistinctState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let bits = canonical_key_bits(arg, row)?;
            let st = unsafe { state_mut::<DistinctState>(*state) };
            st.set.insert(bits);
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = binary_rows(input)?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let bytes = arr.value(row);
            if bytes.len() % 8 != 0 {
                return Err(Status::internal("bad multi_distinct intermediate length"));
            }
            let st = unsafe { state_mut::<DistinctState>(*state) };
            for chunk in bytes.chunks_exact(8) {
                st.set.insert(u64::from_le_bytes(chunk.try_into().unwrap()));
            }
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Vec<u8>> = states
            .iter()
            .map(|s| {
                let st = unsafe { state_ref::<DistinctState>(*s) };
                let mut sorted: Vec<u64> = st.set.iter().copied().collect();
                sorted.sort_unstable();
                let mut out = Vec::with_capacity(sorted.len() * 8);
                for bits in sorted {
                    out.extend_from_slice(&bits.to_le_bytes());
                }
                out
            })
            .collect();
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        if self.count_mode {
            let values: Vec<i64> = states
                .iter()
                .map(|s| unsafe { state_ref::<DistinctState>(*s).set.len() as i64 })
                .collect();
            return Ok(Arc::new(Int64Array::from(values)));
        }
        if self.float {
            let values: Vec<f64> = states
                .iter()
                .map(|s| {
                    let st = unsafe { state_ref::<DistinctState>(*s) };
                    st.set.iter().map(|b| f64::from_bits(*b)).sum()
                })
                .collect();
            Ok(Arc::new(Float64Array::from(values)))
        } else {
            let values: Vec<i64> = states
                .iter()
                .map(|s| {
                    let st = unsafe { state_ref::<DistinctState>(*s) };
                    st.set
                        .iter()
                        .fold(0i64, |acc, b| acc.wrapping_add(*b as i64))
                })
                .collect();
            Ok(Arc::new(Int64Array::from(values)))
        }
    }
}

struct GroupConcatState {
    value: Option<String>,
}

/// `group_concat(col[, sep])`; the default separator matches the SQL layer.
pub struct GroupConcatAgg;

const GROUP_CONCAT_DEFAULT_SEP: &str = ", ";

impl AggregateFunction for GroupConcatAgg {
    fn name(&self) -> &str {
        "group_concat"
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Utf8
    }

    fn output_type(&self) -> DataType {
        DataType::Utf8
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<GroupConcatState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<GroupConcatState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut GroupConcatState).write(GroupConcatState { value: None }) };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut GroupConcatState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        let arr = downcast::<StringArray>(arg)?;
        let sep_arr = input.get(1).map(|a| downcast::<StringArray>(a)).transpose()?;
        for (row, state) in states.iter().enumerate() {
            let sep = sep_arr
                .filter(|a| !a.is_null(row))
                .map(|a| a.value(row))
                .unwrap_or(GROUP_CONCAT_DEFAULT_SEP);
            let st = unsafe { state_mut::<GroupConcatState>(*state) };
            match st.value.as_mut() {
                None => st.value = Some(arr.value(row).to_string()),
                Some(v) => {
                    v.push_str(sep);
                    v.push_str(arr.value(row));
                }
            }
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = downcast::<StringArray>(input)?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let st = unsafe { state_mut::<GroupConcatState>(*state) };
            match st.value.as_mut() {
                None => st.value = Some(arr.value(row).to_string()),
                Some(v) => {
                    v.push_str(GROUP_CONCAT_DEFAULT_SEP);
                    v.push_str(arr.value(row));
                }
            }
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<Option<String>> = states
            .iter()
            .map(|s| unsafe { state_ref::<GroupConcatState>(*s).value.clone() })
            .collect();
        Ok(Arc::new(StringArray::from(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}

struct BitmapState {
    bitmap: RoaringBitmap,
}

/// `bitmap_union_int`: exact distinct count of unsigned-int-sized values.
pub struct BitmapUnionIntAgg;

impl AggregateFunction for BitmapUnionIntAgg {
    fn name(&self) -> &str {
        "bitmap_union_int"
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Binary
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<BitmapState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<BitmapState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe {
            (state as *mut BitmapState).write(BitmapState {
                bitmap: RoaringBitmap::new(),
            })
        };
    }

    fn drop_state(&self, state: AggStatePtr) {
        unsafe { std::ptr::drop_in_place(state as *mut BitmapState) };
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let v = value_i64(arg, row)?;
            let v = u32::try_from(v).map_err(|_| {
                Status::invalid_argument(format!("bitmap_union_int value out of range: {v}"))
            })?;
            let st = unsafe { state_mut::<BitmapState>(*state) };
            st.bitmap.insert(v);
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = binary_rows(input)?;
        for (row, state) in states.iter().enumerate() {
            if arr.is_null(row) {
                continue;
            }
            let other = RoaringBitmap::deserialize_from(arr.value(row))
                .map_err(|e| Status::internal(format!("bad bitmap intermediate: {e}")))?;
            let st = unsafe { state_mut::<BitmapState>(*state) };
            st.bitmap |= other;
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let mut values = Vec::with_capacity(states.len());
        for state in states {
            let st = unsafe { state_ref::<BitmapState>(*state) };
            let mut bytes = Vec::with_capacity(st.bitmap.serialized_size());
            st.bitmap
                .serialize_into(&mut bytes)
                .map_err(|e| Status::internal(format!("bitmap serialize: {e}")))?;
            values.push(bytes);
        }
        Ok(Arc::new(BinaryArray::from_iter_values(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<i64> = states
            .iter()
            .map(|s| unsafe { state_ref::<BitmapState>(*s).bitmap.len() as i64 })
            .collect();
        Ok(Arc::new(Int64Array::from(values)))
    }
}

/// Counter-backed window functions: `row_number`, `rank`, `dense_rank`.
/// Frame-sensitive ordering is applied by the analytic operator; at the
/// registry level they are running counters.
pub struct CounterWindowAgg {
    display_name: &'static str,
}

impl CounterWindowAgg {
    pub fn new(display_name: &'static str) -> Self {
        Self { display_name }
    }
}

impl AggregateFunction for CounterWindowAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        DataType::Int64
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<i64>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<i64>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut i64).write(0) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], _input: &[ArrayRef]) -> Result<()> {
        for state in states {
            unsafe { *state_mut::<i64>(*state) += 1 };
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        let arr = downcast::<Int64Array>(input)?;
        for (row, state) in states.iter().enumerate() {
            if !arr.is_null(row) {
                unsafe { *state_mut::<i64>(*state) += arr.value(row) };
            }
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let values: Vec<i64> = states.iter().map(|s| unsafe { *state_ref::<i64>(*s) }).collect();
        Ok(Arc::new(Int64Array::from(values)))
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}

/// Value-keeping window functions: `first_value`, `last_value`, `lead`,
/// `lag`. First-value keeps the first seen value, the rest keep the latest.
pub struct ValueWindowAgg {
    display_name: &'static str,
    arg_type: DataType,
    keep_first: bool,
}

impl ValueWindowAgg {
    pub fn new(display_name: &'static str, arg_type: DataType, keep_first: bool) -> Self {
        Self {
            display_name,
            arg_type,
            keep_first,
        }
    }
}

impl AggregateFunction for ValueWindowAgg {
    fn name(&self) -> &str {
        self.display_name
    }

    fn intermediate_type(&self) -> DataType {
        self.arg_type.clone()
    }

    fn output_type(&self) -> DataType {
        self.arg_type.clone()
    }

    fn state_size(&self) -> usize {
        std::mem::size_of::<MinMaxState>()
    }

    fn state_align(&self) -> usize {
        std::mem::align_of::<MinMaxState>()
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { (state as *mut MinMaxState).write(MinMaxState::default()) };
    }

    fn drop_state(&self, _state: AggStatePtr) {}

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = arg0(input)?;
        check_rows(states, arg.len())?;
        for (row, state) in states.iter().enumerate() {
            let st = unsafe { state_mut::<MinMaxState>(*state) };
            if self.keep_first && st.valid {
                continue;
            }
            st.valid = true;
            st.bits = canonical_key_bits(arg, row)?;
        }
        Ok(())
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        check_rows(states, input.len())?;
        for (row, state) in states.iter().enumerate() {
            if input.is_null(row) {
                continue;
            }
            let st = unsafe { state_mut::<MinMaxState>(*state) };
            if self.keep_first && st.valid {
                continue;
            }
            st.valid = true;
            st.bits = canonical_key_bits(input, row)?;
        }
        Ok(())
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let mut bits = Vec::with_capacity(states.len());
        let mut valid = Vec::with_capacity(states.len());
        for state in states {
            let st = unsafe { state_ref::<MinMaxState>(*state) };
            bits.push(st.bits);
            valid.push(st.valid);
        }
        crate::exec::expr::agg::bits_array(&self.arg_type, &bits, &valid)
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        self.serialize_states(states)
    }
}
