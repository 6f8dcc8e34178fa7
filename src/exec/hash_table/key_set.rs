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
//! Typed hash-set family behind `GROUP BY` / `DISTINCT`.
//!
//! The set is specialized on key shape: one fixed-width column (with an
//! optional nullable wrapper carrying a separate `has_null_key` bit), one
//! string column (keys pinned in a [`KeyArena`] as `(ptr, len, hash)`), or
//! multiple columns row-serialized into a scratch buffer. Two build modes
//! exist: inserting, and probe-only reporting `not_found[]` so a
//! low-reduction first aggregation stage can skip local aggregation.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::raw::RawTable;

use crate::common::status::{Result, Status};
use crate::exec::hash_table::hash::{
    canonical_f32_bits, canonical_f64_bits, hash_bytes_with_seed, hash_u64_with_seed,
    seed_from_hasher,
};
use crate::exec::hash_table::key_arena::{KeyArena, SliceKey};

/// Bytes reserved past the last serialized row so a vectorized memory
/// compare may read one full vector without faulting.
pub const SLICE_MEMEQUAL_OVERFLOW_PADDING: usize = 32;

/// Extract a fixed-width key value as canonical 64-bit bits.
pub fn canonical_key_bits(array: &ArrayRef, row: usize) -> Result<u64> {
    let bits = match array.data_type() {
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array, "Boolean")?;
            arr.value(row) as u64
        }
        DataType::Int8 => downcast::<Int8Array>(array, "Int8")?.value(row) as i64 as u64,
        DataType::Int16 => downcast::<Int16Array>(array, "Int16")?.value(row) as i64 as u64,
        DataType::Int32 => downcast::<Int32Array>(array, "Int32")?.value(row) as i64 as u64,
        DataType::Int64 => downcast::<Int64Array>(array, "Int64")?.value(row) as u64,
        DataType::Date32 => downcast::<Date32Array>(array, "Date32")?.value(row) as i64 as u64,
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            downcast::<TimestampMicrosecondArray>(array, "Timestamp")?.value(row) as u64
        }
        DataType::Float32 => canonical_f32_bits(downcast::<Float32Array>(array, "Float32")?.value(row)) as u64,
        DataType::Float64 => canonical_f64_bits(downcast::<Float64Array>(array, "Float64")?.value(row)),
        other => {
            return Err(Status::internal(format!(
                "not a fixed-width hash key type: {other:?}"
            )))
        }
    };
    Ok(bits)
}

pub fn is_fixed_width_key_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Date32
            | DataType::Timestamp(TimeUnit::Microsecond, _)
            | DataType::Float32
            | DataType::Float64
    )
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Status::internal(format!("failed to downcast hash key array to {name}")))
}

/// Rebuild a typed array from canonical bits; `valid[i] == false` rows are null.
pub(crate) fn bits_to_array(data_type: &DataType, bits: &[u64], valid: &[bool]) -> Result<ArrayRef> {
    macro_rules! build {
        ($arr:ty, $conv:expr) => {{
            let iter = bits
                .iter()
                .zip(valid.iter())
                .map(|(b, v)| if *v { Some($conv(*b)) } else { None });
            Arc::new(<$arr>::from_iter(iter)) as ArrayRef
        }};
    }
    let array: ArrayRef = match data_type {
        DataType::Boolean => build!(BooleanArray, |b: u64| b != 0),
        DataType::Int8 => build!(Int8Array, |b: u64| b as i64 as i8),
        DataType::Int16 => build!(Int16Array, |b: u64| b as i64 as i16),
        DataType::Int32 => build!(Int32Array, |b: u64| b as i64 as i32),
        DataType::Int64 => build!(Int64Array, |b: u64| b as i64),
        DataType::Date32 => build!(Date32Array, |b: u64| b as i64 as i32),
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            build!(TimestampMicrosecondArray, |b: u64| b as i64)
        }
        DataType::Float32 => build!(Float32Array, |b: u64| f32::from_bits(b as u32)),
        DataType::Float64 => build!(Float64Array, |b: u64| f64::from_bits(b)),
        other => {
            return Err(Status::internal(format!(
                "not a fixed-width hash key type: {other:?}"
            )))
        }
    };
    Ok(array)
}

/// One fixed-width key column, no nulls.
pub struct OneNumberKeySet {
    data_type: DataType,
    table: RawTable<u64>,
    ordered: Vec<u64>,
    seed: u64,
}

impl OneNumberKeySet {
    fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            table: RawTable::new(),
            ordered: Vec::new(),
            seed: seed_from_hasher(&DefaultHashBuilder::default()),
        }
    }

    fn insert(&mut self, bits: u64) {
        let hash = hash_u64_with_seed(self.seed, bits);
        let found = self
            .table
            .find(hash, |stored| *stored == bits)
            .is_some();
        if !found {
            let seed = self.seed;
            self.table
                .insert(hash, bits, |stored| hash_u64_with_seed(seed, *stored));
            self.ordered.push(bits);
        }
    }

    fn contains(&self, bits: u64) -> bool {
        let hash = hash_u64_with_seed(self.seed, bits);
        self.table.find(hash, |stored| *stored == bits).is_some()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn keys_to_array(&self, with_null_key: bool) -> Result<ArrayRef> {
        let mut bits = self.ordered.clone();
        let mut valid = vec![true; bits.len()];
        if with_null_key {
            bits.push(0);
            valid.push(false);
        }
        bits_to_array(&self.data_type, &bits, &valid)
    }
}

/// One string key column, no nulls. String bytes are copied into the arena
/// once on first sight and never touched again; equality compares the stored
/// hash before the bytes.
pub struct OneStringKeySet {
    table: RawTable<SliceKey>,
    ordered: Vec<SliceKey>,
    seed: u64,
}

impl OneStringKeySet {
    fn new() -> Self {
        Self {
            table: RawTable::new(),
            ordered: Vec::new(),
            seed: seed_from_hasher(&DefaultHashBuilder::default()),
        }
    }

    fn insert(&mut self, bytes: &[u8], arena: &mut KeyArena) {
        let hash = hash_bytes_with_seed(self.seed, bytes);
        let found = self
            .table
            .find(hash, |stored| {
                stored.hash == hash && stored.as_slice() == bytes
            })
            .is_some();
        if !found {
            let key = arena.alloc_copy(bytes, hash);
            self.table.insert(hash, key, |stored| stored.hash);
            self.ordered.push(key);
        }
    }

    fn contains(&self, bytes: &[u8]) -> bool {
        let hash = hash_bytes_with_seed(self.seed, bytes);
        self.table
            .find(hash, |stored| {
                stored.hash == hash && stored.as_slice() == bytes
            })
            .is_some()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn keys_to_array(&self, with_null_key: bool) -> ArrayRef {
        let mut values: Vec<Option<&str>> = self
            .ordered
            .iter()
            .map(|k| Some(std::str::from_utf8(k.as_slice()).unwrap_or("")))
            .collect();
        if with_null_key {
            values.push(None);
        }
        Arc::new(StringArray::from(values))
    }
}

/// Multiple key columns row-serialized into a scratch buffer.
pub struct SerializedKeySet {
    key_types: Vec<DataType>,
    table: RawTable<SliceKey>,
    ordered: Vec<SliceKey>,
    seed: u64,
    scratch: Vec<u8>,
    slice_sizes: Vec<u32>,
    max_one_row_size: usize,
    chunk_capacity: usize,
}

impl SerializedKeySet {
    fn new(key_types: Vec<DataType>, chunk_capacity: usize) -> Self {
        let max_one_row_size = 8;
        Self {
            key_types,
            table: RawTable::new(),
            ordered: Vec::new(),
            seed: seed_from_hasher(&DefaultHashBuilder::default()),
            scratch: vec![
                0u8;
                max_one_row_size * chunk_capacity + SLICE_MEMEQUAL_OVERFLOW_PADDING
            ],
            slice_sizes: vec![0; chunk_capacity],
            max_one_row_size,
            chunk_capacity,
        }
    }

    fn max_serialize_size(&self, key_columns: &[ArrayRef]) -> Result<usize> {
        let mut max = 0usize;
        for column in key_columns {
            max += max_one_element_serialize_size(column)?;
        }
        Ok(max)
    }

    /// Serialize all key columns row-wise into the scratch buffer.
    fn serialize_rows(&mut self, chunk_size: usize, key_columns: &[ArrayRef]) -> Result<()> {
        if chunk_size > self.chunk_capacity {
            self.chunk_capacity = chunk_size;
            self.slice_sizes.resize(chunk_size, 0);
        }
        self.slice_sizes[..chunk_size].fill(0);

        let cur_max = self.max_serialize_size(key_columns)?;
        if cur_max > self.max_one_row_size
            || self.scratch.len()
                < self.max_one_row_size * self.chunk_capacity + SLICE_MEMEQUAL_OVERFLOW_PADDING
        {
            self.max_one_row_size = self.max_one_row_size.max(cur_max);
            // Over-allocate past the last row so vectorized equality cannot
            // read out of bounds.
            self.scratch = vec![
                0u8;
                self.max_one_row_size * self.chunk_capacity
                    + SLICE_MEMEQUAL_OVERFLOW_PADDING
            ];
        }

        for column in key_columns {
            for row in 0..chunk_size {
                let offset = row * self.max_one_row_size + self.slice_sizes[row] as usize;
                let written = serialize_value(column, row, &mut self.scratch[offset..])?;
                self.slice_sizes[row] += written as u32;
            }
        }
        Ok(())
    }

    fn row_slice(&self, row: usize) -> &[u8] {
        let start = row * self.max_one_row_size;
        &self.scratch[start..start + self.slice_sizes[row] as usize]
    }

    fn insert_serialized(&mut self, row: usize, arena: &mut KeyArena) {
        let bytes = {
            let slice = self.row_slice(row);
            // The scratch buffer is re-filled per chunk; the arena copy is
            // the persistent key.
            slice.to_vec()
        };
        let hash = hash_bytes_with_seed(self.seed, &bytes);
        let found = self
            .table
            .find(hash, |stored| {
                stored.hash == hash && stored.as_slice() == bytes.as_slice()
            })
            .is_some();
        if !found {
            let key = arena.alloc_copy(&bytes, hash);
            self.table.insert(hash, key, |stored| stored.hash);
            self.ordered.push(key);
        }
    }

    fn contains_serialized(&self, row: usize) -> bool {
        let bytes = self.row_slice(row);
        let hash = hash_bytes_with_seed(self.seed, bytes);
        self.table
            .find(hash, |stored| {
                stored.hash == hash && stored.as_slice() == bytes
            })
            .is_some()
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn keys_to_columns(&self) -> Result<Vec<ArrayRef>> {
        let mut cursors: Vec<usize> = vec![0; self.ordered.len()];
        let mut out = Vec::with_capacity(self.key_types.len());
        for data_type in &self.key_types {
            let mut values_bits = Vec::with_capacity(self.ordered.len());
            let mut valid = Vec::with_capacity(self.ordered.len());
            let mut strings: Vec<Option<String>> = Vec::new();
            for (idx, key) in self.ordered.iter().enumerate() {
                let bytes = key.as_slice();
                let (value, consumed) = deserialize_value(data_type, &bytes[cursors[idx]..])?;
                cursors[idx] += consumed;
                match value {
                    DeserializedValue::Null => {
                        valid.push(false);
                        values_bits.push(0);
                        if *data_type == DataType::Utf8 {
                            strings.push(None);
                        }
                    }
                    DeserializedValue::Bits(bits) => {
                        valid.push(true);
                        values_bits.push(bits);
                    }
                    DeserializedValue::Utf8(s) => {
                        valid.push(true);
                        values_bits.push(0);
                        strings.push(Some(s));
                    }
                }
            }
            let array = if *data_type == DataType::Utf8 {
                Arc::new(StringArray::from(strings)) as ArrayRef
            } else {
                bits_to_array(data_type, &values_bits, &valid)?
            };
            out.push(array);
        }
        Ok(out)
    }
}

enum DeserializedValue {
    Null,
    Bits(u64),
    Utf8(String),
}

fn fixed_width(data_type: &DataType) -> Option<usize> {
    match data_type {
        DataType::Boolean | DataType::Int8 => Some(1),
        DataType::Int16 => Some(2),
        DataType::Int32 | DataType::Date32 | DataType::Float32 => Some(4),
        DataType::Int64 | DataType::Float64 | DataType::Timestamp(TimeUnit::Microsecond, _) => {
            Some(8)
        }
        _ => None,
    }
}

fn max_one_element_serialize_size(column: &ArrayRef) -> Result<usize> {
    if let Some(width) = fixed_width(column.data_type()) {
        return Ok(1 + width);
    }
    match column.data_type() {
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(column, "Utf8")?;
            let mut max = 0usize;
            for row in 0..arr.len() {
                if !arr.is_null(row) {
                    max = max.max(arr.value(row).len());
                }
            }
            Ok(1 + 4 + max)
        }
        other => Err(Status::unimplemented(format!(
            "serialized group key over {other:?}"
        ))),
    }
}

/// Format per value: one null marker byte, then fixed-width LE bytes, or
/// `u32` length plus bytes for strings.
fn serialize_value(column: &ArrayRef, row: usize, out: &mut [u8]) -> Result<usize> {
    if column.is_null(row) {
        out[0] = 0;
        return Ok(1);
    }
    out[0] = 1;
    if let Some(width) = fixed_width(column.data_type()) {
        let bits = canonical_key_bits(column, row)?;
        out[1..1 + width].copy_from_slice(&bits.to_le_bytes()[..width]);
        return Ok(1 + width);
    }
    match column.data_type() {
        DataType::Utf8 => {
            let arr = downcast::<StringArray>(column, "Utf8")?;
            let bytes = arr.value(row).as_bytes();
            let len = u32::try_from(bytes.len())
                .map_err(|_| Status::internal("group key string too long"))?;
            out[1..5].copy_from_slice(&len.to_le_bytes());
            out[5..5 + bytes.len()].copy_from_slice(bytes);
            Ok(5 + bytes.len())
        }
        other => Err(Status::unimplemented(format!(
            "serialized group key over {other:?}"
        ))),
    }
}

fn deserialize_value(data_type: &DataType, bytes: &[u8]) -> Result<(DeserializedValue, usize)> {
    let marker = *bytes
        .first()
        .ok_or_else(|| Status::internal("truncated serialized group key"))?;
    if marker == 0 {
        return Ok((DeserializedValue::Null, 1));
    }
    if let Some(width) = fixed_width(data_type) {
        let mut le = [0u8; 8];
        le[..width].copy_from_slice(&bytes[1..1 + width]);
        let raw = u64::from_le_bytes(le);
        // Sign-extend the canonical bits for signed integer widths.
        let bits = match data_type {
            DataType::Int8 => raw as u8 as i8 as i64 as u64,
            DataType::Int16 => raw as u16 as i16 as i64 as u64,
            DataType::Int32 | DataType::Date32 => raw as u32 as i32 as i64 as u64,
            DataType::Float32 => raw,
            _ => raw,
        };
        return Ok((DeserializedValue::Bits(bits), 1 + width));
    }
    match data_type {
        DataType::Utf8 => {
            let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
            let s = std::str::from_utf8(&bytes[5..5 + len])
                .map_err(|e| Status::internal(format!("bad utf8 in serialized key: {e}")))?;
            Ok((DeserializedValue::Utf8(s.to_string()), 5 + len))
        }
        other => Err(Status::unimplemented(format!(
            "serialized group key over {other:?}"
        ))),
    }
}

/// Key-shape-specialized hash set used by `GROUP BY` / `DISTINCT`.
pub enum AggHashSet {
    OneNumber(OneNumberKeySet),
    OneNullableNumber {
        set: OneNumberKeySet,
        has_null_key: bool,
    },
    OneString(OneStringKeySet),
    OneNullableString {
        set: OneStringKeySet,
        has_null_key: bool,
    },
    Serialized(SerializedKeySet),
}

impl AggHashSet {
    /// Pick the specialization for the declared key shape.
    pub fn for_key_types(
        key_types: &[DataType],
        nullable: &[bool],
        chunk_capacity: usize,
    ) -> Result<AggHashSet> {
        if key_types.is_empty() {
            return Err(Status::invalid_argument("hash set requires group keys"));
        }
        if key_types.len() != nullable.len() {
            return Err(Status::invalid_argument(
                "hash set key/nullability length mismatch",
            ));
        }
        if key_types.len() == 1 {
            let data_type = &key_types[0];
            if is_fixed_width_key_type(data_type) {
                let set = OneNumberKeySet::new(data_type.clone());
                return Ok(if nullable[0] {
                    AggHashSet::OneNullableNumber {
                        set,
                        has_null_key: false,
                    }
                } else {
                    AggHashSet::OneNumber(set)
                });
            }
            if *data_type == DataType::Utf8 {
                let set = OneStringKeySet::new();
                return Ok(if nullable[0] {
                    AggHashSet::OneNullableString {
                        set,
                        has_null_key: false,
                    }
                } else {
                    AggHashSet::OneString(set)
                });
            }
        }
        Ok(AggHashSet::Serialized(SerializedKeySet::new(
            key_types.to_vec(),
            chunk_capacity,
        )))
    }

    /// Insert every key of the chunk, copying variable-length bytes into
    /// `arena` on first sight.
    pub fn build_set(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayRef],
        arena: &mut KeyArena,
    ) -> Result<()> {
        match self {
            AggHashSet::OneNumber(set) => {
                let column = one_key(key_columns)?;
                if column.null_count() > 0 {
                    return Err(Status::invalid_argument(
                        "null key in non-nullable group column",
                    ));
                }
                for row in 0..chunk_size {
                    set.insert(canonical_key_bits(column, row)?);
                }
                Ok(())
            }
            AggHashSet::OneNullableNumber { set, has_null_key } => {
                let column = one_key(key_columns)?;
                for row in 0..chunk_size {
                    if column.is_null(row) {
                        *has_null_key = true;
                    } else {
                        set.insert(canonical_key_bits(column, row)?);
                    }
                }
                Ok(())
            }
            AggHashSet::OneString(set) => {
                let column = one_key(key_columns)?;
                let arr = downcast::<StringArray>(column, "Utf8")?;
                if arr.null_count() > 0 {
                    return Err(Status::invalid_argument(
                        "null key in non-nullable group column",
                    ));
                }
                for row in 0..chunk_size {
                    set.insert(arr.value(row).as_bytes(), arena);
                }
                Ok(())
            }
            AggHashSet::OneNullableString { set, has_null_key } => {
                let column = one_key(key_columns)?;
                let arr = downcast::<StringArray>(column, "Utf8")?;
                for row in 0..chunk_size {
                    if arr.is_null(row) {
                        *has_null_key = true;
                    } else {
                        set.insert(arr.value(row).as_bytes(), arena);
                    }
                }
                Ok(())
            }
            AggHashSet::Serialized(set) => {
                set.serialize_rows(chunk_size, key_columns)?;
                for row in 0..chunk_size {
                    set.insert_serialized(row, arena);
                }
                Ok(())
            }
        }
    }

    /// Probe without inserting: report which rows carry keys absent from the
    /// set. Null keys in nullable variants still flip `has_null_key`.
    pub fn build_set_probe_only(
        &mut self,
        chunk_size: usize,
        key_columns: &[ArrayRef],
        not_found: &mut Vec<bool>,
    ) -> Result<()> {
        not_found.clear();
        not_found.resize(chunk_size, false);
        match self {
            AggHashSet::OneNumber(set) => {
                let column = one_key(key_columns)?;
                for row in 0..chunk_size {
                    not_found[row] = !set.contains(canonical_key_bits(column, row)?);
                }
                Ok(())
            }
            AggHashSet::OneNullableNumber { set, has_null_key } => {
                let column = one_key(key_columns)?;
                for row in 0..chunk_size {
                    if column.is_null(row) {
                        *has_null_key = true;
                    } else {
                        not_found[row] = !set.contains(canonical_key_bits(column, row)?);
                    }
                }
                Ok(())
            }
            AggHashSet::OneString(set) => {
                let column = one_key(key_columns)?;
                let arr = downcast::<StringArray>(column, "Utf8")?;
                for row in 0..chunk_size {
                    not_found[row] = !set.contains(arr.value(row).as_bytes());
                }
                Ok(())
            }
            AggHashSet::OneNullableString { set, has_null_key } => {
                let column = one_key(key_columns)?;
                let arr = downcast::<StringArray>(column, "Utf8")?;
                for row in 0..chunk_size {
                    if arr.is_null(row) {
                        *has_null_key = true;
                    } else {
                        not_found[row] = !set.contains(arr.value(row).as_bytes());
                    }
                }
                Ok(())
            }
            AggHashSet::Serialized(set) => {
                set.serialize_rows(chunk_size, key_columns)?;
                for row in 0..chunk_size {
                    not_found[row] = !set.contains_serialized(row);
                }
                Ok(())
            }
        }
    }

    /// Materialize every stored key back into columns in insertion order,
    /// recreating null bitmaps; a nullable variant's null key comes last.
    pub fn insert_keys_to_columns(&self) -> Result<Vec<ArrayRef>> {
        match self {
            AggHashSet::OneNumber(set) => Ok(vec![set.keys_to_array(false)?]),
            AggHashSet::OneNullableNumber { set, has_null_key } => {
                Ok(vec![set.keys_to_array(*has_null_key)?])
            }
            AggHashSet::OneString(set) => Ok(vec![set.keys_to_array(false)]),
            AggHashSet::OneNullableString { set, has_null_key } => {
                Ok(vec![set.keys_to_array(*has_null_key)])
            }
            AggHashSet::Serialized(set) => set.keys_to_columns(),
        }
    }

    /// Distinct keys stored, counting the null key when present.
    pub fn size(&self) -> usize {
        match self {
            AggHashSet::OneNumber(set) => set.len(),
            AggHashSet::OneNullableNumber { set, has_null_key } => {
                set.len() + usize::from(*has_null_key)
            }
            AggHashSet::OneString(set) => set.len(),
            AggHashSet::OneNullableString { set, has_null_key } => {
                set.len() + usize::from(*has_null_key)
            }
            AggHashSet::Serialized(set) => set.len(),
        }
    }

    pub fn has_null_key(&self) -> bool {
        match self {
            AggHashSet::OneNullableNumber { has_null_key, .. }
            | AggHashSet::OneNullableString { has_null_key, .. } => *has_null_key,
            _ => false,
        }
    }
}

fn one_key(key_columns: &[ArrayRef]) -> Result<&ArrayRef> {
    key_columns
        .first()
        .filter(|_| key_columns.len() == 1)
        .ok_or_else(|| Status::internal("single-key hash set got multiple key columns"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32_col(values: Vec<Option<i32>>) -> ArrayRef {
        Arc::new(Int32Array::from(values))
    }

    fn utf8_col(values: Vec<Option<&str>>) -> ArrayRef {
        Arc::new(StringArray::from(values))
    }

    #[test]
    fn one_number_set_deduplicates() {
        let mut set =
            AggHashSet::for_key_types(&[DataType::Int32], &[false], 16).expect("set");
        let mut arena = KeyArena::new(1024);
        let col = int32_col(vec![Some(1), Some(2), Some(2), Some(1)]);
        set.build_set(4, &[col], &mut arena).expect("build");
        assert_eq!(set.size(), 2);
        let cols = set.insert_keys_to_columns().expect("materialize");
        let arr = cols[0].as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(arr.values(), &[1, 2]);
    }

    #[test]
    fn nullable_number_set_tracks_null_key_separately() {
        let mut set = AggHashSet::for_key_types(&[DataType::Int32], &[true], 16).expect("set");
        let mut arena = KeyArena::new(1024);
        let col = int32_col(vec![Some(3), None, Some(3), None]);
        set.build_set(4, &[col], &mut arena).expect("build");
        assert_eq!(set.size(), 2);
        assert!(set.has_null_key());
        let cols = set.insert_keys_to_columns().expect("materialize");
        let arr = cols[0].as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.value(0), 3);
        assert!(arr.is_null(1));
    }

    #[test]
    fn string_set_stores_bytes_once_with_hash() {
        let mut set = AggHashSet::for_key_types(&[DataType::Utf8], &[false], 16).expect("set");
        let mut arena = KeyArena::new(1024);
        let col = utf8_col(vec![Some("ab"), Some("cd"), Some("ab")]);
        set.build_set(3, &[col.clone()], &mut arena).expect("build");
        assert_eq!(set.size(), 2);

        let mut not_found = Vec::new();
        let probe = utf8_col(vec![Some("cd"), Some("zz")]);
        set.build_set_probe_only(2, &[probe], &mut not_found)
            .expect("probe");
        assert_eq!(not_found, vec![false, true]);
        // Probe-only mode must not insert.
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn serialized_set_round_trips_multi_column_keys() {
        let mut set = AggHashSet::for_key_types(
            &[DataType::Int32, DataType::Utf8],
            &[true, true],
            16,
        )
        .expect("set");
        let mut arena = KeyArena::new(1024);
        let c0 = int32_col(vec![Some(1), Some(1), None, Some(1)]);
        let c1 = utf8_col(vec![Some("x"), Some("y"), Some("x"), Some("x")]);
        set.build_set(4, &[c0, c1], &mut arena).expect("build");
        assert_eq!(set.size(), 3);

        let cols = set.insert_keys_to_columns().expect("materialize");
        let ints = cols[0].as_any().downcast_ref::<Int32Array>().unwrap();
        let strs = cols[1].as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(ints.len(), 3);
        assert_eq!((ints.value(0), strs.value(0)), (1, "x"));
        assert_eq!((ints.value(1), strs.value(1)), (1, "y"));
        assert!(ints.is_null(2));
        assert_eq!(strs.value(2), "x");
    }

    #[test]
    fn serialized_scratch_keeps_overflow_padding() {
        let mut set = SerializedKeySet::new(vec![DataType::Utf8], 4);
        let col = utf8_col(vec![Some("a-rather-long-key-value"), Some("b"), None, Some("c")]);
        set.serialize_rows(4, &[col]).expect("serialize");
        assert!(
            set.scratch.len() >= set.max_one_row_size * set.chunk_capacity
                + SLICE_MEMEQUAL_OVERFLOW_PADDING
        );
    }
}
