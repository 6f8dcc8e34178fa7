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
//! Exact-value IN runtime filters synthesized from join build keys and
//! pushed into probe-side scans.
//!
//! Filters drop null rows, which is exactly why pushdown is disabled for
//! null-safe joins: the scan must still surface NULL keys there.

use std::sync::{Arc, Mutex};

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::compute::filter_record_batch;
use arrow::datatypes::{DataType, TimeUnit};
use hashbrown::HashSet;

use crate::common::ids::SlotId;
use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::hash::{canonical_f32_bits, canonical_f64_bits};

#[derive(Clone, Debug)]
enum InFilterValues {
    Int(HashSet<i64>),
    FloatBits(HashSet<u64>),
    Utf8(HashSet<String>),
    Bool(HashSet<bool>),
}

/// Typed membership filter over one probe column.
#[derive(Clone, Debug)]
pub struct RuntimeInFilter {
    slot_id: SlotId,
    values: InFilterValues,
}

impl RuntimeInFilter {
    /// Collect distinct non-null values from a build key array.
    pub fn from_build_values(slot_id: SlotId, array: &ArrayRef) -> Result<Self> {
        let values = match array.data_type() {
            DataType::Int8 => InFilterValues::Int(collect_int::<Int8Array>(array, |a, i| {
                a.value(i) as i64
            })?),
            DataType::Int16 => InFilterValues::Int(collect_int::<Int16Array>(array, |a, i| {
                a.value(i) as i64
            })?),
            DataType::Int32 => InFilterValues::Int(collect_int::<Int32Array>(array, |a, i| {
                a.value(i) as i64
            })?),
            DataType::Int64 => {
                InFilterValues::Int(collect_int::<Int64Array>(array, |a, i| a.value(i))?)
            }
            DataType::Date32 => InFilterValues::Int(collect_int::<Date32Array>(array, |a, i| {
                a.value(i) as i64
            })?),
            DataType::Timestamp(TimeUnit::Microsecond, _) => InFilterValues::Int(collect_int::<
                TimestampMicrosecondArray,
            >(
                array, |a, i| a.value(i)
            )?),
            DataType::Float32 => {
                let arr = downcast::<Float32Array>(array)?;
                let mut set = HashSet::new();
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        set.insert(canonical_f32_bits(arr.value(i)) as u64);
                    }
                }
                InFilterValues::FloatBits(set)
            }
            DataType::Float64 => {
                let arr = downcast::<Float64Array>(array)?;
                let mut set = HashSet::new();
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        set.insert(canonical_f64_bits(arr.value(i)));
                    }
                }
                InFilterValues::FloatBits(set)
            }
            DataType::Utf8 => {
                let arr = downcast::<StringArray>(array)?;
                let mut set = HashSet::new();
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        set.insert(arr.value(i).to_string());
                    }
                }
                InFilterValues::Utf8(set)
            }
            DataType::Boolean => {
                let arr = downcast::<BooleanArray>(array)?;
                let mut set = HashSet::new();
                for i in 0..arr.len() {
                    if !arr.is_null(i) {
                        set.insert(arr.value(i));
                    }
                }
                InFilterValues::Bool(set)
            }
            other => {
                return Err(Status::unimplemented(format!(
                    "runtime IN-filter over {other:?}"
                )))
            }
        };
        Ok(Self { slot_id, values })
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn num_values(&self) -> usize {
        match &self.values {
            InFilterValues::Int(s) => s.len(),
            InFilterValues::FloatBits(s) => s.len(),
            InFilterValues::Utf8(s) => s.len(),
            InFilterValues::Bool(s) => s.len(),
        }
    }

    /// Membership mask over the filter's column; null rows are dropped.
    fn selection_mask(&self, array: &ArrayRef) -> Result<BooleanArray> {
        let len = array.len();
        let mask = match &self.values {
            InFilterValues::Int(set) => {
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    if array.is_null(i) {
                        out.push(false);
                    } else {
                        out.push(set.contains(&int_value(array, i)?));
                    }
                }
                BooleanArray::from(out)
            }
            InFilterValues::FloatBits(set) => {
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    if array.is_null(i) {
                        out.push(false);
                    } else {
                        let bits = match array.data_type() {
                            DataType::Float32 => {
                                canonical_f32_bits(downcast::<Float32Array>(array)?.value(i)) as u64
                            }
                            _ => canonical_f64_bits(downcast::<Float64Array>(array)?.value(i)),
                        };
                        out.push(set.contains(&bits));
                    }
                }
                BooleanArray::from(out)
            }
            InFilterValues::Utf8(set) => {
                let arr = downcast::<StringArray>(array)?;
                BooleanArray::from_iter((0..len).map(|i| {
                    Some(!arr.is_null(i) && set.contains(arr.value(i)))
                }))
            }
            InFilterValues::Bool(set) => {
                let arr = downcast::<BooleanArray>(array)?;
                BooleanArray::from_iter((0..len).map(|i| {
                    Some(!arr.is_null(i) && set.contains(&arr.value(i)))
                }))
            }
        };
        Ok(mask)
    }

    /// Apply to a chunk; chunks without the filter's column pass through.
    pub fn apply(&self, chunk: &Chunk) -> Result<Chunk> {
        let Ok(column) = chunk.column_by_slot_id(self.slot_id) else {
            return Ok(chunk.clone());
        };
        let mask = self.selection_mask(&column)?;
        let filtered = filter_record_batch(&chunk.batch, &mask)?;
        Chunk::try_new(filtered)
    }
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| Status::internal("runtime filter column downcast failed"))
}

fn collect_int<T: Array + 'static>(
    array: &ArrayRef,
    get: impl Fn(&T, usize) -> i64,
) -> Result<HashSet<i64>> {
    let arr = downcast::<T>(array)?;
    let mut set = HashSet::new();
    for i in 0..arr.len() {
        if !arr.is_null(i) {
            set.insert(get(arr, i));
        }
    }
    Ok(set)
}

fn int_value(array: &ArrayRef, row: usize) -> Result<i64> {
    crate::exec::expr::agg::numeric::value_i64(array, row)
}

/// Fragment-scoped registry: joins publish filters after build, scans poll
/// and apply every filter whose column they produce.
#[derive(Default)]
pub struct RuntimeFilterHub {
    filters: Mutex<Vec<Arc<RuntimeInFilter>>>,
}

impl RuntimeFilterHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filters(&self, filters: Vec<Arc<RuntimeInFilter>>) {
        let mut guard = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        guard.extend(filters);
    }

    pub fn filters(&self) -> Vec<Arc<RuntimeInFilter>> {
        self.filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::field_with_slot_id;
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn chunk_of(values: Vec<Option<i32>>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![field_with_slot_id(
            Field::new("k", DataType::Int32, true),
            SlotId::new(4),
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))])
            .expect("batch");
        Chunk::try_new(batch).expect("chunk")
    }

    #[test]
    fn filter_keeps_members_and_drops_nulls() {
        let build: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), Some(3), Some(1)]));
        let filter = RuntimeInFilter::from_build_values(SlotId::new(4), &build).expect("filter");
        assert_eq!(filter.num_values(), 2);

        let probe = chunk_of(vec![Some(1), Some(2), None, Some(3)]);
        let out = filter.apply(&probe).expect("apply");
        let col = out.column_by_slot_id(SlotId::new(4)).expect("col");
        let arr = col.as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(arr.values(), &[1, 3]);
    }

    #[test]
    fn filter_ignores_chunks_without_its_column() {
        let build: ArrayRef = Arc::new(Int32Array::from(vec![Some(1)]));
        let filter = RuntimeInFilter::from_build_values(SlotId::new(99), &build).expect("filter");
        let probe = chunk_of(vec![Some(1), Some(2)]);
        let out = filter.apply(&probe).expect("apply");
        assert_eq!(out.len(), 2);
    }
}
