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
//! Chained hash table over the join build side.
//!
//! Buckets are a power-of-two array of chain heads; each inserted row keeps
//! its full hash, a next-in-chain link and its `(batch, row)` location in
//! the retained build chunks. Two rows share a chain position iff their
//! hashes match and every key column compares equal under that column's
//! null-safety flag. Rows whose keys contain a null on a non-null-safe
//! column are stored only when the join needs them for unmatched-build
//! emission; they are never matchable from the probe side.
//!
//! The per-row `matched` bit is monotonic: cleared at build, set at most
//! once during probing, and read by the post-probe unmatched scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, StringArray};
use arrow::datatypes::DataType;
use hashbrown::hash_map::DefaultHashBuilder;

use crate::common::status::{Result, Status};
use crate::exec::hash_table::hash::{
    combine_hash, hash_bytes_with_seed, hash_null_with_seed, hash_u64_with_seed, seed_from_hasher,
};
use crate::exec::hash_table::key_set::{canonical_key_bits, is_fixed_width_key_type};
use crate::runtime::mem_tracker::MemTracker;

const ROW_NONE: u32 = u32::MAX;
const INITIAL_BUCKET_COUNT: usize = 1024;
const MAX_LOAD_FACTOR: f64 = 0.75;

pub(crate) struct JoinHashTable {
    key_types: Vec<DataType>,
    null_safe: Vec<bool>,
    stores_nulls: bool,
    seed: u64,

    buckets: Vec<u32>,
    hashes: Vec<u64>,
    next: Vec<u32>,
    locations: Vec<(u32, u32)>,
    matchable: Vec<bool>,
    matched: Vec<AtomicBool>,
    key_batches: Vec<Vec<ArrayRef>>,

    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    pub(crate) fn new(
        key_types: Vec<DataType>,
        null_safe: Vec<bool>,
        stores_nulls: bool,
    ) -> Result<Self> {
        if key_types.is_empty() {
            return Err(Status::invalid_argument("join hash table requires keys"));
        }
        if key_types.len() != null_safe.len() {
            return Err(Status::invalid_argument(format!(
                "join key/null-safe flag count mismatch: keys={} flags={}",
                key_types.len(),
                null_safe.len()
            )));
        }
        for key_type in &key_types {
            if !is_fixed_width_key_type(key_type) && *key_type != DataType::Utf8 {
                return Err(Status::unimplemented(format!(
                    "join key type {key_type:?}"
                )));
            }
        }
        Ok(Self {
            key_types,
            null_safe,
            stores_nulls,
            seed: seed_from_hasher(&DefaultHashBuilder::default()),
            buckets: vec![ROW_NONE; INITIAL_BUCKET_COUNT],
            hashes: Vec::new(),
            next: Vec::new(),
            locations: Vec::new(),
            matchable: Vec::new(),
            matched: Vec::new(),
            key_batches: Vec::new(),
            mem_tracker: None,
            accounted_bytes: 0,
        })
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            if Arc::ptr_eq(current, &tracker) {
                return;
            }
            current.release(self.accounted_bytes);
        }
        let bytes = self.tracked_bytes();
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub(crate) fn null_safe(&self) -> &[bool] {
        &self.null_safe
    }

    pub(crate) fn size(&self) -> usize {
        self.hashes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub(crate) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn load_factor(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        self.size() as f64 / self.buckets.len() as f64
    }

    /// Hash one probe/build row over the key columns. Null values hash to a
    /// fixed marker so null-safe probes land in the right chain.
    pub(crate) fn hash_row(&self, key_arrays: &[ArrayRef], row: usize) -> Result<u64> {
        let mut acc = self.seed;
        for array in key_arrays {
            let value_hash = if array.is_null(row) {
                hash_null_with_seed(self.seed)
            } else if *array.data_type() == DataType::Utf8 {
                let arr = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| Status::internal("join key downcast to Utf8 failed"))?;
                hash_bytes_with_seed(self.seed, arr.value(row).as_bytes())
            } else {
                hash_u64_with_seed(self.seed, canonical_key_bits(array, row)?)
            };
            acc = combine_hash(acc, value_hash);
        }
        Ok(acc)
    }

    /// A row with a null on any non-null-safe key can never match.
    pub(crate) fn row_has_forbidden_null(&self, key_arrays: &[ArrayRef], row: usize) -> bool {
        for (idx, array) in key_arrays.iter().enumerate() {
            if !self.null_safe.get(idx).copied().unwrap_or(false) && array.is_null(row) {
                return true;
            }
        }
        false
    }

    /// Insert every row of a build batch. The evaluated key arrays are
    /// retained so probe-time equality can read build values.
    pub(crate) fn add_build_batch(
        &mut self,
        key_arrays: Vec<ArrayRef>,
        num_rows: usize,
        batch_index: u32,
    ) -> Result<()> {
        if key_arrays.len() != self.key_types.len() {
            return Err(Status::invalid_argument("join key count mismatch"));
        }
        for (array, expected) in key_arrays.iter().zip(self.key_types.iter()) {
            if array.data_type() != expected {
                return Err(Status::invalid_argument(format!(
                    "join key type mismatch: expected {:?} got {:?}",
                    expected,
                    array.data_type()
                )));
            }
        }
        let new_rows = self
            .size()
            .checked_add(num_rows)
            .ok_or_else(|| Status::internal("join build row count overflow"))?;
        if new_rows > ROW_NONE as usize {
            return Err(Status::internal("join build row count overflow"));
        }
        self.maybe_grow(new_rows);

        for row in 0..num_rows {
            let forbidden = self.row_has_forbidden_null(&key_arrays, row);
            if forbidden && !self.stores_nulls {
                continue;
            }
            let hash = self.hash_row(&key_arrays, row)?;
            let row_id = self.hashes.len() as u32;
            self.hashes.push(hash);
            self.locations.push((batch_index, row as u32));
            self.matchable.push(!forbidden);
            self.matched.push(AtomicBool::new(false));
            let bucket = (hash as usize) & (self.buckets.len() - 1);
            self.next.push(self.buckets[bucket]);
            self.buckets[bucket] = row_id;
        }
        self.key_batches.push(key_arrays);
        if self.key_batches.len() != (batch_index as usize + 1) {
            return Err(Status::internal("join build batch index out of order"));
        }
        self.refresh_accounting();
        Ok(())
    }

    fn maybe_grow(&mut self, target_rows: usize) {
        let mut bucket_count = self.buckets.len();
        while (target_rows as f64) > bucket_count as f64 * MAX_LOAD_FACTOR {
            bucket_count *= 2;
        }
        if bucket_count == self.buckets.len() {
            return;
        }
        self.buckets = vec![ROW_NONE; bucket_count];
        for row_id in 0..self.hashes.len() {
            let bucket = (self.hashes[row_id] as usize) & (bucket_count - 1);
            self.next[row_id] = self.buckets[bucket];
            self.buckets[bucket] = row_id as u32;
        }
    }

    /// Head of the chain a probe hash lands in.
    pub(crate) fn chain_head(&self, hash: u64) -> Option<u32> {
        let bucket = (hash as usize) & (self.buckets.len() - 1);
        let head = self.buckets[bucket];
        (head != ROW_NONE).then_some(head)
    }

    pub(crate) fn chain_next(&self, row_id: u32) -> Option<u32> {
        let next = self.next[row_id as usize];
        (next != ROW_NONE).then_some(next)
    }

    pub(crate) fn row_hash(&self, row_id: u32) -> u64 {
        self.hashes[row_id as usize]
    }

    pub(crate) fn location(&self, row_id: u32) -> (u32, u32) {
        self.locations[row_id as usize]
    }

    pub(crate) fn is_matchable(&self, row_id: u32) -> bool {
        self.matchable[row_id as usize]
    }

    pub(crate) fn set_matched(&self, row_id: u32) {
        self.matched[row_id as usize].store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_matched(&self, row_id: u32) -> bool {
        self.matched[row_id as usize].load(Ordering::Relaxed)
    }

    /// Compare a probe row against a stored build row over all keys.
    pub(crate) fn keys_equal(
        &self,
        probe_arrays: &[ArrayRef],
        probe_row: usize,
        build_row_id: u32,
    ) -> Result<bool> {
        let (batch, row) = self.location(build_row_id);
        let build_arrays = self
            .key_batches
            .get(batch as usize)
            .ok_or_else(|| Status::internal("join build batch index out of bounds"))?;
        for (idx, (probe, build)) in probe_arrays.iter().zip(build_arrays.iter()).enumerate() {
            let null_safe = self.null_safe.get(idx).copied().unwrap_or(false);
            let probe_null = probe.is_null(probe_row);
            let build_null = build.is_null(row as usize);
            match (probe_null, build_null) {
                (true, true) => {
                    if !null_safe {
                        return Ok(false);
                    }
                }
                (true, false) | (false, true) => return Ok(false),
                (false, false) => {
                    if !value_equal(probe, probe_row, build, row as usize)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Distinct matchable build values per key column, for IN-filter
    /// synthesis after a small build.
    pub(crate) fn distinct_key_arrays(&self) -> Result<Vec<ArrayRef>> {
        let mut out = Vec::with_capacity(self.key_types.len());
        for key_idx in 0..self.key_types.len() {
            let mut arrays: Vec<&dyn Array> = Vec::with_capacity(self.key_batches.len());
            for batch in &self.key_batches {
                arrays.push(batch[key_idx].as_ref());
            }
            let indices: Vec<(usize, usize)> = (0..self.hashes.len())
                .filter(|row_id| self.matchable[*row_id])
                .map(|row_id| {
                    let (batch, row) = self.locations[row_id];
                    (batch as usize, row as usize)
                })
                .collect();
            let gathered = arrow::compute::interleave(&arrays, &indices)?;
            out.push(gathered);
        }
        Ok(out)
    }

    fn refresh_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.tracked_bytes();
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            tracker.consume(delta);
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.accounted_bytes = bytes;
    }

    fn tracked_bytes(&self) -> i64 {
        fn vec_bytes<T>(v: &Vec<T>) -> i64 {
            i64::try_from(v.capacity().saturating_mul(std::mem::size_of::<T>()))
                .unwrap_or(i64::MAX)
        }
        vec_bytes(&self.buckets)
            .saturating_add(vec_bytes(&self.hashes))
            .saturating_add(vec_bytes(&self.next))
            .saturating_add(vec_bytes(&self.locations))
            .saturating_add(vec_bytes(&self.matched))
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

fn value_equal(a: &ArrayRef, ai: usize, b: &ArrayRef, bi: usize) -> Result<bool> {
    if a.data_type() != b.data_type() {
        return Err(Status::internal(format!(
            "join key type mismatch at compare: {:?} vs {:?}",
            a.data_type(),
            b.data_type()
        )));
    }
    match a.data_type() {
        DataType::Utf8 => {
            let left = a
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Status::internal("join key downcast to Utf8 failed"))?;
            let right = b
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Status::internal("join key downcast to Utf8 failed"))?;
            Ok(left.value(ai) == right.value(bi))
        }
        DataType::Boolean => {
            let left = a
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| Status::internal("join key downcast to Boolean failed"))?;
            let right = b
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| Status::internal("join key downcast to Boolean failed"))?;
            Ok(left.value(ai) == right.value(bi))
        }
        _ => Ok(canonical_key_bits(a, ai)? == canonical_key_bits(b, bi)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;

    fn int_keys(values: Vec<Option<i32>>) -> Vec<ArrayRef> {
        vec![Arc::new(Int32Array::from(values)) as ArrayRef]
    }

    #[test]
    fn chains_collide_only_on_equal_keys() {
        let mut table =
            JoinHashTable::new(vec![DataType::Int32], vec![false], false).expect("table");
        let keys = int_keys(vec![Some(1), Some(2), Some(1)]);
        table.add_build_batch(keys.clone(), 3, 0).expect("insert");
        assert_eq!(table.size(), 3);

        let probe = int_keys(vec![Some(1)]);
        let hash = table.hash_row(&probe, 0).expect("hash");
        let mut matches = Vec::new();
        let mut cursor = table.chain_head(hash);
        while let Some(row_id) = cursor {
            if table.row_hash(row_id) == hash && table.keys_equal(&probe, 0, row_id).expect("eq") {
                matches.push(table.location(row_id));
            }
            cursor = table.chain_next(row_id);
        }
        matches.sort();
        assert_eq!(matches, vec![(0, 0), (0, 2)]);
    }

    #[test]
    fn null_keys_skip_insert_unless_stored() {
        let mut skipping =
            JoinHashTable::new(vec![DataType::Int32], vec![false], false).expect("table");
        skipping
            .add_build_batch(int_keys(vec![Some(1), None]), 2, 0)
            .expect("insert");
        assert_eq!(skipping.size(), 1);

        let mut storing =
            JoinHashTable::new(vec![DataType::Int32], vec![false], true).expect("table");
        storing
            .add_build_batch(int_keys(vec![Some(1), None]), 2, 0)
            .expect("insert");
        assert_eq!(storing.size(), 2);
        assert!(!storing.is_matchable(1));
    }

    #[test]
    fn null_safe_keys_match_null_to_null() {
        let mut table =
            JoinHashTable::new(vec![DataType::Int32], vec![true], true).expect("table");
        table
            .add_build_batch(int_keys(vec![None, Some(5)]), 2, 0)
            .expect("insert");

        let probe = int_keys(vec![None]);
        let hash = table.hash_row(&probe, 0).expect("hash");
        let mut found = false;
        let mut cursor = table.chain_head(hash);
        while let Some(row_id) = cursor {
            if table.row_hash(row_id) == hash && table.keys_equal(&probe, 0, row_id).expect("eq") {
                found = true;
            }
            cursor = table.chain_next(row_id);
        }
        assert!(found, "null-safe NULL must match stored NULL key");
    }

    #[test]
    fn growth_keeps_every_row_reachable() {
        let mut table =
            JoinHashTable::new(vec![DataType::Int32], vec![false], false).expect("table");
        let n = 4096;
        let keys = int_keys((0..n).map(Some).collect());
        table.add_build_batch(keys, n as usize, 0).expect("insert");
        assert!(table.num_buckets() >= n as usize);
        assert!(table.num_buckets().is_power_of_two());
        assert!(table.load_factor() <= MAX_LOAD_FACTOR);

        let probe = int_keys(vec![Some(n - 1)]);
        let hash = table.hash_row(&probe, 0).expect("hash");
        let mut found = false;
        let mut cursor = table.chain_head(hash);
        while let Some(row_id) = cursor {
            if table.row_hash(row_id) == hash && table.keys_equal(&probe, 0, row_id).expect("eq") {
                found = true;
            }
            cursor = table.chain_next(row_id);
        }
        assert!(found);
    }

    #[test]
    fn matched_bit_is_monotonic() {
        let mut table =
            JoinHashTable::new(vec![DataType::Int32], vec![false], true).expect("table");
        table
            .add_build_batch(int_keys(vec![Some(1)]), 1, 0)
            .expect("insert");
        assert!(!table.is_matched(0));
        table.set_matched(0);
        table.set_matched(0);
        assert!(table.is_matched(0));
    }
}
