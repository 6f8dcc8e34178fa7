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
//! Aggregate function object model.
//!
//! Functions operate on raw states allocated out of an [`AggStateArena`];
//! one state pointer per input row lets grouped updates drive any function
//! without virtual calls inside the per-value loop. The nullable wrapper
//! adds a null-short-circuit and its own "saw any input" bit in front of
//! the nested state.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::datatypes::DataType;

use crate::common::status::{Result, Status};
use crate::runtime::mem_tracker::MemTracker;

pub type AggStatePtr = usize;

pub trait AggregateFunction: Send + Sync {
    fn name(&self) -> &str;

    fn intermediate_type(&self) -> DataType;

    fn output_type(&self) -> DataType;

    fn state_size(&self) -> usize;

    fn state_align(&self) -> usize;

    /// Write a fresh state at `state`. The pointer is arena memory of at
    /// least `state_size()` bytes aligned to `state_align()`.
    fn init_state(&self, state: AggStatePtr);

    /// Run drop glue for a state previously initialized at `state`.
    fn drop_state(&self, state: AggStatePtr);

    /// Accumulate one input row into each row's state. `states[i]` is the
    /// state for input row `i`; the same pointer may appear many times.
    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()>;

    /// Merge one serialized intermediate per row into each row's state.
    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()>;

    /// Materialize the intermediate representation of each state.
    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef>;

    /// Materialize the final value of each state.
    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef>;
}

pub type AggregateFunctionRef = Arc<dyn AggregateFunction>;

/// Bump arena for aggregate states.
pub struct AggStateArena {
    blocks: Vec<Box<[u8]>>,
    cursor: usize,
    block_size: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl AggStateArena {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            cursor: 0,
            block_size: block_size.max(1),
            mem_tracker: None,
            accounted_bytes: 0,
        }
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            if Arc::ptr_eq(current, &tracker) {
                return;
            }
            current.release(self.accounted_bytes);
        }
        let bytes = self.blocks.iter().map(|b| b.len()).sum::<usize>();
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub fn alloc(&mut self, size: usize, align: usize) -> AggStatePtr {
        let align_mask = align.saturating_sub(1);
        let needed = size.max(1);
        // Conservative check: aligning the absolute address may cost up to
        // `align_mask` extra bytes.
        let current_block_len = self.blocks.last().map(|b| b.len()).unwrap_or(0);
        if self.blocks.is_empty() || self.cursor + needed + align_mask > current_block_len {
            let block_size = self.block_size.max(needed + align_mask);
            self.blocks.push(vec![0u8; block_size].into_boxed_slice());
            self.block_size = self.block_size.max(block_size);
            self.cursor = 0;
            if let Some(tracker) = self.mem_tracker.as_ref() {
                let charged = i64::try_from(block_size).unwrap_or(i64::MAX);
                tracker.consume(charged);
                self.accounted_bytes = self.accounted_bytes.saturating_add(charged);
            }
        }
        let block = self.blocks.last_mut().expect("agg arena block");
        let base = block.as_mut_ptr() as usize;
        let start = (base + self.cursor + align_mask) & !align_mask;
        self.cursor = start - base + needed;
        start
    }
}

impl Drop for AggStateArena {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

/// Read a typed state behind a raw pointer.
///
/// Safety contract: `state` came from an arena allocation sized/aligned for
/// `S` and was initialized by the matching `init_state`.
pub(crate) unsafe fn state_mut<'a, S>(state: AggStatePtr) -> &'a mut S {
    &mut *(state as *mut S)
}

pub(crate) unsafe fn state_ref<'a, S>(state: AggStatePtr) -> &'a S {
    &*(state as *const S)
}

fn align_up(offset: usize, align: usize) -> usize {
    let mask = align.saturating_sub(1);
    (offset + mask) & !mask
}

/// Wraps a unary aggregate with null handling: null input rows are skipped,
/// and a leading flag byte records whether the nested state ever saw input
/// so empty groups finalize to NULL.
pub struct NullableAggregateFunctionUnary {
    nested: AggregateFunctionRef,
    nested_offset: usize,
}

impl NullableAggregateFunctionUnary {
    pub fn new(nested: AggregateFunctionRef) -> Self {
        let nested_offset = align_up(1, nested.state_align().max(1));
        Self {
            nested,
            nested_offset,
        }
    }

    fn flag(&self, state: AggStatePtr) -> bool {
        unsafe { *(state as *const u8) != 0 }
    }

    fn set_flag(&self, state: AggStatePtr) {
        unsafe { *(state as *mut u8) = 1 };
    }

    fn nested_state(&self, state: AggStatePtr) -> AggStatePtr {
        state + self.nested_offset
    }

    /// Scatter `subset` (values for `valid_rows`) into a full-length array
    /// with nulls elsewhere.
    fn scatter_with_nulls(
        &self,
        subset: ArrayRef,
        valid_rows: &[usize],
        total_rows: usize,
    ) -> Result<ArrayRef> {
        let mut positions: Vec<Option<u32>> = vec![None; total_rows];
        for (subset_idx, row) in valid_rows.iter().enumerate() {
            positions[*row] = Some(subset_idx as u32);
        }
        let indices = UInt32Array::from(positions);
        Ok(take(&subset, &indices, None)?)
    }
}

impl AggregateFunction for NullableAggregateFunctionUnary {
    fn name(&self) -> &str {
        self.nested.name()
    }

    fn intermediate_type(&self) -> DataType {
        self.nested.intermediate_type()
    }

    fn output_type(&self) -> DataType {
        self.nested.output_type()
    }

    fn state_size(&self) -> usize {
        self.nested_offset + self.nested.state_size()
    }

    fn state_align(&self) -> usize {
        self.nested.state_align().max(1)
    }

    fn init_state(&self, state: AggStatePtr) {
        unsafe { *(state as *mut u8) = 0 };
        self.nested.init_state(self.nested_state(state));
    }

    fn drop_state(&self, state: AggStatePtr) {
        self.nested.drop_state(self.nested_state(state));
    }

    fn update_batch(&self, states: &[AggStatePtr], input: &[ArrayRef]) -> Result<()> {
        let arg = input
            .first()
            .ok_or_else(|| Status::internal("nullable aggregate expects one argument"))?;
        if states.len() != arg.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        let valid_rows: Vec<usize> = (0..arg.len()).filter(|row| !arg.is_null(*row)).collect();
        if valid_rows.is_empty() {
            return Ok(());
        }
        let indices = UInt32Array::from(
            valid_rows.iter().map(|r| *r as u32).collect::<Vec<_>>(),
        );
        let mut filtered_input = Vec::with_capacity(input.len());
        for column in input {
            filtered_input.push(take(column, &indices, None)?);
        }
        let mut nested_states = Vec::with_capacity(valid_rows.len());
        for row in &valid_rows {
            self.set_flag(states[*row]);
            nested_states.push(self.nested_state(states[*row]));
        }
        self.nested.update_batch(&nested_states, &filtered_input)
    }

    fn merge_batch(&self, states: &[AggStatePtr], input: &ArrayRef) -> Result<()> {
        if states.len() != input.len() {
            return Err(Status::internal("aggregate state/row count mismatch"));
        }
        let valid_rows: Vec<usize> = (0..input.len()).filter(|row| !input.is_null(*row)).collect();
        if valid_rows.is_empty() {
            return Ok(());
        }
        let indices = UInt32Array::from(
            valid_rows.iter().map(|r| *r as u32).collect::<Vec<_>>(),
        );
        let filtered = take(input, &indices, None)?;
        let mut nested_states = Vec::with_capacity(valid_rows.len());
        for row in &valid_rows {
            self.set_flag(states[*row]);
            nested_states.push(self.nested_state(states[*row]));
        }
        self.nested.merge_batch(&nested_states, &filtered)
    }

    fn serialize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let valid_rows: Vec<usize> = (0..states.len())
            .filter(|row| self.flag(states[*row]))
            .collect();
        if valid_rows.is_empty() {
            return Ok(arrow::array::new_null_array(
                &self.intermediate_type(),
                states.len(),
            ));
        }
        let nested_states: Vec<AggStatePtr> = valid_rows
            .iter()
            .map(|row| self.nested_state(states[*row]))
            .collect();
        let subset = self.nested.serialize_states(&nested_states)?;
        self.scatter_with_nulls(subset, &valid_rows, states.len())
    }

    fn finalize_states(&self, states: &[AggStatePtr]) -> Result<ArrayRef> {
        let valid_rows: Vec<usize> = (0..states.len())
            .filter(|row| self.flag(states[*row]))
            .collect();
        if valid_rows.is_empty() {
            return Ok(arrow::array::new_null_array(
                &self.output_type(),
                states.len(),
            ));
        }
        let nested_states: Vec<AggStatePtr> = valid_rows
            .iter()
            .map(|row| self.nested_state(states[*row]))
            .collect();
        let subset = self.nested.finalize_states(&nested_states)?;
        self.scatter_with_nulls(subset, &valid_rows, states.len())
    }
}

/// Allocate and initialize one state per group for `func`.
pub fn alloc_states(
    func: &dyn AggregateFunction,
    arena: &mut AggStateArena,
    groups: usize,
) -> Vec<AggStatePtr> {
    let mut states = Vec::with_capacity(groups);
    for _ in 0..groups {
        let ptr = arena.alloc(func.state_size(), func.state_align());
        func.init_state(ptr);
        states.push(ptr);
    }
    states
}
