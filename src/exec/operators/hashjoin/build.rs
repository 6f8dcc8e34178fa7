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
//! Hash-join build sink.
//!
//! Drains the right child to end-of-stream, retaining build chunks (their
//! accounting moves to the join's tracker so rows outlive the child) and
//! collecting them per instance; the last instance to finish constructs the
//! hash table, optionally synthesizes IN runtime filters from the distinct
//! build keys, publishes the artifact and readies the probe dependency.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::common::config;
use crate::common::ids::{PlanNodeId, SlotId};
use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;
use crate::exec::expr::Expr;
use crate::exec::operators::hashjoin::join_hash_table::JoinHashTable;
use crate::exec::operators::hashjoin::{JoinBuildArtifact, JoinSharedState};
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::runtime_filter::{RuntimeFilterHub, RuntimeInFilter};
use crate::gneiss_logging::info;
use crate::plan::JoinOp;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_state::RuntimeState;

/// Config the pushdown decision needs, gathered at plan time.
#[derive(Clone)]
pub struct PushDownSpec {
    pub requested: bool,
    /// Pushdown is pointless when both children are pure exchange sources.
    pub children_are_exchange: bool,
    /// The probe-side scan column each key filters, when the probe key is a
    /// bare column reference.
    pub probe_filter_slots: Vec<Option<SlotId>>,
}

pub struct HashJoinBuildSinkFactory {
    name: String,
    state: Arc<JoinSharedState>,
    join_op: JoinOp,
    build_exprs: Vec<Expr>,
    null_safe: Vec<bool>,
    push_down: PushDownSpec,
    filter_hub: Arc<RuntimeFilterHub>,
    profile: RuntimeProfile,
}

impl HashJoinBuildSinkFactory {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: PlanNodeId,
        state: Arc<JoinSharedState>,
        join_op: JoinOp,
        build_exprs: Vec<Expr>,
        null_safe: Vec<bool>,
        push_down: PushDownSpec,
        filter_hub: Arc<RuntimeFilterHub>,
        profile: RuntimeProfile,
    ) -> Self {
        Self {
            name: format!("HASH_JOIN_BUILD (id={node_id})"),
            state,
            join_op,
            build_exprs,
            null_safe,
            push_down,
            filter_hub,
            profile,
        }
    }
}

impl OperatorFactory for HashJoinBuildSinkFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn create(&self, _degree_of_parallelism: usize, _instance_index: usize) -> Box<dyn Operator> {
        self.state.build_instances.fetch_add(1, Ordering::AcqRel);
        Box::new(HashJoinBuildSink {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            join_op: self.join_op,
            build_exprs: self.build_exprs.clone(),
            null_safe: self.null_safe.clone(),
            push_down: self.push_down.clone(),
            filter_hub: Arc::clone(&self.filter_hub),
            counters: BuildCounters::new(&self.profile),
            mem_tracker: None,
            finished: false,
        })
    }
}

struct BuildCounters {
    build_timer: CounterRef,
    build_rows: CounterRef,
    build_buckets: CounterRef,
    load_factor: CounterRef,
    push_down_timer: CounterRef,
    push_down_compute_timer: CounterRef,
}

impl BuildCounters {
    fn new(profile: &RuntimeProfile) -> Self {
        Self {
            build_timer: profile.add_timer("BuildTime"),
            build_rows: profile.add_counter("BuildRows", CounterUnit::Unit),
            build_buckets: profile.add_counter("BuildBuckets", CounterUnit::Unit),
            load_factor: profile.add_counter("LoadFactor", CounterUnit::DoubleValue),
            push_down_timer: profile.add_timer("PushDownTime"),
            push_down_compute_timer: profile.add_timer("PushDownComputeTime"),
        }
    }
}

pub struct HashJoinBuildSink {
    name: String,
    state: Arc<JoinSharedState>,
    join_op: JoinOp,
    build_exprs: Vec<Expr>,
    null_safe: Vec<bool>,
    push_down: PushDownSpec,
    filter_hub: Arc<RuntimeFilterHub>,
    counters: BuildCounters,
    mem_tracker: Option<Arc<MemTracker>>,
    finished: bool,
}

impl HashJoinBuildSink {
    /// The table stores null keys when the join must replay unmatched build
    /// rows, or when any key is null-safe.
    fn stores_nulls(&self) -> bool {
        self.join_op.needs_build_match_bits() || self.null_safe.iter().any(|v| *v)
    }

    fn finalize(&mut self) -> Result<()> {
        let chunks: Vec<Chunk> = {
            let mut guard = self
                .state
                .collected
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        let mut table = {
            let _t = ScopedTimer::new(&self.counters.build_timer);
            let key_types = self
                .build_exprs
                .iter()
                .map(|expr| {
                    chunks
                        .first()
                        .map(|chunk| expr.eval(chunk).map(|a| a.data_type().clone()))
                        .unwrap_or_else(|| self.key_type_without_rows(expr))
                })
                .collect::<Result<Vec<_>>>()?;
            let mut table = JoinHashTable::new(key_types, self.null_safe.clone(), self.stores_nulls())?;
            if let Some(tracker) = self.mem_tracker.as_ref() {
                table.set_mem_tracker(Arc::clone(tracker));
            }
            for (batch_index, chunk) in chunks.iter().enumerate() {
                let mut key_arrays = Vec::with_capacity(self.build_exprs.len());
                for expr in &self.build_exprs {
                    key_arrays.push(expr.eval(chunk)?);
                }
                table.add_build_batch(key_arrays, chunk.len(), batch_index as u32)?;
            }
            table
        };

        self.counters.build_rows.set(table.size() as i64);
        self.counters.build_buckets.set(table.num_buckets() as i64);
        self.counters
            .load_factor
            .set((table.load_factor() * 1000.0) as i64);

        self.maybe_push_down_filters(&mut table)?;

        let build_row_count = table.size();
        let artifact = Arc::new(JoinBuildArtifact {
            build_chunks: chunks,
            table,
            build_row_count,
        });
        self.state
            .artifact
            .set(artifact)
            .map_err(|_| Status::internal("join build artifact published twice"))?;
        self.state.dependency.set_ready();
        Ok(())
    }

    fn key_type_without_rows(&self, expr: &Expr) -> Result<arrow::datatypes::DataType> {
        // Without any build rows the key type falls back to what a literal
        // or column declaration implies; Int64 covers the empty-build case
        // since the table will never be probed into a chain.
        match expr {
            Expr::Literal { data_type, .. } => Ok(data_type.clone()),
            _ => Ok(arrow::datatypes::DataType::Int64),
        }
    }

    fn maybe_push_down_filters(&self, table: &mut JoinHashTable) -> Result<()> {
        if !self.push_down.requested {
            return Ok(());
        }
        // Variants that emit unmatched probe rows must still see them; the
        // filter may only drop rows that cannot affect the output.
        if !matches!(
            self.join_op,
            JoinOp::Inner | JoinOp::LeftSemi | JoinOp::RightSemi | JoinOp::RightOuter | JoinOp::RightAnti
        ) {
            return Ok(());
        }
        // The IN filter would drop probe-side NULLs that a null-safe join
        // still needs.
        if self.null_safe.iter().any(|v| *v) {
            return Ok(());
        }
        if self.push_down.children_are_exchange {
            return Ok(());
        }
        if table.size() > config::join_push_down_max_table_size() {
            return Ok(());
        }

        let _t = ScopedTimer::new(&self.counters.push_down_timer);
        let mut filters = Vec::new();
        {
            let _c = ScopedTimer::new(&self.counters.push_down_compute_timer);
            let key_arrays = table.distinct_key_arrays()?;
            for (idx, slot) in self.push_down.probe_filter_slots.iter().enumerate() {
                let Some(slot_id) = slot else {
                    continue;
                };
                let Some(array) = key_arrays.get(idx) else {
                    continue;
                };
                filters.push(Arc::new(RuntimeInFilter::from_build_values(
                    *slot_id, array,
                )?));
            }
        }
        if !filters.is_empty() {
            info!(
                "join pushdown: {} IN filters from {} build rows",
                filters.len(),
                table.size()
            );
            self.filter_hub.add_filters(filters);
        }
        Ok(())
    }
}

impl Operator for HashJoinBuildSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashJoinBuildSink {
    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, mut chunk: Chunk) -> Result<()> {
        state.check_cancelled()?;
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(tracker) = self.mem_tracker.as_ref() {
            // Take ownership of the child's rows: they must outlive the
            // child for the join's whole lifetime.
            chunk.transfer_to(tracker);
            tracker.check_limits()?;
        }
        self.state
            .collected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk);
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        state.check_cancelled()?;
        self.finished = true;
        if self.state.build_instances.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize()?;
        }
        Ok(())
    }
}
