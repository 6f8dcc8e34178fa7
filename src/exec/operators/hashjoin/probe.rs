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
//! Hash-join probe processor.
//!
//! Per probe row the matching build chain is walked; candidate pairs are
//! filtered by `other_join_conjuncts` evaluated over concatenated rows,
//! then per-variant bookkeeping decides what is emitted and which matched
//! bits are set. The four left-ish variants need no build bookkeeping and
//! skip it entirely. After the probe drains, right-outer-ish variants
//! replay the table through an owned cursor, emitting never-matched build
//! rows a batch at a time so emission resumes across pulls.
//!
//! An empty build table short-circuits an inner join to end-of-stream
//! before the probe side is ever read.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arrow::array::{new_null_array, Array, ArrayRef, UInt32Array};
use arrow::compute::{interleave, take};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::common::ids::PlanNodeId;
use crate::common::status::{Result, Status};
use crate::exec::chunk::{field_slot_id, field_with_slot_id, Chunk};
use crate::exec::expr::Expr;
use crate::exec::operators::hashjoin::{JoinBuildArtifact, JoinSharedState};
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::plan::JoinOp;
use crate::runtime::profile::{CounterRef, CounterUnit, RuntimeProfile, ScopedTimer};
use crate::runtime::runtime_state::RuntimeState;

/// Which side(s) the join's output rows carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputLayout {
    Both,
    ProbeOnly,
    BuildOnly,
}

impl OutputLayout {
    fn of(join_op: JoinOp) -> Self {
        match join_op {
            JoinOp::LeftSemi | JoinOp::LeftAnti => Self::ProbeOnly,
            JoinOp::RightSemi | JoinOp::RightAnti => Self::BuildOnly,
            _ => Self::Both,
        }
    }
}

pub struct HashJoinProbeFactory {
    name: String,
    state: Arc<JoinSharedState>,
    join_op: JoinOp,
    probe_exprs: Vec<Expr>,
    other_join_conjuncts: Vec<Expr>,
    conjuncts: Vec<Expr>,
    probe_schema: SchemaRef,
    build_schema: SchemaRef,
    profile: RuntimeProfile,
}

impl HashJoinProbeFactory {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: PlanNodeId,
        state: Arc<JoinSharedState>,
        join_op: JoinOp,
        probe_exprs: Vec<Expr>,
        other_join_conjuncts: Vec<Expr>,
        conjuncts: Vec<Expr>,
        probe_schema: SchemaRef,
        build_schema: SchemaRef,
        profile: RuntimeProfile,
    ) -> Self {
        profile.add_info_string("JoinPredicates", format!("{:?}", probe_exprs));
        profile.add_info_string("Predicates", format!("{:?}", conjuncts));
        Self {
            name: format!("HASH_JOIN_PROBE (id={node_id})"),
            state,
            join_op,
            probe_exprs,
            other_join_conjuncts,
            conjuncts,
            probe_schema,
            build_schema,
            profile,
        }
    }

    /// Output schema: the surviving side(s), with columns of a side forced
    /// nullable when outer padding can null them.
    fn output_schema(&self) -> Result<SchemaRef> {
        let probe_nullable = matches!(self.join_op, JoinOp::RightOuter | JoinOp::FullOuter);
        let build_nullable = matches!(self.join_op, JoinOp::LeftOuter | JoinOp::FullOuter);
        let mut fields: Vec<Field> = Vec::new();
        let layout = OutputLayout::of(self.join_op);
        if layout != OutputLayout::BuildOnly {
            for field in self.probe_schema.fields() {
                let f = field.as_ref().clone();
                let f = if probe_nullable { f.with_nullable(true) } else { f };
                fields.push(reattach_slot(f, field)?);
            }
        }
        if layout != OutputLayout::ProbeOnly {
            for field in self.build_schema.fields() {
                let f = field.as_ref().clone();
                let f = if build_nullable { f.with_nullable(true) } else { f };
                fields.push(reattach_slot(f, field)?);
            }
        }
        Ok(Arc::new(Schema::new(fields)))
    }
}

fn reattach_slot(f: Field, source: &Arc<Field>) -> Result<Field> {
    match field_slot_id(source.as_ref())? {
        Some(slot) => Ok(field_with_slot_id(f, slot)),
        None => Ok(f),
    }
}

impl OperatorFactory for HashJoinProbeFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _degree_of_parallelism: usize, _instance_index: usize) -> Box<dyn Operator> {
        self.state.probe_instances.fetch_add(1, Ordering::AcqRel);
        let out_schema = match self.output_schema() {
            Ok(schema) => schema,
            Err(err) => {
                return Box::new(crate::exec::operators::FailedOperator::new(
                    "HASH_JOIN_PROBE",
                    err,
                ))
            }
        };
        Box::new(HashJoinProbe {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            join_op: self.join_op,
            layout: OutputLayout::of(self.join_op),
            probe_exprs: self.probe_exprs.clone(),
            other_join_conjuncts: self.other_join_conjuncts.clone(),
            conjuncts: self.conjuncts.clone(),
            probe_schema: Arc::clone(&self.probe_schema),
            build_schema: Arc::clone(&self.build_schema),
            out_schema,
            pending: VecDeque::new(),
            probe_done: false,
            unmatched_scan: false,
            unmatched_cursor: 0,
            probe_timer: self.profile.add_timer("ProbeTime"),
            probe_rows: self.profile.add_counter("ProbeRows", CounterUnit::Unit),
        })
    }
}

pub struct HashJoinProbe {
    name: String,
    state: Arc<JoinSharedState>,
    join_op: JoinOp,
    layout: OutputLayout,
    probe_exprs: Vec<Expr>,
    other_join_conjuncts: Vec<Expr>,
    conjuncts: Vec<Expr>,
    probe_schema: SchemaRef,
    build_schema: SchemaRef,
    out_schema: SchemaRef,
    pending: VecDeque<Chunk>,
    probe_done: bool,
    /// This instance replays the table for never-matched build rows.
    unmatched_scan: bool,
    /// Owned resumable cursor into the table's insertion order.
    unmatched_cursor: u32,
    probe_timer: CounterRef,
    probe_rows: CounterRef,
}

impl HashJoinProbe {
    fn artifact(&self) -> Result<&Arc<JoinBuildArtifact>> {
        self.state
            .artifact
            .get()
            .ok_or_else(|| Status::internal("join probed before build completed"))
    }

    fn short_circuit(&self) -> bool {
        self.join_op == JoinOp::Inner
            && self
                .state
                .artifact
                .get()
                .map(|a| a.table.is_empty())
                .unwrap_or(false)
    }

    /// Collect `(probe_row, build_row)` candidates along hash chains.
    fn collect_candidates(
        &self,
        artifact: &JoinBuildArtifact,
        key_arrays: &[ArrayRef],
        num_rows: usize,
    ) -> Result<Vec<(u32, u32)>> {
        let table = &artifact.table;
        let mut pairs = Vec::new();
        for row in 0..num_rows {
            if table.row_has_forbidden_null(key_arrays, row) {
                continue;
            }
            let hash = table.hash_row(key_arrays, row)?;
            let mut cursor = table.chain_head(hash);
            while let Some(build_row) = cursor {
                cursor = table.chain_next(build_row);
                if table.row_hash(build_row) != hash {
                    continue;
                }
                if !table.is_matchable(build_row) {
                    continue;
                }
                // Already-matched rows cannot contribute again to semi/anti
                // on the build side; skip them before the key compare.
                if matches!(self.join_op, JoinOp::RightSemi | JoinOp::RightAnti)
                    && table.is_matched(build_row)
                {
                    continue;
                }
                if table.keys_equal(key_arrays, row, build_row)? {
                    pairs.push((row as u32, build_row));
                }
            }
        }
        Ok(pairs)
    }

    /// Evaluate `other_join_conjuncts` over concatenated candidate rows.
    fn other_conjunct_mask(
        &self,
        artifact: &JoinBuildArtifact,
        probe: &Chunk,
        pairs: &[(u32, u32)],
    ) -> Result<Vec<bool>> {
        if self.other_join_conjuncts.is_empty() || pairs.is_empty() {
            return Ok(vec![true; pairs.len()]);
        }
        let probe_rows: Vec<Option<u32>> = pairs.iter().map(|(p, _)| Some(*p)).collect();
        let build_rows: Vec<Option<u32>> = pairs.iter().map(|(_, b)| Some(*b)).collect();
        let probe_cols = gather_probe_columns(probe, &probe_rows)?;
        let build_cols = gather_build_columns(artifact, &self.build_schema, &build_rows)?;

        let mut fields = Vec::new();
        for field in self.probe_schema.fields() {
            fields.push(field.as_ref().clone().with_nullable(true));
        }
        for field in self.build_schema.fields() {
            fields.push(field.as_ref().clone().with_nullable(true));
        }
        let schema = Arc::new(Schema::new(fields));
        let mut columns = probe_cols;
        columns.extend(build_cols);
        let pair_chunk = Chunk::try_new(RecordBatch::try_new(schema, columns)?)?;

        let mut mask = vec![true; pairs.len()];
        for conjunct in &self.other_join_conjuncts {
            let selected = conjunct.eval_predicate(&pair_chunk)?;
            for (i, keep) in mask.iter_mut().enumerate() {
                *keep = *keep && selected.value(i);
            }
        }
        Ok(mask)
    }

    fn emit(
        &mut self,
        artifact: &JoinBuildArtifact,
        probe: &Chunk,
        probe_rows: Vec<Option<u32>>,
        build_rows: Vec<Option<u32>>,
    ) -> Result<()> {
        if probe_rows.is_empty() && build_rows.is_empty() {
            return Ok(());
        }
        let columns = match self.layout {
            OutputLayout::ProbeOnly => gather_probe_columns(probe, &probe_rows)?,
            OutputLayout::BuildOnly => {
                gather_build_columns(artifact, &self.build_schema, &build_rows)?
            }
            OutputLayout::Both => {
                let mut columns = gather_probe_columns(probe, &probe_rows)?;
                columns.extend(gather_build_columns(
                    artifact,
                    &self.build_schema,
                    &build_rows,
                )?);
                columns
            }
        };
        let chunk = Chunk::try_new(RecordBatch::try_new(Arc::clone(&self.out_schema), columns)?)?;
        let chunk = crate::exec::expr::filter_chunk(&chunk, &self.conjuncts)?;
        if !chunk.is_empty() {
            self.pending.push_back(chunk);
        }
        Ok(())
    }

    fn probe_chunk(&mut self, probe: &Chunk) -> Result<()> {
        let artifact = Arc::clone(self.artifact()?);
        let artifact = artifact.as_ref();
        let num_rows = probe.len();

        let mut key_arrays = Vec::with_capacity(self.probe_exprs.len());
        for expr in &self.probe_exprs {
            key_arrays.push(expr.eval(probe)?);
        }

        let pairs = self.collect_candidates(artifact, &key_arrays, num_rows)?;
        let mask = self.other_conjunct_mask(artifact, probe, &pairs)?;

        let table = &artifact.table;
        let mut probe_matched = vec![false; num_rows];
        let mut out_probe: Vec<Option<u32>> = Vec::new();
        let mut out_build: Vec<Option<u32>> = Vec::new();

        for ((probe_row, build_row), passed) in pairs.iter().zip(mask.iter()) {
            if !*passed {
                continue;
            }
            let probe_row = *probe_row;
            let build_row = *build_row;
            match self.join_op {
                JoinOp::Inner => {
                    out_probe.push(Some(probe_row));
                    out_build.push(Some(build_row));
                }
                JoinOp::LeftOuter => {
                    probe_matched[probe_row as usize] = true;
                    out_probe.push(Some(probe_row));
                    out_build.push(Some(build_row));
                }
                JoinOp::LeftSemi => {
                    if !probe_matched[probe_row as usize] {
                        probe_matched[probe_row as usize] = true;
                        out_probe.push(Some(probe_row));
                        out_build.push(None);
                    }
                }
                JoinOp::LeftAnti => {
                    probe_matched[probe_row as usize] = true;
                }
                JoinOp::RightSemi => {
                    if !table.is_matched(build_row) {
                        table.set_matched(build_row);
                        out_probe.push(None);
                        out_build.push(Some(build_row));
                    }
                }
                JoinOp::RightAnti => {
                    table.set_matched(build_row);
                }
                JoinOp::RightOuter => {
                    table.set_matched(build_row);
                    out_probe.push(Some(probe_row));
                    out_build.push(Some(build_row));
                }
                JoinOp::FullOuter => {
                    table.set_matched(build_row);
                    probe_matched[probe_row as usize] = true;
                    out_probe.push(Some(probe_row));
                    out_build.push(Some(build_row));
                }
            }
        }

        // Probe rows whose chain produced no surviving pair.
        match self.join_op {
            JoinOp::LeftOuter | JoinOp::FullOuter => {
                for row in 0..num_rows {
                    if !probe_matched[row] {
                        out_probe.push(Some(row as u32));
                        out_build.push(None);
                    }
                }
            }
            JoinOp::LeftAnti => {
                for row in 0..num_rows {
                    if !probe_matched[row] {
                        out_probe.push(Some(row as u32));
                        out_build.push(None);
                    }
                }
            }
            _ => {}
        }

        self.emit(artifact, probe, out_probe, out_build)
    }

    /// One batch of the post-probe unmatched-build replay.
    fn pull_unmatched(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        let artifact = Arc::clone(self.artifact()?);
        let artifact = artifact.as_ref();
        let table = &artifact.table;
        let total = table.size() as u32;
        let batch_size = state.batch_size().max(1);

        let mut build_rows: Vec<Option<u32>> = Vec::new();
        while self.unmatched_cursor < total && build_rows.len() < batch_size {
            let row = self.unmatched_cursor;
            self.unmatched_cursor += 1;
            if !table.is_matched(row) {
                build_rows.push(Some(row));
            }
        }
        if build_rows.is_empty() {
            return Ok(None);
        }
        let probe_rows: Vec<Option<u32>> = vec![None; build_rows.len()];
        let columns = match self.layout {
            OutputLayout::BuildOnly => {
                gather_build_columns(artifact, &self.build_schema, &build_rows)?
            }
            _ => {
                let mut columns = null_probe_columns(&self.probe_schema, probe_rows.len())?;
                columns.extend(gather_build_columns(
                    artifact,
                    &self.build_schema,
                    &build_rows,
                )?);
                columns
            }
        };
        let chunk = Chunk::try_new(RecordBatch::try_new(Arc::clone(&self.out_schema), columns)?)?;
        let chunk = crate::exec::expr::filter_chunk(&chunk, &self.conjuncts)?;
        Ok(Some(chunk))
    }
}

fn gather_probe_columns(probe: &Chunk, rows: &[Option<u32>]) -> Result<Vec<ArrayRef>> {
    let indices = UInt32Array::from(rows.to_vec());
    let mut out = Vec::with_capacity(probe.columns().len());
    for column in probe.columns() {
        out.push(take(column, &indices, None)?);
    }
    Ok(out)
}

fn null_probe_columns(schema: &SchemaRef, len: usize) -> Result<Vec<ArrayRef>> {
    Ok(schema
        .fields()
        .iter()
        .map(|f| new_null_array(f.data_type(), len))
        .collect())
}

/// Gather build rows across the retained build chunks; `None` rows become
/// nulls via a one-row null batch appended behind the real batches.
fn gather_build_columns(
    artifact: &JoinBuildArtifact,
    build_schema: &SchemaRef,
    rows: &[Option<u32>],
) -> Result<Vec<ArrayRef>> {
    let table = &artifact.table;
    let indices: Vec<(usize, usize)> = rows
        .iter()
        .map(|row| match row {
            Some(row_id) => {
                let (batch, row_in_batch) = table.location(*row_id);
                (batch as usize, row_in_batch as usize)
            }
            None => (artifact.build_chunks.len(), 0),
        })
        .collect();

    let mut out = Vec::with_capacity(build_schema.fields().len());
    for (col_idx, field) in build_schema.fields().iter().enumerate() {
        let null_row = new_null_array(field.data_type(), 1);
        let mut arrays: Vec<&dyn Array> = Vec::with_capacity(artifact.build_chunks.len() + 1);
        for chunk in &artifact.build_chunks {
            arrays.push(chunk.columns()[col_idx].as_ref());
        }
        arrays.push(null_row.as_ref());
        out.push(interleave(&arrays, &indices)?);
    }
    Ok(out)
}

impl Operator for HashJoinProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_finished(&self) -> bool {
        if self.short_circuit() && self.pending.is_empty() {
            return true;
        }
        if !self.probe_done || !self.pending.is_empty() {
            return false;
        }
        if self.unmatched_scan {
            let done = self
                .state
                .artifact
                .get()
                .map(|a| self.unmatched_cursor >= a.table.size() as u32)
                .unwrap_or(true);
            return done;
        }
        true
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for HashJoinProbe {
    fn need_input(&self) -> bool {
        !self.probe_done && !self.short_circuit() && self.pending.len() < 4
    }

    fn has_output(&self) -> bool {
        if !self.pending.is_empty() {
            return true;
        }
        self.probe_done
            && self.unmatched_scan
            && self
                .state
                .artifact
                .get()
                .map(|a| self.unmatched_cursor < a.table.size() as u32)
                .unwrap_or(false)
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        let timer = self.probe_timer.clone();
        let _t = ScopedTimer::new(&timer);
        state.check_cancelled()?;
        if chunk.is_empty() || self.short_circuit() {
            return Ok(());
        }
        self.probe_rows.add(chunk.len() as i64);
        self.probe_chunk(&chunk)
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        state.check_cancelled()?;
        if let Some(chunk) = self.pending.pop_front() {
            return Ok(Some(chunk));
        }
        if self.probe_done && self.unmatched_scan {
            let timer = self.probe_timer.clone();
            let _t = ScopedTimer::new(&timer);
            return self.pull_unmatched(state);
        }
        Ok(None)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<()> {
        if self.probe_done {
            return Ok(());
        }
        state.check_cancelled()?;
        self.probe_done = true;
        // The last probe instance to finish replays the table for the
        // variants that owe never-matched build rows.
        if self.join_op.keeps_unmatched_build()
            && self.state.probe_instances.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.unmatched_scan = true;
        }
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        Some(self.state.dependency.clone())
    }
}
