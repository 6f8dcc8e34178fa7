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
//! Pipeline driver: the unit of scheduling.
//!
//! A driver owns one operator instance per pipeline stage plus a one-chunk
//! buffer per edge, and cooperatively moves chunks downstream until its
//! time slice expires or it cannot progress. Yield reasons are recorded so
//! the dispatcher can re-ready the driver without losing state.
//!
//! ```text
//!              (scheduled)                 (time slice ends)
//!   Ready ───────────────────► Running ─────────────────────► Ready
//!                               │  │
//!                               │  ├─ blocks ───► Blocked(reason)
//!                               │  ├─ all ops done ─► PendingFinish ─► Finished
//!                               │  ├─ canceled ──► Canceled
//!                               │  └─ error ─────► Failed(status)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::status::Status;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{BlockedReason, Operator};
use crate::gneiss_logging::{debug, error};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::runtime_state::RuntimeState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverState {
    Ready,
    Running,
    Blocked(BlockedReason),
    PendingFinish,
    Finished,
    Canceled,
    Failed(Status),
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed(_)
        )
    }
}

pub struct PipelineDriver {
    driver_id: i32,
    operators: Vec<Box<dyn Operator>>,
    runtime_state: Arc<RuntimeState>,
    state: DriverState,
    closed: bool,
    pending_finish_state: Option<DriverState>,

    edge_chunks: Vec<Option<Chunk>>,
    edge_closed: Vec<bool>,
    operator_finishing_set: Vec<bool>,
}

impl PipelineDriver {
    pub fn new(
        driver_id: i32,
        mut operators: Vec<Box<dyn Operator>>,
        runtime_state: Arc<RuntimeState>,
    ) -> Self {
        let operator_count = operators.len();
        let edge_count = operator_count.saturating_sub(1);
        if let Some(root) = runtime_state.mem_tracker() {
            for (idx, op) in operators.iter_mut().enumerate() {
                let label = format!("operator {}: {}", idx, op.name());
                op.set_mem_tracker(MemTracker::new_child(label, root));
            }
        }
        Self {
            driver_id,
            operators,
            runtime_state,
            state: DriverState::Ready,
            closed: false,
            pending_finish_state: None,
            edge_chunks: vec![None; edge_count],
            edge_closed: vec![false; edge_count],
            operator_finishing_set: vec![false; operator_count],
        }
    }

    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn prepare(&mut self) -> crate::common::status::Result<()> {
        for op in self.operators.iter_mut() {
            op.prepare()?;
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.operators
            .last()
            .map(|op| op.is_finished())
            .unwrap_or(true)
    }

    fn has_pending_finish(&self) -> bool {
        self.operators.iter().any(|op| op.pending_finish())
    }

    /// Run until blocked, finished, failed, or the slice expires.
    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        if let Some(final_state) = self.pending_finish_state.clone() {
            if self.has_pending_finish() {
                self.state = DriverState::PendingFinish;
                return self.state.clone();
            }
            self.pending_finish_state = None;
            return self.finish_with_state(final_state);
        }

        let start = Instant::now();
        self.state = DriverState::Running;

        loop {
            if self.runtime_state.is_cancelled() {
                return self.finish_with_state(DriverState::Canceled);
            }
            if let Some(err) = self.runtime_state.error() {
                return self.finish_with_state(DriverState::Failed(err));
            }
            if start.elapsed() >= time_slice {
                self.state = DriverState::Ready;
                return self.state.clone();
            }
            if self.is_finished() {
                return self.finish_with_state(DriverState::Finished);
            }

            if let Some(dep) = self.find_precondition_dependency() {
                self.state = DriverState::Blocked(BlockedReason::Dependency(dep));
                return self.state.clone();
            }

            let mut made_progress = false;
            if let Err(err) = self
                .propagate_edge_closure(&mut made_progress)
                .and_then(|_| self.drive_set_finishing(&mut made_progress))
                .and_then(|_| self.drive_dataflow(&mut made_progress))
            {
                return self.finish_with_state(DriverState::Failed(err));
            }

            if made_progress {
                continue;
            }

            // No movement: decide what the driver is waiting on. Prefer
            // source readiness when nothing is buffered so a full sink does
            // not mask an empty input.
            let has_buffered = self.edge_chunks.iter().any(|c| c.is_some());
            if !self.source_ready() && !has_buffered {
                self.state = DriverState::Blocked(BlockedReason::InputEmpty);
                return self.state.clone();
            }
            if !self.sink_ready() {
                self.state = DriverState::Blocked(BlockedReason::OutputFull);
                return self.state.clone();
            }
            if !self.source_ready() {
                self.state = DriverState::Blocked(BlockedReason::InputEmpty);
                return self.state.clone();
            }

            self.state = DriverState::Ready;
            return self.state.clone();
        }
    }

    fn find_precondition_dependency(&self) -> Option<DependencyHandle> {
        for op in &self.operators {
            if op.is_finished() {
                continue;
            }
            let Some(proc) = op.as_processor_ref() else {
                continue;
            };
            let Some(dep) = proc.precondition_dependency() else {
                continue;
            };
            if !dep.is_ready() {
                return Some(dep);
            }
        }
        None
    }

    fn source_ready(&self) -> bool {
        let Some(op) = self.operators.first() else {
            return true;
        };
        if op.is_finished() {
            return true;
        }
        let Some(proc) = op.as_processor_ref() else {
            return true;
        };
        proc.has_output() || op.is_finished()
    }

    fn sink_ready(&self) -> bool {
        let Some(op) = self.operators.last() else {
            return true;
        };
        if op.is_finished() {
            return true;
        }
        let Some(proc) = op.as_processor_ref() else {
            return true;
        };
        proc.need_input() || op.is_finished()
    }

    fn has_ready_finishing_work(&self) -> bool {
        for idx in 1..self.operators.len() {
            if self.operator_finishing_set[idx] {
                continue;
            }
            let in_edge = idx - 1;
            if self.edge_closed[in_edge] && self.edge_chunks[in_edge].is_none() {
                return true;
            }
        }
        false
    }

    /// Re-poll a parked driver; used by the dispatcher's blocked poller.
    pub fn check_is_ready(&self) -> bool {
        // A fragment error or cancellation unblocks everything so drivers
        // can short-circuit to close.
        if self.runtime_state.is_cancelled() || self.runtime_state.error().is_some() {
            return true;
        }
        match &self.state {
            DriverState::Blocked(reason) => match reason {
                BlockedReason::InputEmpty => {
                    self.source_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::OutputFull => {
                    self.sink_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::Dependency(dep) => dep.is_ready(),
            },
            DriverState::PendingFinish => !self.has_pending_finish(),
            _ => true,
        }
    }

    pub fn set_ready(&mut self) {
        self.state = DriverState::Ready;
    }

    fn finish_with_state(&mut self, state: DriverState) -> DriverState {
        if matches!(state, DriverState::Canceled | DriverState::Failed(_)) {
            for op in self.operators.iter_mut() {
                op.cancel();
            }
        }
        if state.is_terminal()
            && self.pending_finish_state.is_none()
            && self.has_pending_finish()
        {
            self.pending_finish_state = Some(state);
            self.state = DriverState::PendingFinish;
            return self.state.clone();
        }
        match &state {
            DriverState::Finished => {
                debug!(
                    "driver finished: finst={} driver_id={}",
                    self.runtime_state.fragment_instance_id(),
                    self.driver_id
                );
            }
            DriverState::Canceled => {
                debug!(
                    "driver canceled: finst={} driver_id={}",
                    self.runtime_state.fragment_instance_id(),
                    self.driver_id
                );
            }
            DriverState::Failed(err) => {
                error!(
                    "driver failed: finst={} driver_id={} error={}",
                    self.runtime_state.fragment_instance_id(),
                    self.driver_id,
                    err
                );
            }
            _ => {}
        }
        if state.is_terminal() {
            self.close_operators();
        }
        self.state = state;
        self.state.clone()
    }

    fn close_operators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for chunk in self.edge_chunks.iter_mut() {
            let _ = chunk.take();
        }
        // Reverse dependency order: sinks drain (joining in-flight RPCs)
        // before their upstreams release.
        for idx in (0..self.operators.len()).rev() {
            let op = &mut self.operators[idx];
            if let Err(err) = op.close() {
                error!("operator close failed: {}: {}", op.name(), err);
                self.runtime_state.set_error(err);
            }
        }
    }

    fn drive_dataflow(&mut self, made_progress: &mut bool) -> crate::common::status::Result<()> {
        if self.edge_chunks.is_empty() {
            return Ok(());
        }
        self.drive_push_edges(made_progress)?;
        self.drive_pull_edges(made_progress)?;
        self.drive_push_edges(made_progress)?;
        Ok(())
    }

    fn drive_push_edges(&mut self, made_progress: &mut bool) -> crate::common::status::Result<()> {
        for e in (0..self.edge_chunks.len()).rev() {
            if self.edge_chunks[e].is_none() {
                continue;
            }
            let downstream_idx = e + 1;
            let need_input = {
                let op = &self.operators[downstream_idx];
                let Some(proc) = op.as_processor_ref() else {
                    return Err(Status::internal(format!(
                        "pipeline operator {} is not a processor",
                        op.name()
                    )));
                };
                proc.need_input()
            };
            if !need_input {
                continue;
            }
            let chunk = self.edge_chunks[e].take().expect("checked is_some");
            let runtime_state = Arc::clone(&self.runtime_state);
            let op = &mut self.operators[downstream_idx];
            let proc = op
                .as_processor_mut()
                .ok_or_else(|| Status::internal("pipeline operator is not a processor"))?;
            proc.push_chunk(runtime_state.as_ref(), chunk)?;
            *made_progress = true;
        }
        Ok(())
    }

    fn drive_pull_edges(&mut self, made_progress: &mut bool) -> crate::common::status::Result<()> {
        for e in 0..self.edge_chunks.len() {
            if self.edge_chunks[e].is_some() {
                continue;
            }
            let (left, right) = self.operators.split_at_mut(e + 1);
            let upstream = left[e]
                .as_processor_mut()
                .ok_or_else(|| Status::internal("pipeline operator is not a processor"))?;
            let downstream = right[0]
                .as_processor_ref()
                .ok_or_else(|| Status::internal("pipeline operator is not a processor"))?;
            if !upstream.has_output() || !downstream.need_input() {
                continue;
            }
            if let Some(chunk) = upstream.pull_chunk(self.runtime_state.as_ref())? {
                self.edge_chunks[e] = Some(chunk);
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn propagate_edge_closure(
        &mut self,
        made_progress: &mut bool,
    ) -> crate::common::status::Result<()> {
        for e in 0..self.edge_chunks.len() {
            if self.edge_closed[e] || self.edge_chunks[e].is_some() {
                continue;
            }
            if self.operators[e].is_finished() {
                self.edge_closed[e] = true;
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn drive_set_finishing(
        &mut self,
        made_progress: &mut bool,
    ) -> crate::common::status::Result<()> {
        for idx in 1..self.operators.len() {
            if self.operator_finishing_set[idx] {
                continue;
            }
            let in_edge = idx - 1;
            if !self.edge_closed[in_edge] || self.edge_chunks[in_edge].is_some() {
                continue;
            }
            let runtime_state = Arc::clone(&self.runtime_state);
            let proc = self.operators[idx]
                .as_processor_mut()
                .ok_or_else(|| Status::internal("pipeline operator is not a processor"))?;
            proc.set_finishing(runtime_state.as_ref())?;
            self.operator_finishing_set[idx] = true;
            *made_progress = true;
        }
        Ok(())
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.close_operators();
    }
}
