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
//! Result sink: collects root-pipeline output for the client.
//!
//! The fragment context exposes the buffer; the sink counts one eos per
//! root driver so consumers know when the result set is complete.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::Result;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::runtime_state::RuntimeState;

/// Shared sink buffer; complete once `eos_count == num_root_drivers`.
#[derive(Default)]
pub struct ResultBuffer {
    chunks: Mutex<Vec<Chunk>>,
    eos_count: AtomicUsize,
}

impl ResultBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: Chunk) {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(chunk);
    }

    pub fn mark_eos(&self) {
        self.eos_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn eos_count(&self) -> usize {
        self.eos_count.load(Ordering::Acquire)
    }

    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn total_rows(&self) -> usize {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|c| c.len())
            .sum()
    }
}

pub struct ResultSinkFactory {
    buffer: Arc<ResultBuffer>,
}

impl ResultSinkFactory {
    pub fn new(buffer: Arc<ResultBuffer>) -> Self {
        Self { buffer }
    }
}

impl OperatorFactory for ResultSinkFactory {
    fn name(&self) -> &str {
        "RESULT_SINK"
    }

    fn is_sink(&self) -> bool {
        true
    }

    fn create(&self, _degree_of_parallelism: usize, _instance_index: usize) -> Box<dyn Operator> {
        Box::new(ResultSinkOperator {
            buffer: Arc::clone(&self.buffer),
            finished: false,
        })
    }
}

pub struct ResultSinkOperator {
    buffer: Arc<ResultBuffer>,
    finished: bool,
}

impl Operator for ResultSinkOperator {
    fn name(&self) -> &str {
        "RESULT_SINK"
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

impl ProcessorOperator for ResultSinkOperator {
    fn need_input(&self) -> bool {
        !self.finished
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<()> {
        state.check_cancelled()?;
        if !chunk.is_empty() {
            self.buffer.push(chunk);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Ok(None)
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        if !self.finished {
            self.buffer.mark_eos();
            self.finished = true;
        }
        Ok(())
    }
}
