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
//! Morsel-bound scan source.
//!
//! One operator instance is bound to one morsel; parallelism of a source
//! pipeline is the morsel count. The scan applies its own conjuncts plus
//! whatever runtime filters have been pushed into the fragment's hub.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::Result;
use crate::exec::chunk::Chunk;
use crate::exec::expr::{filter_chunk, Expr};
use crate::exec::pipeline::morsel::Morsel;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::runtime_filter::RuntimeFilterHub;
use crate::runtime::runtime_state::RuntimeState;

pub struct ScanSourceFactory {
    name: String,
    node_id: PlanNodeId,
    conjuncts: Vec<Expr>,
    morsels: Vec<Morsel>,
    filter_hub: Arc<RuntimeFilterHub>,
}

impl ScanSourceFactory {
    pub fn new(
        node_id: PlanNodeId,
        conjuncts: Vec<Expr>,
        morsels: Vec<Morsel>,
        filter_hub: Arc<RuntimeFilterHub>,
    ) -> Self {
        Self {
            name: format!("DATA_SCAN (id={node_id})"),
            node_id,
            conjuncts,
            morsels,
            filter_hub,
        }
    }

    pub fn num_morsels(&self) -> usize {
        self.morsels.len()
    }
}

impl OperatorFactory for ScanSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node_id
    }

    fn is_source(&self) -> bool {
        true
    }

    fn create(&self, _degree_of_parallelism: usize, instance_index: usize) -> Box<dyn Operator> {
        let morsel = self.morsels.get(instance_index).cloned();
        Box::new(ScanSourceOperator {
            name: self.name.clone(),
            conjuncts: self.conjuncts.clone(),
            morsel,
            cursor: 0,
            filter_hub: Arc::clone(&self.filter_hub),
        })
    }
}

pub struct ScanSourceOperator {
    name: String,
    conjuncts: Vec<Expr>,
    morsel: Option<Morsel>,
    cursor: usize,
    filter_hub: Arc<RuntimeFilterHub>,
}

impl Operator for ScanSourceOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_finished(&self) -> bool {
        match self.morsel.as_ref() {
            None => true,
            Some(morsel) => self.cursor >= morsel.scan_range().chunks.len(),
        }
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for ScanSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.is_finished()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Err(crate::common::status::Status::internal(
            "scan source cannot accept input",
        ))
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        state.check_cancelled()?;
        let Some(morsel) = self.morsel.as_ref() else {
            return Ok(None);
        };
        let Some(chunk) = morsel.scan_range().chunks.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;

        let mut out = filter_chunk(chunk, &self.conjuncts)?;
        for filter in self.filter_hub.filters() {
            out = filter.apply(&out)?;
        }
        Ok(Some(out))
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }
}
