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
//! Exchange receive side: a source operator polling this fragment's
//! receiver for reassembled chunks from upstream senders.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::Result;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::runtime::exchange::{ExchangeKey, ExchangePop, ExchangeRegistry};
use crate::runtime::runtime_state::RuntimeState;

pub struct ExchangeSourceFactory {
    name: String,
    node_id: PlanNodeId,
    registry: Arc<ExchangeRegistry>,
    key: ExchangeKey,
    num_senders: usize,
}

impl ExchangeSourceFactory {
    pub fn new(
        node_id: PlanNodeId,
        registry: Arc<ExchangeRegistry>,
        key: ExchangeKey,
        num_senders: usize,
    ) -> Self {
        Self {
            name: format!("EXCHANGE_SOURCE (id={node_id})"),
            node_id,
            registry,
            key,
            num_senders,
        }
    }
}

impl OperatorFactory for ExchangeSourceFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.node_id
    }

    fn is_source(&self) -> bool {
        true
    }

    fn create(&self, _degree_of_parallelism: usize, _instance_index: usize) -> Box<dyn Operator> {
        let handle = self.registry.handle(self.key, self.num_senders);
        Box::new(ExchangeSourceOperator {
            name: self.name.clone(),
            handle,
            finished: false,
        })
    }
}

pub struct ExchangeSourceOperator {
    name: String,
    handle: crate::runtime::exchange::ExchangeReceiverHandle,
    finished: bool,
}

impl Operator for ExchangeSourceOperator {
    fn name(&self) -> &str {
        &self.name
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

impl ProcessorOperator for ExchangeSourceOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        !self.finished && self.handle.has_output_or_finished()
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Err(crate::common::status::Status::internal(
            "exchange source cannot accept input",
        ))
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>> {
        state.check_cancelled()?;
        match self.handle.try_pop()? {
            Some(ExchangePop::Chunk(chunk)) => Ok(Some(chunk)),
            Some(ExchangePop::Finished(_stats)) => {
                self.finished = true;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Ok(())
    }
}
