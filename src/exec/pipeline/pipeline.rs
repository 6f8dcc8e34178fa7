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
//! One pipeline: an ordered factory list bounded by a source and a sink.

use std::sync::Arc;

use crate::common::status::{Result, Status};
use crate::exec::pipeline::driver::PipelineDriver;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::exec::pipeline::operator_factory::OperatorFactory;

pub struct Pipeline {
    id: i32,
    op_factories: Vec<Box<dyn OperatorFactory>>,
    dop: usize,
}

impl Pipeline {
    pub fn new(id: i32, op_factories: Vec<Box<dyn OperatorFactory>>, dop: usize) -> Self {
        Self {
            id,
            op_factories,
            dop: dop.max(1),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn dop(&self) -> usize {
        self.dop
    }

    pub fn set_dop(&mut self, dop: usize) {
        self.dop = dop.max(1);
    }

    pub fn add_op_factory(&mut self, factory: Box<dyn OperatorFactory>) {
        self.op_factories.push(factory);
    }

    pub fn op_factories(&self) -> &[Box<dyn OperatorFactory>] {
        &self.op_factories
    }

    /// Materialize `dop` drivers; instance `i` of each factory lands in
    /// driver `i`.
    pub fn instantiate_drivers(&self, ctx: &Arc<FragmentContext>) -> Result<Vec<PipelineDriver>> {
        let source_idx = self
            .op_factories
            .iter()
            .position(|f| f.is_source())
            .ok_or_else(|| Status::internal("pipeline missing source operator"))?;
        let sink_idx = self
            .op_factories
            .iter()
            .rposition(|f| f.is_sink())
            .ok_or_else(|| Status::internal("pipeline missing sink operator"))?;
        if source_idx != 0 {
            return Err(Status::internal("pipeline source must be first"));
        }
        if sink_idx + 1 != self.op_factories.len() {
            return Err(Status::internal("pipeline sink must be last"));
        }

        let mut drivers = Vec::with_capacity(self.dop);
        for i in 0..self.dop {
            let mut operators = Vec::with_capacity(self.op_factories.len());
            for factory in &self.op_factories {
                operators.push(factory.create(self.dop, i));
            }
            drivers.push(PipelineDriver::new(
                ctx.next_driver_id(),
                operators,
                Arc::clone(ctx.runtime_state()),
            ));
        }
        Ok(drivers)
    }
}
