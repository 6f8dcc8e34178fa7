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
pub mod exchange_sink;
pub mod exchange_source;
pub mod hashjoin;
pub mod result_sink;
pub mod scan;

use crate::common::status::{Result, Status};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::runtime::runtime_state::RuntimeState;

/// Placeholder produced when a factory cannot construct its operator; the
/// construction error surfaces from `prepare` and fails the driver.
pub struct FailedOperator {
    name: &'static str,
    error: Status,
}

impl FailedOperator {
    pub fn new(name: &'static str, error: Status) -> Self {
        Self { name, error }
    }
}

impl Operator for FailedOperator {
    fn name(&self) -> &str {
        self.name
    }

    fn prepare(&mut self) -> Result<()> {
        Err(self.error.clone())
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for FailedOperator {
    fn need_input(&self) -> bool {
        false
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> Result<()> {
        Err(self.error.clone())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> Result<Option<Chunk>> {
        Err(self.error.clone())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> Result<()> {
        Err(self.error.clone())
    }
}
