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
use crate::common::ids::PlanNodeId;
use crate::exec::pipeline::operator::Operator;

/// Produces one operator instance per driver of a pipeline.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    fn plan_node_id(&self) -> PlanNodeId {
        -1
    }

    /// Instantiate for driver `instance_index` of `degree_of_parallelism`.
    fn create(&self, degree_of_parallelism: usize, instance_index: usize) -> Box<dyn Operator>;

    /// True when instances produce data from outside the pipeline (scan,
    /// exchange receive).
    fn is_source(&self) -> bool {
        false
    }

    /// True when instances consume the pipeline's output (result sink,
    /// exchange send, join build).
    fn is_sink(&self) -> bool {
        false
    }
}
