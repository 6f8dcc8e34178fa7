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
//! Plan tree → pipelines.
//!
//! The tree is walked post-order; pipeline boundaries fall at blocking
//! operators (a join's build side ends in its build sink) and the last
//! pipeline built is the root. Scan-source pipeline parallelism is the
//! morsel count; everything else runs at `query_threads`.

use std::sync::Arc;

use crate::common::status::{Result, Status};
use crate::exec::expr::Expr;
use crate::exec::operators::exchange_source::ExchangeSourceFactory;
use crate::exec::operators::hashjoin::build::PushDownSpec;
use crate::exec::operators::hashjoin::{
    HashJoinBuildSinkFactory, HashJoinProbeFactory, JoinSharedState,
};
use crate::exec::operators::scan::ScanSourceFactory;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::exec::pipeline::morsel::convert_scan_ranges_to_morsels;
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::pipeline::pipeline::Pipeline;
use crate::plan::{DescriptorTbl, PlanFragmentExecParams, PlanNode};
use crate::runtime::exchange::{ExchangeKey, ExchangeRegistry};
use crate::runtime::profile::RuntimeProfile;

pub struct PipelineBuilder<'a> {
    params: &'a PlanFragmentExecParams,
    desc_tbl: &'a DescriptorTbl,
    fragment_ctx: &'a Arc<FragmentContext>,
    exchange_registry: Arc<ExchangeRegistry>,
    profile: RuntimeProfile,
    query_threads: usize,
    pipelines: Vec<Pipeline>,
    next_pipeline_id: i32,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(
        params: &'a PlanFragmentExecParams,
        desc_tbl: &'a DescriptorTbl,
        fragment_ctx: &'a Arc<FragmentContext>,
        exchange_registry: Arc<ExchangeRegistry>,
        profile: RuntimeProfile,
        query_threads: usize,
    ) -> Self {
        Self {
            params,
            desc_tbl,
            fragment_ctx,
            exchange_registry,
            profile,
            query_threads: query_threads.max(1),
            pipelines: Vec::new(),
            next_pipeline_id: 0,
        }
    }

    /// Build all pipelines for `plan`. The returned vector ends with the
    /// root pipeline, which still lacks its sink.
    pub fn build(mut self, plan: &PlanNode) -> Result<Vec<Pipeline>> {
        let (factories, dop) = self.build_node(plan)?;
        self.finish_pipeline(factories, dop);
        Ok(self.pipelines)
    }

    fn finish_pipeline(&mut self, factories: Vec<Box<dyn OperatorFactory>>, dop: usize) {
        let id = self.next_pipeline_id;
        self.next_pipeline_id += 1;
        self.pipelines.push(Pipeline::new(id, factories, dop));
    }

    fn build_node(&mut self, node: &PlanNode) -> Result<(Vec<Box<dyn OperatorFactory>>, usize)> {
        match node {
            PlanNode::Scan {
                node_id,
                conjuncts,
                ..
            } => {
                let scan_ranges = self
                    .params
                    .per_node_scan_ranges
                    .get(node_id)
                    .cloned()
                    .unwrap_or_default();
                let morsels = convert_scan_ranges_to_morsels(&scan_ranges, *node_id);
                // One driver per morsel.
                let dop = morsels.len().max(1);
                let factory = ScanSourceFactory::new(
                    *node_id,
                    conjuncts.clone(),
                    morsels,
                    Arc::clone(self.fragment_ctx.filter_hub()),
                );
                Ok((vec![Box::new(factory)], dop))
            }
            PlanNode::Exchange { node_id, .. } => {
                let num_senders = self
                    .params
                    .per_exch_num_senders
                    .get(node_id)
                    .copied()
                    .unwrap_or(0);
                let key = ExchangeKey {
                    fragment_instance_id: self.fragment_ctx.fragment_instance_id(),
                    node_id: *node_id,
                };
                let factory = ExchangeSourceFactory::new(
                    *node_id,
                    Arc::clone(&self.exchange_registry),
                    key,
                    usize::try_from(num_senders).unwrap_or(0),
                );
                Ok((vec![Box::new(factory)], self.query_threads))
            }
            PlanNode::HashJoin {
                node_id,
                join_op,
                eq_join_conjuncts,
                other_join_conjuncts,
                conjuncts,
                is_push_down,
                children,
            } => {
                if children.len() != 2 {
                    return Err(Status::invalid_argument("hash join needs two children"));
                }
                let probe_child = &children[0];
                let build_child = &children[1];

                let state = JoinSharedState::new(*node_id);
                let probe_exprs: Vec<Expr> =
                    eq_join_conjuncts.iter().map(|c| c.left.clone()).collect();
                let build_exprs: Vec<Expr> =
                    eq_join_conjuncts.iter().map(|c| c.right.clone()).collect();
                let null_safe: Vec<bool> =
                    eq_join_conjuncts.iter().map(|c| c.null_safe).collect();

                // Filters target probe-side scan columns; only bare column
                // references can be pushed.
                let probe_filter_slots = probe_exprs
                    .iter()
                    .map(|expr| match expr {
                        Expr::ColumnRef(slot) => Some(*slot),
                        _ => None,
                    })
                    .collect();
                let push_down = PushDownSpec {
                    requested: *is_push_down,
                    children_are_exchange: probe_child.is_exchange() && build_child.is_exchange(),
                    probe_filter_slots,
                };

                let join_profile = self.profile.child(format!("HashJoin (id={node_id})"));

                // The build side is its own pipeline ending at the build sink.
                let (mut build_factories, build_dop) = self.build_node(build_child)?;
                build_factories.push(Box::new(HashJoinBuildSinkFactory::new(
                    *node_id,
                    Arc::clone(&state),
                    *join_op,
                    build_exprs,
                    null_safe.clone(),
                    push_down,
                    Arc::clone(self.fragment_ctx.filter_hub()),
                    join_profile.clone(),
                )));
                self.finish_pipeline(build_factories, build_dop);

                // The probe continues the left child's pipeline.
                let probe_schema = self
                    .desc_tbl
                    .schema_for(&probe_child.output_slot_ids())?;
                let build_schema = self
                    .desc_tbl
                    .schema_for(&build_child.output_slot_ids())?;
                let (mut probe_factories, probe_dop) = self.build_node(probe_child)?;
                probe_factories.push(Box::new(HashJoinProbeFactory::new(
                    *node_id,
                    state,
                    *join_op,
                    probe_exprs,
                    other_join_conjuncts.clone(),
                    conjuncts.clone(),
                    probe_schema,
                    build_schema,
                    join_profile,
                )));
                Ok((probe_factories, probe_dop))
            }
        }
    }
}
