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
//! Fragment executor: plan fragment params → contexts → pipelines →
//! drivers → dispatcher.

use std::sync::Arc;
use std::time::Duration;

use crate::common::config;
use crate::common::status::{Result, Status};
use crate::exec::pipeline::builder::PipelineBuilder;
use crate::exec::operators::exchange_sink::ExchangeSinkFactory;
use crate::exec::operators::result_sink::ResultSinkFactory;
use crate::exec::pipeline::dispatcher::DriverTask;
use crate::exec::pipeline::driver::PipelineDriver;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::gneiss_logging::info;
use crate::plan::{DataSinkDesc, ExecPlanFragmentParams};
use crate::runtime::compress::BlockCompression;
use crate::runtime::exchange::ExchangeKey;
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::query_context::QueryContext;
use crate::runtime::runtime_state::RuntimeState;

pub struct FragmentExecutor {
    query_ctx: Arc<QueryContext>,
    fragment_ctx: Arc<FragmentContext>,
    drivers: Vec<PipelineDriver>,
}

impl FragmentExecutor {
    /// Resolve contexts, build the operator tree into pipelines, convert
    /// the declared sink, assign morsels and materialize drivers.
    pub fn prepare(env: &ExecEnv, request: &ExecPlanFragmentParams) -> Result<Self> {
        let params = &request.params;
        let query_id = params.query_id;
        let fragment_instance_id = params.fragment_instance_id;

        let query_ctx = env
            .query_context_manager()
            .get_or_register(query_id, request.query_options.mem_limit);
        if params.instances_number > 0 {
            query_ctx.set_num_fragments(params.instances_number);
        }

        info!(
            "prepare fragment: query_id={} fragment_instance_id={} backend_num={}",
            query_id, fragment_instance_id, request.backend_num
        );

        let fragment_tracker = MemTracker::new_child_with_limit(
            format!("fragment {fragment_instance_id}"),
            request.query_options.mem_limit,
            query_ctx.mem_tracker(),
        );

        let batch_size = request
            .query_options
            .batch_size
            .unwrap_or_else(config::vector_chunk_size);
        let runtime_state = Arc::new(RuntimeState::new(
            query_id,
            fragment_instance_id,
            request.backend_num,
            batch_size,
            request.query_options.clone(),
            Some(Arc::clone(&fragment_tracker)),
            query_ctx.cancelled_flag(),
        ));

        let fragment_ctx = FragmentContext::new(
            query_id,
            fragment_instance_id,
            runtime_state,
            fragment_tracker,
            Arc::clone(env.exchange_registry()),
        );
        env.fragment_context_manager().register(Arc::clone(&fragment_ctx));

        // Retire the fragment from the registries once its drivers finish;
        // the last fragment of a query retires the query context too.
        {
            let fragment_manager = Arc::clone(env.fragment_context_manager());
            let query_manager = Arc::clone(env.query_context_manager());
            let query_ctx = Arc::clone(&query_ctx);
            fragment_ctx.set_finished_callback(Box::new(move || {
                fragment_manager.remove(fragment_instance_id);
                if query_ctx.fragment_finished() {
                    query_manager.remove(query_id);
                }
            }));
        }

        // Receivers learn their fan-in before any sender fires.
        let mut exchange_nodes = Vec::new();
        request.fragment.plan.collect_exchange_nodes(&mut exchange_nodes);
        for node in exchange_nodes {
            let num_senders = params
                .per_exch_num_senders
                .get(&node.node_id())
                .copied()
                .unwrap_or(0);
            env.exchange_registry().set_expected_senders(
                ExchangeKey {
                    fragment_instance_id,
                    node_id: node.node_id(),
                },
                usize::try_from(num_senders).unwrap_or(0),
            );
        }

        let profile = fragment_ctx.profile().clone();
        let query_threads = usize::try_from(request.query_options.query_threads.max(1))
            .unwrap_or(1);
        let builder = PipelineBuilder::new(
            params,
            &request.desc_tbl,
            &fragment_ctx,
            Arc::clone(env.exchange_registry()),
            profile.clone(),
            query_threads,
        );
        let mut pipelines = builder.build(&request.fragment.plan)?;

        // The declared sink becomes the root pipeline's last operator.
        let root = pipelines
            .last_mut()
            .ok_or_else(|| Status::internal("plan produced no pipelines"))?;
        match request.fragment.output_sink.as_ref() {
            None | Some(DataSinkDesc::Result) => {
                root.add_op_factory(Box::new(ResultSinkFactory::new(Arc::clone(
                    fragment_ctx.result_buffer(),
                ))));
            }
            Some(DataSinkDesc::Stream(stream_sink)) => {
                let codec = match request.query_options.transmission_compression_type {
                    Some(compress_type) => BlockCompression::for_compress_type(compress_type)?,
                    None => {
                        if config::compress_rowbatches() {
                            Some(BlockCompression::Lz4)
                        } else {
                            None
                        }
                    }
                };
                let rpc_timeout = Duration::from_secs(
                    u64::try_from(request.query_options.query_timeout_s.clamp(1, 3600))
                        .unwrap_or(300),
                );
                // One sender identity per fragment instance: the receiver
                // reassembles by (sender_id, sequence), so the sending
                // pipeline runs single-driver.
                root.set_dop(1);
                root.add_op_factory(Box::new(ExchangeSinkFactory::new(
                    stream_sink.clone(),
                    params.destinations.clone(),
                    params.sender_id,
                    request.backend_num,
                    env.transport(),
                    codec,
                    profile,
                    rpc_timeout,
                )));
            }
        }

        let num_pipelines = pipelines.len();
        let mut drivers = Vec::new();
        for (idx, pipeline) in pipelines.iter().enumerate() {
            let is_root = idx + 1 == num_pipelines;
            if is_root {
                fragment_ctx.set_num_root_drivers(pipeline.dop());
            }
            drivers.extend(pipeline.instantiate_drivers(&fragment_ctx)?);
        }
        fragment_ctx.set_num_drivers(drivers.len());

        Ok(Self {
            query_ctx,
            fragment_ctx,
            drivers,
        })
    }

    /// Prepare every driver, then hand them to the worker dispatcher.
    pub fn execute(mut self, env: &ExecEnv) -> Result<Arc<FragmentContext>> {
        for driver in self.drivers.iter_mut() {
            driver.prepare()?;
        }
        let fragment_ctx = Arc::clone(&self.fragment_ctx);
        for driver in self.drivers.drain(..) {
            env.driver_dispatcher().dispatch(DriverTask {
                driver,
                fragment: Arc::clone(&fragment_ctx),
            });
        }
        Ok(fragment_ctx)
    }

    pub fn query_ctx(&self) -> &Arc<QueryContext> {
        &self.query_ctx
    }

    pub fn fragment_ctx(&self) -> &Arc<FragmentContext> {
        &self.fragment_ctx
    }
}

/// Coordinator entry point: returns once drivers are dispatched; progress
/// is observed through the returned fragment context.
pub fn submit_exec_plan_fragment(
    env: &ExecEnv,
    request: &ExecPlanFragmentParams,
) -> Result<Arc<FragmentContext>> {
    let executor = FragmentExecutor::prepare(env, request)?;
    executor.execute(env)
}

/// Coordinator cancel path: flags the query-scoped cancellation the
/// fragment's drivers poll, and reclaims the fragment's exchange receivers
/// so blocked sources drain right away.
pub fn cancel_exec_plan_fragment(env: &ExecEnv, fragment_instance_id: crate::UniqueId) {
    if let Some(ctx) = env.fragment_context_manager().get(fragment_instance_id) {
        ctx.runtime_state().cancel();
    }
    env.exchange_registry().cancel_fragment(fragment_instance_id);
}
