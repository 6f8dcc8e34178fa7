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
//! Process execution environment.
//!
//! Everything the original modeled as process-wide singletons lives here as
//! an explicitly passed context object: the tracker hierarchy root, the
//! context managers, the exchange registry and transport, the driver
//! dispatcher and the aggregate function resolver. Construct once at
//! process start; dropping it stops the worker pool.

use std::sync::Arc;

use crate::common::config;
use crate::exec::expr::agg::AggregateFuncResolver;
use crate::exec::pipeline::dispatcher::DriverDispatcher;
use crate::exec::pipeline::fragment_context::FragmentContextManager;
use crate::runtime::exchange::ExchangeRegistry;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::query_context::QueryContextManager;
use crate::runtime::transmit::{ExchangeTransport, LoopbackTransport};

pub struct ExecEnv {
    process_mem_tracker: Arc<MemTracker>,
    query_context_manager: Arc<QueryContextManager>,
    fragment_context_manager: Arc<FragmentContextManager>,
    exchange_registry: Arc<ExchangeRegistry>,
    transport: Arc<dyn ExchangeTransport>,
    driver_dispatcher: Arc<DriverDispatcher>,
    agg_func_resolver: Arc<AggregateFuncResolver>,
}

impl ExecEnv {
    /// Environment with the in-process loopback transport.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(ExchangeRegistry::new());
        let transport: Arc<dyn ExchangeTransport> =
            Arc::new(LoopbackTransport::new(Arc::clone(&registry)));
        Self::with_transport(registry, transport)
    }

    /// Environment with a caller-provided transport (networked or test).
    pub fn with_transport(
        exchange_registry: Arc<ExchangeRegistry>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Arc<Self> {
        crate::gneiss_logging::init();
        let process_mem_tracker = MemTracker::new_root("process");
        let query_pool = MemTracker::new_child("query_pool", &process_mem_tracker);
        Arc::new(Self {
            process_mem_tracker,
            query_context_manager: Arc::new(QueryContextManager::new(query_pool)),
            fragment_context_manager: Arc::new(FragmentContextManager::new()),
            exchange_registry,
            transport,
            driver_dispatcher: DriverDispatcher::start(config::driver_worker_threads()),
            // Aggregate functions register at construction, never lazily.
            agg_func_resolver: Arc::new(AggregateFuncResolver::new()),
        })
    }

    pub fn process_mem_tracker(&self) -> &Arc<MemTracker> {
        &self.process_mem_tracker
    }

    pub fn query_context_manager(&self) -> &Arc<QueryContextManager> {
        &self.query_context_manager
    }

    pub fn fragment_context_manager(&self) -> &Arc<FragmentContextManager> {
        &self.fragment_context_manager
    }

    pub fn exchange_registry(&self) -> &Arc<ExchangeRegistry> {
        &self.exchange_registry
    }

    pub fn transport(&self) -> Arc<dyn ExchangeTransport> {
        Arc::clone(&self.transport)
    }

    pub fn driver_dispatcher(&self) -> &Arc<DriverDispatcher> {
        &self.driver_dispatcher
    }

    pub fn agg_func_resolver(&self) -> &Arc<AggregateFuncResolver> {
        &self.agg_func_resolver
    }

    /// Cancel every fragment of a query: flips the query flag and cancels
    /// the exchange receivers of each live fragment so blocked sources
    /// drain instead of waiting out the receive timeout.
    pub fn cancel_query(&self, query_id: crate::common::types::UniqueId) {
        self.query_context_manager.cancel_query(query_id);
        for ctx in self.fragment_context_manager.fragments_for_query(query_id) {
            self.exchange_registry
                .cancel_fragment(ctx.fragment_instance_id());
        }
    }
}
