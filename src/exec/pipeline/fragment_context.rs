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
//! Fragment-instance context shared by all of its drivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::exec::operators::result_sink::ResultBuffer;
use crate::exec::pipeline::driver::DriverState;
use crate::exec::runtime_filter::RuntimeFilterHub;
use crate::runtime::exchange::ExchangeRegistry;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::runtime_state::RuntimeState;

struct CompletionState {
    remaining: usize,
    error: Option<Status>,
    on_finished: Option<Box<dyn FnOnce() + Send>>,
}

pub struct FragmentContext {
    query_id: UniqueId,
    fragment_instance_id: UniqueId,
    runtime_state: Arc<RuntimeState>,
    mem_tracker: Arc<MemTracker>,
    exchange_registry: Arc<ExchangeRegistry>,
    result_buffer: Arc<ResultBuffer>,
    filter_hub: Arc<RuntimeFilterHub>,
    profile: RuntimeProfile,
    next_driver_id: AtomicI32,
    num_root_drivers: AtomicUsize,
    completion: Mutex<CompletionState>,
    completion_cv: Condvar,
}

impl FragmentContext {
    pub fn new(
        query_id: UniqueId,
        fragment_instance_id: UniqueId,
        runtime_state: Arc<RuntimeState>,
        mem_tracker: Arc<MemTracker>,
        exchange_registry: Arc<ExchangeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            fragment_instance_id,
            runtime_state,
            mem_tracker,
            exchange_registry,
            result_buffer: Arc::new(ResultBuffer::new()),
            filter_hub: Arc::new(RuntimeFilterHub::new()),
            profile: RuntimeProfile::new(format!("Fragment {fragment_instance_id}")),
            next_driver_id: AtomicI32::new(0),
            num_root_drivers: AtomicUsize::new(0),
            completion: Mutex::new(CompletionState {
                remaining: 0,
                error: None,
                on_finished: None,
            }),
            completion_cv: Condvar::new(),
        })
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn result_buffer(&self) -> &Arc<ResultBuffer> {
        &self.result_buffer
    }

    pub fn filter_hub(&self) -> &Arc<RuntimeFilterHub> {
        &self.filter_hub
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn next_driver_id(&self) -> i32 {
        self.next_driver_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The root pipeline's parallelism; the result sink needs it to count
    /// eos signals.
    pub fn set_num_root_drivers(&self, n: usize) {
        self.num_root_drivers.store(n, Ordering::Release);
    }

    pub fn num_root_drivers(&self) -> usize {
        self.num_root_drivers.load(Ordering::Acquire)
    }

    pub fn set_num_drivers(&self, n: usize) {
        let mut guard = self.completion.lock().unwrap_or_else(|e| e.into_inner());
        guard.remaining = n;
    }

    /// Run once every driver reached a terminal state, after the fragment's
    /// exchange receivers were reclaimed. The executor hooks registry
    /// retirement (fragment/query context managers) here.
    pub fn set_finished_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut guard = self.completion.lock().unwrap_or_else(|e| e.into_inner());
        guard.on_finished = Some(callback);
    }

    /// Record one driver's terminal state; the first error wins and cancels
    /// the peers. When the last driver retires, the fragment's exchange
    /// receivers are reclaimed and the finished callback runs.
    pub fn driver_done(&self, state: DriverState) {
        let mut failed = None;
        let (finished, callback) = {
            let mut guard = self.completion.lock().unwrap_or_else(|e| e.into_inner());
            guard.remaining = guard.remaining.saturating_sub(1);
            match state {
                DriverState::Failed(err) => {
                    if guard.error.is_none() {
                        guard.error = Some(err.clone());
                    }
                    failed = Some(err);
                }
                DriverState::Canceled => {
                    if guard.error.is_none() {
                        guard.error = Some(Status::cancelled(format!(
                            "fragment {} canceled",
                            self.fragment_instance_id
                        )));
                    }
                }
                _ => {}
            }
            let finished = guard.remaining == 0;
            let callback = if finished {
                guard.on_finished.take()
            } else {
                None
            };
            (finished, callback)
        };
        if let Some(err) = failed {
            self.runtime_state.set_error(err);
            self.runtime_state.cancel();
            // Wake receivers immediately so blocked peer sources observe
            // the terminal status on their next poll.
            self.exchange_registry
                .cancel_fragment(self.fragment_instance_id);
        }
        if finished {
            self.exchange_registry
                .cancel_fragment(self.fragment_instance_id);
            if let Some(callback) = callback {
                callback();
            }
        }
        self.completion_cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.completion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remaining
            == 0
    }

    /// Block until every driver reached a terminal state.
    pub fn wait_finish(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut guard = self.completion.lock().unwrap_or_else(|e| e.into_inner());
        while guard.remaining > 0 {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Status::timeout(format!(
                    "fragment {} did not finish within {timeout:?}",
                    self.fragment_instance_id
                )));
            }
            let (next, _) = self
                .completion_cv
                .wait_timeout(guard, timeout - elapsed)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
        match guard.error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn final_error(&self) -> Option<Status> {
        self.completion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }
}

/// Registry of live fragment contexts on this worker.
#[derive(Default)]
pub struct FragmentContextManager {
    fragments: Mutex<HashMap<UniqueId, Arc<FragmentContext>>>,
}

impl FragmentContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: Arc<FragmentContext>) {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.fragment_instance_id(), ctx);
    }

    pub fn get(&self, fragment_instance_id: UniqueId) -> Option<Arc<FragmentContext>> {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&fragment_instance_id)
            .cloned()
    }

    /// Live fragment instances of one query on this worker.
    pub fn fragments_for_query(&self, query_id: UniqueId) -> Vec<Arc<FragmentContext>> {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|ctx| ctx.query_id() == query_id)
            .cloned()
            .collect()
    }

    pub fn remove(&self, fragment_instance_id: UniqueId) {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&fragment_instance_id);
    }
}
