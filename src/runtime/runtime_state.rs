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
//! Per-fragment-instance runtime state shared by all drivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::{Result, Status};
use crate::common::types::UniqueId;
use crate::plan::QueryOptions;
use crate::runtime::mem_tracker::MemTracker;

pub struct RuntimeState {
    query_id: UniqueId,
    fragment_instance_id: UniqueId,
    be_number: i32,
    batch_size: usize,
    query_options: QueryOptions,
    mem_tracker: Option<Arc<MemTracker>>,
    error: Mutex<Option<Status>>,
    cancelled: Arc<AtomicBool>,
}

impl RuntimeState {
    pub fn new(
        query_id: UniqueId,
        fragment_instance_id: UniqueId,
        be_number: i32,
        batch_size: usize,
        query_options: QueryOptions,
        mem_tracker: Option<Arc<MemTracker>>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            query_id,
            fragment_instance_id,
            be_number,
            batch_size,
            query_options,
            mem_tracker,
            error: Mutex::new(None),
            cancelled,
        }
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn be_number(&self) -> i32 {
        self.be_number
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn query_options(&self) -> &QueryOptions {
        &self.query_options
    }

    pub fn mem_tracker(&self) -> Option<&Arc<MemTracker>> {
        self.mem_tracker.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Polled at every batch and RPC boundary.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Status::cancelled(format!(
                "query {} cancelled",
                self.query_id
            )));
        }
        Ok(())
    }

    /// Record the fragment's terminal error; the first writer wins.
    pub fn set_error(&self, status: Status) -> bool {
        let mut guard = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(status);
        true
    }

    pub fn error(&self) -> Option<Status> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
