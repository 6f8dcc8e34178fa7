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
//! Readiness dependencies between operators.
//!
//! A dependency is a named, once-settable flag an operator may expose as a
//! precondition (join build completion, runtime-filter arrival). Drivers
//! blocked on one are re-polled by the dispatcher until it becomes ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct DependencyState {
    name: String,
    ready: AtomicBool,
}

#[derive(Clone, Debug)]
pub struct DependencyHandle {
    state: Arc<DependencyState>,
}

impl PartialEq for DependencyHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for DependencyHandle {}

impl DependencyHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(DependencyState {
                name: name.into(),
                ready: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        self.state.ready.store(true, Ordering::Release);
    }
}
