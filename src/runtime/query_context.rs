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
//! Query-scoped context shared by all fragment instances of one query on
//! this worker: the query memory tracker, the cancellation flag and the
//! fragment countdown that retires the context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::MemTracker;

pub struct QueryContext {
    query_id: UniqueId,
    mem_tracker: Arc<MemTracker>,
    cancelled: Arc<AtomicBool>,
    remaining_fragments: AtomicI32,
}

impl QueryContext {
    fn new(query_id: UniqueId, mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            query_id,
            mem_tracker,
            cancelled: Arc::new(AtomicBool::new(false)),
            remaining_fragments: AtomicI32::new(0),
        }
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn cancelled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn set_num_fragments(&self, n: i32) {
        // The coordinator may register fragments one by one; keep the max.
        self.remaining_fragments.fetch_max(n, Ordering::AcqRel);
    }

    /// Returns true when this was the last fragment of the query.
    pub fn fragment_finished(&self) -> bool {
        self.remaining_fragments.fetch_sub(1, Ordering::AcqRel) <= 1
    }
}

/// Registry of live query contexts on this worker.
pub struct QueryContextManager {
    queries: Mutex<HashMap<UniqueId, Arc<QueryContext>>>,
    pool_mem_tracker: Arc<MemTracker>,
}

impl QueryContextManager {
    pub fn new(pool_mem_tracker: Arc<MemTracker>) -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
            pool_mem_tracker,
        }
    }

    pub fn get_or_register(&self, query_id: UniqueId, mem_limit: i64) -> Arc<QueryContext> {
        let mut guard = self.queries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(guard.entry(query_id).or_insert_with(|| {
            let tracker = MemTracker::new_child_with_limit(
                format!("query {query_id}"),
                mem_limit,
                &self.pool_mem_tracker,
            );
            Arc::new(QueryContext::new(query_id, tracker))
        }))
    }

    pub fn get(&self, query_id: UniqueId) -> Option<Arc<QueryContext>> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&query_id)
            .cloned()
    }

    pub fn remove(&self, query_id: UniqueId) {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&query_id);
    }

    pub fn cancel_query(&self, query_id: UniqueId) {
        if let Some(ctx) = self.get(query_id) {
            ctx.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contexts_are_shared_per_query() {
        let root = MemTracker::new_root("pool");
        let manager = QueryContextManager::new(root);
        let id = UniqueId::new(1, 2);
        let a = manager.get_or_register(id, -1);
        let b = manager.get_or_register(id, -1);
        assert!(Arc::ptr_eq(&a, &b));

        a.set_num_fragments(2);
        assert!(!a.fragment_finished());
        assert!(a.fragment_finished());
    }
}
