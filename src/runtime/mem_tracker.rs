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
//! Hierarchical logical memory accounting.
//!
//! Trackers form a chain fragment → query → pool/process. `try_consume`
//! walks the chain and the first tracker over its limit fails the
//! allocation; accounting for a buffer can be transferred between trackers
//! when ownership of the buffer moves.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::status::{Result, Status};

/// Tracks a logically accounted byte buffer that can be transferred across
/// trackers, for allocations not backed by arrow buffers (e.g. serialized
/// exchange payloads).
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn transfer_to(&mut self, tracker: Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, &tracker) {
            return;
        }
        self.tracker.release(self.bytes);
        tracker.consume(self.bytes);
        self.tracker = tracker;
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

/// Tracks logical memory usage for a component and its ancestors.
///
/// Only bytes explicitly reported by callers are recorded; this does not
/// reflect process RSS or allocator statistics.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    /// Create a root tracker with no parent and no limit.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Self::build(label, -1, None)
    }

    /// Create a child tracker with no limit of its own.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Self::build(label, -1, Some(Arc::clone(parent)))
    }

    /// Create a child tracker that fails `try_consume` past `limit` bytes.
    /// A non-positive limit means unlimited.
    pub fn new_child_with_limit(
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<Self> {
        Self::build(label, limit, Some(Arc::clone(parent)))
    }

    fn build(label: impl Into<String>, limit: i64, parent: Option<Arc<MemTracker>>) -> Arc<Self> {
        let tracker = Arc::new(Self {
            label: label.into(),
            limit,
            parent: parent.clone(),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        });
        if let Some(parent) = parent.as_ref() {
            parent
                .children
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::downgrade(&tracker));
        }
        tracker
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(|weak| weak.upgrade()).collect()
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Like `consume`, but the first tracker in the chain whose limit would
    /// be exceeded fails the allocation and nothing is charged.
    pub fn try_consume(&self, bytes: i64) -> Result<()> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.limit > 0 && current.current() + bytes > current.limit {
                return Err(Status::mem_limit_exceeded(format!(
                    "memory limit exceeded on tracker '{}': limit={} current={} requested={}",
                    current.label,
                    current.limit,
                    current.current(),
                    bytes
                )));
            }
            tracker = current.parent.as_deref();
        }
        self.consume(bytes);
        Ok(())
    }

    /// Fail if any tracker in the chain is already over its limit. Used at
    /// batch boundaries after unconditional consumption (e.g. ownership
    /// transfer of a child's rows).
    pub fn check_limits(&self) -> Result<()> {
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.limit > 0 && current.current() > current.limit {
                return Err(Status::mem_limit_exceeded(format!(
                    "memory limit exceeded on tracker '{}': limit={} current={}",
                    current.label,
                    current.limit,
                    current.current()
                )));
            }
            tracker = current.parent.as_deref();
        }
        Ok(())
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_walks_the_ancestor_chain() {
        let root = MemTracker::new_root("process");
        let query = MemTracker::new_child("query", &root);
        let fragment = MemTracker::new_child("fragment", &query);

        fragment.consume(100);
        assert_eq!(fragment.current(), 100);
        assert_eq!(query.current(), 100);
        assert_eq!(root.current(), 100);

        fragment.release(40);
        assert_eq!(root.current(), 60);
        assert_eq!(root.peak(), 100);
    }

    #[test]
    fn first_over_limit_tracker_fails_try_consume() {
        let root = MemTracker::new_root("process");
        let query = MemTracker::new_child_with_limit("query", 100, &root);
        let fragment = MemTracker::new_child("fragment", &query);

        fragment.try_consume(80).expect("within limit");
        let err = fragment.try_consume(30).expect_err("over limit");
        assert_eq!(err.code, crate::common::status::StatusCode::MemLimitExceeded);
        assert!(err.message.contains("query"), "names the tracker: {err}");
        // Failed allocation charges nothing.
        assert_eq!(fragment.current(), 80);
        assert_eq!(root.current(), 80);
    }

    #[test]
    fn tracked_bytes_transfer_moves_accounting() {
        let root = MemTracker::new_root("process");
        let a = MemTracker::new_child("a", &root);
        let b = MemTracker::new_child("b", &root);

        let mut bytes = TrackedBytes::new(64, Arc::clone(&a));
        assert_eq!(a.current(), 64);
        bytes.transfer_to(Arc::clone(&b));
        assert_eq!(a.current(), 0);
        assert_eq!(b.current(), 64);
        drop(bytes);
        assert_eq!(b.current(), 0);
        assert_eq!(root.current(), 0);
    }
}
