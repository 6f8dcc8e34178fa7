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
//! Block arena for variable-length hash keys.
//!
//! Keys copied into the arena stay pinned for the arena's lifetime, so the
//! sets may store raw `(ptr, len, hash)` triples and never touch the source
//! column again after insertion.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::runtime::mem_tracker::MemTracker;

/// A byte slice pinned in a [`KeyArena`], with its hash precomputed so
/// equality can short-circuit on the hash before touching key memory.
#[derive(Clone, Copy, Debug)]
pub struct SliceKey {
    ptr: usize,
    len: usize,
    pub hash: u64,
}

impl SliceKey {
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::<u8>::dangling().as_ptr() as usize,
            len: 0,
            hash: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

pub struct KeyArena {
    blocks: Vec<Box<[u8]>>,
    cursor: usize,
    block_size: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl KeyArena {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            cursor: 0,
            block_size: block_size.max(1),
            mem_tracker: None,
            accounted_bytes: 0,
        }
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            if Arc::ptr_eq(current, &tracker) {
                return;
            }
            current.release(self.accounted_bytes);
        }
        let bytes = self.blocks.iter().map(|b| b.len()).sum::<usize>();
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    /// Copy `bytes` into the arena and return a pinned key carrying `hash`.
    pub fn alloc_copy(&mut self, bytes: &[u8], hash: u64) -> SliceKey {
        let needed = bytes.len().max(1);
        let current_block_len = self.blocks.last().map(|b| b.len()).unwrap_or(0);
        if self.blocks.is_empty() || self.cursor + needed > current_block_len {
            let block_size = self.block_size.max(needed);
            self.blocks.push(vec![0u8; block_size].into_boxed_slice());
            self.block_size = self.block_size.max(block_size);
            self.cursor = 0;
            if let Some(tracker) = self.mem_tracker.as_ref() {
                let charged = i64::try_from(block_size).unwrap_or(i64::MAX);
                tracker.consume(charged);
                self.accounted_bytes = self.accounted_bytes.saturating_add(charged);
            }
        }
        let block = self.blocks.last_mut().expect("key arena block");
        let start = self.cursor;
        let end = start + bytes.len();
        block[start..end].copy_from_slice(bytes);
        self.cursor = end;
        SliceKey {
            ptr: block.as_mut_ptr().wrapping_add(start) as usize,
            len: bytes.len(),
            hash,
        }
    }
}

impl Drop for KeyArena {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_stay_pinned_across_block_growth() {
        let mut arena = KeyArena::new(16);
        let mut keys = Vec::new();
        for i in 0..64u8 {
            let bytes = vec![i; 9];
            keys.push((arena.alloc_copy(&bytes, i as u64), bytes));
        }
        for (key, bytes) in &keys {
            assert_eq!(key.as_slice(), bytes.as_slice());
        }
    }

    #[test]
    fn arena_accounts_block_allocations() {
        let root = MemTracker::new_root("root");
        let tracker = MemTracker::new_child("arena", &root);
        let mut arena = KeyArena::new(32);
        arena.set_mem_tracker(Arc::clone(&tracker));
        arena.alloc_copy(&[1, 2, 3], 0);
        assert!(tracker.current() >= 32);
        drop(arena);
        assert_eq!(root.current(), 0);
    }
}
