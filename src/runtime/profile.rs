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
//! Runtime profile: a tree of named counters, timers and info strings
//! reported per fragment/operator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
    DoubleValue,
}

#[derive(Clone, Debug)]
pub struct CounterRef {
    value: Arc<AtomicI64>,
    unit: CounterUnit,
}

impl CounterRef {
    fn new(unit: CounterUnit) -> Self {
        Self {
            value: Arc::new(AtomicI64::new(0)),
            unit,
        }
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Measures wall time of a scope into a `TimeNs` counter.
pub struct ScopedTimer<'a> {
    counter: &'a CounterRef,
    start: Instant,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(counter: &'a CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.counter.add(clamp_u128_to_i64(self.start.elapsed().as_nanos()));
    }
}

pub fn clamp_u128_to_i64(v: u128) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<ProfileInner>,
}

#[derive(Debug)]
struct ProfileInner {
    name: String,
    counters: Mutex<BTreeMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ProfileInner {
                name: name.into(),
                counters: Mutex::new(BTreeMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard
            .entry(name.into())
            .or_insert_with(|| CounterRef::new(unit))
            .clone()
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value.into());
    }

    pub fn info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let child = RuntimeProfile::new(name);
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child.clone());
        child
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Derived throughput in bytes per second from a bytes counter and a
    /// total-time counter.
    pub fn units_per_second(bytes: &CounterRef, total_time: &CounterRef) -> i64 {
        let ns = total_time.value();
        if ns <= 0 {
            return 0;
        }
        let bytes = bytes.value() as f64;
        (bytes / (ns as f64 / 1_000_000_000.0)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_by_name() {
        let profile = RuntimeProfile::new("Fragment");
        let a = profile.add_counter("BytesSent", CounterUnit::Bytes);
        let b = profile.add_counter("BytesSent", CounterUnit::Bytes);
        a.add(10);
        b.add(5);
        assert_eq!(profile.counter("BytesSent").unwrap().value(), 15);
    }

    #[test]
    fn scoped_timer_records_elapsed_time() {
        let profile = RuntimeProfile::new("Op");
        let timer = profile.add_timer("BuildTime");
        {
            let _t = ScopedTimer::new(&timer);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(timer.value() > 0);
    }
}
