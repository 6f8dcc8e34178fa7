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
//! Driver dispatcher: a worker pool over a global ready queue, plus a
//! poller that re-readies parked drivers whose block reason cleared.
//!
//! A driver that exhausts its time slice goes back to the ready queue with
//! no loss of state; blocked and pending-finish drivers park until the
//! poller observes progress. Terminal drivers report into their fragment's
//! completion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::common::config;
use crate::exec::pipeline::driver::{DriverState, PipelineDriver};
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::gneiss_logging::debug;

const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct DriverTask {
    pub driver: PipelineDriver,
    pub fragment: Arc<FragmentContext>,
}

struct DispatcherShared {
    ready: Mutex<VecDeque<DriverTask>>,
    ready_cv: Condvar,
    blocked: Mutex<Vec<DriverTask>>,
    shutdown: AtomicBool,
}

pub struct DriverDispatcher {
    shared: Arc<DispatcherShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    time_slice: Duration,
}

impl DriverDispatcher {
    pub fn start(worker_threads: usize) -> Arc<Self> {
        let shared = Arc::new(DispatcherShared {
            ready: Mutex::new(VecDeque::new()),
            ready_cv: Condvar::new(),
            blocked: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        });
        let time_slice = Duration::from_millis(config::driver_time_slice_ms().max(1));
        let dispatcher = Arc::new(Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::new()),
            time_slice,
        });

        let mut handles = Vec::new();
        for worker_id in 0..worker_threads.max(1) {
            let shared = Arc::clone(&shared);
            let slice = time_slice;
            handles.push(
                std::thread::Builder::new()
                    .name(format!("driver-worker-{worker_id}"))
                    .spawn(move || worker_loop(shared, slice))
                    .expect("spawn driver worker"),
            );
        }
        {
            let shared = Arc::clone(&shared);
            handles.push(
                std::thread::Builder::new()
                    .name("driver-blocked-poller".to_string())
                    .spawn(move || poller_loop(shared))
                    .expect("spawn blocked poller"),
            );
        }
        *dispatcher.workers.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        dispatcher
    }

    pub fn dispatch(&self, task: DriverTask) {
        let mut ready = self
            .shared
            .ready
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        ready.push_back(task);
        self.shared.ready_cv.notify_one();
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.ready_cv.notify_all();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for DriverDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<DispatcherShared>, time_slice: Duration) {
    loop {
        let task = {
            let mut ready = shared.ready.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(task) = ready.pop_front() {
                    break task;
                }
                let (next, _) = shared
                    .ready_cv
                    .wait_timeout(ready, Duration::from_millis(50))
                    .unwrap_or_else(|e| e.into_inner());
                ready = next;
            }
        };
        run_task(&shared, task, time_slice);
    }
}

fn run_task(shared: &Arc<DispatcherShared>, mut task: DriverTask, time_slice: Duration) {
    let state = task.driver.process(time_slice);
    match state {
        DriverState::Ready | DriverState::Running => {
            let mut ready = shared.ready.lock().unwrap_or_else(|e| e.into_inner());
            ready.push_back(task);
            shared.ready_cv.notify_one();
        }
        DriverState::Blocked(_) | DriverState::PendingFinish => {
            let mut blocked = shared.blocked.lock().unwrap_or_else(|e| e.into_inner());
            blocked.push(task);
        }
        terminal => {
            debug!(
                "driver {} terminal: {:?}",
                task.driver.driver_id(),
                terminal
            );
            task.fragment.driver_done(terminal);
        }
    }
}

fn poller_loop(shared: Arc<DispatcherShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let woke: Vec<DriverTask> = {
            let mut blocked = shared.blocked.lock().unwrap_or_else(|e| e.into_inner());
            let mut still_blocked = Vec::with_capacity(blocked.len());
            let mut woke = Vec::new();
            for mut task in blocked.drain(..) {
                if task.driver.check_is_ready() {
                    task.driver.set_ready();
                    woke.push(task);
                } else {
                    still_blocked.push(task);
                }
            }
            *blocked = still_blocked;
            woke
        };
        if woke.is_empty() {
            std::thread::sleep(BLOCKED_POLL_INTERVAL);
            continue;
        }
        let mut ready = shared.ready.lock().unwrap_or_else(|e| e.into_inner());
        for task in woke {
            ready.push_back(task);
        }
        shared.ready_cv.notify_all();
    }
}
