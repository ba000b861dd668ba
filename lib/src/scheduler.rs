// Copyright 2024 The AppOps Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Delayed-write scheduling.
//!
//! Mutations do not hit the disk directly; they arm a deadline on a single
//! background thread. A plain [`schedule`](WriteScheduler::schedule) arms the
//! long delay and coalesces everything that follows. A
//! [`schedule_fast`](WriteScheduler::schedule_fast) pulls a pending long
//! deadline in to the short window; once any deadline is armed, further
//! schedule requests of either kind are absorbed by it.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

#[derive(Default)]
struct SchedulerState {
    deadline: Option<Instant>,
    /// The armed deadline is the fast one; a fast request must not re-arm.
    fast: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Background timer that invokes a write callback when a deadline expires.
pub(crate) struct WriteScheduler {
    shared: Arc<Shared>,
    delay: Duration,
    fast_delay: Duration,
    worker: Option<JoinHandle<()>>,
}

impl WriteScheduler {
    pub fn new<F>(delay: Duration, fast_delay: Duration, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("appops-writer".to_owned())
                .spawn(move || run(&shared, &callback))
                .expect("failed to spawn writer thread")
        };
        Self {
            shared,
            delay,
            fast_delay,
            worker: Some(worker),
        }
    }

    /// Arms the long deadline unless a write is already scheduled.
    pub fn schedule(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.deadline.is_none() {
            state.deadline = Some(Instant::now() + self.delay);
            state.fast = false;
            self.shared.wakeup.notify_one();
        }
    }

    /// Pulls any pending deadline in to the fast window. While the fast
    /// window is armed, repeated calls do not push the deadline out.
    pub fn schedule_fast(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.fast {
            state.deadline = Some(Instant::now() + self.fast_delay);
            state.fast = true;
            self.shared.wakeup.notify_one();
        }
    }

    /// Disarms a pending deadline. Returns whether one was pending, i.e.
    /// whether unwritten state exists.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        state.fast = false;
        state.deadline.take().is_some()
    }
}

impl Drop for WriteScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.wakeup.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

fn run(shared: &Shared, callback: &(dyn Fn() + Send)) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                state = shared.wakeup.wait(state).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (next, _) = shared.wakeup.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                } else {
                    state.deadline = None;
                    state.fast = false;
                    drop(state);
                    debug!("write deadline expired, persisting app ops");
                    callback();
                    state = shared.state.lock().unwrap();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    fn counting_scheduler(
        delay: Duration,
        fast_delay: Duration,
    ) -> (WriteScheduler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let scheduler = WriteScheduler::new(delay, fast_delay, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (scheduler, count)
    }

    fn wait_for(count: &AtomicUsize, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < expected {
            assert!(Instant::now() < deadline, "timed out waiting for writes");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_schedule_fires_once() {
        let (scheduler, count) = counting_scheduler(
            Duration::from_millis(20),
            Duration::from_millis(5),
        );
        scheduler.schedule();
        scheduler.schedule();
        wait_for(&count, 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fast_overrides_delayed() {
        let (scheduler, count) = counting_scheduler(
            Duration::from_secs(3600),
            Duration::from_millis(10),
        );
        scheduler.schedule();
        scheduler.schedule_fast();
        wait_for(&count, 1);
    }

    #[test]
    fn test_fast_window_coalesces() {
        let (scheduler, count) = counting_scheduler(
            Duration::from_secs(3600),
            Duration::from_millis(30),
        );
        scheduler.schedule_fast();
        thread::sleep(Duration::from_millis(10));
        // Within the window neither request pushes the deadline out.
        scheduler.schedule_fast();
        scheduler.schedule();
        wait_for(&count, 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_reports_pending() {
        let (scheduler, count) = counting_scheduler(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert!(!scheduler.cancel());
        scheduler.schedule();
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_stops_worker() {
        let (scheduler, count) = counting_scheduler(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        scheduler.schedule();
        drop(scheduler);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
