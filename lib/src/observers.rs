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

//! Observer registry and mode-change fan-out.
//!
//! Observers subscribe by op switch code, by package name, or both. The
//! registry keeps three indexes (by code, by package, by token) so that a
//! mutation can collect its audience cheaply and a dying client can be torn
//! down by token alone.
//!
//! Callbacks never run under the engine lock. Mutating paths collect a
//! [`NotificationBatch`] while locked and dispatch it after the guard is
//! dropped; the batch deduplicates so one mutation delivers at most one
//! notification per (observer, code, package).

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Weak;

use tracing::warn;

use crate::catalog::OpCode;

/// Client-supplied callback invoked after a mode change it subscribed to.
///
/// `uid`/`package` identify the affected app; both are `None` for changes
/// that apply to every package, such as audio restriction updates.
pub trait OpModeObserver: Send + Sync {
    fn on_op_mode_changed(&self, code: OpCode, uid: Option<u32>, package: Option<&str>);
}

struct Registration {
    observer: Weak<dyn OpModeObserver>,
    codes: HashSet<OpCode>,
    packages: HashSet<String>,
}

/// Three-index observer table. Lives behind the engine lock.
#[derive(Default)]
pub(crate) struct ObserverRegistry {
    by_code: HashMap<OpCode, Vec<u64>>,
    by_package: HashMap<String, Vec<u64>>,
    by_token: HashMap<u64, Registration>,
}

impl ObserverRegistry {
    /// Adds a subscription for `token`. `code` must already be normalized to
    /// a switch code. Repeated registrations for the same (code, package)
    /// are collapsed.
    pub fn register(
        &mut self,
        token: u64,
        observer: Weak<dyn OpModeObserver>,
        code: Option<OpCode>,
        package: Option<&str>,
    ) {
        let registration = self
            .by_token
            .entry(token)
            .or_insert_with(|| Registration {
                observer,
                codes: HashSet::new(),
                packages: HashSet::new(),
            });
        if let Some(code) = code
            && registration.codes.insert(code)
        {
            self.by_code.entry(code).or_default().push(token);
        }
        if let Some(package) = package
            && registration.packages.insert(package.to_owned())
        {
            self.by_package
                .entry(package.to_owned())
                .or_default()
                .push(token);
        }
    }

    /// Removes every subscription held by `token`.
    pub fn unregister(&mut self, token: u64) {
        let Some(registration) = self.by_token.remove(&token) else {
            return;
        };
        for code in &registration.codes {
            if let Some(tokens) = self.by_code.get_mut(code) {
                tokens.retain(|&t| t != token);
                if tokens.is_empty() {
                    self.by_code.remove(code);
                }
            }
        }
        for package in &registration.packages {
            if let Some(tokens) = self.by_package.get_mut(package) {
                tokens.retain(|&t| t != token);
                if tokens.is_empty() {
                    self.by_package.remove(package);
                }
            }
        }
    }

    /// Observers interested in a change to `code` affecting `package`:
    /// the union of the code index and the package index.
    pub fn audience(&self, code: OpCode, package: Option<&str>) -> Vec<u64> {
        let code_watchers = self.by_code.get(&code).into_iter().flatten();
        let package_watchers = package
            .and_then(|p| self.by_package.get(p))
            .into_iter()
            .flatten();
        code_watchers.chain(package_watchers).copied().collect()
    }

    pub fn observer(&self, token: u64) -> Option<&Weak<dyn OpModeObserver>> {
        self.by_token.get(&token).map(|r| &r.observer)
    }
}

/// One queued mode-change notification.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Notification {
    code: OpCode,
    uid: Option<u32>,
    package: Option<String>,
}

/// Deduplicated set of notifications collected under the lock.
///
/// `dispatch` consumes the batch and must only be called after the engine
/// guard has been dropped.
#[derive(Default)]
pub(crate) struct NotificationBatch {
    queue: Vec<(Weak<dyn OpModeObserver>, Notification)>,
    seen: HashSet<(usize, OpCode, Option<String>)>,
}

impl NotificationBatch {
    /// Queues a notification unless this observer already has one for the
    /// same (code, package). Identity is the callback object, so an observer
    /// reachable through several indexes still gets one call.
    pub fn push(
        &mut self,
        observer: &Weak<dyn OpModeObserver>,
        code: OpCode,
        uid: Option<u32>,
        package: Option<&str>,
    ) {
        let identity = Weak::as_ptr(observer).cast::<()>() as usize;
        if self
            .seen
            .insert((identity, code, package.map(str::to_owned)))
        {
            self.queue.push((
                observer.clone(),
                Notification {
                    code,
                    uid,
                    package: package.map(str::to_owned),
                },
            ));
        }
    }

    pub fn dispatch(self) {
        for (observer, notification) in self.queue {
            match observer.upgrade() {
                Some(observer) => observer.on_op_mode_changed(
                    notification.code,
                    notification.uid,
                    notification.package.as_deref(),
                ),
                None => {
                    warn!(code = %notification.code, "skipping notification to dead observer");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(OpCode, Option<u32>, Option<String>)>>,
    }

    impl OpModeObserver for Recorder {
        fn on_op_mode_changed(&self, code: OpCode, uid: Option<u32>, package: Option<&str>) {
            self.seen
                .lock()
                .unwrap()
                .push((code, uid, package.map(str::to_owned)));
        }
    }

    fn weak_of(recorder: &Arc<Recorder>) -> Weak<dyn OpModeObserver> {
        let weak: Weak<Recorder> = Arc::downgrade(recorder);
        weak
    }

    #[test]
    fn test_audience_union() {
        let mut registry = ObserverRegistry::default();
        let code_watcher = Arc::new(Recorder::default());
        let package_watcher = Arc::new(Recorder::default());
        registry.register(1, weak_of(&code_watcher), Some(OpCode::VIBRATE), None);
        registry.register(2, weak_of(&package_watcher), None, Some("a.b"));

        let audience = registry.audience(OpCode::VIBRATE, Some("a.b"));
        assert_eq!(audience, vec![1, 2]);
        assert_eq!(registry.audience(OpCode::VIBRATE, Some("c.d")), vec![1]);
        assert_eq!(registry.audience(OpCode::CAMERA, Some("a.b")), vec![2]);
        assert_eq!(registry.audience(OpCode::CAMERA, None), vec![]);
    }

    #[test]
    fn test_unregister_clears_all_indexes() {
        let mut registry = ObserverRegistry::default();
        let watcher = Arc::new(Recorder::default());
        registry.register(1, weak_of(&watcher), Some(OpCode::VIBRATE), Some("a.b"));
        registry.unregister(1);
        assert!(registry.observer(1).is_none());
        assert_eq!(registry.audience(OpCode::VIBRATE, Some("a.b")), vec![]);
    }

    #[test]
    fn test_duplicate_subscription_collapsed() {
        let mut registry = ObserverRegistry::default();
        let watcher = Arc::new(Recorder::default());
        registry.register(1, weak_of(&watcher), Some(OpCode::VIBRATE), Some("a.b"));
        registry.register(1, weak_of(&watcher), Some(OpCode::VIBRATE), Some("a.b"));
        assert_eq!(registry.audience(OpCode::VIBRATE, Some("a.b")), vec![1]);
    }

    #[test]
    fn test_batch_dedups_per_observer() {
        let watcher = Arc::new(Recorder::default());
        let weak = weak_of(&watcher);
        let mut batch = NotificationBatch::default();
        // One observer found through both indexes still gets one callback.
        batch.push(&weak, OpCode::VIBRATE, Some(10042), Some("a.b"));
        batch.push(&weak, OpCode::VIBRATE, Some(10042), Some("a.b"));
        // A different package is a separate notification.
        batch.push(&weak, OpCode::VIBRATE, Some(10042), Some("c.d"));
        batch.dispatch();
        let seen = watcher.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].2.as_deref(), Some("a.b"));
        assert_eq!(seen[1].2.as_deref(), Some("c.d"));
    }

    #[test]
    fn test_dispatch_to_dead_observer_is_noop() {
        let watcher = Arc::new(Recorder::default());
        let weak = weak_of(&watcher);
        let mut batch = NotificationBatch::default();
        batch.push(&weak, OpCode::VIBRATE, None, None);
        drop(watcher);
        batch.dispatch();
    }
}
