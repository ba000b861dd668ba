// Copyright 2023 The AppOps Authors
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

#![expect(missing_docs)]

//! In-memory table of per-uid, per-package operation state.
//!
//! Ownership is strictly `StateStore` -> `UidState` -> `Ops` -> `Op`;
//! children carry their keys (uid, package name, code) instead of pointers
//! back to the parent. Containers are pruned as soon as they become empty:
//! after any mutation there is no `Ops` without ops and no `UidState` with
//! neither an overlay nor packages.
//!
//! Tables are insertion-ordered maps so iteration is deterministic; paths
//! that need canonical order (snapshot, dump) still sort by uid, package,
//! and code.

use indexmap::IndexMap;

use crate::catalog::Mode;
use crate::catalog::OpCode;

/// Accounting record for one (uid, package, op) triple.
#[derive(Clone, Debug, PartialEq)]
pub struct Op {
    pub uid: u32,
    pub package: String,
    pub code: OpCode,
    pub mode: Mode,
    /// Wall time of the last allowed access, ms since the epoch; 0 if never.
    pub time: i64,
    /// Wall time of the last rejected access, ms since the epoch; 0 if never.
    pub reject_time: i64,
    /// Duration of the last finished access in ms. -1 while in progress.
    pub duration: i64,
    /// Number of unfinished `start` calls.
    pub nesting: u32,
    pub proxy_uid: Option<u32>,
    pub proxy_package: Option<String>,
}

impl Op {
    pub fn new(uid: u32, package: &str, code: OpCode) -> Self {
        Self {
            uid,
            package: package.to_owned(),
            code,
            mode: code.default_mode(),
            time: 0,
            reject_time: 0,
            duration: 0,
            nesting: 0,
            proxy_uid: None,
            proxy_package: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.duration == -1
    }

    /// A record carrying no forensic value may be dropped.
    pub fn is_prunable(&self) -> bool {
        self.mode == self.code.default_mode() && self.time == 0 && self.reject_time == 0
    }
}

/// Per-(uid, package) op records plus the privileged flag computed when the
/// container was first created.
#[derive(Clone, Debug, PartialEq)]
pub struct Ops {
    pub uid: u32,
    pub package: String,
    pub privileged: bool,
    pub ops: IndexMap<OpCode, Op>,
}

impl Ops {
    fn new(uid: u32, package: &str, privileged: bool) -> Self {
        Self {
            uid,
            package: package.to_owned(),
            privileged,
            ops: IndexMap::new(),
        }
    }

    pub fn op(&self, code: OpCode) -> Option<&Op> {
        self.ops.get(&code)
    }

    pub fn op_mut(&mut self, code: OpCode) -> Option<&mut Op> {
        self.ops.get_mut(&code)
    }

    pub fn op_or_create(&mut self, code: OpCode) -> &mut Op {
        let uid = self.uid;
        let package = &self.package;
        self.ops
            .entry(code)
            .or_insert_with(|| Op::new(uid, package, code))
    }
}

/// Everything recorded about one uid: the uid-level mode overlay (keyed by
/// switch code) and per-package op containers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UidState {
    pub op_modes: IndexMap<OpCode, Mode>,
    pub pkg_ops: IndexMap<String, Ops>,
}

impl UidState {
    pub fn is_empty(&self) -> bool {
        self.op_modes.is_empty() && self.pkg_ops.is_empty()
    }
}

/// The root table, `uid -> UidState`. Accessed only under the engine lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateStore {
    uid_states: IndexMap<u32, UidState>,
}

impl StateStore {
    pub fn uid_state(&self, uid: u32) -> Option<&UidState> {
        self.uid_states.get(&uid)
    }

    pub fn uid_state_or_create(&mut self, uid: u32) -> &mut UidState {
        self.uid_states.entry(uid).or_default()
    }

    pub fn uid_state_mut(&mut self, uid: u32) -> Option<&mut UidState> {
        self.uid_states.get_mut(&uid)
    }

    pub fn ops(&self, uid: u32, package: &str) -> Option<&Ops> {
        self.uid_states.get(&uid)?.pkg_ops.get(package)
    }

    pub fn ops_mut(&mut self, uid: u32, package: &str) -> Option<&mut Ops> {
        self.uid_states.get_mut(&uid)?.pkg_ops.get_mut(package)
    }

    /// Creates (or returns) the container for a pair the engine has already
    /// validated against the package registry.
    pub fn create_ops(&mut self, uid: u32, package: &str, privileged: bool) -> &mut Ops {
        self.uid_state_or_create(uid)
            .pkg_ops
            .entry(package.to_owned())
            .or_insert_with(|| Ops::new(uid, package, privileged))
    }

    pub fn op(&self, uid: u32, package: &str, code: OpCode) -> Option<&Op> {
        self.ops(uid, package)?.op(code)
    }

    /// Drops the op if it carries no forensic value, then collapses any
    /// containers that became empty. Returns true if the op was pruned.
    pub fn prune_op_if_default(&mut self, uid: u32, package: &str, code: OpCode) -> bool {
        let Some(ops) = self.ops_mut(uid, package) else {
            return false;
        };
        let prunable = ops.op(code).is_some_and(Op::is_prunable);
        if prunable {
            ops.ops.shift_remove(&code);
            if ops.ops.is_empty() {
                self.remove_package(uid, package);
            }
        }
        prunable
    }

    /// Drops the `Ops` container for a package and the `UidState` if that
    /// left it empty.
    pub fn remove_package(&mut self, uid: u32, package: &str) -> bool {
        let Some(uid_state) = self.uid_states.get_mut(&uid) else {
            return false;
        };
        let removed = uid_state.pkg_ops.shift_remove(package).is_some();
        if uid_state.is_empty() {
            self.uid_states.shift_remove(&uid);
        }
        removed
    }

    pub fn remove_uid(&mut self, uid: u32) -> bool {
        self.uid_states.shift_remove(&uid).is_some()
    }

    /// Collapses empty `Ops` and an empty `UidState` under `uid`.
    pub fn remove_empty_containers(&mut self, uid: u32) {
        if let Some(uid_state) = self.uid_states.get_mut(&uid) {
            uid_state.pkg_ops.retain(|_, ops| !ops.ops.is_empty());
            if uid_state.is_empty() {
                self.uid_states.shift_remove(&uid);
            }
        }
    }

    pub fn uids(&self) -> impl Iterator<Item = u32> + '_ {
        self.uid_states.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &UidState)> {
        self.uid_states.iter().map(|(&uid, state)| (uid, state))
    }

    pub fn clear(&mut self) {
        self.uid_states.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.uid_states.is_empty()
    }

    /// Checks the no-empty-container invariant. Test hook.
    pub fn has_empty_containers(&self) -> bool {
        self.uid_states.values().any(|uid_state| {
            uid_state.is_empty() || uid_state.pkg_ops.values().any(|ops| ops.ops.is_empty())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let mut store = StateStore::default();
        assert!(store.ops(10042, "a.b").is_none());
        store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::CAMERA);
        let op = store.op(10042, "a.b", OpCode::CAMERA).unwrap();
        assert_eq!(op.mode, OpCode::CAMERA.default_mode());
        assert_eq!(op.nesting, 0);
        assert!(!op.is_running());
    }

    #[test]
    fn test_prune_requires_no_forensics() {
        let mut store = StateStore::default();
        let op = store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::CAMERA);
        op.time = 123;
        // An access was recorded, so the record must survive.
        assert!(!store.prune_op_if_default(10042, "a.b", OpCode::CAMERA));
        store
            .ops_mut(10042, "a.b")
            .unwrap()
            .op_mut(OpCode::CAMERA)
            .unwrap()
            .time = 0;
        assert!(store.prune_op_if_default(10042, "a.b", OpCode::CAMERA));
        // Pruning the last op collapses the containers all the way up.
        assert!(store.uid_state(10042).is_none());
        assert!(!store.has_empty_containers());
    }

    #[test]
    fn test_prune_keeps_non_default_mode() {
        let mut store = StateStore::default();
        store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::CAMERA)
            .mode = Mode::Ignored;
        assert!(!store.prune_op_if_default(10042, "a.b", OpCode::CAMERA));
        assert!(store.op(10042, "a.b", OpCode::CAMERA).is_some());
    }

    #[test]
    fn test_remove_package_keeps_overlay() {
        let mut store = StateStore::default();
        store
            .uid_state_or_create(10042)
            .op_modes
            .insert(OpCode::CAMERA, Mode::Errored);
        store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::VIBRATE);
        assert!(store.remove_package(10042, "a.b"));
        // The overlay still holds state for the uid.
        let uid_state = store.uid_state(10042).unwrap();
        assert_eq!(
            uid_state.op_modes.get(&OpCode::CAMERA),
            Some(&Mode::Errored)
        );
        assert!(!store.has_empty_containers());
    }

    #[test]
    fn test_remove_empty_containers() {
        let mut store = StateStore::default();
        store.create_ops(10042, "a.b", false);
        store
            .create_ops(10042, "c.d", false)
            .op_or_create(OpCode::CAMERA);
        store.remove_empty_containers(10042);
        assert!(store.ops(10042, "a.b").is_none());
        assert!(store.ops(10042, "c.d").is_some());
        store.ops_mut(10042, "c.d").unwrap().ops.clear();
        store.remove_empty_containers(10042);
        assert!(store.uid_state(10042).is_none());
    }
}
