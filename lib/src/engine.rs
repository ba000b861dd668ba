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

//! The decision engine.
//!
//! [`AppOpsService`] is the hot path consulted before an app performs a
//! sensitive action. It layers policy from three sources, most specific
//! first: the per-uid mode overlay, the per-(uid, package) mode stored under
//! the op's switch code, and the catalog default. User restrictions and
//! audio restrictions veto on top. Every attempt is accounted on the real
//! (non-switch) op code.
//!
//! All state lives behind one mutex. The lock is never held across observer
//! callbacks, package registry lookups, or file I/O: those paths snapshot
//! what they need, drop the guard, and do the slow work outside.
//!
//! Clients hold RAII tokens ([`ClientToken`], [`WatcherHandle`],
//! [`RestrictionToken`]). Dropping the last clone of a token is the client
//! dying: in-progress ops are finished, watch subscriptions are removed,
//! restriction layers are lifted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use itertools::Itertools as _;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::catalog::Mode;
use crate::catalog::OpCode;
use crate::identity::CallerId;
use crate::identity::PackageRegistry;
use crate::identity::ROOT_UID;
use crate::identity::SHELL_UID;
use crate::identity::SYSTEM_UID;
use crate::identity::UserId;
use crate::identity::resolve_package;
use crate::identity::user_id;
use crate::observers::NotificationBatch;
use crate::observers::ObserverRegistry;
use crate::observers::OpModeObserver;
use crate::restrictions::RestrictionRegistry;
use crate::scheduler::WriteScheduler;
use crate::settings::AppOpsSettings;
use crate::snapshot::SnapshotError;
use crate::snapshot::SnapshotFile;
use crate::store::Op;
use crate::store::StateStore;

/// Platform audio usage identifier (`AudioAttributes.USAGE_*`); opaque to
/// the engine.
pub type AudioUsage = i32;

/// Wall clock seam so tests can pin timestamps.
pub trait Clock: Send + Sync {
    /// Current wall time in ms since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Errors surfaced to engine callers. Identity mismatches are not here on
/// purpose: they are suppressed internally and observable only as `Ignored`
/// (check) or `Errored` (note/start).
#[derive(Debug, Error)]
pub enum AppOpsError {
    /// Caller may not touch state belonging to another uid.
    #[error("uid {caller_uid} may not access app op state of uid {uid}")]
    CrossUidDenied { caller_uid: u32, uid: u32 },
    /// Caller may not change policy or restrictions.
    #[error("uid {caller_uid} may not change app op policy")]
    PolicyDenied { caller_uid: u32 },
    /// `finish` for an op this client never started.
    #[error("operation {code} was not started by this client")]
    NotStarted { code: OpCode },
}

/// Snapshot of one accounting record, as exposed to embedders and the CLI.
#[derive(Clone, Debug)]
pub struct OpEntry {
    pub code: OpCode,
    pub mode: Mode,
    pub time: i64,
    pub reject_time: i64,
    /// For a running op, the time accumulated so far.
    pub duration: i64,
    pub running: bool,
    pub proxy_uid: Option<u32>,
    pub proxy_package: Option<String>,
}

/// All op entries recorded for one (uid, package).
#[derive(Clone, Debug)]
pub struct PackageOps {
    pub uid: u32,
    pub package: String,
    pub ops: Vec<OpEntry>,
}

/// External-storage access level derived from the storage ops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoragePolicy {
    None,
    Read,
    Write,
}

#[derive(Clone, Debug)]
struct AudioRestriction {
    mode: Mode,
    exempt: Vec<String>,
}

#[derive(Clone, Debug)]
struct StartedOp {
    uid: u32,
    package: String,
    code: OpCode,
}

#[derive(Debug, Default)]
struct ClientSession {
    #[expect(dead_code, reason = "recorded for diagnostics")]
    pid: u32,
    started: Vec<StartedOp>,
}

#[derive(Default)]
struct Inner {
    store: StateStore,
    restrictions: RestrictionRegistry,
    observers: ObserverRegistry,
    audio_restrictions: HashMap<(OpCode, AudioUsage), AudioRestriction>,
    sessions: HashMap<u64, ClientSession>,
    next_token: u64,
}

impl Inner {
    fn allocate_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

/// Handle identifying a client that runs long operations. Dropping the last
/// clone finishes everything the client left in progress.
#[derive(Clone)]
pub struct ClientToken {
    core: Arc<ClientTokenCore>,
}

struct ClientTokenCore {
    id: u64,
    service: Weak<AppOpsService>,
}

impl Drop for ClientTokenCore {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.session_died(self.id);
        }
    }
}

/// Handle owning a watch subscription. Dropping it unsubscribes.
pub struct WatcherHandle {
    _core: Arc<WatcherCore>,
}

struct WatcherCore {
    token: u64,
    service: Weak<AppOpsService>,
}

impl Drop for WatcherCore {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.watcher_died(self.token);
        }
    }
}

/// Handle owning a restriction layer. Dropping it lifts the restrictions
/// and notifies watchers of every code that was forbidden.
pub struct RestrictionToken {
    core: Arc<RestrictionTokenCore>,
}

struct RestrictionTokenCore {
    id: u64,
    service: Weak<AppOpsService>,
}

impl Drop for RestrictionTokenCore {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.restriction_owner_died(self.id);
        }
    }
}

/// The application-operation authorization and accounting engine.
pub struct AppOpsService {
    registry: Arc<dyn PackageRegistry>,
    clock: Arc<dyn Clock>,
    file: SnapshotFile,
    scheduler: WriteScheduler,
    inner: Mutex<Inner>,
}

impl AppOpsService {
    /// Builds an engine and loads the persisted snapshot if one exists.
    pub fn new(settings: &AppOpsSettings, registry: Arc<dyn PackageRegistry>) -> Arc<Self> {
        Self::with_clock(settings, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: &AppOpsSettings,
        registry: Arc<dyn PackageRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let scheduler = WriteScheduler::new(
                settings.write_delay(),
                settings.fast_write_delay(),
                move || {
                    if let Some(service) = weak.upgrade()
                        && let Err(err) = service.write_state()
                    {
                        warn!(%err, "failed to persist app ops state");
                    }
                },
            );
            Self {
                registry,
                clock,
                file: SnapshotFile::new(settings.state_file.clone()),
                scheduler,
                inner: Mutex::new(Inner::default()),
            }
        });
        if let Err(err) = service.read_state() {
            warn!(%err, "failed to load app ops state");
        }
        service
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn enforce_target(caller: CallerId, uid: u32) -> Result<(), AppOpsError> {
        if caller.may_act_on(uid) {
            Ok(())
        } else {
            Err(AppOpsError::CrossUidDenied {
                caller_uid: caller.uid,
                uid,
            })
        }
    }

    fn enforce_policy(caller: CallerId) -> Result<(), AppOpsError> {
        if caller.may_manage_policy() {
            Ok(())
        } else {
            Err(AppOpsError::PolicyDenied {
                caller_uid: caller.uid,
            })
        }
    }

    // ---- decision surface ----------------------------------------------

    /// Evaluates policy without recording anything.
    pub fn check_operation(
        &self,
        caller: CallerId,
        code: OpCode,
        uid: u32,
        package: Option<&str>,
    ) -> Result<Mode, AppOpsError> {
        Self::enforce_target(caller, uid)?;
        let Some(package) = resolve_package(uid, package) else {
            return Ok(Mode::Ignored);
        };
        let inner = self.lock();
        Ok(Self::check_locked(&inner, code, uid, &package))
    }

    fn check_locked(inner: &Inner, code: OpCode, uid: u32, package: &str) -> Mode {
        if Self::op_restricted(inner, uid, code, package) {
            return Mode::Ignored;
        }
        let switch = code.switch_code();
        match inner
            .store
            .uid_state(uid)
            .and_then(|uid_state| uid_state.op_modes.get(&switch).copied())
        {
            Some(uid_mode) if uid_mode != Mode::Allowed => return uid_mode,
            _ => {}
        }
        inner
            .store
            .op(uid, package, switch)
            .map_or_else(|| code.default_mode(), |op| op.mode)
    }

    /// Like [`check_operation`](Self::check_operation) but consults audio
    /// restrictions for the given usage first, and treats a suspended
    /// package as `Ignored`. When the suspend state cannot be determined
    /// the check swallows the failure and answers the conservative
    /// `Ignored` as well.
    pub fn check_audio_operation(
        &self,
        caller: CallerId,
        code: OpCode,
        usage: AudioUsage,
        uid: u32,
        package: Option<&str>,
    ) -> Result<Mode, AppOpsError> {
        Self::enforce_target(caller, uid)?;
        let Some(package) = resolve_package(uid, package) else {
            return Ok(Mode::Ignored);
        };
        match self.registry.is_suspended(&package, user_id(uid)) {
            Ok(true) => return Ok(Mode::Ignored),
            Ok(false) => {}
            Err(err) => {
                warn!(%err, package = %package, "cannot query suspend state, answering ignore");
                return Ok(Mode::Ignored);
            }
        }
        let inner = self.lock();
        if let Some(restriction) = inner.audio_restrictions.get(&(code, usage))
            && !restriction.exempt.iter().any(|p| p == &*package)
        {
            return Ok(restriction.mode);
        }
        Ok(Self::check_locked(&inner, code, uid, &package))
    }

    /// Records an access attempt and returns the decision. An allowed note
    /// stamps the access time; a rejected one stamps the reject time.
    pub fn note_operation(
        &self,
        caller: CallerId,
        code: OpCode,
        uid: u32,
        package: Option<&str>,
    ) -> Result<Mode, AppOpsError> {
        Self::enforce_target(caller, uid)?;
        Ok(self.note_resolved(code, uid, package, None, None))
    }

    /// Records an access performed by a proxy on behalf of another app. The
    /// proxy is noted under the caller's identity first; only if that
    /// passes is the proxied app noted, with the proxy stamped on the
    /// record.
    pub fn note_proxy_operation(
        &self,
        caller: CallerId,
        code: OpCode,
        proxy_package: &str,
        proxied_uid: u32,
        proxied_package: Option<&str>,
    ) -> Result<Mode, AppOpsError> {
        let proxy_mode = self.note_resolved(code, caller.uid, Some(proxy_package), None, None);
        if proxy_mode != Mode::Allowed || caller.uid == proxied_uid {
            return Ok(proxy_mode);
        }
        Ok(self.note_resolved(
            code,
            proxied_uid,
            proxied_package,
            Some(caller.uid),
            Some(proxy_package),
        ))
    }

    fn note_resolved(
        &self,
        code: OpCode,
        uid: u32,
        package: Option<&str>,
        proxy_uid: Option<u32>,
        proxy_package: Option<&str>,
    ) -> Mode {
        let Some(package) = resolve_package(uid, package) else {
            return Mode::Ignored;
        };
        if !self.ensure_ops(uid, &package) {
            return Mode::Errored;
        }
        let mode = {
            let mut inner = self.lock();
            let now = self.now();
            Self::note_locked(&mut inner, now, code, uid, &package, proxy_uid, proxy_package)
        };
        self.scheduler.schedule();
        mode
    }

    fn note_locked(
        inner: &mut Inner,
        now: i64,
        code: OpCode,
        uid: u32,
        package: &str,
        proxy_uid: Option<u32>,
        proxy_package: Option<&str>,
    ) -> Mode {
        let switch = code.switch_code();
        let uid_mode = inner
            .store
            .uid_state(uid)
            .and_then(|uid_state| uid_state.op_modes.get(&switch).copied());
        {
            let Some(ops) = inner.store.ops_mut(uid, package) else {
                return Mode::Errored;
            };
            ops.op_or_create(code);
        }
        // The veto comes before any accounting: a restricted note must not
        // touch the in-progress marker of a still-running op.
        if Self::op_restricted(inner, uid, code, package) {
            return Mode::Ignored;
        }
        let Some(ops) = inner.store.ops_mut(uid, package) else {
            return Mode::Errored;
        };
        {
            let op = ops.op_or_create(code);
            if op.is_running() {
                warn!(uid, package, code = %code, "noting an op that was started but never finished");
            }
            op.duration = 0;
        }
        if let Some(uid_mode) = uid_mode
            && uid_mode != Mode::Allowed
        {
            ops.op_or_create(code).reject_time = now;
            return uid_mode;
        }
        let switch_mode = ops.op_or_create(switch).mode;
        if switch_mode != Mode::Allowed {
            ops.op_or_create(code).reject_time = now;
            return switch_mode;
        }
        let op = ops.op_or_create(code);
        op.time = now;
        op.reject_time = 0;
        op.proxy_uid = proxy_uid;
        op.proxy_package = proxy_package.map(str::to_owned);
        Mode::Allowed
    }

    // ---- long-running operations ---------------------------------------

    /// Registers a client that will run `start`/`finish` pairs. The token
    /// must be kept alive for the duration of the client.
    pub fn client_token(self: &Arc<Self>, pid: u32) -> ClientToken {
        let id = {
            let mut inner = self.lock();
            let id = inner.allocate_token();
            inner.sessions.insert(
                id,
                ClientSession {
                    pid,
                    started: Vec::new(),
                },
            );
            id
        };
        ClientToken {
            core: Arc::new(ClientTokenCore {
                id,
                service: Arc::downgrade(self),
            }),
        }
    }

    /// Begins a long-running operation. On success the op is accounted as
    /// in-progress until the matching `finish` (or the token's death).
    pub fn start_operation(
        &self,
        token: &ClientToken,
        caller: CallerId,
        code: OpCode,
        uid: u32,
        package: Option<&str>,
    ) -> Result<Mode, AppOpsError> {
        Self::enforce_target(caller, uid)?;
        let Some(package) = resolve_package(uid, package) else {
            return Ok(Mode::Ignored);
        };
        if !self.ensure_ops(uid, &package) {
            return Ok(Mode::Errored);
        }
        let mode = {
            let mut inner = self.lock();
            let now = self.now();
            let switch = code.switch_code();
            let uid_mode = inner
                .store
                .uid_state(uid)
                .and_then(|uid_state| uid_state.op_modes.get(&switch).copied());
            match inner.store.ops_mut(uid, &package) {
                Some(ops) => {
                    ops.op_or_create(code);
                }
                None => return Ok(Mode::Errored),
            }
            if Self::op_restricted(&inner, uid, code, &package) {
                return Ok(Mode::Ignored);
            }
            let Some(ops) = inner.store.ops_mut(uid, &package) else {
                return Ok(Mode::Errored);
            };
            let denied = if let Some(uid_mode) = uid_mode
                && uid_mode != Mode::Allowed
            {
                Some(uid_mode)
            } else {
                let switch_mode = ops.op_or_create(switch).mode;
                (switch_mode != Mode::Allowed).then_some(switch_mode)
            };
            if let Some(denied) = denied {
                ops.op_or_create(code).reject_time = now;
                denied
            } else {
                let op = ops.op_or_create(code);
                if op.nesting == 0 {
                    op.time = now;
                    op.reject_time = 0;
                    op.duration = -1;
                }
                op.nesting += 1;
                match inner.sessions.get_mut(&token.core.id) {
                    Some(session) => session.started.push(StartedOp {
                        uid,
                        package: package.clone().into_owned(),
                        code,
                    }),
                    None => warn!(code = %code, "start on a dead client token"),
                }
                Mode::Allowed
            }
        };
        self.scheduler.schedule();
        Ok(mode)
    }

    /// Ends a long-running operation previously started with the same
    /// token.
    pub fn finish_operation(
        &self,
        token: &ClientToken,
        caller: CallerId,
        code: OpCode,
        uid: u32,
        package: Option<&str>,
    ) -> Result<(), AppOpsError> {
        Self::enforce_target(caller, uid)?;
        let Some(package) = resolve_package(uid, package) else {
            return Ok(());
        };
        {
            let mut inner = self.lock();
            let now = self.now();
            let session = inner
                .sessions
                .get_mut(&token.core.id)
                .ok_or(AppOpsError::NotStarted { code })?;
            let position = session
                .started
                .iter()
                .position(|started| {
                    started.uid == uid && started.package == *package && started.code == code
                })
                .ok_or(AppOpsError::NotStarted { code })?;
            session.started.swap_remove(position);
            match inner
                .store
                .ops_mut(uid, &package)
                .and_then(|ops| ops.op_mut(code))
            {
                Some(op) => Self::finish_op_locked(op, now),
                None => warn!(uid, package = %package, code = %code, "finishing an op with no record"),
            }
        }
        self.scheduler.schedule();
        Ok(())
    }

    fn finish_op_locked(op: &mut Op, now: i64) {
        if op.nesting > 1 {
            op.nesting -= 1;
            return;
        }
        if op.is_running() {
            op.duration = now - op.time;
            op.time = now;
        } else {
            // Finish under-run; harmless but worth a trace.
            warn!(
                uid = op.uid,
                package = %op.package,
                code = %op.code,
                "finishing an op that is not running"
            );
        }
        op.nesting = 0;
    }

    // ---- policy mutation ------------------------------------------------

    /// Sets the mode for (uid, package) under the op's switch code.
    /// `Default` resolves to the op's catalog default, which clears the
    /// explicit setting.
    pub fn set_mode(
        &self,
        caller: CallerId,
        code: OpCode,
        uid: u32,
        package: &str,
        mode: Mode,
    ) -> Result<(), AppOpsError> {
        Self::enforce_policy(caller)?;
        let switch = code.switch_code();
        let mode = if mode == Mode::Default {
            switch.default_mode()
        } else {
            mode
        };
        if !self.ensure_ops(uid, package) {
            // Identity mismatch is suppressed; nothing to change.
            return Ok(());
        }
        let mut batch = NotificationBatch::default();
        let changed = {
            let mut inner = self.lock();
            let Inner {
                store, observers, ..
            } = &mut *inner;
            let Some(ops) = store.ops_mut(uid, package) else {
                return Ok(());
            };
            let op = ops.op_or_create(switch);
            let changed = op.mode != mode;
            if changed {
                op.mode = mode;
                for token in observers.audience(switch, Some(package)) {
                    if let Some(observer) = observers.observer(token) {
                        batch.push(observer, switch, Some(uid), Some(package));
                    }
                }
            }
            if mode == switch.default_mode() {
                store.prune_op_if_default(uid, package, switch);
            }
            changed
        };
        if !changed {
            return Ok(());
        }
        self.scheduler.schedule_fast();
        batch.dispatch();
        Ok(())
    }

    /// Sets or clears the uid-level mode overlay under the op's switch
    /// code. Setting the default mode clears the entry.
    pub fn set_uid_mode(
        &self,
        caller: CallerId,
        code: OpCode,
        uid: u32,
        mode: Mode,
    ) -> Result<(), AppOpsError> {
        Self::enforce_policy(caller)?;
        let switch = code.switch_code();
        let mode = if mode == Mode::Default {
            switch.default_mode()
        } else {
            mode
        };
        let changed = {
            let mut inner = self.lock();
            if mode == switch.default_mode() {
                let mut removed = false;
                if let Some(uid_state) = inner.store.uid_state_mut(uid) {
                    removed = uid_state.op_modes.shift_remove(&switch).is_some();
                    if removed && uid_state.is_empty() {
                        inner.store.remove_uid(uid);
                    }
                }
                removed
            } else {
                let previous = inner
                    .store
                    .uid_state_or_create(uid)
                    .op_modes
                    .insert(switch, mode);
                previous != Some(mode)
            }
        };
        if !changed {
            return Ok(());
        }
        self.scheduler.schedule_fast();
        // Watchers get one notification per package owned by the uid.
        let packages = self.registry.packages_for_uid(uid);
        let mut batch = NotificationBatch::default();
        {
            let inner = self.lock();
            for package in &packages {
                for token in inner.observers.audience(switch, Some(package)) {
                    if let Some(observer) = inner.observers.observer(token) {
                        batch.push(observer, switch, Some(uid), Some(package));
                    }
                }
            }
        }
        batch.dispatch();
        Ok(())
    }

    /// Returns every resettable op in scope to its default mode. Scope is
    /// all users, one user, or one (user, package). Returns whether
    /// anything changed.
    pub fn reset_all_modes(
        &self,
        caller: CallerId,
        user: Option<UserId>,
        package_filter: Option<&str>,
    ) -> Result<bool, AppOpsError> {
        Self::enforce_policy(caller)?;
        let mut batch = NotificationBatch::default();
        let mut changed = false;
        {
            let mut inner = self.lock();
            let Inner {
                store, observers, ..
            } = &mut *inner;
            let uids = store
                .uids()
                .filter(|&uid| user.is_none_or(|user| user_id(uid) == user))
                .collect_vec();
            for uid in uids {
                let packages = store
                    .uid_state(uid)
                    .map(|uid_state| uid_state.pkg_ops.keys().cloned().collect_vec())
                    .unwrap_or_default();
                for package in packages {
                    if package_filter.is_some_and(|filter| filter != package) {
                        continue;
                    }
                    let codes = store
                        .ops(uid, &package)
                        .map(|ops| ops.ops.keys().copied().collect_vec())
                        .unwrap_or_default();
                    for code in codes {
                        if !code.is_resettable() {
                            continue;
                        }
                        let Some(op) =
                            store.ops_mut(uid, &package).and_then(|ops| ops.op_mut(code))
                        else {
                            continue;
                        };
                        if op.mode == code.default_mode() {
                            continue;
                        }
                        op.mode = code.default_mode();
                        changed = true;
                        for token in observers.audience(code.switch_code(), Some(&package)) {
                            if let Some(observer) = observers.observer(token) {
                                batch.push(
                                    observer,
                                    code.switch_code(),
                                    Some(uid),
                                    Some(&package),
                                );
                            }
                        }
                        store.prune_op_if_default(uid, &package, code);
                    }
                }
                store.remove_empty_containers(uid);
            }
        }
        if changed {
            self.scheduler.schedule_fast();
        }
        batch.dispatch();
        Ok(changed)
    }

    // ---- restrictions ---------------------------------------------------

    /// Replaces the audio restriction for `(code, usage)`. `Allowed`
    /// removes the entry. Watchers are notified with no uid/package,
    /// meaning "all".
    pub fn set_audio_restriction(
        &self,
        caller: CallerId,
        code: OpCode,
        usage: AudioUsage,
        _uid: u32,
        mode: Mode,
        exempt_packages: &[String],
    ) -> Result<(), AppOpsError> {
        Self::enforce_policy(caller)?;
        let switch = code.switch_code();
        let mut batch = NotificationBatch::default();
        {
            let mut inner = self.lock();
            if mode == Mode::Allowed {
                inner.audio_restrictions.remove(&(code, usage));
            } else {
                inner.audio_restrictions.insert(
                    (code, usage),
                    AudioRestriction {
                        mode,
                        exempt: exempt_packages.to_vec(),
                    },
                );
            }
            for token in inner.observers.audience(switch, None) {
                if let Some(observer) = inner.observers.observer(token) {
                    batch.push(observer, switch, None, None);
                }
            }
        }
        batch.dispatch();
        Ok(())
    }

    /// Obtains a token owning a restriction layer.
    pub fn restriction_token(self: &Arc<Self>) -> RestrictionToken {
        let id = self.lock().allocate_token();
        RestrictionToken {
            core: Arc::new(RestrictionTokenCore {
                id,
                service: Arc::downgrade(self),
            }),
        }
    }

    /// Marks one op code forbidden (or allowed again) for a user within the
    /// token's restriction layer.
    pub fn set_user_restriction(
        &self,
        caller: CallerId,
        code: OpCode,
        restricted: bool,
        token: &RestrictionToken,
        user: UserId,
        exempt_packages: &[String],
    ) -> Result<(), AppOpsError> {
        Self::enforce_policy(caller)?;
        let changed = {
            let mut inner = self.lock();
            inner
                .restrictions
                .set_restriction(token.core.id, code, restricted, user, exempt_packages)
        };
        if changed {
            self.notify_code_changes(&[code]);
        }
        Ok(())
    }

    /// Applies a bundle of named user restrictions (`no_sms`, ...): every op
    /// mapped to a named restriction is forbidden iff the bundle holds true
    /// for that name. Names absent from the bundle clear the restriction.
    pub fn set_user_restrictions(
        &self,
        caller: CallerId,
        restrictions: &HashMap<String, bool>,
        token: &RestrictionToken,
        user: UserId,
    ) -> Result<(), AppOpsError> {
        for code in OpCode::all() {
            let Some(name) = code.user_restriction() else {
                continue;
            };
            let restricted = restrictions.get(name).copied().unwrap_or(false);
            self.set_user_restriction(caller, code, restricted, token, user, &[])?;
        }
        Ok(())
    }

    fn notify_code_changes(&self, codes: &[OpCode]) {
        let mut batch = NotificationBatch::default();
        {
            let inner = self.lock();
            for &code in codes {
                let switch = code.switch_code();
                for token in inner.observers.audience(switch, None) {
                    if let Some(observer) = inner.observers.observer(token) {
                        batch.push(observer, switch, None, None);
                    }
                }
            }
        }
        batch.dispatch();
    }

    // ---- observers ------------------------------------------------------

    /// Subscribes to mode changes for an op (normalized to its switch
    /// code), a package, or both. The subscription lives as long as the
    /// returned handle and the observer `Arc`.
    pub fn start_watching_mode(
        self: &Arc<Self>,
        code: Option<OpCode>,
        package: Option<&str>,
        observer: &Arc<dyn OpModeObserver>,
    ) -> WatcherHandle {
        let switch = code.map(OpCode::switch_code);
        let token = {
            let mut inner = self.lock();
            let token = inner.allocate_token();
            inner
                .observers
                .register(token, Arc::downgrade(observer), switch, package);
            token
        };
        WatcherHandle {
            _core: Arc::new(WatcherCore {
                token,
                service: Arc::downgrade(self),
            }),
        }
    }

    // ---- queries --------------------------------------------------------

    /// Cheap probe of uid/package consistency: `Allowed` iff the pair is
    /// valid, `Errored` otherwise. Creates no state.
    pub fn check_package(
        &self,
        caller: CallerId,
        uid: u32,
        package: &str,
    ) -> Result<Mode, AppOpsError> {
        Self::enforce_target(caller, uid)?;
        let known = self.lock().store.ops(uid, package).is_some();
        if known || self.validate_pair(uid, package) {
            Ok(Mode::Allowed)
        } else {
            Ok(Mode::Errored)
        }
    }

    /// The op accounting for a platform permission, if any.
    pub fn permission_to_op(permission: &str) -> Option<OpCode> {
        OpCode::for_permission(permission)
    }

    /// Recorded entries for one (uid, package), optionally filtered to the
    /// given codes. `None` when nothing matches.
    pub fn ops_for_package(
        &self,
        caller: CallerId,
        uid: u32,
        package: &str,
        filter: Option<&[OpCode]>,
    ) -> Result<Option<PackageOps>, AppOpsError> {
        Self::enforce_target(caller, uid)?;
        let now = self.now();
        let inner = self.lock();
        Ok(inner
            .store
            .ops(uid, package)
            .and_then(|ops| Self::collect_package_ops(ops, filter, now)))
    }

    /// Recorded entries for every (uid, package), optionally filtered,
    /// ordered by uid then package.
    pub fn packages_for_ops(
        &self,
        caller: CallerId,
        filter: Option<&[OpCode]>,
    ) -> Result<Vec<PackageOps>, AppOpsError> {
        Self::enforce_policy(caller)?;
        let now = self.now();
        let inner = self.lock();
        let mut result = Vec::new();
        for (_, uid_state) in inner.store.iter().sorted_by_key(|&(uid, _)| uid) {
            for ops in uid_state
                .pkg_ops
                .values()
                .sorted_by_key(|ops| ops.package.clone())
            {
                if let Some(package_ops) = Self::collect_package_ops(ops, filter, now) {
                    result.push(package_ops);
                }
            }
        }
        Ok(result)
    }

    fn collect_package_ops(
        ops: &crate::store::Ops,
        filter: Option<&[OpCode]>,
        now: i64,
    ) -> Option<PackageOps> {
        let entries = ops
            .ops
            .values()
            .filter(|op| filter.is_none_or(|codes| codes.contains(&op.code)))
            .sorted_by_key(|op| op.code)
            .map(|op| OpEntry {
                code: op.code,
                mode: op.mode,
                time: op.time,
                reject_time: op.reject_time,
                duration: if op.is_running() {
                    now - op.time
                } else {
                    op.duration
                },
                running: op.is_running(),
                proxy_uid: op.proxy_uid,
                proxy_package: op.proxy_package.clone(),
            })
            .collect_vec();
        (!entries.is_empty()).then(|| PackageOps {
            uid: ops.uid,
            package: ops.package.clone(),
            ops: entries,
        })
    }

    /// Raw accounting record, for diagnostics and tests.
    pub fn op_record(&self, uid: u32, package: &str, code: OpCode) -> Option<Op> {
        self.lock().store.op(uid, package, code).cloned()
    }

    /// External-storage access level for (uid, package), derived by noting
    /// the read/write external-storage ops on the system's behalf.
    pub fn external_storage_policy(
        &self,
        uid: u32,
        package: &str,
    ) -> Result<StoragePolicy, AppOpsError> {
        let system = CallerId::new(SYSTEM_UID, 0);
        let read =
            self.note_operation(system, OpCode::READ_EXTERNAL_STORAGE, uid, Some(package))?;
        if read != Mode::Allowed {
            return Ok(StoragePolicy::None);
        }
        let write =
            self.note_operation(system, OpCode::WRITE_EXTERNAL_STORAGE, uid, Some(package))?;
        Ok(if write == Mode::Allowed {
            StoragePolicy::Write
        } else {
            StoragePolicy::Read
        })
    }

    // ---- lifecycle ------------------------------------------------------

    /// Startup consistency sweep: drops state for (uid, package) pairs the
    /// package registry no longer confirms.
    pub fn system_ready(&self) {
        let pairs = {
            let inner = self.lock();
            inner
                .store
                .iter()
                .flat_map(|(uid, uid_state)| {
                    uid_state
                        .pkg_ops
                        .keys()
                        .map(move |package| (uid, package.clone()))
                })
                .collect_vec()
        };
        let stale = pairs
            .into_iter()
            .filter(|(uid, package)| !self.validate_pair(*uid, package))
            .collect_vec();
        if stale.is_empty() {
            return;
        }
        let mut changed = false;
        {
            let mut inner = self.lock();
            for (uid, package) in &stale {
                info!(uid, package = %package, "dropping app op state for removed package");
                changed |= inner.store.remove_package(*uid, package);
            }
        }
        if changed {
            self.scheduler.schedule_fast();
        }
    }

    /// Drops state recorded for a removed package.
    pub fn package_removed(&self, uid: u32, package: &str) {
        let removed = {
            let mut inner = self.lock();
            inner.store.remove_package(uid, package)
        };
        if removed {
            self.scheduler.schedule_fast();
        }
    }

    /// Drops all state recorded for a removed uid.
    pub fn uid_removed(&self, uid: u32) {
        let removed = {
            let mut inner = self.lock();
            inner.store.remove_uid(uid)
        };
        if removed {
            self.scheduler.schedule_fast();
        }
    }

    /// Flushes pending state synchronously. Call before process exit.
    pub fn shutdown(&self) {
        if self.scheduler.cancel() {
            info!("writing app ops state before shutdown");
            if let Err(err) = self.write_state() {
                warn!(%err, "failed to write app ops state during shutdown");
            }
        }
    }

    /// Serializes the current state to the snapshot file on the calling
    /// thread.
    pub fn write_state(&self) -> Result<(), SnapshotError> {
        let now = self.now();
        let store = self.lock().store.clone();
        self.file.write(&store, now)
    }

    /// Replaces in-memory state with the on-disk snapshot. A missing file
    /// leaves the current state alone; a malformed one empties the store.
    pub fn read_state(&self) -> Result<(), SnapshotError> {
        match self.file.read() {
            Ok(Some(store)) => {
                self.lock().store = store;
                Ok(())
            }
            Ok(None) => {
                debug!("no app ops snapshot; starting empty");
                Ok(())
            }
            Err(SnapshotError::Malformed(reason)) => {
                warn!(reason, "snapshot unreadable, reverting to empty state");
                self.lock().store = StateStore::default();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ---- internals ------------------------------------------------------

    /// Whether a user-restriction layer forbids the op for this package,
    /// accounting for the privileged-system bypass.
    fn op_restricted(inner: &Inner, uid: u32, code: OpCode, package: &str) -> bool {
        if !inner
            .restrictions
            .has_restriction(code, package, user_id(uid))
        {
            return false;
        }
        if code.allows_system_bypass()
            && inner
                .store
                .ops(uid, package)
                .is_some_and(|ops| ops.privileged)
        {
            return false;
        }
        true
    }

    /// Confirms uid/package consistency and creates the op container if it
    /// does not exist yet. Registry lookups run with the lock released; the
    /// store is re-checked after re-acquiring it. Returns false when the
    /// pair is invalid, in which case no state is created.
    fn ensure_ops(&self, uid: u32, package: &str) -> bool {
        if self.lock().store.ops(uid, package).is_some() {
            return true;
        }
        if !self.validate_pair(uid, package) {
            warn!(uid, package, "package does not belong to uid, refusing to create state");
            return false;
        }
        let privileged = self.is_privileged_pair(uid, package);
        let mut inner = self.lock();
        if inner.store.ops(uid, package).is_none() {
            inner.store.create_ops(uid, package, privileged);
            drop(inner);
            self.scheduler.schedule();
        }
        true
    }

    fn validate_pair(&self, uid: u32, package: &str) -> bool {
        match (uid, package) {
            (ROOT_UID, "root") => true,
            (SHELL_UID, "com.android.shell") => true,
            (SYSTEM_UID, "android") => true,
            _ => self.registry.uid_for_package(package, user_id(uid)) == Some(uid),
        }
    }

    fn is_privileged_pair(&self, uid: u32, package: &str) -> bool {
        match (uid, package) {
            (ROOT_UID, "root") | (SHELL_UID, "com.android.shell") => false,
            (SYSTEM_UID, "android") => true,
            _ => self.registry.is_privileged(package, user_id(uid)),
        }
    }

    /// Reclamation for a dead client: every op the session left in progress
    /// is finished exactly once per outstanding start.
    fn session_died(&self, id: u64) {
        let mut reclaimed = false;
        {
            let mut inner = self.lock();
            let now = self.now();
            let Some(session) = inner.sessions.remove(&id) else {
                return;
            };
            for started in session.started {
                reclaimed = true;
                match inner
                    .store
                    .ops_mut(started.uid, &started.package)
                    .and_then(|ops| ops.op_mut(started.code))
                {
                    Some(op) => Self::finish_op_locked(op, now),
                    None => warn!(
                        uid = started.uid,
                        package = %started.package,
                        code = %started.code,
                        "dead client held an op with no record"
                    ),
                }
            }
        }
        if reclaimed {
            debug!("finished in-progress ops of dead client");
            self.scheduler.schedule();
        }
    }

    fn watcher_died(&self, token: u64) {
        self.lock().observers.unregister(token);
    }

    /// Reclamation for a dead restriction owner: its layer is removed and
    /// watchers hear about every code it was forbidding.
    fn restriction_owner_died(&self, id: u64) {
        let codes = {
            let mut inner = self.lock();
            inner.restrictions.remove_owner(id)
        };
        if !codes.is_empty() {
            self.notify_code_changes(&codes);
        }
    }
}
