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

//! Resolution of (uid, package) identities against the platform.
//!
//! The engine never talks to the package manager directly; it consumes the
//! [`PackageRegistry`] trait. Registry calls may block on the platform and
//! must therefore happen outside the engine lock. Caller identity is an
//! explicit [`CallerId`] parameter rather than thread-ambient state, so
//! registry calls never carry the remote caller's identity.

use std::borrow::Cow;

use thiserror::Error;

/// Uid of the root user.
pub const ROOT_UID: u32 = 0;
/// Uid the system server runs as.
pub const SYSTEM_UID: u32 = 1000;
/// Uid of the interactive shell.
pub const SHELL_UID: u32 = 2000;

/// Each user owns a contiguous block of this many uids.
const PER_USER_RANGE: u32 = 100_000;

/// Identifier of a device user (profile).
pub type UserId = u32;

/// The user a uid belongs to.
pub fn user_id(uid: u32) -> UserId {
    uid / PER_USER_RANGE
}

/// The platform package-lookup dependency could not be reached.
#[derive(Debug, Error)]
#[error("package registry unavailable: {reason}")]
pub struct RegistryUnavailable {
    pub reason: String,
}

/// Platform package/permission lookups consumed by the engine.
///
/// Implementations may block briefly; the engine guarantees it only calls
/// them with its lock released.
pub trait PackageRegistry: Send + Sync {
    /// Packages installed under `uid`, possibly empty.
    fn packages_for_uid(&self, uid: u32) -> Vec<String>;

    /// Uid owning `package` for `user_id`, if the package is installed.
    fn uid_for_package(&self, package: &str, user_id: UserId) -> Option<u32>;

    /// Whether `package` is a privileged system package.
    fn is_privileged(&self, package: &str, user_id: UserId) -> bool;

    /// Whether `package` is currently suspended.
    fn is_suspended(&self, package: &str, user: UserId) -> Result<bool, RegistryUnavailable>;
}

/// Maps a (uid, claimed package) pair to the canonical package name.
///
/// Well-known uids resolve to fixed names regardless of the claim; for
/// everything else the claimed name passes through unchanged (consistency
/// with the uid is validated later, when state is first created). `None`
/// means the caller supplied no usable name.
pub fn resolve_package(uid: u32, package: Option<&str>) -> Option<Cow<'_, str>> {
    match uid {
        ROOT_UID => Some(Cow::Borrowed("root")),
        SHELL_UID => Some(Cow::Borrowed("com.android.shell")),
        SYSTEM_UID if package.is_none() => Some(Cow::Borrowed("android")),
        _ => package.map(Cow::Borrowed),
    }
}

/// Identity of the process invoking an engine operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallerId {
    pub uid: u32,
    pub pid: u32,
}

impl CallerId {
    pub fn new(uid: u32, pid: u32) -> Self {
        Self { uid, pid }
    }

    /// The identity the CLI and other trusted embedders act under.
    pub fn root() -> Self {
        Self {
            uid: ROOT_UID,
            pid: 0,
        }
    }

    /// Whether this caller may read or mutate state belonging to `uid`.
    ///
    /// Root and the system act on anyone; everyone else only on their own
    /// uid.
    pub fn may_act_on(self, uid: u32) -> bool {
        self.uid == ROOT_UID || self.uid == SYSTEM_UID || self.uid == uid
    }

    /// Whether this caller may change policy (modes, restrictions) or
    /// register observers.
    pub fn may_manage_policy(self) -> bool {
        self.uid == ROOT_UID || self.uid == SYSTEM_UID
    }
}
