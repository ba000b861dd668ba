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

//! Dynamically layered user-level restrictions.
//!
//! Each client that imposes restrictions owns one layer, keyed by its opaque
//! token. A layer holds, per user, a bit per op code plus a list of packages
//! exempt from that user's restrictions. Evaluation is an OR across layers:
//! an op is restricted for (package, user) if any layer forbids the code for
//! the user and does not exempt the package.

use std::collections::HashMap;

use itertools::Itertools as _;

use crate::catalog::NUM_OPS;
use crate::catalog::OpCode;
use crate::identity::UserId;

/// One client's stacked restriction state.
#[derive(Clone, Debug, Default)]
pub struct RestrictionLayer {
    /// Per user, a forbidden bit per op code.
    forbidden: HashMap<UserId, Box<[bool]>>,
    /// Per user, packages the restrictions do not apply to. Shared across
    /// codes within the layer.
    exempt: HashMap<UserId, Vec<String>>,
}

impl RestrictionLayer {
    fn is_empty(&self) -> bool {
        self.forbidden.is_empty() && self.exempt.is_empty()
    }

    /// Applies one (code, user) update. Returns whether anything changed.
    fn set(
        &mut self,
        code: OpCode,
        restricted: bool,
        user: UserId,
        exempt_packages: &[String],
    ) -> bool {
        let mut changed = false;
        let mut user_present = self.forbidden.contains_key(&user);
        if !user_present && restricted {
            self.forbidden.insert(user, vec![false; NUM_OPS].into());
            user_present = true;
        }
        if user_present {
            let bits = self.forbidden.get_mut(&user).unwrap();
            if bits[code.index()] != restricted {
                bits[code.index()] = restricted;
                changed = true;
                if !restricted && bits.iter().all(|&bit| !bit) {
                    self.forbidden.remove(&user);
                    user_present = false;
                }
            }
            // The exemption list only tracks users that still restrict
            // something; it is replaced wholesale on every update.
            if user_present && self.exempt.get(&user).map(Vec::as_slice) != Some(exempt_packages) {
                if exempt_packages.is_empty() {
                    changed |= self.exempt.remove(&user).is_some();
                } else {
                    self.exempt.insert(user, exempt_packages.to_vec());
                    changed = true;
                }
            }
            if !user_present {
                changed |= self.exempt.remove(&user).is_some();
            }
        }
        changed
    }

    fn restricts(&self, code: OpCode, package: &str, user: UserId) -> bool {
        let Some(bits) = self.forbidden.get(&user) else {
            return false;
        };
        if !bits[code.index()] {
            return false;
        }
        !self
            .exempt
            .get(&user)
            .is_some_and(|packages| packages.iter().any(|p| p == package))
    }

    /// Codes forbidden for at least one user.
    fn forbidden_codes(&self) -> Vec<OpCode> {
        OpCode::all()
            .filter(|code| self.forbidden.values().any(|bits| bits[code.index()]))
            .collect()
    }
}

/// All restriction layers, keyed by owner token.
#[derive(Clone, Debug, Default)]
pub struct RestrictionRegistry {
    layers: HashMap<u64, RestrictionLayer>,
}

impl RestrictionRegistry {
    /// Updates the owner's layer, creating it on first use and discarding it
    /// when the update leaves it empty. Returns whether anything changed.
    pub fn set_restriction(
        &mut self,
        owner: u64,
        code: OpCode,
        restricted: bool,
        user: UserId,
        exempt_packages: &[String],
    ) -> bool {
        let layer = self.layers.entry(owner).or_default();
        let changed = layer.set(code, restricted, user, exempt_packages);
        if layer.is_empty() {
            self.layers.remove(&owner);
        }
        changed
    }

    /// Whether any layer forbids `code` for (`package`, `user`).
    pub fn has_restriction(&self, code: OpCode, package: &str, user: UserId) -> bool {
        self.layers
            .values()
            .any(|layer| layer.restricts(code, package, user))
    }

    /// Removes a dead owner's layer. Returns the codes it was forbidding so
    /// the caller can notify watchers that the restrictions were lifted.
    pub fn remove_owner(&mut self, owner: u64) -> Vec<OpCode> {
        self.layers
            .remove(&owner)
            .map(|layer| layer.forbidden_codes())
            .unwrap_or_default()
    }

    /// Owners currently holding a layer, in stable order. Test hook.
    pub fn owners(&self) -> Vec<u64> {
        self.layers.keys().copied().sorted().collect()
    }
}
