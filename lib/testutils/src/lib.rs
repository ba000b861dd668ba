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

//! Test fixtures for the appops-lib crate: a temp-dir-backed engine, a
//! settable clock, an in-memory package registry, and a recording observer.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

use appops_lib::catalog::OpCode;
use appops_lib::engine::AppOpsService;
use appops_lib::engine::Clock;
use appops_lib::identity::PackageRegistry;
use appops_lib::identity::RegistryUnavailable;
use appops_lib::identity::UserId;
use appops_lib::identity::user_id;
use appops_lib::observers::OpModeObserver;
use appops_lib::settings::AppOpsSettings;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("appops-test-")
        .tempdir()
        .unwrap()
}

/// Deterministic clock for pinning access timestamps in tests.
pub struct FakeClock {
    now_ms: AtomicI64,
}

impl FakeClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

struct FakePackage {
    name: String,
    uid: u32,
    privileged: bool,
    suspended: bool,
}

/// In-memory stand-in for the platform package service.
#[derive(Default)]
pub struct FakePackageRegistry {
    state: Mutex<FakeRegistryState>,
}

#[derive(Default)]
struct FakeRegistryState {
    packages: Vec<FakePackage>,
    unavailable: bool,
}

impl FakePackageRegistry {
    pub fn add_package(&self, uid: u32, name: &str) {
        self.add(uid, name, false);
    }

    pub fn add_privileged_package(&self, uid: u32, name: &str) {
        self.add(uid, name, true);
    }

    fn add(&self, uid: u32, name: &str, privileged: bool) {
        self.state.lock().unwrap().packages.push(FakePackage {
            name: name.to_owned(),
            uid,
            privileged,
            suspended: false,
        });
    }

    pub fn remove_package(&self, uid: u32, name: &str) {
        self.state
            .lock()
            .unwrap()
            .packages
            .retain(|package| !(package.uid == uid && package.name == name));
    }

    pub fn set_suspended(&self, uid: u32, name: &str, suspended: bool) {
        let mut state = self.state.lock().unwrap();
        for package in &mut state.packages {
            if package.uid == uid && package.name == name {
                package.suspended = suspended;
            }
        }
    }

    /// Simulates the platform being unreachable for suspend queries.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }
}

impl PackageRegistry for FakePackageRegistry {
    fn packages_for_uid(&self, uid: u32) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .packages
            .iter()
            .filter(|package| package.uid == uid)
            .map(|package| package.name.clone())
            .collect()
    }

    fn uid_for_package(&self, package: &str, user: UserId) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .packages
            .iter()
            .find(|candidate| candidate.name == package && user_id(candidate.uid) == user)
            .map(|candidate| candidate.uid)
    }

    fn is_privileged(&self, package: &str, user: UserId) -> bool {
        self.state
            .lock()
            .unwrap()
            .packages
            .iter()
            .any(|candidate| {
                candidate.name == package
                    && user_id(candidate.uid) == user
                    && candidate.privileged
            })
    }

    fn is_suspended(&self, package: &str, user: UserId) -> Result<bool, RegistryUnavailable> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(RegistryUnavailable {
                reason: "package service not running".to_owned(),
            });
        }
        Ok(state.packages.iter().any(|candidate| {
            candidate.name == package && user_id(candidate.uid) == user && candidate.suspended
        }))
    }
}

/// Observer that records every notification it receives.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedChange>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObservedChange {
    pub code: OpCode,
    pub uid: Option<u32>,
    pub package: Option<String>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObservedChange> {
        self.events.lock().unwrap().clone()
    }

    /// Returns the recorded events and clears the log.
    pub fn take_events(&self) -> Vec<ObservedChange> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl OpModeObserver for RecordingObserver {
    fn on_op_mode_changed(&self, code: OpCode, uid: Option<u32>, package: Option<&str>) {
        self.events.lock().unwrap().push(ObservedChange {
            code,
            uid,
            package: package.map(str::to_owned),
        });
    }
}

/// An engine wired to a temp directory, a fake registry, and a fake clock.
pub struct TestEngine {
    _temp_dir: TempDir,
    pub settings: AppOpsSettings,
    pub registry: Arc<FakePackageRegistry>,
    pub clock: Arc<FakeClock>,
    pub engine: Arc<AppOpsService>,
}

impl TestEngine {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let settings = AppOpsSettings {
            state_file: temp_dir.path().join("appops.xml"),
            ..Default::default()
        };
        let registry = Arc::new(FakePackageRegistry::default());
        let clock = Arc::new(FakeClock::new(1_000_000));
        let engine = AppOpsService::with_clock(
            &settings,
            registry.clone() as Arc<dyn PackageRegistry>,
            clock.clone() as Arc<dyn Clock>,
        );
        Self {
            _temp_dir: temp_dir,
            settings,
            registry,
            clock,
            engine,
        }
    }

    /// Builds a second engine over the same snapshot file, as if the process
    /// had restarted.
    pub fn reload(&self) -> Arc<AppOpsService> {
        AppOpsService::with_clock(
            &self.settings,
            self.registry.clone() as Arc<dyn PackageRegistry>,
            self.clock.clone() as Arc<dyn Clock>,
        )
    }
}
