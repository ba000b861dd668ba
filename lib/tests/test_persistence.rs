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

use std::fs;

use appops_lib::catalog::Mode;
use appops_lib::catalog::OpCode;
use appops_lib::identity::CallerId;
use testutils::TestEngine;

const UID: u32 = 10042;
const PKG: &str = "a.b";

fn engine_with_package() -> TestEngine {
    let test_engine = TestEngine::init();
    test_engine.registry.add_package(UID, PKG);
    test_engine
}

#[test]
fn test_state_survives_restart() {
    let t = engine_with_package();
    let root = CallerId::root();

    t.engine
        .set_mode(root, OpCode::COARSE_LOCATION, UID, PKG, Mode::Ignored)
        .unwrap();
    t.engine
        .set_uid_mode(root, OpCode::VIBRATE, UID, Mode::Errored)
        .unwrap();
    t.clock.set(5_000);
    t.engine
        .note_operation(root, OpCode::CAMERA, UID, Some(PKG))
        .unwrap();
    t.engine.write_state().unwrap();

    let reloaded = t.reload();
    assert_eq!(
        reloaded
            .check_operation(root, OpCode::COARSE_LOCATION, UID, Some(PKG))
            .unwrap(),
        Mode::Ignored
    );
    assert_eq!(
        reloaded
            .check_operation(root, OpCode::VIBRATE, UID, Some(PKG))
            .unwrap(),
        Mode::Errored
    );
    let camera = reloaded.op_record(UID, PKG, OpCode::CAMERA).unwrap();
    assert_eq!(camera.time, 5_000);
}

#[test]
fn test_proxy_attribution_survives_restart() {
    let t = TestEngine::init();
    t.registry.add_package(10001, "proxy.pkg");
    t.registry.add_package(10002, "proxied.pkg");
    let proxy = CallerId::new(10001, 50);

    t.engine
        .note_proxy_operation(
            proxy,
            OpCode::READ_CONTACTS,
            "proxy.pkg",
            10002,
            Some("proxied.pkg"),
        )
        .unwrap();
    t.engine.write_state().unwrap();

    let reloaded = t.reload();
    let record = reloaded
        .op_record(10002, "proxied.pkg", OpCode::READ_CONTACTS)
        .unwrap();
    assert_eq!(record.proxy_uid, Some(10001));
    assert_eq!(record.proxy_package.as_deref(), Some("proxy.pkg"));
}

#[test]
fn test_missing_file_is_first_boot() {
    let t = TestEngine::init();
    assert!(!t.settings.state_file.exists());
    // Nothing recorded, nothing to trip over.
    assert_eq!(
        t.engine
            .check_operation(CallerId::root(), OpCode::CAMERA, UID, Some(PKG))
            .unwrap(),
        Mode::Allowed
    );
}

#[test]
fn test_corrupt_file_reverts_to_empty() {
    let t = engine_with_package();
    let root = CallerId::root();
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, PKG, Mode::Ignored)
        .unwrap();
    t.engine.write_state().unwrap();

    fs::write(&t.settings.state_file, b"<app-ops><uid n=\"broken\"").unwrap();
    let reloaded = t.reload();
    assert!(reloaded.op_record(UID, PKG, OpCode::CAMERA).is_none());
    assert_eq!(
        reloaded
            .check_operation(root, OpCode::CAMERA, UID, Some(PKG))
            .unwrap(),
        Mode::Allowed
    );
}

#[test]
fn test_read_state_replaces_memory() {
    let t = engine_with_package();
    let root = CallerId::root();
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, PKG, Mode::Ignored)
        .unwrap();
    t.engine.write_state().unwrap();

    // Mutate in memory, then roll back to the on-disk snapshot.
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, PKG, Mode::Errored)
        .unwrap();
    t.engine.read_state().unwrap();
    assert_eq!(
        t.engine
            .check_operation(root, OpCode::CAMERA, UID, Some(PKG))
            .unwrap(),
        Mode::Ignored
    );
}

#[test]
fn test_shutdown_flushes_pending_writes() {
    let t = engine_with_package();
    let root = CallerId::root();
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, PKG, Mode::Ignored)
        .unwrap();
    // The fast window has not elapsed, so nothing is on disk yet.
    assert!(!t.settings.state_file.exists());
    t.engine.shutdown();
    assert!(t.settings.state_file.exists());

    let reloaded = t.reload();
    assert_eq!(
        reloaded
            .check_operation(root, OpCode::CAMERA, UID, Some(PKG))
            .unwrap(),
        Mode::Ignored
    );
}

#[test]
fn test_shutdown_without_pending_writes_nothing() {
    let t = TestEngine::init();
    t.engine.shutdown();
    assert!(!t.settings.state_file.exists());
}

#[test]
fn test_prunable_records_are_not_persisted() {
    let t = engine_with_package();
    let root = CallerId::root();
    // A note creates a default-mode record on the switch op as a side
    // effect; only records with forensic value must survive the trip.
    t.clock.set(5_000);
    t.engine
        .note_operation(root, OpCode::GPS, UID, Some(PKG))
        .unwrap();
    t.engine.write_state().unwrap();

    let reloaded = t.reload();
    let gps = reloaded.op_record(UID, PKG, OpCode::GPS).unwrap();
    assert_eq!(gps.time, 5_000);
    assert_eq!(
        reloaded
            .check_operation(root, OpCode::GPS, UID, Some(PKG))
            .unwrap(),
        Mode::Allowed
    );
}

#[test]
fn test_package_and_uid_removal() {
    let t = engine_with_package();
    let root = CallerId::root();
    t.registry.add_package(UID, "c.d");
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, PKG, Mode::Ignored)
        .unwrap();
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, "c.d", Mode::Ignored)
        .unwrap();

    t.engine.package_removed(UID, PKG);
    assert!(t.engine.op_record(UID, PKG, OpCode::CAMERA).is_none());
    assert!(t.engine.op_record(UID, "c.d", OpCode::CAMERA).is_some());

    t.engine.uid_removed(UID);
    assert!(t.engine.op_record(UID, "c.d", OpCode::CAMERA).is_none());
}

#[test]
fn test_system_ready_evicts_stale_packages() {
    let t = engine_with_package();
    let root = CallerId::root();
    t.registry.add_package(10043, "gone.pkg");
    t.engine
        .set_mode(root, OpCode::CAMERA, UID, PKG, Mode::Ignored)
        .unwrap();
    t.engine
        .set_mode(root, OpCode::CAMERA, 10043, "gone.pkg", Mode::Ignored)
        .unwrap();

    // Simulate an uninstall that happened while the engine was down.
    t.registry.remove_package(10043, "gone.pkg");
    t.engine.system_ready();

    assert!(t.engine.op_record(UID, PKG, OpCode::CAMERA).is_some());
    assert!(t.engine.op_record(10043, "gone.pkg", OpCode::CAMERA).is_none());
}
