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

use appops_lib::catalog::Mode;
use appops_lib::catalog::OpCode;
use appops_lib::engine::AppOpsError;
use appops_lib::identity::CallerId;
use assert_matches::assert_matches;
use testutils::TestEngine;

const UID: u32 = 10042;
const PKG: &str = "a.b";

fn engine_with_package() -> TestEngine {
    let test_engine = TestEngine::init();
    test_engine.registry.add_package(UID, PKG);
    test_engine
}

#[test]
fn test_start_finish_duration() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let op = OpCode::RECORD_AUDIO;

    t.clock.set(20_000);
    assert_eq!(
        t.engine
            .start_operation(&token, root, op, UID, Some(PKG))
            .unwrap(),
        Mode::Allowed
    );
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.nesting, 1);
    assert_eq!(record.time, 20_000);
    assert!(record.is_running());

    t.clock.set(23_500);
    t.engine
        .finish_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.nesting, 0);
    assert_eq!(record.duration, 3_500);
    assert_eq!(record.time, 23_500);
    assert!(!record.is_running());
}

#[test]
fn test_nested_start_keeps_running() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let op = OpCode::RECORD_AUDIO;

    t.clock.set(20_000);
    t.engine
        .start_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    t.clock.set(21_000);
    t.engine
        .start_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.nesting, 2);
    // The start time belongs to the outermost start.
    assert_eq!(record.time, 20_000);

    t.clock.set(22_000);
    t.engine
        .finish_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.nesting, 1);
    assert!(record.is_running());

    t.clock.set(25_000);
    t.engine
        .finish_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.nesting, 0);
    assert_eq!(record.duration, 5_000);
}

#[test]
fn test_token_death_finishes_ops() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let op = OpCode::RECORD_AUDIO;

    t.clock.set(30_000);
    t.engine
        .start_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    t.engine
        .start_operation(&token, root, op, UID, Some(PKG))
        .unwrap();

    t.clock.set(32_000);
    drop(token);
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.nesting, 0);
    assert!(!record.is_running());
    assert_eq!(record.duration, 2_000);
    assert_eq!(record.time, 32_000);
}

#[test]
fn test_denied_start_stamps_reject_time() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let op = OpCode::RECORD_AUDIO;

    t.engine.set_mode(root, op, UID, PKG, Mode::Errored).unwrap();
    t.clock.set(40_000);
    assert_eq!(
        t.engine
            .start_operation(&token, root, op, UID, Some(PKG))
            .unwrap(),
        Mode::Errored
    );
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert_eq!(record.reject_time, 40_000);
    assert_eq!(record.nesting, 0);
    assert!(!record.is_running());

    // A denied start must not be finished.
    assert_matches!(
        t.engine.finish_operation(&token, root, op, UID, Some(PKG)),
        Err(AppOpsError::NotStarted { .. })
    );
}

#[test]
fn test_uid_overlay_applies_to_start() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let op = OpCode::RECORD_AUDIO;

    // The overlay must gate start exactly like note, even though the
    // per-package mode is permissive.
    t.engine.set_mode(root, op, UID, PKG, Mode::Allowed).unwrap();
    t.engine.set_uid_mode(root, op, UID, Mode::Ignored).unwrap();
    t.clock.set(41_000);
    assert_eq!(
        t.engine
            .start_operation(&token, root, op, UID, Some(PKG))
            .unwrap(),
        Mode::Ignored
    );
    assert_eq!(t.engine.op_record(UID, PKG, op).unwrap().reject_time, 41_000);
}

#[test]
fn test_finish_without_start_is_an_error() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    assert_matches!(
        t.engine
            .finish_operation(&token, root, OpCode::RECORD_AUDIO, UID, Some(PKG)),
        Err(AppOpsError::NotStarted { .. })
    );
}

#[test]
fn test_finish_with_foreign_token_is_an_error() {
    let t = engine_with_package();
    let root = CallerId::root();
    let starter = t.engine.client_token(1);
    let other = t.engine.client_token(2);
    let op = OpCode::RECORD_AUDIO;

    t.engine
        .start_operation(&starter, root, op, UID, Some(PKG))
        .unwrap();
    assert_matches!(
        t.engine.finish_operation(&other, root, op, UID, Some(PKG)),
        Err(AppOpsError::NotStarted { .. })
    );
    // The op is still running for the real owner.
    assert!(t.engine.op_record(UID, PKG, op).unwrap().is_running());
    t.engine
        .finish_operation(&starter, root, op, UID, Some(PKG))
        .unwrap();
}

#[test]
fn test_note_while_running_warns_and_proceeds() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let op = OpCode::RECORD_AUDIO;

    t.clock.set(50_000);
    t.engine
        .start_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    t.clock.set(51_000);
    // The prior start was never finished; note proceeds anyway and clears
    // the in-progress marker.
    assert_eq!(
        t.engine.note_operation(root, op, UID, Some(PKG)).unwrap(),
        Mode::Allowed
    );
    let record = t.engine.op_record(UID, PKG, op).unwrap();
    assert!(!record.is_running());
    assert_eq!(record.time, 51_000);
}

#[test]
fn test_cloned_token_death_requires_all_clones() {
    let t = engine_with_package();
    let root = CallerId::root();
    let token = t.engine.client_token(1234);
    let clone = token.clone();
    let op = OpCode::RECORD_AUDIO;

    t.clock.set(60_000);
    t.engine
        .start_operation(&token, root, op, UID, Some(PKG))
        .unwrap();
    drop(token);
    // One clone is still alive; nothing is reclaimed yet.
    assert!(t.engine.op_record(UID, PKG, op).unwrap().is_running());
    t.clock.set(61_000);
    drop(clone);
    assert!(!t.engine.op_record(UID, PKG, op).unwrap().is_running());
}
