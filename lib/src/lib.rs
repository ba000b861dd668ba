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

//! Application-operation authorization and accounting.
//!
//! The engine decides, per application and per operation, whether a sensitive
//! action may proceed, accounts for every attempt, and keeps interested
//! observers and a durable XML snapshot in sync. See
//! [`engine::AppOpsService`] for the entry point.

pub mod catalog;
pub mod engine;
pub mod file_util;
pub mod identity;
pub mod observers;
pub mod restrictions;
mod scheduler;
pub mod settings;
pub mod snapshot;
pub mod store;
