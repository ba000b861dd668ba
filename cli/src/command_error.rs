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

use std::io;

use appops_lib::engine::AppOpsError;
use appops_lib::settings::SettingsError;
use appops_lib::snapshot::SnapshotError;
use thiserror::Error;

/// Anything that aborts a CLI command. Rendered to stderr; the process
/// exits with status 255.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    /// An error caused by the user's arguments or environment.
    pub fn user_error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<AppOpsError> for CommandError {
    fn from(err: AppOpsError) -> Self {
        Self::user_error(err.to_string())
    }
}

impl From<SnapshotError> for CommandError {
    fn from(err: SnapshotError) -> Self {
        Self::user_error(err.to_string())
    }
}

impl From<SettingsError> for CommandError {
    fn from(err: SettingsError) -> Self {
        Self::user_error(err.to_string())
    }
}

impl From<io::Error> for CommandError {
    fn from(err: io::Error) -> Self {
        Self::user_error(err.to_string())
    }
}
