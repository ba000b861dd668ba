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

use tracing::instrument;

use crate::cli_util::CommandHelper;
use crate::command_error::CommandError;

/// Write the current state to disk immediately.
#[derive(clap::Args, Clone, Debug)]
pub struct WriteSettingsArgs {}

#[instrument(skip_all)]
pub fn cmd_write_settings(
    helper: &CommandHelper,
    _args: &WriteSettingsArgs,
) -> Result<(), CommandError> {
    helper.engine().write_state()?;
    Ok(())
}
