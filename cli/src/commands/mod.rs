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

mod get;
mod query_op;
mod read_settings;
mod reset;
mod set;
mod write_settings;

use tracing::instrument;

use crate::cli_util::CommandHelper;
use crate::command_error::CommandError;

#[derive(clap::Subcommand, Clone, Debug)]
pub enum Command {
    Set(set::SetArgs),
    Get(get::GetArgs),
    QueryOp(query_op::QueryOpArgs),
    Reset(reset::ResetArgs),
    WriteSettings(write_settings::WriteSettingsArgs),
    ReadSettings(read_settings::ReadSettingsArgs),
}

#[instrument(skip_all)]
pub fn run_command(helper: &CommandHelper, command: &Command) -> Result<(), CommandError> {
    match command {
        Command::Set(args) => set::cmd_set(helper, args),
        Command::Get(args) => get::cmd_get(helper, args),
        Command::QueryOp(args) => query_op::cmd_query_op(helper, args),
        Command::Reset(args) => reset::cmd_reset(helper, args),
        Command::WriteSettings(args) => write_settings::cmd_write_settings(helper, args),
        Command::ReadSettings(args) => read_settings::cmd_read_settings(helper, args),
    }
}
