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

use std::io::Write as _;

use appops_lib::identity::CallerId;
use tracing::instrument;

use crate::cli_util::CommandHelper;
use crate::command_error::CommandError;

/// Reset recorded modes to their defaults.
#[derive(clap::Args, Clone, Debug)]
pub struct ResetArgs {
    /// Only state of this user.
    #[arg(long, default_value_t = 0)]
    user: u32,
    /// Only state of this package.
    package: Option<String>,
}

#[instrument(skip_all)]
pub fn cmd_reset(helper: &CommandHelper, args: &ResetArgs) -> Result<(), CommandError> {
    helper.engine().reset_all_modes(
        CallerId::root(),
        Some(args.user),
        args.package.as_deref(),
    )?;
    writeln!(std::io::stdout(), "Reset.")?;
    Ok(())
}
