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

use appops_lib::identity::CallerId;
use tracing::instrument;

use crate::cli_util::CommandHelper;
use crate::cli_util::parse_mode;
use crate::cli_util::parse_op;
use crate::command_error::CommandError;

/// Set the mode of an operation for a package.
#[derive(clap::Args, Clone, Debug)]
pub struct SetArgs {
    /// User whose package table to consult.
    #[arg(long, default_value_t = 0)]
    user: u32,
    /// Package name.
    package: String,
    /// Operation, by name (e.g. COARSE_LOCATION) or numeric code.
    op: String,
    /// One of allow, ignore, deny, default, or a numeric mode.
    mode: String,
}

#[instrument(skip_all)]
pub fn cmd_set(helper: &CommandHelper, args: &SetArgs) -> Result<(), CommandError> {
    let op = parse_op(&args.op)?;
    let mode = parse_mode(&args.mode)?;
    let uid = helper.resolve_uid(&args.package, args.user)?;
    helper
        .engine()
        .set_mode(CallerId::root(), op, uid, &args.package, mode)?;
    Ok(())
}
