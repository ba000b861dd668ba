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
use std::slice;

use appops_lib::catalog::Mode;
use appops_lib::identity::CallerId;
use appops_lib::identity::user_id;
use tracing::instrument;

use crate::cli_util::CommandHelper;
use crate::cli_util::parse_mode;
use crate::cli_util::parse_op;
use crate::command_error::CommandError;

/// List packages whose recorded mode for an operation matches.
#[derive(clap::Args, Clone, Debug)]
pub struct QueryOpArgs {
    /// Only packages of this user.
    #[arg(long, default_value_t = 0)]
    user: u32,
    /// Operation, by name or numeric code.
    op: String,
    /// Mode to match (defaults to ignore).
    mode: Option<String>,
}

#[instrument(skip_all)]
pub fn cmd_query_op(helper: &CommandHelper, args: &QueryOpArgs) -> Result<(), CommandError> {
    let op = parse_op(&args.op)?;
    let mode = args
        .mode
        .as_deref()
        .map(parse_mode)
        .transpose()?
        .unwrap_or(Mode::Ignored);
    let packages = helper
        .engine()
        .packages_for_ops(CallerId::root(), Some(slice::from_ref(&op)))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut found = false;
    for package_ops in packages {
        if user_id(package_ops.uid) != args.user {
            continue;
        }
        if package_ops.ops.iter().any(|entry| entry.mode == mode) {
            writeln!(out, "{}", package_ops.package)?;
            found = true;
        }
    }
    if !found {
        writeln!(out, "No operations.")?;
    }
    Ok(())
}
