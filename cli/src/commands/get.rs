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

use appops_lib::engine::OpEntry;
use appops_lib::identity::CallerId;
use tracing::instrument;

use crate::cli_util::CommandHelper;
use crate::cli_util::parse_op;
use crate::command_error::CommandError;
use crate::time_util::format_duration;
use crate::time_util::now_ms;

/// Show the recorded operations of a package.
#[derive(clap::Args, Clone, Debug)]
pub struct GetArgs {
    /// User whose package table to consult.
    #[arg(long, default_value_t = 0)]
    user: u32,
    /// Package name.
    package: String,
    /// Restrict the output to one operation.
    op: Option<String>,
}

#[instrument(skip_all)]
pub fn cmd_get(helper: &CommandHelper, args: &GetArgs) -> Result<(), CommandError> {
    let filter = args.op.as_deref().map(parse_op).transpose()?;
    let uid = helper.resolve_uid(&args.package, args.user)?;
    let package_ops = helper.engine().ops_for_package(
        CallerId::root(),
        uid,
        &args.package,
        filter.as_ref().map(std::slice::from_ref),
    )?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match package_ops {
        None => writeln!(out, "No operations.")?,
        Some(package_ops) => {
            let now = now_ms();
            for entry in &package_ops.ops {
                writeln!(out, "{}", render_entry(entry, now))?;
            }
        }
    }
    Ok(())
}

fn render_entry(entry: &OpEntry, now: i64) -> String {
    let mut line = format!("{}: mode={}", entry.code, entry.mode);
    if entry.time != 0 {
        line.push_str(&format!("; time={} ago", format_duration(now - entry.time)));
    }
    if entry.reject_time != 0 {
        line.push_str(&format!(
            "; rejectTime={} ago",
            format_duration(now - entry.reject_time)
        ));
    }
    if entry.running {
        line.push_str("; running");
    } else if entry.duration != 0 {
        line.push_str(&format!("; duration={}", format_duration(entry.duration)));
    }
    line
}

#[cfg(test)]
mod tests {
    use appops_lib::catalog::Mode;
    use appops_lib::catalog::OpCode;

    use super::*;

    fn entry() -> OpEntry {
        OpEntry {
            code: OpCode::CAMERA,
            mode: Mode::Allowed,
            time: 0,
            reject_time: 0,
            duration: 0,
            running: false,
            proxy_uid: None,
            proxy_package: None,
        }
    }

    #[test]
    fn test_render_minimal() {
        assert_eq!(render_entry(&entry(), 10_000), "CAMERA: mode=allow");
    }

    #[test]
    fn test_render_full() {
        let mut entry = entry();
        entry.mode = Mode::Errored;
        entry.time = 4_000;
        entry.reject_time = 9_000;
        entry.duration = 2_500;
        assert_eq!(
            render_entry(&entry, 10_000),
            "CAMERA: mode=deny; time=+6s ago; rejectTime=+1s ago; duration=+2s500ms"
        );
    }

    #[test]
    fn test_render_running() {
        let mut entry = entry();
        entry.time = 4_000;
        entry.duration = 6_000;
        entry.running = true;
        assert_eq!(
            render_entry(&entry, 10_000),
            "CAMERA: mode=allow; time=+6s ago; running"
        );
    }
}
