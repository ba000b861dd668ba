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

//! Command-line surface for the AppOps engine.
//!
//! Each invocation loads the configured snapshot, runs one subcommand
//! against an in-process engine, and flushes any pending write before
//! exiting. Errors go to stderr and exit with status 255.

use std::process::ExitCode;

use clap::Parser as _;
use tracing_subscriber::EnvFilter;

pub mod cli_util;
pub mod command_error;
pub mod commands;
pub mod time_util;

use crate::cli_util::Args;
use crate::cli_util::CommandHelper;
use crate::command_error::CommandError;

pub fn cli_main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            // The classic shell surface reports -1 on any failure.
            ExitCode::from(255)
        }
    }
}

fn run(args: &Args) -> Result<(), CommandError> {
    let helper = CommandHelper::new(args)?;
    commands::run_command(&helper, &args.command)?;
    // One-shot process: pending delayed writes would be lost otherwise.
    helper.engine().shutdown();
    Ok(())
}
