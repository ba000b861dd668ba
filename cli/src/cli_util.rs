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

//! Shared plumbing for the subcommands: configuration loading, the static
//! package table standing in for the platform package service, and argument
//! parsing helpers.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use appops_lib::catalog::Mode;
use appops_lib::catalog::OpCode;
use appops_lib::engine::AppOpsService;
use appops_lib::identity::PackageRegistry;
use appops_lib::identity::ROOT_UID;
use appops_lib::identity::RegistryUnavailable;
use appops_lib::identity::SHELL_UID;
use appops_lib::identity::SYSTEM_UID;
use appops_lib::identity::UserId;
use appops_lib::identity::user_id;
use appops_lib::settings::AppOpsSettings;

use crate::command_error::CommandError;
use crate::commands::Command;

/// Authorize and account per-application operations.
#[derive(clap::Parser, Clone, Debug)]
#[command(name = "appops", version)]
pub struct Args {
    /// Configuration file (engine settings plus the package table).
    #[arg(long, global = true, value_name = "FILE", default_value = "appops.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// One installed package known to the CLI's static package table.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageEntry {
    pub name: String,
    pub uid: u32,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub suspended: bool,
}

/// The CLI configuration file: engine settings inline, plus `[[packages]]`
/// tables describing the installed packages.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CliConfig {
    #[serde(flatten)]
    pub engine: AppOpsSettings,
    pub packages: Vec<PackageEntry>,
}

/// Package table backed by the configuration file. The CLI has no live
/// platform to ask, so lookups never block and never fail.
#[derive(Debug, Default)]
pub struct StaticPackageRegistry {
    packages: Vec<PackageEntry>,
}

impl StaticPackageRegistry {
    pub fn new(packages: Vec<PackageEntry>) -> Self {
        Self { packages }
    }
}

impl PackageRegistry for StaticPackageRegistry {
    fn packages_for_uid(&self, uid: u32) -> Vec<String> {
        self.packages
            .iter()
            .filter(|package| package.uid == uid)
            .map(|package| package.name.clone())
            .collect()
    }

    fn uid_for_package(&self, package: &str, user: UserId) -> Option<u32> {
        self.packages
            .iter()
            .find(|candidate| candidate.name == package && user_id(candidate.uid) == user)
            .map(|candidate| candidate.uid)
    }

    fn is_privileged(&self, package: &str, user: UserId) -> bool {
        self.packages.iter().any(|candidate| {
            candidate.name == package && user_id(candidate.uid) == user && candidate.privileged
        })
    }

    fn is_suspended(&self, package: &str, user: UserId) -> Result<bool, RegistryUnavailable> {
        Ok(self.packages.iter().any(|candidate| {
            candidate.name == package && user_id(candidate.uid) == user && candidate.suspended
        }))
    }
}

/// Loaded configuration plus the engine built from it.
pub struct CommandHelper {
    config: CliConfig,
    engine: Arc<AppOpsService>,
}

impl CommandHelper {
    pub fn new(args: &Args) -> Result<Self, CommandError> {
        let config = if args.config.exists() {
            let text = fs::read_to_string(&args.config).map_err(|err| {
                CommandError::user_error(format!("Cannot read {}: {err}", args.config.display()))
            })?;
            toml::from_str(&text).map_err(|err| {
                CommandError::user_error(format!("Invalid config {}: {err}", args.config.display()))
            })?
        } else {
            CliConfig::default()
        };
        let registry = Arc::new(StaticPackageRegistry::new(config.packages.clone()));
        let engine = AppOpsService::new(&config.engine, registry);
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &Arc<AppOpsService> {
        &self.engine
    }

    /// Resolves a package name to its uid for the given user. Well-known
    /// names work without a package table.
    pub fn resolve_uid(&self, package: &str, user: UserId) -> Result<u32, CommandError> {
        match package {
            "root" => Ok(ROOT_UID),
            "android" => Ok(SYSTEM_UID),
            "com.android.shell" => Ok(SHELL_UID),
            _ => self
                .config
                .packages
                .iter()
                .find(|candidate| candidate.name == package && user_id(candidate.uid) == user)
                .map(|candidate| candidate.uid)
                .ok_or_else(|| {
                    CommandError::user_error(format!("Unknown package: {package}"))
                }),
        }
    }
}

/// Parses an op given as a catalog name or a raw integer code.
pub fn parse_op(value: &str) -> Result<OpCode, CommandError> {
    if let Some(op) = OpCode::from_name(value) {
        return Ok(op);
    }
    let code = value
        .parse::<i32>()
        .map_err(|_| CommandError::user_error(format!("Unknown operation string: {value}")))?;
    OpCode::from_raw(code).map_err(|err| CommandError::user_error(err.to_string()))
}

/// Parses a mode given as `allow`/`ignore`/`deny`/`default` or an integer.
pub fn parse_mode(value: &str) -> Result<Mode, CommandError> {
    Mode::parse(value).ok_or_else(|| CommandError::user_error(format!("Unknown mode: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_op_accepts_names_and_numbers() {
        assert_eq!(parse_op("CAMERA").unwrap(), OpCode::CAMERA);
        assert_eq!(parse_op("26").unwrap(), OpCode::CAMERA);
        assert!(parse_op("NO_SUCH_OP").is_err());
        assert!(parse_op("9999").is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("deny").unwrap(), Mode::Errored);
        assert_eq!(parse_mode("0").unwrap(), Mode::Allowed);
        assert!(parse_mode("sometimes").is_err());
    }

    #[test]
    fn test_config_parses_packages() {
        let config: CliConfig = toml::from_str(
            r#"
                state-file = "ops.xml"
                [[packages]]
                name = "a.b"
                uid = 10042
                privileged = true
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.state_file.to_str(), Some("ops.xml"));
        assert_eq!(config.packages.len(), 1);
        assert!(config.packages[0].privileged);
    }
}
