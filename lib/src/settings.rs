// Copyright 2024 The AppOps Authors
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

//! Engine configuration.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;

/// Knobs for one engine instance, loadable from a TOML file.
///
/// The snapshot lives in a directory the embedder manages; the engine never
/// creates the directory itself.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AppOpsSettings {
    /// Path of the XML snapshot file.
    pub state_file: PathBuf,
    /// Coalescing window for ordinary mutations.
    pub write_delay_ms: u64,
    /// Window used after policy changes, which should not linger unwritten.
    pub fast_write_delay_ms: u64,
    /// Shrinks the ordinary window to one second for interactive debugging.
    pub debug: bool,
}

impl Default for AppOpsSettings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("appops.xml"),
            write_delay_ms: 30 * 60 * 1000,
            fast_write_delay_ms: 10 * 1000,
            debug: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("invalid settings file")]
    Parse(#[from] toml::de::Error),
}

impl AppOpsSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).context(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn write_delay(&self) -> Duration {
        if self.debug {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(self.write_delay_ms)
        }
    }

    pub fn fast_write_delay(&self) -> Duration {
        Duration::from_millis(self.fast_write_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AppOpsSettings::default();
        assert_eq!(settings.write_delay(), Duration::from_secs(30 * 60));
        assert_eq!(settings.fast_write_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_debug_shrinks_write_delay() {
        let settings = AppOpsSettings {
            debug: true,
            ..Default::default()
        };
        assert_eq!(settings.write_delay(), Duration::from_secs(1));
        // The fast window is already short; debug leaves it alone.
        assert_eq!(settings.fast_write_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("appops.toml");
        fs::write(
            &path,
            r#"
                state-file = "/var/lib/appops/appops.xml"
                fast-write-delay-ms = 2000
            "#,
        )
        .unwrap();
        let settings = AppOpsSettings::load(&path).unwrap();
        assert_eq!(
            settings.state_file,
            PathBuf::from("/var/lib/appops/appops.xml")
        );
        assert_eq!(settings.fast_write_delay(), Duration::from_secs(2));
        assert_eq!(settings.write_delay(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("appops.toml");
        fs::write(&path, "state-file = [").unwrap();
        assert!(matches!(
            AppOpsSettings::load(&path),
            Err(SettingsError::Parse(_))
        ));
    }
}
