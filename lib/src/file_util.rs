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

#![expect(missing_docs)]

use std::fs::File;
use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Flushes the temp file to disk and moves it to `new_path`, replacing any
/// existing file there.
pub fn persist_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<File> {
    // Ensure the new content has reached the disk before the old content is
    // unlinked by the rename.
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path)
        .map_err(|PersistError { error, file: _ }| error)
}

/// Atomically replaces the file at `path` with `contents`.
///
/// The temp file is created in the target's parent directory so the final
/// rename stays on one filesystem. The parent directory must already exist.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), PathError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(parent).context(parent)?;
    temp_file.write_all(contents).context(temp_file.path())?;
    persist_temp_file(temp_file, path).context(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_write_atomic_new_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("state.xml");
        write_atomic(&target, b"contents").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"contents");
        // No temp file is left behind.
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("state.xml");
        fs::write(&target, b"old").unwrap();
        write_atomic(&target, b"new").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn test_write_atomic_missing_parent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("no-such-dir").join("state.xml");
        let err = write_atomic(&target, b"contents").unwrap_err();
        assert_eq!(err.path, temp_dir.path().join("no-such-dir"));
    }
}
