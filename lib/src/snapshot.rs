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

//! The durable XML snapshot of the state store.
//!
//! One document holds everything:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8" standalone="yes"?>
//! <app-ops>
//!   <uid n="10042">
//!     <op n="3" m="1"/>
//!   </uid>
//!   <pkg n="a.b">
//!     <uid n="10042" p="false">
//!       <op n="0" m="1" t="1700000000000" r="0"/>
//!     </uid>
//!   </pkg>
//! </app-ops>
//! ```
//!
//! Attributes equal to their semantic zero (mode = the op default, times 0,
//! duration 0, no proxy) are omitted on write and assumed on read. Unknown
//! tags are skipped so newer writers stay readable. The file itself is
//! replaced atomically (write temp, sync, rename) and is guarded by its own
//! mutex, always taken outside the engine lock.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use itertools::Itertools as _;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::BytesDecl;
use quick_xml::events::BytesEnd;
use quick_xml::events::BytesStart;
use quick_xml::events::Event;
use thiserror::Error;
use tracing::warn;

use crate::catalog::Mode;
use crate::catalog::OpCode;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::file_util::write_atomic;
use crate::store::Op;
use crate::store::Ops;
use crate::store::StateStore;

/// Failure reading or writing the snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

/// The snapshot file on disk.
///
/// All access serializes on the file's own mutex so two writers cannot
/// interleave their replace sequences.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes `store` and atomically replaces the file.
    ///
    /// `now_ms` stamps the elapsed duration of still-running ops.
    pub fn write(&self, store: &StateStore, now_ms: i64) -> Result<(), SnapshotError> {
        let bytes = serialize(store, now_ms).context(&self.path)?;
        let _guard = self.lock.lock().unwrap();
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Reads and parses the file. `Ok(None)` means the file does not exist,
    /// which is normal on first boot.
    pub fn read(&self) -> Result<Option<StateStore>, SnapshotError> {
        let bytes = {
            let _guard = self.lock.lock().unwrap();
            match fs::read(&self.path) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(SnapshotError::Path(PathError {
                        path: self.path.clone(),
                        source: err,
                    }));
                }
            }
        };
        parse(&bytes).map(Some)
    }
}

fn serialize(store: &StateStore, now_ms: i64) -> io::Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))?;
    writer.write_event(Event::Start(BytesStart::new("app-ops")))?;

    for (uid, uid_state) in store.iter().sorted_by_key(|&(uid, _)| uid) {
        if uid_state.op_modes.is_empty() {
            continue;
        }
        let mut uid_elem = BytesStart::new("uid");
        uid_elem.push_attribute(("n", uid.to_string().as_str()));
        writer.write_event(Event::Start(uid_elem))?;
        for (&code, &mode) in uid_state.op_modes.iter().sorted_by_key(|&(&code, _)| code) {
            let mut op_elem = BytesStart::new("op");
            op_elem.push_attribute(("n", code.as_raw().to_string().as_str()));
            op_elem.push_attribute(("m", mode.as_raw().to_string().as_str()));
            writer.write_event(Event::Empty(op_elem))?;
        }
        writer.write_event(Event::End(BytesEnd::new("uid")))?;
    }

    // Group per-uid containers under one <pkg> element per package name.
    let mut by_package: BTreeMap<&str, Vec<&Ops>> = BTreeMap::new();
    for (_, uid_state) in store.iter() {
        for ops in uid_state.pkg_ops.values() {
            by_package.entry(&ops.package).or_default().push(ops);
        }
    }
    for (package, mut containers) in by_package {
        containers.sort_by_key(|ops| ops.uid);
        let mut pkg_elem = BytesStart::new("pkg");
        pkg_elem.push_attribute(("n", package));
        writer.write_event(Event::Start(pkg_elem))?;
        for ops in containers {
            let mut uid_elem = BytesStart::new("uid");
            uid_elem.push_attribute(("n", ops.uid.to_string().as_str()));
            uid_elem.push_attribute(("p", if ops.privileged { "true" } else { "false" }));
            writer.write_event(Event::Start(uid_elem))?;
            for op in ops.ops.values().sorted_by_key(|op| op.code) {
                write_op(&mut writer, op, now_ms)?;
            }
            writer.write_event(Event::End(BytesEnd::new("uid")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("pkg")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("app-ops")))?;
    Ok(writer.into_inner())
}

fn write_op<W: io::Write>(writer: &mut Writer<W>, op: &Op, now_ms: i64) -> io::Result<()> {
    let mut elem = BytesStart::new("op");
    elem.push_attribute(("n", op.code.as_raw().to_string().as_str()));
    if op.mode != op.code.default_mode() {
        elem.push_attribute(("m", op.mode.as_raw().to_string().as_str()));
    }
    if op.time != 0 {
        elem.push_attribute(("t", op.time.to_string().as_str()));
    }
    if op.reject_time != 0 {
        elem.push_attribute(("r", op.reject_time.to_string().as_str()));
    }
    // A running op is persisted with the duration it has accumulated so far.
    let duration = if op.is_running() {
        now_ms - op.time
    } else {
        op.duration
    };
    if duration != 0 {
        elem.push_attribute(("d", duration.to_string().as_str()));
    }
    if let Some(proxy_uid) = op.proxy_uid {
        elem.push_attribute(("pu", proxy_uid.to_string().as_str()));
    }
    if let Some(proxy_package) = &op.proxy_package {
        elem.push_attribute(("pp", proxy_package.as_str()));
    }
    writer.write_event(Event::Empty(elem))
}

fn parse(bytes: &[u8]) -> Result<StateStore, SnapshotError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut skip_buf = Vec::new();
    let mut store = StateStore::default();

    // Parse context: which known elements we are inside of.
    let mut in_root = false;
    let mut overlay_uid: Option<u32> = None;
    let mut pkg: Option<String> = None;
    let mut pkg_uid: Option<(u32, bool)> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| SnapshotError::Malformed(err.to_string()))?;
        match event {
            Event::Start(ref elem) | Event::Empty(ref elem) => {
                let is_start = matches!(event, Event::Start(_));
                let in_pkg = pkg.is_some();
                match (elem.name().as_ref(), in_root, in_pkg) {
                    (b"app-ops", false, _) if is_start => in_root = true,
                    (b"uid", true, false)
                        if is_start && overlay_uid.is_none() && pkg_uid.is_none() =>
                    {
                        overlay_uid = attr_u32(elem, "n")?;
                        if overlay_uid.is_none() {
                            warn!("skipping uid element without a uid");
                            skip_subtree(&mut reader, elem, &mut skip_buf)?;
                        }
                    }
                    (b"pkg", true, false) if is_start => {
                        pkg = attr_string(elem, "n")?;
                        if pkg.is_none() {
                            warn!("skipping pkg element without a name");
                            skip_subtree(&mut reader, elem, &mut skip_buf)?;
                        }
                    }
                    (b"uid", true, true) if is_start && pkg_uid.is_none() => {
                        match attr_u32(elem, "n")? {
                            Some(uid) => {
                                let privileged =
                                    attr_string(elem, "p")?.as_deref() == Some("true");
                                pkg_uid = Some((uid, privileged));
                            }
                            None => {
                                warn!("skipping pkg uid element without a uid");
                                skip_subtree(&mut reader, elem, &mut skip_buf)?;
                            }
                        }
                    }
                    (b"op", true, _) => {
                        if let Some(uid) = overlay_uid {
                            parse_overlay_op(&mut store, uid, elem)?;
                        } else if let (Some(package), Some((uid, privileged))) = (&pkg, pkg_uid) {
                            parse_pkg_op(&mut store, uid, package, privileged, elem)?;
                        }
                        if is_start {
                            skip_subtree(&mut reader, elem, &mut skip_buf)?;
                        }
                    }
                    _ => {
                        // Unknown or misplaced tag; skip it and its subtree.
                        if is_start {
                            skip_subtree(&mut reader, elem, &mut skip_buf)?;
                        }
                    }
                }
            }
            Event::End(elem) => match elem.name().as_ref() {
                b"uid" if pkg_uid.is_some() => pkg_uid = None,
                b"uid" => overlay_uid = None,
                b"pkg" => pkg = None,
                b"app-ops" => in_root = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if overlay_uid.is_some() || pkg.is_some() || pkg_uid.is_some() {
        return Err(SnapshotError::Malformed(
            "unbalanced elements in snapshot".to_owned(),
        ));
    }
    Ok(store)
}

fn skip_subtree(
    reader: &mut Reader<&[u8]>,
    elem: &BytesStart<'_>,
    skip_buf: &mut Vec<u8>,
) -> Result<(), SnapshotError> {
    let end = elem.to_end().into_owned();
    reader
        .read_to_end_into(end.name(), skip_buf)
        .map_err(|err| SnapshotError::Malformed(err.to_string()))?;
    Ok(())
}

fn parse_overlay_op(
    store: &mut StateStore,
    uid: u32,
    elem: &BytesStart<'_>,
) -> Result<(), SnapshotError> {
    let (Some(code), Some(mode)) = (attr_i32(elem, "n")?, attr_i32(elem, "m")?) else {
        warn!(uid, "skipping uid op without code or mode");
        return Ok(());
    };
    let (Ok(code), Some(mode)) = (OpCode::from_raw(code), Mode::from_raw(mode)) else {
        warn!(uid, code, "skipping uid op with unknown code or mode");
        return Ok(());
    };
    // Old files may predate edge normalization; key by switch code.
    store
        .uid_state_or_create(uid)
        .op_modes
        .insert(code.switch_code(), mode);
    Ok(())
}

fn parse_pkg_op(
    store: &mut StateStore,
    uid: u32,
    package: &str,
    privileged: bool,
    elem: &BytesStart<'_>,
) -> Result<(), SnapshotError> {
    let Some(raw_code) = attr_i32(elem, "n")? else {
        warn!(uid, package, "skipping op without a code");
        return Ok(());
    };
    let Ok(code) = OpCode::from_raw(raw_code) else {
        warn!(uid, package, code = raw_code, "skipping op with unknown code");
        return Ok(());
    };
    let op = store
        .create_ops(uid, package, privileged)
        .op_or_create(code);
    if let Some(mode) = attr_i32(elem, "m")?.and_then(Mode::from_raw) {
        op.mode = mode;
    }
    op.time = attr_i64(elem, "t")?.unwrap_or(0);
    op.reject_time = attr_i64(elem, "r")?.unwrap_or(0);
    op.duration = attr_i64(elem, "d")?.unwrap_or(0);
    op.proxy_uid = attr_u32(elem, "pu")?;
    op.proxy_package = attr_string(elem, "pp")?;
    Ok(())
}

fn attr_string(elem: &BytesStart<'_>, name: &str) -> Result<Option<String>, SnapshotError> {
    for attr in elem.attributes() {
        let attr = attr.map_err(|err| SnapshotError::Malformed(err.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| SnapshotError::Malformed(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn attr_i64(elem: &BytesStart<'_>, name: &str) -> Result<Option<i64>, SnapshotError> {
    attr_string(elem, name)?
        .map(|value| {
            value
                .parse()
                .map_err(|_| SnapshotError::Malformed(format!("bad integer attribute {name}")))
        })
        .transpose()
}

fn attr_i32(elem: &BytesStart<'_>, name: &str) -> Result<Option<i32>, SnapshotError> {
    attr_string(elem, name)?
        .map(|value| {
            value
                .parse()
                .map_err(|_| SnapshotError::Malformed(format!("bad integer attribute {name}")))
        })
        .transpose()
}

fn attr_u32(elem: &BytesStart<'_>, name: &str) -> Result<Option<u32>, SnapshotError> {
    attr_string(elem, name)?
        .map(|value| {
            value
                .parse()
                .map_err(|_| SnapshotError::Malformed(format!("bad integer attribute {name}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_store() -> StateStore {
        let mut store = StateStore::default();
        store
            .uid_state_or_create(10042)
            .op_modes
            .insert(OpCode::VIBRATE, Mode::Ignored);
        let op = store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::COARSE_LOCATION);
        op.mode = Mode::Errored;
        op.time = 1_700_000_000_000;
        op.reject_time = 1_700_000_000_500;
        op.duration = 250;
        let proxied = store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::CAMERA);
        proxied.time = 1_700_000_001_000;
        proxied.proxy_uid = Some(10043);
        proxied.proxy_package = Some("proxy.pkg".to_owned());
        store
            .create_ops(1_010_042, "a.b", true)
            .op_or_create(OpCode::READ_SMS)
            .mode = Mode::Ignored;
        store
    }

    #[test]
    fn test_round_trip() {
        let store = sample_store();
        let bytes = serialize(&store, 0).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, store);
    }

    #[test]
    fn test_zero_attributes_omitted() {
        let mut store = StateStore::default();
        let op = store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::CAMERA);
        op.time = 42;
        let text = String::from_utf8(serialize(&store, 0).unwrap()).unwrap();
        assert!(text.contains(r#"<op n="26" t="42"/>"#), "{text}");
        // Default mode, zero reject time and no proxy leave no attributes.
        assert!(!text.contains(" m="), "{text}");
        assert!(!text.contains(" r="), "{text}");
        assert!(!text.contains(" pu="), "{text}");
    }

    #[test]
    fn test_running_op_persists_elapsed_duration() {
        let mut store = StateStore::default();
        let op = store
            .create_ops(10042, "a.b", false)
            .op_or_create(OpCode::CAMERA);
        op.time = 1_000;
        op.duration = -1;
        op.nesting = 1;
        let bytes = serialize(&store, 4_500).unwrap();
        let parsed = parse(&bytes).unwrap();
        let parsed_op = parsed.op(10042, "a.b", OpCode::CAMERA).unwrap();
        assert_eq!(parsed_op.duration, 3_500);
        // Nesting does not survive a restart; the session owning it is gone.
        assert_eq!(parsed_op.nesting, 0);
        assert!(!parsed_op.is_running());
    }

    #[test]
    fn test_unknown_tags_skipped() {
        let text = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
            <app-ops>
              <future-section><nested attr="1"/></future-section>
              <pkg n="a.b">
                <mystery/>
                <uid n="10042" p="false">
                  <op n="3" m="1"/>
                  <op n="999" m="1"/>
                </uid>
              </pkg>
            </app-ops>"#;
        let store = parse(text.as_bytes()).unwrap();
        assert_eq!(
            store.op(10042, "a.b", OpCode::VIBRATE).unwrap().mode,
            Mode::Ignored
        );
        // The out-of-range op code was dropped, not fatal.
        assert_eq!(store.ops(10042, "a.b").unwrap().ops.len(), 1);
    }

    #[test]
    fn test_malformed_document() {
        assert_matches!(
            parse(b"<app-ops><uid n=\"1\">"),
            Err(SnapshotError::Malformed(_))
        );
        assert_matches!(parse(b"not xml at all"), Ok(store) if store.is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(temp_dir.path().join("appops.xml"));
        assert_matches!(file.read(), Ok(None));
        let store = sample_store();
        file.write(&store, 0).unwrap();
        let read_back = file.read().unwrap().unwrap();
        assert_eq!(read_back, store);
    }

    #[test]
    fn test_privileged_flag_round_trips() {
        let store = sample_store();
        let bytes = serialize(&store, 0).unwrap();
        let parsed = parse(&bytes).unwrap();
        assert!(!parsed.ops(10042, "a.b").unwrap().privileged);
        assert!(parsed.ops(1_010_042, "a.b").unwrap().privileged);
    }
}
