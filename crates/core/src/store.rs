//! WWID / PR-key / binding stores.
//!
//! Three instances of one line-oriented key/value interface plus a fourth,
//! degenerate failed-wwid marker directory. All three files share
//! one physical format family: a fixed header comment block followed
//! by one record per line, atomically replaced on `replace_all` (via
//! [`mpath_utils::atomic_replace`]) and guarded by an advisory `flock` for
//! the duration of a mutating call.
//!
//! `remove` does not delete a line; it comments it out in place so a
//! concurrent reader never observes a torn file and line numbers stay
//! stable.

use std::fs::OpenOptions;
use std::path::{Path as FsPath, PathBuf};

use rustix::fs::{flock, FlockOperation};
use thiserror::Error;

/// Failure modes for a persistence store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, writing, or locking the backing file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The store file the operation was performed on.
        path: PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn from_io(path: &FsPath, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

struct LockGuard(std::fs::File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Any exit path releases the lock structurally: dropping the
        // guard unconditionally unlocks, even on an early `?` return.
        let _ = flock(&self.0, FlockOperation::Unlock);
    }
}

fn lock_exclusive(path: &FsPath) -> Result<LockGuard, StoreError> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| StoreError::from_io(path, e))?;
    flock(&f, FlockOperation::LockExclusive)
        .map_err(|e| StoreError::from_io(path, e.into()))?;
    Ok(LockGuard(f))
}

/// A line-oriented key/value store backed by one file, parameterized over
/// the per-store record format (wwids/prkeys/bindings differ only in
/// how a record renders to/parses from one line).
pub struct FileKvStore {
    path: PathBuf,
    header: &'static str,
    render: fn(&str, &str) -> String,
    parse: fn(&str) -> Option<(String, String)>,
}

impl FileKvStore {
    /// A store at `path` using the given header comment and per-record
    /// render/parse functions.
    pub fn new(
        path: impl Into<PathBuf>,
        header: &'static str,
        render: fn(&str, &str) -> String,
        parse: fn(&str) -> Option<(String, String)>,
    ) -> Self {
        Self {
            path: path.into(),
            header,
            render,
            parse,
        }
    }

    /// The backing file path.
    pub fn path(&self) -> &FsPath {
        &self.path
    }

    fn read_all_lines(&self) -> Result<Vec<String>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => Ok(s.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::from_io(&self.path, e)),
        }
    }

    fn write_all(&self, lines: &[String]) -> Result<(), StoreError> {
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        mpath_utils::atomic_replace(&self.path, contents.as_bytes())
            .map_err(|e| StoreError::from_io(&self.path, std::io::Error::other(e.to_string())))
    }

    fn parse_line(&self, line: &str) -> Option<(String, String)> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        (self.parse)(trimmed)
    }

    /// Look up the value stored under `key`. Lookups are read-only and do
    /// not take the advisory lock.
    pub fn lookup(&self, key: &str) -> Result<Option<String>, StoreError> {
        for line in self.read_all_lines()? {
            if let Some((k, v)) = self.parse_line(&line) {
                if k == key {
                    return Ok(Some(v));
                }
            }
        }
        Ok(None)
    }

    /// Reverse lookup: the first key whose stored value equals `value`.
    /// Used by the bindings store (wwid -> alias) and the prkeys store
    /// (wwid -> configured key), both of which store the wwid as the
    /// record's *value*.
    pub fn find_key_for_value(&self, value: &str) -> Result<Option<String>, StoreError> {
        for line in self.read_all_lines()? {
            if let Some((k, v)) = self.parse_line(&line) {
                if v == value {
                    return Ok(Some(k));
                }
            }
        }
        Ok(None)
    }

    /// Insert or update the record for `key`, holding an exclusive lock for
    /// the duration of the read-modify-write.
    pub fn insert(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _lock = lock_exclusive(&self.path)?;
        let mut lines = self.read_all_lines()?;
        let mut replaced = false;
        for line in lines.iter_mut() {
            if let Some((k, _)) = self.parse_line(line) {
                if k == key {
                    *line = (self.render)(key, value);
                    replaced = true;
                    break;
                }
            }
        }
        if !replaced {
            if lines.is_empty() {
                lines.push(self.header.to_string());
            }
            lines.push((self.render)(key, value));
        }
        self.write_all(&lines)
    }

    /// Comment out the record for `key` in place, preserving line numbers
    ///. Idempotent: removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _lock = lock_exclusive(&self.path)?;
        let mut lines = self.read_all_lines()?;
        for line in lines.iter_mut() {
            if let Some((k, _)) = self.parse_line(line) {
                if k == key {
                    *line = format!("#{line}");
                }
            }
        }
        self.write_all(&lines)
    }

    /// Atomically replace the whole store with `entries`, rewriting the
    /// header (/"recreated atomically on `replace_all`").
    pub fn replace_all(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let _lock = lock_exclusive(&self.path)?;
        let mut lines = vec![self.header.to_string()];
        lines.extend(entries.iter().map(|(k, v)| (self.render)(k, v)));
        self.write_all(&lines)
    }
}

const WWIDS_HEADER: &str = "# Multipath wwids, maintained by multipath(8) and multipathd(8).";
const PRKEYS_HEADER: &str = "# Persistent reservation keys, maintained by multipathd(8).";
const BINDINGS_HEADER: &str = "# Multipath bindings, maintained by multipath(8).";

fn render_wwid(key: &str, _value: &str) -> String {
    format!("/{key}/")
}

fn parse_wwid(line: &str) -> Option<(String, String)> {
    let w = line.trim().strip_prefix('/')?.strip_suffix('/')?;
    if w.is_empty() {
        None
    } else {
        Some((w.to_string(), String::new()))
    }
}

fn render_kv_pair(key: &str, value: &str) -> String {
    format!("{key} {value}")
}

fn parse_kv_pair(line: &str) -> Option<(String, String)> {
    let mut it = line.split_whitespace();
    let k = it.next()?;
    let v = it.next()?;
    Some((k.to_string(), v.to_string()))
}

/// The wwids store (/): one `/wwid/` per line, keyed by wwid with an
/// empty value.
pub fn wwids_store(path: impl Into<PathBuf>) -> FileKvStore {
    FileKvStore::new(path, WWIDS_HEADER, render_wwid, parse_wwid)
}

/// The prkeys store: `<hex-key> <wwid>` per line, keyed by the
/// reservation key (a leading upper-case `X` carries the APTPL flag,
/// encoded directly in the key string by the caller).
pub fn prkeys_store(path: impl Into<PathBuf>) -> FileKvStore {
    FileKvStore::new(path, PRKEYS_HEADER, render_kv_pair, parse_kv_pair)
}

/// The bindings store: `<alias> <wwid>` per line, keyed by alias.
pub fn bindings_store(path: impl Into<PathBuf>) -> FileKvStore {
    FileKvStore::new(path, BINDINGS_HEADER, render_kv_pair, parse_kv_pair)
}

/// The failed-wwid marker directory: a degenerate instance of the
/// same interface keyed by wwid with an empty value, implemented as one
/// zero-length file per wwid rather than a line-oriented file.
#[derive(Debug, Clone)]
pub struct FailedWwidMarkers {
    dir: PathBuf,
}

impl FailedWwidMarkers {
    /// A marker directory rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, wwid: &str) -> PathBuf {
        self.dir.join(wwid)
    }

    /// Record `wwid` as having failed, creating the marker directory if
    /// needed.
    pub fn mark(&self, wwid: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::from_io(&self.dir, e))?;
        let p = self.path_for(wwid);
        std::fs::File::create(&p).map_err(|e| StoreError::from_io(&p, e))?;
        Ok(())
    }

    /// Clear `wwid`'s failed marker, if any.
    pub fn unmark(&self, wwid: &str) -> Result<(), StoreError> {
        let p = self.path_for(wwid);
        match std::fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::from_io(&p, e)),
        }
    }

    /// True if `wwid` currently has a failed marker.
    pub fn is_marked(&self, wwid: &str) -> bool {
        self.path_for(wwid).is_file()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wwid_store_insert_lookup_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = wwids_store(dir.path().join("wwids"));
        store.insert("3600a098000aaaaaa", "").unwrap();
        assert_eq!(
            store.lookup("3600a098000aaaaaa").unwrap(),
            Some(String::new())
        );
        store.remove("3600a098000aaaaaa").unwrap();
        assert_eq!(store.lookup("3600a098000aaaaaa").unwrap(), None);
        // Removal comments the line out in place; the header line count
        // does not shrink.
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains("#/3600a098000aaaaaa/"));
    }

    #[test]
    fn test_bindings_store_reverse_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = bindings_store(dir.path().join("bindings"));
        store.insert("mpatha", "3600a098000aaaaaa").unwrap();
        assert_eq!(
            store.find_key_for_value("3600a098000aaaaaa").unwrap().as_deref(),
            Some("mpatha")
        );
        assert_eq!(store.find_key_for_value("nope").unwrap(), None);
    }

    #[test]
    fn test_prkeys_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = prkeys_store(dir.path().join("prkeys"));
        store.insert("X123abc", "3600a098000aaaaaa").unwrap();
        assert_eq!(
            store.lookup("X123abc").unwrap().as_deref(),
            Some("3600a098000aaaaaa")
        );
    }

    #[test]
    fn test_insert_replaces_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = bindings_store(dir.path().join("bindings"));
        store.insert("mpatha", "W1").unwrap();
        store.insert("mpatha", "W2").unwrap();
        assert_eq!(store.lookup("mpatha").unwrap().as_deref(), Some("W2"));
        // Only one live record for the alias; no duplicate line appended.
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(contents.lines().filter(|l| l.starts_with("mpatha ")).count(), 1);
    }

    #[test]
    fn test_replace_all_recreates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = bindings_store(dir.path().join("bindings"));
        store.insert("mpatha", "W1").unwrap();
        store
            .replace_all(&[("mpathb".to_string(), "W2".to_string())])
            .unwrap();
        assert_eq!(store.lookup("mpatha").unwrap(), None);
        assert_eq!(store.lookup("mpathb").unwrap().as_deref(), Some("W2"));
    }

    #[test]
    fn test_lookup_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = wwids_store(dir.path().join("does-not-exist"));
        assert_eq!(store.lookup("anything").unwrap(), None);
    }

    #[test]
    fn test_failed_wwid_markers() {
        let dir = tempfile::tempdir().unwrap();
        let markers = FailedWwidMarkers::new(dir.path().join("failed"));
        assert!(!markers.is_marked("W1"));
        markers.mark("W1").unwrap();
        assert!(markers.is_marked("W1"));
        markers.unmark("W1").unwrap();
        assert!(!markers.is_marked("W1"));
        // Unmarking an absent wwid is not an error.
        markers.unmark("W1").unwrap();
    }
}
