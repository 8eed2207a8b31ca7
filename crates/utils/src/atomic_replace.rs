//! Atomic whole-file replacement: write to a sibling temporary file, fsync,
//! then rename over the target. Used by every on-disk store that needs a
//! `replace_all` operation that readers never observe torn.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Replace the contents of `path` atomically with `contents`.
///
/// The temporary file is created in the same directory as `path` so the
/// final `rename` is guaranteed to be on the same filesystem.
pub fn atomic_replace(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    tmp.write_all(contents)
        .context("writing temporary file contents")?;
    tmp.as_file_mut()
        .sync_all()
        .context("fsyncing temporary file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming temporary file over {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_atomic_replace_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        std::fs::write(&path, b"old contents\n").unwrap();
        atomic_replace(&path, b"new contents\n").unwrap();
        let read = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read, "new contents\n");
    }

    #[test]
    fn test_atomic_replace_creates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh-store");
        atomic_replace(&path, b"hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }
}
