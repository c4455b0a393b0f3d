//! Atomic JSON-file persistence primitives.
//!
//! Every on-disk store in the gateway (session meta, pairing requests, tool
//! context artifacts, conversation history) follows the same pattern: read
//! is parse-or-empty, write is serialize → write `<path>.tmp` → rename over
//! the target. Credential-shaped stores additionally keep a `.bak` copy and
//! restore from it when the primary file is missing or corrupt.

use std::fs;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Read and parse a JSON file. Returns `default` if the file does not exist.
/// Propagates I/O errors other than "not found".
pub fn read_json_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match fs::read_to_string(path) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                return Ok(T::default());
            }
            serde_json::from_str(&raw).map_err(Error::Json)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Serialize `value` and atomically replace `path`: write to `<path>.tmp`
/// in the same directory, then rename. A crash mid-write never leaves a
/// readable-but-truncated file at `path`.
pub fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let body = serde_json::to_string_pretty(value).map_err(Error::Json)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, body.as_bytes()).map_err(Error::Io)?;
    fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    match path.parent() {
        Some(parent) => parent.join(name),
        None => std::path::PathBuf::from(name),
    }
}

fn bak_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    match path.parent() {
        Some(parent) => parent.join(name),
        None => std::path::PathBuf::from(name),
    }
}

/// Write `value` atomically, and if the *current* on-disk file parses as
/// valid JSON, copy it to `<path>.bak` first. Used for credential-shaped
/// stores (pairing requests, session meta) where silent corruption is worse
/// than losing the newest write.
pub fn write_json_atomic_with_backup<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    if let Ok(existing) = fs::read_to_string(path) {
        if serde_json::from_str::<serde_json::Value>(&existing).is_ok() {
            let _ = fs::copy(path, bak_path(path));
        }
    }
    write_json_atomic(path, value)
}

/// Read a credential-shaped JSON file, falling back to `<path>.bak` if the
/// primary file is missing or fails to parse, and finally to `T::default()`
/// if both are absent or corrupt.
pub fn read_json_with_backup<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(v) = serde_json::from_str(&raw) {
            return v;
        }
        tracing::warn!(path = %path.display(), "primary store corrupt, trying backup");
    }
    let bak = bak_path(path);
    if let Ok(raw) = fs::read_to_string(&bak) {
        if let Ok(v) = serde_json::from_str(&raw) {
            tracing::info!(path = %bak.display(), "restored store from backup");
            return v;
        }
    }
    T::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn read_missing_file_returns_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let v: Sample = read_json_or_default(&path).unwrap();
        assert_eq!(v, Sample::default());
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        write_json_atomic(&path, &Sample { n: 7 }).unwrap();
        let v: Sample = read_json_or_default(&path).unwrap();
        assert_eq!(v, Sample { n: 7 });
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn backup_restores_on_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cred.json");
        write_json_atomic_with_backup(&path, &Sample { n: 1 }).unwrap();
        write_json_atomic_with_backup(&path, &Sample { n: 2 }).unwrap();
        // Corrupt the primary file; .bak should still hold the n=1 write.
        fs::write(&path, b"not json").unwrap();
        let v: Sample = read_json_with_backup(&path);
        assert_eq!(v, Sample { n: 1 });
    }

    #[test]
    fn backup_defaults_when_both_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.json");
        let v: Sample = read_json_with_backup(&path);
        assert_eq!(v, Sample::default());
    }
}
