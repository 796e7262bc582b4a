//! Durable record of completed provisioning steps.
//!
//! One `KEY=value` line per key, owner-only permissions. Writing an existing
//! key removes the old line and appends the new one; the rewrite goes through
//! a temporary file and a rename so a crash never leaves two lines for a key.
//! Concurrent writers are excluded by the run lock (see [`crate::lock`]).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ProvisionError;
use crate::fs_abstraction::FileSystem;

pub const DEFAULT_STATE_FILE: &str = "/var/lib/bastion/state.conf";

/// Key/value store backed by a single file.
pub struct StateStore<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
}

impl<'a> StateStore<'a> {
    pub fn new(fs: &'a dyn FileSystem, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.fs.exists(&self.path) {
            return Ok(Vec::new());
        }
        let content = self
            .fs
            .read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {:?}", self.path))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    /// Most recently written value for `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let prefix = format!("{}=", key);
        Ok(self
            .read_lines()?
            .iter()
            .rev()
            .find_map(|line| line.strip_prefix(&prefix).map(str::to_string)))
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Replace any prior entry for `key` with `key=value`.
    ///
    /// Returns `false` without touching the file when the store already holds
    /// exactly this value.
    pub fn put(&self, key: &str, value: &str) -> Result<bool> {
        validate_key(key)?;
        if value.contains('\n') || value.contains('\r') {
            return Err(ProvisionError::State(format!(
                "Value for {} must be a single line",
                key
            ))
            .into());
        }

        let prefix = format!("{}=", key);
        let lines = self.read_lines()?;
        let existing: Vec<&String> = lines.iter().filter(|l| l.starts_with(&prefix)).collect();
        if existing.len() == 1 && existing[0][prefix.len()..] == *value {
            return Ok(false);
        }

        let mut kept: Vec<String> = lines
            .into_iter()
            .filter(|l| !l.starts_with(&prefix))
            .collect();
        kept.push(format!("{}{}", prefix, value));
        self.write_lines(&kept)?;
        debug!("State {}={}", key, value);
        Ok(true)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let prefix = format!("{}=", key);
        let lines = self.read_lines()?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|l| !l.starts_with(&prefix))
            .collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.write_lines(&kept)?;
        Ok(true)
    }

    /// All entries in file order.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .read_lines()?
            .iter()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect())
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !self.fs.exists(parent) {
                self.fs
                    .create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
                self.fs.set_permissions_mode(parent, 0o700)?;
            }
        }

        let mut content = lines.join("\n");
        content.push('\n');

        let tmp = self.path.with_extension("tmp");
        self.fs
            .write(&tmp, content.as_bytes())
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        self.fs.set_permissions_mode(&tmp, 0o600)?;
        self.fs
            .rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file {:?}", self.path))?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !ok {
        return Err(ProvisionError::State(format!(
            "Invalid state key '{}': use UPPER_SNAKE_CASE",
            key
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_abstraction::{real_fs, MockFileSystem};
    use std::io;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore<'static> {
        StateStore::new(real_fs(), dir.path().join("var/lib/bastion/state.conf"))
    }

    #[test]
    fn test_get_absent_before_first_write() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.get("HARDENING_COMPLETE").unwrap(), None);
        assert!(!store.exists("HARDENING_COMPLETE").unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_put_creates_owner_only_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.put("SSH_PORT", "2222").unwrap());

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.get("SSH_PORT").unwrap().as_deref(), Some("2222"));
    }

    #[test]
    fn test_repeated_puts_keep_one_line() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for value in ["22", "2222", "2200", "4422"] {
            store.put("SSH_PORT", value).unwrap();
            store.put("DEPLOY_USER", "deploy").unwrap();
        }

        assert_eq!(store.get("SSH_PORT").unwrap().as_deref(), Some("4422"));
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            content.lines().filter(|l| l.starts_with("SSH_PORT=")).count(),
            1
        );
        assert_eq!(
            content
                .lines()
                .filter(|l| l.starts_with("DEPLOY_USER="))
                .count(),
            1
        );
    }

    #[test]
    fn test_put_same_value_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.put("TIMEZONE", "UTC").unwrap());
        assert!(!store.put("TIMEZONE", "UTC").unwrap());
    }

    #[test]
    fn test_key_prefix_does_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("SSH_PORT", "22").unwrap();
        store.put("SSH_PORT_PREVIOUS", "2222").unwrap();
        store.put("SSH_PORT", "2200").unwrap();
        assert_eq!(
            store.get("SSH_PORT_PREVIOUS").unwrap().as_deref(),
            Some("2222")
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("CERTIFICATE_COMPLETE", "2026-01-01T00:00:00Z").unwrap();
        assert!(store.remove("CERTIFICATE_COMPLETE").unwrap());
        assert!(!store.remove("CERTIFICATE_COMPLETE").unwrap());
        assert!(store.get("CERTIFICATE_COMPLETE").unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_keys_and_values() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.put("ssh_port", "22").is_err());
        assert!(store.put("A=B", "22").is_err());
        assert!(store.put("KEY", "two\nlines").is_err());
    }

    #[test]
    fn test_write_failure_propagates() {
        let mut fs = MockFileSystem::new();
        fs.expect_exists().returning(|_| true);
        fs.expect_read_to_string().returning(|_| Ok(String::new()));
        fs.expect_write()
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::Other, "disk full")));

        let store = StateStore::new(&fs, "/var/lib/bastion/state.conf");
        let err = store.put("FIREWALL_COMPLETE", "now").unwrap_err();
        assert!(format!("{:#}", err).contains("disk full"));
    }
}
