//! On-disk layout under `<workdir>/.mergeloop/`.
//!
//! Nothing here is read back to resume a run; run directories hold event logs
//! and final reports for operators.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".mergeloop";

pub fn state_dir(workdir: &Path) -> PathBuf {
    workdir.join(STATE_DIR)
}

/// `<workdir>/.mergeloop/runs/<run_name>/`
pub fn run_dir(workdir: &Path, run_name: &str) -> PathBuf {
    state_dir(workdir).join("runs").join(run_name)
}

/// Write via a temp file in the same directory, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

/// Pretty JSON report, written atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    write_atomic(path, data.as_bytes()).with_context(|| format!("saving {}", path.display()))
}

/// Exclusive lock on `.mergeloop/orchestrate.lock`, so only one process
/// merges into a working directory's repository at a time.
/// Released when dropped.
pub struct OrchestrateLock {
    _file: File,
    path: PathBuf,
}

impl OrchestrateLock {
    /// Non-blocking: fails at once if another process holds the lock.
    pub fn acquire(workdir: &Path) -> Result<Self> {
        let dir = state_dir(workdir);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("orchestrate.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("cannot open lock file {}", path.display()))?;
        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "another orchestration is running ({})",
                path.display()
            )
        })?;
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dir_layout() {
        let p = run_dir(Path::new("/repo"), "autofix-42");
        assert!(p.ends_with(".mergeloop/runs/autofix-42"));
    }

    #[test]
    fn write_atomic_creates_parents_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a/b/report.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn save_json_is_pretty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("r.json");
        save_json(&path, &serde_json::json!({"result": "MERGED"})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"result\": \"MERGED\""));
    }

    #[test]
    fn orchestrate_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = OrchestrateLock::acquire(tmp.path()).unwrap();
        assert!(lock.path().exists());
        assert!(OrchestrateLock::acquire(tmp.path()).is_err());
        drop(lock);
        let _again = OrchestrateLock::acquire(tmp.path()).unwrap();
    }
}
