//! File-based locking for shared on-disk state.
//!
//! Builds take a shared lock on the store root for their duration; GC
//! takes an exclusive one. The git object pool serializes writers the
//! same way. Locks are advisory flocks released on drop.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "{root} is locked by another process: {command} (PID {pid}, started at unix {started_at_unix})\n\
     If you're sure no hashdist process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    root: PathBuf,
    command: String,
    pid: u32,
    started_at_unix: u64,
    lock_path: PathBuf,
  },

  #[error(
    "{root} is locked (could not read lock metadata)\n\
     If you're sure no hashdist process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { root: PathBuf, lock_path: PathBuf },

  #[error("failed to create {0}: {1}")]
  CreateDir(PathBuf, #[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// An acquired lock over a directory. Held until dropped.
pub struct StoreLock {
  _file: File,
  lock_path: PathBuf,
}

impl StoreLock {
  /// Acquire a lock over `root`, creating it if needed. Non-blocking:
  /// contention is an immediate error carrying the holder's metadata.
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, LockError> {
    let lock_path = root.join(LOCK_FILENAME);

    if !root.exists() {
      std::fs::create_dir_all(root).map_err(|e| LockError::CreateDir(root.to_path_buf(), e))?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(LockError::OpenFile)?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(Self::read_contention_error(root, &lock_path));
      }
      return Err(LockError::LockFailed(err));
    }

    if mode == LockMode::Exclusive {
      Self::write_metadata(&file, command, root)?;
    }

    Ok(StoreLock { _file: file, lock_path })
  }

  fn write_metadata(file: &File, command: &str, root: &Path) -> Result<(), LockError> {
    let metadata = LockMetadata {
      version: 1,
      pid: std::process::id(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      command: command.to_string(),
      root: root.to_path_buf(),
    };

    file.set_len(0).map_err(LockError::WriteMetadata)?;
    let mut writer = io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &metadata)
      .map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
    writer.flush().map_err(LockError::WriteMetadata)?;

    Ok(())
  }

  fn read_contention_error(root: &Path, lock_path: &Path) -> LockError {
    if let Ok(mut file) = File::open(lock_path) {
      let mut contents = String::new();
      if file.read_to_string(&mut contents).is_ok()
        && let Ok(metadata) = serde_json::from_str::<LockMetadata>(&contents)
      {
        return LockError::Contention {
          root: root.to_path_buf(),
          command: metadata.command,
          pid: metadata.pid,
          started_at_unix: metadata.started_at_unix,
          lock_path: lock_path.to_path_buf(),
        };
      }
    }

    LockError::ContentionUnknown {
      root: root.to_path_buf(),
      lock_path: lock_path.to_path_buf(),
    }
  }

  /// Reads the lock metadata from the held file handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    use std::io::{Seek, SeekFrom};

    let mut file = &self._file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn acquire_exclusive_lock() {
    let temp = TempDir::new().unwrap();
    let lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "test").unwrap();
    assert!(lock.lock_path().exists());
  }

  #[test]
  fn multiple_shared_locks_coexist() {
    let temp = TempDir::new().unwrap();
    let lock1 = StoreLock::acquire(temp.path(), LockMode::Shared, "build-1").unwrap();
    let lock2 = StoreLock::acquire(temp.path(), LockMode::Shared, "build-2").unwrap();
    assert!(lock1.lock_path().exists());
    assert!(lock2.lock_path().exists());
  }

  #[test]
  fn exclusive_lock_metadata_written() {
    let temp = TempDir::new().unwrap();
    let lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "gc").unwrap();

    let metadata = lock.read_metadata().unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.command, "gc");
    assert_eq!(metadata.pid, std::process::id());
  }

  #[test]
  fn lock_released_on_drop() {
    let temp = TempDir::new().unwrap();
    {
      let _lock = StoreLock::acquire(temp.path(), LockMode::Exclusive, "first").unwrap();
    }
    let lock2 = StoreLock::acquire(temp.path(), LockMode::Exclusive, "second").unwrap();
    assert!(lock2.lock_path().exists());
  }

  #[test]
  fn missing_root_is_created() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("store");
    let _lock = StoreLock::acquire(&root, LockMode::Shared, "build").unwrap();
    assert!(root.is_dir());
  }
}
