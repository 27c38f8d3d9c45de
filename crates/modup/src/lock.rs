use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another updater is already running")]
    AlreadyRunning,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive hold on the install tree; released when dropped.
pub struct UpdaterLock {
    _file: File,
}

impl UpdaterLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| LockError::io("failed to create lock directory", error))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|error| LockError::io("failed to open updater lock file", error))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LockError::AlreadyRunning);
            }
            Err(error) => return Err(LockError::io("failed to acquire updater lock", error)),
        }

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|error| LockError::io("failed to write updater lock owner", error))?;

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::{LockError, UpdaterLock};

    #[test]
    fn second_acquire_reports_running_updater() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("data").join("updater.lock");

        let held = UpdaterLock::acquire(&path).expect("first lock should be acquired");
        assert!(matches!(
            UpdaterLock::acquire(&path),
            Err(LockError::AlreadyRunning)
        ));

        drop(held);
        assert!(UpdaterLock::acquire(&path).is_ok());
    }

    #[cfg(not(windows))]
    #[test]
    fn lock_file_records_owner_pid() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("updater.lock");

        let _held = UpdaterLock::acquire(&path).expect("lock should be acquired");

        assert_eq!(
            std::fs::read_to_string(&path).expect("lock file should be readable"),
            format!("{}\n", std::process::id())
        );
    }
}
