//! Picks the one worker process per host that runs the broker session.
//!
//! An MQTT session cannot be shared between forked workers, and two
//! subscribers would both receive every reading and race on the shared row.
//! The owner holds an exclusive advisory lock on a well-known file for its
//! whole lifetime; the OS drops the lock if the owner dies, so a fresh
//! worker can take over.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct OwnerLock {
    file: File,
    path: PathBuf,
}

impl OwnerLock {
    /// `Ok(None)` means another process holds the lock, which is the normal
    /// state for every worker but one.
    pub fn try_acquire(path: impl AsRef<Path>) -> io::Result<Option<OwnerLock>> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(e)) => return Err(e),
        }

        // Only the holder rewrites the file, so readers of the pid see the owner.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        debug!("Acquired MQTT owner lock {}", path.display());
        Ok(Some(OwnerLock {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        if let Err(e) = self.file.unlock() {
            warn!("Error releasing MQTT lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released MQTT owner lock {}", self.path.display());
        }
    }
}
