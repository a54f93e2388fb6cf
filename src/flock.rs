//! Advisory lock on `<db>/LOCK`, held for as long as the database is open.

use crate::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Lock `path`, creating it if needed, and record our pid in it.
    /// Fails with `Locked` while another handle holds the lock.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = Self::try_lock(&file) {
            return Err(match e.kind() {
                io::ErrorKind::WouldBlock => StorageError::Locked(path.display().to_string()),
                _ => StorageError::Io(e),
            });
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(DirLock { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
