//! Exclusive ownership of an output root, shared by every process on the host.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{JobError, Result};

pub const LOCK_FILE: &str = ".lock";

/// An advisory `flock` on `<output_root>/.lock`.
///
/// The lock belongs to the open file and is released when it is dropped, or when the process
/// dies.
#[derive(Debug)]
pub(crate) struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    /// Take the lock without blocking. Fails with `OutputRootLocked` while anyone else holds it.
    pub(crate) fn acquire(output_root: &Path) -> Result<Self> {
        let path = output_root.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // SAFETY: the descriptor stays open for the duration of the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => {
                    Err(JobError::OutputRootLocked(output_root.to_path_buf()))
                }
                _ => Err(err.into()),
            };
        }

        // the owner's pid, for whoever finds the root locked
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!("Locked {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        debug!("Releasing {} (fd {})", self.path.display(), self.file.as_raw_fd());
    }
}
