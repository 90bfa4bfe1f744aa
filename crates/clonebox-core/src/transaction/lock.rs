//! Advisory per-target locking so at most one transaction runs against a
//! given target name at a time (spec §4.6, §5). A plain `flock(2)` on a
//! marker file under the journal directory, released on drop.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use crate::error::{Error, Result};

pub struct TargetLock {
    file: File,
    path: PathBuf,
}

impl TargetLock {
    pub async fn acquire(journal_dir: &str, target_name: &str) -> Result<Self> {
        let path = std::path::Path::new(journal_dir).join(format!(".{target_name}.lock"));
        let target_name = target_name.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .map_err(Error::Io)?;
            // SAFETY: `file` stays open for the lifetime of the returned
            // `TargetLock`; the lock releases when its fd is closed.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                return Err(Error::PreconditionFailed(format!(
                    "a transaction is already in progress for target {target_name}"
                )));
            }
            Ok(TargetLock { file, path })
        })
        .await
        .map_err(|e| Error::Internal(format!("lock task panicked: {e}")))?
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        let _ = std::fs::remove_file(&self.path);
    }
}
