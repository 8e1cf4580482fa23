use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use sweep_core::ensure_dir;

use crate::StoreError;

/// Host-visible mutual exclusion shared by every worker process of a study.
///
/// Acquisition creates the lock file exclusively and records the holder's pid
/// and acquisition time; release removes the file on drop, so the lock is
/// freed on every exit path of the critical section.
#[derive(Debug)]
pub struct StudyLock {
    path: PathBuf,
}

impl StudyLock {
    /// Acquire the named lock, polling until `max_wait` elapses. A lock that
    /// cannot be obtained within the bound is fatal to the run.
    pub fn acquire(path: &Path, max_wait: Duration) -> Result<StudyLock, StoreError> {
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let deadline = Instant::now() + max_wait;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    let payload = format!(
                        "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    let _ = file.write_all(payload.as_bytes());
                    let _ = file.sync_all();
                    return Ok(StudyLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_secs: max_wait.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for StudyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
