use std::{
    fs, io,
    path::{Path, PathBuf},
};

use pgsched_core::{PgschedError, Result};
use tracing::{debug, warn};

/// Exclusive PID file, removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current PID to `path`.
    ///
    /// Fails when the file names a process that is still alive; a stale or
    /// unreadable file is replaced.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match read_pid(path)? {
            Some(pid) if process_alive(pid) => {
                return Err(PgschedError::AlreadyRunning {
                    pid,
                    path: path.display().to_string(),
                });
            }
            Some(pid) => warn!(pid, path = %path.display(), "replacing stale pid file"),
            None => {}
        }
        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), "pid file written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "cannot remove pid file"),
        }
    }
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Liveness through procfs; without it every recorded PID counts as stale.
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
