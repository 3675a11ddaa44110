//! Single-instance PID lock
//!
//! The lock file holds the owner's PID. It is created with `create_new`, so
//! two starts never both win. A lock left by a process that is gone, no
//! longer listening, or no longer refreshing its health snapshot counts as
//! abandoned and is cleared once.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{info, warn};

use super::snapshot::snapshot_is_stale;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lock acquisition failures
#[derive(Debug, Error)]
pub enum LockError {
    /// A live instance holds the lock
    #[error("another gateway is already running (pid {pid}); stop it or remove {path:?}")]
    AlreadyRunning {
        /// Owner recorded in the lock file
        pid: u32,
        /// Lock file
        path: PathBuf,
    },

    /// The lock file could not be created, read or removed
    #[error("lock file {path:?}: {source}")]
    Io {
        /// Lock file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// What an existing lock is checked against
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    /// `host:port` the owner should be listening on
    pub addr: String,
    /// Health snapshot the owner should be refreshing
    pub health_path: PathBuf,
    /// Snapshot age beyond which the owner is presumed dead
    pub stale_after: Duration,
}

/// Held PID lock, released on drop
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    pid: u32,
}

impl ProcessLock {
    /// Take the lock at `path`, clearing an abandoned one
    ///
    /// # Errors
    ///
    /// [`LockError::AlreadyRunning`] when the current owner passes `probe`;
    /// [`LockError::Io`] on filesystem failures.
    pub async fn acquire(path: &Path, probe: &LivenessProbe) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(path, source))?;
        }

        match Self::create(path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(io_error(path, source)),
        }

        let owner = read_pid(path);
        if let Some(pid) = owner {
            if !is_abandoned(pid, probe).await {
                return Err(LockError::AlreadyRunning {
                    pid,
                    path: path.to_path_buf(),
                });
            }
        }

        warn!(path = ?path, owner = ?owner, "Clearing abandoned lock");
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(path, source)),
        }

        Self::create(path).map_err(|source| match source.kind() {
            // Lost the race to another starting instance
            std::io::ErrorKind::AlreadyExists => LockError::AlreadyRunning {
                pid: read_pid(path).unwrap_or(0),
                path: path.to_path_buf(),
            },
            _ => io_error(path, source),
        })
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let pid = std::process::id();
        writeln!(file, "{pid}")?;
        info!(pid, path = ?path, "Lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// Lock file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Leave a lock that was cleared and retaken by someone else
        if read_pid(&self.path) != Some(self.pid) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => info!(path = ?self.path, "Lock released"),
            Err(e) => warn!(error = %e, path = ?self.path, "Failed to remove lock file"),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LockError {
    LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

async fn is_abandoned(pid: u32, probe: &LivenessProbe) -> bool {
    if !process_alive(pid) {
        info!(pid, "Lock owner is not running");
        return true;
    }
    let reachable = matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(probe.addr.as_str())).await,
        Ok(Ok(_))
    );
    if !reachable {
        info!(pid, addr = %probe.addr, "Lock owner is not listening");
        return true;
    }
    if snapshot_is_stale(&probe.health_path, probe.stale_after).await {
        info!(pid, path = ?probe.health_path, "Lock owner's health snapshot is stale");
        return true;
    }
    false
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks existence; EPERM still means alive
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::snapshot::HealthSnapshot;
    use tokio::net::TcpListener;

    fn probe(dir: &Path, addr: String) -> LivenessProbe {
        LivenessProbe {
            addr,
            health_path: dir.join("health.json"),
            stale_after: Duration::from_secs(60),
        }
    }

    async fn unused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("gateway.pid");
        let probe = probe(dir.path(), unused_addr().await);

        let lock = ProcessLock::acquire(&path, &probe).await.unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_owner_blocks_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let probe = probe(dir.path(), listener.local_addr().unwrap().to_string());
        HealthSnapshot::for_test(0).write(&probe.health_path).await.unwrap();

        let _held = ProcessLock::acquire(&path, &probe).await.unwrap();
        let err = ProcessLock::acquire(&path, &probe).await.unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { pid, .. } if pid == std::process::id()));
    }

    #[tokio::test]
    async fn test_unreachable_port_clears_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");
        let probe = probe(dir.path(), unused_addr().await);
        HealthSnapshot::for_test(0).write(&probe.health_path).await.unwrap();
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let lock = ProcessLock::acquire(&path, &probe).await.unwrap();
        assert_eq!(lock.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_stale_snapshot_clears_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let probe = probe(dir.path(), listener.local_addr().unwrap().to_string());
        HealthSnapshot::for_test(600).write(&probe.health_path).await.unwrap();
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        assert!(ProcessLock::acquire(&path, &probe).await.is_ok());
    }

    #[tokio::test]
    async fn test_garbage_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.pid");
        fs::write(&path, "not a pid").unwrap();
        let probe = probe(dir.path(), unused_addr().await);

        assert!(ProcessLock::acquire(&path, &probe).await.is_ok());
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
