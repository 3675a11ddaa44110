//! Health snapshot
//!
//! A JSON file rewritten every snapshot interval for external liveness
//! probes and stale-lock detection. Writes go to a sibling temp file and
//! are renamed into place so readers never see a partial document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::{Capacity, Dispatcher};

/// Contents of the health file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Writer's PID
    pub pid: u32,
    /// Live sessions
    pub sessions: usize,
    /// Calls holding a global permit
    pub inflight: usize,
    /// Configured caps
    pub capacity: Capacity,
    /// Seconds since the dispatcher started
    pub uptime_secs: f64,
}

impl HealthSnapshot {
    /// Current state of `dispatcher`
    pub fn capture(dispatcher: &Dispatcher) -> Self {
        Self {
            timestamp: Utc::now(),
            pid: std::process::id(),
            sessions: dispatcher.sessions().count(),
            inflight: dispatcher.admission().inflight(),
            capacity: dispatcher.admission().capacity(),
            uptime_secs: dispatcher.uptime().as_secs_f64(),
        }
    }

    /// Write atomically to `path`
    ///
    /// # Errors
    ///
    /// Filesystem or encoding failures.
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Read a snapshot written by [`HealthSnapshot::write`]
    ///
    /// # Errors
    ///
    /// Missing file or invalid JSON.
    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Time since the snapshot was taken; zero if it is from the future
    pub fn age(&self) -> Duration {
        (Utc::now() - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the snapshot is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }

    #[cfg(test)]
    pub(crate) fn for_test(age_secs: i64) -> Self {
        Self {
            timestamp: Utc::now() - chrono::Duration::seconds(age_secs),
            pid: std::process::id(),
            sessions: 0,
            inflight: 0,
            capacity: Capacity {
                global: 1,
                provider: 1,
                session: 1,
            },
            uptime_secs: 0.0,
        }
    }
}

/// Whether the snapshot at `path` is too old to vouch for its writer
///
/// A missing or unreadable snapshot counts as stale.
pub async fn snapshot_is_stale(path: &Path, max_age: Duration) -> bool {
    match HealthSnapshot::read(path).await {
        Ok(snapshot) => snapshot.is_stale(max_age),
        Err(e) => {
            debug!(path = ?path, error = %e, "No usable health snapshot");
            true
        }
    }
}

/// Periodically write the snapshot and purge expired cached results
pub fn spawn_snapshot_task(dispatcher: Arc<Dispatcher>, path: PathBuf, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let purged = dispatcher.purge_results();
            if purged > 0 {
                debug!(purged, "Purged expired results");
            }
            let snapshot = HealthSnapshot::capture(&dispatcher);
            if let Err(e) = snapshot.write(&path).await {
                warn!(error = %e, path = ?path, "Failed to write health snapshot");
            }
        }
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
