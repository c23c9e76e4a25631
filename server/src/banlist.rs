//! Banned-IP list backed by a sidecar file
//!
//! The file is newline-delimited IPs and read-only from the server's
//! perspective; a poll task re-reads it whenever its mtime changes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use rustc_hash::FxHashSet;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Poll cadence for mtime changes, ms
const POLL_INTERVAL_MS: u64 = 5_000;

/// Set of banned client IPs, reloaded from disk on change
pub struct BanList {
    path: PathBuf,
    ips: RwLock<FxHashSet<String>>,
    last_modified: Mutex<Option<SystemTime>>,
}

impl BanList {
    /// Create a ban list over `path`; a missing file means nobody is
    /// banned
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ips: RwLock::new(FxHashSet::default()),
            last_modified: Mutex::new(None),
        }
    }

    /// Whether `ip` is banned
    pub async fn contains(&self, ip: &str) -> bool {
        self.ips.read().await.contains(ip)
    }

    /// Number of banned IPs
    pub async fn len(&self) -> usize {
        self.ips.read().await.len()
    }

    /// Whether the list is empty
    pub async fn is_empty(&self) -> bool {
        self.ips.read().await.is_empty()
    }

    /// Re-read the file if its mtime moved; returns whether a reload
    /// happened
    pub async fn reload_if_changed(&self) -> Result<bool> {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(_) => {
                // Absent file: treat as an empty list.
                let mut ips = self.ips.write().await;
                if !ips.is_empty() {
                    info!("ban file removed, clearing {} entries", ips.len());
                    ips.clear();
                }
                *self.last_modified.lock().await = None;
                return Ok(false);
            }
        };

        let mut last = self.last_modified.lock().await;
        if *last == modified && last.is_some() {
            return Ok(false);
        }
        *last = modified;
        drop(last);

        let content = tokio::fs::read_to_string(&self.path).await?;
        let parsed: FxHashSet<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let count = parsed.len();
        *self.ips.write().await = parsed;
        info!("loaded {} banned IPs from {}", count, self.path.display());
        Ok(true)
    }
}

/// Keep a ban list fresh until shutdown
pub async fn watch_task(banlist: Arc<BanList>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_millis(POLL_INTERVAL_MS));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = banlist.reload_if_changed().await {
                    warn!("failed to reload ban list: {}", e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("ban list watcher stopped");
}
