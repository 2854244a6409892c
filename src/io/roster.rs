//! Identity roster loader
//!
//! Reads the enrolled identities from a JSON file and re-reads it on an
//! interval. Workers see the roster through a `watch` channel; a refresh that
//! fails keeps the previous snapshot in place.

use crate::domain::types::{EnrolledIdentity, Roster, SharedRoster};
use crate::infra::metrics::Metrics;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Load a roster file: a JSON array of `{ id, label, descriptor, banned }`
pub fn load_roster(path: impl AsRef<Path>) -> anyhow::Result<Roster> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read roster file {}", path.display()))?;
    let identities: Vec<EnrolledIdentity> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse roster file {}", path.display()))?;

    let dims = identities.first().map(|i| i.descriptor.len()).unwrap_or(0);
    if let Some(odd) = identities.iter().find(|i| i.descriptor.len() != dims) {
        warn!(
            identity_id = %odd.id,
            expected = %dims,
            actual = %odd.descriptor.len(),
            "roster_descriptor_dimension_mismatch"
        );
    }

    Ok(Roster::new(identities))
}

/// Load the roster at startup; a missing or bad file yields an empty roster
///
/// An empty roster is not an error: every face is unknown and falls through
/// to the deny path.
pub fn load_initial_roster(path: &str, metrics: &Metrics) -> SharedRoster {
    let roster = match load_roster(path) {
        Ok(roster) => {
            info!(file = %path, identities = %roster.len(), banned = %roster.banned_count(), "roster_loaded");
            roster
        }
        Err(e) => {
            warn!(file = %path, error = %format!("{:#}", e), "roster_load_failed_starting_empty");
            metrics.record_roster_refresh_failure();
            Roster::default()
        }
    };
    metrics.set_roster_size(roster.len());
    Arc::new(roster)
}

/// Periodically reloads the roster into a watch channel
pub struct RosterRefresher {
    path: PathBuf,
    every: Duration,
    tx: watch::Sender<SharedRoster>,
    metrics: Arc<Metrics>,
}

impl RosterRefresher {
    pub fn new(path: impl Into<PathBuf>, every: Duration, tx: watch::Sender<SharedRoster>, metrics: Arc<Metrics>) -> Self {
        Self { path: path.into(), every, tx, metrics }
    }

    /// Reload once; returns true if the snapshot was replaced
    pub fn refresh(&self) -> bool {
        self.apply(load_roster(&self.path))
    }

    /// Reload with the file read on the blocking pool
    pub async fn refresh_in_background(&self) -> bool {
        let path = self.path.clone();
        let loaded = match tokio::task::spawn_blocking(move || load_roster(&path)).await {
            Ok(loaded) => loaded,
            Err(e) => Err(anyhow::anyhow!("roster load task failed: {}", e)),
        };
        self.apply(loaded)
    }

    fn apply(&self, loaded: anyhow::Result<Roster>) -> bool {
        match loaded {
            Ok(roster) => {
                let size = roster.len();
                let previous = self.tx.borrow().len();
                self.tx.send_replace(Arc::new(roster));
                self.metrics.set_roster_size(size);
                if size != previous {
                    info!(identities = %size, previous = %previous, "roster_refreshed");
                }
                true
            }
            Err(e) => {
                self.metrics.record_roster_refresh_failure();
                warn!(file = %self.path.display(), error = %format!("{:#}", e), "roster_refresh_failed_keeping_previous");
                false
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the startup load already happened
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_in_background().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("roster_refresher_shutdown");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::IdentityId;
    use std::fs;
    use tempfile::tempdir;

    const ROSTER: &str = r#"[
        {"id": "alice", "label": "Alice", "descriptor": [0.1, 0.2], "banned": false},
        {"id": "mallory", "label": "Mallory", "descriptor": [0.9, 0.8], "banned": true}
    ]"#;

    #[test]
    fn test_load_roster() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.json");
        fs::write(&path, ROSTER).unwrap();

        let roster = load_roster(&path).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.banned_count(), 1);
        assert_eq!(roster.get(&IdentityId::from("alice")).unwrap().label, "Alice");
    }

    #[test]
    fn test_load_roster_rejects_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.json");
        fs::write(&path, r#"[{"id": "a", "descriptor": [0.1], "role": "admin"}]"#).unwrap();
        assert!(load_roster(&path).is_err());
    }

    #[test]
    fn test_missing_roster_starts_empty() {
        let metrics = Metrics::new();
        let roster = load_initial_roster("/nonexistent/roster.json", &metrics);
        assert!(roster.is_empty());
        assert_eq!(metrics.report().roster_refresh_failures, 1);
    }

    #[test]
    fn test_failed_refresh_keeps_previous_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.json");
        fs::write(&path, ROSTER).unwrap();

        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = watch::channel(Arc::new(Roster::default()));
        let refresher = RosterRefresher::new(&path, Duration::from_secs(60), tx, metrics.clone());

        assert!(refresher.refresh());
        assert_eq!(rx.borrow().len(), 2);

        fs::write(&path, "{ truncated").unwrap();
        assert!(!refresher.refresh());
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(metrics.report().roster_refresh_failures, 1);
    }

    #[tokio::test]
    async fn test_background_refresh_replaces_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.json");
        fs::write(&path, ROSTER).unwrap();

        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = watch::channel(Arc::new(Roster::default()));
        let refresher = RosterRefresher::new(&path, Duration::from_secs(60), tx, metrics.clone());

        assert!(refresher.refresh_in_background().await);
        assert_eq!(rx.borrow().len(), 2);

        fs::remove_file(&path).unwrap();
        assert!(!refresher.refresh_in_background().await);
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(metrics.report().roster_refresh_failures, 1);
    }

    #[test]
    fn test_refresh_picks_up_new_ban() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roster.json");
        fs::write(&path, ROSTER).unwrap();

        let (tx, rx) = watch::channel(Arc::new(Roster::default()));
        let refresher = RosterRefresher::new(&path, Duration::from_secs(60), tx, Arc::new(Metrics::new()));
        refresher.refresh();
        assert!(!rx.borrow().get(&IdentityId::from("alice")).unwrap().banned);

        fs::write(&path, ROSTER.replace("\"banned\": false", "\"banned\": true")).unwrap();
        refresher.refresh();
        assert!(rx.borrow().get(&IdentityId::from("alice")).unwrap().banned);
    }
}
