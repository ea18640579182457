//! # Aggregate State Store
//!
//! Pattern counters persisted as a single JSON file with a `.backup`
//! sibling holding the previous durable version. Assumes a single writer
//! per file path; writes within the process are serialized.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::model::LogRecord;
use crate::types::{Error, ErrorKind, Result};

/// Configuration for the state store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Primary state file
    pub state_file: PathBuf,
    /// Serialized states larger than this are not written
    pub max_state_file_size: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("data/classifier-state.json"),
            max_state_file_size: 5 * 1024 * 1024,
        }
    }
}

/// Durable aggregate counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub pattern_counts: BTreeMap<String, u64>,
    pub total_classifications: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            pattern_counts: BTreeMap::new(),
            total_classifications: 0,
            last_updated: Utc::now(),
        }
    }
}

impl PersistedState {
    /// Folds a batch of records into the counters
    pub fn merge(&mut self, records: &[LogRecord]) {
        for record in records {
            *self.pattern_counts.entry(record.pattern_key()).or_insert(0) += 1;
        }
        self.total_classifications += records.len() as u64;
        self.last_updated = Utc::now();
    }
}

/// Result of an [`StateStore::apply_batch`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New state written and verified
    Persisted(PersistedState),
    /// Serialized state exceeded the size cap; durable state left as it was
    SkippedTooLarge { size: usize },
}

/// What was found at the primary state path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrimaryFile {
    Intact,
    Missing,
    Unusable,
}

/// Crash-safe store for [`PersistedState`]
#[derive(Debug)]
pub struct StateStore {
    config: StateConfig,
    backup_path: PathBuf,
    tmp_path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(config: StateConfig) -> Self {
        let backup_path = sibling(&config.state_file, "backup");
        let tmp_path = sibling(&config.state_file, "tmp");
        Self {
            config,
            backup_path,
            tmp_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.config.state_file
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Reads the durable state; missing or corrupt files read as defaults
    pub async fn load(&self) -> PersistedState {
        self.read_primary().await.0
    }

    async fn read_primary(&self) -> (PersistedState, PrimaryFile) {
        match fs::read(&self.config.state_file).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => (state, PrimaryFile::Intact),
                Err(e) => {
                    warn!(
                        path = %self.config.state_file.display(),
                        error = %e,
                        "State file corrupt, resetting to defaults"
                    );
                    (PersistedState::default(), PrimaryFile::Unusable)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (PersistedState::default(), PrimaryFile::Missing)
            }
            Err(e) => {
                warn!(
                    path = %self.config.state_file.display(),
                    error = %e,
                    "State file unreadable, using defaults"
                );
                (PersistedState::default(), PrimaryFile::Unusable)
            }
        }
    }

    /// Merges a batch into the durable state and persists it
    pub async fn apply_batch(&self, records: &[LogRecord]) -> Result<ApplyOutcome> {
        let _guard = self.write_lock.lock().await;

        let (mut state, primary) = self.read_primary().await;
        state.merge(records);

        // Only a primary that parsed may replace the last-known-good backup
        if primary == PrimaryFile::Intact {
            self.backup_current().await;
        }

        let bytes = serde_json::to_vec_pretty(&state)?;
        if bytes.len() > self.config.max_state_file_size {
            warn!(
                size = bytes.len(),
                limit = self.config.max_state_file_size,
                "Serialized state exceeds size limit, keeping previous state"
            );
            return Ok(ApplyOutcome::SkippedTooLarge { size: bytes.len() });
        }

        if let Err(e) = self.write_and_verify(&bytes, &state).await {
            error!(
                path = %self.config.state_file.display(),
                error = %e,
                "State write failed verification, restoring backup"
            );
            self.restore_backup().await;
            return Err(e);
        }

        debug!(
            total = state.total_classifications,
            patterns = state.pattern_counts.len(),
            "State persisted"
        );
        Ok(ApplyOutcome::Persisted(state))
    }

    /// Best-effort copy of the current durable file to the backup slot
    async fn backup_current(&self) {
        match fs::copy(&self.config.state_file, &self.backup_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to back up state file"),
        }
    }

    async fn write_and_verify(&self, bytes: &[u8], expected: &PersistedState) -> Result<()> {
        if let Some(parent) = self.config.state_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(&self.tmp_path, bytes).await?;
        fs::rename(&self.tmp_path, &self.config.state_file).await?;

        let written = fs::read(&self.config.state_file).await?;
        let reparsed: PersistedState = serde_json::from_slice(&written)?;
        if &reparsed != expected {
            return Err(Error::new(
                ErrorKind::Storage,
                "state file contents differ from what was written",
            ));
        }
        Ok(())
    }

    async fn restore_backup(&self) {
        match fs::copy(&self.backup_path, &self.config.state_file).await {
            Ok(_) => info!(path = %self.config.state_file.display(), "State restored from backup"),
            Err(e) => error!(
                error = %e,
                "Backup restore failed, state will reset to defaults on next read"
            ),
        }
    }
}

/// `state.json` -> `state.json.{suffix}`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision_tree;
    use crate::model::ErrorContext;

    fn record(status: u16) -> LogRecord {
        let ctx = ErrorContext {
            http_status: Some(status),
            ..Default::default()
        };
        LogRecord::classified(ctx, decision_tree::classify(Some(status), None))
    }

    fn store(dir: &Path, max_size: usize) -> StateStore {
        StateStore::new(StateConfig {
            state_file: dir.join("state.json"),
            max_state_file_size: max_size,
        })
    }

    #[test]
    fn test_sibling_paths() {
        assert_eq!(sibling(Path::new("/a/state.json"), "backup"), PathBuf::from("/a/state.json.backup"));
    }

    #[tokio::test]
    async fn test_apply_batch_counts_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024 * 1024);

        store.apply_batch(&[record(429), record(429), record(503)]).await.unwrap();
        store.apply_batch(&[record(503)]).await.unwrap();

        let state = store.load().await;
        assert_eq!(state.total_classifications, 4);
        assert_eq!(state.pattern_counts["429_RATE_LIMIT"], 2);
        assert_eq!(state.pattern_counts["503_SERVICE_UNAVAILABLE"], 2);

        // The backup holds the version before the last write
        let backup: PersistedState =
            serde_json::from_slice(&std::fs::read(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup.total_classifications, 3);
    }

    #[tokio::test]
    async fn test_corrupt_file_resets_before_apply() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024 * 1024);
        std::fs::write(store.path(), b"{ this is not json").unwrap();

        let outcome = store.apply_batch(&[record(500), record(404)]).await.unwrap();
        let ApplyOutcome::Persisted(state) = outcome else {
            panic!("expected persisted state");
        };
        assert_eq!(state.total_classifications, 2);
        assert_eq!(state.pattern_counts.len(), 2);
        assert_eq!(store.load().await, state);
    }

    #[tokio::test]
    async fn test_oversized_state_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let big = store(dir.path(), 1024 * 1024);
        big.apply_batch(&[record(429)]).await.unwrap();

        let small = store(dir.path(), 16);
        let outcome = small.apply_batch(&[record(429)]).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::SkippedTooLarge { .. }));
        assert_eq!(small.load().await.total_classifications, 1);
    }

    fn read_state(path: &Path) -> PersistedState {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_corrupt_primary_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024 * 1024);
        store.apply_batch(&[record(429)]).await.unwrap();
        store.apply_batch(&[record(429)]).await.unwrap();
        assert_eq!(read_state(store.backup_path()).total_classifications, 1);

        std::fs::write(store.path(), b"{ torn write").unwrap();
        store.apply_batch(&[record(503)]).await.unwrap();

        let backup = read_state(store.backup_path());
        assert_eq!(backup.total_classifications, 1);
        assert_eq!(backup.pattern_counts["429_RATE_LIMIT"], 1);
        assert_eq!(store.load().await.total_classifications, 1);
    }

    #[tokio::test]
    async fn test_failed_write_restores_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1024 * 1024);
        store.apply_batch(&[record(429)]).await.unwrap();
        store.apply_batch(&[record(503)]).await.unwrap();

        // A directory squatting on the temp path makes the write fail
        std::fs::create_dir(sibling(store.path(), "tmp")).unwrap();

        let result = store.apply_batch(&[record(409)]).await;
        assert!(result.is_err());

        let primary = read_state(store.path());
        assert_eq!(primary, read_state(store.backup_path()));
        assert_eq!(primary.total_classifications, 2);
        assert!(!primary.pattern_counts.contains_key("409_CONFLICT"));
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir.path().join("nested"), 1024);
        let state = store.load().await;
        assert_eq!(state.total_classifications, 0);
        assert!(state.pattern_counts.is_empty());
    }
}
