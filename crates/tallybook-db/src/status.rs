//! Durable record of the last legacy migration attempt.
//!
//! Purely diagnostic: nothing in the bootstrap path branches on these values
//! except to report them.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tallybook_core::{MigrationStatus, PreferenceResult, PreferenceStore, Timestamp};

/// Preference key for the migration outcome.
pub const STATUS_KEY: &str = "migration.status";
/// Preference key for the backup directory.
pub const BACKUP_DIR_KEY: &str = "migration.backup_dir";
/// Preference key for the time of the last attempt.
pub const LAST_ATTEMPT_KEY: &str = "migration.last_attempt";

/// Snapshot of the migration record for support tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Outcome of the last attempt.
    pub status: MigrationStatus,
    /// Directory holding the pre-migration backup, if one was made.
    pub backup_dir: Option<PathBuf>,
    /// When the last attempt ran.
    pub last_attempt: Option<Timestamp>,
}

/// Key-value store for [`MigrationStatus`] and the backup location.
#[derive(Clone)]
pub struct MigrationStatusStore {
    prefs: Arc<dyn PreferenceStore>,
}

impl std::fmt::Debug for MigrationStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStatusStore").finish_non_exhaustive()
    }
}

impl MigrationStatusStore {
    /// Create a store over `prefs`.
    pub fn new(prefs: Arc<dyn PreferenceStore>) -> Self {
        Self { prefs }
    }

    /// Overwrite the recorded status.
    pub fn set_status(&self, status: MigrationStatus) -> PreferenceResult<()> {
        self.prefs.set(STATUS_KEY, status.as_str())
    }

    /// Recorded status, `None` when unset or unreadable.
    pub fn get_status(&self) -> PreferenceResult<MigrationStatus> {
        let Some(raw) = self.prefs.get(STATUS_KEY)? else {
            return Ok(MigrationStatus::None);
        };
        Ok(raw.parse().unwrap_or_else(|e: String| {
            tracing::warn!(error = %e, "Ignoring unreadable migration status");
            MigrationStatus::None
        }))
    }

    /// Record the backup directory; `None` clears it.
    pub fn set_backup_dir(&self, dir: Option<&std::path::Path>) -> PreferenceResult<()> {
        match dir {
            Some(dir) => self.prefs.set(BACKUP_DIR_KEY, &dir.to_string_lossy()),
            None => self.prefs.remove(BACKUP_DIR_KEY),
        }
    }

    /// Recorded backup directory.
    pub fn get_backup_dir(&self) -> PreferenceResult<Option<PathBuf>> {
        Ok(self.prefs.get(BACKUP_DIR_KEY)?.map(PathBuf::from))
    }

    /// Record when an attempt ran.
    pub fn set_last_attempt(&self, at: Timestamp) -> PreferenceResult<()> {
        self.prefs.set(LAST_ATTEMPT_KEY, &at.to_rfc3339())
    }

    /// When the last attempt ran, if ever.
    pub fn get_last_attempt(&self) -> PreferenceResult<Option<Timestamp>> {
        Ok(self
            .prefs
            .get(LAST_ATTEMPT_KEY)?
            .and_then(|raw| Timestamp::from_rfc3339(&raw).ok()))
    }

    /// Everything recorded, in one snapshot.
    pub fn report(&self) -> PreferenceResult<MigrationReport> {
        Ok(MigrationReport {
            status: self.get_status()?,
            backup_dir: self.get_backup_dir()?,
            last_attempt: self.get_last_attempt()?,
        })
    }
}
