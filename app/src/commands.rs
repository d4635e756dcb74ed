//! Storage commands exposed to the UI and the CLI.

use crate::error::CommandError;
use crate::state::AppState;
use serde::Serialize;
use tallybook_core::{MigrationStatus, PassphraseState};
use tallybook_db::metadata::KEY_SCHEME_KEY;
use tallybook_db::{BootstrapPhase, MigrationReport};
use tracing::{info, warn};

/// Response for `storage_status`.
#[derive(Debug, Serialize)]
pub struct StorageStatus {
    pub database_path: String,
    pub passphrase_state: PassphraseState,
    pub phase: BootstrapPhase,
    pub reset_required: bool,
    pub migration: MigrationReport,
}

/// Response for `open_database`.
#[derive(Debug, Serialize)]
pub struct OpenedDatabase {
    pub schema_version: i64,
    pub key_scheme: Option<String>,
    pub migration_status: MigrationStatus,
}

/// Response for `reset_secret`.
#[derive(Debug, Serialize)]
pub struct ResetOutcome {
    /// Where the unreadable database was moved, if there was one.
    pub orphaned_database: Option<String>,
}

/// Report secret, bootstrap and migration state without opening anything.
pub async fn storage_status(state: &AppState) -> Result<StorageStatus, CommandError> {
    let passphrase_state = state.bootstrapper.passphrase().state()?;
    Ok(StorageStatus {
        database_path: state.paths.database.display().to_string(),
        passphrase_state,
        phase: state.bootstrapper.phase(),
        reset_required: passphrase_state.requires_reset(),
        migration: state.migration_status.report()?,
    })
}

/// Open the encrypted store (running first-run setup and legacy migration).
pub async fn open_database(state: &AppState) -> Result<OpenedDatabase, CommandError> {
    let db = state.bootstrapper.database().await?;

    let schema_version = db.get_schema_version().await?;
    let key_scheme = db
        .get_metadata(KEY_SCHEME_KEY)
        .await?
        .and_then(|v| v.as_str().map(str::to_owned));
    let migration_status = state.migration_status.get_status()?;

    info!(schema_version, migration = %migration_status, "Database ready");
    Ok(OpenedDatabase {
        schema_version,
        key_scheme,
        migration_status,
    })
}

/// Discard the database secret after it became invalid.
///
/// Requires `confirm`: the data encrypted under the old secret is moved aside
/// and the app starts over with an empty database.
pub async fn reset_secret(state: &AppState, confirm: bool) -> Result<ResetOutcome, CommandError> {
    if !confirm {
        return Err(CommandError::with_details(
            "CONFIRMATION_REQUIRED",
            "Resetting the database secret starts a new, empty database",
            serde_json::json!({ "database_path": state.paths.database.display().to_string() }),
        ));
    }

    warn!("User confirmed database secret reset");
    let orphaned = state.bootstrapper.reset_secret().await?;
    Ok(ResetOutcome {
        orphaned_database: orphaned.map(|p| p.display().to_string()),
    })
}
