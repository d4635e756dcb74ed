//! Key-value metadata about the store itself, kept in `app_metadata`.
//!
//! Values are stored as JSON so callers can record structured data.

use crate::error::{DatabaseError, Result};
use serde_json::Value;
use sqlx::SqlitePool;

/// Key scheme the file is encrypted under.
pub const KEY_SCHEME_KEY: &str = "storage.key_scheme";

/// Set a metadata value, replacing any previous one.
pub async fn set_metadata(pool: &SqlitePool, key: &str, value: &Value) -> Result<()> {
    let value_str = serde_json::to_string(value)
        .map_err(|e| DatabaseError::SerializationError(e.to_string()))?;

    sqlx::query(
        r"
        INSERT INTO app_metadata (key, value, updated_at)
        VALUES (?, ?, datetime('now'))
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = datetime('now')
        ",
    )
    .bind(key)
    .bind(value_str)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a metadata value.
pub async fn get_metadata(pool: &SqlitePool, key: &str) -> Result<Option<Value>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    row.map(|(value_str,)| {
        serde_json::from_str(&value_str)
            .map_err(|e| DatabaseError::SerializationError(e.to_string()))
    })
    .transpose()
}

/// Delete a metadata value. Deleting a missing key is not an error.
pub async fn delete_metadata(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM app_metadata WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;

    Ok(())
}
