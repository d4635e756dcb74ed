//! Shared types used across the storage bootstrap crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of the database secret.
///
/// Only the passphrase store drives transitions; everything else observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassphraseState {
    /// A database file exists but no wrapped secret has been created yet.
    NotSet,
    /// A wrapped secret exists and the last unwrap succeeded.
    Set,
    /// The most recent unwrap of the stored secret failed.
    Invalid,
    /// First run: neither a database file nor a secret exists.
    NeedsCreation,
}

impl PassphraseState {
    /// Whether the user must go through the explicit reset path.
    #[must_use]
    pub fn requires_reset(self) -> bool {
        self == Self::Invalid
    }
}

impl fmt::Display for PassphraseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotSet => "not_set",
            Self::Set => "set",
            Self::Invalid => "invalid",
            Self::NeedsCreation => "needs_creation",
        };
        f.write_str(s)
    }
}

/// Outcome of the last legacy migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Migration has never been attempted.
    #[default]
    None,
    /// No legacy database file was found.
    NoDatabase,
    /// The legacy file was re-encrypted under the current secret.
    Success,
    /// An attempt was made and did not complete.
    Failure,
}

impl MigrationStatus {
    /// Stable string form used in preference storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NoDatabase => "no_database",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "no_database" => Ok(Self::NoDatabase),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown migration status '{other}'")),
        }
    }
}

/// UTC timestamp wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create a timestamp representing the current moment.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Get the inner `DateTime<Utc>`.
    #[must_use]
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Parse a timestamp from an RFC3339 string.
    pub fn from_rfc3339(s: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// Format as RFC3339 string.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Compact, filename-safe form (`20260119T101500123Z`).
    #[must_use]
    pub fn to_file_stamp(&self) -> String {
        self.0.format("%Y%m%dT%H%M%S%3fZ").to_string()
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}
