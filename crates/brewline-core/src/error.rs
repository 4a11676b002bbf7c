//! Error types for brewline-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for brewline-core
#[derive(Error, Debug)]
pub enum Error {
    /// Local index store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stream message decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Origin fetch errors during backfill
    #[error("Backfill error: {0}")]
    Backfill(#[from] BackfillError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A pagination cursor could not be decoded or belongs to another query
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// A resource identifier did not have the `at://actor/type/key` shape
    #[error("Invalid resource identifier: {0}")]
    InvalidUri(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Operation was cancelled by a shutdown signal
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Backfill(err) => Some(err.remediation()),
            Self::Decode(_) => None,
            Self::InvalidCursor(_) => Some(
                Remediation::new("Restart pagination without a cursor.")
                    .alternative("Cursors are only valid for the sort order that produced them."),
            ),
            Self::InvalidUri(_) => Some(Remediation::new(
                "Use a resource identifier of the form at://<actor>/<record type>/<key>.",
            )),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Diagnostics", "brewline stats")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(Remediation::new("Validate the JSON input and retry.")),
            Self::Runtime(_) | Self::Cancelled(_) => Some(
                Remediation::new("Retry the command.")
                    .alternative("Check whether a shutdown triggered the cancellation."),
            ),
        }
    }

    /// Shorthand for a storage error wrapping a database failure.
    #[must_use]
    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Invalid stored value in {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Storage worker failed: {0}")]
    Worker(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) | Self::Worker(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Diagnostics", "brewline stats")
            .alternative("Ensure the data directory is writable."),
            Self::MigrationFailed(_) => Remediation::new(
                "Index schema setup failed. The index is a cache and can be rebuilt.",
            )
            .alternative("Delete the index database; it is rebuilt by backfill and replay."),
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Index schema version {current} is newer than supported ({supported}). Upgrade brewline."
            ))
            .alternative("Delete the index database to rebuild it with this version."),
            Self::InvalidValue { .. } => Remediation::new(
                "The index contains an unreadable row. Delete the index to rebuild it.",
            ),
        }
    }
}

/// Errors raised while decoding a single stream message.
///
/// These never stop the stream: the router logs them and moves on.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("zstd decompression failed: {0}")]
    Decompress(String),

    #[error("commit event missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown commit operation: {0}")]
    UnknownOperation(String),
}

/// Errors fetching history from an actor's origin store
#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("could not resolve origin for {actor}: {reason}")]
    Resolve { actor: String, reason: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("origin returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("unexpected origin response: {0}")]
    Response(String),
}

impl BackfillError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Resolve { .. } => Remediation::new(
                "The actor's identity document could not be resolved. Check the PLC directory URL.",
            )
            .command("Retry backfill", "brewline backfill <actor>"),
            Self::Http(_) | Self::Status { .. } | Self::Response(_) => Remediation::new(
                "The actor's origin store did not answer. Retry later; live events still index.",
            )
            .command("Retry backfill", "brewline backfill <actor>"),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Create the config file at {path} or unset BREWLINE_CONFIG."
            )),
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check permissions on {path} and retry."))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Remove the file to fall back to defaults."),
            Self::ValidationError(_) => {
                Remediation::new("Correct the reported value in the config file.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rusqlite_errors_become_storage_errors() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn remediation_renders_commands() {
        let text = StorageError::Database("locked".into())
            .remediation()
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("brewline stats"));
    }

    #[test]
    fn decode_errors_have_no_remediation() {
        let err = Error::Decode(DecodeError::NotUtf8);
        assert!(err.remediation().is_none());
        assert_eq!(err.to_string(), "Decode error: message is not valid UTF-8");
    }
}
