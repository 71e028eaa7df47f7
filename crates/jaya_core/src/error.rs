use std::io;
use std::path::PathBuf;

/// Domain failures raised by the sync pipeline.
///
/// Operations return `anyhow::Result`; these values travel inside the
/// `anyhow::Error` and can be recovered with `downcast_ref::<SyncError>()`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("fixture file not found: {}", .0.display())]
    FixtureFileNotFound(PathBuf),

    #[error("malformed fixture {}: {reason}", path.display())]
    MalformedFixture { path: PathBuf, reason: String },

    #[error("fixture record #{index} in {} is missing `{field}`", path.display())]
    MissingField {
        path: PathBuf,
        index: usize,
        field: &'static str,
    },

    #[error("pk {0} is already recorded in the sync ledger")]
    DuplicatePk(i64),

    #[error("refusing to write {}: the sync ledger assigns it to pk {owner}", path.display())]
    FixtureOwned { path: PathBuf, owner: i64 },

    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("failed to {action} {}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Only bad interactive input may be retried; everything else aborts the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InputValidation(_))
    }
}
