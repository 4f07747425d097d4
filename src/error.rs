//! Error types for the ingestion pipeline.
//!
//! [`PipelineError`] is what every stage returns. The orchestrator uses
//! [`PipelineError::is_retryable`] to decide between another attempt and a
//! terminal failure. Repository synchronization failures are kept as their
//! own [`SyncError`] so callers can tell authentication, network and missing
//! branch problems apart.
//!
//! Messages carried by these errors are user-visible. Anything that could
//! contain credential material is redacted before the error value is built
//! (see [`crate::repo_sync::redact`]).

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the remote repository or running git locally.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The configured branch does not exist on the remote.
    #[error("branch `{reference}` not found: {message}")]
    MissingRef {
        /// Branch or ref name that was requested.
        reference: String,
        /// Redacted git output.
        message: String,
    },

    /// A revision needed for a diff is not available locally or remotely.
    #[error("revision `{0}` is not available")]
    MissingRevision(String),

    /// Any other git failure.
    #[error("git {command} failed: {message}")]
    Git {
        /// The git subcommand that failed (`clone`, `fetch`, ...).
        command: String,
        /// Redacted git output.
        message: String,
    },

    /// The git binary could not be started.
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors surfaced by pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Repository synchronization failed. Retryable.
    #[error("sync failed: {0}")]
    Sync(#[from] SyncError),

    /// The working copy is in a state that cannot produce a trustworthy
    /// bundle (unresolvable HEAD, path escaping the storage root).
    #[error("scan integrity violation: {0}")]
    Integrity(String),

    /// The credential provider has no usable token for the project.
    #[error("no valid access token for project `{0}`")]
    NoValidToken(String),

    /// A stage exceeded its time budget.
    #[error("stage `{stage}` timed out after {secs}s")]
    Timeout {
        /// Name of the stage that timed out.
        stage: String,
        /// The budget that was exceeded.
        secs: u64,
    },

    /// Unclassified stage failure. Retryable up to the attempt limit.
    #[error("stage `{stage}` failed: {message}")]
    Failure {
        /// Name of the failing stage.
        stage: String,
        /// Human-readable cause.
        message: String,
    },

    /// The project does not exist.
    #[error("project `{0}` not found")]
    ProjectNotFound(String),

    /// A project definition was rejected at registration.
    #[error("invalid project: {0}")]
    InvalidProject(String),

    /// The project has a scan in progress and cannot be removed.
    #[error("project `{0}` has a scan in progress")]
    ProjectBusy(String),

    /// Filesystem failure outside per-file scanning.
    #[error("I/O error at `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Store failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Artifact serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Build an unclassified stage failure.
    pub fn failure(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Failure {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether another attempt of the same stage may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Sync(SyncError::Spawn(_)) => false,
            PipelineError::Sync(_)
            | PipelineError::Failure { .. }
            | PipelineError::Io { .. }
            | PipelineError::Database(_) => true,
            PipelineError::Integrity(_)
            | PipelineError::NoValidToken(_)
            | PipelineError::Timeout { .. }
            | PipelineError::ProjectNotFound(_)
            | PipelineError::InvalidProject(_)
            | PipelineError::ProjectBusy(_)
            | PipelineError::Serialization(_) => false,
        }
    }
}

/// Convenience alias used across the library.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
