//! Error types for the revert engine core.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`RevertError`] enum unifies them all for callers that want a
//! single error type.
//!
//! Conflicts and version races are recovered locally and never appear here;
//! everything in this module propagates to the caller with enough context
//! (element, stage, underlying cause) for a precise log line.

use thiserror::Error;

use crate::models::ElementRef;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum RevertError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// History / data-access errors
// ---------------------------------------------------------------------------

/// Errors from the version-history collaborators.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The element never existed.
    #[error("{element} was not found")]
    NotFound { element: ElementRef },

    /// The requested changeset does not exist.
    #[error("changeset {0} was not found")]
    ChangesetNotFound(i64),

    /// The element exists but its history could not be retrieved.
    #[error("history for {element} is unavailable: {detail}")]
    Unavailable {
        element: ElementRef,
        detail: String,
    },

    /// Transport-level failure before any element could be attributed.
    #[error("history transport error: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Conflict-resolution errors
// ---------------------------------------------------------------------------

/// Errors from the conflict resolver. Conflicts themselves are not errors;
/// these are failures of the resolution machinery.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The same element was submitted as a revert target twice in one run.
    #[error("duplicate revert target for {element}")]
    DuplicateTarget { element: ElementRef },

    /// The parent-discovery worklist did not reach a fixpoint within its
    /// bound.
    #[error("parent discovery did not converge after {iterations} iterations")]
    FixpointDiverged { iterations: usize },

    /// Underlying history error during referrer lookups.
    #[error("conflict resolution history error: {0}")]
    History(#[from] HistoryError),
}

// ---------------------------------------------------------------------------
// Assembly errors
// ---------------------------------------------------------------------------

/// Errors from the change assembler.
#[derive(Debug, Error)]
pub enum AssembleError {
    /// A reference cycle could not be broken within the bounded pass count.
    /// Aborts the whole plan before any upload.
    #[error("unbreakable dependency cycle among relations: {0:?}")]
    DependencyCycle(Vec<i64>),

    /// The ordered sequence would reference an id that does not exist at
    /// that point.
    #[error("action for {element} references {missing} which is not available at its position")]
    MissingDependency {
        element: ElementRef,
        missing: ElementRef,
    },
}

// ---------------------------------------------------------------------------
// Upload errors
// ---------------------------------------------------------------------------

/// Errors from the upload orchestrator and the changeset API collaborator.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The assembled plan exceeds the server's per-changeset element limit.
    #[error("revert is too big: {size} > {max}")]
    TooLarge { size: u64, max: u64 },

    /// Non-retryable API error. Remaining batches are aborted;
    /// already-committed batches stand.
    #[error("upload rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The server asked us to slow down.
    #[error("rate limited by the server")]
    RateLimited,

    /// Network / 5xx / timeout. Retried with exponential backoff.
    #[error("transient upload error: {0}")]
    Transient(String),

    /// A state-machine transition was invalid.
    #[error("invalid upload state transition from {from} to {to}")]
    InvalidState { from: String, to: String },

    /// Writing the offline change document failed.
    #[error("change document I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UploadError {
    /// Whether the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
