//! Collaborator interfaces consumed by the core.
//!
//! The surrounding application implements these against the real OSM API and
//! Overpass; the engine only ever sees the traits. Tests implement them with
//! in-memory mirrors.
//!
//! All methods return `Send` futures so callers can fan work out across a
//! bounded worker pool.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::errors::{HistoryError, UploadError};
use crate::models::{ElementRef, ElementVersion, RevertAction, Tags};

// ---------------------------------------------------------------------------
// History access
// ---------------------------------------------------------------------------

/// One element edit contained in a changeset: the version range it moved the
/// element across.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangesetEdit {
    pub element: ElementRef,
    /// Version before the edit; `None` when the edit created the element.
    pub old_version: Option<u64>,
    /// Version the edit produced.
    pub new_version: u64,
}

/// Read-only access to element history and the current reference graph.
pub trait HistorySource: Send + Sync + 'static {
    /// Full ascending version history of an element. Deleted versions appear
    /// with `visible == false`. Fails with [`HistoryError::NotFound`] if the
    /// element never existed.
    fn fetch_history(
        &self,
        element: ElementRef,
    ) -> impl Future<Output = Result<Vec<ElementVersion>, HistoryError>> + Send;

    /// The element edits a changeset contains.
    fn fetch_changeset_edits(
        &self,
        changeset_id: i64,
    ) -> impl Future<Output = Result<Vec<ChangesetEdit>, HistoryError>> + Send;

    /// Current live version of an element. Fails with
    /// [`HistoryError::NotFound`] if the element was deleted and never
    /// recreated.
    fn fetch_current(
        &self,
        element: ElementRef,
    ) -> impl Future<Output = Result<ElementVersion, HistoryError>> + Send;

    /// Ways/relations whose member list currently contains the element.
    fn find_referrers(
        &self,
        element: ElementRef,
    ) -> impl Future<Output = Result<Vec<ElementRef>, HistoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Changeset upload
// ---------------------------------------------------------------------------

/// Per-action result of a batch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    /// Committed. For creates, `new_id` is the server-assigned id replacing
    /// the negative placeholder; `new_version` is the resulting version.
    Committed { new_id: i64, new_version: u64 },
    /// The element changed between plan time and upload time.
    VersionConflict { server_version: u64 },
    /// Hard, non-retryable rejection of this element.
    Failed { status: u16, body: String },
}

/// Outcome of one action within a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub element: ElementRef,
    pub status: ActionStatus,
}

/// Write access to the changeset lifecycle.
pub trait ChangesetApi: Send + Sync + 'static {
    /// The server's per-changeset element maximum.
    fn max_changeset_elements(&self)
        -> impl Future<Output = Result<u64, UploadError>> + Send;

    /// Open a changeset carrying the given tags; returns its id.
    fn open_changeset(
        &self,
        tags: &Tags,
    ) -> impl Future<Output = Result<i64, UploadError>> + Send;

    /// Submit one ordered batch of actions into an open changeset.
    ///
    /// Transport-level failures surface as `Err`; per-element outcomes
    /// (including version conflicts) come back in the result vector, one
    /// entry per submitted action, in order.
    fn submit_batch(
        &self,
        changeset_id: i64,
        batch: &[RevertAction],
    ) -> impl Future<Output = Result<Vec<ActionResult>, UploadError>> + Send;

    /// Close an open changeset.
    fn close_changeset(
        &self,
        changeset_id: i64,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;

    /// Post a discussion comment on a changeset.
    fn post_comment(
        &self,
        changeset_id: i64,
        text: &str,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;
}
