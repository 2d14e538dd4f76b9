//! Changeset upload: lifecycle state machine, batching, retries, and the
//! post-upload discussion comments.
//!
//! The uploader owns the only mutable interaction with the server. Committed
//! batches are never rolled back; a failure mid-run closes the changeset and
//! reports how far it got.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::api::{ActionStatus, ChangesetApi, HistorySource};
use crate::config::{DiscussionSection, DiscussionTarget, UploadSection};
use crate::conflict::{ConflictResolver, TagMerge};
use crate::errors::{HistoryError, UploadError};
use crate::models::{
    ConflictKind, ConflictRecord, ElementRef, Geometry, Resolution, RevertAction, RevertPlan,
    RevertStats, RevertTarget, Tags,
};
use crate::progress::ProgressLog;

/// Generator string stamped on changesets and exported documents.
pub const GENERATOR: &str = concat!("osm-revert/", env!("CARGO_PKG_VERSION"));

/// Changeset tag keys that are meaningful to the server as-is.
const NO_TAG_PREFIX: [&str; 5] = [
    "comment",
    "changesets_count",
    "created_by",
    "host",
    "website",
];

/// Server-side limit on changeset tag value length.
const MAX_TAG_VALUE_LEN: usize = 255;

// ---------------------------------------------------------------------------
// Lifecycle state
// ---------------------------------------------------------------------------

/// Upload lifecycle. Transitions are validated so a bug cannot, say, submit
/// into a closed changeset silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    ChangesetOpen,
    Uploading,
    Closed,
    Failed,
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::ChangesetOpen => "changeset_open",
            Self::Uploading => "uploading",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl UploadState {
    fn transition(&mut self, to: UploadState) -> Result<(), UploadError> {
        let allowed = matches!(
            (*self, to),
            (Self::Idle, Self::ChangesetOpen)
                | (Self::ChangesetOpen, Self::Uploading)
                | (Self::ChangesetOpen, Self::Closed)
                | (Self::Uploading, Self::Closed)
                | (_, Self::Failed)
        );
        if !allowed {
            return Err(UploadError::InvalidState {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %self, to = %to, "upload state transition");
        *self = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Changeset tags
// ---------------------------------------------------------------------------

/// Build the metadata tags for the revert changeset. Unknown keys get the
/// `revert:` prefix; overlong values are trimmed with a trailing ellipsis.
pub fn changeset_tags(comment: &str, source_changesets: &[i64], stats: &RevertStats) -> Tags {
    let ids = source_changesets
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(";");

    let mut raw: Vec<(String, String)> = vec![
        ("comment".into(), comment.to_string()),
        ("created_by".into(), GENERATOR.to_string()),
        ("id".into(), ids),
    ];
    raw.extend(stats.to_tag_pairs());

    let mut tags = Tags::new();
    for (key, value) in raw {
        let key = if NO_TAG_PREFIX.contains(&key.as_str()) {
            key
        } else {
            format!("revert:{key}")
        };
        tags.insert(key, trim_tag_value(value));
    }
    tags
}

fn trim_tag_value(value: String) -> String {
    if value.chars().count() <= MAX_TAG_VALUE_LEN {
        return value;
    }
    warn!("changeset tag value exceeds {MAX_TAG_VALUE_LEN} chars, trimming");
    let mut trimmed: String = value.chars().take(MAX_TAG_VALUE_LEN - 1).collect();
    trimmed.push('…');
    trimmed
}

// ---------------------------------------------------------------------------
// Uploader
// ---------------------------------------------------------------------------

/// What the upload achieved.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub changeset_id: i64,
    /// Actions the server committed.
    pub committed: usize,
    /// The run was cancelled between batches; committed work stands.
    pub cancelled: bool,
}

/// Drives one plan through one changeset.
pub struct Uploader<'a, A, H, M: TagMerge> {
    api: &'a A,
    history: &'a H,
    resolver: &'a ConflictResolver<M>,
    config: &'a UploadSection,
    discussion: &'a DiscussionSection,
    progress: &'a ProgressLog,
    state: UploadState,
}

impl<'a, A, H, M> Uploader<'a, A, H, M>
where
    A: ChangesetApi,
    H: HistorySource,
    M: TagMerge,
{
    pub fn new(
        api: &'a A,
        history: &'a H,
        resolver: &'a ConflictResolver<M>,
        config: &'a UploadSection,
        discussion: &'a DiscussionSection,
        progress: &'a ProgressLog,
    ) -> Self {
        Self {
            api,
            history,
            resolver,
            config,
            discussion,
            progress,
            state: UploadState::Idle,
        }
    }

    /// Upload the assembled actions. `targets` backs version-race
    /// re-resolution; records and statistics accumulate into `plan`.
    pub async fn upload(
        &mut self,
        ordered: Vec<RevertAction>,
        targets: &BTreeMap<ElementRef, RevertTarget>,
        plan: &mut RevertPlan,
        comment: &str,
        cancelled: &AtomicBool,
    ) -> Result<UploadOutcome, UploadError> {
        let max = self.api.max_changeset_elements().await?;
        if ordered.len() as u64 > max {
            return Err(UploadError::TooLarge {
                size: ordered.len() as u64,
                max,
            });
        }

        let tags = changeset_tags(comment, &plan.source_changesets, &plan.stats);
        let changeset_id = self.api.open_changeset(&tags).await?;
        self.state.transition(UploadState::ChangesetOpen)?;
        info!(changeset_id, actions = ordered.len(), "changeset opened");
        self.progress
            .emit(format!("uploading {} actions", ordered.len()));

        let mut batches: VecDeque<Vec<RevertAction>> = ordered
            .chunks(self.config.batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();

        let mut committed = 0usize;
        let mut race_counts: BTreeMap<ElementRef, u32> = BTreeMap::new();
        let mut was_cancelled = false;
        let mut first_batch = true;

        while let Some(batch) = batches.pop_front() {
            if cancelled.load(Ordering::Relaxed) {
                info!(changeset_id, committed, "cancelled between batches");
                was_cancelled = true;
                break;
            }
            if first_batch {
                self.state.transition(UploadState::Uploading)?;
                first_batch = false;
            }

            let results = match self.submit_with_retry(changeset_id, &batch).await {
                Ok(results) => results,
                Err(e) => {
                    self.close_quietly(changeset_id).await;
                    self.state.transition(UploadState::Failed)?;
                    return Err(e);
                }
            };

            let mut id_map: BTreeMap<i64, i64> = BTreeMap::new();
            let mut retries: Vec<RevertAction> = Vec::new();
            for (action, result) in batch.iter().zip(results) {
                match result.status {
                    ActionStatus::Committed { new_id, new_version } => {
                        committed += 1;
                        if let Some(placeholder) = action.placeholder {
                            debug!(element = %action.element, new_id, new_version,
                                "create committed under fresh id");
                            id_map.insert(placeholder, new_id);
                        }
                    }
                    ActionStatus::VersionConflict { server_version } => {
                        if let Some(retry) = self
                            .handle_version_race(
                                action,
                                server_version,
                                targets,
                                plan,
                                &mut race_counts,
                            )
                            .await
                        {
                            retries.push(retry);
                        }
                    }
                    ActionStatus::Failed { status, body } => {
                        self.close_quietly(changeset_id).await;
                        self.state.transition(UploadState::Failed)?;
                        return Err(UploadError::Rejected { status, body });
                    }
                }
            }
            // A raced action was ordered ahead of everything still queued;
            // its retry must go back in before any action that depends on
            // it.
            if !retries.is_empty() {
                batches.push_front(retries);
            }
            if !id_map.is_empty() {
                for batch in batches.iter_mut() {
                    for action in batch.iter_mut() {
                        rewrite_committed_ids(action, &id_map);
                    }
                }
            }
        }

        self.api.close_changeset(changeset_id).await?;
        self.state.transition(UploadState::Closed)?;
        info!(changeset_id, committed, "changeset closed");

        if !was_cancelled {
            self.post_discussion(changeset_id, &plan.source_changesets, comment)
                .await;
        }

        Ok(UploadOutcome {
            changeset_id,
            committed,
            cancelled: was_cancelled,
        })
    }

    /// Submit one batch, retrying transient failures with jittered
    /// exponential backoff.
    async fn submit_with_retry(
        &self,
        changeset_id: i64,
        batch: &[RevertAction],
    ) -> Result<Vec<crate::api::ActionResult>, UploadError> {
        let mut attempt = 0u32;
        loop {
            match self.api.submit_batch(changeset_id, batch).await {
                Ok(results) => return Ok(results),
                Err(e) if e.is_transient() && attempt < self.config.transient_retry_limit => {
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(changeset_id, attempt, delay_secs = delay.as_secs_f64(),
                        error = %e, "transient upload failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_secs * f64::from(1u32 << attempt.min(16));
        let jittered = base * (1.0 + rand::thread_rng().gen::<f64>());
        Duration::from_secs_f64(jittered.min(self.config.backoff_max_secs))
    }

    /// The element moved under us. Re-resolve its target against the fresh
    /// live state within the configured budget, then give up on it. Returns
    /// the retry action, which the caller requeues ahead of its dependents.
    async fn handle_version_race(
        &self,
        action: &RevertAction,
        server_version: u64,
        targets: &BTreeMap<ElementRef, RevertTarget>,
        plan: &mut RevertPlan,
        race_counts: &mut BTreeMap<ElementRef, u32>,
    ) -> Option<RevertAction> {
        let element = action.element;
        let races = race_counts.entry(element).or_insert(0);
        *races += 1;
        warn!(element = %element, server_version, attempt = *races, "version race");

        let over_budget = *races > self.config.version_retry_limit;
        let target = targets.get(&element);
        let current = if over_budget || target.is_none() {
            Err(HistoryError::Unavailable {
                element,
                detail: "not refetched".into(),
            })
        } else {
            self.history.fetch_current(element).await
        };

        match (target, current) {
            (Some(target), Ok(current)) => {
                let mut target = target.clone();
                // The racing edit landed after the selected changesets.
                target.touched_after = true;
                let mut scratch = RevertPlan::default();
                self.resolver.resolve(&target, &current, &mut scratch);
                plan.records.append(&mut scratch.records);
                let retry = scratch.actions.into_iter().next();
                if retry.is_some() {
                    self.progress
                        .emit(format!("retrying {element} against version {server_version}"));
                }
                retry
            }
            _ => {
                self.progress
                    .emit(format!("giving up on {element} after repeated version races"));
                plan.records.push(ConflictRecord::new(
                    element,
                    ConflictKind::Structural,
                    Resolution::Abandoned,
                    format!("kept changing during upload, last seen at version {server_version}"),
                ));
                None
            }
        }
    }

    async fn close_quietly(&self, changeset_id: i64) {
        if let Err(e) = self.api.close_changeset(changeset_id).await {
            warn!(changeset_id, error = %e, "failed to close changeset after error");
        }
    }

    /// Comment on the reverted changesets per the discussion target.
    async fn post_discussion(&self, revert_changeset: i64, sources: &[i64], comment: &str) {
        if comment.trim().chars().count() < 4 {
            debug!("comment too short for discussion posts, skipping");
            return;
        }
        let recipients: Vec<i64> = match self.discussion.target {
            DiscussionTarget::All => sources.to_vec(),
            DiscussionTarget::Newest => sources.iter().max().into_iter().copied().collect(),
            DiscussionTarget::Oldest => sources.iter().min().into_iter().copied().collect(),
        };

        let text = format!(
            "{comment}\n\nhttps://www.openstreetmap.org/changeset/{revert_changeset}"
        );
        for source in recipients {
            match self.api.post_comment(source, &text).await {
                Ok(()) => debug!(source, "discussion comment posted"),
                Err(UploadError::RateLimited) => {
                    warn!(source, "comment rate limit reached, skipping the rest");
                    return;
                }
                Err(e) => warn!(source, error = %e, "failed to post discussion comment"),
            }
        }
    }
}

/// Replace committed placeholder ids in a not-yet-submitted action.
fn rewrite_committed_ids(action: &mut RevertAction, id_map: &BTreeMap<i64, i64>) {
    match &mut action.geometry {
        Some(Geometry::Way { nodes }) => {
            for id in nodes.iter_mut() {
                if let Some(real) = id_map.get(id) {
                    *id = *real;
                }
            }
        }
        Some(Geometry::Relation { members }) => {
            for m in members.iter_mut() {
                if let Some(real) = id_map.get(&m.member_ref) {
                    m.member_ref = *real;
                }
            }
        }
        _ => {}
    }
    if let Some(placeholder) = action.placeholder {
        if let Some(real) = id_map.get(&placeholder) {
            // A follow-up edit of a freshly created element now addresses
            // the real id.
            action.placeholder = Some(*real);
        }
    }
}
