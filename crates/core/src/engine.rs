//! The revert engine: wires planning, resolution, assembly and upload into
//! one run.
//!
//! A run is a pure function of the selected changesets and the server state
//! it observes; the engine holds no state between runs apart from its
//! collaborators. Cancellation is cooperative through a shared flag checked
//! at batch boundaries.

use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU32;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::api::{ChangesetApi, ChangesetEdit, HistorySource};
use crate::assembler::{Assembler, PlaceholderAlloc};
use crate::config::RevertConfig;
use crate::conflict::ConflictResolver;
use crate::errors::{ConfigError, ConflictError, HistoryError, RevertError};
use crate::models::{
    ActionOp, ConflictKind, ConflictRecord, ElementRef, ElementVersion, Resolution, RevertPlan,
    RevertStats, RevertTarget, TargetKind,
};
use crate::osmchange;
use crate::planner::{LoadedTarget, Planner};
use crate::progress::ProgressLog;
use crate::upload::{UploadOutcome, Uploader, GENERATOR};

/// What one revert run should undo.
#[derive(Debug, Clone)]
pub struct RevertRequest {
    pub changeset_ids: Vec<i64>,
    /// Changeset comment, also posted to the reverted changesets'
    /// discussions when long enough.
    pub comment: String,
}

/// How the run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Actions committed to the server.
    Uploaded { changeset_id: i64, committed: usize },
    /// Upload disabled; the caller gets the change document instead.
    Exported { document: String },
    /// Nothing needed doing.
    NoOp,
}

/// Full account of one run.
#[derive(Debug, Clone)]
pub struct RevertReport {
    pub outcome: RunOutcome,
    pub records: Vec<ConflictRecord>,
    pub stats: RevertStats,
    pub cancelled: bool,
}

/// Orchestrates one revert at a time over a history source and an upload
/// API.
pub struct RevertEngine<H, A> {
    config: RevertConfig,
    history: Arc<H>,
    api: Arc<A>,
    resolver: ConflictResolver,
    limiter: Arc<DefaultDirectRateLimiter>,
    cancelled: Arc<AtomicBool>,
    progress: ProgressLog,
}

impl<H, A> RevertEngine<H, A>
where
    H: HistorySource,
    A: ChangesetApi,
{
    pub fn new(
        config: RevertConfig,
        history: Arc<H>,
        api: Arc<A>,
        progress: ProgressLog,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let per_second = NonZeroU32::new(config.runtime.requests_per_second)
            .unwrap_or(NonZeroU32::MIN);
        let resolver = ConflictResolver::new(config.revert.parent_policy);
        Ok(Self {
            config,
            history,
            api,
            resolver,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress,
        })
    }

    /// Shared flag a caller can set to stop the run at the next batch
    /// boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Run one revert end to end.
    pub async fn run(&self, request: &RevertRequest) -> Result<RevertReport, RevertError> {
        let selected = Self::validate_request(request)?;
        info!(changesets = ?selected, "starting revert run");
        self.progress
            .emit(format!("reverting {} changeset(s)", selected.len()));

        let edits = self.fetch_all_edits(&selected).await?;
        let elements = Planner::touched_elements(&edits);
        self.progress
            .emit(format!("{} element(s) touched", elements.len()));

        let loaded = self.load_all_targets(&elements, &selected).await?;

        let mut plan = RevertPlan {
            source_changesets: selected.iter().copied().collect(),
            ..RevertPlan::default()
        };
        let mut targets: BTreeMap<ElementRef, RevertTarget> = BTreeMap::new();
        let mut live: BTreeMap<ElementRef, ElementVersion> = BTreeMap::new();
        for LoadedTarget { target, current } in loaded {
            let element = target.element;
            if targets.insert(element, target.clone()).is_some() {
                return Err(ConflictError::DuplicateTarget { element }.into());
            }
            match current {
                Some(current) => {
                    self.resolver.resolve(&target, &current, &mut plan);
                    live.insert(element, current);
                }
                None => {
                    if let TargetKind::Unresolved { reason } = &target.kind {
                        self.progress
                            .emit_limited("unresolved", 20, format!("excluding {element}: {reason}"));
                        plan.records.push(ConflictRecord::new(
                            element,
                            ConflictKind::Structural,
                            Resolution::Unresolved,
                            reason.clone(),
                        ));
                    }
                }
            }
        }

        self.fetch_external_refs(&plan, &mut live).await;
        self.resolver.reconcile_structure(&mut plan, &live);
        self.fix_parents(&mut plan, &mut live).await?;

        if plan.actions.is_empty() {
            info!("nothing to do, map already matches the requested state");
            self.progress.finish("nothing to revert");
            return Ok(RevertReport {
                outcome: RunOutcome::NoOp,
                records: plan.records,
                stats: plan.stats,
                cancelled: false,
            });
        }

        let alloc = PlaceholderAlloc::new();
        let ordered = Assembler::assemble(&plan.actions, &live, &alloc)?;

        let (outcome, cancelled) = if self.config.upload.enabled {
            let mut uploader = Uploader::new(
                self.api.as_ref(),
                self.history.as_ref(),
                &self.resolver,
                &self.config.upload,
                &self.config.discussion,
                &self.progress,
            );
            let UploadOutcome {
                changeset_id,
                committed,
                cancelled,
            } = uploader
                .upload(ordered, &targets, &mut plan, &request.comment, &self.cancelled)
                .await?;
            (
                RunOutcome::Uploaded {
                    changeset_id,
                    committed,
                },
                cancelled,
            )
        } else {
            info!(actions = ordered.len(), "upload disabled, exporting document");
            let document = osmchange::build_document(&ordered, None, GENERATOR);
            (RunOutcome::Exported { document }, false)
        };

        for element in &plan.stats.warnings {
            self.progress.emit_limited(
                "warnings",
                20,
                format!("review https://www.openstreetmap.org/{element}"),
            );
        }
        self.progress.finish(match &outcome {
            RunOutcome::Uploaded { changeset_id, committed } => {
                format!("uploaded {committed} action(s) as changeset {changeset_id}")
            }
            RunOutcome::Exported { .. } => "change document ready".to_string(),
            RunOutcome::NoOp => "nothing to revert".to_string(),
        });

        Ok(RevertReport {
            outcome,
            records: plan.records,
            stats: plan.stats,
            cancelled,
        })
    }

    fn validate_request(request: &RevertRequest) -> Result<BTreeSet<i64>, ConfigError> {
        let selected: BTreeSet<i64> = request.changeset_ids.iter().copied().collect();
        if selected.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "changeset_ids".into(),
                detail: "at least one changeset id is required".into(),
            });
        }
        if let Some(id) = selected.iter().find(|id| **id <= 0) {
            return Err(ConfigError::InvalidValue {
                field: "changeset_ids".into(),
                detail: format!("{id} is not a valid changeset id"),
            });
        }
        Ok(selected)
    }

    /// Fetch the edit lists of all selected changesets across a bounded
    /// worker pool. A missing changeset aborts the run.
    async fn fetch_all_edits(
        &self,
        selected: &BTreeSet<i64>,
    ) -> Result<Vec<ChangesetEdit>, HistoryError> {
        let semaphore = Arc::new(Semaphore::new(self.config.runtime.concurrency.max(1)));
        let mut tasks: JoinSet<Result<Vec<ChangesetEdit>, HistoryError>> = JoinSet::new();
        for id in selected.iter().copied() {
            let history = Arc::clone(&self.history);
            let limiter = Arc::clone(&self.limiter);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                limiter.until_ready().await;
                history.fetch_changeset_edits(id).await
            });
        }

        let mut edits = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => edits.extend(result?),
                Err(e) => {
                    return Err(HistoryError::Transport(format!(
                        "edit fetch task failed: {e}"
                    )))
                }
            }
        }
        Ok(edits)
    }

    /// Derive targets for all touched elements across a bounded worker pool.
    async fn load_all_targets(
        &self,
        elements: &[ElementRef],
        selected: &BTreeSet<i64>,
    ) -> Result<Vec<LoadedTarget>, HistoryError> {
        let semaphore = Arc::new(Semaphore::new(self.config.runtime.concurrency.max(1)));
        let selected = Arc::new(selected.clone());
        let mut tasks: JoinSet<LoadedTarget> = JoinSet::new();
        for element in elements.iter().copied() {
            let history = Arc::clone(&self.history);
            let limiter = Arc::clone(&self.limiter);
            let semaphore = Arc::clone(&semaphore);
            let selected = Arc::clone(&selected);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await;
                limiter.until_ready().await;
                Planner::load_target(history.as_ref(), element, &selected).await
            });
        }

        let mut loaded = Vec::with_capacity(elements.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(target) => loaded.push(target),
                Err(e) => {
                    return Err(HistoryError::Transport(format!(
                        "target derivation task failed: {e}"
                    )))
                }
            }
        }
        // Join order is nondeterministic; the plan is built in element order.
        loaded.sort_by_key(|l| l.target.element);
        Ok(loaded)
    }

    /// Fetch the live state of elements the plan references but does not
    /// touch, so the structural pass can tell a live member from a missing
    /// one.
    async fn fetch_external_refs(
        &self,
        plan: &RevertPlan,
        live: &mut BTreeMap<ElementRef, ElementVersion>,
    ) {
        let wanted: BTreeSet<ElementRef> = plan
            .actions
            .iter()
            .filter(|a| a.op != ActionOp::Delete)
            .flat_map(|a| a.refs())
            .filter(|r| r.id > 0 && !live.contains_key(r) && plan.action_for(*r).is_none())
            .collect();
        for element in wanted {
            self.limiter.until_ready().await;
            match self.history.fetch_current(element).await {
                Ok(version) => {
                    live.insert(element, version);
                }
                Err(HistoryError::NotFound { .. }) => {
                    // Stays absent, which the structural pass reads as
                    // missing.
                }
                Err(e) => {
                    warn!(element = %element, error = %e, "live lookup failed, treating as missing");
                }
            }
        }
    }

    /// Propagate deletions to referrers until no new repair is needed.
    ///
    /// Repairing a parent can empty it and so schedule another delete, which
    /// can hold further parents. The iteration count is bounded; real data
    /// converges in one or two passes.
    async fn fix_parents(
        &self,
        plan: &mut RevertPlan,
        live: &mut BTreeMap<ElementRef, ElementVersion>,
    ) -> Result<(), ConflictError> {
        let bound = 10usize.max(plan.actions.len());
        for _ in 0..bound {
            let deleting: BTreeSet<ElementRef> = plan.deleting().into_iter().collect();
            if deleting.is_empty() {
                return Ok(());
            }

            let mut changed = false;
            for element in &deleting {
                self.limiter.until_ready().await;
                let referrers = self.history.find_referrers(*element).await?;
                let mut referrers: Vec<ElementRef> = referrers
                    .into_iter()
                    .filter(|r| !deleting.contains(r))
                    .collect();
                referrers.sort();

                for referrer in referrers {
                    let in_plan = plan.action_for(referrer).is_some();
                    let parent = match self.projected_parent(referrer, plan, live).await {
                        Some(parent) => parent,
                        None => continue,
                    };
                    if self
                        .resolver
                        .repair_parent(&parent, in_plan, &deleting, plan)
                    {
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
        Err(ConflictError::FixpointDiverged { iterations: bound })
    }

    /// A referrer's state as it will be after the plan applies: the plan's
    /// payload when it rewrites the parent, a fresh live read otherwise.
    /// Referrers are re-read on every repair pass so the fixpoint never acts
    /// on a copy the server has moved past.
    async fn projected_parent(
        &self,
        referrer: ElementRef,
        plan: &RevertPlan,
        live: &mut BTreeMap<ElementRef, ElementVersion>,
    ) -> Option<ElementVersion> {
        if let Some(action) = plan.action_for(referrer) {
            if action.op == ActionOp::Delete {
                return None;
            }
            let base = live.get(&referrer);
            return Some(ElementVersion {
                element: referrer,
                version: action.based_on.unwrap_or(1),
                visible: true,
                tags: action.tags.clone(),
                geometry: action.geometry.clone(),
                changeset: base.map(|v| v.changeset).unwrap_or_default(),
                timestamp: base.map(|v| v.timestamp).unwrap_or_else(chrono::Utc::now),
            });
        }

        self.limiter.until_ready().await;
        match self.history.fetch_current(referrer).await {
            Ok(version) => {
                live.insert(referrer, version.clone());
                version.visible.then_some(version)
            }
            Err(HistoryError::NotFound { .. }) => {
                live.remove(&referrer);
                None
            }
            Err(e) => {
                warn!(referrer = %referrer, error = %e, "referrer lookup failed, leaving it alone");
                None
            }
        }
    }
}
