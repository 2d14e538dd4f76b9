//! Per-element resolution: turning a revert target plus the live state into
//! an action (or a reasoned refusal), and the structural passes that keep the
//! resulting plan referentially sound.
//!
//! Ordering of checks matters. "Already reverted" is decided before any
//! merge is attempted so a re-run of the same revert produces an empty plan.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::config::ParentPolicy;
use crate::conflict::merger::{
    self, FuzzyTagMerger, MergePath, TagMerge,
};
use crate::models::{
    ActionOp, ConflictKind, ConflictRecord, ElementRef, ElementVersion, Geometry, RelationMember,
    Resolution, RevertAction, RevertPlan, RevertTarget, TargetKind,
};

/// Resolves targets into plan actions under a structural-conflict policy.
pub struct ConflictResolver<M: TagMerge = FuzzyTagMerger> {
    policy: ParentPolicy,
    merger: M,
}

impl ConflictResolver<FuzzyTagMerger> {
    pub fn new(policy: ParentPolicy) -> Self {
        Self {
            policy,
            merger: FuzzyTagMerger,
        }
    }
}

impl<M: TagMerge> ConflictResolver<M> {
    pub fn with_merger(policy: ParentPolicy, merger: M) -> Self {
        Self { policy, merger }
    }

    pub fn policy(&self) -> ParentPolicy {
        self.policy
    }

    // -----------------------------------------------------------------------
    // Target resolution
    // -----------------------------------------------------------------------

    /// Resolve one target against the element's live state, appending at most
    /// one action and any explanatory records to the plan.
    pub fn resolve(
        &self,
        target: &RevertTarget,
        current: &ElementVersion,
        plan: &mut RevertPlan,
    ) {
        match &target.kind {
            TargetKind::Unresolved { reason } => {
                warn!(element = %target.element, reason, "target unresolved, excluding");
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::Structural,
                    Resolution::Unresolved,
                    reason.clone(),
                ));
            }
            TargetKind::Delete => self.resolve_delete(target, current, plan),
            TargetKind::Restore => self.resolve_restore(target, current, plan),
            TargetKind::Recreate => self.resolve_recreate(target, current, plan),
        }
    }

    /// The selected changesets created the element; undo by deleting it.
    fn resolve_delete(
        &self,
        target: &RevertTarget,
        current: &ElementVersion,
        plan: &mut RevertPlan,
    ) {
        if !current.visible {
            debug!(element = %target.element, "already deleted, nothing to do");
            plan.records.push(ConflictRecord::new(
                target.element,
                ConflictKind::None,
                Resolution::Clean,
                "element was already deleted",
            ));
            return;
        }

        if let Some(new) = &target.new {
            if !current.content_eq(new) {
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::Tag,
                    Resolution::Clean,
                    "element changed after creation; deleting the later state too",
                ));
            }
        }

        plan.upsert_action(RevertAction::delete(target.element, current.version));
    }

    /// The selected changesets modified the element; restore the prior state,
    /// carrying later edits forward where they exist.
    fn resolve_restore(
        &self,
        target: &RevertTarget,
        current: &ElementVersion,
        plan: &mut RevertPlan,
    ) {
        let (old, new) = match (&target.old, &target.new) {
            (Some(old), Some(new)) => (old, new),
            _ => {
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::Structural,
                    Resolution::Unresolved,
                    "restore target is missing its history endpoints",
                ));
                return;
            }
        };

        if current.content_eq(old) {
            debug!(element = %target.element, "already at restored state");
            plan.records.push(ConflictRecord::new(
                target.element,
                ConflictKind::None,
                Resolution::Clean,
                "element is already at the state being restored",
            ));
            return;
        }

        if !current.visible {
            info!(element = %target.element, "deleted since the selected edits, leaving as is");
            plan.records.push(ConflictRecord::new(
                target.element,
                ConflictKind::Structural,
                Resolution::Abandoned,
                "element was deleted after the selected changesets",
            ));
            return;
        }

        // Verbatim restore only when the history showed no unrelated later
        // edits and the live content confirms it; otherwise carry outside
        // work through the merge.
        if !target.touched_after && current.content_eq(new) {
            plan.upsert_action(RevertAction::modify(
                target.element,
                old.tags.clone(),
                old.geometry.clone(),
                current.version,
            ));
            return;
        }

        self.resolve_restore_merged(target, old, new, current, plan);
    }

    /// Later edits exist on top of the selected ones; merge them back in.
    fn resolve_restore_merged(
        &self,
        target: &RevertTarget,
        old: &ElementVersion,
        new: &ElementVersion,
        current: &ElementVersion,
        plan: &mut RevertPlan,
    ) {
        let (tags, path) = self.merger.merge(&old.tags, &new.tags, &current.tags);
        let tag_conflict = tags != old.tags || path == MergePath::KeyWise;

        let geometry = match self.merge_geometry(target.element, old, new, current, plan) {
            GeometryOutcome::Keep(geometry) => geometry,
            GeometryOutcome::Abandon(reason) => {
                info!(element = %target.element, reason, "abandoning restore");
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::Structural,
                    Resolution::Abandoned,
                    reason,
                ));
                return;
            }
        };

        if tags == current.tags && geometry == current.geometry {
            plan.records.push(ConflictRecord::new(
                target.element,
                ConflictKind::Tag,
                Resolution::Clean,
                "later edits already undid the selected changes",
            ));
            return;
        }

        if tag_conflict {
            plan.records.push(ConflictRecord::new(
                target.element,
                ConflictKind::Tag,
                Resolution::MergedTags,
                "tags reconciled with edits made after the selected changesets",
            ));
        }

        plan.stats.count_fix(target.element.kind);
        plan.upsert_action(RevertAction::modify(
            target.element,
            tags,
            geometry,
            current.version,
        ));
    }

    /// Three-way geometry reconciliation for one element.
    fn merge_geometry(
        &self,
        element: ElementRef,
        old: &ElementVersion,
        new: &ElementVersion,
        current: &ElementVersion,
        plan: &mut RevertPlan,
    ) -> GeometryOutcome {
        match (&old.geometry, &new.geometry, &current.geometry) {
            (
                Some(Geometry::Node { lat: olat, lon: olon }),
                Some(Geometry::Node { lat: nlat, lon: nlon }),
                Some(Geometry::Node { lat: clat, lon: clon }),
            ) => {
                // Undo the move only if nobody moved it since.
                let geometry = if clat == nlat && clon == nlon {
                    Geometry::Node {
                        lat: *olat,
                        lon: *olon,
                    }
                } else {
                    Geometry::Node {
                        lat: *clat,
                        lon: *clon,
                    }
                };
                GeometryOutcome::Keep(Some(geometry))
            }
            (
                Some(Geometry::Way { nodes: old_nodes }),
                Some(Geometry::Way { nodes: new_nodes }),
                Some(Geometry::Way { nodes: cur_nodes }),
            ) => self.merge_way_nodes(element, old_nodes, new_nodes, cur_nodes, plan),
            (
                Some(Geometry::Relation { members: old_m }),
                Some(Geometry::Relation { members: new_m }),
                Some(Geometry::Relation { members: cur_m }),
            ) => self.merge_relation_members(element, old_m, new_m, cur_m, plan),
            _ => GeometryOutcome::Abandon(
                "geometry payloads are incomplete or of mismatched types".into(),
            ),
        }
    }

    fn merge_way_nodes(
        &self,
        element: ElementRef,
        old_nodes: &[i64],
        new_nodes: &[i64],
        cur_nodes: &[i64],
        plan: &mut RevertPlan,
    ) -> GeometryOutcome {
        if cur_nodes == new_nodes {
            return GeometryOutcome::Keep(Some(Geometry::Way {
                nodes: old_nodes.to_vec(),
            }));
        }

        // Somebody already took the added nodes out, possibly reordering the
        // way; their list stands.
        let old_set: BTreeSet<i64> = old_nodes.iter().copied().collect();
        let cur_set: BTreeSet<i64> = cur_nodes.iter().copied().collect();
        if old_set == cur_set {
            return GeometryOutcome::Keep(Some(Geometry::Way {
                nodes: cur_nodes.to_vec(),
            }));
        }

        if let Some(nodes) = merger::fuzzy_merge_nodes(old_nodes, new_nodes, cur_nodes) {
            plan.stats.merge_way += 1;
            plan.stats.merge_way_ids.push(element.id);
            plan.records.push(ConflictRecord::new(
                element,
                ConflictKind::Structural,
                Resolution::MergedMembers,
                "node list reconciled with edits made after the selected changesets",
            ));
            return GeometryOutcome::Keep(Some(Geometry::Way { nodes }));
        }

        match self.policy {
            ParentPolicy::ForceRemove => {
                let added: BTreeSet<i64> = new_nodes
                    .iter()
                    .filter(|id| !old_nodes.contains(id))
                    .copied()
                    .collect();
                let nodes: Vec<i64> = cur_nodes
                    .iter()
                    .filter(|id| !added.contains(id))
                    .copied()
                    .collect();
                warn!(element = %element, "node-list merge failed, removing added nodes only");
                plan.stats.merge_fail_way += 1;
                plan.stats.merge_fail_way_ids.push(element.id);
                plan.stats.warnings.push(element);
                plan.records.push(ConflictRecord::new(
                    element,
                    ConflictKind::Structural,
                    Resolution::StrippedRefs,
                    "node-list merge failed; removed only the nodes the selected changesets added",
                ));
                GeometryOutcome::Keep(Some(Geometry::Way { nodes }))
            }
            ParentPolicy::Skip => GeometryOutcome::Abandon(
                "node-list merge failed and the skip policy forbids partial restores".into(),
            ),
        }
    }

    fn merge_relation_members(
        &self,
        element: ElementRef,
        old_m: &[RelationMember],
        new_m: &[RelationMember],
        cur_m: &[RelationMember],
        plan: &mut RevertPlan,
    ) -> GeometryOutcome {
        if cur_m == new_m {
            return GeometryOutcome::Keep(Some(Geometry::Relation {
                members: old_m.to_vec(),
            }));
        }

        // A reordered copy of the old member set means somebody already
        // reverted the membership; their list stands.
        let old_set: BTreeSet<&RelationMember> = old_m.iter().collect();
        let cur_set: BTreeSet<&RelationMember> = cur_m.iter().collect();
        if old_set == cur_set {
            return GeometryOutcome::Keep(Some(Geometry::Relation {
                members: cur_m.to_vec(),
            }));
        }

        if let Some(members) = merger::fuzzy_merge_members(old_m, new_m, cur_m) {
            plan.stats.merge_relation += 1;
            plan.stats.merge_relation_ids.push(element.id);
            plan.records.push(ConflictRecord::new(
                element,
                ConflictKind::Structural,
                Resolution::MergedMembers,
                "member list reconciled with edits made after the selected changesets",
            ));
            return GeometryOutcome::Keep(Some(Geometry::Relation { members }));
        }

        match self.policy {
            ParentPolicy::ForceRemove => {
                let added: BTreeSet<&RelationMember> =
                    new_m.iter().filter(|m| !old_m.contains(m)).collect();
                let members: Vec<RelationMember> = cur_m
                    .iter()
                    .filter(|m| !added.contains(m))
                    .cloned()
                    .collect();
                warn!(element = %element, "member-list merge failed, removing added members only");
                plan.stats.merge_fail_relation += 1;
                plan.stats.merge_fail_relation_ids.push(element.id);
                plan.stats.warnings.push(element);
                plan.records.push(ConflictRecord::new(
                    element,
                    ConflictKind::Structural,
                    Resolution::StrippedRefs,
                    "member-list merge failed; removed only the members the selected changesets added",
                ));
                GeometryOutcome::Keep(Some(Geometry::Relation { members }))
            }
            ParentPolicy::Skip => GeometryOutcome::Abandon(
                "member-list merge failed and the skip policy forbids partial restores".into(),
            ),
        }
    }

    /// The selected changesets deleted the element; bring the content back.
    fn resolve_recreate(
        &self,
        target: &RevertTarget,
        current: &ElementVersion,
        plan: &mut RevertPlan,
    ) {
        let old = match &target.old {
            Some(old) => old,
            None => {
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::Structural,
                    Resolution::Unresolved,
                    "recreate target is missing its pre-deletion version",
                ));
                return;
            }
        };

        if current.visible {
            if current.content_eq(old) {
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::None,
                    Resolution::Clean,
                    "element was already restored",
                ));
            } else {
                info!(element = %target.element, "recreated with new content since, leaving as is");
                plan.records.push(ConflictRecord::new(
                    target.element,
                    ConflictKind::Structural,
                    Resolution::Abandoned,
                    "element was recreated with different content after the selected changesets",
                ));
            }
            return;
        }

        // Deleted ids cannot be revived in place; the content comes back
        // under a fresh id the assembler allocates.
        plan.upsert_action(RevertAction::create(
            target.element,
            old.tags.clone(),
            old.geometry.clone(),
        ));
    }

    // -----------------------------------------------------------------------
    // Structural reconciliation
    // -----------------------------------------------------------------------

    /// Remove dangling references between plan actions.
    ///
    /// `live` must hold the live state of every element referenced by a
    /// create or modify action that the plan itself does not touch; an
    /// absent or invisible entry counts as missing. Converting an emptied
    /// container to a delete can cascade, so the pass loops to a fixpoint
    /// bounded by the action count.
    pub fn reconcile_structure(
        &self,
        plan: &mut RevertPlan,
        live: &BTreeMap<ElementRef, ElementVersion>,
    ) {
        let limit = plan.actions.len() + 1;
        for _ in 0..limit {
            if !self.reconcile_pass(plan, live) {
                return;
            }
        }
    }

    fn reconcile_pass(
        &self,
        plan: &mut RevertPlan,
        live: &BTreeMap<ElementRef, ElementVersion>,
    ) -> bool {
        let deleting: BTreeSet<ElementRef> = plan.deleting().into_iter().collect();
        let providing: BTreeSet<ElementRef> = plan
            .actions
            .iter()
            .filter(|a| a.op != ActionOp::Delete)
            .map(|a| a.element)
            .collect();

        let elements: Vec<ElementRef> = plan
            .actions
            .iter()
            .filter(|a| a.op != ActionOp::Delete)
            .map(|a| a.element)
            .collect();

        let mut changed = false;
        for element in elements {
            let action = match plan.action_for(element) {
                Some(a) => a.clone(),
                None => continue,
            };
            let bad: Vec<ElementRef> = action
                .refs()
                .into_iter()
                .filter(|r| {
                    deleting.contains(r)
                        || (!providing.contains(r)
                            && !live.get(r).map(|v| v.visible).unwrap_or(false))
                })
                .collect();
            if bad.is_empty() {
                continue;
            }

            changed = true;
            match self.policy {
                ParentPolicy::ForceRemove => {
                    self.strip_refs_or_collapse(action, &bad, plan);
                }
                ParentPolicy::Skip => {
                    info!(element = %element, "dangling references, abandoning under skip policy");
                    plan.remove_action(element);
                    plan.records.push(ConflictRecord::new(
                        element,
                        ConflictKind::Structural,
                        Resolution::Abandoned,
                        "restored state would reference elements that no longer exist",
                    ));
                }
            }
        }
        changed
    }

    /// Strip the named refs from an action; an emptied container becomes a
    /// delete (a way needs at least two nodes to stay meaningful).
    fn strip_refs_or_collapse(
        &self,
        mut action: RevertAction,
        bad: &[ElementRef],
        plan: &mut RevertPlan,
    ) {
        let element = action.element;
        let bad: BTreeSet<ElementRef> = bad.iter().copied().collect();

        let emptied = match &mut action.geometry {
            Some(Geometry::Way { nodes }) => {
                nodes.retain(|id| !bad.contains(&ElementRef::node(*id)));
                nodes.len() < 2
            }
            Some(Geometry::Relation { members }) => {
                members.retain(|m| {
                    !bad.contains(&ElementRef {
                        kind: m.member_type,
                        id: m.member_ref,
                    })
                });
                members.is_empty()
            }
            _ => false,
        };

        plan.stats.warnings.push(element);

        if emptied {
            warn!(element = %element, "emptied by reference stripping");
            match action.based_on {
                // A restore that would leave nothing behind turns into a
                // delete of the live element.
                Some(version) => {
                    plan.upsert_action(RevertAction::delete(element, version));
                }
                // An emptied recreate is simply dropped.
                None => {
                    plan.remove_action(element);
                }
            }
            plan.records.push(ConflictRecord::new(
                element,
                ConflictKind::Structural,
                Resolution::StrippedRefs,
                "restored state emptied after removing missing references",
            ));
        } else {
            action.deps = action.refs();
            plan.upsert_action(action);
            plan.records.push(ConflictRecord::new(
                element,
                ConflictKind::Structural,
                Resolution::StrippedRefs,
                "removed references to elements that no longer exist",
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Parent repair
    // -----------------------------------------------------------------------

    /// Repair one referrer of elements the plan deletes.
    ///
    /// `parent` is the referrer's projected state (the plan's payload when it
    /// already carries an action for it, the live state otherwise) and
    /// `in_plan` says which. Returns `true` when the plan changed.
    pub fn repair_parent(
        &self,
        parent: &ElementVersion,
        in_plan: bool,
        deleted: &BTreeSet<ElementRef>,
        plan: &mut RevertPlan,
    ) -> bool {
        let held: Vec<ElementRef> = parent
            .member_refs()
            .into_iter()
            .filter(|r| deleted.contains(r))
            .collect();
        if held.is_empty() {
            return false;
        }

        match self.policy {
            ParentPolicy::ForceRemove => {
                let action = RevertAction::modify(
                    parent.element,
                    parent.tags.clone(),
                    parent.geometry.clone(),
                    parent.version,
                );
                self.strip_refs_or_collapse(action, &held, plan);
                // strip_refs_or_collapse records StrippedRefs; note the
                // repair itself when the parent was untouched until now.
                if !in_plan {
                    plan.records.push(ConflictRecord::new(
                        parent.element,
                        ConflictKind::Structural,
                        Resolution::ParentRepaired,
                        "referrer outside the selected changesets was edited to release deleted members",
                    ));
                }
                true
            }
            ParentPolicy::Skip => {
                if in_plan {
                    // The plan already rewrites this parent; its payload is
                    // reconciled by the structural pass instead.
                    return false;
                }
                let mut changed = false;
                for child in held {
                    if plan.remove_action(child) {
                        changed = true;
                        info!(child = %child, parent = %parent.element,
                            "keeping element alive, an outside referrer still uses it");
                        plan.records.push(ConflictRecord::new(
                            child,
                            ConflictKind::Structural,
                            Resolution::Abandoned,
                            format!("still referenced by {}", parent.element),
                        ));
                    }
                }
                changed
            }
        }
    }
}

enum GeometryOutcome {
    Keep(Option<Geometry>),
    Abandon(String),
}
