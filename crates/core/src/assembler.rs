//! Plan assembly: dependency-safe ordering of resolved actions.
//!
//! The server applies a change document top to bottom and rejects any line
//! that references an id that does not exist yet (or no longer exists). The
//! assembler orders actions so every reference is satisfied at its position:
//! creates go dependencies-first, deletes referrers-first, and mutually
//! referencing relations are broken apart into a stripped first pass plus a
//! follow-up edit.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, warn};

use crate::errors::AssembleError;
use crate::models::{
    ActionOp, ElementRef, ElementType, ElementVersion, Geometry, RevertAction,
};

/// Issues negative batch-scoped ids for created elements. Negative ids are
/// never valid on the server, which makes accidental leakage loud.
#[derive(Debug)]
pub struct PlaceholderAlloc {
    seq: AtomicI64,
}

impl PlaceholderAlloc {
    pub fn new() -> Self {
        Self {
            seq: AtomicI64::new(-1),
        }
    }

    pub fn next(&self) -> i64 {
        self.seq.fetch_sub(1, Ordering::Relaxed)
    }
}

impl Default for PlaceholderAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless assembly operations.
pub struct Assembler;

impl Assembler {
    /// Order the plan's actions and assign placeholders to creates.
    ///
    /// `live` supplies member lists and versions for elements the plan
    /// deletes, which delete ordering needs. References to recreated
    /// elements are rewritten to their placeholders throughout.
    pub fn assemble(
        actions: &[RevertAction],
        live: &BTreeMap<ElementRef, ElementVersion>,
        alloc: &PlaceholderAlloc,
    ) -> Result<Vec<RevertAction>, AssembleError> {
        let mut creates = Vec::new();
        let mut modifies = Vec::new();
        let mut deletes = Vec::new();
        for action in actions {
            match action.op {
                ActionOp::Create => creates.push(action.clone()),
                ActionOp::Modify => modifies.push(action.clone()),
                ActionOp::Delete => deletes.push(action.clone()),
            }
        }

        // Deterministic input order before any topological pass.
        let key = |a: &RevertAction| (a.element.kind, a.element.id);
        creates.sort_by_key(key);
        modifies.sort_by_key(key);
        deletes.sort_by_key(key);

        // Recreated elements get fresh ids; every reference to the dead id
        // must follow the placeholder instead.
        let mut placeholders: BTreeMap<ElementRef, i64> = BTreeMap::new();
        for action in &mut creates {
            let id = alloc.next();
            action.placeholder = Some(id);
            placeholders.insert(action.element, id);
        }
        for action in creates
            .iter_mut()
            .chain(modifies.iter_mut())
        {
            rewrite_refs(action, &placeholders);
        }

        let mut ordered = Vec::with_capacity(actions.len() + 2);
        ordered.extend(Self::order_creates(creates, &placeholders));
        ordered.extend(modifies);
        ordered.extend(Self::order_deletes(deletes, live)?);

        Self::verify_order(&ordered)?;
        Ok(ordered)
    }

    /// Creates in dependency-first order: nodes, ways, then relations sorted
    /// so member relations precede their containers. A cycle is emitted with
    /// its internal members stripped, then re-completed by follow-up edits.
    fn order_creates(
        creates: Vec<RevertAction>,
        placeholders: &BTreeMap<ElementRef, i64>,
    ) -> Vec<RevertAction> {
        let mut ordered = Vec::with_capacity(creates.len());
        let mut relations = Vec::new();
        for action in creates {
            match action.element.kind {
                ElementType::Node => ordered.push(action),
                _ => relations.push(action),
            }
        }
        let (ways, relations): (Vec<_>, Vec<_>) = relations
            .into_iter()
            .partition(|a| a.element.kind == ElementType::Way);
        ordered.extend(ways);

        // Kahn's algorithm over created-relation membership.
        let created: BTreeSet<ElementRef> = relations.iter().map(|a| a.element).collect();
        let by_placeholder: BTreeMap<i64, ElementRef> = relations
            .iter()
            .filter_map(|a| a.placeholder.map(|p| (p, a.element)))
            .collect();
        // A created relation's members are already rewritten to placeholders.
        let member_of = |a: &RevertAction| -> Vec<ElementRef> {
            a.refs()
                .into_iter()
                .filter(|r| r.kind == ElementType::Relation)
                .filter_map(|r| by_placeholder.get(&r.id).copied())
                .collect()
        };

        let mut indegree: BTreeMap<ElementRef, usize> = created
            .iter()
            .map(|e| (*e, 0))
            .collect();
        let mut dependents: BTreeMap<ElementRef, Vec<ElementRef>> = BTreeMap::new();
        for action in &relations {
            for member in member_of(action) {
                if member == action.element {
                    continue;
                }
                *indegree.entry(action.element).or_default() += 1;
                dependents.entry(member).or_default().push(action.element);
            }
        }

        let mut pending: BTreeMap<ElementRef, RevertAction> =
            relations.into_iter().map(|a| (a.element, a)).collect();
        let mut queue: VecDeque<ElementRef> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(e, _)| *e)
            .collect();
        while let Some(element) = queue.pop_front() {
            if let Some(action) = pending.remove(&element) {
                ordered.push(action);
            }
            for dep in dependents.get(&element).cloned().unwrap_or_default() {
                if let Some(d) = indegree.get_mut(&dep) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }

        // Whatever remains is mutually referencing: create each with the
        // in-cycle members held back, then patch them in once all exist.
        if !pending.is_empty() {
            let cycle: BTreeSet<i64> = pending
                .values()
                .filter_map(|a| a.placeholder)
                .collect();
            warn!(count = pending.len(), "breaking relation create cycle");
            let mut followups = Vec::new();
            for (_, action) in std::mem::take(&mut pending) {
                let mut stripped = action.clone();
                if let Some(Geometry::Relation { members }) = &mut stripped.geometry {
                    members.retain(|m| {
                        !(m.member_type == ElementType::Relation && cycle.contains(&m.member_ref))
                    });
                }
                stripped.deps = stripped.refs();
                ordered.push(stripped);

                let mut completion = action;
                completion.op = ActionOp::Modify;
                // The stripped create lands at version 1.
                completion.based_on = Some(1);
                followups.push(completion);
            }
            ordered.extend(followups);
        }

        ordered
    }

    /// Deletes in referrer-first order: relations (containers before their
    /// members), then ways, then nodes. A relation delete cycle is broken by
    /// first editing each member list to drop the in-cycle references.
    fn order_deletes(
        deletes: Vec<RevertAction>,
        live: &BTreeMap<ElementRef, ElementVersion>,
    ) -> Result<Vec<RevertAction>, AssembleError> {
        let (relations, rest): (Vec<_>, Vec<_>) = deletes
            .into_iter()
            .partition(|a| a.element.kind == ElementType::Relation);
        let (ways, nodes): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .partition(|a| a.element.kind == ElementType::Way);

        let deleting: BTreeSet<ElementRef> = relations.iter().map(|a| a.element).collect();
        let members_in_cycle_risk = |element: ElementRef| -> Vec<ElementRef> {
            live.get(&element)
                .map(|v| {
                    v.member_refs()
                        .into_iter()
                        .filter(|r| deleting.contains(r) && *r != element)
                        .collect()
                })
                .unwrap_or_default()
        };

        // Edge: container before member. A relation with no deleted
        // referrer can go first.
        let mut indegree: BTreeMap<ElementRef, usize> =
            deleting.iter().map(|e| (*e, 0)).collect();
        let mut dependents: BTreeMap<ElementRef, Vec<ElementRef>> = BTreeMap::new();
        for action in &relations {
            for member in members_in_cycle_risk(action.element) {
                *indegree.entry(member).or_default() += 1;
                dependents.entry(action.element).or_default().push(member);
            }
        }

        let mut ordered = Vec::new();
        let mut pending: BTreeMap<ElementRef, RevertAction> =
            relations.into_iter().map(|a| (a.element, a)).collect();
        let mut queue: VecDeque<ElementRef> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(e, _)| *e)
            .collect();
        while let Some(element) = queue.pop_front() {
            if let Some(action) = pending.remove(&element) {
                ordered.push(action);
            }
            for dep in dependents.get(&element).cloned().unwrap_or_default() {
                if let Some(d) = indegree.get_mut(&dep) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }

        // Remaining relations reference each other. Empty their member
        // lists of in-cycle references first, which bumps their versions by
        // one, then delete against the bumped version.
        if !pending.is_empty() {
            let cycle_ids: Vec<i64> = pending.keys().map(|e| e.id).collect();
            warn!(?cycle_ids, "breaking relation delete cycle");
            let mut final_deletes = Vec::new();
            for (element, action) in std::mem::take(&mut pending) {
                // The stripping edit needs the live member list; without it
                // the cycle cannot be broken.
                let version = match live.get(&element) {
                    Some(version) => version,
                    None => return Err(AssembleError::DependencyCycle(cycle_ids.clone())),
                };
                let cycle_set: BTreeSet<ElementRef> =
                    members_in_cycle_risk(element).into_iter().collect();
                let members = match &version.geometry {
                    Some(Geometry::Relation { members }) => members
                        .iter()
                        .filter(|m| {
                            !cycle_set.contains(&ElementRef {
                                kind: m.member_type,
                                id: m.member_ref,
                            })
                        })
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                ordered.push(RevertAction::modify(
                    element,
                    version.tags.clone(),
                    Some(Geometry::Relation { members }),
                    version.version,
                ));
                let mut bumped = action;
                bumped.based_on = Some(version.version + 1);
                final_deletes.push(bumped);
            }
            ordered.extend(final_deletes);
        }

        ordered.extend(ways);
        ordered.extend(nodes);
        Ok(ordered)
    }

    /// Simulate the document top to bottom and confirm every reference is
    /// satisfiable at its position.
    fn verify_order(ordered: &[RevertAction]) -> Result<(), AssembleError> {
        let pending_creates: BTreeSet<i64> = ordered
            .iter()
            .filter(|a| a.op == ActionOp::Create)
            .filter_map(|a| a.placeholder)
            .collect();
        let mut born: BTreeSet<i64> = BTreeSet::new();
        let mut dead: BTreeSet<ElementRef> = BTreeSet::new();

        for action in ordered {
            for r in action.refs() {
                if dead.contains(&r) {
                    return Err(AssembleError::MissingDependency {
                        element: action.element,
                        missing: r,
                    });
                }
                if r.id < 0 && pending_creates.contains(&r.id) && !born.contains(&r.id) {
                    return Err(AssembleError::MissingDependency {
                        element: action.element,
                        missing: r,
                    });
                }
            }
            match action.op {
                ActionOp::Create => {
                    if let Some(p) = action.placeholder {
                        born.insert(p);
                    }
                }
                ActionOp::Delete => {
                    dead.insert(action.element);
                }
                ActionOp::Modify => {}
            }
        }
        debug!(actions = ordered.len(), "assembled order verified");
        Ok(())
    }
}

fn rewrite_refs(action: &mut RevertAction, placeholders: &BTreeMap<ElementRef, i64>) {
    match &mut action.geometry {
        Some(Geometry::Way { nodes }) => {
            for id in nodes.iter_mut() {
                if let Some(p) = placeholders.get(&ElementRef::node(*id)) {
                    *id = *p;
                }
            }
        }
        Some(Geometry::Relation { members }) => {
            for m in members.iter_mut() {
                let r = ElementRef {
                    kind: m.member_type,
                    id: m.member_ref,
                };
                if let Some(p) = placeholders.get(&r) {
                    m.member_ref = *p;
                }
            }
        }
        _ => {}
    }
    action.deps = action.refs();
}
