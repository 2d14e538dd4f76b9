//! Target derivation: from selected changeset ids to per-element revert
//! targets.
//!
//! For each touched element the planner reads the full version history,
//! isolates the versions the selected changesets produced, and classifies
//! what undoing them means. A history that cannot be read never aborts the
//! run; the element comes back as an unresolved target the resolver will
//! exclude with a record.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::api::{ChangesetEdit, HistorySource};
use crate::errors::HistoryError;
use crate::models::{ElementRef, ElementVersion, RevertTarget, TargetKind};

/// A target plus the live state it was classified against. `current` is
/// `None` only for unresolved targets.
#[derive(Debug, Clone)]
pub struct LoadedTarget {
    pub target: RevertTarget,
    pub current: Option<ElementVersion>,
}

/// Stateless target-derivation operations.
pub struct Planner;

impl Planner {
    /// The distinct elements the given changesets touched, in deterministic
    /// order.
    pub fn touched_elements(edits: &[ChangesetEdit]) -> Vec<ElementRef> {
        let set: BTreeSet<ElementRef> = edits.iter().map(|e| e.element).collect();
        set.into_iter().collect()
    }

    /// Build the target for one element against the selected changeset set.
    pub async fn load_target<H: HistorySource>(
        source: &H,
        element: ElementRef,
        selected: &BTreeSet<i64>,
    ) -> LoadedTarget {
        let history = match source.fetch_history(element).await {
            Ok(history) => history,
            Err(e) => {
                warn!(element = %element, error = %e, "history unavailable");
                return Self::unresolved(element, format!("history unavailable: {e}"));
            }
        };

        let selected_versions: Vec<&ElementVersion> = history
            .iter()
            .filter(|v| selected.contains(&v.changeset))
            .collect();
        let (earliest, latest) = match (selected_versions.first(), selected_versions.last()) {
            (Some(first), Some(last)) => (*first, *last),
            // Redacted or withheld versions leave no trace to revert from.
            _ => {
                return Self::unresolved(
                    element,
                    "none of the selected edits appear in the element's history",
                )
            }
        };

        // The restore base is the last surviving version before the earliest
        // selected edit. Redaction can punch holes in the numbering, so this
        // is a search, not version arithmetic; anything before `earliest`
        // cannot itself be selected.
        let prior = history
            .iter()
            .filter(|v| v.version < earliest.version)
            .next_back();
        if prior.is_none() && earliest.version > 1 {
            return Self::unresolved(
                element,
                "all versions before the earliest selected edit are withheld",
            );
        }
        let touched_after = history
            .iter()
            .any(|v| v.version > latest.version && !selected.contains(&v.changeset));

        let kind_and_old = match prior {
            // First version ever: the selected changesets created it.
            None => (TargetKind::Delete, None),
            Some(prior) if !prior.visible => {
                // Was deleted before; whatever the selected edits brought
                // back goes away again.
                (TargetKind::Delete, None)
            }
            Some(prior) if latest.visible => (TargetKind::Restore, Some(prior.clone())),
            Some(_) => {
                // The selected edits ended in a deletion; recreate from the
                // last visible state before that deletion.
                let before_delete = history
                    .iter()
                    .filter(|v| v.version < latest.version && v.visible)
                    .next_back();
                match before_delete {
                    Some(v) => (TargetKind::Recreate, Some(v.clone())),
                    None => {
                        return Self::unresolved(
                            element,
                            "no visible version precedes the selected deletion",
                        )
                    }
                }
            }
        };
        let (kind, old) = kind_and_old;

        let current = match source.fetch_current(element).await {
            Ok(current) => current,
            // The current endpoint refuses deleted elements; the last
            // history entry is the live state then.
            Err(HistoryError::NotFound { .. }) => match history.last() {
                Some(last) => last.clone(),
                None => return Self::unresolved(element, "element has no history"),
            },
            Err(e) => {
                warn!(element = %element, error = %e, "live state unavailable");
                return Self::unresolved(element, format!("live state unavailable: {e}"));
            }
        };

        debug!(element = %element, kind = %kind, touched_after, "target classified");
        LoadedTarget {
            target: RevertTarget {
                element,
                kind,
                old,
                new: Some(latest.clone()),
                touched_after,
            },
            current: Some(current),
        }
    }

    fn unresolved(element: ElementRef, reason: impl Into<String>) -> LoadedTarget {
        LoadedTarget {
            target: RevertTarget {
                element,
                kind: TargetKind::Unresolved {
                    reason: reason.into(),
                },
                old: None,
                new: None,
                touched_after: false,
            },
            current: None,
        }
    }
}
