//! Domain model types used throughout the revert engine.
//!
//! [`ElementVersion`] records are read-only facts fetched from history.
//! [`RevertTarget`], [`ConflictRecord`] and [`RevertAction`] are created once
//! per run and never persisted past it; re-derivation always produces a fresh
//! value instead of mutating in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Element identity
// ---------------------------------------------------------------------------

/// The three OSM element kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

impl ElementType {
    /// The XML element name used by the OSM API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }

    /// Parse an element-type string as produced by the API.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "node" => Some(Self::Node),
            "way" => Some(Self::Way),
            "relation" => Some(Self::Relation),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one map element. Ids are never reused across types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementRef {
    pub kind: ElementType,
    pub id: i64,
}

impl ElementRef {
    pub fn node(id: i64) -> Self {
        Self {
            kind: ElementType::Node,
            id,
        }
    }

    pub fn way(id: i64) -> Self {
        Self {
            kind: ElementType::Way,
            id,
        }
    }

    pub fn relation(id: i64) -> Self {
        Self {
            kind: ElementType::Relation,
            id,
        }
    }
}

impl std::fmt::Display for ElementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// ---------------------------------------------------------------------------
// Element content
// ---------------------------------------------------------------------------

/// Tag mapping. `BTreeMap` keeps iteration (and therefore every serialized
/// form) deterministic.
pub type Tags = BTreeMap<String, String>;

/// One member of a relation: a typed reference plus its role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationMember {
    #[serde(rename = "type")]
    pub member_type: ElementType,
    #[serde(rename = "ref")]
    pub member_ref: i64,
    pub role: String,
}

/// Per-type geometry payload of an element version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Geometry {
    Node { lat: f64, lon: f64 },
    Way { nodes: Vec<i64> },
    Relation { members: Vec<RelationMember> },
}

impl Geometry {
    /// All element references this geometry depends on.
    pub fn refs(&self) -> Vec<ElementRef> {
        match self {
            Self::Node { .. } => Vec::new(),
            Self::Way { nodes } => nodes.iter().map(|id| ElementRef::node(*id)).collect(),
            Self::Relation { members } => members
                .iter()
                .map(|m| ElementRef {
                    kind: m.member_type,
                    id: m.member_ref,
                })
                .collect(),
        }
    }
}

/// Immutable snapshot of one element at one version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementVersion {
    pub element: ElementRef,
    /// Monotonic, starts at 1.
    pub version: u64,
    /// `false` means the element is deleted at this version.
    pub visible: bool,
    pub tags: Tags,
    /// `None` for deleted versions (the API returns no payload for them).
    pub geometry: Option<Geometry>,
    /// Changeset that produced this version.
    pub changeset: i64,
    pub timestamp: DateTime<Utc>,
}

impl ElementVersion {
    /// Content equality: tags, geometry and visibility. Version number,
    /// changeset id and timestamp are bookkeeping, not content.
    pub fn content_eq(&self, other: &Self) -> bool {
        self.visible == other.visible && self.tags == other.tags && self.geometry == other.geometry
    }

    /// Element references this version depends on.
    pub fn member_refs(&self) -> Vec<ElementRef> {
        self.geometry.as_ref().map(Geometry::refs).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Revert target
// ---------------------------------------------------------------------------

/// What kind of revert one element needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// The selected changesets created it: revert deletes it.
    Delete,
    /// The selected changesets modified it: restore the prior version.
    Restore,
    /// The selected changesets deleted it: recreate it as a new element.
    Recreate,
    /// History could not be fetched; requires manual exclusion.
    Unresolved { reason: String },
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::Restore => write!(f, "restore"),
            Self::Recreate => write!(f, "recreate"),
            Self::Unresolved { .. } => write!(f, "unresolved"),
        }
    }
}

/// The computed "should become" state for one element.
///
/// Derived once per element per run; re-derivation produces a new value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevertTarget {
    pub element: ElementRef,
    pub kind: TargetKind,
    /// State to restore (the version preceding the earliest selected edit,
    /// or the pre-deletion version for [`TargetKind::Recreate`]).
    pub old: Option<ElementVersion>,
    /// State the selected changesets left behind (the target's based-on).
    pub new: Option<ElementVersion>,
    /// Unrelated changesets edited the element after the selected ones.
    /// Consumed by the conflict resolver, not here.
    pub touched_after: bool,
}

// ---------------------------------------------------------------------------
// Conflict record
// ---------------------------------------------------------------------------

/// Conflict classification for one element.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    None,
    Tag,
    Structural,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Tag => write!(f, "tag"),
            Self::Structural => write!(f, "structural"),
        }
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Target applied verbatim (or nothing needed doing).
    Clean,
    /// Tags reconciled by the merge strategy.
    MergedTags,
    /// Member list reconciled by the fuzzy patcher.
    MergedMembers,
    /// Member references stripped under the force-remove policy.
    StrippedRefs,
    /// A referrer outside the input changesets was repaired.
    ParentRepaired,
    /// The element was left at its current live state.
    Abandoned,
    /// History unavailable; the element needs manual exclusion.
    Unresolved,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::MergedTags => write!(f, "merged_tags"),
            Self::MergedMembers => write!(f, "merged_members"),
            Self::StrippedRefs => write!(f, "stripped_refs"),
            Self::ParentRepaired => write!(f, "parent_repaired"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// Per-element account of what the resolver decided and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub element: ElementRef,
    pub kind: ConflictKind,
    pub resolution: Resolution,
    /// Free-text explanation for the log.
    pub explanation: String,
}

impl ConflictRecord {
    pub fn new(
        element: ElementRef,
        kind: ConflictKind,
        resolution: Resolution,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            element,
            kind,
            resolution,
            explanation: explanation.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Revert action
// ---------------------------------------------------------------------------

/// Final operation applied to the server for one element.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionOp {
    Create,
    Modify,
    Delete,
}

impl std::fmt::Display for ActionOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// The final, resolved instruction for one element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RevertAction {
    pub op: ActionOp,
    pub element: ElementRef,
    pub tags: Tags,
    pub geometry: Option<Geometry>,
    /// Must equal the element's true current live version at upload time.
    /// `None` only for creates.
    pub based_on: Option<u64>,
    /// Negative batch-scoped id assigned by the assembler to creates.
    pub placeholder: Option<i64>,
    /// Ids this action requires to already exist in the same batch.
    pub deps: Vec<ElementRef>,
}

impl RevertAction {
    pub fn delete(element: ElementRef, based_on: u64) -> Self {
        Self {
            op: ActionOp::Delete,
            element,
            tags: Tags::new(),
            geometry: None,
            based_on: Some(based_on),
            placeholder: None,
            deps: Vec::new(),
        }
    }

    pub fn modify(
        element: ElementRef,
        tags: Tags,
        geometry: Option<Geometry>,
        based_on: u64,
    ) -> Self {
        let deps = geometry.as_ref().map(Geometry::refs).unwrap_or_default();
        Self {
            op: ActionOp::Modify,
            element,
            tags,
            geometry,
            based_on: Some(based_on),
            placeholder: None,
            deps,
        }
    }

    pub fn create(element: ElementRef, tags: Tags, geometry: Option<Geometry>) -> Self {
        let deps = geometry.as_ref().map(Geometry::refs).unwrap_or_default();
        Self {
            op: ActionOp::Create,
            element,
            tags,
            geometry,
            based_on: None,
            placeholder: None,
            deps,
        }
    }

    /// Element references in this action's payload.
    pub fn refs(&self) -> Vec<ElementRef> {
        self.geometry.as_ref().map(Geometry::refs).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Revert plan
// ---------------------------------------------------------------------------

/// The resolved, not-yet-ordered unit handed to the assembler, plus the
/// accumulated conflict records.
#[derive(Debug, Clone, Default)]
pub struct RevertPlan {
    pub actions: Vec<RevertAction>,
    pub records: Vec<ConflictRecord>,
    pub stats: RevertStats,
    /// Sorted, deduplicated source changeset ids.
    pub source_changesets: Vec<i64>,
}

impl RevertPlan {
    /// Look up the action for an element, if any.
    pub fn action_for(&self, element: ElementRef) -> Option<&RevertAction> {
        self.actions.iter().find(|a| a.element == element)
    }

    /// Replace or insert the action for `action.element`. Returns `true` when
    /// the element was not in the plan before.
    pub fn upsert_action(&mut self, action: RevertAction) -> bool {
        match self.actions.iter_mut().find(|a| a.element == action.element) {
            Some(slot) => {
                *slot = action;
                false
            }
            None => {
                self.actions.push(action);
                true
            }
        }
    }

    /// Drop the action for an element. Returns `true` if one was present.
    pub fn remove_action(&mut self, element: ElementRef) -> bool {
        let before = self.actions.len();
        self.actions.retain(|a| a.element != element);
        self.actions.len() != before
    }

    /// Elements currently scheduled for deletion, in deterministic order.
    pub fn deleting(&self) -> Vec<ElementRef> {
        let mut refs: Vec<ElementRef> = self
            .actions
            .iter()
            .filter(|a| a.op == ActionOp::Delete)
            .map(|a| a.element)
            .collect();
        refs.sort();
        refs
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters accumulated across a revert run, folded into the changeset tags
/// and the final report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevertStats {
    /// Advanced (merge-based) reverts per element type.
    pub fix_node: u64,
    pub fix_way: u64,
    pub fix_relation: u64,
    /// Successful fuzzy member-list merges.
    pub merge_way: u64,
    pub merge_way_ids: Vec<i64>,
    pub merge_relation: u64,
    pub merge_relation_ids: Vec<i64>,
    /// Fuzzy merges that fell back to stripping refs.
    pub merge_fail_way: u64,
    pub merge_fail_way_ids: Vec<i64>,
    pub merge_fail_relation: u64,
    pub merge_fail_relation_ids: Vec<i64>,
    /// Elements worth a manual look after upload.
    pub warnings: Vec<ElementRef>,
}

impl RevertStats {
    /// Record an advanced revert on the given element type.
    pub fn count_fix(&mut self, kind: ElementType) {
        match kind {
            ElementType::Node => self.fix_node += 1,
            ElementType::Way => self.fix_way += 1,
            ElementType::Relation => self.fix_relation += 1,
        }
    }

    /// Non-zero counters as changeset tag key/value pairs. List values join
    /// with `;`.
    pub fn to_tag_pairs(&self) -> Vec<(String, String)> {
        fn join(ids: &[i64]) -> String {
            ids.iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(";")
        }

        let mut pairs = Vec::new();
        for (key, count) in [
            ("fix:node", self.fix_node),
            ("fix:way", self.fix_way),
            ("fix:relation", self.fix_relation),
            ("merge:way", self.merge_way),
            ("merge:relation", self.merge_relation),
            ("merge:fail:way", self.merge_fail_way),
            ("merge:fail:relation", self.merge_fail_relation),
        ] {
            if count > 0 {
                pairs.push((key.to_string(), count.to_string()));
            }
        }
        for (key, ids) in [
            ("merge:way:id", &self.merge_way_ids),
            ("merge:relation:id", &self.merge_relation_ids),
            ("merge:fail:way:id", &self.merge_fail_way_ids),
            ("merge:fail:relation:id", &self.merge_fail_relation_ids),
        ] {
            if !ids.is_empty() {
                pairs.push((key.to_string(), join(ids)));
            }
        }
        pairs
    }
}
