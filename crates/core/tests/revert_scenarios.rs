//! End-to-end tests for the revert engine against an in-memory server
//! mirror.
//!
//! The mirror implements both collaborator traits over a mutex-held element
//! store, enforces version checks and referential integrity on upload the
//! way the real API does, and records the changeset lifecycle so tests can
//! assert on it. No network I/O anywhere.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use osm_revert_core::api::{
    ActionResult, ActionStatus, ChangesetApi, ChangesetEdit, HistorySource,
};
use osm_revert_core::config::{DiscussionTarget, RevertConfig};
use osm_revert_core::engine::{RevertEngine, RevertRequest, RunOutcome};
use osm_revert_core::errors::{HistoryError, RevertError, UploadError};
use osm_revert_core::models::{
    ActionOp, ElementRef, ElementType, ElementVersion, Geometry, RelationMember, Resolution,
    RevertAction, Tags,
};
use osm_revert_core::progress::ProgressLog;

// ===========================================================================
// In-memory mirror
// ===========================================================================

#[derive(Default)]
struct MirrorState {
    histories: BTreeMap<ElementRef, Vec<ElementVersion>>,
    next_changeset: i64,
    next_element_id: i64,
    open_changesets: Vec<(i64, Tags)>,
    closed_changesets: Vec<i64>,
    comments: Vec<(i64, String)>,
    max_elements: u64,
    /// Element that gets an external tag edit injected the first time it
    /// shows up in a submitted batch, simulating a mapper racing the revert.
    race_once: Option<(ElementRef, &'static str, &'static str)>,
}

struct Mirror {
    state: Mutex<MirrorState>,
}

impl Mirror {
    fn new() -> Self {
        Self {
            state: Mutex::new(MirrorState {
                next_changeset: 9000,
                next_element_id: 5000,
                max_elements: 10_000,
                ..MirrorState::default()
            }),
        }
    }

    fn seed(&self, versions: Vec<ElementVersion>) {
        let mut state = self.state.lock().unwrap();
        for v in versions {
            state.histories.entry(v.element).or_default().push(v);
        }
    }

    fn current(&self, element: ElementRef) -> Option<ElementVersion> {
        let state = self.state.lock().unwrap();
        state.histories.get(&element).and_then(|h| h.last()).cloned()
    }

    fn comments(&self) -> Vec<(i64, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    fn open_tags(&self) -> Vec<(i64, Tags)> {
        self.state.lock().unwrap().open_changesets.clone()
    }

    fn closed(&self) -> Vec<i64> {
        self.state.lock().unwrap().closed_changesets.clone()
    }

    fn set_max_elements(&self, max: u64) {
        self.state.lock().unwrap().max_elements = max;
    }

    fn set_race_once(&self, element: ElementRef, key: &'static str, value: &'static str) {
        self.state.lock().unwrap().race_once = Some((element, key, value));
    }
}

fn referrer_holds(state: &MirrorState, needle: ElementRef, skip: ElementRef) -> bool {
    state.histories.values().any(|h| {
        h.last().is_some_and(|v| {
            v.visible && v.element != skip && v.member_refs().contains(&needle)
        })
    })
}

impl HistorySource for Mirror {
    async fn fetch_history(
        &self,
        element: ElementRef,
    ) -> Result<Vec<ElementVersion>, HistoryError> {
        let state = self.state.lock().unwrap();
        state
            .histories
            .get(&element)
            .cloned()
            .ok_or(HistoryError::NotFound { element })
    }

    async fn fetch_changeset_edits(
        &self,
        changeset_id: i64,
    ) -> Result<Vec<ChangesetEdit>, HistoryError> {
        let state = self.state.lock().unwrap();
        let mut edits = Vec::new();
        for history in state.histories.values() {
            for v in history {
                if v.changeset == changeset_id {
                    edits.push(ChangesetEdit {
                        element: v.element,
                        old_version: (v.version > 1).then(|| v.version - 1),
                        new_version: v.version,
                    });
                }
            }
        }
        if edits.is_empty() {
            return Err(HistoryError::ChangesetNotFound(changeset_id));
        }
        Ok(edits)
    }

    async fn fetch_current(&self, element: ElementRef) -> Result<ElementVersion, HistoryError> {
        let state = self.state.lock().unwrap();
        match state.histories.get(&element).and_then(|h| h.last()) {
            Some(last) if last.visible => Ok(last.clone()),
            _ => Err(HistoryError::NotFound { element }),
        }
    }

    async fn find_referrers(&self, element: ElementRef) -> Result<Vec<ElementRef>, HistoryError> {
        let state = self.state.lock().unwrap();
        let mut referrers = Vec::new();
        for history in state.histories.values() {
            if let Some(last) = history.last() {
                if last.visible && last.member_refs().contains(&element) {
                    referrers.push(last.element);
                }
            }
        }
        Ok(referrers)
    }
}

impl ChangesetApi for Mirror {
    async fn max_changeset_elements(&self) -> Result<u64, UploadError> {
        Ok(self.state.lock().unwrap().max_elements)
    }

    async fn open_changeset(&self, tags: &Tags) -> Result<i64, UploadError> {
        let mut state = self.state.lock().unwrap();
        state.next_changeset += 1;
        let id = state.next_changeset;
        state.open_changesets.push((id, tags.clone()));
        Ok(id)
    }

    async fn submit_batch(
        &self,
        changeset_id: i64,
        batch: &[RevertAction],
    ) -> Result<Vec<ActionResult>, UploadError> {
        let mut state = self.state.lock().unwrap();
        // Inject the racing edit before processing, like a mapper whose
        // upload landed first.
        if let Some((raced, key, value)) = state.race_once.take() {
            if batch.iter().any(|a| a.element == raced) {
                if let Some(mut bumped) = state
                    .histories
                    .get(&raced)
                    .and_then(|h| h.last())
                    .cloned()
                {
                    bumped.version += 1;
                    bumped.changeset = 8888;
                    bumped.tags.insert(key.into(), value.into());
                    state.histories.entry(raced).or_default().push(bumped);
                }
            } else {
                state.race_once = Some((raced, key, value));
            }
        }

        let mut placeholder_map: BTreeMap<i64, i64> = BTreeMap::new();
        let results = batch
            .iter()
            .map(|action| apply_action(&mut state, changeset_id, action, &mut placeholder_map))
            .collect();
        Ok(results)
    }

    async fn close_changeset(&self, changeset_id: i64) -> Result<(), UploadError> {
        self.state.lock().unwrap().closed_changesets.push(changeset_id);
        Ok(())
    }

    async fn post_comment(&self, changeset_id: i64, text: &str) -> Result<(), UploadError> {
        self.state
            .lock()
            .unwrap()
            .comments
            .push((changeset_id, text.to_string()));
        Ok(())
    }
}

fn resolve_placeholders(geometry: Option<Geometry>, map: &BTreeMap<i64, i64>) -> Option<Geometry> {
    match geometry {
        Some(Geometry::Way { mut nodes }) => {
            for id in nodes.iter_mut() {
                if let Some(real) = map.get(id) {
                    *id = *real;
                }
            }
            Some(Geometry::Way { nodes })
        }
        Some(Geometry::Relation { mut members }) => {
            for m in members.iter_mut() {
                if let Some(real) = map.get(&m.member_ref) {
                    m.member_ref = *real;
                }
            }
            Some(Geometry::Relation { members })
        }
        other => other,
    }
}

fn apply_action(
    state: &mut MirrorState,
    changeset_id: i64,
    action: &RevertAction,
    placeholder_map: &mut BTreeMap<i64, i64>,
) -> ActionResult {
    let element = action.element;
    let reject = |status: u16, body: &str| ActionResult {
        element,
        status: ActionStatus::Failed {
            status,
            body: body.to_string(),
        },
    };

    let geometry = resolve_placeholders(action.geometry.clone(), placeholder_map);

    // Reference checks, as the server enforces them.
    if action.op != ActionOp::Delete {
        let refs = geometry.as_ref().map(Geometry::refs).unwrap_or_default();
        for r in refs {
            let ok = state
                .histories
                .get(&r)
                .and_then(|h| h.last())
                .is_some_and(|v| v.visible);
            if !ok {
                return reject(412, &format!("precondition failed: {r} does not exist"));
            }
        }
    }

    match action.op {
        ActionOp::Create => {
            state.next_element_id += 1;
            let new_element = ElementRef {
                kind: element.kind,
                id: state.next_element_id,
            };
            if let Some(p) = action.placeholder {
                placeholder_map.insert(p, new_element.id);
            }
            state.histories.entry(new_element).or_default().push(ElementVersion {
                element: new_element,
                version: 1,
                visible: true,
                tags: action.tags.clone(),
                geometry,
                changeset: changeset_id,
                timestamp: Utc::now(),
            });
            ActionResult {
                element,
                status: ActionStatus::Committed {
                    new_id: new_element.id,
                    new_version: 1,
                },
            }
        }
        ActionOp::Modify | ActionOp::Delete => {
            // An edit of a freshly created element addresses its real id.
            let element_key = match action.placeholder {
                Some(p) if p > 0 => ElementRef {
                    kind: element.kind,
                    id: p,
                },
                Some(p) => match placeholder_map.get(&p) {
                    Some(real) => ElementRef {
                        kind: element.kind,
                        id: *real,
                    },
                    None => element,
                },
                None => element,
            };
            let live = match state.histories.get(&element_key).and_then(|h| h.last()) {
                Some(live) if live.visible => live.clone(),
                _ => return reject(410, "gone"),
            };
            if action.based_on != Some(live.version) {
                return ActionResult {
                    element,
                    status: ActionStatus::VersionConflict {
                        server_version: live.version,
                    },
                };
            }
            if action.op == ActionOp::Delete && referrer_holds(state, element_key, element_key) {
                return reject(412, "still referenced");
            }
            let next = ElementVersion {
                element: element_key,
                version: live.version + 1,
                visible: action.op == ActionOp::Modify,
                tags: action.tags.clone(),
                geometry: if action.op == ActionOp::Modify {
                    geometry
                } else {
                    None
                },
                changeset: changeset_id,
                timestamp: Utc::now(),
            };
            let new_version = next.version;
            state.histories.entry(element_key).or_default().push(next);
            ActionResult {
                element,
                status: ActionStatus::Committed {
                    new_id: element_key.id,
                    new_version,
                },
            }
        }
    }
}

// ===========================================================================
// Helpers
// ===========================================================================

/// Opt-in log output: `RUST_LOG=debug cargo test -- --nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn node(id: i64, version: u64, changeset: i64, lat: f64, lon: f64, t: Tags) -> ElementVersion {
    ElementVersion {
        element: ElementRef::node(id),
        version,
        visible: true,
        tags: t,
        geometry: Some(Geometry::Node { lat, lon }),
        changeset,
        timestamp: Utc::now(),
    }
}

fn way(id: i64, version: u64, changeset: i64, nodes: Vec<i64>, t: Tags) -> ElementVersion {
    ElementVersion {
        element: ElementRef::way(id),
        version,
        visible: true,
        tags: t,
        geometry: Some(Geometry::Way { nodes }),
        changeset,
        timestamp: Utc::now(),
    }
}

fn deleted(element: ElementRef, version: u64, changeset: i64) -> ElementVersion {
    ElementVersion {
        element,
        version,
        visible: false,
        tags: Tags::new(),
        geometry: None,
        changeset,
        timestamp: Utc::now(),
    }
}

fn test_config() -> RevertConfig {
    let mut config = RevertConfig::default();
    // Keep tests fast; the defaults are tuned for the real API.
    config.runtime.requests_per_second = 10_000;
    config.runtime.concurrency = 4;
    config.upload.backoff_base_secs = 0.001;
    config.upload.backoff_max_secs = 0.01;
    config
}

fn engine(mirror: &Arc<Mirror>, config: RevertConfig) -> RevertEngine<Mirror, Mirror> {
    init_tracing();
    RevertEngine::new(
        config,
        Arc::clone(mirror),
        Arc::clone(mirror),
        ProgressLog::disabled(),
    )
    .expect("config should validate")
}

fn request(ids: &[i64]) -> RevertRequest {
    RevertRequest {
        changeset_ids: ids.to_vec(),
        comment: "reverting test vandalism".into(),
    }
}

// ===========================================================================
// Scenario A: plain restore, then idempotent re-run
// ===========================================================================

#[tokio::test]
async fn test_clean_restore_and_idempotent_rerun() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Vandalized")])),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();

    let RunOutcome::Uploaded { changeset_id, committed } = report.outcome else {
        panic!("expected an upload");
    };
    assert_eq!(committed, 1);
    assert_eq!(mirror.closed(), vec![changeset_id]);

    let current = mirror.current(ElementRef::node(1)).unwrap();
    assert_eq!(current.tags, tags(&[("name", "Good")]));
    assert_eq!(current.version, 3);

    // Running the same revert again finds nothing to do and opens nothing.
    let opened_before = mirror.open_tags().len();
    let rerun = engine.run(&request(&[50])).await.unwrap();
    assert!(matches!(rerun.outcome, RunOutcome::NoOp));
    assert_eq!(mirror.open_tags().len(), opened_before);
}

#[tokio::test]
async fn test_changeset_tags_and_discussion_comment() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Bad")])),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();
    let RunOutcome::Uploaded { changeset_id, .. } = report.outcome else {
        panic!("expected an upload");
    };

    let opened = mirror.open_tags();
    let (_, cs_tags) = opened.last().unwrap();
    assert_eq!(
        cs_tags.get("comment").map(String::as_str),
        Some("reverting test vandalism")
    );
    assert_eq!(cs_tags.get("revert:id").map(String::as_str), Some("50"));
    assert!(cs_tags.contains_key("created_by"));

    let comments = mirror.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 50);
    assert!(comments[0].1.contains(&format!("changeset/{changeset_id}")));
}

#[tokio::test]
async fn test_discussion_target_newest_only() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("a", "1")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("a", "2")])),
        node(2, 1, 10, 6.0, 6.0, tags(&[("b", "1")])),
        node(2, 2, 51, 6.0, 6.0, tags(&[("b", "2")])),
    ]);

    let mut config = test_config();
    config.discussion.target = DiscussionTarget::Newest;
    let engine = engine(&mirror, config);
    engine.run(&request(&[50, 51])).await.unwrap();

    let comments = mirror.comments();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 51);
}

// ===========================================================================
// Scenario B: later edits survive the revert
// ===========================================================================

#[tokio::test]
async fn test_later_tag_edit_survives_merge() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Corner Shop"), ("shop", "convenience")])),
        // Selected changeset adds amenity.
        node(
            1,
            2,
            50,
            5.0,
            5.0,
            tags(&[("name", "Corner Shop"), ("shop", "convenience"), ("amenity", "cafe")]),
        ),
        // Somebody else renames afterwards.
        node(
            1,
            3,
            60,
            5.0,
            5.0,
            tags(&[("name", "Corner Store"), ("shop", "convenience"), ("amenity", "cafe")]),
        ),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Uploaded { .. }));

    let current = mirror.current(ElementRef::node(1)).unwrap();
    assert_eq!(current.tags.get("name").map(String::as_str), Some("Corner Store"));
    assert!(!current.tags.contains_key("amenity"));
    assert_eq!(report.stats.fix_node, 1);
}

#[tokio::test]
async fn test_element_deleted_since_is_left_alone() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Bad")])),
        deleted(ElementRef::node(1), 3, 60),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::NoOp));
    assert!(report
        .records
        .iter()
        .any(|r| r.element == ElementRef::node(1) && r.resolution == Resolution::Abandoned));
    assert!(!mirror.current(ElementRef::node(1)).unwrap().visible);
}

// ===========================================================================
// Scenario C: deleting created elements, repairing outside referrers
// ===========================================================================

#[tokio::test]
async fn test_created_node_deleted_and_parent_repaired() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, Tags::new()),
        node(2, 1, 10, 6.0, 6.0, Tags::new()),
        // Selected changeset creates node 100.
        node(100, 1, 50, 5.5, 5.5, Tags::new()),
        // A later, unrelated way picks the new node up.
        way(20, 1, 60, vec![1, 100, 2], tags(&[("highway", "path")])),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Uploaded { .. }));

    // Force-remove policy: the way releases the node, then the node dies.
    let way_now = mirror.current(ElementRef::way(20)).unwrap();
    assert_eq!(way_now.geometry, Some(Geometry::Way { nodes: vec![1, 2] }));
    assert!(!mirror.current(ElementRef::node(100)).unwrap().visible);
    assert!(report
        .records
        .iter()
        .any(|r| r.element == ElementRef::way(20) && r.resolution == Resolution::ParentRepaired));
}

#[tokio::test]
async fn test_skip_policy_keeps_referenced_node_alive() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, Tags::new()),
        node(2, 1, 10, 6.0, 6.0, Tags::new()),
        node(100, 1, 50, 5.5, 5.5, Tags::new()),
        way(20, 1, 60, vec![1, 100, 2], Tags::new()),
    ]);

    let mut config = test_config();
    config.revert.parent_policy = osm_revert_core::config::ParentPolicy::Skip;
    let engine = engine(&mirror, config);
    let report = engine.run(&request(&[50])).await.unwrap();

    // With nothing left to upload the run is a no-op; the node survives.
    assert!(matches!(report.outcome, RunOutcome::NoOp));
    assert!(mirror.current(ElementRef::node(100)).unwrap().visible);
    assert_eq!(
        mirror.current(ElementRef::way(20)).unwrap().geometry,
        Some(Geometry::Way { nodes: vec![1, 100, 2] })
    );
    assert!(report
        .records
        .iter()
        .any(|r| r.element == ElementRef::node(100) && r.resolution == Resolution::Abandoned));
}

// ===========================================================================
// Scenario D: recreating deleted elements under fresh ids
// ===========================================================================

#[tokio::test]
async fn test_deleted_way_recreated_with_fresh_ids() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, Tags::new()),
        node(2, 1, 10, 6.0, 6.0, Tags::new()),
        way(30, 1, 10, vec![1, 2], tags(&[("highway", "track")])),
        // Selected changeset deletes the way and its nodes.
        deleted(ElementRef::way(30), 2, 50),
        deleted(ElementRef::node(1), 2, 50),
        deleted(ElementRef::node(2), 2, 50),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();
    let RunOutcome::Uploaded { committed, .. } = report.outcome else {
        panic!("expected an upload");
    };
    assert_eq!(committed, 3);

    // Old ids stay dead; the content returns under fresh ids.
    assert!(!mirror.current(ElementRef::way(30)).unwrap().visible);
    let new_way = mirror
        .current(ElementRef::way(5003))
        .or_else(|| mirror.current(ElementRef::way(5001)))
        .or_else(|| mirror.current(ElementRef::way(5002)))
        .expect("recreated way should exist");
    assert_eq!(new_way.tags, tags(&[("highway", "track")]));
    let Some(Geometry::Way { nodes }) = &new_way.geometry else {
        panic!("recreated way should have nodes");
    };
    assert_eq!(nodes.len(), 2);
    for id in nodes {
        assert!(*id > 5000, "node refs must point at the recreated nodes");
        assert!(mirror.current(ElementRef::node(*id)).unwrap().visible);
    }
}

#[tokio::test]
async fn test_relation_batch_order_survives_small_batches() {
    // Deleting a relation and its member way across 1-element batches must
    // still delete the container first.
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, Tags::new()),
        node(2, 1, 10, 6.0, 6.0, Tags::new()),
        way(30, 1, 50, vec![1, 2], Tags::new()),
        ElementVersion {
            element: ElementRef::relation(40),
            version: 1,
            visible: true,
            tags: Tags::new(),
            geometry: Some(Geometry::Relation {
                members: vec![RelationMember {
                    member_type: ElementType::Way,
                    member_ref: 30,
                    role: "outer".into(),
                }],
            }),
            changeset: 50,
            timestamp: Utc::now(),
        },
    ]);

    let mut config = test_config();
    config.upload.batch_size = 1;
    let engine = engine(&mirror, config);
    let report = engine.run(&request(&[50])).await.unwrap();
    let RunOutcome::Uploaded { committed, .. } = report.outcome else {
        panic!("expected an upload");
    };
    assert_eq!(committed, 2);
    assert!(!mirror.current(ElementRef::relation(40)).unwrap().visible);
    assert!(!mirror.current(ElementRef::way(30)).unwrap().visible);
}

#[tokio::test]
async fn test_cascading_parent_deletions_terminate() {
    // Deleting the created node empties its way, deleting the way empties
    // a relation, and that relation empties another relation. The parent
    // pass must walk the whole chain and stop.
    let mirror = Arc::new(Mirror::new());
    let relation = |id: i64, member_type: ElementType, member_ref: i64, changeset: i64| {
        ElementVersion {
            element: ElementRef::relation(id),
            version: 1,
            visible: true,
            tags: Tags::new(),
            geometry: Some(Geometry::Relation {
                members: vec![RelationMember {
                    member_type,
                    member_ref,
                    role: String::new(),
                }],
            }),
            changeset,
            timestamp: Utc::now(),
        }
    };
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, Tags::new()),
        node(100, 1, 50, 5.5, 5.5, Tags::new()),
        way(20, 1, 60, vec![1, 100], Tags::new()),
        relation(40, ElementType::Way, 20, 60),
        relation(41, ElementType::Relation, 40, 60),
    ]);

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();
    let RunOutcome::Uploaded { committed, .. } = report.outcome else {
        panic!("expected an upload");
    };
    assert_eq!(committed, 4);
    for element in [
        ElementRef::node(100),
        ElementRef::way(20),
        ElementRef::relation(40),
        ElementRef::relation(41),
    ] {
        assert!(!mirror.current(element).unwrap().visible, "{element} should be gone");
    }
    // The untouched node survives.
    assert!(mirror.current(ElementRef::node(1)).unwrap().visible);
}

// ===========================================================================
// Offline export
// ===========================================================================

#[tokio::test]
async fn test_offline_export_touches_nothing() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Bad")])),
    ]);

    let mut config = test_config();
    config.upload.enabled = false;
    let engine = engine(&mirror, config);
    let report = engine.run(&request(&[50])).await.unwrap();

    let RunOutcome::Exported { document } = report.outcome else {
        panic!("expected an export");
    };
    assert!(document.contains("<osmChange"));
    assert!(document.contains("<modify>"));
    assert!(document.contains("id=\"1\""));
    assert!(!document.contains("changeset="));

    // No server mutation of any kind.
    assert!(mirror.open_tags().is_empty());
    assert!(mirror.comments().is_empty());
    assert_eq!(mirror.current(ElementRef::node(1)).unwrap().version, 2);
}

#[tokio::test]
async fn test_offline_export_mirrors_upload_actions() {
    // The offline document and an upload-enabled run over the same state
    // must describe the same actions.
    let seed = vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Bad")])),
        node(3, 1, 50, 6.5, 6.5, tags(&[("amenity", "bench")])),
    ];

    let offline = Arc::new(Mirror::new());
    offline.seed(seed.clone());
    let mut config = test_config();
    config.upload.enabled = false;
    let report = engine(&offline, config).run(&request(&[50])).await.unwrap();
    let RunOutcome::Exported { document } = report.outcome else {
        panic!("expected an export");
    };

    let online = Arc::new(Mirror::new());
    online.seed(seed);
    let report = engine(&online, test_config()).run(&request(&[50])).await.unwrap();
    let RunOutcome::Uploaded { committed, .. } = report.outcome else {
        panic!("expected an upload");
    };

    let documented = document.matches("<node").count();
    assert_eq!(documented, committed);
    assert!(document.contains("<modify>"));
    assert!(document.contains("<delete>"));
    // Applying those actions produced exactly the restored state.
    assert_eq!(
        online.current(ElementRef::node(1)).unwrap().tags,
        tags(&[("name", "Good")])
    );
    assert!(!online.current(ElementRef::node(3)).unwrap().visible);
}

#[tokio::test]
async fn test_export_is_deterministic() {
    let seed = vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Bad")])),
        node(2, 1, 10, 6.0, 6.0, Tags::new()),
        node(3, 1, 50, 6.5, 6.5, tags(&[("amenity", "bench")])),
        way(30, 1, 10, vec![1, 2], Tags::new()),
        way(30, 2, 50, vec![2, 1], Tags::new()),
    ];

    let mut documents = Vec::new();
    for _ in 0..2 {
        let mirror = Arc::new(Mirror::new());
        mirror.seed(seed.clone());
        let mut config = test_config();
        config.upload.enabled = false;
        let engine = engine(&mirror, config);
        let report = engine.run(&request(&[50])).await.unwrap();
        let RunOutcome::Exported { document } = report.outcome else {
            panic!("expected an export");
        };
        documents.push(document);
    }
    assert_eq!(documents[0], documents[1]);
}

// ===========================================================================
// Failure paths
// ===========================================================================

#[tokio::test]
async fn test_oversized_plan_is_rejected_before_upload() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("a", "1")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("a", "2")])),
        node(2, 1, 10, 6.0, 6.0, tags(&[("b", "1")])),
        node(2, 2, 50, 6.0, 6.0, tags(&[("b", "2")])),
    ]);
    mirror.set_max_elements(1);

    let engine = engine(&mirror, test_config());
    let err = engine.run(&request(&[50])).await.unwrap_err();
    assert!(matches!(
        err,
        RevertError::Upload(UploadError::TooLarge { size: 2, max: 1 })
    ));
    assert!(mirror.open_tags().is_empty());
}

#[tokio::test]
async fn test_unknown_changeset_aborts_run() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![node(1, 1, 10, 5.0, 5.0, Tags::new())]);

    let engine = engine(&mirror, test_config());
    let err = engine.run(&request(&[777])).await.unwrap_err();
    assert!(matches!(
        err,
        RevertError::History(HistoryError::ChangesetNotFound(777))
    ));
}

#[tokio::test]
async fn test_version_race_is_re_resolved_once() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("name", "Good")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("name", "Bad")])),
    ]);
    // A mapper's surface edit lands between planning and upload.
    mirror.set_race_once(ElementRef::node(1), "surface", "asphalt");

    let engine = engine(&mirror, test_config());
    let report = engine.run(&request(&[50])).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Uploaded { .. }));

    // The revert lands on top of the racing edit, keeping its tag.
    let current = mirror.current(ElementRef::node(1)).unwrap();
    assert_eq!(current.tags.get("name").map(String::as_str), Some("Good"));
    assert_eq!(current.tags.get("surface").map(String::as_str), Some("asphalt"));
}

#[tokio::test]
async fn test_raced_retry_lands_before_dependent_deletes() {
    // A mapper edits the way while the revert is uploading. The retried way
    // delete must still go in before the node deletes it depends on, or the
    // server rejects those nodes as still referenced.
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 50, 5.0, 5.0, Tags::new()),
        node(2, 1, 50, 6.0, 6.0, Tags::new()),
        way(30, 1, 50, vec![1, 2], Tags::new()),
    ]);
    mirror.set_race_once(ElementRef::way(30), "highway", "path");

    let mut config = test_config();
    config.upload.batch_size = 1;
    let engine = engine(&mirror, config);
    let report = engine.run(&request(&[50])).await.unwrap();
    let RunOutcome::Uploaded { committed, .. } = report.outcome else {
        panic!("expected an upload");
    };
    assert_eq!(committed, 3);
    assert!(!mirror.current(ElementRef::way(30)).unwrap().visible);
    assert!(!mirror.current(ElementRef::node(1)).unwrap().visible);
    assert!(!mirror.current(ElementRef::node(2)).unwrap().visible);
}

/// History source whose referrer index over-approximates and whose live
/// reads move between repair passes, like a busy server would.
struct ShiftingHistory {
    way21_reads: Mutex<u32>,
}

impl HistorySource for ShiftingHistory {
    async fn fetch_history(
        &self,
        element: ElementRef,
    ) -> Result<Vec<ElementVersion>, HistoryError> {
        if element == ElementRef::node(100) {
            Ok(vec![node(100, 1, 50, 5.5, 5.5, Tags::new())])
        } else {
            Err(HistoryError::NotFound { element })
        }
    }

    async fn fetch_changeset_edits(
        &self,
        changeset_id: i64,
    ) -> Result<Vec<ChangesetEdit>, HistoryError> {
        if changeset_id == 50 {
            Ok(vec![ChangesetEdit {
                element: ElementRef::node(100),
                old_version: None,
                new_version: 1,
            }])
        } else {
            Err(HistoryError::ChangesetNotFound(changeset_id))
        }
    }

    async fn fetch_current(&self, element: ElementRef) -> Result<ElementVersion, HistoryError> {
        if element == ElementRef::node(100) {
            Ok(node(100, 1, 50, 5.5, 5.5, Tags::new()))
        } else if element == ElementRef::way(20) {
            Ok(way(20, 1, 60, vec![1, 100, 2], Tags::new()))
        } else if element == ElementRef::way(21) {
            let mut reads = self.way21_reads.lock().unwrap();
            *reads += 1;
            if *reads == 1 {
                Ok(way(21, 1, 60, vec![3, 4], Tags::new()))
            } else {
                // A mapper adopted the node between repair passes.
                Ok(way(21, 2, 61, vec![3, 100, 4], Tags::new()))
            }
        } else {
            Err(HistoryError::NotFound { element })
        }
    }

    async fn find_referrers(&self, element: ElementRef) -> Result<Vec<ElementRef>, HistoryError> {
        if element == ElementRef::node(100) {
            Ok(vec![ElementRef::way(20), ElementRef::way(21)])
        } else {
            Ok(Vec::new())
        }
    }
}

#[tokio::test]
async fn test_parent_pass_rereads_referrers_each_iteration() {
    init_tracing();
    let history = Arc::new(ShiftingHistory {
        way21_reads: Mutex::new(0),
    });
    let mut config = test_config();
    config.upload.enabled = false;
    let engine = RevertEngine::new(
        config,
        Arc::clone(&history),
        Arc::new(Mirror::new()),
        ProgressLog::disabled(),
    )
    .expect("config should validate");

    let report = engine.run(&request(&[50])).await.unwrap();
    let RunOutcome::Exported { document } = report.outcome else {
        panic!("expected an export");
    };
    assert!(document.contains("id=\"20\""));
    // The second pass saw the way adopt the node and repaired it too; a
    // cached first read would have left it holding a deleted node.
    assert!(document.contains("id=\"21\""));
    assert_eq!(*history.way21_reads.lock().unwrap(), 2);
    assert!(report
        .records
        .iter()
        .any(|r| r.element == ElementRef::way(21) && r.resolution == Resolution::ParentRepaired));
}

#[tokio::test]
async fn test_cancellation_between_batches() {
    let mirror = Arc::new(Mirror::new());
    mirror.seed(vec![
        node(1, 1, 10, 5.0, 5.0, tags(&[("a", "1")])),
        node(1, 2, 50, 5.0, 5.0, tags(&[("a", "2")])),
    ]);

    let engine = engine(&mirror, test_config());
    engine.cancel_handle().store(true, Ordering::Relaxed);
    let report = engine.run(&request(&[50])).await.unwrap();

    assert!(report.cancelled);
    let RunOutcome::Uploaded { changeset_id, committed } = report.outcome else {
        panic!("cancelled runs still report the opened changeset");
    };
    assert_eq!(committed, 0);
    // The changeset is closed even though nothing went into it.
    assert_eq!(mirror.closed(), vec![changeset_id]);
    assert_eq!(mirror.current(ElementRef::node(1)).unwrap().version, 2);
}

#[tokio::test]
async fn test_empty_request_is_rejected() {
    let mirror = Arc::new(Mirror::new());
    let engine = engine(&mirror, test_config());
    let err = engine.run(&request(&[])).await.unwrap_err();
    assert!(matches!(err, RevertError::Config(_)));
}
