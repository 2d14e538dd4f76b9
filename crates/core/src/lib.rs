//! osm-revert core library.
//!
//! This crate provides the components for undoing OpenStreetMap changesets:
//! configuration, history planning, conflict resolution and merging, change
//! assembly, OsmChange rendering, upload orchestration, and the engine that
//! ties one run together.

pub mod api;
pub mod assembler;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod models;
pub mod osmchange;
pub mod planner;
pub mod progress;
pub mod upload;

// Re-exports for convenience.
pub use config::RevertConfig;
pub use engine::{RevertEngine, RevertReport, RevertRequest, RunOutcome};
pub use errors::RevertError;
pub use progress::ProgressLog;
