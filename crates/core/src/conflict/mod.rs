//! Conflict detection and resolution for revert targets.
//!
//! The conflict subsystem is responsible for:
//! 1. **Merging** -- re-applying later edits on top of restored state via
//!    fuzzy line patches.
//! 2. **Resolution** -- deciding, per target, whether a clean revert, a
//!    merged revert, or an abandonment is called for, and recording why.

pub mod merger;
pub mod resolver;

pub use merger::{FuzzyTagMerger, MergePath, TagMerge};
pub use resolver::ConflictResolver;
