//! # Tidemark Engine
//!
//! The state layer of the Tidemark sync engine: turning local edits into
//! signed change records, merging records from any source into store state,
//! and maintaining the per-group hash trees that let two replicas find
//! where their histories diverge.
//!
//! ## Key Pieces
//!
//! - [`compute_diff`] / [`apply_diff`]: field-level diffs over JSON values
//! - [`ChangeEngine`]: validation, conflict resolution, and application of
//!   change records
//! - [`HashTree`]: the time-partitioned divergence index
//!
//! Everything here is transport-agnostic; the RPC and sync layers sit on
//! top and only hand records in and out.

pub mod diff;
pub mod hashtree;
pub mod merge;

pub use diff::{apply_diff, build_change_record, compute_diff};
pub use hashtree::{block_id, block_range, HashTree, BLOCK_SIZE};
pub use merge::{ChangeEngine, MergeOutcome};
