//! # Tidemark Sync
//!
//! Peer session management for the Tidemark sync engine: deciding when and
//! how two replicas exchange change records, and serving the remote side
//! of that exchange.
//!
//! ## Key Pieces
//!
//! - [`SyncOrchestrator`]: queues sync requests, schedules them through a
//!   priority cascade, and runs one session per group at a time
//! - [`SyncService`]: the remotely callable surface peers hit during a
//!   session (hash-tree queries, change fetches, fast-sync streams)
//! - [`SyncPriority`] / [`SyncReport`]: how callers ask and what they get
//!
//! A session is either a fast sync (bulk cursor stream, for groups with no
//! local history) or a deep sync (hash-tree walk pulling exactly the
//! divergent records). Both converge two replicas with one pass in each
//! direction.

mod deep;
mod fast;
mod scheduler;

pub mod orchestrator;
pub mod service;
pub mod task;

pub use orchestrator::SyncOrchestrator;
pub use service::SyncService;
pub use task::{SyncMode, SyncPriority, SyncReport, SyncTask};
