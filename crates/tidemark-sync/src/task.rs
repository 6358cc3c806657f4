//! Sync task and session types

use std::sync::Arc;

use tokio::sync::oneshot;

use tidemark_core::error::TidemarkResult;
use tidemark_rpc::RpcChannel;

/// Priority tiers for competing sync requests, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncPriority {
    Background,
    Normal,
    Urgent,
}

/// How a session moved data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Bulk cursor stream, used when the group has no local history.
    Fast,
    /// Hash-tree walk pulling only divergent changes.
    Deep,
}

/// What a completed session reports back to its requester.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub group: String,
    pub mode: SyncMode,
    /// Changes newly merged during the session.
    pub merged: usize,
}

/// One queued request: sync `group` over `channel`.
pub struct SyncTask {
    pub channel: Arc<RpcChannel>,
    pub group: String,
    pub priority: SyncPriority,
    /// Resolves when the session finishes, with its report or failure.
    pub responder: oneshot::Sender<TidemarkResult<SyncReport>>,
}
