//! Sync session orchestration
//!
//! [`SyncOrchestrator`] owns a node's connections and runs sync sessions
//! one at a time from an explicit task queue. [`request_sync`] enqueues a
//! `(connection, group)` task and resolves when its session completes; a
//! `Notify`-driven worker drains the queue, picking the next task through
//! the scheduler cascade. Groups are exclusive: a session for a busy group
//! waits behind the in-flight one on a per-group async lock.
//!
//! Session mode is chosen from local state: a group with no history at all
//! bootstraps over a fast-sync stream, anything else walks the hash trees.
//!
//! [`request_sync`]: SyncOrchestrator::request_sync

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde_json::json;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tidemark_core::config::EngineConfig;
use tidemark_core::error::{TidemarkResult, TransportError, VerificationError};
use tidemark_core::store::ChangeStore;
use tidemark_core::transport::Connection;
use tidemark_engine::ChangeEngine;
use tidemark_rpc::{RpcChannel, RpcMethod, RpcService};

use crate::scheduler::{self, Candidate};
use crate::service::SyncService;
use crate::task::{SyncMode, SyncPriority, SyncReport, SyncTask};
use crate::{deep, fast};

/// How long tied candidates get to answer the scheduling ping.
const PING_RACE_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SyncOrchestrator {
    engine: Arc<ChangeEngine>,
    config: EngineConfig,
    service: Arc<SyncService>,
    /// Verified channels by peer device id.
    channels: DashMap<String, Arc<RpcChannel>>,
    /// One lock per group: at most one in-flight session per group.
    group_locks: DashMap<String, Arc<Mutex<()>>>,
    queue: Mutex<VecDeque<SyncTask>>,
    notify: Notify,
    /// Groups the application currently has in the foreground.
    active_groups: DashSet<String>,
    closed: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(engine: Arc<ChangeEngine>, config: EngineConfig) -> Arc<Self> {
        let service = SyncService::new(engine.clone(), config.clone());
        Arc::new(Self {
            engine,
            config,
            service,
            channels: DashMap::new(),
            group_locks: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            active_groups: DashSet::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Run the worker loop until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let orch = self.clone();
        tokio::spawn(async move {
            loop {
                if orch.closed.load(Ordering::SeqCst) {
                    orch.drain_queue().await;
                    break;
                }
                let Some(task) = orch.next_task().await else {
                    orch.notify.notified().await;
                    continue;
                };
                let result = orch.run_task(&task.channel, &task.group).await;
                if let Err(e) = &result {
                    warn!(group = %task.group, peer = %task.channel.peer().signer, error = %e, "sync session failed");
                }
                // The requester may have gone away; the loop continues
                // either way.
                let _ = task.responder.send(result);
            }
        })
    }

    /// Wrap an established connection in a verified RPC channel and make it
    /// available for sync sessions.
    pub async fn add_connection(
        &self,
        conn: Arc<dyn Connection>,
    ) -> TidemarkResult<Arc<RpcChannel>> {
        let channel = RpcChannel::new(
            conn.clone(),
            self.engine.keyring().clone(),
            self.service.clone() as Arc<dyn RpcService>,
            self.config.clone(),
        )?;
        channel.start();
        channel.verify_peer().await?;

        self.service.register_connection(conn.clone());
        self.channels
            .insert(conn.peer().device.clone(), channel.clone());
        debug!(peer = %conn.peer().signer, device = %conn.peer().device, "connection ready");
        Ok(channel)
    }

    /// Drop a peer's channel and close it.
    pub async fn remove_connection(&self, device: &str) {
        self.service.drop_connection(device);
        if let Some((_, channel)) = self.channels.remove(device) {
            channel.close().await;
        }
    }

    pub fn channel_for(&self, device: &str) -> Option<Arc<RpcChannel>> {
        self.channels.get(device).map(|c| c.clone())
    }

    /// Mark a group as foreground for scheduling purposes.
    pub fn mark_active(&self, group: &str) {
        self.active_groups.insert(group.to_string());
    }

    pub fn clear_active(&self, group: &str) {
        self.active_groups.remove(group);
    }

    /// Enqueue a sync session and await its outcome.
    pub async fn request_sync(
        &self,
        channel: Arc<RpcChannel>,
        group: &str,
        priority: SyncPriority,
    ) -> TidemarkResult<SyncReport> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed.into());
        }
        let (responder, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            queue.push_back(SyncTask {
                channel,
                group: group.to_string(),
                priority,
                responder,
            });
        }
        self.notify.notify_one();
        rx.await
            .map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Stop the worker; queued tasks resolve with `ConnectionClosed`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn drain_queue(&self) {
        let mut queue = self.queue.lock().await;
        while let Some(task) = queue.pop_front() {
            let _ = task
                .responder
                .send(Err(TransportError::ConnectionClosed.into()));
        }
    }

    /// Snapshot the queue, run the scheduler cascade, and take the winner.
    /// Only the worker removes tasks, so snapshot indices stay valid.
    async fn next_task(&self) -> Option<SyncTask> {
        let candidates: Vec<Candidate> = {
            let queue = self.queue.lock().await;
            queue
                .iter()
                .enumerate()
                .map(|(index, task)| Candidate {
                    index,
                    group: task.group.clone(),
                    priority: task.priority,
                    same_device: task.channel.peer().same_device,
                    channel: task.channel.clone(),
                })
                .collect()
        };
        if candidates.is_empty() {
            return None;
        }
        let index = scheduler::choose(
            candidates,
            self.engine.keyring().local_signer(),
            self.engine.store(),
            &self.active_groups,
            PING_RACE_TIMEOUT,
        )
        .await
        .unwrap_or(0);

        let mut queue = self.queue.lock().await;
        queue.remove(index)
    }

    async fn run_task(
        &self,
        channel: &Arc<RpcChannel>,
        group: &str,
    ) -> TidemarkResult<SyncReport> {
        let lock = self
            .group_locks
            .entry(group.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if !channel.is_verified() {
            return Err(VerificationError::Unverified.into());
        }
        let (mode, merged) = if self.engine.tree().root_hash(group).await?.is_none() {
            (SyncMode::Fast, self.fast_sync(channel, group).await?)
        } else {
            (
                SyncMode::Deep,
                deep::deep_sync(&self.engine, channel, group).await?,
            )
        };
        debug!(group, ?mode, merged, "sync session complete");
        Ok(SyncReport {
            group: group.to_string(),
            mode,
            merged,
        })
    }

    /// Receiver side of a bootstrap: ask the peer to stream everything
    /// after our watermark onto a fresh named channel.
    async fn fast_sync(&self, channel: &Arc<RpcChannel>, group: &str) -> TidemarkResult<usize> {
        let since = self.engine.store().latest_modified(group).await?;
        let name = format!("fast-{}", Uuid::new_v4());
        channel
            .call(
                RpcMethod::FastSync,
                json!({ "group": group, "since": since, "channel": name }),
            )
            .await?;

        let stream = channel.connection().open_channel(&name).await?;
        let merged = fast::receive_changes(&self.engine, stream.clone(), &self.config).await;
        stream.close().await;
        merged
    }
}
