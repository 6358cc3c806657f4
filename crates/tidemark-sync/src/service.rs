//! The remotely callable surface of a sync node
//!
//! [`SyncService`] plugs into [`RpcChannel`] dispatch and serves the
//! data-plane methods peers call during sync sessions. Every handler
//! checks the calling peer's membership in the group it touches before
//! revealing anything; merging stays on the caller's side, so serving is
//! read-only.
//!
//! [`RpcChannel`]: tidemark_rpc::RpcChannel

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use tidemark_core::config::EngineConfig;
use tidemark_core::error::{
    NotFoundError, PermissionError, ProtocolError, StorageError, TidemarkResult,
};
use tidemark_core::store::{ChangeStore, ObjectStore};
use tidemark_core::transport::{Connection, PeerInfo};
use tidemark_engine::ChangeEngine;
use tidemark_rpc::{RpcMethod, RpcService};

use crate::fast;

#[derive(Deserialize)]
struct PrefixHashesArgs {
    group: String,
    prefix: String,
}

#[derive(Deserialize)]
struct BlockEntriesArgs {
    group: String,
    block: String,
}

#[derive(Deserialize)]
struct FetchChangeArgs {
    id: String,
}

#[derive(Deserialize)]
struct FastSyncArgs {
    group: String,
    #[serde(default)]
    since: Option<u64>,
    channel: String,
}

pub struct SyncService {
    engine: Arc<ChangeEngine>,
    config: EngineConfig,
    /// Live connections by peer device id, for opening stream channels
    /// back toward a caller.
    connections: DashMap<String, Arc<dyn Connection>>,
}

impl SyncService {
    pub fn new(engine: Arc<ChangeEngine>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            connections: DashMap::new(),
        })
    }

    pub(crate) fn register_connection(&self, conn: Arc<dyn Connection>) {
        self.connections
            .insert(conn.peer().device.clone(), conn);
    }

    pub(crate) fn drop_connection(&self, device: &str) {
        self.connections.remove(device);
    }

    /// Peers only see groups they are members of.
    async fn check_member(&self, signer: &str, group: &str) -> TidemarkResult<()> {
        let record = self
            .engine
            .store()
            .get(group)
            .await?
            .ok_or_else(|| NotFoundError::Group(group.to_string()))?;
        if record.member_level(signer).is_none() {
            return Err(PermissionError::NotMember(group.to_string()).into());
        }
        Ok(())
    }

    /// Spawn the sender side of a fast-sync stream toward the caller.
    async fn start_stream(&self, peer: &PeerInfo, args: FastSyncArgs) -> TidemarkResult<()> {
        let conn = self
            .connections
            .get(&peer.device)
            .map(|c| c.clone())
            .ok_or_else(|| {
                ProtocolError::MalformedMessage(format!("no connection for device {}", peer.device))
            })?;
        debug!(group = %args.group, peer = %peer.signer, channel = %args.channel, "starting fast sync stream");

        let store = self.engine.store().clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let channel = match conn.accept_channel(&args.channel).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(channel = %args.channel, error = %e, "fast sync channel unavailable");
                    return;
                }
            };
            if let Err(e) =
                fast::stream_changes(&store, &channel, &args.group, args.since, &config).await
            {
                warn!(group = %args.group, error = %e, "fast sync stream aborted");
            }
            channel.close().await;
        });
        Ok(())
    }
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> TidemarkResult<T> {
    serde_json::from_value(args)
        .map_err(|e| ProtocolError::MalformedMessage(format!("bad call arguments: {}", e)).into())
}

fn encode<T: serde::Serialize>(value: T) -> TidemarkResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| StorageError::Serialization(e.to_string()).into())
}

#[async_trait]
impl RpcService for SyncService {
    async fn handle(
        &self,
        peer: &PeerInfo,
        method: RpcMethod,
        args: Value,
    ) -> TidemarkResult<Value> {
        match method {
            RpcMethod::PrefixHashes => {
                let args: PrefixHashesArgs = parse(args)?;
                self.check_member(&peer.signer, &args.group).await?;
                encode(
                    self.engine
                        .tree()
                        .prefix_hashes(&args.group, &args.prefix)
                        .await?,
                )
            }
            RpcMethod::BlockEntries => {
                let args: BlockEntriesArgs = parse(args)?;
                self.check_member(&peer.signer, &args.group).await?;
                encode(self.engine.tree().block_keys(&args.group, &args.block).await?)
            }
            RpcMethod::FetchChange => {
                let args: FetchChangeArgs = parse(args)?;
                let record = self
                    .engine
                    .store()
                    .get_change(&args.id)
                    .await?
                    .ok_or_else(|| NotFoundError::Change(args.id.clone()))?;
                self.check_member(&peer.signer, &record.group).await?;
                encode(record)
            }
            RpcMethod::FastSync => {
                let args: FastSyncArgs = parse(args)?;
                self.check_member(&peer.signer, &args.group).await?;
                self.start_stream(peer, args).await?;
                Ok(Value::Null)
            }
            // Terminated inside the channel, never routed to a service.
            RpcMethod::ProveIdentity | RpcMethod::Ping => {
                Err(ProtocolError::NotCallable(method.name().to_string()).into())
            }
        }
    }
}
