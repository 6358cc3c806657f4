//! Choosing the next sync task
//!
//! Competing queued tasks are narrowed through a filter cascade: highest
//! priority tier, personal group, active groups, same-device connections,
//! then the local permission tier in the target group. Each filter applies
//! only when it leaves at least one candidate. Remaining ties are settled
//! by racing a `ping` across the candidate connections; the first responder
//! wins, falling back to queue order when none answers in time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use tidemark_core::model::AccessLevel;
use tidemark_core::store::{ObjectStore, Store};
use tidemark_rpc::RpcChannel;

use crate::task::SyncPriority;

/// A queued task's scheduling-relevant fields. `index` points back into
/// the queue, which only the worker mutates.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub index: usize,
    pub group: String,
    pub priority: SyncPriority,
    pub same_device: bool,
    pub channel: Arc<RpcChannel>,
}

/// Pick the queue index of the task to run next.
pub(crate) async fn choose(
    candidates: Vec<Candidate>,
    local_signer: &str,
    store: &Arc<dyn Store>,
    active: &DashSet<String>,
    ping_timeout: Duration,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    let top = candidates.iter().map(|c| c.priority).max()?;
    let mut remaining: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| c.priority == top)
        .collect();

    remaining = narrow(remaining, |c| c.group == local_signer);
    remaining = narrow(remaining, |c| active.contains(&c.group));
    remaining = narrow(remaining, |c| c.same_device);
    remaining = narrow_by_permission(remaining, local_signer, store).await;

    if remaining.len() == 1 {
        return remaining.first().map(|c| c.index);
    }
    trace!(candidates = remaining.len(), "racing ping across tied candidates");
    let fallback = remaining.first().map(|c| c.index);
    race_ping(remaining, ping_timeout).await.or(fallback)
}

/// Apply a filter only when it keeps at least one candidate.
fn narrow<F>(candidates: Vec<Candidate>, pred: F) -> Vec<Candidate>
where
    F: Fn(&Candidate) -> bool,
{
    let kept: Vec<Candidate> = candidates.iter().filter(|c| pred(c)).cloned().collect();
    if kept.is_empty() {
        candidates
    } else {
        kept
    }
}

/// Keep the candidates whose group grants the local identity the highest
/// access tier (admin > write > read). Unknown groups rank below read.
async fn narrow_by_permission(
    candidates: Vec<Candidate>,
    local_signer: &str,
    store: &Arc<dyn Store>,
) -> Vec<Candidate> {
    let mut levels: Vec<Option<AccessLevel>> = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let level = match store.get(&candidate.group).await {
            Ok(Some(group)) => group.member_level(local_signer),
            _ => None,
        };
        levels.push(level);
    }
    let Some(top) = levels.iter().copied().flatten().max() else {
        return candidates;
    };
    candidates
        .into_iter()
        .zip(levels)
        .filter(|(_, level)| *level == Some(top))
        .map(|(c, _)| c)
        .collect()
}

/// First candidate whose connection answers a ping wins.
async fn race_ping(candidates: Vec<Candidate>, ping_timeout: Duration) -> Option<usize> {
    let (tx, mut rx) = mpsc::channel(candidates.len().max(1));
    for candidate in candidates {
        let tx = tx.clone();
        tokio::spawn(async move {
            if candidate.channel.ping().await.is_ok() {
                let _ = tx.send(candidate.index).await;
            }
        });
    }
    drop(tx);
    timeout(ping_timeout, rx.recv()).await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidemark_core::config::EngineConfig;
    use tidemark_core::keyring::{Keyring, LocalIdentity};
    use tidemark_core::mock::MockConnection;
    use tidemark_core::model::VersionedObject;
    use tidemark_core::store::{MemoryStore, ObjectStore};
    use tidemark_core::transport::PeerInfo;
    use tidemark_rpc::NullService;

    fn idle_channel(same_device: bool) -> Arc<RpcChannel> {
        let local = Keyring::new(LocalIdentity::generate("alice"));
        let remote = LocalIdentity::generate("bob");
        let info = PeerInfo {
            signer: "bob".to_string(),
            device: "bob-dev".to_string(),
            public_key_hex: remote.public_key_hex(),
            same_device,
        };
        let (conn, _other) = MockConnection::pair(info.clone(), info);
        RpcChannel::new(conn, Arc::new(local), Arc::new(NullService), EngineConfig::default())
            .unwrap()
    }

    fn candidate(index: usize, group: &str, priority: SyncPriority) -> Candidate {
        Candidate {
            index,
            group: group.to_string(),
            priority,
            same_device: false,
            channel: idle_channel(false),
        }
    }

    async fn store_with_groups(groups: &[(&str, &str)]) -> Arc<dyn Store> {
        let store = MemoryStore::new();
        for (id, level) in groups {
            let group = VersionedObject::new(*id, *id, "group", "owner", 1)
                .with_field("members", json!({ "alice": level }));
            store.save(group).await.unwrap();
        }
        Arc::new(store)
    }

    async fn choose_quick(candidates: Vec<Candidate>, store: &Arc<dyn Store>) -> Option<usize> {
        let active = DashSet::new();
        choose(candidates, "alice", store, &active, Duration::from_millis(20)).await
    }

    #[tokio::test]
    async fn test_highest_priority_wins() {
        let store = store_with_groups(&[]).await;
        let picked = choose_quick(
            vec![
                candidate(0, "g1", SyncPriority::Background),
                candidate(1, "g2", SyncPriority::Urgent),
                candidate(2, "g3", SyncPriority::Normal),
            ],
            &store,
        )
        .await;
        assert_eq!(picked, Some(1));
    }

    #[tokio::test]
    async fn test_personal_group_preferred() {
        let store = store_with_groups(&[]).await;
        let picked = choose_quick(
            vec![
                candidate(0, "g1", SyncPriority::Normal),
                candidate(1, "alice", SyncPriority::Normal),
            ],
            &store,
        )
        .await;
        assert_eq!(picked, Some(1));
    }

    #[tokio::test]
    async fn test_active_group_preferred() {
        let store = store_with_groups(&[]).await;
        let active = DashSet::new();
        active.insert("g2".to_string());
        let picked = choose(
            vec![
                candidate(0, "g1", SyncPriority::Normal),
                candidate(1, "g2", SyncPriority::Normal),
            ],
            "alice",
            &store,
            &active,
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(picked, Some(1));
    }

    #[tokio::test]
    async fn test_same_device_preferred() {
        let store = store_with_groups(&[]).await;
        let mut far = candidate(0, "g1", SyncPriority::Normal);
        far.same_device = false;
        let mut near = candidate(1, "g2", SyncPriority::Normal);
        near.same_device = true;

        let picked = choose_quick(vec![far, near], &store).await;
        assert_eq!(picked, Some(1));
    }

    #[tokio::test]
    async fn test_permission_tier_breaks_ties() {
        let store = store_with_groups(&[("g1", "read"), ("g2", "admin")]).await;
        let picked = choose_quick(
            vec![
                candidate(0, "g1", SyncPriority::Normal),
                candidate(1, "g2", SyncPriority::Normal),
            ],
            &store,
        )
        .await;
        assert_eq!(picked, Some(1));
    }

    #[tokio::test]
    async fn test_filters_never_empty_the_pool() {
        // No personal, active, same-device, or known-group candidates:
        // every filter is skipped and the dead ping race falls back to
        // queue order.
        let store = store_with_groups(&[]).await;
        let picked = choose_quick(
            vec![
                candidate(0, "g1", SyncPriority::Normal),
                candidate(1, "g2", SyncPriority::Normal),
            ],
            &store,
        )
        .await;
        assert_eq!(picked, Some(0));
    }
}
