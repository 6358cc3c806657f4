//! Persistence trait seams and the in-memory store
//!
//! The persistence engine proper is an external collaborator; the engine
//! only relies on the [`ObjectStore`] and [`ChangeStore`] traits. The
//! composite indices the sync algorithms need are part of the contract:
//! group+modified (range scans for fast sync and hash blocks) and
//! subject+modified (change-history lookups for field-level merging).
//!
//! [`MemoryStore`] implements both traits over concurrent maps plus ordered
//! index sets, suitable for tests and simulation.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::ops::Range;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::StorageError;
use crate::model::{ChangeKey, ChangeRecord, VersionedObject};

/// Object persistence.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<VersionedObject>, StorageError>;
    async fn save(&self, obj: VersionedObject) -> Result<(), StorageError>;
    async fn delete(&self, id: &str) -> Result<(), StorageError>;
}

/// Change-record persistence with the ordered queries sync depends on.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    async fn get_change(&self, id: &str) -> Result<Option<ChangeRecord>, StorageError>;
    async fn save_change(&self, change: ChangeRecord) -> Result<(), StorageError>;

    /// Remove a change record (administrative correction only). Callers must
    /// invalidate the record's hash block afterwards.
    async fn delete_change(&self, id: &str) -> Result<(), StorageError>;

    /// All changes for a subject, ordered by `modified` ascending. With
    /// `since`, only changes with `modified >= since` are returned.
    async fn subject_changes(
        &self,
        subject: &str,
        since: Option<u64>,
    ) -> Result<Vec<ChangeRecord>, StorageError>;

    /// Forward-only cursor over a group's changes ordered by
    /// `(modified, id)`, strictly after `cursor`. `None` starts from the
    /// beginning. Returns at most `limit` records.
    async fn group_changes_after(
        &self,
        group: &str,
        cursor: Option<&ChangeKey>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError>;

    /// The `{id, modified}` pairs of all changes whose `modified` falls in
    /// the half-open range, in canonical order (`modified` then `id`).
    async fn block_entries(
        &self,
        group: &str,
        range: Range<u64>,
    ) -> Result<Vec<ChangeKey>, StorageError>;

    /// Whether the subject carries a tombstone in this group.
    async fn tombstoned(&self, group: &str, subject: &str) -> Result<bool, StorageError>;

    /// The highest `modified` among the group's changes, if any.
    async fn latest_modified(&self, group: &str) -> Result<Option<u64>, StorageError>;
}

/// Combined store handle.
pub trait Store: ObjectStore + ChangeStore {}
impl<T: ObjectStore + ChangeStore> Store for T {}

/// In-memory implementation of both store traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, VersionedObject>,
    changes: DashMap<String, ChangeRecord>,
    /// (group, modified, change id) — the group+modified index.
    group_index: RwLock<BTreeSet<(String, u64, String)>>,
    /// (subject, modified, change id) — the subject+modified index.
    subject_index: RwLock<BTreeSet<(String, u64, String)>>,
    /// (group, subject) pairs with a tombstone record.
    tombstones: DashSet<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored change records (for tests).
    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<VersionedObject>, StorageError> {
        Ok(self.objects.get(id).map(|o| o.clone()))
    }

    async fn save(&self, obj: VersionedObject) -> Result<(), StorageError> {
        trace!(id = %obj.id, group = %obj.group, "saving object");
        self.objects.insert(obj.id.clone(), obj);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.objects.remove(id);
        Ok(())
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    async fn get_change(&self, id: &str) -> Result<Option<ChangeRecord>, StorageError> {
        Ok(self.changes.get(id).map(|c| c.clone()))
    }

    async fn save_change(&self, change: ChangeRecord) -> Result<(), StorageError> {
        trace!(id = %change.id, group = %change.group, subject = %change.subject, "saving change");
        {
            let mut index = self.group_index.write().await;
            index.insert((change.group.clone(), change.modified, change.id.clone()));
        }
        {
            let mut index = self.subject_index.write().await;
            index.insert((change.subject.clone(), change.modified, change.id.clone()));
        }
        if change.subject_deleted {
            self.tombstones
                .insert((change.group.clone(), change.subject.clone()));
        }
        self.changes.insert(change.id.clone(), change);
        Ok(())
    }

    async fn delete_change(&self, id: &str) -> Result<(), StorageError> {
        let Some((_, change)) = self.changes.remove(id) else {
            return Ok(());
        };
        {
            let mut index = self.group_index.write().await;
            index.remove(&(change.group.clone(), change.modified, change.id.clone()));
        }
        {
            let mut index = self.subject_index.write().await;
            index.remove(&(change.subject.clone(), change.modified, change.id.clone()));
        }
        if change.subject_deleted {
            // Only clear the tombstone if no other deletion record remains.
            let others = self.subject_changes(&change.subject, None).await?;
            if !others.iter().any(|c| c.subject_deleted && c.group == change.group) {
                self.tombstones
                    .remove(&(change.group.clone(), change.subject.clone()));
            }
        }
        Ok(())
    }

    async fn subject_changes(
        &self,
        subject: &str,
        since: Option<u64>,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let low = since.unwrap_or(0);
        let index = self.subject_index.read().await;
        let start = (subject.to_string(), low, String::new());
        let mut out = Vec::new();
        for (s, _, id) in index.range((Bound::Included(start), Bound::Unbounded)) {
            if s.as_str() != subject {
                break;
            }
            if let Some(change) = self.changes.get(id) {
                out.push(change.clone());
            }
        }
        Ok(out)
    }

    async fn group_changes_after(
        &self,
        group: &str,
        cursor: Option<&ChangeKey>,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let start = match cursor {
            Some(key) => Bound::Excluded((group.to_string(), key.modified, key.id.clone())),
            None => Bound::Included((group.to_string(), 0, String::new())),
        };
        let index = self.group_index.read().await;
        let mut out = Vec::new();
        for (g, _, id) in index.range((start, Bound::Unbounded)) {
            if g.as_str() != group || out.len() >= limit {
                break;
            }
            if let Some(change) = self.changes.get(id) {
                out.push(change.clone());
            }
        }
        Ok(out)
    }

    async fn block_entries(
        &self,
        group: &str,
        range: Range<u64>,
    ) -> Result<Vec<ChangeKey>, StorageError> {
        let index = self.group_index.read().await;
        let start = (group.to_string(), range.start, String::new());
        let mut out = Vec::new();
        for (g, modified, id) in index.range((Bound::Included(start), Bound::Unbounded)) {
            if g.as_str() != group || *modified >= range.end {
                break;
            }
            out.push(ChangeKey {
                id: id.clone(),
                modified: *modified,
            });
        }
        Ok(out)
    }

    async fn tombstoned(&self, group: &str, subject: &str) -> Result<bool, StorageError> {
        Ok(self
            .tombstones
            .contains(&(group.to_string(), subject.to_string())))
    }

    async fn latest_modified(&self, group: &str) -> Result<Option<u64>, StorageError> {
        let index = self.group_index.read().await;
        let end = (group.to_string(), u64::MAX, String::new());
        Ok(index
            .range((Bound::Unbounded, Bound::Included(end)))
            .rev()
            .find(|(g, _, _)| g.as_str() == group)
            .map(|(_, m, _)| *m))
    }
}
