//! Merging change records into local state
//!
//! [`ChangeEngine::merge_incoming`] is the single entry point for all
//! mutations, local or remote. A record passes idempotence, signature,
//! permission, and consistency checks before its entries are applied with
//! last-writer-wins resolution; accepted records are persisted and their
//! hash block invalidated. Rejected records leave no trace, so a corrected
//! copy can be retried later.

use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, warn};

use tidemark_core::error::{
    NotFoundError, PermissionError, ProtocolError, TidemarkResult,
};
use tidemark_core::keyring::Keyring;
use tidemark_core::model::{AccessLevel, ChangeRecord, VersionedObject};
use tidemark_core::store::{ChangeStore, ObjectStore, Store};

use crate::diff::{apply_diff, build_change_record};
use crate::hashtree::{block_id, HashTree};

/// What merging a record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The record was new and has been recorded (its entries may still
    /// have lost conflict resolution).
    Applied,
    /// The record was already present; nothing changed.
    AlreadyKnown,
}

/// Validates and applies change records against a store.
pub struct ChangeEngine {
    store: Arc<dyn Store>,
    keyring: Arc<Keyring>,
    tree: Arc<HashTree>,
    /// Ids merged this session, short-circuiting the store lookup.
    seen: DashSet<String>,
}

impl ChangeEngine {
    pub fn new(store: Arc<dyn Store>, keyring: Arc<Keyring>, tree: Arc<HashTree>) -> Self {
        Self {
            store,
            keyring,
            tree,
            seen: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn tree(&self) -> &Arc<HashTree> {
        &self.tree
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Build, sign, and merge a record for a local transition.
    ///
    /// `from` is the current version (absent on create), `to` the desired
    /// one (absent on delete). Returns the stored record so callers can
    /// forward it to peers.
    pub async fn record_local(
        &self,
        from: Option<&VersionedObject>,
        to: Option<&VersionedObject>,
        now: u64,
    ) -> TidemarkResult<ChangeRecord> {
        let record = build_change_record(&self.keyring, from, to, now)?;
        self.merge_incoming(record.clone()).await?;
        Ok(record)
    }

    /// Validate and apply one change record.
    pub async fn merge_incoming(&self, change: ChangeRecord) -> TidemarkResult<MergeOutcome> {
        // 1. Idempotence.
        if self.seen.contains(&change.id) || self.store.get_change(&change.id).await?.is_some() {
            return Ok(MergeOutcome::AlreadyKnown);
        }

        // 2. Authenticity.
        self.keyring
            .verify(&change.signer, &change.signable_bytes()?, &change.signature)?;

        // 3. Authorization.
        self.check_permission(&change).await?;

        // 4. Consistency against current state.
        let current = self.store.get(&change.subject).await?;
        self.check_consistency(&change, current.as_ref()).await?;

        // 5. Conflict resolution and state application.
        if change.subject_deleted {
            self.store.delete(&change.subject).await?;
        } else {
            self.apply_entries(&change, current).await?;
        }

        // 6. Record and index.
        self.store.save_change(change.clone()).await?;
        self.tree.invalidate(&change.group, change.modified).await?;
        self.seen.insert(change.id.clone());
        debug!(id = %change.id, group = %change.group, subject = %change.subject, "merged change");
        Ok(MergeOutcome::Applied)
    }

    /// Membership and level checks, including the group-creation bootstrap:
    /// a full write creating a group record is accepted when the signer is
    /// the owner embedded in the new record.
    async fn check_permission(&self, change: &ChangeRecord) -> TidemarkResult<()> {
        let group = self.store.get(&change.group).await?;
        let Some(group) = group else {
            if change.targets_group_record() && change.is_full_write() {
                let owner = embedded_owner(change);
                if owner.as_deref() == Some(change.signer.as_str()) {
                    return Ok(());
                }
                warn!(group = %change.group, signer = %change.signer, "group creation by non-owner");
                return Err(PermissionError::NotMember(change.group.clone()).into());
            }
            return Err(NotFoundError::Group(change.group.clone()).into());
        };

        let required = if change.targets_group_record() {
            AccessLevel::Admin
        } else {
            AccessLevel::Write
        };
        match group.member_level(&change.signer) {
            Some(level) if level >= required => Ok(()),
            Some(_) => Err(PermissionError::Insufficient {
                signer: change.signer.clone(),
                group: change.group.clone(),
                required: required.to_string(),
            }
            .into()),
            None => Err(PermissionError::NotMember(change.group.clone()).into()),
        }
    }

    async fn check_consistency(
        &self,
        change: &ChangeRecord,
        current: Option<&VersionedObject>,
    ) -> TidemarkResult<()> {
        // The record must land in a representable hash block; rejecting
        // here keeps out-of-range timestamps from writing any state.
        block_id(change.modified)?;

        // A tombstoned subject stays dead; only further tombstones (which
        // are no-ops on state) pass.
        if !change.subject_deleted && self.store.tombstoned(&change.group, &change.subject).await? {
            return Err(ProtocolError::Tombstoned {
                subject: change.subject.clone(),
                group: change.group.clone(),
            }
            .into());
        }

        match current {
            Some(current) if current.group != change.group => {
                Err(ProtocolError::GroupMismatch {
                    change_group: change.group.clone(),
                    subject_group: current.group.clone(),
                }
                .into())
            }
            // A partial write needs a base version to land on. Deletions
            // of an absent subject are fine: the tombstone still matters.
            None if !change.subject_deleted && !change.is_full_write() => {
                Err(NotFoundError::Object(change.subject.clone()).into())
            }
            _ => Ok(()),
        }
    }

    /// Apply the record's entries with last-writer-wins resolution.
    ///
    /// A record newer than the stored object applies wholesale and advances
    /// `modified` (object-level LWW). Otherwise each entry applies only if
    /// no stored change with `modified >= change.modified` touches its path
    /// or a parent of it (field-level LWW); the object's `modified` stays.
    /// Either way the record itself is stored for history convergence.
    async fn apply_entries(
        &self,
        change: &ChangeRecord,
        current: Option<VersionedObject>,
    ) -> TidemarkResult<()> {
        let (live, modified) = match &current {
            Some(cur) if change.modified <= cur.modified => {
                let stored = self
                    .store
                    .subject_changes(&change.subject, Some(change.modified))
                    .await?;
                let live: Vec<_> = change
                    .changes
                    .iter()
                    .filter(|entry| !stored.iter().any(|s| supersedes(s, &entry.path)))
                    .cloned()
                    .collect();
                (live, cur.modified)
            }
            _ => (change.changes.clone(), change.modified),
        };
        if live.is_empty() {
            debug!(id = %change.id, subject = %change.subject, "all entries superseded");
            return Ok(());
        }

        let mut value = match &current {
            Some(cur) => cur.content_value()?,
            None => Value::Null,
        };
        apply_diff(&mut value, &live);
        let mut merged = self.reconstruct(change, value, modified)?;
        self.finalize_signature(&mut merged).await?;
        self.store.save(merged).await?;
        Ok(())
    }

    /// Turn a content value back into a stored object.
    fn reconstruct(
        &self,
        change: &ChangeRecord,
        mut content: Value,
        modified: u64,
    ) -> TidemarkResult<VersionedObject> {
        let map = content.as_object_mut().ok_or_else(|| {
            ProtocolError::MalformedMessage(format!(
                "change {} does not produce an object",
                change.id
            ))
        })?;
        map.insert("modified".to_string(), Value::from(modified));
        map.remove("signer");
        map.remove("signature");
        let obj = VersionedObject::from_value(content).map_err(|_| {
            ProtocolError::MalformedMessage(format!(
                "change {} produces an incomplete object",
                change.id
            ))
        })?;
        if obj.id != change.subject || obj.group != change.group {
            return Err(ProtocolError::MalformedMessage(format!(
                "change {} rewrites its subject's identity",
                change.id
            ))
            .into());
        }
        Ok(obj)
    }

    /// Re-sign merged state with the local identity when it holds write
    /// permission in the object's group; otherwise strip the signature,
    /// leaving the object locally valid but not redistributable as a
    /// trusted full copy.
    async fn finalize_signature(&self, obj: &mut VersionedObject) -> TidemarkResult<()> {
        let local = self.keyring.local_signer();
        let required = if obj.is_group_record() {
            AccessLevel::Admin
        } else {
            AccessLevel::Write
        };
        // During group creation the record being merged is itself the
        // membership source.
        let level = if obj.is_group_record() {
            obj.member_level(local)
        } else {
            self.store
                .get(&obj.group)
                .await?
                .and_then(|g| g.member_level(local))
        };

        match level {
            Some(level) if level >= required => {
                obj.signer = Some(local.to_string());
                obj.signature = None;
                obj.signature = Some(self.keyring.sign(&obj.signable_bytes()?));
            }
            _ => {
                obj.signer = None;
                obj.signature = None;
            }
        }
        Ok(())
    }
}

/// Whether a stored record claims `path` or one of its parents. Tombstones
/// claim everything.
fn supersedes(stored: &ChangeRecord, path: &str) -> bool {
    if stored.subject_deleted {
        return true;
    }
    stored
        .changes
        .iter()
        .any(|entry| path_is_prefix(&entry.path, path))
}

/// Dot-path prefix test. The empty path is a prefix of everything; `a` is
/// a prefix of `a.b` but not of `ab`.
fn path_is_prefix(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

/// The `owner` claimed inside a group-creating full write.
fn embedded_owner(change: &ChangeRecord) -> Option<String> {
    change
        .changes
        .iter()
        .find(|e| e.path.is_empty())?
        .value
        .as_ref()?
        .get("owner")?
        .as_str()
        .map(String::from)
}
