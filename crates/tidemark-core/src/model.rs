//! Shared data model for Tidemark
//!
//! The two central records are [`VersionedObject`] (the replicated unit of
//! state, carrying arbitrary JSON payload fields) and [`ChangeRecord`] (a
//! signed, immutable description of one transition applied to one object).
//!
//! Every object belongs to exactly one group, the unit of access control and
//! sync partitioning. A group's own record has `id == group` and carries a
//! `members` payload field mapping member ids to [`AccessLevel`]s.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

/// Access levels within a group, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    /// Parse a level from its lowercase wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        };
        write!(f, "{}", s)
    }
}

/// A replicated, access-controlled object.
///
/// Payload fields beyond the envelope are schemaless JSON, flattened in the
/// serialized form so the wire shape matches a plain document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedObject {
    pub id: String,
    /// The sync/access partition this object belongs to.
    pub group: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub owner: String,
    /// Monotonic modification timestamp (milliseconds).
    pub modified: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
    /// Arbitrary payload fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl VersionedObject {
    /// Create a new object with an empty payload.
    pub fn new(
        id: impl Into<String>,
        group: impl Into<String>,
        kind: impl Into<String>,
        owner: impl Into<String>,
        modified: u64,
    ) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            kind: kind.into(),
            owner: owner.into(),
            modified,
            signer: None,
            signature: None,
            fields: Map::new(),
        }
    }

    /// Set a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Whether this is a group's own record (`id == group`).
    pub fn is_group_record(&self) -> bool {
        self.id == self.group
    }

    /// The full object as a JSON value.
    pub fn to_value(&self) -> Result<Value, StorageError> {
        serde_json::to_value(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Rebuild an object from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, StorageError> {
        serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// The object's diffable content: everything except `signer`,
    /// `signature`, and `modified`.
    pub fn content_value(&self) -> Result<Value, StorageError> {
        let mut value = self.to_value()?;
        if let Value::Object(map) = &mut value {
            map.remove("signer");
            map.remove("signature");
            map.remove("modified");
        }
        Ok(value)
    }

    /// Canonical bytes covered by the object signature (everything except
    /// the `signature` field itself).
    pub fn signable_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut value = self.to_value()?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        canonical_bytes(&value)
    }

    /// Look up a member's access level on a group record.
    ///
    /// The owner is implicitly admin. Returns `None` for non-members and
    /// when called on a record without a `members` field.
    pub fn member_level(&self, member: &str) -> Option<AccessLevel> {
        if self.owner == member {
            return Some(AccessLevel::Admin);
        }
        self.fields
            .get("members")?
            .as_object()?
            .get(member)?
            .as_str()
            .and_then(AccessLevel::parse)
    }
}

/// One `(path, value?)` entry of a change record.
///
/// An absent value means the path is removed. Paths are dot-delimited; the
/// empty path addresses the whole object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
}

impl ChangeEntry {
    /// A set-or-replace entry.
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value: Some(value),
        }
    }

    /// A removal entry.
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: None,
        }
    }
}

/// A signed, immutable description of one state transition.
///
/// Change records are created on local mutation or accepted peer merges and
/// never mutated afterwards. They describe a transition, not a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub group: String,
    /// Target object id.
    pub subject: String,
    pub modified: u64,
    pub changes: Vec<ChangeEntry>,
    /// Marks the subject's deletion from its group (tombstone).
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub subject_deleted: bool,
    pub signer: String,
    #[serde(default)]
    pub signature: String,
}

impl ChangeRecord {
    /// Canonical bytes covered by the record signature (everything except
    /// the `signature` field itself).
    pub fn signable_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        canonical_bytes(&value)
    }

    /// Whether this record targets the group's own record.
    pub fn targets_group_record(&self) -> bool {
        self.subject == self.group
    }

    /// Whether this is a full-object write (a `""`-path entry is present).
    pub fn is_full_write(&self) -> bool {
        self.changes.iter().any(|c| c.path.is_empty())
    }
}

/// A `{id, modified}` pair identifying a change record inside a hash block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeKey {
    pub id: String,
    pub modified: u64,
}

/// Serialize a value into canonical JSON bytes.
///
/// `serde_json` maps are ordered by key, so two replicas serializing the
/// same logical value produce identical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let value = serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| StorageError::Serialization(e.to_string()))
}
