//! Field-level diffs between object versions
//!
//! [`compute_diff`] turns two JSON values into an ordered list of
//! `(path, value?)` entries describing the transition from one to the
//! other; [`apply_diff`] replays such a list. Together they satisfy
//! `apply_diff(a, compute_diff(a, b)) == b` for any JSON-safe values.
//!
//! [`build_change_record`] wraps the diff into a signed [`ChangeRecord`]
//! covering the create/update/delete cases.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use uuid::Uuid;

use tidemark_core::error::{ProtocolError, TidemarkError, TidemarkResult};
use tidemark_core::keyring::Keyring;
use tidemark_core::model::{ChangeEntry, ChangeRecord, VersionedObject};

/// Compute the ordered entry list transforming `from` into `to`.
///
/// Keys are visited in lexicographic order over the union of both sides.
/// Nested objects (and equal-length arrays) that are non-empty on both
/// sides are recursed into; anything else is emitted as one whole-subtree
/// entry. A key present only in `from` emits a removal entry.
pub fn compute_diff(from: &Value, to: &Value) -> Vec<ChangeEntry> {
    let mut out = Vec::new();
    diff_at("", from, to, &mut out);
    out
}

fn diff_at(path: &str, from: &Value, to: &Value, out: &mut Vec<ChangeEntry>) {
    if from == to {
        return;
    }
    match (from, to) {
        (Value::Object(a), Value::Object(b)) if !a.is_empty() && !b.is_empty() => {
            let keys: BTreeSet<&str> = a.keys().chain(b.keys()).map(String::as_str).collect();
            for key in keys {
                let child = join_path(path, key);
                match (a.get(key), b.get(key)) {
                    (Some(f), Some(t)) => diff_at(&child, f, t, out),
                    (Some(_), None) => out.push(ChangeEntry::remove(child)),
                    (None, Some(t)) => out.push(ChangeEntry::set(child, t.clone())),
                    (None, None) => {}
                }
            }
        }
        // Element-wise diffs only make sense while indices line up; a
        // length change is a whole-array replacement.
        (Value::Array(a), Value::Array(b)) if !a.is_empty() && a.len() == b.len() => {
            for (i, (f, t)) in a.iter().zip(b.iter()).enumerate() {
                let child = join_path(path, &i.to_string());
                diff_at(&child, f, t, out);
            }
        }
        _ => out.push(ChangeEntry::set(path, to.clone())),
    }
}

fn join_path(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", base, key)
    }
}

/// Replay an entry list onto a value.
///
/// The empty path replaces the whole value; an absent entry value removes
/// the path; otherwise the path is deep-set, creating intermediate maps as
/// needed. Paths into missing structure are ignored on removal.
pub fn apply_diff(obj: &mut Value, changes: &[ChangeEntry]) {
    for entry in changes {
        if entry.path.is_empty() {
            *obj = entry.value.clone().unwrap_or(Value::Null);
            continue;
        }
        match &entry.value {
            Some(value) => set_path(obj, &entry.path, value.clone()),
            None => remove_path(obj, &entry.path),
        }
    }
}

fn set_path(obj: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = obj;
    for seg in &segments[..segments.len() - 1] {
        current = descend(current, seg);
    }
    let last = segments[segments.len() - 1];
    match current {
        Value::Array(arr) => {
            if let Ok(idx) = last.parse::<usize>() {
                if idx >= arr.len() {
                    arr.resize(idx + 1, Value::Null);
                }
                arr[idx] = value;
            }
        }
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        other => {
            // Scalar in the way of a deep path: replace it with a map.
            let mut map = Map::new();
            map.insert(last.to_string(), value);
            *other = Value::Object(map);
        }
    }
}

/// Navigate one segment down, materializing a map when the slot is not a
/// container.
fn descend<'a>(current: &'a mut Value, seg: &str) -> &'a mut Value {
    let is_container = |v: &Value| v.is_object() || v.is_array();
    if current.is_array() {
        if let Ok(idx) = seg.parse::<usize>() {
            let arr = current.as_array_mut().unwrap();
            if idx >= arr.len() {
                arr.resize(idx + 1, Value::Null);
            }
            if !is_container(&arr[idx]) {
                arr[idx] = Value::Object(Map::new());
            }
            return &mut arr[idx];
        }
        *current = Value::Object(Map::new());
        return descend_into_map(current, seg);
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    descend_into_map(current, seg)
}

fn descend_into_map<'a>(current: &'a mut Value, seg: &str) -> &'a mut Value {
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            let slot = map.entry(seg.to_string()).or_insert(Value::Null);
            if !slot.is_object() && !slot.is_array() {
                *slot = Value::Object(Map::new());
            }
            slot
        }
        other => other,
    }
}

fn remove_path(obj: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = obj;
    for seg in &segments[..segments.len() - 1] {
        let next = match current {
            Value::Object(map) => map.get_mut(*seg),
            Value::Array(arr) => seg.parse::<usize>().ok().and_then(|i| arr.get_mut(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return,
        }
    }
    let last = segments[segments.len() - 1];
    match current {
        Value::Object(map) => {
            map.remove(last);
        }
        Value::Array(arr) => {
            // Nulling the slot keeps sibling index paths in the same
            // record valid.
            if let Some(slot) = last.parse::<usize>().ok().and_then(|i| arr.get_mut(i)) {
                *slot = Value::Null;
            }
        }
        _ => {}
    }
}

/// Build a signed change record describing the transition `from -> to`.
///
/// - create (`from` absent): one `["", to]` entry
/// - delete (`to` absent): tombstone with empty entries, stamped `now`
/// - update: the filtered field diff (`signer`/`signature`/`modified`
///   excluded)
///
/// Moving an object between groups is rejected; it must be expressed as a
/// delete in the old group plus a create in the new one.
pub fn build_change_record(
    keyring: &Keyring,
    from: Option<&VersionedObject>,
    to: Option<&VersionedObject>,
    now: u64,
) -> TidemarkResult<ChangeRecord> {
    let mut record = match (from, to) {
        (None, None) => {
            return Err(TidemarkError::Protocol(ProtocolError::MalformedMessage(
                "change record needs at least one of from/to".to_string(),
            )))
        }
        (None, Some(to)) => ChangeRecord {
            id: Uuid::new_v4().to_string(),
            group: to.group.clone(),
            subject: to.id.clone(),
            modified: to.modified,
            changes: vec![ChangeEntry::set("", to.content_value()?)],
            subject_deleted: false,
            signer: keyring.local_signer().to_string(),
            signature: String::new(),
        },
        (Some(from), None) => ChangeRecord {
            id: Uuid::new_v4().to_string(),
            group: from.group.clone(),
            subject: from.id.clone(),
            modified: now,
            changes: vec![],
            subject_deleted: true,
            signer: keyring.local_signer().to_string(),
            signature: String::new(),
        },
        (Some(from), Some(to)) => {
            if from.group != to.group {
                return Err(TidemarkError::Protocol(ProtocolError::GroupReassignment));
            }
            if from.id != to.id {
                return Err(TidemarkError::Protocol(ProtocolError::MalformedMessage(
                    "from and to describe different objects".to_string(),
                )));
            }
            ChangeRecord {
                id: Uuid::new_v4().to_string(),
                group: to.group.clone(),
                subject: to.id.clone(),
                modified: to.modified,
                changes: compute_diff(&from.content_value()?, &to.content_value()?),
                subject_deleted: false,
                signer: keyring.local_signer().to_string(),
                signature: String::new(),
            }
        }
    };
    record.signature = keyring.sign(&record.signable_bytes()?);
    Ok(record)
}
