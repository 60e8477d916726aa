//! Content-hash computation and change classification (§4.5).
//!
//! A record's content hash is a SHA-256 digest over a normalized JSON
//! projection of its mapped fields: the reserved id column is excluded,
//! string values are trimmed, numbers are rounded to six decimal places,
//! arrays are sorted, and linked-record values are reduced to their sorted
//! set of ids before hashing. Two records that differ only in map key
//! order, incidental whitespace, or multi-select array order hash
//! identically.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use xsync_schemas::{HashEntry, HashSnapshot, RecordKey};

/// A single row's normalized view going into the hasher: the mapped field
/// values, keyed by field name, with the reserved id column already
/// stripped out by the caller.
pub type RowFields = BTreeMap<String, Value>;

const ROUND_SCALE: f64 = 1_000_000.0;

/// Computes the stable content hash for one record's mapped fields.
pub fn content_hash(fields: &RowFields) -> String {
    let normalized = normalize_map(fields);
    let canonical = serde_json::to_string(&normalized).expect("normalized value always serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_map(fields: &RowFields) -> BTreeMap<String, Value> {
    fields.iter().map(|(k, v)| (k.clone(), normalize_value(v))).collect()
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) => {
                let rounded = (f * ROUND_SCALE).round() / ROUND_SCALE;
                serde_json::Number::from_f64(rounded).map(Value::Number).unwrap_or_else(|| value.clone())
            }
            None => value.clone(),
        },
        Value::Array(items) => {
            let mut normalized: Vec<Value> = items.iter().map(normalize_value).collect();
            normalized.sort_by(|a, b| {
                let a = serde_json::to_string(a).unwrap_or_default();
                let b = serde_json::to_string(b).unwrap_or_default();
                a.cmp(&b)
            });
            Value::Array(normalized)
        }
        Value::Object(map) => {
            let normalized: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), normalize_value(v))).collect();
            serde_json::to_value(normalized).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    }
}

/// Reduces a linked-records field's value (a list of related-record ids) to
/// its sorted set before hashing, per §4.5's "related records reduced to
/// sorted ids" rule.
pub fn normalize_linked_ids(ids: &[String]) -> Value {
    let mut sorted = ids.to_vec();
    sorted.sort();
    serde_json::to_value(sorted).expect("vec of strings always serializes")
}

/// A row is considered empty (and excluded from hashing/classification) when
/// every mapped field is null, missing, or an empty/whitespace string.
pub fn is_empty_row(fields: &RowFields) -> bool {
    fields.values().all(|v| match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    NewInSor,
    NewInGrid,
    BothModified,
    SorOnlyChange,
    GridOnlyChange,
    DeletedInGrid,
    DeletedInSor,
    Unchanged,
}

/// What a record-key classification needs to see from "now": freshly
/// computed hashes for whichever side currently has the record. `None`
/// means the record is absent from that side this run.
#[derive(Debug, Clone, Default)]
pub struct CurrentHashes {
    pub sor_hash: Option<String>,
    pub grid_hash: Option<String>,
}

/// Classifies one record key's change status by comparing `current` against
/// the prior snapshot's entry (if any), per §4.5's decision table.
pub fn classify(snapshot: &HashSnapshot, key: &RecordKey, current: &CurrentHashes) -> ChangeKind {
    let prior = snapshot.entries.get(key);

    match (prior, &current.sor_hash, &current.grid_hash) {
        (None, Some(_), None) => ChangeKind::NewInSor,
        (None, None, Some(_)) => ChangeKind::NewInGrid,
        (None, Some(_), Some(_)) => ChangeKind::BothModified,
        (None, None, None) => ChangeKind::Unchanged,

        (Some(_), None, None) => ChangeKind::Unchanged,
        // A record key previously snapshotted on both sides that has gone
        // missing from one side is always a deletion conflict, even if the
        // surviving side's hash still matches the snapshot untouched: the
        // disappearance itself is the change that needs reconciling (§8
        // scenario 5 — SOR deletes a record the grid never touched, and the
        // run must still surface it as a conflict for the resolver to act on).
        (Some(_), None, Some(_)) => ChangeKind::DeletedInSor,
        (Some(_), Some(_), None) => ChangeKind::DeletedInGrid,
        (Some(entry), Some(sor_hash), Some(grid_hash)) => {
            let sor_changed = entry.content_hash != *sor_hash;
            let grid_changed = entry.content_hash != *grid_hash;
            match (sor_changed, grid_changed) {
                // Both sides moved away from the snapshot; treat this as a
                // conflict even when the two new hashes happen to agree —
                // that agreement is coincidental, not evidence the two
                // edits were the same edit.
                (true, true) => ChangeKind::BothModified,
                (true, false) => ChangeKind::SorOnlyChange,
                (false, true) => ChangeKind::GridOnlyChange,
                (false, false) => ChangeKind::Unchanged,
            }
        }
    }
}

/// Records a freshly computed hash into the snapshot, stamping
/// `captured_at` with the supplied "now" (callers pass a single shared
/// timestamp per run so every entry in a snapshot agrees on capture time).
pub fn record_entry(
    snapshot: &mut HashSnapshot,
    key: RecordKey,
    content_hash: String,
    sor_modified_at: Option<chrono::DateTime<Utc>>,
    grid_modified_at: Option<chrono::DateTime<Utc>>,
    now: chrono::DateTime<Utc>,
) {
    snapshot.entries.insert(
        key,
        HashEntry { content_hash, captured_at: now, sor_modified_at, grid_modified_at },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use xsync_schemas::row_key;

    fn fields(pairs: &[(&str, Value)]) -> RowFields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn hash_is_stable_under_map_key_reordering() {
        let a = fields(&[("Name", Value::String("Ada".into())), ("Tier", Value::String("Gold".into()))]);
        let b = fields(&[("Tier", Value::String("Gold".into())), ("Name", Value::String("Ada".into()))]);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_is_stable_under_string_whitespace() {
        let a = fields(&[("Name", Value::String("Ada".into()))]);
        let b = fields(&[("Name", Value::String("  Ada  ".into()))]);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_is_stable_under_multi_select_array_ordering() {
        let a = fields(&[("Tags", serde_json::json!(["red", "blue"]))]);
        let b = fields(&[("Tags", serde_json::json!(["blue", "red"]))]);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_is_stable_under_number_rounding_noise() {
        let a = fields(&[("Amount", serde_json::json!(1.000000049))]);
        let b = fields(&[("Amount", serde_json::json!(1.0))]);
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn different_values_hash_differently() {
        let a = fields(&[("Name", Value::String("Ada".into()))]);
        let b = fields(&[("Name", Value::String("Bob".into()))]);
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn linked_ids_are_reduced_to_sorted_set() {
        let a = normalize_linked_ids(&["r2".into(), "r1".into()]);
        let b = normalize_linked_ids(&["r1".into(), "r2".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_row_detection() {
        assert!(is_empty_row(&fields(&[("Name", Value::Null), ("Tags", serde_json::json!([]))])));
        assert!(!is_empty_row(&fields(&[("Name", Value::String("Ada".into()))])));
    }

    #[test]
    fn first_sync_with_only_sor_side_present_is_new_in_sor() {
        let snapshot = HashSnapshot::empty();
        let key = row_key(0);
        let current = CurrentHashes { sor_hash: Some("h1".into()), grid_hash: None };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::NewInSor);
    }

    #[test]
    fn first_sync_with_only_grid_side_present_is_new_in_grid() {
        let snapshot = HashSnapshot::empty();
        let key = row_key(0);
        let current = CurrentHashes { sor_hash: None, grid_hash: Some("h1".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::NewInGrid);
    }

    #[test]
    fn both_sides_changed_from_prior_and_disagree_is_both_modified() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "old".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: Some("new-sor".into()), grid_hash: Some("new-grid".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::BothModified);
    }

    #[test]
    fn both_sides_changed_to_the_same_new_hash_is_still_both_modified() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "old".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: Some("new".into()), grid_hash: Some("new".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::BothModified);
    }

    #[test]
    fn only_sor_side_changed_is_sor_only_change() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "same".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: Some("changed".into()), grid_hash: Some("same".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::SorOnlyChange);
    }

    #[test]
    fn only_grid_side_changed_is_grid_only_change() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "same".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: Some("same".into()), grid_hash: Some("changed".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::GridOnlyChange);
    }

    #[test]
    fn deletion_is_detected_even_when_surviving_side_is_untouched() {
        // The surviving side's hash still matches the snapshot exactly (it was
        // never edited) but the record vanished from the other side. That
        // disappearance must still surface as a deletion, not get swallowed
        // into Unchanged — see spec scenario of a one-sided delete with no
        // edits on the other side.
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "old".into(), None, None, Utc::now());

        let grid_untouched = CurrentHashes { sor_hash: None, grid_hash: Some("old".into()) };
        assert_eq!(classify(&snapshot, &key, &grid_untouched), ChangeKind::DeletedInSor);

        let sor_untouched = CurrentHashes { sor_hash: Some("old".into()), grid_hash: None };
        assert_eq!(classify(&snapshot, &key, &sor_untouched), ChangeKind::DeletedInGrid);
    }

    #[test]
    fn both_sides_absent_after_prior_snapshot_is_unchanged() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "old".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: None, grid_hash: None };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::Unchanged);
    }

    #[test]
    fn absent_from_sor_with_differing_grid_hash_is_deleted_in_sor() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "old".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: None, grid_hash: Some("changed".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::DeletedInSor);
    }

    #[test]
    fn absent_from_grid_with_differing_sor_hash_is_deleted_in_grid() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "old".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: Some("changed".into()), grid_hash: None };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::DeletedInGrid);
    }

    #[test]
    fn unchanged_on_both_sides_is_unchanged() {
        let mut snapshot = HashSnapshot::empty();
        let key = row_key(0);
        record_entry(&mut snapshot, key.clone(), "same".into(), None, None, Utc::now());
        let current = CurrentHashes { sor_hash: Some("same".into()), grid_hash: Some("same".into()) };
        assert_eq!(classify(&snapshot, &key, &current), ChangeKind::Unchanged);
    }
}
