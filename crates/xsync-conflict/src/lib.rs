//! Conflict detection and resolution (§4.5 "ConflictDetector" / §4.6
//! "ConflictResolver").
//!
//! Detection classifies every record key against the last [`HashSnapshot`]
//! via [`xsync_hashstate::classify`] and keeps only the classifications that
//! need a human-chosen winner: [`ChangeKind::BothModified`],
//! [`ChangeKind::DeletedInGrid`], [`ChangeKind::DeletedInSor`]. Resolution
//! then turns each conflict plus a [`ConflictStrategy`] into one
//! [`Decision`] naming an action and a reason, deterministic and pure: no
//! I/O, no clock reads, same inputs always produce the same decisions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use xsync_hashstate::{classify, ChangeKind, CurrentHashes};
use xsync_schemas::{ConflictStrategy, HashSnapshot, RecordKey};

/// A record key whose classification against the prior snapshot requires a
/// resolution decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub key: RecordKey,
    pub kind: ChangeKind,
}

/// Which side's data should be taken as truth, or whether the record should
/// be removed entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictAction {
    UseSor,
    UseGrid,
    Delete,
    Skip,
}

/// One conflict's resolved outcome, carrying a human-readable reason so a
/// run report can explain itself without the caller re-deriving the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub key: RecordKey,
    pub action: ConflictAction,
    pub reason: String,
}

fn is_conflict(kind: ChangeKind) -> bool {
    matches!(kind, ChangeKind::BothModified | ChangeKind::DeletedInGrid | ChangeKind::DeletedInSor)
}

/// Classifies every key in `current` against `snapshot` and returns the
/// subset that are conflicts (both-modified or one-sided deletion). Keys
/// classified as new, unchanged, or changed on only one side never produce a
/// `Conflict` — the caller applies those directly without going through
/// resolution.
pub fn detect_conflicts(
    snapshot: &HashSnapshot,
    current: &BTreeMap<RecordKey, CurrentHashes>,
) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = current
        .iter()
        .filter_map(|(key, hashes)| {
            let kind = classify(snapshot, key, hashes);
            is_conflict(kind).then(|| Conflict { key: key.clone(), kind })
        })
        .collect();
    conflicts.sort_by(|a, b| a.key.cmp(&b.key));
    conflicts
}

/// Resolves a list of conflicts into decisions under the given strategy, per
/// §4.6's rule table.
pub fn resolve_conflicts(conflicts: &[Conflict], strategy: ConflictStrategy) -> Vec<Decision> {
    conflicts.iter().map(|conflict| resolve_one(conflict, strategy)).collect()
}

fn resolve_one(conflict: &Conflict, strategy: ConflictStrategy) -> Decision {
    let (action, reason) = match (strategy, conflict.kind) {
        (ConflictStrategy::SorWins, ChangeKind::BothModified) => {
            (ConflictAction::UseSor, "SOR_WINS: both sides changed, SOR value kept".to_string())
        }
        (ConflictStrategy::SorWins, ChangeKind::DeletedInGrid) => (
            ConflictAction::UseSor,
            "SOR_WINS: record removed from grid, restored from SOR".to_string(),
        ),
        (ConflictStrategy::SorWins, ChangeKind::DeletedInSor) => (
            ConflictAction::Delete,
            "SOR_WINS: record deleted in SOR, removing from grid".to_string(),
        ),

        (ConflictStrategy::GridWins, ChangeKind::BothModified) => {
            (ConflictAction::UseGrid, "GRID_WINS: both sides changed, grid value kept".to_string())
        }
        (ConflictStrategy::GridWins, ChangeKind::DeletedInSor) => (
            ConflictAction::UseGrid,
            "GRID_WINS: record removed from SOR, restored from grid".to_string(),
        ),
        (ConflictStrategy::GridWins, ChangeKind::DeletedInGrid) => (
            ConflictAction::Delete,
            "GRID_WINS: record deleted in grid, removing from SOR".to_string(),
        ),

        (ConflictStrategy::NewestWins, ChangeKind::BothModified) => (
            ConflictAction::UseSor,
            "NEWEST_WINS: neither side exposes cell-level timestamps, defaulting to SOR"
                .to_string(),
        ),
        (ConflictStrategy::NewestWins, ChangeKind::DeletedInGrid | ChangeKind::DeletedInSor) => {
            (ConflictAction::Delete, "NEWEST_WINS: deletion wins over the other side's edits".to_string())
        }

        // Reachable only if a caller passes a non-conflicting kind; resolution
        // has nothing to decide, so the record is left untouched.
        (_, _) => (ConflictAction::Skip, "not a conflicting classification".to_string()),
    };
    Decision { key: conflict.key.clone(), action, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use xsync_hashstate::record_entry;
    use xsync_schemas::row_key;

    fn snapshot_with(key: &RecordKey, hash: &str) -> HashSnapshot {
        let mut snapshot = HashSnapshot::empty();
        record_entry(&mut snapshot, key.clone(), hash.to_string(), None, None, Utc::now());
        snapshot
    }

    #[test]
    fn detects_both_modified_as_conflict() {
        let key = row_key(0);
        let snapshot = snapshot_with(&key, "old");
        let mut current = BTreeMap::new();
        current.insert(
            key.clone(),
            CurrentHashes { sor_hash: Some("sor-new".into()), grid_hash: Some("grid-new".into()) },
        );
        let conflicts = detect_conflicts(&snapshot, &current);
        assert_eq!(conflicts, vec![Conflict { key, kind: ChangeKind::BothModified }]);
    }

    #[test]
    fn one_sided_changes_are_not_conflicts() {
        let key = row_key(0);
        let snapshot = snapshot_with(&key, "same");
        let mut current = BTreeMap::new();
        current.insert(
            key.clone(),
            CurrentHashes { sor_hash: Some("changed".into()), grid_hash: Some("same".into()) },
        );
        assert!(detect_conflicts(&snapshot, &current).is_empty());
    }

    #[test]
    fn one_sided_deletion_is_a_conflict_even_when_surviving_side_is_untouched() {
        let key = row_key(0);
        let snapshot = snapshot_with(&key, "same");
        let mut current = BTreeMap::new();
        current.insert(key.clone(), CurrentHashes { sor_hash: None, grid_hash: Some("same".into()) });
        let conflicts = detect_conflicts(&snapshot, &current);
        assert_eq!(conflicts, vec![Conflict { key, kind: ChangeKind::DeletedInSor }]);
    }

    #[test]
    fn sor_wins_restores_deleted_in_grid_and_deletes_deleted_in_sor() {
        let restore = Conflict { key: "r1".to_string(), kind: ChangeKind::DeletedInGrid };
        let propagate = Conflict { key: "r2".to_string(), kind: ChangeKind::DeletedInSor };
        let decisions = resolve_conflicts(&[restore, propagate], ConflictStrategy::SorWins);
        assert_eq!(decisions[0].action, ConflictAction::UseSor);
        assert_eq!(decisions[1].action, ConflictAction::Delete);
    }

    #[test]
    fn grid_wins_is_symmetric_to_sor_wins() {
        let restore = Conflict { key: "r1".to_string(), kind: ChangeKind::DeletedInSor };
        let propagate = Conflict { key: "r2".to_string(), kind: ChangeKind::DeletedInGrid };
        let decisions = resolve_conflicts(&[restore, propagate], ConflictStrategy::GridWins);
        assert_eq!(decisions[0].action, ConflictAction::UseGrid);
        assert_eq!(decisions[1].action, ConflictAction::Delete);
    }

    #[test]
    fn newest_wins_defaults_both_modified_to_sor_and_always_lets_deletion_win() {
        let modified = Conflict { key: "r1".to_string(), kind: ChangeKind::BothModified };
        let deleted_in_sor = Conflict { key: "r2".to_string(), kind: ChangeKind::DeletedInSor };
        let deleted_in_grid = Conflict { key: "r3".to_string(), kind: ChangeKind::DeletedInGrid };
        let decisions = resolve_conflicts(
            &[modified, deleted_in_sor, deleted_in_grid],
            ConflictStrategy::NewestWins,
        );
        assert_eq!(decisions[0].action, ConflictAction::UseSor);
        assert!(decisions[0].reason.contains("defaulting to SOR"));
        assert_eq!(decisions[1].action, ConflictAction::Delete);
        assert!(decisions[1].reason.contains("deletion wins"));
        assert_eq!(decisions[2].action, ConflictAction::Delete);
        assert!(decisions[2].reason.contains("deletion wins"));
    }
}
