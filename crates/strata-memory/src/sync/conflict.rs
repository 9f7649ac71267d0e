//! Last-writer-wins conflict resolution and the conflict log.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strata_types::{MemoryItem, Timestamp, now};

/// Which side of a conflict survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictWinner {
    /// The version in `store_a` (the synchronization source).
    StoreA,
    /// The version in `store_b` (the synchronization target).
    StoreB,
}

/// Why the winner won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionReason {
    /// Strictly later `updated_at`.
    Newer,
    /// Equal `updated_at`; the lexicographically smaller backend name wins.
    TieBreak,
}

/// One resolved conflict. Both versions are kept in full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub item_id: String,
    pub store_a: String,
    pub store_b: String,
    pub version_a: MemoryItem,
    pub version_b: MemoryItem,
    pub winner: ConflictWinner,
    pub reason: ResolutionReason,
    pub resolved_at: Timestamp,
}

impl ConflictRecord {
    pub fn winning_version(&self) -> &MemoryItem {
        match self.winner {
            ConflictWinner::StoreA => &self.version_a,
            ConflictWinner::StoreB => &self.version_b,
        }
    }

    pub fn losing_version(&self) -> &MemoryItem {
        match self.winner {
            ConflictWinner::StoreA => &self.version_b,
            ConflictWinner::StoreB => &self.version_a,
        }
    }

    pub fn winning_store(&self) -> &str {
        match self.winner {
            ConflictWinner::StoreA => &self.store_a,
            ConflictWinner::StoreB => &self.store_b,
        }
    }
}

/// Resolve divergent versions of one item held by `store_a` and `store_b`.
pub fn resolve(
    store_a: &str,
    version_a: MemoryItem,
    store_b: &str,
    version_b: MemoryItem,
) -> ConflictRecord {
    let (winner, reason) = if version_a.updated_at > version_b.updated_at {
        (ConflictWinner::StoreA, ResolutionReason::Newer)
    } else if version_b.updated_at > version_a.updated_at {
        (ConflictWinner::StoreB, ResolutionReason::Newer)
    } else if store_a <= store_b {
        (ConflictWinner::StoreA, ResolutionReason::TieBreak)
    } else {
        (ConflictWinner::StoreB, ResolutionReason::TieBreak)
    };

    ConflictRecord {
        item_id: version_a.id.clone(),
        store_a: store_a.to_string(),
        store_b: store_b.to_string(),
        version_a,
        version_b,
        winner,
        reason,
        resolved_at: now(),
    }
}

/// Append-only record of every resolved conflict.
#[derive(Debug, Default)]
pub struct ConflictLog {
    records: Mutex<Vec<ConflictRecord>>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, records: impl IntoIterator<Item = ConflictRecord>) {
        self.records.lock().extend(records);
    }

    pub fn records(&self) -> Vec<ConflictRecord> {
        self.records.lock().clone()
    }

    /// Every record about `item_id`, oldest first.
    pub fn for_item(&self, item_id: &str) -> Vec<ConflictRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use strata_types::MemoryType;

    fn versions() -> (MemoryItem, MemoryItem) {
        let a = MemoryItem::new(MemoryType::Semantic, "from a").with_id("x");
        let b = MemoryItem::new(MemoryType::Semantic, "from b")
            .with_id("x")
            .with_updated_at(a.updated_at);
        (a, b)
    }

    #[test]
    fn test_newer_wins() {
        let (a, b) = versions();
        let b = b.with_updated_at(a.updated_at + Duration::seconds(1));

        let record = resolve("alpha", a, "beta", b);

        assert_eq!(record.winner, ConflictWinner::StoreB);
        assert_eq!(record.reason, ResolutionReason::Newer);
        assert_eq!(record.winning_version().content, "from b");
        assert_eq!(record.losing_version().content, "from a");
        assert_eq!(record.winning_store(), "beta");
    }

    #[test]
    fn test_tie_goes_to_smaller_name() {
        let (a, b) = versions();

        let forward = resolve("beta", a.clone(), "alpha", b.clone());
        assert_eq!(forward.winner, ConflictWinner::StoreB);
        assert_eq!(forward.reason, ResolutionReason::TieBreak);

        let backward = resolve("alpha", b, "beta", a);
        assert_eq!(backward.winner, ConflictWinner::StoreA);
        assert_eq!(backward.winning_version().content, "from b");
    }

    #[test]
    fn test_log_keeps_both_versions() {
        let (a, b) = versions();
        let log = ConflictLog::new();
        log.extend([resolve("alpha", a, "beta", b)]);

        let records = log.for_item("x");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version_a.content, "from a");
        assert_eq!(records[0].version_b.content, "from b");
        assert!(log.for_item("y").is_empty());
    }
}
