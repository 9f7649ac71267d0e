//! Per-pair record of what has already been propagated.

use std::collections::HashMap;

use parking_lot::Mutex;
use strata_types::{MemoryItem, VersionStamp};

/// For every ordered `(source, target)` pair, the version of each source
/// item last propagated.
///
/// "Changed since the checkpoint" compares version stamps, not clocks, so
/// repeated synchronization is idempotent under clock skew.
#[derive(Debug, Default)]
pub struct SyncCheckpoints {
    pairs: Mutex<HashMap<(String, String), HashMap<String, VersionStamp>>>,
}

impl SyncCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items of `items` whose version differs from the recorded one.
    pub fn changed(&self, source: &str, target: &str, items: Vec<MemoryItem>) -> Vec<MemoryItem> {
        let pairs = self.pairs.lock();
        let Some(seen) = pairs.get(&(source.to_string(), target.to_string())) else {
            return items;
        };
        items
            .into_iter()
            .filter(|item| seen.get(&item.id) != Some(&item.version()))
            .collect()
    }

    pub fn record<'a>(
        &self,
        source: &str,
        target: &str,
        items: impl IntoIterator<Item = &'a MemoryItem>,
    ) {
        let mut pairs = self.pairs.lock();
        let seen = pairs
            .entry((source.to_string(), target.to_string()))
            .or_default();
        for item in items {
            seen.insert(item.id.clone(), item.version());
        }
    }

    /// Forget every pair involving `backend`.
    pub fn forget_backend(&self, backend: &str) {
        self.pairs
            .lock()
            .retain(|(source, target), _| source != backend && target != backend);
    }

    /// Number of items recorded for a pair.
    pub fn recorded(&self, source: &str, target: &str) -> usize {
        self.pairs
            .lock()
            .get(&(source.to_string(), target.to_string()))
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::MemoryType;

    #[test]
    fn test_changed_filters_recorded_versions() {
        let checkpoints = SyncCheckpoints::new();
        let a = MemoryItem::new(MemoryType::Working, "a").with_id("a");
        let b = MemoryItem::new(MemoryType::Working, "b").with_id("b");

        assert_eq!(checkpoints.changed("s", "t", vec![a.clone(), b.clone()]).len(), 2);

        checkpoints.record("s", "t", [&a]);
        let changed = checkpoints.changed("s", "t", vec![a.clone(), b.clone()]);
        assert_eq!(changed, vec![b.clone()]);

        // Other direction is independent.
        assert_eq!(checkpoints.changed("t", "s", vec![a.clone()]).len(), 1);

        let mut edited = a.clone();
        edited.content = "edited".into();
        assert_eq!(checkpoints.changed("s", "t", vec![edited]).len(), 1);
    }

    #[test]
    fn test_forget_backend() {
        let checkpoints = SyncCheckpoints::new();
        let a = MemoryItem::new(MemoryType::Working, "a").with_id("a");
        checkpoints.record("s", "t", [&a]);
        checkpoints.record("t", "u", [&a]);

        checkpoints.forget_backend("s");

        assert_eq!(checkpoints.recorded("s", "t"), 0);
        assert_eq!(checkpoints.recorded("t", "u"), 1);
    }
}
