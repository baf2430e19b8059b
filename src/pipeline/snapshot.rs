//! Run snapshot: the set of keys observed during one ingestion run

use super::types::DetectionKey;
use std::collections::HashSet;

/// Accumulates keys across all satellites and files. Duplicates collapse.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    keys: HashSet<DetectionKey>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, key: &DetectionKey) {
        if !self.keys.contains(key) {
            self.keys.insert(key.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn build(self) -> RunSnapshot {
        RunSnapshot { keys: self.keys }
    }
}

/// Immutable, unordered set of keys seen in a run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSnapshot {
    keys: HashSet<DetectionKey>,
}

impl RunSnapshot {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &DetectionKey) -> bool {
        self.keys.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectionKey> {
        self.keys.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn key(lat: &str, time: u32) -> DetectionKey {
        DetectionKey::new(
            lat.parse().unwrap(),
            "71.4".parse().unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            NaiveTime::from_hms_opt(time, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut builder = SnapshotBuilder::new();
        builder.observe(&key("51.10", 12));
        builder.observe(&key("51.1", 12));
        builder.observe(&key("51.1", 13));
        builder.observe(&key("52", 12));

        let snapshot = builder.build();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.contains(&key("51.100", 12)));
        assert!(!snapshot.contains(&key("51.1", 14)));
    }
}
