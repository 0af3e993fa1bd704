use crate::core::deadline::{Deadline, DeadlineExceeded, SCAN_CHUNK};
use crate::core::fingerprint::{Fingerprint, FingerprintError};
use crate::core::image::ItemId;
use crate::core::snapshot::{SnapshotError, write_atomic};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SieveError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

/// One sieve hit: lower distance is closer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SieveMatch {
    pub id: ItemId,
    pub distance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SieveEntry {
    id: ItemId,
    fingerprint: Fingerprint,
}

#[derive(Serialize, Deserialize)]
struct SieveFile {
    entries: Vec<SieveEntry>,
}

/// Brute-force fingerprint filter.
///
/// Entries are kept in insertion order, which is also the tie-break order for
/// equal distances. Identical fingerprints under different identifiers are all
/// retained; re-inserting an identifier replaces its fingerprint in place.
#[derive(Debug, Clone, Default)]
pub struct HashSieve {
    entries: Vec<SieveEntry>,
    positions: HashMap<ItemId, usize>,
}

impl HashSieve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ItemId, fingerprint: Fingerprint) {
        match self.positions.get(&id) {
            Some(&pos) => self.entries[pos].fingerprint = fingerprint,
            None => {
                self.positions.insert(id.clone(), self.entries.len());
                self.entries.push(SieveEntry { id, fingerprint });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Width of the stored fingerprints, taken from the first entry.
    pub fn width(&self) -> Option<u32> {
        self.entries.first().map(|e| e.fingerprint.width())
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.positions.contains_key(id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&Fingerprint> {
        self.positions
            .get(id)
            .map(|&pos| &self.entries[pos].fingerprint)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    /// Every entry within `threshold` bits of `fingerprint`, nearest first,
    /// at most `limit` of them. `exclude` drops the query's own entry.
    pub fn query(
        &self,
        fingerprint: &Fingerprint,
        threshold: u32,
        exclude: Option<&ItemId>,
        limit: usize,
        deadline: Deadline,
    ) -> Result<Vec<SieveMatch>, SieveError> {
        let mut matches = Vec::new();
        if limit == 0 {
            return Ok(matches);
        }

        for chunk in self.entries.chunks(SCAN_CHUNK) {
            deadline.check()?;
            for entry in chunk {
                if exclude == Some(&entry.id) {
                    continue;
                }
                let distance = fingerprint.hamming(&entry.fingerprint)?;
                if distance <= threshold {
                    matches.push(SieveMatch {
                        id: entry.id.clone(),
                        distance,
                    });
                }
            }
        }

        // Stable: equal distances stay in insertion order.
        matches.sort_by_key(|m| m.distance);
        matches.truncate(limit);
        Ok(matches)
    }

    /// Write the sieve as one JSON document, atomically replacing `path`.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        write_atomic(path, &self.encode()?)?;
        log::info!("Saved {} fingerprints to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = fs::read(path).map_err(|e| SnapshotError::from_io(path, e))?;
        let sieve = Self::decode(&bytes, &path.display().to_string())?;
        log::info!("Loaded {} fingerprints from {}", sieve.len(), path.display());
        Ok(sieve)
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let file = SieveFile {
            entries: self.entries.clone(),
        };
        Ok(serde_json::to_vec(&file)?)
    }

    /// Parse an encoded sieve. Entries of differing widths mark the whole
    /// artifact as corrupt.
    pub(crate) fn decode(bytes: &[u8], artifact: &str) -> Result<Self, SnapshotError> {
        let corrupt = |message: String| SnapshotError::Corrupt {
            artifact: artifact.to_string(),
            message,
        };
        let file: SieveFile = serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;

        let mut sieve = Self::new();
        for entry in file.entries {
            if let Some(width) = sieve.width() {
                if entry.fingerprint.width() != width {
                    return Err(corrupt(format!(
                        "{} has a {}-bit fingerprint in a {}-bit sieve",
                        entry.id,
                        entry.fingerprint.width(),
                        width
                    )));
                }
            }
            sieve.insert(entry.id, entry.fingerprint);
        }
        Ok(sieve)
    }

    /// Every stored fingerprint, in insertion order.
    pub fn fingerprints(&self) -> impl Iterator<Item = (&ItemId, &Fingerprint)> {
        self.entries.iter().map(|e| (&e.id, &e.fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn id(name: &str) -> ItemId {
        ItemId::new(name)
    }

    #[test]
    fn test_query_ranks_by_distance() {
        let mut sieve = HashSieve::new();
        sieve.insert(id("far"), Fingerprint::from_u64(0b1111));
        sieve.insert(id("near"), Fingerprint::from_u64(0b1));
        sieve.insert(id("exact"), Fingerprint::from_u64(0));
        sieve.insert(id("out"), Fingerprint::from_u64(u64::MAX));

        let matches = sieve
            .query(&Fingerprint::from_u64(0), 5, None, 10, Deadline::none())
            .unwrap();

        let ranked: Vec<_> = matches.iter().map(|m| (m.id.as_str(), m.distance)).collect();
        assert_eq!(ranked, vec![("exact", 0), ("near", 1), ("far", 4)]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut sieve = HashSieve::new();
        for name in ["c", "a", "b"] {
            sieve.insert(id(name), Fingerprint::from_u64(0b11));
        }

        let matches = sieve
            .query(&Fingerprint::from_u64(0), 2, None, 10, Deadline::none())
            .unwrap();
        let order: Vec<_> = matches.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_duplicate_fingerprints_are_retained() {
        let mut sieve = HashSieve::new();
        sieve.insert(id("one"), Fingerprint::from_u64(42));
        sieve.insert(id("two"), Fingerprint::from_u64(42));
        assert_eq!(sieve.len(), 2);
    }

    #[test]
    fn test_reinsert_overwrites_in_place() {
        let mut sieve = HashSieve::new();
        sieve.insert(id("a"), Fingerprint::from_u64(0));
        sieve.insert(id("b"), Fingerprint::from_u64(0));
        sieve.insert(id("a"), Fingerprint::from_u64(1));

        assert_eq!(sieve.len(), 2);
        assert_eq!(sieve.get(&id("a")), Some(&Fingerprint::from_u64(1)));

        let matches = sieve
            .query(&Fingerprint::from_u64(0), 1, None, 10, Deadline::none())
            .unwrap();
        assert_eq!(matches[0].id, id("b"));
        assert_eq!(matches[1].id, id("a"));
    }

    #[test]
    fn test_exclude_self_and_limit() {
        let mut sieve = HashSieve::new();
        sieve.insert(id("self"), Fingerprint::from_u64(0));
        sieve.insert(id("x"), Fingerprint::from_u64(1));
        sieve.insert(id("y"), Fingerprint::from_u64(3));

        let matches = sieve
            .query(
                &Fingerprint::from_u64(0),
                5,
                Some(&id("self")),
                1,
                Deadline::none(),
            )
            .unwrap();
        assert_eq!(
            matches,
            vec![SieveMatch {
                id: id("x"),
                distance: 1
            }]
        );
    }

    #[test]
    fn test_width_mismatch_is_an_error() {
        let mut sieve = HashSieve::new();
        sieve.insert(id("wide"), Fingerprint::from_bytes(vec![0u8; 32]));

        let err = sieve
            .query(&Fingerprint::from_u64(0), 5, None, 3, Deadline::none())
            .unwrap_err();
        assert!(matches!(err, SieveError::Fingerprint(_)));
    }

    #[test]
    fn test_expired_deadline() {
        let mut sieve = HashSieve::new();
        sieve.insert(id("a"), Fingerprint::from_u64(0));

        let past = Deadline::at(Instant::now() - Duration::from_millis(1));
        let err = sieve
            .query(&Fingerprint::from_u64(0), 5, None, 3, past)
            .unwrap_err();
        assert!(matches!(err, SieveError::Deadline(_)));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sieve.json");

        let mut sieve = HashSieve::new();
        sieve.insert(id("b"), Fingerprint::from_u64(7));
        sieve.insert(id("a"), Fingerprint::from_u64(9));
        sieve.save(&path).unwrap();

        let loaded = HashSieve::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&id("a")), Some(&Fingerprint::from_u64(9)));

        let matches = loaded
            .query(&Fingerprint::from_u64(7), 64, None, 10, Deadline::none())
            .unwrap();
        assert_eq!(matches[0].id, id("b"));
    }

    #[test]
    fn test_load_rejects_mixed_widths() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sieve.json");
        fs::write(
            &path,
            r#"{"entries":[{"id":"a","fingerprint":"0000000000000000"},{"id":"b","fingerprint":"00"}]}"#,
        )
        .unwrap();

        let err = HashSieve::load(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = HashSieve::load(&temp_dir.path().join("sieve.json")).unwrap_err();
        assert!(matches!(err, SnapshotError::Missing { .. }));
    }
}
