//! # Cell Store
//!
//! Per-cell append-only history: a cell is addressed by `(LP_SF, column)`
//! and holds a sequence of entries ordered by `valid_from`. Tombstones
//! mark deletes without erasing history. All entries committed by one
//! request share a single `valid_from`, so a batch becomes visible
//! atomically.

pub mod pages;

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

use twox_hash::XxHash64;

use pep_crypto::PackedElGamal;
use pep_types::{
    ChecksumValue, EncryptionScheme, ExtraMetadata, HasChecksumChains, PepError, Timestamp,
};

use pages::{PagedPayload, PageStore};

/// Address of one cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    /// The Storage Facility's local pseudonym of the participant.
    pub pseudonym: [u8; 32],
    pub column: String,
}

/// The content of a non-tombstone entry.
#[derive(Debug, Clone)]
pub struct EntryContent {
    pub payload: Arc<PagedPayload>,
    pub polymorphic_key: PackedElGamal,
    pub blinding_timestamp: Timestamp,
    pub encryption_scheme: EncryptionScheme,
    /// When the payload itself was last written; metadata-only updates
    /// carry it forward unchanged.
    pub original_payload_entry_timestamp: Timestamp,
    pub metadata: ExtraMetadata,
}

/// One history entry of a cell.
#[derive(Debug, Clone)]
pub struct Entry {
    pub valid_from: Timestamp,
    /// `None` marks a tombstone.
    pub content: Option<EntryContent>,
    /// The per-entry contribution to the `files` checksum chain.
    pub checksum_substitute: u64,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.content.is_none()
    }
}

/// Computes an entry's checksum substitute from its header fields.
fn checksum_substitute(key: &CellKey, valid_from: Timestamp, content: &Option<EntryContent>) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(&key.pseudonym);
    h.write(key.column.as_bytes());
    h.write(&valid_from.0.to_be_bytes());
    match content {
        None => h.write(&[0]),
        Some(content) => {
            h.write(&[1]);
            for page in &content.payload.pages {
                h.write(page);
            }
            h.write(&content.polymorphic_key.to_bytes());
        }
    }
    h.finish()
}

/// Default audit horizon: chains only cover state older than one minute,
/// so auditors see settled history.
const DEFAULT_CHECKPOINT_LAG_MS: u64 = 60_000;

/// The Storage Facility's cell map plus its page store.
pub struct CellStore {
    cells: BTreeMap<CellKey, Vec<Entry>>,
    pages: Box<dyn PageStore>,
    last_valid_from: u64,
}

impl CellStore {
    pub fn new(pages: Box<dyn PageStore>) -> CellStore {
        CellStore {
            cells: BTreeMap::new(),
            pages,
            last_valid_from: 0,
        }
    }

    /// Allocates the next `valid_from`: strictly monotonic, never behind
    /// the wall clock.
    pub fn next_valid_from(&mut self, now: Timestamp) -> Timestamp {
        let t = now.0.max(self.last_valid_from + 1);
        self.last_valid_from = t;
        Timestamp(t)
    }

    pub fn pages(&self) -> &dyn PageStore {
        self.pages.as_ref()
    }

    pub fn pages_mut(&mut self) -> &mut dyn PageStore {
        self.pages.as_mut()
    }

    /// The full history of a cell, oldest first.
    pub fn history(&self, key: &CellKey) -> &[Entry] {
        self.cells.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// The latest entry at or before `at`, tombstone or not.
    pub fn latest_entry_at(&self, key: &CellKey, at: Timestamp) -> Option<&Entry> {
        self.cells
            .get(key)?
            .iter()
            .rev()
            .find(|e| e.valid_from <= at)
    }

    /// The current (non-tombstone) entry at `at`.
    pub fn current_entry_at(&self, key: &CellKey, at: Timestamp) -> Option<&Entry> {
        self.latest_entry_at(key, at).filter(|e| !e.is_tombstone())
    }

    /// The entry created exactly at `valid_from`, as referenced by an id.
    pub fn entry_at_exactly(&self, key: &CellKey, valid_from: Timestamp) -> Option<&Entry> {
        self.cells
            .get(key)?
            .iter()
            .find(|e| e.valid_from == valid_from)
    }

    /// Appends an entry; `valid_from` must come from `next_valid_from` so
    /// per-cell history stays ordered.
    pub fn append(
        &mut self,
        key: CellKey,
        valid_from: Timestamp,
        content: Option<EntryContent>,
    ) -> Result<(), PepError> {
        let history = self.cells.entry(key.clone()).or_default();
        if let Some(last) = history.last() {
            if last.valid_from >= valid_from {
                return Err(PepError::fatal("cell history went backwards"));
            }
        }
        let substitute = checksum_substitute(&key, valid_from, &content);
        history.push(Entry {
            valid_from,
            content,
            checksum_substitute: substitute,
        });
        Ok(())
    }

    /// Total number of entries across all cells.
    pub fn entry_count(&self) -> usize {
        self.cells.values().map(|v| v.len()).sum()
    }

    /// The gauges exposed for monitoring: entry count and pages on disk.
    pub fn gauges(&self) -> (usize, usize) {
        (self.entry_count(), self.pages.len())
    }

    fn checksum_horizon(&self, max_checkpoint: Option<u64>) -> u64 {
        max_checkpoint
            .unwrap_or_else(|| Timestamp::now().0.saturating_sub(DEFAULT_CHECKPOINT_LAG_MS))
    }
}

impl HasChecksumChains for CellStore {
    fn checksum_chain_names(&self) -> Vec<String> {
        vec!["files".to_string(), "entry-count".to_string()]
    }

    fn compute_checksum_chain(
        &self,
        name: &str,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        let horizon = self.checksum_horizon(max_checkpoint);
        let mut checksum = 0u64;
        let mut count = 0u64;
        let mut checkpoint = 0u64;
        for entries in self.cells.values() {
            for entry in entries {
                if entry.valid_from.0 > horizon {
                    continue;
                }
                checkpoint = checkpoint.max(entry.valid_from.0);
                checksum ^= entry.checksum_substitute;
                count += 1;
            }
        }
        match name {
            "files" => Ok(ChecksumValue {
                checksum,
                checkpoint,
            }),
            "entry-count" => Ok(ChecksumValue {
                checksum: count,
                checkpoint,
            }),
            other => Err(PepError::not_found(format!("checksum chain {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::pages::InMemoryPageStore;
    use super::*;

    fn key(name: &str) -> CellKey {
        CellKey {
            pseudonym: [1u8; 32],
            column: name.to_string(),
        }
    }

    fn content(ts: Timestamp) -> EntryContent {
        EntryContent {
            payload: PagedPayload::empty(),
            polymorphic_key: pep_crypto::PackedElGamal::from_bytes(&[0u8; 96]).unwrap(),
            blinding_timestamp: ts,
            encryption_scheme: EncryptionScheme::PayloadOnly,
            original_payload_entry_timestamp: ts,
            metadata: ExtraMetadata::new(),
        }
    }

    #[test]
    fn later_entry_becomes_current() {
        let mut store = CellStore::new(Box::new(InMemoryPageStore::new()));
        let t1 = store.next_valid_from(Timestamp(100));
        store.append(key("Age"), t1, Some(content(t1))).unwrap();
        let t2 = store.next_valid_from(Timestamp(200));
        store.append(key("Age"), t2, Some(content(t2))).unwrap();

        let current = store.current_entry_at(&key("Age"), Timestamp(1_000)).unwrap();
        assert_eq!(current.valid_from, t2);
        // Point-in-time lookup sees the older entry.
        let old = store.current_entry_at(&key("Age"), Timestamp(150)).unwrap();
        assert_eq!(old.valid_from, t1);
        assert_eq!(store.history(&key("Age")).len(), 2);
    }

    #[test]
    fn tombstone_hides_the_cell() {
        let mut store = CellStore::new(Box::new(InMemoryPageStore::new()));
        let t1 = store.next_valid_from(Timestamp(100));
        store.append(key("Age"), t1, Some(content(t1))).unwrap();
        let t2 = store.next_valid_from(Timestamp(200));
        store.append(key("Age"), t2, None).unwrap();

        assert!(store.current_entry_at(&key("Age"), Timestamp(1_000)).is_none());
        // History keeps both.
        assert_eq!(store.history(&key("Age")).len(), 2);
        assert!(store.history(&key("Age"))[1].is_tombstone());
    }

    #[test]
    fn valid_from_is_monotonic() {
        let mut store = CellStore::new(Box::new(InMemoryPageStore::new()));
        let a = store.next_valid_from(Timestamp(100));
        let b = store.next_valid_from(Timestamp(100));
        let c = store.next_valid_from(Timestamp(50));
        assert!(a < b && b < c);
    }

    #[test]
    fn checksum_chains_cover_settled_state() {
        let mut store = CellStore::new(Box::new(InMemoryPageStore::new()));
        let t1 = store.next_valid_from(Timestamp(100));
        store.append(key("Age"), t1, Some(content(t1))).unwrap();
        let files = store
            .compute_checksum_chain("files", Some(u64::MAX))
            .unwrap();
        assert_ne!(files.checksum, 0);
        let count = store
            .compute_checksum_chain("entry-count", Some(u64::MAX))
            .unwrap();
        assert_eq!(count.checksum, 1);
        // A horizon before the entry excludes it.
        let early = store.compute_checksum_chain("files", Some(50)).unwrap();
        assert_eq!(early.checksum, 0);
    }

    #[test]
    fn history_rejects_regressing_timestamps() {
        let mut store = CellStore::new(Box::new(InMemoryPageStore::new()));
        store
            .append(key("Age"), Timestamp(100), Some(content(Timestamp(100))))
            .unwrap();
        assert!(store
            .append(key("Age"), Timestamp(100), None)
            .is_err());
    }
}
