//! # Record Store
//!
//! Append-only record tables over an abstract key-value port. Every logical
//! table is a sequence of enveloped records `(seqno, checksum_nonce,
//! timestamp, tombstone, payload)`; state is reconstructed by replaying
//! records in order and applying tombstones. Nothing is ever overwritten
//! except by explicit migrations.
//!
//! Multi-table mutations are staged in a `StoreTxn` and committed with a
//! single atomic batch write.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::checksum::{derive_nonce, record_contribution};
use crate::error::PepError;
use crate::timestamp::Timestamp;

/// Batch operation for atomic writes.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Abstract key-value database port.
///
/// Adapters: `InMemoryKvStore` for tests, `FileBackedKvStore` for simple
/// durable deployments.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PepError>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), PepError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), PepError>;

    /// Either all operations are applied or none.
    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), PepError>;

    fn exists(&self, key: &[u8]) -> Result<bool, PepError>;

    /// All pairs whose key starts with `prefix`, in unspecified order.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PepError>;
}

/// In-memory store for unit tests and ephemeral instances.
#[derive(Default)]
pub struct InMemoryKvStore {
    data: HashMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryKvStore {
    pub fn new() -> InMemoryKvStore {
        InMemoryKvStore::default()
    }
}

impl KeyValueStore for InMemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PepError> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), PepError> {
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), PepError> {
        self.data.remove(key);
        Ok(())
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), PepError> {
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => {
                    self.data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool, PepError> {
        Ok(self.data.contains_key(key))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PepError> {
        Ok(self
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// File-backed store: the whole map is rewritten atomically (temp file +
/// rename) on every mutation. Suitable for modest policy databases.
pub struct FileBackedKvStore {
    data: HashMap<Vec<u8>, Vec<u8>>,
    path: std::path::PathBuf,
}

impl FileBackedKvStore {
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<FileBackedKvStore, PepError> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read(&path) {
            Ok(bytes) => Self::parse(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(PepError::transient(format!("open {}: {e}", path.display()))),
        };
        if !data.is_empty() {
            tracing::info!("loaded {} keys from {}", data.len(), path.display());
        }
        Ok(FileBackedKvStore { data, path })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    // Format: repeated [key_len:u32 LE][key][value_len:u32 LE][value].
    fn parse(bytes: &[u8]) -> Result<HashMap<Vec<u8>, Vec<u8>>, PepError> {
        let mut data = HashMap::new();
        let mut cursor = 0usize;
        let read_len = |bytes: &[u8], cursor: usize| -> Result<usize, PepError> {
            bytes
                .get(cursor..cursor + 4)
                .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]) as usize)
                .ok_or_else(|| PepError::fatal("store file truncated"))
        };
        while cursor < bytes.len() {
            let key_len = read_len(bytes, cursor)?;
            cursor += 4;
            let key = bytes
                .get(cursor..cursor + key_len)
                .ok_or_else(|| PepError::fatal("store file truncated"))?
                .to_vec();
            cursor += key_len;
            let value_len = read_len(bytes, cursor)?;
            cursor += 4;
            let value = bytes
                .get(cursor..cursor + value_len)
                .ok_or_else(|| PepError::fatal("store file truncated"))?
                .to_vec();
            cursor += value_len;
            data.insert(key, value);
        }
        Ok(data)
    }

    fn persist(&self) -> Result<(), PepError> {
        let mut bytes = Vec::new();
        for (key, value) in &self.data {
            bytes.extend_from_slice(&(key.len() as u32).to_le_bytes());
            bytes.extend_from_slice(key);
            bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
            bytes.extend_from_slice(value);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PepError::transient(format!("mkdir: {e}")))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| PepError::transient(format!("write: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| PepError::transient(format!("rename: {e}")))?;
        Ok(())
    }
}

impl KeyValueStore for FileBackedKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PepError> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), PepError> {
        self.data.insert(key.to_vec(), value.to_vec());
        self.persist()
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), PepError> {
        self.data.remove(key);
        self.persist()
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), PepError> {
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => {
                    self.data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    self.data.remove(&key);
                }
            }
        }
        self.persist()
    }

    fn exists(&self, key: &[u8]) -> Result<bool, PepError> {
        Ok(self.data.contains_key(key))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PepError> {
        Ok(self
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// A stored record with its envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord<P> {
    pub seqno: u64,
    pub checksum_nonce: u64,
    pub timestamp: Timestamp,
    pub tombstone: bool,
    pub payload: P,
}

impl<P: Serialize> StoredRecord<P> {
    /// Serialization of the logical fields only: checksum contributions
    /// must not depend on seqno or wall-clock, so that two instances
    /// holding the same logical state agree.
    fn logical_bytes(&self) -> Result<Vec<u8>, PepError> {
        let mut bytes = bincode::serialize(&self.payload)?;
        bytes.push(self.tombstone as u8);
        Ok(bytes)
    }

    /// This record's checksum-chain contribution.
    pub fn contribution(&self) -> Result<u64, PepError> {
        Ok(record_contribution(
            &self.logical_bytes()?,
            self.checksum_nonce,
        ))
    }
}

/// A named append-only table.
#[derive(Debug, Clone)]
pub struct RecordTable {
    name: String,
}

impl RecordTable {
    pub fn new(name: &str) -> RecordTable {
        RecordTable {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record_key(&self, seqno: u64) -> Vec<u8> {
        let mut key = format!("t/{}/", self.name).into_bytes();
        key.extend_from_slice(&seqno.to_be_bytes());
        key
    }

    fn counter_key(&self) -> Vec<u8> {
        format!("c/{}", self.name).into_bytes()
    }

    fn read_counter(&self, kv: &dyn KeyValueStore) -> Result<u64, PepError> {
        Ok(match kv.get(&self.counter_key())? {
            Some(bytes) if bytes.len() == 8 => {
                u64::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ])
            }
            _ => 0,
        })
    }

    /// All records in seqno order.
    pub fn scan<P: DeserializeOwned>(
        &self,
        kv: &dyn KeyValueStore,
    ) -> Result<Vec<StoredRecord<P>>, PepError> {
        let prefix = format!("t/{}/", self.name).into_bytes();
        let mut pairs = kv.prefix_scan(&prefix)?;
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(PepError::from))
            .collect()
    }

    pub fn count(&self, kv: &dyn KeyValueStore) -> Result<usize, PepError> {
        let prefix = format!("t/{}/", self.name).into_bytes();
        Ok(kv.prefix_scan(&prefix)?.len())
    }
}

/// A staged multi-table mutation, committed as one atomic batch.
pub struct StoreTxn<'a> {
    kv: &'a mut dyn KeyValueStore,
    ops: Vec<BatchOperation>,
    counters: HashMap<Vec<u8>, u64>,
}

impl<'a> StoreTxn<'a> {
    pub fn new(kv: &'a mut dyn KeyValueStore) -> StoreTxn<'a> {
        StoreTxn {
            kv,
            ops: Vec::new(),
            counters: HashMap::new(),
        }
    }

    /// Appends a record, allocating the next seqno; returns the seqno.
    pub fn append<P: Serialize>(
        &mut self,
        table: &RecordTable,
        timestamp: Timestamp,
        tombstone: bool,
        payload: &P,
    ) -> Result<u64, PepError> {
        let counter_key = table.counter_key();
        let next = match self.counters.get(&counter_key) {
            Some(&n) => n,
            None => table.read_counter(self.kv)?,
        };

        let mut logical = bincode::serialize(payload)?;
        logical.push(tombstone as u8);
        let record = StoredRecord {
            seqno: next,
            checksum_nonce: derive_nonce(&logical),
            timestamp,
            tombstone,
            payload,
        };
        self.ops.push(BatchOperation::Put {
            key: table.record_key(next),
            value: bincode::serialize(&record)?,
        });
        self.counters.insert(counter_key, next + 1);
        Ok(next)
    }

    /// Rewrites an existing record in place; migrations only.
    pub fn overwrite<P: Serialize>(
        &mut self,
        table: &RecordTable,
        record: &StoredRecord<P>,
    ) -> Result<(), PepError> {
        self.ops.push(BatchOperation::Put {
            key: table.record_key(record.seqno),
            value: bincode::serialize(record)?,
        });
        Ok(())
    }

    /// Stages a raw put outside any record table.
    pub fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOperation::Put { key, value });
    }

    pub fn commit(mut self) -> Result<(), PepError> {
        for (key, value) in std::mem::take(&mut self.counters) {
            self.ops.push(BatchOperation::Put {
                key,
                value: value.to_be_bytes().to_vec(),
            });
        }
        self.kv.atomic_batch_write(std::mem::take(&mut self.ops))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NameRecord {
        name: String,
    }

    #[test]
    fn append_and_scan_in_order() {
        let mut kv = InMemoryKvStore::new();
        let table = RecordTable::new("names");
        let mut txn = StoreTxn::new(&mut kv);
        for name in ["a", "b", "c"] {
            txn.append(
                &table,
                Timestamp(1),
                false,
                &NameRecord { name: name.into() },
            )
            .unwrap();
        }
        txn.commit().unwrap();

        let records: Vec<StoredRecord<NameRecord>> = table.scan(&kv).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].seqno, 0);
        assert_eq!(records[2].payload.name, "c");
    }

    #[test]
    fn seqnos_continue_across_transactions() {
        let mut kv = InMemoryKvStore::new();
        let table = RecordTable::new("names");
        let mut txn = StoreTxn::new(&mut kv);
        txn.append(&table, Timestamp(1), false, &NameRecord { name: "a".into() })
            .unwrap();
        txn.commit().unwrap();

        let mut txn = StoreTxn::new(&mut kv);
        let seqno = txn
            .append(&table, Timestamp(2), false, &NameRecord { name: "b".into() })
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(seqno, 1);
    }

    #[test]
    fn contribution_ignores_time_and_seqno() {
        let mut kv1 = InMemoryKvStore::new();
        let mut kv2 = InMemoryKvStore::new();
        let table = RecordTable::new("names");

        let mut txn = StoreTxn::new(&mut kv1);
        txn.append(&table, Timestamp(10), false, &NameRecord { name: "x".into() })
            .unwrap();
        txn.commit().unwrap();

        let mut txn = StoreTxn::new(&mut kv2);
        txn.append(
            &table,
            Timestamp(999),
            false,
            &NameRecord { name: "filler".into() },
        )
        .unwrap();
        txn.append(&table, Timestamp(999), false, &NameRecord { name: "x".into() })
            .unwrap();
        txn.commit().unwrap();

        let r1: Vec<StoredRecord<NameRecord>> = table.scan(&kv1).unwrap();
        let r2: Vec<StoredRecord<NameRecord>> = table.scan(&kv2).unwrap();
        assert_eq!(
            r1[0].contribution().unwrap(),
            r2[1].contribution().unwrap()
        );
    }

    #[test]
    fn file_backed_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("pep-store-test-{}", std::process::id()));
        let path = dir.join("db.bin");
        let _ = std::fs::remove_file(&path);
        {
            let mut store = FileBackedKvStore::open(&path).unwrap();
            store.put(b"k1", b"v1").unwrap();
            store.put(b"k2", b"v2").unwrap();
        }
        let store = FileBackedKvStore::open(&path).unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.get(b"k2").unwrap(), Some(b"v2".to_vec()));
        let _ = std::fs::remove_file(&path);
    }
}
