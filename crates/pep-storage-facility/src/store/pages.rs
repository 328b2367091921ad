//! # Page Store
//!
//! Payload bytes live in a content-addressed page store; an entry's
//! payload is a list of page references plus the total size, cheap to
//! share between an entry and its metadata-only successors. The transport
//! checksum over a store request is xxhash64 run over the per-page
//! xxhash64 values.

use std::collections::HashMap;
use std::hash::Hasher;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use twox_hash::XxHash64;

use pep_types::PepError;

/// Content address of one page.
pub type PageRef = [u8; 32];

/// xxhash64 of a page's bytes.
pub fn page_hash(data: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(data);
    h.finish()
}

/// Running xxhash64 over a sequence of page hashes; an opaque transport
/// checksum, not a cryptographic commitment.
#[derive(Debug)]
pub struct RunningPageHash(XxHash64);

impl Default for RunningPageHash {
    fn default() -> Self {
        RunningPageHash(XxHash64::with_seed(0))
    }
}

impl RunningPageHash {
    pub fn new() -> RunningPageHash {
        RunningPageHash::default()
    }

    pub fn update(&mut self, page: &[u8]) {
        self.0.write(&page_hash(page).to_be_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0.finish()
    }
}

/// An entry's payload: page references shared by reference count between
/// an entry and metadata-only successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedPayload {
    pub pages: Vec<PageRef>,
    pub size: u64,
}

impl PagedPayload {
    pub fn empty() -> Arc<PagedPayload> {
        Arc::new(PagedPayload {
            pages: Vec::new(),
            size: 0,
        })
    }
}

/// Abstract page persistence.
pub trait PageStore: Send + Sync {
    /// Stores a page and returns its content address.
    fn put(&mut self, data: &[u8]) -> Result<PageRef, PepError>;

    fn get(&self, page: &PageRef) -> Result<Vec<u8>, PepError>;

    /// Number of pages held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn content_address(data: &[u8]) -> PageRef {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// In-memory page store for tests and ephemeral instances.
#[derive(Default)]
pub struct InMemoryPageStore {
    pages: HashMap<PageRef, Vec<u8>>,
}

impl InMemoryPageStore {
    pub fn new() -> InMemoryPageStore {
        InMemoryPageStore::default()
    }
}

impl PageStore for InMemoryPageStore {
    fn put(&mut self, data: &[u8]) -> Result<PageRef, PepError> {
        let address = content_address(data);
        self.pages.entry(address).or_insert_with(|| data.to_vec());
        Ok(address)
    }

    fn get(&self, page: &PageRef) -> Result<Vec<u8>, PepError> {
        self.pages
            .get(page)
            .cloned()
            .ok_or_else(|| PepError::not_found("page"))
    }

    fn len(&self) -> usize {
        self.pages.len()
    }
}

/// Filesystem page store: one file per page under the root path, named by
/// the hex content address.
pub struct FilePageStore {
    root: PathBuf,
    count: usize,
}

impl FilePageStore {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<FilePageStore, PepError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| PepError::transient(format!("create page root: {e}")))?;
        let count = std::fs::read_dir(&root)
            .map_err(|e| PepError::transient(format!("read page root: {e}")))?
            .count();
        Ok(FilePageStore { root, count })
    }

    fn path_for(&self, page: &PageRef) -> PathBuf {
        self.root.join(hex::encode(page))
    }
}

impl PageStore for FilePageStore {
    fn put(&mut self, data: &[u8]) -> Result<PageRef, PepError> {
        let address = content_address(data);
        let path = self.path_for(&address);
        if !path.exists() {
            std::fs::write(&path, data)
                .map_err(|e| PepError::transient(format!("write page: {e}")))?;
            self.count += 1;
        }
        Ok(address)
    }

    fn get(&self, page: &PageRef) -> Result<Vec<u8>, PepError> {
        std::fs::read(self.path_for(page)).map_err(|_| PepError::not_found("page"))
    }

    fn len(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_deduplicated() {
        let mut store = InMemoryPageStore::new();
        let a = store.put(b"same bytes").unwrap();
        let b = store.put(b"same bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap(), b"same bytes");
    }

    #[test]
    fn running_hash_depends_on_order() {
        let mut a = RunningPageHash::new();
        a.update(b"one");
        a.update(b"two");
        let mut b = RunningPageHash::new();
        b.update(b"two");
        b.update(b"one");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn page_hash_is_stable() {
        assert_eq!(page_hash(b"x"), page_hash(b"x"));
        assert_ne!(page_hash(b"x"), page_hash(b"y"));
    }
}
