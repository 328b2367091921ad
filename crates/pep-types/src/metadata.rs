//! # Cell Metadata
//!
//! The encryption-scheme marker and the typed extra-metadata entries
//! attached to a stored cell. Unknown keys are preserved verbatim but can
//! never change the semantics of recognized ones.

use serde::{Deserialize, Serialize};

/// How a cell's payload (and possibly its metadata) is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionScheme {
    /// Payload pages are AEAD-encrypted; metadata travels beside them and
    /// may be replaced without touching the payload.
    PayloadOnly,
    /// Metadata is bound into the payload AEAD; a standalone metadata
    /// update would break authentication and is refused.
    MetadataInAead,
}

impl EncryptionScheme {
    /// Whether a metadata-only update is permitted under this scheme.
    pub fn allows_standalone_metadata_update(self) -> bool {
        matches!(self, EncryptionScheme::PayloadOnly)
    }
}

/// One extra-metadata entry. Recognized keys get typed variants; anything
/// else is carried as an opaque pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataEntry {
    /// `x-file-extension`: the original file extension, dot included.
    FileExtension(String),
    /// `x-content-type`: a MIME type hint.
    ContentType(String),
    /// Any unrecognized key.
    Unknown { key: String, value: Vec<u8> },
}

impl MetadataEntry {
    pub const FILE_EXTENSION_KEY: &'static str = "x-file-extension";
    pub const CONTENT_TYPE_KEY: &'static str = "x-content-type";

    pub fn key(&self) -> &str {
        match self {
            MetadataEntry::FileExtension(_) => Self::FILE_EXTENSION_KEY,
            MetadataEntry::ContentType(_) => Self::CONTENT_TYPE_KEY,
            MetadataEntry::Unknown { key, .. } => key,
        }
    }

    /// Classifies a raw key/value pair into a typed entry.
    pub fn from_pair(key: &str, value: Vec<u8>) -> MetadataEntry {
        match key {
            Self::FILE_EXTENSION_KEY => {
                MetadataEntry::FileExtension(String::from_utf8_lossy(&value).into_owned())
            }
            Self::CONTENT_TYPE_KEY => {
                MetadataEntry::ContentType(String::from_utf8_lossy(&value).into_owned())
            }
            _ => MetadataEntry::Unknown {
                key: key.to_string(),
                value,
            },
        }
    }
}

/// The extra-metadata map of a cell; keys are unique.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtraMetadata(Vec<MetadataEntry>);

impl ExtraMetadata {
    pub fn new() -> ExtraMetadata {
        ExtraMetadata::default()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataEntry> {
        self.0.iter().find(|e| e.key() == key)
    }

    /// Inserts or replaces the entry with the same key.
    pub fn set(&mut self, entry: MetadataEntry) {
        if let Some(existing) = self.0.iter_mut().find(|e| e.key() == entry.key()) {
            *existing = entry;
        } else {
            self.0.push(entry);
        }
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_gates_metadata_updates() {
        assert!(EncryptionScheme::PayloadOnly.allows_standalone_metadata_update());
        assert!(!EncryptionScheme::MetadataInAead.allows_standalone_metadata_update());
    }

    #[test]
    fn recognized_keys_get_typed() {
        let e = MetadataEntry::from_pair("x-file-extension", b".json".to_vec());
        assert_eq!(e, MetadataEntry::FileExtension(".json".to_string()));
        let u = MetadataEntry::from_pair("x-custom", vec![1, 2]);
        assert_eq!(u.key(), "x-custom");
    }

    #[test]
    fn set_replaces_by_key() {
        let mut m = ExtraMetadata::new();
        m.set(MetadataEntry::FileExtension(".csv".into()));
        m.set(MetadataEntry::FileExtension(".json".into()));
        assert_eq!(m.len(), 1);
        assert_eq!(
            m.get("x-file-extension"),
            Some(&MetadataEntry::FileExtension(".json".into()))
        );
    }
}
