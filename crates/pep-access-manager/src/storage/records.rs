//! # Policy Record Payloads
//!
//! The payload shapes of the Access Manager's append-only tables. Local
//! pseudonyms and polymorphic pseudonyms are held as byte strings because
//! two encodings coexist: the legacy length-variable hex form and the
//! current fixed-length packed form (32 bytes for a local pseudonym, 96 for
//! a polymorphic one). The one-time re-serialization migration rewrites
//! legacy records; the `-v2` checksum chains cover the packed form while
//! the unversioned chains keep covering the legacy representation.

use serde::{Deserialize, Serialize};

use pep_types::{AccessMode, ParticipantAccessMode};

pub const LOCAL_PSEUDONYM_PACKED_LEN: usize = 32;
pub const POLYMORPHIC_PSEUDONYM_PACKED_LEN: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGroupRecord {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGroupColumnRecord {
    pub column: String,
    pub column_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantGroupRecord {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantGroupParticipantRecord {
    /// Packed (32-byte) or legacy hex local pseudonym.
    pub local_pseudonym: Vec<u8>,
    pub participant_group: String,
}

impl ParticipantGroupParticipantRecord {
    pub fn is_legacy(&self) -> bool {
        self.local_pseudonym.len() != LOCAL_PSEUDONYM_PACKED_LEN
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnGroupAccessRuleRecord {
    pub column_group: String,
    pub user_group: String,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantGroupAccessRuleRecord {
    pub participant_group: String,
    pub user_group: String,
    pub mode: ParticipantAccessMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNameMappingRecord {
    pub original: String,
    pub mapped: String,
}

/// The select-star table: every polymorphic pseudonym the Access Manager
/// has ever admitted into a ticket, keyed by its own local pseudonym.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectStarPseudonymRecord {
    /// Packed (32-byte) or legacy hex local pseudonym.
    pub local_pseudonym: Vec<u8>,
    /// Packed (96-byte) or legacy hex polymorphic pseudonym.
    pub polymorphic_pseudonym: Vec<u8>,
}

impl SelectStarPseudonymRecord {
    pub fn is_legacy(&self) -> bool {
        self.local_pseudonym.len() != LOCAL_PSEUDONYM_PACKED_LEN
            || self.polymorphic_pseudonym.len() != POLYMORPHIC_PSEUDONYM_PACKED_LEN
    }
}

/// Converts a packed byte string to its legacy lowercase-hex encoding.
pub fn to_legacy_encoding(packed: &[u8]) -> Vec<u8> {
    hex::encode(packed).into_bytes()
}

/// Parses a legacy hex encoding back into packed bytes.
pub fn from_legacy_encoding(legacy: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(legacy).ok()?;
    hex::decode(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_detection() {
        let packed = SelectStarPseudonymRecord {
            local_pseudonym: vec![0; 32],
            polymorphic_pseudonym: vec![0; 96],
        };
        assert!(!packed.is_legacy());
        let legacy = SelectStarPseudonymRecord {
            local_pseudonym: to_legacy_encoding(&[0; 32]),
            polymorphic_pseudonym: to_legacy_encoding(&[0; 96]),
        };
        assert!(legacy.is_legacy());
    }

    #[test]
    fn legacy_round_trip() {
        let packed = vec![7u8; 32];
        let legacy = to_legacy_encoding(&packed);
        assert_eq!(from_legacy_encoding(&legacy), Some(packed));
    }
}
