//! # Access Modes
//!
//! Column access modes and participant-group access modes, with the
//! implication rules of the policy model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PepError;

/// Access mode on columns / column groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    Read,
    Write,
    ReadMeta,
    WriteMeta,
}

impl AccessMode {
    pub const ALL: [AccessMode; 4] = [
        AccessMode::Read,
        AccessMode::Write,
        AccessMode::ReadMeta,
        AccessMode::WriteMeta,
    ];

    /// Mode implication: `read` carries `read-meta`, `write-meta` carries
    /// `write`; every mode carries itself.
    pub fn implies(self, other: AccessMode) -> bool {
        self == other
            || matches!(
                (self, other),
                (AccessMode::Read, AccessMode::ReadMeta)
                    | (AccessMode::WriteMeta, AccessMode::Write)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::ReadMeta => "read-meta",
            AccessMode::WriteMeta => "write-meta",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = PepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            "read-meta" => Ok(AccessMode::ReadMeta),
            "write-meta" => Ok(AccessMode::WriteMeta),
            other => Err(PepError::invalid(format!("unknown access mode {other:?}"))),
        }
    }
}

/// Access mode on participant groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParticipantAccessMode {
    Access,
    Enumerate,
}

impl ParticipantAccessMode {
    pub const ALL: [ParticipantAccessMode; 2] =
        [ParticipantAccessMode::Access, ParticipantAccessMode::Enumerate];

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipantAccessMode::Access => "access",
            ParticipantAccessMode::Enumerate => "enumerate",
        }
    }
}

impl fmt::Display for ParticipantAccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParticipantAccessMode {
    type Err = PepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(ParticipantAccessMode::Access),
            "enumerate" => Ok(ParticipantAccessMode::Enumerate),
            other => Err(PepError::invalid(format!(
                "unknown participant access mode {other:?}"
            ))),
        }
    }
}

/// Well-known user groups with implicit powers.
pub mod user_groups {
    /// May manage columns, groups and memberships; implicitly holds
    /// `read-meta` on every column group and unchecked participant access.
    pub const DATA_ADMIN: &str = "Data Administrator";
    /// May manage access rules.
    pub const ACCESS_ADMIN: &str = "Access Administrator";
    /// Read-only auditor; may query history and checksum chains.
    pub const WATCHDOG: &str = "Watchdog";
}

/// Well-known party names used as translation recipients.
pub mod parties {
    pub const ACCESS_MANAGER: &str = "AccessManager";
    pub const STORAGE_FACILITY: &str = "StorageFacility";
    pub const TRANSCRYPTOR: &str = "Transcryptor";
}
