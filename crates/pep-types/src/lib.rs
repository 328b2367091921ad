//! # PEP Types - Shared Platform Types
//!
//! The vocabulary shared by the Access Manager, the Transcryptor and the
//! Storage Facility.
//!
//! ## Components
//!
//! | Module | Contents |
//! |--------|----------|
//! | `error` | Portable error taxonomy |
//! | `modes` | Access modes and their implication rules |
//! | `identity` | Certificate chains, signed envelopes |
//! | `ticket` | `Ticket2`, `SignedTicket2`, `IndexedTicket2` |
//! | `checksum` | Checksum-chain accumulator and capability trait |
//! | `store` | Append-only record tables over a key-value port |
//! | `metadata` | Encryption schemes and typed cell metadata |
//! | `messages` | RPC request/response payloads |
//! | `api` | Outbound client-stub traits |
//! | `worker` | Batched CPU offload |
//! | `timestamp` | Millisecond timestamps and time sources |

#![warn(clippy::all)]

pub mod api;
pub mod checksum;
pub mod error;
pub mod identity;
pub mod messages;
pub mod metadata;
pub mod modes;
pub mod store;
pub mod ticket;
pub mod timestamp;
pub mod worker;

// Re-exports
pub use api::TranscryptorClient;
pub use checksum::{ChainAccumulator, ChecksumValue, HasChecksumChains};
pub use error::{ErrorKind, PepError};
pub use identity::{
    Certificate, CertificateBody, CertificateChain, Identity, IdentityAuthority, RootCas, Signed,
};
pub use metadata::{EncryptionScheme, ExtraMetadata, MetadataEntry};
pub use modes::{parties, user_groups, AccessMode, ParticipantAccessMode};
pub use store::{
    BatchOperation, FileBackedKvStore, InMemoryKvStore, KeyValueStore, RecordTable, StoreTxn,
    StoredRecord,
};
pub use ticket::{IndexedTicket2, PseudonymTriple, SignedTicket2, Ticket2};
pub use timestamp::{SystemTimeSource, TimeSource, Timestamp};
pub use worker::WorkerPool;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
