//! # PEP Transcryptor
//!
//! The second corner of the triangle: translates polymorphic pseudonyms
//! into party-specific ciphertexts under committed key material, co-signs
//! tickets after validating them against its own request log, and keeps
//! the tamper-evident transcription log with its checksum chains.
//!
//! ## Crate Structure
//!
//! - `storage` - request/issue log, set and chain interning, migrations
//! - `service` - translation, ticket logging and rekey handlers

#![warn(clippy::all)]

pub mod service;
pub mod storage;

// Re-export key types for convenience
pub use service::{Transcryptor, MAX_ENTRY_BATCH, MAX_TICKET_CLOCK_SKEW_MS};
pub use storage::{TranscryptorStorage, TARGET_SCHEMA_VERSION};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
