//! # PEP Access Manager
//!
//! Separates access decisions from data custody: the Access Manager owns
//! the policy store (columns, groups, access rules), runs the ticket
//! pipeline against the Transcryptor, and rekeys polymorphic data keys for
//! authorized requesters.
//!
//! ## Crate Structure
//!
//! - `storage/` - append-only policy tables, checksum chains, migrations
//! - `service` - the server struct and its wiring
//! - `pipeline` - the ticket-request stages
//! - `rekey` - BLIND / UNBLIND data-key handling
//! - `queries` - administration, queries and configuration handlers

#![warn(clippy::all)]

pub mod pipeline;
pub mod queries;
pub mod rekey;
pub mod service;
pub mod storage;

// Re-export key types for convenience
pub use service::{AccessManager, AccessManagerConfig};
pub use storage::{PolicyStore, MIGRATION_BACKUP_SUFFIX, UNIVERSAL_GROUP};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
