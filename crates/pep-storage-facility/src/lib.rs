//! # PEP Storage Facility
//!
//! The custodial corner of the triangle: an append-only, content-addressed
//! store of encrypted cells keyed by `(LP_SF, column)`, with per-cell
//! history, opaque encrypted ids, streamed pages and checksum chains. The
//! facility verifies ticket authority for every operation but can neither
//! decrypt payloads nor link cells to participants on its own.
//!
//! ## Crate Structure
//!
//! - `store/` - cell map, page store, checksum chains
//! - `ids` - authenticated encryption of externally visible ids
//! - `service` - the request handlers

#![warn(clippy::all)]

pub mod ids;
pub mod service;
pub mod store;

// Re-export key types for convenience
pub use ids::IdKey;
pub use service::{StorageFacility, ENUMERATION_RESPONSE_MAX_ENTRIES, MAX_PAGES_IN_FLIGHT};
pub use store::pages::{FilePageStore, InMemoryPageStore, PageStore, PagedPayload};
pub use store::{CellKey, CellStore, Entry, EntryContent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
