//! # RPC Message Types
//!
//! The request/response surface of the three servers, named after the
//! operations of the protocol. Transport framing is a collaborator concern;
//! these types only fix the payload shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use pep_crypto::{PackedElGamal, TranslationVerifiers};

use crate::identity::{CertificateChain, Signed};
use crate::metadata::{EncryptionScheme, ExtraMetadata};
use crate::modes::{AccessMode, ParticipantAccessMode};
use crate::ticket::{PseudonymTriple, SignedTicket2};
use crate::timestamp::Timestamp;

// =============================================================================
// GLOBAL CONFIGURATION
// =============================================================================

/// Request for the platform-wide configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfigurationRequest {}

/// The configuration blob served by the Access Manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfigurationResponse {
    pub config: serde_json::Value,
}

// =============================================================================
// ACCESS MANAGER: tickets and keys
// =============================================================================

/// A request for a ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketRequest2 {
    pub columns: Vec<String>,
    pub column_groups: Vec<String>,
    pub participant_groups: Vec<String>,
    pub polymorphic_pseudonyms: Vec<PackedElGamal>,
    pub modes: Vec<AccessMode>,
    /// Return an `IndexedTicket2` with group-to-index maps.
    pub request_indexed_ticket: bool,
    /// Also translate every pseudonym toward the requesting user group.
    pub include_user_group_pseudonyms: bool,
}

/// The signed form of a ticket request.
pub type SignedTicketRequest2 = Signed<TicketRequest2>;

/// Either response shape of the ticket pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TicketResponse2 {
    Plain(SignedTicket2),
    Indexed(crate::ticket::IndexedTicket2),
}

/// The two rekey directions of the polymorphic-encryption trick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRequestDirection {
    /// Take a generic polymorphic data key to a per-cell blinded key
    /// (writing).
    Blind,
    /// Reverse the blinding and translate to the requester (reading).
    Unblind,
}

/// One key to rekey under the authority of a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyEntry {
    pub direction: KeyRequestDirection,
    pub polymorphic_key: PackedElGamal,
    pub column: String,
    /// Index into the ticket's pseudonym array.
    pub pseudonym_index: usize,
    pub blinding_timestamp: Timestamp,
}

/// Request to blind or unblind data keys; justified by the ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyRequest {
    pub ticket: SignedTicket2,
    pub entries: Vec<EncryptionKeyEntry>,
}

pub type SignedEncryptionKeyRequest = Signed<EncryptionKeyRequest>;

/// Per-entry rekeyed data keys, in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionKeyResponse {
    pub keys: Vec<PackedElGamal>,
}

/// Request for the caller's key component and translation verifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyComponentRequest {}

pub type SignedKeyComponentRequest = Signed<KeyComponentRequest>;

/// A party's pseudonym key component with the proofs' verifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyComponentResponse {
    /// Packed key-component point for the requesting party.
    pub component: [u8; 32],
    pub verifiers: TranslationVerifiers,
}

// =============================================================================
// ACCESS MANAGER: policy administration
// =============================================================================

/// A single policy mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AmaMutation {
    CreateColumn { name: String },
    RemoveColumn { name: String },
    CreateColumnGroup { name: String },
    RemoveColumnGroup { name: String, force: bool },
    AddColumnToGroup { column: String, group: String },
    RemoveColumnFromGroup { column: String, group: String },
    CreateParticipantGroup { name: String },
    RemoveParticipantGroup { name: String, force: bool },
    AddParticipantToGroup { group: String, local_pseudonym: [u8; 32] },
    RemoveParticipantFromGroup { group: String, local_pseudonym: [u8; 32] },
    CreateColumnGroupAccessRule {
        column_group: String,
        user_group: String,
        mode: AccessMode,
    },
    RemoveColumnGroupAccessRule {
        column_group: String,
        user_group: String,
        mode: AccessMode,
    },
    CreateParticipantGroupAccessRule {
        participant_group: String,
        user_group: String,
        mode: ParticipantAccessMode,
    },
    RemoveParticipantGroupAccessRule {
        participant_group: String,
        user_group: String,
        mode: ParticipantAccessMode,
    },
}

/// A batch of policy mutations, applied in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmaMutationRequest {
    pub mutations: Vec<AmaMutation>,
}

pub type SignedAmaMutationRequest = Signed<AmaMutationRequest>;

/// Point-in-time policy query with optional name filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmaQuery {
    pub at: Option<Timestamp>,
    pub column_filter: Option<String>,
    pub column_group_filter: Option<String>,
    pub participant_group_filter: Option<String>,
    pub user_group_filter: Option<String>,
}

pub type SignedAmaQuery = Signed<AmaQuery>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmaQrColumn {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmaQrColumnGroup {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmaQrColumnGroupAccessRule {
    pub column_group: String,
    pub user_group: String,
    pub mode: AccessMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmaQrParticipantGroup {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmaQrParticipantGroupAccessRule {
    pub participant_group: String,
    pub user_group: String,
    pub mode: ParticipantAccessMode,
}

/// One chunk of a policy query answer; large answers are split and flagged
/// with `has_more`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmaQueryResponse {
    pub columns: Vec<AmaQrColumn>,
    pub column_groups: Vec<AmaQrColumnGroup>,
    pub column_group_access_rules: Vec<AmaQrColumnGroupAccessRule>,
    pub participant_groups: Vec<AmaQrParticipantGroup>,
    pub participant_group_access_rules: Vec<AmaQrParticipantGroupAccessRule>,
    pub has_more: bool,
}

/// The column access of a user group, unfolded per mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnAccessResponse {
    /// Mode to accessible column groups.
    pub column_groups: BTreeMap<AccessMode, Vec<String>>,
    /// Mode to accessible columns (groups unfolded).
    pub columns: BTreeMap<AccessMode, Vec<String>>,
}

/// The participant-group access of a user group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantGroupAccessResponse {
    pub participant_groups: BTreeMap<ParticipantAccessMode, Vec<String>>,
}

/// A bijective column rename used by data pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnNameMapping {
    pub original: String,
    pub mapped: String,
}

/// CRUD on column-name mappings; only Data-Admin may write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnNameMappingRequest {
    Create(ColumnNameMapping),
    Read { original: String },
    ReadAll,
    Update(ColumnNameMapping),
    Delete { original: String },
}

pub type SignedColumnNameMappingRequest = Signed<ColumnNameMappingRequest>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnNameMappingResponse {
    pub mappings: Vec<ColumnNameMapping>,
}

/// One entry of the structure-metadata stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureMetadataEntry {
    pub subject: String,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureMetadataRequest {
    pub subject_filter: Option<String>,
}

// =============================================================================
// TRANSCRYPTOR
// =============================================================================

/// Head of a translation request; entries follow in tail batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscryptorRequest {
    pub user_group: String,
    pub modes: Vec<AccessMode>,
    /// Also produce translations toward the user group itself.
    pub include_user_group: bool,
    /// Chain of the identity that signed the originating ticket request.
    pub requester_chain: CertificateChain,
}

/// One tail batch of translation entries (at most 400 per batch).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscryptorRequestEntries {
    pub entries: Vec<TranscryptorRequestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscryptorRequestEntry {
    pub pseudonym: PackedElGamal,
}

/// Translation results, in request order, plus the log row id used to
/// match the later `LogIssuedTicketRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscryptorResponse {
    pub id: u64,
    pub entries: Vec<PseudonymTriple>,
}

/// Request for the Transcryptor co-signature on an issued ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogIssuedTicketRequest {
    /// AM-signed ticket, co-signature still empty.
    pub ticket: SignedTicket2,
    /// The id returned by the matching `TranscryptorResponse`.
    pub request_id: u64,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogIssuedTicketResponse {
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: [u8; 64],
    pub ts_chain: CertificateChain,
}

/// Data-key translation toward a recipient (the unblind path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyRequest {
    pub recipient: String,
    pub keys: Vec<PackedElGamal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RekeyResponse {
    pub keys: Vec<PackedElGamal>,
}

// =============================================================================
// STORAGE FACILITY
// =============================================================================

/// Enumeration / metadata read under ticket authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReadRequest2 {
    pub ticket: SignedTicket2,
    /// Restrict to these ticket columns; empty means all.
    pub columns: Vec<String>,
}

/// One enumerated cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataEnumerationEntry2 {
    /// Opaque encrypted id, only decryptable inside the SF.
    pub id: Vec<u8>,
    pub column_index: usize,
    pub pseudonym_index: usize,
    /// Rerandomized polymorphic key of the cell.
    pub polymorphic_key: PackedElGamal,
    /// Needed to request the matching unblind.
    pub blinding_timestamp: Timestamp,
    pub encryption_scheme: EncryptionScheme,
    pub file_size: u64,
    pub metadata: ExtraMetadata,
}

/// One chunk (at most 2500 entries) of an enumeration answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataEnumerationResponse2 {
    pub entries: Vec<DataEnumerationEntry2>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReadRequest2 {
    pub ticket: SignedTicket2,
    pub ids: Vec<Vec<u8>>,
}

/// One streamed payload page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayloadPage {
    /// Index into the read request's id list.
    pub id_index: usize,
    pub page_number: u64,
    pub data: Vec<u8>,
}

/// Head of one entry in a store request; its pages arrive on the tail
/// stream tagged with `entry_index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreEntry2 {
    pub pseudonym_index: usize,
    pub column: String,
    pub polymorphic_key: PackedElGamal,
    pub encryption_scheme: EncryptionScheme,
    pub blinding_timestamp: Timestamp,
    pub metadata: ExtraMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreRequest2 {
    pub ticket: SignedTicket2,
    pub entries: Vec<DataStoreEntry2>,
}

/// One page of the store tail stream; pages of an entry must arrive in
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStorePage {
    pub entry_index: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreResponse2 {
    /// Opaque ids of the stored entries, in request order.
    pub ids: Vec<Vec<u8>>,
    /// Transport checksum: xxhash64 over the per-page hashes.
    pub hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdateEntry2 {
    pub id: Vec<u8>,
    pub polymorphic_key: PackedElGamal,
    pub encryption_scheme: EncryptionScheme,
    pub blinding_timestamp: Timestamp,
    pub metadata: ExtraMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdateRequest2 {
    pub ticket: SignedTicket2,
    pub updates: Vec<MetadataUpdateEntry2>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataUpdateResponse2 {
    pub ids: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDeleteEntry2 {
    pub pseudonym_index: usize,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDeleteRequest2 {
    pub ticket: SignedTicket2,
    pub entries: Vec<DataDeleteEntry2>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDeleteResponse2 {
    pub timestamp: Timestamp,
    /// Indices of the request entries that existed and were tombstoned.
    pub affected_indices: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHistoryRequest2 {
    pub ticket: SignedTicket2,
    /// Restrict to these ticket columns; empty means all.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataHistoryEntry2 {
    pub pseudonym_index: usize,
    pub column_index: usize,
    pub timestamp: Timestamp,
    /// Empty for tombstones.
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataHistoryResponse2 {
    pub entries: Vec<DataHistoryEntry2>,
}

// =============================================================================
// AUDIT
// =============================================================================

/// Query for the names of a server's checksum chains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksumChainNamesRequest {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChecksumChainNamesResponse {
    pub names: Vec<String>,
}

/// Computes one checksum chain up to an optional checkpoint ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeChecksumChainRequest {
    pub name: String,
    pub max_checkpoint: Option<u64>,
}
