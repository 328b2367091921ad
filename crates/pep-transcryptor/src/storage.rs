//! # Transcryptor Storage
//!
//! The append-only log of translation requests and issued tickets, with
//! deduplicated ("interned") mode, column and pseudonym sets, interned
//! certificate chains, a migration ledger and checksum chains over every
//! table.
//!
//! The v1 schema embedded each request's certificate chain in the request
//! row; `migrate_from_v1_to_v2` moves chains into the interned table and
//! writes a per-row checksum correction so the `ticket-request` chain is
//! bit-identical before and after.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use pep_types::checksum::{record_contribution, ChainAccumulator, ChecksumValue};
use pep_types::{
    AccessMode, Certificate, CertificateChain, HasChecksumChains, KeyValueStore, PepError,
    RecordTable, StoreTxn, StoredRecord, TimeSource, Timestamp,
};

/// The schema version this code requires.
pub const TARGET_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u32,
}

/// One logged translation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRequestRecord {
    /// SHA-256 over the packed pseudonyms of the request, in order.
    pub pseudonym_hash: [u8; 32],
    pub user_group: String,
    pub mode_set_id: u64,
    pub pseudonym_set_id: u64,
    /// Interned certificate chain (leaf row), v2 form.
    pub certificate_chain_id: Option<u64>,
    /// Embedded serialized chain, v1 form; cleared by the migration.
    pub legacy_certificate_chain: Option<Vec<Vec<u8>>>,
    /// XOR correction keeping the `ticket-request` chain stable across the
    /// v1-to-v2 migration.
    pub checksum_correction: Option<u64>,
}

/// The issue record matched to a logged request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketIssueRecord {
    pub request_seqno: u64,
    pub column_set_id: u64,
    pub timestamp: Timestamp,
}

/// An interned set: the content-addressed key of its sorted members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRecord {
    pub key: String,
}

/// One member of an interned set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMemberRecord {
    pub set_seqno: u64,
    pub member: Vec<u8>,
}

/// One link of an interned certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateChainRecord {
    /// The issuer-side row, absent for the root.
    pub parent: Option<u64>,
    /// Serialized certificate.
    pub leaf: Vec<u8>,
    /// `sha256(leaf) || parent.fingerprint`.
    pub fingerprint: Vec<u8>,
}

fn t_migrations() -> RecordTable {
    RecordTable::new("Migrations")
}
fn t_ticket_requests() -> RecordTable {
    RecordTable::new("TicketRequests")
}
fn t_ticket_issues() -> RecordTable {
    RecordTable::new("TicketIssues")
}
fn t_mode_sets() -> RecordTable {
    RecordTable::new("ModeSets")
}
fn t_mode_set_members() -> RecordTable {
    RecordTable::new("ModeSetModes")
}
fn t_column_sets() -> RecordTable {
    RecordTable::new("ColumnSets")
}
fn t_column_set_members() -> RecordTable {
    RecordTable::new("ColumnSetColumns")
}
fn t_pseudonym_sets() -> RecordTable {
    RecordTable::new("PseudonymSets")
}
fn t_pseudonym_set_members() -> RecordTable {
    RecordTable::new("PseudonymSetPseudonyms")
}
fn t_certificate_chains() -> RecordTable {
    RecordTable::new("CertificateChains")
}

/// Content-addressed key of a member set: truncated hex SHA-256 over the
/// sorted, length-prefixed members.
pub fn set_key(members: &[Vec<u8>]) -> String {
    let mut sorted = members.to_vec();
    sorted.sort();
    let mut h = Sha256::new();
    for member in &sorted {
        h.update((member.len() as u64).to_be_bytes());
        h.update(member);
    }
    hex::encode(&h.finalize()[..16])
}

/// SHA-256 over packed pseudonyms, in order.
pub fn pseudonym_hash(pseudonyms: &[Vec<u8>]) -> [u8; 32] {
    let mut h = Sha256::new();
    for p in pseudonyms {
        h.update(p);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&h.finalize());
    out
}

/// The Transcryptor's persistent state.
pub struct TranscryptorStorage {
    kv: Box<dyn KeyValueStore>,
    time: Arc<dyn TimeSource>,
}

impl TranscryptorStorage {
    /// Opens the storage, settling the migration ledger (fresh databases
    /// are stamped at the target version; v1 databases are migrated).
    pub fn open(
        kv: Box<dyn KeyValueStore>,
        time: Arc<dyn TimeSource>,
    ) -> Result<TranscryptorStorage, PepError> {
        let mut storage = TranscryptorStorage { kv, time };
        storage.settle_migrations()?;
        Ok(storage)
    }

    fn now(&self) -> Timestamp {
        self.time.now()
    }

    fn scan<P: DeserializeOwned>(
        &self,
        table: &RecordTable,
    ) -> Result<Vec<StoredRecord<P>>, PepError> {
        table.scan::<P>(self.kv.as_ref())
    }

    // =========================================================================
    // MIGRATION LEDGER
    // =========================================================================

    fn recorded_versions(&self) -> Result<Vec<u32>, PepError> {
        Ok(self
            .scan::<MigrationRecord>(&t_migrations())?
            .into_iter()
            .map(|r| r.payload.version)
            .collect())
    }

    fn settle_migrations(&mut self) -> Result<(), PepError> {
        let versions = self.recorded_versions()?;
        let requests = self.scan::<TicketRequestRecord>(&t_ticket_requests())?;
        let any_legacy = requests
            .iter()
            .any(|r| r.payload.legacy_certificate_chain.is_some());

        if versions.contains(&TARGET_SCHEMA_VERSION) && !any_legacy {
            return Ok(());
        }
        if versions.is_empty() && requests.is_empty() {
            // Fresh database: stamp the target version.
            info!(version = TARGET_SCHEMA_VERSION, "initializing migration ledger");
            let now = self.now();
            let mut txn = StoreTxn::new(self.kv.as_mut());
            txn.append(
                &t_migrations(),
                now,
                false,
                &MigrationRecord {
                    version: TARGET_SCHEMA_VERSION,
                },
            )?;
            return txn.commit();
        }
        self.migrate_from_v1_to_v2(requests)
    }

    /// Moves embedded certificate chains into the interned table and
    /// corrects the `ticket-request` checksum per row.
    fn migrate_from_v1_to_v2(
        &mut self,
        requests: Vec<StoredRecord<TicketRequestRecord>>,
    ) -> Result<(), PepError> {
        info!("migrating ticket-request certificate chains to interned form");
        let now = self.now();
        for record in requests {
            let Some(legacy) = record.payload.legacy_certificate_chain.clone() else {
                continue;
            };
            let old_contribution = ticket_request_contribution(&record)?;

            let chain = decode_chain(&legacy)?;
            let chain_id = self.intern_certificate_chain(&chain)?;

            let mut migrated = record.clone();
            migrated.payload.legacy_certificate_chain = None;
            migrated.payload.certificate_chain_id = Some(chain_id);
            migrated.payload.checksum_correction = None;
            let new_contribution = ticket_request_contribution(&migrated)?;
            migrated.payload.checksum_correction = Some(old_contribution ^ new_contribution);

            let mut txn = StoreTxn::new(self.kv.as_mut());
            txn.overwrite(&t_ticket_requests(), &migrated)?;
            txn.commit()?;
        }
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_migrations(),
            now,
            false,
            &MigrationRecord {
                version: TARGET_SCHEMA_VERSION,
            },
        )?;
        txn.commit()?;
        // The record store reclaims space lazily; nothing to vacuum here
        // beyond logging parity with the embedded-database deployments.
        info!("migration finished");
        Ok(())
    }

    // =========================================================================
    // SET AND CHAIN INTERNING
    // =========================================================================

    fn intern_set(
        &mut self,
        set_table: &RecordTable,
        member_table: &RecordTable,
        members: &[Vec<u8>],
    ) -> Result<u64, PepError> {
        let key = set_key(members);
        for record in self.scan::<SetRecord>(set_table)? {
            if record.payload.key == key {
                return Ok(record.seqno);
            }
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        let set_seqno = txn.append(set_table, now, false, &SetRecord { key })?;
        for member in members {
            txn.append(
                member_table,
                now,
                false,
                &SetMemberRecord {
                    set_seqno,
                    member: member.clone(),
                },
            )?;
        }
        txn.commit()?;
        Ok(set_seqno)
    }

    pub fn intern_mode_set(&mut self, modes: &[AccessMode]) -> Result<u64, PepError> {
        let members: Vec<Vec<u8>> = modes.iter().map(|m| m.as_str().as_bytes().to_vec()).collect();
        self.intern_set(&t_mode_sets(), &t_mode_set_members(), &members)
    }

    pub fn intern_column_set(&mut self, columns: &[String]) -> Result<u64, PepError> {
        let members: Vec<Vec<u8>> = columns.iter().map(|c| c.as_bytes().to_vec()).collect();
        self.intern_set(&t_column_sets(), &t_column_set_members(), &members)
    }

    pub fn intern_pseudonym_set(&mut self, pseudonyms: &[Vec<u8>]) -> Result<u64, PepError> {
        self.intern_set(&t_pseudonym_sets(), &t_pseudonym_set_members(), pseudonyms)
    }

    /// Interns a certificate chain, reusing the deepest suffix already
    /// present, and returns the leaf row's seqno.
    pub fn intern_certificate_chain(&mut self, chain: &CertificateChain) -> Result<u64, PepError> {
        if chain.0.is_empty() {
            return Err(PepError::invalid("cannot intern an empty chain"));
        }
        let mut by_fingerprint: HashMap<Vec<u8>, u64> = HashMap::new();
        for record in self.scan::<CertificateChainRecord>(&t_certificate_chains())? {
            by_fingerprint.insert(record.payload.fingerprint.clone(), record.seqno);
        }

        let now = self.now();
        let mut parent: Option<u64> = None;
        let mut fingerprint: Vec<u8> = Vec::new();
        let mut leaf_seqno = 0u64;
        // Root first: fingerprint accumulates sha256(leaf) || parent chain.
        for certificate in chain.0.iter().rev() {
            let leaf = bincode::serialize(certificate)?;
            let mut link_fp: Vec<u8> = Sha256::digest(&leaf).to_vec();
            link_fp.extend_from_slice(&fingerprint);
            if let Some(&existing) = by_fingerprint.get(&link_fp) {
                parent = Some(existing);
                leaf_seqno = existing;
            } else {
                let mut txn = StoreTxn::new(self.kv.as_mut());
                let seqno = txn.append(
                    &t_certificate_chains(),
                    now,
                    false,
                    &CertificateChainRecord {
                        parent,
                        leaf,
                        fingerprint: link_fp.clone(),
                    },
                )?;
                txn.commit()?;
                by_fingerprint.insert(link_fp.clone(), seqno);
                parent = Some(seqno);
                leaf_seqno = seqno;
            }
            fingerprint = link_fp;
        }
        Ok(leaf_seqno)
    }

    // =========================================================================
    // REQUEST AND ISSUE LOG
    // =========================================================================

    /// Logs a translation request and returns its id.
    pub fn log_ticket_request(
        &mut self,
        pseudonym_hash: [u8; 32],
        user_group: &str,
        modes: &[AccessMode],
        pseudonyms: &[Vec<u8>],
        chain: &CertificateChain,
    ) -> Result<u64, PepError> {
        let mode_set_id = self.intern_mode_set(modes)?;
        let pseudonym_set_id = self.intern_pseudonym_set(pseudonyms)?;
        let certificate_chain_id = Some(self.intern_certificate_chain(chain)?);
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        let seqno = txn.append(
            &t_ticket_requests(),
            now,
            false,
            &TicketRequestRecord {
                pseudonym_hash,
                user_group: user_group.to_string(),
                mode_set_id,
                pseudonym_set_id,
                certificate_chain_id,
                legacy_certificate_chain: None,
                checksum_correction: None,
            },
        )?;
        txn.commit()?;
        Ok(seqno)
    }

    pub fn get_ticket_request(
        &self,
        seqno: u64,
    ) -> Result<Option<TicketRequestRecord>, PepError> {
        Ok(self
            .scan::<TicketRequestRecord>(&t_ticket_requests())?
            .into_iter()
            .find(|r| r.seqno == seqno)
            .map(|r| r.payload))
    }

    /// Records the issuance matched to a logged request.
    pub fn log_ticket_issue(
        &mut self,
        request_seqno: u64,
        columns: &[String],
        timestamp: Timestamp,
    ) -> Result<(), PepError> {
        let column_set_id = self.intern_column_set(columns)?;
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_ticket_issues(),
            now,
            false,
            &TicketIssueRecord {
                request_seqno,
                column_set_id,
                timestamp,
            },
        )?;
        txn.commit()
    }

    // =========================================================================
    // CHECKSUM CHAINS
    // =========================================================================

    fn compute_simple_chain<P: DeserializeOwned + Serialize>(
        &self,
        table: &RecordTable,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        let mut acc = ChainAccumulator::new();
        for record in self.scan::<P>(table)? {
            acc.absorb(record.seqno, record.contribution()?, max_checkpoint);
        }
        Ok(acc.value())
    }

    fn compute_ticket_request_chain(
        &self,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        let mut acc = ChainAccumulator::new();
        for record in self.scan::<TicketRequestRecord>(&t_ticket_requests())? {
            acc.absorb(
                record.seqno,
                ticket_request_contribution(&record)?,
                max_checkpoint,
            );
        }
        Ok(acc.value())
    }
}

/// The contribution of a ticket-request record: the plain record
/// contribution xored with the stored migration correction, so migrated
/// rows keep their pre-migration fingerprint.
fn ticket_request_contribution(
    record: &StoredRecord<TicketRequestRecord>,
) -> Result<u64, PepError> {
    let mut stripped = record.payload.clone();
    let correction = stripped.checksum_correction.take().unwrap_or(0);
    let mut bytes = bincode::serialize(&stripped)?;
    bytes.push(record.tombstone as u8);
    Ok(record_contribution(&bytes, record.checksum_nonce) ^ correction)
}

fn decode_chain(legacy: &[Vec<u8>]) -> Result<CertificateChain, PepError> {
    let mut certificates: Vec<Certificate> = Vec::with_capacity(legacy.len());
    for bytes in legacy {
        certificates.push(bincode::deserialize(bytes)?);
    }
    Ok(CertificateChain(certificates))
}

impl HasChecksumChains for TranscryptorStorage {
    fn checksum_chain_names(&self) -> Vec<String> {
        [
            "migration",
            "ticket-request",
            "ticket-issue",
            "pseudonym-set",
            "pseudonym-set-pseudonym",
            "column-set",
            "column-set-column",
            "mode-set",
            "mode-set-mode",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn compute_checksum_chain(
        &self,
        name: &str,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        match name {
            "migration" => {
                self.compute_simple_chain::<MigrationRecord>(&t_migrations(), max_checkpoint)
            }
            "ticket-request" => self.compute_ticket_request_chain(max_checkpoint),
            "ticket-issue" => {
                self.compute_simple_chain::<TicketIssueRecord>(&t_ticket_issues(), max_checkpoint)
            }
            "pseudonym-set" => {
                self.compute_simple_chain::<SetRecord>(&t_pseudonym_sets(), max_checkpoint)
            }
            "pseudonym-set-pseudonym" => self
                .compute_simple_chain::<SetMemberRecord>(&t_pseudonym_set_members(), max_checkpoint),
            "column-set" => {
                self.compute_simple_chain::<SetRecord>(&t_column_sets(), max_checkpoint)
            }
            "column-set-column" => {
                self.compute_simple_chain::<SetMemberRecord>(&t_column_set_members(), max_checkpoint)
            }
            "mode-set" => self.compute_simple_chain::<SetRecord>(&t_mode_sets(), max_checkpoint),
            "mode-set-mode" => {
                self.compute_simple_chain::<SetMemberRecord>(&t_mode_set_members(), max_checkpoint)
            }
            other => Err(PepError::not_found(format!("checksum chain {other:?}"))),
        }
    }
}
