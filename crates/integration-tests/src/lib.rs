//! # Integration Tests Crate
//!
//! Wires a complete Access Manager / Transcryptor / Storage Facility
//! triangle in-process and drives the end-to-end scenarios: registration
//! and read-back, denied writes, metadata-only updates, ticket-log replay
//! and the data-key blind/unblind round trip.
//!
//! ## Structure
//!
//! ```text
//! integration-tests/
//! └── src/
//!     ├── lib.rs    # Triangle harness and client helpers
//!     └── flows.rs  # End-to-end scenarios
//! ```

pub mod flows;

use std::sync::Arc;

use rand::thread_rng;

use pep_access_manager::{AccessManager, AccessManagerConfig, PolicyStore};
use pep_crypto::{ElGamal, KeyDomain, KeyPair, MasterSecret, PackedElGamal, Translator};
use pep_curve::{GroupElement, Scalar};
use pep_storage_facility::{CellStore, IdKey, InMemoryPageStore, StorageFacility};
use pep_transcryptor::{Transcryptor, TranscryptorStorage};
use pep_types::messages::{AmaMutation, AmaMutationRequest, TicketRequest2, TicketResponse2};
use pep_types::{
    parties, user_groups, AccessMode, Identity, IdentityAuthority, InMemoryKvStore,
    ParticipantAccessMode, PepError, Signed, SignedTicket2, SystemTimeSource,
};

/// A fully wired server triangle plus the client identities of the test
/// world.
pub struct Triangle {
    pub authority: IdentityAuthority,
    pub am: Arc<AccessManager>,
    pub ts: Arc<Transcryptor>,
    pub sf: Arc<StorageFacility>,
    /// The master pseudonym key pair polymorphic pseudonyms target.
    pub master_pseudonym: KeyPair,
    /// The master data key pair polymorphic data keys target.
    pub master_data: KeyPair,
    /// A second translator built from the same master secret, standing in
    /// for the out-of-band key ceremony that hands parties their shares.
    pub key_ceremony: Translator,

    pub researcher: Identity,
    pub data_manager: Identity,
    pub data_admin: Identity,
    pub access_admin: Identity,
}

impl Triangle {
    /// A party's (or user group's) pseudonym key share.
    pub fn pseudonym_secret(&self, recipient: &str) -> Scalar {
        let (k, _) = self.key_ceremony.factors(KeyDomain::Pseudonym, recipient);
        k.mul(self.master_pseudonym.secret())
    }

    /// A user group's data key share, for decrypting unblinded keys.
    pub fn data_secret(&self, recipient: &str) -> Scalar {
        let (k, _) = self.key_ceremony.factors(KeyDomain::DataKey, recipient);
        k.mul(self.master_data.secret())
    }

    /// Encrypts a fresh polymorphic pseudonym for a named participant.
    pub fn participant_pp(&self, name: &str) -> PackedElGamal {
        let identity = GroupElement::hash_from_string(name.as_bytes());
        ElGamal::encrypt(self.master_pseudonym.public(), &identity, &mut thread_rng()).pack()
    }

    /// Encrypts a polymorphic data key for a known plaintext point.
    pub fn polymorphic_key(&self, key_point: &GroupElement) -> PackedElGamal {
        ElGamal::encrypt(self.master_data.public(), key_point, &mut thread_rng()).pack()
    }

    /// Requests a ticket and unwraps the plain response shape.
    pub async fn plain_ticket(
        &self,
        identity: &Identity,
        request: TicketRequest2,
    ) -> Result<SignedTicket2, PepError> {
        match self
            .am
            .handle_ticket_request(Signed::new(&request, identity)?)
            .await?
        {
            TicketResponse2::Plain(ticket) => Ok(ticket),
            TicketResponse2::Indexed(indexed) => Ok(indexed.ticket),
        }
    }

    /// Applies policy mutations under the right administrator identity.
    pub async fn mutate(&self, identity: &Identity, mutations: Vec<AmaMutation>) {
        let request = AmaMutationRequest { mutations };
        self.am
            .handle_ama_mutation(Signed::new(&request, identity).unwrap())
            .await
            .unwrap();
    }
}

/// Builds a fresh triangle with in-memory storage everywhere.
pub fn build_triangle() -> Triangle {
    // Surface warnings from the servers during test runs; repeated calls
    // are fine, only the first subscriber wins.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();

    let mut rng = thread_rng();
    let authority = IdentityAuthority::new("PEP-CA").unwrap();
    let root_cas = authority.root_cas();
    let time = Arc::new(SystemTimeSource);

    let translation_master = MasterSecret::generate(&mut rng);
    let translator = Translator::new(translation_master.clone());
    let key_ceremony = Translator::new(translation_master);
    let master_pseudonym = KeyPair::generate(&mut rng);
    let master_data = KeyPair::generate(&mut rng);

    let ts_identity = authority.issue(parties::TRANSCRYPTOR, None).unwrap();
    let ts_storage =
        TranscryptorStorage::open(Box::new(InMemoryKvStore::new()), time.clone()).unwrap();
    let ts = Transcryptor::new(ts_storage, ts_identity, root_cas.clone(), translator, time.clone());

    let am_identity = authority.issue(parties::ACCESS_MANAGER, None).unwrap();
    let am_store =
        PolicyStore::open(Box::new(InMemoryKvStore::new()), None, time.clone()).unwrap();
    let (k_am, _) = key_ceremony.factors(KeyDomain::Pseudonym, parties::ACCESS_MANAGER);
    let am = AccessManager::new(
        am_store,
        am_identity,
        root_cas.clone(),
        k_am.mul(master_pseudonym.secret()),
        *master_pseudonym.public(),
        MasterSecret::generate(&mut rng),
        ts.clone(),
        AccessManagerConfig {
            global_config: serde_json::json!({ "environment": "integration-test" }),
            structure_metadata: Vec::new(),
        },
        time.clone(),
    )
    .unwrap();

    let (k_sf, _) = key_ceremony.factors(KeyDomain::Pseudonym, parties::STORAGE_FACILITY);
    let sf = StorageFacility::new(
        CellStore::new(Box::new(InMemoryPageStore::new())),
        IdKey::generate(),
        root_cas,
        k_sf.mul(master_pseudonym.secret()),
        time,
    );

    let researcher = authority.issue("alice", Some("Researcher")).unwrap();
    let data_manager = authority.issue("dm", Some("DM")).unwrap();
    let data_admin = authority
        .issue("admin", Some(user_groups::DATA_ADMIN))
        .unwrap();
    let access_admin = authority
        .issue("keeper", Some(user_groups::ACCESS_ADMIN))
        .unwrap();

    Triangle {
        authority,
        am,
        ts,
        sf,
        master_pseudonym,
        master_data,
        key_ceremony,
        researcher,
        data_manager,
        data_admin,
        access_admin,
    }
}

/// Seeds the canonical test policy: column `Age` in group `Clin`,
/// read for researchers, read/write for data managers, universal
/// participant access for both.
pub async fn seed_policy(triangle: &Triangle) {
    triangle
        .mutate(
            &triangle.data_admin,
            vec![
                AmaMutation::CreateColumn { name: "Age".into() },
                AmaMutation::CreateColumnGroup { name: "Clin".into() },
                AmaMutation::AddColumnToGroup {
                    column: "Age".into(),
                    group: "Clin".into(),
                },
            ],
        )
        .await;
    triangle
        .mutate(
            &triangle.access_admin,
            vec![
                AmaMutation::CreateColumnGroupAccessRule {
                    column_group: "Clin".into(),
                    user_group: "Researcher".into(),
                    mode: AccessMode::Read,
                },
                AmaMutation::CreateColumnGroupAccessRule {
                    column_group: "Clin".into(),
                    user_group: "DM".into(),
                    mode: AccessMode::Read,
                },
                AmaMutation::CreateColumnGroupAccessRule {
                    column_group: "Clin".into(),
                    user_group: "DM".into(),
                    mode: AccessMode::Write,
                },
                AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group: "*".into(),
                    user_group: "Researcher".into(),
                    mode: ParticipantAccessMode::Access,
                },
                AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group: "*".into(),
                    user_group: "Researcher".into(),
                    mode: ParticipantAccessMode::Enumerate,
                },
                AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group: "*".into(),
                    user_group: "DM".into(),
                    mode: ParticipantAccessMode::Access,
                },
                AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group: "*".into(),
                    user_group: "DM".into(),
                    mode: ParticipantAccessMode::Enumerate,
                },
            ],
        )
        .await;
}
