//! # Transcryptor Service
//!
//! Performs the certified translation step under its own key material,
//! logs every translation request, validates and co-signs issued tickets,
//! and answers data-key rekey requests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pep_crypto::{KeyDomain, TranslationVerifiers, Translator};
use pep_types::messages::{
    LogIssuedTicketRequest, LogIssuedTicketResponse, RekeyRequest, RekeyResponse,
    TranscryptorRequest, TranscryptorRequestEntries, TranscryptorResponse,
};
use pep_types::{
    parties, ChecksumValue, HasChecksumChains, Identity, PepError, PseudonymTriple, RootCas,
    TimeSource, TranscryptorClient,
};

use crate::storage::{pseudonym_hash, TranscryptorStorage};

/// Largest accepted translation batch.
pub const MAX_ENTRY_BATCH: usize = 400;

/// Tickets may be logged at most this far from the Transcryptor's clock.
pub const MAX_TICKET_CLOCK_SKEW_MS: u64 = 5 * 60 * 1000;

/// The Transcryptor server.
pub struct Transcryptor {
    storage: Mutex<TranscryptorStorage>,
    identity: Identity,
    root_cas: RootCas,
    translator: Translator,
    time: Arc<dyn TimeSource>,
}

impl Transcryptor {
    pub fn new(
        storage: TranscryptorStorage,
        identity: Identity,
        root_cas: RootCas,
        translator: Translator,
        time: Arc<dyn TimeSource>,
    ) -> Arc<Transcryptor> {
        Arc::new(Transcryptor {
            storage: Mutex::new(storage),
            identity,
            root_cas,
            translator,
            time,
        })
    }

    /// The translator's public commitments; also reachable through the
    /// client stub.
    pub fn verifiers(&self, domain: KeyDomain, recipient: &str) -> TranslationVerifiers {
        self.translator.verifiers(domain, recipient)
    }

    pub async fn checksum_chain_names(&self) -> Vec<String> {
        self.storage.lock().await.checksum_chain_names()
    }

    pub async fn compute_checksum_chain(
        &self,
        name: &str,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        self.storage
            .lock()
            .await
            .compute_checksum_chain(name, max_checkpoint)
    }
}

#[async_trait]
impl TranscryptorClient for Transcryptor {
    async fn translate(
        &self,
        request: TranscryptorRequest,
        batches: Vec<TranscryptorRequestEntries>,
    ) -> Result<TranscryptorResponse, PepError> {
        // The requester's identity is logged with the request; an
        // unverifiable chain is refused outright.
        request.requester_chain.verify(&self.root_cas)?;

        let mut entries = Vec::new();
        for batch in &batches {
            if batch.entries.len() > MAX_ENTRY_BATCH {
                return Err(PepError::invalid(format!(
                    "translation batch exceeds {MAX_ENTRY_BATCH} entries"
                )));
            }
            entries.extend(batch.entries.iter().cloned());
        }
        debug!(
            user_group = request.user_group.as_str(),
            entries = entries.len(),
            "translating pseudonyms"
        );

        let mut triples = Vec::with_capacity(entries.len());
        let mut packed_pseudonyms = Vec::with_capacity(entries.len());
        {
            // The rng stays confined to this block: the boxed future must
            // remain Send across the storage await below.
            let mut rng = rand::thread_rng();
            for entry in &entries {
                let input = entry.pseudonym.unpack()?;
                let mut recipients = vec![
                    parties::ACCESS_MANAGER,
                    parties::STORAGE_FACILITY,
                    parties::TRANSCRYPTOR,
                ];
                if request.include_user_group {
                    recipients.push(request.user_group.as_str());
                }
                let mut outputs = Vec::with_capacity(recipients.len());
                let mut proofs = Vec::with_capacity(recipients.len());
                for recipient in recipients {
                    let (output, proof) = self.translator.certified_translate(
                        &input,
                        KeyDomain::Pseudonym,
                        recipient,
                        &mut rng,
                    );
                    outputs.push(output.pack());
                    proofs.push(proof);
                }
                let user = if request.include_user_group {
                    outputs.pop()
                } else {
                    None
                };
                triples.push(PseudonymTriple {
                    polymorphic: entry.pseudonym,
                    access_manager: outputs[0],
                    storage_facility: outputs[1],
                    transcryptor: outputs[2],
                    user,
                    proofs,
                });
                packed_pseudonyms.push(entry.pseudonym.to_bytes().to_vec());
            }
        }

        let hash = pseudonym_hash(&packed_pseudonyms);
        let id = self.storage.lock().await.log_ticket_request(
            hash,
            &request.user_group,
            &request.modes,
            &packed_pseudonyms,
            &request.requester_chain,
        )?;
        info!(id, entries = triples.len(), "translation request logged");
        Ok(TranscryptorResponse { id, entries: triples })
    }

    async fn log_issued_ticket(
        &self,
        request: LogIssuedTicketRequest,
    ) -> Result<LogIssuedTicketResponse, PepError> {
        let ticket = request.ticket.verify_issuer(&self.root_cas)?;

        let mut storage = self.storage.lock().await;
        let logged = storage
            .get_ticket_request(request.request_id)?
            .ok_or_else(|| {
                PepError::invalid(format!("unknown translation request {}", request.request_id))
            })?;

        let packed: Vec<Vec<u8>> = ticket
            .pseudonyms
            .iter()
            .map(|t| t.polymorphic.to_bytes().to_vec())
            .collect();
        if pseudonym_hash(&packed) != logged.pseudonym_hash {
            warn!("ticket pseudonyms disagree with the logged request");
            return Err(PepError::invalid(
                "ticket pseudonyms do not match the logged request",
            ));
        }
        if ticket.user_group != logged.user_group {
            return Err(PepError::invalid(
                "ticket access group does not match the logged request",
            ));
        }
        let now = self.time.now();
        if ticket.timestamp.abs_diff(now) > MAX_TICKET_CLOCK_SKEW_MS {
            return Err(PepError::invalid("ticket timestamp is too far from now"));
        }
        let mode_set_id = storage.intern_mode_set(&ticket.modes)?;
        if mode_set_id != logged.mode_set_id {
            return Err(PepError::invalid(
                "ticket modes do not match the logged request",
            ));
        }

        storage.log_ticket_issue(request.request_id, &ticket.columns, ticket.timestamp)?;
        drop(storage);

        let signature = request.ticket.cosign(&self.identity);
        info!(request_id = request.request_id, "ticket co-signed");
        Ok(LogIssuedTicketResponse {
            signature,
            ts_chain: self.identity.chain().clone(),
        })
    }

    async fn rekey(&self, request: RekeyRequest) -> Result<RekeyResponse, PepError> {
        debug!(
            recipient = request.recipient.as_str(),
            keys = request.keys.len(),
            "rekeying data keys"
        );
        // Data keys only move between key domains; a reshuffle would
        // change the key itself.
        let (rekey_factor, _) = self
            .translator
            .factors(KeyDomain::DataKey, &request.recipient);
        let mut keys = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            keys.push(key.unpack()?.rekey(&rekey_factor).pack());
        }
        Ok(RekeyResponse { keys })
    }

    async fn translation_verifiers(
        &self,
        domain: KeyDomain,
        recipient: String,
    ) -> Result<TranslationVerifiers, PepError> {
        Ok(self.translator.verifiers(domain, &recipient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pep_crypto::{ElGamal, KeyPair};
    use pep_curve::GroupElement;
    use pep_types::messages::TranscryptorRequestEntry;
    use pep_types::{
        AccessMode, IdentityAuthority, InMemoryKvStore, SignedTicket2, SystemTimeSource, Ticket2,
        Timestamp,
    };
    use rand::thread_rng;

    struct Harness {
        transcryptor: Arc<Transcryptor>,
        authority: IdentityAuthority,
        am_identity: Identity,
        requester: Identity,
        master: KeyPair,
    }

    fn harness() -> Harness {
        let authority = IdentityAuthority::new("PEP-CA").unwrap();
        let ts_identity = authority.issue(parties::TRANSCRYPTOR, None).unwrap();
        let am_identity = authority.issue(parties::ACCESS_MANAGER, None).unwrap();
        let requester = authority.issue("alice", Some("Researcher")).unwrap();
        let storage = TranscryptorStorage::open(
            Box::new(InMemoryKvStore::new()),
            Arc::new(SystemTimeSource),
        )
        .unwrap();
        let transcryptor = Transcryptor::new(
            storage,
            ts_identity,
            authority.root_cas(),
            Translator::generate(&mut thread_rng()),
            Arc::new(SystemTimeSource),
        );
        Harness {
            transcryptor,
            authority,
            am_identity,
            requester,
            master: KeyPair::generate(&mut thread_rng()),
        }
    }

    fn request(h: &Harness, n: usize) -> (TranscryptorRequest, Vec<TranscryptorRequestEntries>) {
        let mut rng = thread_rng();
        let entries: Vec<TranscryptorRequestEntry> = (0..n)
            .map(|i| {
                let identity =
                    GroupElement::hash_from_string(format!("participant-{i}").as_bytes());
                TranscryptorRequestEntry {
                    pseudonym: ElGamal::encrypt(h.master.public(), &identity, &mut rng).pack(),
                }
            })
            .collect();
        (
            TranscryptorRequest {
                user_group: "Researcher".into(),
                modes: vec![AccessMode::Read],
                include_user_group: false,
                requester_chain: h.requester.chain().clone(),
            },
            vec![TranscryptorRequestEntries { entries }],
        )
    }

    fn ticket_for(h: &Harness, response: &TranscryptorResponse) -> SignedTicket2 {
        let ticket = Ticket2 {
            timestamp: Timestamp::now(),
            modes: vec![AccessMode::Read],
            columns: vec!["Age".into()],
            pseudonyms: response.entries.clone(),
            user_group: "Researcher".into(),
        };
        SignedTicket2::issue(&ticket, &h.am_identity).unwrap()
    }

    #[tokio::test]
    async fn translate_then_cosign() {
        let h = harness();
        let (head, batches) = request(&h, 3);
        let response = h.transcryptor.translate(head, batches).await.unwrap();
        assert_eq!(response.entries.len(), 3);

        let signed = ticket_for(&h, &response);
        let log = h
            .transcryptor
            .log_issued_ticket(LogIssuedTicketRequest {
                ticket: signed.clone(),
                request_id: response.id,
            })
            .await
            .unwrap();

        let mut complete = signed;
        complete.attach_cosignature(log.signature, log.ts_chain);
        assert!(complete
            .open(&h.authority.root_cas(), "Researcher", Some(AccessMode::Read))
            .is_ok());
    }

    #[tokio::test]
    async fn unknown_request_id_rejected() {
        let h = harness();
        let (head, batches) = request(&h, 1);
        let response = h.transcryptor.translate(head, batches).await.unwrap();
        let signed = ticket_for(&h, &response);
        let err = h
            .transcryptor
            .log_issued_ticket(LogIssuedTicketRequest {
                ticket: signed,
                request_id: response.id + 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, pep_types::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn mismatched_modes_rejected() {
        let h = harness();
        let (head, batches) = request(&h, 1);
        let response = h.transcryptor.translate(head, batches).await.unwrap();
        let ticket = Ticket2 {
            timestamp: Timestamp::now(),
            modes: vec![AccessMode::Write],
            columns: vec!["Age".into()],
            pseudonyms: response.entries.clone(),
            user_group: "Researcher".into(),
        };
        let signed = SignedTicket2::issue(&ticket, &h.am_identity).unwrap();
        let err = h
            .transcryptor
            .log_issued_ticket(LogIssuedTicketRequest {
                ticket: signed,
                request_id: response.id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, pep_types::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn stale_ticket_rejected() {
        let h = harness();
        let (head, batches) = request(&h, 1);
        let response = h.transcryptor.translate(head, batches).await.unwrap();
        let ticket = Ticket2 {
            timestamp: Timestamp(1_000),
            modes: vec![AccessMode::Read],
            columns: vec![],
            pseudonyms: response.entries.clone(),
            user_group: "Researcher".into(),
        };
        let signed = SignedTicket2::issue(&ticket, &h.am_identity).unwrap();
        let err = h
            .transcryptor
            .log_issued_ticket(LogIssuedTicketRequest {
                ticket: signed,
                request_id: response.id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, pep_types::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn oversized_batch_rejected() {
        let h = harness();
        let (head, mut batches) = request(&h, 1);
        let entry = batches[0].entries[0].clone();
        batches[0].entries = vec![entry; MAX_ENTRY_BATCH + 1];
        let err = h.transcryptor.translate(head, batches).await.unwrap_err();
        assert_eq!(err.kind, pep_types::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn translations_verify_against_published_verifiers() {
        let h = harness();
        let (head, batches) = request(&h, 2);
        let response = h.transcryptor.translate(head, batches).await.unwrap();
        let verifiers = h
            .transcryptor
            .verifiers(KeyDomain::Pseudonym, parties::STORAGE_FACILITY);
        for triple in &response.entries {
            let input = triple.polymorphic.unpack().unwrap();
            let output = triple.storage_facility.unpack().unwrap();
            pep_crypto::verify_translation(&input, &output, &triple.proofs[1], &verifiers)
                .unwrap();
        }
    }
}
