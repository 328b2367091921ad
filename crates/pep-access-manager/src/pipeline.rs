//! # Ticket Pipeline
//!
//! The sequenced stages of a ticket request: open and validate, check
//! policy, enumerate and shuffle pseudonyms, obtain certified translations
//! from the Transcryptor in batches, admit new pseudonyms, sign and have
//! the ticket co-signed.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use tracing::{debug, info};

use pep_crypto::{local_pseudonym, verify_translation, KeyDomain, PackedElGamal};
use pep_types::messages::{
    LogIssuedTicketRequest, SignedTicketRequest2, TicketRequest2, TicketResponse2,
    TranscryptorRequest, TranscryptorRequestEntries, TranscryptorRequestEntry,
};
use pep_types::{
    parties, user_groups, AccessMode, IndexedTicket2, PepError, PseudonymTriple, SignedTicket2,
    Ticket2, Timestamp,
};

use crate::service::AccessManager;
use crate::storage::{PolicyStore, UNIVERSAL_GROUP};

/// Transcryptor request entries are sent in batches of at most this size.
pub const TS_REQUEST_BATCH_SIZE: usize = 400;

/// One pseudonym travelling through the pipeline.
struct PendingEntry {
    pseudonym: PackedElGamal,
    client_provided: bool,
    /// The requested participant groups this entry was enumerated from.
    groups: Vec<String>,
}

impl AccessManager {
    /// Handles a `SignedTicketRequest2`, returning either a plain signed
    /// ticket or an indexed one.
    pub async fn handle_ticket_request(
        &self,
        signed: SignedTicketRequest2,
    ) -> Result<TicketResponse2, PepError> {
        let request = signed.open(&self.root_cas)?;
        let user_group = signed
            .claimed_user_group()
            .ok_or_else(|| PepError::access_denied("requester has no user group"))?
            .to_string();
        let now = self.time.now();
        debug!(user_group = user_group.as_str(), "ticket request opened");

        validate_request_shape(&request)?;

        {
            let store = self.store.lock().await;
            check_existence(&store, &request, now)?;
            check_participant_group_rules(&store, &request, &user_group, now)?;
            check_column_rules(&store, &request, &user_group, now)?;
        }

        let mut entries = self.enumerate_pseudonyms(&request, now).await?;
        // Shuffle so the Transcryptor cannot correlate order across
        // repeated requests.
        entries.shuffle(&mut rand::thread_rng());

        let columns = {
            let store = self.store.lock().await;
            store.unfold_columns(&request.columns, &request.column_groups, Some(now))?
        };

        let ts_response = self
            .request_translations(&request, &signed, &entries, &user_group)
            .await?;
        if ts_response.entries.len() != entries.len() {
            return Err(PepError::transient(
                "transcryptor returned a mismatched entry count",
            ));
        }

        self.verify_translations(&ts_response.entries, &user_group, request.include_user_group_pseudonyms)
            .await?;

        let lps = self.decrypt_local_pseudonyms(&ts_response.entries).await?;
        self.admit_pseudonyms(&request, &user_group, &entries, &lps, now)
            .await?;

        let ticket = Ticket2 {
            timestamp: now,
            modes: request.modes.clone(),
            columns: columns.clone(),
            pseudonyms: ts_response.entries,
            user_group: user_group.clone(),
        };
        let mut signed_ticket = SignedTicket2::issue(&ticket, &self.identity)?;
        let log = self
            .transcryptor
            .log_issued_ticket(LogIssuedTicketRequest {
                ticket: signed_ticket.clone(),
                request_id: ts_response.id,
            })
            .await?;
        signed_ticket.attach_cosignature(log.signature, log.ts_chain);
        info!(
            user_group = user_group.as_str(),
            columns = columns.len(),
            pseudonyms = ticket.pseudonyms.len(),
            "ticket issued"
        );

        if request.request_indexed_ticket {
            let column_group_map = {
                let store = self.store.lock().await;
                build_column_group_map(&store, &request, &columns, now)?
            };
            let participant_group_map = build_participant_group_map(&request, &entries);
            Ok(TicketResponse2::Indexed(IndexedTicket2 {
                ticket: signed_ticket,
                column_group_map,
                participant_group_map,
            }))
        } else {
            Ok(TicketResponse2::Plain(signed_ticket))
        }
    }

    /// Stage 6: the pseudonym sequence, before shuffling.
    async fn enumerate_pseudonyms(
        &self,
        request: &TicketRequest2,
        now: Timestamp,
    ) -> Result<Vec<PendingEntry>, PepError> {
        if !request.polymorphic_pseudonyms.is_empty() {
            return Ok(request
                .polymorphic_pseudonyms
                .iter()
                .map(|pp| PendingEntry {
                    pseudonym: *pp,
                    client_provided: true,
                    groups: Vec::new(),
                })
                .collect());
        }

        // Lock order: store before cache, everywhere.
        let store = self.store.lock().await;
        let cache = self.pp_cache.lock().await;
        // Pseudonym bytes to (entry, groups) accumulator; a participant in
        // several requested groups appears once.
        let mut by_pp: HashMap<[u8; 96], Vec<String>> = HashMap::new();
        let mut order: Vec<[u8; 96]> = Vec::new();
        for group in &request.participant_groups {
            if group == UNIVERSAL_GROUP {
                for pp in cache.values() {
                    by_pp
                        .entry(*pp)
                        .or_insert_with(|| {
                            order.push(*pp);
                            Vec::new()
                        })
                        .push(group.clone());
                }
            } else {
                for lp in store.participants_in_group(group, Some(now))? {
                    let lp: [u8; 32] = lp
                        .try_into()
                        .map_err(|_| PepError::fatal("unpacked membership record"))?;
                    if let Some(pp) = cache.get(&lp) {
                        by_pp
                            .entry(*pp)
                            .or_insert_with(|| {
                                order.push(*pp);
                                Vec::new()
                            })
                            .push(group.clone());
                    }
                }
            }
        }
        order
            .into_iter()
            .map(|pp_bytes| {
                let groups = by_pp.remove(&pp_bytes).unwrap_or_default();
                Ok(PendingEntry {
                    pseudonym: PackedElGamal::from_bytes(&pp_bytes)?,
                    client_provided: false,
                    groups,
                })
            })
            .collect()
    }

    /// Stages 7 and 8: rerandomize stored pseudonyms and batch them to the
    /// Transcryptor.
    async fn request_translations(
        &self,
        request: &TicketRequest2,
        signed: &SignedTicketRequest2,
        entries: &[PendingEntry],
        user_group: &str,
    ) -> Result<pep_types::messages::TranscryptorResponse, PepError> {
        let mut ts_entries = Vec::with_capacity(entries.len());
        {
            let mut rng = rand::thread_rng();
            for entry in entries {
                // Client-supplied pseudonyms are fresh already; stored ones
                // are rerandomized so repeated requests are unlinkable.
                let pseudonym = if entry.client_provided {
                    entry.pseudonym
                } else {
                    entry.pseudonym.unpack()?.rerandomize(&mut rng).pack()
                };
                ts_entries.push(TranscryptorRequestEntry { pseudonym });
            }
        }

        let batches: Vec<TranscryptorRequestEntries> = ts_entries
            .chunks(TS_REQUEST_BATCH_SIZE)
            .map(|chunk| TranscryptorRequestEntries {
                entries: chunk.to_vec(),
            })
            .collect();
        debug!(
            entries = ts_entries.len(),
            batches = batches.len(),
            "sending transcryptor request"
        );
        self.transcryptor
            .translate(
                TranscryptorRequest {
                    user_group: user_group.to_string(),
                    modes: request.modes.clone(),
                    include_user_group: request.include_user_group_pseudonyms,
                    requester_chain: signed.certificate_chain.clone(),
                },
                batches,
            )
            .await
    }

    /// Verifies the Transcryptor's certified translations against its
    /// published verifiers.
    async fn verify_translations(
        &self,
        triples: &[PseudonymTriple],
        user_group: &str,
        include_user: bool,
    ) -> Result<(), PepError> {
        let mut recipients = vec![
            parties::ACCESS_MANAGER.to_string(),
            parties::STORAGE_FACILITY.to_string(),
            parties::TRANSCRYPTOR.to_string(),
        ];
        if include_user {
            recipients.push(user_group.to_string());
        }
        let mut verifier_list = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            verifier_list.push(
                self.transcryptor
                    .translation_verifiers(KeyDomain::Pseudonym, recipient.clone())
                    .await?,
            );
        }

        let triples = triples.to_vec();
        self.worker
            .batched_try_map(triples, move |triple| {
                let input = triple.polymorphic.unpack()?;
                let mut outputs = vec![
                    triple.access_manager,
                    triple.storage_facility,
                    triple.transcryptor,
                ];
                if let Some(user) = triple.user {
                    outputs.push(user);
                }
                if outputs.len() != triple.proofs.len() || outputs.len() > verifier_list.len() {
                    return Err(PepError::access_denied(
                        "translation proof count mismatch",
                    ));
                }
                for ((output, proof), verifiers) in outputs
                    .iter()
                    .zip(triple.proofs.iter())
                    .zip(verifier_list.iter())
                {
                    verify_translation(&input, &output.unpack()?, proof, verifiers)?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Stage 9a: decrypt the AM-side local pseudonym of every entry on the
    /// worker pool.
    pub(crate) async fn decrypt_local_pseudonyms(
        &self,
        triples: &[PseudonymTriple],
    ) -> Result<Vec<[u8; 32]>, PepError> {
        let secret = self.pseudonym_secret;
        let ciphertexts: Vec<PackedElGamal> = triples.iter().map(|t| t.access_manager).collect();
        self.worker
            .batched_try_map(ciphertexts, move |packed| {
                Ok(local_pseudonym(&packed.unpack()?, &secret))
            })
            .await
    }

    /// Stages 9b and 9c: participant access for client-provided
    /// pseudonyms, and select-star admission on write tickets.
    async fn admit_pseudonyms(
        &self,
        request: &TicketRequest2,
        user_group: &str,
        entries: &[PendingEntry],
        lps: &[[u8; 32]],
        now: Timestamp,
    ) -> Result<(), PepError> {
        let mut store = self.store.lock().await;
        let mut cache = self.pp_cache.lock().await;
        let may_write = request.modes.contains(&AccessMode::Write);
        if user_group == user_groups::DATA_ADMIN {
            info!("Data Administrator bypasses participant access checks");
        }
        for (entry, lp) in entries.iter().zip(lps.iter()) {
            if user_group != user_groups::DATA_ADMIN {
                store.assert_participant_access(lp, user_group, Some(now))?;
            }
            if !entry.client_provided {
                continue;
            }
            if !cache.contains_key(lp) && may_write {
                let pp_bytes = entry.pseudonym.to_bytes();
                if store.store_select_star_pseudonym(lp, &pp_bytes)? {
                    debug!("admitted new polymorphic pseudonym into select-star");
                    cache.insert(*lp, pp_bytes);
                }
            }
        }
        Ok(())
    }
}

fn validate_request_shape(request: &TicketRequest2) -> Result<(), PepError> {
    if request.modes.is_empty() {
        return Err(PepError::invalid("no access modes requested"));
    }
    if !request.participant_groups.is_empty() && !request.polymorphic_pseudonyms.is_empty() {
        return Err(PepError::invalid(
            "a request names either participant groups or explicit pseudonyms, not both",
        ));
    }
    let mut seen = HashSet::new();
    for pp in &request.polymorphic_pseudonyms {
        if !seen.insert(pp.to_bytes()) {
            return Err(PepError::invalid("duplicate polymorphic pseudonyms"));
        }
    }
    if request.columns.is_empty() && request.column_groups.is_empty() {
        return Err(PepError::invalid("no columns requested"));
    }
    Ok(())
}

fn check_existence(
    store: &PolicyStore,
    request: &TicketRequest2,
    now: Timestamp,
) -> Result<(), PepError> {
    for column in &request.columns {
        if !store.has_column(column, Some(now))? {
            return Err(PepError::not_found(format!("column {column:?}")));
        }
    }
    for group in &request.column_groups {
        if !store.has_column_group(group, Some(now))? {
            return Err(PepError::not_found(format!("column group {group:?}")));
        }
    }
    for group in &request.participant_groups {
        if !store.has_participant_group(group, Some(now))? {
            return Err(PepError::not_found(format!("participant group {group:?}")));
        }
    }
    Ok(())
}

fn check_participant_group_rules(
    store: &PolicyStore,
    request: &TicketRequest2,
    user_group: &str,
    now: Timestamp,
) -> Result<(), PepError> {
    if user_group == user_groups::DATA_ADMIN {
        if !request.participant_groups.is_empty() {
            info!("Data Administrator bypasses participant-group access rules");
        }
        return Ok(());
    }
    for group in &request.participant_groups {
        for mode in pep_types::ParticipantAccessMode::ALL {
            if !store.has_participant_group_access(group, user_group, mode, Some(now))? {
                return Err(PepError::access_denied(format!(
                    "user group {user_group:?} lacks {mode} on participant group {group:?}"
                )));
            }
        }
    }
    Ok(())
}

fn check_column_rules(
    store: &PolicyStore,
    request: &TicketRequest2,
    user_group: &str,
    now: Timestamp,
) -> Result<(), PepError> {
    for mode in &request.modes {
        for group in &request.column_groups {
            if !store.has_column_group_access(group, user_group, *mode, Some(now))? {
                return Err(PepError::access_denied(format!(
                    "user group {user_group:?} lacks {mode} on column group {group:?}"
                )));
            }
        }
        for column in &request.columns {
            let groups = store.groups_containing_column(column, Some(now))?;
            let mut granted = false;
            for group in &groups {
                if store.has_column_group_access(group, user_group, *mode, Some(now))? {
                    granted = true;
                    break;
                }
            }
            if !granted {
                return Err(PepError::access_denied(format!(
                    "user group {user_group:?} lacks {mode} on column {column:?}"
                )));
            }
        }
    }
    Ok(())
}

fn build_column_group_map(
    store: &PolicyStore,
    request: &TicketRequest2,
    columns: &[String],
    now: Timestamp,
) -> Result<HashMap<String, Vec<usize>>, PepError> {
    let mut map = HashMap::new();
    for group in &request.column_groups {
        let members: HashSet<String> = store
            .columns_in_group(group, Some(now))?
            .into_iter()
            .collect();
        let indices: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| members.contains(*c))
            .map(|(i, _)| i)
            .collect();
        map.insert(group.clone(), indices);
    }
    Ok(map)
}

fn build_participant_group_map(
    request: &TicketRequest2,
    entries: &[PendingEntry],
) -> HashMap<String, Vec<usize>> {
    let mut map = HashMap::new();
    for group in &request.participant_groups {
        let indices: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.groups.iter().any(|g| g == group))
            .map(|(i, _)| i)
            .collect();
        map.insert(group.clone(), indices);
    }
    map
}
