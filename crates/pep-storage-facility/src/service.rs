//! # Storage Facility Service
//!
//! Enumeration, streamed reads, streamed stores, metadata-only updates,
//! tombstone deletes and history listing, all under ticket authority. The
//! Storage Facility decrypts its own local pseudonyms from the ticket and
//! never learns any other party's view of a participant.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use pep_curve::Scalar;
use pep_crypto::{local_pseudonym, PackedElGamal};
use pep_types::messages::{
    DataDeleteRequest2, DataDeleteResponse2, DataEnumerationEntry2, DataEnumerationResponse2,
    DataHistoryEntry2, DataHistoryRequest2, DataHistoryResponse2, DataPayloadPage,
    DataReadRequest2, DataStorePage, DataStoreRequest2, DataStoreResponse2,
    MetadataReadRequest2, MetadataUpdateRequest2, MetadataUpdateResponse2,
};
use pep_types::{
    user_groups, AccessMode, ChecksumValue, HasChecksumChains, PepError, RootCas, SignedTicket2,
    Ticket2, TimeSource, Timestamp, WorkerPool,
};

use crate::ids::{decrypt_id, encrypt_id, IdKey};
use crate::store::pages::{PagedPayload, RunningPageHash};
use crate::store::{CellKey, CellStore, EntryContent};

/// Enumeration answers are chunked at this many entries.
pub const ENUMERATION_RESPONSE_MAX_ENTRIES: usize = 2500;

/// At most this many payload pages are in flight per read.
pub const MAX_PAGES_IN_FLIGHT: usize = 1000;

/// The Storage Facility server.
pub struct StorageFacility {
    store: Mutex<CellStore>,
    id_key: IdKey,
    root_cas: RootCas,
    /// The SF's pseudonym key share: decrypts SF-translated pseudonyms.
    pseudonym_secret: Scalar,
    worker: WorkerPool,
    time: Arc<dyn TimeSource>,
}

impl StorageFacility {
    pub fn new(
        store: CellStore,
        id_key: IdKey,
        root_cas: RootCas,
        pseudonym_secret: Scalar,
        time: Arc<dyn TimeSource>,
    ) -> Arc<StorageFacility> {
        Arc::new(StorageFacility {
            store: Mutex::new(store),
            id_key,
            root_cas,
            pseudonym_secret,
            worker: WorkerPool::new(),
            time,
        })
    }

    /// Opens a ticket against the roots, binding it to its own user group.
    fn open_ticket(
        &self,
        ticket: &SignedTicket2,
        required_mode: Option<AccessMode>,
    ) -> Result<Ticket2, PepError> {
        let user_group = ticket.peek()?.user_group;
        ticket.open(&self.root_cas, &user_group, required_mode)
    }

    /// Decrypts the SF local pseudonym of every ticket entry on the worker
    /// pool.
    async fn ticket_pseudonyms(&self, ticket: &Ticket2) -> Result<Vec<[u8; 32]>, PepError> {
        let secret = self.pseudonym_secret;
        let ciphertexts: Vec<PackedElGamal> =
            ticket.pseudonyms.iter().map(|t| t.storage_facility).collect();
        self.worker
            .batched_try_map(ciphertexts, move |packed| {
                Ok(local_pseudonym(&packed.unpack()?, &secret))
            })
            .await
    }

    /// The column scope of a request: the ticket's columns, optionally
    /// narrowed, with their ticket indices.
    fn column_scope(
        ticket: &Ticket2,
        requested: &[String],
    ) -> Result<Vec<(usize, String)>, PepError> {
        if requested.is_empty() {
            return Ok(ticket.columns.iter().cloned().enumerate().collect());
        }
        let mut scope = Vec::with_capacity(requested.len());
        for column in requested {
            let index = ticket.column_index(column).ok_or_else(|| {
                PepError::access_denied(format!("ticket does not cover column {column:?}"))
            })?;
            scope.push((index, column.clone()));
        }
        Ok(scope)
    }

    // =========================================================================
    // ENUMERATION
    // =========================================================================

    /// Lists the current entries in the ticket's scope as chunked
    /// responses.
    pub async fn enumerate(
        &self,
        request: MetadataReadRequest2,
    ) -> Result<Vec<DataEnumerationResponse2>, PepError> {
        let ticket = self.open_ticket(&request.ticket, Some(AccessMode::ReadMeta))?;
        let pseudonyms = self.ticket_pseudonyms(&ticket).await?;
        let scope = Self::column_scope(&ticket, &request.columns)?;
        let store = self.store.lock().await;
        let mut rng = rand::thread_rng();

        let mut entries = Vec::new();
        for (pseudonym_index, lp) in pseudonyms.iter().enumerate() {
            for (column_index, column) in &scope {
                let key = CellKey {
                    pseudonym: *lp,
                    column: column.clone(),
                };
                let Some(entry) = store.current_entry_at(&key, ticket.timestamp) else {
                    continue;
                };
                let Some(content) = &entry.content else {
                    continue;
                };
                entries.push(DataEnumerationEntry2 {
                    id: encrypt_id(&self.id_key, &key, entry.valid_from)?,
                    column_index: *column_index,
                    pseudonym_index,
                    polymorphic_key: content
                        .polymorphic_key
                        .unpack()?
                        .rerandomize(&mut rng)
                        .pack(),
                    blinding_timestamp: content.blinding_timestamp,
                    encryption_scheme: content.encryption_scheme,
                    file_size: content.payload.size,
                    metadata: content.metadata.clone(),
                });
            }
        }
        debug!(entries = entries.len(), "enumeration complete");

        let mut responses: Vec<DataEnumerationResponse2> = Vec::new();
        let mut iter = entries.into_iter().peekable();
        loop {
            let mut chunk = Vec::new();
            while chunk.len() < ENUMERATION_RESPONSE_MAX_ENTRIES {
                match iter.next() {
                    Some(entry) => chunk.push(entry),
                    None => break,
                }
            }
            let has_more = iter.peek().is_some();
            responses.push(DataEnumerationResponse2 {
                entries: chunk,
                has_more,
            });
            if !has_more {
                break;
            }
        }
        Ok(responses)
    }

    // =========================================================================
    // READ
    // =========================================================================

    /// Streams the payload pages of the requested ids. Validation happens
    /// up front; pages flow through a channel bounded at
    /// `MAX_PAGES_IN_FLIGHT`.
    pub async fn read(
        &self,
        request: DataReadRequest2,
    ) -> Result<mpsc::Receiver<Result<DataPayloadPage, PepError>>, PepError> {
        let ticket = self.open_ticket(&request.ticket, Some(AccessMode::Read))?;
        let pseudonyms: HashSet<[u8; 32]> =
            self.ticket_pseudonyms(&ticket).await?.into_iter().collect();

        let store = self.store.lock().await;
        let mut pages: Vec<DataPayloadPage> = Vec::new();
        for (id_index, id) in request.ids.iter().enumerate() {
            let (key, valid_from) = decrypt_id(&self.id_key, id)?;
            if ticket.column_index(&key.column).is_none() {
                return Err(PepError::access_denied(format!(
                    "ticket does not cover column {:?}",
                    key.column
                )));
            }
            if !pseudonyms.contains(&key.pseudonym) {
                return Err(PepError::access_denied(
                    "ticket does not cover this participant",
                ));
            }
            let entry = store
                .entry_at_exactly(&key, valid_from)
                .ok_or_else(|| PepError::not_found("no entry for id"))?;
            let content = entry
                .content
                .as_ref()
                .ok_or_else(|| PepError::not_found("entry is deleted"))?;
            // A tombstoned cell is gone for readers, even through an older
            // id.
            if store.current_entry_at(&key, Timestamp(u64::MAX)).is_none() {
                return Err(PepError::not_found("cell is deleted"));
            }
            for (page_number, page_ref) in content.payload.pages.iter().enumerate() {
                pages.push(DataPayloadPage {
                    id_index,
                    page_number: page_number as u64,
                    data: store.pages().get(page_ref)?,
                });
            }
        }
        drop(store);

        let (tx, rx) = mpsc::channel(MAX_PAGES_IN_FLIGHT);
        tokio::spawn(async move {
            for page in pages {
                if tx.send(Ok(page)).await.is_err() {
                    // Receiver dropped; the read was cancelled.
                    break;
                }
            }
        });
        Ok(rx)
    }

    // =========================================================================
    // STORE
    // =========================================================================

    /// Stores a batch of entries fed by a page stream; every entry of the
    /// request is committed under one shared `valid_from`.
    pub async fn store_data<S>(
        &self,
        request: DataStoreRequest2,
        mut pages: S,
    ) -> Result<DataStoreResponse2, PepError>
    where
        S: Stream<Item = DataStorePage> + Send + Unpin,
    {
        let ticket = self.open_ticket(&request.ticket, Some(AccessMode::Write))?;
        let lps = self.ticket_pseudonyms(&ticket).await?;

        let mut seen = HashSet::new();
        for entry in &request.entries {
            if entry.pseudonym_index >= lps.len() {
                return Err(PepError::invalid("pseudonym index out of range"));
            }
            if ticket.column_index(&entry.column).is_none() {
                return Err(PepError::access_denied(format!(
                    "ticket does not cover column {:?}",
                    entry.column
                )));
            }
            if !seen.insert((entry.pseudonym_index, entry.column.clone())) {
                return Err(PepError::invalid(
                    "duplicate (pseudonym, column) entry in store request",
                ));
            }
        }

        let mut store = self.store.lock().await;
        // Consume the page tail: pages append in arrival order per entry,
        // the running hash covers the whole request.
        let mut payloads: Vec<PagedPayload> = request
            .entries
            .iter()
            .map(|_| PagedPayload {
                pages: Vec::new(),
                size: 0,
            })
            .collect();
        let mut running = RunningPageHash::new();
        while let Some(page) = pages.next().await {
            let payload = payloads
                .get_mut(page.entry_index)
                .ok_or_else(|| PepError::invalid("page for unknown entry index"))?;
            running.update(&page.data);
            let page_ref = store.pages_mut().put(&page.data)?;
            payload.pages.push(page_ref);
            payload.size += page.data.len() as u64;
        }
        let hash = running.finish();

        let now = self.time.now();
        let valid_from = store.next_valid_from(now);
        let mut ids = Vec::with_capacity(request.entries.len());
        for (entry, payload) in request.entries.iter().zip(payloads) {
            let key = CellKey {
                pseudonym: lps[entry.pseudonym_index],
                column: entry.column.clone(),
            };
            store.append(
                key.clone(),
                valid_from,
                Some(EntryContent {
                    payload: Arc::new(payload),
                    polymorphic_key: entry.polymorphic_key,
                    blinding_timestamp: entry.blinding_timestamp,
                    encryption_scheme: entry.encryption_scheme,
                    original_payload_entry_timestamp: valid_from,
                    metadata: entry.metadata.clone(),
                }),
            )?;
            ids.push(encrypt_id(&self.id_key, &key, valid_from)?);
        }
        info!(
            entries = ids.len(),
            valid_from = valid_from.0,
            "store request committed"
        );
        Ok(DataStoreResponse2 { ids, hash })
    }

    // =========================================================================
    // METADATA UPDATE
    // =========================================================================

    /// Replaces an entry's metadata, key material and scheme without
    /// touching its payload.
    pub async fn metadata_update(
        &self,
        request: MetadataUpdateRequest2,
    ) -> Result<MetadataUpdateResponse2, PepError> {
        let ticket = self.open_ticket(&request.ticket, Some(AccessMode::WriteMeta))?;
        let pseudonyms: HashSet<[u8; 32]> =
            self.ticket_pseudonyms(&ticket).await?.into_iter().collect();

        let mut store = self.store.lock().await;
        // Validate everything before the first write.
        let mut staged = Vec::with_capacity(request.updates.len());
        for update in &request.updates {
            let (key, valid_from) = decrypt_id(&self.id_key, &update.id)?;
            if ticket.column_index(&key.column).is_none() || !pseudonyms.contains(&key.pseudonym) {
                return Err(PepError::access_denied("ticket does not cover this entry"));
            }
            let entry = store
                .entry_at_exactly(&key, valid_from)
                .ok_or_else(|| PepError::not_found("no entry for id"))?;
            let content = entry
                .content
                .as_ref()
                .ok_or_else(|| PepError::conflict("cannot update metadata of a tombstone"))?;
            if !content.encryption_scheme.allows_standalone_metadata_update()
                || !update.encryption_scheme.allows_standalone_metadata_update()
            {
                return Err(PepError::conflict(
                    "encryption scheme binds metadata to the payload",
                ));
            }
            staged.push((
                key,
                EntryContent {
                    payload: Arc::clone(&content.payload),
                    polymorphic_key: update.polymorphic_key,
                    blinding_timestamp: update.blinding_timestamp,
                    encryption_scheme: update.encryption_scheme,
                    original_payload_entry_timestamp: content.original_payload_entry_timestamp,
                    metadata: update.metadata.clone(),
                },
            ));
        }

        let now = self.time.now();
        let valid_from = store.next_valid_from(now);
        let mut ids = Vec::with_capacity(staged.len());
        for (key, content) in staged {
            store.append(key.clone(), valid_from, Some(content))?;
            ids.push(encrypt_id(&self.id_key, &key, valid_from)?);
        }
        Ok(MetadataUpdateResponse2 { ids })
    }

    // =========================================================================
    // DELETE
    // =========================================================================

    /// Tombstones the current entries of the addressed cells.
    pub async fn delete(
        &self,
        request: DataDeleteRequest2,
    ) -> Result<DataDeleteResponse2, PepError> {
        let ticket = self.open_ticket(&request.ticket, Some(AccessMode::Write))?;
        let lps = self.ticket_pseudonyms(&ticket).await?;

        let mut store = self.store.lock().await;
        let now = self.time.now();
        let valid_from = store.next_valid_from(now);
        let mut affected = Vec::new();
        for (index, entry) in request.entries.iter().enumerate() {
            if entry.pseudonym_index >= lps.len() {
                return Err(PepError::invalid("pseudonym index out of range"));
            }
            if ticket.column_index(&entry.column).is_none() {
                return Err(PepError::access_denied(format!(
                    "ticket does not cover column {:?}",
                    entry.column
                )));
            }
            let key = CellKey {
                pseudonym: lps[entry.pseudonym_index],
                column: entry.column.clone(),
            };
            if store.current_entry_at(&key, Timestamp(u64::MAX)).is_some() {
                store.append(key, valid_from, None)?;
                affected.push(index);
            }
        }
        info!(affected = affected.len(), "delete request committed");
        Ok(DataDeleteResponse2 {
            timestamp: valid_from,
            affected_indices: affected,
        })
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// The full entry history of the ticket's scope; Data-Admin and
    /// Watchdog only.
    pub async fn history(
        &self,
        request: DataHistoryRequest2,
    ) -> Result<DataHistoryResponse2, PepError> {
        let ticket = self.open_ticket(&request.ticket, None)?;
        if ticket.user_group != user_groups::DATA_ADMIN
            && ticket.user_group != user_groups::WATCHDOG
        {
            return Err(PepError::access_denied(
                "history is restricted to Data Administrator and Watchdog",
            ));
        }
        let pseudonyms = self.ticket_pseudonyms(&ticket).await?;
        let scope = Self::column_scope(&ticket, &request.columns)?;

        let store = self.store.lock().await;
        let mut entries = Vec::new();
        for (pseudonym_index, lp) in pseudonyms.iter().enumerate() {
            for (column_index, column) in &scope {
                let key = CellKey {
                    pseudonym: *lp,
                    column: column.clone(),
                };
                for entry in store.history(&key) {
                    let id = if entry.is_tombstone() {
                        Vec::new()
                    } else {
                        encrypt_id(&self.id_key, &key, entry.valid_from)?
                    };
                    entries.push(DataHistoryEntry2 {
                        pseudonym_index,
                        column_index: *column_index,
                        timestamp: entry.valid_from,
                        id,
                    });
                }
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(DataHistoryResponse2 { entries })
    }

    // =========================================================================
    // AUDIT
    // =========================================================================

    pub async fn checksum_chain_names(&self) -> Vec<String> {
        self.store.lock().await.checksum_chain_names()
    }

    pub async fn compute_checksum_chain(
        &self,
        name: &str,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        self.store
            .lock()
            .await
            .compute_checksum_chain(name, max_checkpoint)
    }

    /// Monitoring gauges: `(entries, pages on disk)`.
    pub async fn gauges(&self) -> (usize, usize) {
        self.store.lock().await.gauges()
    }

    /// The clock the facility stamps entries with.
    pub fn current_time(&self) -> Timestamp {
        self.time.now()
    }
}
