//! # End-to-End Scenarios
//!
//! Drives the full triangle: policy seeding, ticket issuance, stores,
//! enumeration, reads, metadata updates, deletes and the data-key
//! blind/unblind round trip.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::thread_rng;
    use tokio_stream::iter;

    use pep_crypto::ElGamal;
    use pep_curve::GroupElement;
    use pep_types::messages::{
        AmaMutation, DataDeleteEntry2, DataDeleteRequest2, DataReadRequest2, DataStoreEntry2,
        DataStorePage, DataStoreRequest2, EncryptionKeyEntry, EncryptionKeyRequest,
        KeyRequestDirection, LogIssuedTicketRequest, MetadataReadRequest2, MetadataUpdateEntry2,
        MetadataUpdateRequest2, TicketRequest2, TranscryptorRequest, TranscryptorRequestEntries,
        TranscryptorRequestEntry,
    };
    use pep_types::{
        parties, AccessMode, EncryptionScheme, ErrorKind, ExtraMetadata, MetadataEntry,
        ParticipantAccessMode, Signed, SignedTicket2, Ticket2, Timestamp, TranscryptorClient,
    };

    use crate::{build_triangle, seed_policy, Triangle};

    fn read_request(modes: Vec<AccessMode>) -> TicketRequest2 {
        TicketRequest2 {
            columns: vec!["Age".into()],
            participant_groups: vec!["*".into()],
            modes,
            ..TicketRequest2::default()
        }
    }

    fn write_request(pp: pep_crypto::PackedElGamal) -> TicketRequest2 {
        TicketRequest2 {
            columns: vec!["Age".into()],
            polymorphic_pseudonyms: vec![pp],
            modes: vec![AccessMode::Read, AccessMode::Write],
            ..TicketRequest2::default()
        }
    }

    /// Stores one Age cell for `pp` and returns the signed write ticket,
    /// the returned id and the plaintext data-key point.
    async fn store_age_cell(
        triangle: &Triangle,
        pp: pep_crypto::PackedElGamal,
        pages: &[&[u8]],
        scheme: EncryptionScheme,
        metadata: ExtraMetadata,
    ) -> (SignedTicket2, Vec<u8>, GroupElement, Timestamp) {
        let ticket = triangle
            .plain_ticket(&triangle.data_manager, write_request(pp))
            .await
            .unwrap();

        // The client's fresh data key, blinded by the AM before storage.
        let key_point = GroupElement::hash_from_string(b"data key point");
        let blinding_timestamp = Timestamp::now();
        let key_response = triangle
            .am
            .handle_encryption_key_request(
                Signed::new(
                    &EncryptionKeyRequest {
                        ticket: ticket.clone(),
                        entries: vec![EncryptionKeyEntry {
                            direction: KeyRequestDirection::Blind,
                            polymorphic_key: triangle.polymorphic_key(&key_point),
                            column: "Age".into(),
                            pseudonym_index: 0,
                            blinding_timestamp,
                        }],
                    },
                    &triangle.data_manager,
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let page_stream = iter(
            pages
                .iter()
                .map(|p| DataStorePage {
                    entry_index: 0,
                    data: p.to_vec(),
                })
                .collect::<Vec<_>>(),
        );
        let response = triangle
            .sf
            .store_data(
                DataStoreRequest2 {
                    ticket: ticket.clone(),
                    entries: vec![DataStoreEntry2 {
                        pseudonym_index: 0,
                        column: "Age".into(),
                        polymorphic_key: key_response.keys[0],
                        encryption_scheme: scheme,
                        blinding_timestamp,
                        metadata,
                    }],
                },
                page_stream,
            )
            .await
            .unwrap();
        assert_eq!(response.ids.len(), 1);
        (
            ticket,
            response.ids[0].clone(),
            key_point,
            blinding_timestamp,
        )
    }

    async fn collect_pages(
        triangle: &Triangle,
        ticket: SignedTicket2,
        ids: Vec<Vec<u8>>,
    ) -> Vec<Vec<u8>> {
        let mut rx = triangle
            .sf
            .read(DataReadRequest2 { ticket, ids })
            .await
            .unwrap();
        let mut pages = Vec::new();
        while let Some(page) = rx.recv().await {
            pages.push(page.unwrap().data);
        }
        pages
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn register_then_read() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;

        let pp = triangle.participant_pp("participant-1");
        let (_, _, key_point, _) = store_age_cell(
            &triangle,
            pp,
            &[b"page-one", b"page-two"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The researcher enumerates everything and reads it back.
        let ticket = triangle
            .plain_ticket(&triangle.researcher, read_request(vec![AccessMode::Read]))
            .await
            .unwrap();
        let chunks = triangle
            .sf
            .enumerate(MetadataReadRequest2 {
                ticket: ticket.clone(),
                columns: vec![],
            })
            .await
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].has_more);
        assert_eq!(chunks[0].entries.len(), 1);
        let entry = &chunks[0].entries[0];
        assert_eq!(entry.column_index, 0);
        assert_eq!(entry.file_size, 16);

        let pages = collect_pages(&triangle, ticket.clone(), vec![entry.id.clone()]).await;
        assert_eq!(pages, vec![b"page-one".to_vec(), b"page-two".to_vec()]);

        // The enumerated polymorphic key unblinds back to the original
        // data key, translated into the researcher's domain.
        let keys = triangle
            .am
            .handle_encryption_key_request(
                Signed::new(
                    &EncryptionKeyRequest {
                        ticket: ticket.clone(),
                        entries: vec![EncryptionKeyEntry {
                            direction: KeyRequestDirection::Unblind,
                            polymorphic_key: entry.polymorphic_key,
                            column: "Age".into(),
                            pseudonym_index: entry.pseudonym_index,
                            blinding_timestamp: entry.blinding_timestamp,
                        }],
                    },
                    &triangle.researcher,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let decrypted = keys.keys[0]
            .unpack()
            .unwrap()
            .decrypt(&triangle.data_secret("Researcher"));
        assert!(decrypted.equals(&key_point));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_forbidden_for_researcher() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;

        let err = triangle
            .plain_ticket(&triangle.researcher, read_request(vec![AccessMode::Write]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);

        // The data manager may write; a second store becomes current.
        let pp = triangle.participant_pp("participant-2");
        store_age_cell(
            &triangle,
            pp,
            &[b"first"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (ticket, second_id, _, _) = store_age_cell(
            &triangle,
            pp,
            &[b"second"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let enumeration_ticket = triangle
            .plain_ticket(&triangle.researcher, read_request(vec![AccessMode::Read]))
            .await
            .unwrap();
        let chunks = triangle
            .sf
            .enumerate(MetadataReadRequest2 {
                ticket: enumeration_ticket,
                columns: vec![],
            })
            .await
            .unwrap();
        assert_eq!(chunks[0].entries.len(), 1);
        let pages = collect_pages(&triangle, ticket, vec![second_id]).await;
        assert_eq!(pages, vec![b"second".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_only_update_shares_the_payload() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;
        // Data managers additionally hold write-meta on Clin here.
        triangle
            .mutate(
                &triangle.access_admin,
                vec![AmaMutation::CreateColumnGroupAccessRule {
                    column_group: "Clin".into(),
                    user_group: "DM".into(),
                    mode: AccessMode::WriteMeta,
                }],
            )
            .await;

        let pp = triangle.participant_pp("participant-3");
        let (_, _, _, blinding_timestamp) = store_age_cell(
            &triangle,
            pp,
            &[b"payload"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (_, pages_before) = triangle.sf.gauges().await;

        // A write-meta ticket for the same participant.
        let ticket = triangle
            .plain_ticket(
                &triangle.data_manager,
                TicketRequest2 {
                    columns: vec!["Age".into()],
                    polymorphic_pseudonyms: vec![pp],
                    modes: vec![AccessMode::Read, AccessMode::WriteMeta],
                    ..TicketRequest2::default()
                },
            )
            .await
            .unwrap();
        let chunks = triangle
            .sf
            .enumerate(MetadataReadRequest2 {
                ticket: ticket.clone(),
                columns: vec![],
            })
            .await
            .unwrap();
        let entry = &chunks[0].entries[0];

        let mut metadata = ExtraMetadata::new();
        metadata.set(MetadataEntry::FileExtension(".json".into()));
        let updated = triangle
            .sf
            .metadata_update(MetadataUpdateRequest2 {
                ticket: ticket.clone(),
                updates: vec![MetadataUpdateEntry2 {
                    id: entry.id.clone(),
                    polymorphic_key: entry.polymorphic_key,
                    encryption_scheme: EncryptionScheme::PayloadOnly,
                    blinding_timestamp,
                    metadata,
                }],
            })
            .await
            .unwrap();

        // Payload pages are shared, not duplicated.
        let (_, pages_after) = triangle.sf.gauges().await;
        assert_eq!(pages_before, pages_after);

        // The updated entry is current, carries the new metadata, and
        // still reads the original payload.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh_ticket = triangle
            .plain_ticket(&triangle.researcher, read_request(vec![AccessMode::Read]))
            .await
            .unwrap();
        let chunks = triangle
            .sf
            .enumerate(MetadataReadRequest2 {
                ticket: fresh_ticket.clone(),
                columns: vec![],
            })
            .await
            .unwrap();
        let current = &chunks[0].entries[0];
        assert_eq!(
            current.metadata.get(MetadataEntry::FILE_EXTENSION_KEY),
            Some(&MetadataEntry::FileExtension(".json".into()))
        );
        let pages = collect_pages(&triangle, fresh_ticket, vec![updated.ids[0].clone()]).await;
        assert_eq!(pages, vec![b"payload".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_update_refused_when_scheme_forbids() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;
        triangle
            .mutate(
                &triangle.access_admin,
                vec![AmaMutation::CreateColumnGroupAccessRule {
                    column_group: "Clin".into(),
                    user_group: "DM".into(),
                    mode: AccessMode::WriteMeta,
                }],
            )
            .await;

        let pp = triangle.participant_pp("participant-4");
        let (_, id, _, blinding_timestamp) = store_age_cell(
            &triangle,
            pp,
            &[b"sealed"],
            EncryptionScheme::MetadataInAead,
            ExtraMetadata::new(),
        )
        .await;
        let ticket = triangle
            .plain_ticket(
                &triangle.data_manager,
                TicketRequest2 {
                    columns: vec!["Age".into()],
                    polymorphic_pseudonyms: vec![pp],
                    modes: vec![AccessMode::Read, AccessMode::WriteMeta],
                    ..TicketRequest2::default()
                },
            )
            .await
            .unwrap();
        let err = triangle
            .sf
            .metadata_update(MetadataUpdateRequest2 {
                ticket,
                updates: vec![MetadataUpdateEntry2 {
                    id,
                    polymorphic_key: triangle
                        .polymorphic_key(&GroupElement::hash_from_string(b"k")),
                    encryption_scheme: EncryptionScheme::MetadataInAead,
                    blinding_timestamp,
                    metadata: ExtraMetadata::new(),
                }],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_tombstones_the_cell() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;

        let pp = triangle.participant_pp("participant-5");
        let (ticket, id, _, _) = store_age_cell(
            &triangle,
            pp,
            &[b"will be deleted"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;

        let response = triangle
            .sf
            .delete(DataDeleteRequest2 {
                ticket: ticket.clone(),
                entries: vec![DataDeleteEntry2 {
                    pseudonym_index: 0,
                    column: "Age".into(),
                }],
            })
            .await
            .unwrap();
        assert_eq!(response.affected_indices, vec![0]);

        // The old id no longer resolves to readable content...
        let err = triangle
            .sf
            .read(DataReadRequest2 {
                ticket: ticket.clone(),
                ids: vec![id],
            })
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        // ...and enumeration no longer lists the cell.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = triangle
            .plain_ticket(&triangle.researcher, read_request(vec![AccessMode::Read]))
            .await
            .unwrap();
        let chunks = triangle
            .sf
            .enumerate(MetadataReadRequest2 {
                ticket: fresh,
                columns: vec![],
            })
            .await
            .unwrap();
        assert!(chunks[0].entries.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn participant_group_rules_gate_tickets() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;

        // Seed a participant so its local pseudonym is known to the AM.
        let pp = triangle.participant_pp("participant-6");
        store_age_cell(
            &triangle,
            pp,
            &[b"x"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;
        let lp = pep_crypto::local_pseudonym(
            &triangle
                .ts
                .translate(
                    TranscryptorRequest {
                        user_group: "Researcher".into(),
                        modes: vec![AccessMode::Read],
                        include_user_group: false,
                        requester_chain: triangle.researcher.chain().clone(),
                    },
                    vec![TranscryptorRequestEntries {
                        entries: vec![TranscryptorRequestEntry { pseudonym: pp }],
                    }],
                )
                .await
                .unwrap()
                .entries[0]
                .access_manager
                .unpack()
                .unwrap(),
            &triangle.pseudonym_secret(parties::ACCESS_MANAGER),
        );

        triangle
            .mutate(
                &triangle.data_admin,
                vec![
                    AmaMutation::CreateParticipantGroup {
                        name: "Cohort".into(),
                    },
                    AmaMutation::AddParticipantToGroup {
                        group: "Cohort".into(),
                        local_pseudonym: lp,
                    },
                ],
            )
            .await;

        let cohort_request = TicketRequest2 {
            columns: vec!["Age".into()],
            participant_groups: vec!["Cohort".into()],
            modes: vec![AccessMode::Read],
            ..TicketRequest2::default()
        };

        // No rule on "Cohort": denied.
        let err = triangle
            .plain_ticket(&triangle.researcher, cohort_request.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);

        // Access alone is not enough; enumerate is also required.
        triangle
            .mutate(
                &triangle.access_admin,
                vec![AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group: "Cohort".into(),
                    user_group: "Researcher".into(),
                    mode: ParticipantAccessMode::Access,
                }],
            )
            .await;
        let err = triangle
            .plain_ticket(&triangle.researcher, cohort_request.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AccessDenied);

        triangle
            .mutate(
                &triangle.access_admin,
                vec![AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group: "Cohort".into(),
                    user_group: "Researcher".into(),
                    mode: ParticipantAccessMode::Enumerate,
                }],
            )
            .await;
        let ticket = triangle
            .plain_ticket(&triangle.researcher, cohort_request)
            .await
            .unwrap();
        let opened = ticket
            .open(
                &triangle.authority.root_cas(),
                "Researcher",
                Some(AccessMode::Read),
            )
            .unwrap();
        assert_eq!(opened.pseudonyms.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn indexed_tickets_carry_group_maps() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;
        let pp = triangle.participant_pp("participant-7");
        store_age_cell(
            &triangle,
            pp,
            &[b"x"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;

        let response = triangle
            .am
            .handle_ticket_request(
                Signed::new(
                    &TicketRequest2 {
                        column_groups: vec!["Clin".into()],
                        participant_groups: vec!["*".into()],
                        modes: vec![AccessMode::Read],
                        request_indexed_ticket: true,
                        ..TicketRequest2::default()
                    },
                    &triangle.researcher,
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let indexed = match response {
            pep_types::messages::TicketResponse2::Indexed(indexed) => indexed,
            pep_types::messages::TicketResponse2::Plain(_) => {
                panic!("expected an indexed ticket")
            }
        };
        assert_eq!(indexed.column_group_map.get("Clin"), Some(&vec![0]));
        assert_eq!(indexed.participant_group_map.get("*"), Some(&vec![0]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ticket_log_replay_reproduces_checksums() {
        // Two fresh transcryptors fed the same requests agree bit-exactly
        // on their log checksums.
        use pep_crypto::{KeyPair, MasterSecret, Translator};
        use pep_transcryptor::{Transcryptor, TranscryptorStorage};
        use pep_types::{IdentityAuthority, InMemoryKvStore, SystemTimeSource};
        use std::sync::Arc;

        let authority = IdentityAuthority::new("PEP-CA").unwrap();
        let am_identity = authority.issue(parties::ACCESS_MANAGER, None).unwrap();
        let requester = authority.issue("alice", Some("Researcher")).unwrap();
        let master = KeyPair::generate(&mut thread_rng());
        let secret = MasterSecret::generate(&mut thread_rng());

        let build = |secret: MasterSecret| {
            let storage = TranscryptorStorage::open(
                Box::new(InMemoryKvStore::new()),
                Arc::new(SystemTimeSource),
            )
            .unwrap();
            Transcryptor::new(
                storage,
                authority.issue(parties::TRANSCRYPTOR, None).unwrap(),
                authority.root_cas(),
                Translator::new(secret),
                Arc::new(SystemTimeSource),
            )
        };
        let ts1 = build(secret.clone());
        let ts2 = build(secret);

        let pp = ElGamal::encrypt(
            master.public(),
            &GroupElement::hash_from_string(b"replayed participant"),
            &mut thread_rng(),
        )
        .pack();
        let head = || TranscryptorRequest {
            user_group: "Researcher".into(),
            modes: vec![AccessMode::Read],
            include_user_group: false,
            requester_chain: requester.chain().clone(),
        };
        let batch = || {
            vec![TranscryptorRequestEntries {
                entries: vec![TranscryptorRequestEntry { pseudonym: pp }],
            }]
        };

        let timestamp = Timestamp::now();
        for ts in [&ts1, &ts2] {
            // Two issuances in quick succession.
            for _ in 0..2 {
                let response = ts.translate(head(), batch()).await.unwrap();
                let ticket = Ticket2 {
                    timestamp,
                    modes: vec![AccessMode::Read],
                    columns: vec!["Age".into()],
                    pseudonyms: response.entries.clone(),
                    user_group: "Researcher".into(),
                };
                let signed = SignedTicket2::issue(&ticket, &am_identity).unwrap();
                ts.log_issued_ticket(LogIssuedTicketRequest {
                    ticket: signed,
                    request_id: response.id,
                })
                .await
                .unwrap();
            }
        }

        for chain in ["ticket-request", "ticket-issue"] {
            let a = ts1.compute_checksum_chain(chain, None).await.unwrap();
            let b = ts2.compute_checksum_chain(chain, None).await.unwrap();
            assert_eq!(a.checksum, b.checksum, "chain {chain} diverged");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_pseudonyms_rejected() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;
        let pp = triangle.participant_pp("participant-8");
        let err = triangle
            .plain_ticket(
                &triangle.data_manager,
                TicketRequest2 {
                    columns: vec!["Age".into()],
                    polymorphic_pseudonyms: vec![pp, pp],
                    modes: vec![AccessMode::Write],
                    ..TicketRequest2::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn global_configuration_is_served() {
        let triangle = build_triangle();
        let config = triangle.am.global_configuration();
        assert_eq!(config.config["environment"], "integration-test");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn access_maps_reflect_rules() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;

        let response = triangle
            .am
            .handle_column_access_request(Signed::new(&(), &triangle.researcher).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.column_groups.get(&AccessMode::Read),
            Some(&vec!["Clin".to_string()])
        );
        // read carries read-meta.
        assert_eq!(
            response.columns.get(&AccessMode::ReadMeta),
            Some(&vec!["Age".to_string()])
        );
        assert!(response.columns.get(&AccessMode::Write).is_none());

        let groups = triangle
            .am
            .handle_participant_group_access_request(
                Signed::new(&(), &triangle.researcher).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            groups.participant_groups.get(&ParticipantAccessMode::Access),
            Some(&vec!["*".to_string()])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_server_exposes_checksum_chains() {
        let triangle = build_triangle();
        seed_policy(&triangle).await;
        let pp = triangle.participant_pp("participant-9");
        store_age_cell(
            &triangle,
            pp,
            &[b"audited"],
            EncryptionScheme::PayloadOnly,
            ExtraMetadata::new(),
        )
        .await;

        for name in triangle.am.checksum_chain_names().await {
            triangle.am.compute_checksum_chain(&name, None).await.unwrap();
        }
        for name in triangle.ts.checksum_chain_names().await {
            triangle.ts.compute_checksum_chain(&name, None).await.unwrap();
        }
        for name in triangle.sf.checksum_chain_names().await {
            triangle
                .sf
                .compute_checksum_chain(&name, Some(u64::MAX))
                .await
                .unwrap();
        }
        // The select-star chain now carries the admitted participant.
        let chain = triangle
            .am
            .compute_checksum_chain("select-start-pseud-v2", None)
            .await
            .unwrap();
        assert_ne!(chain.checksum, 0);
    }
}
