//! # Administration and Query Handlers
//!
//! Policy mutations (Data-Admin / Access-Admin), chunked policy queries,
//! access maps, column-name-mapping CRUD, structure metadata and the
//! global configuration blob.

use tracing::info;

use pep_crypto::KeyDomain;
use pep_types::messages::{
    AmaMutation, AmaQrColumn, AmaQrColumnGroup, AmaQrColumnGroupAccessRule,
    AmaQrParticipantGroup, AmaQrParticipantGroupAccessRule, AmaQuery, AmaQueryResponse,
    ColumnAccessResponse, ColumnNameMappingRequest, ColumnNameMappingResponse,
    GlobalConfigurationResponse, KeyComponentResponse, ParticipantGroupAccessResponse,
    SignedAmaMutationRequest, SignedAmaQuery, SignedColumnNameMappingRequest,
    SignedKeyComponentRequest, StructureMetadataEntry, StructureMetadataRequest,
};
use pep_types::{
    user_groups, AccessMode, ParticipantAccessMode, PepError, Signed, Timestamp,
};

use crate::service::AccessManager;
use crate::storage::UNIVERSAL_GROUP;

/// Entries per query-response chunk, keeping every frame well under the
/// transport's size ceiling.
const QUERY_CHUNK_ENTRIES: usize = 2500;

impl AccessManager {
    fn require_group(signed_group: Option<&str>, wanted: &str) -> Result<(), PepError> {
        match signed_group {
            Some(group) if group == wanted => Ok(()),
            Some(group) => Err(PepError::access_denied(format!(
                "operation requires {wanted:?}, caller is {group:?}"
            ))),
            None => Err(PepError::access_denied("caller has no user group")),
        }
    }

    /// Applies a batch of policy mutations.
    pub async fn handle_ama_mutation(
        &self,
        signed: SignedAmaMutationRequest,
    ) -> Result<(), PepError> {
        let request = signed.open(&self.root_cas)?;
        let group = signed.claimed_user_group().map(|g| g.to_string());
        let mut store = self.store.lock().await;
        for mutation in request.mutations {
            let needs = match &mutation {
                AmaMutation::CreateColumnGroupAccessRule { .. }
                | AmaMutation::RemoveColumnGroupAccessRule { .. }
                | AmaMutation::CreateParticipantGroupAccessRule { .. }
                | AmaMutation::RemoveParticipantGroupAccessRule { .. } => {
                    user_groups::ACCESS_ADMIN
                }
                _ => user_groups::DATA_ADMIN,
            };
            Self::require_group(group.as_deref(), needs)?;
            info!(?mutation, by = needs, "applying policy mutation");
            match mutation {
                AmaMutation::CreateColumn { name } => store.create_column(&name)?,
                AmaMutation::RemoveColumn { name } => store.remove_column(&name)?,
                AmaMutation::CreateColumnGroup { name } => store.create_column_group(&name)?,
                AmaMutation::RemoveColumnGroup { name, force } => {
                    store.remove_column_group(&name, force)?
                }
                AmaMutation::AddColumnToGroup { column, group } => {
                    store.add_column_to_group(&column, &group)?
                }
                AmaMutation::RemoveColumnFromGroup { column, group } => {
                    store.remove_column_from_group(&column, &group)?
                }
                AmaMutation::CreateParticipantGroup { name } => {
                    store.create_participant_group(&name)?
                }
                AmaMutation::RemoveParticipantGroup { name, force } => {
                    store.remove_participant_group(&name, force)?
                }
                AmaMutation::AddParticipantToGroup {
                    group,
                    local_pseudonym,
                } => store.add_participant_to_group(&group, &local_pseudonym)?,
                AmaMutation::RemoveParticipantFromGroup {
                    group,
                    local_pseudonym,
                } => store.remove_participant_from_group(&group, &local_pseudonym)?,
                AmaMutation::CreateColumnGroupAccessRule {
                    column_group,
                    user_group,
                    mode,
                } => store.create_column_group_access_rule(&column_group, &user_group, mode)?,
                AmaMutation::RemoveColumnGroupAccessRule {
                    column_group,
                    user_group,
                    mode,
                } => store.remove_column_group_access_rule(&column_group, &user_group, mode)?,
                AmaMutation::CreateParticipantGroupAccessRule {
                    participant_group,
                    user_group,
                    mode,
                } => store.create_participant_group_access_rule(
                    &participant_group,
                    &user_group,
                    mode,
                )?,
                AmaMutation::RemoveParticipantGroupAccessRule {
                    participant_group,
                    user_group,
                    mode,
                } => store.remove_participant_group_access_rule(
                    &participant_group,
                    &user_group,
                    mode,
                )?,
            }
        }
        Ok(())
    }

    /// Answers a policy query as a sequence of chunks.
    pub async fn handle_ama_query(
        &self,
        signed: SignedAmaQuery,
    ) -> Result<Vec<AmaQueryResponse>, PepError> {
        let query = signed.open(&self.root_cas)?;
        let at = query.at;
        let store = self.store.lock().await;

        let mut full = AmaQueryResponse::default();
        for name in store.columns_at(at)? {
            if matches_filter(&query.column_filter, &name) {
                full.columns.push(AmaQrColumn { name });
            }
        }
        for name in store.column_groups_at(at)? {
            if matches_filter(&query.column_group_filter, &name) {
                let columns = store.columns_in_group(&name, at)?;
                full.column_groups.push(AmaQrColumnGroup { name, columns });
            }
        }
        for rule in store.column_group_access_rules_at(at)? {
            if matches_filter(&query.column_group_filter, &rule.column_group)
                && matches_filter(&query.user_group_filter, &rule.user_group)
            {
                full.column_group_access_rules.push(AmaQrColumnGroupAccessRule {
                    column_group: rule.column_group,
                    user_group: rule.user_group,
                    mode: rule.mode,
                });
            }
        }
        for name in store.participant_groups_at(at)? {
            if matches_filter(&query.participant_group_filter, &name) {
                full.participant_groups.push(AmaQrParticipantGroup { name });
            }
        }
        for rule in store.participant_group_access_rules_at(at)? {
            if matches_filter(&query.participant_group_filter, &rule.participant_group)
                && matches_filter(&query.user_group_filter, &rule.user_group)
            {
                full.participant_group_access_rules
                    .push(AmaQrParticipantGroupAccessRule {
                        participant_group: rule.participant_group,
                        user_group: rule.user_group,
                        mode: rule.mode,
                    });
            }
        }
        Ok(chunk_query_response(full))
    }

    /// The column access of the calling user group, per mode.
    pub async fn handle_column_access_request(
        &self,
        signed: Signed<()>,
    ) -> Result<ColumnAccessResponse, PepError> {
        signed.open(&self.root_cas)?;
        let user_group = signed
            .claimed_user_group()
            .ok_or_else(|| PepError::access_denied("caller has no user group"))?
            .to_string();
        let now = self.time.now();
        let store = self.store.lock().await;

        let mut response = ColumnAccessResponse::default();
        let mut groups = store.column_groups_at(Some(now))?;
        groups.push(UNIVERSAL_GROUP.to_string());
        for mode in AccessMode::ALL {
            let mut mode_groups = Vec::new();
            let mut mode_columns = Vec::new();
            for group in &groups {
                if store.has_column_group_access(group, &user_group, mode, Some(now))? {
                    mode_groups.push(group.clone());
                    for column in store.columns_in_group(group, Some(now))? {
                        if !mode_columns.contains(&column) {
                            mode_columns.push(column);
                        }
                    }
                }
            }
            if !mode_groups.is_empty() {
                response.column_groups.insert(mode, mode_groups);
                response.columns.insert(mode, mode_columns);
            }
        }
        Ok(response)
    }

    /// The participant-group access of the calling user group.
    pub async fn handle_participant_group_access_request(
        &self,
        signed: Signed<()>,
    ) -> Result<ParticipantGroupAccessResponse, PepError> {
        signed.open(&self.root_cas)?;
        let user_group = signed
            .claimed_user_group()
            .ok_or_else(|| PepError::access_denied("caller has no user group"))?
            .to_string();
        let now = self.time.now();
        let store = self.store.lock().await;

        let mut response = ParticipantGroupAccessResponse::default();
        let mut groups = store.participant_groups_at(Some(now))?;
        groups.push(UNIVERSAL_GROUP.to_string());
        for mode in ParticipantAccessMode::ALL {
            let mode_groups: Vec<String> = groups
                .iter()
                .filter(|g| {
                    store
                        .has_participant_group_access(g, &user_group, mode, Some(now))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if !mode_groups.is_empty() {
                response.participant_groups.insert(mode, mode_groups);
            }
        }
        Ok(response)
    }

    /// Column-name-mapping CRUD; reads are open to every user, writes to
    /// Data-Admin only.
    pub async fn handle_column_name_mapping(
        &self,
        signed: SignedColumnNameMappingRequest,
    ) -> Result<ColumnNameMappingResponse, PepError> {
        let request = signed.open(&self.root_cas)?;
        let group = signed.claimed_user_group().map(|g| g.to_string());
        let mut store = self.store.lock().await;
        let mappings = match request {
            ColumnNameMappingRequest::Read { original } => store
                .column_name_mappings()?
                .into_iter()
                .filter(|m| m.original == original)
                .collect(),
            ColumnNameMappingRequest::ReadAll => store.column_name_mappings()?,
            ColumnNameMappingRequest::Create(mapping) => {
                Self::require_group(group.as_deref(), user_groups::DATA_ADMIN)?;
                store.create_column_name_mapping(&mapping.original, &mapping.mapped)?;
                vec![crate::storage::records::ColumnNameMappingRecord {
                    original: mapping.original,
                    mapped: mapping.mapped,
                }]
            }
            ColumnNameMappingRequest::Update(mapping) => {
                Self::require_group(group.as_deref(), user_groups::DATA_ADMIN)?;
                store.update_column_name_mapping(&mapping.original, &mapping.mapped)?;
                vec![crate::storage::records::ColumnNameMappingRecord {
                    original: mapping.original,
                    mapped: mapping.mapped,
                }]
            }
            ColumnNameMappingRequest::Delete { original } => {
                Self::require_group(group.as_deref(), user_groups::DATA_ADMIN)?;
                store.delete_column_name_mapping(&original)?;
                Vec::new()
            }
        };
        Ok(ColumnNameMappingResponse {
            mappings: mappings
                .into_iter()
                .map(|m| pep_types::messages::ColumnNameMapping {
                    original: m.original,
                    mapped: m.mapped,
                })
                .collect(),
        })
    }

    /// The structure-metadata stream.
    pub fn handle_structure_metadata(
        &self,
        request: StructureMetadataRequest,
    ) -> Vec<StructureMetadataEntry> {
        self.config
            .structure_metadata
            .iter()
            .filter(|e| matches_filter(&request.subject_filter, &e.subject))
            .cloned()
            .collect()
    }

    /// The global configuration blob.
    pub fn global_configuration(&self) -> GlobalConfigurationResponse {
        GlobalConfigurationResponse {
            config: self.config.global_config.clone(),
        }
    }

    /// The caller's key component plus translation-proof verifiers.
    pub async fn handle_key_component_request(
        &self,
        signed: SignedKeyComponentRequest,
    ) -> Result<KeyComponentResponse, PepError> {
        signed.open(&self.root_cas)?;
        let user_group = signed
            .claimed_user_group()
            .ok_or_else(|| PepError::access_denied("caller has no user group"))?
            .to_string();
        let verifiers = self
            .transcryptor
            .translation_verifiers(KeyDomain::Pseudonym, user_group)
            .await?;
        Ok(KeyComponentResponse {
            component: self.master_public_key.pack(),
            verifiers,
        })
    }

    /// Point-in-time helper for handlers needing "now".
    pub fn current_time(&self) -> Timestamp {
        self.time.now()
    }
}

fn matches_filter(filter: &Option<String>, name: &str) -> bool {
    match filter {
        Some(f) => f == name,
        None => true,
    }
}

/// Splits a full query answer into bounded chunks, flagging all but the
/// last with `has_more`.
fn chunk_query_response(full: AmaQueryResponse) -> Vec<AmaQueryResponse> {
    let total = full.columns.len()
        + full.column_groups.len()
        + full.column_group_access_rules.len()
        + full.participant_groups.len()
        + full.participant_group_access_rules.len();
    if total <= QUERY_CHUNK_ENTRIES {
        return vec![full];
    }

    let mut chunks: Vec<AmaQueryResponse> = Vec::new();
    let mut current = AmaQueryResponse::default();
    let mut count = 0usize;

    macro_rules! push_items {
        ($field:ident, $items:expr) => {
            for item in $items {
                if count == QUERY_CHUNK_ENTRIES {
                    chunks.push(std::mem::take(&mut current));
                    count = 0;
                }
                current.$field.push(item);
                count += 1;
            }
        };
    }

    push_items!(columns, full.columns);
    push_items!(column_groups, full.column_groups);
    push_items!(column_group_access_rules, full.column_group_access_rules);
    push_items!(participant_groups, full.participant_groups);
    push_items!(
        participant_group_access_rules,
        full.participant_group_access_rules
    );
    chunks.push(current);
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.has_more = i != last;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_splits_and_flags() {
        let mut full = AmaQueryResponse::default();
        for i in 0..(QUERY_CHUNK_ENTRIES * 2 + 10) {
            full.columns.push(AmaQrColumn {
                name: format!("c{i}"),
            });
        }
        let chunks = chunk_query_response(full);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].has_more);
        assert!(chunks[1].has_more);
        assert!(!chunks[2].has_more);
        let total: usize = chunks.iter().map(|c| c.columns.len()).sum();
        assert_eq!(total, QUERY_CHUNK_ENTRIES * 2 + 10);
    }

    #[test]
    fn filter_matches() {
        assert!(matches_filter(&None, "x"));
        assert!(matches_filter(&Some("x".into()), "x"));
        assert!(!matches_filter(&Some("y".into()), "x"));
    }
}
