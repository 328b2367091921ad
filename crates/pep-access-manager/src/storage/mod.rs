//! # Access Manager Policy Store
//!
//! Columns, column groups, participant groups, their memberships, the
//! access rules over both kinds of group, column-name mappings and the
//! select-star pseudonym table, all as append-only record tables. A
//! logical read replays events up to an optional point in time and applies
//! tombstones; mutations are validated and staged in a single transaction.
//!
//! On startup the store runs the one-time local-pseudonym re-serialization
//! migration and the orphan sweep.

pub mod records;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use pep_types::checksum::{record_contribution, ChainAccumulator, ChecksumValue};
use pep_types::{
    user_groups, AccessMode, HasChecksumChains, KeyValueStore, ParticipantAccessMode, PepError,
    RecordTable, StoreTxn, StoredRecord, TimeSource, Timestamp,
};

use records::{
    from_legacy_encoding, to_legacy_encoding, ColumnGroupAccessRuleRecord, ColumnGroupColumnRecord,
    ColumnGroupRecord, ColumnNameMappingRecord, ColumnRecord, ParticipantGroupAccessRuleRecord,
    ParticipantGroupParticipantRecord, ParticipantGroupRecord, SelectStarPseudonymRecord,
};

/// The universal group name, implicitly containing everything.
pub const UNIVERSAL_GROUP: &str = "*";

/// Suffix of the one-time migration backup file.
pub const MIGRATION_BACKUP_SUFFIX: &str = "_before_lp_and_pp_reserialization";

fn t_columns() -> RecordTable {
    RecordTable::new("Columns")
}
fn t_column_groups() -> RecordTable {
    RecordTable::new("ColumnGroups")
}
fn t_column_group_columns() -> RecordTable {
    RecordTable::new("ColumnGroupColumns")
}
fn t_participant_groups() -> RecordTable {
    RecordTable::new("ParticipantGroups")
}
fn t_participant_group_participants() -> RecordTable {
    RecordTable::new("ParticipantGroupParticipants")
}
fn t_cgars() -> RecordTable {
    RecordTable::new("ColumnGroupAccessRules")
}
fn t_pgars() -> RecordTable {
    RecordTable::new("GroupAccessRules")
}
fn t_mappings() -> RecordTable {
    RecordTable::new("ColumnNameMappings")
}
fn t_select_star() -> RecordTable {
    RecordTable::new("SelectStarPseudonyms")
}

/// The Access Manager's persistent policy state.
pub struct PolicyStore {
    kv: Box<dyn KeyValueStore>,
    db_path: Option<PathBuf>,
    time: Arc<dyn TimeSource>,
}

impl PolicyStore {
    /// Opens the store, running the re-serialization migration and the
    /// orphan sweep.
    pub fn open(
        kv: Box<dyn KeyValueStore>,
        db_path: Option<PathBuf>,
        time: Arc<dyn TimeSource>,
    ) -> Result<PolicyStore, PepError> {
        let mut store = PolicyStore { kv, db_path, time };
        store.migrate_pseudonym_serialization()?;
        store.remove_orphaned_records()?;
        Ok(store)
    }

    fn now(&self) -> Timestamp {
        self.time.now()
    }

    fn scan_sorted<P: DeserializeOwned>(
        &self,
        table: &RecordTable,
    ) -> Result<Vec<StoredRecord<P>>, PepError> {
        let mut records = table.scan::<P>(self.kv.as_ref())?;
        records.sort_by_key(|r| (r.timestamp, r.seqno));
        Ok(records)
    }

    /// Replays a table into its live set at `at`, keyed by `key`.
    fn live_set<P, K, F>(
        &self,
        table: &RecordTable,
        at: Option<Timestamp>,
        key: F,
    ) -> Result<BTreeMap<K, StoredRecord<P>>, PepError>
    where
        P: DeserializeOwned,
        K: Ord,
        F: Fn(&P) -> K,
    {
        let mut live = BTreeMap::new();
        for record in self.scan_sorted::<P>(table)? {
            if let Some(at) = at {
                if record.timestamp > at {
                    continue;
                }
            }
            let k = key(&record.payload);
            if record.tombstone {
                live.remove(&k);
            } else {
                live.insert(k, record);
            }
        }
        Ok(live)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn columns_at(&self, at: Option<Timestamp>) -> Result<Vec<String>, PepError> {
        Ok(self
            .live_set(&t_columns(), at, |p: &ColumnRecord| p.name.clone())?
            .into_keys()
            .collect())
    }

    pub fn has_column(&self, name: &str, at: Option<Timestamp>) -> Result<bool, PepError> {
        Ok(self.columns_at(at)?.iter().any(|c| c == name))
    }

    pub fn column_groups_at(&self, at: Option<Timestamp>) -> Result<Vec<String>, PepError> {
        Ok(self
            .live_set(&t_column_groups(), at, |p: &ColumnGroupRecord| p.name.clone())?
            .into_keys()
            .collect())
    }

    pub fn has_column_group(&self, name: &str, at: Option<Timestamp>) -> Result<bool, PepError> {
        if name == UNIVERSAL_GROUP {
            return Ok(true);
        }
        Ok(self.column_groups_at(at)?.iter().any(|g| g == name))
    }

    /// Live `(column, group)` memberships.
    pub fn column_group_columns_at(
        &self,
        at: Option<Timestamp>,
    ) -> Result<Vec<ColumnGroupColumnRecord>, PepError> {
        Ok(self
            .live_set(&t_column_group_columns(), at, |p: &ColumnGroupColumnRecord| {
                (p.column.clone(), p.column_group.clone())
            })?
            .into_values()
            .map(|r| r.payload)
            .collect())
    }

    /// The columns of a group; the universal group unfolds to all columns.
    pub fn columns_in_group(
        &self,
        group: &str,
        at: Option<Timestamp>,
    ) -> Result<Vec<String>, PepError> {
        if group == UNIVERSAL_GROUP {
            return self.columns_at(at);
        }
        Ok(self
            .column_group_columns_at(at)?
            .into_iter()
            .filter(|m| m.column_group == group)
            .map(|m| m.column)
            .collect())
    }

    /// All groups containing `column`, the universal group included.
    pub fn groups_containing_column(
        &self,
        column: &str,
        at: Option<Timestamp>,
    ) -> Result<Vec<String>, PepError> {
        let mut groups: Vec<String> = self
            .column_group_columns_at(at)?
            .into_iter()
            .filter(|m| m.column == column)
            .map(|m| m.column_group)
            .collect();
        groups.push(UNIVERSAL_GROUP.to_string());
        Ok(groups)
    }

    pub fn participant_groups_at(&self, at: Option<Timestamp>) -> Result<Vec<String>, PepError> {
        Ok(self
            .live_set(&t_participant_groups(), at, |p: &ParticipantGroupRecord| {
                p.name.clone()
            })?
            .into_keys()
            .collect())
    }

    pub fn has_participant_group(
        &self,
        name: &str,
        at: Option<Timestamp>,
    ) -> Result<bool, PepError> {
        if name == UNIVERSAL_GROUP {
            return Ok(true);
        }
        Ok(self.participant_groups_at(at)?.iter().any(|g| g == name))
    }

    /// Live `(local pseudonym, group)` memberships, packed form.
    pub fn participant_memberships_at(
        &self,
        at: Option<Timestamp>,
    ) -> Result<Vec<ParticipantGroupParticipantRecord>, PepError> {
        Ok(self
            .live_set(
                &t_participant_group_participants(),
                at,
                |p: &ParticipantGroupParticipantRecord| {
                    (p.local_pseudonym.clone(), p.participant_group.clone())
                },
            )?
            .into_values()
            .map(|r| r.payload)
            .collect())
    }

    /// The member local pseudonyms of a participant group.
    pub fn participants_in_group(
        &self,
        group: &str,
        at: Option<Timestamp>,
    ) -> Result<Vec<Vec<u8>>, PepError> {
        Ok(self
            .participant_memberships_at(at)?
            .into_iter()
            .filter(|m| m.participant_group == group)
            .map(|m| m.local_pseudonym)
            .collect())
    }

    pub fn column_group_access_rules_at(
        &self,
        at: Option<Timestamp>,
    ) -> Result<Vec<ColumnGroupAccessRuleRecord>, PepError> {
        Ok(self
            .live_set(&t_cgars(), at, |p: &ColumnGroupAccessRuleRecord| {
                (p.column_group.clone(), p.user_group.clone(), p.mode)
            })?
            .into_values()
            .map(|r| r.payload)
            .collect())
    }

    pub fn participant_group_access_rules_at(
        &self,
        at: Option<Timestamp>,
    ) -> Result<Vec<ParticipantGroupAccessRuleRecord>, PepError> {
        Ok(self
            .live_set(&t_pgars(), at, |p: &ParticipantGroupAccessRuleRecord| {
                (p.participant_group.clone(), p.user_group.clone(), p.mode)
            })?
            .into_values()
            .map(|r| r.payload)
            .collect())
    }

    /// Whether `user_group` holds `mode` on `column_group`, explicit rules
    /// and mode implication considered.
    pub fn has_column_group_access(
        &self,
        column_group: &str,
        user_group: &str,
        mode: AccessMode,
        at: Option<Timestamp>,
    ) -> Result<bool, PepError> {
        // Data-Admin implicitly holds read-meta everywhere.
        if user_group == user_groups::DATA_ADMIN && AccessMode::ReadMeta.implies(mode) {
            return Ok(true);
        }
        Ok(self.column_group_access_rules_at(at)?.iter().any(|r| {
            r.column_group == column_group && r.user_group == user_group && r.mode.implies(mode)
        }))
    }

    /// Whether `user_group` holds `mode` on `participant_group`; Data-Admin
    /// passes implicitly.
    pub fn has_participant_group_access(
        &self,
        participant_group: &str,
        user_group: &str,
        mode: ParticipantAccessMode,
        at: Option<Timestamp>,
    ) -> Result<bool, PepError> {
        if user_group == user_groups::DATA_ADMIN {
            return Ok(true);
        }
        Ok(self.participant_group_access_rules_at(at)?.iter().any(|r| {
            r.participant_group == participant_group && r.user_group == user_group && r.mode == mode
        }))
    }

    /// Current column-name mappings.
    pub fn column_name_mappings(&self) -> Result<Vec<ColumnNameMappingRecord>, PepError> {
        Ok(self
            .live_set(&t_mappings(), None, |p: &ColumnNameMappingRecord| {
                p.original.clone()
            })?
            .into_values()
            .map(|r| r.payload)
            .collect())
    }

    /// All select-star pseudonym pairs, packed form.
    pub fn select_star_pseudonyms(&self) -> Result<Vec<SelectStarPseudonymRecord>, PepError> {
        Ok(self
            .scan_sorted::<SelectStarPseudonymRecord>(&t_select_star())?
            .into_iter()
            .map(|r| normalize_select_star(r.payload))
            .collect())
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    pub fn create_column(&mut self, name: &str) -> Result<(), PepError> {
        if name.is_empty() {
            return Err(PepError::invalid("column name must not be empty"));
        }
        if self.has_column(name, None)? {
            return Err(PepError::conflict(format!("column {name:?} already exists")));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(&t_columns(), now, false, &ColumnRecord { name: name.into() })?;
        txn.commit()
    }

    pub fn remove_column(&mut self, name: &str) -> Result<(), PepError> {
        if !self.has_column(name, None)? {
            return Err(PepError::not_found(format!("column {name:?}")));
        }
        let memberships: Vec<ColumnGroupColumnRecord> = self
            .column_group_columns_at(None)?
            .into_iter()
            .filter(|m| m.column == name)
            .collect();
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(&t_columns(), now, true, &ColumnRecord { name: name.into() })?;
        for membership in memberships {
            warn!(
                column = name,
                group = membership.column_group.as_str(),
                "removing column-group membership of removed column"
            );
            txn.append(&t_column_group_columns(), now, true, &membership)?;
        }
        txn.commit()
    }

    pub fn create_column_group(&mut self, name: &str) -> Result<(), PepError> {
        if name.is_empty() || name == UNIVERSAL_GROUP {
            return Err(PepError::invalid(format!("invalid column group name {name:?}")));
        }
        if self.has_column_group(name, None)? {
            return Err(PepError::conflict(format!(
                "column group {name:?} already exists"
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_column_groups(),
            now,
            false,
            &ColumnGroupRecord { name: name.into() },
        )?;
        txn.commit()
    }

    /// Removes a column group. Without `force` the group must be empty and
    /// unreferenced; with `force` memberships and access rules cascade.
    pub fn remove_column_group(&mut self, name: &str, force: bool) -> Result<(), PepError> {
        if name == UNIVERSAL_GROUP {
            return Err(PepError::invalid("cannot remove the universal group"));
        }
        if !self.has_column_group(name, None)? {
            return Err(PepError::not_found(format!("column group {name:?}")));
        }
        let memberships: Vec<ColumnGroupColumnRecord> = self
            .column_group_columns_at(None)?
            .into_iter()
            .filter(|m| m.column_group == name)
            .collect();
        let rules: Vec<ColumnGroupAccessRuleRecord> = self
            .column_group_access_rules_at(None)?
            .into_iter()
            .filter(|r| r.column_group == name)
            .collect();
        if !force && (!memberships.is_empty() || !rules.is_empty()) {
            return Err(PepError::conflict(format!(
                "column group {name:?} still has {} member(s) and {} rule(s)",
                memberships.len(),
                rules.len()
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_column_groups(),
            now,
            true,
            &ColumnGroupRecord { name: name.into() },
        )?;
        for membership in memberships {
            txn.append(&t_column_group_columns(), now, true, &membership)?;
        }
        for rule in rules {
            warn!(
                group = name,
                user_group = rule.user_group.as_str(),
                mode = %rule.mode,
                "force-removing column-group access rule"
            );
            txn.append(&t_cgars(), now, true, &rule)?;
        }
        txn.commit()
    }

    pub fn add_column_to_group(&mut self, column: &str, group: &str) -> Result<(), PepError> {
        if group == UNIVERSAL_GROUP {
            return Err(PepError::invalid(
                "membership of the universal group is implicit",
            ));
        }
        if !self.has_column(column, None)? {
            return Err(PepError::not_found(format!("column {column:?}")));
        }
        if !self.has_column_group(group, None)? {
            return Err(PepError::not_found(format!("column group {group:?}")));
        }
        if self
            .column_group_columns_at(None)?
            .iter()
            .any(|m| m.column == column && m.column_group == group)
        {
            return Err(PepError::conflict(format!(
                "column {column:?} is already a member of {group:?}"
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_column_group_columns(),
            now,
            false,
            &ColumnGroupColumnRecord {
                column: column.into(),
                column_group: group.into(),
            },
        )?;
        txn.commit()
    }

    pub fn remove_column_from_group(&mut self, column: &str, group: &str) -> Result<(), PepError> {
        if !self
            .column_group_columns_at(None)?
            .iter()
            .any(|m| m.column == column && m.column_group == group)
        {
            return Err(PepError::not_found(format!(
                "column {column:?} is not a member of {group:?}"
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_column_group_columns(),
            now,
            true,
            &ColumnGroupColumnRecord {
                column: column.into(),
                column_group: group.into(),
            },
        )?;
        txn.commit()
    }

    pub fn create_participant_group(&mut self, name: &str) -> Result<(), PepError> {
        if name.is_empty() || name == UNIVERSAL_GROUP {
            return Err(PepError::invalid(format!(
                "invalid participant group name {name:?}"
            )));
        }
        if self.has_participant_group(name, None)? {
            return Err(PepError::conflict(format!(
                "participant group {name:?} already exists"
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_participant_groups(),
            now,
            false,
            &ParticipantGroupRecord { name: name.into() },
        )?;
        txn.commit()
    }

    pub fn remove_participant_group(&mut self, name: &str, force: bool) -> Result<(), PepError> {
        if name == UNIVERSAL_GROUP {
            return Err(PepError::invalid("cannot remove the universal group"));
        }
        if !self.has_participant_group(name, None)? {
            return Err(PepError::not_found(format!("participant group {name:?}")));
        }
        let memberships: Vec<ParticipantGroupParticipantRecord> = self
            .participant_memberships_at(None)?
            .into_iter()
            .filter(|m| m.participant_group == name)
            .collect();
        let rules: Vec<ParticipantGroupAccessRuleRecord> = self
            .participant_group_access_rules_at(None)?
            .into_iter()
            .filter(|r| r.participant_group == name)
            .collect();
        if !force && (!memberships.is_empty() || !rules.is_empty()) {
            return Err(PepError::conflict(format!(
                "participant group {name:?} still has {} member(s) and {} rule(s)",
                memberships.len(),
                rules.len()
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_participant_groups(),
            now,
            true,
            &ParticipantGroupRecord { name: name.into() },
        )?;
        for membership in memberships {
            txn.append(&t_participant_group_participants(), now, true, &membership)?;
        }
        for rule in rules {
            warn!(
                group = name,
                user_group = rule.user_group.as_str(),
                mode = %rule.mode,
                "force-removing participant-group access rule"
            );
            txn.append(&t_pgars(), now, true, &rule)?;
        }
        txn.commit()
    }

    pub fn add_participant_to_group(
        &mut self,
        group: &str,
        local_pseudonym: &[u8; 32],
    ) -> Result<(), PepError> {
        if group == UNIVERSAL_GROUP {
            return Err(PepError::invalid(
                "membership of the universal group is implicit",
            ));
        }
        if !self.has_participant_group(group, None)? {
            return Err(PepError::not_found(format!("participant group {group:?}")));
        }
        if self
            .participant_memberships_at(None)?
            .iter()
            .any(|m| m.local_pseudonym == local_pseudonym && m.participant_group == group)
        {
            return Err(PepError::conflict("participant is already a member"));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_participant_group_participants(),
            now,
            false,
            &ParticipantGroupParticipantRecord {
                local_pseudonym: local_pseudonym.to_vec(),
                participant_group: group.into(),
            },
        )?;
        txn.commit()
    }

    pub fn remove_participant_from_group(
        &mut self,
        group: &str,
        local_pseudonym: &[u8; 32],
    ) -> Result<(), PepError> {
        if !self
            .participant_memberships_at(None)?
            .iter()
            .any(|m| m.local_pseudonym == local_pseudonym && m.participant_group == group)
        {
            return Err(PepError::not_found("participant is not a member"));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_participant_group_participants(),
            now,
            true,
            &ParticipantGroupParticipantRecord {
                local_pseudonym: local_pseudonym.to_vec(),
                participant_group: group.into(),
            },
        )?;
        txn.commit()
    }

    pub fn create_column_group_access_rule(
        &mut self,
        column_group: &str,
        user_group: &str,
        mode: AccessMode,
    ) -> Result<(), PepError> {
        // Data-Admin's read-meta is implicit everywhere; an explicit rule
        // would only shadow it.
        if user_group == user_groups::DATA_ADMIN && mode == AccessMode::ReadMeta {
            return Err(PepError::invalid(
                "read-meta for Data Administrator is implicit",
            ));
        }
        if !self.has_column_group(column_group, None)? {
            return Err(PepError::not_found(format!("column group {column_group:?}")));
        }
        if self
            .column_group_access_rules_at(None)?
            .iter()
            .any(|r| r.column_group == column_group && r.user_group == user_group && r.mode == mode)
        {
            return Err(PepError::conflict("access rule already exists"));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_cgars(),
            now,
            false,
            &ColumnGroupAccessRuleRecord {
                column_group: column_group.into(),
                user_group: user_group.into(),
                mode,
            },
        )?;
        txn.commit()
    }

    pub fn remove_column_group_access_rule(
        &mut self,
        column_group: &str,
        user_group: &str,
        mode: AccessMode,
    ) -> Result<(), PepError> {
        if !self
            .column_group_access_rules_at(None)?
            .iter()
            .any(|r| r.column_group == column_group && r.user_group == user_group && r.mode == mode)
        {
            return Err(PepError::not_found("access rule"));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_cgars(),
            now,
            true,
            &ColumnGroupAccessRuleRecord {
                column_group: column_group.into(),
                user_group: user_group.into(),
                mode,
            },
        )?;
        txn.commit()
    }

    pub fn create_participant_group_access_rule(
        &mut self,
        participant_group: &str,
        user_group: &str,
        mode: ParticipantAccessMode,
    ) -> Result<(), PepError> {
        // Data-Admin has unchecked access to every participant group.
        if user_group == user_groups::DATA_ADMIN {
            return Err(PepError::invalid(
                "participant-group access for Data Administrator is implicit",
            ));
        }
        if !self.has_participant_group(participant_group, None)? {
            return Err(PepError::not_found(format!(
                "participant group {participant_group:?}"
            )));
        }
        if self.participant_group_access_rules_at(None)?.iter().any(|r| {
            r.participant_group == participant_group && r.user_group == user_group && r.mode == mode
        }) {
            return Err(PepError::conflict("access rule already exists"));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_pgars(),
            now,
            false,
            &ParticipantGroupAccessRuleRecord {
                participant_group: participant_group.into(),
                user_group: user_group.into(),
                mode,
            },
        )?;
        txn.commit()
    }

    pub fn remove_participant_group_access_rule(
        &mut self,
        participant_group: &str,
        user_group: &str,
        mode: ParticipantAccessMode,
    ) -> Result<(), PepError> {
        if !self.participant_group_access_rules_at(None)?.iter().any(|r| {
            r.participant_group == participant_group && r.user_group == user_group && r.mode == mode
        }) {
            return Err(PepError::not_found("access rule"));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_pgars(),
            now,
            true,
            &ParticipantGroupAccessRuleRecord {
                participant_group: participant_group.into(),
                user_group: user_group.into(),
                mode,
            },
        )?;
        txn.commit()
    }

    pub fn create_column_name_mapping(
        &mut self,
        original: &str,
        mapped: &str,
    ) -> Result<(), PepError> {
        if self
            .column_name_mappings()?
            .iter()
            .any(|m| m.original == original)
        {
            return Err(PepError::conflict(format!(
                "mapping for {original:?} already exists"
            )));
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_mappings(),
            now,
            false,
            &ColumnNameMappingRecord {
                original: original.into(),
                mapped: mapped.into(),
            },
        )?;
        txn.commit()
    }

    pub fn update_column_name_mapping(
        &mut self,
        original: &str,
        mapped: &str,
    ) -> Result<(), PepError> {
        let existing = self
            .column_name_mappings()?
            .into_iter()
            .find(|m| m.original == original)
            .ok_or_else(|| PepError::not_found(format!("mapping for {original:?}")))?;
        if existing.mapped == mapped {
            // Idempotent update.
            return Ok(());
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(&t_mappings(), now, true, &existing)?;
        txn.append(
            &t_mappings(),
            now,
            false,
            &ColumnNameMappingRecord {
                original: original.into(),
                mapped: mapped.into(),
            },
        )?;
        txn.commit()
    }

    pub fn delete_column_name_mapping(&mut self, original: &str) -> Result<(), PepError> {
        let existing = self
            .column_name_mappings()?
            .into_iter()
            .find(|m| m.original == original)
            .ok_or_else(|| PepError::not_found(format!("mapping for {original:?}")))?;
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(&t_mappings(), now, true, &existing)?;
        txn.commit()
    }

    /// Admits a `(local pseudonym, polymorphic pseudonym)` pair into the
    /// select-star table; duplicates by local pseudonym are skipped.
    pub fn store_select_star_pseudonym(
        &mut self,
        local_pseudonym: &[u8; 32],
        polymorphic_pseudonym: &[u8; 96],
    ) -> Result<bool, PepError> {
        if self
            .select_star_pseudonyms()?
            .iter()
            .any(|r| r.local_pseudonym == local_pseudonym)
        {
            return Ok(false);
        }
        let now = self.now();
        let mut txn = StoreTxn::new(self.kv.as_mut());
        txn.append(
            &t_select_star(),
            now,
            false,
            &SelectStarPseudonymRecord {
                local_pseudonym: local_pseudonym.to_vec(),
                polymorphic_pseudonym: polymorphic_pseudonym.to_vec(),
            },
        )?;
        txn.commit()?;
        Ok(true)
    }

    // =========================================================================
    // STARTUP TASKS
    // =========================================================================

    /// Removes access rules and memberships whose referenced column, group
    /// or participant group was tombstoned.
    fn remove_orphaned_records(&mut self) -> Result<(), PepError> {
        let now = self.now();
        let pgars = self.participant_group_access_rules_at(None)?;
        let cgars = self.column_group_access_rules_at(None)?;
        let cgcs = self.column_group_columns_at(None)?;
        let pgps = self.participant_memberships_at(None)?;
        let live_participant_groups: BTreeSet<String> =
            self.participant_groups_at(None)?.into_iter().collect();
        let live_column_groups: BTreeSet<String> =
            self.column_groups_at(None)?.into_iter().collect();
        let live_columns: BTreeSet<String> = self.columns_at(None)?.into_iter().collect();

        let mut txn = StoreTxn::new(self.kv.as_mut());
        let mut removed = 0usize;
        for rule in pgars {
            let exists = rule.participant_group == UNIVERSAL_GROUP
                || live_participant_groups.contains(&rule.participant_group);
            if !exists {
                warn!(
                    group = rule.participant_group.as_str(),
                    user_group = rule.user_group.as_str(),
                    mode = %rule.mode,
                    "removing access rule of removed participant-group"
                );
                txn.append(&t_pgars(), now, true, &rule)?;
                removed += 1;
            }
        }
        for rule in cgars {
            let exists = rule.column_group == UNIVERSAL_GROUP
                || live_column_groups.contains(&rule.column_group);
            if !exists {
                warn!(
                    group = rule.column_group.as_str(),
                    user_group = rule.user_group.as_str(),
                    mode = %rule.mode,
                    "removing access rule of removed column-group"
                );
                txn.append(&t_cgars(), now, true, &rule)?;
                removed += 1;
            }
        }
        for membership in cgcs {
            let group_ok = live_column_groups.contains(&membership.column_group);
            let column_ok = live_columns.contains(&membership.column);
            if !group_ok || !column_ok {
                warn!(
                    column = membership.column.as_str(),
                    group = membership.column_group.as_str(),
                    "removing orphaned column-group membership"
                );
                txn.append(&t_column_group_columns(), now, true, &membership)?;
                removed += 1;
            }
        }
        for membership in pgps {
            if !live_participant_groups.contains(&membership.participant_group) {
                warn!(
                    group = membership.participant_group.as_str(),
                    "removing orphaned participant-group membership"
                );
                txn.append(&t_participant_group_participants(), now, true, &membership)?;
                removed += 1;
            }
        }
        txn.commit()?;
        if removed > 0 {
            info!(removed, "orphan sweep finished");
        }
        Ok(())
    }

    /// One-time migration rewriting legacy length-variable pseudonym
    /// encodings to the fixed-length packed form. A backup of the database
    /// file is made first; the rewrite runs in a single transaction and
    /// preserves every record's seqno and checksum nonce.
    fn migrate_pseudonym_serialization(&mut self) -> Result<(), PepError> {
        let select_star = self.scan_sorted::<SelectStarPseudonymRecord>(&t_select_star())?;
        let memberships = self
            .scan_sorted::<ParticipantGroupParticipantRecord>(&t_participant_group_participants())?;
        let any_legacy = select_star.iter().any(|r| r.payload.is_legacy())
            || memberships.iter().any(|r| r.payload.is_legacy());
        if !any_legacy {
            return Ok(());
        }

        if let Some(path) = &self.db_path {
            let mut backup = path.as_os_str().to_owned();
            backup.push(MIGRATION_BACKUP_SUFFIX);
            let backup = PathBuf::from(backup);
            if backup.exists() {
                return Err(PepError::fatal(format!(
                    "migration backup {} already exists",
                    backup.display()
                )));
            }
            std::fs::copy(path, &backup)
                .map_err(|e| PepError::fatal(format!("migration backup failed: {e}")))?;
            info!(backup = %backup.display(), "wrote pre-migration backup");
        }

        info!("re-serializing local and polymorphic pseudonyms to packed form");
        let mut txn = StoreTxn::new(self.kv.as_mut());
        for mut record in select_star {
            if !record.payload.is_legacy() {
                continue;
            }
            record.payload = normalize_select_star(record.payload);
            txn.overwrite(&t_select_star(), &record)?;
        }
        for mut record in memberships {
            if !record.payload.is_legacy() {
                continue;
            }
            record.payload = normalize_membership(record.payload);
            txn.overwrite(&t_participant_group_participants(), &record)?;
        }
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
        for record in table.scan::<P>(self.kv.as_ref())? {
            acc.absorb(record.seqno, record.contribution()?, max_checkpoint);
        }
        Ok(acc.value())
    }

    fn compute_select_star_chain(
        &self,
        version: u8,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        let mut acc = ChainAccumulator::new();
        for record in t_select_star().scan::<SelectStarPseudonymRecord>(self.kv.as_ref())? {
            let repr = if version == 1 {
                legacy_select_star(record.payload.clone())
            } else {
                normalize_select_star(record.payload.clone())
            };
            let mut bytes = bincode::serialize(&repr)?;
            bytes.push(record.tombstone as u8);
            let contribution = record_contribution(&bytes, record.checksum_nonce);
            acc.absorb(record.seqno, contribution, max_checkpoint);
        }
        Ok(acc.value())
    }

    fn compute_membership_chain(
        &self,
        version: u8,
        max_checkpoint: Option<u64>,
    ) -> Result<ChecksumValue, PepError> {
        let mut acc = ChainAccumulator::new();
        for record in t_participant_group_participants()
            .scan::<ParticipantGroupParticipantRecord>(self.kv.as_ref())?
        {
            let repr = if version == 1 {
                legacy_membership(record.payload.clone())
            } else {
                normalize_membership(record.payload.clone())
            };
            let mut bytes = bincode::serialize(&repr)?;
            bytes.push(record.tombstone as u8);
            let contribution = record_contribution(&bytes, record.checksum_nonce);
            acc.absorb(record.seqno, contribution, max_checkpoint);
        }
        Ok(acc.value())
    }
}

fn normalize_select_star(mut payload: SelectStarPseudonymRecord) -> SelectStarPseudonymRecord {
    if payload.is_legacy() {
        if let Some(lp) = from_legacy_encoding(&payload.local_pseudonym) {
            payload.local_pseudonym = lp;
        }
        if let Some(pp) = from_legacy_encoding(&payload.polymorphic_pseudonym) {
            payload.polymorphic_pseudonym = pp;
        }
    }
    payload
}

fn legacy_select_star(mut payload: SelectStarPseudonymRecord) -> SelectStarPseudonymRecord {
    if !payload.is_legacy() {
        payload.local_pseudonym = to_legacy_encoding(&payload.local_pseudonym);
        payload.polymorphic_pseudonym = to_legacy_encoding(&payload.polymorphic_pseudonym);
    }
    payload
}

fn normalize_membership(
    mut payload: ParticipantGroupParticipantRecord,
) -> ParticipantGroupParticipantRecord {
    if payload.is_legacy() {
        if let Some(lp) = from_legacy_encoding(&payload.local_pseudonym) {
            payload.local_pseudonym = lp;
        }
    }
    payload
}

fn legacy_membership(
    mut payload: ParticipantGroupParticipantRecord,
) -> ParticipantGroupParticipantRecord {
    if !payload.is_legacy() {
        payload.local_pseudonym = to_legacy_encoding(&payload.local_pseudonym);
    }
    payload
}

impl HasChecksumChains for PolicyStore {
    fn checksum_chain_names(&self) -> Vec<String> {
        [
            "select-start-pseud",
            "select-start-pseud-v2",
            "participant-groups",
            "participant-group-participants",
            "participant-group-participants-v2",
            "column-groups",
            "columns",
            "column-group-columns",
            "column-group-accessrule",
            "group-accessrule",
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
            "select-start-pseud" => self.compute_select_star_chain(1, max_checkpoint),
            "select-start-pseud-v2" => self.compute_select_star_chain(2, max_checkpoint),
            "participant-groups" => self
                .compute_simple_chain::<ParticipantGroupRecord>(&t_participant_groups(), max_checkpoint),
            "participant-group-participants" => self.compute_membership_chain(1, max_checkpoint),
            "participant-group-participants-v2" => self.compute_membership_chain(2, max_checkpoint),
            "column-groups" => {
                self.compute_simple_chain::<ColumnGroupRecord>(&t_column_groups(), max_checkpoint)
            }
            "columns" => self.compute_simple_chain::<ColumnRecord>(&t_columns(), max_checkpoint),
            "column-group-columns" => self.compute_simple_chain::<ColumnGroupColumnRecord>(
                &t_column_group_columns(),
                max_checkpoint,
            ),
            "column-group-accessrule" => self
                .compute_simple_chain::<ColumnGroupAccessRuleRecord>(&t_cgars(), max_checkpoint),
            "group-accessrule" => self.compute_simple_chain::<ParticipantGroupAccessRuleRecord>(
                &t_pgars(),
                max_checkpoint,
            ),
            other => Err(PepError::not_found(format!("checksum chain {other:?}"))),
        }
    }
}

impl PolicyStore {
    /// Checks that `user_group` may access the participant behind
    /// `local_pseudonym`: some participant group accessible to the user
    /// group (the universal group included) must contain it.
    pub fn assert_participant_access(
        &self,
        local_pseudonym: &[u8],
        user_group: &str,
        at: Option<Timestamp>,
    ) -> Result<(), PepError> {
        if user_group == user_groups::DATA_ADMIN {
            return Ok(());
        }
        for rule in self.participant_group_access_rules_at(at)? {
            if rule.user_group != user_group || rule.mode != ParticipantAccessMode::Access {
                continue;
            }
            if rule.participant_group == UNIVERSAL_GROUP {
                return Ok(());
            }
            if self
                .participants_in_group(&rule.participant_group, at)?
                .iter()
                .any(|lp| lp == local_pseudonym)
            {
                return Ok(());
            }
        }
        Err(PepError::access_denied(format!(
            "user group {user_group:?} may not access this participant"
        )))
    }

    /// Unfolds explicit columns plus column groups into a deduplicated
    /// column list, preserving first-seen order.
    pub fn unfold_columns(
        &self,
        columns: &[String],
        column_groups: &[String],
        at: Option<Timestamp>,
    ) -> Result<Vec<String>, PepError> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for column in columns {
            if seen.insert(column.clone()) {
                out.push(column.clone());
            }
        }
        for group in column_groups {
            for column in self.columns_in_group(group, at)? {
                if seen.insert(column.clone()) {
                    out.push(column);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pep_types::InMemoryKvStore;

    fn fresh() -> PolicyStore {
        PolicyStore::open(
            Box::new(InMemoryKvStore::new()),
            None,
            Arc::new(pep_types::SystemTimeSource),
        )
        .unwrap()
    }

    #[test]
    fn column_lifecycle() {
        let mut store = fresh();
        store.create_column("Age").unwrap();
        assert!(store.has_column("Age", None).unwrap());
        assert_eq!(
            store.create_column("Age").unwrap_err().kind,
            pep_types::ErrorKind::Conflict
        );
        store.remove_column("Age").unwrap();
        assert!(!store.has_column("Age", None).unwrap());
        assert_eq!(
            store.remove_column("Age").unwrap_err().kind,
            pep_types::ErrorKind::NotFound
        );
    }

    #[test]
    fn point_in_time_views_replay_tombstones() {
        let mut store = fresh();
        store.create_column("Age").unwrap();
        let before_removal = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.remove_column("Age").unwrap();
        assert!(store.has_column("Age", Some(before_removal)).unwrap());
        assert!(!store.has_column("Age", None).unwrap());
    }

    #[test]
    fn universal_group_unfolds_to_all_columns() {
        let mut store = fresh();
        store.create_column("A").unwrap();
        store.create_column("B").unwrap();
        let cols = store.columns_in_group(UNIVERSAL_GROUP, None).unwrap();
        assert_eq!(cols, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn force_remove_column_group_cascades() {
        let mut store = fresh();
        store.create_column("Age").unwrap();
        store.create_column_group("Clin").unwrap();
        store.add_column_to_group("Age", "Clin").unwrap();
        store
            .create_column_group_access_rule("Clin", "Researcher", AccessMode::Read)
            .unwrap();

        // Non-forced removal refuses while members or rules remain.
        assert_eq!(
            store.remove_column_group("Clin", false).unwrap_err().kind,
            pep_types::ErrorKind::Conflict
        );
        store.remove_column_group("Clin", true).unwrap();
        assert!(!store.has_column_group("Clin", None).unwrap());
        assert!(store.column_group_columns_at(None).unwrap().is_empty());
        assert!(store.column_group_access_rules_at(None).unwrap().is_empty());
    }

    #[test]
    fn explicit_data_admin_rules_are_invalid() {
        let mut store = fresh();
        store.create_column_group("Clin").unwrap();
        store.create_participant_group("Cohort").unwrap();
        let err = store
            .create_column_group_access_rule("Clin", user_groups::DATA_ADMIN, AccessMode::ReadMeta)
            .unwrap_err();
        assert_eq!(err.kind, pep_types::ErrorKind::Invalid);
        let err = store
            .create_participant_group_access_rule(
                "Cohort",
                user_groups::DATA_ADMIN,
                ParticipantAccessMode::Access,
            )
            .unwrap_err();
        assert_eq!(err.kind, pep_types::ErrorKind::Invalid);
        // Other Data-Admin CGAR modes remain allowed.
        store
            .create_column_group_access_rule("Clin", user_groups::DATA_ADMIN, AccessMode::Write)
            .unwrap();
    }

    #[test]
    fn data_admin_has_implicit_access() {
        let store = fresh();
        assert!(store
            .has_column_group_access("anything", user_groups::DATA_ADMIN, AccessMode::ReadMeta, None)
            .unwrap());
        assert!(store
            .has_participant_group_access(
                "anything",
                user_groups::DATA_ADMIN,
                ParticipantAccessMode::Enumerate,
                None
            )
            .unwrap());
    }

    #[test]
    fn mode_implication_in_rules() {
        let mut store = fresh();
        store.create_column_group("Clin").unwrap();
        store
            .create_column_group_access_rule("Clin", "Researcher", AccessMode::Read)
            .unwrap();
        assert!(store
            .has_column_group_access("Clin", "Researcher", AccessMode::ReadMeta, None)
            .unwrap());
        assert!(!store
            .has_column_group_access("Clin", "Researcher", AccessMode::Write, None)
            .unwrap());
    }

    #[test]
    fn column_name_mapping_crud() {
        let mut store = fresh();
        store.create_column_name_mapping("Age", "age_years").unwrap();
        assert_eq!(
            store.column_name_mappings().unwrap(),
            vec![ColumnNameMappingRecord {
                original: "Age".into(),
                mapped: "age_years".into()
            }]
        );
        assert_eq!(
            store
                .create_column_name_mapping("Age", "other")
                .unwrap_err()
                .kind,
            pep_types::ErrorKind::Conflict
        );
        // Idempotent update.
        store.update_column_name_mapping("Age", "age_years").unwrap();
        store.update_column_name_mapping("Age", "age").unwrap();
        assert_eq!(store.column_name_mappings().unwrap()[0].mapped, "age");
        store.delete_column_name_mapping("Age").unwrap();
        assert!(store.column_name_mappings().unwrap().is_empty());
        assert_eq!(
            store.delete_column_name_mapping("Age").unwrap_err().kind,
            pep_types::ErrorKind::NotFound
        );
    }

    #[test]
    fn checksum_chain_agrees_across_creation_orders() {
        let mut a = fresh();
        let mut b = fresh();
        for name in ["A", "B", "C"] {
            a.create_column(name).unwrap();
        }
        for name in ["B", "A", "C"] {
            b.create_column(name).unwrap();
        }
        let ca = a.compute_checksum_chain("columns", None).unwrap();
        let cb = b.compute_checksum_chain("columns", None).unwrap();
        assert_eq!(ca.checksum, cb.checksum);
    }

    #[test]
    fn checksum_checkpoint_cuts() {
        let mut store = fresh();
        store.create_column("A").unwrap();
        store.create_column("B").unwrap();
        let full = store.compute_checksum_chain("columns", None).unwrap();
        let cut = store.compute_checksum_chain("columns", Some(1)).unwrap();
        assert_ne!(full.checksum, cut.checksum);
        assert_eq!(cut.checksum, 0);
    }

    #[test]
    fn orphan_sweep_removes_stale_rules() {
        let mut kv = Box::new(InMemoryKvStore::new());
        // Build a state with a rule whose group is tombstoned, bypassing
        // the cascade (simulating a legacy database).
        {
            let now = Timestamp::now();
            let mut txn = StoreTxn::new(kv.as_mut());
            txn.append(
                &t_participant_groups(),
                now,
                false,
                &ParticipantGroupRecord { name: "G".into() },
            )
            .unwrap();
            txn.append(
                &t_pgars(),
                now,
                false,
                &ParticipantGroupAccessRuleRecord {
                    participant_group: "G".into(),
                    user_group: "Researcher".into(),
                    mode: ParticipantAccessMode::Access,
                },
            )
            .unwrap();
            txn.append(
                &t_participant_groups(),
                Timestamp(now.0 + 1),
                true,
                &ParticipantGroupRecord { name: "G".into() },
            )
            .unwrap();
            txn.commit().unwrap();
        }
        let store =
            PolicyStore::open(kv, None, Arc::new(pep_types::SystemTimeSource)).unwrap();
        assert!(store
            .participant_group_access_rules_at(None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reserialization_migration_preserves_v1_checksums() {
        let mut kv = Box::new(InMemoryKvStore::new());
        let lp = [3u8; 32];
        let pp = [5u8; 96];
        {
            let now = Timestamp::now();
            let mut txn = StoreTxn::new(kv.as_mut());
            txn.append(
                &t_select_star(),
                now,
                false,
                &SelectStarPseudonymRecord {
                    local_pseudonym: to_legacy_encoding(&lp),
                    polymorphic_pseudonym: to_legacy_encoding(&pp),
                },
            )
            .unwrap();
            txn.append(
                &t_participant_group_participants(),
                now,
                false,
                &ParticipantGroupParticipantRecord {
                    local_pseudonym: to_legacy_encoding(&lp),
                    participant_group: "G".into(),
                },
            )
            .unwrap();
            txn.commit().unwrap();
        }
        // Pre-migration v1 checksums.
        let before = {
            let probe = PolicyStore {
                kv,
                db_path: None,
                time: Arc::new(pep_types::SystemTimeSource),
            };
            let ss = probe.compute_checksum_chain("select-start-pseud", None).unwrap();
            let pgp = probe
                .compute_checksum_chain("participant-group-participants", None)
                .unwrap();
            (ss, pgp, probe.kv)
        };
        let store = PolicyStore::open(before.2, None, Arc::new(pep_types::SystemTimeSource))
            .unwrap();
        // Migration happened.
        let records = store.select_star_pseudonyms().unwrap();
        assert_eq!(records[0].local_pseudonym, lp.to_vec());
        assert_eq!(records[0].polymorphic_pseudonym, pp.to_vec());
        // v1 chains are bit-exact.
        assert_eq!(
            store.compute_checksum_chain("select-start-pseud", None).unwrap(),
            before.0
        );
        assert_eq!(
            store
                .compute_checksum_chain("participant-group-participants", None)
                .unwrap(),
            before.1
        );
        // v2 chains cover the packed form and are defined.
        store
            .compute_checksum_chain("select-start-pseud-v2", None)
            .unwrap();
    }

    #[test]
    fn select_star_skips_duplicates() {
        let mut store = fresh();
        let lp = [1u8; 32];
        let pp = [2u8; 96];
        assert!(store.store_select_star_pseudonym(&lp, &pp).unwrap());
        assert!(!store.store_select_star_pseudonym(&lp, &pp).unwrap());
        assert_eq!(store.select_star_pseudonyms().unwrap().len(), 1);
    }

    #[test]
    fn unfold_preserves_order_and_dedups() {
        let mut store = fresh();
        for c in ["A", "B", "C"] {
            store.create_column(c).unwrap();
        }
        store.create_column_group("G").unwrap();
        store.add_column_to_group("B", "G").unwrap();
        store.add_column_to_group("C", "G").unwrap();
        let cols = store
            .unfold_columns(&["C".into()], &["G".into()], None)
            .unwrap();
        assert_eq!(cols, vec!["C".to_string(), "B".to_string()]);
    }
}
