//! # Encryption-Key Rekeying
//!
//! Blinds polymorphic data keys for writes and unblinds-and-translates
//! them for reads, justified solely by an opened ticket. The blinding
//! factor is bound to the cell coordinates, so a data key never leaves the
//! Access Manager in a cell-independent form.

use std::collections::HashMap;

use tracing::debug;

use pep_crypto::blinding::{blind, blinding_factor, unblind};
use pep_crypto::PackedElGamal;
use pep_types::messages::{
    EncryptionKeyEntry, EncryptionKeyResponse, KeyRequestDirection, RekeyRequest,
    SignedEncryptionKeyRequest,
};
use pep_types::{AccessMode, PepError, Ticket2};

use crate::service::AccessManager;

impl AccessManager {
    /// Handles a `SignedEncryptionKeyRequest`: per-entry BLIND or UNBLIND
    /// under the authority of the embedded ticket.
    pub async fn handle_encryption_key_request(
        &self,
        signed: SignedEncryptionKeyRequest,
    ) -> Result<EncryptionKeyResponse, PepError> {
        let request = signed.open(&self.root_cas)?;
        let user_group = signed
            .claimed_user_group()
            .ok_or_else(|| PepError::access_denied("requester has no user group"))?
            .to_string();
        let ticket = request.ticket.open(&self.root_cas, &user_group, None)?;

        for entry in &request.entries {
            validate_entry(&ticket, entry)?;
        }

        // The blinding factor needs the stable local pseudonym of each
        // referenced participant.
        let lps = self
            .decrypt_local_pseudonyms(&ticket.pseudonyms)
            .await?;

        // Unblind entries round-trip through the Transcryptor first, so
        // that the returned key already lives in the requester's domain.
        let unblind_keys: Vec<PackedElGamal> = request
            .entries
            .iter()
            .filter(|e| e.direction == KeyRequestDirection::Unblind)
            .map(|e| e.polymorphic_key)
            .collect();
        let mut translated: HashMap<usize, PackedElGamal> = HashMap::new();
        if !unblind_keys.is_empty() {
            debug!(keys = unblind_keys.len(), "forwarding rekey request");
            let response = self
                .transcryptor
                .rekey(RekeyRequest {
                    recipient: user_group.clone(),
                    keys: unblind_keys,
                })
                .await?;
            let mut returned = response.keys.into_iter();
            for (index, entry) in request.entries.iter().enumerate() {
                if entry.direction == KeyRequestDirection::Unblind {
                    let key = returned.next().ok_or_else(|| {
                        PepError::transient("rekey response returned too few keys")
                    })?;
                    translated.insert(index, key);
                }
            }
        }

        let mut keys = Vec::with_capacity(request.entries.len());
        for (index, entry) in request.entries.iter().enumerate() {
            let lp = lps
                .get(entry.pseudonym_index)
                .ok_or_else(|| PepError::invalid("pseudonym index out of range"))?;
            let factor = blinding_factor(
                &self.blinding_master,
                &entry.column,
                lp,
                entry.blinding_timestamp.millis(),
            );
            let rekeyed = match entry.direction {
                KeyRequestDirection::Blind => blind(&entry.polymorphic_key.unpack()?, &factor),
                KeyRequestDirection::Unblind => {
                    let key = translated
                        .get(&index)
                        .ok_or_else(|| PepError::transient("missing translated key"))?;
                    unblind(&key.unpack()?, &factor)
                }
            };
            keys.push(rekeyed.pack());
        }
        Ok(EncryptionKeyResponse { keys })
    }
}

fn validate_entry(ticket: &Ticket2, entry: &EncryptionKeyEntry) -> Result<(), PepError> {
    if entry.pseudonym_index >= ticket.pseudonyms.len() {
        return Err(PepError::invalid("pseudonym index out of range"));
    }
    if ticket.column_index(&entry.column).is_none() {
        return Err(PepError::access_denied(format!(
            "ticket does not cover column {:?}",
            entry.column
        )));
    }
    let required = match entry.direction {
        KeyRequestDirection::Blind => AccessMode::Write,
        KeyRequestDirection::Unblind => AccessMode::Read,
    };
    if !ticket.grants(required) {
        return Err(PepError::access_denied(format!(
            "ticket does not grant {required} for this key operation"
        )));
    }
    Ok(())
}
