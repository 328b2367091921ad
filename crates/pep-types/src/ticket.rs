//! # Tickets
//!
//! The authorization token of the platform: a `Ticket2` binds a timestamp,
//! a mode set, a column set, the per-party local-pseudonym translations and
//! the requesting user group. A `SignedTicket2` adds the Access Manager
//! signature and the Transcryptor co-signature; it is only usable after
//! `open` verifies both against the shared root CAs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use pep_crypto::{PackedElGamal, TranslationProof};

use crate::error::PepError;
use crate::identity::{verify_domain, CertificateChain, Identity, RootCas};
use crate::modes::AccessMode;
use crate::timestamp::Timestamp;

const AM_TICKET_DOMAIN: &[u8] = b"pep.ticket.am";
const TS_TICKET_DOMAIN: &[u8] = b"pep.ticket.ts";

/// The translations of one participant's polymorphic pseudonym for each
/// party in the triangle, with the Transcryptor's proofs of correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PseudonymTriple {
    /// The rerandomized polymorphic pseudonym the translations start from.
    pub polymorphic: PackedElGamal,
    /// Translation toward the Access Manager.
    pub access_manager: PackedElGamal,
    /// Translation toward the Storage Facility.
    pub storage_facility: PackedElGamal,
    /// Translation toward the Transcryptor itself.
    pub transcryptor: PackedElGamal,
    /// Translation toward the requesting user group, when requested.
    pub user: Option<PackedElGamal>,
    /// Per-party certified-translation proofs, in the same order as the
    /// fields above (user last, when present).
    pub proofs: Vec<TranslationProof>,
}

/// The inner authorization token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket2 {
    pub timestamp: Timestamp,
    pub modes: Vec<AccessMode>,
    pub columns: Vec<String>,
    pub pseudonyms: Vec<PseudonymTriple>,
    pub user_group: String,
}

impl Ticket2 {
    /// Whether the ticket grants `mode`, honoring mode implication.
    pub fn grants(&self, mode: AccessMode) -> bool {
        self.modes.iter().any(|m| m.implies(mode))
    }

    /// Index of a column in the ticket's column list.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// A ticket with the Access Manager signature and the Transcryptor
/// co-signature.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTicket2 {
    /// Serialized `Ticket2`.
    pub data: Vec<u8>,
    #[serde_as(as = "serde_with::Bytes")]
    pub am_signature: [u8; 64],
    #[serde_as(as = "serde_with::Bytes")]
    pub ts_signature: [u8; 64],
    pub am_chain: CertificateChain,
    pub ts_chain: CertificateChain,
}

impl SignedTicket2 {
    /// Serializes and signs a ticket with the Access Manager identity; the
    /// Transcryptor co-signature is attached afterwards.
    pub fn issue(ticket: &Ticket2, am_identity: &Identity) -> Result<SignedTicket2, PepError> {
        let data = bincode::serialize(ticket)?;
        let am_signature = am_identity.sign_domain(AM_TICKET_DOMAIN, &data);
        Ok(SignedTicket2 {
            data,
            am_signature,
            ts_signature: [0u8; 64],
            am_chain: am_identity.chain().clone(),
            ts_chain: CertificateChain::default(),
        })
    }

    /// The message the Transcryptor co-signs: ticket bytes bound to the
    /// Access Manager signature.
    pub fn cosign_message(&self) -> Vec<u8> {
        let mut message = self.data.clone();
        message.extend_from_slice(&self.am_signature);
        message
    }

    /// Attaches the Transcryptor co-signature.
    pub fn attach_cosignature(&mut self, signature: [u8; 64], ts_chain: CertificateChain) {
        self.ts_signature = signature;
        self.ts_chain = ts_chain;
    }

    /// Produces the Transcryptor co-signature for this ticket.
    pub fn cosign(&self, ts_identity: &Identity) -> [u8; 64] {
        ts_identity.sign_domain(TS_TICKET_DOMAIN, &self.cosign_message())
    }

    /// Deserializes the inner ticket without verifying anything. For
    /// servers that already trust their own storage.
    pub fn peek(&self) -> Result<Ticket2, PepError> {
        Ok(bincode::deserialize(&self.data)?)
    }

    /// Verifies only the issuer (Access Manager) chain and signature; used
    /// by the Transcryptor before the co-signature exists.
    pub fn verify_issuer(&self, root_cas: &RootCas) -> Result<Ticket2, PepError> {
        let am_key = self.am_chain.verify(root_cas)?;
        verify_domain(&am_key, AM_TICKET_DOMAIN, &self.data, &self.am_signature)?;
        Ok(bincode::deserialize(&self.data)?)
    }

    /// Verifies both signatures and chains, checks the user-group binding
    /// and (optionally) a required mode, and returns the inner ticket.
    pub fn open(
        &self,
        root_cas: &RootCas,
        user_group: &str,
        required_mode: Option<AccessMode>,
    ) -> Result<Ticket2, PepError> {
        let am_key = self.am_chain.verify(root_cas)?;
        verify_domain(&am_key, AM_TICKET_DOMAIN, &self.data, &self.am_signature)?;

        let ts_key = self.ts_chain.verify(root_cas)?;
        verify_domain(
            &ts_key,
            TS_TICKET_DOMAIN,
            &self.cosign_message(),
            &self.ts_signature,
        )?;

        let ticket: Ticket2 = bincode::deserialize(&self.data)?;
        if ticket.user_group != user_group {
            return Err(PepError::access_denied(format!(
                "ticket was issued to user group {:?}",
                ticket.user_group
            )));
        }
        if let Some(mode) = required_mode {
            if !ticket.grants(mode) {
                return Err(PepError::access_denied(format!(
                    "ticket does not grant mode {mode}"
                )));
            }
        }
        Ok(ticket)
    }
}

/// A signed ticket bundled with the group-to-index maps, so the client can
/// locate columns and participants in the ticket's arrays without asking
/// the servers again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedTicket2 {
    pub ticket: SignedTicket2,
    /// Column-group name to indices into `ticket.columns`.
    pub column_group_map: HashMap<String, Vec<usize>>,
    /// Participant-group name to indices into `ticket.pseudonyms`.
    pub participant_group_map: HashMap<String, Vec<usize>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityAuthority;
    use crate::modes::parties;

    fn ticket(modes: Vec<AccessMode>, user_group: &str) -> Ticket2 {
        Ticket2 {
            timestamp: Timestamp(1_000),
            modes,
            columns: vec!["Age".to_string()],
            pseudonyms: Vec::new(),
            user_group: user_group.to_string(),
        }
    }

    fn signed(authority: &IdentityAuthority, inner: &Ticket2) -> SignedTicket2 {
        let am = authority
            .issue(parties::ACCESS_MANAGER, None)
            .unwrap();
        let ts = authority.issue(parties::TRANSCRYPTOR, None).unwrap();
        let mut st = SignedTicket2::issue(inner, &am).unwrap();
        let cosig = st.cosign(&ts);
        st.attach_cosignature(cosig, ts.chain().clone());
        st
    }

    #[test]
    fn open_round_trips() {
        let authority = IdentityAuthority::new("CA").unwrap();
        let inner = ticket(vec![AccessMode::Read], "Researcher");
        let st = signed(&authority, &inner);
        let opened = st
            .open(&authority.root_cas(), "Researcher", Some(AccessMode::Read))
            .unwrap();
        assert_eq!(opened, inner);
    }

    #[test]
    fn missing_mode_rejected() {
        let authority = IdentityAuthority::new("CA").unwrap();
        let st = signed(&authority, &ticket(vec![AccessMode::Read], "Researcher"));
        let err = st
            .open(&authority.root_cas(), "Researcher", Some(AccessMode::Write))
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AccessDenied);
    }

    #[test]
    fn read_implies_read_meta() {
        let authority = IdentityAuthority::new("CA").unwrap();
        let st = signed(&authority, &ticket(vec![AccessMode::Read], "Researcher"));
        assert!(st
            .open(
                &authority.root_cas(),
                "Researcher",
                Some(AccessMode::ReadMeta)
            )
            .is_ok());
    }

    #[test]
    fn wrong_user_group_rejected() {
        let authority = IdentityAuthority::new("CA").unwrap();
        let st = signed(&authority, &ticket(vec![AccessMode::Read], "Researcher"));
        assert!(st
            .open(&authority.root_cas(), "Assessor", None)
            .is_err());
    }

    #[test]
    fn missing_cosignature_rejected() {
        let authority = IdentityAuthority::new("CA").unwrap();
        let am = authority.issue(parties::ACCESS_MANAGER, None).unwrap();
        let st = SignedTicket2::issue(&ticket(vec![AccessMode::Read], "R"), &am).unwrap();
        assert!(st.open(&authority.root_cas(), "R", None).is_err());
    }

    #[test]
    fn tampered_ticket_rejected() {
        let authority = IdentityAuthority::new("CA").unwrap();
        let mut st = signed(&authority, &ticket(vec![AccessMode::Read], "Researcher"));
        let mut inner: Ticket2 = st.peek().unwrap();
        inner.modes.push(AccessMode::Write);
        st.data = bincode::serialize(&inner).unwrap();
        assert!(st.open(&authority.root_cas(), "Researcher", None).is_err());
    }
}
