//! # Client Stubs
//!
//! The outbound RPC surfaces between servers, expressed as async traits so
//! the servers compose without type-level cycles: the Access Manager holds
//! a `TranscryptorClient`, nothing holds a reference back.

use async_trait::async_trait;

use pep_crypto::{KeyDomain, TranslationVerifiers};

use crate::error::PepError;
use crate::messages::{
    LogIssuedTicketRequest, LogIssuedTicketResponse, RekeyRequest, RekeyResponse,
    TranscryptorRequest, TranscryptorRequestEntries, TranscryptorResponse,
};

/// Outbound surface of the Transcryptor, as seen from the Access Manager.
#[async_trait]
pub trait TranscryptorClient: Send + Sync {
    /// Submits a translation request; `batches` is the tail stream of
    /// entry batches (each at most 400 entries).
    async fn translate(
        &self,
        request: TranscryptorRequest,
        batches: Vec<TranscryptorRequestEntries>,
    ) -> Result<TranscryptorResponse, PepError>;

    /// Requests the co-signature for an issued ticket.
    async fn log_issued_ticket(
        &self,
        request: LogIssuedTicketRequest,
    ) -> Result<LogIssuedTicketResponse, PepError>;

    /// Data-key translation for the unblind path.
    async fn rekey(&self, request: RekeyRequest) -> Result<RekeyResponse, PepError>;

    /// The published commitments to a recipient's translation factors.
    async fn translation_verifiers(
        &self,
        domain: KeyDomain,
        recipient: String,
    ) -> Result<TranslationVerifiers, PepError>;
}
