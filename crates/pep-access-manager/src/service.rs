//! # Access Manager Service
//!
//! The server struct composing the policy store, the signing identity, the
//! key material and the outbound Transcryptor stub. The select-star
//! pseudonym cache is loaded once at startup and only mutated by the
//! ticket pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use pep_curve::{GroupElement, Scalar};
use pep_crypto::MasterSecret;
use pep_types::messages::StructureMetadataEntry;
use pep_types::{
    ChecksumValue, HasChecksumChains, Identity, PepError, RootCas, TimeSource, TranscryptorClient,
    WorkerPool,
};

use crate::storage::PolicyStore;

/// Static configuration of an Access Manager instance.
pub struct AccessManagerConfig {
    /// The platform-wide configuration blob served to clients.
    pub global_config: serde_json::Value,
    /// Structure-metadata entries served as a stream.
    pub structure_metadata: Vec<StructureMetadataEntry>,
}

impl Default for AccessManagerConfig {
    fn default() -> Self {
        AccessManagerConfig {
            global_config: serde_json::json!({}),
            structure_metadata: Vec::new(),
        }
    }
}

/// The Access Manager server.
pub struct AccessManager {
    pub(crate) store: Mutex<PolicyStore>,
    pub(crate) identity: Identity,
    pub(crate) root_cas: RootCas,
    /// The AM's pseudonym key share: decrypts AM-translated pseudonyms.
    pub(crate) pseudonym_secret: Scalar,
    /// The master pseudonym public key polymorphic pseudonyms target.
    pub(crate) master_public_key: GroupElement,
    /// Master secret for per-cell data-key blinding.
    pub(crate) blinding_master: MasterSecret,
    pub(crate) transcryptor: Arc<dyn TranscryptorClient>,
    pub(crate) worker: WorkerPool,
    /// Local pseudonym (AM side) to packed polymorphic pseudonym.
    pub(crate) pp_cache: Mutex<HashMap<[u8; 32], [u8; 96]>>,
    pub(crate) config: AccessManagerConfig,
    pub(crate) time: Arc<dyn TimeSource>,
}

impl AccessManager {
    /// Assembles the server and loads the select-star cache.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: PolicyStore,
        identity: Identity,
        root_cas: RootCas,
        pseudonym_secret: Scalar,
        master_public_key: GroupElement,
        blinding_master: MasterSecret,
        transcryptor: Arc<dyn TranscryptorClient>,
        config: AccessManagerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<AccessManager>, PepError> {
        info!("caching select-star pseudonym list");
        let mut cache = HashMap::new();
        for record in store.select_star_pseudonyms()? {
            let (lp, pp) = Self::cache_entry(&record.local_pseudonym, &record.polymorphic_pseudonym)?;
            cache.insert(lp, pp);
        }
        info!(pseudonyms = cache.len(), "ready to accept requests");
        Ok(Arc::new(AccessManager {
            store: Mutex::new(store),
            identity,
            root_cas,
            pseudonym_secret,
            master_public_key,
            blinding_master,
            transcryptor,
            worker: WorkerPool::new(),
            pp_cache: Mutex::new(cache),
            config,
            time,
        }))
    }

    fn cache_entry(lp: &[u8], pp: &[u8]) -> Result<([u8; 32], [u8; 96]), PepError> {
        let lp: [u8; 32] = lp
            .try_into()
            .map_err(|_| PepError::fatal("select-star record with unpacked local pseudonym"))?;
        let pp: [u8; 96] = pp
            .try_into()
            .map_err(|_| PepError::fatal("select-star record with unpacked pseudonym"))?;
        Ok((lp, pp))
    }

    /// The checksum chain names of the policy store.
    pub async fn checksum_chain_names(&self) -> Vec<String> {
        self.store.lock().await.checksum_chain_names()
    }

    /// Computes one policy checksum chain.
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
}
