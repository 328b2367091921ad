//! # Opaque Cell Ids
//!
//! Every externally visible id is an authenticated encryption of the cell
//! coordinates and entry timestamp under the Storage Facility's symmetric
//! id key. Clients shuttle ids around; only the Storage Facility can look
//! inside, and a tampered id fails authentication instead of resolving to
//! the wrong cell.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use pep_types::{PepError, Timestamp};

use crate::store::CellKey;

const NONCE_LEN: usize = 24;

/// The Storage Facility's symmetric id key.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct IdKey([u8; 32]);

impl IdKey {
    pub fn from_bytes(bytes: [u8; 32]) -> IdKey {
        IdKey(bytes)
    }

    pub fn generate() -> IdKey {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        IdKey(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct IdPlaintext {
    pseudonym: [u8; 32],
    column: String,
    valid_from: Timestamp,
}

/// Encrypts `(cell key, valid_from)` into an opaque id.
pub fn encrypt_id(
    key: &IdKey,
    cell_key: &CellKey,
    valid_from: Timestamp,
) -> Result<Vec<u8>, PepError> {
    let plaintext = bincode::serialize(&IdPlaintext {
        pseudonym: cell_key.pseudonym,
        column: cell_key.column.clone(),
        valid_from,
    })?;
    let cipher = XChaCha20Poly1305::new((&key.0).into());
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| PepError::fatal("id encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts an opaque id back into its cell coordinates.
pub fn decrypt_id(key: &IdKey, id: &[u8]) -> Result<(CellKey, Timestamp), PepError> {
    if id.len() <= NONCE_LEN {
        return Err(PepError::invalid("malformed id"));
    }
    let (nonce, ciphertext) = id.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new((&key.0).into());
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| PepError::invalid("id authentication failed"))?;
    let inner: IdPlaintext = bincode::deserialize(&plaintext)?;
    Ok((
        CellKey {
            pseudonym: inner.pseudonym,
            column: inner.column,
        },
        inner.valid_from,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell() -> CellKey {
        CellKey {
            pseudonym: [7u8; 32],
            column: "Age".to_string(),
        }
    }

    #[test]
    fn round_trip() {
        let key = IdKey::generate();
        let id = encrypt_id(&key, &cell(), Timestamp(42)).unwrap();
        let (back, ts) = decrypt_id(&key, &id).unwrap();
        assert_eq!(back, cell());
        assert_eq!(ts, Timestamp(42));
    }

    #[test]
    fn tampering_is_detected() {
        let key = IdKey::generate();
        let mut id = encrypt_id(&key, &cell(), Timestamp(42)).unwrap();
        let last = id.len() - 1;
        id[last] ^= 0xff;
        assert!(decrypt_id(&key, &id).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let id = encrypt_id(&IdKey::generate(), &cell(), Timestamp(1)).unwrap();
        assert!(decrypt_id(&IdKey::generate(), &id).is_err());
    }

    #[test]
    fn ids_are_unlinkable() {
        // Same cell, two encryptions: different ids (fresh nonces).
        let key = IdKey::generate();
        let a = encrypt_id(&key, &cell(), Timestamp(1)).unwrap();
        let b = encrypt_id(&key, &cell(), Timestamp(1)).unwrap();
        assert_ne!(a, b);
    }
}
