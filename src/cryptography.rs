use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, TransferError};
use crate::{ENCRYPTION_OVERHEAD, KEY_SIZE, NONCE_SIZE};

/// Characters a generated key is drawn from. Uppercase only so that a key
/// read aloud or typed on a phone survives without case confusion.
pub const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const GENERATED_KEY_LEN: usize = 6;
const MIN_KEY_LEN: usize = 4;
const MAX_KEY_LEN: usize = 64;

const SECRET_INFO: &[u8] = b"beam-transfer/v1 chunk encryption";
const VERIFIER_INFO: &[u8] = b"beam-transfer/v1 key verifier";

/// Argon2id cost: 19 MiB, 2 passes, 1 lane.
const STRETCH_MEMORY_KIB: u32 = 19 * 1024;
const STRETCH_PASSES: u32 = 2;
const STRETCH_LANES: u32 = 1;

// ============================================================================
// Key material
// ============================================================================

/// Short human-typeable secret authorising one transfer.
///
/// Keys are normalised (trimmed, uppercased) on construction so the sender's
/// displayed key and the receiver's typed key compare equal.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferKey(String);

impl TransferKey {
    /// Generates a random key of [`GENERATED_KEY_LEN`] characters.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let key = (0..GENERATED_KEY_LEN)
            .map(|_| KEY_ALPHABET[rng.random_range(0..KEY_ALPHABET.len())] as char)
            .collect();
        TransferKey(key)
    }

    /// Validates and normalises a user-supplied key.
    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim().to_ascii_uppercase();
        if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
            return Err(TransferError::InvalidKey(format!(
                "key must be {MIN_KEY_LEN}-{MAX_KEY_LEN} characters"
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(TransferError::InvalidKey(
                "key may only contain letters and digits".into(),
            ));
        }
        Ok(TransferKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Keys never end up in logs through `{:?}`.
impl std::fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransferKey(..)")
    }
}

/// Symmetric key for chunk encryption, derived from a [`TransferKey`].
#[derive(Clone)]
pub struct SessionSecret([u8; KEY_SIZE]);

impl SessionSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

/// One-way digest of a [`TransferKey`], sent in the clear inside an offer.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVerifier([u8; 32]);

impl KeyVerifier {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for KeyVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyVerifier(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Argon2id stretch of a [`TransferKey`] under one transfer's salt. The
/// verifier and the session secret are both expanded from it, so neither is
/// reusable across transfers and guessing the key costs one Argon2id run per
/// candidate.
#[derive(Clone)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

fn stretcher() -> Result<Argon2<'static>> {
    let params = Params::new(STRETCH_MEMORY_KIB, STRETCH_PASSES, STRETCH_LANES, Some(KEY_SIZE))
        .map_err(|e| TransferError::InvalidKey(format!("argon2 parameters: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Stretches `key` with `salt`, the offer's random transfer id. CPU and
/// memory heavy; async callers go through [`stretch_key_blocking`].
pub fn stretch_key(key: &TransferKey, salt: &[u8]) -> Result<KeyMaterial> {
    let mut material = [0u8; KEY_SIZE];
    stretcher()?
        .hash_password_into(key.as_str().as_bytes(), salt, &mut material)
        .map_err(|e| TransferError::InvalidKey(format!("key stretching failed: {e}")))?;
    Ok(KeyMaterial(material))
}

/// [`stretch_key`] on the blocking pool.
pub async fn stretch_key_blocking(key: TransferKey, salt: [u8; 16]) -> Result<KeyMaterial> {
    tokio::task::spawn_blocking(move || stretch_key(&key, &salt))
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(format!("key stretching task failed: {e}"))))?
}

fn expand(material: &KeyMaterial, info: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, &material.0);
    let mut out = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut out)
        .expect("32 bytes is a valid length for HKDF");
    out
}

/// Chunk encryption key for one transfer.
pub fn derive_secret(material: &KeyMaterial) -> SessionSecret {
    SessionSecret(expand(material, SECRET_INFO))
}

pub fn verifier_of(material: &KeyMaterial) -> KeyVerifier {
    KeyVerifier(expand(material, VERIFIER_INFO))
}

/// Checks material stretched from a locally entered key against the
/// verifier from an offer. The comparison touches every byte regardless of
/// where they differ.
pub fn verify(candidate: &KeyMaterial, verifier: &KeyVerifier) -> bool {
    let computed = verifier_of(candidate);
    computed
        .0
        .iter()
        .zip(verifier.0.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

// ============================================================================
// Chunk encryption
// ============================================================================

/// Nonce for chunk `sequence` of stream `stream_id`: the stream id in the
/// first four bytes, the sequence number in the last eight. Distinct
/// `(stream_id, sequence)` pairs can never produce the same nonce.
pub fn chunk_nonce(stream_id: u32, sequence: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&stream_id.to_be_bytes());
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// A chunk as produced by [`CipherWriter::seal`].
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub stream_id: u32,
    pub sequence: u64,
    pub ciphertext: Vec<u8>,
}

impl SealedChunk {
    pub fn nonce(&self) -> [u8; NONCE_SIZE] {
        chunk_nonce(self.stream_id, self.sequence)
    }
}

/// Encrypting side of one stream. Owns the stream's nonce counter, which only
/// moves forward.
pub struct CipherWriter {
    cipher: ChaCha20Poly1305,
    stream_id: u32,
    next_sequence: u64,
}

pub fn open_writer(secret: &SessionSecret, stream_id: u32) -> CipherWriter {
    CipherWriter {
        cipher: ChaCha20Poly1305::new(secret.as_bytes().into()),
        stream_id,
        next_sequence: 0,
    }
}

impl CipherWriter {
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Number of chunks sealed so far.
    pub fn chunks_sealed(&self) -> u64 {
        self.next_sequence
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SealedChunk> {
        let sequence = self.next_sequence;
        let next = sequence
            .checked_add(1)
            .ok_or_else(|| TransferError::integrity("nonce counter exhausted"))?;
        let nonce = chunk_nonce(self.stream_id, sequence);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| TransferError::integrity(format!("encryption failed: {e}")))?;
        self.next_sequence = next;
        Ok(SealedChunk {
            stream_id: self.stream_id,
            sequence,
            ciphertext,
        })
    }
}

/// Decrypting side of one stream. Accepts chunks only in exact sequence.
pub struct CipherReader {
    cipher: ChaCha20Poly1305,
    stream_id: u32,
    expected_sequence: u64,
}

pub fn open_reader(secret: &SessionSecret, stream_id: u32) -> CipherReader {
    CipherReader {
        cipher: ChaCha20Poly1305::new(secret.as_bytes().into()),
        stream_id,
        expected_sequence: 0,
    }
}

impl CipherReader {
    /// Number of chunks opened so far.
    pub fn chunks_opened(&self) -> u64 {
        self.expected_sequence
    }

    pub fn open(&mut self, sequence: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if sequence != self.expected_sequence {
            return Err(TransferError::integrity(format!(
                "stream {}: expected chunk {}, got {}",
                self.stream_id, self.expected_sequence, sequence
            )));
        }
        if ciphertext.len() < ENCRYPTION_OVERHEAD {
            return Err(TransferError::integrity(format!(
                "stream {}: chunk {} truncated to {} bytes",
                self.stream_id,
                sequence,
                ciphertext.len()
            )));
        }
        let nonce = chunk_nonce(self.stream_id, sequence);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| {
                TransferError::integrity(format!(
                    "stream {}: chunk {} failed to decrypt",
                    self.stream_id, sequence
                ))
            })?;
        self.expected_sequence += 1;
        Ok(plaintext)
    }
}
