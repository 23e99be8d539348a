use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::errors::StoreError;

const NONCE_LEN: usize = 12;
const FORMAT_VERSION: &str = "v1";

/// AES-256 key used to seal records at rest
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Result<Self, StoreError> {
        let mut key = [0u8; 32];
        getrandom::fill(&mut key)
            .map_err(|e| StoreError::Crypto(format!("Key generation failed: {e}")))?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Decode a key previously produced by [`EncryptionKey::to_base64`]
    pub fn from_base64(encoded: &str) -> Result<Self, StoreError> {
        let bytes = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(encoded.trim())
                .map_err(|e| StoreError::Crypto(format!("Invalid key encoding: {e}")))?,
        );
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Crypto(format!("Invalid key length: {}", bytes.len())))?;
        Ok(Self { key })
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(URL_SAFE_NO_PAD.encode(self.key))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// On-disk envelope of a sealed record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    /// Base64url-encoded nonce (12 bytes)
    pub nonce: String,
    /// Base64url-encoded ciphertext + tag
    pub ciphertext: String,
    pub version: String,
}

fn aad(version: &str, record_key: &str) -> String {
    format!("rp-auth|{version}|{record_key}")
}

/// Seal `plaintext` with AES-256-GCM, binding it to `record_key`
pub fn seal(
    key: &EncryptionKey,
    plaintext: &[u8],
    record_key: &str,
) -> Result<SealedRecord, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    getrandom::fill(&mut nonce_bytes)
        .map_err(|e| StoreError::Crypto(format!("Nonce generation failed: {e}")))?;

    let aad = aad(FORMAT_VERSION, record_key);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| StoreError::Crypto(format!("Encryption failed: {e}")))?;

    Ok(SealedRecord {
        nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        version: FORMAT_VERSION.to_string(),
    })
}

/// Open a sealed record. A record moved to another key fails authentication.
pub fn open(
    key: &EncryptionKey,
    sealed: &SealedRecord,
    record_key: &str,
) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.key));

    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(&sealed.nonce)
        .map_err(|_| StoreError::Corrupted)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(StoreError::Corrupted);
    }

    let ciphertext = URL_SAFE_NO_PAD
        .decode(&sealed.ciphertext)
        .map_err(|_| StoreError::Corrupted)?;

    let aad = aad(&sealed.version, record_key);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| StoreError::Corrupted)?;

    Ok(Zeroizing::new(plaintext))
}
