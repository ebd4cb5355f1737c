//! AES-256-GCM sealing of stored records.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::errors::{MsAuthError, Result};

const NONCE_LEN: usize = 12;
const FORMAT_VERSION: &str = "v1";

/// 256-bit record key, wiped on drop
#[derive(Clone, ZeroizeOnDrop)]
pub struct RecordKey([u8; 32]);

impl RecordKey {
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        fill_random(&mut key)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Base64 form used when the key is parked in the OS keyring
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| MsAuthError::Crypto(format!("Invalid stored key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MsAuthError::Crypto("Stored key has the wrong length".to_string()))?;
        Ok(Self(key))
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordKey([REDACTED])")
    }
}

/// On-disk form of one encrypted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedRecord {
    pub version: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Ciphertexts are bound to the account they were written for
fn associated_data(version: &str, account_key: &str) -> String {
    format!("msauth|{version}|{account_key}")
}

pub fn seal(key: &RecordKey, account_key: &str, plaintext: &[u8]) -> Result<SealedRecord> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    fill_random(&mut nonce)?;

    let aad = associated_data(FORMAT_VERSION, account_key);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| MsAuthError::Crypto(format!("Encryption failed: {e}")))?;

    Ok(SealedRecord {
        version: FORMAT_VERSION.to_string(),
        nonce: URL_SAFE_NO_PAD.encode(nonce),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
    })
}

/// Decrypt a record; a wrong key, wrong account or tampering all surface as
/// [`MsAuthError::CorruptedStore`]
pub fn open(key: &RecordKey, account_key: &str, sealed: &SealedRecord) -> Result<Vec<u8>> {
    let nonce = URL_SAFE_NO_PAD
        .decode(&sealed.nonce)
        .map_err(|_| MsAuthError::CorruptedStore)?;
    if nonce.len() != NONCE_LEN {
        return Err(MsAuthError::CorruptedStore);
    }
    let ciphertext = URL_SAFE_NO_PAD
        .decode(&sealed.ciphertext)
        .map_err(|_| MsAuthError::CorruptedStore)?;

    let aad = associated_data(&sealed.version, account_key);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| MsAuthError::CorruptedStore)
}

pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| MsAuthError::Crypto(format!("RNG failure: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = RecordKey::generate().unwrap();
        let sealed = seal(&key, "069a79f4-44e9-4726-a5be-fca90e38aaf5", b"{\"username\":\"Notch\"}").unwrap();

        assert_eq!(sealed.version, "v1");
        let plain = open(&key, "069a79f4-44e9-4726-a5be-fca90e38aaf5", &sealed).unwrap();
        assert_eq!(plain, b"{\"username\":\"Notch\"}");
    }

    #[test]
    fn test_nonces_differ() {
        let key = RecordKey::generate().unwrap();
        let a = seal(&key, "acct", b"same").unwrap();
        let b = seal(&key, "acct", b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_or_account_is_corruption() {
        let key = RecordKey::generate().unwrap();
        let other = RecordKey::generate().unwrap();
        let sealed = seal(&key, "acct-1", b"data").unwrap();

        assert!(matches!(open(&other, "acct-1", &sealed), Err(MsAuthError::CorruptedStore)));
        // A record copied onto another account's file doesn't decrypt
        assert!(matches!(open(&key, "acct-2", &sealed), Err(MsAuthError::CorruptedStore)));
    }

    #[test]
    fn test_tampering_is_corruption() {
        let key = RecordKey::generate().unwrap();
        let mut sealed = seal(&key, "acct", b"data").unwrap();

        let mut bytes = URL_SAFE_NO_PAD.decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        sealed.ciphertext = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(open(&key, "acct", &sealed), Err(MsAuthError::CorruptedStore)));

        sealed.nonce = "short".to_string();
        assert!(matches!(open(&key, "acct", &sealed), Err(MsAuthError::CorruptedStore)));
    }

    #[test]
    fn test_key_base64() {
        let key = RecordKey::from_bytes([7u8; 32]);
        let restored = RecordKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(restored.as_bytes(), key.as_bytes());

        assert!(RecordKey::from_base64("dG9vIHNob3J0").is_err());
        assert_eq!(format!("{key:?}"), "RecordKey([REDACTED])");
    }
}
