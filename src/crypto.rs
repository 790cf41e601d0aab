//! Authenticated encryption for secrets at rest.
//!
//! Wraps AES-256-GCM behind a small seal/open API. Every sealed value is a
//! self-contained [`Envelope`] carrying its own nonce; the authentication tag
//! is appended to the ciphertext by the AEAD. The master key lives only in
//! the [`CryptoBox`], never alongside envelopes.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};

use crate::error::{MfaError, Result};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// The process-wide master encryption key.
///
/// Supplied once at startup from external configuration. The raw bytes are
/// held behind [`secrecy::SecretBox`] so they are zeroized on drop and never
/// show up in debug output.
pub struct MasterKey(SecretBox<[u8; KEY_SIZE]>);

impl MasterKey {
    /// Create a master key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    /// Create a master key from a base64 string (URL-safe, no padding), the
    /// form configuration sources typically supply.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| MfaError::InvalidInput(format!("malformed master key: {e}")))?;
        let bytes: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| MfaError::InvalidInput(format!("master key must be {KEY_SIZE} bytes")))?;
        Ok(Self::from_bytes(bytes))
    }
}

/// The output of a [`CryptoBox::seal`] call: nonce plus ciphertext (with the
/// GCM tag appended by the cipher).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Encode as `base64(nonce || ciphertext)` for callers persisting
    /// envelopes in text columns.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode the text form produced by [`Envelope::encode`].
    ///
    /// Any malformed input maps to [`MfaError::Decrypt`]; a corrupt envelope
    /// and a failed tag check are the same condition to callers.
    pub fn decode(text: &str) -> Result<Self> {
        let raw = URL_SAFE_NO_PAD.decode(text).map_err(|_| MfaError::Decrypt)?;
        if raw.len() <= NONCE_SIZE {
            return Err(MfaError::Decrypt);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        Ok(Self {
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Symmetric authenticated-encryption wrapper around AES-256-GCM.
#[derive(Clone)]
pub struct CryptoBox {
    cipher: Aes256Gcm,
}

impl CryptoBox {
    /// Create a crypto box from the master key.
    #[must_use]
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.0.expose_secret().into()),
        }
    }

    /// Encrypt a small secret blob.
    ///
    /// A fresh random nonce is drawn from the OS on every call. Nonces are
    /// never derived from the plaintext or reused.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| MfaError::Internal("AEAD encryption failure".to_string()))?;

        Ok(Envelope { nonce, ciphertext })
    }

    /// Decrypt an envelope, verifying the authentication tag first.
    ///
    /// Returns [`MfaError::Decrypt`] on any tag mismatch or malformed
    /// envelope; partially-decrypted data is never returned.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                envelope.ciphertext.as_slice(),
            )
            .map_err(|_| MfaError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> CryptoBox {
        CryptoBox::new(&MasterKey::from_bytes([7u8; KEY_SIZE]))
    }

    #[test]
    fn seal_open_round_trip() {
        let cb = test_box();
        let envelope = cb.seal(b"twenty-byte-totp-seed").unwrap();
        assert_eq!(cb.open(&envelope).unwrap(), b"twenty-byte-totp-seed");
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let cb = test_box();
        let a = cb.seal(b"same plaintext").unwrap();
        let b = cb.seal(b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cb = test_box();
        let mut envelope = cb.seal(b"secret").unwrap();
        let last = envelope.ciphertext.len() - 1;
        envelope.ciphertext[last] ^= 0xFF;
        assert!(matches!(cb.open(&envelope), Err(MfaError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails() {
        let cb = test_box();
        let envelope = cb.seal(b"secret").unwrap();
        let other = CryptoBox::new(&MasterKey::from_bytes([8u8; KEY_SIZE]));
        assert!(matches!(other.open(&envelope), Err(MfaError::Decrypt)));
    }

    #[test]
    fn text_encoding_round_trip() {
        let cb = test_box();
        let envelope = cb.seal(b"secret").unwrap();
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(cb.open(&decoded).unwrap(), b"secret");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(Envelope::decode("@@@"), Err(MfaError::Decrypt)));
        // Too short to hold a nonce.
        assert!(matches!(
            Envelope::decode(&URL_SAFE_NO_PAD.encode([0u8; 4])),
            Err(MfaError::Decrypt)
        ));
    }

    #[test]
    fn master_key_from_base64() {
        let encoded = URL_SAFE_NO_PAD.encode([9u8; KEY_SIZE]);
        let key = MasterKey::from_base64(&encoded).unwrap();
        let cb = CryptoBox::new(&key);
        let envelope = cb.seal(b"x").unwrap();
        assert_eq!(cb.open(&envelope).unwrap(), b"x");

        assert!(MasterKey::from_base64("dG9vLXNob3J0").is_err());
    }
}
