//! `EncryptionService` — AES-256-GCM encryption for stored refresh/access
//! tokens, using the `ivHex:authTagHex:cipherHex` storage format this
//! engine's persisted tokens use (§6).
//!
//! The process key comes from `ENCRYPTION_KEY` (32 raw bytes, hex-encoded)
//! and is never logged: `EncryptionService`'s `Debug` impl redacts it.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use xsync_schemas::{EngineError, EngineResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct EncryptionService {
    key: SecretVec<u8>,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("key", &"<REDACTED>")
            .finish()
    }
}

impl EncryptionService {
    /// `key_hex` must decode to exactly 32 bytes — the value of the
    /// `ENCRYPTION_KEY` environment variable.
    pub fn new(key_hex: &str) -> EngineResult<Self> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| EngineError::config(format!("ENCRYPTION_KEY is not valid hex: {e}")))?;
        if bytes.len() != 32 {
            return Err(EngineError::config(
                "ENCRYPTION_KEY must decode to exactly 32 bytes",
            ));
        }
        Ok(Self {
            key: SecretVec::new(bytes),
        })
    }

    fn cipher(&self) -> Aes256Gcm {
        let key = Key::<Aes256Gcm>::from_slice(self.key.expose_secret());
        Aes256Gcm::new(key)
    }

    /// Encrypts `plaintext`, returning `ivHex:authTagHex:cipherHex`.
    pub fn encrypt(&self, plaintext: &str) -> EngineResult<String> {
        let cipher = self.cipher();
        let mut iv = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let mut out = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::config(format!("encryption failed: {e}")))?;
        // `aes-gcm` appends the 16-byte auth tag to the ciphertext; split it
        // out so the stored format keeps iv/tag/cipher as separate fields.
        let tag = out.split_off(out.len() - TAG_LEN);

        Ok(format!("{}:{}:{}", hex::encode(iv), hex::encode(tag), hex::encode(out)))
    }

    /// Decrypts a value previously produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, stored: &str) -> EngineResult<String> {
        let mut parts = stored.splitn(3, ':');
        let (iv_hex, tag_hex, cipher_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) => (a, b, c),
            _ => {
                return Err(EngineError::config(
                    "stored token is not in ivHex:authTagHex:cipherHex format",
                ))
            }
        };

        let iv = hex::decode(iv_hex).map_err(|e| EngineError::config(format!("bad iv hex: {e}")))?;
        let tag = hex::decode(tag_hex).map_err(|e| EngineError::config(format!("bad tag hex: {e}")))?;
        let mut ciphertext =
            hex::decode(cipher_hex).map_err(|e| EngineError::config(format!("bad cipher hex: {e}")))?;
        if iv.len() != NONCE_LEN {
            return Err(EngineError::config("iv must be 12 bytes"));
        }
        if tag.len() != TAG_LEN {
            return Err(EngineError::config("auth tag must be 16 bytes"));
        }
        ciphertext.extend_from_slice(&tag);

        let cipher = self.cipher();
        let nonce = Nonce::from_slice(&iv);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| EngineError::config(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| EngineError::config(format!("decrypted bytes are not valid utf-8: {e}")))
    }
}
