//! Pluggable encryption for secrets at rest.
//!
//! [`FernetSecretStore`] writes Fernet-layout tokens as raw bytes:
//!
//! ```text
//! version (1) | timestamp (8) | IV (16) | AES-128-CBC/PKCS7 ciphertext (N) | HMAC-SHA256 (32)
//! ```
//!
//! The MAC covers everything before it and is checked in constant time before
//! any decryption is attempted.

use aes::Aes128;
use cbc::{Decryptor, Encryptor};
use chrono::Utc;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use latchkey_core::{AuthError, AuthResult};

type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 0x80;
const TIMESTAMP_LEN: usize = 8;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;
const HEADER_LEN: usize = 1 + TIMESTAMP_LEN + IV_LEN;

/// Encrypts secrets before they are persisted and decrypts them on the way
/// back to an authenticated caller.
pub trait SecretStore: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> AuthResult<Vec<u8>>;
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct FernetKeys {
    signing: [u8; 16],
    encryption: [u8; 16],
}

/// Fernet-style authenticated encryption keyed from a shared secret.
#[derive(Clone)]
pub struct FernetSecretStore {
    keys: FernetKeys,
}

impl core::fmt::Debug for FernetSecretStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FernetSecretStore").finish_non_exhaustive()
    }
}

impl FernetSecretStore {
    /// Derive signing and encryption keys from `secret`.
    ///
    /// The first half of `SHA-256(secret)` signs, the second half encrypts.
    pub fn new(secret: &[u8]) -> Self {
        let mut digest = Sha256::digest(secret);
        let mut signing = [0u8; 16];
        let mut encryption = [0u8; 16];
        signing.copy_from_slice(&digest[0..16]);
        encryption.copy_from_slice(&digest[16..32]);
        digest.as_mut_slice().zeroize();
        Self {
            keys: FernetKeys {
                signing,
                encryption,
            },
        }
    }

    fn mac(&self) -> AuthResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.keys.signing)
            .map_err(|e| AuthError::crypto(format!("HMAC init failed: {e}")))
    }
}

impl SecretStore for FernetSecretStore {
    fn encrypt(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Encryptor::<Aes128>::new_from_slices(&self.keys.encryption, &iv)
            .map_err(|e| AuthError::crypto(format!("encrypt init failed: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let timestamp = Utc::now().timestamp().max(0) as u64;
        let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
        token.push(VERSION);
        token.extend_from_slice(&timestamp.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = self.mac()?;
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());
        Ok(token)
    }

    fn decrypt(&self, token: &[u8]) -> AuthResult<Vec<u8>> {
        if token.len() < HEADER_LEN + MAC_LEN {
            return Err(AuthError::crypto("token too short"));
        }
        let (msg, sig) = token.split_at(token.len() - MAC_LEN);
        if msg[0] != VERSION {
            return Err(AuthError::crypto("token version invalid"));
        }

        let mut mac = self.mac()?;
        mac.update(msg);
        let computed = mac.finalize().into_bytes();
        if computed.ct_eq(sig).unwrap_u8() != 1 {
            return Err(AuthError::crypto("token signature invalid"));
        }

        let iv = &msg[1 + TIMESTAMP_LEN..HEADER_LEN];
        let ciphertext = &msg[HEADER_LEN..];
        Decryptor::<Aes128>::new_from_slices(&self.keys.encryption, iv)
            .map_err(|e| AuthError::crypto(format!("decrypt init failed: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| AuthError::crypto(format!("decrypt failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_inverts_encrypt() {
        let store = FernetSecretStore::new(b"shared-secret");
        let token = store.encrypt(b"secret123").unwrap();
        assert_eq!(token[0], VERSION);
        assert_ne!(&token[HEADER_LEN..token.len() - MAC_LEN], b"secret123");
        assert_eq!(store.decrypt(&token).unwrap(), b"secret123");
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let store = FernetSecretStore::new(b"shared-secret");
        let a = store.encrypt(b"secret123").unwrap();
        let b = store.encrypt(b"secret123").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_is_detected() {
        let store = FernetSecretStore::new(b"shared-secret");
        let mut token = store.encrypt(b"secret123").unwrap();
        token[HEADER_LEN] ^= 0x01;
        assert!(matches!(store.decrypt(&token), Err(AuthError::Crypto(_))));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = FernetSecretStore::new(b"one").encrypt(b"secret123").unwrap();
        let err = FernetSecretStore::new(b"two").decrypt(&token).unwrap_err();
        assert_eq!(err, AuthError::crypto("token signature invalid"));
    }

    #[test]
    fn short_tokens_are_rejected() {
        let store = FernetSecretStore::new(b"shared-secret");
        assert!(store.decrypt(&[VERSION; 10]).is_err());
    }
}
