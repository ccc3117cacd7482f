//! Access key generation and format validation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use regex::Regex;
use zeroize::Zeroize;

use latchkey_core::{AuthError, AuthResult};

const ACCESS_KEY_PREFIX: &str = "AKIAJ";
const ACCESS_KEY_SUFFIX: char = 'Q';
const ACCESS_KEY_BODY_LEN: usize = 14;
const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const SECRET_KEY_BYTES: usize = 30;

static ACCESS_KEY_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AKIA[IJ][A-Z2-7]{14}Q$").expect("access key pattern must compile"));

/// Generate a new access key id from the OS random source.
pub fn generate_access_key_id() -> String {
    let mut rng = OsRng;
    let mut key = String::with_capacity(ACCESS_KEY_PREFIX.len() + ACCESS_KEY_BODY_LEN + 1);
    key.push_str(ACCESS_KEY_PREFIX);
    for _ in 0..ACCESS_KEY_BODY_LEN {
        let idx = rng.gen_range(0..BASE32_ALPHABET.len());
        key.push(char::from(BASE32_ALPHABET[idx]));
    }
    key.push(ACCESS_KEY_SUFFIX);
    key
}

/// Generate a new secret access key from the OS random source.
pub fn generate_secret_access_key() -> String {
    let mut bytes = [0u8; SECRET_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let secret = STANDARD.encode(bytes);
    bytes.zeroize();
    secret
}

pub fn is_valid_access_key_id(key: &str) -> bool {
    ACCESS_KEY_ID.is_match(key)
}

/// Reject malformed access key ids and empty secrets.
pub fn validate_credentials(access_key_id: &str, secret_access_key: &str) -> AuthResult<()> {
    if !is_valid_access_key_id(access_key_id) {
        return Err(AuthError::InvalidAccessKeyId(access_key_id.to_string()));
    }
    if secret_access_key.is_empty() {
        return Err(AuthError::InvalidSecretAccessKey);
    }
    Ok(())
}
