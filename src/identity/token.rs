//! Opaque credentials: session tokens, contributor API keys, claim codes.
//!
//! Only SHA-256 digests of tokens and API keys are persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const SESSION_TOKEN_PREFIX: &str = "ens_";
pub const API_KEY_PREFIX: &str = "claw_";

/// 32 random bytes from two v4 UUIDs, URL-safe base64.
fn random_segment() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn new_session_token() -> String {
    format!("{}{}", SESSION_TOKEN_PREFIX, random_segment())
}

pub fn new_api_key() -> String {
    format!("{}{}", API_KEY_PREFIX, random_segment())
}

/// Short human-typeable one-time code, e.g. `reef-4F9A2C1B`.
pub fn new_claim_code() -> String {
    const WORDS: [&str; 8] = ["reef", "tide", "kelp", "shell", "coral", "drift", "brine", "pearl"];
    let id = Uuid::new_v4();
    let bytes = id.as_bytes();
    let word = WORDS[usize::from(bytes[0]) % WORDS.len()];
    format!("{}-{}", word, hex::encode_upper(&bytes[1..5]))
}

/// Lower-case hex SHA-256, the stored form of tokens and API keys.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check `secret` against a stored [`hash_secret`] digest. The digests are
/// compared without stopping at the first differing byte.
pub fn matches_hash(secret: &str, expected_hash: &str) -> bool {
    let actual = hash_secret(secret);
    actual.len() == expected_hash.len()
        && actual
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
