//! Wallet login: the sign-in message and EIP-191 signature recovery.

use chrono::{DateTime, Duration, TimeZone, Utc};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::chain::keccak256;

/// Maximum clock skew between the signed timestamp and the server.
pub const LOGIN_WINDOW_SECS: i64 = 5 * 60;

const MESSAGE_HEADER: &str = "Sign in to Ensoul";

static ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid address regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("'{0}' is not a wallet address")]
    InvalidAddress(String),

    #[error("sign-in message is malformed: {0}")]
    MalformedMessage(&'static str),

    #[error("sign-in message was issued for a different wallet")]
    AddressMismatch,

    #[error("sign-in message timestamp is outside the accepted window")]
    StaleTimestamp,

    #[error("signature is malformed: {0}")]
    MalformedSignature(String),

    #[error("signature was not produced by the claimed wallet")]
    SignerMismatch,
}

/// Lower-cased `0x` address, or an error if `raw` is not one.
pub fn parse_address(raw: &str) -> Result<String, IdentityError> {
    let trimmed = raw.trim();
    if !ADDRESS_RE.is_match(trimmed) {
        return Err(IdentityError::InvalidAddress(trimmed.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// The exact text a wallet signs to log in.
pub fn login_message(address: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}\nWallet: {}\nTimestamp: {}",
        MESSAGE_HEADER,
        address,
        timestamp.timestamp_millis()
    )
}

/// Check the message names `address` and was issued within the window
/// around `now`.
pub fn check_login_message(
    message: &str,
    address: &str,
    now: DateTime<Utc>,
) -> Result<(), IdentityError> {
    let mut lines = message.lines();
    if lines.next().map(str::trim) != Some(MESSAGE_HEADER) {
        return Err(IdentityError::MalformedMessage("missing header"));
    }
    let wallet = lines
        .next()
        .and_then(|l| l.trim().strip_prefix("Wallet:"))
        .map(str::trim)
        .ok_or(IdentityError::MalformedMessage("missing wallet line"))?;
    let millis: i64 = lines
        .next()
        .and_then(|l| l.trim().strip_prefix("Timestamp:"))
        .and_then(|t| t.trim().parse().ok())
        .ok_or(IdentityError::MalformedMessage("missing or invalid timestamp line"))?;

    if !wallet.eq_ignore_ascii_case(address) {
        return Err(IdentityError::AddressMismatch);
    }
    let issued = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or(IdentityError::MalformedMessage("timestamp out of range"))?;
    let skew = if issued > now { issued - now } else { now - issued };
    if skew > Duration::seconds(LOGIN_WINDOW_SECS) {
        return Err(IdentityError::StaleTimestamp);
    }
    Ok(())
}

/// Keccak-256 of the EIP-191 `personal_sign` envelope around `message`.
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut envelope = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    envelope.extend_from_slice(message.as_bytes());
    keccak256(&envelope)
}

/// Ethereum address of a public key: last 20 bytes of the keccak of the
/// uncompressed point without its prefix byte.
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Recover the lower-cased signer address of a 65-byte `r || s || v`
/// `personal_sign` signature.
pub fn recover_signer(message: &str, signature_hex: &str) -> Result<String, IdentityError> {
    let bytes = hex::decode(signature_hex.trim().trim_start_matches("0x"))
        .map_err(|e| IdentityError::MalformedSignature(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(IdentityError::MalformedSignature(format!(
            "expected 65 bytes, got {}",
            bytes.len()
        )));
    }
    let v = match bytes[64] {
        0 | 1 => bytes[64],
        27 | 28 => bytes[64] - 27,
        other => {
            return Err(IdentityError::MalformedSignature(format!(
                "unsupported recovery byte {}",
                other
            )))
        }
    };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| IdentityError::MalformedSignature("invalid recovery id".into()))?;
    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|e| IdentityError::MalformedSignature(e.to_string()))?;

    let digest = personal_message_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|_| IdentityError::SignerMismatch)?;
    Ok(address_of(&key))
}

/// Full login check: message shape and freshness, then signer recovery.
/// Returns the normalised wallet address.
pub fn verify_login(
    address: &str,
    message: &str,
    signature_hex: &str,
    now: DateTime<Utc>,
) -> Result<String, IdentityError> {
    let address = parse_address(address)?;
    check_login_message(message, &address, now)?;
    let signer = recover_signer(message, signature_hex)?;
    if signer != address {
        log::debug!("login signer {} does not match claimed {}", signer, address);
        return Err(IdentityError::SignerMismatch);
    }
    Ok(address)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_known_address_derivation() {
        // Private key 0x...01 is the generator point.
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let key = k256::ecdsa::SigningKey::from_slice(&secret).unwrap();
        assert_eq!(
            address_of(key.verifying_key()),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_verify_login_round_trip() {
        let key = key(7);
        let addr = address(&key);
        let now = Utc::now();
        let message = login_message(&addr, now);
        let signature = sign(&key, &message);

        let upper = format!("0x{}", addr[2..].to_ascii_uppercase());
        assert_eq!(verify_login(&upper, &message, &signature, now).unwrap(), addr);
    }

    #[test]
    fn test_raw_recovery_byte_accepted() {
        let key = key(9);
        let message = "hello";
        let mut sig = hex::decode(sign(&key, message).trim_start_matches("0x")).unwrap();
        sig[64] -= 27;
        assert_eq!(recover_signer(message, &hex::encode(sig)).unwrap(), address(&key));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let alice = key(1);
        let mallory = key(2);
        let now = Utc::now();
        let message = login_message(&address(&alice), now);
        let forged = sign(&mallory, &message);
        assert_eq!(
            verify_login(&address(&alice), &message, &forged, now),
            Err(IdentityError::SignerMismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let key = key(3);
        let addr = address(&key);
        let now = Utc::now();
        let message = login_message(&addr, now - Duration::minutes(6));
        let signature = sign(&key, &message);
        assert_eq!(
            verify_login(&addr, &message, &signature, now),
            Err(IdentityError::StaleTimestamp)
        );
    }

    #[test]
    fn test_message_for_other_wallet_rejected() {
        let key = key(4);
        let now = Utc::now();
        let message = login_message("0x0000000000000000000000000000000000000001", now);
        let signature = sign(&key, &message);
        assert_eq!(
            verify_login(&address(&key), &message, &signature, now),
            Err(IdentityError::AddressMismatch)
        );
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(parse_address("0x123"), Err(IdentityError::InvalidAddress(_))));
        assert!(matches!(
            recover_signer("hi", "0xdeadbeef"),
            Err(IdentityError::MalformedSignature(_))
        ));
        assert!(matches!(
            check_login_message("Hello\nWallet: 0x\nTimestamp: 1", "0x", Utc::now()),
            Err(IdentityError::MalformedMessage(_))
        ));
    }
}
