//! Message verifier: content hashes and owner signatures.
//!
//! ## Checks
//!
//! 1. `sha256(hash_payload) == declared hash`
//! 2. Owner signature over the signing payload:
//!    - `0x…` (40 hex) owners: Ethereum personal-message (EIP-191) key
//!      recovery with Keccak-256, address compared case-insensitively.
//!    - Everything else: Bitcoin message signature (base64, 65 bytes)
//!      over the double-SHA-256 of the magic-prefixed message, recovered
//!      key hashed to a P2PKH Base58Check address. A hex public key given
//!      as owner is first derived to its address.
//!
//! Malformed input never panics and never verifies (fail closed).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use thiserror::Error;

use skyfleet_proto::ApplicationMessage;

/// Bitcoin signed-message magic (without its length prefix).
const BITCOIN_MAGIC: &[u8] = b"Bitcoin Signed Message:\n";

/// P2PKH version byte.
const P2PKH_VERSION: u8 = 0x00;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid owner address: {0}")]
    InvalidAddress(String),

    #[error("public key recovery failed")]
    RecoveryFailed,

    #[error("signature does not belong to {0}")]
    SignerMismatch(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

// ════════════════════════════════════════════════════════════════════════════
// HASHING
// ════════════════════════════════════════════════════════════════════════════

/// Lowercase hex SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Content hash of a message: SHA-256 over payload plus signature.
pub fn content_hash(message: &ApplicationMessage) -> Result<String, CryptoError> {
    let payload = message.hash_payload().map_err(|e| CryptoError::Encoding(e.to_string()))?;
    Ok(sha256_hex(payload.as_bytes()))
}

/// Check the declared hash against the recomputed one.
pub fn verify_hash(message: &ApplicationMessage) -> Result<(), CryptoError> {
    let computed = content_hash(message)?;
    if computed.eq_ignore_ascii_case(&message.hash) {
        Ok(())
    } else {
        Err(CryptoError::HashMismatch { declared: message.hash.clone(), computed })
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ADDRESS FORMATS
// ════════════════════════════════════════════════════════════════════════════

/// Which signature scheme an owner address implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ethereum,
    Bitcoin,
}

pub fn address_kind(owner: &str) -> AddressKind {
    let is_eth = owner.len() == 42
        && owner.starts_with("0x")
        && owner[2..].chars().all(|c| c.is_ascii_hexdigit());
    if is_eth {
        AddressKind::Ethereum
    } else {
        AddressKind::Bitcoin
    }
}

/// Hex public key (33 bytes compressed or 65 uncompressed)?
fn parse_hex_pubkey(owner: &str) -> Option<Vec<u8>> {
    let compressed = owner.len() == 66 && (owner.starts_with("02") || owner.starts_with("03"));
    let uncompressed = owner.len() == 130 && owner.starts_with("04");
    if !(compressed || uncompressed) {
        return None;
    }
    hex::decode(owner).ok()
}

/// P2PKH address of serialized public key bytes.
pub fn p2pkh_address(pubkey_bytes: &[u8]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(P2PKH_VERSION);
    payload.extend_from_slice(&hash160(pubkey_bytes));
    bs58::encode(payload).with_check().into_string()
}

/// Derive the address a hex public key stands for.
pub fn pubkey_to_address(pubkey_hex: &str) -> Result<String, CryptoError> {
    let bytes = parse_hex_pubkey(pubkey_hex)
        .ok_or_else(|| CryptoError::InvalidKey("not a hex secp256k1 public key".to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(p2pkh_address(&bytes))
}

fn ethereum_address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

// ════════════════════════════════════════════════════════════════════════════
// MESSAGE DIGESTS
// ════════════════════════════════════════════════════════════════════════════

fn ethereum_message_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

fn write_varint(out: &mut Vec<u8>, n: usize) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&(n as u64).to_le_bytes());
        }
    }
}

fn bitcoin_message_digest(message: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(BITCOIN_MAGIC.len() + message.len() + 10);
    write_varint(&mut data, BITCOIN_MAGIC.len());
    data.extend_from_slice(BITCOIN_MAGIC);
    write_varint(&mut data, message.len());
    data.extend_from_slice(message);
    sha256d(&data)
}

fn recover_key(digest: &[u8; 32], rs: &[u8], recovery: u8) -> Result<VerifyingKey, CryptoError> {
    let signature = Signature::from_slice(rs).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let mut recid = RecoveryId::from_byte(recovery)
        .ok_or_else(|| CryptoError::InvalidSignature(format!("bad recovery id {}", recovery)))?;
    // High-S signatures are valid upstream but rejected by the verifier here.
    let signature = match signature.normalize_s() {
        Some(low) => {
            recid = RecoveryId::new(!recid.is_y_odd(), recid.is_x_reduced());
            low
        }
        None => signature,
    };
    VerifyingKey::recover_from_prehash(digest, &signature, recid).map_err(|_| CryptoError::RecoveryFailed)
}

// ════════════════════════════════════════════════════════════════════════════
// RECOVERY
// ════════════════════════════════════════════════════════════════════════════

/// Recover the Ethereum address that produced a hex `signature` (r‖s‖v).
pub fn recover_ethereum_address(message: &[u8], signature: &str) -> Result<String, CryptoError> {
    let raw = hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    if raw.len() != 65 {
        return Err(CryptoError::InvalidSignature(format!("expected 65 bytes, got {}", raw.len())));
    }
    let recovery = match raw[64] {
        v @ (27 | 28) => v - 27,
        v @ (0 | 1) => v,
        v => return Err(CryptoError::InvalidSignature(format!("bad v {}", v))),
    };
    let key = recover_key(&ethereum_message_digest(message), &raw[..64], recovery)?;
    Ok(ethereum_address_of(&key))
}

/// Recover the P2PKH address that produced a base64 Bitcoin message signature.
pub fn recover_bitcoin_address(message: &[u8], signature: &str) -> Result<String, CryptoError> {
    let raw = BASE64
        .decode(signature.trim())
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    if raw.len() != 65 {
        return Err(CryptoError::InvalidSignature(format!("expected 65 bytes, got {}", raw.len())));
    }
    let header = raw[0];
    if !(27..=42).contains(&header) {
        return Err(CryptoError::InvalidSignature(format!("bad header {}", header)));
    }
    let recovery = (header - 27) % 4;
    let compressed = header >= 31;
    let key = recover_key(&bitcoin_message_digest(message), &raw[1..], recovery)?;
    let point = key.to_encoded_point(compressed);
    Ok(p2pkh_address(point.as_bytes()))
}

/// Verify that `owner` signed `message`.
pub fn verify_signature(owner: &str, message: &[u8], signature: &str) -> Result<(), CryptoError> {
    if owner.is_empty() {
        return Err(CryptoError::InvalidAddress("empty".to_string()));
    }
    match address_kind(owner) {
        AddressKind::Ethereum => {
            let recovered = recover_ethereum_address(message, signature)?;
            if recovered.eq_ignore_ascii_case(owner) {
                Ok(())
            } else {
                Err(CryptoError::SignerMismatch(owner.to_string()))
            }
        }
        AddressKind::Bitcoin => {
            let expected = if parse_hex_pubkey(owner).is_some() {
                pubkey_to_address(owner)?
            } else {
                owner.to_string()
            };
            let recovered = recover_bitcoin_address(message, signature)?;
            if recovered == expected {
                Ok(())
            } else {
                Err(CryptoError::SignerMismatch(owner.to_string()))
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MESSAGE VERIFIER
// ════════════════════════════════════════════════════════════════════════════

/// Stateless verifier for registry messages (hash + signature).
///
/// Price compliance needs ledger data and lives in the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageVerifier;

impl MessageVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify(&self, message: &ApplicationMessage) -> Result<(), CryptoError> {
        verify_hash(message)?;
        let payload = message.signing_payload().map_err(|e| CryptoError::Encoding(e.to_string()))?;
        verify_signature(&message.owner_address, payload.as_bytes(), &message.signature)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// SIGNING (owner-side tooling)
// ════════════════════════════════════════════════════════════════════════════

fn signing_key(secret: &[u8]) -> Result<SigningKey, CryptoError> {
    SigningKey::from_slice(secret).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Ethereum address of a 32-byte secret key.
pub fn ethereum_address(secret: &[u8]) -> Result<String, CryptoError> {
    Ok(ethereum_address_of(signing_key(secret)?.verifying_key()))
}

/// P2PKH address of a 32-byte secret key.
pub fn bitcoin_address(secret: &[u8], compressed: bool) -> Result<String, CryptoError> {
    let key = signing_key(secret)?;
    Ok(p2pkh_address(key.verifying_key().to_encoded_point(compressed).as_bytes()))
}

/// Hex public key of a 32-byte secret key.
pub fn public_key_hex(secret: &[u8], compressed: bool) -> Result<String, CryptoError> {
    let key = signing_key(secret)?;
    Ok(hex::encode(key.verifying_key().to_encoded_point(compressed).as_bytes()))
}

/// EIP-191 signature as `0x` hex (r‖s‖v, v ∈ {27, 28}).
pub fn sign_ethereum_message(secret: &[u8], message: &[u8]) -> Result<String, CryptoError> {
    let key = signing_key(secret)?;
    let (sig, recid) = key
        .sign_prehash_recoverable(&ethereum_message_digest(message))
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let mut out = sig.to_bytes().to_vec();
    out.push(27 + recid.to_byte());
    Ok(format!("0x{}", hex::encode(out)))
}

/// Bitcoin message signature, base64 encoded.
pub fn sign_bitcoin_message(secret: &[u8], message: &[u8], compressed: bool) -> Result<String, CryptoError> {
    let key = signing_key(secret)?;
    let (sig, recid) = key
        .sign_prehash_recoverable(&bitcoin_message_digest(message))
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let header = 27 + recid.to_byte() + if compressed { 4 } else { 0 };
    let mut out = Vec::with_capacity(65);
    out.push(header);
    out.extend_from_slice(&sig.to_bytes());
    Ok(BASE64.encode(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; 32] = [7u8; 32];
    const OTHER: [u8; 32] = [9u8; 32];

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_address_kind() {
        assert_eq!(address_kind("0x52908400098527886E0F7030069857D2E4169EE7"), AddressKind::Ethereum);
        assert_eq!(address_kind("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"), AddressKind::Bitcoin);
        assert_eq!(address_kind("0x1234"), AddressKind::Bitcoin);
    }

    #[test]
    fn test_ethereum_sign_and_recover() {
        let addr = ethereum_address(&SECRET).expect("addr");
        let sig = sign_ethereum_message(&SECRET, b"hello fleet").expect("sign");
        assert!(verify_signature(&addr, b"hello fleet", &sig).is_ok());
        // Case-insensitive comparison
        assert!(verify_signature(&addr.to_uppercase().replace("0X", "0x"), b"hello fleet", &sig).is_ok());
        // Tampered message
        assert!(verify_signature(&addr, b"hello fleet!", &sig).is_err());
    }

    #[test]
    fn test_ethereum_wrong_signer() {
        let other = ethereum_address(&OTHER).expect("addr");
        let sig = sign_ethereum_message(&SECRET, b"m").expect("sign");
        assert_eq!(
            verify_signature(&other, b"m", &sig),
            Err(CryptoError::SignerMismatch(other.clone()))
        );
    }

    #[test]
    fn test_bitcoin_sign_and_recover_compressed_and_uncompressed() {
        for compressed in [true, false] {
            let addr = bitcoin_address(&SECRET, compressed).expect("addr");
            assert!(addr.starts_with('1'));
            let sig = sign_bitcoin_message(&SECRET, b"payload", compressed).expect("sign");
            assert!(verify_signature(&addr, b"payload", &sig).is_ok());
            assert!(verify_signature(&addr, b"other", &sig).is_err());
        }
    }

    #[test]
    fn test_bitcoin_owner_given_as_pubkey() {
        let pubkey = public_key_hex(&SECRET, true).expect("pk");
        let sig = sign_bitcoin_message(&SECRET, b"payload", true).expect("sign");
        assert!(verify_signature(&pubkey, b"payload", &sig).is_ok());
        assert_eq!(
            pubkey_to_address(&pubkey).expect("derive"),
            bitcoin_address(&SECRET, true).expect("addr")
        );
    }

    #[test]
    fn test_malformed_signatures_fail_closed() {
        let addr = ethereum_address(&SECRET).expect("addr");
        assert!(matches!(verify_signature(&addr, b"m", "0xzz"), Err(CryptoError::InvalidSignature(_))));
        assert!(matches!(verify_signature(&addr, b"m", "0x00"), Err(CryptoError::InvalidSignature(_))));
        let btc = bitcoin_address(&SECRET, true).expect("addr");
        assert!(matches!(verify_signature(&btc, b"m", "!!!"), Err(CryptoError::InvalidSignature(_))));
        assert!(verify_signature("", b"m", "x").is_err());
    }

    #[test]
    fn test_varint_boundaries() {
        let mut v = Vec::new();
        write_varint(&mut v, 0xfc);
        assert_eq!(v, vec![0xfc]);
        v.clear();
        write_varint(&mut v, 0xfd);
        assert_eq!(v, vec![0xfd, 0xfd, 0x00]);
    }
}
