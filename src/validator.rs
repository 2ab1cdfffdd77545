//! Decrypts an announcement payload and validates each candidate route's
//! ownership proof independently, producing a partial-success outcome.

use rsa::RsaPrivateKey;
use serde::Deserialize;
use thiserror::Error;

use crate::address::{self, Address};
use crate::crypto::{self, CryptoError, EcdsaSignature};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("missing required fields: {0}")]
    MissingFields(String),
    #[error("unsupported proof type: {0}")]
    UnsupportedProofType(String),
    #[error("ownership mismatch: derived {derived} != announced {announced}")]
    OwnershipMismatch { derived: String, announced: String },
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("url is not an absolute http(s) url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum DecryptionFailed {
    #[error("hybrid decryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RawAnnouncement {
    routes: Vec<RawRoute>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawRoute {
    pub addr: String,
    #[serde(rename = "proofType")]
    pub proof_type: String,
    pub url: String,
    pub sig: String,
    pub nonce: Option<u64>,
    pub salt: Option<String>,
    #[serde(rename = "initCodeHash")]
    pub init_code_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Witness {
    Create { nonce: u64 },
    Create2 { salt: [u8; 32], init_code_hash: [u8; 32] },
}

#[derive(Debug, Clone)]
pub struct ValidRoute {
    pub addr: Address,
    pub url: String,
    pub witness: Witness,
    pub signer: Address,
    pub raw: RawRoute,
}

#[derive(Debug, Clone)]
pub struct InvalidRoute {
    pub raw: RawRoute,
    pub error: RouteError,
}

#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub valid: Vec<ValidRoute>,
    pub invalid: Vec<InvalidRoute>,
}

/// Decrypts `payload` with `private_key` and validates every announced
/// route independently. A malformed/wrong-key payload is a single
/// terminal `DecryptionFailed`; once decrypted, each route's ownership
/// proof is checked on its own so one bad route never discards the rest.
pub fn validate_payload(private_key: &RsaPrivateKey, payload: &[u8]) -> Result<ValidationOutcome, DecryptionFailed> {
    let plaintext = crypto::hybrid_decrypt(private_key, payload)?;
    let announcement: RawAnnouncement = serde_json::from_slice(&plaintext)?;

    // Tie-break: when two routes in the same payload announce the same
    // addr, the last occurrence wins (deterministic array order).
    let mut by_addr: Vec<(String, RawRoute)> = Vec::new();
    for route in announcement.routes {
        if let Some(pos) = by_addr.iter().position(|(addr, _)| addr == &route.addr) {
            by_addr[pos].1 = route;
        } else {
            by_addr.push((route.addr.clone(), route));
        }
    }

    let mut outcome = ValidationOutcome::default();
    for (_, raw) in by_addr {
        match validate_one(&raw) {
            Ok(valid) => outcome.valid.push(valid),
            Err(error) => outcome.invalid.push(InvalidRoute { raw, error }),
        }
    }
    Ok(outcome)
}

fn validate_one(raw: &RawRoute) -> Result<ValidRoute, RouteError> {
    let addr = address::normalize(&raw.addr).map_err(|e| RouteError::InvalidAddress(e.to_string()))?;

    if !(raw.url.starts_with("http://") || raw.url.starts_with("https://")) {
        return Err(RouteError::InvalidUrl(raw.url.clone()));
    }

    let witness = parse_witness(raw)?;
    let signer = recover_signer(&addr, &raw.proof_type, &witness, &raw.url, &raw.sig)?;
    let derived = derive_address(signer, &witness);

    if derived != addr {
        return Err(RouteError::OwnershipMismatch {
            derived: derived.to_hex(),
            announced: addr.to_hex(),
        });
    }

    Ok(ValidRoute { addr, url: raw.url.clone(), witness, signer, raw: raw.clone() })
}

fn parse_witness(raw: &RawRoute) -> Result<Witness, RouteError> {
    match raw.proof_type.to_lowercase().as_str() {
        "create" => {
            let nonce = raw
                .nonce
                .ok_or_else(|| RouteError::MissingFields("create proof requires `nonce`".into()))?;
            Ok(Witness::Create { nonce })
        }
        "create2" => {
            let salt_hex = raw
                .salt
                .as_ref()
                .ok_or_else(|| RouteError::MissingFields("create2 proof requires `salt`".into()))?;
            let hash_hex = raw
                .init_code_hash
                .as_ref()
                .ok_or_else(|| RouteError::MissingFields("create2 proof requires `initCodeHash`".into()))?;
            let salt = decode_bytes32(salt_hex).map_err(RouteError::MissingFields)?;
            let init_code_hash = decode_bytes32(hash_hex).map_err(RouteError::MissingFields)?;
            Ok(Witness::Create2 { salt, init_code_hash })
        }
        other => Err(RouteError::UnsupportedProofType(other.to_string())),
    }
}

fn decode_bytes32(hex_str: &str) -> Result<[u8; 32], String> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(stripped).map_err(|e| e.to_string())?;
    bytes.try_into().map_err(|_| "expected 32 bytes".to_string())
}

fn witness_message_bytes(witness: &Witness) -> Vec<u8> {
    match witness {
        Witness::Create { nonce } => nonce.to_be_bytes().to_vec(),
        Witness::Create2 { salt, init_code_hash } => {
            let mut out = salt.to_vec();
            out.extend_from_slice(init_code_hash);
            out
        }
    }
}

/// Recovers the signer from `eip191Verify(addr||proofType||witness||url, sig)`.
fn recover_signer(
    addr: &Address,
    proof_type: &str,
    witness: &Witness,
    url: &str,
    sig_hex: &str,
) -> Result<Address, RouteError> {
    let mut message = Vec::new();
    message.extend_from_slice(addr.to_hex().as_bytes());
    message.extend_from_slice(proof_type.as_bytes());
    message.extend_from_slice(&witness_message_bytes(witness));
    message.extend_from_slice(url.as_bytes());

    let sig = EcdsaSignature::from_hex(sig_hex).map_err(|_| RouteError::SignatureInvalid)?;
    crypto::eip191_recover(&message, &sig).map_err(|_| RouteError::SignatureInvalid)
}

fn derive_address(signer: Address, witness: &Witness) -> Address {
    match *witness {
        Witness::Create { nonce } => address::create(signer, nonce),
        Witness::Create2 { salt, init_code_hash } => address::create2(signer, salt, init_code_hash),
    }
}
