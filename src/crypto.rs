//! RSA-2048 key management, hybrid RSA-OAEP/AES-256-CBC encryption,
//! EIP-191 personal-message ECDSA signing/recovery, and RSA signatures
//! over challenge blobs.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer as RsaSigner, Verifier as RsaVerifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::address::Address;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa error: {0}")]
    Rsa(String),
    #[error("aes error: {0}")]
    Aes(String),
    #[error("invalid hybrid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ecdsa recovery failed: {0}")]
    EcdsaRecovery(String),
    #[error("signature invalid")]
    SignatureInvalid,
}

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// The PKCS#8/SPKI-encoded RSA key pair persisted by the Store.
#[derive(Clone)]
pub struct RsaKeyPair {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| CryptoError::Rsa(format!("keygen failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self { private_key, public_key })
    }

    pub fn private_pem(&self) -> Result<String, CryptoError> {
        self.private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|z| z.to_string())
            .map_err(|e| CryptoError::Rsa(format!("pkcs8 encode failed: {e}")))
    }

    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::Rsa(format!("spki encode failed: {e}")))
    }

    pub fn from_pem(private_pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| CryptoError::Rsa(format!("pkcs8 decode failed: {e}")))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self { private_key, public_key })
    }

    pub fn public_key_from_pem(public_pem: &str) -> Result<RsaPublicKey, CryptoError> {
        RsaPublicKey::from_public_key_pem(public_pem)
            .map_err(|e| CryptoError::Rsa(format!("spki decode failed: {e}")))
    }
}

/// Wire representation of a hybrid-encrypted envelope (§6 of the spec).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridEnvelope {
    pub key: String,
    pub iv: String,
    pub data: String,
}

/// RSA-OAEP(SHA-256)-wraps a random AES-256 key, encrypts `plaintext`
/// under it with AES-256-CBC/PKCS7, and returns the envelope.
pub fn hybrid_encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<HybridEnvelope, CryptoError> {
    let mut rng = rand::thread_rng();
    let mut aes_key = [0u8; AES_KEY_LEN];
    let mut iv = [0u8; AES_IV_LEN];
    rng.fill_bytes(&mut aes_key);
    rng.fill_bytes(&mut iv);

    let ciphertext = aes_cbc_encrypt(&aes_key, &iv, plaintext);

    let padding = Oaep::new::<Sha256>();
    let wrapped_key = public_key
        .encrypt(&mut rng, padding, &aes_key)
        .map_err(|e| CryptoError::Rsa(format!("oaep wrap failed: {e}")))?;

    Ok(HybridEnvelope {
        key: BASE64.encode(wrapped_key),
        iv: BASE64.encode(iv),
        data: BASE64.encode(ciphertext),
    })
}

/// Accepts raw JSON, single-base64-wrapped JSON, or double-base64-wrapped
/// JSON, unwraps the AES key via the RSA private key, and AES-decrypts.
pub fn hybrid_decrypt(private_key: &RsaPrivateKey, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let json_bytes = unwrap_to_json(payload)?;
    let envelope: HybridEnvelope = serde_json::from_slice(&json_bytes)?;

    let wrapped_key = BASE64.decode(envelope.key.as_bytes())?;
    let iv_bytes = BASE64.decode(envelope.iv.as_bytes())?;
    let ciphertext = BASE64.decode(envelope.data.as_bytes())?;

    let padding = Oaep::new::<Sha256>();
    let aes_key = private_key
        .decrypt(padding, &wrapped_key)
        .map_err(|e| CryptoError::Rsa(format!("oaep unwrap failed: {e}")))?;

    let iv: [u8; AES_IV_LEN] = iv_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidEnvelope("iv must be 16 bytes".into()))?;

    aes_cbc_decrypt(&aes_key, &iv, &ciphertext)
}

/// Detects whether `payload` is already JSON, or needs one or two rounds
/// of base64 decoding before it is.
fn unwrap_to_json(payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if looks_like_json(payload) {
        return Ok(payload.to_vec());
    }
    let once = BASE64.decode(payload)?;
    if looks_like_json(&once) {
        return Ok(once);
    }
    let twice = BASE64.decode(&once)?;
    if looks_like_json(&twice) {
        return Ok(twice);
    }
    Err(CryptoError::InvalidEnvelope(
        "payload is neither JSON nor base64(JSON) nor base64(base64(JSON))".into(),
    ))
}

fn looks_like_json(bytes: &[u8]) -> bool {
    match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => true,
        _ => false,
    }
}

/// Session-key AES-256-CBC encryption, no RSA wrapping, used once a
/// challenge round has established a shared `sessionKey`.
pub fn session_encrypt(session_key: &[u8; AES_KEY_LEN], plaintext: &[u8]) -> HybridEnvelope {
    let mut rng = rand::thread_rng();
    let mut iv = [0u8; AES_IV_LEN];
    rng.fill_bytes(&mut iv);
    let ciphertext = aes_cbc_encrypt(session_key, &iv, plaintext);
    HybridEnvelope {
        key: String::new(),
        iv: BASE64.encode(iv),
        data: BASE64.encode(ciphertext),
    }
}

pub fn session_decrypt(session_key: &[u8; AES_KEY_LEN], envelope: &HybridEnvelope) -> Result<Vec<u8>, CryptoError> {
    let iv_bytes = BASE64.decode(envelope.iv.as_bytes())?;
    let iv: [u8; AES_IV_LEN] = iv_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidEnvelope("iv must be 16 bytes".into()))?;
    let ciphertext = BASE64.decode(envelope.data.as_bytes())?;
    aes_cbc_decrypt(session_key, &iv, &ciphertext)
}

fn aes_cbc_encrypt(key: &[u8], iv: &[u8; AES_IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).expect("key/iv are fixed-size");
    cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8; AES_IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::Aes(format!("bad key/iv length: {e}")))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Aes(format!("cbc decrypt failed: {e}")))
}

/// EIP-191 "personal message" prefix + keccak256.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// A 65-byte `r || s || v` secp256k1 signature, `v` being the recovery id
/// (0/1 or 27/28, both accepted).
#[derive(Debug, Clone, Copy)]
pub struct EcdsaSignature(pub [u8; 65]);

impl EcdsaSignature {
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))?;
        let arr: [u8; 65] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidEnvelope("signature must be 65 bytes".into()))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    fn recovery_id(&self) -> Result<RecoveryId, CryptoError> {
        let v = self.0[64];
        let normalized = if v >= 27 { v - 27 } else { v };
        RecoveryId::from_byte(normalized).ok_or_else(|| CryptoError::EcdsaRecovery("bad recovery id".into()))
    }

    fn signature(&self) -> Result<Signature, CryptoError> {
        Signature::from_slice(&self.0[..64]).map_err(|e| CryptoError::EcdsaRecovery(e.to_string()))
    }
}

/// Recovers the signer address from an EIP-191 message and signature.
pub fn eip191_recover(message: &[u8], sig: &EcdsaSignature) -> Result<Address, CryptoError> {
    let prehash = eip191_hash(message);
    let signature = sig.signature()?;
    let recid = sig.recovery_id()?;
    let verifying_key = VerifyingKey::recover_from_prehash(&prehash, &signature, recid)
        .map_err(|e| CryptoError::EcdsaRecovery(e.to_string()))?;
    Ok(address_from_verifying_key(&verifying_key))
}

/// Verifies that `sig` over `message` recovers to exactly `expected`.
pub fn eip191_verify(message: &[u8], sig: &EcdsaSignature, expected: Address) -> bool {
    matches!(eip191_recover(message, sig), Ok(addr) if addr == expected)
}

/// Signs an EIP-191 message with a local secp256k1 key (used only by
/// tests / fixtures — the proxy itself never signs route announcements).
pub fn eip191_sign(signing_key: &SigningKey, message: &[u8]) -> EcdsaSignature {
    let prehash = eip191_hash(message);
    let (sig, recid) = signing_key
        .sign_prehash_recoverable(&prehash)
        .expect("signing a 32-byte prehash cannot fail");
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&sig.to_bytes());
    out[64] = recid.to_byte();
    EcdsaSignature(out)
}

fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    let uncompressed = key.to_encoded_point(false);
    let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address(out)
}

/// RSASSA-PKCS1v15(SHA-256) over the canonical-JSON serialization of a
/// challenge blob.
pub fn rsa_sign_json(private_key: &RsaPrivateKey, value: &serde_json::Value) -> Result<String, CryptoError> {
    let canonical = canonical_json(value);
    let signing_key = RsaSigningKey::<Sha256>::new(private_key.clone());
    let signature: RsaSignature = signing_key.try_sign(canonical.as_bytes()).map_err(|_| CryptoError::SignatureInvalid)?;
    Ok(BASE64.encode(signature.to_bytes()))
}

pub fn rsa_verify_json(public_key: &RsaPublicKey, value: &serde_json::Value, signature_b64: &str) -> Result<(), CryptoError> {
    let canonical = canonical_json(value);
    let bytes = BASE64.decode(signature_b64.as_bytes())?;
    let signature = RsaSignature::try_from(bytes.as_slice()).map_err(|_| CryptoError::SignatureInvalid)?;
    let verifying_key = RsaVerifyingKey::<Sha256>::new(public_key.clone());
    verifying_key
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

/// Serializes `value` with object keys sorted lexicographically at every
/// level, so the same logical object always produces the same bytes
/// regardless of construction order. Used as the signing/verification
/// input for challenge blobs.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn encode(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(k).unwrap());
                    out.push(':');
                    encode(&map[*k], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    encode(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    encode(value, &mut out);
    out
}

pub fn random_bytes_32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hybrid_round_trips_small_message() {
        let keys = RsaKeyPair::generate().unwrap();
        let plaintext = b"hello relay";
        let envelope = hybrid_encrypt(&keys.public_key, plaintext).unwrap();
        let json = serde_json::to_vec(&envelope).unwrap();
        let decrypted = hybrid_decrypt(&keys.private_key, &json).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn hybrid_decrypt_accepts_single_base64_wrap() {
        let keys = RsaKeyPair::generate().unwrap();
        let plaintext = b"wrapped once";
        let envelope = hybrid_encrypt(&keys.public_key, plaintext).unwrap();
        let json = serde_json::to_vec(&envelope).unwrap();
        let wrapped_once = BASE64.encode(&json);
        let decrypted = hybrid_decrypt(&keys.private_key, wrapped_once.as_bytes()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn hybrid_decrypt_accepts_double_base64_wrap() {
        let keys = RsaKeyPair::generate().unwrap();
        let plaintext = b"wrapped twice";
        let envelope = hybrid_encrypt(&keys.public_key, plaintext).unwrap();
        let json = serde_json::to_vec(&envelope).unwrap();
        let wrapped_twice = BASE64.encode(BASE64.encode(&json));
        let decrypted = hybrid_decrypt(&keys.private_key, wrapped_twice.as_bytes()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn hybrid_round_trips_large_message() {
        let keys = RsaKeyPair::generate().unwrap();
        let plaintext = vec![0x5au8; 1024 * 1024];
        let envelope = hybrid_encrypt(&keys.public_key, &plaintext).unwrap();
        let json = serde_json::to_vec(&envelope).unwrap();
        let decrypted = hybrid_decrypt(&keys.private_key, &json).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn pem_round_trips() {
        let keys = RsaKeyPair::generate().unwrap();
        let private_pem = keys.private_pem().unwrap();
        let reloaded = RsaKeyPair::from_pem(&private_pem).unwrap();
        let plaintext = b"after reload";
        let envelope = hybrid_encrypt(&reloaded.public_key, plaintext).unwrap();
        let json = serde_json::to_vec(&envelope).unwrap();
        let decrypted = hybrid_decrypt(&keys.private_key, &json).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn ecdsa_sign_and_recover_round_trip() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let verifying_key = VerifyingKey::from(&signing_key);
        let expected = address_from_verifying_key(&verifying_key);

        let message = b"addr||CREATE||0||https://prover.example";
        let sig = eip191_sign(&signing_key, message);
        let recovered = eip191_recover(message, &sig).unwrap();
        assert_eq!(recovered, expected);
        assert!(eip191_verify(message, &sig, expected));
    }

    #[test]
    fn ecdsa_verify_rejects_wrong_signer() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let other_key = SigningKey::random(&mut rand::thread_rng());
        let other_addr = address_from_verifying_key(&VerifyingKey::from(&other_key));

        let message = b"some challenge blob";
        let sig = eip191_sign(&signing_key, message);
        assert!(!eip191_verify(message, &sig, other_addr));
    }

    #[test]
    fn rsa_signature_round_trips_and_rejects_tamper() {
        let keys = RsaKeyPair::generate().unwrap();
        let blob = serde_json::json!({"b": 2, "a": 1});
        let sig = rsa_sign_json(&keys.private_key, &blob).unwrap();
        assert!(rsa_verify_json(&keys.public_key, &blob, &sig).is_ok());

        let tampered = serde_json::json!({"b": 3, "a": 1});
        assert!(rsa_verify_json(&keys.public_key, &tampered, &sig).is_err());
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = serde_json::json!({"b": 2, "a": 1});
        let b = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }
}
