//! CREATE / CREATE2 contract-address derivation and address normalization.

use crate::rlp;
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A 20-byte Ethereum address, always held and displayed lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn to_hex(self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Strips an optional `0x` prefix, requires exactly 40 hex characters,
/// and returns the lowercase-normalized address.
pub fn normalize(addr: &str) -> Result<Address, AddressError> {
    let stripped = addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X")).unwrap_or(addr);
    if stripped.len() != 40 {
        return Err(AddressError::InvalidAddress(format!(
            "expected 40 hex chars, got {}",
            stripped.len()
        )));
    }
    let bytes = hex::decode(stripped)
        .map_err(|e| AddressError::InvalidAddress(format!("not valid hex: {e}")))?;
    let arr: [u8; 20] = bytes
        .try_into()
        .map_err(|_| AddressError::InvalidAddress("decoded to wrong length".into()))?;
    Ok(Address(arr))
}

fn lower20(hash: &[u8]) -> Address {
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[hash.len() - 20..]);
    Address(out)
}

/// `CREATE` address: `lower20(keccak256(rlp([deployer, nonce])))`.
pub fn create(deployer: Address, nonce: u64) -> Address {
    let nonce_bytes = minimal_be_bytes(nonce);
    let encoded = rlp::encode_list(&[
        rlp::encode_bytes(&deployer.0),
        rlp::encode_bytes(&nonce_bytes),
    ]);
    let hash = Keccak256::digest(&encoded);
    lower20(&hash)
}

/// `CREATE2` address: `lower20(keccak256(0xff || deployer || salt || initCodeHash))`.
pub fn create2(deployer: Address, salt: [u8; 32], init_code_hash: [u8; 32]) -> Address {
    let mut buf = Vec::with_capacity(1 + 20 + 32 + 32);
    buf.push(0xff);
    buf.extend_from_slice(&deployer.0);
    buf.extend_from_slice(&salt);
    buf.extend_from_slice(&init_code_hash);
    let hash = Keccak256::digest(&buf);
    lower20(&hash)
}

/// RLP integers are encoded as their minimal big-endian byte string; a
/// value of zero is the empty string.
fn minimal_be_bytes(value: u64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let full = value.to_be_bytes();
    let first_nonzero = full.iter().position(|&b| b != 0).unwrap();
    full[first_nonzero..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_with_and_without_prefix() {
        let addr = "f0d9b927f64374f0b48cbe56bc6af212d52ee25a";
        let a = normalize(addr).unwrap();
        let b = normalize(&format!("0x{addr}")).unwrap();
        let c = normalize(&format!("0X{}", addr.to_uppercase())).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.to_hex(), format!("0x{addr}"));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(normalize("0xabc").is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(normalize("zz00000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn create_is_deterministic_and_nonce_sensitive() {
        let deployer = normalize("6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0").unwrap();
        let a0 = create(deployer, 0);
        let a0_again = create(deployer, 0);
        let a1 = create(deployer, 1);
        assert_eq!(a0, a0_again);
        assert_ne!(a0, a1);
    }

    #[test]
    fn create2_is_deterministic_and_salt_sensitive() {
        let deployer = normalize("0000000000000000000000000000000000000000").unwrap();
        let init_code_hash = [0u8; 32];
        let a = create2(deployer, [0u8; 32], init_code_hash);
        let a_again = create2(deployer, [0u8; 32], init_code_hash);
        let b = create2(deployer, [1u8; 32], init_code_hash);
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }
}
