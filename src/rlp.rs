//! Minimal RLP decoder for legacy and EIP-2718 transaction envelopes.
//!
//! Only decoding is implemented — the proxy never constructs or signs
//! transactions, it only needs to read the `to` field out of one it
//! was handed.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RlpError {
    #[error("malformed RLP: {0}")]
    MalformedRlp(String),
    #[error("empty input")]
    EmptyInput,
}

/// A decoded RLP item: either a byte string or a list of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Bytes(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Item::Bytes(b) => Some(b),
            Item::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            Item::Bytes(_) => None,
        }
    }
}

/// Decodes a single top-level RLP item, ignoring any trailing bytes.
pub fn decode(input: &[u8]) -> Result<Item, RlpError> {
    if input.is_empty() {
        return Err(RlpError::EmptyInput);
    }
    let (item, _) = decode_one(input)?;
    Ok(item)
}

/// Decodes a single top-level RLP item and returns it together with the
/// number of bytes that were consumed.
pub fn decode_one(input: &[u8]) -> Result<(Item, usize), RlpError> {
    if input.is_empty() {
        return Err(RlpError::MalformedRlp("truncated input".into()));
    }
    let prefix = input[0];
    match prefix {
        0x00..=0x7f => Ok((Item::Bytes(vec![prefix]), 1)),
        0x80..=0xb7 => {
            let len = (prefix - 0x80) as usize;
            let body = slice(input, 1, len)?;
            Ok((Item::Bytes(body.to_vec()), 1 + len))
        }
        0xb8..=0xbf => {
            let len_of_len = (prefix - 0xb7) as usize;
            let len_bytes = slice(input, 1, len_of_len)?;
            let len = be_bytes_to_usize(len_bytes)?;
            let body = slice(input, 1 + len_of_len, len)?;
            Ok((Item::Bytes(body.to_vec()), 1 + len_of_len + len))
        }
        0xc0..=0xf7 => {
            let len = (prefix - 0xc0) as usize;
            let body = slice(input, 1, len)?;
            let items = decode_list_body(body)?;
            Ok((Item::List(items), 1 + len))
        }
        0xf8..=0xff => {
            let len_of_len = (prefix - 0xf7) as usize;
            let len_bytes = slice(input, 1, len_of_len)?;
            let len = be_bytes_to_usize(len_bytes)?;
            let body = slice(input, 1 + len_of_len, len)?;
            let items = decode_list_body(body)?;
            Ok((Item::List(items), 1 + len_of_len + len))
        }
    }
}

fn decode_list_body(mut body: &[u8]) -> Result<Vec<Item>, RlpError> {
    let mut items = Vec::new();
    while !body.is_empty() {
        let (item, consumed) = decode_one(body)?;
        items.push(item);
        body = &body[consumed..];
    }
    Ok(items)
}

fn slice(input: &[u8], start: usize, len: usize) -> Result<&[u8], RlpError> {
    let end = start
        .checked_add(len)
        .ok_or_else(|| RlpError::MalformedRlp("length overflow".into()))?;
    if end > input.len() {
        return Err(RlpError::MalformedRlp(format!(
            "expected {len} bytes at offset {start}, got {}",
            input.len().saturating_sub(start)
        )));
    }
    Ok(&input[start..end])
}

fn be_bytes_to_usize(bytes: &[u8]) -> Result<usize, RlpError> {
    if bytes.len() > std::mem::size_of::<usize>() {
        return Err(RlpError::MalformedRlp("length field too large".into()));
    }
    let mut buf = [0u8; std::mem::size_of::<usize>()];
    buf[std::mem::size_of::<usize>() - bytes.len()..].copy_from_slice(bytes);
    Ok(usize::from_be_bytes(buf))
}

/// Transaction type as signalled by the first byte of an EIP-2718 envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxEnvelope {
    Legacy,
    Eip2930,
    Eip1559,
}

impl TxEnvelope {
    /// Index of the `to` field within the decoded list, per transaction type.
    fn to_index(self) -> usize {
        match self {
            TxEnvelope::Legacy => 3,
            TxEnvelope::Eip2930 => 4,
            TxEnvelope::Eip1559 => 5,
        }
    }
}

fn classify(raw: &[u8]) -> Result<(TxEnvelope, &[u8]), RlpError> {
    if raw.is_empty() {
        return Err(RlpError::EmptyInput);
    }
    match raw[0] {
        0x01 => Ok((TxEnvelope::Eip2930, &raw[1..])),
        0x02 => Ok((TxEnvelope::Eip1559, &raw[1..])),
        _ => Ok((TxEnvelope::Legacy, raw)),
    }
}

/// Extracts the `to` address (lowercase `0x`-prefixed hex) from a raw,
/// signed transaction. Returns `Ok(None)` for a contract-creation
/// transaction (empty `to` field).
///
/// The type byte dictates the field layout deterministically; there is
/// no fallback heuristic across indices.
pub fn extract_to(raw: &[u8]) -> Result<Option<String>, RlpError> {
    let (envelope, body) = classify(raw)?;
    let decoded = decode(body)?;
    let fields = decoded
        .as_list()
        .ok_or_else(|| RlpError::MalformedRlp("transaction envelope is not a list".into()))?;
    let idx = envelope.to_index();
    let to_item = fields
        .get(idx)
        .ok_or_else(|| RlpError::MalformedRlp(format!("missing field at index {idx}")))?;
    let to_bytes = to_item
        .as_bytes()
        .ok_or_else(|| RlpError::MalformedRlp("`to` field is not a byte string".into()))?;
    if to_bytes.is_empty() {
        return Ok(None);
    }
    if to_bytes.len() != 20 {
        return Err(RlpError::MalformedRlp(format!(
            "`to` field has {} bytes, expected 20",
            to_bytes.len()
        )));
    }
    Ok(Some(format!("0x{}", hex::encode(to_bytes))))
}

/// Encodes a byte string using the canonical RLP string rules. Used by
/// `AddressDeriver::create` to build `rlp([deployer, nonce])`.
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = encode_length(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

/// Encodes a list of already-encoded items using the canonical RLP list rules.
pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let body: Vec<u8> = items.iter().flat_map(|i| i.iter().copied()).collect();
    let mut out = encode_length(body.len(), 0xc0);
    out.extend_from_slice(&body);
    out
}

fn encode_length(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        vec![offset + len as u8]
    } else {
        let len_bytes = len.to_be_bytes();
        let first_nonzero = len_bytes.iter().position(|&b| b != 0).unwrap_or(len_bytes.len() - 1);
        let trimmed = &len_bytes[first_nonzero..];
        let mut out = vec![offset + 55 + trimmed.len() as u8];
        out.extend_from_slice(trimmed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_byte() {
        assert_eq!(decode(&[0x01]).unwrap(), Item::Bytes(vec![0x01]));
    }

    #[test]
    fn decodes_short_string() {
        let input = [0x83, b'd', b'o', b'g'];
        assert_eq!(decode(&input).unwrap(), Item::Bytes(b"dog".to_vec()));
    }

    #[test]
    fn decodes_empty_string() {
        assert_eq!(decode(&[0x80]).unwrap(), Item::Bytes(vec![]));
    }

    #[test]
    fn decodes_short_list() {
        let input = [0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g'];
        let decoded = decode(&input).unwrap();
        assert_eq!(
            decoded,
            Item::List(vec![Item::Bytes(b"cat".to_vec()), Item::Bytes(b"dog".to_vec())])
        );
    }

    #[test]
    fn round_trips_encode_bytes_and_list() {
        let a = encode_bytes(b"cat");
        let b = encode_bytes(b"dog");
        let list = encode_list(&[a, b]);
        let decoded = decode(&list).unwrap();
        assert_eq!(
            decoded,
            Item::List(vec![Item::Bytes(b"cat".to_vec()), Item::Bytes(b"dog".to_vec())])
        );
    }

    #[test]
    fn round_trips_long_string() {
        let data = vec![0x42u8; 100];
        let encoded = encode_bytes(&data);
        assert_eq!(decode(&encoded).unwrap(), Item::Bytes(data));
    }

    #[test]
    fn fails_on_truncated_input() {
        let err = decode(&[0x83, b'd', b'o']).unwrap_err();
        assert!(matches!(err, RlpError::MalformedRlp(_)));
    }

    // Legacy tx layout: list of [nonce, gasPrice, gasLimit, to(20 bytes), value, data, v, r, s]
    #[test]
    fn extracts_to_from_legacy_tx() {
        let to_addr: [u8; 20] = hex::decode("f0d9b927f64374f0b48cbe56bc6af212d52ee25a")
            .unwrap()
            .try_into()
            .unwrap();
        let nonce = encode_bytes(&[]);
        let gas_price = encode_bytes(&[]);
        let gas_limit = encode_bytes(&[]);
        let to = encode_bytes(&to_addr);
        let value = encode_bytes(&[0x0du8]);
        let data = encode_bytes(&[]);
        let v = encode_bytes(&[0x1b]);
        let r = encode_bytes(&[0x01]);
        let s = encode_bytes(&[0x01]);
        let raw = encode_list(&[nonce, gas_price, gas_limit, to, value, data, v, r, s]);

        let extracted = extract_to(&raw).unwrap().unwrap();
        assert_eq!(extracted, format!("0x{}", hex::encode(to_addr)));
    }

    #[test]
    fn extracts_none_for_contract_creation() {
        let nonce = encode_bytes(&[]);
        let gas_price = encode_bytes(&[]);
        let gas_limit = encode_bytes(&[]);
        let to = encode_bytes(&[]);
        let value = encode_bytes(&[]);
        let data = encode_bytes(&[0xfeu8]);
        let v = encode_bytes(&[0x1b]);
        let r = encode_bytes(&[0x01]);
        let s = encode_bytes(&[0x01]);
        let tx = encode_list(&[nonce, gas_price, gas_limit, to, value, data, v, r, s]);
        assert_eq!(extract_to(&tx).unwrap(), None);
    }

    #[test]
    fn classifies_eip1559_index() {
        // type byte 0x02, then a list; field 5 (0-indexed) is `to`.
        let chain_id = encode_bytes(&[0x01]);
        let nonce = encode_bytes(&[]);
        let max_priority = encode_bytes(&[]);
        let max_fee = encode_bytes(&[]);
        let gas_limit = encode_bytes(&[]);
        let to_addr = [0x42u8; 20];
        let to = encode_bytes(&to_addr);
        let value = encode_bytes(&[]);
        let data = encode_bytes(&[]);
        let access_list = encode_list(&[]);
        let v = encode_bytes(&[]);
        let r = encode_bytes(&[]);
        let s = encode_bytes(&[]);
        let body = encode_list(&[
            chain_id,
            nonce,
            max_priority,
            max_fee,
            gas_limit,
            to,
            value,
            data,
            access_list,
            v,
            r,
            s,
        ]);
        let mut raw = vec![0x02u8];
        raw.extend_from_slice(&body);
        let extracted = extract_to(&raw).unwrap().unwrap();
        assert_eq!(extracted, format!("0x{}", hex::encode(to_addr)));
    }
}
