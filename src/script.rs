//! Output scripts and address derivation.
//!
//! Three script shapes exist on this chain: pay-to-pubkey, pay-to-crypto-
//! condition, and op-return data carriers. Scripts are kept as opaque bytes;
//! the consensus test for "is this a token vout" is byte-exact reconstruction,
//! so equality on the raw encoding is the authoritative comparison.

use crate::condition::Condition;
use crate::types::{read_compact_size, write_compact_size, PubKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

const OP_RETURN: u8 = 0x6a;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKCRYPTOCONDITION: u8 = 0xcc;

/// Base58Check version byte for this chain's addresses.
const ADDRESS_PREFIX: u8 = 60;

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `<pubkey> OP_CHECKSIG`
    pub fn pay_to_pubkey(pk: &PubKey) -> Self {
        let mut bytes = Vec::with_capacity(35);
        bytes.push(33);
        bytes.extend_from_slice(&pk.0);
        bytes.push(OP_CHECKSIG);
        Script(bytes)
    }

    /// `<condition encoding> OP_CHECKCRYPTOCONDITION`
    pub fn pay_to_condition(cond: &Condition) -> Self {
        let encoding = cond.encode();
        let mut bytes = Vec::with_capacity(encoding.len() + 3);
        write_compact_size(&mut bytes, encoding.len() as u64);
        bytes.extend_from_slice(&encoding);
        bytes.push(OP_CHECKCRYPTOCONDITION);
        Script(bytes)
    }

    /// `OP_RETURN <payload>`
    pub fn op_return(payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(payload.len() + 3);
        bytes.push(OP_RETURN);
        write_compact_size(&mut bytes, payload.len() as u64);
        bytes.extend_from_slice(payload);
        Script(bytes)
    }

    pub fn is_op_return(&self) -> bool {
        self.0.first() == Some(&OP_RETURN)
    }

    pub fn is_pay_to_condition(&self) -> bool {
        self.0.last() == Some(&OP_CHECKCRYPTOCONDITION)
    }

    pub fn op_return_data(&self) -> Option<&[u8]> {
        if !self.is_op_return() {
            return None;
        }
        let mut pos = 1;
        let len = read_compact_size(&self.0, &mut pos)? as usize;
        self.0.get(pos..pos.checked_add(len)?)
    }

    pub fn as_pay_to_pubkey(&self) -> Option<PubKey> {
        if self.0.len() == 35 && self.0[0] == 33 && self.0[34] == OP_CHECKSIG {
            PubKey::from_slice(&self.0[1..34])
        } else {
            None
        }
    }

    /// Decode the embedded crypto-condition, if this is a CC script.
    pub fn condition(&self) -> Option<Condition> {
        if !self.is_pay_to_condition() {
            return None;
        }
        let mut pos = 0;
        let len = read_compact_size(&self.0, &mut pos)? as usize;
        let end = pos.checked_add(len)?;
        let body = self.0.get(pos..end)?;
        if end + 1 != self.0.len() {
            return None;
        }
        Condition::decode(body).ok()
    }

    /// Canonical textual address of this script.
    pub fn address(&self) -> String {
        base58check_encode(ADDRESS_PREFIX, &hash160(&self.0))
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut body = Vec::with_capacity(payload.len() + 5);
    body.push(version);
    body.extend_from_slice(payload);
    let checksum = crate::types::sha256d(&body);
    body.extend_from_slice(&checksum[..4]);
    bs58::encode(body).into_string()
}

pub fn base58check_decode(s: &str) -> Option<(u8, Vec<u8>)> {
    let body = bs58::decode(s).into_vec().ok()?;
    if body.len() < 5 {
        return None;
    }
    let (data, checksum) = body.split_at(body.len() - 4);
    if crate::types::sha256d(data)[..4] != *checksum {
        return None;
    }
    Some((data[0], data[1..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_pk() -> PubKey {
        let mut bytes = [0x11u8; 33];
        bytes[0] = 0x02;
        PubKey(bytes)
    }

    #[test]
    fn p2pk_roundtrip() {
        let pk = some_pk();
        let script = Script::pay_to_pubkey(&pk);
        assert_eq!(script.as_pay_to_pubkey(), Some(pk));
        assert!(!script.is_op_return());
        assert!(!script.is_pay_to_condition());
    }

    #[test]
    fn op_return_roundtrip() {
        let payload = vec![0xde, 0xad, 0xbe, 0xef];
        let script = Script::op_return(&payload);
        assert_eq!(script.op_return_data(), Some(payload.as_slice()));
        assert_eq!(script.as_pay_to_pubkey(), None);
    }

    #[test]
    fn base58check_roundtrip() {
        let addr = base58check_encode(ADDRESS_PREFIX, &[7u8; 20]);
        let (version, payload) = base58check_decode(&addr).unwrap();
        assert_eq!(version, ADDRESS_PREFIX);
        assert_eq!(payload, vec![7u8; 20]);
    }

    #[test]
    fn base58check_rejects_bad_checksum() {
        let addr = base58check_encode(ADDRESS_PREFIX, &[7u8; 20]);
        let mut corrupted = addr.into_bytes();
        let last = corrupted.last_mut().unwrap();
        *last = if *last == b'2' { b'3' } else { b'2' };
        assert!(base58check_decode(std::str::from_utf8(&corrupted).unwrap()).is_none());
    }

    #[test]
    fn addresses_differ_by_script() {
        let a = Script::pay_to_pubkey(&some_pk()).address();
        let b = Script::op_return(&[1]).address();
        assert_ne!(a, b);
    }
}
