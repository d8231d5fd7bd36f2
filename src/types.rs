use crate::script::Script;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Satoshi amount. Signed so that arithmetic underflow in fill calculations
/// is representable and rejectable instead of wrapping.
pub type Amount = i64;

/// Transaction hash (double SHA-256 of the consensus serialization).
///
/// Stored in internal byte order; displayed reversed-hex like every other
/// Bitcoin-derived chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn zero() -> Self {
        TxId([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from the reversed-hex display form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        let mut rev = arr;
        rev.reverse();
        Some(TxId(rev))
    }

    /// Byte-reversed copy (the heir payloads store txids reversed on the wire).
    pub fn reversed(&self) -> Self {
        let mut rev = self.0;
        rev.reverse();
        TxId(rev)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        write!(f, "{}", hex::encode(rev))
    }
}

impl std::fmt::Debug for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxId({})", self)
    }
}

impl Serialize for TxId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TxId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid txid hex"))
    }
}

/// Reference to a transaction output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub txid: TxId,
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: TxId, vout: u32) -> Self {
        Self { txid, vout }
    }
}

/// Compressed secp256k1 public key container.
///
/// Deliberately unvalidated: sentinel keys (the burn key, txid-derived marker
/// keys) are not curve points. Curve validity is only demanded where a
/// signature is produced or checked, in `keys`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey(pub [u8; 33]);

impl PubKey {
    pub fn empty() -> Self {
        PubKey([0u8; 33])
    }

    /// True when the container holds something that looks like a compressed key.
    pub fn is_set(&self) -> bool {
        self.0[0] == 0x02 || self.0[0] == 0x03
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 33] = bytes.try_into().ok()?;
        Some(PubKey(arr))
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        Self::from_slice(&hex::decode(s).ok()?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubKey({})", self.to_hex())
    }
}

impl Serialize for PubKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PubKey::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid pubkey hex"))
    }
}

/// Transaction input: outpoint plus the script satisfying the spent output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: Outpoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: Outpoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

/// Transaction output: amount plus locking script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script: Script,
}

impl TxOut {
    pub fn new(value: Amount, script: Script) -> Self {
        Self { value, script }
    }
}

/// A chain transaction in builder or validation form.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            version: 4,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    /// Consensus serialization: LE integers, compact-size counts, varstr
    /// scripts. Signatures are part of the hashed body, matching the host
    /// chain's non-segwit txid rule.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.version.to_le_bytes());
        write_compact_size(&mut out, self.inputs.len() as u64);
        for vin in &self.inputs {
            out.extend_from_slice(&vin.prevout.txid.0);
            out.extend_from_slice(&vin.prevout.vout.to_le_bytes());
            write_compact_size(&mut out, vin.script_sig.len() as u64);
            out.extend_from_slice(&vin.script_sig);
            out.extend_from_slice(&vin.sequence.to_le_bytes());
        }
        write_compact_size(&mut out, self.outputs.len() as u64);
        for vout in &self.outputs {
            out.extend_from_slice(&vout.value.to_le_bytes());
            let script = vout.script.as_bytes();
            write_compact_size(&mut out, script.len() as u64);
            out.extend_from_slice(script);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn txid(&self) -> TxId {
        TxId(sha256d(&self.encode()))
    }

    /// The op-return script of the last output, if there is one.
    pub fn opret(&self) -> Option<&Script> {
        self.outputs.last().map(|v| &v.script).filter(|s| s.is_op_return())
    }
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Bitcoin compact-size encoding.
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub fn read_compact_size(data: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *data.get(*pos)?;
    *pos += 1;
    Some(match first {
        0xfd => {
            let b = data.get(*pos..*pos + 2)?;
            *pos += 2;
            u16::from_le_bytes(b.try_into().unwrap()) as u64
        }
        0xfe => {
            let b = data.get(*pos..*pos + 4)?;
            *pos += 4;
            u32::from_le_bytes(b.try_into().unwrap()) as u64
        }
        0xff => {
            let b = data.get(*pos..*pos + 8)?;
            *pos += 8;
            u64::from_le_bytes(b.try_into().unwrap())
        }
        n => n as u64,
    })
}
