//! Op-return payload codec.
//!
//! Every payload begins `{eval, funcid, version}` and is strict on decode:
//! trailing bytes are an error. Asset payloads are nested inside token
//! transfer payloads; heir payloads appear either bare (coin plans) or nested
//! (token plans). The heir fundingtxid is byte-reversed on the wire, a
//! historical quirk that must be preserved bit-exactly, and is confined to
//! this module.

use crate::constants::{
    EVAL_ASSETS, EVAL_ASSETS_V2, EVAL_HEIR, EVAL_TOKENS, EVAL_TOKENS_V2, ROYALTY_MAX,
};
use crate::error::DecodeError;
use crate::types::{read_compact_size, write_compact_size, Amount, PubKey, TxId};

// ---------------------------------------------------------------------------
// byte reader / writer
// ---------------------------------------------------------------------------

pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn i64_le(mut self, v: i64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn varint(mut self, v: u64) -> Self {
        write_compact_size(&mut self.buf, v);
        self
    }

    pub fn varstr(mut self, v: &[u8]) -> Self {
        write_compact_size(&mut self.buf, v.len() as u64);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn txid(self, v: &TxId) -> Self {
        self.bytes(&v.0)
    }

    /// Heir wire convention: txids stored byte-reversed.
    pub fn txid_reversed(self, v: &TxId) -> Self {
        self.bytes(&v.reversed().0)
    }

    pub fn pubkey(self, v: &PubKey) -> Self {
        self.bytes(&v.0)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let v = *self.data.get(self.pos).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(v)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::UnexpectedEnd)?;
        let v = self.data.get(self.pos..end).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos = end;
        Ok(v)
    }

    pub fn i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    pub fn varint(&mut self) -> Result<u64, DecodeError> {
        read_compact_size(self.data, &mut self.pos).ok_or(DecodeError::UnexpectedEnd)
    }

    pub fn varstr(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.varint()? as usize;
        self.bytes(len)
    }

    pub fn txid(&mut self) -> Result<TxId, DecodeError> {
        Ok(TxId(self.bytes(32)?.try_into().unwrap()))
    }

    pub fn txid_reversed(&mut self) -> Result<TxId, DecodeError> {
        Ok(self.txid()?.reversed())
    }

    pub fn pubkey(&mut self) -> Result<PubKey, DecodeError> {
        Ok(PubKey::from_slice(self.bytes(33)?).unwrap())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }
}

// ---------------------------------------------------------------------------
// token payloads
// ---------------------------------------------------------------------------

/// Token contract generation, selecting eval code and funcid alphabet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenVersion {
    V1,
    V2,
}

impl TokenVersion {
    pub fn eval(self) -> u8 {
        match self {
            TokenVersion::V1 => EVAL_TOKENS,
            TokenVersion::V2 => EVAL_TOKENS_V2,
        }
    }

    pub fn assets_eval(self) -> u8 {
        match self {
            TokenVersion::V1 => EVAL_ASSETS,
            TokenVersion::V2 => EVAL_ASSETS_V2,
        }
    }

    pub fn create_funcid(self) -> u8 {
        match self {
            TokenVersion::V1 => b'c',
            TokenVersion::V2 => b'C',
        }
    }

    pub fn transfer_funcid(self) -> u8 {
        match self {
            TokenVersion::V1 => b't',
            TokenVersion::V2 => b'T',
        }
    }

    /// V2 publishes anonymised ("mixed") conditions.
    pub fn is_mixed(self) -> bool {
        matches!(self, TokenVersion::V2)
    }

    pub fn from_eval(eval: u8) -> Option<Self> {
        match eval {
            EVAL_TOKENS => Some(TokenVersion::V1),
            EVAL_TOKENS_V2 => Some(TokenVersion::V2),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenCreate {
    pub ver: TokenVersion,
    pub origpubkey: PubKey,
    pub name: String,
    pub description: String,
    /// Blob 0, when present, is the NFT data blob.
    pub blobs: Vec<Vec<u8>>,
}

impl TokenCreate {
    pub fn nft_blob(&self) -> Option<&[u8]> {
        self.blobs.first().filter(|b| !b.is_empty()).map(|b| b.as_slice())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new()
            .u8(self.ver.eval())
            .u8(self.ver.create_funcid())
            .u8(1)
            .pubkey(&self.origpubkey)
            .varstr(self.name.as_bytes())
            .varstr(self.description.as_bytes())
            .varint(self.blobs.len() as u64);
        for blob in &self.blobs {
            w = w.varstr(blob);
        }
        w.finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenTransfer {
    pub ver: TokenVersion,
    pub tokenid: TxId,
    /// Intended receivers of the token vouts, used by the validator to
    /// reconstruct and byte-match the vout scripts.
    pub dest_pubkeys: Vec<PubKey>,
    /// Blob 0, when present, nests an asset or heir payload.
    pub blobs: Vec<Vec<u8>>,
}

impl TokenTransfer {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new()
            .u8(self.ver.eval())
            .u8(self.ver.transfer_funcid())
            .u8(1)
            .txid(&self.tokenid)
            .varint(self.dest_pubkeys.len() as u64);
        for pk in &self.dest_pubkeys {
            w = w.pubkey(pk);
        }
        w = w.varint(self.blobs.len() as u64);
        for blob in &self.blobs {
            w = w.varstr(blob);
        }
        w.finish()
    }

    pub fn nested_blob(&self) -> Option<&[u8]> {
        self.blobs.first().filter(|b| !b.is_empty()).map(|b| b.as_slice())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenPayload {
    Create(TokenCreate),
    Transfer(TokenTransfer),
}

impl TokenPayload {
    pub fn version(&self) -> TokenVersion {
        match self {
            TokenPayload::Create(c) => c.ver,
            TokenPayload::Transfer(t) => t.ver,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            TokenPayload::Create(c) => c.encode(),
            TokenPayload::Transfer(t) => t.encode(),
        }
    }
}

pub fn decode_token_payload(data: &[u8]) -> Result<TokenPayload, DecodeError> {
    let mut r = ByteReader::new(data);
    let eval = r.u8()?;
    let ver = TokenVersion::from_eval(eval).ok_or(DecodeError::UnexpectedEval(eval))?;
    let funcid = r.u8()?;
    let version = r.u8()?;
    if version != 1 {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let payload = if funcid == ver.create_funcid() {
        let origpubkey = r.pubkey()?;
        let name = String::from_utf8_lossy(r.varstr()?).into_owned();
        let description = String::from_utf8_lossy(r.varstr()?).into_owned();
        let blobs = read_blobs(&mut r)?;
        TokenPayload::Create(TokenCreate {
            ver,
            origpubkey,
            name,
            description,
            blobs,
        })
    } else if funcid == ver.transfer_funcid() {
        let tokenid = r.txid()?;
        let pk_count = r.varint()? as usize;
        if pk_count > 2 {
            return Err(DecodeError::Malformed("too many receiver pubkeys"));
        }
        let mut dest_pubkeys = Vec::with_capacity(pk_count);
        for _ in 0..pk_count {
            dest_pubkeys.push(r.pubkey()?);
        }
        let blobs = read_blobs(&mut r)?;
        TokenPayload::Transfer(TokenTransfer {
            ver,
            tokenid,
            dest_pubkeys,
            blobs,
        })
    } else {
        return Err(DecodeError::UnknownFuncId(funcid));
    };

    r.finish()?;
    Ok(payload)
}

fn read_blobs(r: &mut ByteReader<'_>) -> Result<Vec<Vec<u8>>, DecodeError> {
    let count = r.varint()? as usize;
    if count > 8 {
        return Err(DecodeError::Malformed("too many payload blobs"));
    }
    let mut blobs = Vec::with_capacity(count);
    for _ in 0..count {
        blobs.push(r.varstr()?.to_vec());
    }
    Ok(blobs)
}

// ---------------------------------------------------------------------------
// asset payloads (nested in token transfers)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetFuncId {
    /// Open bid.
    Bid,
    /// Bid after a partial fill.
    BidPartial,
    /// Open ask.
    Ask,
    /// Ask after a partial fill.
    AskPartial,
    /// Bid cancelled, coins returned.
    CancelBid,
    /// Ask cancelled, tokens returned.
    CancelAsk,
    /// Reserved asset-for-asset swap; decoded but never built or validated.
    SwapReserved(u8),
}

impl AssetFuncId {
    pub fn as_byte(self) -> u8 {
        match self {
            AssetFuncId::Bid => b'b',
            AssetFuncId::BidPartial => b'B',
            AssetFuncId::Ask => b's',
            AssetFuncId::AskPartial => b'S',
            AssetFuncId::CancelBid => b'o',
            AssetFuncId::CancelAsk => b'x',
            AssetFuncId::SwapReserved(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'b' => Some(AssetFuncId::Bid),
            b'B' => Some(AssetFuncId::BidPartial),
            b's' => Some(AssetFuncId::Ask),
            b'S' => Some(AssetFuncId::AskPartial),
            b'o' => Some(AssetFuncId::CancelBid),
            b'x' => Some(AssetFuncId::CancelAsk),
            b'e' | b'E' => Some(AssetFuncId::SwapReserved(b)),
            _ => None,
        }
    }

    pub fn is_bid_side(self) -> bool {
        matches!(self, AssetFuncId::Bid | AssetFuncId::BidPartial)
    }

    pub fn is_ask_side(self) -> bool {
        matches!(self, AssetFuncId::Ask | AssetFuncId::AskPartial)
    }

    pub fn is_open_order(self) -> bool {
        self.is_bid_side() || self.is_ask_side()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetPayload {
    pub ver: TokenVersion,
    pub funcid: AssetFuncId,
    /// Second tokenid of the reserved swap path; zero everywhere else.
    pub other_id: TxId,
    pub unit_price: Amount,
    pub origpubkey: PubKey,
}

impl AssetPayload {
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new()
            .u8(self.ver.assets_eval())
            .u8(self.funcid.as_byte())
            .u8(1)
            .txid(&self.other_id)
            .i64_le(self.unit_price)
            .varstr(&self.origpubkey.0)
            .finish()
    }
}

pub fn decode_asset_payload(data: &[u8]) -> Result<AssetPayload, DecodeError> {
    let mut r = ByteReader::new(data);
    let eval = r.u8()?;
    let ver = match eval {
        EVAL_ASSETS => TokenVersion::V1,
        EVAL_ASSETS_V2 => TokenVersion::V2,
        other => return Err(DecodeError::UnexpectedEval(other)),
    };
    let funcid_byte = r.u8()?;
    let funcid = AssetFuncId::from_byte(funcid_byte).ok_or(DecodeError::UnknownFuncId(funcid_byte))?;
    let version = r.u8()?;
    if version != 1 {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let other_id = r.txid()?;
    let unit_price = r.i64_le()?;
    let origpubkey_bytes = r.varstr()?;
    let origpubkey =
        PubKey::from_slice(origpubkey_bytes).ok_or(DecodeError::Malformed("origpubkey size"))?;
    r.finish()?;
    Ok(AssetPayload {
        ver,
        funcid,
        other_id,
        unit_price,
        origpubkey,
    })
}

/// Decode an order op-return: a token transfer payload with a nested asset
/// payload. Returns the tokenid together with the order fields.
pub fn decode_asset_opret(opret_data: &[u8]) -> Result<(TxId, AssetPayload), DecodeError> {
    match decode_token_payload(opret_data)? {
        TokenPayload::Transfer(transfer) => {
            let blob = transfer
                .nested_blob()
                .ok_or(DecodeError::Malformed("no nested asset payload"))?;
            let asset = decode_asset_payload(blob)?;
            Ok((transfer.tokenid, asset))
        }
        TokenPayload::Create(_) => Err(DecodeError::Malformed("create opret carries no order")),
    }
}

/// Build an order op-return: token transfer wrapper embedding the asset blob.
pub fn encode_asset_opret(
    tokenid: &TxId,
    dest_pubkeys: Vec<PubKey>,
    asset: &AssetPayload,
) -> Vec<u8> {
    TokenTransfer {
        ver: asset.ver,
        tokenid: *tokenid,
        dest_pubkeys,
        blobs: vec![asset.encode()],
    }
    .encode()
}

// ---------------------------------------------------------------------------
// heir payloads
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeirCreate {
    pub owner: PubKey,
    pub heir: PubKey,
    pub inactivity_secs: i64,
    pub name: String,
    pub memo: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeirSuccessor {
    pub funcid: u8, // b'A' or b'C'
    pub fundingtxid: TxId,
    pub has_spending_begun: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeirPayload {
    Create(HeirCreate),
    Successor(HeirSuccessor),
}

impl HeirPayload {
    pub fn funcid(&self) -> u8 {
        match self {
            HeirPayload::Create(_) => b'F',
            HeirPayload::Successor(s) => s.funcid,
        }
    }

    /// Encode in the v1 layout. Legacy v0 is decode-only.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HeirPayload::Create(c) => ByteWriter::new()
                .u8(EVAL_HEIR)
                .u8(b'F')
                .u8(1)
                .pubkey(&c.owner)
                .pubkey(&c.heir)
                .i64_le(c.inactivity_secs)
                .varstr(c.name.as_bytes())
                .varstr(c.memo.as_bytes())
                .finish(),
            HeirPayload::Successor(s) => ByteWriter::new()
                .u8(EVAL_HEIR)
                .u8(s.funcid)
                .u8(1)
                .txid_reversed(&s.fundingtxid)
                .u8(s.has_spending_begun as u8)
                .finish(),
        }
    }
}

/// Decode a heir payload, accepting the legacy v0 layout (no version byte, no
/// memo on `F`) before the current v1 one.
pub fn decode_heir_payload(data: &[u8]) -> Result<HeirPayload, DecodeError> {
    if let Ok(payload) = decode_heir_v0(data) {
        return Ok(payload);
    }
    decode_heir_v1(data)
}

fn decode_heir_v1(data: &[u8]) -> Result<HeirPayload, DecodeError> {
    let mut r = ByteReader::new(data);
    let eval = r.u8()?;
    if eval != EVAL_HEIR {
        return Err(DecodeError::UnexpectedEval(eval));
    }
    let funcid = r.u8()?;
    let version = r.u8()?;
    if version != 1 {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let payload = match funcid {
        b'F' => HeirPayload::Create(HeirCreate {
            owner: r.pubkey()?,
            heir: r.pubkey()?,
            inactivity_secs: r.i64_le()?,
            name: String::from_utf8_lossy(r.varstr()?).into_owned(),
            memo: String::from_utf8_lossy(r.varstr()?).into_owned(),
        }),
        b'A' | b'C' => HeirPayload::Successor(HeirSuccessor {
            funcid,
            fundingtxid: r.txid_reversed()?,
            has_spending_begun: r.u8()? != 0,
        }),
        other => return Err(DecodeError::UnknownFuncId(other)),
    };
    r.finish()?;
    Ok(payload)
}

fn decode_heir_v0(data: &[u8]) -> Result<HeirPayload, DecodeError> {
    let mut r = ByteReader::new(data);
    let eval = r.u8()?;
    if eval != EVAL_HEIR {
        return Err(DecodeError::UnexpectedEval(eval));
    }
    let funcid = r.u8()?;
    let payload = match funcid {
        b'F' => HeirPayload::Create(HeirCreate {
            owner: r.pubkey()?,
            heir: r.pubkey()?,
            inactivity_secs: r.i64_le()?,
            name: String::from_utf8_lossy(r.varstr()?).into_owned(),
            memo: String::new(),
        }),
        b'A' | b'C' => HeirPayload::Successor(HeirSuccessor {
            funcid,
            fundingtxid: r.txid_reversed()?,
            has_spending_begun: r.u8()? != 0,
        }),
        other => return Err(DecodeError::UnknownFuncId(other)),
    };
    r.finish()?;
    Ok(payload)
}

/// Decode a heir op-return that may be bare (coin plan) or nested inside a
/// token transfer (token plan). Returns the tokenid for token plans.
pub fn decode_heir_either(opret_data: &[u8]) -> Result<(Option<TxId>, HeirPayload), DecodeError> {
    match opret_data.first() {
        Some(&eval) if TokenVersion::from_eval(eval).is_some() => {
            match decode_token_payload(opret_data)? {
                TokenPayload::Transfer(transfer) => {
                    let blob = transfer
                        .nested_blob()
                        .ok_or(DecodeError::Malformed("no nested heir payload"))?;
                    Ok((Some(transfer.tokenid), decode_heir_payload(blob)?))
                }
                TokenPayload::Create(_) => {
                    Err(DecodeError::Malformed("create opret carries no heir payload"))
                }
            }
        }
        _ => Ok((None, decode_heir_payload(opret_data)?)),
    }
}

// ---------------------------------------------------------------------------
// NFT data blob
// ---------------------------------------------------------------------------

const NFT_PROP_ID: u8 = 1;
const NFT_PROP_URL: u8 = 2;
const NFT_PROP_ROYALTY: u8 = 3;
const NFT_PROP_ARBITRARY: u8 = 4;

/// Decoded NFT blob. The first byte selects the NFT class eval code; the body
/// is a property list. Unknown properties are skipped by length.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NftData {
    pub eval_code: u8,
    pub id: Option<u64>,
    pub url: Option<String>,
    /// Royalty numerator N of N/1000, clamped to 999 on read.
    pub royalty: Amount,
    pub arbitrary: Option<Vec<u8>>,
}

impl NftData {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new().u8(self.eval_code).u8(1);
        if let Some(id) = self.id {
            w = w.u8(NFT_PROP_ID).varstr(&id.to_le_bytes());
        }
        if let Some(url) = &self.url {
            w = w.u8(NFT_PROP_URL).varstr(url.as_bytes());
        }
        if self.royalty > 0 {
            w = w.u8(NFT_PROP_ROYALTY).varstr(&(self.royalty as u64).to_le_bytes());
        }
        if let Some(data) = &self.arbitrary {
            w = w.u8(NFT_PROP_ARBITRARY).varstr(data);
        }
        w.finish()
    }
}

pub fn decode_nft_blob(blob: &[u8]) -> Result<NftData, DecodeError> {
    let mut r = ByteReader::new(blob);
    let eval_code = r.u8()?;
    let version = r.u8()?;
    if version != 1 {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let mut data = NftData {
        eval_code,
        ..Default::default()
    };
    while r.remaining() > 0 {
        let prop = r.u8()?;
        let value = r.varstr()?;
        match prop {
            NFT_PROP_ID => {
                let bytes: [u8; 8] =
                    value.try_into().map_err(|_| DecodeError::Malformed("nft id size"))?;
                data.id = Some(u64::from_le_bytes(bytes));
            }
            NFT_PROP_URL => data.url = Some(String::from_utf8_lossy(value).into_owned()),
            NFT_PROP_ROYALTY => {
                let bytes: [u8; 8] = value
                    .try_into()
                    .map_err(|_| DecodeError::Malformed("royalty size"))?;
                data.royalty = (u64::from_le_bytes(bytes) as Amount).min(ROYALTY_MAX);
            }
            NFT_PROP_ARBITRARY => data.arbitrary = Some(value.to_vec()),
            _ => {} // unknown property, skipped
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(tag: u8) -> PubKey {
        let mut bytes = [tag; 33];
        bytes[0] = 0x02;
        PubKey(bytes)
    }

    #[test]
    fn token_create_roundtrip() {
        for ver in [TokenVersion::V1, TokenVersion::V2] {
            let payload = TokenPayload::Create(TokenCreate {
                ver,
                origpubkey: pk(1),
                name: "DUKE".into(),
                description: "a token".into(),
                blobs: vec![],
            });
            assert_eq!(decode_token_payload(&payload.encode()), Ok(payload));
        }
    }

    #[test]
    fn token_transfer_roundtrip_with_nested_blob() {
        let payload = TokenPayload::Transfer(TokenTransfer {
            ver: TokenVersion::V1,
            tokenid: TxId([9; 32]),
            dest_pubkeys: vec![pk(1), pk(2)],
            blobs: vec![vec![0xe4, 1, 2, 3]],
        });
        assert_eq!(decode_token_payload(&payload.encode()), Ok(payload));
    }

    #[test]
    fn token_decode_rejects_trailing_bytes() {
        let payload = TokenPayload::Create(TokenCreate {
            ver: TokenVersion::V1,
            origpubkey: pk(1),
            name: "T".into(),
            description: String::new(),
            blobs: vec![],
        });
        let mut bytes = payload.encode();
        bytes.push(0);
        assert_eq!(decode_token_payload(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn asset_payload_roundtrip_all_funcids() {
        for funcid_byte in [b'b', b'B', b's', b'S', b'o', b'x', b'e', b'E'] {
            let payload = AssetPayload {
                ver: TokenVersion::V1,
                funcid: AssetFuncId::from_byte(funcid_byte).unwrap(),
                other_id: TxId::zero(),
                unit_price: 100_000,
                origpubkey: pk(3),
            };
            assert_eq!(decode_asset_payload(&payload.encode()), Ok(payload));
        }
    }

    #[test]
    fn asset_opret_nests_in_token_transfer() {
        let asset = AssetPayload {
            ver: TokenVersion::V1,
            funcid: AssetFuncId::Bid,
            other_id: TxId::zero(),
            unit_price: 5000,
            origpubkey: pk(4),
        };
        let tokenid = TxId([7; 32]);
        let opret = encode_asset_opret(&tokenid, vec![], &asset);
        let (decoded_tokenid, decoded) = decode_asset_opret(&opret).unwrap();
        assert_eq!(decoded_tokenid, tokenid);
        assert_eq!(decoded, asset);
    }

    #[test]
    fn heir_v1_roundtrip() {
        let create = HeirPayload::Create(HeirCreate {
            owner: pk(1),
            heir: pk(2),
            inactivity_secs: 3600,
            name: "plan".into(),
            memo: "for the kids".into(),
        });
        assert_eq!(decode_heir_payload(&create.encode()), Ok(create));

        let claim = HeirPayload::Successor(HeirSuccessor {
            funcid: b'C',
            fundingtxid: TxId([0xaa; 32]),
            has_spending_begun: true,
        });
        assert_eq!(decode_heir_payload(&claim.encode()), Ok(claim));
    }

    #[test]
    fn heir_fundingtxid_is_reversed_on_the_wire() {
        let fundingtxid = TxId(std::array::from_fn(|i| i as u8));
        let payload = HeirPayload::Successor(HeirSuccessor {
            funcid: b'A',
            fundingtxid,
            has_spending_begun: false,
        });
        let bytes = payload.encode();
        // eval, funcid, version, then the txid bytes reversed
        assert_eq!(bytes[3], 31);
        assert_eq!(bytes[34], 0);
    }

    #[test]
    fn heir_v0_fallback() {
        // v0 'F': no version byte, no memo
        let v0 = ByteWriter::new()
            .u8(EVAL_HEIR)
            .u8(b'F')
            .pubkey(&pk(1))
            .pubkey(&pk(2))
            .i64_le(7200)
            .varstr(b"old plan")
            .finish();
        let decoded = decode_heir_payload(&v0).unwrap();
        match decoded {
            HeirPayload::Create(c) => {
                assert_eq!(c.owner, pk(1));
                assert_eq!(c.inactivity_secs, 7200);
                assert_eq!(c.name, "old plan");
                assert_eq!(c.memo, "");
            }
            _ => panic!("expected create"),
        }

        // v0 'C': no version byte
        let v0_claim = ByteWriter::new()
            .u8(EVAL_HEIR)
            .u8(b'C')
            .txid_reversed(&TxId([5; 32]))
            .u8(1)
            .finish();
        let decoded = decode_heir_payload(&v0_claim).unwrap();
        assert_eq!(
            decoded,
            HeirPayload::Successor(HeirSuccessor {
                funcid: b'C',
                fundingtxid: TxId([5; 32]),
                has_spending_begun: true,
            })
        );
    }

    #[test]
    fn heir_either_handles_nested_and_bare() {
        let payload = HeirPayload::Successor(HeirSuccessor {
            funcid: b'A',
            fundingtxid: TxId([1; 32]),
            has_spending_begun: false,
        });

        let (tokenid, bare) = decode_heir_either(&payload.encode()).unwrap();
        assert_eq!(tokenid, None);
        assert_eq!(bare, payload);

        let wrapped = TokenTransfer {
            ver: TokenVersion::V1,
            tokenid: TxId([2; 32]),
            dest_pubkeys: vec![pk(1), pk(2)],
            blobs: vec![payload.encode()],
        }
        .encode();
        let (tokenid, nested) = decode_heir_either(&wrapped).unwrap();
        assert_eq!(tokenid, Some(TxId([2; 32])));
        assert_eq!(nested, payload);
    }

    #[test]
    fn nft_blob_roundtrip_and_clamp() {
        let data = NftData {
            eval_code: 0xf7,
            id: Some(12),
            url: Some("ipfs://x".into()),
            royalty: 50,
            arbitrary: None,
        };
        assert_eq!(decode_nft_blob(&data.encode()), Ok(data));

        // royalty numerator 1000 clamps to 999 on read
        let over = NftData {
            eval_code: 0xf7,
            royalty: 1000,
            ..Default::default()
        };
        let decoded = decode_nft_blob(&over.encode()).unwrap();
        assert_eq!(decoded.royalty, 999);
    }
}
