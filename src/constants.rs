//! Eval codes, fee constants, and the per-module key table.

use crate::keys::pubkey_from_secret;
use crate::types::{Amount, PubKey, TxId};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// One-byte module selector embedded in every crypto-condition.
pub const EVAL_TOKENS: u8 = 0xf2;
pub const EVAL_TOKENS_V2: u8 = 0xf5;
pub const EVAL_ASSETS: u8 = 0xe4;
pub const EVAL_ASSETS_V2: u8 = 0xf6;
pub const EVAL_HEIR: u8 = 0xea;

/// Default transaction fee applied when a caller passes 0.
pub const DEFAULT_TXFEE: Amount = 10_000;

/// Marker output amount accompanying every order transaction.
pub const ASSETS_MARKER_AMOUNT: Amount = 10_000;

/// Marker output amount for heir plan discovery.
pub const HEIR_MARKER_AMOUNT: Amount = 10_000;

/// Chain unit: satoshis per coin.
pub const COIN: Amount = 100_000_000;

/// Royalty basis: N/1000 of each fill goes to the token owner.
pub const ROYALTY_DIVISOR: Amount = 1000;

/// Upper bound for the royalty numerator; larger values clamp here.
pub const ROYALTY_MAX: Amount = ROYALTY_DIVISOR - 1;

pub const TOKEN_NAME_MAX: usize = 32;
pub const TOKEN_DESCRIPTION_MAX: usize = 4096;

/// Published pubkey that is not a curve point: outputs paid here can never be
/// signed for. Burning a token means paying its full supply to this key.
pub const BURN_PUBKEY: PubKey = PubKey([
    0x02, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad,
    0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde, 0xad, 0xde,
    0xad, 0xde, 0xad,
]);

/// Per-module "unspendable" key material.
///
/// The secrets are published constants: anyone can produce a signature for a
/// module's global address, and only the module predicate decides whether the
/// spend stands. Registered once at startup, immutable afterwards.
#[derive(Clone, Copy, Debug)]
pub struct ModuleKeys {
    pub secret: [u8; 32],
    pub pubkey: PubKey,
}

static MODULE_KEYS: Lazy<BTreeMap<u8, ModuleKeys>> = Lazy::new(|| {
    let mut table = BTreeMap::new();
    let mut register = |eval: u8, secret: [u8; 32]| {
        table.insert(
            eval,
            ModuleKeys {
                secret,
                pubkey: pubkey_from_secret(&secret),
            },
        );
    };
    register(
        EVAL_TOKENS,
        [
            0x1b, 0x0c, 0x2e, 0x95, 0x42, 0x7c, 0x24, 0x31, 0xe5, 0xec, 0x65, 0xd3, 0x1a, 0xa5,
            0x14, 0xa9, 0x8f, 0x35, 0x73, 0x7b, 0x0e, 0x24, 0xba, 0x4f, 0x5a, 0x9c, 0x21, 0x25,
            0x23, 0x87, 0xbe, 0x53,
        ],
    );
    register(
        EVAL_TOKENS_V2,
        [
            0x6d, 0x25, 0x74, 0x3c, 0x71, 0x3b, 0x11, 0x49, 0x8e, 0x23, 0x7c, 0x9b, 0x3f, 0x8c,
            0x65, 0x21, 0xca, 0x4f, 0x0e, 0x1d, 0x82, 0x96, 0x37, 0x50, 0x91, 0x6a, 0x04, 0xda,
            0xc5, 0x33, 0x9c, 0x41,
        ],
    );
    register(
        EVAL_ASSETS,
        [
            0x87, 0x29, 0x13, 0x03, 0x70, 0x44, 0x72, 0xba, 0x2f, 0x9c, 0x40, 0x7a, 0x2b, 0xc8,
            0xf2, 0x11, 0x31, 0x8e, 0x26, 0x86, 0x78, 0x15, 0x29, 0x8b, 0x9d, 0xcb, 0x5b, 0x7e,
            0xfb, 0x4a, 0x01, 0x5e,
        ],
    );
    register(
        EVAL_ASSETS_V2,
        [
            0x4c, 0x3a, 0x92, 0x06, 0x5a, 0x26, 0x31, 0xf8, 0x94, 0x5d, 0x0f, 0xea, 0x2c, 0x85,
            0x17, 0xcc, 0x50, 0x6f, 0xbe, 0x43, 0x12, 0x7d, 0xc9, 0x02, 0x88, 0x7a, 0xe5, 0x39,
            0x61, 0x5b, 0x24, 0x7d,
        ],
    );
    register(
        EVAL_HEIR,
        [
            0x9d, 0x41, 0x07, 0x54, 0x2b, 0xc3, 0x55, 0x82, 0x73, 0x16, 0xee, 0x59, 0x0c, 0x4f,
            0x99, 0x3d, 0xc8, 0x62, 0x8f, 0xa0, 0x35, 0x7e, 0x28, 0x1c, 0x43, 0x9b, 0x5d, 0x6a,
            0x8b, 0x27, 0x70, 0x62,
        ],
    );
    table
});

/// Key material for a module's global unspendable address. Core modules come
/// from the registered table; auxiliary eval codes (NFT classes, extra
/// markers) get a key derived from a tagged hash of the eval byte, so every
/// module has a stable published address.
pub fn module_keys(eval: u8) -> ModuleKeys {
    if let Some(keys) = MODULE_KEYS.get(&eval) {
        return *keys;
    }
    let mut seed = b"cc-module-unspendable-".to_vec();
    seed.push(eval);
    let secret = crate::types::sha256d(&seed);
    ModuleKeys {
        secret,
        pubkey: pubkey_from_secret(&secret),
    }
}

/// The module's global unspendable pubkey.
pub fn global_pubkey(eval: u8) -> PubKey {
    module_keys(eval).pubkey
}

/// Sentinel pubkey derived from a txid; used for plan-scoped P2PK markers.
/// No party holds a private key for it.
pub fn txid_pubkey(txid: &TxId) -> PubKey {
    let mut bytes = [0u8; 33];
    bytes[0] = 0x02;
    bytes[1..33].copy_from_slice(&txid.0);
    PubKey(bytes)
}
