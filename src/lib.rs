//! Crypto-condition contracts for a Bitcoin-derived UTXO chain: colored-coin
//! tokens, an on-chain token/coin order book, and a time-locked inheritance
//! escrow, together with the consensus dispatcher that judges every
//! CC-spending input.
//!
//! The host node supplies chain access through [`chain::ChainView`] and calls
//! [`validate::Validator::validate_tx`] on the acceptance path; wallets call
//! the builder functions in [`tokens`], [`assets`], and [`heir`] to produce
//! signed transactions. All contract state lives in the UTXO set; there are
//! no resident order books or plan caches.

pub mod assets;
pub mod chain;
pub mod condition;
pub mod constants;
pub mod error;
pub mod heir;
pub mod keys;
pub mod opret;
pub mod script;
pub mod tokens;
pub mod txbuilder;
pub mod types;
pub mod validate;

pub use chain::{ChainView, MemoryChain};
pub use condition::Condition;
pub use error::{CcError, DecodeError, ValidationError};
pub use keys::{KeyStore, Keypair};
pub use opret::TokenVersion;
pub use script::Script;
pub use types::{Amount, Outpoint, PubKey, Transaction, TxId};
pub use validate::Validator;
