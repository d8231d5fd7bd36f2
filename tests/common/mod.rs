//! Shared fixture: deterministic actors over an in-memory chain, with every
//! submitted transaction run through signature checks and the consensus
//! dispatcher before acceptance.

use cc_dex::chain::MemoryChain;
use cc_dex::keys::KeyStore;
use cc_dex::script::Script;
use cc_dex::txbuilder::verify_tx_signatures;
use cc_dex::types::{Amount, PubKey, Transaction, TxId};
use cc_dex::validate::Validator;

pub const GENESIS_TIME: u64 = 1_600_000_000;

pub struct Actor {
    pub keystore: KeyStore,
    pub pk: PubKey,
}

pub fn actor(tag: u8) -> Actor {
    let mut keystore = KeyStore::new();
    let mut secret = [tag; 32];
    secret[0] = 1;
    let pk = keystore.add_secret(&secret).expect("test secret");
    Actor { keystore, pk }
}

pub fn fund(chain: &mut MemoryChain, who: &Actor, amount: Amount) {
    chain.fund_address(Script::pay_to_pubkey(&who.pk), amount);
}

/// Check signatures, run the consensus dispatcher, and accept into the
/// mempool. Every test transaction goes through this gate.
pub fn submit(chain: &mut MemoryChain, tx: Transaction) -> TxId {
    verify_tx_signatures(chain, &tx).expect("input signatures");
    Validator::new(chain).validate_tx(&tx).expect("consensus predicates");
    chain.accept_tx(tx).expect("utxo availability")
}
