//! Consensus entry point: route each CC-spending input of a transaction to
//! its module predicate.
//!
//! The host calls [`Validator::validate_tx`] for every transaction entering a
//! block or the mempool. Eval codes are read from the spent conditions; each
//! `(txid, eval)` pair is judged once per epoch and memoised, so a
//! transaction spending many outputs of one contract costs one predicate run.

use crate::chain::ChainView;
use crate::constants::{EVAL_ASSETS, EVAL_ASSETS_V2, EVAL_HEIR, EVAL_TOKENS, EVAL_TOKENS_V2};
use crate::error::ValidationError;
use crate::keys::{self, CcFulfillment};
use crate::opret::TokenVersion;
use crate::types::{Transaction, TxId};
use crate::{assets, heir, tokens};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, instrument};

/// Per-epoch validation state. Construct one per block or mempool pass; the
/// memo is cleared by [`Validator::begin_epoch`] between passes.
pub struct Validator<'a, C: ChainView + ?Sized> {
    chain: &'a C,
    memo: RefCell<HashSet<(TxId, u8)>>,
}

impl<'a, C: ChainView + ?Sized> Validator<'a, C> {
    pub fn new(chain: &'a C) -> Self {
        Self {
            chain,
            memo: RefCell::new(HashSet::new()),
        }
    }

    /// Drop all memoised verdicts (a new block/mempool pass begins).
    pub fn begin_epoch(&self) {
        self.memo.borrow_mut().clear();
    }

    /// Validate every CC-spending input of `tx`. A transaction without CC
    /// inputs passes vacuously.
    #[instrument(skip(self, tx), fields(txid = %tx.txid()))]
    pub fn validate_tx(&self, tx: &Transaction) -> Result<(), ValidationError> {
        let txid = tx.txid();

        // gather the eval codes of all spent conditions, deterministically;
        // secondary evals of unknown modules (NFT class tags) are recorded
        // but only dispatched when a predicate exists for them
        let mut primary = BTreeSet::new();
        let mut secondary = BTreeSet::new();
        for vin in &tx.inputs {
            if !keys::is_cc_input(&vin.script_sig) {
                continue;
            }
            let fulfillment = CcFulfillment::decode(&vin.script_sig)
                .ok_or_else(|| ValidationError::invalid("undecodable CC input fulfillment"))?;
            let prevout = self
                .chain
                .prevout(&vin.prevout)
                .map_err(|e| ValidationError::invalid(e.to_string()))?;
            if !fulfillment.matches_output(&prevout.script) {
                return Err(ValidationError::invalid(
                    "fulfillment does not reproduce the spent condition",
                ));
            }
            let evals = fulfillment.condition.evals();
            primary.insert(evals[0]);
            secondary.extend(evals.iter().skip(1).copied());
        }

        for eval in primary {
            self.run_predicate(txid, eval, tx, true)?;
        }
        for eval in secondary {
            self.run_predicate(txid, eval, tx, false)?;
        }
        Ok(())
    }

    fn run_predicate(
        &self,
        txid: TxId,
        eval: u8,
        tx: &Transaction,
        required: bool,
    ) -> Result<(), ValidationError> {
        if self.memo.borrow().contains(&(txid, eval)) {
            debug!(eval, "memoised verdict");
            return Ok(());
        }
        match self.dispatch(eval, tx) {
            Ok(()) => {
                self.memo.borrow_mut().insert((txid, eval));
                Ok(())
            }
            // an eval with no predicate here is an external module's class
            // tag; only a condition led by it is rejected
            Err(ValidationError::UnknownEval(_)) if !required => {
                debug!(eval, "no predicate for secondary eval, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch(&self, eval: u8, tx: &Transaction) -> Result<(), ValidationError> {
        match eval {
            EVAL_TOKENS => tokens::validate_token_tx(self.chain, TokenVersion::V1, tx),
            EVAL_TOKENS_V2 => tokens::validate_token_tx(self.chain, TokenVersion::V2, tx),
            EVAL_ASSETS => assets::validate_assets_tx(self.chain, TokenVersion::V1, tx),
            EVAL_ASSETS_V2 => assets::validate_assets_tx(self.chain, TokenVersion::V2, tx),
            EVAL_HEIR => heir::validate_heir_tx(self.chain, tx),
            other => Err(ValidationError::UnknownEval(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::script::Script;
    use crate::types::{PubKey, TxIn, TxOut};

    #[test]
    fn plain_tx_passes_vacuously() {
        let mut chain = MemoryChain::new(0);
        let pk = PubKey([2u8; 33]);
        let funded = chain.fund_address(Script::pay_to_pubkey(&pk), 10_000);
        chain.mine_block(60);

        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(funded));
        tx.inputs[0].script_sig = vec![0x01; 98];
        tx.outputs.push(TxOut::new(10_000, Script::pay_to_pubkey(&pk)));

        let validator = Validator::new(&chain);
        validator.validate_tx(&tx).unwrap();
    }

    #[test]
    fn unknown_eval_is_rejected() {
        let chain = MemoryChain::new(0);
        let validator = Validator::new(&chain);
        let tx = Transaction::new();
        assert!(matches!(
            validator.dispatch(0x99, &tx),
            Err(ValidationError::UnknownEval(0x99))
        ));
    }
}
