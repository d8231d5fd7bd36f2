//! Transaction assembly and finalization.
//!
//! Builders collect inputs against a target, attach outputs in the shape each
//! contract prescribes, and finalize: pay the fee, return change to the payer,
//! append the op-return, and sign every input. Crypto-condition inputs are
//! signed by matching the spent script against the registered probe
//! conditions, the shapes (and optional published secrets) the caller
//! expects to be spending.

use crate::chain::ChainView;
use crate::condition::Condition;
use crate::error::CcError;
use crate::keys::{
    self, is_cc_input, normal_script_sig, CcFulfillment, KeyStore, Keypair,
};
use crate::script::Script;
use crate::types::{Amount, PubKey, Transaction, TxIn, TxOut};
use tracing::debug;

/// Maximum vins a selector will push, matching the host chain's practical
/// limit on CC transactions.
pub const MAX_VINS: usize = 1024;

/// A condition shape the signer should try against CC vins, with the secret
/// to use. `None` means the payer's own wallet key.
#[derive(Clone, Debug)]
pub struct ProbeCondition {
    pub condition: Condition,
    pub secret: Option<[u8; 32]>,
}

pub struct TxAssembler<'a, C: ChainView + ?Sized> {
    chain: &'a C,
    pub tx: Transaction,
    probes: Vec<ProbeCondition>,
}

impl<'a, C: ChainView + ?Sized> TxAssembler<'a, C> {
    pub fn new(chain: &'a C) -> Self {
        Self {
            chain,
            tx: Transaction::new(),
            probes: Vec::new(),
        }
    }

    pub fn chain(&self) -> &'a C {
        self.chain
    }

    /// Select plain pay-to-pubkey inputs of `payer` until `target` is
    /// covered. Selection is restricted to the payer's own address, which is
    /// what proves the signer identity where that is consensus-relevant.
    ///
    /// Returns the amount collected, which may fall short of the target;
    /// callers decide how to report that.
    pub fn add_normal_inputs(
        &mut self,
        payer: &PubKey,
        target: Amount,
        max_inputs: usize,
        include_mempool: bool,
    ) -> Result<Amount, CcError> {
        let address = Script::pay_to_pubkey(payer).address();
        let limit = if max_inputs == 0 { MAX_VINS } else { max_inputs };
        let mut collected = 0;
        for entry in self.chain.unspent_by_address(&address, include_mempool) {
            if collected >= target || self.tx.inputs.len() >= limit {
                break;
            }
            if entry.amount == 0 || self.chain.is_spent_in_mempool(&entry.outpoint) {
                continue;
            }
            if self.tx.inputs.iter().any(|vin| vin.prevout == entry.outpoint) {
                continue;
            }
            self.tx.inputs.push(TxIn::new(entry.outpoint));
            collected += entry.amount;
        }
        debug!(collected, target, "selected normal inputs");
        Ok(collected)
    }

    /// Push a CC input by outpoint. The caller knows why it is spendable; a
    /// matching probe condition must be attached before finalize.
    pub fn add_cc_input(&mut self, outpoint: crate::types::Outpoint) {
        self.tx.inputs.push(TxIn::new(outpoint));
    }

    pub fn add_output(&mut self, value: Amount, script: Script) {
        self.tx.outputs.push(TxOut::new(value, script));
    }

    /// Register a condition shape (and optional published secret) the signer
    /// should use for CC vins whose output script it reproduces.
    pub fn attach_probe(&mut self, condition: Condition, secret: Option<[u8; 32]>) {
        self.probes.push(ProbeCondition { condition, secret });
    }

    /// Sum of the amounts this tx's inputs spend.
    pub fn input_total(&self) -> Result<Amount, CcError> {
        let mut total = 0;
        for vin in &self.tx.inputs {
            total += self.chain.prevout(&vin.prevout)?.value;
        }
        Ok(total)
    }

    pub fn output_total(&self) -> Amount {
        self.tx.outputs.iter().map(|v| v.value).sum()
    }

    /// Pay the fee, add payer change, append the op-return, sign all vins.
    pub fn finalize(
        mut self,
        keystore: &KeyStore,
        payer: &PubKey,
        txfee: Amount,
        opret: Option<Vec<u8>>,
    ) -> Result<Transaction, CcError> {
        let input_total = self.input_total()?;
        let output_total = self.output_total();
        let needed = output_total + txfee;
        if input_total < needed {
            return Err(CcError::InsufficientFunds {
                needed,
                available: input_total,
            });
        }
        let change = input_total - needed;
        if change > 0 {
            self.add_output(change, Script::pay_to_pubkey(payer));
        }
        if let Some(payload) = opret {
            self.add_output(0, Script::op_return(&payload));
        }

        for i in 0..self.tx.inputs.len() {
            let prevout = self.chain.prevout(&self.tx.inputs[i].prevout)?;
            let digest = keys::sighash(&self.tx, i);

            let script_sig = if let Some(pk) = prevout.script.as_pay_to_pubkey() {
                let kp = keystore
                    .get(&pk)
                    .ok_or_else(|| CcError::Signing(format!("no key for {}", pk.to_hex())))?;
                normal_script_sig(&pk, &kp.sign(&digest))
            } else if prevout.script.is_pay_to_condition() {
                let (condition, keypair) = self.signer_for(&prevout.script, keystore, payer)?;
                let fulfillment = CcFulfillment {
                    condition,
                    signer: keypair.pubkey(),
                    signature: keypair.sign(&digest),
                };
                fulfillment.encode()
            } else {
                return Err(CcError::Signing("unsignable prevout script".into()));
            };
            self.tx.inputs[i].script_sig = script_sig;
        }
        Ok(self.tx)
    }

    /// Pick the probe (or wallet key) that satisfies a CC prevout script.
    fn signer_for(
        &self,
        output_script: &Script,
        keystore: &KeyStore,
        payer: &PubKey,
    ) -> Result<(Condition, Keypair), CcError> {
        for probe in &self.probes {
            let plain = probe.condition.script();
            let anon = probe.condition.to_anon().script();
            if plain != *output_script && anon != *output_script {
                continue;
            }
            let keypair = match &probe.secret {
                Some(secret) => Keypair::from_secret(secret)?,
                None => keystore
                    .get(payer)
                    .cloned()
                    .ok_or_else(|| CcError::Signing("payer key not in wallet".into()))?,
            };
            return Ok((probe.condition.clone(), keypair));
        }

        // No probe: a plain condition naming a wallet key is still signable.
        if let Some(condition) = output_script.condition() {
            if !condition.is_mixed() {
                for pk in condition.pubkeys() {
                    if let Some(kp) = keystore.get(pk) {
                        return Ok((condition.clone(), kp.clone()));
                    }
                }
            }
        }
        Err(CcError::Signing("no probe condition matches CC input".into()))
    }
}

/// Total of plain inputs whose spent output pays `pubkey`. Evaluated over the
/// prevouts, so it works on unsigned transactions too.
pub fn total_pubkey_normal_inputs<C: ChainView + ?Sized>(
    chain: &C,
    tx: &Transaction,
    pubkey: &PubKey,
) -> Amount {
    let mut total = 0;
    for vin in &tx.inputs {
        let Ok(prevout) = chain.prevout(&vin.prevout) else {
            continue;
        };
        if prevout.script.as_pay_to_pubkey().as_ref() == Some(pubkey) {
            total += prevout.value;
        }
    }
    total
}

/// Total of CC inputs attributable to `pubkey`: by the recorded signer when
/// signed, by condition membership when not yet signed.
pub fn total_pubkey_cc_inputs<C: ChainView + ?Sized>(
    chain: &C,
    tx: &Transaction,
    pubkey: &PubKey,
) -> Amount {
    let mut total = 0;
    for vin in &tx.inputs {
        let Ok(prevout) = chain.prevout(&vin.prevout) else {
            continue;
        };
        if !prevout.script.is_pay_to_condition() {
            continue;
        }
        let attributable = if is_cc_input(&vin.script_sig) {
            keys::cc_signing_pubkey(&vin.script_sig).as_ref() == Some(pubkey)
        } else {
            prevout
                .script
                .condition()
                .is_some_and(|c| c.pubkeys().contains(pubkey))
        };
        if attributable {
            total += prevout.value;
        }
    }
    total
}

/// Check every input signature of a finalized transaction against its
/// prevout. Host consensus does this in the script engine; the reimplementation
/// keeps it here so tests can assert builders emit valid spends.
pub fn verify_tx_signatures<C: ChainView + ?Sized>(
    chain: &C,
    tx: &Transaction,
) -> Result<(), CcError> {
    for (i, vin) in tx.inputs.iter().enumerate() {
        let prevout = chain.prevout(&vin.prevout)?;
        let digest = keys::sighash(tx, i);

        if let Some(pk) = prevout.script.as_pay_to_pubkey() {
            let (signer, signature) = keys::decode_normal_script_sig(&vin.script_sig)
                .ok_or_else(|| CcError::Signing(format!("vin {i}: bad normal script-sig")))?;
            if signer != pk || !keys::verify(&pk, &digest, &signature) {
                return Err(CcError::Signing(format!("vin {i}: signature check failed")));
            }
        } else if prevout.script.is_pay_to_condition() {
            let fulfillment = CcFulfillment::decode(&vin.script_sig)
                .ok_or_else(|| CcError::Signing(format!("vin {i}: bad fulfillment")))?;
            if !fulfillment.matches_output(&prevout.script) {
                return Err(CcError::Signing(format!(
                    "vin {i}: fulfillment does not match output condition"
                )));
            }
            if !fulfillment.condition.pubkeys().contains(&fulfillment.signer) {
                return Err(CcError::Signing(format!("vin {i}: signer outside threshold")));
            }
            if !keys::verify(&fulfillment.signer, &digest, &fulfillment.signature) {
                return Err(CcError::Signing(format!("vin {i}: signature check failed")));
            }
        } else {
            return Err(CcError::Signing(format!("vin {i}: unspendable prevout")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::constants::{global_pubkey, module_keys, EVAL_HEIR};

    fn wallet(tag: u8) -> (KeyStore, PubKey) {
        let mut store = KeyStore::new();
        let mut secret = [tag; 32];
        secret[0] = 1;
        let pk = store.add_secret(&secret).unwrap();
        (store, pk)
    }

    #[test]
    fn finalize_signs_and_pays_change() {
        let mut chain = MemoryChain::new(0);
        let (store, payer) = wallet(7);
        chain.fund_address(Script::pay_to_pubkey(&payer), 100_000);
        chain.mine_block(60);

        let mut builder = TxAssembler::new(&chain);
        let collected = builder.add_normal_inputs(&payer, 30_000, 0, false).unwrap();
        assert_eq!(collected, 100_000);
        builder.add_output(25_000, Script::pay_to_pubkey(&payer));
        let tx = builder
            .finalize(&store, &payer, 10_000, Some(vec![0xf2, b'x']))
            .unwrap();

        // payment, change, op-return
        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(tx.outputs[1].value, 65_000);
        assert!(tx.outputs[2].script.is_op_return());
        verify_tx_signatures(&chain, &tx).unwrap();
    }

    #[test]
    fn finalize_rejects_shortfall() {
        let mut chain = MemoryChain::new(0);
        let (store, payer) = wallet(7);
        chain.fund_address(Script::pay_to_pubkey(&payer), 5_000);
        chain.mine_block(60);

        let mut builder = TxAssembler::new(&chain);
        builder.add_normal_inputs(&payer, 5_000, 0, false).unwrap();
        builder.add_output(5_000, Script::pay_to_pubkey(&payer));
        match builder.finalize(&store, &payer, 10_000, None) {
            Err(CcError::InsufficientFunds { needed, available }) => {
                assert_eq!(needed, 15_000);
                assert_eq!(available, 5_000);
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
    }

    #[test]
    fn probe_with_module_secret_signs_global_cc_input() {
        let mut chain = MemoryChain::new(0);
        let (store, payer) = wallet(9);
        chain.fund_address(Script::pay_to_pubkey(&payer), 50_000);

        let global = Condition::cc1(EVAL_HEIR, global_pubkey(EVAL_HEIR));
        let cc_outpoint = chain.fund_address(global.script(), 20_000);
        chain.mine_block(60);

        let mut builder = TxAssembler::new(&chain);
        builder.add_normal_inputs(&payer, 10_000, 0, false).unwrap();
        builder.add_cc_input(cc_outpoint);
        builder.add_output(20_000, Script::pay_to_pubkey(&payer));
        builder.attach_probe(global, Some(module_keys(EVAL_HEIR).secret));

        let tx = builder.finalize(&store, &payer, 10_000, None).unwrap();
        verify_tx_signatures(&chain, &tx).unwrap();
        assert!(is_cc_input(&tx.inputs[1].script_sig));
    }

    #[test]
    fn selection_skips_mempool_spent_utxos() {
        let mut chain = MemoryChain::new(0);
        let (store, payer) = wallet(3);
        chain.fund_address(Script::pay_to_pubkey(&payer), 30_000);
        chain.fund_address(Script::pay_to_pubkey(&payer), 40_000);
        chain.mine_block(60);

        // spend one of the two in the mempool
        let mut first = TxAssembler::new(&chain);
        first.add_normal_inputs(&payer, 30_000, 0, false).unwrap();
        let spend = first.finalize(&store, &payer, 10_000, None).unwrap();
        let spent_outpoint = spend.inputs[0].prevout;
        chain.accept_tx(spend).unwrap();

        let mut second = TxAssembler::new(&chain);
        second.add_normal_inputs(&payer, 70_000, 0, false).unwrap();
        assert!(second.tx.inputs.iter().all(|v| v.prevout != spent_outpoint));
    }

    #[test]
    fn pubkey_input_totals() {
        let mut chain = MemoryChain::new(0);
        let (_, alice) = wallet(3);
        let (_, bob) = wallet(4);
        let a = chain.fund_address(Script::pay_to_pubkey(&alice), 10_000);
        let b = chain.fund_address(Script::pay_to_pubkey(&bob), 7_000);
        chain.mine_block(60);

        let mut tx = Transaction::new();
        tx.inputs.push(TxIn::new(a));
        tx.inputs.push(TxIn::new(b));
        assert_eq!(total_pubkey_normal_inputs(&chain, &tx, &alice), 10_000);
        assert_eq!(total_pubkey_normal_inputs(&chain, &tx, &bob), 7_000);
        assert_eq!(total_pubkey_cc_inputs(&chain, &tx, &alice), 0);
    }
}
