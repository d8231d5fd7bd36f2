//! Read access to the UTXO set.
//!
//! The contracts never own chain storage; the host hands in a [`ChainView`]
//! and is responsible for snapshot consistency across one validation. All
//! reads are blocking; a validation has no suspension points.
//!
//! [`MemoryChain`] is the in-process implementation used throughout the test
//! suite: deterministic block production with explicit timestamps, address
//! and (address, tokenid) indexes, and a mempool overlay.

use crate::error::CcError;
use crate::opret::{decode_token_payload, TokenPayload};
use crate::types::{sha256d, Amount, Outpoint, Transaction, TxId};
use std::collections::HashMap;
use tracing::debug;

/// Block identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHash(pub [u8; 32]);

/// One unspent output as reported by the index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtxoEntry {
    pub outpoint: Outpoint,
    pub amount: Amount,
    /// Confirmation height; `None` while only in the mempool.
    pub height: Option<u32>,
}

/// Where an outpoint was spent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendInfo {
    pub txid: TxId,
    pub vin: u32,
    /// Height of the spending tx; `None` while only in the mempool.
    pub height: Option<u32>,
}

/// Abstract UTXO index consumed by the contract modules.
///
/// The iteration order of the `unspent_*` results is unspecified; selectors
/// must behave identically under permutation.
pub trait ChainView {
    fn unspent_by_address(&self, address: &str, include_mempool: bool) -> Vec<UtxoEntry>;

    /// Specialised index over CC token outputs of one tokenid.
    fn unspent_by_address_tokenid(&self, address: &str, tokenid: &TxId) -> Vec<UtxoEntry>;

    /// Every output ever indexed at an address, spent or not. Backs lifetime
    /// accounting (heir plan deposits).
    fn history_by_address(&self, address: &str) -> Vec<UtxoEntry>;

    fn get_tx(&self, txid: &TxId) -> Result<(Transaction, Option<BlockHash>), CcError>;

    fn get_spending(&self, outpoint: &Outpoint) -> Option<SpendInfo>;

    fn is_spent_in_mempool(&self, outpoint: &Outpoint) -> bool;

    fn current_height(&self) -> u32;

    fn block_time(&self, block: &BlockHash) -> Option<u64>;

    /// The host's timestamp source; drives the heir inactivity timer.
    fn current_time(&self) -> u64;

    /// Confirmation time of a transaction, when it has one.
    fn tx_time(&self, txid: &TxId) -> Option<u64> {
        let (_, block) = self.get_tx(txid).ok()?;
        self.block_time(&block?)
    }

    /// Resolve the output an input spends.
    fn prevout(&self, outpoint: &Outpoint) -> Result<crate::types::TxOut, CcError> {
        let (tx, _) = self.get_tx(&outpoint.txid)?;
        tx.outputs
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or_else(|| CcError::not_found(format!("vout {} of {}", outpoint.vout, outpoint.txid)))
    }
}

#[derive(Clone, Debug)]
struct UtxoRecord {
    amount: Amount,
    address: String,
    height: Option<u32>,
    tokenid: Option<TxId>,
}

/// In-memory chain with manual block production.
#[derive(Default)]
pub struct MemoryChain {
    txs: HashMap<TxId, (Transaction, Option<BlockHash>)>,
    /// Timestamp per block, index = height - 1.
    block_times: Vec<u64>,
    block_heights: HashMap<BlockHash, u32>,
    /// Currently unspent outputs, mempool ones included.
    utxos: HashMap<Outpoint, UtxoRecord>,
    /// Outpoints consumed by a not-yet-mined transaction.
    mempool_spent: HashMap<Outpoint, SpendInfo>,
    /// Outpoints consumed by a confirmed transaction.
    spent: HashMap<Outpoint, SpendInfo>,
    /// Every output ever seen per address, spent ones included.
    history: HashMap<String, Vec<(Outpoint, Amount)>>,
    mempool: Vec<TxId>,
    time: u64,
}

impl MemoryChain {
    pub fn new(genesis_time: u64) -> Self {
        Self {
            time: genesis_time,
            ..Self::default()
        }
    }

    /// Accept a transaction into the mempool. Checks UTXO availability only;
    /// contract predicates are the validator's concern and are exercised
    /// separately.
    pub fn accept_tx(&mut self, tx: Transaction) -> Result<TxId, CcError> {
        let txid = tx.txid();
        for (i, vin) in tx.inputs.iter().enumerate() {
            if !self.utxos.contains_key(&vin.prevout) {
                return Err(CcError::not_found(format!("prevout {:?}", vin.prevout)));
            }
            if self.mempool_spent.contains_key(&vin.prevout) {
                return Err(CcError::invalid(format!(
                    "prevout {:?} already spent in mempool",
                    vin.prevout
                )));
            }
            self.mempool_spent.insert(
                vin.prevout,
                SpendInfo {
                    txid,
                    vin: i as u32,
                    height: None,
                },
            );
        }
        self.index_outputs(&tx, txid);
        self.txs.insert(txid, (tx, None));
        self.mempool.push(txid);
        debug!(%txid, "accepted into mempool");
        Ok(txid)
    }

    /// Seed a coinbase-like output out of thin air (test fixture).
    pub fn fund_address(&mut self, script: crate::script::Script, amount: Amount) -> Outpoint {
        let mut tx = Transaction::new();
        tx.lock_time = self.txs.len() as u32; // distinct txid per grant
        tx.outputs.push(crate::types::TxOut::new(amount, script));
        let txid = tx.txid();
        self.index_outputs(&tx, txid);
        self.txs.insert(txid, (tx, None));
        self.mempool.push(txid);
        Outpoint::new(txid, 0)
    }

    /// Mine every mempool transaction into a new block at `time`.
    pub fn mine_block(&mut self, time: u64) -> BlockHash {
        let height = self.block_times.len() as u32 + 1;
        let mut seed = Vec::with_capacity(12 + self.mempool.len() * 32);
        seed.extend_from_slice(&height.to_le_bytes());
        seed.extend_from_slice(&time.to_le_bytes());
        for txid in &self.mempool {
            seed.extend_from_slice(&txid.0);
        }
        let hash = BlockHash(sha256d(&seed));

        for txid in std::mem::take(&mut self.mempool) {
            let tx = {
                let entry = self.txs.get_mut(&txid).expect("mempool txid indexed");
                entry.1 = Some(hash);
                entry.0.clone()
            };
            for vin in &tx.inputs {
                self.utxos.remove(&vin.prevout);
                if let Some(mut info) = self.mempool_spent.remove(&vin.prevout) {
                    info.height = Some(height);
                    self.spent.insert(vin.prevout, info);
                }
            }
            for vout in 0..tx.outputs.len() {
                let outpoint = Outpoint::new(txid, vout as u32);
                if let Some(record) = self.utxos.get_mut(&outpoint) {
                    record.height = Some(height);
                }
            }
        }

        self.block_times.push(time);
        self.block_heights.insert(hash, height);
        self.time = time;
        debug!(height, time, "mined block");
        hash
    }

    /// Tag outputs with their address and, for token transactions, tokenid.
    /// Heights are stamped when the tx is mined.
    fn index_outputs(&mut self, tx: &Transaction, txid: TxId) {
        let tokenid = tx
            .opret()
            .and_then(|s| s.op_return_data())
            .and_then(|data| decode_token_payload(data).ok())
            .map(|payload| match payload {
                TokenPayload::Create(_) => txid,
                TokenPayload::Transfer(t) => t.tokenid,
            });

        for (vout, out) in tx.outputs.iter().enumerate() {
            if out.script.is_op_return() {
                continue;
            }
            let outpoint = Outpoint::new(txid, vout as u32);
            let record = UtxoRecord {
                amount: out.value,
                address: out.script.address(),
                height: None,
                tokenid: tokenid.filter(|_| out.script.is_pay_to_condition()),
            };
            self.history
                .entry(record.address.clone())
                .or_default()
                .push((outpoint, out.value));
            self.utxos.insert(outpoint, record);
        }
    }

    pub fn advance_time(&mut self, seconds: u64) {
        self.time += seconds;
    }
}

impl ChainView for MemoryChain {
    fn unspent_by_address(&self, address: &str, include_mempool: bool) -> Vec<UtxoEntry> {
        self.utxos
            .iter()
            .filter(|(outpoint, record)| {
                record.address == address
                    && if include_mempool {
                        !self.mempool_spent.contains_key(outpoint)
                    } else {
                        record.height.is_some()
                    }
            })
            .map(|(outpoint, record)| UtxoEntry {
                outpoint: *outpoint,
                amount: record.amount,
                height: record.height,
            })
            .collect()
    }

    fn unspent_by_address_tokenid(&self, address: &str, tokenid: &TxId) -> Vec<UtxoEntry> {
        self.utxos
            .iter()
            .filter(|(outpoint, record)| {
                record.address == address
                    && record.tokenid.as_ref() == Some(tokenid)
                    && !self.mempool_spent.contains_key(outpoint)
            })
            .map(|(outpoint, record)| UtxoEntry {
                outpoint: *outpoint,
                amount: record.amount,
                height: record.height,
            })
            .collect()
    }

    fn history_by_address(&self, address: &str) -> Vec<UtxoEntry> {
        self.history
            .get(address)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(outpoint, amount)| UtxoEntry {
                        outpoint: *outpoint,
                        amount: *amount,
                        height: self.utxos.get(outpoint).and_then(|r| r.height).or_else(|| {
                            self.spent.get(outpoint).and_then(|s| s.height)
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn get_tx(&self, txid: &TxId) -> Result<(Transaction, Option<BlockHash>), CcError> {
        self.txs
            .get(txid)
            .cloned()
            .ok_or_else(|| CcError::not_found(format!("tx {txid}")))
    }

    fn get_spending(&self, outpoint: &Outpoint) -> Option<SpendInfo> {
        self.spent
            .get(outpoint)
            .or_else(|| self.mempool_spent.get(outpoint))
            .cloned()
    }

    fn is_spent_in_mempool(&self, outpoint: &Outpoint) -> bool {
        self.mempool_spent.contains_key(outpoint)
    }

    fn current_height(&self) -> u32 {
        self.block_times.len() as u32
    }

    fn block_time(&self, block: &BlockHash) -> Option<u64> {
        let height = *self.block_heights.get(block)?;
        self.block_times.get(height as usize - 1).copied()
    }

    fn current_time(&self) -> u64 {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;
    use crate::types::{PubKey, TxIn, TxOut};

    fn pk(tag: u8) -> PubKey {
        let mut bytes = [tag; 33];
        bytes[0] = 0x02;
        PubKey(bytes)
    }

    #[test]
    fn fund_and_spend_lifecycle() {
        let mut chain = MemoryChain::new(1_000_000);
        let script = Script::pay_to_pubkey(&pk(1));
        let addr = script.address();
        let funded = chain.fund_address(script.clone(), 50_000);

        // visible in mempool view only until mined
        assert_eq!(chain.unspent_by_address(&addr, true).len(), 1);
        assert_eq!(chain.unspent_by_address(&addr, false).len(), 0);

        chain.mine_block(1_000_060);
        assert_eq!(chain.unspent_by_address(&addr, false).len(), 1);
        assert_eq!(chain.current_height(), 1);

        let mut spend = Transaction::new();
        spend.inputs.push(TxIn::new(funded));
        spend
            .outputs
            .push(TxOut::new(50_000, Script::pay_to_pubkey(&pk(2))));
        let spend_txid = chain.accept_tx(spend).unwrap();

        assert!(chain.is_spent_in_mempool(&funded));
        // confirmed-only view still sees the utxo until the spend is mined
        assert_eq!(chain.unspent_by_address(&addr, false).len(), 1);
        assert_eq!(chain.unspent_by_address(&addr, true).len(), 0);

        chain.mine_block(1_000_120);
        assert_eq!(chain.unspent_by_address(&addr, false).len(), 0);
        let spend_info = chain.get_spending(&funded).unwrap();
        assert_eq!(spend_info.txid, spend_txid);
        assert_eq!(spend_info.height, Some(2));
    }

    #[test]
    fn double_spend_in_mempool_rejected() {
        let mut chain = MemoryChain::new(0);
        let funded = chain.fund_address(Script::pay_to_pubkey(&pk(1)), 10_000);
        chain.mine_block(60);

        let mut a = Transaction::new();
        a.inputs.push(TxIn::new(funded));
        a.outputs.push(TxOut::new(10_000, Script::pay_to_pubkey(&pk(2))));
        chain.accept_tx(a).unwrap();

        let mut b = Transaction::new();
        b.inputs.push(TxIn::new(funded));
        b.outputs.push(TxOut::new(10_000, Script::pay_to_pubkey(&pk(3))));
        assert!(chain.accept_tx(b).is_err());
    }

    #[test]
    fn block_times_are_queryable() {
        let mut chain = MemoryChain::new(500);
        chain.fund_address(Script::pay_to_pubkey(&pk(1)), 1);
        let block = chain.mine_block(777);
        assert_eq!(chain.block_time(&block), Some(777));
        assert_eq!(chain.current_time(), 777);
        chain.advance_time(100);
        assert_eq!(chain.current_time(), 877);
    }
}
