//! Inheritance escrow: funds at a 1-of-2 owner|heir address, freely spendable
//! by the owner, and by the heir once the owner has been inactive long enough.
//!
//! The single bit `has_spending_begun` latches on the heir's first claim and
//! is carried in every later op-return; the validator enforces that it never
//! reverts. The activity timer only counts transactions carrying the owner's
//! signature; donations from third parties do not reset it.

use crate::chain::ChainView;
use crate::condition::Condition;
use crate::constants::{
    global_pubkey, txid_pubkey, DEFAULT_TXFEE, EVAL_HEIR, HEIR_MARKER_AMOUNT,
};
use crate::error::{CcError, ValidationError};
use crate::keys::{self, KeyStore};
use crate::opret::{
    decode_heir_either, HeirCreate, HeirPayload, HeirSuccessor, TokenTransfer, TokenVersion,
};
use crate::script::Script;
use crate::tokens::{
    add_token_inputs, check_token_vout, get_token_data, token_address, tokens_cc1of2_script,
    tokens_cc_script, TokenCtx,
};
use crate::txbuilder::{total_pubkey_cc_inputs, total_pubkey_normal_inputs, TxAssembler};
use crate::types::{Amount, PubKey, Transaction, TxId};
use serde::Serialize;
use tracing::{debug, instrument, warn};

/// Token plans ride the first-generation token contract.
const TOKENS_VER: TokenVersion = TokenVersion::V1;

/// The 1-of-2 escrow script of a plan: heir-eval for coin plans, the tokens
/// dual-eval variant for token plans.
pub fn plan_script(tokenid: Option<&TxId>, owner: &PubKey, heir: &PubKey) -> Script {
    match tokenid {
        None => Condition::cc1of2(EVAL_HEIR, *owner, *heir).script(),
        Some(_) => tokens_cc1of2_script(TOKENS_VER, &[EVAL_HEIR], owner, heir),
    }
}

fn plan_probe(tokenid: Option<&TxId>, owner: &PubKey, heir: &PubKey) -> Condition {
    match tokenid {
        None => Condition::cc1of2(EVAL_HEIR, *owner, *heir),
        Some(_) => Condition::tokens_cc1of2(TOKENS_VER.eval(), &[EVAL_HEIR], *owner, *heir),
    }
}

/// Module marker script; every funding tx deposits here so plans enumerate.
pub fn heir_marker_script() -> Script {
    Condition::cc1(EVAL_HEIR, global_pubkey(EVAL_HEIR)).script()
}

/// Resolved state of a plan at the current chain tip.
#[derive(Clone, Debug)]
pub struct PlanState {
    pub fundingtxid: TxId,
    pub tokenid: Option<TxId>,
    pub owner: PubKey,
    pub heir: PubKey,
    pub inactivity_secs: i64,
    pub name: String,
    pub memo: String,
    /// Most recent plan tx of any kind (reporting).
    pub latest_txid: TxId,
    /// Most recent owner-signed plan tx (the activity-timer anchor).
    pub latest_owner_txid: TxId,
    pub has_spending_begun: bool,
}

impl PlanState {
    pub fn script(&self) -> Script {
        plan_script(self.tokenid.as_ref(), &self.owner, &self.heir)
    }

    /// Seconds since the owner's last confirmed activity on the plan.
    pub fn owner_inactivity<C: ChainView + ?Sized>(&self, chain: &C) -> u64 {
        match chain.tx_time(&self.latest_owner_txid) {
            Some(t) => chain.current_time().saturating_sub(t),
            None => 0, // unconfirmed anchor: the timer has not started
        }
    }

    pub fn is_heir_spending_allowed<C: ChainView + ?Sized>(&self, chain: &C) -> bool {
        self.has_spending_begun || self.owner_inactivity(chain) >= self.inactivity_secs.max(0) as u64
    }
}

/// Does this plan tx carry an opret referring to `fundingtxid`?
fn plan_reference(
    tx: &Transaction,
    txid: &TxId,
    fundingtxid: &TxId,
    plan_tokenid: Option<&TxId>,
) -> Option<(u8, bool)> {
    let opret = tx.opret()?.op_return_data()?;
    let (tokenid, payload) = decode_heir_either(opret).ok()?;
    if tokenid.as_ref() != plan_tokenid {
        return None;
    }
    match payload {
        HeirPayload::Create(_) if txid == fundingtxid => Some((b'F', false)),
        HeirPayload::Successor(s) if s.fundingtxid == *fundingtxid => {
            Some((s.funcid, s.has_spending_begun))
        }
        _ => None,
    }
}

/// Resolve a plan: decode the funding tx, then walk the unspent outputs at
/// the 1-of-2 address for successors. The latch is the OR over every
/// successor op-return; the timer anchor is the newest owner-signed tx.
pub fn find_latest_plan_tx<C: ChainView + ?Sized>(
    chain: &C,
    fundingtxid: &TxId,
) -> Result<PlanState, CcError> {
    let (funding_tx, _) = chain.get_tx(fundingtxid)?;
    let opret = funding_tx
        .opret()
        .and_then(|s| s.op_return_data())
        .ok_or_else(|| CcError::not_found("funding tx has no opret"))?;
    let (tokenid, payload) = decode_heir_either(opret)?;
    let HeirPayload::Create(create) = payload else {
        return Err(CcError::not_found(format!(
            "{fundingtxid} is not a plan funding tx"
        )));
    };

    let mut plan = PlanState {
        fundingtxid: *fundingtxid,
        tokenid,
        owner: create.owner,
        heir: create.heir,
        inactivity_secs: create.inactivity_secs,
        name: create.name,
        memo: create.memo,
        latest_txid: *fundingtxid,
        latest_owner_txid: *fundingtxid,
        has_spending_begun: false,
    };

    let address = plan.script().address();
    let mut best_rank = 0u64;
    let mut best_owner_rank = 0u64;
    for entry in chain.unspent_by_address(&address, true) {
        let txid = entry.outpoint.txid;
        let Ok((tx, _)) = chain.get_tx(&txid) else {
            continue;
        };
        let Some((_funcid, began)) =
            plan_reference(&tx, &txid, fundingtxid, plan.tokenid.as_ref())
        else {
            continue;
        };
        plan.has_spending_begun |= began;

        // mempool entries outrank any confirmed height
        let rank = entry.height.map(|h| h as u64 + 1).unwrap_or(u64::MAX);
        if rank > best_rank {
            best_rank = rank;
            plan.latest_txid = txid;
        }
        let owner_signed = total_pubkey_normal_inputs(chain, &tx, &plan.owner) > 0
            || total_pubkey_cc_inputs(chain, &tx, &plan.owner) > 0;
        if owner_signed && rank > best_owner_rank {
            best_owner_rank = rank;
            plan.latest_owner_txid = txid;
        }
    }
    debug!(%fundingtxid, latest = %plan.latest_txid, began = plan.has_spending_begun, "resolved plan");
    Ok(plan)
}

/// Collect spendable 1-of-2 inputs of the plan. `target == 0` accumulates
/// without pushing (balance query).
fn add_plan_inputs<C: ChainView + ?Sized>(
    builder: &mut TxAssembler<'_, C>,
    plan: &PlanState,
    target: Amount,
) -> Result<Amount, CcError> {
    let chain = builder.chain();
    let address = plan.script().address();
    let mut collected = 0;
    for entry in chain.unspent_by_address(&address, true) {
        if entry.amount == 0 || chain.is_spent_in_mempool(&entry.outpoint) {
            continue;
        }
        let txid = entry.outpoint.txid;
        let Ok((tx, _)) = chain.get_tx(&txid) else {
            continue;
        };
        if plan_reference(&tx, &txid, &plan.fundingtxid, plan.tokenid.as_ref()).is_none() {
            continue;
        }
        if let Some(tokenid) = &plan.tokenid {
            let vout_ok = check_token_vout(chain, TOKENS_VER, &tx, entry.outpoint.vout as usize)
                .map_err(|e| CcError::invalid(e.to_string()))?
                .map(|(id, _)| id == *tokenid)
                .unwrap_or(false);
            if !vout_ok {
                continue;
            }
        }
        if target != 0 {
            builder.add_cc_input(entry.outpoint);
        }
        collected += entry.amount;
        if target > 0 && collected >= target {
            break;
        }
    }
    Ok(collected)
}

// ---------------------------------------------------------------------------
// builders
// ---------------------------------------------------------------------------

fn heir_opret(
    tokenid: Option<&TxId>,
    owner: &PubKey,
    heir: &PubKey,
    payload: &HeirPayload,
) -> Vec<u8> {
    match tokenid {
        None => payload.encode(),
        Some(tokenid) => TokenTransfer {
            ver: TOKENS_VER,
            tokenid: *tokenid,
            dest_pubkeys: vec![*owner, *heir],
            blobs: vec![payload.encode()],
        }
        .encode(),
    }
}

/// Open a plan with an initial deposit. The resulting txid is the plan
/// handle. Coin plans deposit satoshis, token plans token units.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(chain, keystore), fields(name = %name))]
pub fn heir_fund<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    owner: &PubKey,
    txfee: Amount,
    amount: Amount,
    name: &str,
    heir: &PubKey,
    inactivity_secs: i64,
    memo: &str,
    tokenid: Option<TxId>,
) -> Result<Transaction, CcError> {
    if amount <= 0 {
        return Err(CcError::invalid("non-positive funding amount"));
    }
    if inactivity_secs <= 0 {
        return Err(CcError::invalid("non-positive inactivity time"));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };

    let mut builder = TxAssembler::new(chain);
    match &tokenid {
        None => {
            let target = amount + txfee + HEIR_MARKER_AMOUNT;
            let collected = builder.add_normal_inputs(owner, target, 0, false)?;
            if collected < target {
                return Err(CcError::InsufficientFunds {
                    needed: target,
                    available: collected,
                });
            }
        }
        Some(tokenid) => {
            let fee_target = txfee + HEIR_MARKER_AMOUNT;
            let collected = builder.add_normal_inputs(owner, fee_target, 0, false)?;
            if collected < fee_target {
                return Err(CcError::InsufficientFunds {
                    needed: fee_target,
                    available: collected,
                });
            }
            let mut ctx = TokenCtx::new(TOKENS_VER);
            ctx.nft_eval = get_token_data(chain, tokenid)?.nft_eval();
            let source = token_address(&ctx, owner);
            let inputs =
                add_token_inputs(&mut builder, &mut ctx, &source, tokenid, amount, 0, false)?;
            if inputs < amount {
                return Err(CcError::InsufficientFunds {
                    needed: amount,
                    available: inputs,
                });
            }
            let change = inputs - amount;
            builder.add_output(amount, plan_script(Some(tokenid), owner, heir));
            builder.add_output(HEIR_MARKER_AMOUNT, heir_marker_script());
            if change > 0 {
                builder.add_output(change, tokens_cc_script(TOKENS_VER, &[ctx.nft_eval], owner));
            }
            builder.attach_probe(
                Condition::tokens_cc1(TOKENS_VER.eval(), &[ctx.nft_eval], *owner),
                None,
            );
        }
    }
    if tokenid.is_none() {
        builder.add_output(amount, plan_script(None, owner, heir));
        builder.add_output(HEIR_MARKER_AMOUNT, heir_marker_script());
    }

    // the deposit must come from the owner's own key
    let own_inputs = total_pubkey_normal_inputs(chain, &builder.tx, owner)
        + total_pubkey_cc_inputs(chain, &builder.tx, owner);
    if own_inputs < amount {
        return Err(CcError::Unauthorised("using non-owner inputs not allowed".into()));
    }

    let payload = HeirPayload::Create(HeirCreate {
        owner: *owner,
        heir: *heir,
        inactivity_secs,
        name: name.to_string(),
        memo: memo.to_string(),
    });
    let opret = heir_opret(tokenid.as_ref(), owner, heir, &payload);
    builder.finalize(keystore, owner, txfee, Some(opret))
}

/// Top up a plan. Anyone may add; a non-owner addition is flagged as a
/// donation (it neither resets the timer nor touches the latch).
#[instrument(skip(chain, keystore), fields(%fundingtxid))]
pub fn heir_add<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    payer: &PubKey,
    fundingtxid: &TxId,
    txfee: Amount,
    amount: Amount,
) -> Result<(Transaction, bool), CcError> {
    if amount <= 0 {
        return Err(CcError::invalid("non-positive amount"));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };
    let plan = find_latest_plan_tx(chain, fundingtxid)?;
    let donation = *payer != plan.owner;
    if donation {
        warn!(%fundingtxid, "non-owner addition: this is a donation to the heir fund");
    }

    let mut builder = TxAssembler::new(chain);
    match &plan.tokenid {
        None => {
            let target = amount + txfee + HEIR_MARKER_AMOUNT;
            let collected = builder.add_normal_inputs(payer, target, 0, false)?;
            if collected < target {
                return Err(CcError::InsufficientFunds {
                    needed: target,
                    available: collected,
                });
            }
            builder.add_output(amount, plan.script());
        }
        Some(tokenid) => {
            let fee_target = txfee + HEIR_MARKER_AMOUNT;
            let collected = builder.add_normal_inputs(payer, fee_target, 0, false)?;
            if collected < fee_target {
                return Err(CcError::InsufficientFunds {
                    needed: fee_target,
                    available: collected,
                });
            }
            let mut ctx = TokenCtx::new(TOKENS_VER);
            ctx.nft_eval = get_token_data(chain, tokenid)?.nft_eval();
            let source = token_address(&ctx, payer);
            let inputs =
                add_token_inputs(&mut builder, &mut ctx, &source, tokenid, amount, 0, false)?;
            if inputs < amount {
                return Err(CcError::InsufficientFunds {
                    needed: amount,
                    available: inputs,
                });
            }
            builder.add_output(amount, plan.script());
            let change = inputs - amount;
            if change > 0 {
                builder.add_output(change, tokens_cc_script(TOKENS_VER, &[ctx.nft_eval], payer));
            }
            builder.attach_probe(
                Condition::tokens_cc1(TOKENS_VER.eval(), &[ctx.nft_eval], *payer),
                None,
            );
        }
    }
    // txid-scoped sentinel marker keeps the add-chain discoverable
    builder.add_output(
        HEIR_MARKER_AMOUNT,
        Script::pay_to_pubkey(&txid_pubkey(fundingtxid)),
    );

    let payload = HeirPayload::Successor(HeirSuccessor {
        funcid: b'A',
        fundingtxid: *fundingtxid,
        has_spending_begun: plan.has_spending_begun,
    });
    let opret = heir_opret(plan.tokenid.as_ref(), &plan.owner, &plan.heir, &payload);
    let tx = builder.finalize(keystore, payer, txfee, Some(opret))?;
    Ok((tx, donation))
}

/// Withdraw from a plan. The owner may always claim; the heir passes the
/// inactivity gate (or the latch). The emitted op-return carries the latch,
/// set when the claimant is the heir.
#[instrument(skip(chain, keystore), fields(%fundingtxid, amount))]
pub fn heir_claim<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    claimant: &PubKey,
    fundingtxid: &TxId,
    txfee: Amount,
    amount: Amount,
) -> Result<Transaction, CcError> {
    if amount <= 0 {
        return Err(CcError::invalid("non-positive amount"));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };
    let plan = find_latest_plan_tx(chain, fundingtxid)?;

    if *claimant != plan.owner && *claimant != plan.heir {
        return Err(CcError::Unauthorised(
            "claimant is neither owner nor heir".into(),
        ));
    }
    if *claimant == plan.heir && !plan.is_heir_spending_allowed(chain) {
        return Err(CcError::StateGate(format!(
            "spending is not allowed yet for the heir: inactive {}s of {}s",
            plan.owner_inactivity(chain),
            plan.inactivity_secs
        )));
    }

    let mut builder = TxAssembler::new(chain);
    let collected = builder.add_normal_inputs(claimant, txfee, 0, true)?;
    if collected < txfee {
        return Err(CcError::InsufficientFunds {
            needed: txfee,
            available: collected,
        });
    }
    let inputs = add_plan_inputs(&mut builder, &plan, amount)?;
    if inputs < amount {
        return Err(CcError::InsufficientFunds {
            needed: amount,
            available: inputs,
        });
    }

    match &plan.tokenid {
        None => builder.add_output(amount, Script::pay_to_pubkey(claimant)),
        Some(tokenid) => {
            let nft_eval = get_token_data(chain, tokenid)?.nft_eval();
            builder.add_output(amount, tokens_cc_script(TOKENS_VER, &[nft_eval], claimant));
        }
    }
    let change = inputs - amount;
    if change > 0 {
        builder.add_output(change, plan.script());
    }

    builder.attach_probe(
        plan_probe(plan.tokenid.as_ref(), &plan.owner, &plan.heir),
        None,
    );

    let began = *claimant == plan.heir || plan.has_spending_begun;
    let payload = HeirPayload::Successor(HeirSuccessor {
        funcid: b'C',
        fundingtxid: *fundingtxid,
        has_spending_begun: began,
    });
    let opret = heir_opret(plan.tokenid.as_ref(), &plan.owner, &plan.heir, &payload);
    builder.finalize(keystore, claimant, txfee, Some(opret))
}

// ---------------------------------------------------------------------------
// queries
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct HeirInfo {
    pub fundingtxid: TxId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenid: Option<TxId>,
    pub kind: String,
    pub owner: PubKey,
    pub heir: PubKey,
    pub lifetime_deposited: Amount,
    pub available: Amount,
    pub inactivity_time_setting: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_inactivity: Option<u64>,
    pub lasttxid: TxId,
    pub is_heir_spending_allowed: bool,
    pub memo: String,
}

pub fn heir_info<C: ChainView + ?Sized>(
    chain: &C,
    fundingtxid: &TxId,
) -> Result<HeirInfo, CcError> {
    let plan = find_latest_plan_tx(chain, fundingtxid)?;
    let address = plan.script().address();

    // lifetime: every deposit head (vout 0 of F and A txs) ever made
    let mut lifetime = 0;
    for entry in chain.history_by_address(&address) {
        if entry.outpoint.vout != 0 {
            continue;
        }
        let Ok((tx, _)) = chain.get_tx(&entry.outpoint.txid) else {
            continue;
        };
        match plan_reference(&tx, &entry.outpoint.txid, fundingtxid, plan.tokenid.as_ref()) {
            Some((funcid, _)) if funcid != b'C' => lifetime += entry.amount,
            _ => {}
        }
    }

    let mut probe = TxAssembler::new(chain);
    let available = add_plan_inputs(&mut probe, &plan, 0)?;

    let allowed = plan.is_heir_spending_allowed(chain);
    let inactivity = plan.owner_inactivity(chain);
    Ok(HeirInfo {
        fundingtxid: *fundingtxid,
        name: plan.name.clone(),
        tokenid: plan.tokenid,
        kind: if plan.tokenid.is_some() { "tokens" } else { "coins" }.to_string(),
        owner: plan.owner,
        heir: plan.heir,
        lifetime_deposited: lifetime,
        available,
        inactivity_time_setting: plan.inactivity_secs,
        current_inactivity: (!plan.has_spending_begun).then_some(inactivity),
        lasttxid: plan.latest_txid,
        is_heir_spending_allowed: allowed,
        memo: plan.memo.clone(),
    })
}

/// All plan handles, via the funding markers at the module global address.
pub fn heir_list<C: ChainView + ?Sized>(chain: &C) -> Vec<TxId> {
    let address = heir_marker_script().address();
    let mut plans = Vec::new();
    for entry in chain.unspent_by_address(&address, true) {
        let Ok((tx, _)) = chain.get_tx(&entry.outpoint.txid) else {
            continue;
        };
        let Some(opret) = tx.opret().and_then(|s| s.op_return_data()) else {
            continue;
        };
        if let Ok((_, HeirPayload::Create(_))) = decode_heir_either(opret) {
            plans.push(entry.outpoint.txid);
        }
    }
    plans
}

// ---------------------------------------------------------------------------
// consensus predicate
// ---------------------------------------------------------------------------

/// Signer of the first CC vin spending the plan escrow.
fn plan_vin_signer(tx: &Transaction, plan: &PlanState) -> Option<PubKey> {
    let script = plan.script();
    for vin in &tx.inputs {
        let Some(fulfillment) = keys::CcFulfillment::decode(&vin.script_sig) else {
            continue;
        };
        if fulfillment.matches_output(&script) {
            return Some(fulfillment.signer);
        }
    }
    None
}

fn check_marker_protection<C: ChainView + ?Sized>(
    chain: &C,
    tx: &Transaction,
) -> Result<(), ValidationError> {
    let marker = heir_marker_script();
    for vin in &tx.inputs {
        if !keys::is_cc_input(&vin.script_sig) {
            continue;
        }
        let prevout = chain
            .prevout(&vin.prevout)
            .map_err(|e| ValidationError::invalid(e.to_string()))?;
        if prevout.script == marker {
            return Err(ValidationError::invalid(
                "plan discovery markers are not spendable",
            ));
        }
    }
    Ok(())
}

/// The heir predicate (consensus).
#[instrument(skip(chain, tx), fields(txid = %tx.txid()))]
pub fn validate_heir_tx<C: ChainView + ?Sized>(
    chain: &C,
    tx: &Transaction,
) -> Result<(), ValidationError> {
    let opret = tx
        .opret()
        .and_then(|s| s.op_return_data())
        .ok_or_else(|| ValidationError::invalid("no heir opret"))?;
    let (tokenid, payload) = decode_heir_either(opret)?;

    check_marker_protection(chain, tx)?;

    match payload {
        HeirPayload::Create(create) => {
            // funding txs spend no heir escrow; a heir-eval vin under an 'F'
            // opret is only legitimate on the token side, where vout0 must
            // still be the declared 1-of-2
            if tokenid.is_none() {
                return Err(ValidationError::invalid(
                    "coin funding tx cannot spend heir inputs",
                ));
            }
            let expected = plan_script(tokenid.as_ref(), &create.owner, &create.heir);
            match tx.outputs.first() {
                Some(vout) if vout.script == expected => Ok(()),
                _ => Err(ValidationError::invalid(
                    "funding vout is not the declared 1-of-2",
                )),
            }
        }
        HeirPayload::Successor(successor) => {
            if successor.fundingtxid.is_zero() {
                return Err(ValidationError::invalid("no fundingtxid in opreturn"));
            }
            let plan = find_latest_plan_tx(chain, &successor.fundingtxid)
                .map_err(|e| ValidationError::invalid(format!("no funding tx found: {e}")))?;
            if plan.tokenid != tokenid {
                return Err(ValidationError::invalid("opret tokenid does not match the plan"));
            }
            // latch monotonicity: once begun, forever begun
            if plan.has_spending_begun && !successor.has_spending_begun {
                return Err(ValidationError::invalid(
                    "has_spending_begun may not revert to 0",
                ));
            }

            // every heir-eval CC vin must spend the plan escrow
            let escrow = plan.script();
            for vin in &tx.inputs {
                let Some(fulfillment) = keys::CcFulfillment::decode(&vin.script_sig) else {
                    continue;
                };
                if !fulfillment.condition.has_eval(EVAL_HEIR) {
                    continue;
                }
                let prevout = chain
                    .prevout(&vin.prevout)
                    .map_err(|e| ValidationError::invalid(e.to_string()))?;
                if prevout.script != escrow {
                    return Err(ValidationError::invalid(
                        "heir CC vin outside the plan escrow",
                    ));
                }
            }

            match successor.funcid {
                b'A' => {
                    let ok = tx
                        .outputs
                        .first()
                        .map(|v| v.script == escrow)
                        .unwrap_or(false);
                    if ok {
                        Ok(())
                    } else {
                        Err(ValidationError::invalid("add vout0 must fund the 1-of-2"))
                    }
                }
                b'C' => validate_claim(chain, tx, &plan, &successor),
                other => Err(ValidationError::invalid(format!(
                    "unexpected heir funcid {:?}",
                    other as char
                ))),
            }
        }
    }
}

fn validate_claim<C: ChainView + ?Sized>(
    chain: &C,
    tx: &Transaction,
    plan: &PlanState,
    successor: &HeirSuccessor,
) -> Result<(), ValidationError> {
    let signer = plan_vin_signer(tx, plan)
        .ok_or_else(|| ValidationError::invalid("claim spends no plan escrow input"))?;

    if signer == plan.heir {
        if !plan.is_heir_spending_allowed(chain) {
            return Err(ValidationError::invalid(
                "inactivity time has not passed and spending has not begun",
            ));
        }
        if !successor.has_spending_begun {
            return Err(ValidationError::invalid(
                "heir claim must set has_spending_begun",
            ));
        }
    } else if signer != plan.owner {
        return Err(ValidationError::invalid(
            "claim signed by neither owner nor heir",
        ));
    }

    // vout0 pays the claiming party (or their token address for token plans)
    let vout0 = tx
        .outputs
        .first()
        .ok_or_else(|| ValidationError::invalid("claim has no outputs"))?;
    let payout_ok = match &plan.tokenid {
        None => {
            vout0.script == Script::pay_to_pubkey(&plan.owner)
                || vout0.script == Script::pay_to_pubkey(&plan.heir)
        }
        Some(tokenid) => {
            let nft_eval = get_token_data(chain, tokenid).map(|d| d.nft_eval()).unwrap_or(0);
            [&plan.owner, &plan.heir].iter().any(|pk| {
                vout0.script == tokens_cc_script(TOKENS_VER, &[nft_eval], pk)
                    || vout0.script == tokens_cc_script(TOKENS_VER, &[], pk)
            })
        }
    };
    if !payout_ok {
        return Err(ValidationError::invalid(
            "claim vout0 pays neither owner nor heir",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::module_keys;

    fn pk(tag: u8) -> PubKey {
        let secret = {
            let mut s = [tag; 32];
            s[0] = 1;
            s
        };
        keys::pubkey_from_secret(&secret)
    }

    #[test]
    fn plan_scripts_differ_by_kind_and_parties() {
        let coins = plan_script(None, &pk(1), &pk(2));
        let tokens = plan_script(Some(&TxId([7; 32])), &pk(1), &pk(2));
        assert_ne!(coins, tokens);
        assert_ne!(coins, plan_script(None, &pk(2), &pk(1)));
    }

    #[test]
    fn heir_marker_uses_module_key() {
        let script = heir_marker_script();
        let cond = script.condition().unwrap();
        assert_eq!(cond.evals(), &[EVAL_HEIR]);
        assert_eq!(cond.pubkeys(), &[module_keys(EVAL_HEIR).pubkey]);
    }
}
