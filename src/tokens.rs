//! Colored-coin token contract: mint, transfer, balance, info, and the
//! consensus predicate.
//!
//! The consensus rule is value conservation: for every tokenid touched by a
//! transaction, the sum of token amounts entering over CC vins equals the sum
//! leaving over CC vouts, with the creation tx as the one minting exception.
//! Whether a vout *is* a token vout is decided by byte-exact reconstruction of
//! every plausible token script from the op-return's receiver pubkeys and the
//! eval codes in play. Eval codes are part of the script, so reconstruction
//! is the authoritative test.

use crate::chain::ChainView;
use crate::condition::Condition;
use crate::constants::{
    global_pubkey, BURN_PUBKEY, DEFAULT_TXFEE, TOKEN_DESCRIPTION_MAX, TOKEN_NAME_MAX,
};
use crate::error::{CcError, ValidationError};
use crate::keys::{self, KeyStore};
use crate::opret::{
    decode_nft_blob, decode_token_payload, NftData, TokenCreate, TokenPayload, TokenTransfer,
    TokenVersion,
};
use crate::script::Script;
use crate::txbuilder::{total_pubkey_normal_inputs, TxAssembler, MAX_VINS};
use crate::types::{Amount, PubKey, Transaction, TxId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument, warn};

/// Per-call token contract context: the generation in play and the NFT class
/// eval code once it is known. Passed explicitly; nothing is process-global.
#[derive(Clone, Copy, Debug)]
pub struct TokenCtx {
    pub ver: TokenVersion,
    /// NFT class eval code, 0 for fungible tokens.
    pub nft_eval: u8,
}

impl TokenCtx {
    pub fn new(ver: TokenVersion) -> Self {
        Self { ver, nft_eval: 0 }
    }
}

/// Creation-tx data of a token.
#[derive(Clone, Debug)]
pub struct TokenData {
    pub origpubkey: PubKey,
    pub name: String,
    pub description: String,
    pub nft: Option<NftData>,
}

impl TokenData {
    pub fn nft_eval(&self) -> u8 {
        self.nft.as_ref().map(|n| n.eval_code).unwrap_or(0)
    }

    pub fn royalty(&self) -> Amount {
        self.nft.as_ref().map(|n| n.royalty).unwrap_or(0)
    }
}

/// Build the token CC script for one receiver under the version's publication
/// form (plain for V1, anonymised for V2).
pub fn tokens_cc_script(ver: TokenVersion, extra_evals: &[u8], pk: &PubKey) -> Script {
    let cond = Condition::tokens_cc1(ver.eval(), extra_evals, *pk);
    if ver.is_mixed() {
        cond.to_anon().script()
    } else {
        cond.script()
    }
}

/// 1-of-2 variant of [`tokens_cc_script`].
pub fn tokens_cc1of2_script(
    ver: TokenVersion,
    extra_evals: &[u8],
    pk1: &PubKey,
    pk2: &PubKey,
) -> Script {
    let cond = Condition::tokens_cc1of2(ver.eval(), extra_evals, *pk1, *pk2);
    if ver.is_mixed() {
        cond.to_anon().script()
    } else {
        cond.script()
    }
}

/// Address holding `pk`'s tokens (dual-eval for NFT classes).
pub fn token_address(ctx: &TokenCtx, pk: &PubKey) -> String {
    tokens_cc_script(ctx.ver, &[ctx.nft_eval], pk).address()
}

/// The token module's own marker script (creation markers live here).
pub fn token_marker_script(ver: TokenVersion) -> Script {
    Condition::cc1(ver.eval(), global_pubkey(ver.eval())).script()
}

/// Load a token's creation data; `NotFound` when the txid is not a token.
pub fn get_token_data<C: ChainView + ?Sized>(
    chain: &C,
    tokenid: &TxId,
) -> Result<TokenData, CcError> {
    let (tx, _) = chain.get_tx(tokenid)?;
    let opret = tx
        .opret()
        .and_then(|s| s.op_return_data())
        .ok_or_else(|| CcError::not_found(format!("{tokenid} has no token opret")))?;
    match decode_token_payload(opret)? {
        TokenPayload::Create(create) => {
            let nft = match create.nft_blob() {
                Some(blob) => Some(decode_nft_blob(blob)?),
                None => None,
            };
            Ok(TokenData {
                origpubkey: create.origpubkey,
                name: create.name,
                description: create.description,
                nft,
            })
        }
        TokenPayload::Transfer(_) => Err(CcError::not_found(format!(
            "{tokenid} is not a token creation tx"
        ))),
    }
}

// ---------------------------------------------------------------------------
// vout classification
// ---------------------------------------------------------------------------

/// True when the vout is the module's creation marker (at the token global
/// address). Markers are excluded from conservation sums.
pub fn is_token_marker_vout(ver: TokenVersion, script: &Script) -> bool {
    *script == token_marker_script(ver)
}

/// Decide whether vout `v` of `tx` is a token vout, and for which tokenid.
///
/// Reconstructs every plausible token script from the op-return (single-eval,
/// dual-eval with the NFT class, triple-eval with the nested payload's eval in
/// both orderings, single receiver and 1-of-2) and compares bytes.
pub fn check_token_vout<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
    v: usize,
) -> Result<Option<(TxId, Amount)>, ValidationError> {
    let Some(vout) = tx.outputs.get(v) else {
        return Ok(None);
    };
    if !vout.script.is_pay_to_condition() {
        return Ok(None);
    }
    let Some(opret) = tx.opret().and_then(|s| s.op_return_data()) else {
        return Ok(None);
    };
    let Ok(payload) = decode_token_payload(opret) else {
        return Ok(None);
    };
    if payload.version() != ver {
        return Ok(None);
    }

    match payload {
        TokenPayload::Create(create) => {
            let tokenid = tx.txid();
            let nft_eval = match create.nft_blob() {
                Some(blob) => decode_nft_blob(blob)?.eval_code,
                None => 0,
            };
            let candidate = tokens_cc_script(ver, &[nft_eval], &create.origpubkey);
            if vout.script == candidate {
                Ok(Some((tokenid, vout.value)))
            } else {
                Ok(None)
            }
        }
        TokenPayload::Transfer(transfer) => {
            let tokenid = transfer.tokenid;
            // NFT class comes from the creation tx, the extra eval from the
            // nested payload (the asset contract rides there).
            let nft_eval = get_token_data(chain, &tokenid)
                .map(|d| d.nft_eval())
                .unwrap_or(0);
            let nested_eval = transfer.nested_blob().map(|b| b[0]).unwrap_or(0);
            // change vouts pay the spender, who appears as a CC vin signer
            // rather than in the opret receiver list
            let vin_pks = extract_cc_vin_pubkeys(tx, ver.eval());

            for script in candidate_scripts(ver, nft_eval, nested_eval, &transfer, &vin_pks) {
                if vout.script == script {
                    return Ok(Some((tokenid, vout.value)));
                }
            }
            Ok(None)
        }
    }
}

/// Signer pubkeys of the tx's token CC vins.
pub fn extract_cc_vin_pubkeys(tx: &Transaction, eval: u8) -> Vec<PubKey> {
    let mut pks = Vec::new();
    for vin in &tx.inputs {
        if let Some(fulfillment) = keys::CcFulfillment::decode(&vin.script_sig) {
            if fulfillment.condition.has_eval(eval) && !pks.contains(&fulfillment.signer) {
                pks.push(fulfillment.signer);
            }
        }
    }
    pks
}

fn candidate_scripts(
    ver: TokenVersion,
    nft_eval: u8,
    nested_eval: u8,
    transfer: &TokenTransfer,
    vin_pks: &[PubKey],
) -> Vec<Script> {
    let mut eval_sets: Vec<Vec<u8>> = vec![vec![]];
    if nft_eval != 0 {
        eval_sets.push(vec![nft_eval]);
    }
    if nested_eval != 0 {
        eval_sets.push(vec![nested_eval]);
    }
    if nft_eval != 0 && nested_eval != 0 {
        eval_sets.push(vec![nft_eval, nested_eval]);
        eval_sets.push(vec![nested_eval, nft_eval]);
    }

    let mut scripts = Vec::new();
    for evals in &eval_sets {
        for pk in transfer.dest_pubkeys.iter().chain(vin_pks) {
            scripts.push(tokens_cc_script(ver, evals, pk));
        }
        if let [pk1, pk2] = transfer.dest_pubkeys.as_slice() {
            scripts.push(tokens_cc1of2_script(ver, evals, pk1, pk2));
        }
    }
    scripts
}

// ---------------------------------------------------------------------------
// input selection
// ---------------------------------------------------------------------------

/// Add CC token inputs for `tokenid` from `source_addr` until `target` is
/// covered. With `target == 0 && max_inputs == 0` this is a balance query:
/// amounts accumulate but no vins are pushed.
///
/// Sets `ctx.nft_eval` from the creation tx when not already known.
pub fn add_token_inputs<C: ChainView + ?Sized>(
    builder: &mut TxAssembler<'_, C>,
    ctx: &mut TokenCtx,
    source_addr: &str,
    tokenid: &TxId,
    target: Amount,
    max_inputs: usize,
    use_mempool: bool,
) -> Result<Amount, CcError> {
    let chain = builder.chain();
    if ctx.nft_eval == 0 {
        ctx.nft_eval = get_token_data(chain, tokenid)?.nft_eval();
    }

    let balance_query = target == 0 && max_inputs == 0;
    let limit = if max_inputs == 0 { MAX_VINS } else { max_inputs };
    let mut collected = 0;
    let mut pushed = 0usize;

    for entry in chain.unspent_by_address_tokenid(source_addr, tokenid) {
        if entry.amount == 0 {
            continue;
        }
        if builder.tx.inputs.iter().any(|vin| vin.prevout == entry.outpoint) {
            continue;
        }
        if !use_mempool && chain.is_spent_in_mempool(&entry.outpoint) {
            continue;
        }
        let (vin_tx, _) = chain.get_tx(&entry.outpoint.txid)?;
        let vout_ok = check_token_vout(chain, ctx.ver, &vin_tx, entry.outpoint.vout as usize)
            .map_err(|e| CcError::invalid(e.to_string()))?
            .map(|(id, amount)| id == *tokenid && amount > 0)
            .unwrap_or(false);
        if !vout_ok {
            continue;
        }

        if !balance_query {
            builder.add_cc_input(entry.outpoint);
            pushed += 1;
        }
        collected += entry.amount;
        if !balance_query && ((target > 0 && collected >= target) || pushed >= limit) {
            break;
        }
    }
    debug!(collected, target, %tokenid, "selected token inputs");
    Ok(collected)
}

// ---------------------------------------------------------------------------
// public operations
// ---------------------------------------------------------------------------

/// Mint a token. The creator must cover `supply` satoshis of normal inputs
/// with their own pubkey; the resulting txid is the tokenid.
#[instrument(skip(chain, keystore, nft_blob), fields(name = %name))]
pub fn create_token<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    creator: &PubKey,
    txfee: Amount,
    supply: Amount,
    name: &str,
    description: &str,
    nft_blob: Option<Vec<u8>>,
    extra_marker_eval: u8,
) -> Result<Transaction, CcError> {
    if supply < 0 {
        return Err(CcError::invalid(format!("negative supply {supply}")));
    }
    let nft_blob = nft_blob.filter(|b| !b.is_empty());
    if nft_blob.is_some() && supply != 1 {
        return Err(CcError::invalid(
            "non-fungible tokens require supply equal to 1",
        ));
    }
    if name.len() > TOKEN_NAME_MAX || description.len() > TOKEN_DESCRIPTION_MAX {
        return Err(CcError::invalid(format!(
            "name must be <= {TOKEN_NAME_MAX} bytes, description <= {TOKEN_DESCRIPTION_MAX}"
        )));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };
    let marker_count: Amount = if extra_marker_eval > 0 { 2 } else { 1 };

    let dest_eval = match &nft_blob {
        Some(blob) => decode_nft_blob(blob)?.eval_code,
        None => 0,
    };

    let mut builder = TxAssembler::new(chain);
    let target = supply + (marker_count + 1) * txfee;
    let collected = builder.add_normal_inputs(creator, target, 0, false)?;
    if collected < target {
        return Err(CcError::InsufficientFunds {
            needed: target,
            available: collected,
        });
    }
    // the supply must really be issued by the creator's key, not whatever
    // else the wallet happens to hold
    if total_pubkey_normal_inputs(chain, &builder.tx, creator) < supply {
        return Err(CcError::Unauthorised(
            "token supply must be funded by the creator pubkey".into(),
        ));
    }

    builder.add_output(txfee, token_marker_script(ver));
    builder.add_output(supply, tokens_cc_script(ver, &[dest_eval], creator));
    if extra_marker_eval > 0 {
        let marker = Condition::cc1(extra_marker_eval, global_pubkey(extra_marker_eval));
        builder.add_output(txfee, marker.script());
    }

    let opret = TokenCreate {
        ver,
        origpubkey: *creator,
        name: name.to_string(),
        description: description.to_string(),
        blobs: nft_blob.into_iter().collect(),
    }
    .encode();
    builder.finalize(keystore, creator, txfee, Some(opret))
}

/// Transfer tokens from the caller's own token address to one receiver.
pub fn transfer_token<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    from: &PubKey,
    txfee: Amount,
    tokenid: &TxId,
    dest: &PubKey,
    amount: Amount,
) -> Result<Transaction, CcError> {
    let mut ctx = TokenCtx::new(ver);
    ctx.nft_eval = get_token_data(chain, tokenid)?.nft_eval();
    let source_addr = token_address(&ctx, from);
    let probe = Condition::tokens_cc1(ver.eval(), &[ctx.nft_eval], *from);
    transfer_token_ext(
        chain,
        keystore,
        ctx,
        from,
        txfee,
        tokenid,
        &source_addr,
        vec![(probe, None)],
        &[*dest],
        amount,
        true,
    )
}

/// Extended transfer: custom source address, externally supplied probe
/// conditions (the order and heir contracts spend their escrows through
/// this), and one or two destination pubkeys (two makes a 1-of-2 vout).
#[allow(clippy::too_many_arguments)]
#[instrument(skip(chain, keystore, probes), fields(%tokenid, amount))]
pub fn transfer_token_ext<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    mut ctx: TokenCtx,
    payer: &PubKey,
    txfee: Amount,
    tokenid: &TxId,
    source_addr: &str,
    probes: Vec<(Condition, Option<[u8; 32]>)>,
    dest_pubkeys: &[PubKey],
    amount: Amount,
    use_mempool: bool,
) -> Result<Transaction, CcError> {
    if amount <= 0 {
        return Err(CcError::invalid(format!("non-positive amount {amount}")));
    }
    if dest_pubkeys.is_empty() || dest_pubkeys.len() > 2 {
        return Err(CcError::invalid(
            "destination must be one or two pubkeys",
        ));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };

    let mut builder = TxAssembler::new(chain);
    let normal = builder.add_normal_inputs(payer, txfee, 0, use_mempool)?;
    if normal < txfee {
        return Err(CcError::InsufficientFunds {
            needed: txfee,
            available: normal,
        });
    }

    let inputs = add_token_inputs(&mut builder, &mut ctx, source_addr, tokenid, amount, 0, use_mempool)?;
    if inputs < amount {
        return Err(CcError::InsufficientFunds {
            needed: amount,
            available: inputs,
        });
    }

    let dest_evals = [ctx.nft_eval];
    match dest_pubkeys {
        [pk] => builder.add_output(amount, tokens_cc_script(ctx.ver, &dest_evals, pk)),
        [pk1, pk2] => {
            builder.add_output(amount, tokens_cc1of2_script(ctx.ver, &dest_evals, pk1, pk2))
        }
        _ => unreachable!(),
    }
    let change = inputs - amount;
    if change > 0 {
        builder.add_output(change, tokens_cc_script(ctx.ver, &dest_evals, payer));
    }

    for (condition, secret) in probes {
        builder.attach_probe(condition, secret);
    }

    let opret = TokenTransfer {
        ver: ctx.ver,
        tokenid: *tokenid,
        dest_pubkeys: dest_pubkeys.to_vec(),
        blobs: vec![],
    }
    .encode();
    builder.finalize(keystore, payer, txfee, Some(opret))
}

/// Sum of CC token inputs available to `pk` for a tokenid.
pub fn token_balance<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    pk: &PubKey,
    tokenid: &TxId,
    use_mempool: bool,
) -> Result<Amount, CcError> {
    let mut ctx = TokenCtx::new(ver);
    ctx.nft_eval = get_token_data(chain, tokenid)?.nft_eval();
    let addr = token_address(&ctx, pk);
    let mut builder = TxAssembler::new(chain);
    add_token_inputs(&mut builder, &mut ctx, &addr, tokenid, 0, 0, use_mempool)
}

/// Token metadata report.
#[derive(Clone, Debug, Serialize)]
pub struct TokenInfo {
    pub tokenid: TxId,
    pub owner: PubKey,
    pub name: String,
    pub description: String,
    pub supply: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub version: u8,
    pub is_mixed: bool,
}

pub fn token_info<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tokenid: &TxId,
) -> Result<TokenInfo, CcError> {
    let data = get_token_data(chain, tokenid)?;
    let (create_tx, _) = chain.get_tx(tokenid)?;

    let mut supply = 0;
    for v in 0..create_tx.outputs.len() {
        if let Some((id, amount)) = check_token_vout(chain, ver, &create_tx, v)
            .map_err(|e| CcError::invalid(e.to_string()))?
        {
            if id == *tokenid {
                supply += amount;
            }
        }
    }

    Ok(TokenInfo {
        tokenid: *tokenid,
        owner: data.origpubkey,
        name: data.name.clone(),
        description: data.description.clone(),
        supply,
        data: data.nft.as_ref().map(|n| hex::encode(n.encode())),
        version: 1,
        is_mixed: ver.is_mixed(),
    })
}

// ---------------------------------------------------------------------------
// consensus predicate
// ---------------------------------------------------------------------------

/// Sum token vouts paid to the burn pubkey, trying every script shape the
/// token could take there.
fn burned_token_amount<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
    tokenid: &TxId,
) -> Result<Amount, ValidationError> {
    let nft_eval = get_token_data(chain, tokenid).map(|d| d.nft_eval()).unwrap_or(0);
    let nested_eval = tx
        .opret()
        .and_then(|s| s.op_return_data())
        .and_then(|d| decode_token_payload(d).ok())
        .and_then(|p| match p {
            TokenPayload::Transfer(t) => t.nested_blob().map(|b| b[0]),
            TokenPayload::Create(_) => None,
        })
        .unwrap_or(0);

    let mut eval_sets: Vec<Vec<u8>> = vec![vec![]];
    if nft_eval != 0 {
        eval_sets.push(vec![nft_eval]);
    }
    if nft_eval != 0 && nested_eval != 0 {
        eval_sets.push(vec![nft_eval, nested_eval]);
        eval_sets.push(vec![nested_eval, nft_eval]);
    }

    let mut burned = 0;
    for vout in &tx.outputs {
        if !vout.script.is_pay_to_condition() {
            continue;
        }
        for evals in &eval_sets {
            if vout.script == tokens_cc_script(ver, evals, &BURN_PUBKEY) {
                burned += vout.value;
                break;
            }
        }
    }
    Ok(burned)
}

/// I2: a vin spending the token-global marker is allowed only when the tx
/// burns the full single-unit supply of that NFT.
fn check_marker_spending<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
    tokenid: &TxId,
) -> Result<(), ValidationError> {
    let global_pk = global_pubkey(ver.eval());
    for vin in &tx.inputs {
        if !keys::is_cc_input(&vin.script_sig) {
            continue;
        }
        if keys::cc_signing_pubkey(&vin.script_sig) != Some(global_pk) {
            continue;
        }
        let prevout = chain
            .prevout(&vin.prevout)
            .map_err(|e| ValidationError::invalid(e.to_string()))?;
        if !is_token_marker_vout(ver, &prevout.script) {
            continue;
        }

        // marker spend: only for a fully burned NFT, and only its own marker
        if vin.prevout.txid != *tokenid {
            return Err(ValidationError::MarkerSpend(*tokenid));
        }
        let burned = burned_token_amount(chain, ver, tx, tokenid)?;
        let supply = token_supply(chain, ver, tokenid)?;
        if !(supply == 1 && burned == supply) {
            warn!(%tokenid, burned, supply, "marker spend without full NFT burn");
            return Err(ValidationError::MarkerSpend(*tokenid));
        }
    }
    Ok(())
}

fn token_supply<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tokenid: &TxId,
) -> Result<Amount, ValidationError> {
    let (create_tx, _) = chain
        .get_tx(tokenid)
        .map_err(|e| ValidationError::invalid(e.to_string()))?;
    let mut supply = 0;
    for v in 0..create_tx.outputs.len() {
        if let Some((id, amount)) = check_token_vout(chain, ver, &create_tx, v)? {
            if id == *tokenid {
                supply += amount;
            }
        }
    }
    Ok(supply)
}

/// The token predicate (consensus).
///
/// The predecessor walk is single-level and guarded by a visited set: a vin
/// tx's vouts are classified without re-running conservation on the vin tx
/// (its own acceptance already did that), so depth is bounded by design.
#[instrument(skip(chain, tx), fields(txid = %tx.txid()))]
pub fn validate_token_tx<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
) -> Result<(), ValidationError> {
    let opret = tx
        .opret()
        .and_then(|s| s.op_return_data())
        .ok_or_else(|| ValidationError::invalid("no token opret"))?;
    let payload = decode_token_payload(opret)?;
    if payload.version() != ver {
        return Err(ValidationError::invalid("token opret version mismatch"));
    }

    match &payload {
        TokenPayload::Create(_) => {
            // a creation tx mints from normal inputs only; any token CC vin
            // under a create opret is an attempt to re-mint
            for vin in &tx.inputs {
                if keys::is_cc_input(&vin.script_sig) {
                    let is_token_vin = keys::CcFulfillment::decode(&vin.script_sig)
                        .map(|f| f.condition.has_eval(ver.eval()))
                        .unwrap_or(true);
                    if is_token_vin {
                        return Err(ValidationError::invalid(
                            "token creation tx cannot spend token CC inputs",
                        ));
                    }
                }
            }
            Ok(())
        }
        TokenPayload::Transfer(transfer) => {
            let (inputs, outputs) = token_amounts(chain, ver, tx)?;
            if inputs.is_empty() {
                return Err(ValidationError::invalid("no token CC inputs for transfer"));
            }
            if !outputs.contains_key(&transfer.tokenid) && !inputs.contains_key(&transfer.tokenid) {
                return Err(ValidationError::invalid(
                    "opret tokenid absent from CC vins and vouts",
                ));
            }
            let mut ids: HashSet<&TxId> = inputs.keys().collect();
            ids.extend(outputs.keys());
            for tokenid in ids {
                let total_in = inputs.get(tokenid).copied().unwrap_or(0);
                let total_out = outputs.get(tokenid).copied().unwrap_or(0);
                if total_in != total_out {
                    return Err(ValidationError::Conservation {
                        tokenid: *tokenid,
                        inputs: total_in,
                        outputs: total_out,
                    });
                }
                check_marker_spending(chain, ver, tx, tokenid)?;
            }
            Ok(())
        }
    }
}

/// Collect per-tokenid CC input and output sums. Markers are excluded from
/// both sides; their spending is judged separately.
fn token_amounts<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
) -> Result<(BTreeMap<TxId, Amount>, BTreeMap<TxId, Amount>), ValidationError> {
    let mut inputs = BTreeMap::new();
    let mut outputs = BTreeMap::new();
    let mut visited: HashSet<TxId> = HashSet::new();

    for vin in &tx.inputs {
        if !keys::is_cc_input(&vin.script_sig) {
            continue;
        }
        let Some(fulfillment) = keys::CcFulfillment::decode(&vin.script_sig) else {
            return Err(ValidationError::invalid("undecodable CC input"));
        };
        if !fulfillment.condition.has_eval(ver.eval()) {
            continue;
        }
        let (vin_tx, _) = chain
            .get_tx(&vin.prevout.txid)
            .map_err(|_| ValidationError::invalid(format!("could not load vin tx {}", vin.prevout.txid)))?;
        visited.insert(vin.prevout.txid);

        let prevout = vin_tx
            .outputs
            .get(vin.prevout.vout as usize)
            .ok_or_else(|| ValidationError::invalid("vin points past vout count"))?;
        if is_token_marker_vout(ver, &prevout.script) {
            continue;
        }
        if let Some((tokenid, amount)) =
            check_token_vout(chain, ver, &vin_tx, vin.prevout.vout as usize)?
        {
            if amount != 0 {
                *inputs.entry(tokenid).or_insert(0) += amount;
            }
        }
    }

    for v in 0..tx.outputs.len() {
        if is_token_marker_vout(ver, &tx.outputs[v].script) {
            continue;
        }
        if let Some((tokenid, amount)) = check_token_vout(chain, ver, tx, v)? {
            if amount != 0 {
                *outputs.entry(tokenid).or_insert(0) += amount;
            }
        }
    }

    debug!(vins = visited.len(), tokens_in = ?inputs, tokens_out = ?outputs, "token amounts");
    Ok((inputs, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;

    fn wallet(tag: u8) -> (KeyStore, PubKey) {
        let mut store = KeyStore::new();
        let mut secret = [tag; 32];
        secret[0] = 1;
        let pk = store.add_secret(&secret).unwrap();
        (store, pk)
    }

    fn funded_chain(pk: &PubKey, amount: Amount) -> MemoryChain {
        let mut chain = MemoryChain::new(1_000_000);
        chain.fund_address(Script::pay_to_pubkey(pk), amount);
        chain.mine_block(1_000_060);
        chain
    }

    #[test]
    fn create_and_query_fungible_token() {
        let (store, alice) = wallet(2);
        let mut chain = funded_chain(&alice, 10_000_000);

        let tx = create_token(
            &chain, &store, TokenVersion::V1, &alice, 0, 1000, "T", "", None, 0,
        )
        .unwrap();
        let tokenid = tx.txid();
        chain.accept_tx(tx).unwrap();
        chain.mine_block(1_000_120);

        let info = token_info(&chain, TokenVersion::V1, &tokenid).unwrap();
        assert_eq!(info.supply, 1000);
        assert_eq!(info.owner, alice);
        assert_eq!(info.name, "T");

        let balance = token_balance(&chain, TokenVersion::V1, &alice, &tokenid, true).unwrap();
        assert_eq!(balance, 1000);
    }

    #[test]
    fn create_rejects_bad_arguments() {
        let (store, alice) = wallet(2);
        let chain = funded_chain(&alice, 10_000_000);

        assert!(matches!(
            create_token(&chain, &store, TokenVersion::V1, &alice, 0, -1, "T", "", None, 0),
            Err(CcError::InputInvalid(_))
        ));
        let blob = NftData { eval_code: 0xf7, royalty: 10, ..Default::default() }.encode();
        assert!(matches!(
            create_token(&chain, &store, TokenVersion::V1, &alice, 0, 2, "T", "", Some(blob), 0),
            Err(CcError::InputInvalid(_))
        ));
        let long_name = "x".repeat(33);
        assert!(matches!(
            create_token(&chain, &store, TokenVersion::V1, &alice, 0, 1, &long_name, "", None, 0),
            Err(CcError::InputInvalid(_))
        ));
    }

    #[test]
    fn transfer_moves_balance_and_validates() {
        let (store, alice) = wallet(2);
        let (bob_store, bob) = wallet(3);
        let mut chain = funded_chain(&alice, 10_000_000);
        chain.fund_address(Script::pay_to_pubkey(&bob), 1_000_000);
        chain.mine_block(1_000_061);

        let create =
            create_token(&chain, &store, TokenVersion::V1, &alice, 0, 1000, "T", "", None, 0)
                .unwrap();
        let tokenid = create.txid();
        chain.accept_tx(create).unwrap();
        chain.mine_block(1_000_120);

        let transfer =
            transfer_token(&chain, &store, TokenVersion::V1, &alice, 0, &tokenid, &bob, 250)
                .unwrap();
        validate_token_tx(&chain, TokenVersion::V1, &transfer).unwrap();
        chain.accept_tx(transfer).unwrap();
        chain.mine_block(1_000_180);

        assert_eq!(
            token_balance(&chain, TokenVersion::V1, &alice, &tokenid, true).unwrap(),
            750
        );
        assert_eq!(
            token_balance(&chain, TokenVersion::V1, &bob, &tokenid, true).unwrap(),
            250
        );

        // and bob can pass his share on
        let back =
            transfer_token(&chain, &bob_store, TokenVersion::V1, &bob, 0, &tokenid, &alice, 100)
                .unwrap();
        validate_token_tx(&chain, TokenVersion::V1, &back).unwrap();
    }

    #[test]
    fn conservation_rejects_inflation() {
        let (store, alice) = wallet(2);
        let (_, bob) = wallet(3);
        let mut chain = funded_chain(&alice, 10_000_000);

        let create =
            create_token(&chain, &store, TokenVersion::V1, &alice, 0, 100, "T", "", None, 0)
                .unwrap();
        let tokenid = create.txid();
        chain.accept_tx(create).unwrap();
        chain.mine_block(1_000_120);

        let mut transfer =
            transfer_token(&chain, &store, TokenVersion::V1, &alice, 0, &tokenid, &bob, 40)
                .unwrap();
        // inflate the destination vout after signing
        transfer.outputs[0].value += 10;
        match validate_token_tx(&chain, TokenVersion::V1, &transfer) {
            Err(ValidationError::Conservation { inputs, outputs, .. }) => {
                assert_eq!(inputs, 100);
                assert_eq!(outputs, 110);
            }
            other => panic!("expected conservation failure, got {other:?}"),
        }
    }

    #[test]
    fn nft_records_royalty_and_dual_eval() {
        let (store, alice) = wallet(2);
        let mut chain = funded_chain(&alice, 10_000_000);

        let blob = NftData {
            eval_code: 0xf7,
            royalty: 50,
            url: Some("ipfs://k".into()),
            ..Default::default()
        }
        .encode();
        let create = create_token(
            &chain, &store, TokenVersion::V1, &alice, 0, 1, "NFT", "one of one", Some(blob), 0,
        )
        .unwrap();
        let tokenid = create.txid();
        chain.accept_tx(create).unwrap();
        chain.mine_block(1_000_120);

        let data = get_token_data(&chain, &tokenid).unwrap();
        assert_eq!(data.nft_eval(), 0xf7);
        assert_eq!(data.royalty(), 50);
        assert_eq!(
            token_balance(&chain, TokenVersion::V1, &alice, &tokenid, true).unwrap(),
            1
        );
    }
}
