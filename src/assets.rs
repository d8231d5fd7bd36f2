//! Token order book: bids, asks, fills, cancels.
//!
//! There is no resident book. A live order *is* one unspent CC output at the
//! order module's global unspendable address (coins for bids, tokens for
//! asks) whose op-return carries the price and the maker key. A fill spends
//! the head output and emits a successor head with the remainder (funcid
//! `B`/`S`); a cancel returns the remainder to the maker. Listing the book is
//! enumerating unspent outputs at the global addresses.

use crate::chain::ChainView;
use crate::condition::Condition;
use crate::constants::{global_pubkey, ASSETS_MARKER_AMOUNT, DEFAULT_TXFEE, ROYALTY_DIVISOR};
use crate::error::{CcError, ValidationError};
use crate::keys::{self, KeyStore};
use crate::opret::{decode_asset_opret, AssetFuncId, AssetPayload, TokenVersion};
use crate::script::Script;
use crate::tokens::{
    add_token_inputs, get_token_data, token_address, tokens_cc_script, TokenCtx, TokenData,
};
use crate::txbuilder::TxAssembler;
use crate::types::{Amount, Outpoint, PubKey, Transaction, TxId};
use serde::Serialize;
use tracing::{debug, instrument};

/// The order head lives at vout 0 of every order transaction.
pub const ORDER_VOUT: u32 = 0;

// ---------------------------------------------------------------------------
// escrow scripts
// ---------------------------------------------------------------------------

/// Coin escrow of the order module (bids lock coins here).
pub fn coin_escrow_script(ver: TokenVersion) -> Script {
    let eval = ver.assets_eval();
    let cond = Condition::cc1(eval, global_pubkey(eval));
    if ver.is_mixed() {
        cond.to_anon().script()
    } else {
        cond.script()
    }
}

/// Token escrow of the order module (asks lock tokens here); dual- or
/// triple-eval depending on the NFT class.
pub fn token_escrow_script(ver: TokenVersion, nft_eval: u8) -> Script {
    let eval = ver.assets_eval();
    tokens_cc_script(ver, &[eval, nft_eval], &global_pubkey(eval))
}

/// Marker vout script: a small CC output to `pk` under the order eval code.
/// Spending it takes `pk`'s signature, which is what authorises a cancel.
pub fn marker_script(ver: TokenVersion, pk: &PubKey) -> Script {
    let cond = Condition::cc1(ver.assets_eval(), *pk);
    if ver.is_mixed() {
        cond.to_anon().script()
    } else {
        cond.script()
    }
}

fn coin_escrow_probe(ver: TokenVersion) -> (Condition, Option<[u8; 32]>) {
    let eval = ver.assets_eval();
    let keys = crate::constants::module_keys(eval);
    (Condition::cc1(eval, keys.pubkey), Some(keys.secret))
}

fn token_escrow_probe(ver: TokenVersion, nft_eval: u8) -> (Condition, Option<[u8; 32]>) {
    let eval = ver.assets_eval();
    let keys = crate::constants::module_keys(eval);
    (
        Condition::tokens_cc1(ver.eval(), &[eval, nft_eval], keys.pubkey),
        Some(keys.secret),
    )
}

// ---------------------------------------------------------------------------
// fill arithmetic
// ---------------------------------------------------------------------------

/// Amounts of a bid fill: the coins the taker receives and the coins staying
/// in the successor head.
///
/// The effective per-unit payment is `min(paid_unit_price, unit_price)`; a
/// full fill takes the whole remaining bid, integer-division spread included.
pub fn set_bid_fill_amounts(
    unit_price: Amount,
    bid_amount: Amount,
    fill_units: Amount,
    orig_units: Amount,
    paid_unit_price: Amount,
) -> Result<(Amount, Amount), CcError> {
    if unit_price <= 0 {
        return Err(CcError::invalid("zero unit price in bid"));
    }
    if fill_units <= 0 || fill_units > orig_units {
        return Err(CcError::invalid(format!(
            "fill units {fill_units} out of range 1..={orig_units}"
        )));
    }
    let paid_unit_price = if paid_unit_price <= 0 {
        unit_price
    } else {
        paid_unit_price
    };
    let effective = paid_unit_price.min(unit_price);
    let paid = if fill_units == orig_units {
        bid_amount
    } else {
        effective * fill_units
    };
    let remaining = bid_amount - paid;
    if paid <= 0 || remaining < 0 {
        return Err(CcError::invalid("inconsistent bid fill amounts"));
    }
    Ok((paid, remaining))
}

/// Amounts of an ask fill: the coins owed to the maker and the tokens staying
/// in the successor head. Underpaying an ask is rejected.
pub fn set_ask_fill_amounts(
    unit_price: Amount,
    fill_units: Amount,
    orig_tokens: Amount,
    paid_unit_price: Amount,
) -> Result<(Amount, Amount), CcError> {
    if unit_price <= 0 {
        return Err(CcError::invalid("zero unit price in ask"));
    }
    if fill_units <= 0 || fill_units > orig_tokens {
        return Err(CcError::invalid(format!(
            "fill units {fill_units} out of range 1..={orig_tokens}"
        )));
    }
    let paid_unit_price = if paid_unit_price <= 0 {
        unit_price
    } else {
        paid_unit_price
    };
    if paid_unit_price < unit_price {
        return Err(CcError::invalid(format!(
            "paid unit price {paid_unit_price} below ask price {unit_price}"
        )));
    }
    let paid = paid_unit_price * fill_units;
    let remaining_tokens = orig_tokens - fill_units;
    Ok((paid, remaining_tokens))
}

/// `paid / 1000 * r`, in that evaluation order.
pub fn royalty_value(paid: Amount, royalty_fract: Amount) -> Amount {
    if royalty_fract > 0 {
        paid / ROYALTY_DIVISOR * royalty_fract
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// order head access
// ---------------------------------------------------------------------------

struct OrderHead {
    tx: Transaction,
    payload: AssetPayload,
    tokenid: TxId,
    amount: Amount,
}

/// Load an order by txid and require its head UTXO unspent.
fn load_open_order<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    order_txid: &TxId,
) -> Result<OrderHead, CcError> {
    let head = Outpoint::new(*order_txid, ORDER_VOUT);
    if chain.get_spending(&head).is_some() {
        return Err(CcError::StateGate(format!("order {order_txid} already spent")));
    }
    let (tx, _) = chain.get_tx(order_txid)?;
    let opret = tx
        .opret()
        .and_then(|s| s.op_return_data())
        .ok_or_else(|| CcError::not_found("order has no opret"))?;
    let (tokenid, payload) = decode_asset_opret(opret)?;
    if payload.ver != ver {
        return Err(CcError::invalid("order version mismatch"));
    }
    let amount = tx
        .outputs
        .get(ORDER_VOUT as usize)
        .map(|v| v.value)
        .ok_or_else(|| CcError::not_found("order head vout missing"))?;
    Ok(OrderHead {
        tx,
        payload,
        tokenid,
        amount,
    })
}

/// The marker vout of an order tx: located by script and value, with the
/// vout-count shape check the cancel path applies.
fn find_marker_vout(
    ver: TokenVersion,
    tx: &Transaction,
    maker: &PubKey,
) -> Result<u32, CcError> {
    let script = marker_script(ver, maker);
    for (i, vout) in tx.outputs.iter().enumerate().skip(1) {
        if vout.value == ASSETS_MARKER_AMOUNT && vout.script == script {
            return Ok(i as u32);
        }
    }
    Err(CcError::invalid("order tx has no marker vout"))
}

// ---------------------------------------------------------------------------
// builders
// ---------------------------------------------------------------------------

/// Place a bid: lock `bid_amount` coins against `num_tokens` units of the
/// token. Unit price is the integer quotient; the remainder stays implicit
/// spread absorbed by the last fill.
#[instrument(skip(chain, keystore), fields(%tokenid))]
pub fn create_buy_offer<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    pk: &PubKey,
    txfee: Amount,
    bid_amount: Amount,
    tokenid: &TxId,
    num_tokens: Amount,
) -> Result<Transaction, CcError> {
    if bid_amount <= 0 || num_tokens <= 0 {
        return Err(CcError::invalid("invalid bid amount or token count"));
    }
    let unit_price = bid_amount / num_tokens;
    if unit_price <= 0 {
        return Err(CcError::invalid("bid amount below one satoshi per unit"));
    }
    get_token_data(chain, tokenid)?; // must reference a real token
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };

    let mut builder = TxAssembler::new(chain);
    let target = bid_amount + txfee + ASSETS_MARKER_AMOUNT;
    let collected = builder.add_normal_inputs(pk, target, 0, false)?;
    if collected < target {
        return Err(CcError::InsufficientFunds {
            needed: target,
            available: collected,
        });
    }

    builder.add_output(bid_amount, coin_escrow_script(ver));
    builder.add_output(ASSETS_MARKER_AMOUNT, marker_script(ver, pk));

    let payload = AssetPayload {
        ver,
        funcid: AssetFuncId::Bid,
        other_id: TxId::zero(),
        unit_price,
        origpubkey: *pk,
    };
    let opret = crate::opret::encode_asset_opret(tokenid, vec![], &payload);
    builder.finalize(keystore, pk, txfee, Some(opret))
}

/// Place an ask: lock `num_tokens` token units against `ask_amount` coins.
#[instrument(skip(chain, keystore), fields(%tokenid))]
pub fn create_sell<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    pk: &PubKey,
    txfee: Amount,
    num_tokens: Amount,
    tokenid: &TxId,
    ask_amount: Amount,
) -> Result<Transaction, CcError> {
    if num_tokens <= 0 || ask_amount <= 0 {
        return Err(CcError::invalid("invalid ask amount or token count"));
    }
    let unit_price = ask_amount / num_tokens;
    if unit_price <= 0 {
        return Err(CcError::invalid("ask amount below one satoshi per unit"));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };

    let mut builder = TxAssembler::new(chain);
    let fee_target = txfee + ASSETS_MARKER_AMOUNT;
    let collected = builder.add_normal_inputs(pk, fee_target, 0, false)?;
    if collected < fee_target {
        return Err(CcError::InsufficientFunds {
            needed: fee_target,
            available: collected,
        });
    }

    let mut ctx = TokenCtx::new(ver);
    let source = {
        ctx.nft_eval = get_token_data(chain, tokenid)?.nft_eval();
        token_address(&ctx, pk)
    };
    let inputs = add_token_inputs(&mut builder, &mut ctx, &source, tokenid, num_tokens, 0, false)?;
    if inputs < num_tokens {
        return Err(CcError::InsufficientFunds {
            needed: num_tokens,
            available: inputs,
        });
    }

    builder.add_output(num_tokens, token_escrow_script(ver, ctx.nft_eval));
    builder.add_output(ASSETS_MARKER_AMOUNT, marker_script(ver, pk));
    let change = inputs - num_tokens;
    if change > 0 {
        builder.add_output(change, tokens_cc_script(ver, &[ctx.nft_eval], pk));
    }

    builder.attach_probe(
        Condition::tokens_cc1(ver.eval(), &[ctx.nft_eval], *pk),
        None,
    );

    let payload = AssetPayload {
        ver,
        funcid: AssetFuncId::Ask,
        other_id: TxId::zero(),
        unit_price,
        origpubkey: *pk,
    };
    let opret = crate::opret::encode_asset_opret(
        tokenid,
        vec![global_pubkey(ver.assets_eval())],
        &payload,
    );
    builder.finalize(keystore, pk, txfee, Some(opret))
}

/// Cancel a bid: return the locked coins to the maker. Spends the head vout
/// and the maker's marker, whose signature is the authorisation.
#[instrument(skip(chain, keystore), fields(%bid_txid))]
pub fn cancel_buy_offer<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    pk: &PubKey,
    txfee: Amount,
    tokenid: &TxId,
    bid_txid: &TxId,
) -> Result<Transaction, CcError> {
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };
    let order = load_open_order(chain, ver, bid_txid)?;
    if !order.payload.funcid.is_bid_side() {
        return Err(CcError::invalid("not a bid order"));
    }
    if order.tokenid != *tokenid {
        return Err(CcError::invalid("bid is for a different token"));
    }
    if order.payload.origpubkey != *pk {
        return Err(CcError::Unauthorised("only the maker may cancel".into()));
    }
    if order.amount == 0 {
        return Err(CcError::StateGate("bid is empty".into()));
    }
    let marker_vout = find_marker_vout(ver, &order.tx, pk)?;

    let mut builder = TxAssembler::new(chain);
    let fee_target = txfee + ASSETS_MARKER_AMOUNT;
    let collected = builder.add_normal_inputs(pk, fee_target, 0, false)?;
    if collected < fee_target {
        return Err(CcError::InsufficientFunds {
            needed: fee_target,
            available: collected,
        });
    }
    builder.add_cc_input(Outpoint::new(*bid_txid, ORDER_VOUT));
    builder.add_cc_input(Outpoint::new(*bid_txid, marker_vout));

    builder.add_output(order.amount, Script::pay_to_pubkey(pk));
    builder.add_output(ASSETS_MARKER_AMOUNT, Script::pay_to_pubkey(pk));

    let escrow = coin_escrow_probe(ver);
    builder.attach_probe(escrow.0, escrow.1);
    builder.attach_probe(Condition::cc1(ver.assets_eval(), *pk), None);

    let payload = AssetPayload {
        ver,
        funcid: AssetFuncId::CancelBid,
        other_id: TxId::zero(),
        unit_price: 0,
        origpubkey: *pk,
    };
    let opret = crate::opret::encode_asset_opret(tokenid, vec![], &payload);
    builder.finalize(keystore, pk, txfee, Some(opret))
}

/// Cancel an ask: return the locked tokens to the maker.
#[instrument(skip(chain, keystore), fields(%ask_txid))]
pub fn cancel_sell<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    pk: &PubKey,
    txfee: Amount,
    tokenid: &TxId,
    ask_txid: &TxId,
) -> Result<Transaction, CcError> {
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };
    let order = load_open_order(chain, ver, ask_txid)?;
    if !order.payload.funcid.is_ask_side() {
        return Err(CcError::invalid("not an ask order"));
    }
    if order.tokenid != *tokenid {
        return Err(CcError::invalid("ask is for a different token"));
    }
    if order.payload.origpubkey != *pk {
        return Err(CcError::Unauthorised("only the maker may cancel".into()));
    }
    if order.amount == 0 {
        return Err(CcError::StateGate("ask is empty".into()));
    }
    let marker_vout = find_marker_vout(ver, &order.tx, pk)?;
    let nft_eval = get_token_data(chain, tokenid)?.nft_eval();

    let mut builder = TxAssembler::new(chain);
    let fee_target = txfee + ASSETS_MARKER_AMOUNT;
    let collected = builder.add_normal_inputs(pk, fee_target, 0, false)?;
    if collected < fee_target {
        return Err(CcError::InsufficientFunds {
            needed: fee_target,
            available: collected,
        });
    }
    builder.add_cc_input(Outpoint::new(*ask_txid, ORDER_VOUT));
    builder.add_cc_input(Outpoint::new(*ask_txid, marker_vout));

    builder.add_output(order.amount, tokens_cc_script(ver, &[nft_eval], pk));
    builder.add_output(ASSETS_MARKER_AMOUNT, Script::pay_to_pubkey(pk));

    let escrow = token_escrow_probe(ver, nft_eval);
    builder.attach_probe(escrow.0, escrow.1);
    builder.attach_probe(Condition::cc1(ver.assets_eval(), *pk), None);

    let payload = AssetPayload {
        ver,
        funcid: AssetFuncId::CancelAsk,
        other_id: TxId::zero(),
        unit_price: 0,
        origpubkey: *pk,
    };
    let opret = crate::opret::encode_asset_opret(tokenid, vec![*pk], &payload);
    builder.finalize(keystore, pk, txfee, Some(opret))
}

/// Fill a bid: deliver tokens, receive coins. A partial fill emits a `B`
/// successor head carrying the unchanged unit price.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(chain, keystore), fields(%bid_txid, fill_units))]
pub fn fill_buy_offer<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    pk: &PubKey,
    txfee: Amount,
    tokenid: &TxId,
    bid_txid: &TxId,
    fill_units: Amount,
    paid_unit_price: Amount,
) -> Result<Transaction, CcError> {
    if fill_units <= 0 {
        return Err(CcError::invalid("non-positive fill units"));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };

    let token_data = get_token_data(chain, tokenid)?;
    let nft_eval = token_data.nft_eval();
    let royalty_fract = token_data.royalty();

    let order = load_open_order(chain, ver, bid_txid)?;
    if !order.payload.funcid.is_bid_side() {
        return Err(CcError::invalid("not a bid order"));
    }
    if order.tokenid != *tokenid {
        return Err(CcError::invalid("bid is for a different token"));
    }
    let unit_price = order.payload.unit_price;
    if unit_price <= 0 {
        return Err(CcError::invalid("bid carries no unit price"));
    }
    let maker = order.payload.origpubkey;
    let orig_units = order.amount / unit_price;

    let (paid, remaining) =
        set_bid_fill_amounts(unit_price, order.amount, fill_units, orig_units, paid_unit_price)?;
    let royalty = royalty_value(paid, royalty_fract);

    let mut builder = TxAssembler::new(chain);
    let fee_target = txfee + ASSETS_MARKER_AMOUNT;
    let collected = builder.add_normal_inputs(pk, fee_target, 0, false)?;
    if collected < fee_target {
        return Err(CcError::InsufficientFunds {
            needed: fee_target,
            available: collected,
        });
    }
    builder.add_cc_input(Outpoint::new(*bid_txid, ORDER_VOUT));

    let mut ctx = TokenCtx {
        ver,
        nft_eval,
    };
    let source = token_address(&ctx, pk);
    let token_inputs =
        add_token_inputs(&mut builder, &mut ctx, &source, tokenid, fill_units, 0, false)?;
    if token_inputs < fill_units {
        return Err(CcError::InsufficientFunds {
            needed: fill_units,
            available: token_inputs,
        });
    }
    let token_change = token_inputs - fill_units;

    // vout0: successor head, or remainder refund on a full fill
    if orig_units > fill_units {
        builder.add_output(remaining, coin_escrow_script(ver));
    } else {
        builder.add_output(remaining, Script::pay_to_pubkey(&maker));
    }
    // taker's coins, then royalty when the token defines one
    builder.add_output(paid - royalty, Script::pay_to_pubkey(pk));
    if royalty_fract > 0 {
        builder.add_output(royalty, Script::pay_to_pubkey(&token_data.origpubkey));
    }
    // tokens and fresh marker to the maker
    builder.add_output(fill_units, tokens_cc_script(ver, &[nft_eval], &maker));
    builder.add_output(ASSETS_MARKER_AMOUNT, marker_script(ver, &maker));
    if token_change > 0 {
        builder.add_output(token_change, tokens_cc_script(ver, &[nft_eval], pk));
    }

    let escrow = coin_escrow_probe(ver);
    builder.attach_probe(escrow.0, escrow.1);
    builder.attach_probe(Condition::tokens_cc1(ver.eval(), &[nft_eval], *pk), None);

    let payload = AssetPayload {
        ver,
        funcid: AssetFuncId::BidPartial,
        other_id: TxId::zero(),
        unit_price,
        origpubkey: maker,
    };
    let opret = crate::opret::encode_asset_opret(tokenid, vec![maker], &payload);
    builder.finalize(keystore, pk, txfee, Some(opret))
}

/// Fill an ask: pay coins, receive tokens. A partial fill emits an `S`
/// successor head; the remainder token vout stays at the escrow even when
/// zero, closing via the zero-skip in listings.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(chain, keystore), fields(%ask_txid, fill_units))]
pub fn fill_sell<C: ChainView + ?Sized>(
    chain: &C,
    keystore: &KeyStore,
    ver: TokenVersion,
    pk: &PubKey,
    txfee: Amount,
    tokenid: &TxId,
    other_tokenid: &TxId,
    ask_txid: &TxId,
    fill_units: Amount,
    paid_unit_price: Amount,
) -> Result<Transaction, CcError> {
    if fill_units <= 0 {
        return Err(CcError::invalid("non-positive fill units"));
    }
    if !other_tokenid.is_zero() {
        return Err(CcError::invalid("asset swaps disabled"));
    }
    let txfee = if txfee == 0 { DEFAULT_TXFEE } else { txfee };

    let token_data = get_token_data(chain, tokenid)?;
    let nft_eval = token_data.nft_eval();
    let royalty_fract = token_data.royalty();

    let order = load_open_order(chain, ver, ask_txid)?;
    if !order.payload.funcid.is_ask_side() {
        return Err(CcError::invalid("not an ask order"));
    }
    if order.tokenid != *tokenid {
        return Err(CcError::invalid("ask is for a different token"));
    }
    let unit_price = order.payload.unit_price;
    let maker = order.payload.origpubkey;
    let orig_tokens = order.amount;

    let (paid, remaining_tokens) =
        set_ask_fill_amounts(unit_price, fill_units, orig_tokens, paid_unit_price)?;
    let royalty = royalty_value(paid, royalty_fract);

    let mut builder = TxAssembler::new(chain);
    let target = txfee + ASSETS_MARKER_AMOUNT + paid;
    let collected = builder.add_normal_inputs(pk, target, 0, false)?;
    if collected < target {
        return Err(CcError::InsufficientFunds {
            needed: target,
            available: collected,
        });
    }
    builder.add_cc_input(Outpoint::new(*ask_txid, ORDER_VOUT));

    // vout0: token remainder stays at the escrow (zero on a full fill)
    builder.add_output(remaining_tokens, token_escrow_script(ver, nft_eval));
    // vout1: purchased tokens to the taker
    builder.add_output(fill_units, tokens_cc_script(ver, &[nft_eval], pk));
    // coins to the maker, royalty split out
    builder.add_output(paid - royalty, Script::pay_to_pubkey(&maker));
    if royalty_fract > 0 {
        builder.add_output(royalty, Script::pay_to_pubkey(&token_data.origpubkey));
    }
    builder.add_output(ASSETS_MARKER_AMOUNT, marker_script(ver, &maker));

    let escrow = token_escrow_probe(ver, nft_eval);
    builder.attach_probe(escrow.0, escrow.1);

    let payload = AssetPayload {
        ver,
        funcid: AssetFuncId::AskPartial,
        other_id: TxId::zero(),
        unit_price,
        origpubkey: maker,
    };
    let opret = crate::opret::encode_asset_opret(tokenid, vec![*pk], &payload);
    builder.finalize(keystore, pk, txfee, Some(opret))
}

// ---------------------------------------------------------------------------
// order listing
// ---------------------------------------------------------------------------

/// One row of the order book listing.
#[derive(Clone, Debug, Serialize)]
pub struct OrderInfo {
    pub funcid: char,
    pub txid: TxId,
    pub vout: u32,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidamount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub askamount: Option<Amount>,
    pub origaddress: String,
    pub origtokenaddress: String,
    pub tokenid: TxId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otherid: Option<TxId>,
    pub totalrequired: Amount,
    pub price: Amount,
}

/// List open orders at the module's global addresses.
///
/// `refassetid` filters to one token; `pk` switches to "my orders" mode; a
/// non-zero `nft_eval` additionally scans the NFT-scoped token escrow.
pub fn asset_orders<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    refassetid: Option<&TxId>,
    pk: Option<&PubKey>,
    nft_eval: u8,
) -> Vec<OrderInfo> {
    let mut rows = Vec::new();

    let mut scan_addresses = vec![
        coin_escrow_script(ver).address(),
        token_escrow_script(ver, 0).address(),
    ];
    if let Some(refid) = refassetid {
        if let Ok(data) = get_token_data(chain, refid) {
            if data.nft_eval() != 0 {
                scan_addresses.push(token_escrow_script(ver, data.nft_eval()).address());
            }
        }
    }
    if nft_eval != 0 {
        scan_addresses.push(token_escrow_script(ver, nft_eval).address());
    }
    scan_addresses.dedup();

    for address in scan_addresses {
        for entry in chain.unspent_by_address(&address, true) {
            if entry.amount == 0 {
                continue; // exhausted ask head
            }
            let Ok((tx, _)) = chain.get_tx(&entry.outpoint.txid) else {
                continue;
            };
            let Some(opret) = tx.opret().and_then(|s| s.op_return_data()) else {
                continue;
            };
            let Ok((tokenid, payload)) = decode_asset_opret(opret) else {
                continue;
            };
            if !payload.funcid.is_open_order() {
                continue;
            }
            let matches = match pk {
                None => refassetid.is_none() || Some(&tokenid) == refassetid,
                Some(mine) => payload.origpubkey == *mine,
            };
            if !matches {
                continue;
            }

            let head_amount = tx.outputs[ORDER_VOUT as usize].value;
            let bid_side = payload.funcid.is_bid_side();
            let unit_price = payload.unit_price;
            let ctx = TokenCtx { ver, nft_eval: 0 };
            rows.push(OrderInfo {
                funcid: payload.funcid.as_byte() as char,
                txid: entry.outpoint.txid,
                vout: entry.outpoint.vout,
                amount: entry.amount,
                bidamount: bid_side.then_some(head_amount),
                askamount: (!bid_side).then_some(head_amount),
                origaddress: Condition::cc1(ver.assets_eval(), payload.origpubkey).address(),
                origtokenaddress: token_address(&ctx, &payload.origpubkey),
                tokenid,
                otherid: (!payload.other_id.is_zero()).then_some(payload.other_id),
                totalrequired: if unit_price <= 0 {
                    0
                } else if bid_side {
                    head_amount / unit_price
                } else {
                    head_amount * unit_price
                },
                price: unit_price,
            });
        }
    }
    debug!(rows = rows.len(), "listed orders");
    rows
}

// ---------------------------------------------------------------------------
// consensus predicate
// ---------------------------------------------------------------------------

/// Locate the order head this tx spends: the CC vin at vout 0 of a tx whose
/// opret is an open order for the same version.
fn find_order_vin<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
) -> Result<(OrderHead, usize), ValidationError> {
    for (i, vin) in tx.inputs.iter().enumerate() {
        if vin.prevout.vout != ORDER_VOUT {
            continue;
        }
        let Some(fulfillment) = keys::CcFulfillment::decode(&vin.script_sig) else {
            continue;
        };
        if !fulfillment.condition.has_eval(ver.assets_eval()) {
            continue;
        }
        let Ok((prev_tx, _)) = chain.get_tx(&vin.prevout.txid) else {
            return Err(ValidationError::invalid("could not load order vin tx"));
        };
        let Some(opret) = prev_tx.opret().and_then(|s| s.op_return_data()) else {
            continue;
        };
        let Ok((tokenid, payload)) = decode_asset_opret(opret) else {
            continue;
        };
        if !payload.funcid.is_open_order() || payload.ver != ver {
            continue;
        }
        let amount = prev_tx.outputs[ORDER_VOUT as usize].value;
        return Ok((
            OrderHead {
                tx: prev_tx,
                payload,
                tokenid,
                amount,
            },
            i,
        ));
    }
    Err(ValidationError::invalid("no order head among CC vins"))
}

/// Sum of P2PK vouts to one key.
fn p2pk_outputs_to(tx: &Transaction, pk: &PubKey) -> Amount {
    let script = Script::pay_to_pubkey(pk);
    tx.outputs
        .iter()
        .filter(|v| v.script == script)
        .map(|v| v.value)
        .sum()
}

/// Sum of token vouts to one receiver, over the eval shapes the token admits.
fn token_outputs_to(
    ver: TokenVersion,
    nft_eval: u8,
    tx: &Transaction,
    pk: &PubKey,
) -> Amount {
    let shapes = [
        tokens_cc_script(ver, &[], pk),
        tokens_cc_script(ver, &[nft_eval], pk),
    ];
    tx.outputs
        .iter()
        .filter(|v| shapes.contains(&v.script))
        .map(|v| v.value)
        .sum()
}

fn require_marker_to(
    ver: TokenVersion,
    tx: &Transaction,
    pk: &PubKey,
) -> Result<(), ValidationError> {
    let script = marker_script(ver, pk);
    let present = tx
        .outputs
        .iter()
        .any(|v| v.value == ASSETS_MARKER_AMOUNT && v.script == script);
    if present {
        Ok(())
    } else {
        Err(ValidationError::invalid("fill does not re-issue the maker marker"))
    }
}

fn check_royalty(
    tx: &Transaction,
    token_data: &TokenData,
    paid: Amount,
) -> Result<(), ValidationError> {
    let fract = token_data.royalty();
    if fract == 0 {
        return Ok(());
    }
    let required = royalty_value(paid, fract);
    let found = p2pk_outputs_to(tx, &token_data.origpubkey);
    if found < required {
        return Err(ValidationError::Royalty { required, found });
    }
    Ok(())
}

/// The order predicate (consensus). Token value conservation is the token
/// predicate's concern, since dual-eval escrow outputs route the same tx
/// through both. This checks order shape: funcid against remainder pattern,
/// price preservation, fill arithmetic, royalty split, marker, and maker
/// authorisation on cancels.
#[instrument(skip(chain, tx), fields(txid = %tx.txid()))]
pub fn validate_assets_tx<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
) -> Result<(), ValidationError> {
    let opret = tx
        .opret()
        .and_then(|s| s.op_return_data())
        .ok_or_else(|| ValidationError::invalid("no order opret"))?;
    let (tokenid, payload) = decode_asset_opret(opret)?;
    if payload.ver != ver {
        return Err(ValidationError::invalid("order opret version mismatch"));
    }

    match payload.funcid {
        AssetFuncId::Bid | AssetFuncId::Ask => Err(ValidationError::invalid(
            "order creation opret on a tx spending order escrow",
        )),
        AssetFuncId::SwapReserved(_) => {
            Err(ValidationError::invalid("asset swaps disabled"))
        }
        AssetFuncId::BidPartial => validate_bid_fill(chain, ver, tx, &tokenid, &payload),
        AssetFuncId::AskPartial => validate_ask_fill(chain, ver, tx, &tokenid, &payload),
        AssetFuncId::CancelBid => validate_cancel(chain, ver, tx, &tokenid, &payload, true),
        AssetFuncId::CancelAsk => validate_cancel(chain, ver, tx, &tokenid, &payload, false),
    }
}

fn validate_bid_fill<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
    tokenid: &TxId,
    payload: &AssetPayload,
) -> Result<(), ValidationError> {
    let (prev, _) = find_order_vin(chain, ver, tx)?;
    if !prev.payload.funcid.is_bid_side() {
        return Err(ValidationError::invalid("bid fill spends a non-bid order"));
    }
    if prev.tokenid != *tokenid {
        return Err(ValidationError::invalid("fill opret names a different token"));
    }
    if payload.unit_price != prev.payload.unit_price {
        return Err(ValidationError::UnitPrice {
            expected: prev.payload.unit_price,
            found: payload.unit_price,
        });
    }
    if payload.origpubkey != prev.payload.origpubkey {
        return Err(ValidationError::invalid("fill must preserve the maker pubkey"));
    }

    let unit_price = prev.payload.unit_price;
    if unit_price <= 0 {
        return Err(ValidationError::invalid("order carries no unit price"));
    }
    let maker = prev.payload.origpubkey;
    let orig_units = prev.amount / unit_price;
    let token_data = get_token_data(chain, tokenid)
        .map_err(|e| ValidationError::invalid(e.to_string()))?;
    let nft_eval = token_data.nft_eval();

    let vout0 = tx
        .outputs
        .first()
        .ok_or_else(|| ValidationError::invalid("fill has no outputs"))?;
    let fill_units = token_outputs_to(ver, nft_eval, tx, &maker);
    if fill_units <= 0 || fill_units > orig_units {
        return Err(ValidationError::invalid(format!(
            "fill units {fill_units} out of range 1..={orig_units}"
        )));
    }

    let remaining = vout0.value;
    let closes = fill_units == orig_units;
    let successor_ok = if closes {
        vout0.script == Script::pay_to_pubkey(&maker)
    } else {
        vout0.script == coin_escrow_script(ver)
    };
    if !successor_ok {
        return Err(ValidationError::invalid(
            "remainder vout does not match the fill pattern",
        ));
    }

    let paid = prev.amount - remaining;
    if paid <= 0 {
        return Err(ValidationError::invalid("fill pays nothing"));
    }
    if !closes && paid > unit_price * fill_units {
        return Err(ValidationError::invalid(
            "fill drains more than the unit price allows",
        ));
    }

    check_royalty(tx, &token_data, paid)?;
    require_marker_to(ver, tx, &maker)
}

fn validate_ask_fill<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
    tokenid: &TxId,
    payload: &AssetPayload,
) -> Result<(), ValidationError> {
    let (prev, _) = find_order_vin(chain, ver, tx)?;
    if !prev.payload.funcid.is_ask_side() {
        return Err(ValidationError::invalid("ask fill spends a non-ask order"));
    }
    if prev.tokenid != *tokenid {
        return Err(ValidationError::invalid("fill opret names a different token"));
    }
    if payload.unit_price != prev.payload.unit_price {
        return Err(ValidationError::UnitPrice {
            expected: prev.payload.unit_price,
            found: payload.unit_price,
        });
    }
    if payload.origpubkey != prev.payload.origpubkey {
        return Err(ValidationError::invalid("fill must preserve the maker pubkey"));
    }

    let unit_price = prev.payload.unit_price;
    if unit_price <= 0 {
        return Err(ValidationError::invalid("order carries no unit price"));
    }
    let maker = prev.payload.origpubkey;
    let token_data = get_token_data(chain, tokenid)
        .map_err(|e| ValidationError::invalid(e.to_string()))?;
    let nft_eval = token_data.nft_eval();

    let vout0 = tx
        .outputs
        .first()
        .ok_or_else(|| ValidationError::invalid("fill has no outputs"))?;
    if vout0.script != token_escrow_script(ver, nft_eval) {
        return Err(ValidationError::invalid(
            "ask fill must keep the remainder at the token escrow",
        ));
    }
    let remaining_tokens = vout0.value;
    let fill_units = prev.amount - remaining_tokens;
    if fill_units <= 0 {
        return Err(ValidationError::invalid("ask fill takes no tokens"));
    }

    // payment vouts are positionally fixed: coins to the maker at vout2,
    // the royalty vout directly after when the token defines one
    let maker_script = Script::pay_to_pubkey(&maker);
    let paid_to_maker = tx
        .outputs
        .get(2)
        .filter(|v| v.script == maker_script)
        .map(|v| v.value)
        .ok_or_else(|| ValidationError::invalid("ask fill vout2 must pay the maker"))?;
    let royalty_fract = token_data.royalty();
    let royalty_found = if royalty_fract > 0 {
        let creator_script = Script::pay_to_pubkey(&token_data.origpubkey);
        tx.outputs
            .get(3)
            .filter(|v| v.script == creator_script)
            .map(|v| v.value)
            .ok_or_else(|| {
                ValidationError::invalid("ask fill vout3 must pay the royalty receiver")
            })?
    } else {
        0
    };

    let total_paid = paid_to_maker + royalty_found;
    if total_paid < unit_price * fill_units {
        return Err(ValidationError::invalid(format!(
            "ask fill underpays: {total_paid} < {}",
            unit_price * fill_units
        )));
    }
    // the split is exact: the maker receives everything above the r/1000 cut
    let required = royalty_value(total_paid, royalty_fract);
    if royalty_found != required {
        return Err(ValidationError::Royalty {
            required,
            found: royalty_found,
        });
    }

    require_marker_to(ver, tx, &maker)
}

fn validate_cancel<C: ChainView + ?Sized>(
    chain: &C,
    ver: TokenVersion,
    tx: &Transaction,
    tokenid: &TxId,
    _payload: &AssetPayload,
    bid_side: bool,
) -> Result<(), ValidationError> {
    let (prev, _) = find_order_vin(chain, ver, tx)?;
    if prev.tokenid != *tokenid {
        return Err(ValidationError::invalid("cancel opret names a different token"));
    }
    if bid_side != prev.payload.funcid.is_bid_side() {
        return Err(ValidationError::invalid("cancel funcid does not match the order side"));
    }
    let maker = prev.payload.origpubkey;

    // the cancel must also spend the order's marker, and only the maker's
    // signature satisfies that vout
    let prev_txid = prev.tx.txid();
    let marker_vin = tx.inputs.iter().find(|vin| {
        vin.prevout.txid == prev_txid
            && vin.prevout.vout != ORDER_VOUT
            && prev
                .tx
                .outputs
                .get(vin.prevout.vout as usize)
                .map(|v| v.script == marker_script(ver, &maker))
                .unwrap_or(false)
    });
    let Some(marker_vin) = marker_vin else {
        return Err(ValidationError::invalid("cancel does not spend the order marker"));
    };
    match keys::cc_signing_pubkey(&marker_vin.script_sig) {
        Some(signer) if signer == maker => Ok(()),
        _ => Err(ValidationError::invalid("cancel not signed by the maker")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bid_fill_amounts() {
        // plain partial fill at the bid price
        let (paid, remaining) = set_bid_fill_amounts(100_000, 10_000_000, 40, 100, 0).unwrap();
        assert_eq!(paid, 4_000_000);
        assert_eq!(remaining, 6_000_000);

        // full fill takes everything, spread included
        let (paid, remaining) = set_bid_fill_amounts(100_000, 10_000_050, 100, 100, 0).unwrap();
        assert_eq!(paid, 10_000_050);
        assert_eq!(remaining, 0);

        // a taker proposing a higher price is clamped to the bid price
        let (paid, _) = set_bid_fill_amounts(100_000, 10_000_000, 10, 100, 150_000).unwrap();
        assert_eq!(paid, 1_000_000);

        // a lower proposal stands (taker gives the maker a better rate)
        let (paid, _) = set_bid_fill_amounts(100_000, 10_000_000, 10, 100, 90_000).unwrap();
        assert_eq!(paid, 900_000);

        assert!(set_bid_fill_amounts(100_000, 10_000_000, 0, 100, 0).is_err());
        assert!(set_bid_fill_amounts(100_000, 10_000_000, 101, 100, 0).is_err());
    }

    #[test]
    fn ask_fill_amounts() {
        let (paid, remaining) = set_ask_fill_amounts(100_000, 200, 500, 0).unwrap();
        assert_eq!(paid, 20_000_000);
        assert_eq!(remaining, 300);

        // paying above the ask is allowed
        let (paid, _) = set_ask_fill_amounts(100_000, 10, 500, 120_000).unwrap();
        assert_eq!(paid, 1_200_000);

        // underpaying is not
        assert!(set_ask_fill_amounts(100_000, 10, 500, 90_000).is_err());
        assert!(set_ask_fill_amounts(100_000, 501, 500, 0).is_err());
    }

    #[test]
    fn royalty_math_truncates() {
        // divide first, then multiply; the documented order
        assert_eq!(royalty_value(1_000_000, 50), 50_000);
        assert_eq!(royalty_value(1_999, 500), 500);
        assert_eq!(royalty_value(999, 500), 0);
        assert_eq!(royalty_value(1_000_000, 0), 0);
    }

    #[test]
    fn escrow_addresses_are_version_scoped() {
        assert_ne!(
            coin_escrow_script(TokenVersion::V1).address(),
            coin_escrow_script(TokenVersion::V2).address()
        );
        assert_ne!(
            token_escrow_script(TokenVersion::V1, 0).address(),
            coin_escrow_script(TokenVersion::V1).address()
        );
        assert_ne!(
            token_escrow_script(TokenVersion::V1, 0xf7).address(),
            token_escrow_script(TokenVersion::V1, 0).address()
        );
    }
}
