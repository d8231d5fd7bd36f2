//! Heir plan scenarios: funding, additions, the inactivity gate, the
//! spending-begun latch, and token plans.

mod common;

use cc_dex::chain::{ChainView, MemoryChain};
use cc_dex::constants::COIN;
use cc_dex::error::{CcError, ValidationError};
use cc_dex::heir::{
    find_latest_plan_tx, heir_add, heir_claim, heir_fund, heir_info, heir_list,
};
use cc_dex::opret::TokenVersion;
use cc_dex::tokens::{create_token, token_balance};
use cc_dex::validate::Validator;
use common::{actor, fund, submit, GENESIS_TIME};

const HOUR: u64 = 3600;

#[test]
fn heir_claim_gate_and_latch() {
    let mut chain = MemoryChain::new(GENESIS_TIME);
    let alice = actor(2); // owner
    let bob = actor(3); // heir
    fund(&mut chain, &alice, 10 * COIN);
    fund(&mut chain, &bob, COIN);
    chain.mine_block(GENESIS_TIME + 60);

    let tx = heir_fund(
        &chain,
        &alice.keystore,
        &alice.pk,
        0,
        COIN,
        "estate",
        &bob.pk,
        HOUR as i64,
        "for bob",
        None,
    )
    .expect("fund");
    let fundingtxid = submit(&mut chain, tx);
    chain.mine_block(GENESIS_TIME + 120);

    assert_eq!(heir_list(&chain), vec![fundingtxid]);

    // too early for the heir
    assert!(matches!(
        heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, COIN / 4),
        Err(CcError::StateGate(_))
    ));
    // but the owner may claim at any time
    let owner_claim =
        heir_claim(&chain, &alice.keystore, &alice.pk, &fundingtxid, 0, COIN / 4)
            .expect("owner claim");
    submit(&mut chain, owner_claim);
    chain.mine_block(GENESIS_TIME + 180);

    // two hours of owner silence pass the one-hour gate
    chain.advance_time(2 * HOUR);
    let plan = find_latest_plan_tx(&chain, &fundingtxid).unwrap();
    assert!(!plan.has_spending_begun);
    assert!(plan.is_heir_spending_allowed(&chain));

    let claim = heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, COIN / 4)
        .expect("heir claim");
    submit(&mut chain, claim);

    // the latch is now set: an immediate second claim needs no waiting
    let plan = find_latest_plan_tx(&chain, &fundingtxid).unwrap();
    assert!(plan.has_spending_begun);
    let again = heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, COIN / 4)
        .expect("second claim");
    submit(&mut chain, again);
    chain.mine_block(chain.current_time() + 60);

    let info = heir_info(&chain, &fundingtxid).unwrap();
    assert!(info.is_heir_spending_allowed);
    assert_eq!(info.lifetime_deposited, COIN);
    assert_eq!(info.available, COIN / 4);
    assert_eq!(info.kind, "coins");
}

#[test]
fn owner_activity_resets_the_timer() {
    let mut chain = MemoryChain::new(GENESIS_TIME);
    let alice = actor(2);
    let bob = actor(3);
    fund(&mut chain, &alice, 10 * COIN);
    fund(&mut chain, &bob, COIN);
    chain.mine_block(GENESIS_TIME + 60);

    let tx = heir_fund(
        &chain,
        &alice.keystore,
        &alice.pk,
        0,
        COIN,
        "estate",
        &bob.pk,
        HOUR as i64,
        "",
        None,
    )
    .expect("fund");
    let fundingtxid = submit(&mut chain, tx);
    chain.mine_block(GENESIS_TIME + 120);

    // almost there, then the owner tops up and the clock restarts
    chain.advance_time(HOUR - 300);
    let (add, donation) =
        heir_add(&chain, &alice.keystore, &alice.pk, &fundingtxid, 0, COIN / 2).expect("add");
    assert!(!donation);
    submit(&mut chain, add);
    chain.mine_block(chain.current_time() + 1);

    chain.advance_time(600);
    assert!(matches!(
        heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, COIN / 4),
        Err(CcError::StateGate(_))
    ));

    // a stranger's donation does not reset the timer
    let carol = actor(4);
    fund(&mut chain, &carol, COIN);
    chain.mine_block(chain.current_time() + 1);
    let (gift, donation) =
        heir_add(&chain, &carol.keystore, &carol.pk, &fundingtxid, 0, COIN / 10).expect("gift");
    assert!(donation);
    submit(&mut chain, gift);
    chain.mine_block(chain.current_time() + 1);

    chain.advance_time(HOUR);
    let claim = heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, COIN / 4)
        .expect("heir claim after inactivity");
    submit(&mut chain, claim);
}

#[test]
fn latch_cannot_revert() {
    let mut chain = MemoryChain::new(GENESIS_TIME);
    let alice = actor(2);
    let bob = actor(3);
    fund(&mut chain, &alice, 10 * COIN);
    fund(&mut chain, &bob, COIN);
    chain.mine_block(GENESIS_TIME + 60);

    let tx = heir_fund(
        &chain,
        &alice.keystore,
        &alice.pk,
        0,
        COIN,
        "estate",
        &bob.pk,
        HOUR as i64,
        "",
        None,
    )
    .expect("fund");
    let fundingtxid = submit(&mut chain, tx);
    chain.mine_block(GENESIS_TIME + 120);

    chain.advance_time(2 * HOUR);
    let claim = heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, COIN / 2)
        .expect("heir claim");
    submit(&mut chain, claim);
    chain.mine_block(chain.current_time() + 60);

    // a later claim whose op-return clears the latch must be rejected
    let claim = heir_claim(&chain, &alice.keystore, &alice.pk, &fundingtxid, 0, COIN / 10)
        .expect("owner claim");
    let mut reverted = claim.clone();
    let opret_idx = reverted.outputs.len() - 1;
    let script = reverted.outputs[opret_idx].script.clone();
    let mut payload = script.op_return_data().unwrap().to_vec();
    *payload.last_mut().unwrap() = 0; // clear has_spending_begun
    reverted.outputs[opret_idx].script = cc_dex::script::Script::op_return(&payload);

    let verdict = Validator::new(&chain).validate_tx(&reverted);
    assert!(
        matches!(verdict, Err(ValidationError::Invalid(_))),
        "expected latch violation, got {verdict:?}"
    );

    // the honest claim carries the latch forward and passes
    submit(&mut chain, claim);
}

#[test]
fn token_plan_funds_and_claims() {
    let mut chain = MemoryChain::new(GENESIS_TIME);
    let alice = actor(2);
    let bob = actor(3);
    fund(&mut chain, &alice, 10 * COIN);
    fund(&mut chain, &bob, COIN);
    chain.mine_block(GENESIS_TIME + 60);

    let create = create_token(
        &chain,
        &alice.keystore,
        TokenVersion::V1,
        &alice.pk,
        0,
        1000,
        "T",
        "",
        None,
        0,
    )
    .expect("token create");
    let tokenid = submit(&mut chain, create);
    chain.mine_block(chain.current_time() + 60);

    let tx = heir_fund(
        &chain,
        &alice.keystore,
        &alice.pk,
        0,
        400,
        "token estate",
        &bob.pk,
        HOUR as i64,
        "",
        Some(tokenid),
    )
    .expect("token fund");
    let fundingtxid = submit(&mut chain, tx);
    chain.mine_block(chain.current_time() + 60);

    let info = heir_info(&chain, &fundingtxid).unwrap();
    assert_eq!(info.kind, "tokens");
    assert_eq!(info.available, 400);
    assert_eq!(
        token_balance(&chain, TokenVersion::V1, &alice.pk, &tokenid, true).unwrap(),
        600
    );

    chain.advance_time(2 * HOUR);
    let claim = heir_claim(&chain, &bob.keystore, &bob.pk, &fundingtxid, 0, 150)
        .expect("token claim");
    submit(&mut chain, claim);
    chain.mine_block(chain.current_time() + 60);

    assert_eq!(
        token_balance(&chain, TokenVersion::V1, &bob.pk, &tokenid, true).unwrap(),
        150
    );
    let info = heir_info(&chain, &fundingtxid).unwrap();
    assert_eq!(info.available, 250);
}
