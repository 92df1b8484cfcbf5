//! End-to-end ledger scenarios driven through the execution engine.

use token_core::address::Address;
use token_core::amount::TokenAmount;
use token_core::engine::{Engine, ReceiptOutcome};
use token_core::message::{message_builder, ExecReturn, Message, MessageBuilder, MsgId};
use token_core::state::{TokenInfo, VERSION_1};

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn builder(from: &Address) -> Box<dyn MessageBuilder> {
    message_builder(VERSION_1, from.clone()).unwrap()
}

fn push_ok(engine: &mut Engine, msg: Message) -> MsgId {
    let id = engine.push(msg).unwrap();
    let receipt = engine.receipt(&id).unwrap();
    assert!(
        receipt.outcome.is_success(),
        "unexpected rejection: {:?}",
        receipt.outcome
    );
    id
}

fn push_rejected(engine: &mut Engine, msg: Message) -> (u32, String) {
    let id = engine.push(msg).unwrap();
    match &engine.receipt(&id).unwrap().outcome {
        ReceiptOutcome::Rejected { code, reason } => (*code, reason.clone()),
        other => panic!("expected rejection, got {other:?}"),
    }
}

fn create_token(engine: &mut Engine, issuer: &Address, supply: u64) -> Address {
    let info = TokenInfo {
        name: "Example Token".into(),
        symbol: "EXT".into(),
        decimals: 18,
        total_supply: TokenAmount::from(supply),
        icon: vec![1, 2, 3],
        issuer: issuer.clone(),
    };
    let id = push_ok(engine, builder(issuer).create(&info).unwrap());
    let ReceiptOutcome::Accepted { ret } = &engine.receipt(&id).unwrap().outcome else {
        unreachable!()
    };
    let exec: ExecReturn = serde_cbor::from_slice(ret).unwrap();
    exec.actor
}

/// Sum of all holder balances must equal the fixed supply after every step.
fn assert_conserved(engine: &Engine, token: &Address) {
    let state = engine.state(token).unwrap();
    let mut sum = TokenAmount::zero();
    for entry in state.holders().unwrap() {
        let (_, balance) = entry.unwrap();
        assert!(!balance.is_zero(), "zero balance entry survived");
        sum += &balance;
    }
    assert_eq!(sum, state.info().total_supply);
}

#[test]
fn create_then_read_balances() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let token = create_token(&mut engine, &alice, 1_000);

    let state = engine.state(&token).unwrap();
    assert_eq!(state.info().name, "Example Token");
    assert_eq!(state.info().decimals, 18);

    let alice_id = engine.resolve_id(&alice).unwrap();
    assert_eq!(state.balance_of(&alice_id).unwrap(), TokenAmount::from(1_000));
    // Never-seen holders read as zero, not as an error.
    assert_eq!(
        state.balance_of(&Address::Id(9_999)).unwrap(),
        TokenAmount::zero()
    );
    assert_conserved(&engine, &token);
}

#[test]
fn transfer_moves_exactly_the_amount() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let token = create_token(&mut engine, &alice, 1_000);

    push_ok(
        &mut engine,
        builder(&alice)
            .transfer(&token, &addr("t1bob"), &TokenAmount::from(300))
            .unwrap(),
    );

    let state = engine.state(&token).unwrap();
    let alice_id = engine.resolve_id(&alice).unwrap();
    let bob_id = engine.resolve_id(&addr("t1bob")).unwrap();
    assert_eq!(state.balance_of(&alice_id).unwrap(), TokenAmount::from(700));
    assert_eq!(state.balance_of(&bob_id).unwrap(), TokenAmount::from(300));
    assert_conserved(&engine, &token);
}

#[test]
fn overdraft_rejects_and_leaves_state_unchanged() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let token = create_token(&mut engine, &alice, 1_000);
    let before = engine.head(&token).unwrap();

    let (code, reason) = push_rejected(
        &mut engine,
        builder(&alice)
            .transfer(&token, &addr("t1bob"), &TokenAmount::from(1_001))
            .unwrap(),
    );
    assert_eq!(code, 5);
    assert!(reason.contains("insufficient balance"), "{reason}");
    assert_eq!(engine.head(&token).unwrap(), before);
    assert_conserved(&engine, &token);
}

#[test]
fn delegated_transfer_decrements_allowance() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let carol = addr("t1carol");
    let token = create_token(&mut engine, &alice, 1_000);

    push_ok(
        &mut engine,
        builder(&alice)
            .approve(&token, &carol, &TokenAmount::from(100))
            .unwrap(),
    );
    push_ok(
        &mut engine,
        builder(&carol)
            .transfer_from(&token, &alice, &addr("t1dave"), &TokenAmount::from(60))
            .unwrap(),
    );

    let state = engine.state(&token).unwrap();
    let alice_id = engine.resolve_id(&alice).unwrap();
    let carol_id = engine.resolve_id(&carol).unwrap();
    let dave_id = engine.resolve_id(&addr("t1dave")).unwrap();
    assert_eq!(state.balance_of(&alice_id).unwrap(), TokenAmount::from(940));
    assert_eq!(state.balance_of(&dave_id).unwrap(), TokenAmount::from(60));
    let approvals = state.approvals_by(&alice_id).unwrap();
    assert_eq!(approvals.get(&carol_id), Some(&TokenAmount::from(40)));
    assert_conserved(&engine, &token);
}

#[test]
fn over_allowance_spend_fails_even_with_balance_available() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let carol = addr("t1carol");
    let token = create_token(&mut engine, &alice, 2_000);

    push_ok(
        &mut engine,
        builder(&alice)
            .approve(&token, &carol, &TokenAmount::from(100))
            .unwrap(),
    );
    let before = engine.head(&token).unwrap();

    // Alice holds 2000 but carol's delegation covers only 100.
    let (code, _) = push_rejected(
        &mut engine,
        builder(&carol)
            .transfer_from(&token, &alice, &addr("t1dave"), &TokenAmount::from(1_000))
            .unwrap(),
    );
    assert_eq!(code, 6);
    assert_eq!(engine.head(&token).unwrap(), before);

    // The untouched allowance is still spendable in full.
    push_ok(
        &mut engine,
        builder(&carol)
            .transfer_from(&token, &alice, &addr("t1dave"), &TokenAmount::from(100))
            .unwrap(),
    );
    assert_conserved(&engine, &token);
}

#[test]
fn zero_approval_revokes_delegation() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let carol = addr("t1carol");
    let token = create_token(&mut engine, &alice, 1_000);

    push_ok(
        &mut engine,
        builder(&alice)
            .approve(&token, &carol, &TokenAmount::from(100))
            .unwrap(),
    );
    push_ok(
        &mut engine,
        builder(&alice)
            .approve(&token, &carol, &TokenAmount::zero())
            .unwrap(),
    );

    let state = engine.state(&token).unwrap();
    let alice_id = engine.resolve_id(&alice).unwrap();
    assert!(state.approvals_by(&alice_id).unwrap().is_empty());

    let (code, _) = push_rejected(
        &mut engine,
        builder(&carol)
            .transfer_from(&token, &alice, &addr("t1dave"), &TokenAmount::from(1))
            .unwrap(),
    );
    assert_eq!(code, 6);
}

#[test]
fn approve_overwrites_rather_than_accumulates() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let carol = addr("t1carol");
    let token = create_token(&mut engine, &alice, 1_000);

    push_ok(
        &mut engine,
        builder(&alice)
            .approve(&token, &carol, &TokenAmount::from(100))
            .unwrap(),
    );
    push_ok(
        &mut engine,
        builder(&alice)
            .approve(&token, &carol, &TokenAmount::from(30))
            .unwrap(),
    );

    let state = engine.state(&token).unwrap();
    let alice_id = engine.resolve_id(&alice).unwrap();
    let carol_id = engine.resolve_id(&carol).unwrap();
    assert_eq!(
        state.approvals_by(&alice_id).unwrap().get(&carol_id),
        Some(&TokenAmount::from(30))
    );
}

#[test]
fn reads_never_advance_the_root() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let token = create_token(&mut engine, &alice, 1_000);
    let head = engine.head(&token).unwrap();

    let state = engine.state(&token).unwrap();
    let alice_id = engine.resolve_id(&alice).unwrap();
    for _ in 0..3 {
        state.balance_of(&alice_id).unwrap();
        state.approvals_by(&alice_id).unwrap();
        for entry in state.holders().unwrap() {
            entry.unwrap();
        }
        for entry in state.approvals().unwrap() {
            entry.unwrap();
        }
    }
    assert_eq!(engine.head(&token).unwrap(), head);
}

#[test]
fn full_approval_enumeration_is_lazy_but_complete() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let token = create_token(&mut engine, &alice, 10_000);

    // Seed several holders, each approving a couple of spenders.
    for (holder, share) in [("t1h-one", 2_000u64), ("t1h-two", 3_000)] {
        push_ok(
            &mut engine,
            builder(&alice)
                .transfer(&token, &addr(holder), &TokenAmount::from(share))
                .unwrap(),
        );
        for spender in ["t1s-one", "t1s-two"] {
            push_ok(
                &mut engine,
                builder(&addr(holder))
                    .approve(&token, &addr(spender), &TokenAmount::from(10))
                    .unwrap(),
            );
        }
    }

    let state = engine.state(&token).unwrap();
    let all: Vec<_> = state
        .approvals()
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(all.len(), 4);
    for (_, _, amount) in &all {
        assert_eq!(*amount, TokenAmount::from(10));
    }
    assert_conserved(&engine, &token);
}

#[test]
fn distinct_messages_get_distinct_ids_and_nonces() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let token = create_token(&mut engine, &alice, 1_000);

    let msg = builder(&alice)
        .transfer(&token, &addr("t1bob"), &TokenAmount::from(1))
        .unwrap();
    // Identical payloads: the engine's nonce assignment still separates them.
    let first = push_ok(&mut engine, msg.clone());
    let second = push_ok(&mut engine, msg);
    assert_ne!(first, second);
    assert_eq!(engine.receipt(&first).unwrap().nonce, 1);
    assert_eq!(engine.receipt(&second).unwrap().nonce, 2);
}

#[test]
fn two_tokens_on_one_engine_stay_independent() {
    let mut engine = Engine::new();
    let alice = addr("t1alice");
    let bob = addr("t1bob");
    let token_a = create_token(&mut engine, &alice, 1_000);
    let token_b = create_token(&mut engine, &bob, 500);
    assert_ne!(token_a, token_b);

    push_ok(
        &mut engine,
        builder(&alice)
            .transfer(&token_a, &bob, &TokenAmount::from(100))
            .unwrap(),
    );

    let bob_id = engine.resolve_id(&bob).unwrap();
    let state_b = engine.state(&token_b).unwrap();
    assert_eq!(state_b.balance_of(&bob_id).unwrap(), TokenAmount::from(500));
    assert_conserved(&engine, &token_a);
    assert_conserved(&engine, &token_b);
}
