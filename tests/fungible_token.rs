use proptest::prelude::*;

use ramu_token::{
    Amount, Call, CallValue, EventKind, Host, Ledger, LedgerConfig, Outcome, Principal,
    DEFAULT_ASSET,
};

fn deployer() -> Principal {
    Principal::new("deployer")
}

fn wallet(n: u8) -> Principal {
    Principal::new(format!("wallet_{n}"))
}

fn host() -> Host {
    Host::new(Ledger::new(LedgerConfig::new(deployer())))
}

fn balance(host: &mut Host, who: &Principal) -> Outcome {
    host.execute(
        who,
        Call::GetBalance {
            principal: who.clone(),
        },
    )
    .outcome
}

fn ok_uint(n: Amount) -> Outcome {
    Outcome::Ok {
        value: CallValue::Uint(n),
        events: vec![],
    }
}

#[test]
fn mint_emits_ft_mint_event() {
    let mut host = host();
    let receipt = host.execute(
        &deployer(),
        Call::Issue {
            amount: 100,
            recipient: wallet(1),
        },
    );

    let events = receipt.outcome.events();
    let mint = events
        .iter()
        .find(|e| e.kind == EventKind::Issued)
        .expect("mint event");
    assert_eq!(mint.asset, DEFAULT_ASSET);
    assert_eq!(mint.amount, 100);
    assert_eq!(mint.to.as_ref(), Some(&wallet(1)));
    assert!(matches!(
        receipt.outcome,
        Outcome::Ok {
            value: CallValue::Unit,
            ..
        }
    ));

    assert_eq!(balance(&mut host, &wallet(1)), ok_uint(100));
}

#[test]
fn transfer_emits_ft_transfer_event() {
    let mut host = host();
    host.execute(
        &deployer(),
        Call::Issue {
            amount: 50,
            recipient: wallet(1),
        },
    );

    let receipt = host.execute(
        &wallet(1),
        Call::Transfer {
            amount: 42,
            sender: wallet(1),
            recipient: wallet(2),
            memo: None,
        },
    );
    let transfer = receipt
        .outcome
        .events()
        .iter()
        .find(|e| e.kind == EventKind::Transferred)
        .expect("transfer event")
        .clone();
    assert_eq!(transfer.asset, DEFAULT_ASSET);
    assert_eq!(transfer.amount, 42);
    assert_eq!(transfer.from, Some(wallet(1)));
    assert_eq!(transfer.to, Some(wallet(2)));

    assert_eq!(balance(&mut host, &wallet(1)), ok_uint(8));
    assert_eq!(balance(&mut host, &wallet(2)), ok_uint(42));
}

#[test]
fn transfer_of_more_than_owned_is_rejected() {
    let mut host = host();
    let before = host.ledger().snapshot();
    let receipt = host.execute(
        &wallet(2),
        Call::Transfer {
            amount: 1000,
            sender: wallet(2),
            recipient: wallet(1),
            memo: None,
        },
    );
    assert!(matches!(receipt.outcome, Outcome::Err { code: 1, .. }));
    assert!(receipt.outcome.events().is_empty());
    assert_eq!(host.ledger().snapshot(), before);
}

#[test]
fn burn_emits_ft_burn_event() {
    let mut host = host();
    host.execute(
        &deployer(),
        Call::Issue {
            amount: 50,
            recipient: wallet(2),
        },
    );

    let receipt = host.execute(&wallet(2), Call::Burn { amount: 30 });
    let burn = &receipt.outcome.events()[0];
    assert_eq!(burn.kind, EventKind::Destroyed);
    assert_eq!(burn.asset, DEFAULT_ASSET);
    assert_eq!(burn.amount, 30);
    assert_eq!(burn.from, Some(wallet(2)));

    assert_eq!(balance(&mut host, &wallet(2)), ok_uint(20));
}

#[test]
fn total_supply_follows_mint_and_burn() {
    let mut host = host();
    host.execute(
        &deployer(),
        Call::Issue {
            amount: 100,
            recipient: wallet(1),
        },
    );
    host.execute(
        &deployer(),
        Call::Issue {
            amount: 50,
            recipient: wallet(2),
        },
    );
    host.execute(&wallet(1), Call::Burn { amount: 20 });

    let supply = host.execute(&deployer(), Call::GetTotalSupply);
    assert_eq!(supply.outcome, ok_uint(130));
}

#[derive(Clone, Debug)]
enum Op {
    Issue { caller: u8, to: u8, amount: Amount },
    Transfer { caller: u8, from: u8, to: u8, amount: Amount },
    Burn { caller: u8, amount: Amount },
}

// Principal 0 is the authority, 1..=3 are wallets.
fn principal(idx: u8) -> Principal {
    if idx == 0 {
        deployer()
    } else {
        wallet(idx)
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, 0u8..4, 0u128..500).prop_map(|(caller, to, amount)| Op::Issue {
            caller,
            to,
            amount
        }),
        (0u8..4, 0u8..4, 0u8..4, 0u128..500).prop_map(|(caller, from, to, amount)| {
            Op::Transfer {
                caller,
                from,
                to,
                amount,
            }
        }),
        (0u8..4, 0u128..500).prop_map(|(caller, amount)| Op::Burn { caller, amount }),
    ]
}

proptest! {
    #[test]
    fn supply_always_equals_sum_of_balances(ops in prop::collection::vec(op(), 1..60)) {
        let mut ledger = Ledger::new(LedgerConfig::new(deployer()));
        for op in ops {
            let before = ledger.snapshot();
            let result = match &op {
                Op::Issue { caller, to, amount } => {
                    ledger.issue(&principal(*caller), *amount, &principal(*to))
                }
                Op::Transfer { caller, from, to, amount } => ledger.transfer(
                    &principal(*caller),
                    *amount,
                    &principal(*from),
                    &principal(*to),
                    None,
                ),
                Op::Burn { caller, amount } => ledger.burn(&principal(*caller), *amount),
            };
            match result {
                Ok(event) => {
                    prop_assert_eq!(event.amount, match op {
                        Op::Issue { amount, .. }
                        | Op::Transfer { amount, .. }
                        | Op::Burn { amount, .. } => amount,
                    });
                    if let Op::Transfer { from, to, amount, .. } = op {
                        if from != to {
                            prop_assert_eq!(
                                ledger.balance(&principal(from)),
                                before.balances.get(&principal(from)).copied().unwrap_or(0) - amount
                            );
                            prop_assert_eq!(
                                ledger.balance(&principal(to)),
                                before.balances.get(&principal(to)).copied().unwrap_or(0) + amount
                            );
                        }
                        prop_assert_eq!(ledger.total_supply(), before.total_supply);
                    }
                }
                Err(_) => prop_assert_eq!(ledger.snapshot(), before),
            }
            let sum: Amount = ledger.holders().map(|(_, amount)| amount).sum();
            prop_assert_eq!(sum, ledger.total_supply());
            ledger.check_invariants().unwrap();
        }
    }
}
