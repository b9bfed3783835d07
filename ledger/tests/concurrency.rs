//! Concurrency, isolation and atomicity checks for the balance mutator.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use sellercredit_common::{CreditError, SellerId, UserId};
use sellercredit_ledger::{
    BalanceMutator, LedgerConfig, LedgerStore, LogType, MemoryLedgerStore, Seller,
    TransactionLog, UnitOfWork,
};

fn short_timeouts() -> LedgerConfig {
    LedgerConfig {
        lock_timeout: Duration::from_millis(50),
        unit_timeout: Duration::from_millis(500),
    }
}

async fn setup(config: LedgerConfig) -> (Arc<MemoryLedgerStore>, BalanceMutator<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new(&config));
    let mutator = BalanceMutator::new(Arc::clone(&store), config);
    (store, mutator)
}

async fn seller_with_balance(
    store: &MemoryLedgerStore,
    mutator: &BalanceMutator<MemoryLedgerStore>,
    balance: Decimal,
) -> SellerId {
    let (seller, _) = store
        .create_seller(Seller::new(UserId::new(), None, None))
        .await
        .unwrap();
    if balance > Decimal::ZERO {
        mutator
            .apply_delta(seller.id, balance, LogType::Deposit)
            .await
            .unwrap();
    }
    seller.id
}

async fn snapshot(store: &MemoryLedgerStore, seller: SellerId) -> (Decimal, Vec<TransactionLog>) {
    let credit = store.credit_for_seller(seller).await.unwrap();
    let logs = store
        .all_logs()
        .into_iter()
        .filter(|log| log.credit_id == credit.id)
        .collect();
    (credit.balance, logs)
}

#[tokio::test]
async fn scenario_debit_from_empty_balance_fails() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, Decimal::ZERO).await;

    let err = mutator
        .apply_delta(seller, dec!(-1000), LogType::Sale)
        .await
        .unwrap_err();

    assert!(matches!(err, CreditError::InsufficientBalance { .. }));
    let (balance, logs) = snapshot(&store, seller).await;
    assert_eq!(balance, Decimal::ZERO);
    assert!(logs.is_empty());
}

#[tokio::test]
async fn scenario_sale_debits_and_logs_once() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(2000)).await;

    let credit = mutator
        .apply_delta(seller, dec!(-1000), LogType::Sale)
        .await
        .unwrap();
    assert_eq!(credit.balance, dec!(1000));

    let (_, logs) = snapshot(&store, seller).await;
    let sales: Vec<_> = logs.iter().filter(|l| l.log_type == LogType::Sale).collect();
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].amount, dec!(1000));
}

#[tokio::test]
async fn scenario_deposit_credits_and_logs_once() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, Decimal::ZERO).await;

    let credit = mutator
        .apply_delta(seller, dec!(1000), LogType::Deposit)
        .await
        .unwrap();
    assert_eq!(credit.balance, dec!(1000));

    let (_, logs) = snapshot(&store, seller).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].log_type, LogType::Deposit);
    assert_eq!(logs[0].amount, dec!(1000));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_two_concurrent_debits_one_wins() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(1000)).await;

    let handles = (0..2).map(|_| {
        let mutator = mutator.clone();
        tokio::spawn(async move { mutator.apply_delta(seller, dec!(-1000), LogType::Sale).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(CreditError::InsufficientBalance { .. })))
            .count(),
        1
    );

    let (balance, logs) = snapshot(&store, seller).await;
    assert_eq!(balance, Decimal::ZERO);
    assert_eq!(logs.iter().filter(|l| l.log_type == LogType::Sale).count(), 1);
}

#[tokio::test]
async fn scenario_totals_track_balance_after_every_step() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, Decimal::ZERO).await;
    let credit_id = store.credit_for_seller(seller).await.unwrap().id;

    let steps = [
        (dec!(5000), LogType::Deposit),
        (dec!(-2000), LogType::Sale),
        (dec!(-5000), LogType::Sale),
        (dec!(1000.50), LogType::Deposit),
        (dec!(-1000), LogType::Sale),
    ];

    for (delta, log_type) in steps {
        let _ = mutator.apply_delta(seller, delta, log_type).await;

        let deposits = store.sum_by_type(credit_id, LogType::Deposit).await.unwrap();
        let sales = store.sum_by_type(credit_id, LogType::Sale).await.unwrap();
        let balance = store.credit_for_seller(seller).await.unwrap().balance;
        assert_eq!(deposits - sales, balance);
    }

    assert_eq!(
        store.credit_for_seller(seller).await.unwrap().balance,
        dec!(3000.50)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_debits_never_overdraw() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(5000)).await;

    let handles = (0..10).map(|_| {
        let mutator = mutator.clone();
        tokio::spawn(async move { mutator.apply_delta(seller, dec!(-1000), LogType::Sale).await })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    let insufficient = results
        .iter()
        .filter(|r| matches!(r, Err(CreditError::InsufficientBalance { .. })))
        .count();
    assert_eq!(succeeded, 5);
    assert_eq!(insufficient, 5);

    let (balance, logs) = snapshot(&store, seller).await;
    assert_eq!(balance, Decimal::ZERO);
    assert_eq!(logs.iter().filter(|l| l.log_type == LogType::Sale).count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_mixed_debits_match_serial_replay() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(5000)).await;
    let amounts = [dec!(3000), dec!(2500), dec!(2000), dec!(1000)];

    let handles = amounts.iter().map(|&amount| {
        let mutator = mutator.clone();
        tokio::spawn(async move {
            let result = mutator.apply_delta(seller, -amount, LogType::Sale).await;
            (amount, result)
        })
    });
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // Log ids are reserved under the credit lock, so id order is lock order.
    let (balance, logs) = snapshot(&store, seller).await;
    let mut replayed = dec!(5000);
    let mut committed = Vec::new();
    for log in logs.iter().filter(|l| l.log_type == LogType::Sale) {
        assert!(log.amount <= replayed, "sale {} overdrew {}", log.amount, replayed);
        replayed -= log.amount;
        committed.push((log.amount, replayed));
    }
    assert_eq!(balance, replayed);
    assert!(!committed.is_empty());

    for (amount, result) in &results {
        match result {
            Ok(credit) => assert!(committed.contains(&(*amount, credit.balance))),
            Err(CreditError::InsufficientBalance { .. }) => {
                assert!(committed.iter().all(|(logged, _)| logged != amount));
                assert!(*amount > balance);
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(
        results.iter().filter(|(_, result)| result.is_ok()).count(),
        committed.len()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sellers_do_not_block_each_other() {
    let (store, mutator) = setup(short_timeouts()).await;
    let seller_a = seller_with_balance(&store, &mutator, dec!(1000)).await;
    let seller_b = seller_with_balance(&store, &mutator, dec!(1000)).await;

    let mut held = store.begin().await.unwrap();
    held.get_for_update(seller_a).await.unwrap();
    assert!(store.is_locked(&seller_a));

    let credit = mutator
        .apply_delta(seller_b, dec!(-1000), LogType::Sale)
        .await
        .unwrap();
    assert_eq!(credit.balance, Decimal::ZERO);

    held.rollback().await.unwrap();
}

#[tokio::test]
async fn lock_wait_is_bounded() {
    let (store, mutator) = setup(short_timeouts()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(1000)).await;

    let mut held = store.begin().await.unwrap();
    held.get_for_update(seller).await.unwrap();

    let err = mutator
        .apply_delta(seller, dec!(-1000), LogType::Sale)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::ConflictTimeout(_)));
    assert!(err.is_retryable());
    assert_eq!(store.lock_stats().timeouts, 1);

    drop(held);
    mutator
        .apply_delta(seller, dec!(-1000), LogType::Sale)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancelled_unit_releases_lock() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(2000)).await;

    let task_store = Arc::clone(&store);
    let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(async move {
        let mut unit = task_store.begin().await?;
        let mut credit = unit.get_for_update(seller).await?;
        credit.apply(dec!(-1000))?;
        unit.save(&credit).await?;
        let _ = locked_tx.send(());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unit.commit().await
    });

    locked_rx.await.unwrap();
    assert!(store.is_locked(&seller));

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(!store.is_locked(&seller));

    let (balance, logs) = snapshot(&store, seller).await;
    assert_eq!(balance, dec!(2000));
    assert_eq!(logs.len(), 1);

    mutator
        .apply_delta(seller, dec!(-1000), LogType::Sale)
        .await
        .unwrap();
}

#[tokio::test]
async fn unit_time_bound_rolls_back() {
    let (store, mutator) = setup(short_timeouts()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(2000)).await;

    let slow_store = Arc::clone(&store);
    let result: Result<(), CreditError> = mutator
        .bounded(async move {
            let mut unit = slow_store.begin().await?;
            BalanceMutator::<MemoryLedgerStore>::apply_in(
                &mut unit,
                seller,
                dec!(-1000),
                LogType::Sale,
            )
            .await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unit.commit().await
        })
        .await;

    assert!(matches!(result, Err(CreditError::ConflictTimeout(_))));
    assert!(!store.is_locked(&seller));
    assert_eq!(store.credit_for_seller(seller).await.unwrap().balance, dec!(2000));
}

#[tokio::test]
async fn storage_failure_leaves_state_unchanged() {
    let (store, mutator) = setup(LedgerConfig::default()).await;
    let seller = seller_with_balance(&store, &mutator, dec!(3000)).await;
    let before = snapshot(&store, seller).await;

    store.inject_commit_failure();
    let err = mutator
        .apply_delta(seller, dec!(-1000), LogType::Sale)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::StorageFailure(_)));

    assert_eq!(snapshot(&store, seller).await, before);
    assert!(!store.is_locked(&seller));
}
