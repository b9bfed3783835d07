//! Property checks: random delta sequences keep the ledger consistent.

use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;

use sellercredit_common::UserId;
use sellercredit_ledger::{
    BalanceMutator, LedgerConfig, LedgerStore, LogType, MemoryLedgerStore, Seller,
};

/// A deposit or sale of whole cents between 0.01 and 20,000.00.
fn delta_strategy() -> impl Strategy<Value = (Decimal, LogType)> {
    (1i64..=2_000_000, any::<bool>()).prop_map(|(cents, is_deposit)| {
        let amount = Decimal::new(cents, 2);
        if is_deposit {
            (amount, LogType::Deposit)
        } else {
            (-amount, LogType::Sale)
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_matches_log_totals(deltas in prop::collection::vec(delta_strategy(), 1..40)) {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryLedgerStore::default());
            let (seller, credit) = store
                .create_seller(Seller::new(UserId::new(), None, None))
                .await
                .unwrap();
            let mutator = BalanceMutator::new(Arc::clone(&store), LedgerConfig::default());

            let mut expected = Decimal::ZERO;
            for (delta, log_type) in deltas {
                let result = mutator.apply_delta(seller.id, delta, log_type).await;

                if expected + delta < Decimal::ZERO {
                    prop_assert!(result.is_err());
                } else {
                    prop_assert!(result.is_ok());
                    expected += delta;
                }

                let balance = store.credit_for_seller(seller.id).await.unwrap().balance;
                let deposits = store.sum_by_type(credit.id, LogType::Deposit).await.unwrap();
                let sales = store.sum_by_type(credit.id, LogType::Sale).await.unwrap();

                prop_assert!(balance >= Decimal::ZERO);
                prop_assert_eq!(balance, expected);
                prop_assert_eq!(deposits - sales, balance);
            }
            Ok(())
        })?;
    }
}
