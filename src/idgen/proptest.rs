//! Property-Based Tests for ID Layout
//!
//! # Test Properties
//!
//! 1. **Split**: decompose(compose(t, s)) = (t, s)
//! 2. **Positivity**: every in-range id is non-negative
//! 3. **Time Dominance**: a later second always sorts after an earlier one,
//!    whatever the sequences

#![cfg(test)]

use proptest::prelude::*;

use super::{compose, decompose, MAX_DELTA_SECONDS, MAX_SEQUENCE};

fn delta_strategy() -> impl Strategy<Value = i64> {
    0i64..=MAX_DELTA_SECONDS
}

fn sequence_strategy() -> impl Strategy<Value = i64> {
    1i64..=MAX_SEQUENCE
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_compose_splits_back(delta in delta_strategy(), seq in sequence_strategy()) {
        let parts = decompose(compose(delta, seq));
        prop_assert_eq!(parts.delta_seconds, delta);
        prop_assert_eq!(parts.sequence, seq);
    }

    #[test]
    fn prop_ids_are_non_negative(delta in delta_strategy(), seq in sequence_strategy()) {
        prop_assert!(compose(delta, seq) >= 0);
    }

    #[test]
    fn prop_time_dominates_sequence(
        delta in 0i64..MAX_DELTA_SECONDS,
        early_seq in sequence_strategy(),
        late_seq in sequence_strategy(),
    ) {
        prop_assert!(compose(delta, early_seq) < compose(delta + 1, late_seq));
    }

    #[test]
    fn prop_sequence_orders_within_second(
        delta in delta_strategy(),
        a in sequence_strategy(),
        b in sequence_strategy(),
    ) {
        prop_assert_eq!(a.cmp(&b), compose(delta, a).cmp(&compose(delta, b)));
    }
}
