// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Multiset count law and compaction safety under random operation sequences.
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;

use ordo_archiver::Tuplespace;
use ordo_proto::{tuple, Tuple};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(u8),
    Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(0u8..6).prop_map(Op::Insert), (0u8..6).prop_map(Op::Delete)]
}

fn key(i: u8) -> Tuple {
    tuple!["k", i64::from(i)]
}

proptest! {
    #[test]
    fn count_equals_inserts_minus_deletes(
        ops in prop::collection::vec(op(), 0..400),
        tolerance in 0usize..8,
    ) {
        let mut ts = Tuplespace::new(tolerance);
        let mut model: HashMap<u8, usize> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(i) => {
                    ts.insert(key(i));
                    *model.entry(i).or_insert(0) += 1;
                }
                Op::Delete(i) => {
                    let expected = model.get(&i).copied().unwrap_or(0) > 0;
                    prop_assert_eq!(ts.delete_once(&key(i)), expected);
                    if expected {
                        *model.entry(i).or_insert(0) -= 1;
                    }
                }
            }
            // compaction never disturbs live entries, and zeros stay bounded
            for (i, n) in &model {
                prop_assert_eq!(ts.count(&key(*i)), *n);
                prop_assert_eq!(ts.find_match(&key(*i)), *n > 0);
            }
            prop_assert!(ts.zero_entries() <= tolerance);
        }
    }
}

#[test]
fn extra_delete_is_rejected() {
    let mut ts = Tuplespace::default();
    let t = key(1);
    for _ in 0..3 {
        ts.insert(t.clone());
    }
    for _ in 0..3 {
        ts.transaction(std::slice::from_ref(&t), &[]).unwrap();
    }
    assert!(ts.transaction(&[t], &[]).is_err());
}
