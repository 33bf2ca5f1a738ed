//! Property tests for the container's structural laws: traversal counts,
//! advance/distance symmetry, and reference stability under arbitrary
//! operation sequences.

use brood::{Brood, Limits};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Insert(u16),
    EraseAt(usize),
    EraseRange(usize, usize),
    Clear,
    Trim,
    Reserve(u16),
    InsertFill(u8, u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => any::<u16>().prop_map(Op::Insert),
        4 => any::<usize>().prop_map(Op::EraseAt),
        1 => (any::<usize>(), any::<usize>()).prop_map(|(a, b)| Op::EraseRange(a, b)),
        1 => Just(Op::Clear),
        1 => Just(Op::Trim),
        1 => any::<u16>().prop_map(Op::Reserve),
        1 => (any::<u8>(), any::<u16>()).prop_map(|(n, v)| Op::InsertFill(n, v)),
    ]
}

// Applies an operation sequence to the container and a Vec-based model
// in lockstep, then checks the container against the model.
fn run_model(limits: Limits, ops: Vec<Op>) {
    let mut brood = Brood::<u16>::with_limits(limits).unwrap();
    let mut model: Vec<u16> = Vec::new();

    for op in ops {
        match op {
            Op::Insert(value) => {
                brood.insert(value);
                model.push(value);
            }
            Op::EraseAt(raw) => {
                if !model.is_empty() {
                    let index = raw % model.len();
                    unsafe {
                        let cursor = brood.begin().advanced(index as isize);
                        let value = *cursor.as_ref();
                        let position = model.iter().position(|v| *v == value).unwrap();
                        model.remove(position);
                        brood.erase(cursor);
                    }
                }
            }
            Op::EraseRange(a, b) => {
                if !model.is_empty() {
                    let start = a % model.len();
                    let count = b % (model.len() - start + 1);
                    unsafe {
                        let first = brood.begin().advanced(start as isize);
                        let last = first.advanced(count as isize);
                        // Remove exactly the values in [first, last) from
                        // the model.
                        let mut cursor = first;
                        while cursor != last {
                            let value = *cursor.as_ref();
                            let position =
                                model.iter().position(|v| *v == value).unwrap();
                            model.remove(position);
                            cursor.step_forward();
                        }
                        brood.erase_range(first, last);
                    }
                }
            }
            Op::Clear => {
                brood.clear();
                model.clear();
            }
            Op::Trim => brood.trim(),
            Op::Reserve(n) => {
                brood.reserve(n as usize % 512).unwrap();
            }
            Op::InsertFill(n, value) => {
                brood.insert_fill(n as usize, value).unwrap();
                model.extend(std::iter::repeat_n(value, n as usize));
            }
        }

        // Core invariants after every operation.
        assert_eq!(brood.len(), model.len());
        assert_eq!(brood.is_empty(), model.is_empty());
        assert_eq!(brood.is_empty(), brood.begin() == brood.end());
        assert!(brood.capacity() >= brood.len());
    }

    // The container holds exactly the model's multiset.
    let mut actual: Vec<u16> = brood.iter().copied().collect();
    let mut expected = model;
    actual.sort_unstable();
    expected.sort_unstable();
    assert_eq!(actual, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn model_equivalence_small_blocks(ops in prop::collection::vec(op_strategy(), 0..80)) {
        run_model(Limits::new(4, 4), ops);
    }

    #[test]
    fn model_equivalence_growing_blocks(ops in prop::collection::vec(op_strategy(), 0..80)) {
        run_model(Limits::new(3, 32), ops);
    }

    #[test]
    fn traversal_matches_len(values in prop::collection::vec(any::<u16>(), 0..200),
                             erase_mask in any::<u64>()) {
        let mut brood = Brood::<u16>::with_limits(Limits::new(4, 16)).unwrap();
        let cursors: Vec<_> = values.iter().map(|v| brood.insert(*v)).collect();
        unsafe {
            for (i, cursor) in cursors.iter().enumerate() {
                if erase_mask & (1 << (i % 64)) != 0 {
                    brood.erase(*cursor);
                }
            }
        }
        prop_assert_eq!(brood.iter().count(), brood.len());
        prop_assert_eq!(brood.iter().rev().count(), brood.len());
        unsafe {
            prop_assert_eq!(brood.begin().distance(&brood.end()), brood.len() as isize);
            prop_assert_eq!(brood.end().distance(&brood.begin()), -(brood.len() as isize));
            prop_assert_eq!(brood.begin().advanced(brood.len() as isize), brood.end());
        }
    }

    #[test]
    fn advance_round_trips(values in prop::collection::vec(any::<u16>(), 1..120),
                           erase_mask in any::<u64>(),
                           offset in any::<usize>(),
                           step in any::<usize>()) {
        let mut brood = Brood::<u16>::with_limits(Limits::new(4, 8)).unwrap();
        let cursors: Vec<_> = values.iter().map(|v| brood.insert(*v)).collect();
        unsafe {
            for (i, cursor) in cursors.iter().enumerate() {
                // Keep at least one element.
                if i + 1 < cursors.len() && erase_mask & (1 << (i % 64)) != 0 {
                    brood.erase(*cursor);
                }
            }
        }
        let live = brood.len() as isize;
        prop_assume!(live > 0);
        let position = (offset % live as usize) as isize;
        let hop = (step % (live as usize - position as usize + 1)) as isize;
        unsafe {
            let cursor = brood.begin().advanced(position);
            let forward = cursor.advanced(hop);
            prop_assert_eq!(forward.advanced(-hop), cursor);
            prop_assert_eq!(cursor.distance(&forward), hop);
            prop_assert_eq!(forward.distance(&cursor), -hop);
        }
    }

    #[test]
    fn references_stable_across_growth(seed_values in prop::collection::vec(any::<u32>(), 1..60),
                                       growth in 1..400usize) {
        let mut brood: Brood<u32> = Brood::new();
        let cursors: Vec<_> = seed_values.iter().map(|v| brood.insert(*v)).collect();
        for i in 0..growth {
            brood.insert(i as u32);
        }
        for (cursor, value) in cursors.iter().zip(&seed_values) {
            unsafe {
                prop_assert_eq!(*cursor.as_ref(), *value);
            }
            prop_assert!(brood.get_cursor(cursor.as_ptr()).is_some());
        }
    }

    #[test]
    fn splice_is_multiset_union(left in prop::collection::vec(any::<u16>(), 0..100),
                                right in prop::collection::vec(any::<u16>(), 0..100)) {
        let mut a: Brood<u16> = left.iter().copied().collect();
        let mut b: Brood<u16> = right.iter().copied().collect();
        a.splice(&mut b).unwrap();
        prop_assert!(b.is_empty());
        prop_assert_eq!(a.len(), left.len() + right.len());
        let mut actual: Vec<u16> = a.iter().copied().collect();
        let mut expected: Vec<u16> = left.into_iter().chain(right).collect();
        actual.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(actual, expected);
        prop_assert_eq!(a.iter().count(), a.len());
    }

    #[test]
    fn sort_then_unique_is_sound(values in prop::collection::vec(0u8..8, 0..150)) {
        let mut brood: Brood<u8> = values.iter().copied().collect();
        brood.sort();
        let sorted: Vec<u8> = brood.iter().copied().collect();
        prop_assert!(sorted.windows(2).all(|p| p[0] <= p[1]));

        let removed = brood.unique();
        let mut expected = values.clone();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(brood.len(), expected.len());
        prop_assert_eq!(removed, values.len() - expected.len());
        let survivors: Vec<u8> = brood.iter().copied().collect();
        prop_assert_eq!(survivors, expected);

        // Idempotence.
        prop_assert_eq!(brood.unique(), 0);
        brood.sort();
        let resorted: Vec<u8> = brood.iter().copied().collect();
        prop_assert!(resorted.windows(2).all(|p| p[0] <= p[1]));
    }
}
