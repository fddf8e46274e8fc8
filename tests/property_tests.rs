//! Property tests for the quantified container and value invariants.

mod common;

use proptest::prelude::*;
use wisp_vm::Var;

fn arbitrary_number() -> impl Strategy<Value = f64> {
    prop_oneof![
        any::<f64>().prop_filter("finite", |n| n.is_finite()),
        Just(0.0),
        Just(-0.0),
    ]
}

proptest! {
    #[test]
    fn to_string_is_idempotent(n in arbitrary_number()) {
        let (mut vm, _, _) = common::capture_vm();

        let first = vm
            .value_to_string(Var::number(n), false)
            .expect("numbers always render");
        let second = vm
            .value_to_string(Var::object(first), false)
            .expect("strings always render");

        // Rendering a rendered value returns the same string (same
        // object, even: strings render to themselves).
        prop_assert_eq!(first, second);
    }

    #[test]
    fn equal_values_hash_equal(n in arbitrary_number(), text in ".*") {
        let (mut vm, _, _) = common::capture_vm();

        let a = Var::number(n);
        let b = Var::number(n);
        prop_assert!(vm.heap().values_equal(a, b));
        prop_assert_eq!(vm.heap().hash_value(a), vm.heap().hash_value(b));

        let s1 = vm.new_string(&text);
        let s1 = Var::object(s1);
        let s1_handle = vm.new_handle(s1);
        let s2 = vm.new_string(&text);
        let s2 = Var::object(s2);
        prop_assert!(vm.heap().values_equal(s1, s2));
        prop_assert_eq!(vm.heap().hash_value(s1), vm.heap().hash_value(s2));
        vm.release_handle(s1_handle);
    }

    #[test]
    fn list_insert_remove_roundtrip(
        elements in proptest::collection::vec(arbitrary_number(), 0..16),
        index_seed in any::<usize>(),
        inserted in arbitrary_number(),
    ) {
        let (mut vm, _, _) = common::capture_vm();

        let list = vm.new_list(0);
        let handle = vm.new_handle(Var::object(list));
        for n in &elements {
            vm.list_append(list, Var::number(*n));
        }

        let index = index_seed % (elements.len() + 1);
        vm.list_insert_at(list, index, Var::number(inserted));
        prop_assert_eq!(vm.heap().list(list).len(), elements.len() + 1);

        let removed = vm.list_remove_at(list, index);
        prop_assert_eq!(removed, Var::number(inserted));
        prop_assert_eq!(vm.heap().list(list).len(), elements.len());

        // The surrounding elements are untouched.
        for (i, n) in elements.iter().enumerate() {
            prop_assert_eq!(vm.heap().list(list).as_slice()[i], Var::number(*n));
        }

        vm.release_handle(handle);
    }

    #[test]
    fn map_set_get_remove(keys in proptest::collection::hash_set(0u32..1000, 1..32)) {
        let (mut vm, _, _) = common::capture_vm();

        let map = vm.new_map();
        let handle = vm.new_handle(Var::object(map));

        for key in &keys {
            let value = Var::number(f64::from(*key) * 2.0);
            let key = Var::number(f64::from(*key));
            vm.heap_mut().map_set(map, key, value);
            prop_assert_eq!(vm.heap().map_get(map, key), value);
        }
        prop_assert_eq!(vm.heap().map(map).len(), keys.len());

        for key in &keys {
            let key = Var::number(f64::from(*key));
            let removed = vm.heap_mut().map_remove_key(map, key);
            prop_assert!(!removed.is_undef());
            prop_assert!(vm.heap().map_get(map, key).is_undef());
        }
        prop_assert_eq!(vm.heap().map(map).len(), 0);

        vm.release_handle(handle);
    }

    #[test]
    fn map_tombstones_keep_probing_correct(keys in proptest::collection::vec(0u32..64, 1..48)) {
        let (mut vm, _, _) = common::capture_vm();

        let map = vm.new_map();
        let handle = vm.new_handle(Var::object(map));

        // Interleave inserts and removes so tombstones accumulate on the
        // probe sequences.
        for (i, key) in keys.iter().enumerate() {
            let key = Var::number(f64::from(*key));
            vm.heap_mut().map_set(map, key, Var::number(i as f64));
            if i % 3 == 0 {
                vm.heap_mut().map_remove_key(map, key);
            }
        }

        for (i, key) in keys.iter().enumerate() {
            let key_var = Var::number(f64::from(*key));
            let found = vm.heap().map_get(map, key_var);
            // The key is present unless its last write was removed.
            let last_write = keys
                .iter()
                .enumerate()
                .filter(|(_, k)| *k == key)
                .map(|(j, _)| j)
                .max()
                .expect("the key occurs");
            if last_write == i && i % 3 == 0 {
                // Removed right after its final insert.
                prop_assert!(found.is_undef());
            }
        }

        vm.release_handle(handle);
    }

    #[test]
    fn capacities_are_powers_of_two(count in 1usize..200) {
        let (mut vm, _, _) = common::capture_vm();

        let list = vm.new_list(0);
        let handle = vm.new_handle(Var::object(list));
        for i in 0..count {
            vm.list_append(list, Var::number(i as f64));
        }

        let capacity = vm.heap().list(list).capacity();
        prop_assert!(capacity.is_power_of_two());
        prop_assert!(capacity >= 8, "capacity respects the minimum: {capacity}");
        prop_assert!(capacity >= count);

        vm.release_handle(handle);
    }
}

#[test]
fn fiber_stack_capacity_is_power_of_two() {
    let (mut vm, _, _) = common::capture_vm();

    vm.reserve_slots(100);
    let fiber = vm.current_fiber().expect("reserve_slots pins a bare fiber");
    let stack_size = vm.heap().fiber(fiber).stack_size();
    assert!(stack_size.is_power_of_two());
    assert!(stack_size >= 100);
}
