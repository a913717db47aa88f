use std::collections::HashMap;

use proptest::prelude::*;

use crate::gc::Heap;
use crate::object::Str;
use crate::table::Table;
use crate::value::Value;

#[test]
fn set_then_get() {
    let mut heap = Heap::new();
    let mut table = Table::new();

    let key = heap.intern("answer");
    assert!(table.set(key, Value::Number(42.0)));
    assert_eq!(table.get(key), Some(Value::Number(42.0)));

    // Overwrite is not a new key.
    assert!(!table.set(key, Value::Number(7.0)));
    assert_eq!(table.get(key), Some(Value::Number(7.0)));
}

#[test]
fn get_on_missing_and_empty() {
    let mut heap = Heap::new();
    let table = Table::new();
    let key = heap.intern("missing");
    assert_eq!(table.get(key), None);
}

#[test]
fn delete_leaves_chain_intact() {
    let mut heap = Heap::new();
    let mut table = Table::new();

    let keys: Vec<_> = (0..64).map(|i| heap.intern(&format!("key{}", i))).collect();
    for (i, &key) in keys.iter().enumerate() {
        table.set(key, Value::Number(i as f64));
    }

    for &key in keys.iter().step_by(2) {
        assert!(table.delete(key));
        assert!(!table.delete(key));
    }

    for (i, &key) in keys.iter().enumerate() {
        let expected = if i % 2 == 0 {
            None
        } else {
            Some(Value::Number(i as f64))
        };
        assert_eq!(table.get(key), expected);
    }

    // A tombstoned slot accepts a fresh insert as a new key.
    assert!(table.set(keys[0], Value::Bool(true)));
    assert_eq!(table.get(keys[0]), Some(Value::Bool(true)));
}

#[test]
fn add_all_copies_every_entry() {
    let mut heap = Heap::new();
    let mut from = Table::new();
    let mut to = Table::new();

    let a = heap.intern("a");
    let b = heap.intern("b");
    from.set(a, Value::Number(1.0));
    from.set(b, Value::Number(2.0));
    to.set(b, Value::Number(99.0));

    to.add_all(&from);
    assert_eq!(to.get(a), Some(Value::Number(1.0)));
    // Source wins on overlap, as with method inheritance overriding.
    assert_eq!(to.get(b), Some(Value::Number(2.0)));
}

#[test]
fn find_string_matches_by_content() {
    let mut heap = Heap::new();
    let mut table = Table::new();

    let key = heap.intern("needle");
    table.set(key, Value::Nil);

    let hash = Str::hash_bytes("needle");
    let found = table.find_string("needle", hash).expect("present");
    assert!(found.ptr_eq(key));
    assert!(table
        .find_string("noodle", Str::hash_bytes("noodle"))
        .is_none());
}

#[test]
fn survives_growth() {
    let mut heap = Heap::new();
    let mut table = Table::new();

    let keys: Vec<_> = (0..500)
        .map(|i| heap.intern(&format!("global_{}", i)))
        .collect();
    for (i, &key) in keys.iter().enumerate() {
        table.set(key, Value::Number(i as f64));
    }
    for (i, &key) in keys.iter().enumerate() {
        assert_eq!(table.get(key), Some(Value::Number(i as f64)));
    }
}

proptest! {
    #[test]
    fn behaves_like_a_map(ops in proptest::collection::vec(("[a-z]{1,8}", any::<bool>(), -1000i64..1000), 0..200)) {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let mut model: HashMap<String, f64> = HashMap::new();

        for (name, insert, n) in &ops {
            let key = heap.intern(name);
            if *insert {
                table.set(key, Value::Number(*n as f64));
                model.insert(name.clone(), *n as f64);
            } else {
                table.delete(key);
                model.remove(name);
            }
        }

        for (name, expected) in &model {
            let key = heap.intern(name);
            prop_assert_eq!(table.get(key), Some(Value::Number(*expected)));
        }
    }
}
