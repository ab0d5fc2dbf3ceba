use fieldcalc_common::{Field, FieldId, ResultKind, Value};

use super::common::*;

const NAMES: FieldId = FieldId(13);

fn with_names() -> crate::engine::Engine<crate::MemoryStore> {
    let engine = shop();
    define(&engine, Field::lookup(NAMES, ORDERS, "Names", ITEMS, NAME));
    engine
}

fn names(items: &[&str]) -> Value {
    Value::List(items.iter().map(|s| Value::from(*s)).collect())
}

#[test]
fn lookup_lists_target_values_in_relation_order() {
    let engine = with_names();
    assert_eq!(value(&engine, ORDERS, 1, NAMES), names(&["a", "b"]));
    assert_eq!(value(&engine, ORDERS, 2, NAMES), names(&["b"]));
    assert_eq!(value(&engine, ORDERS, 4, NAMES), names(&[]));

    link(&engine, ORDERS, 1, ITEMS, [3, 2, 1]);
    assert_eq!(value(&engine, ORDERS, 1, NAMES), names(&["c", "b", "a"]));
}

#[test]
fn lookup_follows_target_edits() {
    let engine = with_names();
    let updates = set(&engine, PRODUCTS, 2, NAME, "bee");
    assert_eq!(
        touched(&updates),
        vec![(ORDERS, 1, NAMES), (ORDERS, 2, NAMES)]
    );
    assert_eq!(value(&engine, ORDERS, 1, NAMES), names(&["a", "bee"]));
}

#[test]
fn lookup_keeps_empty_entries() {
    let engine = with_names();
    engine
        .store()
        .insert_record(PRODUCTS, fieldcalc_common::RecordId(4), []);
    engine
        .on_record_created(PRODUCTS, fieldcalc_common::RecordId(4))
        .unwrap();
    link(&engine, ORDERS, 4, ITEMS, [4, 1]);
    assert_eq!(
        value(&engine, ORDERS, 4, NAMES),
        Value::List(vec![Value::Empty, Value::from("a")])
    );
}

#[test]
fn formula_can_read_a_lookup() {
    let engine = with_names();
    let first = FieldId(14);
    define(
        &engine,
        Field::formula(first, ORDERS, "Joined", "CONCAT([Names])", ResultKind::Text),
    );
    assert_eq!(value(&engine, ORDERS, 1, first), Value::from("a, b"));

    set(&engine, PRODUCTS, 1, NAME, "z");
    assert_eq!(value(&engine, ORDERS, 1, first), Value::from("z, b"));
}
