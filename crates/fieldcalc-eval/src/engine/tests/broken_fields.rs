use std::sync::Arc;

use fieldcalc_common::{Aggregate, Field, FieldId, RecordId, ResultKind, TableId, Value};

use super::common::*;
use crate::engine::{Engine, EvalConfig};
use crate::EngineError;

#[test]
fn deleting_a_relation_breaks_its_rollups() {
    let engine = shop();
    let broken = engine.on_field_deleted(ITEMS).unwrap();
    assert_eq!(broken, vec![TOTAL]);
    assert!(engine.is_broken(TOTAL));
    assert_eq!(engine.broken_fields(), vec![TOTAL]);

    // Last materialized values stay.
    assert_eq!(value(&engine, ORDERS, 1, TOTAL), Value::from(30.0));
}

#[test]
fn broken_fields_are_not_recomputed() {
    let engine = shop();
    engine.on_field_deleted(ITEMS).unwrap();

    let updates = set(&engine, PRODUCTS, 1, PRICE, 99.0);
    assert!(updates.is_empty());
    assert_eq!(value(&engine, ORDERS, 1, TOTAL), Value::from(30.0));

    let updates = engine
        .recompute_unit(ORDERS, RecordId(1), TOTAL)
        .unwrap();
    assert!(updates.is_empty());
}

#[test]
fn consumers_of_a_broken_field_are_frozen_too() {
    let engine = shop();
    let doubled = FieldId(13);
    define(
        &engine,
        Field::formula(doubled, ORDERS, "Doubled", "[Total] * 2", ResultKind::Number),
    );
    engine.on_field_deleted(ITEMS).unwrap();

    // Doubled is not itself broken, but nothing upstream can change any more.
    assert!(!engine.is_broken(doubled));
    let updates = set(&engine, PRODUCTS, 2, PRICE, 1.0);
    assert!(updates.is_empty());
    assert_eq!(value(&engine, ORDERS, 1, doubled), Value::from(60.0));
}

#[test]
fn redefining_a_broken_field_clears_it() {
    let engine = shop();
    engine.on_field_deleted(ITEMS).unwrap();
    engine.store().remove_field(ITEMS);

    let recount = Field::rollup(TOTAL, ORDERS, "Total", ITEMS, Some(PRICE), Aggregate::Sum);
    assert!(matches!(
        engine.on_field_definition_changed(recount),
        Err(EngineError::DanglingRelation { .. })
    ));
    assert!(engine.is_broken(TOTAL));

    define(&engine, Field::relation(ITEMS, ORDERS, "Items", PRODUCTS));
    let updates = define(
        &engine,
        Field::rollup(TOTAL, ORDERS, "Total", ITEMS, Some(PRICE), Aggregate::Sum),
    );
    assert!(!engine.is_broken(TOTAL));
    assert!(engine.broken_fields().is_empty());
    assert!(updates.is_empty(), "stored values were already current");

    set(&engine, PRODUCTS, 1, PRICE, 12.0);
    assert_eq!(value(&engine, ORDERS, 1, TOTAL), Value::from(32.0));
}

#[test]
fn deleting_a_target_field_breaks_its_rollups() {
    let engine = shop();
    let broken = engine.on_field_deleted(PRICE).unwrap();
    assert_eq!(broken, vec![TOTAL]);
    assert!(!engine.is_broken(ITEMS));
}

#[test]
fn deleting_a_formula_input_breaks_only_computed_dependents() {
    let engine = shop();
    let a = FieldId(13);
    let b = FieldId(14);
    define(&engine, Field::formula(a, ORDERS, "A", "[Qty] + 1", ResultKind::Number));
    define(&engine, Field::formula(b, ORDERS, "B", "[A] + [Qty]", ResultKind::Number));

    let broken = engine.on_field_deleted(QTY).unwrap();
    assert_eq!(broken, vec![a, b]);
    assert!(engine.explain_dependencies(QTY).is_err());
}

#[test]
fn deleting_an_unknown_field_is_an_error() {
    let engine = shop();
    assert!(matches!(
        engine.on_field_deleted(FieldId(999)),
        Err(EngineError::UnknownField(FieldId(999)))
    ));
}

#[test]
fn retargeting_a_relation_breaks_mismatched_consumers() {
    let engine = shop();
    let suppliers = TableId(3);
    let count = FieldId(14);
    define(
        &engine,
        Field::rollup(count, ORDERS, "Count", ITEMS, None, Aggregate::Count),
    );

    define(&engine, Field::relation(ITEMS, ORDERS, "Items", suppliers));
    // Price lives on Products, not Suppliers.
    assert!(engine.is_broken(TOTAL));
    // Count has no target and keeps working.
    assert!(!engine.is_broken(count));

    link(&engine, ORDERS, 4, ITEMS, [7, 8]);
    assert_eq!(value(&engine, ORDERS, 4, count), Value::from(2.0));
    assert_eq!(value(&engine, ORDERS, 4, TOTAL), Value::from(0.0));
}

#[test]
fn turning_a_relation_into_plain_data_breaks_its_consumers() {
    let engine = shop();
    let count = FieldId(14);
    define(
        &engine,
        Field::rollup(count, ORDERS, "Count", ITEMS, None, Aggregate::Count),
    );

    let updates = define(&engine, Field::plain(ITEMS, ORDERS, "Items"));
    assert!(updates.is_empty());
    assert_eq!(engine.broken_fields(), vec![TOTAL, count]);
    assert_eq!(value(&engine, ORDERS, 1, TOTAL), Value::from(30.0));

    // No links are followed through the old relation any more.
    let updates = set(&engine, PRODUCTS, 1, PRICE, 99.0);
    assert!(updates.is_empty());

    // Making it a relation again is not enough; the rollup must be redefined.
    define(&engine, Field::relation(ITEMS, ORDERS, "Items", PRODUCTS));
    assert!(engine.is_broken(TOTAL));
    define(
        &engine,
        Field::rollup(TOTAL, ORDERS, "Total", ITEMS, Some(PRICE), Aggregate::Sum),
    );
    assert_eq!(value(&engine, ORDERS, 1, TOTAL), Value::from(119.0));
}

#[test]
fn engine_restarts_over_a_table_with_a_broken_field() {
    let store = Arc::new(shop_store());
    let first = Engine::new(store.clone(), EvalConfig::sequential());
    for field in [
        Field::plain(PRICE, PRODUCTS, "Price"),
        Field::relation(ITEMS, ORDERS, "Items", PRODUCTS),
        Field::rollup(TOTAL, ORDERS, "Total", ITEMS, Some(PRICE), Aggregate::Sum),
    ] {
        store.put_field(field.clone());
        first.on_field_definition_changed(field).unwrap();
    }
    first.on_field_deleted(ITEMS).unwrap();
    store.remove_field(ITEMS);
    drop(first);

    let second = Engine::new(store.clone(), EvalConfig::sequential());
    second.hydrate(&[PRODUCTS, ORDERS]).unwrap();
    assert_eq!(second.broken_fields(), vec![TOTAL]);
    assert_eq!(store.value(ORDERS, RecordId(1), TOTAL), Value::from(30.0));

    // The user repoints the rollup at a fresh relation.
    let relation = Field::relation(ITEMS, ORDERS, "Items", PRODUCTS);
    store.put_field(relation.clone());
    second.on_field_definition_changed(relation).unwrap();
    store.set_links(ORDERS, RecordId(1), ITEMS, [1]).unwrap();
    second
        .on_field_definition_changed(Field::rollup(
            TOTAL,
            ORDERS,
            "Total",
            ITEMS,
            Some(PRICE),
            Aggregate::Sum,
        ))
        .unwrap();
    assert!(second.broken_fields().is_empty());
    assert_eq!(store.value(ORDERS, RecordId(1), TOTAL), Value::from(10.0));
}
