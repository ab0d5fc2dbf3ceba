//! Common test helpers
use std::sync::Arc;

use chrono::NaiveDate;
use fieldcalc_common::{Aggregate, Field, FieldId, RecordId, TableId, Value};

use crate::clock::FixedClock;
use crate::engine::{Engine, EvalConfig, ValueUpdate};
use crate::memory_store::MemoryStore;

pub const PRODUCTS: TableId = TableId(1);
pub const ORDERS: TableId = TableId(2);

// Products
pub const PRICE: FieldId = FieldId(1);
pub const NAME: FieldId = FieldId(2);

// Orders
pub const ITEMS: FieldId = FieldId(10);
pub const TOTAL: FieldId = FieldId(11);
pub const QTY: FieldId = FieldId(12);

pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
}

pub fn engine_with(store: MemoryStore, config: EvalConfig) -> Engine<MemoryStore> {
    Engine::with_clock(store, config, Arc::new(FixedClock(today())))
}

pub fn engine(store: MemoryStore) -> Engine<MemoryStore> {
    engine_with(store, EvalConfig::sequential())
}

/// Persist a definition and hand it to the engine, the way a field editor would.
pub fn define(engine: &Engine<MemoryStore>, field: Field) -> Vec<ValueUpdate> {
    engine.store().put_field(field.clone());
    engine
        .on_field_definition_changed(field)
        .unwrap_or_else(|e| panic!("definition rejected: {e}"))
}

/// A user edit of one plain value.
pub fn set(
    engine: &Engine<MemoryStore>,
    table: TableId,
    record: u64,
    field: FieldId,
    value: impl Into<Value>,
) -> Vec<ValueUpdate> {
    engine
        .store()
        .set_value(table, RecordId(record), field, value.into())
        .unwrap();
    engine
        .on_record_value_changed(table, RecordId(record), &[field])
        .unwrap()
}

/// A user edit of one relation value.
pub fn link<const N: usize>(
    engine: &Engine<MemoryStore>,
    table: TableId,
    record: u64,
    relation: FieldId,
    targets: [u64; N],
) -> Vec<ValueUpdate> {
    let old = engine
        .store()
        .set_links(table, RecordId(record), relation, targets)
        .unwrap();
    let new: Vec<RecordId> = targets.into_iter().map(RecordId).collect();
    engine
        .on_relation_changed(table, RecordId(record), relation, &old, &new)
        .unwrap()
}

pub fn value(engine: &Engine<MemoryStore>, table: TableId, record: u64, field: FieldId) -> Value {
    engine.store().value(table, RecordId(record), field)
}

/// (table, record, field) of each update, sorted.
pub fn touched(updates: &[ValueUpdate]) -> Vec<(TableId, u64, FieldId)> {
    let mut out: Vec<_> = updates
        .iter()
        .map(|u| (u.table, u.record.get(), u.field))
        .collect();
    out.sort();
    out
}

/// Products p1..p3 priced 10, 20, 5; orders o1 -> [p1, p2], o2 -> [p2],
/// o3 -> [p3], o4 -> []. Orders carry `Total = SUM(Items -> Price)`.
pub fn shop_store() -> MemoryStore {
    MemoryStore::new()
        .with_record(PRODUCTS, 1, [(PRICE, 10.0.into()), (NAME, "a".into())])
        .with_record(PRODUCTS, 2, [(PRICE, 20.0.into()), (NAME, "b".into())])
        .with_record(PRODUCTS, 3, [(PRICE, 5.0.into()), (NAME, "c".into())])
        .with_record(ORDERS, 1, [(ITEMS, Value::links([1, 2])), (QTY, 2.0.into())])
        .with_record(ORDERS, 2, [(ITEMS, Value::links([2])), (QTY, 1.0.into())])
        .with_record(ORDERS, 3, [(ITEMS, Value::links([3]))])
        .with_record(ORDERS, 4, [(ITEMS, Value::links([]))])
}

pub fn shop() -> Engine<MemoryStore> {
    let engine = engine(shop_store());
    define(&engine, Field::plain(PRICE, PRODUCTS, "Price"));
    define(&engine, Field::plain(NAME, PRODUCTS, "Name"));
    define(&engine, Field::relation(ITEMS, ORDERS, "Items", PRODUCTS));
    define(&engine, Field::plain(QTY, ORDERS, "Qty"));
    define(
        &engine,
        Field::rollup(TOTAL, ORDERS, "Total", ITEMS, Some(PRICE), Aggregate::Sum),
    );
    engine
}
