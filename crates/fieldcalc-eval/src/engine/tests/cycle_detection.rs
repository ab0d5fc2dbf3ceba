use fieldcalc_common::{Aggregate, Field, FieldId, RecordId, ResultKind, TableId, Value};

use super::common::*;
use crate::EngineError;

const A: TableId = TableId(5);
const B: TableId = TableId(6);

const A_TO_B: FieldId = FieldId(50);
const A_SUM: FieldId = FieldId(51);
const A_Z: FieldId = FieldId(52);
const B_TO_A: FieldId = FieldId(60);
const B_BACK: FieldId = FieldId(61);
const B_Y: FieldId = FieldId(62);

/// A.Sum = SUM(A.ToB -> B.Y), B.Y = [Back] * 2, B.Back = SUM(B.ToA -> A.Z),
/// with A.Z a plain number. Turning A.Z into a formula over A.Sum closes a
/// cycle across both tables.
fn two_tables() -> crate::engine::Engine<crate::MemoryStore> {
    let store = crate::MemoryStore::new()
        .with_record(A, 1, [(A_TO_B, Value::links([1])), (A_Z, 3.0.into())])
        .with_record(B, 1, [(B_TO_A, Value::links([1]))]);
    let engine = engine(store);
    define(&engine, Field::relation(A_TO_B, A, "ToB", B));
    define(&engine, Field::relation(B_TO_A, B, "ToA", A));
    define(&engine, Field::plain(A_Z, A, "Z"));
    define(
        &engine,
        Field::rollup(B_BACK, B, "Back", B_TO_A, Some(A_Z), Aggregate::Sum),
    );
    define(
        &engine,
        Field::formula(B_Y, B, "Y", "[Back] * 2", ResultKind::Number),
    );
    define(
        &engine,
        Field::rollup(A_SUM, A, "Sum", A_TO_B, Some(B_Y), Aggregate::Sum),
    );
    engine
}

#[test]
fn chain_materializes_across_tables() {
    let engine = two_tables();
    assert_eq!(value(&engine, B, 1, B_BACK), Value::from(3.0));
    assert_eq!(value(&engine, B, 1, B_Y), Value::from(6.0));
    assert_eq!(value(&engine, A, 1, A_SUM), Value::from(6.0));
}

#[test]
fn cross_table_cycle_is_rejected_with_its_path() {
    let engine = two_tables();
    let closing = Field::formula(A_Z, A, "Z", "[Sum] + 1", ResultKind::Number);

    let err = engine.on_field_definition_changed(closing).unwrap_err();
    let cycle = match err {
        EngineError::Cycle(cycle) => cycle,
        other => panic!("expected a cycle error, got {other}"),
    };
    assert_eq!(cycle.path, vec![A_Z, A_SUM, B_Y, B_BACK, A_Z]);
    assert_eq!(cycle.field(), Some(A_Z));
    assert_eq!(
        cycle.to_string(),
        "definition would create a dependency cycle: fld52 -> fld51 -> fld62 -> fld61 -> fld52"
    );
}

#[test]
fn rejected_definition_changes_nothing() {
    let engine = two_tables();
    let before = engine.explain_dependencies(A_Z).unwrap();
    let writes = engine.store().write_count();

    let closing = Field::formula(A_Z, A, "Z", "[Sum] + 1", ResultKind::Number);
    assert!(engine.on_field_definition_changed(closing).is_err());

    assert_eq!(engine.explain_dependencies(A_Z).unwrap(), before);
    assert_eq!(engine.field(A_Z).unwrap(), Field::plain(A_Z, A, "Z"));
    assert_eq!(engine.store().write_count(), writes);
    assert_eq!(value(&engine, A, 1, A_Z), Value::from(3.0));

    // The old definition is still live.
    set(&engine, A, 1, A_Z, 4.0);
    assert_eq!(value(&engine, A, 1, A_SUM), Value::from(8.0));
}

#[test]
fn validate_reports_the_cycle_without_installing() {
    let engine = two_tables();
    let closing = Field::formula(A_Z, A, "Z", "[Sum] + 1", ResultKind::Number);
    assert!(matches!(
        engine.validate_field_definition(&closing),
        Err(EngineError::Cycle(_))
    ));

    let harmless = Field::formula(A_Z, A, "Z", "7", ResultKind::Number);
    engine.validate_field_definition(&harmless).unwrap();
    assert_eq!(engine.field(A_Z).unwrap(), Field::plain(A_Z, A, "Z"));
}

#[test]
fn direct_self_reference_is_a_cycle() {
    let engine = shop();
    let f = Field::formula(FieldId(13), ORDERS, "Loop", "[Loop] + 1", ResultKind::Number);
    let err = engine.on_field_definition_changed(f).unwrap_err();
    let cycle = match err {
        EngineError::Cycle(cycle) => cycle,
        other => panic!("expected a cycle error, got {other}"),
    };
    assert_eq!(cycle.path, vec![FieldId(13), FieldId(13)]);
    assert!(engine.field(FieldId(13)).is_none());
}

#[test]
fn two_formula_cycle_in_one_table() {
    let engine = shop();
    let a = FieldId(13);
    let b = FieldId(14);
    define(&engine, Field::formula(a, ORDERS, "A", "[Qty] + 1", ResultKind::Number));
    define(&engine, Field::formula(b, ORDERS, "B", "[A] + 1", ResultKind::Number));

    let err = engine
        .on_field_definition_changed(Field::formula(a, ORDERS, "A", "[B] + 1", ResultKind::Number))
        .unwrap_err();
    assert!(matches!(err, EngineError::Cycle(ref c) if c.path == vec![a, b, a]));
    assert_eq!(value(&engine, ORDERS, 1, b), Value::from(4.0));
    assert!(engine.evaluation_error(ORDERS, RecordId(1), b).is_none());
}

#[test]
fn parse_error_is_a_definition_error() {
    let engine = shop();
    let err = engine
        .on_field_definition_changed(Field::formula(
            FieldId(13),
            ORDERS,
            "Bad",
            "[Qty] +",
            ResultKind::Number,
        ))
        .unwrap_err();
    assert!(matches!(err, EngineError::Parse { field: FieldId(13), .. }));
    assert!(err.is_definition_error());
}
