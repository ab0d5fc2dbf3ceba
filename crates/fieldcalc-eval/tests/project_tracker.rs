use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use fieldcalc_common::{Aggregate, Field, FieldId, RecordId, ResultKind, TableId, Value};
use fieldcalc_eval::{
    ClockProvider, Engine, EngineError, EvalConfig, FixedClock, MemoryStore, RecordStore,
    StoreError,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

const PROJECTS: TableId = TableId(1);
const TASKS: TableId = TableId(2);

const P_NAME: FieldId = FieldId(1);
const P_TASKS: FieldId = FieldId(2);
const P_HOURS: FieldId = FieldId(3);
const P_SUMMARY: FieldId = FieldId(4);
const P_LATE: FieldId = FieldId(5);

const T_HOURS: FieldId = FieldId(10);
const T_DUE: FieldId = FieldId(11);
const T_LATE: FieldId = FieldId(12);
const T_DAYS_LEFT: FieldId = FieldId(13);

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn fields() -> Vec<Field> {
    vec![
        Field::plain(P_NAME, PROJECTS, "Name"),
        Field::relation(P_TASKS, PROJECTS, "Tasks", TASKS),
        Field::plain(T_HOURS, TASKS, "Hours"),
        Field::plain(T_DUE, TASKS, "Due"),
        Field::formula(T_LATE, TASKS, "Late", "[Due] < TODAY()", ResultKind::Boolean),
        Field::formula(T_DAYS_LEFT, TASKS, "Days Left", "[Due] - TODAY()", ResultKind::Number),
        Field::rollup(P_HOURS, PROJECTS, "Hours", P_TASKS, Some(T_HOURS), Aggregate::Sum),
        Field::formula(
            P_SUMMARY,
            PROJECTS,
            "Summary",
            "CONCAT([Name], \": \", [Hours], \"h\")",
            ResultKind::Text,
        ),
        Field::lookup(P_LATE, PROJECTS, "Late Flags", P_TASKS, T_LATE),
    ]
}

fn store() -> MemoryStore {
    MemoryStore::new()
        .with_record(
            PROJECTS,
            1,
            [(P_NAME, "Apollo".into()), (P_TASKS, Value::links([1, 2]))],
        )
        .with_record(
            TASKS,
            1,
            [(T_HOURS, 4.0.into()), (T_DUE, date(2025, 3, 1).into())],
        )
        .with_record(
            TASKS,
            2,
            [(T_HOURS, 6.0.into()), (T_DUE, date(2025, 3, 20).into())],
        )
}

fn tracker<S: RecordStore>(store: S) -> Engine<S> {
    let engine = Engine::with_clock(
        store,
        EvalConfig::sequential(),
        Arc::new(FixedClock(date(2025, 3, 10))),
    );
    for field in fields() {
        engine.on_field_definition_changed(field).unwrap();
    }
    engine
}

fn get(engine: &Engine<MemoryStore>, table: TableId, record: u64, field: FieldId) -> Value {
    engine.store().value(table, RecordId(record), field)
}

#[test]
fn definitions_materialize_dates_rollups_and_lookups() {
    let engine = tracker(store());

    assert_eq!(get(&engine, TASKS, 1, T_LATE), Value::from(true));
    assert_eq!(get(&engine, TASKS, 2, T_LATE), Value::from(false));
    assert_eq!(get(&engine, TASKS, 1, T_DAYS_LEFT), Value::from(-9.0));
    assert_eq!(get(&engine, TASKS, 2, T_DAYS_LEFT), Value::from(10.0));

    assert_eq!(get(&engine, PROJECTS, 1, P_HOURS), Value::from(10.0));
    assert_eq!(get(&engine, PROJECTS, 1, P_SUMMARY), Value::from("Apollo: 10h"));
    assert_eq!(
        get(&engine, PROJECTS, 1, P_LATE),
        Value::List(vec![true.into(), false.into()])
    );
}

#[test]
fn one_edit_cascades_through_rollup_and_formula() {
    let engine = tracker(store());
    engine
        .store()
        .set_value(TASKS, RecordId(2), T_HOURS, 8.0.into())
        .unwrap();
    let updates = engine
        .on_record_value_changed(TASKS, RecordId(2), &[T_HOURS])
        .unwrap();

    let fields: Vec<FieldId> = updates.iter().map(|u| u.field).collect();
    assert_eq!(fields, vec![P_HOURS, P_SUMMARY]);
    assert_eq!(updates[1].value, Value::from("Apollo: 12h"));
    assert!(updates.iter().all(|u| u.error.is_none()));
}

#[test]
fn moving_a_due_date_flows_into_the_lookup() {
    let engine = tracker(store());
    engine
        .store()
        .set_value(TASKS, RecordId(2), T_DUE, date(2025, 3, 5).into())
        .unwrap();
    engine
        .on_record_value_changed(TASKS, RecordId(2), &[T_DUE])
        .unwrap();

    assert_eq!(get(&engine, TASKS, 2, T_DAYS_LEFT), Value::from(-5.0));
    assert_eq!(
        get(&engine, PROJECTS, 1, P_LATE),
        Value::List(vec![true.into(), true.into()])
    );
}

#[test]
fn explain_dependencies_walks_both_ways() {
    let engine = tracker(store());
    let hours = engine.explain_dependencies(P_HOURS).unwrap();
    assert_eq!(hours.depends_on, vec![P_TASKS, T_HOURS]);
    assert_eq!(hours.dependents, vec![P_SUMMARY]);
}

#[test]
fn hydrated_engine_picks_up_where_the_last_one_stopped() {
    let store = Arc::new(store());
    for field in fields() {
        store.put_field(field);
    }
    let first = tracker(store.clone());
    assert_eq!(store.value(PROJECTS, RecordId(1), P_HOURS), Value::from(10.0));
    drop(first);

    let second = Engine::with_clock(
        store.clone(),
        EvalConfig::default(),
        Arc::new(FixedClock(date(2025, 3, 10))),
    );
    second.hydrate(&[PROJECTS, TASKS]).unwrap();
    assert_eq!(second.broken_fields(), Vec::<FieldId>::new());

    store
        .set_value(TASKS, RecordId(1), T_HOURS, 1.0.into())
        .unwrap();
    second
        .on_record_value_changed(TASKS, RecordId(1), &[T_HOURS])
        .unwrap();
    assert_eq!(
        store.value(PROJECTS, RecordId(1), P_SUMMARY),
        Value::from("Apollo: 7h")
    );
}

/// A wall clock the test moves forward by hand.
struct Calendar(Mutex<NaiveDate>);

impl ClockProvider for Calendar {
    fn today(&self) -> NaiveDate {
        *self.0.lock()
    }
}

#[test]
fn date_rollover_refreshes_only_what_moved() {
    let calendar = Arc::new(Calendar(Mutex::new(date(2025, 3, 10))));
    let engine = Engine::with_clock(store(), EvalConfig::sequential(), calendar.clone());
    for field in fields() {
        engine.on_field_definition_changed(field).unwrap();
    }

    assert!(engine.recompute_volatile().unwrap().is_empty());

    *calendar.0.lock() = date(2025, 3, 25);
    let updates = engine.recompute_volatile().unwrap();
    let mut moved: Vec<(FieldId, u64)> = updates.iter().map(|u| (u.field, u.record.get())).collect();
    moved.sort();
    assert_eq!(
        moved,
        vec![(P_LATE, 1), (T_LATE, 2), (T_DAYS_LEFT, 1), (T_DAYS_LEFT, 2)]
    );
    assert_eq!(get(&engine, TASKS, 2, T_DAYS_LEFT), Value::from(-5.0));
    assert_eq!(
        get(&engine, PROJECTS, 1, P_LATE),
        Value::List(vec![true.into(), true.into()])
    );
}

/// Delegates to a `MemoryStore` but can be told to fail every write.
struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl RecordStore for FlakyStore {
    fn get_field(&self, table: TableId, field: FieldId) -> Result<Field, StoreError> {
        self.inner.get_field(table, field)
    }

    fn list_fields(&self, table: TableId) -> Result<Vec<Field>, StoreError> {
        self.inner.list_fields(table)
    }

    fn get_record_values(
        &self,
        table: TableId,
        record: RecordId,
    ) -> Result<FxHashMap<FieldId, Value>, StoreError> {
        self.inner.get_record_values(table, record)
    }

    fn set_record_values(
        &self,
        table: TableId,
        record: RecordId,
        values: FxHashMap<FieldId, Value>,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.set_record_values(table, record, values)
    }

    fn list_targets(
        &self,
        table: TableId,
        record: RecordId,
        relation: FieldId,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.inner.list_targets(table, record, relation)
    }

    fn list_records(&self, table: TableId) -> Result<Vec<RecordId>, StoreError> {
        self.inner.list_records(table)
    }
}

#[test]
fn backend_failures_surface_as_storage_errors() {
    let engine = tracker(FlakyStore {
        inner: store(),
        fail_writes: AtomicBool::new(false),
    });
    engine.store().fail_writes.store(true, Ordering::SeqCst);
    engine
        .store()
        .inner
        .set_value(TASKS, RecordId(1), T_HOURS, 2.0.into())
        .unwrap();

    let err = engine
        .on_record_value_changed(TASKS, RecordId(1), &[T_HOURS])
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(StoreError::Backend(_))));
    assert!(!err.is_definition_error());
}
