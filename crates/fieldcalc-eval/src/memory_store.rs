//! crates/fieldcalc-eval/src/memory_store.rs
//! -----------------------------------------
//! In-memory `RecordStore` for embedding, unit tests and property tests.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use fieldcalc_common::{Field, FieldId, FieldKind, RecordId, RecordKey, TableId, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::traits::{RecordStore, StoreError};

type Values = FxHashMap<FieldId, Value>;

#[derive(Default)]
pub struct MemoryStore {
    fields: RwLock<BTreeMap<TableId, Vec<Field>>>,
    records: DashMap<RecordKey, Values>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /* ─────────────── constructors ─────────────── */
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(self, field: Field) -> Self {
        self.put_field(field);
        self
    }

    pub fn with_record<I>(self, table: TableId, record: u64, values: I) -> Self
    where
        I: IntoIterator<Item = (FieldId, Value)>,
    {
        self.insert_record(table, RecordId(record), values);
        self
    }

    /* ─────────────── field helpers ─────────────── */

    /// Insert a field, replacing any existing definition with the same id.
    pub fn put_field(&self, field: Field) {
        let mut fields = self.fields.write();
        for defs in fields.values_mut() {
            defs.retain(|f| f.id != field.id);
        }
        fields.entry(field.table).or_default().push(field);
    }

    /// Drop a field definition together with its stored values.
    pub fn remove_field(&self, field: FieldId) -> Option<Field> {
        let removed = {
            let mut fields = self.fields.write();
            fields.values_mut().find_map(|defs| {
                let pos = defs.iter().position(|f| f.id == field)?;
                Some(defs.remove(pos))
            })
        }?;
        for mut entry in self.records.iter_mut() {
            if entry.key().table == removed.table {
                entry.value_mut().remove(&field);
            }
        }
        Some(removed)
    }

    /* ─────────────── record helpers ─────────────── */
    pub fn insert_record<I>(&self, table: TableId, record: RecordId, values: I)
    where
        I: IntoIterator<Item = (FieldId, Value)>,
    {
        self.records
            .insert(RecordKey::new(table, record), values.into_iter().collect());
    }

    /// A user write to one field. Does not count as an engine commit.
    pub fn set_value(
        &self,
        table: TableId,
        record: RecordId,
        field: FieldId,
        value: Value,
    ) -> Result<Value, StoreError> {
        let mut values = self
            .records
            .get_mut(&RecordKey::new(table, record))
            .ok_or(StoreError::RecordNotFound { table, record })?;
        Ok(values.insert(field, value).unwrap_or_default())
    }

    /// Replace the targets of a relation field; returns the previous targets.
    pub fn set_links<I>(
        &self,
        table: TableId,
        record: RecordId,
        relation: FieldId,
        targets: I,
    ) -> Result<Vec<RecordId>, StoreError>
    where
        I: IntoIterator<Item = u64>,
    {
        let old = self.set_value(table, record, relation, Value::links(targets))?;
        Ok(old.as_links().map(<[RecordId]>::to_vec).unwrap_or_default())
    }

    /// Remove a record and strip it from every relation that targets its table.
    pub fn delete_record(&self, table: TableId, record: RecordId) -> Result<(), StoreError> {
        self.records
            .remove(&RecordKey::new(table, record))
            .ok_or(StoreError::RecordNotFound { table, record })?;

        let inbound: Vec<(TableId, FieldId)> = self
            .fields
            .read()
            .values()
            .flatten()
            .filter(|f| matches!(f.kind, FieldKind::Relation { target_table } if target_table == table))
            .map(|f| (f.table, f.id))
            .collect();

        for mut entry in self.records.iter_mut() {
            let source_table = entry.key().table;
            for &(_, relation) in inbound.iter().filter(|(t, _)| *t == source_table) {
                if let Some(Value::Links(ids)) = entry.value_mut().get_mut(&relation) {
                    ids.retain(|id| *id != record);
                }
            }
        }
        Ok(())
    }

    /// Stored value of one field, `Empty` when unset or the record is missing.
    pub fn value(&self, table: TableId, record: RecordId, field: FieldId) -> Value {
        self.records
            .get(&RecordKey::new(table, record))
            .and_then(|values| values.get(&field).cloned())
            .unwrap_or_default()
    }

    /// Number of `set_record_values` calls served so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl RecordStore for MemoryStore {
    fn get_field(&self, table: TableId, field: FieldId) -> Result<Field, StoreError> {
        self.fields
            .read()
            .get(&table)
            .and_then(|defs| defs.iter().find(|f| f.id == field).cloned())
            .ok_or(StoreError::FieldNotFound { table, field })
    }

    fn list_fields(&self, table: TableId) -> Result<Vec<Field>, StoreError> {
        let mut defs = self.fields.read().get(&table).cloned().unwrap_or_default();
        defs.sort_by_key(|f| f.id);
        Ok(defs)
    }

    fn get_record_values(&self, table: TableId, record: RecordId) -> Result<Values, StoreError> {
        self.records
            .get(&RecordKey::new(table, record))
            .map(|values| values.clone())
            .ok_or(StoreError::RecordNotFound { table, record })
    }

    fn set_record_values(
        &self,
        table: TableId,
        record: RecordId,
        values: Values,
    ) -> Result<(), StoreError> {
        let mut current = self
            .records
            .get_mut(&RecordKey::new(table, record))
            .ok_or(StoreError::RecordNotFound { table, record })?;
        current.extend(values);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn list_targets(
        &self,
        table: TableId,
        record: RecordId,
        relation: FieldId,
    ) -> Result<Vec<RecordId>, StoreError> {
        let values = self
            .records
            .get(&RecordKey::new(table, record))
            .ok_or(StoreError::RecordNotFound { table, record })?;
        Ok(values
            .get(&relation)
            .and_then(Value::as_links)
            .map(<[RecordId]>::to_vec)
            .unwrap_or_default())
    }

    fn list_records(&self, table: TableId) -> Result<Vec<RecordId>, StoreError> {
        let mut ids: Vec<RecordId> = self
            .records
            .iter()
            .filter(|entry| entry.key().table == table)
            .map(|entry| entry.key().record)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
