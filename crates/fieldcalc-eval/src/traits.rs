//! fieldcalc-eval – collaborator traits
//!
//! `RecordStore` is what the engine consumes from the host's persistence
//! layer. `EvalContext` is the read-only view the evaluator gets of one
//! record and its related records; the scheduler builds it from the store
//! plus any values materialized earlier in the same cascade.

use chrono::NaiveDate;
use fieldcalc_common::{Field, FieldId, RecordId, TableId, Value};
use rustc_hash::FxHashMap;
use thiserror::Error;

/* ───────────────────────────── Storage ───────────────────────────── */

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record {record} not found in {table}")]
    RecordNotFound { table: TableId, record: RecordId },
    #[error("field {field} not found in {table}")]
    FieldNotFound { table: TableId, field: FieldId },
    #[error("table {0} not found")]
    TableNotFound(TableId),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Persistent storage of tables, fields and records.
///
/// Implementations must be shareable across the evaluation thread pool.
/// `set_record_values` merges: fields absent from `values` keep their
/// current value.
pub trait RecordStore: Send + Sync {
    fn get_field(&self, table: TableId, field: FieldId) -> Result<Field, StoreError>;

    fn list_fields(&self, table: TableId) -> Result<Vec<Field>, StoreError>;

    fn get_record_values(
        &self,
        table: TableId,
        record: RecordId,
    ) -> Result<FxHashMap<FieldId, Value>, StoreError>;

    fn set_record_values(
        &self,
        table: TableId,
        record: RecordId,
        values: FxHashMap<FieldId, Value>,
    ) -> Result<(), StoreError>;

    /// Targets of `relation` on `record`, in the relation's stored order.
    fn list_targets(
        &self,
        table: TableId,
        record: RecordId,
        relation: FieldId,
    ) -> Result<Vec<RecordId>, StoreError>;

    fn list_records(&self, table: TableId) -> Result<Vec<RecordId>, StoreError>;
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    fn get_field(&self, table: TableId, field: FieldId) -> Result<Field, StoreError> {
        (**self).get_field(table, field)
    }
    fn list_fields(&self, table: TableId) -> Result<Vec<Field>, StoreError> {
        (**self).list_fields(table)
    }
    fn get_record_values(
        &self,
        table: TableId,
        record: RecordId,
    ) -> Result<FxHashMap<FieldId, Value>, StoreError> {
        (**self).get_record_values(table, record)
    }
    fn set_record_values(
        &self,
        table: TableId,
        record: RecordId,
        values: FxHashMap<FieldId, Value>,
    ) -> Result<(), StoreError> {
        (**self).set_record_values(table, record, values)
    }
    fn list_targets(
        &self,
        table: TableId,
        record: RecordId,
        relation: FieldId,
    ) -> Result<Vec<RecordId>, StoreError> {
        (**self).list_targets(table, record, relation)
    }
    fn list_records(&self, table: TableId) -> Result<Vec<RecordId>, StoreError> {
        (**self).list_records(table)
    }
}

/* ───────────────────────────── Evaluation ───────────────────────────── */

/// Read access for evaluating one (field, record) unit.
///
/// All lookups are infallible: the context is populated before evaluation,
/// so storage failures surface while building it, not in the middle of an
/// expression.
pub trait EvalContext {
    /// Current value of a sibling field on the record being evaluated.
    fn sibling(&self, field: FieldId) -> Option<&Value>;

    /// Targets of `relation` on the record being evaluated, in relation order.
    fn targets(&self, relation: FieldId) -> &[RecordId];

    /// Materialized value of `field` on a related record. `None` when the
    /// related record no longer exists.
    fn related_value(&self, table: TableId, record: RecordId, field: FieldId) -> Option<&Value>;

    /// Date returned by `TODAY()`.
    fn today(&self) -> NaiveDate;
}
