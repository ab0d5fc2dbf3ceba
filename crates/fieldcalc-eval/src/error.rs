use fieldcalc_common::{Aggregate, FieldId, TableId};
use fieldcalc_parse::ParserError;
use thiserror::Error;

use crate::engine::CycleError;
use crate::traits::StoreError;

/// Failures surfaced synchronously by the engine API.
///
/// Every definition error is reported before the dependency graph or any
/// record is touched. Evaluation errors are not represented here; they are
/// carried on `ValueUpdate::error` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("formula of {field} does not parse: {source}")]
    Parse {
        field: FieldId,
        #[source]
        source: ParserError,
    },

    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// A rollup or lookup names something that is not a relation field of its own table.
    #[error("{field} traverses {relation}, which is not a relation field of {table}")]
    DanglingRelation {
        field: FieldId,
        relation: FieldId,
        table: TableId,
    },

    #[error("{field} reads {target}, which is not a field of {table}")]
    UnknownTarget {
        field: FieldId,
        target: FieldId,
        table: TableId,
    },

    #[error("{field} aggregates with {aggregate} but has no target field")]
    MissingTarget { field: FieldId, aggregate: Aggregate },

    #[error("unknown field {0}")]
    UnknownField(FieldId),

    #[error("{0} is not a relation field")]
    NotRelation(FieldId),

    #[error("{field} belongs to {expected}, not {found}")]
    TableMismatch {
        field: FieldId,
        expected: TableId,
        found: TableId,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// Definition errors are the ones a field editor should show next to the field.
    pub fn is_definition_error(&self) -> bool {
        !matches!(self, EngineError::Storage(_) | EngineError::UnknownField(_))
    }
}
