use std::fmt;

use crate::{FieldId, ResultKind, TableId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Aggregation applied by a rollup field.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Aggregate {
    Count,
    CountA,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    /// `COUNT` only looks at the size of the target set.
    pub fn needs_target(self) -> bool {
        !matches!(self, Aggregate::Count)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "COUNT" => Some(Aggregate::Count),
            "COUNTA" => Some(Aggregate::CountA),
            "SUM" => Some(Aggregate::Sum),
            "AVG" | "AVERAGE" => Some(Aggregate::Avg),
            "MIN" => Some(Aggregate::Min),
            "MAX" => Some(Aggregate::Max),
            _ => None,
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Aggregate::Count => "COUNT",
            Aggregate::CountA => "COUNTA",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        })
    }
}

/// Kind-specific configuration of a field.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// User-supplied value.
    Plain,
    /// Links to zero or more records of `target_table`.
    Relation { target_table: TableId },
    /// Expression over sibling fields, coerced to `result`.
    Formula {
        expression: String,
        result: ResultKind,
    },
    /// Aggregates `target` across the records linked through `relation`.
    /// `target` may be absent only for `COUNT`.
    Rollup {
        relation: FieldId,
        target: Option<FieldId>,
        aggregate: Aggregate,
    },
    /// Copies `target` from every record linked through `relation`.
    Lookup { relation: FieldId, target: FieldId },
}

impl FieldKind {
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Plain => "plain",
            FieldKind::Relation { .. } => "relation",
            FieldKind::Formula { .. } => "formula",
            FieldKind::Rollup { .. } => "rollup",
            FieldKind::Lookup { .. } => "lookup",
        }
    }

    /// Formula, rollup and lookup values are only ever written by the engine.
    pub fn is_computed(&self) -> bool {
        matches!(
            self,
            FieldKind::Formula { .. } | FieldKind::Rollup { .. } | FieldKind::Lookup { .. }
        )
    }

    /// The relation field a rollup or lookup traverses.
    pub fn relation(&self) -> Option<FieldId> {
        match self {
            FieldKind::Rollup { relation, .. } | FieldKind::Lookup { relation, .. } => {
                Some(*relation)
            }
            _ => None,
        }
    }

    /// The field read on the related records, if any.
    pub fn target(&self) -> Option<FieldId> {
        match self {
            FieldKind::Rollup { target, .. } => *target,
            FieldKind::Lookup { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// A field definition.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: FieldId,
    pub table: TableId,
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new<S: Into<String>>(id: FieldId, table: TableId, name: S, kind: FieldKind) -> Self {
        Self {
            id,
            table,
            name: name.into(),
            kind,
        }
    }

    pub fn plain<S: Into<String>>(id: FieldId, table: TableId, name: S) -> Self {
        Self::new(id, table, name, FieldKind::Plain)
    }

    pub fn relation<S: Into<String>>(
        id: FieldId,
        table: TableId,
        name: S,
        target_table: TableId,
    ) -> Self {
        Self::new(id, table, name, FieldKind::Relation { target_table })
    }

    pub fn formula<S: Into<String>, E: Into<String>>(
        id: FieldId,
        table: TableId,
        name: S,
        expression: E,
        result: ResultKind,
    ) -> Self {
        Self::new(
            id,
            table,
            name,
            FieldKind::Formula {
                expression: expression.into(),
                result,
            },
        )
    }

    pub fn rollup<S: Into<String>>(
        id: FieldId,
        table: TableId,
        name: S,
        relation: FieldId,
        target: Option<FieldId>,
        aggregate: Aggregate,
    ) -> Self {
        Self::new(
            id,
            table,
            name,
            FieldKind::Rollup {
                relation,
                target,
                aggregate,
            },
        )
    }

    pub fn lookup<S: Into<String>>(
        id: FieldId,
        table: TableId,
        name: S,
        relation: FieldId,
        target: FieldId,
    ) -> Self {
        Self::new(id, table, name, FieldKind::Lookup { relation, target })
    }

    pub fn is_computed(&self) -> bool {
        self.kind.is_computed()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} ({} on {})",
            self.id,
            self.name,
            self.kind.name(),
            self.table
        )
    }
}
