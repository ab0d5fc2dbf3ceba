//! Stable identifiers for tables, fields and records.
//!
//! Identifiers are plain integers wrapped in newtypes so the dependency graph
//! and the inverse reference index can key adjacency lists by id instead of
//! holding references into field or record objects. All of them are `Ord`;
//! the scheduler relies on that to break topological ties deterministically.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(id: $inner) -> Self {
                Self(id)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(id: $inner) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a table.
    TableId(u32),
    "tbl"
);
id_type!(
    /// Identifier of a field. Unique across all tables.
    FieldId(u32),
    "fld"
);
id_type!(
    /// Identifier of a record. Unique within its table.
    RecordId(u64),
    "rec"
);

/// A record addressed by its owning table.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordKey {
    pub table: TableId,
    pub record: RecordId,
}

impl RecordKey {
    pub const fn new(table: TableId, record: RecordId) -> Self {
        Self { table, record }
    }

    pub const fn unit(self, field: FieldId) -> UnitKey {
        UnitKey {
            table: self.table,
            record: self.record,
            field,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.record)
    }
}

/// One recomputation unit: a single field on a single record.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnitKey {
    pub table: TableId,
    pub record: RecordId,
    pub field: FieldId,
}

impl UnitKey {
    pub const fn new(table: TableId, record: RecordId, field: FieldId) -> Self {
        Self {
            table,
            record,
            field,
        }
    }

    pub const fn record_key(self) -> RecordKey {
        RecordKey::new(self.table, self.record)
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.table, self.record, self.field)
    }
}
