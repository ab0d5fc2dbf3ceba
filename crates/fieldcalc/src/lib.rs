//! Meta crate that re-exports the fieldcalc building blocks. Downstream users
//! can depend on this crate and opt into specific layers via feature flags
//! while keeping access to the underlying crates when deeper integration is
//! required.

#[cfg(feature = "common")]
pub use fieldcalc_common as common;

#[cfg(feature = "parse")]
pub use fieldcalc_parse as parse;

#[cfg(feature = "eval")]
pub use fieldcalc_eval as eval;

#[cfg(feature = "common")]
pub use fieldcalc_common::{
    Aggregate, EvalError, EvalErrorKind, Field, FieldId, FieldKind, RecordId, ResultKind, TableId,
    Value,
};

#[cfg(feature = "parse")]
pub use fieldcalc_parse::{ASTNode, ParserError, parse};

#[cfg(feature = "eval")]
pub use fieldcalc_eval::{
    ClockProvider, CycleError, DependencyExplanation, Engine, EngineError, EvalConfig, FixedClock,
    MemoryStore, RecordStore, StoreError, ValueUpdate, new_engine,
};

#[cfg(feature = "system-clock")]
pub use fieldcalc_eval::SystemClock;
