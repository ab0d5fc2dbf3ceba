pub mod clock;
pub mod coercion;
pub mod error;
pub mod evaluator;
pub mod interpreter;
pub mod memory_store;
pub mod traits;

pub mod engine;

pub use clock::{ClockProvider, FixedClock, TimeZoneSpec};
#[cfg(feature = "system-clock")]
pub use clock::SystemClock;
pub use engine::{
    CascadePhase, CycleError, DependencyExplanation, Engine, EvalConfig, ValueUpdate, new_engine,
};
pub use error::EngineError;
pub use memory_store::MemoryStore;
pub use traits::{EvalContext, RecordStore, StoreError};
