//! Computed-field engine: dependency graph, inverse reference index and
//! the cascading recomputation scheduler.

pub mod definition;
pub mod eval;
pub mod graph;
pub mod inverse_index;
mod locks;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use definition::{CompiledField, FieldPlan, compile};
pub use eval::{DependencyExplanation, Engine};
pub use graph::{CycleError, DependencyGraph};
pub use inverse_index::{InverseIndex, Referrer};
pub use scheduler::{CascadePhase, Trigger, ValueUpdate};

use crate::traits::RecordStore;

/// Configuration for the evaluation engine
#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub enable_parallel: bool,
    pub max_threads: Option<usize>,
    /// Minimum number of records of one field before they are evaluated on
    /// the thread pool instead of inline.
    pub parallel_threshold: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            enable_parallel: true,
            max_threads: None,
            parallel_threshold: 64,
        }
    }
}

impl EvalConfig {
    /// Inline evaluation only; no thread pool is built.
    pub fn sequential() -> Self {
        Self {
            enable_parallel: false,
            ..Self::default()
        }
    }
}

/// Construct a new engine with the given store and configuration
pub fn new_engine<S>(store: S, config: EvalConfig) -> Engine<S>
where
    S: RecordStore + 'static,
{
    Engine::new(store, config)
}
