//! Recomputation scheduler.
//!
//! A `Cascade` is the state machine behind one recomputation request:
//!
//! - **Collecting**  : seed (field, record) units from the triggering event
//! - **Ordering**    : close the seed fields over dependent edges and order them
//! - **Evaluating**  : evaluate units field by field, fanning out on change
//! - **Committed**   : one coalesced write per touched record
//! - **Rejected**    : a definition change failed validation; nothing was touched
//!
//! Values computed during a cascade live in an overlay until commit, so a
//! rollup evaluated later in the same cascade already sees its target's new
//! value.
//!
//! A cascade owns the lock of every record it evaluates from the first
//! evaluation until its commit. Locks are taken in ascending `RecordKey`
//! order; a lock that would break that order is only tried, and if it is
//! busy the cascade drops everything it holds, waits for that record, and
//! starts over from its seeds. Nothing has been written at that point.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use fieldcalc_common::{
    EvalError, FieldId, RecordId, RecordKey, TableId, UnitKey, Value,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::definition::CompiledField;
use super::graph::DependencyGraph;
use super::inverse_index::InverseIndex;
use super::locks::{RecordGuard, RecordLocks};
use crate::clock::ClockProvider;
use crate::error::EngineError;
use crate::evaluator::evaluate;
use crate::traits::{EvalContext, RecordStore, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CascadePhase {
    Collecting,
    Ordering,
    Evaluating,
    Committed,
    Rejected,
}

impl fmt::Display for CascadePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CascadePhase::Collecting => "collecting",
            CascadePhase::Ordering => "ordering",
            CascadePhase::Evaluating => "evaluating",
            CascadePhase::Committed => "committed",
            CascadePhase::Rejected => "rejected",
        })
    }
}

/// The mutation event a cascade reacts to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Trigger {
    ValueChanged,
    RelationChanged,
    DefinitionChanged,
    RecordCreated,
    RecordDeleted,
    Recompute,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::ValueChanged => "value_changed",
            Trigger::RelationChanged => "relation_changed",
            Trigger::DefinitionChanged => "definition_changed",
            Trigger::RecordCreated => "record_created",
            Trigger::RecordDeleted => "record_deleted",
            Trigger::Recompute => "recompute",
        })
    }
}

/// A (field, record) unit whose materialized value or error flag changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub table: TableId,
    pub record: RecordId,
    pub field: FieldId,
    pub value: Value,
    pub error: Option<EvalError>,
}

impl ValueUpdate {
    pub fn unit(&self) -> UnitKey {
        UnitKey {
            table: self.table,
            record: self.record,
            field: self.field,
        }
    }
}

/// Engine state a cascade reads from and commits to.
pub(crate) struct CascadeEnv<'e, S> {
    pub store: &'e S,
    pub graph: &'e DependencyGraph,
    pub index: &'e InverseIndex,
    pub locks: &'e RecordLocks,
    pub flags: &'e DashMap<UnitKey, EvalError>,
    pub clock: &'e dyn ClockProvider,
    pub pool: Option<&'e rayon::ThreadPool>,
    pub parallel_threshold: usize,
}

type Overlay = FxHashMap<RecordKey, FxHashMap<FieldId, Value>>;

/// Outcome of one unit: the value before, and the evaluation result.
type UnitOutcome = (RecordId, Value, Result<Value, EvalError>);

/// Why an evaluation pass stopped before committing.
enum Halt {
    /// Another cascade holds a record this one needs out of lock order.
    Contended(RecordKey, Arc<Mutex<()>>),
    Failed(EngineError),
}

impl From<StoreError> for Halt {
    fn from(e: StoreError) -> Self {
        Halt::Failed(e.into())
    }
}

pub(crate) struct Cascade<'e, S> {
    env: CascadeEnv<'e, S>,
    trigger: Trigger,
    phase: CascadePhase,
    pending: FxHashMap<FieldId, BTreeSet<RecordId>>,
    overlay: Overlay,
    flag_changes: FxHashMap<UnitKey, Option<EvalError>>,
    updates: Vec<ValueUpdate>,
    held: BTreeMap<RecordKey, RecordGuard>,
}

impl<'e, S: RecordStore> Cascade<'e, S> {
    pub(crate) fn new(env: CascadeEnv<'e, S>, trigger: Trigger) -> Self {
        tracing::debug!(%trigger, phase = %CascadePhase::Collecting, "cascade started");
        Self {
            env,
            trigger,
            phase: CascadePhase::Collecting,
            pending: FxHashMap::default(),
            overlay: FxHashMap::default(),
            flag_changes: FxHashMap::default(),
            updates: Vec::new(),
            held: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> CascadePhase {
        self.phase
    }

    fn transition(&mut self, next: CascadePhase) {
        tracing::debug!(trigger = %self.trigger, from = %self.phase, to = %next, "cascade phase");
        self.phase = next;
    }

    /* ─────────────── collecting ─────────────── */

    /// Schedule one unit directly. Stored and broken fields are ignored.
    pub(crate) fn seed(&mut self, unit: UnitKey) {
        let graph = self.env.graph;
        match graph.field(unit.field) {
            Some(f) if f.is_computed() && f.table() == unit.table && !graph.is_broken(unit.field) => {
                self.pending
                    .entry(unit.field)
                    .or_default()
                    .insert(unit.record);
            }
            _ => {}
        }
    }

    /// Schedule every unit that reads `unit` directly.
    ///
    /// Same-table consumers (formulas, and rollups/lookups through their own
    /// relation) recompute the same record. Rollups/lookups that target
    /// `unit.field` across a relation recompute every record that links to
    /// `unit`'s record through that relation.
    pub(crate) fn seed_dependents_of(&mut self, unit: UnitKey) {
        let graph = self.env.graph;
        let index = self.env.index;
        for consumer_id in graph.dependents_iter(unit.field) {
            let Some(consumer) = graph.field(consumer_id) else {
                continue;
            };
            if graph.is_broken(consumer_id) {
                continue;
            }
            match consumer.traversal() {
                None => {
                    if consumer.table() == unit.table {
                        self.push(consumer_id, unit.record);
                    }
                }
                Some((relation, _)) => {
                    if relation == unit.field && consumer.table() == unit.table {
                        self.push(consumer_id, unit.record);
                    }
                    if consumer.target() == Some(unit.field) {
                        for referrer in index.references_to(unit.table, unit.record) {
                            if referrer.relation == relation && referrer.table == consumer.table()
                            {
                                self.push(consumer_id, referrer.record);
                            }
                        }
                    }
                }
            }
        }
    }

    fn push(&mut self, field: FieldId, record: RecordId) {
        self.pending.entry(field).or_default().insert(record);
    }

    /* ─────────────── run ─────────────── */

    pub(crate) fn run(&mut self) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("cascade", trigger = %self.trigger).entered();
        let seeds = self.pending.clone();

        let mut attempt = 1u32;
        loop {
            self.transition(CascadePhase::Ordering);
            let order = self.order();

            self.transition(CascadePhase::Evaluating);
            match self.evaluate_in(order) {
                Ok(()) => break,
                Err(Halt::Failed(e)) => {
                    self.held.clear();
                    return Err(e);
                }
                Err(Halt::Contended(key, lock)) => {
                    tracing::debug!(%key, attempt, "record busy in another cascade; restarting");
                    self.held.clear();
                    self.overlay.clear();
                    self.flag_changes.clear();
                    self.updates.clear();
                    self.pending = seeds.clone();
                    // Holding nothing, so blocking here cannot deadlock.
                    drop(lock.lock());
                    attempt += 1;
                }
            }
        }

        let committed = self.commit();
        self.held.clear();
        committed?;
        self.transition(CascadePhase::Committed);
        tracing::debug!(updates = self.updates.len(), "cascade committed");
        Ok(std::mem::take(&mut self.updates))
    }

    fn evaluate_in(&mut self, order: Vec<FieldId>) -> Result<(), Halt> {
        for field in order {
            self.evaluate_field(field)?;
        }
        Ok(())
    }

    fn order(&self) -> Vec<FieldId> {
        let closure = self.env.graph.closure(self.pending.keys().copied());
        self.env.graph.topo_order(&closure)
    }

    /* ─────────────── evaluating ─────────────── */

    fn evaluate_field(&mut self, field: FieldId) -> Result<(), Halt> {
        let Some(records) = self.pending.remove(&field) else {
            return Ok(());
        };
        let graph = self.env.graph;
        let Some(compiled) = graph.field(field) else {
            return Ok(());
        };
        if records.is_empty() || graph.is_broken(field) || !compiled.is_computed() {
            return Ok(());
        }

        self.lock_records(compiled.table(), &records)?;
        let records: Vec<RecordId> = records.into_iter().collect();
        let outcomes = self.evaluate_records(compiled, &records)?;
        for (record, previous, outcome) in outcomes {
            self.apply(compiled, record, previous, outcome);
        }
        Ok(())
    }

    /// Take the lock of every record in `records` this cascade does not
    /// already own. Blocks only on keys above everything already held.
    fn lock_records(&mut self, table: TableId, records: &BTreeSet<RecordId>) -> Result<(), Halt> {
        for record in records {
            let key = RecordKey::new(table, *record);
            if self.held.contains_key(&key) {
                continue;
            }
            let lock = self.env.locks.lock_for(key);
            let in_order = self.held.last_key_value().is_none_or(|(top, _)| *top < key);
            let guard = if in_order {
                lock.lock_arc()
            } else {
                match lock.try_lock_arc() {
                    Some(guard) => guard,
                    None => return Err(Halt::Contended(key, lock)),
                }
            };
            self.held.insert(key, guard);
        }
        Ok(())
    }

    fn evaluate_records(
        &self,
        compiled: &CompiledField,
        records: &[RecordId],
    ) -> Result<Vec<UnitOutcome>, StoreError> {
        let results: Result<Vec<Option<UnitOutcome>>, StoreError> = match self.env.pool {
            Some(pool) if records.len() >= self.env.parallel_threshold => pool.install(|| {
                records
                    .par_iter()
                    .map(|record| self.evaluate_unit(compiled, *record))
                    .collect()
            }),
            _ => records
                .iter()
                .map(|record| self.evaluate_unit(compiled, *record))
                .collect(),
        };
        Ok(results?.into_iter().flatten().collect())
    }

    /// `None` when the record no longer exists.
    fn evaluate_unit(
        &self,
        compiled: &CompiledField,
        record: RecordId,
    ) -> Result<Option<UnitOutcome>, StoreError> {
        let key = RecordKey::new(compiled.table(), record);
        let Some(context) = UnitContext::load(&self.env, &self.overlay, compiled, key)? else {
            tracing::trace!(%key, "record vanished before evaluation");
            return Ok(None);
        };
        let previous = context.sibling(compiled.id()).cloned().unwrap_or_default();
        let outcome = evaluate(compiled, record, &context);
        Ok(Some((record, previous, outcome)))
    }

    /// Record one outcome; fan out only when the materialized value changed.
    fn apply(
        &mut self,
        compiled: &CompiledField,
        record: RecordId,
        previous: Value,
        outcome: Result<Value, EvalError>,
    ) {
        let unit = RecordKey::new(compiled.table(), record).unit(compiled.id());
        let (value, error) = match outcome {
            Ok(v) => (v, None),
            Err(e) => {
                tracing::trace!(%unit, error = %e, "evaluation error");
                (Value::Empty, Some(e))
            }
        };

        let previous_error = match self.flag_changes.get(&unit) {
            Some(pending) => pending.clone(),
            None => self.env.flags.get(&unit).map(|e| e.value().clone()),
        };
        let value_changed = previous != value;
        let error_changed = previous_error != error;
        if !value_changed && !error_changed {
            return;
        }

        if value_changed {
            self.overlay
                .entry(unit.record_key())
                .or_default()
                .insert(unit.field, value.clone());
        }
        if error_changed {
            self.flag_changes.insert(unit, error.clone());
        }
        self.updates.push(ValueUpdate {
            table: unit.table,
            record: unit.record,
            field: unit.field,
            value,
            error,
        });
        if value_changed {
            self.seed_dependents_of(unit);
        }
    }

    /* ─────────────── committing ─────────────── */

    fn commit(&mut self) -> Result<(), StoreError> {
        let mut writes: Vec<_> = std::mem::take(&mut self.overlay).into_iter().collect();
        writes.sort_unstable_by_key(|(key, _)| *key);

        for (key, values) in writes {
            debug_assert!(self.held.contains_key(&key), "{key} committed without its lock");
            match self.env.store.set_record_values(key.table, key.record, values) {
                Ok(()) => {}
                Err(StoreError::RecordNotFound { .. }) => {
                    tracing::warn!(%key, "record deleted during cascade; dropping its values");
                }
                Err(e) => {
                    tracing::error!(%key, error = %e, "commit failed");
                    return Err(e);
                }
            }
        }

        for (unit, error) in self.flag_changes.drain() {
            match error {
                Some(e) => {
                    self.env.flags.insert(unit, e);
                }
                None => {
                    self.env.flags.remove(&unit);
                }
            }
        }
        Ok(())
    }
}

/// Log a definition change that failed validation. No cascade is built
/// and no record is touched.
pub(crate) fn reject(trigger: Trigger, error: &EngineError) {
    tracing::debug!(
        %trigger,
        from = %CascadePhase::Collecting,
        to = %CascadePhase::Rejected,
        "cascade phase"
    );
    tracing::warn!(%trigger, %error, "field definition rejected");
}

/* ─────────────── evaluation context ─────────────── */

/// Everything one unit can read, loaded up front from the store with the
/// cascade overlay applied on top.
pub(crate) struct UnitContext {
    siblings: FxHashMap<FieldId, Value>,
    targets: FxHashMap<FieldId, Vec<RecordId>>,
    related: FxHashMap<UnitKey, Value>,
    today: NaiveDate,
}

impl UnitContext {
    fn load<S: RecordStore>(
        env: &CascadeEnv<'_, S>,
        overlay: &Overlay,
        compiled: &CompiledField,
        key: RecordKey,
    ) -> Result<Option<Self>, StoreError> {
        let mut siblings = match env.store.get_record_values(key.table, key.record) {
            Ok(values) => values,
            Err(StoreError::RecordNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Some(pending) = overlay.get(&key) {
            siblings.extend(pending.iter().map(|(f, v)| (*f, v.clone())));
        }

        let mut targets = FxHashMap::default();
        let mut related = FxHashMap::default();
        if let Some((relation, target_table)) = compiled.traversal() {
            let ids = env.store.list_targets(key.table, key.record, relation)?;
            if let Some(target) = compiled.target() {
                for id in &ids {
                    let target_key = RecordKey::new(target_table, *id);
                    if let Some(v) = overlay.get(&target_key).and_then(|m| m.get(&target)) {
                        related.insert(target_key.unit(target), v.clone());
                        continue;
                    }
                    match env.store.get_record_values(target_table, *id) {
                        Ok(mut values) => {
                            let v = values.remove(&target).unwrap_or_default();
                            related.insert(target_key.unit(target), v);
                        }
                        Err(StoreError::RecordNotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            targets.insert(relation, ids);
        }

        Ok(Some(Self {
            siblings,
            targets,
            related,
            today: env.clock.today(),
        }))
    }
}

impl EvalContext for UnitContext {
    fn sibling(&self, field: FieldId) -> Option<&Value> {
        self.siblings.get(&field)
    }

    fn targets(&self, relation: FieldId) -> &[RecordId] {
        self.targets.get(&relation).map_or(&[], Vec::as_slice)
    }

    fn related_value(&self, table: TableId, record: RecordId, field: FieldId) -> Option<&Value> {
        self.related.get(&UnitKey {
            table,
            record,
            field,
        })
    }

    fn today(&self) -> NaiveDate {
        self.today
    }
}
