use std::sync::Arc;

use dashmap::DashMap;
use fieldcalc_common::{EvalError, Field, FieldId, FieldKind, RecordId, RecordKey, TableId, UnitKey};
use parking_lot::{RwLock, RwLockWriteGuard};
use rayon::ThreadPoolBuilder;
use rustc_hash::FxHashSet;

use super::definition::{CompiledField, FieldPlan, compile, compile_unresolved};
use super::graph::DependencyGraph;
use super::inverse_index::InverseIndex;
use super::locks::RecordLocks;
use super::scheduler::{Cascade, CascadeEnv, Trigger, ValueUpdate, reject};
use super::EvalConfig;
use crate::clock::{ClockProvider, default_clock};
use crate::error::EngineError;
use crate::traits::RecordStore;

/// Fields on both sides of one field's dependency edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyExplanation {
    pub depends_on: Vec<FieldId>,
    pub dependents: Vec<FieldId>,
}

/// The computed-field resolution engine.
///
/// Owns the dependency graph, the inverse reference index and the
/// evaluation flags; reads and writes record values through `S`. All
/// methods take `&self`; the graph and index sit behind read/write locks
/// (always acquired graph first, then index) and record values are
/// serialized per record.
pub struct Engine<S> {
    store: S,
    pub config: EvalConfig,
    clock: Arc<dyn ClockProvider>,
    graph: RwLock<DependencyGraph>,
    index: RwLock<InverseIndex>,
    flags: DashMap<UnitKey, EvalError>,
    locks: RecordLocks,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl<S> Engine<S>
where
    S: RecordStore,
{
    pub fn new(store: S, config: EvalConfig) -> Self {
        Self::with_clock(store, config, default_clock())
    }

    pub fn with_clock(store: S, config: EvalConfig, clock: Arc<dyn ClockProvider>) -> Self {
        // Initialize thread pool based on config
        let thread_pool = if config.enable_parallel {
            let mut builder = ThreadPoolBuilder::new();
            if let Some(max_threads) = config.max_threads {
                builder = builder.num_threads(max_threads);
            }

            match builder.build() {
                Ok(pool) => Some(Arc::new(pool)),
                Err(err) => {
                    // Fall back to sequential evaluation if thread pool creation fails
                    tracing::warn!(error = %err, "thread pool unavailable; evaluating sequentially");
                    None
                }
            }
        } else {
            None
        };

        Self {
            store,
            config,
            clock,
            graph: RwLock::new(DependencyGraph::new()),
            index: RwLock::new(InverseIndex::new()),
            flags: DashMap::new(),
            locks: RecordLocks::default(),
            thread_pool,
        }
    }

    /// Create an Engine with a custom thread pool (for shared thread pool scenarios)
    pub fn with_thread_pool(
        store: S,
        config: EvalConfig,
        clock: Arc<dyn ClockProvider>,
        thread_pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        let mut engine = Self::with_clock(
            store,
            EvalConfig {
                enable_parallel: false,
                ..config.clone()
            },
            clock,
        );
        engine.config = config;
        engine.thread_pool = Some(thread_pool);
        engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current definition of an installed field.
    pub fn field(&self, id: FieldId) -> Option<Field> {
        self.graph.read().field(id).map(|c| c.field.clone())
    }

    /* ─────────────── setup ─────────────── */

    /// Load every field of `tables` from the store and rebuild the inverse
    /// reference index from the stored relation values.
    ///
    /// Fields are installed in dependency order regardless of listing
    /// order. A rollup or lookup whose relation or target no longer exists
    /// is installed broken, exactly as `on_field_deleted` left it.
    /// Materialized values are trusted as stored; nothing is recomputed.
    pub fn hydrate(&self, tables: &[TableId]) -> Result<(), EngineError> {
        let _span = tracing::info_span!("hydrate", tables = tables.len()).entered();

        let mut pending = Vec::new();
        for table in tables {
            pending.extend(self.store.list_fields(*table)?);
        }
        pending.sort_by_key(|f| f.id);

        let mut graph = self.graph.write();
        while !pending.is_empty() {
            let mut failures = Vec::new();
            let before = pending.len();
            for field in pending {
                let installed = compile(field.clone(), &graph)
                    .and_then(|c| graph.add_field(c).map_err(EngineError::from));
                if let Err(e) = installed {
                    failures.push((field, e));
                }
            }
            if failures.len() < before {
                pending = failures.into_iter().map(|(f, _)| f).collect();
                continue;
            }

            // No progress. Rollups and lookups that point at a field which is
            // gone for good are installed broken, which may unblock the rest.
            let waiting: FxHashSet<FieldId> = failures.iter().map(|(f, _)| f.id).collect();
            let mut frozen = 0;
            let mut first_error = None;
            pending = Vec::new();
            for (field, error) in failures {
                if !unresolvable(&error, &waiting) {
                    first_error.get_or_insert(error);
                    pending.push(field);
                    continue;
                }
                let id = field.id;
                match compile_unresolved(field.clone(), &graph).map(|c| graph.add_field(c)) {
                    Some(Ok(())) => {
                        graph.mark_broken(id);
                        tracing::warn!(field = %id, %error, "installed broken");
                        frozen += 1;
                    }
                    _ => {
                        first_error.get_or_insert(error);
                        pending.push(field);
                    }
                }
            }
            if frozen == 0
                && let Some(e) = first_error
            {
                tracing::warn!(error = %e, unresolved = pending.len(), "hydrate failed");
                return Err(e);
            }
        }

        let graph = RwLockWriteGuard::downgrade(graph);
        let mut index = self.index.write();
        for table in tables {
            let relations: Vec<(FieldId, TableId)> = graph
                .fields_of(*table)
                .filter_map(|f| match f.field.kind {
                    FieldKind::Relation { target_table } => Some((f.id(), target_table)),
                    _ => None,
                })
                .collect();
            if relations.is_empty() {
                continue;
            }
            for record in self.store.list_records(*table)? {
                let key = RecordKey::new(*table, record);
                for &(relation, target_table) in &relations {
                    let targets = self.store.list_targets(*table, record, relation)?;
                    index.set_links(key, relation, target_table, &targets);
                }
            }
        }
        tracing::info!(fields = graph.len(), links = index.len(), "hydrated");
        Ok(())
    }

    /* ─────────────── field definitions ─────────────── */

    /// Check a new or edited definition without installing it.
    pub fn validate_field_definition(&self, field: &Field) -> Result<(), EngineError> {
        let graph = self.graph.read();
        let compiled = compile(field.clone(), &graph)?;
        graph.check_field(&compiled)?;
        Ok(())
    }

    /// Install a new or edited definition, recompute the field on every
    /// record of its table, and cascade.
    ///
    /// On a definition error nothing is installed and no record is touched.
    pub fn on_field_definition_changed(&self, field: Field) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("field_definition_changed", field = %field.id).entered();
        let id = field.id;
        let table = field.table;

        let mut graph = self.graph.write();
        let previous_target = graph.field(id).and_then(relation_target);
        let compiled = match compile(field, &graph)
            .and_then(|c| graph.check_field(&c).map(|_| c).map_err(EngineError::from))
        {
            Ok(c) => c,
            Err(e) => {
                reject(Trigger::DefinitionChanged, &e);
                return Err(e);
            }
        };
        let new_target = relation_target(&compiled);
        let computed = compiled.is_computed();
        graph.add_field(compiled)?;

        if previous_target.is_some() && previous_target != new_target {
            retarget_dependents(&mut graph, id, new_target)?;
        }
        if !computed {
            self.flags.retain(|unit, _| unit.field != id);
        }

        let graph = RwLockWriteGuard::downgrade(graph);
        if previous_target.is_some() || new_target.is_some() {
            let mut index = self.index.write();
            index.remove_relation_field(id);
            if let Some(target_table) = new_target {
                for record in self.store.list_records(table)? {
                    let targets = self.store.list_targets(table, record, id)?;
                    index.set_links(RecordKey::new(table, record), id, target_table, &targets);
                }
            }
        }

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::DefinitionChanged, &graph, &index);
        for record in self.store.list_records(table)? {
            let unit = RecordKey::new(table, record).unit(id);
            if computed {
                cascade.seed(unit);
            } else {
                cascade.seed_dependents_of(unit);
            }
        }
        cascade.run()
    }

    /// Remove a field. Its direct computed dependents are marked broken:
    /// their values stay as last materialized and they are no longer
    /// recomputed until redefined. Returns the newly broken fields.
    pub fn on_field_deleted(&self, field: FieldId) -> Result<Vec<FieldId>, EngineError> {
        let _span = tracing::info_span!("field_deleted", %field).entered();

        let mut graph = self.graph.write();
        let (removed, dependents) = graph
            .remove_field(field)
            .ok_or(EngineError::UnknownField(field))?;

        let broken: Vec<FieldId> = dependents
            .into_iter()
            .filter(|d| graph.mark_broken(*d))
            .collect();

        if relation_target(&removed).is_some() {
            self.index.write().remove_relation_field(field);
        }
        self.flags.retain(|unit, _| unit.field != field);

        if !broken.is_empty() {
            tracing::warn!(%field, ?broken, "dependent fields are now broken");
        }
        Ok(broken)
    }

    /* ─────────────── record events ─────────────── */

    /// Plain values of `record` changed.
    ///
    /// Relation fields listed here are re-read from the store so the
    /// inverse index stays in sync; prefer `on_relation_changed` when the
    /// old and new targets are known.
    pub fn on_record_value_changed(
        &self,
        table: TableId,
        record: RecordId,
        changed: &[FieldId],
    ) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("record_value_changed", %table, %record).entered();
        let graph = self.graph.read();
        let key = RecordKey::new(table, record);

        for id in changed {
            let f = field_on(&graph, *id, table)?;
            if let Some(target_table) = relation_target(f) {
                let targets = self.store.list_targets(table, record, *id)?;
                self.index.write().set_links(key, *id, target_table, &targets);
            }
        }

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::ValueChanged, &graph, &index);
        for id in changed {
            cascade.seed_dependents_of(key.unit(*id));
        }
        cascade.run()
    }

    /// The targets of a relation value changed from `old` to `new`.
    pub fn on_relation_changed(
        &self,
        table: TableId,
        record: RecordId,
        relation: FieldId,
        old: &[RecordId],
        new: &[RecordId],
    ) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("relation_changed", %table, %record, %relation).entered();
        let graph = self.graph.read();
        let target_table = relation_target(field_on(&graph, relation, table)?)
            .ok_or(EngineError::NotRelation(relation))?;

        self.index
            .write()
            .on_relation_changed(table, record, relation, target_table, old, new);

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::RelationChanged, &graph, &index);
        cascade.seed_dependents_of(RecordKey::new(table, record).unit(relation));
        cascade.run()
    }

    /// Index a new record's links and evaluate all of its computed fields.
    pub fn on_record_created(
        &self,
        table: TableId,
        record: RecordId,
    ) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("record_created", %table, %record).entered();
        let graph = self.graph.read();
        let key = RecordKey::new(table, record);

        {
            let mut index = self.index.write();
            for f in graph.fields_of(table) {
                if let Some(target_table) = relation_target(f) {
                    let targets = self.store.list_targets(table, record, f.id())?;
                    index.set_links(key, f.id(), target_table, &targets);
                }
            }
        }

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::RecordCreated, &graph, &index);
        for f in graph.fields_of(table) {
            cascade.seed(key.unit(f.id()));
        }
        cascade.run()
    }

    /// Forget a deleted record and recompute everything that linked to it.
    ///
    /// Records that linked to it read their targets from the store; a
    /// target id the store still lists but can no longer resolve is skipped
    /// by every aggregate except `COUNT`.
    pub fn on_record_deleted(
        &self,
        table: TableId,
        record: RecordId,
    ) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("record_deleted", %table, %record).entered();
        let graph = self.graph.read();
        let key = RecordKey::new(table, record);

        let referrers = self.index.write().remove_record(key);
        self.flags.retain(|unit, _| unit.record_key() != key);
        self.locks.forget(key);

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::RecordDeleted, &graph, &index);
        for referrer in referrers {
            cascade.seed_dependents_of(referrer.key().unit(referrer.relation));
        }
        cascade.run()
    }

    /// Re-evaluate one unit and cascade if its value changed.
    pub fn recompute_unit(
        &self,
        table: TableId,
        record: RecordId,
        field: FieldId,
    ) -> Result<Vec<ValueUpdate>, EngineError> {
        let graph = self.graph.read();
        field_on(&graph, field, table)?;

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::Recompute, &graph, &index);
        cascade.seed(RecordKey::new(table, record).unit(field));
        cascade.run()
    }

    /// Re-evaluate every formula that reads `TODAY()` on all records of its
    /// table and cascade. Call when the clock's date moves on.
    pub fn recompute_volatile(&self) -> Result<Vec<ValueUpdate>, EngineError> {
        let _span = tracing::info_span!("recompute_volatile").entered();
        let graph = self.graph.read();
        let volatile: Vec<(FieldId, TableId)> = graph
            .iter()
            .filter(|f| !graph.is_broken(f.id()))
            .filter(|f| matches!(&f.plan, FieldPlan::Formula { ast, .. } if ast.contains_volatile()))
            .map(|f| (f.id(), f.table()))
            .collect();
        tracing::debug!(fields = volatile.len(), "volatile formulas");

        let index = self.index.read();
        let mut cascade = self.cascade(Trigger::Recompute, &graph, &index);
        for (field, table) in volatile {
            for record in self.store.list_records(table)? {
                cascade.seed(RecordKey::new(table, record).unit(field));
            }
        }
        cascade.run()
    }

    /* ─────────────── diagnostics ─────────────── */

    pub fn explain_dependencies(&self, field: FieldId) -> Result<DependencyExplanation, EngineError> {
        let graph = self.graph.read();
        if !graph.contains(field) {
            return Err(EngineError::UnknownField(field));
        }
        Ok(DependencyExplanation {
            depends_on: graph.dependencies(field),
            dependents: graph.dependents(field),
        })
    }

    /// Why a unit materialized as empty, if it did so because of an error.
    pub fn evaluation_error(
        &self,
        table: TableId,
        record: RecordId,
        field: FieldId,
    ) -> Option<EvalError> {
        self.flags
            .get(&RecordKey::new(table, record).unit(field))
            .map(|e| e.value().clone())
    }

    pub fn is_broken(&self, field: FieldId) -> bool {
        self.graph.read().is_broken(field)
    }

    pub fn broken_fields(&self) -> Vec<FieldId> {
        self.graph.read().broken_fields()
    }

    /// Records with a live lock entry.
    pub fn locked_record_count(&self) -> usize {
        self.locks.len()
    }

    fn cascade<'e>(
        &'e self,
        trigger: Trigger,
        graph: &'e DependencyGraph,
        index: &'e InverseIndex,
    ) -> Cascade<'e, S> {
        Cascade::new(
            CascadeEnv {
                store: &self.store,
                graph,
                index,
                locks: &self.locks,
                flags: &self.flags,
                clock: self.clock.as_ref(),
                pool: self.thread_pool.as_deref(),
                parallel_threshold: self.config.parallel_threshold,
            },
            trigger,
        )
    }
}

fn relation_target(f: &CompiledField) -> Option<TableId> {
    match f.field.kind {
        FieldKind::Relation { target_table } => Some(target_table),
        _ => None,
    }
}

/// A definition error that no amount of further installing can fix: the
/// missing relation or target is not among the fields still `waiting`.
fn unresolvable(error: &EngineError, waiting: &FxHashSet<FieldId>) -> bool {
    match error {
        EngineError::DanglingRelation { relation, .. } => !waiting.contains(relation),
        EngineError::UnknownTarget { target, .. } => !waiting.contains(target),
        _ => false,
    }
}

fn field_on(graph: &DependencyGraph, id: FieldId, table: TableId) -> Result<&CompiledField, EngineError> {
    let f = graph.field(id).ok_or(EngineError::UnknownField(id))?;
    if f.table() != table {
        return Err(EngineError::TableMismatch {
            field: id,
            expected: f.table(),
            found: table,
        });
    }
    Ok(f)
}

/// A relation now points at `new_table`, or is no longer a relation at all
/// (`None`). Rollups and lookups whose target field does not live there are
/// broken; the rest are recompiled against the new table.
fn retarget_dependents(
    graph: &mut DependencyGraph,
    relation: FieldId,
    new_table: Option<TableId>,
) -> Result<(), EngineError> {
    for consumer in graph.dependents(relation) {
        let Some(compiled) = graph.field(consumer) else {
            continue;
        };
        if compiled.traversal().map(|(r, _)| r) != Some(relation) {
            continue;
        }
        let still_valid = new_table.is_some_and(|table| {
            compiled
                .target()
                .is_none_or(|t| graph.field(t).is_some_and(|tf| tf.table() == table))
        });
        if still_valid {
            let was_broken = graph.is_broken(consumer);
            let recompiled = compile(compiled.field.clone(), graph)?;
            graph.add_field(recompiled)?;
            if was_broken {
                graph.mark_broken(consumer);
            }
        } else if graph.mark_broken(consumer) {
            tracing::warn!(field = %consumer, %relation, "relation retargeted; field is now broken");
        }
    }
    Ok(())
}
