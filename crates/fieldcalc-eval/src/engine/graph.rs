use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::{error::Error, fmt};

use fieldcalc_common::{Field, FieldId, TableId};
use rustc_hash::{FxHashMap, FxHashSet};

use super::definition::CompiledField;

/// Adding a definition would make a field (transitively) require itself.
///
/// `path` starts and ends with the rejected field; each step reads
/// "requires".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub path: Vec<FieldId>,
}

impl CycleError {
    pub fn field(&self) -> Option<FieldId> {
        self.path.first().copied()
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("definition would create a dependency cycle: ")?;
        for (i, id) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{id}")?;
        }
        Ok(())
    }
}

impl Error for CycleError {}

#[derive(Debug)]
struct FieldNode {
    compiled: CompiledField,
    broken: bool,
}

/// Field-level dependency graph.
///
/// Nodes live in an arena keyed by `FieldId`; edges are adjacency sets in
/// both directions so that fan-out (`dependents`) and validation
/// (`dependencies`) are both direct lookups. The edge set is acyclic at all
/// times: `add_field` refuses any definition that would close a cycle.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: FxHashMap<FieldId, FieldNode>,
    // consumer -> suppliers
    dependencies: FxHashMap<FieldId, BTreeSet<FieldId>>,
    // supplier -> consumers
    dependents: FxHashMap<FieldId, BTreeSet<FieldId>>,
    by_table: FxHashMap<TableId, BTreeSet<FieldId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn field(&self, id: FieldId) -> Option<&CompiledField> {
        self.nodes.get(&id).map(|n| &n.compiled)
    }

    /// Fields of `table` in id order.
    pub fn fields_of(&self, table: TableId) -> impl Iterator<Item = &CompiledField> + '_ {
        self.by_table
            .get(&table)
            .into_iter()
            .flatten()
            .filter_map(|id| self.field(*id))
    }

    /// Every installed field, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledField> + '_ {
        let mut ids: Vec<FieldId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(move |id| self.field(id))
    }

    /// Names a formula on `field`'s table can reference.
    ///
    /// When names collide the lowest id wins, except that the field being
    /// defined always owns its own (new) name.
    pub fn name_map(&self, field: &Field) -> FxHashMap<String, FieldId> {
        let mut names = FxHashMap::default();
        for other in self.fields_of(field.table).filter(|f| f.id() != field.id) {
            names
                .entry(other.field.name.clone())
                .or_insert(other.id());
        }
        names.insert(field.name.clone(), field.id);
        names
    }

    /* ─────────────── mutation ─────────────── */

    /// Check that installing `compiled` keeps the graph acyclic, without
    /// changing anything.
    pub fn check_field(&self, compiled: &CompiledField) -> Result<(), CycleError> {
        let id = compiled.id();
        for supplier in compiled.suppliers() {
            if supplier == id {
                return Err(CycleError { path: vec![id, id] });
            }
            if let Some(path) = self.path_between(supplier, id) {
                let mut cycle = Vec::with_capacity(path.len() + 1);
                cycle.push(id);
                cycle.extend(path);
                return Err(CycleError { path: cycle });
            }
        }
        Ok(())
    }

    /// Install or replace a field and its outgoing edges.
    ///
    /// On `CycleError` the graph is left exactly as it was. A successful
    /// (re)definition clears the field's broken flag.
    pub fn add_field(&mut self, compiled: CompiledField) -> Result<(), CycleError> {
        self.check_field(&compiled)?;

        let id = compiled.id();
        self.drop_out_edges(id);
        let suppliers = compiled.suppliers();
        for &supplier in &suppliers {
            self.dependents.entry(supplier).or_default().insert(id);
        }
        self.dependencies
            .insert(id, suppliers.into_iter().collect());
        self.by_table
            .entry(compiled.table())
            .or_default()
            .insert(id);
        self.nodes.insert(
            id,
            FieldNode {
                compiled,
                broken: false,
            },
        );
        Ok(())
    }

    /// Remove a field with all incident edges.
    ///
    /// Returns the removed definition and the fields that depended on it
    /// directly, in id order.
    pub fn remove_field(&mut self, id: FieldId) -> Option<(CompiledField, Vec<FieldId>)> {
        let node = self.nodes.remove(&id)?;
        self.drop_out_edges(id);

        let consumers: Vec<FieldId> = self
            .dependents
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for consumer in &consumers {
            if let Some(deps) = self.dependencies.get_mut(consumer) {
                deps.remove(&id);
            }
        }

        if let Some(fields) = self.by_table.get_mut(&node.compiled.table()) {
            fields.remove(&id);
            if fields.is_empty() {
                self.by_table.remove(&node.compiled.table());
            }
        }
        Some((node.compiled, consumers))
    }

    fn drop_out_edges(&mut self, id: FieldId) {
        if let Some(suppliers) = self.dependencies.remove(&id) {
            for supplier in suppliers {
                if let Some(consumers) = self.dependents.get_mut(&supplier) {
                    consumers.remove(&id);
                    if consumers.is_empty() {
                        self.dependents.remove(&supplier);
                    }
                }
            }
        }
    }

    /* ─────────────── broken state ─────────────── */

    pub fn mark_broken(&mut self, id: FieldId) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.compiled.is_computed() => {
                node.broken = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_broken(&self, id: FieldId) -> bool {
        self.nodes.get(&id).is_some_and(|n| n.broken)
    }

    pub fn broken_fields(&self) -> Vec<FieldId> {
        let mut out: Vec<FieldId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.broken)
            .map(|(id, _)| *id)
            .collect();
        out.sort_unstable();
        out
    }

    /* ─────────────── queries ─────────────── */

    /// Fields that read `id` directly, in id order.
    pub fn dependents(&self, id: FieldId) -> Vec<FieldId> {
        self.dependents_iter(id).collect()
    }

    /// Fields `id` reads directly, in id order.
    pub fn dependencies(&self, id: FieldId) -> Vec<FieldId> {
        self.dependencies
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .collect()
    }

    pub(crate) fn dependents_iter(&self, id: FieldId) -> impl Iterator<Item = FieldId> + '_ {
        self.dependents.get(&id).into_iter().flatten().copied()
    }

    /// Every field reachable from `seeds` along dependent edges, seeds
    /// included. Broken fields are frozen, so the walk neither includes
    /// them nor continues through them.
    pub fn closure<I>(&self, seeds: I) -> FxHashSet<FieldId>
    where
        I: IntoIterator<Item = FieldId>,
    {
        let mut seen = FxHashSet::default();
        let mut queue: VecDeque<FieldId> = seeds.into_iter().collect();
        while let Some(id) = queue.pop_front() {
            if self.is_broken(id) || !seen.insert(id) {
                continue;
            }
            queue.extend(self.dependents_iter(id));
        }
        seen
    }

    /// Kahn's algorithm over the subgraph induced by `ids`. Ties are broken
    /// by ascending `FieldId`, so the order is fully deterministic.
    ///
    /// # Panics
    ///
    /// If `ids` contains a cycle. `add_field` never admits one, so reaching
    /// that state means the graph invariant was bypassed.
    pub fn topo_order(&self, ids: &FxHashSet<FieldId>) -> Vec<FieldId> {
        let mut in_degree: FxHashMap<FieldId, usize> = ids
            .iter()
            .map(|&id| {
                let n = self
                    .dependencies
                    .get(&id)
                    .map_or(0, |deps| deps.iter().filter(|d| ids.contains(d)).count());
                (id, n)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<FieldId>> = in_degree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut order = Vec::with_capacity(ids.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for consumer in self.dependents_iter(id) {
                if let Some(n) = in_degree.get_mut(&consumer) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(Reverse(consumer));
                    }
                }
            }
        }

        assert_eq!(
            order.len(),
            ids.len(),
            "dependency cycle among fields {:?}: acyclicity invariant violated",
            ids.iter()
                .filter(|id| !order.contains(id))
                .collect::<BTreeSet<_>>()
        );
        order
    }

    /// A dependency path `from -> ... -> to`, if `from` requires `to`.
    fn path_between(&self, from: FieldId, to: FieldId) -> Option<Vec<FieldId>> {
        let mut parent: FxHashMap<FieldId, FieldId> = FxHashMap::default();
        let mut stack = vec![from];
        let mut visited = FxHashSet::default();
        visited.insert(from);

        while let Some(current) = stack.pop() {
            if current == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = parent.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            for &next in self.dependencies.get(&current).into_iter().flatten() {
                if visited.insert(next) {
                    parent.insert(next, current);
                    stack.push(next);
                }
            }
        }
        None
    }
}
