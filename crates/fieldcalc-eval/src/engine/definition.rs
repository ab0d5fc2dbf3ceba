//! Field definitions compiled against the current graph.
//!
//! Compilation resolves everything a definition names (formula field names,
//! relation fields, rollup/lookup targets) to ids, so evaluation never parses
//! or looks anything up by name.

use fieldcalc_common::{Aggregate, Field, FieldId, FieldKind, ResultKind, TableId};
use fieldcalc_parse::{ASTNode, FieldNames, parse};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::graph::DependencyGraph;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub enum FieldPlan {
    /// Plain and relation fields hold user data and are never evaluated.
    Stored,
    Formula {
        ast: ASTNode,
        /// Names used by `ast`, bound to the ids they resolved to at definition time.
        refs: FxHashMap<String, FieldId>,
        result: ResultKind,
    },
    Rollup {
        relation: FieldId,
        target_table: TableId,
        target: Option<FieldId>,
        aggregate: Aggregate,
    },
    Lookup {
        relation: FieldId,
        target_table: TableId,
        target: FieldId,
    },
    /// A persisted rollup or lookup whose relation or target no longer
    /// resolves. Only ever installed broken; keeps edges to the suppliers
    /// that still exist.
    Unresolved { suppliers: SmallVec<[FieldId; 2]> },
}

#[derive(Debug, Clone)]
pub struct CompiledField {
    pub field: Field,
    pub plan: FieldPlan,
}

impl CompiledField {
    pub fn id(&self) -> FieldId {
        self.field.id
    }

    pub fn table(&self) -> TableId {
        self.field.table
    }

    pub fn is_computed(&self) -> bool {
        !matches!(self.plan, FieldPlan::Stored)
    }

    /// Outgoing dependency edges, sorted and deduplicated.
    pub fn suppliers(&self) -> SmallVec<[FieldId; 4]> {
        let mut out: SmallVec<[FieldId; 4]> = match &self.plan {
            FieldPlan::Stored => SmallVec::new(),
            FieldPlan::Formula { refs, .. } => refs.values().copied().collect(),
            FieldPlan::Rollup {
                relation, target, ..
            } => std::iter::once(*relation).chain(*target).collect(),
            FieldPlan::Lookup {
                relation, target, ..
            } => SmallVec::from_slice(&[*relation, *target]),
            FieldPlan::Unresolved { suppliers } => suppliers.iter().copied().collect(),
        };
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The relation this field traverses, and the table it leads to.
    pub fn traversal(&self) -> Option<(FieldId, TableId)> {
        match &self.plan {
            FieldPlan::Rollup {
                relation,
                target_table,
                ..
            }
            | FieldPlan::Lookup {
                relation,
                target_table,
                ..
            } => Some((*relation, *target_table)),
            _ => None,
        }
    }

    /// The field read on related records, if any.
    pub fn target(&self) -> Option<FieldId> {
        match &self.plan {
            FieldPlan::Rollup { target, .. } => *target,
            FieldPlan::Lookup { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// Same-table field names visible to a formula.
struct TableNames<'a>(&'a FxHashMap<String, FieldId>);

impl FieldNames for TableNames<'_> {
    fn contains_name(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

/// Resolve a definition against the fields currently installed in `graph`.
///
/// A field may name itself; that resolves and is then rejected as a cycle
/// by the graph rather than reported as an unknown name.
pub fn compile(field: Field, graph: &DependencyGraph) -> Result<CompiledField, EngineError> {
    if let Some(existing) = graph.field(field.id)
        && existing.table() != field.table
    {
        return Err(EngineError::TableMismatch {
            field: field.id,
            expected: existing.table(),
            found: field.table,
        });
    }

    let plan = match &field.kind {
        FieldKind::Plain | FieldKind::Relation { .. } => FieldPlan::Stored,
        FieldKind::Formula { expression, result } => {
            let names = graph.name_map(&field);
            let ast = parse(expression, &TableNames(&names)).map_err(|source| {
                EngineError::Parse {
                    field: field.id,
                    source,
                }
            })?;
            let refs = ast
                .field_references()
                .into_iter()
                .filter_map(|name| names.get(name).map(|id| (name.to_string(), *id)))
                .collect();
            FieldPlan::Formula {
                ast,
                refs,
                result: *result,
            }
        }
        FieldKind::Rollup {
            relation,
            target,
            aggregate,
        } => {
            let target_table = resolve_relation(&field, *relation, graph)?;
            let target = match target {
                Some(t) => Some(resolve_target(&field, *t, target_table, graph)?),
                None if aggregate.needs_target() => {
                    return Err(EngineError::MissingTarget {
                        field: field.id,
                        aggregate: *aggregate,
                    });
                }
                None => None,
            };
            FieldPlan::Rollup {
                relation: *relation,
                target_table,
                target,
                aggregate: *aggregate,
            }
        }
        FieldKind::Lookup { relation, target } => {
            let target_table = resolve_relation(&field, *relation, graph)?;
            FieldPlan::Lookup {
                relation: *relation,
                target_table,
                target: resolve_target(&field, *target, target_table, graph)?,
            }
        }
    };

    Ok(CompiledField { field, plan })
}

/// Install-as-is form of a rollup or lookup that `compile` rejected because
/// its relation or target is gone. `None` for every other kind.
pub fn compile_unresolved(field: Field, graph: &DependencyGraph) -> Option<CompiledField> {
    let named: SmallVec<[FieldId; 2]> = match &field.kind {
        FieldKind::Rollup {
            relation, target, ..
        } => std::iter::once(*relation).chain(*target).collect(),
        FieldKind::Lookup { relation, target } => SmallVec::from_slice(&[*relation, *target]),
        _ => return None,
    };
    let suppliers = named
        .into_iter()
        .filter(|id| *id != field.id && graph.contains(*id))
        .collect();
    Some(CompiledField {
        field,
        plan: FieldPlan::Unresolved { suppliers },
    })
}

fn resolve_relation(
    field: &Field,
    relation: FieldId,
    graph: &DependencyGraph,
) -> Result<TableId, EngineError> {
    graph
        .field(relation)
        .filter(|rel| rel.table() == field.table)
        .and_then(|rel| match rel.field.kind {
            FieldKind::Relation { target_table } => Some(target_table),
            _ => None,
        })
        .ok_or(EngineError::DanglingRelation {
            field: field.id,
            relation,
            table: field.table,
        })
}

fn resolve_target(
    field: &Field,
    target: FieldId,
    target_table: TableId,
    graph: &DependencyGraph,
) -> Result<FieldId, EngineError> {
    let found = if target == field.id {
        field.table == target_table
    } else {
        graph
            .field(target)
            .is_some_and(|t| t.table() == target_table)
    };
    if found {
        Ok(target)
    } else {
        Err(EngineError::UnknownTarget {
            field: field.id,
            target,
            table: target_table,
        })
    }
}
