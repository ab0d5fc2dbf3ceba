//! Per-unit evaluation: one computed field on one record.
//!
//! Rollups and lookups read the *materialized* value of their target field
//! on each related record. Nothing is re-derived transitively here; the
//! scheduler guarantees suppliers were brought up to date first.

use fieldcalc_common::{Aggregate, EvalError, FieldId, RecordId, TableId, Value};

use crate::coercion::coerce_result;
use crate::engine::{CompiledField, FieldPlan};
use crate::interpreter::Interpreter;
use crate::traits::EvalContext;

pub fn evaluate(
    field: &CompiledField,
    record: RecordId,
    context: &dyn EvalContext,
) -> Result<Value, EvalError> {
    tracing::trace!(field = %field.id(), %record, kind = field.field.kind.name(), "evaluate");
    match &field.plan {
        FieldPlan::Stored | FieldPlan::Unresolved { .. } => Ok(context.sibling(field.id()).cloned().unwrap_or_default()),
        FieldPlan::Formula { ast, refs, result } => {
            let raw = Interpreter::new(context, refs).evaluate_ast(ast)?;
            coerce_result(raw, *result)
        }
        FieldPlan::Rollup {
            relation,
            target_table,
            target,
            aggregate,
        } => Ok(rollup(context, *relation, *target_table, *target, *aggregate)),
        FieldPlan::Lookup {
            relation,
            target_table,
            target,
        } => Ok(lookup(context, *relation, *target_table, *target)),
    }
}

fn related<'c>(
    context: &'c dyn EvalContext,
    relation: FieldId,
    table: TableId,
    target: FieldId,
) -> impl Iterator<Item = &'c Value> + 'c {
    context
        .targets(relation)
        .iter()
        .filter_map(move |record| context.related_value(table, *record, target))
}

fn rollup(
    context: &dyn EvalContext,
    relation: FieldId,
    table: TableId,
    target: Option<FieldId>,
    aggregate: Aggregate,
) -> Value {
    let target = match (aggregate, target) {
        (Aggregate::Count, _) => return Value::Number(context.targets(relation).len() as f64),
        (_, Some(target)) => target,
        // Rejected when the definition is compiled.
        (_, None) => return Value::Empty,
    };

    if aggregate == Aggregate::CountA {
        let n = related(context, relation, table, target)
            .filter(|v| !v.is_empty())
            .count();
        return Value::Number(n as f64);
    }

    let mut numbers = Vec::new();
    for v in related(context, relation, table, target) {
        collect_numbers(v, &mut numbers);
    }

    match aggregate {
        Aggregate::Sum => Value::Number(numbers.iter().sum()),
        Aggregate::Avg if numbers.is_empty() => Value::Empty,
        Aggregate::Avg => Value::Number(numbers.iter().sum::<f64>() / numbers.len() as f64),
        Aggregate::Min => numbers
            .into_iter()
            .reduce(f64::min)
            .map_or(Value::Empty, Value::Number),
        Aggregate::Max => numbers
            .into_iter()
            .reduce(f64::max)
            .map_or(Value::Empty, Value::Number),
        Aggregate::Count | Aggregate::CountA => unreachable!("handled above"),
    }
}

/// Numeric leaves of a value; a lookup target contributes its list items.
fn collect_numbers(v: &Value, out: &mut Vec<f64>) {
    match v {
        Value::Number(n) => out.push(*n),
        Value::List(items) => {
            for item in items {
                collect_numbers(item, out);
            }
        }
        _ => {}
    }
}

fn lookup(context: &dyn EvalContext, relation: FieldId, table: TableId, target: FieldId) -> Value {
    Value::List(related(context, relation, table, target).cloned().collect())
}
