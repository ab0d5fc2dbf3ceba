use std::cmp::Ordering;

use chrono::{Duration, NaiveDate};
use fieldcalc_common::{EvalError, EvalErrorKind, FieldId, Value};
use fieldcalc_parse::{ASTNode, ASTNodeType, BinaryOp, Builtin, UnaryOp};
use rustc_hash::FxHashMap;

use crate::coercion::{sanitize_numeric, to_bool, to_number, to_text};
use crate::traits::EvalContext;

/// Tree-walking evaluator for one formula on one record.
pub struct Interpreter<'a> {
    pub context: &'a dyn EvalContext,
    refs: &'a FxHashMap<String, FieldId>,
}

impl<'a> Interpreter<'a> {
    pub fn new(context: &'a dyn EvalContext, refs: &'a FxHashMap<String, FieldId>) -> Self {
        Self { context, refs }
    }

    /* ===================  public  =================== */
    pub fn evaluate_ast(&self, node: &ASTNode) -> Result<Value, EvalError> {
        match &node.node_type {
            ASTNodeType::Literal(v) => Ok(v.clone()),
            ASTNodeType::FieldRef(name) => Ok(self.resolve_field(name)),
            ASTNodeType::UnaryOp { op, expr } => self.eval_unary(*op, expr),
            ASTNodeType::BinaryOp { op, left, right } => self.eval_binary(*op, left, right),
            ASTNodeType::Function { func, args } => self.eval_function(*func, args),
        }
    }

    fn resolve_field(&self, name: &str) -> Value {
        self.refs
            .get(name)
            .and_then(|id| self.context.sibling(*id))
            .cloned()
            .unwrap_or_default()
    }

    /* ===================  operators  =================== */
    fn eval_unary(&self, op: UnaryOp, expr: &ASTNode) -> Result<Value, EvalError> {
        let v = self.evaluate_ast(expr)?;
        let n = to_number(&v)?;
        match op {
            UnaryOp::Neg => Ok(Value::Number(-n)),
            UnaryOp::Plus => Ok(Value::Number(n)),
        }
    }

    fn eval_binary(
        &self,
        op: BinaryOp,
        left: &ASTNode,
        right: &ASTNode,
    ) -> Result<Value, EvalError> {
        let l = self.evaluate_ast(left)?;
        let r = self.evaluate_ast(right)?;

        if op.is_comparison() {
            return self.compare(op, &l, &r);
        }

        match op {
            BinaryOp::Add => self.add(l, r),
            BinaryOp::Sub => self.subtract(l, r),
            BinaryOp::Mul => self.numeric_binary(&l, &r, |a, b| a * b),
            BinaryOp::Div => self.divide(&l, &r),
            BinaryOp::Concat => Ok(Value::Text(format!("{}{}", to_text(&l), to_text(&r)))),
            _ => unreachable!("comparisons handled above"),
        }
    }

    fn add(&self, l: Value, r: Value) -> Result<Value, EvalError> {
        match (&l, &r) {
            (Value::Date(d), other) | (other, Value::Date(d))
                if !matches!(other, Value::Date(_)) =>
            {
                shift_date(*d, to_number(other)?)
            }
            (Value::Date(_), Value::Date(_)) => Err(EvalError::new(EvalErrorKind::Value)
                .with_message("cannot add two dates")),
            _ => self.numeric_binary(&l, &r, |a, b| a + b),
        }
    }

    fn subtract(&self, l: Value, r: Value) -> Result<Value, EvalError> {
        match (&l, &r) {
            (Value::Date(a), Value::Date(b)) => {
                Ok(Value::Number((*a - *b).num_days() as f64))
            }
            (Value::Date(d), other) => shift_date(*d, -to_number(other)?),
            (_, Value::Date(_)) => Err(EvalError::new(EvalErrorKind::Value)
                .with_message("cannot subtract a date from a number")),
            _ => self.numeric_binary(&l, &r, |a, b| a - b),
        }
    }

    fn numeric_binary<F>(&self, l: &Value, r: &Value, f: F) -> Result<Value, EvalError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let a = to_number(l)?;
        let b = to_number(r)?;
        sanitize_numeric(f(a, b)).map(Value::Number)
    }

    fn divide(&self, l: &Value, r: &Value) -> Result<Value, EvalError> {
        let a = to_number(l)?;
        let b = to_number(r)?;
        if b == 0.0 {
            return Err(EvalError::new(EvalErrorKind::Div));
        }
        sanitize_numeric(a / b).map(Value::Number)
    }

    /* ===================  function calls  =================== */
    fn eval_function(&self, func: Builtin, args: &[ASTNode]) -> Result<Value, EvalError> {
        match func {
            Builtin::If => {
                // Lazy: only the selected branch is evaluated.
                let cond = self.evaluate_ast(&args[0])?;
                if to_bool(&cond)? {
                    self.evaluate_ast(&args[1])
                } else if let Some(otherwise) = args.get(2) {
                    self.evaluate_ast(otherwise)
                } else {
                    Ok(Value::Empty)
                }
            }
            Builtin::Concat => {
                let mut out = String::new();
                for arg in args {
                    out.push_str(&to_text(&self.evaluate_ast(arg)?));
                }
                Ok(Value::Text(out))
            }
            Builtin::Upper => Ok(Value::Text(
                to_text(&self.evaluate_ast(&args[0])?).to_uppercase(),
            )),
            Builtin::Lower => Ok(Value::Text(
                to_text(&self.evaluate_ast(&args[0])?).to_lowercase(),
            )),
            Builtin::And => {
                let mut all = true;
                for arg in args {
                    all &= to_bool(&self.evaluate_ast(arg)?)?;
                }
                Ok(Value::Boolean(all))
            }
            Builtin::Or => {
                let mut any = false;
                for arg in args {
                    any |= to_bool(&self.evaluate_ast(arg)?)?;
                }
                Ok(Value::Boolean(any))
            }
            Builtin::Sum => {
                let mut total = 0.0;
                for arg in args {
                    total += self.sum_operand(&self.evaluate_ast(arg)?)?;
                }
                sanitize_numeric(total).map(Value::Number)
            }
            Builtin::Today => Ok(Value::Date(self.context.today())),
        }
    }

    /// Scalars must coerce; list items (lookup values) that are not
    /// numbers are skipped, as a rollup would.
    fn sum_operand(&self, v: &Value) -> Result<f64, EvalError> {
        match v {
            Value::List(items) => Ok(items.iter().map(numeric_items).sum()),
            other => to_number(other),
        }
    }

    /* ===================  comparison  =================== */
    fn compare(&self, op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
        let ord = match (l, r) {
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => cmp_text(a, b),
            (Value::Links(_) | Value::List(_), _) | (_, Value::Links(_) | Value::List(_)) => {
                return Err(EvalError::new(EvalErrorKind::Value)
                    .with_message("lists cannot be compared"));
            }
            (a, b) => match (to_number(a), to_number(b)) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => cmp_text(&to_text(a), &to_text(b)),
            },
        };
        let res = match op {
            BinaryOp::Eq => ord == Ordering::Equal,
            BinaryOp::Ne => ord != Ordering::Equal,
            BinaryOp::Lt => ord == Ordering::Less,
            BinaryOp::Le => ord != Ordering::Greater,
            BinaryOp::Gt => ord == Ordering::Greater,
            BinaryOp::Ge => ord != Ordering::Less,
            _ => unreachable!("not a comparison: {op:?}"),
        };
        Ok(Value::Boolean(res))
    }
}

fn cmp_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

fn shift_date(d: NaiveDate, days: f64) -> Result<Value, EvalError> {
    let days = sanitize_numeric(days)?.trunc() as i64;
    Duration::try_days(days)
        .and_then(|delta| d.checked_add_signed(delta))
        .map(Value::Date)
        .ok_or_else(|| EvalError::new(EvalErrorKind::Num).with_message("date out of range"))
}

/// Numeric contribution of one lookup item; nested lists are flattened.
fn numeric_items(v: &Value) -> f64 {
    match v {
        Value::Number(n) => *n,
        Value::List(items) => items.iter().map(numeric_items).sum(),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldcalc_common::{RecordId, TableId};
    use fieldcalc_parse::parse;

    struct Siblings {
        values: FxHashMap<FieldId, Value>,
    }

    impl EvalContext for Siblings {
        fn sibling(&self, field: FieldId) -> Option<&Value> {
            self.values.get(&field)
        }
        fn targets(&self, _: FieldId) -> &[RecordId] {
            &[]
        }
        fn related_value(&self, _: TableId, _: RecordId, _: FieldId) -> Option<&Value> {
            None
        }
        fn today(&self) -> NaiveDate {
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        }
    }

    fn eval(expr: &str, values: &[(&str, Value)]) -> Result<Value, EvalError> {
        let mut refs = FxHashMap::default();
        let mut ctx = Siblings {
            values: FxHashMap::default(),
        };
        for (i, (name, v)) in values.iter().enumerate() {
            refs.insert(name.to_string(), FieldId(i as u32));
            ctx.values.insert(FieldId(i as u32), v.clone());
        }
        let names: Vec<String> = refs.keys().cloned().collect();
        let ast = parse(expr, &names).expect("parses");
        Interpreter::new(&ctx, &refs).evaluate_ast(&ast)
    }

    #[test]
    fn arithmetic_with_empty_operands() {
        assert_eq!(
            eval("[A] + [B] * 2", &[("A", Value::Empty), ("B", 3.0.into())]).unwrap(),
            Value::from(6.0)
        );
    }

    #[test]
    fn division_by_zero() {
        let err = eval("1 / [A]", &[("A", Value::Empty)]).unwrap_err();
        assert_eq!(err, EvalErrorKind::Div);
    }

    #[test]
    fn non_numeric_text_in_arithmetic() {
        let err = eval("[A] * 2", &[("A", "abc".into())]).unwrap_err();
        assert_eq!(err, EvalErrorKind::Value);
        assert_eq!(eval("[A] * 2", &[("A", "21".into())]).unwrap(), Value::from(42.0));
    }

    #[test]
    fn if_is_lazy_and_empty_is_false() {
        assert_eq!(
            eval("IF([A], 1 / 0, \"no\")", &[("A", Value::Empty)]).unwrap(),
            Value::from("no")
        );
        assert_eq!(eval("IF(FALSE, 1)", &[]).unwrap(), Value::Empty);
    }

    #[test]
    fn text_functions() {
        assert_eq!(
            eval(
                "CONCAT(UPPER([N]), \"-\", LOWER(\"AbC\"), [M])",
                &[("N", "widget".into()), ("M", Value::Empty)]
            )
            .unwrap(),
            Value::from("WIDGET-abc")
        );
        assert_eq!(eval("1 & 2.5", &[]).unwrap(), Value::from("12.5"));
    }

    #[test]
    fn logical_functions() {
        assert_eq!(eval("AND(TRUE, 1, \"true\")", &[]).unwrap(), Value::from(true));
        assert_eq!(eval("OR(FALSE, 0, [A])", &[("A", Value::Empty)]).unwrap(), Value::from(false));
    }

    #[test]
    fn sum_flattens_lookup_lists() {
        let list = Value::List(vec![1.0.into(), Value::Empty, "x".into(), 2.0.into()]);
        assert_eq!(
            eval("SUM([L], 10)", &[("L", list)]).unwrap(),
            Value::from(13.0)
        );
    }

    #[test]
    fn comparisons() {
        assert_eq!(eval("\"abc\" = \"ABC\"", &[]).unwrap(), Value::from(true));
        assert_eq!(eval("\"10\" > 9", &[]).unwrap(), Value::from(true));
        assert_eq!(eval("[A] = 0", &[("A", Value::Empty)]).unwrap(), Value::from(true));
        assert_eq!(eval("\"b\" <= \"a\"", &[]).unwrap(), Value::from(false));
    }

    #[test]
    fn date_arithmetic() {
        let d = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        assert_eq!(
            eval("[D] + 7", &[("D", d.into())]).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2025, 1, 17).unwrap())
        );
        assert_eq!(eval("TODAY() - [D]", &[("D", d.into())]).unwrap(), Value::from(5.0));
        assert_eq!(
            eval("[D] - 10", &[("D", d.into())]).unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
        );
    }
}
