//! Formula evaluation and result-type inference.
//!
//! Null propagates through arithmetic the same way it does in SQL, so the
//! evaluated value of a formula matches the value its compiled SQL produces.
//! Division and modulo by zero are typed errors; the propagation
//! orchestrator maps every [`EvalError`] to a null cell.

use std::collections::HashMap;

use thiserror::Error;

use crate::id::FieldId;
use crate::value::{CellValue, CellValueType, ValueShape};

use super::{BinaryOp, Expr, FormulaError, Function, UnaryOp};

/// Evaluation-time errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("divide by zero")]
    DivideByZero,

    #[error("modulo by zero")]
    ModuloByZero,

    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: &'static str, got: String },

    #[error("formula does not parse: {0}")]
    Parse(FormulaError),
}

/// Supplies the value shape of referenced fields during type inference.
pub trait ShapeResolver {
    fn shape_of(&self, field: &FieldId) -> Option<ValueShape>;
}

impl ShapeResolver for HashMap<FieldId, ValueShape> {
    fn shape_of(&self, field: &FieldId) -> Option<ValueShape> {
        self.get(field).copied()
    }
}

fn number(value: &CellValue) -> Result<Option<f64>, EvalError> {
    match value {
        CellValue::Null => Ok(None),
        CellValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| EvalError::TypeMismatch {
                expected: "number",
                got: format!("text '{s}'"),
            }),
        CellValue::List(items) if items.is_empty() => Ok(None),
        other => other.as_number().map(Some).ok_or_else(|| EvalError::TypeMismatch {
            expected: "number",
            got: format!("{other:?}"),
        }),
    }
}

fn compare(op: BinaryOp, left: &CellValue, right: &CellValue) -> CellValue {
    if left.is_null() || right.is_null() {
        return match op {
            BinaryOp::Eq => CellValue::Bool(left.is_null() && right.is_null()),
            BinaryOp::NotEq => CellValue::Bool(left.is_null() != right.is_null()),
            _ => CellValue::Null,
        };
    }
    let ordering = match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(left.display_string().cmp(&right.display_string())),
    };
    let Some(ordering) = ordering else {
        return CellValue::Null;
    };
    let result = match op {
        BinaryOp::Eq => ordering.is_eq(),
        BinaryOp::NotEq => !ordering.is_eq(),
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::LtEq => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::GtEq => ordering.is_ge(),
        _ => return CellValue::Null,
    };
    CellValue::Bool(result)
}

fn arithmetic(op: BinaryOp, left: &CellValue, right: &CellValue) -> Result<CellValue, EvalError> {
    let (Some(a), Some(b)) = (number(left)?, number(right)?) else {
        return Ok(CellValue::Null);
    };
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivideByZero);
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::ModuloByZero);
            }
            a % b
        }
        _ => return Ok(CellValue::Null),
    };
    Ok(CellValue::Number(value))
}

fn round(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

fn call(
    function: Function,
    args: &[Expr],
    values: &HashMap<FieldId, CellValue>,
) -> Result<CellValue, EvalError> {
    match function {
        Function::If => {
            let cond = evaluate(&args[0], values)?;
            if cond.is_truthy() {
                evaluate(&args[1], values)
            } else {
                match args.get(2) {
                    Some(other) => evaluate(other, values),
                    None => Ok(CellValue::Null),
                }
            }
        }
        Function::Round => {
            let Some(value) = number(&evaluate(&args[0], values)?)? else {
                return Ok(CellValue::Null);
            };
            let digits = match args.get(1) {
                Some(arg) => number(&evaluate(arg, values)?)?.unwrap_or(0.0) as i32,
                None => 0,
            };
            Ok(CellValue::Number(round(value, digits)))
        }
        Function::Abs => Ok(number(&evaluate(&args[0], values)?)?
            .map(|n| CellValue::Number(n.abs()))
            .unwrap_or(CellValue::Null)),
        Function::Concatenate => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&evaluate(arg, values)?.display_string());
            }
            Ok(CellValue::Text(out))
        }
        Function::Upper | Function::Lower | Function::Len => {
            let value = evaluate(&args[0], values)?;
            if value.is_null() {
                return Ok(CellValue::Null);
            }
            let text = value.display_string();
            Ok(match function {
                Function::Upper => CellValue::Text(text.to_uppercase()),
                Function::Lower => CellValue::Text(text.to_lowercase()),
                _ => CellValue::Number(text.chars().count() as f64),
            })
        }
        Function::And => {
            for arg in args {
                if !evaluate(arg, values)?.is_truthy() {
                    return Ok(CellValue::Bool(false));
                }
            }
            Ok(CellValue::Bool(true))
        }
        Function::Or => {
            for arg in args {
                if evaluate(arg, values)?.is_truthy() {
                    return Ok(CellValue::Bool(true));
                }
            }
            Ok(CellValue::Bool(false))
        }
        Function::Not => Ok(CellValue::Bool(!evaluate(&args[0], values)?.is_truthy())),
        Function::Blank => Ok(CellValue::Null),
    }
}

/// Evaluates an expression; missing field values read as null.
pub fn evaluate(expr: &Expr, values: &HashMap<FieldId, CellValue>) -> Result<CellValue, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(id) => Ok(values.get(id).cloned().unwrap_or_default()),
        Expr::Unary { op: UnaryOp::Neg, expr } => Ok(number(&evaluate(expr, values)?)?
            .map(|n| CellValue::Number(-n))
            .unwrap_or(CellValue::Null)),
        Expr::Binary { op, left, right } => {
            let l = evaluate(left, values)?;
            let r = evaluate(right, values)?;
            match op {
                BinaryOp::Concat => Ok(CellValue::Text(format!(
                    "{}{}",
                    l.display_string(),
                    r.display_string()
                ))),
                op if op.is_comparison() => Ok(compare(*op, &l, &r)),
                op => arithmetic(*op, &l, &r),
            }
        }
        Expr::Call { function, args } => call(*function, args, values),
    }
}

/// Infers the shape of an expression's result.
pub fn infer_shape(expr: &Expr, resolver: &dyn ShapeResolver) -> ValueShape {
    use CellValueType as T;
    match expr {
        Expr::Literal(CellValue::Number(_)) => ValueShape::scalar(T::Number),
        Expr::Literal(CellValue::Bool(_)) => ValueShape::scalar(T::Boolean),
        Expr::Literal(_) => ValueShape::scalar(T::String),
        Expr::Field(id) => resolver
            .shape_of(id)
            .unwrap_or(ValueShape::scalar(T::String)),
        Expr::Unary { .. } => ValueShape::scalar(T::Number),
        Expr::Binary { op, .. } if op.is_comparison() => ValueShape::scalar(T::Boolean),
        Expr::Binary {
            op: BinaryOp::Concat,
            ..
        } => ValueShape::scalar(T::String),
        Expr::Binary { .. } => ValueShape::scalar(T::Number),
        Expr::Call { function, args } => match function {
            Function::If => {
                let then = infer_shape(&args[1], resolver);
                match (&args[1], args.get(2)) {
                    (
                        Expr::Call {
                            function: Function::Blank,
                            ..
                        },
                        Some(other),
                    ) => infer_shape(other, resolver),
                    _ => then,
                }
            }
            Function::Round | Function::Abs | Function::Len => ValueShape::scalar(T::Number),
            Function::Concatenate | Function::Upper | Function::Lower | Function::Blank => {
                ValueShape::scalar(T::String)
            }
            Function::And | Function::Or | Function::Not => ValueShape::scalar(T::Boolean),
        },
    }
}
