//! Formula expressions: the black box turning expression text into
//! `{dependencies, result type, evaluator}`.
//!
//! The engine only relies on three capabilities: the set of referenced
//! fields ([`Formula::references`]), a result type ([`Formula::result_shape`])
//! and evaluation over a field-id -> value map ([`FormulaEvaluator`]). The
//! parsed tree ([`Expr`]) is public so the SQL compiler can render it.
//!
//! # Modules
//!
//! - [`parser`]: tokenizer and recursive-descent parser
//! - [`eval`]: evaluation and result-type inference

pub mod eval;
pub mod parser;

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::id::FieldId;
use crate::value::{CellValue, ValueShape};

pub use eval::{EvalError, ShapeResolver};

/// Parse-time formula errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FormulaError {
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { offset: usize, ch: char },

    #[error("unexpected token '{found}' at offset {offset}")]
    UnexpectedToken { offset: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unterminated string literal starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("invalid field reference '{text}'")]
    InvalidFieldRef { text: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("function {function} expects {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: &'static str,
        got: usize,
    },
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

/// Binary operators, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Concat => "&",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    If,
    Round,
    Abs,
    Concatenate,
    Upper,
    Lower,
    Len,
    And,
    Or,
    Not,
    Blank,
}

impl Function {
    pub fn name(self) -> &'static str {
        match self {
            Function::If => "IF",
            Function::Round => "ROUND",
            Function::Abs => "ABS",
            Function::Concatenate => "CONCATENATE",
            Function::Upper => "UPPER",
            Function::Lower => "LOWER",
            Function::Len => "LEN",
            Function::And => "AND",
            Function::Or => "OR",
            Function::Not => "NOT",
            Function::Blank => "BLANK",
        }
    }

    pub fn from_name(name: &str) -> Option<Function> {
        let f = match name.to_ascii_uppercase().as_str() {
            "IF" => Function::If,
            "ROUND" => Function::Round,
            "ABS" => Function::Abs,
            "CONCATENATE" => Function::Concatenate,
            "UPPER" => Function::Upper,
            "LOWER" => Function::Lower,
            "LEN" => Function::Len,
            "AND" => Function::And,
            "OR" => Function::Or,
            "NOT" => Function::Not,
            "BLANK" => Function::Blank,
            _ => return None,
        };
        Some(f)
    }

    /// Checks the argument count.
    pub fn check_arity(self, got: usize) -> Result<(), FormulaError> {
        let (ok, expected) = match self {
            Function::If => ((2..=3).contains(&got), "2 or 3"),
            Function::Round => ((1..=2).contains(&got), "1 or 2"),
            Function::Abs | Function::Upper | Function::Lower | Function::Len | Function::Not => {
                (got == 1, "1")
            }
            Function::Concatenate | Function::And | Function::Or => (got >= 1, "at least 1"),
            Function::Blank => (got == 0, "0"),
        };
        if ok {
            Ok(())
        } else {
            Err(FormulaError::Arity {
                function: self.name(),
                expected,
                got,
            })
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(CellValue),
    Field(FieldId),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    fn collect_references(&self, out: &mut Vec<FieldId>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(id) => {
                if !out.contains(id) {
                    out.push(id.clone());
                }
            }
            Expr::Unary { expr, .. } => expr.collect_references(out),
            Expr::Binary { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_references(out);
                }
            }
        }
    }
}

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Formula, FormulaError> {
        let root = parser::parse(source)?;
        Ok(Formula {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Field ids referenced by the expression, in first-seen order.
    pub fn references(&self) -> Vec<FieldId> {
        let mut out = Vec::new();
        self.root.collect_references(&mut out);
        out
    }

    pub fn evaluate(&self, values: &HashMap<FieldId, CellValue>) -> Result<CellValue, EvalError> {
        eval::evaluate(&self.root, values)
    }

    pub fn result_shape(&self, resolver: &dyn ShapeResolver) -> ValueShape {
        eval::infer_shape(&self.root, resolver)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// The formula collaborator consumed by the propagation orchestrator.
pub trait FormulaEvaluator: Send + Sync {
    /// Referenced field ids, or a parse error.
    fn references(&self, expression: &str) -> Result<Vec<FieldId>, FormulaError>;

    /// Evaluates `expression` against `values`.
    fn evaluate(
        &self,
        expression: &str,
        values: &HashMap<FieldId, CellValue>,
    ) -> Result<CellValue, EvalError>;
}

/// Default evaluator backed by [`Formula`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinEvaluator;

impl FormulaEvaluator for BuiltinEvaluator {
    fn references(&self, expression: &str) -> Result<Vec<FieldId>, FormulaError> {
        Ok(Formula::parse(expression)?.references())
    }

    fn evaluate(
        &self,
        expression: &str,
        values: &HashMap<FieldId, CellValue>,
    ) -> Result<CellValue, EvalError> {
        let formula = Formula::parse(expression).map_err(EvalError::Parse)?;
        formula.evaluate(values)
    }
}
