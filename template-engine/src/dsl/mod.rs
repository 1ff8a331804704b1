//! Expression evaluation for `dsl` matchers, extractors and tags
//!
//! The [`Evaluator`] trait is the seam the rest of the engine talks to.
//! [`DslEvaluator`] is the builtin implementation: a small duck-typed
//! language over `serde_json::Value` with the function table in
//! [`functions`] and the response variables in [`builtin_vars`].

pub mod builtin_vars;
pub mod functions;
pub mod parser;

pub use parser::{parse, Expr};

use crate::error::EvaluationError;
use dashmap::DashMap;
use parser::{BinaryOp, UnaryOp};
use regex::Regex;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Flat variable map handed to every evaluation
pub type VarMap = HashMap<String, Value>;

/// Compiled-expression and regex caches are dropped wholesale past this size
const CACHE_LIMIT: usize = 4096;

/// Pluggable expression evaluator
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, vars: &VarMap) -> Result<Value, EvaluationError>;

    fn evaluate_bool(&self, expression: &str, vars: &VarMap) -> Result<bool, EvaluationError> {
        self.evaluate(expression, vars).map(|value| truthy(&value))
    }
}

/// Builtin evaluator with a per-instance AST cache
#[derive(Debug, Default)]
pub struct DslEvaluator {
    cache: DashMap<String, Arc<Expr>>,
}

impl DslEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(&self, expression: &str) -> Result<Arc<Expr>, EvaluationError> {
        if let Some(expr) = self.cache.get(expression) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(parse(expression)?);
        if self.cache.len() >= CACHE_LIMIT {
            self.cache.clear();
        }
        self.cache.insert(expression.to_string(), expr.clone());
        Ok(expr)
    }

    fn eval(&self, expr: &Expr, vars: &VarMap) -> Result<Value, EvaluationError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => lookup_ident(name, vars),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item, vars))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, vars))
                    .collect::<Result<Vec<_>, _>>()?;
                functions::call(name, &args)
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(expr, vars)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => match &value {
                        Value::Number(n) if n.is_i64() => n
                            .as_i64()
                            .and_then(i64::checked_neg)
                            .map(Value::from)
                            .ok_or_else(|| EvaluationError::Type {
                                reason: format!("integer overflow in -{}", n),
                            }),
                        other => value_to_f64(other)
                            .map(|f| number_value(-f))
                            .ok_or_else(|| type_error("-", other)),
                    },
                }
            }
            Expr::Binary { op, left, right } => {
                let lhs = self.eval(left, vars)?;
                match op {
                    BinaryOp::And if !truthy(&lhs) => return Ok(Value::Bool(false)),
                    BinaryOp::Or if truthy(&lhs) => return Ok(Value::Bool(true)),
                    _ => {}
                }
                let rhs = self.eval(right, vars)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                if truthy(&self.eval(condition, vars)?) {
                    self.eval(then, vars)
                } else {
                    self.eval(otherwise, vars)
                }
            }
        }
    }
}

impl Evaluator for DslEvaluator {
    fn evaluate(&self, expression: &str, vars: &VarMap) -> Result<Value, EvaluationError> {
        let expr = self.compile(expression)?;
        self.eval(&expr, vars)
    }
}

fn default_regex() -> Option<&'static Regex> {
    static DEFAULTS: OnceLock<Option<Regex>> = OnceLock::new();
    DEFAULTS
        .get_or_init(|| {
            Regex::new(r"^(duration|status_code|content_length|body|raw|all_headers)_\d+$").ok()
        })
        .as_ref()
}

/// Unknown indexed response variables default to empty so that partially
/// received sequences simply fail to match
fn lookup_ident(name: &str, vars: &VarMap) -> Result<Value, EvaluationError> {
    if let Some(value) = vars.get(name) {
        return Ok(value.clone());
    }
    if let Some(caps) = default_regex().and_then(|re| re.captures(name)) {
        return Ok(match caps.get(1).map(|m| m.as_str()) {
            Some("duration" | "status_code" | "content_length") => Value::from(0),
            _ => Value::String(String::new()),
        });
    }
    Err(EvaluationError::UndefinedVariable {
        name: name.to_string(),
    })
}

fn type_error(op: &str, value: &Value) -> EvaluationError {
    EvaluationError::Type {
        reason: format!("operator {} cannot be applied to {}", op, value),
    }
}

fn both_numbers(lhs: &Value, rhs: &Value) -> Option<(f64, f64)> {
    Some((value_to_f64(lhs)?, value_to_f64(rhs)?))
}

fn both_ints(lhs: &Value, rhs: &Value) -> Option<(i64, i64)> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => Some((a.as_i64()?, b.as_i64()?)),
        _ => None,
    }
}

fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match both_numbers(lhs, rhs) {
            Some((a, b)) => a == b,
            None => value_to_string(lhs) == value_to_string(rhs),
        },
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Array(a), Value::Array(b)) => a == b,
        _ => value_to_string(lhs) == value_to_string(rhs),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvaluationError> {
    let symbol = match op {
        BinaryOp::Or => return Ok(Value::Bool(truthy(rhs))),
        BinaryOp::And => return Ok(Value::Bool(truthy(rhs))),
        BinaryOp::Eq => return Ok(Value::Bool(equals(lhs, rhs))),
        BinaryOp::Ne => return Ok(Value::Bool(!equals(lhs, rhs))),
        BinaryOp::Match | BinaryOp::NotMatch => {
            let matched = compile_regex(&value_to_string(rhs))?.is_match(&value_to_string(lhs));
            return Ok(Value::Bool(matched == (op == BinaryOp::Match)));
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match both_numbers(lhs, rhs) {
                Some((a, b)) => a.partial_cmp(&b),
                None => Some(value_to_string(lhs).cmp(&value_to_string(rhs))),
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            return Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }));
        }
        BinaryOp::Add => {
            let numeric = matches!(lhs, Value::Number(_)) && matches!(rhs, Value::Number(_));
            if !numeric {
                return Ok(Value::String(value_to_string(lhs) + &value_to_string(rhs)));
            }
            "+"
        }
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
    };

    if let Some((a, b)) = both_ints(lhs, rhs) {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div if b != 0 && a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinaryOp::Div if b != 0 => return Ok(number_value(a as f64 / b as f64)),
            BinaryOp::Rem => a.checked_rem(b),
            _ => None,
        };
        return result.map(Value::from).ok_or_else(|| EvaluationError::Type {
            reason: format!("integer overflow or division by zero in {} {} {}", a, symbol, b),
        });
    }

    let (a, b) = both_numbers(lhs, rhs).ok_or_else(|| type_error(symbol, lhs))?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    if !result.is_finite() {
        return Err(EvaluationError::Type {
            reason: format!("non-finite result of {} {} {}", a, symbol, b),
        });
    }
    Ok(number_value(result))
}

/// Compile a regex through a process-wide cache
pub fn compile_regex(pattern: &str) -> Result<Regex, EvaluationError> {
    static CACHE: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    let cache = CACHE.get_or_init(DashMap::new);
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern).map_err(|err| EvaluationError::pattern(pattern, err))?;
    if cache.len() >= CACHE_LIMIT {
        cache.clear();
    }
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Render a value the way templates expect: arrays comma-joined, null empty
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Integral floats become integers so `status_code == 200.0` style
/// results print without a fraction
pub fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        return Value::from(f as i64);
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}
