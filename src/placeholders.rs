//! Parsing of user supplied `name=value` placeholder expressions.
//!
//! Values are typed from their literal form: `true`/`false` are booleans,
//! literals with a `.` or an exponent are floats and everything else must be
//! an integer. A parenthesised, comma separated list is a vector whose
//! elements must all share one type.

use std::fmt;

use thiserror::Error;

/// Errors raised while parsing a placeholder expression.
#[derive(Debug, Error, PartialEq)]
pub enum PlaceholderError {
    #[error("Placeholder expression \"{expression}\" is not of the form name=value")]
    MissingSeparator { expression: String },
    #[error("Placeholder expression \"{expression}\" has an empty name")]
    EmptyName { expression: String },
    #[error("Placeholder \"{name}\" has an empty value")]
    EmptyValue { name: String },
    #[error("Placeholder \"{name}\" has a value of ambiguous type: \"{literal}\"")]
    AmbiguousValue { name: String, literal: String },
    #[error("Placeholder \"{name}\" mixes element types in vector \"{literal}\"")]
    MixedVector { name: String, literal: String },
}

/// Typed value bound to a model placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceholderValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    IntVec(Vec<i64>),
    FloatVec(Vec<f32>),
    BoolVec(Vec<bool>),
}

impl PlaceholderValue {
    /// Short type label used in logs and engine diagnostics.
    pub fn type_label(&self) -> &'static str {
        match self {
            PlaceholderValue::Int(_) => "int scalar",
            PlaceholderValue::Float(_) => "float scalar",
            PlaceholderValue::Bool(_) => "bool scalar",
            PlaceholderValue::IntVec(_) => "int vector",
            PlaceholderValue::FloatVec(_) => "float vector",
            PlaceholderValue::BoolVec(_) => "bool vector",
        }
    }

    /// Scalar value as `f32`, only for float scalars.
    pub fn as_float(&self) -> Option<f32> {
        match self {
            PlaceholderValue::Float(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for PlaceholderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.type_label();
        match self {
            PlaceholderValue::Int(value) => write!(f, "{label} {value}"),
            PlaceholderValue::Float(value) => write!(f, "{label} {value}"),
            PlaceholderValue::Bool(value) => write!(f, "{label} {value}"),
            PlaceholderValue::IntVec(values) => write!(f, "{label} {values:?}"),
            PlaceholderValue::FloatVec(values) => write!(f, "{label} {values:?}"),
            PlaceholderValue::BoolVec(values) => write!(f, "{label} {values:?}"),
        }
    }
}

/// A named placeholder value fed alongside streamed data.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderBinding {
    pub name: String,
    pub value: PlaceholderValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Int(i64),
    Float(f32),
    Bool(bool),
}

/// Parse a single `name=value` expression.
pub fn parse_expression(expression: &str) -> Result<PlaceholderBinding, PlaceholderError> {
    let Some((name, literal)) = expression.split_once('=') else {
        return Err(PlaceholderError::MissingSeparator {
            expression: expression.to_string(),
        });
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(PlaceholderError::EmptyName {
            expression: expression.to_string(),
        });
    }
    let literal = literal.trim();
    if literal.is_empty() {
        return Err(PlaceholderError::EmptyValue {
            name: name.to_string(),
        });
    }
    let value = match literal
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
    {
        Some(inner) => parse_vector(name, literal, inner)?,
        None => match parse_scalar(literal).ok_or_else(|| ambiguous(name, literal))? {
            Scalar::Int(value) => PlaceholderValue::Int(value),
            Scalar::Float(value) => PlaceholderValue::Float(value),
            Scalar::Bool(value) => PlaceholderValue::Bool(value),
        },
    };
    Ok(PlaceholderBinding {
        name: name.to_string(),
        value,
    })
}

/// Parse a list of expressions in order, logging each resolved binding.
///
/// Duplicate names are kept; precedence between them belongs to the engine.
pub fn parse_expressions<S: AsRef<str>>(
    expressions: &[S],
) -> Result<Vec<PlaceholderBinding>, PlaceholderError> {
    let mut bindings = Vec::with_capacity(expressions.len());
    for expression in expressions {
        let binding = parse_expression(expression.as_ref())?;
        tracing::info!("Using placeholder {} with {}", binding.name, binding.value);
        bindings.push(binding);
    }
    Ok(bindings)
}

fn parse_vector(
    name: &str,
    literal: &str,
    inner: &str,
) -> Result<PlaceholderValue, PlaceholderError> {
    let mut scalars = Vec::new();
    for element in inner.split(',') {
        let element = element.trim();
        if element.is_empty() {
            return Err(ambiguous(name, literal));
        }
        scalars.push(parse_scalar(element).ok_or_else(|| ambiguous(name, literal))?);
    }
    let mixed = || PlaceholderError::MixedVector {
        name: name.to_string(),
        literal: literal.to_string(),
    };
    match scalars.first() {
        Some(Scalar::Int(_)) => scalars
            .iter()
            .map(|s| match s {
                Scalar::Int(v) => Ok(*v),
                _ => Err(mixed()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PlaceholderValue::IntVec),
        Some(Scalar::Float(_)) => scalars
            .iter()
            .map(|s| match s {
                Scalar::Float(v) => Ok(*v),
                _ => Err(mixed()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PlaceholderValue::FloatVec),
        Some(Scalar::Bool(_)) => scalars
            .iter()
            .map(|s| match s {
                Scalar::Bool(v) => Ok(*v),
                _ => Err(mixed()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(PlaceholderValue::BoolVec),
        None => Err(ambiguous(name, literal)),
    }
}

fn parse_scalar(literal: &str) -> Option<Scalar> {
    match literal {
        "true" => return Some(Scalar::Bool(true)),
        "false" => return Some(Scalar::Bool(false)),
        _ => {}
    }
    if literal.contains(['.', 'e', 'E']) {
        let value = literal.parse::<f32>().ok()?;
        return value.is_finite().then_some(Scalar::Float(value));
    }
    literal.parse::<i64>().ok().map(Scalar::Int)
}

fn ambiguous(name: &str, literal: &str) -> PlaceholderError {
    PlaceholderError::AmbiguousValue {
        name: name.to_string(),
        literal: literal.to_string(),
    }
}
