//! Values that norm parameters can hold.
//!
//! Norm parameters are free-form JSON-shaped values. Scalars get their own
//! variants so models can read them without going through `serde_json`;
//! arrays and objects are kept as structured JSON.

use serde::{Deserialize, Serialize};

/// A single norm parameter value.
///
/// Deserialization is untagged, so plain JSON such as
/// `{"active": true, "rate": 0.25}` maps directly onto parameter values.
///
/// # Examples
///
/// ```
/// use normshap::ParamValue;
///
/// let active: ParamValue = serde_json::from_str("true").unwrap();
/// let rate: ParamValue = serde_json::from_str("0.25").unwrap();
///
/// assert_eq!(active.as_bool(), Some(true));
/// assert_eq!(rate.as_float(), Some(0.25));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// `true` or `false`.
    Bool(bool),
    /// Integer that fits in an `i64`.
    Int(i64),
    /// Any other number.
    Float(f64),
    /// Text.
    String(String),
    /// JSON `null`.
    Null,
    /// Arrays and objects, kept as raw JSON.
    Structured(serde_json::Value),
}

impl ParamValue {
    /// Whether this is a [`ParamValue::Bool`].
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    /// Whether this is a [`ParamValue::Int`].
    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    /// Whether this is a [`ParamValue::Float`].
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    /// Whether this is JSON `null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Boolean value, if any.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, if any.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value; integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text value, if any.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Raw JSON for arrays and objects.
    pub const fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Null => "null",
            Self::Structured(_) => "structured",
        }
    }
}

impl Default for ParamValue {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Null => write!(f, "null"),
            Self::Structured(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<serde_json::Value> for ParamValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Self::Int(i),
                (None, Some(f)) => Self::Float(f),
                (None, None) => Self::Structured(serde_json::Value::Number(n)),
            },
            other => Self::Structured(other),
        }
    }
}
