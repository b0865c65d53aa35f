//! Runtime values for expression evaluation.
//!
//! Expressions follow JavaScript coercion rules, which `serde_json::Value`
//! cannot represent on its own (`undefined`, `Infinity`, `NaN`). `ExprValue`
//! carries those and converts back to JSON at the boundary.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Number, Value};

/// Largest integer an f64 represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A JavaScript-flavoured value.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ExprValue>),
    Object(BTreeMap<String, ExprValue>),
}

impl ExprValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => ExprValue::Null,
            Value::Bool(b) => ExprValue::Bool(*b),
            Value::Number(n) => ExprValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => ExprValue::String(s.clone()),
            Value::Array(items) => ExprValue::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => ExprValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON.
    ///
    /// JSON has no encoding for `undefined`, `Infinity`, `-Infinity` or `NaN`,
    /// so all of them become `null`. This is lossy: `{{ 1 / 0 }}` saved to
    /// state reads back as `null`, not `Infinity`. Callers that need the
    /// non-finite value must keep the `ExprValue`. Integral numbers become
    /// JSON integers.
    pub fn to_json(&self) -> Value {
        match self {
            ExprValue::Undefined | ExprValue::Null => Value::Null,
            ExprValue::Bool(b) => Value::Bool(*b),
            ExprValue::Number(n) => number_to_json(*n),
            ExprValue::String(s) => Value::String(s.clone()),
            ExprValue::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ExprValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, ExprValue::Undefined | ExprValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Undefined => "undefined",
            ExprValue::Null => "null",
            ExprValue::Bool(_) => "boolean",
            ExprValue::Number(_) => "number",
            ExprValue::String(_) => "string",
            ExprValue::Array(_) => "array",
            ExprValue::Object(_) => "object",
        }
    }

    /// JS truthiness: `undefined`, `null`, `false`, `0`, `NaN` and `""` are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Undefined | ExprValue::Null => false,
            ExprValue::Bool(b) => *b,
            ExprValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::String(s) => !s.is_empty(),
            ExprValue::Array(_) | ExprValue::Object(_) => true,
        }
    }

    /// Numeric coercion. Absent values count as 0.
    pub fn to_number(&self) -> f64 {
        match self {
            ExprValue::Undefined | ExprValue::Null => 0.0,
            ExprValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ExprValue::Number(n) => *n,
            ExprValue::String(s) => parse_number(s),
            ExprValue::Array(items) => match items.as_slice() {
                [] => 0.0,
                [single] => single.to_number(),
                _ => f64::NAN,
            },
            ExprValue::Object(_) => f64::NAN,
        }
    }

    /// String coercion used by `+` and template interpolation.
    /// Absent values render as the empty string.
    pub fn to_display_string(&self) -> String {
        match self {
            ExprValue::Undefined | ExprValue::Null => String::new(),
            ExprValue::Bool(b) => b.to_string(),
            ExprValue::Number(n) => format_number(*n),
            ExprValue::String(s) => s.clone(),
            ExprValue::Array(items) => items
                .iter()
                .map(Self::to_display_string)
                .collect::<Vec<_>>()
                .join(","),
            ExprValue::Object(_) => self.to_json().to_string(),
        }
    }

    /// `==` with JS coercion.
    pub fn loose_eq(&self, other: &ExprValue) -> bool {
        use ExprValue::*;
        match (self, other) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Bool(a), _) => Number(if *a { 1.0 } else { 0.0 }).loose_eq(other),
            (_, Bool(b)) => self.loose_eq(&Number(if *b { 1.0 } else { 0.0 })),
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Number(a), String(_)) => *a == other.to_number(),
            (String(_), Number(b)) => self.to_number() == *b,
            (Array(_) | Object(_), Array(_) | Object(_)) => self == other,
            (Array(_) | Object(_), String(s)) => self.to_display_string() == *s,
            (String(s), Array(_) | Object(_)) => *s == other.to_display_string(),
            (Array(_) | Object(_), Number(n)) => self.to_number() == *n,
            (Number(n), Array(_) | Object(_)) => *n == other.to_number(),
        }
    }

    /// `===`: same type and same value.
    pub fn strict_eq(&self, other: &ExprValue) -> bool {
        match (self, other) {
            (ExprValue::Number(a), ExprValue::Number(b)) => a == b,
            _ => self == other,
        }
    }

    /// Relational ordering. Two strings compare lexically, everything else
    /// numerically; `None` when either side is `NaN`.
    pub fn compare(&self, other: &ExprValue) -> Option<Ordering> {
        match (self, other) {
            (ExprValue::String(a), ExprValue::String(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&other.to_number()),
        }
    }

    /// `+`: concatenation when either side is a string or container, else addition.
    pub fn add(&self, other: &ExprValue) -> ExprValue {
        let stringy = |v: &ExprValue| {
            matches!(
                v,
                ExprValue::String(_) | ExprValue::Array(_) | ExprValue::Object(_)
            )
        };
        if stringy(self) || stringy(other) {
            ExprValue::String(format!(
                "{}{}",
                self.to_display_string(),
                other.to_display_string()
            ))
        } else {
            ExprValue::Number(self.to_number() + other.to_number())
        }
    }

    /// Property read on an owned value. `length` is synthesised for arrays
    /// and strings; anything else missing is `undefined`.
    pub fn get_property(&self, name: &str) -> ExprValue {
        match self {
            ExprValue::Object(map) => map.get(name).cloned().unwrap_or(ExprValue::Undefined),
            ExprValue::Array(items) if name == "length" => ExprValue::Number(items.len() as f64),
            ExprValue::String(s) if name == "length" => {
                ExprValue::Number(s.chars().count() as f64)
            }
            _ => ExprValue::Undefined,
        }
    }

    /// Bracket read on an owned value.
    pub fn get_index(&self, key: &ExprValue) -> ExprValue {
        match (self, key) {
            (ExprValue::Array(items), ExprValue::Number(n)) => array_index(*n, items.len())
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(ExprValue::Undefined),
            (ExprValue::String(s), ExprValue::Number(n)) => array_index(*n, s.chars().count())
                .and_then(|i| s.chars().nth(i))
                .map(|c| ExprValue::String(c.to_string()))
                .unwrap_or(ExprValue::Undefined),
            _ => self.get_property(&key.to_display_string()),
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprValue::Undefined => f.write_str("undefined"),
            ExprValue::Null => f.write_str("null"),
            ExprValue::String(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.to_display_string()),
        }
    }
}

impl From<Value> for ExprValue {
    fn from(value: Value) -> Self {
        ExprValue::from_json(&value)
    }
}

impl From<&Value> for ExprValue {
    fn from(value: &Value) -> Self {
        ExprValue::from_json(value)
    }
}

// ---------------------------------------------------------------------------
// Borrowed lookup
// ---------------------------------------------------------------------------

/// Result of resolving an identifier/property chain.
///
/// Chains that stay inside the JSON context are resolved by reference so the
/// context is never converted wholesale; only the final value is copied.
#[derive(Debug)]
pub(crate) enum Place<'a> {
    Borrowed(Option<&'a Value>),
    Owned(ExprValue),
}

impl<'a> Place<'a> {
    pub(crate) fn root(context: &'a Value, name: &str) -> Self {
        Place::Borrowed(context.get(name))
    }

    pub(crate) fn property(self, name: &str) -> Self {
        match self {
            Place::Borrowed(None) => Place::Borrowed(None),
            Place::Borrowed(Some(value)) => match value {
                Value::Object(map) => Place::Borrowed(map.get(name)),
                Value::Array(items) if name == "length" => {
                    Place::Owned(ExprValue::Number(items.len() as f64))
                }
                Value::String(s) if name == "length" => {
                    Place::Owned(ExprValue::Number(s.chars().count() as f64))
                }
                _ => Place::Borrowed(None),
            },
            Place::Owned(value) => Place::Owned(value.get_property(name)),
        }
    }

    pub(crate) fn index(self, key: &ExprValue) -> Self {
        match self {
            Place::Borrowed(None) => Place::Borrowed(None),
            Place::Borrowed(Some(Value::Array(items))) => match key {
                ExprValue::Number(n) => {
                    Place::Borrowed(array_index(*n, items.len()).and_then(|i| items.get(i)))
                }
                other if other.to_display_string() == "length" => {
                    Place::Owned(ExprValue::Number(items.len() as f64))
                }
                _ => Place::Borrowed(None),
            },
            Place::Borrowed(Some(value)) if value.is_string() => {
                Place::Owned(ExprValue::from_json(value).get_index(key))
            }
            Place::Borrowed(Some(value)) => {
                Place::Borrowed(Some(value)).property(&key.to_display_string())
            }
            Place::Owned(value) => Place::Owned(value.get_index(key)),
        }
    }

    pub(crate) fn into_value(self) -> ExprValue {
        match self {
            Place::Borrowed(Some(value)) => ExprValue::from_json(value),
            Place::Borrowed(None) => ExprValue::Undefined,
            Place::Owned(value) => value,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn array_index(n: f64, len: usize) -> Option<usize> {
    if n.fract() != 0.0 || n < 0.0 || n >= len as f64 {
        None
    } else {
        Some(n as usize)
    }
}

/// JS `Number(string)`: whitespace-trimmed, empty is 0, otherwise NaN on junk.
pub(crate) fn parse_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn number_to_json(n: f64) -> Value {
    if !n.is_finite() {
        Value::Null
    } else if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s(v: &str) -> ExprValue {
        ExprValue::String(v.to_string())
    }

    #[test]
    fn test_truthiness() {
        assert!(!ExprValue::Undefined.truthy());
        assert!(!ExprValue::Null.truthy());
        assert!(!s("").truthy());
        assert!(!ExprValue::Number(0.0).truthy());
        assert!(!ExprValue::Number(f64::NAN).truthy());
        assert!(s("0").truthy());
        assert!(ExprValue::Array(vec![]).truthy());
    }

    #[test]
    fn test_loose_equality() {
        assert!(ExprValue::Number(5.0).loose_eq(&s("5")));
        assert!(s("5").loose_eq(&ExprValue::Number(5.0)));
        assert!(ExprValue::Null.loose_eq(&ExprValue::Undefined));
        assert!(!ExprValue::Null.loose_eq(&ExprValue::Number(0.0)));
        assert!(ExprValue::Bool(true).loose_eq(&ExprValue::Number(1.0)));
        assert!(s("").loose_eq(&ExprValue::Number(0.0)));
        assert!(!ExprValue::Number(f64::NAN).loose_eq(&ExprValue::Number(f64::NAN)));
    }

    #[test]
    fn test_strict_equality() {
        assert!(!ExprValue::Number(5.0).strict_eq(&s("5")));
        assert!(!ExprValue::Null.strict_eq(&ExprValue::Undefined));
        assert!(s("a").strict_eq(&s("a")));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(ExprValue::Null.to_number(), 0.0);
        assert_eq!(ExprValue::Undefined.to_number(), 0.0);
        assert_eq!(ExprValue::Bool(true).to_number(), 1.0);
        assert_eq!(s(" 42 ").to_number(), 42.0);
        assert!(s("abc").to_number().is_nan());
        assert_eq!(s("1e3").to_number(), 1000.0);
    }

    #[test]
    fn test_add_concatenates_strings() {
        assert_eq!(s("a").add(&ExprValue::Number(1.0)), s("a1"));
        assert_eq!(
            ExprValue::Number(1.0).add(&ExprValue::Number(2.0)),
            ExprValue::Number(3.0)
        );
        assert_eq!(ExprValue::Null.add(&ExprValue::Number(2.0)), ExprValue::Number(2.0));
    }

    #[test]
    fn test_json_conversion_integral_and_non_finite() {
        assert_eq!(ExprValue::Number(10.0).to_json(), json!(10));
        assert_eq!(ExprValue::Number(2.5).to_json(), json!(2.5));
        assert_eq!(ExprValue::Number(f64::INFINITY).to_json(), Value::Null);
        assert_eq!(ExprValue::Number(f64::NEG_INFINITY).to_json(), Value::Null);
        assert_eq!(ExprValue::Number(f64::NAN).to_json(), Value::Null);
        assert_eq!(ExprValue::Undefined.to_json(), Value::Null);
        let nested = ExprValue::Array(vec![ExprValue::Number(1.0), ExprValue::Number(f64::INFINITY)]);
        assert_eq!(nested.to_json(), json!([1, null]));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::INFINITY), "Infinity");
        assert_eq!(format_number(f64::NAN), "NaN");
    }

    #[test]
    fn test_place_borrowed_chain() {
        let ctx = json!({"state": {"items": [1, 2, 3], "name": "abc"}});
        let items = Place::root(&ctx, "state").property("items");
        assert_eq!(
            Place::root(&ctx, "state").property("items").property("length").into_value(),
            ExprValue::Number(3.0)
        );
        assert_eq!(
            items.index(&ExprValue::Number(1.0)).into_value(),
            ExprValue::Number(2.0)
        );
        assert_eq!(
            Place::root(&ctx, "missing").property("deep").into_value(),
            ExprValue::Undefined
        );
        assert_eq!(
            Place::root(&ctx, "state")
                .property("name")
                .index(&ExprValue::Number(0.0))
                .into_value(),
            s("a")
        );
    }
}
