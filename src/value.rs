//! The dynamic value model
//!
//! Every piece of data flowing through a render (context variables,
//! expression intermediates, filter arguments, function results) is a
//! [`Value`]. `Undefined` and `Null` are distinct: `Undefined` means "no such
//! key / not provided", `Null` is an explicit null.

use miette::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A callable stored in a [`Value::Function`] or registered on the engine.
///
/// Receives a single object value with keys `args` (array of positional
/// arguments) and `kw` (object of named arguments).
pub type TemplateFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// An ordered string-keyed mapping; iteration follows key order.
pub type ValueObject = BTreeMap<String, Value>;

/// The dynamic, tagged datum flowing through evaluation
#[derive(Clone, Default)]
pub enum Value {
    /// No such key / not provided
    #[default]
    Undefined,
    /// Explicit null
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A string already suitable for output; escape operations pass it through
    SafeString(String),
    Array(Vec<Value>),
    Object(ValueObject),
    Function(TemplateFn),
}

impl Value {
    /// Wrap a string as already output-safe
    pub fn safe(s: impl Into<String>) -> Value {
        Value::SafeString(s.into())
    }

    /// Build a function value from a closure
    pub fn function<F>(f: F) -> Value
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        Value::Function(Arc::new(f))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_) | Value::SafeString(_))
    }

    /// Booleans count as numbers for arithmetic and comparison purposes
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::String(_) | Value::SafeString(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_)
        )
    }

    /// Every variant except a plain string is considered safe for output
    pub fn is_safe(&self) -> bool {
        !matches!(self, Value::String(_))
    }

    /// A human-readable type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) | Value::SafeString(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    /// Truthiness: empty strings, zero, undefined/null and empty arrays are
    /// false; objects and functions are always true.
    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) | Value::SafeString(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(_) | Value::Function(_) => true,
        }
    }

    pub fn to_integer(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::Int(i) => *i,
            Value::Float(f) => *f as i64,
            Value::String(s) | Value::SafeString(s) => {
                let t = s.trim();
                t.parse::<i64>()
                    .ok()
                    .or_else(|| t.parse::<f64>().ok().map(|f| f as i64))
                    .unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn to_float(&self) -> f64 {
        match self {
            Value::Bool(b) => *b as i64 as f64,
            Value::Int(i) => *i as f64,
            Value::Float(f) => *f,
            Value::String(s) | Value::SafeString(s) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Coerce to a numeric value: strings become Int when parseable, Float
    /// otherwise; anything non-numeric becomes Int 0.
    pub fn to_number(&self) -> Value {
        match self {
            Value::Bool(b) => Value::Int(*b as i64),
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) => Value::Float(*f),
            Value::String(s) | Value::SafeString(s) => {
                let t = s.trim();
                if let Ok(i) = t.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(f) = t.parse::<f64>() {
                    Value::Float(f)
                } else {
                    Value::Int(0)
                }
            }
            _ => Value::Int(0),
        }
    }

    /// Render the value to a string for output. Booleans render as `1`/`0`,
    /// undefined/null as the empty string, containers as nothing.
    pub fn render_to_string(&self) -> String {
        match self {
            Value::String(s) | Value::SafeString(s) => s.clone(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            _ => String::new(),
        }
    }

    /// Length of an object (key count), array (element count) or string
    /// (byte length); zero for everything else.
    pub fn len(&self) -> usize {
        match self {
            Value::Object(o) => o.len(),
            Value::Array(a) => a.len(),
            Value::String(s) | Value::SafeString(s) => s.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member lookup by key. The key may be a dotted path `a.b.c`; each
    /// segment indexes the previous value. A missing segment or a non-object
    /// receiver yields `Undefined`.
    pub fn at(&self, key: &str) -> Value {
        if key.is_empty() {
            return Value::Undefined;
        }
        let mut current = self;
        for segment in key.split('.') {
            match current {
                Value::Object(o) => match o.get(segment) {
                    Some(v) => current = v,
                    None => return Value::Undefined,
                },
                _ => return Value::Undefined,
            }
        }
        current.clone()
    }

    /// Array element lookup; out-of-range (including negative) yields
    /// `Undefined`.
    pub fn at_index(&self, idx: i64) -> Value {
        match self {
            Value::Array(a) if idx >= 0 => {
                a.get(idx as usize).cloned().unwrap_or(Value::Undefined)
            }
            _ => Value::Undefined,
        }
    }

    /// Uniform iteration: arrays yield `(index, value)` pairs, objects yield
    /// `(key, value)` pairs in key order, everything else yields nothing.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        match self {
            Value::Array(a) => a
                .iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v.clone()))
                .collect(),
            Value::Object(o) => o
                .iter()
                .map(|(k, v)| (Value::String(k.clone()), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Invoke a function value; any other variant yields `Undefined`.
    pub fn invoke(&self, args: &Value) -> Result<Value> {
        match self {
            Value::Function(f) => f(args),
            _ => Ok(Value::Undefined),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Value::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Value::String(s) => f.debug_tuple("String").field(s).finish(),
            Value::SafeString(s) => f.debug_tuple("SafeString").field(s).finish(),
            Value::Array(a) => f.debug_tuple("Array").field(a).finish(),
            Value::Object(o) => f.debug_tuple("Object").field(o).finish(),
            Value::Function(_) => write!(f, "Function(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (
                Value::String(a) | Value::SafeString(a),
                Value::String(b) | Value::SafeString(b),
            ) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

// Convenience conversions for common types
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Value::Object(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.to_boolean());
        assert!(!Value::Null.to_boolean());
        assert!(!Value::from("").to_boolean());
        assert!(Value::from("x").to_boolean());
        assert!(!Value::Int(0).to_boolean());
        assert!(Value::Int(-1).to_boolean());
        assert!(!Value::Float(0.0).to_boolean());
        assert!(!Value::Array(vec![]).to_boolean());
        assert!(Value::from(vec![1]).to_boolean());
        assert!(Value::Object(ValueObject::new()).to_boolean());
    }

    #[test]
    fn test_numeric_coercions() {
        assert_eq!(Value::from("42").to_integer(), 42);
        assert_eq!(Value::from("3.7").to_integer(), 3);
        assert_eq!(Value::from("nope").to_integer(), 0);
        assert_eq!(Value::Bool(true).to_integer(), 1);
        assert_eq!(Value::Undefined.to_integer(), 0);
        assert_eq!(Value::from("2.5").to_float(), 2.5);
        assert_eq!(Value::from("12").to_number(), Value::Int(12));
        assert_eq!(Value::from("1.5").to_number(), Value::Float(1.5));
        assert_eq!(Value::from("abc").to_number(), Value::Int(0));
    }

    #[test]
    fn test_render_to_string() {
        assert_eq!(Value::from("hi").render_to_string(), "hi");
        assert_eq!(Value::Bool(true).render_to_string(), "1");
        assert_eq!(Value::Bool(false).render_to_string(), "0");
        assert_eq!(Value::Int(7).render_to_string(), "7");
        assert_eq!(Value::Float(3.25).render_to_string(), "3.25");
        assert_eq!(Value::Float(1.0).render_to_string(), "1");
        assert_eq!(Value::Null.render_to_string(), "");
        assert_eq!(Value::Undefined.render_to_string(), "");
    }

    #[test]
    fn test_dotted_lookup() {
        let v: Value = [(
            "a",
            [("b", Value::from(vec![1, 2, 3]))].into_iter().collect::<Value>(),
        )]
        .into_iter()
        .collect();
        assert_eq!(v.at("a.b").len(), 3);
        assert_eq!(v.at("a.missing"), Value::Undefined);
        assert_eq!(v.at("nope.b"), Value::Undefined);
        assert_eq!(v.at(""), Value::Undefined);
    }

    #[test]
    fn test_index_lookup() {
        let v = Value::from(vec!["a", "b"]);
        assert_eq!(v.at_index(1), Value::from("b"));
        assert_eq!(v.at_index(5), Value::Undefined);
        assert_eq!(v.at_index(-1), Value::Undefined);
        assert_eq!(Value::from("s").at_index(0), Value::Undefined);
    }

    #[test]
    fn test_entries_order() {
        let v: Value = [("b", 2), ("a", 1)].into_iter().collect();
        let entries = v.entries();
        // object iteration follows key order
        assert_eq!(entries[0].0, Value::from("a"));
        assert_eq!(entries[1].0, Value::from("b"));

        let a = Value::from(vec!["x", "y"]);
        let entries = a.entries();
        assert_eq!(entries[0].0, Value::Int(0));
        assert_eq!(entries[1].1, Value::from("y"));

        assert!(Value::from("str").entries().is_empty());
    }

    #[test]
    fn test_safe_strings() {
        assert!(!Value::from("x").is_safe());
        assert!(Value::safe("x").is_safe());
        assert!(Value::Int(1).is_safe());
        assert_eq!(Value::safe("x"), Value::from("x"));
        assert!(Value::safe("x").is_string());
    }

    #[test]
    fn test_invoke() {
        let f = Value::function(|args| Ok(args.at("args").at_index(0)));
        let argv: Value = [("args", Value::from(vec![41])), ("kw", Value::Object(ValueObject::new()))]
            .into_iter()
            .collect();
        assert_eq!(f.invoke(&argv).unwrap(), Value::Int(41));
        assert_eq!(Value::Int(3).invoke(&argv).unwrap(), Value::Undefined);
    }

    #[test]
    fn test_length() {
        assert_eq!(Value::from("héllo").len(), 6); // byte length
        assert_eq!(Value::from(vec![1, 2]).len(), 2);
        assert_eq!(Value::Int(9).len(), 0);
    }
}
