//! The function registry and built-in filters
//!
//! One registry serves filters (`x | f`), tests (`x is f`) and global
//! function calls (`f(x)`). A callable receives a single object value with
//! keys `args` (array of positionals) and `kw` (object of named arguments).

use crate::value::{TemplateFn, Value, ValueObject};
use miette::{miette, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Build the `{args, kw}` argument object a callable receives
pub fn call_args(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Value {
    let mut kw = ValueObject::new();
    for (k, v) in kwargs {
        kw.insert(k, v);
    }
    let mut obj = ValueObject::new();
    obj.insert("args".to_string(), Value::Array(args));
    obj.insert("kw".to_string(), Value::Object(kw));
    Value::Object(obj)
}

/// Unpack positional and named arguments against a declared parameter list.
///
/// Parameter names ending in `?` are optional. Positionals bind in order,
/// then named arguments bind by the unsuffixed name without overwriting
/// already-bound slots. Unfilled optional slots come back `Undefined`;
/// an unfilled required slot is an error.
pub fn unpack_args(args: &Value, names: &[&str]) -> Result<Vec<Value>> {
    let n_args = names.len();
    let mut res = vec![Value::Undefined; n_args];
    let mut provided = vec![false; n_args];

    let pos_args = args.at("args");
    for pos in 0..n_args.min(pos_args.len()) {
        res[pos] = pos_args.at_index(pos as i64);
        provided[pos] = true;
    }

    let kw_args = args.at("kw");
    for (key, val) in kw_args.entries() {
        let key = key.render_to_string();
        for (k, named) in names.iter().enumerate() {
            let arg_name = named.strip_suffix('?').unwrap_or(named);
            if key == arg_name && !provided[k] {
                res[k] = val.clone();
                provided[k] = true;
            }
        }
    }

    for (k, named) in names.iter().enumerate() {
        if !named.ends_with('?') && !provided[k] {
            return Err(miette!("function call missing required arguments"));
        }
    }

    Ok(res)
}

/// The name → callable mapping used for filters, tests and functions
#[derive(Clone)]
pub struct Functions {
    functions: HashMap<String, TemplateFn>,
}

impl Functions {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// A registry seeded with every built-in
    pub fn with_builtins() -> Self {
        let mut f = Self::new();
        f.register("join", builtin_join);
        f.register("default", builtin_default);
        f.register("e", builtin_escape);
        f.register("escape", builtin_escape);
        f.register("raw", builtin_raw);
        f.register("safe", builtin_raw);
        f.register("defined", builtin_defined);
        f.register("range", builtin_range);
        f.register("length", builtin_length);
        f.register("first", builtin_first);
        f.register("last", builtin_last);
        f.register("batch", builtin_batch);
        f.register("merge", builtin_merge);
        f.register("upper", builtin_upper);
        f.register("lower", builtin_lower);
        f.register("trim", builtin_trim);
        f.register("capitalize", builtin_capitalize);
        f.register("reverse", builtin_reverse);
        f.register("split", builtin_split);
        f.register("odd", builtin_odd);
        f.register("even", builtin_even);
        f.register("empty", builtin_empty);
        f
    }

    /// Register a callable, replacing any prior entry for the name
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    /// Look up a callable by name
    pub fn get(&self, name: &str) -> Option<TemplateFn> {
        self.functions.get(name).cloned()
    }

    /// Invoke a callable by name with an `{args, kw}` object
    pub fn invoke(&self, name: &str, args: &Value) -> Result<Value> {
        match self.functions.get(name) {
            Some(f) => f(args),
            None => Err(miette!("Unknown function or filter: {name}")),
        }
    }
}

impl Default for Functions {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Escape a value for the given mode. Safe values pass through unchanged,
/// as does any mode other than "html".
pub fn escape_value(value: &Value, mode: &str) -> Value {
    if value.is_safe() {
        return value.clone();
    }
    if mode == "html" {
        Value::SafeString(escape_html(&value.render_to_string()))
    } else {
        value.clone()
    }
}

fn escape_html(src: &str) -> String {
    let mut buffer = String::with_capacity(src.len());
    for c in src.chars() {
        match c {
            '&' => buffer.push_str("&amp;"),
            '"' => buffer.push_str("&quot;"),
            '\'' => buffer.push_str("&apos;"),
            '<' => buffer.push_str("&lt;"),
            '>' => buffer.push_str("&gt;"),
            c => buffer.push(c),
        }
    }
    buffer
}

// ============================================================================
// Built-ins
// ============================================================================

fn builtin_join(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["string_list", "sep?", "key?"])?;

    let sep = if unpacked[1].is_undefined() {
        String::new()
    } else {
        unpacked[1].render_to_string()
    };
    let key = if unpacked[2].is_undefined() {
        String::new()
    } else {
        unpacked[2].render_to_string()
    };

    let mut res = String::new();
    for (i, (_, item)) in unpacked[0].entries().iter().enumerate() {
        if i > 0 {
            res.push_str(&sep);
        }
        if key.is_empty() {
            res.push_str(&item.render_to_string());
        } else {
            res.push_str(&item.at(&key).render_to_string());
        }
    }
    Ok(Value::String(res))
}

fn builtin_default(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str", "default"])?;
    if unpacked[0].is_undefined() || unpacked[0].is_null() {
        Ok(unpacked[1].clone())
    } else {
        Ok(unpacked[0].clone())
    }
}

fn builtin_escape(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str", "mode?"])?;
    let mode = if unpacked[1].is_undefined() {
        "html".to_string()
    } else {
        unpacked[1].render_to_string()
    };
    Ok(escape_value(&unpacked[0], &mode))
}

fn builtin_raw(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str"])?;
    if unpacked[0].is_string() {
        Ok(Value::SafeString(unpacked[0].render_to_string()))
    } else {
        Ok(unpacked[0].clone())
    }
}

fn builtin_defined(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["variable"])?;
    Ok(Value::Bool(!unpacked[0].is_undefined()))
}

fn builtin_range(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["start", "end", "step?"])?;

    let mut result = Vec::new();
    if matches!(unpacked[0], Value::Int(_)) {
        let start = unpacked[0].to_integer();
        let stop = unpacked[1].to_integer();
        let step = if unpacked[2].is_undefined() {
            1
        } else {
            unpacked[2].to_integer()
        };
        if step == 0 {
            return Err(miette!("Zero step is provided in range function"));
        }
        if (step > 0 && start > stop) || (step < 0 && start < stop) {
            return Err(miette!("Invalid arguments provided in range function"));
        }

        let mut i = start;
        while (step > 0 && i <= stop) || (step < 0 && i >= stop) {
            result.push(Value::Int(i));
            i += step;
        }
    }

    Ok(Value::Array(result))
}

fn builtin_length(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    Ok(Value::Int(unpacked[0].len() as i64))
}

fn builtin_first(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    match &unpacked[0] {
        Value::Array(a) => Ok(a.first().cloned().unwrap_or(Value::Undefined)),
        Value::String(s) | Value::SafeString(s) => Ok(s
            .chars()
            .next()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn builtin_last(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    match &unpacked[0] {
        Value::Array(a) => Ok(a.last().cloned().unwrap_or(Value::Undefined)),
        Value::String(s) | Value::SafeString(s) => Ok(s
            .chars()
            .last()
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn builtin_batch(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["items", "size", "fill?"])?;

    let items = match &unpacked[0] {
        Value::Array(a) => a,
        _ => return Err(miette!("batch filter expects an array")),
    };
    let size = unpacked[1].to_float().ceil() as i64;
    if size <= 0 {
        return Err(miette!(
            "batch filter size parameter should be a positive integer"
        ));
    }
    let size = size as usize;
    let fill = &unpacked[2];

    let mut out = Vec::new();
    for chunk in items.chunks(size) {
        let mut group: Vec<Value> = chunk.to_vec();
        if group.len() < size && !fill.is_undefined() {
            group.resize(size, fill.clone());
        }
        out.push(Value::Array(group));
    }

    Ok(Value::Array(out))
}

fn builtin_merge(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["src", "other"])?;

    match (&unpacked[0], &unpacked[1]) {
        (Value::Array(a), _) => {
            let mut res = a.clone();
            res.extend(unpacked[1].entries().into_iter().map(|(_, v)| v));
            Ok(Value::Array(res))
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut res = a.clone();
            for (k, v) in b {
                res.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(res))
        }
        (Value::Object(a), _) => Ok(Value::Object(a.clone())),
        _ => Ok(unpacked[0].clone()),
    }
}

fn builtin_upper(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str"])?;
    Ok(Value::String(unpacked[0].render_to_string().to_uppercase()))
}

fn builtin_lower(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str"])?;
    Ok(Value::String(unpacked[0].render_to_string().to_lowercase()))
}

fn builtin_trim(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str"])?;
    Ok(Value::String(
        unpacked[0].render_to_string().trim().to_string(),
    ))
}

fn builtin_capitalize(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str"])?;
    let s = unpacked[0].render_to_string();
    let mut chars = s.chars();
    Ok(Value::String(match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().chain(chars).collect(),
    }))
}

fn builtin_reverse(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    match &unpacked[0] {
        Value::Array(a) => Ok(Value::Array(a.iter().rev().cloned().collect())),
        Value::String(s) | Value::SafeString(s) => {
            Ok(Value::String(s.chars().rev().collect()))
        }
        other => Ok(other.clone()),
    }
}

fn builtin_split(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["str", "pat?"])?;
    let s = unpacked[0].render_to_string();
    let pat = if unpacked[1].is_undefined() {
        " ".to_string()
    } else {
        unpacked[1].render_to_string()
    };
    Ok(Value::Array(
        s.split(&pat).map(|p| Value::String(p.to_string())).collect(),
    ))
}

fn builtin_odd(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    Ok(Value::Bool(unpacked[0].to_integer() % 2 != 0))
}

fn builtin_even(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    Ok(Value::Bool(unpacked[0].to_integer() % 2 == 0))
}

fn builtin_empty(args: &Value) -> Result<Value> {
    let unpacked = unpack_args(args, &["value"])?;
    Ok(Value::Bool(unpacked[0].is_empty()))
}
