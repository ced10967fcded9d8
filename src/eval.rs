//! Expression evaluator
//!
//! Evaluates expression nodes against a [`Context`]. The context is a scope
//! stack plus the named-block overrides collected for template inheritance
//! and the active auto-escape mode; it is local to one evaluation and never
//! crosses threads.

use crate::ast::*;
use crate::error::{RuntimeError, TemplateSource};
use crate::functions::{call_args, Functions};
use crate::value::{Value, ValueObject};
use miette::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// A block override recorded by `extends` or `embed`: the child's block
/// node together with the document it came from (for error reporting and
/// nested lookups).
#[derive(Debug, Clone)]
pub struct BlockOverride {
    pub block: Arc<BlockNode>,
    pub doc: Arc<Document>,
}

/// Evaluation context (variables in scope)
#[derive(Debug, Clone)]
pub struct Context {
    /// Variable scopes (innermost last)
    scopes: Vec<HashMap<String, Value>>,
    /// Named-block overrides inherited from child templates
    blocks: HashMap<String, BlockOverride>,
    /// Active auto-escape mode ("html" by default, "no" disables)
    escape_mode: String,
}

impl Context {
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
            blocks: HashMap::new(),
            escape_mode: "html".to_string(),
        }
    }

    /// A context seeded from an object value's entries
    pub fn with_data(data: &Value) -> Self {
        let mut ctx = Self::new();
        if let Value::Object(o) = data {
            for (k, v) in o {
                ctx.set(k.clone(), v.clone());
            }
        }
        ctx
    }

    /// Set a variable in the innermost scope
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value.into());
        }
    }

    /// Get a variable (searches scopes innermost first). A dotted name
    /// resolves the remaining path through the found value.
    pub fn get(&self, name: &str) -> Option<Value> {
        match name.split_once('.') {
            None => self.lookup(name).cloned(),
            Some((head, rest)) => self.lookup(head).map(|v| v.at(rest)),
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value);
            }
        }
        None
    }

    /// Push a new scope
    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pop the innermost scope
    pub fn pop_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Record a block override unless one is already present; the deepest
    /// child in an inheritance chain registers first and wins.
    pub fn add_block_override(&mut self, name: impl Into<String>, ov: BlockOverride) {
        self.blocks.entry(name.into()).or_insert(ov);
    }

    pub fn block_override(&self, name: &str) -> Option<BlockOverride> {
        self.blocks.get(name).cloned()
    }

    pub fn escape_mode(&self) -> &str {
        &self.escape_mode
    }

    pub fn set_escape_mode(&mut self, mode: impl Into<String>) {
        self.escape_mode = mode.into();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Expression evaluator
pub struct Evaluator<'a> {
    ctx: &'a Context,
    source: TemplateSource,
    functions: Arc<Functions>,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a Context, source: TemplateSource, functions: Arc<Functions>) -> Self {
        Self {
            ctx,
            source,
            functions,
        }
    }

    fn runtime_error(&self, message: impl Into<String>, span: Span) -> miette::Report {
        RuntimeError::new(message, span, &self.source).into()
    }

    /// Evaluate an expression to a value
    pub fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(lit) => self.eval_literal(lit),
            Expr::Var(ident) => Ok(self.ctx.get(&ident.name).unwrap_or(Value::Undefined)),
            Expr::Field(field) => {
                let base = self.eval(&field.base)?;
                Ok(base.at(&field.field.name))
            }
            Expr::Index(index) => self.eval_index(index),
            Expr::Filter(filter) => self.eval_filter(filter),
            Expr::Binary(binary) => self.eval_binary(binary),
            Expr::Unary(unary) => self.eval_unary(unary),
            Expr::Call(call) => self.eval_call(call),
            Expr::Test(test) => self.eval_test(test),
            Expr::Match(m) => self.eval_match(m),
        }
    }

    fn eval_literal(&self, lit: &Literal) -> Result<Value> {
        Ok(match lit {
            Literal::Null(_) => Value::Null,
            Literal::Bool(b) => Value::Bool(b.value),
            Literal::Int(i) => Value::Int(i.value),
            Literal::Float(f) => Value::Float(f.value),
            Literal::String(s) => Value::String(s.value.clone()),
            Literal::Array(a) => {
                let mut elements = Vec::with_capacity(a.elements.len());
                for e in &a.elements {
                    elements.push(self.eval(e)?);
                }
                Value::Array(elements)
            }
            Literal::Object(o) => {
                let mut obj = ValueObject::new();
                for (k, v) in &o.entries {
                    obj.insert(k.value.clone(), self.eval(v)?);
                }
                Value::Object(obj)
            }
        })
    }

    fn eval_index(&self, index: &IndexExpr) -> Result<Value> {
        let base = self.eval(&index.base)?;
        let idx = self.eval(&index.index)?;

        if idx.is_string() {
            Ok(base.at(&idx.render_to_string()))
        } else {
            Ok(base.at_index(idx.to_integer()))
        }
    }

    fn eval_filter(&self, filter: &FilterExpr) -> Result<Value> {
        let target = self.eval(&filter.expr)?;
        let argv = self.eval_args(Some(target), &filter.args, &filter.kwargs)?;
        self.functions.invoke(&filter.filter.name, &argv)
    }

    fn eval_binary(&self, binary: &BinaryExpr) -> Result<Value> {
        // Short-circuit logic first
        match binary.op {
            BinaryOp::And => {
                let left = self.eval(&binary.left)?;
                if !left.to_boolean() {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval(&binary.right)?;
                return Ok(Value::Bool(right.to_boolean()));
            }
            BinaryOp::Or => {
                let left = self.eval(&binary.left)?;
                if left.to_boolean() {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval(&binary.right)?;
                return Ok(Value::Bool(right.to_boolean()));
            }
            _ => {}
        }

        let left = self.eval(&binary.left)?;
        let right = self.eval(&binary.right)?;

        Ok(match binary.op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                arithmetic(&left, &right, binary.op)
            }
            BinaryOp::Concat => Value::String(format!(
                "{}{}",
                left.render_to_string(),
                right.render_to_string()
            )),
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => Value::Bool(compare_values(&left, &right, binary.op)),
            BinaryOp::In => Value::Bool(self.contains(&left, &right, binary.span)?),
            BinaryOp::NotIn => Value::Bool(!self.contains(&left, &right, binary.span)?),
            BinaryOp::And | BinaryOp::Or => unreachable!(), // Handled above
        })
    }

    fn contains(&self, needle: &Value, haystack: &Value, span: Span) -> Result<bool> {
        if !needle.is_primitive() || !haystack.is_array() {
            return Err(self.runtime_error("wrong type of values on containment operator", span));
        }
        Ok(haystack
            .entries()
            .iter()
            .any(|(_, v)| compare_values(needle, v, BinaryOp::Eq)))
    }

    fn eval_unary(&self, unary: &UnaryExpr) -> Result<Value> {
        let value = self.eval(&unary.expr)?;

        Ok(match unary.op {
            UnaryOp::Not => Value::Bool(!value.to_boolean()),
            UnaryOp::Neg => arithmetic(&Value::Int(0), &value, BinaryOp::Sub),
            UnaryOp::Pos => value,
        })
    }

    fn eval_call(&self, call: &CallExpr) -> Result<Value> {
        let argv = self.eval_args(None, &call.args, &call.kwargs)?;

        // A plain name resolves through the context first, then falls back
        // to the registry (this is how range() and friends are reached)
        if let Expr::Var(ident) = &*call.callee {
            return match self.ctx.get(&ident.name) {
                Some(Value::Function(f)) => f(&argv),
                None | Some(Value::Undefined) => self.functions.invoke(&ident.name, &argv),
                Some(_) => Err(self
                    .runtime_error("function invocation of non-callable variable", call.span)),
            };
        }

        let callee = self.eval(&call.callee)?;
        match callee {
            Value::Function(f) => f(&argv),
            _ => Err(self.runtime_error("function invocation of non-callable variable", call.span)),
        }
    }

    fn eval_test(&self, test: &TestExpr) -> Result<Value> {
        let target = self.eval(&test.expr)?;
        let argv = self.eval_args(Some(target), &test.args, &test.kwargs)?;
        let result = self.functions.invoke(&test.test.name, &argv)?.to_boolean();
        Ok(Value::Bool(if test.negated { !result } else { result }))
    }

    fn eval_match(&self, m: &MatchExpr) -> Result<Value> {
        let value = self.eval(&m.expr)?.render_to_string();

        // Full-string match; the pattern compiles here so an invalid one
        // surfaces as a runtime error
        let re = Regex::new(&format!("^(?:{})$", m.pattern.value))
            .map_err(|e| self.runtime_error(format!("invalid regular expression: {e}"), m.span))?;
        let matched = re.is_match(&value);

        Ok(Value::Bool(if m.negated { !matched } else { matched }))
    }

    /// Evaluate call-site arguments into the `{args, kw}` object, optionally
    /// prepending a target value (for filters and tests)
    pub(crate) fn eval_args(
        &self,
        target: Option<Value>,
        args: &[Expr],
        kwargs: &[(Ident, Expr)],
    ) -> Result<Value> {
        let mut pos = Vec::with_capacity(args.len() + 1);
        if let Some(target) = target {
            pos.push(target);
        }
        for a in args {
            pos.push(self.eval(a)?);
        }

        let mut kw = Vec::with_capacity(kwargs.len());
        for (ident, expr) in kwargs {
            kw.push((ident.name.clone(), self.eval(expr)?));
        }

        Ok(call_args(pos, kw))
    }
}

/// Arithmetic with to_number coercion: float if either side is float,
/// integer otherwise. Division and modulo by zero yield zero silently.
fn arithmetic(lhs: &Value, rhs: &Value, op: BinaryOp) -> Value {
    let l = lhs.to_number();
    let r = rhs.to_number();

    if matches!(l, Value::Float(_)) || matches!(r, Value::Float(_)) {
        let (a, b) = (l.to_float(), r.to_float());
        Value::Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => {
                if b != 0.0 {
                    a / b
                } else {
                    0.0
                }
            }
            BinaryOp::Mod => {
                if b as i64 != 0 {
                    (a as i64 % b as i64) as f64
                } else {
                    0.0
                }
            }
            _ => 0.0,
        })
    } else {
        let (a, b) = (l.to_integer(), r.to_integer());
        Value::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => {
                if b != 0 {
                    a.wrapping_div(b)
                } else {
                    0
                }
            }
            BinaryOp::Mod => {
                if b != 0 {
                    a.wrapping_rem(b)
                } else {
                    0
                }
            }
            _ => 0,
        })
    }
}

/// Comparison semantics: strings compare lexicographically, numbers
/// numerically (with float promotion), mixed string/number coerces the
/// string. Null on either side makes every comparison false, except that
/// `null == null` holds. Any other type mix is false.
pub(crate) fn compare_values(lhs: &Value, rhs: &Value, op: BinaryOp) -> bool {
    use std::cmp::Ordering;

    if lhs.is_null() || rhs.is_null() {
        return matches!(op, BinaryOp::Eq) && lhs.is_null() && rhs.is_null();
    }

    let ordering = if lhs.is_string() && rhs.is_string() {
        lhs.render_to_string().cmp(&rhs.render_to_string())
    } else if lhs.is_number() && rhs.is_number() {
        compare_numbers(lhs, rhs)
    } else if lhs.is_number() && rhs.is_string() {
        compare_numbers(lhs, &rhs.to_number())
    } else if lhs.is_string() && rhs.is_number() {
        compare_numbers(&lhs.to_number(), rhs)
    } else {
        return false;
    };

    match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::Ne => ordering != Ordering::Equal,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => false,
    }
}

fn compare_numbers(lhs: &Value, rhs: &Value) -> std::cmp::Ordering {
    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        lhs.to_float()
            .partial_cmp(&rhs.to_float())
            .unwrap_or(std::cmp::Ordering::Equal)
    } else {
        lhs.to_integer().cmp(&rhs.to_integer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn eval_in(src: &str, ctx: &Context) -> Result<Value> {
        let doc = Parser::new("test", format!("{{{{ {src} }}}}")).parse()?;
        let expr = match &doc.body[0] {
            Node::Print(p) => p.expr.clone(),
            other => panic!("expected print node, got {other:?}"),
        };
        let functions = Arc::new(Functions::with_builtins());
        Evaluator::new(ctx, doc.source.clone(), functions).eval(&expr)
    }

    fn eval(src: &str) -> Value {
        eval_in(src, &Context::new()).unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3"), Value::Int(9));
        assert_eq!(eval("2 * 2 + 1"), Value::Int(5));
    }

    #[test]
    fn test_left_associative_subtraction() {
        assert_eq!(eval("1 - 2 - 3"), Value::Int(-4));
        assert_eq!(eval("8 / 4 / 2"), Value::Int(1));
    }

    #[test]
    fn test_float_promotion() {
        assert_eq!(eval("1 + 2.5"), Value::Float(3.5));
        assert_eq!(eval("5 / 2"), Value::Int(2));
        assert_eq!(eval("5.0 / 2"), Value::Float(2.5));
    }

    #[test]
    fn test_division_by_zero_is_zero() {
        assert_eq!(eval("5 / 0"), Value::Int(0));
        assert_eq!(eval("5 % 0"), Value::Int(0));
        assert_eq!(eval("5.0 / 0"), Value::Float(0.0));
    }

    #[test]
    fn test_string_coercion_in_arithmetic() {
        let mut ctx = Context::new();
        ctx.set("n", Value::from("4"));
        assert_eq!(eval_in("n + 1", &ctx).unwrap(), Value::Int(5));
        ctx.set("n", Value::from("junk"));
        assert_eq!(eval_in("n + 1", &ctx).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_unary_negate() {
        assert_eq!(eval("-3"), Value::Int(-3));
        assert_eq!(eval("-(1 + 2)"), Value::Int(-3));
        assert_eq!(eval("+4"), Value::Int(4));
    }

    #[test]
    fn test_concat() {
        assert_eq!(eval("'a' ~ 1"), Value::from("a1"));
        let mut ctx = Context::new();
        ctx.set("x", 2);
        assert_eq!(eval_in("1 ~ x", &ctx).unwrap(), Value::from("12"));
        // a parenthesized literal concatenates instead of matching
        assert_eq!(eval_in("x ~ ('!')", &ctx).unwrap(), Value::from("2!"));
    }

    #[test]
    fn test_boolean_logic() {
        assert_eq!(eval("1 && 2"), Value::Bool(true));
        assert_eq!(eval("0 || ''"), Value::Bool(false));
        assert_eq!(eval("!0"), Value::Bool(true));
        assert_eq!(eval("not 1"), Value::Bool(false));
        assert_eq!(eval("true and false"), Value::Bool(false));
        assert_eq!(eval("true or false"), Value::Bool(true));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("1 < 2"), Value::Bool(true));
        assert_eq!(eval("2 <= 2"), Value::Bool(true));
        assert_eq!(eval("'abc' < 'abd'"), Value::Bool(true));
        assert_eq!(eval("'10' == 10"), Value::Bool(true));
        assert_eq!(eval("1 == 1.0"), Value::Bool(true));
        assert_eq!(eval("true == 1"), Value::Bool(true));
    }

    #[test]
    fn test_null_comparisons() {
        assert_eq!(eval("null == null"), Value::Bool(true));
        assert_eq!(eval("null != null"), Value::Bool(false));
        assert_eq!(eval("null == 0"), Value::Bool(false));
        assert_eq!(eval("null < 1"), Value::Bool(false));
        assert_eq!(eval("null != 1"), Value::Bool(false));
    }

    #[test]
    fn test_missing_variable_is_undefined() {
        assert_eq!(eval("missing"), Value::Undefined);
        assert_eq!(eval("missing.deep.path"), Value::Undefined);
    }

    #[test]
    fn test_subscript_and_field() {
        let mut ctx = Context::new();
        let a: Value = [("x", Value::from(vec![2i64, 3, 4, 5]))].into_iter().collect();
        ctx.set("a", a);
        assert_eq!(eval_in("a.x[2]", &ctx).unwrap(), Value::Int(4));
        assert_eq!(eval_in("a['x'][0]", &ctx).unwrap(), Value::Int(2));
        assert_eq!(eval_in("a.x[9]", &ctx).unwrap(), Value::Undefined);
    }

    #[test]
    fn test_containment() {
        let mut ctx = Context::new();
        ctx.set("xs", Value::from(vec![1i64, 2, 3]));
        assert_eq!(eval_in("2 in xs", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval_in("9 in xs", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(eval_in("9 not in xs", &ctx).unwrap(), Value::Bool(true));
        assert!(eval_in("2 in 5", &ctx).is_err());
    }

    #[test]
    fn test_tests() {
        let mut ctx = Context::new();
        ctx.set("x", 42);
        assert_eq!(eval_in("x is defined", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval_in("y is defined", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(eval_in("y is not defined", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval_in("x is odd", &ctx).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_regex_match() {
        let mut ctx = Context::new();
        ctx.set("s", "hello42");
        assert_eq!(eval_in("s ~ 'hello\\d+'", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval_in("s ~ 'hello'", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(eval_in("s !~ 'x.*'", &ctx).unwrap(), Value::Bool(true));
        assert!(eval_in("s ~ '('", &ctx).is_err());
    }

    #[test]
    fn test_filters() {
        assert_eq!(eval("'<b>' | escape"), Value::safe("&lt;b&gt;"));
        assert_eq!(eval("[1, 2] | length"), Value::Int(2));
        assert_eq!(eval("'a b' | split | first"), Value::from("a"));
    }

    #[test]
    fn test_filter_applies_to_full_expression() {
        let mut ctx = Context::new();
        ctx.set("a", "x");
        ctx.set("b", "y");
        // filters bind loosest: the whole concatenation reaches the filter
        assert_eq!(eval_in("a ~ b | upper", &ctx).unwrap(), Value::from("XY"));
    }

    #[test]
    fn test_registry_function_call() {
        assert_eq!(eval("length([1, 2, 3])"), Value::Int(3));
        assert_eq!(eval("range(1, 3)"), Value::from(vec![1i64, 2, 3]));
    }

    #[test]
    fn test_context_function_call() {
        let mut ctx = Context::new();
        ctx.set(
            "double",
            Value::function(|args| Ok(Value::Int(args.at("args").at_index(0).to_integer() * 2))),
        );
        assert_eq!(eval_in("double(21)", &ctx).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_calling_non_callable_fails() {
        let mut ctx = Context::new();
        ctx.set("x", 5);
        let err = eval_in("x(1)", &ctx).unwrap_err();
        assert!(err.to_string().contains("non-callable"));
    }

    #[test]
    fn test_unknown_function_fails() {
        let err = eval_in("nosuch(1)", &Context::new()).unwrap_err();
        assert!(err.to_string().contains("Unknown function or filter"));
    }

    #[test]
    fn test_array_and_object_literals() {
        assert_eq!(eval("[1, 2, 3] | length"), Value::Int(3));
        assert_eq!(eval("{'a': 1, 'b': 2}.b"), Value::Int(2));
    }

    #[test]
    fn test_scope_shadowing() {
        let mut ctx = Context::new();
        ctx.set("x", 1);
        ctx.push_scope();
        ctx.set("x", 2);
        assert_eq!(ctx.get("x"), Some(Value::Int(2)));
        ctx.pop_scope();
        assert_eq!(ctx.get("x"), Some(Value::Int(1)));
    }
}
