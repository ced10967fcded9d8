//! Template renderer
//!
//! The [`Engine`] is the main public API: loader -> parser -> cache ->
//! evaluator. Compiled documents are immutable and shared via `Arc`, so any
//! number of renders can run concurrently against the same cache.

use crate::ast::*;
use crate::error::{LoadError, RuntimeError, TemplateSource};
use crate::eval::{BlockOverride, Context, Evaluator};
use crate::functions::{escape_value, Functions};
use crate::parser::Parser;
use crate::value::{Value, ValueObject};
use camino::{Utf8Path, Utf8PathBuf};
use miette::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace};

/// Trait for loading template source text by key (for inheritance,
/// includes and imports)
pub trait TemplateLoader {
    /// Return the source text for `name`, or a [`LoadError`] with a
    /// human-readable message
    fn load(&self, name: &str) -> Result<String, LoadError>;
}

/// A loader that never finds any templates
#[derive(Default, Clone, Copy)]
pub struct NullLoader;

impl TemplateLoader for NullLoader {
    fn load(&self, name: &str) -> Result<String, LoadError> {
        Err(LoadError::not_found(name))
    }
}

/// A simple in-memory template loader
#[derive(Default)]
pub struct InMemoryLoader {
    templates: HashMap<String, String>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.templates.insert(name.into(), source.into());
    }
}

impl TemplateLoader for InMemoryLoader {
    fn load(&self, name: &str) -> Result<String, LoadError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::not_found(name))
    }
}

/// A file-based loader that walks a list of root directories, optionally
/// appending a suffix to keys that lack it
pub struct FileLoader {
    roots: Vec<Utf8PathBuf>,
    suffix: Option<String>,
}

impl FileLoader {
    /// Create a new file loader rooted at the given directory
    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        Self {
            roots: vec![root.as_ref().to_owned()],
            suffix: None,
        }
    }

    /// Add another root directory to search
    pub fn add_root(mut self, root: impl AsRef<Utf8Path>) -> Self {
        self.roots.push(root.as_ref().to_owned());
        self
    }

    /// Append this suffix (e.g. ".twig") to keys that do not carry it
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }
}

impl TemplateLoader for FileLoader {
    fn load(&self, name: &str) -> Result<String, LoadError> {
        for root in &self.roots {
            let file = match &self.suffix {
                Some(suffix) if !name.ends_with(suffix.as_str()) => format!("{name}{suffix}"),
                _ => name.to_string(),
            };
            let path = root.join(&file);
            if let Ok(text) = std::fs::read_to_string(&path) {
                return Ok(text);
            }
        }
        Err(LoadError::not_found(name))
    }
}

/// Compiled-document cache: one lock, fetch/add, no eviction. Two racing
/// compiles of the same key are both valid; the last insert wins.
struct Cache {
    compiled: Mutex<HashMap<String, Arc<Document>>>,
}

impl Cache {
    fn new() -> Self {
        Self {
            compiled: Mutex::new(HashMap::new()),
        }
    }

    fn fetch(&self, key: &str) -> Option<Arc<Document>> {
        self.compiled
            .lock()
            .expect("template cache lock poisoned")
            .get(key)
            .cloned()
    }

    fn add(&self, key: &str, doc: Arc<Document>) {
        self.compiled
            .lock()
            .expect("template cache lock poisoned")
            .insert(key.to_string(), doc);
    }
}

/// Engine internals shared with macro and parent() closures
pub(crate) struct EngineInner {
    loader: Box<dyn TemplateLoader + Send + Sync>,
    cache: Cache,
    functions: RwLock<Arc<Functions>>,
    caching: AtomicBool,
    debug: AtomicBool,
}

impl EngineInner {
    /// Load and compile a template, consulting the cache first
    fn compile(&self, name: &str) -> Result<Arc<Document>> {
        if self.caching.load(Ordering::Relaxed) {
            if let Some(doc) = self.cache.fetch(name) {
                if self.debug.load(Ordering::Relaxed) {
                    debug!(template = name, "template cache hit");
                }
                return Ok(doc);
            }
        }

        let source = self.loader.load(name)?;
        let doc = Arc::new(Parser::new(name, source).parse()?);
        debug!(template = name, "compiled template");

        if self.caching.load(Ordering::Relaxed) {
            self.cache.add(name, doc.clone());
        }

        Ok(doc)
    }

    /// Snapshot of the function registry
    fn functions(&self) -> Arc<Functions> {
        self.functions
            .read()
            .expect("function registry lock poisoned")
            .clone()
    }
}

/// The template engine: render templates by key or from a string against a
/// data object. All methods take `&self`; an engine can be shared across
/// threads behind an `Arc`.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create a new engine with the given loader
    pub fn new(loader: impl TemplateLoader + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                loader: Box::new(loader),
                cache: Cache::new(),
                functions: RwLock::new(Arc::new(Functions::with_builtins())),
                caching: AtomicBool::new(true),
                debug: AtomicBool::new(false),
            }),
        }
    }

    /// Render a template by key against a data object
    pub fn render(&self, name: &str, data: &Value) -> Result<String> {
        trace!(template = name, "render");
        let doc = self.inner.compile(name)?;
        self.render_compiled(&doc, data)
    }

    /// Render template source directly, bypassing loader and cache
    pub fn render_str(&self, source: &str, data: &Value) -> Result<String> {
        let doc = Arc::new(Parser::new("--string--", source).parse()?);
        self.render_compiled(&doc, data)
    }

    /// Register a function usable as a filter, test, or global function.
    /// Registration replaces any prior entry and is intended for startup;
    /// render-time access is read-only.
    pub fn register_function<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        let mut guard = self
            .inner
            .functions
            .write()
            .expect("function registry lock poisoned");
        Arc::make_mut(&mut guard).register(name, f);
    }

    /// Toggle the compiled-template cache (default on)
    pub fn set_caching(&self, on: bool) {
        self.inner.caching.store(on, Ordering::Relaxed);
    }

    /// Toggle verbose compile/cache logging (default off)
    pub fn set_debug(&self, on: bool) {
        self.inner.debug.store(on, Ordering::Relaxed);
    }

    fn render_compiled(&self, doc: &Arc<Document>, data: &Value) -> Result<String> {
        let mut ctx = Context::with_data(data);
        let mut output = String::new();
        let mut renderer = Renderer {
            engine: self.inner.clone(),
            functions: self.inner.functions(),
            source: doc.source.clone(),
            output: &mut output,
        };
        renderer.render_document(doc, &mut ctx)?;
        Ok(output)
    }
}

/// Internal renderer state
struct Renderer<'a> {
    engine: Arc<EngineInner>,
    /// Registry snapshot for this render
    functions: Arc<Functions>,
    /// Current source for error reporting (swapped when rendering nodes
    /// that came from another document)
    source: TemplateSource,
    output: &'a mut String,
}

impl<'a> Renderer<'a> {
    fn evaluator<'c>(&self, ctx: &'c Context) -> Evaluator<'c> {
        Evaluator::new(ctx, self.source.clone(), self.functions.clone())
    }

    /// Render a whole document: its macros become callables in the current
    /// scope, then the body renders.
    fn render_document(&mut self, doc: &Arc<Document>, ctx: &mut Context) -> Result<()> {
        let saved = std::mem::replace(&mut self.source, doc.source.clone());
        for (name, m) in &doc.macros {
            ctx.set(
                name.clone(),
                macro_closure(self.engine.clone(), doc.clone(), m.clone()),
            );
        }
        let result = self.render_nodes(&doc.body, ctx, doc);
        self.source = saved;
        result
    }

    fn render_nodes(
        &mut self,
        nodes: &[Node],
        ctx: &mut Context,
        doc: &Arc<Document>,
    ) -> Result<()> {
        for node in nodes {
            self.render_node(node, ctx, doc)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &Node, ctx: &mut Context, doc: &Arc<Document>) -> Result<()> {
        match node {
            Node::Text(text) => {
                self.output.push_str(&text.text);
            }
            Node::Print(print) => {
                let value = self.evaluator(ctx).eval(&print.expr)?;
                let escaped = escape_value(&value, ctx.escape_mode());
                self.output.push_str(&escaped.render_to_string());
            }
            Node::If(n) => {
                for branch in &n.branches {
                    let take = match &branch.condition {
                        Some(cond) => self.evaluator(ctx).eval(cond)?.to_boolean(),
                        None => true,
                    };
                    if take {
                        self.render_nodes(&branch.body, ctx, doc)?;
                        break;
                    }
                }
            }
            Node::For(n) => {
                let iter_value = self.evaluator(ctx).eval(&n.iter)?;
                let entries = iter_value.entries();

                if entries.is_empty() {
                    if let Some(else_body) = &n.else_body {
                        self.render_nodes(else_body, ctx, doc)?;
                    }
                } else {
                    let len = entries.len();
                    for (index, (key, value)) in entries.into_iter().enumerate() {
                        ctx.push_scope();

                        let mut loop_var = ValueObject::new();
                        loop_var.insert("index0".to_string(), Value::Int(index as i64));
                        loop_var.insert("index".to_string(), Value::Int(index as i64 + 1));
                        loop_var
                            .insert("revindex0".to_string(), Value::Int((len - index - 1) as i64));
                        loop_var.insert("revindex1".to_string(), Value::Int((len - index) as i64));
                        loop_var.insert("first".to_string(), Value::Bool(index == 0));
                        loop_var.insert("last".to_string(), Value::Bool(index == len - 1));
                        loop_var.insert("length".to_string(), Value::Int(len as i64));
                        ctx.set("loop", Value::Object(loop_var));

                        if n.targets.len() == 1 {
                            ctx.set(n.targets[0].name.clone(), value);
                        } else {
                            ctx.set(n.targets[0].name.clone(), key);
                            if let Some(second) = n.targets.get(1) {
                                ctx.set(second.name.clone(), value);
                            }
                        }

                        if let Some(cond) = &n.condition {
                            if !self.evaluator(ctx).eval(cond)?.to_boolean() {
                                ctx.pop_scope();
                                continue;
                            }
                        }

                        let result = self.render_nodes(&n.body, ctx, doc);
                        ctx.pop_scope();
                        result?;
                    }
                }
            }
            Node::Set(n) => {
                let value = self.evaluator(ctx).eval(&n.value)?;
                ctx.set(n.name.name.clone(), value);
            }
            Node::FilterBlock(n) => {
                // Render the body into a scratch buffer, then pipe it
                // through the filter
                let mut scratch = String::new();
                std::mem::swap(self.output, &mut scratch);
                let result = self.render_nodes(&n.body, ctx, doc);
                std::mem::swap(self.output, &mut scratch);
                result?;

                let argv = self.evaluator(ctx).eval_args(
                    Some(Value::String(scratch)),
                    &n.args,
                    &n.kwargs,
                )?;
                let filtered = self.functions.invoke(&n.name.name, &argv)?;
                self.output.push_str(&filtered.render_to_string());
            }
            Node::Block(block) => {
                if let Some(ov) = ctx.block_override(&block.name.name) {
                    // Inside an override, `parent` renders the original body
                    let parent_fn = parent_closure(
                        self.engine.clone(),
                        self.functions.clone(),
                        self.source.clone(),
                        doc.clone(),
                        block.clone(),
                        ctx.clone(),
                    );
                    ctx.push_scope();
                    ctx.set("parent", parent_fn);

                    let saved = std::mem::replace(&mut self.source, ov.doc.source.clone());
                    let result = self.render_nodes(&ov.block.body, ctx, &ov.doc);
                    self.source = saved;

                    ctx.pop_scope();
                    result?;
                } else {
                    self.render_nodes(&block.body, ctx, doc)?;
                }
            }
            Node::Extends(n) => {
                let key = self.evaluator(ctx).eval(&n.source)?.render_to_string();
                let parent = self.engine.compile(&key)?;

                // Top-level blocks of the remaining template override the
                // parent's; overrides already present (from a deeper child)
                // win
                let mut pctx = ctx.clone();
                for child in &n.body {
                    if let Node::Block(b) = child {
                        pctx.add_block_override(
                            b.name.name.clone(),
                            BlockOverride {
                                block: b.clone(),
                                doc: doc.clone(),
                            },
                        );
                    }
                }

                self.render_document(&parent, &mut pctx)?;
            }
            Node::Include(n) => {
                let source_val = self.evaluator(ctx).eval(&n.source)?;
                if let Some(target) =
                    self.resolve_template(&source_val, n.ignore_missing, n.span)?
                {
                    let mut cctx = self.include_context(ctx, &n.with, n.only)?;
                    self.render_document(&target, &mut cctx)?;
                }
            }
            Node::Embed(n) => {
                let source_val = self.evaluator(ctx).eval(&n.source)?;
                if let Some(target) =
                    self.resolve_template(&source_val, n.ignore_missing, n.span)?
                {
                    let mut cctx = self.include_context(ctx, &n.with, n.only)?;
                    for child in &n.body {
                        if let Node::Block(b) = child {
                            cctx.add_block_override(
                                b.name.name.clone(),
                                BlockOverride {
                                    block: b.clone(),
                                    doc: doc.clone(),
                                },
                            );
                        }
                    }
                    self.render_document(&target, &mut cctx)?;
                }
            }
            Node::With(n) => {
                let extension = self.evaluator(ctx).eval(&n.with)?;
                let mut cctx = if n.only {
                    Context::new()
                } else {
                    ctx.clone()
                };
                if let Value::Object(entries) = extension {
                    for (k, v) in entries {
                        cctx.set(k, v);
                    }
                }
                self.render_nodes(&n.body, &mut cctx, doc)?;
            }
            Node::AutoEscape(n) => {
                let mut cctx = ctx.clone();
                cctx.set_escape_mode(n.mode.clone());
                self.render_nodes(&n.body, &mut cctx, doc)?;
            }
            Node::Macro(_) => {
                // Collected into the document at parse time and installed
                // when document rendering begins
            }
            Node::Import(n) => {
                let target = match &n.source {
                    None => doc.clone(),
                    Some(expr) => {
                        let key = self.evaluator(ctx).eval(expr)?.render_to_string();
                        self.engine.compile(&key)?
                    }
                };

                if let Some(ns) = &n.namespace {
                    let mut closures = ValueObject::new();
                    for (name, m) in &target.macros {
                        closures.insert(
                            name.clone(),
                            macro_closure(self.engine.clone(), target.clone(), m.clone()),
                        );
                    }
                    ctx.set(ns.name.clone(), Value::Object(closures));
                } else {
                    for (name, alias) in &n.names {
                        if let Some(m) = target.macros.get(&name.name) {
                            let bound = alias.as_ref().unwrap_or(name).name.clone();
                            ctx.set(
                                bound,
                                macro_closure(self.engine.clone(), target.clone(), m.clone()),
                            );
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve an include/embed source to a compiled document. The source
    /// may be an array of candidate keys; the first loadable one wins.
    /// Load failures are swallowed while candidates remain; compile errors
    /// always propagate.
    fn resolve_template(
        &self,
        source: &Value,
        ignore_missing: bool,
        span: Span,
    ) -> Result<Option<Arc<Document>>> {
        let candidates: Vec<String> = if source.is_array() {
            source
                .entries()
                .into_iter()
                .map(|(_, v)| v.render_to_string())
                .collect()
        } else {
            vec![source.render_to_string()]
        };

        for name in &candidates {
            match self.engine.compile(name) {
                Ok(doc) => return Ok(Some(doc)),
                Err(e) if e.downcast_ref::<LoadError>().is_some() => continue,
                Err(e) => return Err(e),
            }
        }

        if ignore_missing {
            Ok(None)
        } else {
            let first = candidates.first().map(String::as_str).unwrap_or_default();
            Err(RuntimeError::new(
                format!("Failed to load included template: {first}"),
                span,
                &self.source,
            ))?
        }
    }

    /// The context an included/embedded template renders with: the current
    /// one (or a fresh one under `only`), extended by the `with` mapping
    fn include_context(
        &self,
        ctx: &Context,
        with: &Option<Expr>,
        only: bool,
    ) -> Result<Context> {
        let extension = match with {
            Some(expr) => self.evaluator(ctx).eval(expr)?,
            None => Value::Undefined,
        };

        let mut cctx = if only { Context::new() } else { ctx.clone() };
        if let Value::Object(entries) = extension {
            for (k, v) in entries {
                cctx.set(k, v);
            }
        }
        Ok(cctx)
    }
}

/// Build the callable for a macro: a fresh context gets the mapped
/// parameters plus `_args_`/`_kw_` and the sibling macros, the body renders,
/// and the output comes back as a safe string.
fn macro_closure(engine: Arc<EngineInner>, doc: Arc<Document>, mac: Arc<MacroNode>) -> Value {
    Value::function(move |args| {
        let mut mctx = Context::new();

        for (name, sibling) in &doc.macros {
            mctx.set(
                name.clone(),
                macro_closure(engine.clone(), doc.clone(), sibling.clone()),
            );
        }

        let functions = engine.functions();
        bind_macro_args(&mac, args, &mut mctx, &doc.source, &functions)?;

        let mut out = String::new();
        let mut renderer = Renderer {
            engine: engine.clone(),
            functions,
            source: doc.source.clone(),
            output: &mut out,
        };
        renderer.render_nodes(&mac.body, &mut mctx, &doc)?;

        Ok(Value::SafeString(out))
    })
}

/// Map call arguments onto macro parameters: positionals in order, then
/// named arguments by parameter name, then declared defaults; anything
/// still unfilled is Undefined.
fn bind_macro_args(
    mac: &MacroNode,
    args: &Value,
    ctx: &mut Context,
    source: &TemplateSource,
    functions: &Arc<Functions>,
) -> Result<()> {
    let pos_args = args.at("args");
    let kw_args = args.at("kw");

    for (i, param) in mac.params.iter().enumerate() {
        let name = &param.name.name;
        let value = if i < pos_args.len() {
            pos_args.at_index(i as i64)
        } else if !kw_args.at(name).is_undefined() {
            kw_args.at(name)
        } else if let Some(default) = &param.default {
            Evaluator::new(ctx, source.clone(), functions.clone()).eval(default)?
        } else {
            Value::Undefined
        };
        ctx.set(name.clone(), value);
    }

    ctx.set("_args_", pos_args);
    ctx.set("_kw_", kw_args);
    Ok(())
}

/// Build the `parent` callable bound inside an overriding block: renders
/// the original block body with the context captured at the override site.
fn parent_closure(
    engine: Arc<EngineInner>,
    functions: Arc<Functions>,
    source: TemplateSource,
    doc: Arc<Document>,
    block: Arc<BlockNode>,
    ctx: Context,
) -> Value {
    Value::function(move |_args| {
        let mut pctx = ctx.clone();
        let mut out = String::new();
        let mut renderer = Renderer {
            engine: engine.clone(),
            functions: functions.clone(),
            source: source.clone(),
            output: &mut out,
        };
        renderer.render_nodes(&block.body, &mut pctx, &doc)?;
        Ok(Value::SafeString(out))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(pairs: &[(&str, &str)]) -> Engine {
        let mut loader = InMemoryLoader::new();
        for (name, source) in pairs {
            loader.add(*name, *source);
        }
        Engine::new(loader)
    }

    fn render_str(source: &str, data: Value) -> String {
        engine(&[]).render_str(source, &data).unwrap()
    }

    fn obj(pairs: Vec<(&str, Value)>) -> Value {
        pairs.into_iter().collect()
    }

    #[test]
    fn test_simple_text() {
        assert_eq!(render_str("Hello, world!", obj(vec![])), "Hello, world!");
    }

    #[test]
    fn test_variable() {
        assert_eq!(
            render_str("Hello, {{ name }}!", obj(vec![("name", Value::from("Alice"))])),
            "Hello, Alice!"
        );
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        assert_eq!(render_str("[{{ nope }}]", obj(vec![])), "[]");
    }

    #[test]
    fn test_if_else() {
        let t = "{% if show %}yes{% else %}no{% endif %}";
        assert_eq!(render_str(t, obj(vec![("show", Value::Bool(true))])), "yes");
        assert_eq!(render_str(t, obj(vec![("show", Value::Bool(false))])), "no");
    }

    #[test]
    fn test_elif() {
        let t = "{% if a %}A{% elif b %}B{% else %}C{% endif %}";
        assert_eq!(
            render_str(t, obj(vec![("a", Value::Bool(false)), ("b", Value::Bool(true))])),
            "B"
        );
        assert_eq!(
            render_str(t, obj(vec![("a", Value::Bool(false)), ("b", Value::Bool(false))])),
            "C"
        );
    }

    #[test]
    fn test_for_loop() {
        let result = render_str(
            "{% for item in items %}{{ item }} {% endfor %}",
            obj(vec![("items", Value::from(vec!["a", "b", "c"]))]),
        );
        assert_eq!(result, "a b c ");
    }

    #[test]
    fn test_loop_variables() {
        let result = render_str(
            "{% for x in items %}{{ loop.index }}/{{ loop.revindex1 }}{% if not loop.last %},{% endif %}{% endfor %}",
            obj(vec![("items", Value::from(vec!["a", "b", "c"]))]),
        );
        assert_eq!(result, "1/3,2/2,3/1");
    }

    #[test]
    fn test_for_over_object_two_targets() {
        let data: Value = [("m", [("a", 1), ("b", 2)].into_iter().collect::<Value>())]
            .into_iter()
            .collect();
        let result = engine(&[])
            .render_str("{% for k, v in m %}{{ k }}={{ v }};{% endfor %}", &data)
            .unwrap();
        assert_eq!(result, "a=1;b=2;");
    }

    #[test]
    fn test_for_over_array_two_targets() {
        let result = render_str(
            "{% for i, v in items %}{{ i }}:{{ v }} {% endfor %}",
            obj(vec![("items", Value::from(vec!["x", "y"]))]),
        );
        assert_eq!(result, "0:x 1:y ");
    }

    #[test]
    fn test_for_else_on_empty() {
        let t = "{% for x in items %}{{ x }}{% else %}nothing{% endfor %}";
        assert_eq!(
            render_str(t, obj(vec![("items", Value::Array(vec![]))])),
            "nothing"
        );
        assert_eq!(render_str(t, obj(vec![])), "nothing");
    }

    #[test]
    fn test_for_with_condition() {
        let result = render_str(
            "{% for x in items if x % 2 == 0 %}{{ x }}{% endfor %}",
            obj(vec![("items", Value::from(vec![1i64, 2, 3, 4]))]),
        );
        assert_eq!(result, "24");
    }

    #[test]
    fn test_for_scope_does_not_leak() {
        let result = render_str(
            "{% for x in items %}{{ x }}{% endfor %}[{{ x }}]",
            obj(vec![("items", Value::from(vec!["a"]))]),
        );
        assert_eq!(result, "a[]");
    }

    #[test]
    fn test_set() {
        assert_eq!(render_str("{% set x = 1 + 2 %}{{ x }}", obj(vec![])), "3");
    }

    #[test]
    fn test_html_escape() {
        let result = render_str(
            "{{ content }}",
            obj(vec![("content", Value::from("<script>'&\"</script>"))]),
        );
        assert_eq!(
            result,
            "&lt;script&gt;&apos;&amp;&quot;&lt;/script&gt;"
        );
    }

    #[test]
    fn test_safe_filter_skips_escaping() {
        let result = render_str(
            "{{ content | safe }}",
            obj(vec![("content", Value::from("<b>bold</b>"))]),
        );
        assert_eq!(result, "<b>bold</b>");
    }

    #[test]
    fn test_autoescape_block() {
        let data = obj(vec![("x", Value::from("<b>"))]);
        assert_eq!(
            engine(&[])
                .render_str("{% autoescape false %}{{ x }}{% endautoescape %}|{{ x }}", &data)
                .unwrap(),
            "<b>|&lt;b&gt;"
        );
    }

    #[test]
    fn test_autoescape_unknown_mode_passes_through() {
        let data = obj(vec![("x", Value::from("<b>"))]);
        assert_eq!(
            engine(&[])
                .render_str("{% autoescape \"js\" %}{{ x }}{% endautoescape %}", &data)
                .unwrap(),
            "<b>"
        );
    }

    #[test]
    fn test_filter_block() {
        let result = render_str("{% filter upper %}a & b{% endfilter %}", obj(vec![]));
        assert_eq!(result, "A & B");
    }

    #[test]
    fn test_with_block() {
        let data = obj(vec![("outer", Value::from("o"))]);
        let result = engine(&[])
            .render_str(
                "{% with {\"inner\": \"i\"} %}{{ outer }}{{ inner }}{% endwith %}[{{ inner }}]",
                &data,
            )
            .unwrap();
        assert_eq!(result, "oi[]");
    }

    #[test]
    fn test_with_only_hides_outer() {
        let data = obj(vec![("outer", Value::from("o"))]);
        let result = engine(&[])
            .render_str(
                "{% with {\"inner\": \"i\"} only %}[{{ outer }}]{{ inner }}{% endwith %}",
                &data,
            )
            .unwrap();
        assert_eq!(result, "[]i");
    }

    #[test]
    fn test_whitespace_trimming() {
        assert_eq!(
            render_str("a  {{- 'x' -}}  b", obj(vec![])),
            "axb"
        );
        assert_eq!(
            render_str("  {%- if true -%}  y  {%- endif -%}  ", obj(vec![])),
            "y"
        );
    }

    #[test]
    fn test_template_inheritance() {
        let e = engine(&[
            ("base.html", "Header {% block content %}default{% endblock %} Footer"),
            (
                "child.html",
                "{% extends \"base.html\" %}{% block content %}Custom{% endblock %}",
            ),
        ]);
        assert_eq!(
            e.render("child.html", &obj(vec![])).unwrap(),
            "Header Custom Footer"
        );
    }

    #[test]
    fn test_block_default_content() {
        let e = engine(&[
            ("base.html", "{% block main %}DEFAULT{% endblock %}"),
            ("child.html", "{% extends \"base.html\" %}"),
        ]);
        assert_eq!(e.render("child.html", &obj(vec![])).unwrap(), "DEFAULT");
    }

    #[test]
    fn test_multiple_blocks() {
        let e = engine(&[
            (
                "base.html",
                "[{% block a %}A{% endblock %}][{% block b %}B{% endblock %}]",
            ),
            (
                "child.html",
                "{% extends \"base.html\" %}{% block a %}X{% endblock %}",
            ),
        ]);
        assert_eq!(e.render("child.html", &obj(vec![])).unwrap(), "[X][B]");
    }

    #[test]
    fn test_parent_call() {
        let e = engine(&[
            ("p", "A[{% block x %}P{% endblock %}]B"),
            (
                "c",
                "{% extends 'p' %}{% block x %}C-{{ parent() }}-C{% endblock %}",
            ),
        ]);
        assert_eq!(e.render("c", &obj(vec![])).unwrap(), "A[C-P-C]B");
    }

    #[test]
    fn test_deepest_override_wins() {
        let e = engine(&[
            ("base", "{% block x %}base{% endblock %}"),
            ("mid", "{% extends 'base' %}{% block x %}mid{% endblock %}"),
            ("leaf", "{% extends 'mid' %}{% block x %}leaf{% endblock %}"),
        ]);
        assert_eq!(e.render("leaf", &obj(vec![])).unwrap(), "leaf");
    }

    #[test]
    fn test_inheritance_sees_context() {
        let e = engine(&[
            ("base.html", "<title>{% block title %}{% endblock %}</title>"),
            (
                "child.html",
                "{% extends \"base.html\" %}{% block title %}{{ page_title }}{% endblock %}",
            ),
        ]);
        let result = e
            .render("child.html", &obj(vec![("page_title", Value::from("My Page"))]))
            .unwrap();
        assert_eq!(result, "<title>My Page</title>");
    }

    #[test]
    fn test_include() {
        let e = engine(&[
            ("partial", "Hello {{ name }}"),
            ("page", "[{% include 'partial' %}]"),
        ]);
        assert_eq!(
            e.render("page", &obj(vec![("name", Value::from("X"))])).unwrap(),
            "[Hello X]"
        );
    }

    #[test]
    fn test_include_candidate_list() {
        let e = engine(&[
            ("real", "found"),
            ("page", "{% include ['missing', 'real'] %}"),
        ]);
        assert_eq!(e.render("page", &obj(vec![])).unwrap(), "found");
    }

    #[test]
    fn test_include_ignore_missing() {
        let e = engine(&[("page", "a{% include 'nope' ignore missing %}b")]);
        assert_eq!(e.render("page", &obj(vec![])).unwrap(), "ab");
    }

    #[test]
    fn test_include_missing_fails() {
        let e = engine(&[("page", "{% include 'nope' %}")]);
        let err = e.render("page", &obj(vec![])).unwrap_err();
        assert!(err.to_string().contains("Failed to load included template"));
    }

    #[test]
    fn test_include_with_and_only() {
        let e = engine(&[
            ("partial", "{{ a }}{{ b }}"),
            ("page1", "{% include 'partial' with {\"b\": \"B\"} %}"),
            ("page2", "{% include 'partial' with {\"b\": \"B\"} only %}"),
        ]);
        let data = obj(vec![("a", Value::from("A"))]);
        assert_eq!(e.render("page1", &data).unwrap(), "AB");
        assert_eq!(e.render("page2", &data).unwrap(), "B");
    }

    #[test]
    fn test_include_compile_error_propagates() {
        let e = engine(&[
            ("broken", "{% if %}"),
            ("page", "{% include 'broken' ignore missing %}"),
        ]);
        assert!(e.render("page", &obj(vec![])).is_err());
    }

    #[test]
    fn test_embed_overrides_blocks() {
        let e = engine(&[
            ("card", "<div>{% block body %}empty{% endblock %}</div>"),
            (
                "page",
                "{% embed 'card' %}{% block body %}content{% endblock %}{% endembed %}",
            ),
        ]);
        assert_eq!(
            e.render("page", &obj(vec![])).unwrap(),
            "<div>content</div>"
        );
    }

    #[test]
    fn test_macro_direct_call() {
        let result = render_str(
            "{% macro m(x, y) %}<{{ x }}|{{ y }}>{% endmacro %}{{ m(1, y=2) }}",
            obj(vec![]),
        );
        assert_eq!(result, "<1|2>");
    }

    #[test]
    fn test_macro_default_parameter() {
        let result = render_str(
            r#"{% macro greet(name="Guest") %}Hello, {{ name }}!{% endmacro %}{{ greet() }}|{{ greet("Alice") }}"#,
            obj(vec![]),
        );
        assert_eq!(result, "Hello, Guest!|Hello, Alice!");
    }

    #[test]
    fn test_macro_sees_only_its_arguments() {
        let result = render_str(
            "{% macro m() %}[{{ outer }}]{% endmacro %}{{ m() }}",
            obj(vec![("outer", Value::from("o"))]),
        );
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_macro_args_and_kw() {
        let result = render_str(
            "{% macro m(a) %}{{ _args_ | length }}/{{ _kw_.k }}{% endmacro %}{{ m(1, 2, k='v') }}",
            obj(vec![]),
        );
        assert_eq!(result, "2/v");
    }

    #[test]
    fn test_macro_output_is_safe() {
        let result = render_str(
            "{% macro m() %}<b>{% endmacro %}{{ m() }}",
            obj(vec![]),
        );
        assert_eq!(result, "<b>");
    }

    #[test]
    fn test_macro_calls_sibling() {
        let result = render_str(
            "{% macro inner() %}i{% endmacro %}{% macro outer() %}[{{ inner() }}]{% endmacro %}{{ outer() }}",
            obj(vec![]),
        );
        assert_eq!(result, "[i]");
    }

    #[test]
    fn test_import_namespace() {
        let e = engine(&[
            (
                "macros.html",
                "{% macro button(text) %}<button>{{ text }}</button>{% endmacro %}",
            ),
            (
                "page.html",
                "{% import \"macros.html\" as m %}{{ m.button(\"Click\") }}",
            ),
        ]);
        assert_eq!(
            e.render("page.html", &obj(vec![])).unwrap(),
            "<button>Click</button>"
        );
    }

    #[test]
    fn test_from_import_with_alias() {
        let e = engine(&[
            (
                "macros.html",
                "{% macro a() %}A{% endmacro %}{% macro b() %}B{% endmacro %}",
            ),
            (
                "page.html",
                "{% from \"macros.html\" import a, b as bee %}{{ a() }}{{ bee() }}",
            ),
        ]);
        assert_eq!(e.render("page.html", &obj(vec![])).unwrap(), "AB");
    }

    #[test]
    fn test_import_self() {
        let result = render_str(
            "{% macro m() %}x{% endmacro %}{% import self as me %}{{ me.m() }}",
            obj(vec![]),
        );
        assert_eq!(result, "x");
    }

    #[test]
    fn test_global_function_registration() {
        let e = engine(&[]);
        e.register_function("shout", |args| {
            let s = args.at("args").at_index(0).render_to_string();
            Ok(Value::String(s.to_uppercase()))
        });
        assert_eq!(
            e.render_str("{{ shout(word) }}", &obj(vec![("word", Value::from("hi"))]))
                .unwrap(),
            "HI"
        );
    }

    #[test]
    fn test_context_function_value() {
        let data = obj(vec![(
            "greet",
            Value::function(|args| {
                let name = args.at("args").at_index(0).render_to_string();
                Ok(Value::String(format!("Hello, {name}!")))
            }),
        )]);
        assert_eq!(
            engine(&[]).render_str("{{ greet('World') }}", &data).unwrap(),
            "Hello, World!"
        );
    }

    #[test]
    fn test_caching_compiles_once() {
        use std::sync::atomic::AtomicUsize;

        struct CountingLoader {
            count: Arc<AtomicUsize>,
        }
        impl TemplateLoader for CountingLoader {
            fn load(&self, _name: &str) -> Result<String, LoadError> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok("hi {{ x }}".to_string())
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let e = Engine::new(CountingLoader {
            count: count.clone(),
        });
        let data = obj(vec![("x", Value::Int(1))]);
        assert_eq!(e.render("t", &data).unwrap(), "hi 1");
        assert_eq!(e.render("t", &data).unwrap(), "hi 1");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        e.set_caching(false);
        assert_eq!(e.render("t", &data).unwrap(), "hi 1");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_load_error_surfaces() {
        let e = engine(&[]);
        let err = e.render("missing.html", &obj(vec![])).unwrap_err();
        assert!(err.to_string().contains("Cannot find template"));
    }

    #[test]
    fn test_concurrent_renders() {
        let e = Arc::new(engine(&[("t", "{% for i in range(1, 50) %}{{ i }},{% endfor %}")]));
        let expected = e.render("t", &obj(vec![])).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let e = e.clone();
                let expected = expected.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        assert_eq!(e.render("t", &obj(vec![])).unwrap(), expected);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_file_loader() {
        let dir = std::env::temp_dir().join("brindille-file-loader-test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("page.twig"), "file {{ x }}").unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.clone()).unwrap();
        let loader = FileLoader::new(&root).with_suffix(".twig");
        let e = Engine::new(loader);
        assert_eq!(
            e.render("page", &obj(vec![("x", Value::Int(1))])).unwrap(),
            "file 1"
        );
        assert!(e.render("other", &obj(vec![])).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
