//! brindille - a Twig-compatible template engine with rich diagnostics
//!
//! A template language featuring:
//! - Rich diagnostics via miette (line/column error reports)
//! - Parse once, run many times (compiled templates, thread-safe cache)
//! - Template inheritance, includes and embeds
//! - Macro system with imports
//! - Auto-escaping with safe-string tracking
//!
//! # Syntax Overview
//!
//! ```text
//! {{ expr }}                          - Expression substitution
//! {{ value | filter(arg, k=v) }}      - Filters
//! {% if cond %}...{% endif %}         - Conditionals
//! {% for item in items %}...{% endfor %} - Loops
//! {% set name = expr %}               - Assignment
//! {% extends "base.html" %}           - Template inheritance
//! {% block name %}...{% endblock %}   - Block definitions
//! {% include "partial.html" %}        - Template includes
//! {% macro name(args) %}...{% endmacro %} - Macro definitions
//! {% import "m.html" as m %}          - Macro imports
//! {# comment #}                       - Comments
//! {{- ... -}}                         - Whitespace control
//! ```
//!
//! # Example
//!
//! ```
//! use brindille::{Engine, InMemoryLoader, Value};
//!
//! let mut loader = InMemoryLoader::new();
//! loader.add("hello.html", "Hello, {{ name }}!");
//!
//! let engine = Engine::new(loader);
//! let data: Value = [("name", "World")].into_iter().collect();
//!
//! let output = engine.render("hello.html", &data).unwrap();
//! assert_eq!(output, "Hello, World!");
//! ```

pub mod ast;
mod error;
mod eval;
mod functions;
mod json;
pub mod lexer;
pub mod parser;
mod render;
mod value;

pub use error::{JsonError, LoadError, RuntimeError, SyntaxError, TemplateSource};
pub use eval::{BlockOverride, Context};
pub use functions::{call_args, unpack_args, Functions};
pub use json::{from_json_file, from_json_str, from_json_str_lossy, to_json};
pub use render::{Engine, FileLoader, InMemoryLoader, NullLoader, TemplateLoader};
pub use value::{TemplateFn, Value, ValueObject};
