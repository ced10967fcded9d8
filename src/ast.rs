//! AST nodes for the template language
//!
//! Two parallel node families: expression nodes ([`Expr`]) produce a value,
//! content nodes ([`Node`]) append to an output buffer. Control constructs
//! are content nodes owning expression nodes plus child content nodes.
//! Every node carries a [`Span`] for precise error reporting; the tree is
//! parsed once and evaluated many times.

use crate::error::TemplateSource;
use miette::SourceSpan;
use std::collections::HashMap;
use std::sync::Arc;

/// A span in the source (re-export from miette)
pub type Span = SourceSpan;

/// Create a span from offset and length
pub fn span(offset: usize, len: usize) -> Span {
    SourceSpan::new(offset.into(), len)
}

/// Join two spans into the smallest span covering both
pub fn join(start: Span, end: Span) -> Span {
    span(start.offset(), end.offset() + end.len() - start.offset())
}

/// A compiled template: the root content body plus every macro declared
/// anywhere in it, ready for concurrent rendering.
#[derive(Debug, Clone)]
pub struct Document {
    /// The template body (sequence of nodes)
    pub body: Vec<Node>,
    /// Macros declared anywhere in the template, by name
    pub macros: HashMap<String, Arc<MacroNode>>,
    /// The source this document was compiled from
    pub source: TemplateSource,
}

/// A content node in the template tree
#[derive(Debug, Clone)]
pub enum Node {
    /// Raw text (passed through unchanged)
    Text(TextNode),
    /// Expression substitution: {{ expr }}
    Print(PrintNode),
    /// If statement: {% if cond %}...{% endif %}
    If(IfNode),
    /// For loop: {% for item in items %}...{% endfor %}
    For(ForNode),
    /// Assignment: {% set name = expr %}
    Set(SetNode),
    /// Filter block: {% filter name %}...{% endfilter %}
    FilterBlock(FilterBlockNode),
    /// Block definition: {% block name %}...{% endblock %}
    Block(Arc<BlockNode>),
    /// Extends: {% extends expr %} - owns the rest of the template
    Extends(ExtendsNode),
    /// Include: {% include expr %}
    Include(IncludeNode),
    /// Embed: {% embed expr %}...{% endembed %}
    Embed(EmbedNode),
    /// Scope block: {% with expr %}...{% endwith %}
    With(WithNode),
    /// Escape-mode block: {% autoescape "html" %}...{% endautoescape %}
    AutoEscape(AutoEscapeNode),
    /// Macro definition: {% macro name(params) %}...{% endmacro %}
    Macro(Arc<MacroNode>),
    /// Import: {% import expr as ns %} / {% from expr import a as b %}
    Import(ImportNode),
}

impl Node {
    pub fn span(&self) -> Span {
        match self {
            Node::Text(n) => n.span,
            Node::Print(n) => n.span,
            Node::If(n) => n.span,
            Node::For(n) => n.span,
            Node::Set(n) => n.span,
            Node::FilterBlock(n) => n.span,
            Node::Block(n) => n.span,
            Node::Extends(n) => n.span,
            Node::Include(n) => n.span,
            Node::Embed(n) => n.span,
            Node::With(n) => n.span,
            Node::AutoEscape(n) => n.span,
            Node::Macro(n) => n.span,
            Node::Import(n) => n.span,
        }
    }
}

/// Raw text node
#[derive(Debug, Clone)]
pub struct TextNode {
    pub text: String,
    pub span: Span,
}

/// Expression substitution: {{ expr }}
#[derive(Debug, Clone)]
pub struct PrintNode {
    pub expr: Expr,
    pub span: Span,
}

/// If statement: the branches are tried in order, the first with a true
/// condition (or no condition, for else) renders.
#[derive(Debug, Clone)]
pub struct IfNode {
    pub branches: Vec<IfBranch>,
    pub span: Span,
}

/// One branch of an if statement; `condition` is None for else
#[derive(Debug, Clone)]
pub struct IfBranch {
    pub condition: Option<Expr>,
    pub body: Vec<Node>,
    pub span: Span,
}

/// For loop
#[derive(Debug, Clone)]
pub struct ForNode {
    /// Loop variable names: one binds values, two bind (key, value)
    pub targets: Vec<Ident>,
    /// Expression to iterate over
    pub iter: Expr,
    /// Optional per-element filter: {% for x in xs if cond %}
    pub condition: Option<Expr>,
    /// Loop body
    pub body: Vec<Node>,
    /// Optional else body (runs once if the iterable is empty)
    pub else_body: Option<Vec<Node>>,
    pub span: Span,
}

/// Assignment: {% set name = expr %}
#[derive(Debug, Clone)]
pub struct SetNode {
    pub name: Ident,
    pub value: Expr,
    pub span: Span,
}

/// Filter block: the body renders into a scratch buffer which is then piped
/// through the named filter.
#[derive(Debug, Clone)]
pub struct FilterBlockNode {
    pub name: Ident,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(Ident, Expr)>,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Block definition (for inheritance)
#[derive(Debug, Clone)]
pub struct BlockNode {
    pub name: Ident,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Extends a parent template. The rest of the template is the node's body;
/// its top-level blocks become overrides for the parent.
#[derive(Debug, Clone)]
pub struct ExtendsNode {
    pub source: Expr,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Include another template
#[derive(Debug, Clone)]
pub struct IncludeNode {
    /// Template key, or an array of candidate keys (first loadable wins)
    pub source: Expr,
    pub ignore_missing: bool,
    /// Mapping merged into (or replacing, under `only`) the context data
    pub with: Option<Expr>,
    pub only: bool,
    pub span: Span,
}

/// Embed: include plus block overrides declared in the tag body
#[derive(Debug, Clone)]
pub struct EmbedNode {
    pub source: Expr,
    pub ignore_missing: bool,
    pub with: Option<Expr>,
    pub only: bool,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Scope block: {% with expr [only] %}...{% endwith %}
#[derive(Debug, Clone)]
pub struct WithNode {
    pub with: Expr,
    pub only: bool,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Escape-mode block
#[derive(Debug, Clone)]
pub struct AutoEscapeNode {
    /// "html", "no", or any passthrough mode string
    pub mode: String,
    pub body: Vec<Node>,
    pub span: Span,
}

/// Macro definition
#[derive(Debug, Clone)]
pub struct MacroNode {
    pub name: Ident,
    pub params: Vec<MacroParam>,
    pub body: Vec<Node>,
    pub span: Span,
}

/// A macro parameter with optional default value
#[derive(Debug, Clone)]
pub struct MacroParam {
    pub name: Ident,
    pub default: Option<Expr>,
}

/// Import statement. `source` is None for `import self`; `names` is empty
/// for whole-namespace imports (`import ... as ns`).
#[derive(Debug, Clone)]
pub struct ImportNode {
    pub source: Option<Expr>,
    /// Namespace alias for `import ... as ns`
    pub namespace: Option<Ident>,
    /// Selected macros for `from ... import a as b`: (name, alias)
    pub names: Vec<(Ident, Option<Ident>)>,
    pub span: Span,
}

// ============================================================================
// Expressions
// ============================================================================

/// An expression
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal value
    Literal(Literal),
    /// Variable reference
    Var(Ident),
    /// Attribute access: expr.field
    Field(FieldExpr),
    /// Subscript access: `expr[index]`
    Index(IndexExpr),
    /// Filter application: expr | filter(args)
    Filter(FilterExpr),
    /// Binary operation: expr op expr
    Binary(BinaryExpr),
    /// Unary operation: op expr
    Unary(UnaryExpr),
    /// Function call: callee(args)
    Call(CallExpr),
    /// Test: expr is test_name(args), expr is not test_name
    Test(TestExpr),
    /// Regex match: expr ~ 'pattern', expr !~ 'pattern'
    Match(MatchExpr),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal(l) => l.span(),
            Expr::Var(i) => i.span,
            Expr::Field(f) => f.span,
            Expr::Index(i) => i.span,
            Expr::Filter(f) => f.span,
            Expr::Binary(b) => b.span,
            Expr::Unary(u) => u.span,
            Expr::Call(c) => c.span,
            Expr::Test(t) => t.span,
            Expr::Match(m) => m.span,
        }
    }
}

/// A literal value
#[derive(Debug, Clone)]
pub enum Literal {
    String(StringLit),
    Int(IntLit),
    Float(FloatLit),
    Bool(BoolLit),
    Null(NullLit),
    Array(ArrayLit),
    Object(ObjectLit),
}

impl Literal {
    pub fn span(&self) -> Span {
        match self {
            Literal::String(l) => l.span,
            Literal::Int(l) => l.span,
            Literal::Float(l) => l.span,
            Literal::Bool(l) => l.span,
            Literal::Null(l) => l.span,
            Literal::Array(l) => l.span,
            Literal::Object(l) => l.span,
        }
    }
}

/// String literal
#[derive(Debug, Clone)]
pub struct StringLit {
    pub value: String,
    pub span: Span,
}

/// Integer literal
#[derive(Debug, Clone)]
pub struct IntLit {
    pub value: i64,
    pub span: Span,
}

/// Float literal
#[derive(Debug, Clone)]
pub struct FloatLit {
    pub value: f64,
    pub span: Span,
}

/// Boolean literal
#[derive(Debug, Clone)]
pub struct BoolLit {
    pub value: bool,
    pub span: Span,
}

/// Null literal
#[derive(Debug, Clone)]
pub struct NullLit {
    pub span: Span,
}

/// Array literal: [a, b, c]
#[derive(Debug, Clone)]
pub struct ArrayLit {
    pub elements: Vec<Expr>,
    pub span: Span,
}

/// Object literal: {"a": b, "c": d} - keys are string literals
#[derive(Debug, Clone)]
pub struct ObjectLit {
    pub entries: Vec<(StringLit, Expr)>,
    pub span: Span,
}

/// An identifier
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

/// Attribute access: expr.field
#[derive(Debug, Clone)]
pub struct FieldExpr {
    pub base: Box<Expr>,
    pub field: Ident,
    pub span: Span,
}

/// Subscript access: `expr[index]` - string keys use object lookup,
/// integer keys use array indexing
#[derive(Debug, Clone)]
pub struct IndexExpr {
    pub base: Box<Expr>,
    pub index: Box<Expr>,
    pub span: Span,
}

/// Filter application: expr | filter or expr | filter(args, key=value)
#[derive(Debug, Clone)]
pub struct FilterExpr {
    pub expr: Box<Expr>,
    pub filter: Ident,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(Ident, Expr)>,
    pub span: Span,
}

/// Binary expression
#[derive(Debug, Clone)]
pub struct BinaryExpr {
    pub left: Box<Expr>,
    pub op: BinaryOp,
    pub right: Box<Expr>,
    pub span: Span,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // String
    Concat,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical (short-circuit)
    And,
    Or,
    // Membership
    In,
    NotIn,
}

/// Unary expression
#[derive(Debug, Clone)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub expr: Box<Expr>,
    pub span: Span,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

/// Function call
#[derive(Debug, Clone)]
pub struct CallExpr {
    pub callee: Box<Expr>,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(Ident, Expr)>,
    pub span: Span,
}

/// Test: expr is test_name(args) or expr is not test_name
#[derive(Debug, Clone)]
pub struct TestExpr {
    pub expr: Box<Expr>,
    pub test: Ident,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(Ident, Expr)>,
    pub negated: bool,
    pub span: Span,
}

/// Regex match: expr ~ 'pattern' or expr !~ 'pattern'. The pattern
/// compiles at evaluation time so an invalid one is a runtime error.
#[derive(Debug, Clone)]
pub struct MatchExpr {
    pub expr: Box<Expr>,
    pub pattern: StringLit,
    pub negated: bool,
    pub span: Span,
}
