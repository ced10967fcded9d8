//! Parser for the template language
//!
//! Transforms the token stream into a [`Document`] with full span
//! information. Expressions use a fixed precedence ladder: filters bind
//! loosest, then `or`, `and`, `not`, the comparison/containment/test
//! predicates, additive, multiplicative (including `~`), unary sign, and
//! postfix access. Arithmetic is left-associative.

use crate::ast::*;
use crate::error::{SyntaxError, TemplateSource};
use crate::lexer::{Lexer, Token, TokenKind};
use miette::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Parsed call arguments: (positional args, keyword args)
type CallArgs = (Vec<Expr>, Vec<(Ident, Expr)>);

/// Parser state
pub struct Parser {
    lexer: Lexer,
    source: TemplateSource,
    /// Current token
    current: Token,
    /// Previous token (for span info)
    previous: Token,
    /// Pending token (for lookahead pushback)
    pending: Option<Token>,
}

impl Parser {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let source_str: String = source.into();
        let source_arc = Arc::new(source_str.clone());
        let template_source = TemplateSource::new(name, source_str);

        let mut lexer = Lexer::new(source_arc);
        let current = lexer.next_token();
        Self {
            lexer,
            source: template_source,
            current: current.clone(),
            previous: current,
            pending: None,
        }
    }

    /// Parse the full template into a document
    pub fn parse(mut self) -> Result<Document> {
        let body = self.parse_body(&[])?;

        let mut macros = HashMap::new();
        collect_macros(&body, &mut macros);

        Ok(Document {
            body,
            macros,
            source: self.source,
        })
    }

    /// Parse template body until we hit a terminator
    fn parse_body(&mut self, terminators: &[TokenKind]) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();

        loop {
            if self.is_at_end() {
                break;
            }

            // Terminators come after {% so we need to peek one token ahead
            if self.check(&TokenKind::TagOpen) {
                let next = self
                    .pending
                    .take()
                    .unwrap_or_else(|| self.lexer.next_token());
                let is_terminator = terminators
                    .iter()
                    .any(|t| std::mem::discriminant(&next.kind) == std::mem::discriminant(t));

                if is_terminator {
                    // Save the terminator token - caller will consume it
                    self.pending = Some(next);
                    break;
                }

                // Not a terminator: step past the {% so the tag keyword is
                // current and the {% token is previous (for span info)
                let saved_current = std::mem::replace(&mut self.current, next);
                self.previous = saved_current;
                let node = self.parse_tag_body()?;
                nodes.push(node);
                continue;
            }

            nodes.push(self.parse_node()?);
        }

        Ok(nodes)
    }

    /// Parse a tag body after we've seen {% (the keyword is current)
    fn parse_tag_body(&mut self) -> Result<Node> {
        let start = self.previous.span; // The {% token

        match &self.current.kind {
            TokenKind::If => self.parse_if(start),
            TokenKind::For => self.parse_for(start),
            TokenKind::Block => self.parse_block(start),
            TokenKind::Extends => self.parse_extends(start),
            TokenKind::Include => self.parse_include(start),
            TokenKind::Embed => self.parse_embed(start),
            TokenKind::Import => self.parse_import(start),
            TokenKind::From => self.parse_from_import(start),
            TokenKind::Macro => self.parse_macro(start),
            TokenKind::Filter => self.parse_filter_block(start),
            TokenKind::With => self.parse_with(start),
            TokenKind::Autoescape => self.parse_autoescape(start),
            TokenKind::Set => self.parse_set(start),
            _ => {
                let span = self.current.span;
                let found = format!("{:?}", self.current.kind);
                Err(SyntaxError::new(
                    "if, for, block, extends, include, embed, import, from, macro, filter, with, autoescape, or set",
                    found,
                    span,
                    &self.source,
                ))?
            }
        }
    }

    /// Parse a single non-tag node
    fn parse_node(&mut self) -> Result<Node> {
        match &self.current.kind {
            TokenKind::Text(text) => {
                let text = text.clone();
                let span = self.current.span;
                self.advance();
                Ok(Node::Text(TextNode { text, span }))
            }
            TokenKind::ExprOpen => self.parse_print(),
            _ => {
                let span = self.current.span;
                let found = format!("{:?}", self.current.kind);
                Err(SyntaxError::new("text, {{ or {%", found, span, &self.source))?
            }
        }
    }

    /// Parse expression substitution: {{ expr }}
    fn parse_print(&mut self) -> Result<Node> {
        let start = self.current.span;
        self.expect(&TokenKind::ExprOpen)?;

        let expr = self.parse_expr()?;

        self.expect(&TokenKind::ExprClose)?;
        let end = self.previous.span;

        Ok(Node::Print(PrintNode {
            expr,
            span: join(start, end),
        }))
    }

    /// Parse if statement
    fn parse_if(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::If)?;

        let mut branches = Vec::new();

        let condition = self.parse_expr()?;
        self.expect(&TokenKind::TagClose)?;
        let branch_start = start;
        let body = self.parse_body(&[TokenKind::Elif, TokenKind::Else, TokenKind::Endif])?;
        branches.push(IfBranch {
            condition: Some(condition),
            body,
            span: join(branch_start, self.previous.span),
        });

        // Elif branches - peek at pending to check what follows {%
        while self.check(&TokenKind::TagOpen)
            && self
                .pending
                .as_ref()
                .is_some_and(|t| matches!(t.kind, TokenKind::Elif))
        {
            let elif_start = self.current.span;
            self.advance(); // consume TagOpen
            self.advance(); // consume Elif (from pending)
            let condition = self.parse_expr()?;
            self.expect(&TokenKind::TagClose)?;
            let body = self.parse_body(&[TokenKind::Elif, TokenKind::Else, TokenKind::Endif])?;
            branches.push(IfBranch {
                condition: Some(condition),
                body,
                span: join(elif_start, self.previous.span),
            });
        }

        // Else branch
        if self.check(&TokenKind::TagOpen)
            && self
                .pending
                .as_ref()
                .is_some_and(|t| matches!(t.kind, TokenKind::Else))
        {
            let else_start = self.current.span;
            self.advance(); // consume TagOpen
            self.advance(); // consume Else (from pending)
            self.expect(&TokenKind::TagClose)?;
            let body = self.parse_body(&[TokenKind::Endif])?;
            branches.push(IfBranch {
                condition: None,
                body,
                span: join(else_start, self.previous.span),
            });
        }

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endif)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::If(IfNode {
            branches,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse for loop: {% for a, b in expr if cond %}
    fn parse_for(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::For)?;

        let mut targets = vec![self.expect_ident()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            targets.push(self.expect_ident()?);
        }

        self.expect(&TokenKind::In)?;
        let iter = self.parse_expr()?;

        let condition = if self.check(&TokenKind::If) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[TokenKind::Else, TokenKind::Endfor])?;

        let else_body = if self.check(&TokenKind::TagOpen)
            && self
                .pending
                .as_ref()
                .is_some_and(|t| matches!(t.kind, TokenKind::Else))
        {
            self.advance(); // consume TagOpen
            self.advance(); // consume Else (from pending)
            self.expect(&TokenKind::TagClose)?;
            Some(self.parse_body(&[TokenKind::Endfor])?)
        } else {
            None
        };

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endfor)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::For(ForNode {
            targets,
            iter,
            condition,
            body,
            else_body,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse block definition. `{% block name %}body{% endblock %}` is the
    /// container form; `{% block name expr %}` is a self-closing shorthand
    /// printing the expression.
    fn parse_block(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Block)?;

        let name = self.expect_ident()?;

        if !self.check(&TokenKind::TagClose) {
            // Expression shorthand
            let expr = self.parse_expr()?;
            self.expect(&TokenKind::TagClose)?;
            let span = join(start, self.previous.span);
            let body = vec![Node::Print(PrintNode {
                span: expr.span(),
                expr,
            })];
            return Ok(Node::Block(Arc::new(BlockNode { name, body, span })));
        }

        self.expect(&TokenKind::TagClose)?;
        let body = self.parse_body(&[TokenKind::Endblock])?;

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endblock)?;
        // Optional block name after endblock (e.g., {% endblock title %})
        if matches!(&self.current.kind, TokenKind::Ident(_)) {
            self.advance();
        }
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Block(Arc::new(BlockNode {
            name,
            body,
            span: join(start, self.previous.span),
        })))
    }

    /// Parse extends. The tag owns the remainder of the template; its
    /// top-level blocks become overrides for the parent.
    fn parse_extends(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Extends)?;

        let source = self.parse_expr()?;
        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[])?;

        Ok(Node::Extends(ExtendsNode {
            source,
            body,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse the `[ignore missing] [with expr] [only]` option tail shared by
    /// include and embed
    fn parse_include_options(&mut self) -> Result<(bool, Option<Expr>, bool)> {
        let mut ignore_missing = false;
        if self.check(&TokenKind::Ignore) {
            self.advance();
            self.expect(&TokenKind::Missing)?;
            ignore_missing = true;
        }

        let with = if self.check(&TokenKind::With) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        let mut only = false;
        if self.check(&TokenKind::Only) {
            self.advance();
            only = true;
        }

        Ok((ignore_missing, with, only))
    }

    /// Parse include
    fn parse_include(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Include)?;

        let source = self.parse_expr()?;
        let (ignore_missing, with, only) = self.parse_include_options()?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Include(IncludeNode {
            source,
            ignore_missing,
            with,
            only,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse embed: include plus block overrides in the tag body
    fn parse_embed(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Embed)?;

        let source = self.parse_expr()?;
        let (ignore_missing, with, only) = self.parse_include_options()?;
        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[TokenKind::Endembed])?;

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endembed)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Embed(EmbedNode {
            source,
            ignore_missing,
            with,
            only,
            body,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse import: {% import "path" as ns %} or {% import self as ns %}
    fn parse_import(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Import)?;

        let source = self.parse_import_source()?;
        self.expect(&TokenKind::As)?;
        let namespace = self.expect_ident()?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Import(ImportNode {
            source,
            namespace: Some(namespace),
            names: Vec::new(),
            span: join(start, self.previous.span),
        }))
    }

    /// Parse from-import: {% from "path" import a, b as c %}
    fn parse_from_import(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::From)?;

        let source = self.parse_import_source()?;
        self.expect(&TokenKind::Import)?;

        let mut names = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let alias = if self.check(&TokenKind::As) {
                self.advance();
                Some(self.expect_ident()?)
            } else {
                None
            };
            names.push((name, alias));

            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Import(ImportNode {
            source,
            namespace: None,
            names,
            span: join(start, self.previous.span),
        }))
    }

    /// The source of an import: `self` refers to the current document
    fn parse_import_source(&mut self) -> Result<Option<Expr>> {
        if matches!(&self.current.kind, TokenKind::Ident(name) if name == "self") {
            self.advance();
            Ok(None)
        } else {
            Ok(Some(self.parse_expr()?))
        }
    }

    /// Parse macro definition: {% macro name(a, b="default") %}
    fn parse_macro(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Macro)?;

        let name = self.expect_ident()?;

        self.expect(&TokenKind::LParen)?;
        let params = self.parse_macro_params()?;
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[TokenKind::Endmacro])?;

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endmacro)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Macro(Arc::new(MacroNode {
            name,
            params,
            body,
            span: join(start, self.previous.span),
        })))
    }

    /// Parse macro parameters with optional defaults
    fn parse_macro_params(&mut self) -> Result<Vec<MacroParam>> {
        let mut params = Vec::new();

        if !self.check(&TokenKind::RParen) {
            loop {
                let name = self.expect_ident()?;
                let default = if self.check(&TokenKind::Assign) {
                    self.advance();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                params.push(MacroParam { name, default });

                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance();
                if self.check(&TokenKind::RParen) {
                    break;
                }
            }
        }

        Ok(params)
    }

    /// Parse filter block: {% filter name(args) %}...{% endfilter %}
    fn parse_filter_block(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Filter)?;

        let name = self.expect_ident()?;
        let (args, kwargs) = if self.check(&TokenKind::LParen) {
            self.advance();
            let result = self.parse_call_args()?;
            self.expect(&TokenKind::RParen)?;
            result
        } else {
            (Vec::new(), Vec::new())
        };
        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[TokenKind::Endfilter])?;

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endfilter)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::FilterBlock(FilterBlockNode {
            name,
            args,
            kwargs,
            body,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse scope block: {% with expr [only] %}...{% endwith %}
    fn parse_with(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::With)?;

        let with = self.parse_expr()?;
        let mut only = false;
        if self.check(&TokenKind::Only) {
            self.advance();
            only = true;
        }
        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[TokenKind::Endwith])?;

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endwith)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::With(WithNode {
            with,
            only,
            body,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse autoescape block: mode is a string, or `false` for "no"
    fn parse_autoescape(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Autoescape)?;

        let mode = match &self.current.kind {
            TokenKind::False => {
                self.advance();
                "no".to_string()
            }
            TokenKind::String(mode) => {
                let mode = mode.clone();
                self.advance();
                mode
            }
            _ => "html".to_string(),
        };
        self.expect(&TokenKind::TagClose)?;

        let body = self.parse_body(&[TokenKind::Endautoescape])?;

        self.expect(&TokenKind::TagOpen)?;
        self.expect(&TokenKind::Endautoescape)?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::AutoEscape(AutoEscapeNode {
            mode,
            body,
            span: join(start, self.previous.span),
        }))
    }

    /// Parse assignment: {% set name = expr %}
    fn parse_set(&mut self, start: Span) -> Result<Node> {
        self.expect(&TokenKind::Set)?;

        let name = self.expect_ident()?;
        self.expect(&TokenKind::Assign)?;
        let value = self.parse_expr()?;
        self.expect(&TokenKind::TagClose)?;

        Ok(Node::Set(SetNode {
            name,
            value,
            span: join(start, self.previous.span),
        }))
    }

    // ========================================================================
    // Expression parsing (precedence climbing)
    // ========================================================================

    pub(crate) fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_filter()
    }

    /// Filters bind loosest: `a + b | f` pipes the sum through f
    fn parse_filter(&mut self) -> Result<Expr> {
        let mut expr = self.parse_or()?;

        while self.check(&TokenKind::Pipe) {
            self.advance();
            let filter = self.expect_ident()?;

            let (args, kwargs) = if self.check(&TokenKind::LParen) {
                self.advance();
                let result = self.parse_call_args()?;
                self.expect(&TokenKind::RParen)?;
                result
            } else {
                (Vec::new(), Vec::new())
            };

            let span = join(expr.span(), self.previous.span);
            expr = Expr::Filter(FilterExpr {
                expr: Box::new(expr),
                filter,
                args,
                kwargs,
                span,
            });
        }

        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;

        while matches!(self.current.kind, TokenKind::OrOr | TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            let span = join(left.span(), right.span());
            left = Expr::Binary(BinaryExpr {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
                span,
            });
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;

        while matches!(self.current.kind, TokenKind::AndAnd | TokenKind::And) {
            self.advance();
            let right = self.parse_not()?;
            let span = join(left.span(), right.span());
            left = Expr::Binary(BinaryExpr {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
                span,
            });
        }

        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if matches!(self.current.kind, TokenKind::Bang | TokenKind::Not) {
            let start = self.current.span;
            self.advance();
            let expr = self.parse_not()?;
            let span = join(start, expr.span());
            Ok(Expr::Unary(UnaryExpr {
                op: UnaryOp::Not,
                expr: Box::new(expr),
                span,
            }))
        } else {
            self.parse_predicate()
        }
    }

    /// A single optional predicate: comparison, containment, test, or
    /// negated regex match (the positive match is consumed at the
    /// multiplicative level, where `~` lives)
    fn parse_predicate(&mut self) -> Result<Expr> {
        let left = self.parse_add()?;

        // Comparison operators
        let cmp = match &self.current.kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = cmp {
            self.advance();
            let right = self.parse_add()?;
            let span = join(left.span(), right.span());
            return Ok(Expr::Binary(BinaryExpr {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span,
            }));
        }

        // Containment: in / not in
        if self.check(&TokenKind::In) {
            self.advance();
            let right = self.parse_add()?;
            let span = join(left.span(), right.span());
            return Ok(Expr::Binary(BinaryExpr {
                left: Box::new(left),
                op: BinaryOp::In,
                right: Box::new(right),
                span,
            }));
        }
        if self.check(&TokenKind::Not) {
            let saved = self.current.clone();
            self.advance();
            if self.check(&TokenKind::In) {
                self.advance();
                let right = self.parse_add()?;
                let span = join(left.span(), right.span());
                return Ok(Expr::Binary(BinaryExpr {
                    left: Box::new(left),
                    op: BinaryOp::NotIn,
                    right: Box::new(right),
                    span,
                }));
            }
            // Not ours - rewind so the caller sees `not` again
            self.pending = Some(std::mem::replace(&mut self.current, saved));
            return Ok(left);
        }

        // Test: expr is [not] name(args)
        if self.check(&TokenKind::Is) {
            self.advance();
            let negated = if self.check(&TokenKind::Not) {
                self.advance();
                true
            } else {
                false
            };
            let test = self.expect_ident()?;
            let (args, kwargs) = if self.check(&TokenKind::LParen) {
                self.advance();
                let result = self.parse_call_args()?;
                self.expect(&TokenKind::RParen)?;
                result
            } else {
                (Vec::new(), Vec::new())
            };
            let span = join(left.span(), self.previous.span);
            return Ok(Expr::Test(TestExpr {
                expr: Box::new(left),
                test,
                args,
                kwargs,
                negated,
                span,
            }));
        }

        // Negated regex match: expr !~ 'pattern'
        if self.check(&TokenKind::NotTilde) {
            self.advance();
            let pattern = self.expect_string()?;
            let span = join(left.span(), pattern.span);
            return Ok(Expr::Match(MatchExpr {
                expr: Box::new(left),
                pattern,
                negated: true,
                span,
            }));
        }

        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut left = self.parse_mul()?;

        loop {
            let op = match &self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            let span = join(left.span(), right.span());
            left = Expr::Binary(BinaryExpr {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span,
            });
        }

        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                TokenKind::Tilde => {
                    self.advance();
                    // `~` followed by a string literal is the regex-match
                    // predicate; any other operand is concatenation
                    if matches!(self.current.kind, TokenKind::String(_)) {
                        let pattern = self.expect_string()?;
                        let span = join(left.span(), pattern.span);
                        left = Expr::Match(MatchExpr {
                            expr: Box::new(left),
                            pattern,
                            negated: false,
                            span,
                        });
                        break;
                    }
                    let right = self.parse_unary()?;
                    let span = join(left.span(), right.span());
                    left = Expr::Binary(BinaryExpr {
                        left: Box::new(left),
                        op: BinaryOp::Concat,
                        right: Box::new(right),
                        span,
                    });
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            let span = join(left.span(), right.span());
            left = Expr::Binary(BinaryExpr {
                left: Box::new(left),
                op,
                right: Box::new(right),
                span,
            });
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let start = self.current.span;

        if self.check(&TokenKind::Minus) {
            self.advance();
            let expr = self.parse_unary()?;
            let span = join(start, expr.span());
            Ok(Expr::Unary(UnaryExpr {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
                span,
            }))
        } else if self.check(&TokenKind::Plus) {
            self.advance();
            let expr = self.parse_unary()?;
            let span = join(start, expr.span());
            Ok(Expr::Unary(UnaryExpr {
                op: UnaryOp::Pos,
                expr: Box::new(expr),
                span,
            }))
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.check(&TokenKind::Dot) {
                self.advance();
                let field = self.expect_ident()?;
                let span = join(expr.span(), field.span);
                expr = Expr::Field(FieldExpr {
                    base: Box::new(expr),
                    field,
                    span,
                });
            } else if self.check(&TokenKind::LBracket) {
                self.advance();
                let index = self.parse_expr()?;
                self.expect(&TokenKind::RBracket)?;
                let span = join(expr.span(), self.previous.span);
                expr = Expr::Index(IndexExpr {
                    base: Box::new(expr),
                    index: Box::new(index),
                    span,
                });
            } else if self.check(&TokenKind::LParen) {
                self.advance();
                let (args, kwargs) = self.parse_call_args()?;
                self.expect(&TokenKind::RParen)?;
                let span = join(expr.span(), self.previous.span);
                expr = Expr::Call(CallExpr {
                    callee: Box::new(expr),
                    args,
                    kwargs,
                    span,
                });
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current.clone();

        match &token.kind {
            TokenKind::Int(v) => {
                let v = *v;
                self.advance();
                Ok(Expr::Literal(Literal::Int(IntLit {
                    value: v,
                    span: token.span,
                })))
            }
            TokenKind::Float(v) => {
                let v = *v;
                self.advance();
                Ok(Expr::Literal(Literal::Float(FloatLit {
                    value: v,
                    span: token.span,
                })))
            }
            TokenKind::String(v) => {
                let v = v.clone();
                self.advance();
                Ok(Expr::Literal(Literal::String(StringLit {
                    value: v,
                    span: token.span,
                })))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(BoolLit {
                    value: true,
                    span: token.span,
                })))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(BoolLit {
                    value: false,
                    span: token.span,
                })))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(Literal::Null(NullLit { span: token.span })))
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Var(Ident {
                    name,
                    span: token.span,
                }))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let elements = self.parse_array_elements()?;
                self.expect(&TokenKind::RBracket)?;
                let span = join(token.span, self.previous.span);
                Ok(Expr::Literal(Literal::Array(ArrayLit { elements, span })))
            }
            TokenKind::LBrace => {
                self.advance();
                let entries = self.parse_object_entries()?;
                self.expect(&TokenKind::RBrace)?;
                let span = join(token.span, self.previous.span);
                Ok(Expr::Literal(Literal::Object(ObjectLit { entries, span })))
            }
            _ => Err(SyntaxError::new(
                "expression",
                format!("{:?}", token.kind),
                token.span,
                &self.source,
            ))?,
        }
    }

    /// Parse call arguments: positional expressions and name=value pairs
    fn parse_call_args(&mut self) -> Result<CallArgs> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        if !self.check(&TokenKind::RParen) {
            loop {
                // A bare identifier followed by `=` is a keyword argument
                if let TokenKind::Ident(name) = &self.current.kind {
                    let name = name.clone();
                    let ident_token = self.current.clone();

                    self.advance();
                    if self.check(&TokenKind::Assign) {
                        self.advance();
                        let value = self.parse_expr()?;
                        kwargs.push((
                            Ident {
                                name,
                                span: ident_token.span,
                            },
                            value,
                        ));
                    } else {
                        // Positional - rewind and parse the full expression
                        self.pending = Some(std::mem::replace(&mut self.current, ident_token));
                        args.push(self.parse_expr()?);
                    }
                } else {
                    args.push(self.parse_expr()?);
                }

                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance();
                if self.check(&TokenKind::RParen) {
                    break;
                }
            }
        }

        Ok((args, kwargs))
    }

    fn parse_array_elements(&mut self) -> Result<Vec<Expr>> {
        let mut elements = Vec::new();

        if !self.check(&TokenKind::RBracket) {
            elements.push(self.parse_expr()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                if self.check(&TokenKind::RBracket) {
                    break;
                }
                elements.push(self.parse_expr()?);
            }
        }

        Ok(elements)
    }

    fn parse_object_entries(&mut self) -> Result<Vec<(StringLit, Expr)>> {
        let mut entries = Vec::new();

        if !self.check(&TokenKind::RBrace) {
            loop {
                let key = self.expect_string()?;
                self.expect(&TokenKind::Colon)?;
                let value = self.parse_expr()?;
                entries.push((key, value));

                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance();
                if self.check(&TokenKind::RBrace) {
                    break;
                }
            }
        }

        Ok(entries)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn advance(&mut self) {
        let next = self
            .pending
            .take()
            .unwrap_or_else(|| self.lexer.next_token());
        self.previous = std::mem::replace(&mut self.current, next);
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current.kind, TokenKind::Eof)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(SyntaxError::new(
                format!("{kind:?}"),
                format!("{:?}", self.current.kind),
                self.current.span,
                &self.source,
            ))?
        }
    }

    fn expect_ident(&mut self) -> Result<Ident> {
        if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            let span = self.current.span;
            self.advance();
            Ok(Ident { name, span })
        } else {
            Err(SyntaxError::new(
                "identifier",
                format!("{:?}", self.current.kind),
                self.current.span,
                &self.source,
            ))?
        }
    }

    fn expect_string(&mut self) -> Result<StringLit> {
        if let TokenKind::String(value) = &self.current.kind {
            let value = value.clone();
            let span = self.current.span;
            self.advance();
            Ok(StringLit { value, span })
        } else {
            Err(SyntaxError::new(
                "string",
                format!("{:?}", self.current.kind),
                self.current.span,
                &self.source,
            ))?
        }
    }
}

/// Collect every macro declared anywhere in the body into the document's
/// macro table
fn collect_macros(nodes: &[Node], macros: &mut HashMap<String, Arc<MacroNode>>) {
    for node in nodes {
        match node {
            Node::Macro(m) => {
                macros.insert(m.name.name.clone(), m.clone());
                collect_macros(&m.body, macros);
            }
            Node::If(n) => {
                for branch in &n.branches {
                    collect_macros(&branch.body, macros);
                }
            }
            Node::For(n) => {
                collect_macros(&n.body, macros);
                if let Some(else_body) = &n.else_body {
                    collect_macros(else_body, macros);
                }
            }
            Node::FilterBlock(n) => collect_macros(&n.body, macros),
            Node::Block(n) => collect_macros(&n.body, macros),
            Node::Extends(n) => collect_macros(&n.body, macros),
            Node::Embed(n) => collect_macros(&n.body, macros),
            Node::With(n) => collect_macros(&n.body, macros),
            Node::AutoEscape(n) => collect_macros(&n.body, macros),
            _ => {}
        }
    }
}
