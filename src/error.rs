//! Error types for the template engine
//!
//! Every diagnostic carries the template name and, where available, a labeled
//! span into the source so miette can render line/column reports.

use miette::{Diagnostic, NamedSource, SourceSpan};
use std::sync::Arc;
use thiserror::Error;

/// A named template source, cheap to clone and share between the parser,
/// the compiled document, and any diagnostics raised against it.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    name: String,
    source: Arc<String>,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Arc::new(source.into()),
        }
    }

    /// The template key this source was loaded under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw source text
    pub fn text(&self) -> &str {
        &self.source
    }

    /// Build a miette NamedSource for attaching to a diagnostic
    pub fn named_source(&self) -> NamedSource<String> {
        NamedSource::new(&self.name, (*self.source).clone())
    }

    /// 1-based line and column for a byte offset
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for (i, c) in self.source.char_indices() {
            if i >= offset {
                break;
            }
            if c == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }
}

/// Syntax error raised while compiling a template
#[derive(Debug, Error, Diagnostic)]
#[error("expected {expected}, found {found} at line {line}, column {column}")]
pub struct SyntaxError {
    pub expected: String,
    pub found: String,
    pub line: usize,
    pub column: usize,
    #[label("here")]
    pub span: SourceSpan,
    #[source_code]
    pub src: NamedSource<String>,
}

impl SyntaxError {
    pub fn new(
        expected: impl Into<String>,
        found: impl Into<String>,
        span: SourceSpan,
        source: &TemplateSource,
    ) -> Self {
        let (line, column) = source.line_col(span.offset());
        Self {
            expected: expected.into(),
            found: found.into(),
            line,
            column,
            span,
            src: source.named_source(),
        }
    }
}

/// A template could not be loaded by the configured loader
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
pub struct LoadError {
    /// The key that was requested
    pub name: String,
    /// Human-readable description from the loader
    pub message: String,
}

impl LoadError {
    pub fn not_found(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            message: format!("Cannot find template: {name}"),
            name,
        }
    }
}

/// Evaluation failure with a source location
#[derive(Debug, Error, Diagnostic)]
#[error("{message} at line {line}, column {column}")]
pub struct RuntimeError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    #[label("while evaluating this")]
    pub span: SourceSpan,
    #[source_code]
    pub src: NamedSource<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, span: SourceSpan, source: &TemplateSource) -> Self {
        let (line, column) = source.line_col(span.offset());
        Self {
            message: message.into(),
            line,
            column,
            span,
            src: source.named_source(),
        }
    }
}

/// JSON decode failure (strict mode only; lossy decoding yields Undefined)
#[derive(Debug, Error, Diagnostic)]
#[error("{message} at offset {offset}")]
pub struct JsonError {
    pub message: String,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let src = TemplateSource::new("t", "ab\ncde\nf");
        assert_eq!(src.line_col(0), (1, 1));
        assert_eq!(src.line_col(1), (1, 2));
        assert_eq!(src.line_col(3), (2, 1));
        assert_eq!(src.line_col(5), (2, 3));
        assert_eq!(src.line_col(7), (3, 1));
    }

    #[test]
    fn test_syntax_error_message() {
        let src = TemplateSource::new("t", "{{ }}");
        let err = SyntaxError::new("expression", "ExprClose", (3, 2).into(), &src);
        let msg = err.to_string();
        assert!(msg.contains("line 1"));
        assert!(msg.contains("column 4"));
    }
}
