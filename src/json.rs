//! JSON codec for [`Value`]
//!
//! The encoder and decoder are hand-written so their behavior is exactly the
//! documented one: the encoder separates container elements with `", "` and
//! escapes the full control range, the decoder prefers integers over floats
//! and re-encodes `\uXXXX` escapes as UTF-8.

use crate::error::JsonError;
use crate::value::{Value, ValueObject};
use std::fmt::Write;

/// Encode a value as JSON. `Undefined` and `Function` encode as `null`.
pub fn to_json(value: &Value) -> String {
    let mut out = String::new();
    encode(value, &mut out);
    out
}

fn encode(value: &Value, out: &mut String) {
    match value {
        Value::Undefined | Value::Null | Value::Function(_) => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => {
            let _ = write!(out, "{f}");
        }
        Value::String(s) | Value::SafeString(s) => escape_string(s, out),
        Value::Array(a) => {
            out.push('[');
            for (i, v) in a.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                encode(v, out);
            }
            out.push(']');
        }
        Value::Object(o) => {
            out.push('{');
            for (i, (k, v)) in o.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                escape_string(k, out);
                out.push_str(": ");
                encode(v, out);
            }
            out.push('}');
        }
    }
}

fn escape_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '/' => out.push_str("\\/"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Decode a JSON document, failing with a [`JsonError`] on malformed input
pub fn from_json_str(src: &str) -> Result<Value, JsonError> {
    let mut parser = JsonParser::new(src);
    parser.parse_value()
}

/// Decode a JSON document, yielding `Undefined` on malformed input
pub fn from_json_str_lossy(src: &str) -> Value {
    from_json_str(src).unwrap_or(Value::Undefined)
}

/// Read and strictly decode a JSON file
pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Value, JsonError> {
    let path = path.as_ref();
    let src = std::fs::read_to_string(path).map_err(|e| JsonError {
        message: format!("cannot read {}: {e}", path.display()),
        offset: 0,
    })?;
    from_json_str(&src)
}

struct JsonParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> JsonParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn fail<T>(&self, message: impl Into<String>) -> Result<T, JsonError> {
        Err(JsonError {
            message: message.into(),
            offset: self.pos,
        })
    }

    fn skip_space(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, token: &str) -> bool {
        self.skip_space();
        if self.src[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Value, JsonError> {
        self.skip_space();
        match self.peek() {
            Some('"') => self.parse_string().map(Value::String),
            Some('[') => self.parse_array(),
            Some('{') => self.parse_object(),
            Some('t') | Some('f') => self.parse_boolean(),
            Some('n') => {
                if self.expect("null") {
                    Ok(Value::Null)
                } else {
                    self.fail("Error parsing json value")
                }
            }
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            _ => self.fail("Error parsing json value"),
        }
    }

    fn parse_boolean(&mut self) -> Result<Value, JsonError> {
        if self.expect("true") {
            Ok(Value::Bool(true))
        } else if self.expect("false") {
            Ok(Value::Bool(false))
        } else {
            self.fail("Error parsing json value")
        }
    }

    fn parse_number(&mut self) -> Result<Value, JsonError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') {
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            self.pos += 1;
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.pos += 1;
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        if text.is_empty() || text == "-" {
            return self.fail("Error parsing json number");
        }
        if let Ok(i) = text.parse::<i64>() {
            Ok(Value::Int(i))
        } else if let Ok(f) = text.parse::<f64>() {
            Ok(Value::Float(f))
        } else {
            self.fail("Error parsing json number")
        }
    }

    fn parse_string(&mut self) -> Result<String, JsonError> {
        if self.advance() != Some('"') {
            return self.fail("Expecting '\"'");
        }
        let mut res = String::new();
        loop {
            match self.advance() {
                None => return self.fail("End of file while parsing string literal"),
                Some('"') => return Ok(res),
                Some('\\') => match self.advance() {
                    Some('"') => res.push('"'),
                    Some('/') => res.push('/'),
                    Some('\\') => res.push('\\'),
                    Some('b') => res.push('\u{8}'),
                    Some('f') => res.push('\u{c}'),
                    Some('n') => res.push('\n'),
                    Some('r') => res.push('\r'),
                    Some('t') => res.push('\t'),
                    Some('u') => {
                        let cp = self.decode_unicode()?;
                        res.push(char::from_u32(cp).unwrap_or('\u{fffd}'));
                    }
                    _ => {
                        return self
                            .fail("Invalid character found while decoding string literal")
                    }
                },
                Some(c) => res.push(c),
            }
        }
    }

    fn decode_unicode(&mut self) -> Result<u32, JsonError> {
        let mut cp: u32 = 0;
        for _ in 0..4 {
            let c = match self.advance() {
                Some(c) => c,
                None => return self.fail("Error while decoding unicode code point"),
            };
            cp = cp * 16
                + match c {
                    '0'..='9' => c as u32 - '0' as u32,
                    'a'..='f' => c as u32 - 'a' as u32 + 10,
                    'A'..='F' => c as u32 - 'A' as u32 + 10,
                    _ => return self.fail("Error while decoding unicode code point"),
                };
        }
        Ok(cp)
    }

    fn parse_array(&mut self) -> Result<Value, JsonError> {
        self.pos += 1; // consume [
        let mut elements = Vec::new();
        loop {
            if self.expect("]") {
                return Ok(Value::Array(elements));
            }
            if !elements.is_empty() && !self.expect(",") {
                return self.fail("Expecting ','");
            }
            self.skip_space();
            elements.push(self.parse_value()?);
        }
    }

    fn parse_object(&mut self) -> Result<Value, JsonError> {
        self.pos += 1; // consume {
        let mut elements = ValueObject::new();
        loop {
            if self.expect("}") {
                return Ok(Value::Object(elements));
            }
            if !elements.is_empty() && !self.expect(",") {
                return self.fail("Expecting ','");
            }
            self.skip_space();
            let key = self.parse_string()?;
            if !self.expect(":") {
                return self.fail("Expecting ':'");
            }
            let value = self.parse_value()?;
            elements.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(to_json(&Value::Null), "null");
        assert_eq!(to_json(&Value::Undefined), "null");
        assert_eq!(to_json(&Value::Bool(true)), "true");
        assert_eq!(to_json(&Value::Bool(false)), "false");
        assert_eq!(to_json(&Value::Int(-3)), "-3");
        assert_eq!(to_json(&Value::Float(2.5)), "2.5");
    }

    #[test]
    fn test_encode_string_escapes() {
        assert_eq!(to_json(&Value::from("a\"b")), r#""a\"b""#);
        assert_eq!(to_json(&Value::from("a/b")), r#""a\/b""#);
        assert_eq!(to_json(&Value::from("a\nb")), r#""a\nb""#);
        assert_eq!(to_json(&Value::from("\u{1}")), r#""""#);
    }

    #[test]
    fn test_encode_containers() {
        let v: Value = [("name", Value::from(3)), ("values", Value::from(vec![2, 7]))]
            .into_iter()
            .collect();
        assert_eq!(to_json(&v), r#"{"name": 3, "values": [2, 7]}"#);
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(from_json_str("null").unwrap(), Value::Null);
        assert_eq!(from_json_str("true").unwrap(), Value::Bool(true));
        // a decoded `false` is a real boolean
        assert_eq!(from_json_str("false").unwrap(), Value::Bool(false));
        assert_eq!(from_json_str("42").unwrap(), Value::Int(42));
        assert_eq!(from_json_str("-1.5").unwrap(), Value::Float(-1.5));
        assert_eq!(from_json_str("1e3").unwrap(), Value::Float(1000.0));
    }

    #[test]
    fn test_decode_string_escapes() {
        assert_eq!(
            from_json_str(r#""a\u00e9b""#).unwrap(),
            Value::from("a\u{e9}b")
        );
        assert_eq!(from_json_str(r#""\t\n""#).unwrap(), Value::from("\t\n"));
    }

    #[test]
    fn test_decode_nested() {
        let v = from_json_str(r#" {"a": [1, {"b": null}], "c": "x"} "#).unwrap();
        assert_eq!(v.at("a").at_index(0), Value::Int(1));
        assert_eq!(v.at("a").at_index(1).at("b"), Value::Null);
        assert_eq!(v.at("c"), Value::from("x"));
    }

    #[test]
    fn test_decode_failure() {
        assert!(from_json_str("{broken").is_err());
        assert!(from_json_str("[1,]").is_err());
        assert_eq!(from_json_str_lossy("{broken"), Value::Undefined);
    }

    #[test]
    fn test_round_trip() {
        let v: Value = [
            ("i", Value::Int(1)),
            ("f", Value::Float(2.5)),
            ("s", Value::from("he\"llo")),
            ("b", Value::Bool(false)),
            ("n", Value::Null),
            ("a", Value::from(vec![1, 2])),
        ]
        .into_iter()
        .collect();
        assert_eq!(from_json_str(&to_json(&v)).unwrap(), v);
    }
}
