use std::fmt::Write;

use ruff_python_ast::str::{Quote, TripleQuotes};
use ruff_python_literal::{
    char::is_printable,
    escape::{Escape, UnicodeEscape},
};

use crate::error::{Result, SquashError};

const TRIPLE: &str = "\"\"\"";

/// `repr()` of a string: single quoted unless the text contains single
/// quotes and no double quotes.
pub fn string_repr(value: &str) -> Result<String> {
    UnicodeEscape::with_preferred_quote(value, Quote::Single)
        .str_repr(TripleQuotes::No)
        .to_string()
        .ok_or_else(|| SquashError::Serialization(format!("string of {} bytes", value.len())))
}

/// A `"""` literal that keeps line breaks of `content` as written.
pub fn triple_quoted(content: &str) -> String {
    let mut result = String::with_capacity(content.len() + 2 * TRIPLE.len());
    result.push_str(TRIPLE);
    append_triple_content(content, &mut result);
    result.push_str(TRIPLE);
    result
}

/// A single-line literal using the escapes a `repr()` would.
pub fn single_line(content: &str) -> String {
    let escape = UnicodeEscape::with_preferred_quote(content, Quote::Single);
    let mut body = String::new();
    if let Some(len) = escape.layout().len {
        body.reserve(len);
    }
    // Writing into a String cannot fail.
    let _ = escape.write_body(&mut body);
    let quote = escape.layout().quote.as_char();
    format!("{quote}{body}{quote}")
}

fn append_triple_content(content: &str, buf: &mut String) {
    let mut chars = content.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if content[index..].starts_with(TRIPLE) {
            buf.push('\\');
            buf.push_str(TRIPLE);
            chars.next();
            chars.next();
            continue;
        }
        // A quote right before the closing delimiter would end the literal.
        if ch == '"' && chars.peek().is_none() {
            buf.push_str("\\\"");
            continue;
        }
        push_triple_char(ch, buf);
    }
}

fn push_triple_char(ch: char, buf: &mut String) {
    match ch {
        '\n' | '\t' => buf.push(ch),
        '\r' => buf.push_str("\\r"),
        '\\' => buf.push_str("\\\\"),
        other if should_escape(other) => push_unicode_escape(other, buf),
        other => buf.push(other),
    }
}

fn should_escape(ch: char) -> bool {
    matches!(ch, '\0'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f')
        || (!ch.is_ascii() && !is_printable(ch))
}

fn push_unicode_escape(ch: char, buf: &mut String) {
    let code = ch as u32;
    if code < 0x100 {
        let _ = write!(buf, "\\x{code:02x}");
    } else if code < 0x10000 {
        let _ = write!(buf, "\\u{code:04x}");
    } else {
        let _ = write!(buf, "\\U{code:08x}");
    }
}
