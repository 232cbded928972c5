//! Start-Tag and Attribute Parsing
//!
//! Splits a complete start tag into its name and raw attribute values.
//! Reference expansion needs the DTD, so values are normalized by the
//! tokenizer; the whitespace rules live here.

use super::scanner::Scanner;
use std::ops::Range;

/// A specified attribute, as byte ranges into the tag text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub name: Range<usize>,
    /// Value between the quotes, references unexpanded
    pub value: Range<usize>,
}

/// A start tag split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTag {
    pub name: Range<usize>,
    pub attributes: Vec<RawAttribute>,
    /// `<name/>`
    pub is_empty: bool,
}

/// Parse `tag`, which runs from `<` to the closing `>` inclusive.
///
/// On failure returns the offset of the offending byte.
pub fn scan_start_tag(tag: &str) -> Result<RawTag, usize> {
    let mut scanner = Scanner::new(tag);
    scanner.advance(1);
    let name_start = scanner.position();
    scanner.read_name().ok_or(name_start)?;
    let name = name_start..scanner.position();

    let mut attributes = Vec::new();
    loop {
        let separated = scanner.skip_whitespace();
        match scanner.peek() {
            Some(b'>') => {
                return Ok(RawTag {
                    name,
                    attributes,
                    is_empty: false,
                })
            }
            Some(b'/') => {
                let at = scanner.position();
                scanner.advance(1);
                return match scanner.peek() {
                    Some(b'>') => Ok(RawTag {
                        name,
                        attributes,
                        is_empty: true,
                    }),
                    _ => Err(at),
                };
            }
            _ if !separated => return Err(scanner.position()),
            _ => {}
        }

        let attr_start = scanner.position();
        scanner.read_name().ok_or(attr_start)?;
        let attr_name = attr_start..scanner.position();
        scanner.skip_whitespace();
        if !scanner.eat("=") {
            return Err(scanner.position());
        }
        scanner.skip_whitespace();
        let quote_at = scanner.position();
        let value = scanner.read_quoted().ok_or(quote_at)?;
        if let Some(lt) = value.find('<') {
            return Err(quote_at + 1 + lt);
        }
        attributes.push(RawAttribute {
            name: attr_name,
            value: quote_at + 1..quote_at + 1 + value.len(),
        });
    }
}

/// Normalize literal whitespace in an attribute value: each `\r\n`, `\r`,
/// `\n` or `\t` becomes one space
pub fn push_normalized(out: &mut String, literal: &str) {
    let mut chars = literal.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push(' ');
            }
            '\n' | '\t' => out.push(' '),
            c => out.push(c),
        }
    }
}

/// Further normalization of non-CDATA values: drop leading and trailing
/// spaces and collapse runs of spaces
pub fn collapse_spaces(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for token in value.split(' ').filter(|t| !t.is_empty()) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

/// Split a qualified name at its first colon
pub fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => (Some(prefix), local),
        _ => (None, name),
    }
}
