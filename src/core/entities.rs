//! Entity and Character References
//!
//! Recognizes `&name;` and `&#...;` at the start of a text run:
//! - Predefined entities: &lt; &gt; &amp; &quot; &apos;
//! - Numeric character references: &#123; &#x7B;
//!
//! Expansion of declared entities is the tokenizer's job; this module only
//! classifies the reference.

use super::scanner::{is_name_char, is_name_start_char};
use crate::engine::ErrorCode;
use memchr::memchr;

/// A complete reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    Char(char),
    Entity(&'a str),
}

/// Outcome of scanning a reference at the start of some input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefScan<'a> {
    /// The reference and its length, `&` and `;` included
    Complete(Reference<'a>, usize),
    /// The input ends before the reference does
    Partial,
    Invalid(ErrorCode),
}

/// Scan the reference at the start of `input`, which must begin with `&`
pub fn scan_reference(input: &str) -> RefScan<'_> {
    debug_assert!(input.starts_with('&'));
    let bytes = input.as_bytes();
    let Some(semi) = memchr(b';', bytes) else {
        return if reference_prefix_ok(&bytes[1..]) {
            RefScan::Partial
        } else {
            RefScan::Invalid(ErrorCode::InvalidToken)
        };
    };
    let body = &input[1..semi];
    if let Some(digits) = body.strip_prefix('#') {
        return match char_ref(digits) {
            Some(c) => RefScan::Complete(Reference::Char(c), semi + 1),
            None if is_char_ref_syntax(digits) => RefScan::Invalid(ErrorCode::BadCharRef),
            None => RefScan::Invalid(ErrorCode::InvalidToken),
        };
    }
    if super::scanner::is_name(body) {
        RefScan::Complete(Reference::Entity(body), semi + 1)
    } else {
        RefScan::Invalid(ErrorCode::InvalidToken)
    }
}

/// Whether `rest` (after `&`) could still become a reference
fn reference_prefix_ok(rest: &[u8]) -> bool {
    match rest.split_first() {
        None => true,
        Some((b'#', digits)) => match digits.split_first() {
            None => true,
            Some((b'x', hex)) => hex.iter().all(u8::is_ascii_hexdigit),
            Some(_) => digits.iter().all(u8::is_ascii_digit),
        },
        Some((&first, tail)) => is_name_start_char(first) && tail.iter().all(|&b| is_name_char(b)),
    }
}

fn is_char_ref_syntax(digits: &str) -> bool {
    match digits.strip_prefix('x') {
        Some(hex) => !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// Replacement text of a predefined entity
pub fn predefined(name: &str) -> Option<&'static str> {
    match name {
        "lt" => Some("<"),
        "gt" => Some(">"),
        "amp" => Some("&"),
        "quot" => Some("\""),
        "apos" => Some("'"),
        _ => None,
    }
}

/// Decode the digits of a character reference (the part after `&#`).
/// Returns `None` for malformed digits or a code point that is not an XML
/// Char.
pub fn char_ref(digits: &str) -> Option<char> {
    if !is_char_ref_syntax(digits) {
        return None;
    }
    let codepoint = match digits.strip_prefix('x') {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u32>().ok()?,
    };
    if !is_valid_xml_char(codepoint) {
        return None;
    }
    char::from_u32(codepoint)
}

/// Check if a code point is a valid XML 1.0 Char
/// Char ::= #x9 | #xA | #xD | [#x20-#xD7FF] | [#xE000-#xFFFD] | [#x10000-#x10FFFF]
#[inline]
pub fn is_valid_xml_char(codepoint: u32) -> bool {
    matches!(codepoint,
        0x9 | 0xA | 0xD |
        0x20..=0xD7FF |
        0xE000..=0xFFFD |
        0x10000..=0x10FFFF
    )
}

/// Byte offset of the first character that is not an XML Char
pub fn find_invalid_char(text: &str) -> Option<usize> {
    text.char_indices()
        .find(|&(_, c)| !is_valid_xml_char(c as u32))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined() {
        assert_eq!(predefined("lt"), Some("<"));
        assert_eq!(predefined("apos"), Some("'"));
        assert_eq!(predefined("nbsp"), None);
    }

    #[test]
    fn test_numeric_refs() {
        assert_eq!(char_ref("65"), Some('A'));
        assert_eq!(char_ref("x41"), Some('A'));
        assert_eq!(char_ref("x1F600"), Some('😀'));
        assert_eq!(char_ref("0"), None);
        assert_eq!(char_ref("xZZ"), None);
        assert_eq!(char_ref("X41"), None);
    }

    #[test]
    fn test_scan_complete() {
        assert_eq!(scan_reference("&amp;rest"), RefScan::Complete(Reference::Entity("amp"), 5));
        assert_eq!(scan_reference("&#x41;"), RefScan::Complete(Reference::Char('A'), 6));
    }

    #[test]
    fn test_scan_partial_and_invalid() {
        assert_eq!(scan_reference("&am"), RefScan::Partial);
        assert_eq!(scan_reference("&#x4"), RefScan::Partial);
        assert_eq!(scan_reference("&"), RefScan::Partial);
        assert_eq!(scan_reference("& x"), RefScan::Invalid(ErrorCode::InvalidToken));
        assert_eq!(scan_reference("&#1;"), RefScan::Invalid(ErrorCode::BadCharRef));
        assert_eq!(scan_reference("&a b;"), RefScan::Invalid(ErrorCode::InvalidToken));
    }

    #[test]
    fn test_find_invalid_char() {
        assert_eq!(find_invalid_char("ok\ttext\n"), None);
        assert_eq!(find_invalid_char("ab\u{1}c"), Some(2));
        assert_eq!(find_invalid_char("\u{FFFE}"), Some(0));
    }
}
