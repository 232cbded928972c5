//! memchr-accelerated scanning over decoded document text
//!
//! All stopping points are ASCII delimiters or the end of the input, so every
//! slice handed out is on a character boundary.

use memchr::memmem;
use memchr::{memchr, memchr2};
use std::borrow::Cow;

/// Forward cursor over one markup construct or text run
pub struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    #[inline]
    pub fn new(input: &'a str) -> Self {
        Scanner { input, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    #[inline]
    pub fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    #[inline]
    pub fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    /// Skip S; returns whether anything was skipped
    #[inline]
    pub fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !is_whitespace(b) {
                break;
            }
            self.pos += 1;
        }
        self.pos > start
    }

    #[inline]
    pub fn starts_with(&self, needle: &str) -> bool {
        self.remaining().starts_with(needle)
    }

    /// Consume `keyword` if the input continues with it
    pub fn eat(&mut self, keyword: &str) -> bool {
        if self.starts_with(keyword) {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    /// Read an XML name. Non-ASCII bytes are accepted as name characters.
    pub fn read_name(&mut self) -> Option<&'a str> {
        let start = self.pos;
        match self.peek() {
            Some(b) if is_name_start_char(b) => self.pos += 1,
            _ => return None,
        }
        while let Some(b) = self.peek() {
            if !is_name_char(b) {
                break;
            }
            self.pos += 1;
        }
        Some(&self.input[start..self.pos])
    }

    /// Read a name token (NMTOKEN)
    pub fn read_nmtoken(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if !is_name_char(b) {
                break;
            }
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.input[start..self.pos])
    }

    /// Read a `"..."` or `'...'` literal, returning its content
    pub fn read_quoted(&mut self) -> Option<&'a str> {
        let quote = self.peek().filter(|&q| q == b'"' || q == b'\'')?;
        let start = self.pos + 1;
        let end = memchr(quote, &self.input.as_bytes()[start..])? + start;
        self.pos = end + 1;
        Some(&self.input[start..end])
    }
}

/// Position of the `>` closing the tag or declaration at the start of
/// `input`; `>` inside quoted literals does not count
pub fn find_tag_end(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut pos = 0;
    loop {
        let hit = pos + memchr::memchr3(b'>', b'"', b'\'', &bytes[pos..])?;
        match bytes[hit] {
            b'>' => return Some(hit),
            quote => pos = hit + 1 + memchr(quote, &bytes[hit + 1..])? + 1,
        }
    }
}

/// Offset of `needle` in `haystack`
#[inline]
pub fn find(haystack: &str, needle: &str) -> Option<usize> {
    memmem::find(haystack.as_bytes(), needle.as_bytes())
}

/// Offset of the next `<` or `&`
#[inline]
pub fn find_text_boundary(input: &str) -> Option<usize> {
    memchr2(b'<', b'&', input.as_bytes())
}

/// Whether `input` is a proper prefix of `keyword`, i.e. more input could
/// still complete the keyword
#[inline]
pub fn is_partial(input: &str, keyword: &str) -> bool {
    input.len() < keyword.len() && keyword.starts_with(input)
}

/// Replace each `\r\n` and lone `\r` with `\n`
pub fn normalize_newlines(text: &str) -> Cow<'_, str> {
    if memchr(b'\r', text.as_bytes()).is_none() {
        return Cow::Borrowed(text);
    }
    Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
}

/// Whether the whole string is S
pub fn is_all_whitespace(input: &str) -> bool {
    input.bytes().all(is_whitespace)
}

/// Length of the S run at the start of `input`
pub fn whitespace_len(input: &str) -> usize {
    input.bytes().take_while(|&b| is_whitespace(b)).count()
}

#[inline]
pub fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

#[inline]
pub fn is_name_start_char(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'_' | b':') || b >= 0x80
}

#[inline]
pub fn is_name_char(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b':') || b >= 0x80
}

/// Whether `input` is one well-formed name
pub fn is_name(input: &str) -> bool {
    let mut scanner = Scanner::new(input);
    scanner.read_name().is_some() && scanner.is_eof()
}
