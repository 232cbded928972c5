//! Input Encoding Detection and Decoding
//!
//! The tokenizer works on UTF-8 text. Input is decoded chunk by chunk from
//! UTF-8, US-ASCII or ISO-8859-1; the encoding comes from an override, a
//! byte order mark, or the `encoding` pseudo-attribute of the XML (or text)
//! declaration, in that order.

use super::entities::find_invalid_char;
use super::scanner::{find, Scanner};
use crate::engine::ErrorCode;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Supported input encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    UsAscii,
    Latin1,
}

impl Encoding {
    /// Look an encoding up by its IANA label, case-insensitively
    pub fn from_label(label: &str) -> Option<Encoding> {
        let label = label.to_ascii_uppercase();
        match label.as_str() {
            "UTF-8" | "UTF8" => Some(Encoding::Utf8),
            "US-ASCII" | "ASCII" => Some(Encoding::UsAscii),
            "ISO-8859-1" | "ISO_8859-1" | "LATIN1" | "LATIN-1" => Some(Encoding::Latin1),
            _ => None,
        }
    }

    /// Input bytes used to encode `c`
    #[inline]
    pub fn width(self, c: char) -> usize {
        match self {
            Encoding::Utf8 => c.len_utf8(),
            Encoding::UsAscii | Encoding::Latin1 => 1,
        }
    }
}

/// Result of looking at the first bytes of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Not enough input to decide yet
    NeedMore,
    /// Decode with this encoding after skipping `skip` bytes
    Found { encoding: Encoding, skip: usize },
}

/// Decide the encoding of an entity from its first bytes.
///
/// `forced` is the encoding set through the parser, which wins over the
/// declaration but not over a UTF-8 byte order mark.
pub fn detect(raw: &[u8], forced: Option<&str>, is_final: bool) -> Result<Detection, ErrorCode> {
    if raw.len() < UTF8_BOM.len() && !is_final && UTF8_BOM.starts_with(raw) && !raw.is_empty() {
        return Ok(Detection::NeedMore);
    }
    if raw.starts_with(&[0xFF, 0xFE]) || raw.starts_with(&[0xFE, 0xFF]) {
        return Err(ErrorCode::UnknownEncoding);
    }
    if raw.starts_with(UTF8_BOM) {
        return Ok(Detection::Found {
            encoding: Encoding::Utf8,
            skip: UTF8_BOM.len(),
        });
    }
    if let Some(label) = forced {
        let encoding = Encoding::from_label(label).ok_or(ErrorCode::UnknownEncoding)?;
        return Ok(Detection::Found { encoding, skip: 0 });
    }
    if raw.starts_with(&[0x00, b'<']) || raw.starts_with(&[b'<', 0x00]) {
        return Err(ErrorCode::UnknownEncoding);
    }

    // The declaration is ASCII in every supported encoding
    let head = match std::str::from_utf8(raw) {
        Ok(head) => head,
        Err(err) => std::str::from_utf8(&raw[..err.valid_up_to()]).unwrap_or_default(),
    };
    if head.len() < 6 && "<?xml ".starts_with(head) && !is_final {
        return Ok(Detection::NeedMore);
    }
    let is_decl = head.starts_with("<?xml") && head.as_bytes().get(5).is_some_and(|&b| super::scanner::is_whitespace(b));
    if !is_decl {
        return Ok(Detection::Found {
            encoding: Encoding::Utf8,
            skip: 0,
        });
    }
    let Some(end) = find(head, "?>") else {
        if is_final {
            return Ok(Detection::Found {
                encoding: Encoding::Utf8,
                skip: 0,
            });
        }
        return Ok(Detection::NeedMore);
    };
    let encoding = match declared_encoding(&head[5..end]) {
        None => Encoding::Utf8,
        Some(label) if label.to_ascii_uppercase().starts_with("UTF-16") => {
            return Err(ErrorCode::IncorrectEncoding);
        }
        Some(label) => Encoding::from_label(label).ok_or(ErrorCode::UnknownEncoding)?,
    };
    Ok(Detection::Found { encoding, skip: 0 })
}

/// Value of the `encoding` pseudo-attribute of a declaration body
pub fn declared_encoding(body: &str) -> Option<&str> {
    let mut scanner = Scanner::new(body);
    loop {
        scanner.skip_whitespace();
        let name = scanner.read_name()?;
        scanner.skip_whitespace();
        if !scanner.eat("=") {
            return None;
        }
        scanner.skip_whitespace();
        let value = scanner.read_quoted()?;
        if name == "encoding" {
            return Some(value);
        }
    }
}

/// Incremental decoder from the input encoding to UTF-8
#[derive(Debug)]
pub struct Decoder {
    encoding: Encoding,
}

/// What one decoding step produced
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Input bytes consumed
    pub consumed: usize,
    /// Set when decoding stopped at bad input; the offending byte is the
    /// first one not consumed
    pub error: Option<ErrorCode>,
}

impl Decoder {
    pub fn new(encoding: Encoding) -> Self {
        Decoder { encoding }
    }

    /// Decode as much of `raw` as possible onto `out`. An incomplete UTF-8
    /// sequence at the end is left unconsumed unless `is_final`.
    pub fn decode(&self, raw: &[u8], out: &mut String, is_final: bool) -> Decoded {
        let (text, mut error) = match self.encoding {
            Encoding::Utf8 => match std::str::from_utf8(raw) {
                Ok(text) => (text.to_string(), None),
                Err(err) => {
                    let valid = std::str::from_utf8(&raw[..err.valid_up_to()]).unwrap_or_default();
                    let error = match err.error_len() {
                        Some(_) => Some(ErrorCode::InvalidToken),
                        None if is_final => Some(ErrorCode::PartialChar),
                        None => None,
                    };
                    (valid.to_string(), error)
                }
            },
            Encoding::UsAscii => {
                let valid = raw.iter().take_while(|b| b.is_ascii()).count();
                let error = (valid < raw.len()).then_some(ErrorCode::InvalidToken);
                (raw[..valid].iter().map(|&b| b as char).collect(), error)
            }
            Encoding::Latin1 => (raw.iter().map(|&b| b as char).collect(), None),
        };

        let text = match find_invalid_char(&text) {
            Some(at) => {
                error = Some(ErrorCode::InvalidToken);
                &text[..at]
            }
            None => text.as_str(),
        };
        out.push_str(text);
        let consumed = text.chars().map(|c| self.encoding.width(c)).sum();
        Decoded { consumed, error }
    }
}
