//! DTD Declaration Store and Declaration Parsing
//!
//! Holds what the internal subset declared (entities, attribute defaults,
//! standalone status) and parses the individual markup declarations:
//! `<!ELEMENT>`, `<!ATTLIST>`, `<!ENTITY>`, `<!NOTATION>`, the DOCTYPE
//! header and the XML/text declaration.
//!
//! Parsers take the declaration body, i.e. the text after the keyword and
//! before the closing delimiter, and fail with the code to report at the
//! declaration.

use super::entities::{scan_reference, RefScan, Reference};
use super::scanner::{normalize_newlines, Scanner};
use crate::engine::{ContentKind, ErrorCode, ModelParticle, NativeModel, Quantifier};
use memchr::memchr;
use std::collections::HashMap;
use std::rc::Rc;

/// Deepest group nesting accepted in an `<!ELEMENT>` content model
pub const MAX_MODEL_DEPTH: usize = 256;

/// A declared entity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDef {
    /// Replacement text of an internal entity
    pub value: Option<Rc<str>>,
    pub system_id: Option<String>,
    pub public_id: Option<String>,
    /// NDATA notation of an unparsed entity
    pub notation: Option<String>,
    /// Base URI in effect at the declaration
    pub base: Option<String>,
}

impl EntityDef {
    #[inline]
    pub fn is_unparsed(&self) -> bool {
        self.notation.is_some()
    }
}

/// Attribute definition retained for defaulting and normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDefault {
    pub name: String,
    pub is_cdata: bool,
    /// Normalized default value; `None` for #REQUIRED and #IMPLIED
    pub value: Option<String>,
}

/// Declarations shared by a document and its external entities
#[derive(Debug, Clone)]
pub struct Dtd {
    general: HashMap<String, EntityDef>,
    parameter: HashMap<String, EntityDef>,
    attlists: HashMap<String, Vec<AttributeDefault>>,
    /// `standalone="yes"` was declared
    pub standalone: bool,
    /// The document refers to declarations that were not read
    pub has_param_entity_refs: bool,
    /// Cleared when an unread parameter entity may have changed the meaning
    /// of later ENTITY and ATTLIST declarations
    pub keep_processing: bool,
}

impl Default for Dtd {
    fn default() -> Self {
        Dtd {
            general: HashMap::new(),
            parameter: HashMap::new(),
            attlists: HashMap::new(),
            standalone: false,
            has_param_entity_refs: false,
            keep_processing: true,
        }
    }
}

impl Dtd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entity; the first declaration of a name wins. Returns
    /// whether `def` was stored.
    pub fn declare_entity(&mut self, name: &str, def: EntityDef, is_parameter: bool) -> bool {
        let map = if is_parameter { &mut self.parameter } else { &mut self.general };
        if map.contains_key(name) {
            return false;
        }
        map.insert(name.to_string(), def);
        true
    }

    /// Look up a general entity
    #[inline]
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.general.get(name)
    }

    /// Record an attribute definition; the first definition of an attribute
    /// for an element wins
    pub fn declare_attribute(&mut self, element: &str, def: AttributeDefault) {
        let defs = self.attlists.entry(element.to_string()).or_default();
        if !defs.iter().any(|d| d.name == def.name) {
            defs.push(def);
        }
    }

    pub fn attribute(&self, element: &str, name: &str) -> Option<&AttributeDefault> {
        self.attlists.get(element)?.iter().find(|d| d.name == name)
    }

    /// Attribute definitions of an element in declaration order
    pub fn attributes(&self, element: &str) -> &[AttributeDefault] {
        self.attlists.get(element).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Parsed XML or text declaration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmlDeclaration<'a> {
    pub version: Option<&'a str>,
    pub encoding: Option<&'a str>,
    pub standalone: Option<bool>,
}

/// Parse the pseudo-attributes of `<?xml ...?>`. A text declaration (at the
/// start of an external entity) needs an encoding and may not carry
/// `standalone`; an XML declaration needs a version.
pub fn parse_xml_decl(body: &str, is_text_decl: bool) -> Result<XmlDeclaration<'_>, ErrorCode> {
    let code = if is_text_decl {
        ErrorCode::TextDecl
    } else {
        ErrorCode::XmlDecl
    };
    let mut scanner = Scanner::new(body);
    let mut decl = XmlDeclaration::default();
    let mut rank = 0;
    loop {
        let separated = scanner.skip_whitespace();
        if scanner.is_eof() {
            break;
        }
        if !separated {
            return Err(code);
        }
        let name = scanner.read_name().ok_or(code)?;
        scanner.skip_whitespace();
        if !scanner.eat("=") {
            return Err(code);
        }
        scanner.skip_whitespace();
        let value = scanner.read_quoted().ok_or(code)?;
        let next = match name {
            "version" => 1,
            "encoding" => 2,
            "standalone" if !is_text_decl => 3,
            _ => return Err(code),
        };
        if next <= rank {
            return Err(code);
        }
        rank = next;
        match next {
            1 if is_version(value) => decl.version = Some(value),
            2 if is_encoding_name(value) => decl.encoding = Some(value),
            3 => {
                decl.standalone = Some(match value {
                    "yes" => true,
                    "no" => false,
                    _ => return Err(code),
                })
            }
            _ => return Err(code),
        }
    }
    if (!is_text_decl && decl.version.is_none()) || (is_text_decl && decl.encoding.is_none()) {
        return Err(code);
    }
    Ok(decl)
}

fn is_version(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b':' | b'-'))
}

fn is_encoding_name(value: &str) -> bool {
    let mut bytes = value.bytes();
    bytes.next().is_some_and(|b| b.is_ascii_alphabetic())
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Name and external identifier of a document type declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctypeHeader<'a> {
    pub name: &'a str,
    pub system_id: Option<&'a str>,
    pub public_id: Option<String>,
}

/// Offset of the `[` or `>` ending a DOCTYPE header, skipping quoted
/// literals
pub fn find_doctype_header_end(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut pos = 0;
    loop {
        let hit = pos + bytes[pos..]
            .iter()
            .position(|b| matches!(b, b'[' | b'>' | b'"' | b'\''))?;
        match bytes[hit] {
            b'[' | b'>' => return Some(hit),
            quote => pos = hit + 1 + memchr(quote, &bytes[hit + 1..])? + 1,
        }
    }
}

/// Parse the text between `<!DOCTYPE` and the `[` or `>` ending the header
pub fn parse_doctype_header(body: &str) -> Result<DoctypeHeader<'_>, ErrorCode> {
    let mut scanner = Scanner::new(body);
    if !scanner.skip_whitespace() {
        return Err(ErrorCode::Syntax);
    }
    let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
    let separated = scanner.skip_whitespace();
    let (system_id, public_id) = if scanner.is_eof() {
        (None, None)
    } else if separated {
        external_id(&mut scanner, false)?
    } else {
        return Err(ErrorCode::Syntax);
    };
    finish(&mut scanner)?;
    Ok(DoctypeHeader {
        name,
        system_id,
        public_id,
    })
}

/// Parsed `<!ENTITY>` declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDecl<'a> {
    pub name: &'a str,
    pub is_parameter: bool,
    /// Entity value literal as written
    pub literal: Option<&'a str>,
    pub system_id: Option<&'a str>,
    pub public_id: Option<String>,
    pub notation: Option<&'a str>,
}

pub fn parse_entity_decl(body: &str) -> Result<EntityDecl<'_>, ErrorCode> {
    let mut scanner = Scanner::new(body);
    require_whitespace(&mut scanner)?;
    let is_parameter = scanner.eat("%");
    if is_parameter {
        require_whitespace(&mut scanner)?;
    }
    let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
    require_whitespace(&mut scanner)?;

    let mut decl = EntityDecl {
        name,
        is_parameter,
        literal: None,
        system_id: None,
        public_id: None,
        notation: None,
    };
    if matches!(scanner.peek(), Some(b'"' | b'\'')) {
        decl.literal = Some(scanner.read_quoted().ok_or(ErrorCode::Syntax)?);
    } else {
        let (system_id, public_id) = external_id(&mut scanner, false)?;
        decl.system_id = system_id;
        decl.public_id = public_id;
        let separated = scanner.skip_whitespace();
        if !scanner.is_eof() {
            if is_parameter || !separated || !scanner.eat("NDATA") {
                return Err(ErrorCode::Syntax);
            }
            require_whitespace(&mut scanner)?;
            decl.notation = Some(scanner.read_name().ok_or(ErrorCode::Syntax)?);
        }
    }
    finish(&mut scanner)?;
    Ok(decl)
}

/// Replacement text of an entity value literal. Character references are
/// replaced and general entity references kept as written; a parameter
/// entity reference is not allowed in the internal subset.
pub fn entity_value(literal: &str) -> Result<String, ErrorCode> {
    let literal = normalize_newlines(literal);
    let bytes = literal.as_bytes();
    let mut out = String::with_capacity(literal.len());
    let mut start = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'%' => return Err(ErrorCode::ParamEntityRef),
            b'&' => {
                out.push_str(&literal[start..pos]);
                match scan_reference(&literal[pos..]) {
                    RefScan::Complete(Reference::Char(c), len) => {
                        out.push(c);
                        pos += len;
                    }
                    RefScan::Complete(Reference::Entity(_), len) => {
                        out.push_str(&literal[pos..pos + len]);
                        pos += len;
                    }
                    RefScan::Partial => return Err(ErrorCode::InvalidToken),
                    RefScan::Invalid(code) => return Err(code),
                }
                start = pos;
            }
            _ => pos += 1,
        }
    }
    out.push_str(&literal[start..]);
    Ok(out)
}

/// Default declaration of an attribute definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultDecl<'a> {
    Required,
    Implied,
    Fixed(&'a str),
    Value(&'a str),
}

impl DefaultDecl<'_> {
    /// #REQUIRED and #FIXED attributes must be present in a valid document
    pub fn is_required(&self) -> bool {
        matches!(self, DefaultDecl::Required | DefaultDecl::Fixed(_))
    }

    /// Literal default value, unnormalized
    pub fn literal(&self) -> Option<&str> {
        match self {
            DefaultDecl::Fixed(value) | DefaultDecl::Value(value) => Some(value),
            DefaultDecl::Required | DefaultDecl::Implied => None,
        }
    }
}

/// One attribute definition of an `<!ATTLIST>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef<'a> {
    pub name: &'a str,
    /// `CDATA`, `ID`, ..., `(a|b)` or `NOTATION(a|b)`
    pub att_type: String,
    pub default: DefaultDecl<'a>,
}

impl AttributeDef<'_> {
    #[inline]
    pub fn is_cdata(&self) -> bool {
        self.att_type == "CDATA"
    }
}

pub fn parse_attlist_decl(body: &str) -> Result<(&str, Vec<AttributeDef<'_>>), ErrorCode> {
    let mut scanner = Scanner::new(body);
    require_whitespace(&mut scanner)?;
    let element = scanner.read_name().ok_or(ErrorCode::Syntax)?;
    let mut defs = Vec::new();
    loop {
        let separated = scanner.skip_whitespace();
        if scanner.is_eof() {
            break;
        }
        if !separated {
            return Err(ErrorCode::Syntax);
        }
        let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
        require_whitespace(&mut scanner)?;
        let att_type = attribute_type(&mut scanner)?;
        require_whitespace(&mut scanner)?;
        let default = if scanner.eat("#REQUIRED") {
            DefaultDecl::Required
        } else if scanner.eat("#IMPLIED") {
            DefaultDecl::Implied
        } else if scanner.eat("#FIXED") {
            require_whitespace(&mut scanner)?;
            DefaultDecl::Fixed(scanner.read_quoted().ok_or(ErrorCode::Syntax)?)
        } else {
            DefaultDecl::Value(scanner.read_quoted().ok_or(ErrorCode::Syntax)?)
        };
        defs.push(AttributeDef {
            name,
            att_type,
            default,
        });
    }
    Ok((element, defs))
}

fn attribute_type(scanner: &mut Scanner<'_>) -> Result<String, ErrorCode> {
    if scanner.peek() == Some(b'(') {
        return enumeration(scanner, false);
    }
    match scanner.read_name() {
        Some(
            keyword @ ("CDATA" | "ID" | "IDREF" | "IDREFS" | "ENTITY" | "ENTITIES" | "NMTOKEN" | "NMTOKENS"),
        ) => Ok(keyword.to_string()),
        Some("NOTATION") => {
            require_whitespace(scanner)?;
            Ok(format!("NOTATION{}", enumeration(scanner, true)?))
        }
        _ => Err(ErrorCode::Syntax),
    }
}

/// `( tok | tok ... )` with the whitespace removed
fn enumeration(scanner: &mut Scanner<'_>, names: bool) -> Result<String, ErrorCode> {
    if !scanner.eat("(") {
        return Err(ErrorCode::Syntax);
    }
    let mut out = String::from("(");
    loop {
        scanner.skip_whitespace();
        let token = if names {
            scanner.read_name()
        } else {
            scanner.read_nmtoken()
        };
        out.push_str(token.ok_or(ErrorCode::Syntax)?);
        scanner.skip_whitespace();
        if scanner.eat(")") {
            out.push(')');
            return Ok(out);
        }
        if !scanner.eat("|") {
            return Err(ErrorCode::Syntax);
        }
        out.push('|');
    }
}

/// Parsed `<!NOTATION>` declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotationDecl<'a> {
    pub name: &'a str,
    pub system_id: Option<&'a str>,
    pub public_id: Option<String>,
}

pub fn parse_notation_decl(body: &str) -> Result<NotationDecl<'_>, ErrorCode> {
    let mut scanner = Scanner::new(body);
    require_whitespace(&mut scanner)?;
    let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
    require_whitespace(&mut scanner)?;
    let (system_id, public_id) = external_id(&mut scanner, true)?;
    finish(&mut scanner)?;
    Ok(NotationDecl {
        name,
        system_id,
        public_id,
    })
}

/// Content model tree before flattening
#[derive(Debug)]
struct Particle {
    kind: ContentKind,
    quantifier: Quantifier,
    name: Option<String>,
    children: Vec<Particle>,
}

impl Particle {
    fn name(name: &str, quantifier: Quantifier) -> Self {
        Particle {
            kind: ContentKind::Name,
            quantifier,
            name: Some(name.to_string()),
            children: Vec::new(),
        }
    }
}

/// Parse an `<!ELEMENT>` body into the element name and its content model
pub fn parse_element_decl(body: &str) -> Result<(&str, NativeModel), ErrorCode> {
    let mut scanner = Scanner::new(body);
    require_whitespace(&mut scanner)?;
    let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
    require_whitespace(&mut scanner)?;

    let model = if scanner.eat("EMPTY") {
        leaf(ContentKind::Empty)
    } else if scanner.eat("ANY") {
        leaf(ContentKind::Any)
    } else if scanner.eat("(") {
        scanner.skip_whitespace();
        if scanner.eat("#PCDATA") {
            mixed(&mut scanner)?
        } else {
            group(&mut scanner, 1)?
        }
    } else {
        return Err(ErrorCode::Syntax);
    };
    finish(&mut scanner)?;
    Ok((name, flatten(&model)))
}

fn leaf(kind: ContentKind) -> Particle {
    Particle {
        kind,
        quantifier: Quantifier::None,
        name: None,
        children: Vec::new(),
    }
}

/// `(#PCDATA)` or `(#PCDATA | a | b)*`, after `#PCDATA`
fn mixed(scanner: &mut Scanner<'_>) -> Result<Particle, ErrorCode> {
    let mut model = leaf(ContentKind::Mixed);
    loop {
        scanner.skip_whitespace();
        if scanner.eat(")") {
            break;
        }
        if !scanner.eat("|") {
            return Err(ErrorCode::Syntax);
        }
        scanner.skip_whitespace();
        let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
        model.children.push(Particle::name(name, Quantifier::None));
    }
    if scanner.eat("*") {
        model.quantifier = Quantifier::ZeroOrMore;
    } else if !model.children.is_empty() {
        return Err(ErrorCode::Syntax);
    }
    Ok(model)
}

/// A choice or sequence group, after its `(`. `depth` counts the open groups.
fn group(scanner: &mut Scanner<'_>, depth: usize) -> Result<Particle, ErrorCode> {
    if depth > MAX_MODEL_DEPTH {
        return Err(ErrorCode::Syntax);
    }
    let mut children = vec![content_particle(scanner, depth)?];
    let mut separator = None;
    loop {
        scanner.skip_whitespace();
        if scanner.eat(")") {
            break;
        }
        let sep = match scanner.peek() {
            Some(sep @ (b'|' | b',')) => sep,
            _ => return Err(ErrorCode::Syntax),
        };
        if separator.is_some_and(|s| s != sep) {
            return Err(ErrorCode::Syntax);
        }
        separator = Some(sep);
        scanner.advance(1);
        scanner.skip_whitespace();
        children.push(content_particle(scanner, depth)?);
    }
    Ok(Particle {
        kind: if separator == Some(b'|') {
            ContentKind::Choice
        } else {
            ContentKind::Sequence
        },
        quantifier: quantifier(scanner),
        name: None,
        children,
    })
}

fn content_particle(scanner: &mut Scanner<'_>, depth: usize) -> Result<Particle, ErrorCode> {
    scanner.skip_whitespace();
    if scanner.eat("(") {
        scanner.skip_whitespace();
        return group(scanner, depth + 1);
    }
    let name = scanner.read_name().ok_or(ErrorCode::Syntax)?;
    Ok(Particle::name(name, quantifier(scanner)))
}

fn quantifier(scanner: &mut Scanner<'_>) -> Quantifier {
    let quantifier = match scanner.peek() {
        Some(b'?') => Quantifier::Optional,
        Some(b'*') => Quantifier::ZeroOrMore,
        Some(b'+') => Quantifier::OneOrMore,
        _ => return Quantifier::None,
    };
    scanner.advance(1);
    quantifier
}

/// Lay the tree out flat with each particle's children contiguous
fn flatten(root: &Particle) -> NativeModel {
    let mut particles = vec![leaf_particle()];
    place(root, 0, &mut particles);
    NativeModel::from_particles(particles)
}

fn leaf_particle() -> ModelParticle {
    ModelParticle {
        kind: ContentKind::Empty,
        quantifier: Quantifier::None,
        name: None,
        children: 0..0,
    }
}

fn place(root: &Particle, at: usize, out: &mut Vec<ModelParticle>) {
    let mut pending = vec![(root, at)];
    while let Some((node, at)) = pending.pop() {
        let first = out.len();
        out.extend(node.children.iter().map(|_| leaf_particle()));
        out[at] = ModelParticle {
            kind: node.kind,
            quantifier: node.quantifier,
            name: node.name.clone(),
            children: first..first + node.children.len(),
        };
        pending.extend(node.children.iter().enumerate().rev().map(|(i, child)| (child, first + i)));
    }
}

/// `SYSTEM "sys"`, `PUBLIC "pub" "sys"`, or for notations `PUBLIC "pub"`
fn external_id<'a>(
    scanner: &mut Scanner<'a>,
    public_alone: bool,
) -> Result<(Option<&'a str>, Option<String>), ErrorCode> {
    if scanner.eat("SYSTEM") {
        require_whitespace(scanner)?;
        let system_id = scanner.read_quoted().ok_or(ErrorCode::Syntax)?;
        return Ok((Some(system_id), None));
    }
    if !scanner.eat("PUBLIC") {
        return Err(ErrorCode::Syntax);
    }
    require_whitespace(scanner)?;
    let public_id = scanner.read_quoted().ok_or(ErrorCode::Syntax)?;
    let public_id = public_id.split_ascii_whitespace().collect::<Vec<_>>().join(" ");
    let checkpoint = scanner.position();
    let separated = scanner.skip_whitespace();
    if public_alone && !matches!(scanner.peek(), Some(b'"' | b'\'')) {
        scanner.set_position(checkpoint);
        return Ok((None, Some(public_id)));
    }
    if !separated {
        return Err(ErrorCode::Syntax);
    }
    let system_id = scanner.read_quoted().ok_or(ErrorCode::Syntax)?;
    Ok((Some(system_id), Some(public_id)))
}

fn require_whitespace(scanner: &mut Scanner<'_>) -> Result<(), ErrorCode> {
    if scanner.skip_whitespace() {
        Ok(())
    } else {
        Err(ErrorCode::Syntax)
    }
}

/// Only whitespace may follow
fn finish(scanner: &mut Scanner<'_>) -> Result<(), ErrorCode> {
    scanner.skip_whitespace();
    if scanner.is_eof() {
        Ok(())
    } else {
        Err(ErrorCode::Syntax)
    }
}
