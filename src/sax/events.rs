//! SAX Event Types
//!
//! Defines the events delivered to host handlers and the closed set of
//! handler-table keys they are registered under.

use super::content::ContentNode;
use crate::engine::{ContentKind, EventSet, Quantifier};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Key under which a handler is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    StartCdataSection,
    EndCdataSection,
    CharacterData,
    Comment,
    Default,
    DefaultExpand,
    StartElement,
    EndElement,
    ExternalEntityRef,
    StartNamespaceDecl,
    EndNamespaceDecl,
    NotationDecl,
    NotStandalone,
    ProcessingInstruction,
    UnparsedEntityDecl,
    EntityDecl,
    StartDoctypeDecl,
    EndDoctypeDecl,
    XmlDecl,
    AttlistDecl,
    SkippedEntity,
    ElementDecl,
}

impl EventKind {
    pub const ALL: [EventKind; 22] = [
        EventKind::StartCdataSection,
        EventKind::EndCdataSection,
        EventKind::CharacterData,
        EventKind::Comment,
        EventKind::Default,
        EventKind::DefaultExpand,
        EventKind::StartElement,
        EventKind::EndElement,
        EventKind::ExternalEntityRef,
        EventKind::StartNamespaceDecl,
        EventKind::EndNamespaceDecl,
        EventKind::NotationDecl,
        EventKind::NotStandalone,
        EventKind::ProcessingInstruction,
        EventKind::UnparsedEntityDecl,
        EventKind::EntityDecl,
        EventKind::StartDoctypeDecl,
        EventKind::EndDoctypeDecl,
        EventKind::XmlDecl,
        EventKind::AttlistDecl,
        EventKind::SkippedEntity,
        EventKind::ElementDecl,
    ];

    /// The handler-table key for this kind
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::StartCdataSection => "StartCdataSection",
            EventKind::EndCdataSection => "EndCdataSection",
            EventKind::CharacterData => "CharacterData",
            EventKind::Comment => "Comment",
            EventKind::Default => "Default",
            EventKind::DefaultExpand => "DefaultExpand",
            EventKind::StartElement => "StartElement",
            EventKind::EndElement => "EndElement",
            EventKind::ExternalEntityRef => "ExternalEntityRef",
            EventKind::StartNamespaceDecl => "StartNamespaceDecl",
            EventKind::EndNamespaceDecl => "EndNamespaceDecl",
            EventKind::NotationDecl => "NotationDecl",
            EventKind::NotStandalone => "NotStandalone",
            EventKind::ProcessingInstruction => "ProcessingInstruction",
            EventKind::UnparsedEntityDecl => "UnparsedEntityDecl",
            EventKind::EntityDecl => "EntityDecl",
            EventKind::StartDoctypeDecl => "StartDoctypeDecl",
            EventKind::EndDoctypeDecl => "EndDoctypeDecl",
            EventKind::XmlDecl => "XmlDecl",
            EventKind::AttlistDecl => "AttlistDecl",
            EventKind::SkippedEntity => "SkippedEntity",
            EventKind::ElementDecl => "ElementDecl",
        }
    }

    /// Engine callbacks to register when this key is present.
    ///
    /// Paired callbacks (element start/end, CDATA start/end, namespace
    /// start/end) are always registered together.
    pub fn registration(self) -> EventSet {
        match self {
            EventKind::StartCdataSection | EventKind::EndCdataSection => {
                EventSet::START_CDATA_SECTION | EventSet::END_CDATA_SECTION
            }
            EventKind::CharacterData => EventSet::CHARACTER_DATA,
            EventKind::Comment => EventSet::COMMENT,
            EventKind::Default => EventSet::DEFAULT,
            EventKind::DefaultExpand => EventSet::DEFAULT_EXPAND,
            EventKind::StartElement | EventKind::EndElement => EventSet::START_ELEMENT | EventSet::END_ELEMENT,
            EventKind::ExternalEntityRef => EventSet::EXTERNAL_ENTITY_REF,
            EventKind::StartNamespaceDecl | EventKind::EndNamespaceDecl => {
                EventSet::START_NAMESPACE_DECL | EventSet::END_NAMESPACE_DECL
            }
            EventKind::NotationDecl => EventSet::NOTATION_DECL,
            EventKind::NotStandalone => EventSet::NOT_STANDALONE,
            EventKind::ProcessingInstruction => EventSet::PROCESSING_INSTRUCTION,
            EventKind::UnparsedEntityDecl => EventSet::UNPARSED_ENTITY_DECL,
            EventKind::EntityDecl => EventSet::ENTITY_DECL,
            EventKind::StartDoctypeDecl => EventSet::START_DOCTYPE_DECL,
            EventKind::EndDoctypeDecl => EventSet::END_DOCTYPE_DECL,
            EventKind::XmlDecl => EventSet::XML_DECL,
            EventKind::AttlistDecl => EventSet::ATTLIST_DECL,
            EventKind::SkippedEntity => EventSet::SKIPPED_ENTITY,
            EventKind::ElementDecl => EventSet::ELEMENT_DECL,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL.iter().copied().find(|k| k.as_str() == s).ok_or(())
    }
}

/// Attributes of one start tag.
///
/// `specified` holds only the names written in the document, in document
/// order. The value map holds every attribute, DTD defaults included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeList {
    specified: Vec<String>,
    values: HashMap<String, String>,
}

impl AttributeList {
    /// Build from an engine attribute vector whose first `specified_count`
    /// entries were written in the document
    pub fn from_engine(attributes: &[(String, String)], specified_count: usize) -> Self {
        let mut list = AttributeList {
            specified: Vec::with_capacity(specified_count),
            values: HashMap::with_capacity(attributes.len()),
        };
        for (i, (name, value)) in attributes.iter().enumerate() {
            if i < specified_count {
                list.specified.push(name.clone());
            }
            list.values.insert(name.clone(), value.clone());
        }
        list
    }

    /// Name of the n-th specified attribute (1-based)
    pub fn position(&self, n: usize) -> Option<&str> {
        n.checked_sub(1).and_then(|i| self.specified.get(i)).map(String::as_str)
    }

    /// Specified attribute names in document order
    pub fn specified(&self) -> &[String] {
        &self.specified
    }

    /// Value of any attribute, specified or defaulted
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Every attribute, in no particular order
    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    /// Number of specified attributes
    #[inline]
    pub fn len(&self) -> usize {
        self.specified.len()
    }

    /// True when no attribute was specified, even if defaults apply
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.specified.is_empty()
    }
}

/// Identification of an external entity handed to the ExternalEntityRef handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRef<'a> {
    pub base: Option<&'a str>,
    pub system_id: &'a str,
    pub public_id: Option<&'a str>,
}

/// An event delivered to a `Notify` handler
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    StartCdataSection,
    EndCdataSection,
    CharacterData(&'a str),
    Comment(&'a str),
    Default(&'a str),
    DefaultExpand(&'a str),
    StartElement {
        name: &'a str,
        attributes: &'a AttributeList,
    },
    EndElement {
        name: &'a str,
    },
    StartNamespaceDecl {
        prefix: Option<&'a str>,
        uri: Option<&'a str>,
    },
    EndNamespaceDecl {
        prefix: Option<&'a str>,
    },
    NotationDecl {
        name: &'a str,
        base: Option<&'a str>,
        system_id: Option<&'a str>,
        public_id: Option<&'a str>,
    },
    ProcessingInstruction {
        target: &'a str,
        data: &'a str,
    },
    UnparsedEntityDecl {
        name: &'a str,
        base: Option<&'a str>,
        system_id: Option<&'a str>,
        public_id: Option<&'a str>,
        notation_name: &'a str,
    },
    EntityDecl {
        name: &'a str,
        is_parameter_entity: bool,
        value: Option<&'a str>,
        base: Option<&'a str>,
        system_id: Option<&'a str>,
        public_id: Option<&'a str>,
        notation_name: Option<&'a str>,
    },
    StartDoctypeDecl {
        name: &'a str,
        system_id: Option<&'a str>,
        public_id: Option<&'a str>,
        has_internal_subset: bool,
    },
    EndDoctypeDecl,
    XmlDecl {
        version: Option<&'a str>,
        encoding: Option<&'a str>,
        standalone: Option<bool>,
    },
    AttlistDecl {
        element_name: &'a str,
        attribute_name: &'a str,
        attribute_type: &'a str,
        default: Option<&'a str>,
        is_required: bool,
    },
    SkippedEntity {
        name: &'a str,
        is_parameter_entity: bool,
    },
    ElementDecl {
        name: &'a str,
        kind: ContentKind,
        /// Absent when the model has no occurrence indicator
        quantifier: Option<Quantifier>,
        /// Absent when the model has no child particles
        children: Option<&'a [ContentNode]>,
    },
}

impl Event<'_> {
    /// The handler-table key this event is dispatched under
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StartCdataSection => EventKind::StartCdataSection,
            Event::EndCdataSection => EventKind::EndCdataSection,
            Event::CharacterData(_) => EventKind::CharacterData,
            Event::Comment(_) => EventKind::Comment,
            Event::Default(_) => EventKind::Default,
            Event::DefaultExpand(_) => EventKind::DefaultExpand,
            Event::StartElement { .. } => EventKind::StartElement,
            Event::EndElement { .. } => EventKind::EndElement,
            Event::StartNamespaceDecl { .. } => EventKind::StartNamespaceDecl,
            Event::EndNamespaceDecl { .. } => EventKind::EndNamespaceDecl,
            Event::NotationDecl { .. } => EventKind::NotationDecl,
            Event::ProcessingInstruction { .. } => EventKind::ProcessingInstruction,
            Event::UnparsedEntityDecl { .. } => EventKind::UnparsedEntityDecl,
            Event::EntityDecl { .. } => EventKind::EntityDecl,
            Event::StartDoctypeDecl { .. } => EventKind::StartDoctypeDecl,
            Event::EndDoctypeDecl => EventKind::EndDoctypeDecl,
            Event::XmlDecl { .. } => EventKind::XmlDecl,
            Event::AttlistDecl { .. } => EventKind::AttlistDecl,
            Event::SkippedEntity { .. } => EventKind::SkippedEntity,
            Event::ElementDecl { .. } => EventKind::ElementDecl,
        }
    }

    /// Text carried by character-like events
    pub fn text(&self) -> Option<&str> {
        match self {
            Event::CharacterData(s) | Event::Comment(s) | Event::Default(s) | Event::DefaultExpand(s) => Some(s),
            _ => None,
        }
    }
}
