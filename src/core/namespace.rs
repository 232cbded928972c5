//! Namespace Resolution
//!
//! Stack-based prefix bindings for namespace processing. A binding made on
//! an element lives until that element's end tag.

use crate::engine::ErrorCode;

/// Well-known namespace URIs
pub mod ns {
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    pub const XMLNS: &str = "http://www.w3.org/2000/xmlns/";
}

/// Namespace binding (prefix -> URI); an empty URI undeclares the default
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    prefix: Option<String>,
    uri: String,
    depth: usize,
}

/// Stack-based namespace resolver
#[derive(Debug, Clone)]
pub struct NamespaceResolver {
    bindings: Vec<Binding>,
    depth: usize,
}

impl Default for NamespaceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceResolver {
    /// Create a resolver with the `xml` prefix pre-bound
    pub fn new() -> Self {
        NamespaceResolver {
            bindings: vec![Binding {
                prefix: Some("xml".to_string()),
                uri: ns::XML.to_string(),
                depth: 0,
            }],
            depth: 0,
        }
    }

    /// Enter a new element scope
    pub fn push_scope(&mut self) {
        self.depth += 1;
    }

    /// Leave an element scope, returning the prefixes it declared in
    /// declaration order
    pub fn pop_scope(&mut self) -> Vec<Option<String>> {
        let mut popped = Vec::new();
        while let Some(binding) = self.bindings.last() {
            if binding.depth < self.depth {
                break;
            }
            if let Some(binding) = self.bindings.pop() {
                popped.push(binding.prefix);
            }
        }
        self.depth = self.depth.saturating_sub(1);
        popped.reverse();
        popped
    }

    /// Bind `prefix` (or the default namespace) in the current scope
    pub fn declare(&mut self, prefix: Option<&str>, uri: &str) -> Result<(), ErrorCode> {
        match prefix {
            Some("xmlns") => return Err(ErrorCode::ReservedPrefixXmlns),
            Some("xml") if uri != ns::XML => return Err(ErrorCode::ReservedPrefixXml),
            Some(_) if uri.is_empty() => return Err(ErrorCode::UndeclaringPrefix),
            _ if uri == ns::XMLNS => return Err(ErrorCode::ReservedPrefixXmlns),
            Some(p) if p != "xml" && uri == ns::XML => return Err(ErrorCode::ReservedPrefixXml),
            None if uri == ns::XML => return Err(ErrorCode::ReservedPrefixXml),
            _ => {}
        }
        self.bindings.push(Binding {
            prefix: prefix.map(str::to_string),
            uri: uri.to_string(),
            depth: self.depth,
        });
        Ok(())
    }

    /// URI bound to `prefix`; `None` for the default namespace when it is
    /// unbound or undeclared
    pub fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|b| b.prefix.as_deref() == prefix)
            .map(|b| b.uri.as_str())
            .filter(|uri| !uri.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_prefix_is_bound() {
        let resolver = NamespaceResolver::new();
        assert_eq!(resolver.resolve(Some("xml")), Some(ns::XML));
        assert_eq!(resolver.resolve(None), None);
    }

    #[test]
    fn test_scope_pop_returns_declared_prefixes() {
        let mut resolver = NamespaceResolver::new();
        resolver.push_scope();
        resolver.declare(Some("a"), "urn:a").unwrap();
        resolver.declare(None, "urn:default").unwrap();
        assert_eq!(resolver.resolve(None), Some("urn:default"));
        assert_eq!(resolver.pop_scope(), vec![Some("a".to_string()), None]);
        assert_eq!(resolver.resolve(Some("a")), None);
    }

    #[test]
    fn test_shadow_and_undeclare_default() {
        let mut resolver = NamespaceResolver::new();
        resolver.push_scope();
        resolver.declare(None, "urn:one").unwrap();
        resolver.push_scope();
        resolver.declare(None, "").unwrap();
        assert_eq!(resolver.resolve(None), None);
        resolver.pop_scope();
        assert_eq!(resolver.resolve(None), Some("urn:one"));
    }

    #[test]
    fn test_reserved_prefixes() {
        let mut resolver = NamespaceResolver::new();
        resolver.push_scope();
        assert_eq!(resolver.declare(Some("xmlns"), "urn:x"), Err(ErrorCode::ReservedPrefixXmlns));
        assert_eq!(resolver.declare(Some("xml"), "urn:x"), Err(ErrorCode::ReservedPrefixXml));
        assert_eq!(resolver.declare(Some("p"), ""), Err(ErrorCode::UndeclaringPrefix));
        assert!(resolver.declare(Some("xml"), ns::XML).is_ok());
    }
}
