//! Minimal namespace-aware XML infoset.
//!
//! Headers, payload trees and fault details are kept as [`Element`] trees so
//! they can be copied, compared and re-serialized without a DOM owner document.
//! Reading and writing goes through quick-xml; namespace scopes are tracked
//! here so prefixes resolve exactly once, on parse.

use crate::error::{Result, RuntimeError};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

/// Namespace bound to the `xml` prefix.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// A namespace-qualified name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    /// Namespace URI (empty when unqualified)
    pub namespace: String,
    /// Local part
    pub local: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }

    /// An unqualified name.
    pub fn local(local: impl Into<String>) -> Self {
        Self::new("", local)
    }

    /// The empty name, used as the dispatch key of operations without a body part.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.local.is_empty()
    }

    /// Parse the `{ns}local` notation produced by `Display`.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('{').and_then(|rest| rest.split_once('}')) {
            Some((ns, local)) => Self::new(ns, local),
            None => Self::local(s),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

/// An attribute on an [`Element`]. Namespace declarations are not attributes.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: QName,
    pub prefix: Option<String>,
    pub value: String,
}

// prefixes are a serialization detail
impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Attribute {}

/// A child node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An element with its attributes and children.
///
/// Equality compares names, attribute values and children; prefixes and
/// namespace declarations are ignored.
#[derive(Debug, Clone)]
pub struct Element {
    pub name: QName,
    /// Preferred prefix when written back out
    pub prefix: Option<String>,
    /// Namespace declarations carried on this element. Needed for
    /// QName-valued text such as fault codes.
    pub namespaces: Vec<(String, String)>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.attributes == other.attributes
            && self.children == other.children
    }
}

impl Eq for Element {}

impl Element {
    pub fn new(name: QName) -> Self {
        Self {
            name,
            prefix: None,
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Declare `prefix` for `uri` on this element.
    pub fn declare_namespace(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        let prefix = prefix.into();
        let uri = uri.into();
        match self.namespaces.iter_mut().find(|(p, _)| *p == prefix) {
            Some(existing) => existing.1 = uri,
            None => self.namespaces.push((prefix, uri)),
        }
    }

    /// Add bindings inherited from ancestors that this element does not
    /// redeclare, making a detached subtree self-contained.
    pub fn with_inherited(mut self, inherited: &[(String, String)]) -> Self {
        for (prefix, uri) in inherited {
            if !self.namespaces.iter().any(|(p, _)| p == prefix) {
                self.namespaces.push((prefix.clone(), uri.clone()));
            }
        }
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_attribute(mut self, name: QName, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Set (or replace) an attribute value.
    pub fn set_attribute(&mut self, name: QName, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute {
                name,
                prefix: None,
                value,
            }),
        }
    }

    pub fn attribute(&self, name: &QName) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| &a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given name.
    pub fn child(&self, name: &QName) -> Option<&Element> {
        self.elements().find(|e| &e.name == name)
    }

    /// First child element with the given local name, in any namespace.
    pub fn child_local(&self, local: &str) -> Option<&Element> {
        self.elements().find(|e| e.name.local == local)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Parse the first element of `data` into a tree.
    ///
    /// DOCTYPE declarations are rejected; whitespace-only text between
    /// elements is dropped.
    pub fn parse(data: &[u8]) -> Result<Element> {
        let mut reader = Reader::from_reader(data);
        let mut scopes = NamespaceScopes::default();
        let mut stack: Vec<Element> = Vec::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(ref e) => {
                    let element = open_element(e, &mut scopes)?;
                    stack.push(element);
                }
                Event::Empty(ref e) => {
                    let element = open_element(e, &mut scopes)?;
                    scopes.pop();
                    match stack.last_mut() {
                        Some(parent) => parent.push_child(element),
                        None => return Ok(element),
                    }
                }
                Event::End(_) => {
                    scopes.pop();
                    let element = stack
                        .pop()
                        .ok_or_else(|| RuntimeError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_child(element),
                        None => return Ok(element),
                    }
                }
                Event::Text(ref t) => {
                    let text = t.unescape()?;
                    if !text.trim().is_empty() {
                        if let Some(top) = stack.last_mut() {
                            top.children.push(Node::Text(text.into_owned()));
                        }
                    }
                }
                Event::CData(ref c) => {
                    if let Some(top) = stack.last_mut() {
                        top.children
                            .push(Node::Text(String::from_utf8_lossy(c).into_owned()));
                    }
                }
                Event::DocType(_) => {
                    return Err(RuntimeError::Xml(
                        "DOCTYPE declarations are not allowed".to_string(),
                    ))
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Err(RuntimeError::Xml("no root element found".to_string()))
    }

    /// Write this element (and its subtree) to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut scopes = NamespaceScopes::default();
        write_element(self, writer, &mut scopes)
    }

    /// Serialize to UTF-8 bytes without an XML declaration.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Vec::new());
        self.write_to(&mut writer)?;
        Ok(writer.into_inner())
    }

    pub fn to_xml_string(&self) -> Result<String> {
        let bytes = self.to_bytes()?;
        String::from_utf8(bytes).map_err(|e| RuntimeError::Xml(e.to_string()))
    }
}

/// Resolve QName-valued text (`prefix:local`) against the declarations on
/// `path`, outermost element first.
pub fn resolve_qname(text: &str, path: &[&Element]) -> Option<QName> {
    let text = text.trim();
    let (prefix, local) = split_qualified(text);
    let prefix = prefix.unwrap_or("");
    if prefix == "xml" {
        return Some(QName::new(XML_NS, local));
    }
    let found = path
        .iter()
        .rev()
        .flat_map(|e| e.namespaces.iter().rev())
        .find(|(p, _)| p == prefix)
        .map(|(_, uri)| uri.clone());
    match found {
        Some(uri) => Some(QName::new(uri, local)),
        None if prefix.is_empty() => Some(QName::local(local)),
        None => None,
    }
}

/// Stack of in-scope prefix bindings, innermost last.
#[derive(Debug, Default)]
pub(crate) struct NamespaceScopes {
    frames: Vec<Vec<(String, String)>>,
}

impl NamespaceScopes {
    pub(crate) fn push(&mut self, bindings: Vec<(String, String)>) {
        self.frames.push(bindings);
    }

    pub(crate) fn pop(&mut self) {
        self.frames.pop();
    }

    /// Resolve a prefix ("" for the default namespace).
    pub(crate) fn resolve(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NS);
        }
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.iter().rev())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn declare(&mut self, prefix: &str, uri: &str) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push((prefix.to_string(), uri.to_string()));
        }
    }
}

pub(crate) fn split_qualified(raw: &str) -> (Option<&str>, &str) {
    match raw.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, raw),
    }
}

/// Open a start tag: push its namespace declarations and resolve its names.
pub(crate) fn open_element(e: &BytesStart<'_>, scopes: &mut NamespaceScopes) -> Result<Element> {
    let mut declarations = Vec::new();
    let mut raw_attributes = Vec::new();

    for attr in e.attributes() {
        let attr = attr.map_err(|err| RuntimeError::Xml(err.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| RuntimeError::Xml(err.to_string()))?
            .to_string();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            declarations.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declarations.push((prefix.to_string(), value));
        } else {
            raw_attributes.push((key, value));
        }
    }
    scopes.push(declarations.clone());

    let raw_name = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| RuntimeError::Xml(err.to_string()))?
        .to_string();
    let (prefix, local) = split_qualified(&raw_name);
    let namespace = match prefix {
        Some(p) => scopes
            .resolve(p)
            .ok_or_else(|| RuntimeError::Xml(format!("unbound prefix '{}'", p)))?,
        None => scopes.resolve("").unwrap_or(""),
    }
    .to_string();

    let mut element = Element::new(QName::new(namespace, local));
    element.prefix = prefix.map(str::to_string);
    element.namespaces = declarations;

    for (key, value) in raw_attributes {
        let (prefix, local) = split_qualified(&key);
        // unprefixed attributes are never in the default namespace
        let namespace = match prefix {
            Some(p) => scopes
                .resolve(p)
                .ok_or_else(|| RuntimeError::Xml(format!("unbound prefix '{}'", p)))?
                .to_string(),
            None => String::new(),
        };
        element.attributes.push(Attribute {
            name: QName::new(namespace, local),
            prefix: prefix.map(str::to_string),
            value,
        });
    }

    Ok(element)
}

fn write_element<W: Write>(
    element: &Element,
    writer: &mut Writer<W>,
    scopes: &mut NamespaceScopes,
) -> Result<()> {
    scopes.push(Vec::new());
    let mut declarations: Vec<(String, String)> = Vec::new();

    for (prefix, uri) in &element.namespaces {
        if scopes.resolve(prefix) != Some(uri.as_str()) {
            scopes.declare(prefix, uri);
            declarations.push((prefix.clone(), uri.clone()));
        }
    }

    let ns = element.name.namespace.as_str();
    // an unqualified element can only be written unprefixed
    let element_prefix = if ns.is_empty() {
        String::new()
    } else {
        element.prefix.clone().unwrap_or_default()
    };
    if scopes.resolve(&element_prefix).unwrap_or("") != ns {
        scopes.declare(&element_prefix, ns);
        declarations.push((element_prefix.clone(), ns.to_string()));
    }

    let mut attributes: Vec<(String, String)> = Vec::new();
    for (n, attr) in element.attributes.iter().enumerate() {
        if attr.name.namespace.is_empty() {
            attributes.push((attr.name.local.clone(), attr.value.clone()));
            continue;
        }
        // the xml prefix is bound implicitly and may not be redeclared
        if attr.name.namespace == XML_NS {
            attributes.push((format!("xml:{}", attr.name.local), attr.value.clone()));
            continue;
        }
        let prefix = attr
            .prefix
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| format!("ns{}", n));
        if scopes.resolve(&prefix) != Some(attr.name.namespace.as_str()) {
            scopes.declare(&prefix, &attr.name.namespace);
            declarations.push((prefix.clone(), attr.name.namespace.clone()));
        }
        attributes.push((format!("{}:{}", prefix, attr.name.local), attr.value.clone()));
    }

    let tag = if element_prefix.is_empty() {
        element.name.local.clone()
    } else {
        format!("{}:{}", element_prefix, element.name.local)
    };

    let mut start = BytesStart::new(tag.as_str());
    for (prefix, uri) in &declarations {
        if prefix.is_empty() {
            start.push_attribute(("xmlns", uri.as_str()));
        } else {
            let key = format!("xmlns:{}", prefix);
            start.push_attribute((key.as_str(), uri.as_str()));
        }
    }
    for (key, value) in &attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
    } else {
        writer.write_event(Event::Start(start))?;
        for child in &element.children {
            match child {
                Node::Element(e) => write_element(e, writer, scopes)?,
                Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
            }
        }
        writer.write_event(Event::End(BytesEnd::new(tag.as_str())))?;
    }

    scopes.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<m:GetPrice xmlns:m="http://example.org/stock" xmlns:x="urn:x">
  <m:Item x:lang="en">Apples &amp; Pears</m:Item>
  <Plain>1</Plain>
</m:GetPrice>"#;

    #[test]
    fn test_qname_display_and_parse() {
        let q = QName::new("http://example.org/stock", "GetPrice");
        assert_eq!(q.to_string(), "{http://example.org/stock}GetPrice");
        assert_eq!(QName::parse(&q.to_string()), q);
        assert_eq!(QName::empty().to_string(), "{}");
        assert!(QName::parse("{}").is_empty());
    }

    #[test]
    fn test_parse_resolves_namespaces() {
        let root = Element::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(root.name, QName::new("http://example.org/stock", "GetPrice"));
        assert_eq!(root.prefix.as_deref(), Some("m"));

        let item = root.child_local("Item").unwrap();
        assert_eq!(item.name.namespace, "http://example.org/stock");
        assert_eq!(item.text(), "Apples & Pears");
        assert_eq!(item.attribute(&QName::new("urn:x", "lang")), Some("en"));

        let plain = root.child_local("Plain").unwrap();
        assert_eq!(plain.name.namespace, "");
    }

    #[test]
    fn test_write_then_parse_is_equal() {
        let root = Element::parse(SAMPLE.as_bytes()).unwrap();
        let bytes = root.to_bytes().unwrap();
        let reparsed = Element::parse(&bytes).unwrap();
        assert_eq!(root, reparsed);
    }

    #[test]
    fn test_default_namespace_is_declared() {
        let el = Element::new(QName::new("urn:a", "Root"))
            .with_child(Element::new(QName::new("urn:a", "Child")).with_text("v"))
            .with_child(Element::new(QName::local("Bare")));
        let xml = el.to_xml_string().unwrap();
        assert!(xml.starts_with(r#"<Root xmlns="urn:a">"#));
        assert!(xml.contains(r#"<Bare xmlns=""/>"#));
        let reparsed = Element::parse(xml.as_bytes()).unwrap();
        assert_eq!(reparsed.child_local("Bare").unwrap().name.namespace, "");
    }

    #[test]
    fn test_resolve_qname_text() {
        let fault = Element::parse(
            br#"<S:Fault xmlns:S="urn:env"><code xmlns:app="urn:app">app:Broken</code></S:Fault>"#,
        )
        .unwrap();
        let code = fault.child_local("code").unwrap();
        assert_eq!(
            resolve_qname(&code.text(), &[&fault, code]),
            Some(QName::new("urn:app", "Broken"))
        );
        assert_eq!(
            resolve_qname("S:Client", &[&fault, code]),
            Some(QName::new("urn:env", "Client"))
        );
        assert_eq!(resolve_qname("zz:Client", &[&fault, code]), None);
    }

    #[test]
    fn test_inherited_declarations_survive_detach() {
        let env = Element::parse(br#"<e:Env xmlns:e="urn:e" xmlns:c="urn:c"><e:Body><x>c:Code</x></e:Body></e:Env>"#)
            .unwrap();
        let body = env.child_local("Body").unwrap();
        let x = body.child_local("x").unwrap().clone().with_inherited(&env.namespaces);
        let bytes = x.to_bytes().unwrap();
        let reparsed = Element::parse(&bytes).unwrap();
        assert_eq!(resolve_qname(&reparsed.text(), &[&reparsed]), Some(QName::new("urn:c", "Code")));
    }

    #[test]
    fn test_unbound_prefix_rejected() {
        let err = Element::parse(b"<p:Foo/>").unwrap_err();
        assert!(matches!(err, RuntimeError::Xml(_)));
    }

    #[test]
    fn test_doctype_rejected() {
        let err = Element::parse(b"<!DOCTYPE foo []><foo/>").unwrap_err();
        assert!(err.to_string().contains("DOCTYPE"));
    }
}
