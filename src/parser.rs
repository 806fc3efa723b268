//! SOAP XML parsing utilities.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).
//! Raw input is additionally pre-scanned for DOCTYPE and entity declarations
//! before it reaches the parser.

use crate::binding::SoapVersion;
use crate::error::{Result, RuntimeError, Violation, ViolationCode};
use crate::infoset::{open_element, Element, NamespaceScopes, QName};
use crate::message::{Header, HeaderList, Message};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::Read;

/// WS-Security namespace URIs.
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";

/// Upper bound on bytes pulled from a stream to find the payload start tag.
pub const SNIFF_LIMIT: usize = 64 * 1024;

const SNIFF_CHUNK: usize = 4096;

/// Parse raw bytes as a SOAP envelope.
///
/// The first Body child becomes the payload; Header children become header
/// blocks. Both are detached with the namespace bindings of their ancestors so
/// QName-valued content stays resolvable.
pub fn parse_soap_envelope(data: &[u8]) -> Result<Message> {
    let envelope = Element::parse(data)?;
    if envelope.name.local != "Envelope" {
        return Err(RuntimeError::InvalidEnvelope(format!(
            "expected Envelope, found {}",
            envelope.name
        )));
    }
    let version = SoapVersion::from_namespace(&envelope.name.namespace).ok_or_else(|| {
        RuntimeError::InvalidEnvelope(format!(
            "unrecognized envelope namespace '{}'",
            envelope.name.namespace
        ))
    })?;
    let env_ns = version.namespace();

    let mut headers = HeaderList::new();
    let mut payload = None;
    let mut seen_body = false;

    for section in envelope.elements() {
        if section.name.namespace != env_ns {
            return Err(RuntimeError::InvalidEnvelope(format!(
                "unexpected envelope child {}",
                section.name
            )));
        }
        let inherited = merged_scope(&envelope, section);
        match section.name.local.as_str() {
            "Header" if !seen_body => {
                for block in section.elements() {
                    headers.add(Header::new(block.clone().with_inherited(&inherited)));
                }
            }
            "Body" if !seen_body => {
                seen_body = true;
                payload = section
                    .elements()
                    .next()
                    .map(|e| e.clone().with_inherited(&inherited));
            }
            other => {
                return Err(RuntimeError::InvalidEnvelope(format!(
                    "unexpected envelope element '{}'",
                    other
                )))
            }
        }
    }

    if !seen_body {
        return Err(RuntimeError::InvalidEnvelope(
            "envelope has no Body".to_string(),
        ));
    }

    let message = match payload {
        Some(element) => Message::from_element(version, element),
        None => Message::empty(version),
    };
    Ok(message.with_headers(headers))
}

/// Bindings in scope at `section`, innermost winning.
fn merged_scope(envelope: &Element, section: &Element) -> Vec<(String, String)> {
    let mut merged = section.namespaces.clone();
    for (prefix, uri) in &envelope.namespaces {
        if !merged.iter().any(|(p, _)| p == prefix) {
            merged.push((prefix.clone(), uri.clone()));
        }
    }
    merged
}

/// Qualified name of the document element, without parsing further.
pub fn sniff_root_qname(data: &[u8]) -> Result<Option<QName>> {
    match try_sniff(data, true)? {
        Sniff::Found(q) => Ok(q),
        Sniff::NeedMore => Ok(None),
    }
}

/// Payload qname of buffered payload bytes.
pub fn sniff_payload_qname(data: &[u8]) -> Result<Option<QName>> {
    sniff_root_qname(data)
}

/// Payload qname of a stream, pulling chunks into `prefix` until the first
/// start tag is complete. At most [`SNIFF_LIMIT`] bytes are pulled.
pub fn sniff_stream_qname(prefix: &mut Vec<u8>, rest: &mut dyn Read) -> Result<Option<QName>> {
    let mut chunk = [0u8; SNIFF_CHUNK];
    loop {
        if let Sniff::Found(q) = try_sniff(prefix, false)? {
            return Ok(q);
        }
        if prefix.len() >= SNIFF_LIMIT {
            return Err(RuntimeError::Xml(format!(
                "no payload element within the first {} bytes",
                SNIFF_LIMIT
            )));
        }
        let n = rest.read(&mut chunk)?;
        if n == 0 {
            return match try_sniff(prefix, true)? {
                Sniff::Found(q) => Ok(q),
                Sniff::NeedMore => Ok(None),
            };
        }
        prefix.extend_from_slice(&chunk[..n]);
    }
}

enum Sniff {
    Found(Option<QName>),
    NeedMore,
}

/// Look for the first start tag. With `complete == false` truncated input is
/// reported as `NeedMore` instead of an error.
fn try_sniff(data: &[u8], complete: bool) -> Result<Sniff> {
    let mut reader = Reader::from_reader(data);
    let mut scopes = NamespaceScopes::default();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let element = open_element(e, &mut scopes)?;
                return Ok(Sniff::Found(Some(element.name)));
            }
            Ok(Event::DocType(_)) => {
                return Err(RuntimeError::Xml(
                    "DOCTYPE declarations are not allowed".to_string(),
                ))
            }
            Ok(Event::Eof) if complete => return Ok(Sniff::Found(None)),
            Ok(Event::Eof) => return Ok(Sniff::NeedMore),
            Err(e) if complete => return Err(e.into()),
            Err(_) => return Ok(Sniff::NeedMore),
            _ => {}
        }
        buf.clear();
    }
}

/// Strip a leading byte-order mark and XML declaration.
pub fn strip_xml_declaration(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    let trimmed = trim_start(data);
    if trimmed.starts_with(b"<?xml") {
        if let Some(end) = trimmed.windows(2).position(|w| w == b"?>") {
            return trim_start(&trimmed[end + 2..]);
        }
    }
    data
}

fn trim_start(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

/// Check for XXE attack patterns.
pub fn check_xxe_patterns(xml: &str) -> std::result::Result<(), Violation> {
    // DOCTYPE detection
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(Violation::new(
            ViolationCode::DoctypeDetected,
            "DOCTYPE declarations are not allowed",
        ));
    }

    // External entity patterns
    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(Violation::new(
            ViolationCode::ExternalEntityDetected,
            "Entity declarations are not allowed",
        ));
    }

    // System/Public identifiers inside markup declarations
    let declares_external = xml.match_indices("<!").any(|(i, _)| {
        let rest = &xml[i..];
        let decl = &rest[..rest.find('>').unwrap_or(rest.len())];
        !decl.starts_with("<!--")
            && !decl.starts_with("<![CDATA[")
            && (decl.contains("SYSTEM") || decl.contains("PUBLIC"))
    });
    if declares_external {
        return Err(Violation::new(
            ViolationCode::ExternalEntityDetected,
            "External entity references are not allowed",
        ));
    }

    Ok(())
}

/// Extract SOAPAction from HTTP header value (removes quotes).
pub fn parse_soap_action(header_value: &str) -> String {
    header_value.trim().trim_matches('"').to_string()
}
