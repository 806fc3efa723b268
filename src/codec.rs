//! Wire encoding of messages for each binding kind.

use crate::binding::{BindingKind, SoapVersion};
use crate::error::{violations_detail, violations_reason, Result, RuntimeError};
use crate::fault::ProtocolFault;
use crate::message::Message;
use crate::parser::{check_xxe_patterns, parse_soap_envelope, sniff_root_qname, strip_xml_declaration};
use std::sync::Arc;
use tracing::debug;

const XML_MIME_TYPE: &str = "application/xml";

/// Turns messages into bytes and back.
pub trait Codec: Send + Sync {
    /// Bare MIME type, without parameters.
    fn mime_type(&self) -> &'static str;

    /// Full `Content-Type` value for an outbound message.
    fn content_type(&self, soap_action: Option<&str>) -> String;

    fn encode(&self, message: &mut Message) -> Result<Vec<u8>>;

    /// Decode `data` received with `content_type` (when known).
    fn decode(&self, data: &[u8], content_type: Option<&str>) -> Result<Message>;
}

/// Codec for a binding kind.
pub fn codec_for(kind: BindingKind) -> Arc<dyn Codec> {
    match kind.soap_version() {
        Some(version) => Arc::new(SoapCodec::new(version)),
        None => Arc::new(XmlCodec),
    }
}

/// Whether `content_type` carries the MIME type of `version`, ignoring
/// parameters.
fn matches_mime_type(content_type: &str, version: SoapVersion) -> bool {
    let mime = content_type.split(';').next().unwrap_or_default();
    mime.trim().eq_ignore_ascii_case(version.mime_type())
}

/// Reject documents carrying DTDs or external entities before parsing.
fn reject_entities(data: &[u8], version: SoapVersion) -> Result<()> {
    let text = std::str::from_utf8(data)
        .map_err(|e| RuntimeError::Xml(format!("document is not valid UTF-8: {}", e)))?;
    if let Err(violation) = check_xxe_patterns(text) {
        debug!(code = %violation.code.as_str(), "Rejecting document with entity declarations");
        let violations = [violation];
        return Err(ProtocolFault::client(version, violations_reason(&violations))
            .with_detail(violations_detail(&violations))
            .into());
    }
    Ok(())
}

/// SOAP 1.1 or 1.2 envelopes.
#[derive(Debug, Clone, Copy)]
pub struct SoapCodec {
    version: SoapVersion,
}

impl SoapCodec {
    pub fn new(version: SoapVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }
}

impl Codec for SoapCodec {
    fn mime_type(&self) -> &'static str {
        self.version.mime_type()
    }

    fn content_type(&self, soap_action: Option<&str>) -> String {
        match (self.version, soap_action.filter(|a| !a.is_empty())) {
            (SoapVersion::Soap12, Some(action)) => format!(
                "{}; charset=utf-8; action=\"{}\"",
                self.mime_type(),
                action
            ),
            _ => format!("{}; charset=utf-8", self.mime_type()),
        }
    }

    fn encode(&self, message: &mut Message) -> Result<Vec<u8>> {
        message.to_envelope_bytes()
    }

    fn decode(&self, data: &[u8], content_type: Option<&str>) -> Result<Message> {
        if let Some(ct) = content_type {
            if !matches_mime_type(ct, self.version) {
                return Err(RuntimeError::ContentType(ct.to_string()));
            }
        }
        reject_entities(data, self.version)?;

        let root = sniff_root_qname(data)?
            .ok_or_else(|| RuntimeError::InvalidEnvelope("empty document".to_string()))?;
        if root.local != "Envelope" {
            return Err(RuntimeError::InvalidEnvelope(format!(
                "root element is {}, expected Envelope",
                root
            )));
        }
        if root.namespace != self.version.namespace() {
            debug!(
                expected = self.version.namespace(),
                found = %root.namespace,
                "Envelope version mismatch"
            );
            return Err(ProtocolFault::version_mismatch(self.version).into());
        }
        parse_soap_envelope(data)
    }
}

/// Plain XML payloads for the XML/HTTP binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlCodec;

impl Codec for XmlCodec {
    fn mime_type(&self) -> &'static str {
        XML_MIME_TYPE
    }

    fn content_type(&self, _soap_action: Option<&str>) -> String {
        XML_MIME_TYPE.to_string()
    }

    fn encode(&self, message: &mut Message) -> Result<Vec<u8>> {
        message.to_envelope_bytes()
    }

    fn decode(&self, data: &[u8], content_type: Option<&str>) -> Result<Message> {
        if let Some(ct) = content_type {
            if !ct.to_lowercase().contains("xml") {
                return Err(RuntimeError::ContentType(ct.to_string()));
            }
        }
        // plain XML faults still need a version for their codes
        reject_entities(data, SoapVersion::Soap11)?;
        let body = strip_xml_declaration(data);
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Message::empty(None));
        }
        Ok(Message::from_bytes(None, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infoset::{Element, QName};

    const SOAP11: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body><m:GetPrice xmlns:m="urn:stock"/></soap:Body>
</soap:Envelope>"#;

    const SOAP12: &str = r#"<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope">
  <env:Body><m:GetPrice xmlns:m="urn:stock"/></env:Body>
</env:Envelope>"#;

    #[test]
    fn test_content_types() {
        assert_eq!(
            SoapCodec::new(SoapVersion::Soap11).content_type(Some("urn:a")),
            "text/xml; charset=utf-8"
        );
        assert_eq!(
            SoapCodec::new(SoapVersion::Soap12).content_type(Some("urn:a")),
            "application/soap+xml; charset=utf-8; action=\"urn:a\""
        );
        assert_eq!(
            SoapCodec::new(SoapVersion::Soap12).content_type(None),
            "application/soap+xml; charset=utf-8"
        );
        assert_eq!(XmlCodec.content_type(Some("urn:a")), "application/xml");
    }

    #[test]
    fn test_decode_soap11() {
        let codec = SoapCodec::new(SoapVersion::Soap11);
        let mut message = codec
            .decode(SOAP11.as_bytes(), Some("text/xml; charset=utf-8"))
            .unwrap();
        assert_eq!(message.version(), Some(SoapVersion::Soap11));
        assert_eq!(
            message.payload_qname().unwrap(),
            Some(QName::new("urn:stock", "GetPrice"))
        );
    }

    #[test]
    fn test_version_mismatch() {
        let codec = SoapCodec::new(SoapVersion::Soap11);
        let err = codec.decode(SOAP12.as_bytes(), None).unwrap_err();
        let RuntimeError::Protocol(fault) = err else {
            panic!("expected a protocol fault");
        };
        assert_eq!(fault.code, SoapVersion::Soap11.version_mismatch_fault_code());
    }

    #[test]
    fn test_wrong_content_type() {
        let codec = SoapCodec::new(SoapVersion::Soap11);
        let err = codec.decode(SOAP11.as_bytes(), Some("application/json")).unwrap_err();
        assert!(matches!(err, RuntimeError::ContentType(_)));
    }

    #[test]
    fn test_other_soap_version_content_type_rejected() {
        let err = SoapCodec::new(SoapVersion::Soap11)
            .decode(SOAP11.as_bytes(), Some("application/soap+xml; charset=utf-8"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ContentType(_)));

        let err = SoapCodec::new(SoapVersion::Soap12)
            .decode(SOAP12.as_bytes(), Some("text/xml"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ContentType(_)));

        assert!(SoapCodec::new(SoapVersion::Soap12)
            .decode(SOAP12.as_bytes(), Some("Application/SOAP+XML; action=\"urn:a\""))
            .is_ok());
    }

    #[test]
    fn test_xxe_rejected_with_client_fault() {
        let xml = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body/></soap:Envelope>"#;
        let err = SoapCodec::new(SoapVersion::Soap11)
            .decode(xml.as_bytes(), None)
            .unwrap_err();
        let RuntimeError::Protocol(fault) = err else {
            panic!("expected a protocol fault");
        };
        assert_eq!(fault.code, SoapVersion::Soap11.client_fault_code());
        assert_eq!(fault.detail.map(|d| d.len()), Some(1));
    }

    #[test]
    fn test_not_an_envelope() {
        let err = SoapCodec::new(SoapVersion::Soap11)
            .decode(b"<order/>", None)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_xml_codec_round_trip() {
        let mut message = Message::from_element(None, Element::new(QName::new("urn:x", "Ping")));
        let bytes = XmlCodec.encode(&mut message).unwrap();
        let mut decoded = XmlCodec.decode(&bytes, Some("application/xml")).unwrap();
        assert_eq!(decoded.version(), None);
        assert_eq!(
            decoded.payload_qname().unwrap(),
            Some(QName::new("urn:x", "Ping"))
        );
    }

    #[test]
    fn test_xml_codec_empty_body() {
        let mut decoded = XmlCodec.decode(b"  ", None).unwrap();
        assert!(!decoded.has_payload().unwrap());
    }
}
