//! SOAP messages: headers, attachments and a payload.
//!
//! A payload is held in one of several forms. Element trees and buffered
//! bytes can be read any number of times through [`Message::copy`]; stream
//! payloads can be read once and are buffered into memory when copied.
//! Reading a payload consumes it.

use crate::binding::SoapVersion;
use crate::error::{Result, RuntimeError};
use crate::fault::{ProtocolFault, SoapFault};
use crate::infoset::{Element, QName};
use crate::parser::{sniff_payload_qname, sniff_stream_qname, strip_xml_declaration};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// Envelope prefix used when writing.
const ENV_PREFIX: &str = "S";

/// A SOAP header block.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    element: Element,
}

impl Header {
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    /// A header block with a single text value.
    pub fn text(name: QName, value: impl Into<String>) -> Self {
        Self::new(Element::new(name).with_text(value))
    }

    pub fn name(&self) -> &QName {
        &self.element.name
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn into_element(self) -> Element {
        self.element
    }

    pub fn text_value(&self) -> String {
        self.element.text()
    }

    /// Mark this header `mustUnderstand` for `version`.
    pub fn with_must_understand(mut self, version: SoapVersion) -> Self {
        let value = match version {
            SoapVersion::Soap11 => "1",
            SoapVersion::Soap12 => "true",
        };
        self.element
            .set_attribute(version.must_understand_attribute(), value);
        self
    }

    pub fn with_role(mut self, version: SoapVersion, role: impl Into<String>) -> Self {
        self.element.set_attribute(version.role_attribute(), role);
        self
    }

    pub fn must_understand(&self, version: SoapVersion) -> bool {
        matches!(
            self.element
                .attribute(&version.must_understand_attribute())
                .map(str::trim),
            Some("1") | Some("true")
        )
    }

    pub fn role(&self, version: SoapVersion) -> Option<&str> {
        self.element.attribute(&version.role_attribute())
    }

    /// Whether this block is addressed to a node playing `roles`.
    /// A block without a role targets the ultimate receiver.
    pub fn is_targeted_at(&self, version: SoapVersion, roles: &HashSet<String>) -> bool {
        match self.role(version) {
            None => true,
            Some(role) if role.is_empty() => true,
            Some(role) if Some(role) == version.none_role() => false,
            Some(role) => role == version.next_role() || roles.contains(role),
        }
    }
}

/// Ordered list of header blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderList {
    headers: Vec<Header>,
    understood: HashSet<usize>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// Replace the first block with the same name, or append.
    pub fn add_or_replace(&mut self, header: Header) {
        match self.headers.iter().position(|h| h.name() == header.name()) {
            Some(i) => self.headers[i] = header,
            None => self.headers.push(header),
        }
    }

    pub fn get(&self, name: &QName) -> Option<&Header> {
        self.headers.iter().find(|h| h.name() == name)
    }

    pub fn remove(&mut self, name: &QName) -> Option<Header> {
        let i = self.headers.iter().position(|h| h.name() == name)?;
        self.understood = self
            .understood
            .iter()
            .filter(|&&u| u != i)
            .map(|&u| if u > i { u - 1 } else { u })
            .collect();
        Some(self.headers.remove(i))
    }

    pub fn mark_understood(&mut self, index: usize) {
        self.understood.insert(index);
    }

    pub fn is_understood(&self, index: usize) -> bool {
        self.understood.contains(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

/// A binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_id: String,
    pub content_type: String,
    pub data: Arc<[u8]>,
}

impl Attachment {
    pub fn new(
        content_id: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            content_type: content_type.into(),
            data: Arc::from(data.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentSet {
    items: Vec<Attachment>,
}

impl AttachmentSet {
    pub fn add(&mut self, attachment: Attachment) {
        self.items.push(attachment);
    }

    pub fn get(&self, content_id: &str) -> Option<&Attachment> {
        self.items.iter().find(|a| a.content_id == content_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

enum Payload {
    Empty,
    Tree(Element),
    Buffered(Arc<[u8]>),
    Stream {
        /// Bytes already pulled from `rest` while sniffing
        prefix: Vec<u8>,
        rest: Box<dyn Read + Send>,
    },
    Consumed,
}

/// One SOAP envelope's worth of content.
pub struct Message {
    version: Option<SoapVersion>,
    headers: HeaderList,
    attachments: AttachmentSet,
    payload: Payload,
    payload_qname: Option<Option<QName>>,
}

impl Message {
    fn with_payload(version: Option<SoapVersion>, payload: Payload) -> Self {
        Self {
            version,
            headers: HeaderList::new(),
            attachments: AttachmentSet::default(),
            payload,
            payload_qname: None,
        }
    }

    /// A message without a body element.
    pub fn empty(version: impl Into<Option<SoapVersion>>) -> Self {
        Self::with_payload(version.into(), Payload::Empty)
    }

    pub fn from_element(version: impl Into<Option<SoapVersion>>, payload: Element) -> Self {
        Self::with_payload(version.into(), Payload::Tree(payload))
    }

    /// A payload given as serialized XML.
    pub fn from_bytes(version: impl Into<Option<SoapVersion>>, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_payload(version.into(), Payload::Buffered(Arc::from(payload.into())))
    }

    /// A payload that can only be read once.
    pub fn from_stream<R>(version: impl Into<Option<SoapVersion>>, reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self::with_payload(
            version.into(),
            Payload::Stream {
                prefix: Vec::new(),
                rest: Box::new(reader),
            },
        )
    }

    /// Serialize `value` as the payload element named `root`.
    pub fn from_serializable<T: Serialize>(
        version: impl Into<Option<SoapVersion>>,
        root: &str,
        value: &T,
    ) -> Result<Self> {
        let xml = quick_xml::se::to_string_with_root(root, value)
            .map_err(|e| RuntimeError::Xml(e.to_string()))?;
        Ok(Self::from_bytes(version, xml.into_bytes()))
    }

    /// A fault message for `fault`, in the fault's own SOAP version.
    pub fn create_fault(fault: &ProtocolFault) -> Self {
        let element = SoapFault::from_protocol(fault).to_element();
        Self::from_element(fault.version, element)
    }

    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    pub fn version(&self) -> Option<SoapVersion> {
        self.version
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderList {
        &mut self.headers
    }

    pub fn attachments(&self) -> &AttachmentSet {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut AttachmentSet {
        &mut self.attachments
    }

    pub fn has_payload(&mut self) -> Result<bool> {
        Ok(self.payload_qname()?.is_some())
    }

    /// Qualified name of the payload element, computed on first access.
    ///
    /// Stream payloads are sniffed: only the bytes up to the first start
    /// tag are pulled from the stream and kept for later reads.
    pub fn payload_qname(&mut self) -> Result<Option<QName>> {
        if let Some(cached) = &self.payload_qname {
            return Ok(cached.clone());
        }
        let qname = match &mut self.payload {
            Payload::Empty => None,
            Payload::Tree(e) => Some(e.name.clone()),
            Payload::Buffered(bytes) => sniff_payload_qname(bytes)?,
            Payload::Stream { prefix, rest } => sniff_stream_qname(prefix, rest.as_mut())?,
            Payload::Consumed => return Err(RuntimeError::MessageConsumed),
        };
        self.payload_qname = Some(qname.clone());
        Ok(qname)
    }

    pub fn payload_local_part(&mut self) -> Result<Option<String>> {
        Ok(self.payload_qname()?.map(|q| q.local))
    }

    pub fn payload_namespace_uri(&mut self) -> Result<Option<String>> {
        Ok(self.payload_qname()?.map(|q| q.namespace))
    }

    /// Whether the payload is a SOAP fault of this message's version.
    pub fn is_fault(&mut self) -> bool {
        let Some(version) = self.version else {
            return false;
        };
        matches!(self.payload_qname(), Ok(Some(q)) if q == version.fault_name())
    }

    pub fn is_consumed(&self) -> bool {
        matches!(self.payload, Payload::Consumed)
    }

    /// Read the payload as serialized bytes.
    pub fn read_payload_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let payload = std::mem::replace(&mut self.payload, Payload::Consumed);
        match payload {
            Payload::Empty => Ok(None),
            Payload::Tree(e) => Ok(Some(e.to_bytes()?)),
            Payload::Buffered(bytes) => Ok(Some(bytes.to_vec())),
            Payload::Stream { mut prefix, mut rest } => {
                rest.read_to_end(&mut prefix)?;
                Ok(Some(prefix))
            }
            Payload::Consumed => Err(RuntimeError::MessageConsumed),
        }
    }

    /// Read the payload as an XML event stream.
    pub fn read_payload(&mut self) -> Result<Option<Reader<Cursor<Vec<u8>>>>> {
        Ok(self
            .read_payload_bytes()?
            .map(|bytes| Reader::from_reader(Cursor::new(bytes))))
    }

    /// Read the payload as an element tree.
    pub fn read_payload_as_element(&mut self) -> Result<Option<Element>> {
        if let Payload::Tree(_) = self.payload {
            return match std::mem::replace(&mut self.payload, Payload::Consumed) {
                Payload::Tree(e) => Ok(Some(e)),
                _ => Err(RuntimeError::MessageConsumed),
            };
        }
        match self.read_payload_bytes()? {
            Some(bytes) => Ok(Some(Element::parse(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read the payload into a typed value through serde.
    pub fn read_payload_as<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.read_payload_bytes()? {
            Some(bytes) => {
                let text = std::str::from_utf8(strip_xml_declaration(&bytes))
                    .map_err(|e| RuntimeError::Xml(e.to_string()))?;
                quick_xml::de::from_str(text)
                    .map(Some)
                    .map_err(|e| RuntimeError::Xml(e.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Turn the payload into an element tree in place and borrow it.
    /// Unlike the `read_*` methods this does not consume the message.
    pub fn payload_tree(&mut self) -> Result<Option<&Element>> {
        if !matches!(self.payload, Payload::Tree(_) | Payload::Empty) {
            let element = self.read_payload_as_element()?;
            self.payload = match element {
                Some(e) => Payload::Tree(e),
                None => Payload::Empty,
            };
        }
        match &self.payload {
            Payload::Tree(e) => Ok(Some(e)),
            _ => Ok(None),
        }
    }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: Option<Element>) {
        self.payload = match payload {
            Some(e) => Payload::Tree(e),
            None => Payload::Empty,
        };
        self.payload_qname = None;
    }

    /// An independent replica with the same headers, payload and
    /// attachments. Stream payloads are buffered into memory first, so both
    /// this message and the copy stay readable.
    pub fn copy(&mut self) -> Result<Message> {
        if let Payload::Stream { .. } = self.payload {
            let bytes = self.read_payload_bytes()?.unwrap_or_default();
            self.payload = Payload::Buffered(Arc::from(bytes));
        }
        let payload = match &self.payload {
            Payload::Empty => Payload::Empty,
            Payload::Tree(e) => Payload::Tree(e.clone()),
            Payload::Buffered(bytes) => Payload::Buffered(Arc::clone(bytes)),
            Payload::Stream { .. } | Payload::Consumed => {
                return Err(RuntimeError::MessageConsumed)
            }
        };
        Ok(Message {
            version: self.version,
            headers: self.headers.clone(),
            attachments: self.attachments.clone(),
            payload,
            payload_qname: self.payload_qname.clone(),
        })
    }

    /// Write only the payload. Consumes it.
    pub fn write_payload_to<W: Write>(&mut self, writer: &mut Writer<W>) -> Result<()> {
        if let Payload::Tree(_) = self.payload {
            if let Payload::Tree(e) = std::mem::replace(&mut self.payload, Payload::Consumed) {
                e.write_to(writer)?;
            }
            return Ok(());
        }
        if let Some(bytes) = self.read_payload_bytes()? {
            writer.get_mut().write_all(strip_xml_declaration(&bytes))?;
        }
        Ok(())
    }

    /// Write the complete envelope. Consumes the payload.
    ///
    /// Messages without a SOAP version are written as the bare payload.
    pub fn write_to<W: Write>(&mut self, writer: &mut Writer<W>) -> Result<()> {
        let Some(version) = self.version else {
            return self.write_payload_to(writer);
        };

        let envelope = format!("{}:Envelope", ENV_PREFIX);
        let header = format!("{}:Header", ENV_PREFIX);
        let body = format!("{}:Body", ENV_PREFIX);

        let mut start = BytesStart::new(envelope.as_str());
        start.push_attribute((format!("xmlns:{}", ENV_PREFIX).as_str(), version.namespace()));
        writer.write_event(Event::Start(start))?;

        if !self.headers.is_empty() {
            writer.write_event(Event::Start(BytesStart::new(header.as_str())))?;
            for h in self.headers.iter() {
                h.element().write_to(writer)?;
            }
            writer.write_event(Event::End(BytesEnd::new(header.as_str())))?;
        }

        writer.write_event(Event::Start(BytesStart::new(body.as_str())))?;
        self.write_payload_to(writer)?;
        writer.write_event(Event::End(BytesEnd::new(body.as_str())))?;

        writer.write_event(Event::End(BytesEnd::new(envelope.as_str())))?;
        Ok(())
    }

    /// Serialize the envelope with an XML declaration. Consumes the payload.
    pub fn to_envelope_bytes(&mut self) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        self.write_to(&mut writer)?;
        Ok(writer.into_inner())
    }

    pub fn to_envelope_string(&mut self) -> Result<String> {
        String::from_utf8(self.to_envelope_bytes()?).map_err(|e| RuntimeError::Xml(e.to_string()))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &self.payload {
            Payload::Empty => "empty",
            Payload::Tree(_) => "tree",
            Payload::Buffered(_) => "buffered",
            Payload::Stream { .. } => "stream",
            Payload::Consumed => "consumed",
        };
        f.debug_struct("Message")
            .field("version", &self.version)
            .field("headers", &self.headers.len())
            .field("attachments", &self.attachments.len())
            .field("payload", &payload)
            .field("payload_qname", &self.payload_qname)
            .finish()
    }
}
