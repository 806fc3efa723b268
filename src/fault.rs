//! SOAP fault models.
//!
//! [`ProtocolFault`] is the version-neutral fault that travels as an error.
//! [`Soap11Fault`] and [`Soap12Fault`] mirror the two wire shapes and convert
//! to and from element trees. SOAP 1.2 subcodes form a linked chain; the
//! protocol fault keeps them as an ordered list.

use crate::binding::SoapVersion;
use crate::error::{Result, RuntimeError};
use crate::infoset::{resolve_qname, Element, QName, XML_NS};
use crate::message::Message;
use thiserror::Error;

/// Prefix used for the envelope namespace inside fault elements.
const ENV_PREFIX: &str = "S";

/// Errors reading a fault element.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FaultError {
    #[error("Fault is missing required element '{0}'")]
    MissingElement(&'static str),

    #[error("Fault code '{0}' uses an unbound prefix")]
    UnboundPrefix(String),

    #[error("Element {0} is not a SOAP fault")]
    NotAFault(QName),
}

/// A protocol-level fault.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("SOAP fault {code}: {reason}")]
pub struct ProtocolFault {
    pub version: SoapVersion,
    pub code: QName,
    /// SOAP 1.2 subcodes, outermost first
    pub subcodes: Vec<QName>,
    pub reason: String,
    /// `faultactor` (1.1) or `Role` (1.2)
    pub actor: Option<String>,
    /// `Node` (1.2)
    pub node: Option<String>,
    /// Detail entries. `Some(vec![])` is an empty detail block.
    pub detail: Option<Vec<Element>>,
}

impl ProtocolFault {
    pub fn new(version: SoapVersion, code: QName, reason: impl Into<String>) -> Self {
        Self {
            version,
            code,
            subcodes: Vec::new(),
            reason: reason.into(),
            actor: None,
            node: None,
            detail: None,
        }
    }

    /// Fault blaming the sender (`Client` / `Sender`).
    pub fn client(version: SoapVersion, reason: impl Into<String>) -> Self {
        Self::new(version, version.client_fault_code(), reason)
    }

    /// Fault blaming the receiver (`Server` / `Receiver`).
    pub fn server(version: SoapVersion, reason: impl Into<String>) -> Self {
        Self::new(version, version.server_fault_code(), reason)
    }

    pub fn must_understand(version: SoapVersion, reason: impl Into<String>) -> Self {
        Self::new(version, version.must_understand_fault_code(), reason)
    }

    pub fn version_mismatch(version: SoapVersion) -> Self {
        Self::new(
            version,
            version.version_mismatch_fault_code(),
            "Invalid SOAP envelope namespace",
        )
    }

    /// Add a subcode below the innermost one.
    pub fn append_subcode(&mut self, subcode: QName) {
        self.subcodes.push(subcode);
    }

    pub fn with_subcode(mut self, subcode: QName) -> Self {
        self.append_subcode(subcode);
        self
    }

    /// Add a detail entry.
    pub fn with_detail(mut self, entry: Element) -> Self {
        self.detail.get_or_insert_with(Vec::new).push(entry);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// The same fault expressed for `version`; standard codes are mapped.
    pub fn for_version(mut self, version: SoapVersion) -> Self {
        self.code = version.map_fault_code(&self.code);
        self.version = version;
        self
    }

    /// Translate a runtime error into the fault sent back to a client.
    pub fn from_error(version: SoapVersion, error: &RuntimeError) -> Self {
        match error {
            RuntimeError::Protocol(fault) => fault.clone().for_version(version),
            RuntimeError::Handler(crate::handler::HandlerError::Protocol(fault)) => {
                fault.clone().for_version(version)
            }
            RuntimeError::Dispatch(e) => e.to_fault().for_version(version),
            RuntimeError::Deserialization { .. }
            | RuntimeError::Xml(_)
            | RuntimeError::InvalidEnvelope(_) => Self::client(version, error.to_string()),
            other => Self::server(version, other.to_string()),
        }
    }
}

/// Write `name` as QName text, declaring its namespace on `element` when needed.
fn qname_text(element: &mut Element, name: &QName, prefix: &str) -> String {
    if name.namespace.is_empty() {
        return name.local.clone();
    }
    element.declare_namespace(prefix, name.namespace.clone());
    format!("{}:{}", prefix, name.local)
}

fn code_element(name: QName, value: &QName, prefix: &str) -> Element {
    let mut element = Element::new(name);
    let text = if value.namespace == SoapVersion::Soap11.namespace()
        || value.namespace == SoapVersion::Soap12.namespace()
    {
        element.declare_namespace(ENV_PREFIX, value.namespace.clone());
        format!("{}:{}", ENV_PREFIX, value.local)
    } else {
        qname_text(&mut element, value, prefix)
    };
    element.with_text(text)
}

fn read_code(fault: &Element, path: &[&Element], element: &Element) -> Result<QName, FaultError> {
    let text = element.text();
    let mut full_path = vec![fault];
    full_path.extend_from_slice(path);
    resolve_qname(&text, &full_path).ok_or(FaultError::UnboundPrefix(text))
}

/// Detail entries, detached with the bindings in scope at the detail element.
fn read_detail(fault: &Element, detail: &Element) -> Vec<Element> {
    let mut scope = detail.namespaces.clone();
    scope.extend(fault.namespaces.iter().cloned());
    detail
        .elements()
        .map(|e| e.clone().with_inherited(&scope))
        .collect()
}

fn fault_root(version: SoapVersion) -> Element {
    let mut root = Element::new(version.fault_name()).with_prefix(ENV_PREFIX);
    root.declare_namespace(ENV_PREFIX, version.namespace());
    root
}

/// SOAP 1.1 `Fault`.
#[derive(Debug, Clone, PartialEq)]
pub struct Soap11Fault {
    pub faultcode: QName,
    pub faultstring: String,
    pub faultactor: Option<String>,
    pub detail: Option<Vec<Element>>,
}

impl Soap11Fault {
    pub fn from_protocol(fault: &ProtocolFault) -> Self {
        Self {
            faultcode: SoapVersion::Soap11.map_fault_code(&fault.code),
            faultstring: fault.reason.clone(),
            faultactor: fault.actor.clone(),
            detail: fault.detail.clone(),
        }
    }

    pub fn to_protocol(&self) -> ProtocolFault {
        ProtocolFault {
            version: SoapVersion::Soap11,
            code: self.faultcode.clone(),
            subcodes: Vec::new(),
            reason: self.faultstring.clone(),
            actor: self.faultactor.clone(),
            node: None,
            detail: self.detail.clone(),
        }
    }

    pub fn to_element(&self) -> Element {
        let mut root = fault_root(SoapVersion::Soap11);
        root.push_child(code_element(QName::local("faultcode"), &self.faultcode, "fc"));
        root.push_child(Element::new(QName::local("faultstring")).with_text(self.faultstring.clone()));
        if let Some(actor) = &self.faultactor {
            root.push_child(Element::new(QName::local("faultactor")).with_text(actor.clone()));
        }
        if let Some(entries) = self.detail.as_ref().filter(|d| !d.is_empty()) {
            let mut detail = Element::new(QName::local("detail"));
            for entry in entries {
                detail.push_child(entry.clone());
            }
            root.push_child(detail);
        }
        root
    }

    pub fn from_element(element: &Element) -> Result<Self, FaultError> {
        if element.name != SoapVersion::Soap11.fault_name() {
            return Err(FaultError::NotAFault(element.name.clone()));
        }
        let code = element
            .child_local("faultcode")
            .ok_or(FaultError::MissingElement("faultcode"))?;
        let faultcode = read_code(element, &[code], code)?;
        let faultstring = element
            .child_local("faultstring")
            .ok_or(FaultError::MissingElement("faultstring"))?
            .text();
        Ok(Self {
            faultcode,
            faultstring,
            faultactor: element.child_local("faultactor").map(Element::text),
            detail: element
                .child_local("detail")
                .map(|d| read_detail(element, d)),
        })
    }
}

/// A SOAP 1.2 subcode and the one below it.
#[derive(Debug, Clone, PartialEq)]
pub struct Subcode {
    pub value: QName,
    pub subcode: Option<Box<Subcode>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaultCode {
    pub value: QName,
    pub subcode: Option<Box<Subcode>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReasonText {
    pub lang: String,
    pub text: String,
}

/// SOAP 1.2 `Fault`.
#[derive(Debug, Clone, PartialEq)]
pub struct Soap12Fault {
    pub code: FaultCode,
    pub reason: Vec<ReasonText>,
    pub node: Option<String>,
    pub role: Option<String>,
    pub detail: Option<Vec<Element>>,
}

impl Soap12Fault {
    pub fn from_protocol(fault: &ProtocolFault) -> Self {
        let mut chain: Option<Box<Subcode>> = None;
        for value in fault.subcodes.iter().rev() {
            chain = Some(Box::new(Subcode {
                value: value.clone(),
                subcode: chain,
            }));
        }
        Self {
            code: FaultCode {
                value: SoapVersion::Soap12.map_fault_code(&fault.code),
                subcode: chain,
            },
            reason: vec![ReasonText {
                lang: "en".to_string(),
                text: fault.reason.clone(),
            }],
            node: fault.node.clone(),
            role: fault.actor.clone(),
            detail: fault.detail.clone(),
        }
    }

    pub fn to_protocol(&self) -> ProtocolFault {
        let reason = self.reason.first().map(|r| r.text.clone()).unwrap_or_default();
        let mut fault = ProtocolFault::new(SoapVersion::Soap12, self.code.value.clone(), reason);
        let mut next = self.code.subcode.as_deref();
        while let Some(subcode) = next {
            fault.append_subcode(subcode.value.clone());
            next = subcode.subcode.as_deref();
        }
        fault.actor = self.role.clone();
        fault.node = self.node.clone();
        fault.detail = self.detail.clone();
        fault
    }

    pub fn to_element(&self) -> Element {
        let ns = SoapVersion::Soap12.namespace();
        let env = |local: &str| Element::new(QName::new(ns, local)).with_prefix(ENV_PREFIX);

        let mut root = fault_root(SoapVersion::Soap12);

        let mut code = env("Code");
        code.push_child(code_element(QName::new(ns, "Value"), &self.code.value, "fc").with_prefix(ENV_PREFIX));
        let mut subcodes = Vec::new();
        let mut next = self.code.subcode.as_deref();
        while let Some(subcode) = next {
            subcodes.push(&subcode.value);
            next = subcode.subcode.as_deref();
        }
        // innermost first, each wrapped by its parent
        let mut nested: Option<Element> = None;
        for (depth, value) in subcodes.iter().enumerate().rev() {
            let mut element = env("Subcode");
            element.push_child(
                code_element(QName::new(ns, "Value"), value, &format!("sc{}", depth))
                    .with_prefix(ENV_PREFIX),
            );
            if let Some(inner) = nested.take() {
                element.push_child(inner);
            }
            nested = Some(element);
        }
        if let Some(outer) = nested {
            code.push_child(outer);
        }
        root.push_child(code);

        let mut reason = env("Reason");
        for text in &self.reason {
            reason.push_child(
                env("Text")
                    .with_attribute(QName::new(XML_NS, "lang"), text.lang.clone())
                    .with_text(text.text.clone()),
            );
        }
        root.push_child(reason);

        if let Some(node) = &self.node {
            root.push_child(env("Node").with_text(node.clone()));
        }
        if let Some(role) = &self.role {
            root.push_child(env("Role").with_text(role.clone()));
        }
        if let Some(entries) = self.detail.as_ref().filter(|d| !d.is_empty()) {
            let mut detail = env("Detail");
            for entry in entries {
                detail.push_child(entry.clone());
            }
            root.push_child(detail);
        }
        root
    }

    pub fn from_element(element: &Element) -> Result<Self, FaultError> {
        let ns = SoapVersion::Soap12.namespace();
        let name = |local: &str| QName::new(ns, local);
        if element.name != SoapVersion::Soap12.fault_name() {
            return Err(FaultError::NotAFault(element.name.clone()));
        }

        let code = element
            .child(&name("Code"))
            .ok_or(FaultError::MissingElement("Code"))?;
        let value = code
            .child(&name("Value"))
            .ok_or(FaultError::MissingElement("Value"))?;
        let code_value = read_code(element, &[code, value], value)?;

        let mut subcodes = Vec::new();
        let mut path = vec![code];
        let mut current = code.child(&name("Subcode"));
        while let Some(subcode) = current {
            path.push(subcode);
            let value = subcode
                .child(&name("Value"))
                .ok_or(FaultError::MissingElement("Value"))?;
            let mut value_path = path.clone();
            value_path.push(value);
            subcodes.push(read_code(element, &value_path, value)?);
            current = subcode.child(&name("Subcode"));
        }
        let mut chain: Option<Box<Subcode>> = None;
        for value in subcodes.into_iter().rev() {
            chain = Some(Box::new(Subcode {
                value,
                subcode: chain,
            }));
        }

        let reason = element
            .child(&name("Reason"))
            .ok_or(FaultError::MissingElement("Reason"))?
            .elements()
            .filter(|e| e.name == name("Text"))
            .map(|e| ReasonText {
                lang: e
                    .attribute(&QName::new(XML_NS, "lang"))
                    .unwrap_or_default()
                    .to_string(),
                text: e.text(),
            })
            .collect();

        Ok(Self {
            code: FaultCode {
                value: code_value,
                subcode: chain,
            },
            reason,
            node: element.child(&name("Node")).map(Element::text),
            role: element.child(&name("Role")).map(Element::text),
            detail: element
                .child(&name("Detail"))
                .map(|d| read_detail(element, d)),
        })
    }
}

/// A fault of either SOAP version.
#[derive(Debug, Clone, PartialEq)]
pub enum SoapFault {
    V11(Soap11Fault),
    V12(Soap12Fault),
}

impl SoapFault {
    pub fn from_protocol(fault: &ProtocolFault) -> Self {
        match fault.version {
            SoapVersion::Soap11 => Self::V11(Soap11Fault::from_protocol(fault)),
            SoapVersion::Soap12 => Self::V12(Soap12Fault::from_protocol(fault)),
        }
    }

    pub fn version(&self) -> SoapVersion {
        match self {
            Self::V11(_) => SoapVersion::Soap11,
            Self::V12(_) => SoapVersion::Soap12,
        }
    }

    pub fn to_protocol(&self) -> ProtocolFault {
        match self {
            Self::V11(f) => f.to_protocol(),
            Self::V12(f) => f.to_protocol(),
        }
    }

    pub fn to_element(&self) -> Element {
        match self {
            Self::V11(f) => f.to_element(),
            Self::V12(f) => f.to_element(),
        }
    }

    /// Read a fault element of either version.
    pub fn from_element(element: &Element) -> Result<Self, FaultError> {
        match SoapVersion::from_namespace(&element.name.namespace) {
            Some(SoapVersion::Soap11) => Soap11Fault::from_element(element).map(Self::V11),
            Some(SoapVersion::Soap12) => Soap12Fault::from_element(element).map(Self::V12),
            None => Err(FaultError::NotAFault(element.name.clone())),
        }
    }

    /// The fault carried by `message`, if it is a fault message.
    /// Reading the fault consumes the payload.
    pub fn from_message(message: &mut Message) -> Result<Option<Self>> {
        if !message.is_fault() {
            return Ok(None);
        }
        let element = message
            .read_payload_as_element()?
            .ok_or(RuntimeError::MessageConsumed)?;
        Ok(Some(Self::from_element(&element)?))
    }

    pub fn into_message(self) -> Message {
        let version = self.version();
        Message::from_element(version, self.to_element())
    }
}
