//! Error types for the SOAP runtime.

use crate::dispatch::DispatchError;
use crate::fault::{FaultError, ProtocolFault};
use crate::handler::HandlerError;
use crate::infoset::{Element, QName};
use crate::property::PropertyError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// SOAP runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("XML error: {0}")]
    Xml(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Message payload has already been consumed")]
    MessageConsumed,

    #[error("Unsupported content type: {0}")]
    ContentType(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A protocol-level fault travelling as an error (client side, or a
    /// server stage that could not answer with a fault message).
    #[error(transparent)]
    Protocol(#[from] ProtocolFault),

    /// Errors raised by user handlers, propagated unmodified.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Failed to read {}: {source}", leg_name(.response))]
    Deserialization {
        /// `true` when reading a response message
        response: bool,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error(transparent)]
    Fault(#[from] FaultError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Pipeline has been closed")]
    PipelineClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn leg_name(response: &bool) -> &'static str {
    if *response {
        "response"
    } else {
        "request"
    }
}

impl RuntimeError {
    /// Wrap a failure that happened while unmarshalling a message.
    pub fn deserialization(response: bool, source: RuntimeError) -> Self {
        Self::Deserialization {
            response,
            source: Box::new(source),
        }
    }
}

impl From<quick_xml::Error> for RuntimeError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml(e.to_string())
    }
}

/// Violation codes raised by the security stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationCode {
    /// Missing WS-Security header
    MissingSecurityHeader,
    /// Invalid timestamp
    InvalidTimestamp,
    /// Timestamp expired
    TimestampExpired,
    /// Missing username token
    MissingUsernameToken,
    /// Invalid password type
    InvalidPasswordType,
    /// Missing SAML assertion
    MissingSamlAssertion,
    /// DOCTYPE detected (XXE)
    DoctypeDetected,
    /// External entity detected (XXE)
    ExternalEntityDetected,
}

impl ViolationCode {
    /// Get the string code for this violation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSecurityHeader => "MISSING_SECURITY_HEADER",
            Self::InvalidTimestamp => "INVALID_TIMESTAMP",
            Self::TimestampExpired => "TIMESTAMP_EXPIRED",
            Self::MissingUsernameToken => "MISSING_USERNAME_TOKEN",
            Self::InvalidPasswordType => "INVALID_PASSWORD_TYPE",
            Self::MissingSamlAssertion => "MISSING_SAML_ASSERTION",
            Self::DoctypeDetected => "DOCTYPE_DETECTED",
            Self::ExternalEntityDetected => "EXTERNAL_ENTITY_DETECTED",
        }
    }
}

/// A security violation detected while processing a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Violation code
    pub code: ViolationCode,
    /// Human-readable message
    pub message: String,
}

impl Violation {
    /// Create a new violation.
    pub fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Namespace of the violation list carried in fault details.
pub const VIOLATIONS_NS: &str = "urn:zentinel:soap:security";

/// Render violations as a fault detail entry.
pub fn violations_detail(violations: &[Violation]) -> Element {
    let mut list = Element::new(QName::new(VIOLATIONS_NS, "violations")).with_prefix("zentinel");
    for v in violations {
        list.push_child(
            Element::new(QName::new(VIOLATIONS_NS, "violation"))
                .with_prefix("zentinel")
                .with_attribute(QName::local("code"), v.code.as_str())
                .with_text(v.message.clone()),
        );
    }
    list
}

/// One-line summary used as fault reason text.
pub fn violations_reason(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("[{}] {}", v.code.as_str(), v.message))
        .collect::<Vec<_>>()
        .join("; ")
}
