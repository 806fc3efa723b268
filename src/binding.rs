//! Bindings: SOAP version, binding kind, enabled features and the
//! handler configuration in effect.

use crate::error::{Result, RuntimeError};
use crate::handler::{HandlerConfiguration, HandlerEntry};
use crate::infoset::QName;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

/// SOAP 1.1 envelope namespace.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 envelope namespace.
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// WS-Addressing feature id.
pub const ADDRESSING_FEATURE: &str = "http://www.w3.org/2005/08/addressing/module";
/// MTOM feature id.
pub const MTOM_FEATURE: &str = "http://www.w3.org/2004/08/soap/features/http-optimization";

const SOAP_11_NEXT_ROLE: &str = "http://schemas.xmlsoap.org/soap/actor/next";
const SOAP_12_NEXT_ROLE: &str = "http://www.w3.org/2003/05/soap-envelope/role/next";
const SOAP_12_NONE_ROLE: &str = "http://www.w3.org/2003/05/soap-envelope/role/none";
const SOAP_12_ULTIMATE_RECEIVER_ROLE: &str =
    "http://www.w3.org/2003/05/soap-envelope/role/ultimateReceiver";

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    /// Envelope namespace URI.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    pub fn from_namespace(ns: &str) -> Option<Self> {
        match ns {
            SOAP_11_NS => Some(Self::Soap11),
            SOAP_12_NS => Some(Self::Soap12),
            _ => None,
        }
    }

    /// MIME type of the envelope on the wire.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml",
            Self::Soap12 => "application/soap+xml",
        }
    }

    /// The `{env}Fault` element name.
    pub fn fault_name(&self) -> QName {
        QName::new(self.namespace(), "Fault")
    }

    /// Fault code for errors caused by the sender.
    pub fn client_fault_code(&self) -> QName {
        match self {
            Self::Soap11 => QName::new(SOAP_11_NS, "Client"),
            Self::Soap12 => QName::new(SOAP_12_NS, "Sender"),
        }
    }

    /// Fault code for errors on the receiving side.
    pub fn server_fault_code(&self) -> QName {
        match self {
            Self::Soap11 => QName::new(SOAP_11_NS, "Server"),
            Self::Soap12 => QName::new(SOAP_12_NS, "Receiver"),
        }
    }

    pub fn must_understand_fault_code(&self) -> QName {
        QName::new(self.namespace(), "MustUnderstand")
    }

    pub fn version_mismatch_fault_code(&self) -> QName {
        QName::new(self.namespace(), "VersionMismatch")
    }

    /// Translate a standard fault code of either version into this version.
    /// Codes outside the envelope namespaces are returned unchanged.
    pub fn map_fault_code(&self, code: &QName) -> QName {
        if SoapVersion::from_namespace(&code.namespace).is_none() {
            return code.clone();
        }
        match code.local.as_str() {
            "Client" | "Sender" => self.client_fault_code(),
            "Server" | "Receiver" => self.server_fault_code(),
            local => QName::new(self.namespace(), local),
        }
    }

    /// The implicit "next" role every node plays.
    pub fn next_role(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NEXT_ROLE,
            Self::Soap12 => SOAP_12_NEXT_ROLE,
        }
    }

    /// Role attribute carried by header blocks (`actor` / `role`).
    pub fn role_attribute(&self) -> QName {
        match self {
            Self::Soap11 => QName::new(SOAP_11_NS, "actor"),
            Self::Soap12 => QName::new(SOAP_12_NS, "role"),
        }
    }

    pub fn must_understand_attribute(&self) -> QName {
        QName::new(self.namespace(), "mustUnderstand")
    }

    /// Roles always in effect for this version.
    pub fn implicit_roles(&self) -> Vec<&'static str> {
        match self {
            Self::Soap11 => vec![SOAP_11_NEXT_ROLE],
            Self::Soap12 => vec![SOAP_12_NEXT_ROLE, SOAP_12_ULTIMATE_RECEIVER_ROLE],
        }
    }

    /// A role that may never be played.
    pub fn none_role(&self) -> Option<&'static str> {
        match self {
            Self::Soap11 => None,
            Self::Soap12 => Some(SOAP_12_NONE_ROLE),
        }
    }
}

/// Binding kinds the runtime knows how to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    /// SOAP 1.1 over HTTP
    #[default]
    Soap11,
    /// SOAP 1.2 over HTTP
    Soap12,
    /// Plain XML over HTTP, no envelope
    XmlHttp,
}

impl BindingKind {
    pub fn soap_version(&self) -> Option<SoapVersion> {
        match self {
            Self::Soap11 => Some(SoapVersion::Soap11),
            Self::Soap12 => Some(SoapVersion::Soap12),
            Self::XmlHttp => None,
        }
    }

    /// Standard binding identifier.
    pub fn binding_id(&self) -> &'static str {
        match self {
            Self::Soap11 => "http://schemas.xmlsoap.org/wsdl/soap/http",
            Self::Soap12 => "http://www.w3.org/2003/05/soap/bindings/HTTP/",
            Self::XmlHttp => "http://www.w3.org/2004/08/wsdl/http",
        }
    }
}

impl From<SoapVersion> for BindingKind {
    fn from(version: SoapVersion) -> Self {
        match version {
            SoapVersion::Soap11 => Self::Soap11,
            SoapVersion::Soap12 => Self::Soap12,
        }
    }
}

/// A configured binding.
///
/// Kind and features are fixed at construction. The handler configuration
/// is swapped atomically: readers always see either the old or the new
/// configuration, never a partially updated one.
pub struct WsBinding {
    kind: BindingKind,
    features: BTreeSet<String>,
    handler_config: ArcSwap<HandlerConfiguration>,
}

impl WsBinding {
    pub fn new(kind: BindingKind) -> Self {
        let config = HandlerConfiguration::new(kind.soap_version(), Vec::new(), HashSet::new());
        Self {
            kind,
            features: BTreeSet::new(),
            handler_config: ArcSwap::from_pointee(config),
        }
    }

    /// Enable a feature by id.
    pub fn with_feature(mut self, id: impl Into<String>) -> Self {
        self.features.insert(id.into());
        self
    }

    pub fn with_mtom(self, enabled: bool) -> Self {
        if enabled {
            self.with_feature(MTOM_FEATURE)
        } else {
            self
        }
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }

    pub fn soap_version(&self) -> Option<SoapVersion> {
        self.kind.soap_version()
    }

    pub fn is_feature_enabled(&self, id: &str) -> bool {
        self.features.contains(id)
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(String::as_str)
    }

    pub fn is_mtom_enabled(&self) -> bool {
        self.is_feature_enabled(MTOM_FEATURE)
    }

    pub fn is_addressing_enabled(&self) -> bool {
        self.is_feature_enabled(ADDRESSING_FEATURE)
    }

    /// Current handler configuration snapshot.
    pub fn handler_config(&self) -> Arc<HandlerConfiguration> {
        self.handler_config.load_full()
    }

    /// Replace the handler chain, keeping the configured roles.
    pub fn set_handler_chain(&self, chain: Vec<HandlerEntry>) -> Result<()> {
        if self.kind == BindingKind::XmlHttp && chain.iter().any(|h| !h.is_logical()) {
            return Err(RuntimeError::Config(
                "XML/HTTP bindings only accept logical handlers".to_string(),
            ));
        }
        let current = self.handler_config();
        let roles = current.configured_roles().clone();
        debug!(
            binding = self.kind.binding_id(),
            handlers = chain.len(),
            "Replacing handler chain"
        );
        self.handler_config.store(Arc::new(HandlerConfiguration::new(
            self.soap_version(),
            chain,
            roles,
        )));
        Ok(())
    }

    /// Replace the set of roles this node plays, keeping the handler chain.
    pub fn set_roles<I, S>(&self, roles: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let version = self.soap_version().ok_or_else(|| {
            RuntimeError::Config("roles are only meaningful for SOAP bindings".to_string())
        })?;
        let roles: HashSet<String> = roles.into_iter().map(Into::into).collect();
        if let Some(none) = version.none_role() {
            if roles.contains(none) {
                return Err(RuntimeError::Config(format!(
                    "the role '{}' cannot be played",
                    none
                )));
            }
        }
        let current = self.handler_config();
        self.handler_config.store(Arc::new(HandlerConfiguration::new(
            Some(version),
            current.handler_chain().to_vec(),
            roles,
        )));
        Ok(())
    }
}

impl std::fmt::Debug for WsBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsBinding")
            .field("kind", &self.kind)
            .field("features", &self.features)
            .field("handlers", &self.handler_config().handler_chain().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{LogicalHandler, LogicalMessageContext, HandlerError, SoapHandler, SoapMessageContext};

    struct NoopLogical;
    impl LogicalHandler for NoopLogical {
        fn handle_message(&self, _ctx: &mut LogicalMessageContext<'_>) -> Result<bool, HandlerError> {
            Ok(true)
        }
    }

    struct NoopSoap;
    impl SoapHandler for NoopSoap {
        fn handle_message(&self, _ctx: &mut SoapMessageContext<'_>) -> Result<bool, HandlerError> {
            Ok(true)
        }
    }

    #[test]
    fn test_version_codes() {
        assert_eq!(SoapVersion::Soap11.client_fault_code().local, "Client");
        assert_eq!(SoapVersion::Soap12.client_fault_code().local, "Sender");
        assert_eq!(SoapVersion::Soap12.server_fault_code().local, "Receiver");
        assert_eq!(
            SoapVersion::Soap12.map_fault_code(&SoapVersion::Soap11.server_fault_code()),
            SoapVersion::Soap12.server_fault_code()
        );
        let custom = QName::new("urn:app", "Broken");
        assert_eq!(SoapVersion::Soap11.map_fault_code(&custom), custom);
    }

    #[test]
    fn test_version_from_namespace() {
        assert_eq!(SoapVersion::from_namespace(SOAP_11_NS), Some(SoapVersion::Soap11));
        assert_eq!(SoapVersion::from_namespace(SOAP_12_NS), Some(SoapVersion::Soap12));
        assert_eq!(SoapVersion::from_namespace("urn:other"), None);
    }

    #[test]
    fn test_features() {
        let binding = WsBinding::new(BindingKind::Soap12)
            .with_feature(ADDRESSING_FEATURE)
            .with_mtom(true);
        assert!(binding.is_addressing_enabled());
        assert!(binding.is_mtom_enabled());
        assert_eq!(binding.soap_version(), Some(SoapVersion::Soap12));
        assert_eq!(binding.features().count(), 2);
    }

    #[test]
    fn test_handler_chain_replaced_not_mutated() {
        let binding = WsBinding::new(BindingKind::Soap11);
        let before = binding.handler_config();
        binding
            .set_handler_chain(vec![
                HandlerEntry::logical(NoopLogical),
                HandlerEntry::soap(NoopSoap),
            ])
            .unwrap();
        let after = binding.handler_config();
        assert!(before.handler_chain().is_empty());
        assert_eq!(after.handler_chain().len(), 2);
        assert_eq!(after.logical_handlers().len(), 1);
        assert_eq!(after.soap_handlers().len(), 1);
    }

    #[test]
    fn test_xml_http_rejects_soap_handlers() {
        let binding = WsBinding::new(BindingKind::XmlHttp);
        assert!(binding.set_handler_chain(vec![HandlerEntry::soap(NoopSoap)]).is_err());
        assert!(binding
            .set_handler_chain(vec![HandlerEntry::logical(NoopLogical)])
            .is_ok());
        assert!(binding.set_roles(["urn:role"]).is_err());
    }

    #[test]
    fn test_roles() {
        let binding = WsBinding::new(BindingKind::Soap12);
        binding.set_roles(["urn:auditor"]).unwrap();
        let config = binding.handler_config();
        assert!(config.roles().contains("urn:auditor"));
        assert!(config.roles().contains(SoapVersion::Soap12.next_role()));
        assert!(binding.set_roles([SOAP_12_NONE_ROLE]).is_err());
    }
}
