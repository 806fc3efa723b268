//! Selecting the server operation for an inbound packet.
//!
//! Operations are keyed by the qualified name of their request payload.
//! Operations without a body part share the empty name. A name claimed by
//! more than one operation is left out of the table, so such requests fall
//! through to the next finder (SOAPAction) instead of being routed
//! arbitrarily.

use crate::binding::SoapVersion;
use crate::error::Result;
use crate::fault::ProtocolFault;
use crate::infoset::QName;
use crate::packet::Packet;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};

/// Dispatch failures. Both are the sender's fault.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Cannot find dispatch method for {key}")]
    Unrecognized { version: SoapVersion, key: String },

    #[error("No unique operation found for {key}")]
    NoUniqueOperation { version: SoapVersion, key: String },
}

impl DispatchError {
    pub fn version(&self) -> SoapVersion {
        match self {
            Self::Unrecognized { version, .. } | Self::NoUniqueOperation { version, .. } => {
                *version
            }
        }
    }

    /// The dispatch key in `{ns}local` form.
    pub fn key(&self) -> &str {
        match self {
            Self::Unrecognized { key, .. } | Self::NoUniqueOperation { key, .. } => key,
        }
    }

    /// Client fault in the version the error was raised for.
    pub fn to_fault(&self) -> ProtocolFault {
        ProtocolFault::client(self.version(), self.to_string())
    }
}

/// One strategy for mapping a packet to an operation name.
pub trait OperationFinder: Send + Sync {
    /// `Ok(None)` means no unique answer; the next strategy may try.
    fn find(&self, packet: &mut Packet) -> Result<Option<String>>;
}

/// Splits `entries` into a unique table and the set of colliding keys.
fn build_table<K>(kind: &str, entries: impl IntoIterator<Item = (K, String)>) -> (HashMap<K, String>, HashSet<K>)
where
    K: std::hash::Hash + Eq + std::fmt::Display + Clone,
{
    let mut candidates: HashMap<K, Vec<String>> = HashMap::new();
    for (key, operation) in entries {
        candidates.entry(key).or_default().push(operation);
    }

    let mut unique = HashMap::new();
    let mut ambiguous = HashSet::new();
    for (key, mut operations) in candidates {
        if operations.len() == 1 {
            if let Some(operation) = operations.pop() {
                unique.insert(key, operation);
            }
        } else {
            warn!(
                key = %key,
                operations = ?operations,
                "Non-unique {} dispatch key, operations excluded from dispatch table",
                kind
            );
            ambiguous.insert(key);
        }
    }
    (unique, ambiguous)
}

/// Dispatch on the qualified name of the payload's root element.
pub struct PayloadQNameFinder {
    version: SoapVersion,
    table: HashMap<QName, String>,
    ambiguous: HashSet<QName>,
}

impl PayloadQNameFinder {
    /// `entries` pairs each request qname (or [`QName::empty`]) with an
    /// operation name.
    pub fn new(version: SoapVersion, entries: impl IntoIterator<Item = (QName, String)>) -> Self {
        let (table, ambiguous) = build_table("payload", entries);
        Self {
            version,
            table,
            ambiguous,
        }
    }

    pub fn is_ambiguous(&self, name: &QName) -> bool {
        self.ambiguous.contains(name)
    }
}

impl OperationFinder for PayloadQNameFinder {
    fn find(&self, packet: &mut Packet) -> Result<Option<String>> {
        let name = match packet.message_mut() {
            Some(message) => message.payload_qname()?.unwrap_or_else(QName::empty),
            None => QName::empty(),
        };

        if let Some(operation) = self.table.get(&name) {
            debug!(payload = %name, operation = %operation, "Dispatched by payload");
            return Ok(Some(operation.clone()));
        }
        if self.ambiguous.contains(&name) {
            return Ok(None);
        }
        Err(DispatchError::Unrecognized {
            version: self.version,
            key: name.to_string(),
        }
        .into())
    }
}

/// Dispatch on the SOAPAction of the request.
pub struct ActionFinder {
    table: HashMap<String, String>,
}

impl ActionFinder {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let entries = entries.into_iter().filter(|(action, _)| !action.is_empty());
        let (table, _) = build_table("action", entries);
        Self { table }
    }
}

impl OperationFinder for ActionFinder {
    fn find(&self, packet: &mut Packet) -> Result<Option<String>> {
        let found = packet
            .soap_action()
            .filter(|a| !a.is_empty())
            .and_then(|action| self.table.get(action))
            .cloned();
        if let Some(operation) = &found {
            debug!(operation = %operation, "Dispatched by SOAPAction");
        }
        Ok(found)
    }
}

/// Runs finders in order; the first unique answer wins.
pub struct OperationDispatcher {
    version: SoapVersion,
    finders: Vec<Box<dyn OperationFinder>>,
}

impl OperationDispatcher {
    pub fn new(version: SoapVersion, finders: Vec<Box<dyn OperationFinder>>) -> Self {
        Self { version, finders }
    }

    pub fn dispatch(&self, packet: &mut Packet) -> Result<String> {
        for finder in &self.finders {
            if let Some(operation) = finder.find(packet)? {
                return Ok(operation);
            }
        }
        let key = match packet.message_mut() {
            Some(message) => message.payload_qname()?.unwrap_or_else(QName::empty),
            None => QName::empty(),
        };
        Err(DispatchError::NoUniqueOperation {
            version: self.version,
            key: key.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::infoset::Element;
    use crate::message::Message;

    const NS: &str = "urn:shop";

    fn request(version: SoapVersion, local: &str) -> Packet {
        Packet::new(Message::from_element(version, Element::new(QName::new(NS, local))))
    }

    fn finder(version: SoapVersion) -> PayloadQNameFinder {
        PayloadQNameFinder::new(
            version,
            vec![
                (QName::new(NS, "Order"), "order".to_string()),
                (QName::new(NS, "Foo"), "foo_a".to_string()),
                (QName::new(NS, "Foo"), "foo_b".to_string()),
                (QName::empty(), "ping".to_string()),
            ],
        )
    }

    #[test]
    fn test_unique_payload() {
        let found = finder(SoapVersion::Soap11)
            .find(&mut request(SoapVersion::Soap11, "Order"))
            .unwrap();
        assert_eq!(found.as_deref(), Some("order"));
    }

    #[test]
    fn test_ambiguous_payload_is_excluded() {
        let f = finder(SoapVersion::Soap11);
        assert!(f.is_ambiguous(&QName::new(NS, "Foo")));
        assert_eq!(f.find(&mut request(SoapVersion::Soap11, "Foo")).unwrap(), None);
    }

    #[test]
    fn test_empty_body_uses_sentinel() {
        let mut packet = Packet::new(Message::empty(SoapVersion::Soap12));
        let found = finder(SoapVersion::Soap12).find(&mut packet).unwrap();
        assert_eq!(found.as_deref(), Some("ping"));
    }

    #[test]
    fn test_unrecognized_payload_faults_per_version() {
        for version in [SoapVersion::Soap11, SoapVersion::Soap12] {
            let err = finder(version)
                .find(&mut request(version, "Refund"))
                .unwrap_err();
            let RuntimeError::Dispatch(dispatch) = err else {
                panic!("expected a dispatch error");
            };
            assert_eq!(dispatch.key(), "{urn:shop}Refund");
            let fault = dispatch.to_fault();
            assert_eq!(fault.code, version.client_fault_code());
            assert!(fault.reason.contains("{urn:shop}Refund"));
        }
    }

    #[test]
    fn test_dispatcher_falls_back_to_action() {
        let dispatcher = OperationDispatcher::new(
            SoapVersion::Soap11,
            vec![
                Box::new(finder(SoapVersion::Soap11)),
                Box::new(ActionFinder::new(vec![
                    ("urn:shop/FooA".to_string(), "foo_a".to_string()),
                    ("urn:shop/FooB".to_string(), "foo_b".to_string()),
                ])),
            ],
        );

        let mut packet = request(SoapVersion::Soap11, "Foo");
        packet.set_soap_action(Some("urn:shop/FooB".to_string()));
        assert_eq!(dispatcher.dispatch(&mut packet).unwrap(), "foo_b");

        let mut packet = request(SoapVersion::Soap11, "Foo");
        let err = dispatcher.dispatch(&mut packet).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Dispatch(DispatchError::NoUniqueOperation { .. })
        ));
    }

    #[test]
    fn test_duplicate_actions_are_ignored() {
        let finder = ActionFinder::new(vec![
            ("urn:a".to_string(), "one".to_string()),
            ("urn:a".to_string(), "two".to_string()),
        ]);
        let mut packet = request(SoapVersion::Soap11, "Order");
        packet.set_soap_action(Some("urn:a".to_string()));
        assert_eq!(finder.find(&mut packet).unwrap(), None);
    }
}
