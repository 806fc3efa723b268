//! Built-in pipeline stages.
//!
//! Client order, head to tail: handlers, must-understand, addressing, dump,
//! security, transport. Server order: dump, security, addressing,
//! must-understand, handlers, invoker.

mod addressing;
mod dump;
mod invoker;
mod must_understand;
mod security;
mod transport;

pub use addressing::{AddressingTube, WSA_ANONYMOUS, WSA_NS};
pub use dump::DumpTube;
pub use invoker::InvokerTube;
pub use must_understand::MustUnderstandTube;
pub use security::SecurityTube;
pub use transport::{
    LocalTransport, Transport, TransportProperties, TransportTube, WireMessage, CONTENT_TYPE,
    RESPONSE_CONTENT_TYPE,
};

use crate::binding::SoapVersion;
use crate::fault::{ProtocolFault, SoapFault};
use crate::message::Message;
use crate::packet::Packet;

/// A fault message for `fault` in `version`.
///
/// Messages without a SOAP version carry the SOAP 1.1 fault element as a
/// bare payload.
pub(crate) fn fault_message(version: Option<SoapVersion>, fault: ProtocolFault) -> Message {
    match version {
        Some(v) => Message::create_fault(&fault.for_version(v)),
        None => Message::from_element(
            None,
            SoapFault::from_protocol(&fault.for_version(SoapVersion::Soap11)).to_element(),
        ),
    }
}

/// A response to `request` carrying `fault`.
pub(crate) fn fault_response(request: &Packet, version: Option<SoapVersion>, fault: ProtocolFault) -> Packet {
    request.create_response(Some(fault_message(version, fault)))
}
