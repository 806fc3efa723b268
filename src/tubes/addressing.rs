use super::fault_response;
use crate::binding::SoapVersion;
use crate::fault::ProtocolFault;
use crate::handler::Side;
use crate::infoset::{Element, QName};
use crate::message::Header;
use crate::packet::Packet;
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// WS-Addressing 1.0 namespace.
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";

/// Address meaning "reply on the back channel".
pub const WSA_ANONYMOUS: &str = "http://www.w3.org/2005/08/addressing/anonymous";

const WSA_FAULT_ACTION: &str = "http://www.w3.org/2005/08/addressing/fault";

fn wsa(local: &str) -> QName {
    QName::new(WSA_NS, local)
}

fn wsa_element(local: &str) -> Element {
    Element::new(wsa(local)).with_prefix("wsa")
}

fn text_header(local: &str, value: impl Into<String>) -> Header {
    Header::new(wsa_element(local).with_text(value))
}

fn header_text(packet: &Packet, local: &str) -> Option<String> {
    packet
        .message()
        .and_then(|m| m.headers().get(&wsa(local)))
        .map(|h| h.text_value().trim().to_string())
}

/// Adds and reads WS-Addressing message information headers.
pub struct AddressingTube {
    side: Side,
    version: SoapVersion,
    required: bool,
    next: TubeRef,
}

impl AddressingTube {
    /// `required` makes the server reject requests without `wsa:Action`.
    pub fn new(side: Side, version: SoapVersion, required: bool, next: TubeRef) -> Self {
        Self {
            side,
            version,
            required,
            next,
        }
    }

    /// Header blocks this stage processes.
    pub fn understood_headers() -> Vec<QName> {
        ["To", "From", "Action", "MessageID", "ReplyTo", "FaultTo", "RelatesTo"]
            .into_iter()
            .map(wsa)
            .collect()
    }

    fn client_request(&self, mut packet: Packet) -> NextAction {
        let to = packet.endpoint_address().map(str::to_string);
        let action = packet.soap_action().map(str::to_string);
        let one_way = packet.is_one_way();
        let message_id = format!("urn:uuid:{}", Uuid::new_v4());

        if let Some(message) = packet.message_mut() {
            let headers = message.headers_mut();
            if let Some(to) = to {
                headers.add_or_replace(text_header("To", to));
            }
            if let Some(action) = action {
                headers.add_or_replace(text_header("Action", action));
            }
            headers.add_or_replace(text_header("MessageID", message_id.clone()));
            if !one_way {
                let reply_to = wsa_element("ReplyTo").with_child(wsa_element("Address").with_text(WSA_ANONYMOUS));
                headers.add_or_replace(Header::new(reply_to));
            }
            debug!(message_id = %message_id, one_way, "Added addressing headers");
            packet.set_message_id(Some(message_id));
        }
        NextAction::invoke(&self.next, packet)
    }

    fn client_response(&self, packet: Packet) -> NextAction {
        if let (Some(sent), Some(relates_to)) = (packet.message_id(), header_text(&packet, "RelatesTo")) {
            if sent != relates_to {
                warn!(
                    message_id = %sent,
                    relates_to = %relates_to,
                    "Response relates to a different message"
                );
            }
        }
        NextAction::Return(packet)
    }

    fn server_request(&self, mut packet: Packet) -> NextAction {
        if !packet.has_message() {
            return NextAction::invoke(&self.next, packet);
        }
        let action = header_text(&packet, "Action");
        let message_id = header_text(&packet, "MessageID");

        if self.required && action.is_none() {
            warn!("Request is missing required wsa:Action header");
            let fault = ProtocolFault::client(
                self.version,
                "Required WS-Addressing header missing: wsa:Action",
            )
            .with_subcode(wsa("MessageAddressingHeaderRequired"));
            return NextAction::Return(fault_response(&packet, Some(self.version), fault));
        }

        if let Some(action) = action {
            packet.set_soap_action(Some(action));
        }
        if message_id.is_some() {
            packet.set_message_id(message_id);
        }
        NextAction::invoke(&self.next, packet)
    }

    fn server_response(&self, mut packet: Packet) -> NextAction {
        let relates_to = packet.message_id().map(str::to_string);
        let request_action = packet.soap_action().map(str::to_string);
        if let Some(message) = packet.message_mut() {
            let action = if message.is_fault() {
                Some(WSA_FAULT_ACTION.to_string())
            } else {
                request_action.map(|a| format!("{}Response", a))
            };
            let headers = message.headers_mut();
            if let Some(action) = action {
                headers.add_or_replace(text_header("Action", action));
            }
            if let Some(id) = relates_to {
                headers.add_or_replace(text_header("RelatesTo", id));
            }
        }
        NextAction::Return(packet)
    }
}

impl Tube for AddressingTube {
    fn name(&self) -> &'static str {
        "addressing"
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        match self.side {
            Side::Client => self.client_request(packet),
            Side::Server => self.server_request(packet),
        }
    }

    fn process_response(&mut self, packet: Packet) -> NextAction {
        match self.side {
            Side::Client => self.client_response(packet),
            Side::Server => self.server_response(packet),
        }
    }

    fn copy(&self, cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(AddressingTube {
            side: self.side,
            version: self.version,
            required: self.required,
            next: cloner.copy(&self.next),
        })
    }

    fn next(&self) -> Option<TubeRef> {
        Some(Arc::clone(&self.next))
    }
}
