use crate::binding::SoapVersion;
use crate::error::Result;
use crate::infoset::Element;
use crate::message::{HeaderList, Message};
use crate::packet::Packet;
use crate::property::{PropertyError, PropertySet, PropertyValue};
use std::collections::HashSet;

/// Direction a message travels relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::Outbound => Self::Inbound,
            Self::Inbound => Self::Outbound,
        }
    }
}

/// What a logical handler sees: the payload and the packet properties.
pub struct LogicalMessageContext<'a> {
    packet: &'a mut Packet,
    direction: Direction,
}

impl<'a> LogicalMessageContext<'a> {
    pub fn new(packet: &'a mut Packet, direction: Direction) -> Self {
        Self { packet, direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// The payload as an element tree. The message stays readable.
    pub fn payload(&mut self) -> Result<Option<&Element>> {
        match self.packet.message_mut() {
            Some(message) => message.payload_tree(),
            None => Ok(None),
        }
    }

    /// Replace the payload, keeping headers.
    pub fn set_payload(&mut self, payload: Option<Element>) {
        if let Some(message) = self.packet.message_mut() {
            message.set_payload(payload);
        }
    }

    pub fn is_fault(&mut self) -> bool {
        self.packet.is_fault()
    }

    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.packet.get(key)
    }

    pub fn set_property(
        &mut self,
        key: &str,
        value: PropertyValue,
    ) -> std::result::Result<Option<PropertyValue>, PropertyError> {
        self.packet.put(key, value)
    }

    pub fn packet(&self) -> &Packet {
        &*self.packet
    }
}

/// What a SOAP handler sees: the whole message plus the roles in effect.
pub struct SoapMessageContext<'a> {
    inner: LogicalMessageContext<'a>,
    roles: &'a HashSet<String>,
}

impl<'a> SoapMessageContext<'a> {
    pub fn new(packet: &'a mut Packet, direction: Direction, roles: &'a HashSet<String>) -> Self {
        Self {
            inner: LogicalMessageContext::new(packet, direction),
            roles,
        }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.inner.is_outbound()
    }

    pub fn version(&self) -> Option<SoapVersion> {
        self.inner.packet.message().and_then(Message::version)
    }

    pub fn roles(&self) -> &HashSet<String> {
        self.roles
    }

    pub fn headers(&self) -> Option<&HeaderList> {
        self.inner.packet.message().map(Message::headers)
    }

    pub fn headers_mut(&mut self) -> Option<&mut HeaderList> {
        self.inner.packet.message_mut().map(Message::headers_mut)
    }

    /// The whole message.
    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.inner.packet.message_mut()
    }

    pub fn set_message(&mut self, message: Message) {
        self.inner.packet.set_message(Some(message));
    }

    pub fn payload(&mut self) -> Result<Option<&Element>> {
        self.inner.payload()
    }

    pub fn set_payload(&mut self, payload: Option<Element>) {
        self.inner.set_payload(payload)
    }

    pub fn is_fault(&mut self) -> bool {
        self.inner.is_fault()
    }

    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.inner.property(key)
    }

    pub fn set_property(
        &mut self,
        key: &str,
        value: PropertyValue,
    ) -> std::result::Result<Option<PropertyValue>, PropertyError> {
        self.inner.set_property(key, value)
    }

    pub fn packet(&self) -> &Packet {
        self.inner.packet()
    }
}
