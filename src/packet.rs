//! Packets: a message plus the properties that travel with it.

use crate::error::Result;
use crate::message::Message;
use crate::property::{
    DistributedPropertySet, MapPropertySet, PropertyError, PropertySet, PropertyValue,
};
use serde_json::Value;

/// SOAPAction of the exchange.
pub const SOAP_ACTION: &str = "soap.action";
/// Address the request is sent to.
pub const ENDPOINT_ADDRESS: &str = "endpoint.address";
/// Whether the sender waits for a reply.
pub const EXPECT_REPLY: &str = "expect.reply";
/// WS-Addressing message id.
pub const MESSAGE_ID: &str = "wsa.message_id";
/// Operation chosen by dispatch. Read-only through the generic interface.
pub const OPERATION: &str = "operation";

/// Typed properties owned by every packet. Unknown keys land in the
/// invocation map.
#[derive(Debug, Clone, Default)]
pub struct PacketProperties {
    pub soap_action: Option<String>,
    pub endpoint_address: Option<String>,
    pub expect_reply: Option<bool>,
    pub message_id: Option<String>,
    operation: Option<String>,
    invocation: MapPropertySet,
}

fn string_value(key: &str, value: PropertyValue) -> Result<Option<String>, PropertyError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(PropertyError::InvalidType {
            key: key.to_string(),
            expected: "string",
        }),
    }
}

fn opt_string(value: &Option<String>) -> Option<PropertyValue> {
    value.clone().map(Value::String)
}

impl PropertySet for PacketProperties {
    fn supports(&self, _key: &str) -> bool {
        true
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        match key {
            SOAP_ACTION => opt_string(&self.soap_action),
            ENDPOINT_ADDRESS => opt_string(&self.endpoint_address),
            EXPECT_REPLY => self.expect_reply.map(Value::Bool),
            MESSAGE_ID => opt_string(&self.message_id),
            OPERATION => opt_string(&self.operation),
            other => self.invocation.get(other),
        }
    }

    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        let previous = self.get(key);
        match key {
            SOAP_ACTION => self.soap_action = string_value(key, value)?,
            ENDPOINT_ADDRESS => self.endpoint_address = string_value(key, value)?,
            MESSAGE_ID => self.message_id = string_value(key, value)?,
            EXPECT_REPLY => {
                self.expect_reply = match value {
                    Value::Null => None,
                    Value::Bool(b) => Some(b),
                    _ => {
                        return Err(PropertyError::InvalidType {
                            key: key.to_string(),
                            expected: "boolean",
                        })
                    }
                }
            }
            OPERATION => return Err(PropertyError::ReadOnly(key.to_string())),
            other => return self.invocation.put(other, value),
        }
        Ok(previous)
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        match key {
            OPERATION => Err(PropertyError::ReadOnly(key.to_string())),
            SOAP_ACTION | ENDPOINT_ADDRESS | EXPECT_REPLY | MESSAGE_ID => {
                self.put(key, Value::Null)
            }
            other => self.invocation.remove(other),
        }
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = [SOAP_ACTION, ENDPOINT_ADDRESS, EXPECT_REPLY, MESSAGE_ID, OPERATION]
            .into_iter()
            .filter(|k| self.get(k).is_some())
            .map(str::to_string)
            .collect();
        keys.extend(self.invocation.keys());
        keys
    }
}

/// The unit of work moving through a tube chain.
#[derive(Debug)]
pub struct Packet {
    message: Option<Message>,
    properties: DistributedPropertySet<PacketProperties>,
}

impl Packet {
    pub fn new(message: Message) -> Self {
        Self {
            message: Some(message),
            properties: DistributedPropertySet::new(PacketProperties::default()),
        }
    }

    /// A packet without a message.
    pub fn empty() -> Self {
        Self {
            message: None,
            properties: DistributedPropertySet::new(PacketProperties::default()),
        }
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn message_mut(&mut self) -> Option<&mut Message> {
        self.message.as_mut()
    }

    pub fn set_message(&mut self, message: Option<Message>) {
        self.message = message;
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some()
    }

    /// Whether the message is a SOAP fault.
    pub fn is_fault(&mut self) -> bool {
        self.message.as_mut().map(Message::is_fault).unwrap_or(false)
    }

    pub fn properties(&self) -> &DistributedPropertySet<PacketProperties> {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut DistributedPropertySet<PacketProperties> {
        &mut self.properties
    }

    fn typed(&self) -> &PacketProperties {
        self.properties.owner()
    }

    fn typed_mut(&mut self) -> &mut PacketProperties {
        self.properties.owner_mut()
    }

    pub fn soap_action(&self) -> Option<&str> {
        self.typed().soap_action.as_deref()
    }

    pub fn set_soap_action(&mut self, action: Option<String>) {
        self.typed_mut().soap_action = action;
    }

    pub fn endpoint_address(&self) -> Option<&str> {
        self.typed().endpoint_address.as_deref()
    }

    pub fn set_endpoint_address(&mut self, address: Option<String>) {
        self.typed_mut().endpoint_address = address;
    }

    /// `None` when the exchange pattern is not known yet.
    pub fn expects_reply(&self) -> Option<bool> {
        self.typed().expect_reply
    }

    pub fn set_expects_reply(&mut self, expect: bool) {
        self.typed_mut().expect_reply = Some(expect);
    }

    /// Only an explicit `expect_reply == false` makes an exchange one-way.
    pub fn is_one_way(&self) -> bool {
        self.typed().expect_reply == Some(false)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.typed().message_id.as_deref()
    }

    pub fn set_message_id(&mut self, id: Option<String>) {
        self.typed_mut().message_id = id;
    }

    pub fn operation(&self) -> Option<&str> {
        self.typed().operation.as_deref()
    }

    pub fn set_operation(&mut self, operation: Option<String>) {
        self.typed_mut().operation = operation;
    }

    /// A response packet carrying this packet's properties.
    pub fn create_response(&self, message: Option<Message>) -> Packet {
        Packet {
            message,
            properties: self.properties.clone(),
        }
    }

    /// An independent replica, message included.
    pub fn copy(&mut self) -> Result<Packet> {
        let message = match self.message.as_mut() {
            Some(m) => Some(m.copy()?),
            None => None,
        };
        Ok(Packet {
            message,
            properties: self.properties.clone(),
        })
    }
}

impl PropertySet for Packet {
    fn supports(&self, key: &str) -> bool {
        self.properties.supports(key)
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        self.properties.get(key)
    }

    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        self.properties.put(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        self.properties.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.properties.keys()
    }
}
