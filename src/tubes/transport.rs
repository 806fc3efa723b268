use crate::codec::Codec;
use crate::endpoint::ServerAdapter;
use crate::error::{Result, RuntimeError};
use crate::packet::Packet;
use crate::property::{PropertyError, PropertySet, PropertyValue, Satellite};
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, warn};

/// Content type the request was sent with.
pub const CONTENT_TYPE: &str = "transport.content_type";

/// Content type of the reply, when there was one.
pub const RESPONSE_CONTENT_TYPE: &str = "transport.response_content_type";

/// An encoded message and its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Moves encoded requests to a server and brings back the reply.
pub trait Transport: Send + Sync {
    /// Deliver `request`. One-way requests return `Ok(None)` as soon as the
    /// request has been handed off.
    fn send(
        &self,
        request: WireMessage,
        soap_action: Option<&str>,
        one_way: bool,
    ) -> Result<Option<WireMessage>>;
}

/// Transport-level packet properties, attached as a satellite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportProperties {
    pub content_type: Option<String>,
    pub response_content_type: Option<String>,
}

impl TransportProperties {
    fn slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            CONTENT_TYPE => Some(&mut self.content_type),
            RESPONSE_CONTENT_TYPE => Some(&mut self.response_content_type),
            _ => None,
        }
    }
}

impl PropertySet for TransportProperties {
    fn supports(&self, key: &str) -> bool {
        matches!(key, CONTENT_TYPE | RESPONSE_CONTENT_TYPE)
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        let value = match key {
            CONTENT_TYPE => self.content_type.clone(),
            RESPONSE_CONTENT_TYPE => self.response_content_type.clone(),
            _ => None,
        };
        value.map(Value::String)
    }

    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        let previous = self.get(key);
        let new = match value {
            Value::Null => None,
            Value::String(s) => Some(s),
            _ => {
                return Err(PropertyError::InvalidType {
                    key: key.to_string(),
                    expected: "string",
                })
            }
        };
        if let Some(slot) = self.slot(key) {
            *slot = new;
        }
        Ok(previous)
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        self.put(key, Value::Null)
    }

    fn keys(&self) -> Vec<String> {
        [CONTENT_TYPE, RESPONSE_CONTENT_TYPE]
            .into_iter()
            .filter(|k| self.get(k).is_some())
            .map(str::to_string)
            .collect()
    }
}

impl Satellite for TransportProperties {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_satellite(&self) -> Box<dyn Satellite> {
        Box::new(self.clone())
    }
}

/// Terminal client stage: encode, send, decode.
pub struct TransportTube {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
}

impl TransportTube {
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>) -> Self {
        Self { transport, codec }
    }

    fn exchange(&self, packet: &mut Packet) -> Result<Packet> {
        let one_way = packet.is_one_way();
        let soap_action = packet.soap_action().map(str::to_string);
        let mut message = packet
            .take_message()
            .ok_or_else(|| RuntimeError::Transport("no message to send".to_string()))?;

        let request = WireMessage {
            body: self.codec.encode(&mut message)?,
            content_type: self.codec.content_type(soap_action.as_deref()),
        };
        let mut properties = TransportProperties {
            content_type: Some(request.content_type.clone()),
            response_content_type: None,
        };
        debug!(
            bytes = request.body.len(),
            content_type = %request.content_type,
            one_way,
            "Sending request"
        );

        let reply = self
            .transport
            .send(request, soap_action.as_deref(), one_way)?;
        let response_message = match reply {
            None => None,
            Some(reply) => {
                let message = self
                    .codec
                    .decode(&reply.body, Some(&reply.content_type))
                    .map_err(|e| RuntimeError::deserialization(true, e))?;
                properties.response_content_type = Some(reply.content_type);
                Some(message)
            }
        };

        let mut response = packet.create_response(response_message);
        response
            .properties_mut()
            .remove_satellite::<TransportProperties>();
        response.properties_mut().add_satellite(properties);
        Ok(response)
    }
}

impl Tube for TransportTube {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn process_request(&mut self, mut packet: Packet) -> NextAction {
        match self.exchange(&mut packet) {
            Ok(response) => NextAction::Return(response),
            Err(e) => {
                warn!(error = %e, "Transport exchange failed");
                NextAction::Throw(e)
            }
        }
    }

    fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(TransportTube {
            transport: Arc::clone(&self.transport),
            codec: Arc::clone(&self.codec),
        })
    }

    fn shareable(&self) -> bool {
        true
    }
}

/// Delivers requests to an in-process [`ServerAdapter`].
///
/// One-way requests are processed on a separate thread and the call returns
/// immediately.
pub struct LocalTransport {
    adapter: Arc<ServerAdapter>,
}

impl LocalTransport {
    pub fn new(adapter: Arc<ServerAdapter>) -> Self {
        Self { adapter }
    }
}

impl Transport for LocalTransport {
    fn send(
        &self,
        request: WireMessage,
        soap_action: Option<&str>,
        one_way: bool,
    ) -> Result<Option<WireMessage>> {
        if one_way {
            let adapter = Arc::clone(&self.adapter);
            let soap_action = soap_action.map(str::to_string);
            std::thread::Builder::new()
                .name("soap-one-way".to_string())
                .spawn(move || {
                    if let Err(e) = adapter.handle(
                        &request.body,
                        Some(&request.content_type),
                        soap_action.as_deref(),
                    ) {
                        warn!(error = %e, "One-way request failed");
                    }
                })?;
            return Ok(None);
        }
        self.adapter
            .handle(&request.body, Some(&request.content_type), soap_action)
    }
}
