//! Client stub: turns calls into request messages, runs them through the
//! client pipeline and unpacks replies and faults.

use crate::assembler::{AssemblyConfig, ClientAssemblerContext, TubeAssembler};
use crate::binding::{SoapVersion, WsBinding};
use crate::error::RuntimeError;
use crate::fault::{ProtocolFault, SoapFault};
use crate::infoset::Element;
use crate::message::Message;
use crate::packet::Packet;
use crate::tube::TubePool;
use crate::tubes::Transport;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced to callers of [`ServiceClient`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The service answered with a fault.
    #[error(transparent)]
    Fault(ProtocolFault),

    #[error(transparent)]
    Runtime(RuntimeError),
}

impl From<RuntimeError> for ClientError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Protocol(fault) => Self::Fault(fault),
            other => Self::Runtime(other),
        }
    }
}

impl From<ProtocolFault> for ClientError {
    fn from(fault: ProtocolFault) -> Self {
        Self::Fault(fault)
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ClientCall {
    action: Option<String>,
    one_way: bool,
}

impl ClientCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Send without waiting for a reply.
    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way
    }
}

/// A client bound to one service.
pub struct ServiceClient {
    binding: Arc<WsBinding>,
    pool: TubePool,
    endpoint_address: Option<String>,
}

impl ServiceClient {
    pub fn new(binding: Arc<WsBinding>, transport: Arc<dyn Transport>, config: &AssemblyConfig) -> Self {
        let context = ClientAssemblerContext::new(Arc::clone(&binding), config.clone(), transport);
        let head = TubeAssembler::for_binding(binding.kind()).create_client(&context);
        Self {
            binding,
            pool: TubePool::new(head),
            endpoint_address: None,
        }
    }

    /// Address written into `wsa:To` when addressing is enabled.
    pub fn with_endpoint_address(mut self, address: impl Into<String>) -> Self {
        self.endpoint_address = Some(address.into());
        self
    }

    pub fn binding(&self) -> &Arc<WsBinding> {
        &self.binding
    }

    /// Send `payload` and return the reply payload. One-way calls always
    /// return `Ok(None)`.
    pub fn invoke(&self, call: &ClientCall, payload: Option<Element>) -> Result<Option<Element>, ClientError> {
        let version = self.binding.soap_version();
        let request = match payload {
            Some(element) => Message::from_element(version, element),
            None => Message::empty(version),
        };
        match self.exchange(call, request)? {
            Some(mut reply) => reply
                .read_payload_as_element()
                .map_err(|e| RuntimeError::deserialization(true, e).into()),
            None => Ok(None),
        }
    }

    /// Typed call: `request` is serialized as the payload element `root`
    /// and the reply payload is deserialized into `Resp`.
    pub fn call<Req, Resp>(&self, call: &ClientCall, root: &str, request: &Req) -> Result<Option<Resp>, ClientError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let message = Message::from_serializable(self.binding.soap_version(), root, request)?;
        match self.exchange(call, message)? {
            Some(mut reply) => reply
                .read_payload_as::<Resp>()
                .map_err(|e| RuntimeError::deserialization(true, e).into()),
            None => Ok(None),
        }
    }

    /// Run one request through a pipeline clone. Returns the non-fault reply.
    fn exchange(&self, call: &ClientCall, message: Message) -> Result<Option<Message>, ClientError> {
        let mut packet = Packet::new(message);
        packet.set_soap_action(call.action.clone());
        packet.set_endpoint_address(self.endpoint_address.clone());
        packet.set_expects_reply(!call.one_way);

        debug!(action = ?call.action, one_way = call.one_way, "Invoking service");
        let mut response = self.pool.process(packet)?;
        if call.one_way {
            return Ok(None);
        }

        let Some(mut reply) = response.take_message() else {
            return Ok(None);
        };
        if let Some(fault) = fault_of(&mut reply)? {
            debug!(code = %fault.code, reason = %fault.reason, "Service answered with a fault");
            return Err(ClientError::Fault(fault));
        }
        Ok(Some(reply))
    }

    /// Release the client pipeline.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// The fault carried by `reply`. Replies without a SOAP version carry a
/// bare SOAP 1.1 fault element.
fn fault_of(reply: &mut Message) -> crate::error::Result<Option<ProtocolFault>> {
    if reply.version().is_none() {
        if reply.payload_qname()? != Some(SoapVersion::Soap11.fault_name()) {
            return Ok(None);
        }
        let element = reply
            .read_payload_as_element()?
            .ok_or(RuntimeError::MessageConsumed)?;
        return Ok(Some(SoapFault::from_element(&element)?.to_protocol()));
    }
    Ok(SoapFault::from_message(reply)?.map(|f| f.to_protocol()))
}
