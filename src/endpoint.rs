//! Server side: the operation table of a service and the adapter that feeds
//! encoded requests through the server pipeline.

use crate::assembler::{AssemblyConfig, ServerAssemblerContext, TubeAssembler};
use crate::binding::{SoapVersion, WsBinding};
use crate::codec::{codec_for, Codec};
use crate::dispatch::{ActionFinder, OperationDispatcher, OperationFinder, PayloadQNameFinder};
use crate::error::{Result, RuntimeError};
use crate::fault::ProtocolFault;
use crate::infoset::{Element, QName};
use crate::packet::Packet;
use crate::parser::parse_soap_action;
use crate::tube::TubePool;
use crate::tubes::{fault_message, WireMessage};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors returned by operation implementations.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// Sent back to the client as-is.
    #[error(transparent)]
    Fault(ProtocolFault),

    /// Business failure, reported as a server fault.
    #[error("{0}")]
    Failed(String),
}

impl From<ProtocolFault> for ServiceError {
    fn from(fault: ProtocolFault) -> Self {
        Self::Fault(fault)
    }
}

type OperationFn = dyn Fn(Option<Element>) -> std::result::Result<Option<Element>, ServiceError> + Send + Sync;

/// One service operation.
#[derive(Clone)]
pub struct Operation {
    pub name: String,
    /// Request payload element; `None` for operations without a body part
    pub request: Option<QName>,
    pub action: Option<String>,
    pub one_way: bool,
    handler: Arc<OperationFn>,
}

impl Operation {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Element>) -> std::result::Result<Option<Element>, ServiceError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            request: None,
            action: None,
            one_way: false,
            handler: Arc::new(handler),
        }
    }

    pub fn with_request(mut self, request: QName) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn one_way(mut self) -> Self {
        self.one_way = true;
        self
    }

    pub fn invoke(&self, input: Option<Element>) -> std::result::Result<Option<Element>, ServiceError> {
        (self.handler)(input)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("request", &self.request)
            .field("action", &self.action)
            .field("one_way", &self.one_way)
            .finish()
    }
}

/// A service endpoint: binding, operations and dispatcher.
pub struct Endpoint {
    binding: Arc<WsBinding>,
    operations: HashMap<String, Operation>,
    dispatcher: OperationDispatcher,
}

impl Endpoint {
    pub fn builder(binding: impl Into<Arc<WsBinding>>) -> EndpointBuilder {
        EndpointBuilder {
            binding: binding.into(),
            operations: Vec::new(),
        }
    }

    pub fn binding(&self) -> &Arc<WsBinding> {
        &self.binding
    }

    /// Version used for faults; plain XML endpoints use SOAP 1.1 codes.
    pub fn fault_version(&self) -> SoapVersion {
        self.binding.soap_version().unwrap_or(SoapVersion::Soap11)
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    /// Select the operation for `packet`.
    pub fn dispatch(&self, packet: &mut Packet) -> Result<&Operation> {
        let name = self.dispatcher.dispatch(packet)?;
        self.operations
            .get(&name)
            .ok_or_else(|| RuntimeError::Config(format!("dispatched to unknown operation '{}'", name)))
    }
}

pub struct EndpointBuilder {
    binding: Arc<WsBinding>,
    operations: Vec<Operation>,
}

impl EndpointBuilder {
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Validate the operation table and build the dispatcher.
    pub fn build(self) -> Result<Endpoint> {
        let version = self.binding.soap_version().unwrap_or(SoapVersion::Soap11);

        let mut operations = HashMap::new();
        for op in &self.operations {
            if operations.insert(op.name.clone(), op.clone()).is_some() {
                return Err(RuntimeError::Config(format!(
                    "duplicate operation name '{}'",
                    op.name
                )));
            }
        }

        let payload = PayloadQNameFinder::new(
            version,
            self.operations
                .iter()
                .map(|op| (op.request.clone().unwrap_or_else(QName::empty), op.name.clone())),
        );
        let action = ActionFinder::new(
            self.operations
                .iter()
                .filter_map(|op| op.action.clone().map(|a| (a, op.name.clone()))),
        );
        let finders: Vec<Box<dyn OperationFinder>> = vec![Box::new(payload), Box::new(action)];

        debug!(
            binding = self.binding.kind().binding_id(),
            operations = operations.len(),
            "Endpoint built"
        );
        Ok(Endpoint {
            binding: self.binding,
            operations,
            dispatcher: OperationDispatcher::new(version, finders),
        })
    }
}

/// Runs encoded requests through a pooled server pipeline.
pub struct ServerAdapter {
    pool: TubePool,
    codec: Arc<dyn Codec>,
    version: Option<SoapVersion>,
    max_body_size: usize,
}

impl ServerAdapter {
    pub fn new(endpoint: Endpoint, config: &AssemblyConfig) -> Self {
        let endpoint = Arc::new(endpoint);
        let binding = Arc::clone(endpoint.binding());
        let context = ServerAssemblerContext::new(Arc::clone(&binding), config.clone(), endpoint);
        let head = TubeAssembler::for_binding(binding.kind()).create_server(&context);
        Self {
            pool: TubePool::new(head),
            codec: codec_for(binding.kind()),
            version: binding.soap_version(),
            max_body_size: config.max_body_size,
        }
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    fn fault_reply(&self, fault: ProtocolFault) -> Result<Option<WireMessage>> {
        let mut message = fault_message(self.version, fault);
        Ok(Some(WireMessage {
            body: self.codec.encode(&mut message)?,
            content_type: self.codec.content_type(None),
        }))
    }

    /// Handle one encoded request. `Ok(None)` means there is nothing to send
    /// back (one-way).
    pub fn handle(
        &self,
        body: &[u8],
        content_type: Option<&str>,
        soap_action: Option<&str>,
    ) -> Result<Option<WireMessage>> {
        let correlation_id = Uuid::new_v4();
        let fault_version = self.version.unwrap_or(SoapVersion::Soap11);
        debug!(
            correlation_id = %correlation_id,
            bytes = body.len(),
            content_type = ?content_type,
            "Processing SOAP request"
        );

        if body.len() > self.max_body_size {
            warn!(
                correlation_id = %correlation_id,
                body_size = body.len(),
                max_size = self.max_body_size,
                "Request body too large"
            );
            return self.fault_reply(ProtocolFault::client(
                fault_version,
                format!(
                    "Request body size {} exceeds maximum {}",
                    body.len(),
                    self.max_body_size
                ),
            ));
        }

        let message = match self.codec.decode(body, content_type) {
            Ok(m) => m,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Failed to decode request");
                let e = match e {
                    RuntimeError::Protocol(_) => e,
                    other => RuntimeError::deserialization(false, other),
                };
                return self.fault_reply(ProtocolFault::from_error(fault_version, &e));
            }
        };

        let mut packet = Packet::new(message);
        packet.set_soap_action(soap_action.map(parse_soap_action).filter(|a| !a.is_empty()));

        let mut response = match self.pool.process(packet) {
            Ok(response) => response,
            Err(RuntimeError::PipelineClosed) => return Err(RuntimeError::PipelineClosed),
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Request processing failed");
                return self.fault_reply(ProtocolFault::from_error(fault_version, &e));
            }
        };

        let soap_action = response.soap_action().map(str::to_string);
        match response.take_message() {
            None => {
                debug!(correlation_id = %correlation_id, "No response message");
                Ok(None)
            }
            Some(mut message) => {
                let is_fault = message.is_fault();
                if is_fault {
                    info!(correlation_id = %correlation_id, operation = ?response.operation(), "Answering with fault");
                } else {
                    debug!(correlation_id = %correlation_id, operation = ?response.operation(), "Answering");
                }
                Ok(Some(WireMessage {
                    body: self.codec.encode(&mut message)?,
                    content_type: self.codec.content_type(soap_action.as_deref()),
                }))
            }
        }
    }

    /// Shut the server pipeline down. Later requests fail with `PipelineClosed`.
    pub fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingKind;

    fn noop() -> impl Fn(Option<Element>) -> std::result::Result<Option<Element>, ServiceError> {
        |_| Ok(None)
    }

    #[test]
    fn test_duplicate_operation_names_rejected() {
        let result = Endpoint::builder(WsBinding::new(BindingKind::Soap11))
            .operation(Operation::new("order", noop()).with_request(QName::new("urn:a", "A")))
            .operation(Operation::new("order", noop()).with_request(QName::new("urn:a", "B")))
            .build();
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_dispatch_to_operation() {
        let endpoint = Endpoint::builder(WsBinding::new(BindingKind::Soap12))
            .operation(Operation::new("order", noop()).with_request(QName::new("urn:a", "Order")))
            .build()
            .unwrap();
        let mut packet = Packet::new(crate::message::Message::from_element(
            SoapVersion::Soap12,
            Element::new(QName::new("urn:a", "Order")),
        ));
        assert_eq!(endpoint.dispatch(&mut packet).unwrap().name, "order");
        assert_eq!(endpoint.fault_version(), SoapVersion::Soap12);
    }
}
