use super::fault_response;
use crate::endpoint::{Endpoint, ServiceError};
use crate::error::RuntimeError;
use crate::fault::ProtocolFault;
use crate::message::Message;
use crate::packet::Packet;
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use std::sync::Arc;
use tracing::{debug, warn};

/// Terminal server stage: dispatch, invoke, answer.
///
/// Dispatch and business failures become fault messages, so the stages
/// in front of the invoker see them on the response leg.
pub struct InvokerTube {
    endpoint: Arc<Endpoint>,
}

impl InvokerTube {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { endpoint }
    }

    fn invoke(&self, mut packet: Packet) -> Packet {
        let version = self.endpoint.binding().soap_version();
        let fault_version = self.endpoint.fault_version();

        let operation = match self.endpoint.dispatch(&mut packet) {
            Ok(op) => op.clone(),
            Err(e) => {
                warn!(error = %e, "Dispatch failed");
                return fault_response(&packet, version, ProtocolFault::from_error(fault_version, &e));
            }
        };
        packet.set_operation(Some(operation.name.clone()));

        let input = match packet.message_mut() {
            Some(message) => match message.read_payload_as_element() {
                Ok(input) => input,
                Err(e) => {
                    let e = RuntimeError::deserialization(false, e);
                    warn!(operation = %operation.name, error = %e, "Unreadable request payload");
                    return fault_response(&packet, version, ProtocolFault::from_error(fault_version, &e));
                }
            },
            None => None,
        };

        debug!(operation = %operation.name, one_way = operation.one_way, "Invoking operation");
        match operation.invoke(input) {
            Ok(_) if operation.one_way => packet.create_response(None),
            Ok(output) => {
                let message = match output {
                    Some(element) => Message::from_element(version, element),
                    None => Message::empty(version),
                };
                packet.create_response(Some(message))
            }
            Err(ServiceError::Fault(fault)) => {
                debug!(operation = %operation.name, code = %fault.code, "Operation raised a fault");
                fault_response(&packet, version, fault)
            }
            Err(ServiceError::Failed(reason)) => {
                warn!(operation = %operation.name, reason = %reason, "Operation failed");
                fault_response(&packet, version, ProtocolFault::server(fault_version, reason))
            }
        }
    }
}

impl Tube for InvokerTube {
    fn name(&self) -> &'static str {
        "invoker"
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        NextAction::Return(self.invoke(packet))
    }

    fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(InvokerTube {
            endpoint: Arc::clone(&self.endpoint),
        })
    }

    fn shareable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingKind, SoapVersion, WsBinding};
    use crate::endpoint::Operation;
    use crate::fault::SoapFault;
    use crate::infoset::{Element, QName};
    use crate::tube::Fiber;

    fn endpoint(kind: BindingKind) -> Arc<Endpoint> {
        let endpoint = Endpoint::builder(WsBinding::new(kind))
            .operation(
                Operation::new("echo", |input| Ok(input)).with_request(QName::new("urn:svc", "Echo")),
            )
            .operation(
                Operation::new("fail", |_| Err(ServiceError::Failed("out of stock".to_string())))
                    .with_request(QName::new("urn:svc", "Fail")),
            )
            .operation(
                Operation::new("notify", |_| Ok(None))
                    .with_request(QName::new("urn:svc", "Notify"))
                    .one_way(),
            )
            .build()
            .unwrap();
        Arc::new(endpoint)
    }

    fn run(kind: BindingKind, local: &str) -> Packet {
        let head = tube_ref(InvokerTube::new(endpoint(kind)));
        let message = Message::from_element(kind.soap_version(), Element::new(QName::new("urn:svc", local)));
        Fiber::new(head).run(Packet::new(message)).unwrap()
    }

    #[test]
    fn test_echo() {
        let mut response = run(BindingKind::Soap11, "Echo");
        assert_eq!(response.operation(), Some("echo"));
        assert_eq!(
            response.message_mut().unwrap().payload_qname().unwrap(),
            Some(QName::new("urn:svc", "Echo"))
        );
    }

    #[test]
    fn test_business_failure_is_server_fault() {
        let mut response = run(BindingKind::Soap12, "Fail");
        let fault = SoapFault::from_message(response.message_mut().unwrap())
            .unwrap()
            .unwrap()
            .to_protocol();
        assert_eq!(fault.code, SoapVersion::Soap12.server_fault_code());
        assert_eq!(fault.reason, "out of stock");
    }

    #[test]
    fn test_dispatch_miss_is_client_fault() {
        let mut response = run(BindingKind::Soap11, "Refund");
        let fault = SoapFault::from_message(response.message_mut().unwrap())
            .unwrap()
            .unwrap()
            .to_protocol();
        assert_eq!(fault.code, SoapVersion::Soap11.client_fault_code());
        assert_eq!(fault.reason, "Cannot find dispatch method for {urn:svc}Refund");
    }

    #[test]
    fn test_one_way_has_no_response() {
        let response = run(BindingKind::Soap11, "Notify");
        assert!(!response.has_message());
    }
}
