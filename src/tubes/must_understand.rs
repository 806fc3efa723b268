use crate::binding::{SoapVersion, WsBinding};
use crate::fault::ProtocolFault;
use crate::handler::Side;
use crate::infoset::{Element, QName};
use crate::message::{Header, Message};
use crate::packet::Packet;
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rejects messages carrying `mustUnderstand` headers that are addressed to
/// this node but processed by nothing in the pipeline.
///
/// The understood set is the stage headers given at construction plus the
/// headers declared by the binding's SOAP handlers, read per message so a
/// handler chain swap takes effect immediately.
pub struct MustUnderstandTube {
    side: Side,
    binding: Arc<WsBinding>,
    understood: Arc<HashSet<QName>>,
    next: TubeRef,
}

impl MustUnderstandTube {
    pub fn new(
        side: Side,
        binding: Arc<WsBinding>,
        understood: impl IntoIterator<Item = QName>,
        next: TubeRef,
    ) -> Self {
        Self {
            side,
            binding,
            understood: Arc::new(understood.into_iter().collect()),
            next,
        }
    }

    /// Mark the targeted headers we process as understood and return the
    /// names of those nobody processes.
    fn check(&self, version: SoapVersion, message: &mut Message) -> Vec<QName> {
        let config = self.binding.handler_config();
        let headers = message.headers_mut();
        let mut understood = Vec::new();
        let mut missing = Vec::new();

        for (i, header) in headers.iter().enumerate() {
            if !header.is_targeted_at(version, config.roles()) {
                continue;
            }
            let name = header.name();
            if headers.is_understood(i)
                || self.understood.contains(name)
                || config.understood_headers().contains(name)
            {
                understood.push(i);
            } else if header.must_understand(version) {
                missing.push(name.clone());
            }
        }
        for i in understood {
            headers.mark_understood(i);
        }
        missing
    }

    fn fault(version: SoapVersion, missing: &[QName]) -> ProtocolFault {
        let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
        ProtocolFault::must_understand(
            version,
            format!("MustUnderstand headers:[{}] are not understood", names.join(", ")),
        )
    }

    /// Fault message; SOAP 1.2 lists each header in a `NotUnderstood` block.
    fn fault_message(version: SoapVersion, missing: &[QName]) -> Message {
        let mut message = Message::create_fault(&Self::fault(version, missing));
        if version == SoapVersion::Soap12 {
            for name in missing {
                let mut block = Element::new(QName::new(version.namespace(), "NotUnderstood"))
                    .with_prefix("env");
                let value = if name.namespace.is_empty() {
                    name.local.clone()
                } else {
                    block.declare_namespace("nu", name.namespace.clone());
                    format!("nu:{}", name.local)
                };
                message
                    .headers_mut()
                    .add(Header::new(block.with_attribute(QName::local("qname"), value)));
            }
        }
        message
    }
}

impl Tube for MustUnderstandTube {
    fn name(&self) -> &'static str {
        "must-understand"
    }

    fn process_request(&mut self, mut packet: Packet) -> NextAction {
        if self.side == Side::Client {
            return NextAction::invoke(&self.next, packet);
        }
        let Some(version) = self.binding.soap_version() else {
            return NextAction::invoke(&self.next, packet);
        };
        let missing = match packet.message_mut() {
            Some(message) => self.check(version, message),
            None => Vec::new(),
        };
        if missing.is_empty() {
            return NextAction::invoke(&self.next, packet);
        }
        warn!(headers = ?missing, "Request carries headers that are not understood");
        NextAction::Return(packet.create_response(Some(Self::fault_message(version, &missing))))
    }

    fn process_response(&mut self, mut packet: Packet) -> NextAction {
        if self.side == Side::Server {
            return NextAction::Return(packet);
        }
        let Some(version) = self.binding.soap_version() else {
            return NextAction::Return(packet);
        };
        let missing = match packet.message_mut() {
            Some(message) => {
                if message.is_fault() {
                    Vec::new()
                } else {
                    self.check(version, message)
                }
            }
            None => Vec::new(),
        };
        if missing.is_empty() {
            return NextAction::Return(packet);
        }
        debug!(headers = ?missing, "Response carries headers that are not understood");
        NextAction::throw(Self::fault(version, &missing))
    }

    fn copy(&self, cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(MustUnderstandTube {
            side: self.side,
            binding: Arc::clone(&self.binding),
            understood: Arc::clone(&self.understood),
            next: cloner.copy(&self.next),
        })
    }

    fn next(&self) -> Option<TubeRef> {
        Some(Arc::clone(&self.next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BindingKind;
    use crate::error::RuntimeError;
    use crate::fault::SoapFault;
    use crate::tube::Fiber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    impl Tube for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn process_request(&mut self, packet: Packet) -> NextAction {
            self.0.fetch_add(1, Ordering::SeqCst);
            NextAction::Return(packet)
        }
        fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
            tube_ref(Counter(Arc::clone(&self.0)))
        }
    }

    fn server(kind: BindingKind, understood: Vec<QName>, hits: &Arc<AtomicUsize>) -> TubeRef {
        tube_ref(MustUnderstandTube::new(
            Side::Server,
            Arc::new(WsBinding::new(kind)),
            understood,
            tube_ref(Counter(Arc::clone(hits))),
        ))
    }

    fn request(version: SoapVersion, header: Header) -> Packet {
        let mut message = Message::empty(version);
        message.headers_mut().add(header);
        Packet::new(message)
    }

    #[test]
    fn test_unknown_header_faults_with_not_understood() {
        let hits = Arc::new(AtomicUsize::new(0));
        let head = server(BindingKind::Soap12, Vec::new(), &hits);
        let header = Header::text(QName::new("urn:tx", "Transaction"), "42")
            .with_must_understand(SoapVersion::Soap12);
        let mut response = Fiber::new(head).run(request(SoapVersion::Soap12, header)).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        let message = response.message_mut().unwrap();
        let not_understood = QName::new(SoapVersion::Soap12.namespace(), "NotUnderstood");
        assert!(message.headers().get(&not_understood).is_some());
        let fault = SoapFault::from_message(message).unwrap().unwrap().to_protocol();
        assert_eq!(fault.code, SoapVersion::Soap12.must_understand_fault_code());
        assert!(fault.reason.contains("{urn:tx}Transaction"));
    }

    #[test]
    fn test_understood_and_untargeted_headers_pass() {
        let hits = Arc::new(AtomicUsize::new(0));
        let tx = QName::new("urn:tx", "Transaction");
        let head = server(BindingKind::Soap11, vec![tx.clone()], &hits);
        let known = Header::text(tx, "42").with_must_understand(SoapVersion::Soap11);
        Fiber::new(Arc::clone(&head))
            .run(request(SoapVersion::Soap11, known))
            .unwrap();

        let elsewhere = Header::text(QName::new("urn:other", "Hop"), "x")
            .with_must_understand(SoapVersion::Soap11)
            .with_role(SoapVersion::Soap11, "urn:some-other-node");
        Fiber::new(head)
            .run(request(SoapVersion::Soap11, elsewhere))
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    /// Answers with a message carrying a `mustUnderstand` header nothing
    /// processes; a fault reply when `fault` is set.
    struct Reply {
        fault: bool,
    }

    impl Tube for Reply {
        fn name(&self) -> &'static str {
            "reply"
        }
        fn process_request(&mut self, packet: Packet) -> NextAction {
            let mut message = if self.fault {
                Message::create_fault(&ProtocolFault::server(SoapVersion::Soap11, "boom"))
            } else {
                Message::empty(SoapVersion::Soap11)
            };
            message.headers_mut().add(
                Header::text(QName::new("urn:tx", "Ack"), "1").with_must_understand(SoapVersion::Soap11),
            );
            NextAction::Return(packet.create_response(Some(message)))
        }
        fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
            tube_ref(Reply { fault: self.fault })
        }
    }

    fn client(fault: bool) -> TubeRef {
        tube_ref(MustUnderstandTube::new(
            Side::Client,
            Arc::new(WsBinding::new(BindingKind::Soap11)),
            Vec::new(),
            tube_ref(Reply { fault }),
        ))
    }

    #[test]
    fn test_client_response_check_raises() {
        let err = Fiber::new(client(false))
            .run(Packet::new(Message::empty(SoapVersion::Soap11)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(ref f) if f.code.local == "MustUnderstand"));
    }

    #[test]
    fn test_client_fault_response_is_not_checked() {
        let mut response = Fiber::new(client(true))
            .run(Packet::new(Message::empty(SoapVersion::Soap11)))
            .unwrap();
        assert!(response.is_fault());
    }
}
