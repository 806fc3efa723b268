use super::processor::HandlerProcessor;
use super::Side;
use crate::binding::{BindingKind, WsBinding};
use crate::error::RuntimeError;
use crate::packet::Packet;
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Handler category served by a [`HandlerTube`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Logical,
    Soap,
}

impl HandlerKind {
    fn cousin(self) -> Self {
        match self {
            Self::Logical => Self::Soap,
            Self::Soap => Self::Logical,
        }
    }
}

#[derive(Default)]
struct LegState {
    processor: Option<HandlerProcessor>,
    request_processing_successful: bool,
}

/// State shared by the two handler tubes of one chain.
#[derive(Default)]
pub struct HandlerExchange {
    logical: LegState,
    soap: LegState,
}

impl HandlerExchange {
    fn leg_mut(&mut self, kind: HandlerKind) -> &mut LegState {
        match kind {
            HandlerKind::Logical => &mut self.logical,
            HandlerKind::Soap => &mut self.soap,
        }
    }

    fn leg(&self, kind: HandlerKind) -> &LegState {
        match kind {
            HandlerKind::Logical => &self.logical,
            HandlerKind::Soap => &self.soap,
        }
    }

    /// Whether the request leg of `kind` let the message through.
    pub fn request_processing_successful(&self, kind: HandlerKind) -> bool {
        self.leg(kind).request_processing_successful
    }

    /// Highest handler index invoked in `kind` for the current exchange.
    pub fn last_index(&self, kind: HandlerKind) -> Option<usize> {
        self.leg(kind).processor.as_ref().and_then(HandlerProcessor::last_index)
    }
}

/// Runs one handler category of the binding's chain.
///
/// Logical and SOAP handlers live in two adjacent tubes ("cousins"). The
/// outer tube of the pair (logical on the client, SOAP on the server) is
/// responsible for closing both once the exchange is over.
pub struct HandlerTube {
    kind: HandlerKind,
    side: Side,
    binding: Arc<WsBinding>,
    next: TubeRef,
    exchange: Arc<Mutex<HandlerExchange>>,
    has_cousin: bool,
}

impl HandlerTube {
    /// Build the handler tubes for `binding` in front of `next`.
    pub fn pair(side: Side, binding: Arc<WsBinding>, next: TubeRef) -> TubeRef {
        let exchange = Arc::new(Mutex::new(HandlerExchange::default()));
        if binding.kind() == BindingKind::XmlHttp {
            return tube_ref(Self {
                kind: HandlerKind::Logical,
                side,
                binding,
                next,
                exchange,
                has_cousin: false,
            });
        }
        let (outer, inner) = match side {
            Side::Client => (HandlerKind::Logical, HandlerKind::Soap),
            Side::Server => (HandlerKind::Soap, HandlerKind::Logical),
        };
        let inner = tube_ref(Self {
            kind: inner,
            side,
            binding: Arc::clone(&binding),
            next,
            exchange: Arc::clone(&exchange),
            has_cousin: true,
        });
        tube_ref(Self {
            kind: outer,
            side,
            binding,
            next: inner,
            exchange,
            has_cousin: true,
        })
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    /// Shared state of this tube and its cousin.
    pub fn exchange(&self) -> Arc<Mutex<HandlerExchange>> {
        Arc::clone(&self.exchange)
    }

    fn is_outer(&self) -> bool {
        matches!(
            (self.side, self.kind),
            (Side::Client, HandlerKind::Logical) | (Side::Server, HandlerKind::Soap)
        )
    }

    fn initiates_close(&self) -> bool {
        !self.has_cousin || self.is_outer()
    }

    /// Close the cousin (if this tube let the request through) and then
    /// this tube's own handlers.
    fn close(&self, packet: &mut Packet) {
        let mut exchange = self.exchange.lock();
        let own_ok = exchange.leg(self.kind).request_processing_successful;
        if self.has_cousin && own_ok {
            if let Some(cousin) = exchange.leg_mut(self.kind.cousin()).processor.as_mut() {
                cousin.close_handlers(packet);
            }
        }
        if let Some(own) = exchange.leg_mut(self.kind).processor.as_mut() {
            own.close_handlers(packet);
        }
    }

    /// Turn around at this tube, closing first when this tube owns closing.
    fn turn_around(&self, mut packet: Packet) -> NextAction {
        if self.initiates_close() {
            self.close(&mut packet);
        }
        NextAction::Return(packet)
    }
}

impl Tube for HandlerTube {
    fn name(&self) -> &'static str {
        match self.kind {
            HandlerKind::Logical => "logical-handlers",
            HandlerKind::Soap => "soap-handlers",
        }
    }

    fn process_request(&mut self, mut packet: Packet) -> NextAction {
        {
            let mut exchange = self.exchange.lock();
            if self.initiates_close() {
                *exchange = HandlerExchange::default();
            } else {
                *exchange.leg_mut(self.kind) = LegState::default();
            }
        }

        let config = self.binding.handler_config();
        let handlers = config.handlers(self.kind).to_vec();
        if handlers.is_empty() {
            self.exchange.lock().leg_mut(self.kind).request_processing_successful = true;
            return NextAction::invoke(&self.next, packet);
        }

        let one_way = packet.is_one_way();
        let mut processor = HandlerProcessor::new(
            handlers,
            config.roles().clone(),
            self.side,
            self.binding.soap_version(),
        );
        let result = processor.call_handlers_request(&mut packet, one_way);
        {
            let mut exchange = self.exchange.lock();
            let leg = exchange.leg_mut(self.kind);
            leg.processor = Some(processor);
            leg.request_processing_successful = matches!(result, Ok(true));
        }

        match result {
            Ok(true) => NextAction::invoke(&self.next, packet),
            Ok(false) => {
                debug!(tube = self.name(), one_way, "Handler remedy action, turning around");
                if one_way {
                    packet.set_message(None);
                }
                self.turn_around(packet)
            }
            Err(e) => {
                if self.initiates_close() {
                    self.close(&mut packet);
                }
                NextAction::throw(RuntimeError::Handler(e))
            }
        }
    }

    fn process_response(&mut self, mut packet: Packet) -> NextAction {
        let processor = self.exchange.lock().leg_mut(self.kind).processor.take();
        if let Some(mut processor) = processor {
            let result = if packet.has_message() {
                let is_fault = packet.is_fault();
                processor.call_handlers_response(&mut packet, is_fault)
            } else {
                Ok(true)
            };
            self.exchange.lock().leg_mut(self.kind).processor = Some(processor);
            if let Err(e) = result {
                if self.initiates_close() {
                    self.close(&mut packet);
                }
                return NextAction::throw(RuntimeError::Handler(e));
            }
        }
        self.turn_around(packet)
    }

    fn process_exception(&mut self, error: RuntimeError) -> NextAction {
        if self.initiates_close() {
            self.close(&mut Packet::empty());
        }
        NextAction::Throw(error)
    }

    fn pre_destroy(&mut self) {
        if self.initiates_close() {
            self.close(&mut Packet::empty());
        }
    }

    fn copy(&self, cloner: &mut TubeCloner) -> TubeRef {
        let exchange = cloner.copy_state(&self.exchange, HandlerExchange::default);
        tube_ref(HandlerTube {
            kind: self.kind,
            side: self.side,
            binding: Arc::clone(&self.binding),
            next: cloner.copy(&self.next),
            exchange,
            has_cousin: self.has_cousin,
        })
    }

    fn next(&self) -> Option<TubeRef> {
        Some(Arc::clone(&self.next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::SoapVersion;
    use crate::handler::{
        HandlerEntry, HandlerError, LogicalHandler, LogicalMessageContext, SoapHandler,
        SoapMessageContext,
    };
    use crate::message::Message;
    use crate::tube::{Fiber, Pipeline};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Echo;

    impl Tube for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn process_request(&mut self, packet: Packet) -> NextAction {
            NextAction::Return(packet)
        }
        fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
            tube_ref(Echo)
        }
    }

    struct Logical(&'static str, bool, Log);

    impl LogicalHandler for Logical {
        fn handle_message(&self, _ctx: &mut LogicalMessageContext<'_>) -> Result<bool, HandlerError> {
            self.2.lock().push(format!("{}:msg", self.0));
            Ok(self.1)
        }
        fn close(&self, _ctx: &mut LogicalMessageContext<'_>) {
            self.2.lock().push(format!("{}:close", self.0));
        }
    }

    struct Soap(&'static str, Log);

    impl SoapHandler for Soap {
        fn handle_message(&self, _ctx: &mut SoapMessageContext<'_>) -> Result<bool, HandlerError> {
            self.1.lock().push(format!("{}:msg", self.0));
            Ok(true)
        }
        fn close(&self, _ctx: &mut SoapMessageContext<'_>) {
            self.1.lock().push(format!("{}:close", self.0));
        }
    }

    struct Down;

    impl Tube for Down {
        fn name(&self) -> &'static str {
            "down"
        }
        fn process_request(&mut self, _packet: Packet) -> NextAction {
            NextAction::throw(RuntimeError::Transport("down".to_string()))
        }
        fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
            tube_ref(Down)
        }
    }

    fn binding(log: &Log, logical_passes: bool) -> Arc<WsBinding> {
        let binding = WsBinding::new(BindingKind::Soap11);
        binding
            .set_handler_chain(vec![
                HandlerEntry::logical(Logical("L", logical_passes, Arc::clone(log))),
                HandlerEntry::soap(Soap("S", Arc::clone(log))),
            ])
            .unwrap();
        Arc::new(binding)
    }

    fn packet() -> Packet {
        Packet::new(Message::empty(SoapVersion::Soap11))
    }

    #[test]
    fn test_client_pair_closes_cousin_first() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let head = HandlerTube::pair(Side::Client, binding(&log, true), tube_ref(Echo));
        Fiber::new(head).run(packet()).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["L:msg", "S:msg", "S:msg", "L:msg", "S:close", "L:close"]
        );
    }

    #[test]
    fn test_server_pair_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let head = HandlerTube::pair(Side::Server, binding(&log, true), tube_ref(Echo));
        Fiber::new(head).run(packet()).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["S:msg", "L:msg", "L:msg", "S:msg", "L:close", "S:close"]
        );
    }

    #[test]
    fn test_outer_remedy_never_reaches_cousin() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let head = HandlerTube::pair(Side::Client, binding(&log, false), tube_ref(Echo));
        Fiber::new(head).run(packet()).unwrap();
        assert_eq!(*log.lock(), vec!["L:msg", "L:close"]);
    }

    #[test]
    fn test_copies_get_fresh_shared_exchange() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let head = HandlerTube::pair(Side::Client, binding(&log, true), tube_ref(Echo));
        let copy = TubeCloner::clone_chain(&head);

        let original_inner = head.lock().next().unwrap();
        let copied_inner = copy.lock().next().unwrap();
        assert!(!Arc::ptr_eq(&original_inner, &copied_inner));

        Fiber::new(copy).run(packet()).unwrap();
        Fiber::new(head).run(packet()).unwrap();
        // both chains close their own cousins
        let log = log.lock();
        assert_eq!(log.iter().filter(|e| e.ends_with(":close")).count(), 4);
    }

    #[test]
    fn test_downstream_failure_closes_each_handler_once() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let binding = WsBinding::new(BindingKind::Soap11);
        binding
            .set_handler_chain(vec![
                HandlerEntry::logical(Logical("L0", true, Arc::clone(&log))),
                HandlerEntry::logical(Logical("L1", true, Arc::clone(&log))),
                HandlerEntry::soap(Soap("S0", Arc::clone(&log))),
            ])
            .unwrap();
        let head = HandlerTube::pair(Side::Client, Arc::new(binding), tube_ref(Down));
        let pipeline = Pipeline::new(Arc::clone(&head));

        let err = pipeline.process(packet()).unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(ref m) if m == "down"));
        pipeline.close();

        let expected = vec!["L0:msg", "L1:msg", "S0:msg", "S0:close", "L1:close", "L0:close"];
        assert_eq!(*log.lock(), expected);

        // same chain run in place, then destroyed: the close does not repeat
        log.lock().clear();
        let copy = TubeCloner::clone_chain(&head);
        assert!(Fiber::new(Arc::clone(&copy)).run(packet()).is_err());
        copy.lock().pre_destroy();
        assert_eq!(*log.lock(), expected);
    }
}
