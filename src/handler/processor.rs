use super::context::{Direction, LogicalMessageContext, SoapMessageContext};
use super::{HandlerEntry, HandlerError, Side};
use crate::binding::SoapVersion;
use crate::fault::{ProtocolFault, SoapFault};
use crate::message::Message;
use crate::packet::Packet;
use std::collections::HashSet;
use tracing::debug;

/// Runs one category of handlers for a single exchange.
///
/// Tracks the highest handler index reached on the request leg so that
/// response processing and closing cover exactly the handlers that were
/// invoked. A processor is created per request and closed at most once.
pub struct HandlerProcessor {
    handlers: Vec<HandlerEntry>,
    roles: HashSet<String>,
    side: Side,
    version: Option<SoapVersion>,
    index: Option<usize>,
    remedy_action_taken: bool,
    closed: bool,
}

impl HandlerProcessor {
    pub fn new(
        handlers: Vec<HandlerEntry>,
        roles: HashSet<String>,
        side: Side,
        version: Option<SoapVersion>,
    ) -> Self {
        Self {
            handlers,
            roles,
            side,
            version,
            index: None,
            remedy_action_taken: false,
            closed: false,
        }
    }

    /// Highest handler index invoked so far.
    pub fn last_index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_remedy_action_taken(&self) -> bool {
        self.remedy_action_taken
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn request_direction(&self) -> Direction {
        match self.side {
            Side::Client => Direction::Outbound,
            Side::Server => Direction::Inbound,
        }
    }

    fn handle_message(
        &self,
        i: usize,
        packet: &mut Packet,
        direction: Direction,
    ) -> Result<bool, HandlerError> {
        match &self.handlers[i] {
            HandlerEntry::Logical(h) => {
                h.handle_message(&mut LogicalMessageContext::new(packet, direction))
            }
            HandlerEntry::Soap(h) => {
                h.handle_message(&mut SoapMessageContext::new(packet, direction, &self.roles))
            }
        }
    }

    fn handle_fault(
        &self,
        i: usize,
        packet: &mut Packet,
        direction: Direction,
    ) -> Result<bool, HandlerError> {
        match &self.handlers[i] {
            HandlerEntry::Logical(h) => {
                h.handle_fault(&mut LogicalMessageContext::new(packet, direction))
            }
            HandlerEntry::Soap(h) => {
                h.handle_fault(&mut SoapMessageContext::new(packet, direction, &self.roles))
            }
        }
    }

    fn insert_fault(&self, packet: &mut Packet, fault: ProtocolFault) {
        let message = match self.version {
            Some(version) => Message::create_fault(&fault.for_version(version)),
            // plain XML bindings carry the fault element as a bare payload
            None => Message::from_element(None, SoapFault::from_protocol(&fault).to_element()),
        };
        packet.set_message(Some(message));
    }

    /// Call `handle_fault` on handlers `from` down to 0. Stops at the first
    /// handler returning `false`.
    fn reverse_fault(
        &self,
        from: usize,
        packet: &mut Packet,
        direction: Direction,
    ) -> Result<(), HandlerError> {
        for i in (0..from).rev() {
            if !self.handle_fault(i, packet, direction)? {
                break;
            }
        }
        Ok(())
    }

    /// Request leg. `Ok(true)` means the message should continue down the
    /// chain; `Ok(false)` means a handler took remedy action and the packet
    /// now holds whatever goes back (nothing, for one-way exchanges).
    pub fn call_handlers_request(
        &mut self,
        packet: &mut Packet,
        one_way: bool,
    ) -> Result<bool, HandlerError> {
        self.index = None;
        self.remedy_action_taken = false;
        self.closed = false;

        let direction = self.request_direction();
        for i in 0..self.handlers.len() {
            self.index = Some(i);
            match self.handle_message(i, packet, direction) {
                Ok(true) => {}
                Ok(false) => {
                    self.remedy_action_taken = true;
                    debug!(handler = i, one_way, "Handler stopped request processing");
                    if !one_way {
                        for j in (0..i).rev() {
                            if !self.handle_message(j, packet, direction.reverse())? {
                                break;
                            }
                        }
                    }
                    return Ok(false);
                }
                Err(HandlerError::Protocol(fault)) if !one_way => {
                    self.remedy_action_taken = true;
                    debug!(handler = i, code = %fault.code, "Handler raised a protocol fault");
                    self.insert_fault(packet, fault);
                    self.reverse_fault(i, packet, direction.reverse())?;
                    return Ok(false);
                }
                Err(e) => {
                    self.remedy_action_taken = true;
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Response leg, from the last invoked handler down to the first.
    /// Skipped entirely when remedy action was taken on the request leg.
    pub fn call_handlers_response(
        &mut self,
        packet: &mut Packet,
        is_fault: bool,
    ) -> Result<bool, HandlerError> {
        if self.remedy_action_taken {
            return Ok(true);
        }
        let Some(top) = self.index else {
            return Ok(true);
        };
        let direction = self.request_direction().reverse();

        for i in (0..=top).rev() {
            let result = if is_fault {
                self.handle_fault(i, packet, direction)
            } else {
                self.handle_message(i, packet, direction)
            };
            match result {
                Ok(true) => {}
                Ok(false) => return Ok(false),
                Err(HandlerError::Protocol(fault)) if !is_fault => {
                    self.insert_fault(packet, fault);
                    self.reverse_fault(i, packet, direction)?;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Close handlers `[0..=last_index]` in reverse order. Idempotent.
    pub fn close_handlers(&mut self, packet: &mut Packet) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(top) = self.index else {
            return;
        };
        let direction = self.request_direction().reverse();
        for i in (0..=top).rev() {
            match &self.handlers[i] {
                HandlerEntry::Logical(h) => {
                    h.close(&mut LogicalMessageContext::new(packet, direction))
                }
                HandlerEntry::Soap(h) => {
                    h.close(&mut SoapMessageContext::new(packet, direction, &self.roles))
                }
            }
        }
        debug!(closed = top + 1, "Handlers closed");
    }
}
