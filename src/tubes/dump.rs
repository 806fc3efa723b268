use crate::handler::Side;
use crate::packet::Packet;
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use std::sync::Arc;
use tracing::{info, warn};

/// Logs every envelope passing through, in both directions.
///
/// Works on a copy of the message so the original payload stays readable
/// for the stages behind it.
pub struct DumpTube {
    side: Side,
    next: TubeRef,
}

impl DumpTube {
    pub fn new(side: Side, next: TubeRef) -> Self {
        Self { side, next }
    }

    fn dump(&self, packet: &mut Packet, leg: &'static str) {
        let side = match self.side {
            Side::Client => "client",
            Side::Server => "server",
        };
        let Some(message) = packet.message_mut() else {
            info!(side, leg, "No message");
            return;
        };
        match message.copy().and_then(|mut copy| copy.to_envelope_string()) {
            Ok(envelope) => info!(
                side,
                leg,
                soap_action = ?packet.soap_action(),
                envelope = %envelope,
                "Message dump"
            ),
            Err(e) => warn!(side, leg, error = %e, "Failed to dump message"),
        }
    }
}

impl Tube for DumpTube {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn process_request(&mut self, mut packet: Packet) -> NextAction {
        self.dump(&mut packet, "request");
        NextAction::invoke(&self.next, packet)
    }

    fn process_response(&mut self, mut packet: Packet) -> NextAction {
        self.dump(&mut packet, "response");
        NextAction::Return(packet)
    }

    fn copy(&self, cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(DumpTube {
            side: self.side,
            next: cloner.copy(&self.next),
        })
    }

    fn next(&self) -> Option<TubeRef> {
        Some(Arc::clone(&self.next))
    }
}
