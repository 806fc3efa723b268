use super::fault_response;
use crate::binding::SoapVersion;
use crate::config::WsSecurityConfig;
use crate::error::{violations_detail, violations_reason};
use crate::fault::ProtocolFault;
use crate::handler::Side;
use crate::packet::Packet;
use crate::property::PropertySet;
use crate::tube::{tube_ref, NextAction, Tube, TubeCloner, TubeRef};
use crate::validator::{security_header, SecurityValidator};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// WS-Security stage.
///
/// The client stamps each request with a `wsse:Security` header. The server
/// validates the header and answers violations with a client fault listing
/// them in its detail.
pub struct SecurityTube {
    side: Side,
    version: Option<SoapVersion>,
    validator: Arc<SecurityValidator>,
    next: TubeRef,
}

impl SecurityTube {
    pub fn new(side: Side, version: Option<SoapVersion>, config: WsSecurityConfig, next: TubeRef) -> Self {
        Self {
            side,
            version,
            validator: Arc::new(SecurityValidator::new(config)),
            next,
        }
    }

    fn client_request(&self, mut packet: Packet) -> NextAction {
        if let Some(message) = packet.message_mut() {
            let header = security_header(self.validator.config(), Utc::now());
            message.headers_mut().add_or_replace(header);
            debug!("Added WS-Security header");
        }
        NextAction::invoke(&self.next, packet)
    }

    fn server_request(&self, mut packet: Packet) -> NextAction {
        let Some(message) = packet.message() else {
            return NextAction::invoke(&self.next, packet);
        };
        let result = self.validator.validate(message.headers());

        if result.has_violations() {
            warn!(
                violation_count = result.violations.len(),
                "WS-Security violations detected"
            );
            for v in &result.violations {
                debug!(code = %v.code.as_str(), message = %v.message, "Violation");
            }
            let version = self.version.unwrap_or(SoapVersion::Soap11);
            let fault = ProtocolFault::client(version, violations_reason(&result.violations))
                .with_detail(violations_detail(&result.violations));
            return NextAction::Return(fault_response(&packet, self.version, fault));
        }

        if let (Some(property), Some(identity)) =
            (&self.validator.config().identity_property, result.identity)
        {
            debug!(property = %property, identity = %identity, "Authenticated identity");
            if let Err(e) = packet.put(property, Value::String(identity)) {
                return NextAction::throw(e);
            }
        }
        NextAction::invoke(&self.next, packet)
    }
}

impl Tube for SecurityTube {
    fn name(&self) -> &'static str {
        "security"
    }

    fn process_request(&mut self, packet: Packet) -> NextAction {
        match self.side {
            Side::Client => self.client_request(packet),
            Side::Server => self.server_request(packet),
        }
    }

    fn copy(&self, cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(SecurityTube {
            side: self.side,
            version: self.version,
            validator: Arc::clone(&self.validator),
            next: cloner.copy(&self.next),
        })
    }

    fn next(&self) -> Option<TubeRef> {
        Some(Arc::clone(&self.next))
    }
}
