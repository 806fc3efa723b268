//! User-pluggable handlers and their invocation along the pipeline.
//!
//! Handlers come in two categories: logical handlers see only the payload,
//! SOAP handlers see the whole message including headers. A binding carries
//! one ordered chain; [`HandlerConfiguration`] partitions it once and the
//! two sub-chains run in separate, paired tubes.

mod context;
mod processor;
mod tube;

pub use context::{Direction, LogicalMessageContext, SoapMessageContext};
pub use processor::HandlerProcessor;
pub use tube::{HandlerExchange, HandlerKind, HandlerTube};

use crate::binding::SoapVersion;
use crate::error::RuntimeError;
use crate::fault::ProtocolFault;
use crate::infoset::QName;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Which end of the exchange a stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// Errors raised by handler code.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The handler wants a fault sent back instead of the message.
    #[error(transparent)]
    Protocol(ProtocolFault),

    /// A web-service level failure, surfaced to the caller as-is.
    #[error("Web service error: {0}")]
    WebService(String),

    /// Any other failure inside handler code.
    #[error("Handler failure: {0}")]
    Failed(String),

    /// A runtime error hit while the handler was working on the message.
    #[error("Handler failure: {0}")]
    Runtime(#[source] Arc<RuntimeError>),
}

impl From<ProtocolFault> for HandlerError {
    fn from(fault: ProtocolFault) -> Self {
        Self::Protocol(fault)
    }
}

impl From<RuntimeError> for HandlerError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Protocol(fault) => Self::Protocol(fault),
            RuntimeError::Handler(inner) => inner,
            other => Self::Runtime(Arc::new(other)),
        }
    }
}

/// A handler that only sees message payloads.
pub trait LogicalHandler: Send + Sync {
    fn handle_message(&self, ctx: &mut LogicalMessageContext<'_>) -> Result<bool, HandlerError>;

    fn handle_fault(&self, _ctx: &mut LogicalMessageContext<'_>) -> Result<bool, HandlerError> {
        Ok(true)
    }

    fn close(&self, _ctx: &mut LogicalMessageContext<'_>) {}
}

/// A handler with access to the full SOAP message.
pub trait SoapHandler: Send + Sync {
    /// Header blocks this handler processes; they count as understood.
    fn headers(&self) -> Vec<QName> {
        Vec::new()
    }

    fn handle_message(&self, ctx: &mut SoapMessageContext<'_>) -> Result<bool, HandlerError>;

    fn handle_fault(&self, _ctx: &mut SoapMessageContext<'_>) -> Result<bool, HandlerError> {
        Ok(true)
    }

    fn close(&self, _ctx: &mut SoapMessageContext<'_>) {}
}

/// One entry of a handler chain.
#[derive(Clone)]
pub enum HandlerEntry {
    Logical(Arc<dyn LogicalHandler>),
    Soap(Arc<dyn SoapHandler>),
}

impl HandlerEntry {
    pub fn logical(handler: impl LogicalHandler + 'static) -> Self {
        Self::Logical(Arc::new(handler))
    }

    pub fn soap(handler: impl SoapHandler + 'static) -> Self {
        Self::Soap(Arc::new(handler))
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, Self::Logical(_))
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logical(_) => f.write_str("HandlerEntry::Logical"),
            Self::Soap(_) => f.write_str("HandlerEntry::Soap"),
        }
    }
}

/// Immutable handler configuration of a binding.
///
/// Built once from the full chain; a change produces a new configuration.
#[derive(Debug, Clone)]
pub struct HandlerConfiguration {
    chain: Vec<HandlerEntry>,
    logical: Vec<HandlerEntry>,
    soap: Vec<HandlerEntry>,
    configured_roles: HashSet<String>,
    roles: HashSet<String>,
    understood: HashSet<QName>,
}

impl HandlerConfiguration {
    pub fn new(
        version: Option<SoapVersion>,
        chain: Vec<HandlerEntry>,
        configured_roles: HashSet<String>,
    ) -> Self {
        let (logical, soap): (Vec<_>, Vec<_>) =
            chain.iter().cloned().partition(HandlerEntry::is_logical);

        let understood = soap
            .iter()
            .filter_map(|h| match h {
                HandlerEntry::Soap(s) => Some(s.headers()),
                HandlerEntry::Logical(_) => None,
            })
            .flatten()
            .collect();

        let mut roles = configured_roles.clone();
        if let Some(v) = version {
            roles.extend(v.implicit_roles().into_iter().map(str::to_string));
        }

        Self {
            chain,
            logical,
            soap,
            configured_roles,
            roles,
            understood,
        }
    }

    /// The full chain, in configured order.
    pub fn handler_chain(&self) -> &[HandlerEntry] {
        &self.chain
    }

    pub fn logical_handlers(&self) -> &[HandlerEntry] {
        &self.logical
    }

    pub fn soap_handlers(&self) -> &[HandlerEntry] {
        &self.soap
    }

    /// Handlers of one category.
    pub fn handlers(&self, kind: HandlerKind) -> &[HandlerEntry] {
        match kind {
            HandlerKind::Logical => &self.logical,
            HandlerKind::Soap => &self.soap,
        }
    }

    /// Roles set by the user.
    pub fn configured_roles(&self) -> &HashSet<String> {
        &self.configured_roles
    }

    /// Roles in effect, including the version's implicit ones.
    pub fn roles(&self) -> &HashSet<String> {
        &self.roles
    }

    /// Headers declared by SOAP handlers.
    pub fn understood_headers(&self) -> &HashSet<QName> {
        &self.understood
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}
