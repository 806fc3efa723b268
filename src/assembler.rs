//! Builds client and server tube chains for a binding.
//!
//! Assembly is a closed dispatch over [`BindingKind`]: SOAP bindings get the
//! full set of header-processing stages, XML/HTTP bindings only handlers,
//! dump and the terminal stage. Chains are built tail first.

use crate::binding::{BindingKind, WsBinding};
use crate::codec::{codec_for, Codec};
use crate::config::WsSecurityConfig;
use crate::endpoint::Endpoint;
use crate::handler::{HandlerTube, Side};
use crate::infoset::QName;
use crate::tube::{tube_ref, TubeRef};
use crate::tubes::{
    AddressingTube, DumpTube, InvokerTube, MustUnderstandTube, SecurityTube, Transport,
    TransportTube,
};
use crate::validator::security_header_name;
use std::sync::Arc;
use tracing::debug;

/// Flags that shape assembly, passed explicitly rather than read from the
/// environment.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Insert dump stages
    pub dump: bool,
    /// Largest request the server adapter accepts (bytes)
    pub max_body_size: usize,
    /// Server rejects requests without `wsa:Action`
    pub require_addressing: bool,
    pub ws_security: WsSecurityConfig,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            dump: false,
            max_body_size: 1_048_576,
            require_addressing: false,
            ws_security: WsSecurityConfig::default(),
        }
    }
}

/// Headers processed by the stages enabled for `binding`.
fn stage_headers(binding: &WsBinding, config: &AssemblyConfig) -> Vec<QName> {
    let mut headers = Vec::new();
    if binding.is_addressing_enabled() {
        headers.extend(AddressingTube::understood_headers());
    }
    if config.ws_security.enabled {
        headers.push(security_header_name());
    }
    headers
}

/// Factory for client-side stages.
pub struct ClientAssemblerContext {
    binding: Arc<WsBinding>,
    config: AssemblyConfig,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
}

impl ClientAssemblerContext {
    pub fn new(binding: Arc<WsBinding>, config: AssemblyConfig, transport: Arc<dyn Transport>) -> Self {
        let codec = codec_for(binding.kind());
        Self {
            binding,
            config,
            transport,
            codec,
        }
    }

    pub fn binding(&self) -> &Arc<WsBinding> {
        &self.binding
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    pub fn create_transport_tube(&self) -> TubeRef {
        tube_ref(TransportTube::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.codec),
        ))
    }

    pub fn create_security_tube(&self, next: TubeRef) -> TubeRef {
        if !self.config.ws_security.enabled {
            return next;
        }
        tube_ref(SecurityTube::new(
            Side::Client,
            self.binding.soap_version(),
            self.config.ws_security.clone(),
            next,
        ))
    }

    pub fn create_dump_tube(&self, next: TubeRef) -> TubeRef {
        if !self.config.dump {
            return next;
        }
        tube_ref(DumpTube::new(Side::Client, next))
    }

    pub fn create_addressing_tube(&self, next: TubeRef) -> TubeRef {
        match self.binding.soap_version() {
            Some(version) if self.binding.is_addressing_enabled() => {
                tube_ref(AddressingTube::new(Side::Client, version, false, next))
            }
            _ => next,
        }
    }

    pub fn create_must_understand_tube(&self, next: TubeRef) -> TubeRef {
        tube_ref(MustUnderstandTube::new(
            Side::Client,
            Arc::clone(&self.binding),
            stage_headers(&self.binding, &self.config),
            next,
        ))
    }

    /// Handler stages. Always inserted: the chain is read per message and
    /// may be swapped on the binding after assembly.
    pub fn create_handler_tube(&self, next: TubeRef) -> TubeRef {
        HandlerTube::pair(Side::Client, Arc::clone(&self.binding), next)
    }
}

/// Factory for server-side stages.
pub struct ServerAssemblerContext {
    binding: Arc<WsBinding>,
    config: AssemblyConfig,
    endpoint: Arc<Endpoint>,
}

impl ServerAssemblerContext {
    pub fn new(binding: Arc<WsBinding>, config: AssemblyConfig, endpoint: Arc<Endpoint>) -> Self {
        Self {
            binding,
            config,
            endpoint,
        }
    }

    pub fn binding(&self) -> &Arc<WsBinding> {
        &self.binding
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    pub fn create_invoker_tube(&self) -> TubeRef {
        tube_ref(InvokerTube::new(Arc::clone(&self.endpoint)))
    }

    pub fn create_handler_tube(&self, next: TubeRef) -> TubeRef {
        HandlerTube::pair(Side::Server, Arc::clone(&self.binding), next)
    }

    pub fn create_must_understand_tube(&self, next: TubeRef) -> TubeRef {
        tube_ref(MustUnderstandTube::new(
            Side::Server,
            Arc::clone(&self.binding),
            stage_headers(&self.binding, &self.config),
            next,
        ))
    }

    pub fn create_addressing_tube(&self, next: TubeRef) -> TubeRef {
        match self.binding.soap_version() {
            Some(version) if self.binding.is_addressing_enabled() => tube_ref(AddressingTube::new(
                Side::Server,
                version,
                self.config.require_addressing,
                next,
            )),
            _ => next,
        }
    }

    pub fn create_security_tube(&self, next: TubeRef) -> TubeRef {
        if !self.config.ws_security.enabled {
            return next;
        }
        tube_ref(SecurityTube::new(
            Side::Server,
            self.binding.soap_version(),
            self.config.ws_security.clone(),
            next,
        ))
    }

    pub fn create_dump_tube(&self, next: TubeRef) -> TubeRef {
        if !self.config.dump {
            return next;
        }
        tube_ref(DumpTube::new(Side::Server, next))
    }
}

/// Chain layout for SOAP 1.1 and 1.2 bindings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoapAssembler;

impl SoapAssembler {
    pub fn create_client(&self, ctx: &ClientAssemblerContext) -> TubeRef {
        let tail = ctx.create_transport_tube();
        let tail = ctx.create_security_tube(tail);
        let tail = ctx.create_dump_tube(tail);
        let tail = ctx.create_addressing_tube(tail);
        let tail = ctx.create_must_understand_tube(tail);
        ctx.create_handler_tube(tail)
    }

    pub fn create_server(&self, ctx: &ServerAssemblerContext) -> TubeRef {
        let tail = ctx.create_invoker_tube();
        let tail = ctx.create_handler_tube(tail);
        let tail = ctx.create_must_understand_tube(tail);
        let tail = ctx.create_addressing_tube(tail);
        let tail = ctx.create_security_tube(tail);
        ctx.create_dump_tube(tail)
    }
}

/// Chain layout for the XML/HTTP binding: no headers, so no header stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlHttpAssembler;

impl XmlHttpAssembler {
    pub fn create_client(&self, ctx: &ClientAssemblerContext) -> TubeRef {
        let tail = ctx.create_transport_tube();
        let tail = ctx.create_dump_tube(tail);
        ctx.create_handler_tube(tail)
    }

    pub fn create_server(&self, ctx: &ServerAssemblerContext) -> TubeRef {
        let tail = ctx.create_invoker_tube();
        let tail = ctx.create_handler_tube(tail);
        ctx.create_dump_tube(tail)
    }
}

/// Assembler selected by binding kind.
#[derive(Debug, Clone, Copy)]
pub enum TubeAssembler {
    Soap(SoapAssembler),
    XmlHttp(XmlHttpAssembler),
}

impl TubeAssembler {
    pub fn for_binding(kind: BindingKind) -> Self {
        match kind {
            BindingKind::Soap11 | BindingKind::Soap12 => Self::Soap(SoapAssembler),
            BindingKind::XmlHttp => Self::XmlHttp(XmlHttpAssembler),
        }
    }

    pub fn create_client(&self, ctx: &ClientAssemblerContext) -> TubeRef {
        debug!(binding = ctx.binding().kind().binding_id(), "Assembling client pipeline");
        match self {
            Self::Soap(a) => a.create_client(ctx),
            Self::XmlHttp(a) => a.create_client(ctx),
        }
    }

    pub fn create_server(&self, ctx: &ServerAssemblerContext) -> TubeRef {
        debug!(binding = ctx.binding().kind().binding_id(), "Assembling server pipeline");
        match self {
            Self::Soap(a) => a.create_server(ctx),
            Self::XmlHttp(a) => a.create_server(ctx),
        }
    }
}
