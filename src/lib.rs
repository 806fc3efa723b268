//! SOAP message processing runtime for Zentinel
//!
//! Routes SOAP 1.1/1.2 and plain XML messages through composable, cloneable
//! chains of processing stages ("tubes"), dispatches requests to service
//! operations and turns failures into version-correct SOAP faults.
//!
//! # Features
//!
//! - Bidirectional tube pipelines with per-request cloning and pooling
//! - Logical and SOAP handler chains with remedy actions and ordered close
//! - Payload-qname and SOAPAction dispatch
//! - SOAP 1.1/1.2 fault model with subcode chains
//! - WS-Addressing, must-understand and WS-Security stages
//! - XXE (XML External Entity) pre-scan on decode
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_runtime::{
//!     AssemblyConfig, BindingKind, ClientCall, Endpoint, LocalTransport, Operation,
//!     ServerAdapter, ServiceClient, WsBinding,
//! };
//!
//! let endpoint = Endpoint::builder(WsBinding::new(BindingKind::Soap11))
//!     .operation(Operation::new("echo", |input| Ok(input)).with_request(echo_qname))
//!     .build()?;
//! let config = AssemblyConfig::default();
//! let adapter = Arc::new(ServerAdapter::new(endpoint, &config));
//! let client = ServiceClient::new(
//!     Arc::new(WsBinding::new(BindingKind::Soap11)),
//!     Arc::new(LocalTransport::new(adapter)),
//!     &config,
//! );
//! let reply = client.invoke(&ClientCall::new(), Some(payload))?;
//! ```

pub mod assembler;
pub mod binding;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod fault;
pub mod handler;
pub mod infoset;
pub mod message;
pub mod packet;
pub mod parser;
pub mod property;
pub mod tube;
pub mod tubes;
pub mod validator;

pub use assembler::{AssemblyConfig, TubeAssembler};
pub use binding::{BindingKind, SoapVersion, WsBinding};
pub use client::{ClientCall, ClientError, ServiceClient};
pub use codec::Codec;
pub use config::RuntimeConfig;
pub use dispatch::{DispatchError, OperationDispatcher};
pub use endpoint::{Endpoint, Operation, ServerAdapter, ServiceError};
pub use error::{Result, RuntimeError, ViolationCode};
pub use fault::{ProtocolFault, SoapFault};
pub use handler::{HandlerEntry, HandlerError, LogicalHandler, SoapHandler};
pub use infoset::{Element, QName};
pub use message::{Header, Message};
pub use packet::Packet;
pub use tube::{Pipeline, Tube, TubePool};
pub use tubes::{LocalTransport, Transport, WireMessage};
