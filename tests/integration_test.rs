//! Integration tests for the zentinel-soap-runtime crate.
//!
//! These tests exercise the public API surface end-to-end: pipelines and
//! handlers, dispatch, faults, and client calls served in-process.

use crossbeam_channel::{bounded, unbounded};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use zentinel_soap_runtime::assembler::AssemblyConfig;
use zentinel_soap_runtime::binding::{BindingKind, SoapVersion, WsBinding, ADDRESSING_FEATURE};
use zentinel_soap_runtime::client::{ClientCall, ClientError, ServiceClient};
use zentinel_soap_runtime::config::{PasswordType, RuntimeConfig, WsSecurityConfig};
use zentinel_soap_runtime::endpoint::{Endpoint, Operation, ServerAdapter, ServiceError};
use zentinel_soap_runtime::fault::{ProtocolFault, SoapFault};
use zentinel_soap_runtime::handler::{
    HandlerEntry, HandlerError, HandlerTube, LogicalHandler, LogicalMessageContext, Side,
    SoapHandler, SoapMessageContext,
};
use zentinel_soap_runtime::infoset::{Element, QName};
use zentinel_soap_runtime::message::Message;
use zentinel_soap_runtime::packet::Packet;
use zentinel_soap_runtime::parser::parse_soap_envelope;
use zentinel_soap_runtime::property::{
    DistributedPropertySet, MapPropertySet, PropertyError, PropertySet, PropertyValue, Satellite,
};
use zentinel_soap_runtime::tube::{tube_ref, Fiber, NextAction, Pipeline, Tube, TubeCloner, TubeRef};
use zentinel_soap_runtime::tubes::{LocalTransport, WSA_NS};

const NS: &str = "urn:shop";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn shop(local: &str) -> QName {
    QName::new(NS, local)
}

// ============================================================================
// Helpers: an in-process service and its client
// ============================================================================

fn echo() -> Operation {
    Operation::new("echo", |input| Ok(input)).with_request(shop("Echo"))
}

fn serve(endpoint: Endpoint, config: &AssemblyConfig) -> Arc<ServerAdapter> {
    Arc::new(ServerAdapter::new(endpoint, config))
}

fn client_for(binding: WsBinding, adapter: &Arc<ServerAdapter>, config: &AssemblyConfig) -> ServiceClient {
    ServiceClient::new(
        Arc::new(binding),
        Arc::new(LocalTransport::new(Arc::clone(adapter))),
        config,
    )
}

fn expect_fault(result: Result<Option<Element>, ClientError>) -> ProtocolFault {
    match result {
        Err(ClientError::Fault(fault)) => fault,
        other => panic!("expected a fault, got {:?}", other),
    }
}

// ============================================================================
// Pipeline clone independence
// ============================================================================

/// Terminal stage that marks the packet as having reached it.
struct Terminal;

impl Tube for Terminal {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn process_request(&mut self, mut packet: Packet) -> NextAction {
        packet.put("reached", json!(true)).unwrap();
        NextAction::ret(packet)
    }

    fn copy(&self, _cloner: &mut TubeCloner) -> TubeRef {
        tube_ref(Terminal)
    }

    fn shareable(&self) -> bool {
        true
    }
}

/// Halts requests that carry the "halt" property.
struct Gate;

impl LogicalHandler for Gate {
    fn handle_message(&self, ctx: &mut LogicalMessageContext<'_>) -> Result<bool, HandlerError> {
        if ctx.is_outbound() && ctx.property("halt") == Some(json!(true)) {
            return Ok(false);
        }
        Ok(true)
    }
}

/// Counts SOAP handler closes.
struct CloseCounter(Arc<AtomicUsize>);

impl SoapHandler for CloseCounter {
    fn handle_message(&self, _ctx: &mut SoapMessageContext<'_>) -> Result<bool, HandlerError> {
        Ok(true)
    }

    fn close(&self, _ctx: &mut SoapMessageContext<'_>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_pipeline_clones_are_independent_under_concurrency() {
    init_tracing();
    let closes = Arc::new(AtomicUsize::new(0));
    let binding = WsBinding::new(BindingKind::Soap11);
    binding
        .set_handler_chain(vec![
            HandlerEntry::logical(Gate),
            HandlerEntry::soap(CloseCounter(Arc::clone(&closes))),
        ])
        .unwrap();
    let pipeline = Pipeline::new(HandlerTube::pair(
        Side::Client,
        Arc::new(binding),
        tube_ref(Terminal),
    ));

    let halting = pipeline.fork().unwrap();
    let passing = pipeline.fork().unwrap();
    let (tx, rx) = unbounded();
    const ROUNDS: usize = 50;

    let mut workers = Vec::new();
    for (head, halt) in [(halting, true), (passing, false)] {
        let tx = tx.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..ROUNDS {
                let mut packet = Packet::new(Message::from_element(
                    SoapVersion::Soap11,
                    Element::new(shop("Ping")),
                ));
                if halt {
                    packet.put("halt", json!(true)).unwrap();
                }
                let response = Fiber::new(Arc::clone(&head)).run(packet).unwrap();
                tx.send((halt, response.get("reached").is_some())).unwrap();
            }
        }));
    }
    drop(tx);
    for worker in workers {
        worker.join().unwrap();
    }

    let results: Vec<(bool, bool)> = rx.iter().collect();
    assert_eq!(results.len(), 2 * ROUNDS);
    for (halt, reached) in results {
        assert_eq!(reached, !halt, "halted request leaked into the other clone");
    }
    // the SOAP handler only runs, and closes, for requests that passed the gate
    assert_eq!(closes.load(Ordering::SeqCst), ROUNDS);
}

// ============================================================================
// Handler partial close
// ============================================================================

struct Numbered {
    id: usize,
    stop_at: usize,
    log: Arc<Mutex<Vec<String>>>,
}

impl LogicalHandler for Numbered {
    fn handle_message(&self, ctx: &mut LogicalMessageContext<'_>) -> Result<bool, HandlerError> {
        if ctx.is_outbound() {
            self.log.lock().push(format!("h{}:msg", self.id));
        }
        Ok(!(ctx.is_outbound() && self.id == self.stop_at))
    }

    fn close(&self, _ctx: &mut LogicalMessageContext<'_>) {
        self.log.lock().push(format!("h{}:close", self.id));
    }
}

#[test]
fn test_handler_partial_close() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let binding = WsBinding::new(BindingKind::Soap12);
    binding
        .set_handler_chain(
            (0..5)
                .map(|id| {
                    HandlerEntry::logical(Numbered {
                        id,
                        stop_at: 2,
                        log: Arc::clone(&log),
                    })
                })
                .collect(),
        )
        .unwrap();
    let head = HandlerTube::pair(Side::Client, Arc::new(binding), tube_ref(Terminal));

    let response = Fiber::new(head)
        .run(Packet::new(Message::empty(SoapVersion::Soap12)))
        .unwrap();
    assert!(response.get("reached").is_none());

    let log = log.lock();
    let closes: Vec<&str> = log
        .iter()
        .filter(|e| e.ends_with(":close"))
        .map(String::as_str)
        .collect();
    assert_eq!(closes, vec!["h2:close", "h1:close", "h0:close"]);
    assert!(!log.iter().any(|e| e.starts_with("h3") || e.starts_with("h4")));
}

// ============================================================================
// Satellite property precedence
// ============================================================================

#[derive(Clone)]
struct Claims(&'static str);

impl PropertySet for Claims {
    fn supports(&self, key: &str) -> bool {
        key == "X"
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        (key == "X").then(|| Value::String(self.0.to_string()))
    }

    fn put(&mut self, key: &str, _value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        Err(PropertyError::ReadOnly(key.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        Err(PropertyError::ReadOnly(key.to_string()))
    }

    fn keys(&self) -> Vec<String> {
        vec!["X".to_string()]
    }
}

impl Satellite for Claims {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn clone_satellite(&self) -> Box<dyn Satellite> {
        Box::new(self.clone())
    }
}

/// Same shape as [`Claims`], a distinct type.
#[derive(Clone)]
struct LaterClaims(Claims);

impl PropertySet for LaterClaims {
    fn supports(&self, key: &str) -> bool {
        self.0.supports(key)
    }

    fn get(&self, key: &str) -> Option<PropertyValue> {
        self.0.get(key)
    }

    fn put(&mut self, key: &str, value: PropertyValue) -> Result<Option<PropertyValue>, PropertyError> {
        self.0.put(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<Option<PropertyValue>, PropertyError> {
        self.0.remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.0.keys()
    }
}

impl Satellite for LaterClaims {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn clone_satellite(&self) -> Box<dyn Satellite> {
        Box::new(self.clone())
    }
}

#[test]
fn test_first_registered_satellite_wins() {
    let mut owner = MapPropertySet::new();
    owner.put("X", json!("owner")).unwrap();
    let mut set = DistributedPropertySet::new(owner);
    set.add_satellite(Claims("first"));
    set.add_satellite(LaterClaims(Claims("second")));

    assert!(set.supports("X"));
    assert_eq!(set.get("X"), Some(json!("first")));

    set.remove_satellite::<Claims>();
    assert_eq!(set.get("X"), Some(json!("second")));
    set.remove_satellite::<LaterClaims>();
    assert_eq!(set.get("X"), Some(json!("owner")));
}

// ============================================================================
// Fault round trip
// ============================================================================

fn detail(local: &str, text: &str) -> Element {
    Element::new(QName::new("urn:shop:faults", local))
        .with_prefix("f")
        .with_text(text)
}

fn marshal_unmarshal(fault: &ProtocolFault) -> ProtocolFault {
    let bytes = Message::create_fault(fault).to_envelope_bytes().unwrap();
    let mut parsed = parse_soap_envelope(&bytes).unwrap();
    SoapFault::from_message(&mut parsed)
        .unwrap()
        .expect("fault message")
        .to_protocol()
}

#[test]
fn test_soap12_fault_round_trip() {
    let fault = ProtocolFault::client(SoapVersion::Soap12, "Order rejected")
        .with_subcode(shop("Validation"))
        .with_subcode(shop("Quantity"))
        .with_subcode(QName::new("urn:shop:stock", "Exhausted"))
        .with_detail(detail("item", "SKU-1"))
        .with_detail(detail("available", "0"));

    let once = marshal_unmarshal(&fault);
    let twice = marshal_unmarshal(&once);

    for round in [&once, &twice] {
        assert_eq!(round.version, SoapVersion::Soap12);
        assert_eq!(round.code, fault.code);
        assert_eq!(round.subcodes, fault.subcodes);
        assert_eq!(round.subcodes.len(), 3);
        assert_eq!(round.reason, fault.reason);
        let entries = round.detail.as_ref().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries, fault.detail.as_ref().unwrap());
    }
    assert_eq!(once, twice);
}

// ============================================================================
// Dispatch
// ============================================================================

fn shop_endpoint(kind: BindingKind) -> Endpoint {
    Endpoint::builder(WsBinding::new(kind))
        .operation(echo())
        .operation(
            Operation::new("foo_a", |_| Ok(Some(Element::new(shop("A")))))
                .with_request(shop("Foo"))
                .with_action("urn:shop/FooA"),
        )
        .operation(
            Operation::new("foo_b", |_| Ok(Some(Element::new(shop("B")))))
                .with_request(shop("Foo"))
                .with_action("urn:shop/FooB"),
        )
        .build()
        .unwrap()
}

#[test]
fn test_ambiguous_payload_is_not_picked_arbitrarily() {
    init_tracing();
    let config = AssemblyConfig::default();
    let adapter = serve(shop_endpoint(BindingKind::Soap11), &config);
    let client = client_for(WsBinding::new(BindingKind::Soap11), &adapter, &config);

    let fault = expect_fault(client.invoke(&ClientCall::new(), Some(Element::new(shop("Foo")))));
    assert_eq!(fault.code, SoapVersion::Soap11.client_fault_code());
    assert_eq!(fault.reason, "No unique operation found for {urn:shop}Foo");

    // SOAPAction breaks the tie
    let reply = client
        .invoke(
            &ClientCall::new().action("urn:shop/FooB"),
            Some(Element::new(shop("Foo"))),
        )
        .unwrap()
        .unwrap();
    assert_eq!(reply.name, shop("B"));
}

#[test]
fn test_dispatch_miss_fault_follows_binding_version() {
    let config = AssemblyConfig::default();
    for kind in [BindingKind::Soap11, BindingKind::Soap12] {
        let version = kind.soap_version().unwrap();
        let adapter = serve(shop_endpoint(kind), &config);
        let client = client_for(WsBinding::new(kind), &adapter, &config);

        let fault = expect_fault(client.invoke(&ClientCall::new(), Some(Element::new(shop("Refund")))));
        assert_eq!(fault.version, version);
        assert_eq!(fault.code, version.client_fault_code());
        assert_eq!(fault.reason, "Cannot find dispatch method for {urn:shop}Refund");
    }
    assert_eq!(SoapVersion::Soap11.client_fault_code().local, "Client");
    assert_eq!(SoapVersion::Soap12.client_fault_code().local, "Sender");
}

// ============================================================================
// One-way short circuit
// ============================================================================

#[test]
fn test_one_way_call_does_not_wait_for_the_operation() {
    init_tracing();
    let (release_tx, release_rx) = bounded::<()>(1);
    let (done_tx, done_rx) = bounded::<Option<Element>>(1);
    let endpoint = Endpoint::builder(WsBinding::new(BindingKind::Soap12))
        .operation(
            Operation::new("notify", move |input| {
                release_rx
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(|e| ServiceError::Failed(e.to_string()))?;
                done_tx
                    .send(input)
                    .map_err(|e| ServiceError::Failed(e.to_string()))?;
                Ok(None)
            })
            .with_request(shop("Notify"))
            .one_way(),
        )
        .build()
        .unwrap();
    let config = AssemblyConfig::default();
    let adapter = serve(endpoint, &config);
    let client = client_for(WsBinding::new(BindingKind::Soap12), &adapter, &config);

    // returns while the operation is still blocked
    let reply = client
        .invoke(
            &ClientCall::new().one_way(),
            Some(Element::new(shop("Notify")).with_text("restocked")),
        )
        .unwrap();
    assert!(reply.is_none());
    assert!(done_rx.try_recv().is_err());

    release_tx.send(()).unwrap();
    let delivered = done_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(delivered.text(), "restocked");
}

// ============================================================================
// End-to-end: full SOAP stack
// ============================================================================

/// Records the addressing headers of inbound responses.
struct ReplyHeaders(Arc<Mutex<Vec<(String, String)>>>);

impl SoapHandler for ReplyHeaders {
    fn handle_message(&self, ctx: &mut SoapMessageContext<'_>) -> Result<bool, HandlerError> {
        if ctx.is_outbound() {
            return Ok(true);
        }
        if let Some(headers) = ctx.headers() {
            for local in ["Action", "RelatesTo"] {
                if let Some(h) = headers.get(&QName::new(WSA_NS, local)) {
                    self.0.lock().push((local.to_string(), h.text_value()));
                }
            }
        }
        Ok(true)
    }
}

#[test]
fn test_e2e_configured_stack() {
    init_tracing();
    let yaml = r#"
version: "1"
settings:
  dump: true
binding:
  kind: soap12
addressing:
  enabled: true
  required: true
ws_security:
  enabled: true
  require_security_header: true
  require_timestamp: true
"#;
    let config = RuntimeConfig::from_yaml_str(yaml).unwrap();
    let assembly = config.assembly_config();

    let endpoint = Endpoint::builder(config.build_binding().unwrap())
        .operation(echo().with_action("urn:shop/Echo"))
        .build()
        .unwrap();
    let adapter = serve(endpoint, &assembly);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let client_binding = config.build_binding().unwrap();
    client_binding
        .set_handler_chain(vec![HandlerEntry::soap(ReplyHeaders(Arc::clone(&seen)))])
        .unwrap();
    let client = client_for(client_binding, &adapter, &assembly).with_endpoint_address("local://shop");

    let reply = client
        .invoke(
            &ClientCall::new().action("urn:shop/Echo"),
            Some(Element::new(shop("Echo")).with_text("hello")),
        )
        .unwrap()
        .unwrap();
    assert_eq!(reply.name, shop("Echo"));
    assert_eq!(reply.text(), "hello");

    let seen = seen.lock();
    assert!(seen.contains(&("Action".to_string(), "urn:shop/EchoResponse".to_string())));
    assert!(seen
        .iter()
        .any(|(name, value)| name == "RelatesTo" && value.starts_with("urn:uuid:")));
}

#[test]
fn test_e2e_missing_action_is_rejected_when_required() {
    let config = RuntimeConfig::from_yaml_str(
        r#"
binding:
  kind: soap11
addressing:
  enabled: true
  required: true
"#,
    )
    .unwrap();
    let assembly = config.assembly_config();
    let endpoint = Endpoint::builder(config.build_binding().unwrap())
        .operation(echo())
        .build()
        .unwrap();
    let adapter = serve(endpoint, &assembly);
    let client = client_for(config.build_binding().unwrap(), &adapter, &assembly);

    let fault = expect_fault(client.invoke(&ClientCall::new(), Some(Element::new(shop("Echo")))));
    assert_eq!(fault.code, SoapVersion::Soap11.client_fault_code());
    assert!(fault.reason.contains("wsa:Action"));
}

#[test]
fn test_e2e_security_violation_is_client_fault() {
    let server_config = AssemblyConfig {
        ws_security: WsSecurityConfig {
            enabled: true,
            require_username_token: true,
            allowed_password_types: vec![PasswordType::PasswordDigest],
            ..Default::default()
        },
        ..Default::default()
    };
    let endpoint = Endpoint::builder(WsBinding::new(BindingKind::Soap11))
        .operation(echo())
        .build()
        .unwrap();
    let adapter = serve(endpoint, &server_config);

    // the client stamps a timestamp but no username token
    let client_config = AssemblyConfig {
        ws_security: WsSecurityConfig {
            enabled: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let client = client_for(WsBinding::new(BindingKind::Soap11), &adapter, &client_config);

    let fault = expect_fault(client.invoke(&ClientCall::new(), Some(Element::new(shop("Echo")))));
    assert_eq!(fault.code, SoapVersion::Soap11.client_fault_code());
    assert!(fault.detail.map(|d| !d.is_empty()).unwrap_or(false));
}

#[test]
fn test_e2e_closed_server_refuses_requests() {
    let config = AssemblyConfig::default();
    let adapter = serve(shop_endpoint(BindingKind::Soap11), &config);
    let client = client_for(WsBinding::new(BindingKind::Soap11), &adapter, &config);
    adapter.close();

    let err = client
        .invoke(&ClientCall::new(), Some(Element::new(shop("Echo"))))
        .unwrap_err();
    assert!(matches!(err, ClientError::Runtime(_)));
}

#[test]
fn test_e2e_business_fault_passes_through() {
    let endpoint = Endpoint::builder(WsBinding::new(BindingKind::Soap12))
        .operation(
            Operation::new("order", |_| {
                Err(ProtocolFault::client(SoapVersion::Soap12, "Unknown SKU")
                    .with_subcode(shop("UnknownItem"))
                    .into())
            })
            .with_request(shop("Order")),
        )
        .build()
        .unwrap();
    let config = AssemblyConfig::default();
    let adapter = serve(endpoint, &config);
    let client = client_for(WsBinding::new(BindingKind::Soap12), &adapter, &config);

    let fault = expect_fault(client.invoke(&ClientCall::new(), Some(Element::new(shop("Order")))));
    assert_eq!(fault.reason, "Unknown SKU");
    assert_eq!(fault.subcodes, vec![shop("UnknownItem")]);
}

#[test]
fn test_handler_chain_set_after_assembly_takes_effect() {
    init_tracing();
    let server_binding = Arc::new(WsBinding::new(BindingKind::Soap11));
    let endpoint = Endpoint::builder(Arc::clone(&server_binding))
        .operation(echo())
        .build()
        .unwrap();
    let config = AssemblyConfig::default();
    let adapter = serve(endpoint, &config);
    let client = client_for(WsBinding::new(BindingKind::Soap11), &adapter, &config);

    // both pipelines were assembled with empty chains
    let client_closes = Arc::new(AtomicUsize::new(0));
    let server_closes = Arc::new(AtomicUsize::new(0));
    client
        .binding()
        .set_handler_chain(vec![HandlerEntry::soap(CloseCounter(Arc::clone(&client_closes)))])
        .unwrap();
    server_binding
        .set_handler_chain(vec![HandlerEntry::soap(CloseCounter(Arc::clone(&server_closes)))])
        .unwrap();

    let reply = client
        .invoke(&ClientCall::new(), Some(Element::new(shop("Echo"))))
        .unwrap();
    assert_eq!(reply.map(|e| e.name), Some(shop("Echo")));
    assert_eq!(client_closes.load(Ordering::SeqCst), 1);
    assert_eq!(server_closes.load(Ordering::SeqCst), 1);

    client.binding().set_handler_chain(Vec::new()).unwrap();
    client
        .invoke(&ClientCall::new(), Some(Element::new(shop("Echo"))))
        .unwrap();
    assert_eq!(client_closes.load(Ordering::SeqCst), 1);
    assert_eq!(server_closes.load(Ordering::SeqCst), 2);
}
