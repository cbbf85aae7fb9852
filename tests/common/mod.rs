//! Shared test infrastructure for the responder and probe-flow tests.

#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use dnsmapper::config::ZoneConfig;
use dnsmapper::{CorrelationCache, ProbeAuthority};

// --- Constants ---

pub const BASE_DOMAIN: &str = "probe.example.com";
pub const SERVICE_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
pub const ACME_TARGET: &str = "probe.acme-dns.example.net";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed to
/// `ProbeAuthority::handle_request()`. The response is serialized via
/// `MessageResponse::destructive_emit()` and stored as raw wire-format bytes,
/// which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Source addresses ---

/// A resolver's address as seen by the responder.
pub fn resolver_src() -> SocketAddr {
    "198.51.100.7:53000".parse().unwrap()
}

// --- Config builders ---

pub fn test_zone_config() -> ZoneConfig {
    ZoneConfig {
        base_domain: BASE_DOMAIN.to_string(),
        service_ip: IpAddr::V4(SERVICE_IP),
        nameservers: vec!["ns1.example.com".to_string(), "ns2.example.com".to_string()],
        acme_target: Some(ACME_TARGET.to_string()),
        hostmaster: "hostmaster".to_string(),
    }
}

pub fn test_cache() -> CorrelationCache {
    CorrelationCache::new(1000, Duration::from_secs(10)).expect("failed to create cache")
}

/// Build a responder over a fresh cache; the cache handle is returned too.
pub fn build_authority(zone: ZoneConfig) -> (ProbeAuthority, CorrelationCache) {
    let cache = test_cache();
    let authority =
        ProbeAuthority::new(&zone, cache.clone()).expect("failed to create ProbeAuthority");
    (authority, cache)
}

// --- Query/Request construction ---

/// EDNS section carrying a client subnet option.
pub fn ecs_edns(addr: &str, source_prefix: u8) -> Edns {
    let mut edns = Edns::new();
    edns.set_max_payload(1232);
    edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
        addr.parse().unwrap(),
        source_prefix,
        0,
    )));
    edns
}

/// Build wire-format bytes for a DNS message.
pub fn build_message_bytes(
    name: Option<&str>,
    record_type: RecordType,
    id: u16,
    op_code: OpCode,
    edns: Option<Edns>,
) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(op_code);
    msg.set_recursion_desired(true);
    if let Some(name) = name {
        let mut query = Query::new();
        query.set_name(Name::from_ascii(name).unwrap());
        query.set_query_type(record_type);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);
    }
    if let Some(edns) = edns {
        msg.set_edns(edns);
    }
    msg.to_vec().unwrap()
}

/// Build wire-format bytes for a standard DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    build_message_bytes(Some(name), record_type, id, OpCode::Query, None)
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from wire bytes with a crafted source address.
pub fn build_request(bytes: &[u8], src: SocketAddr) -> Request {
    Request::new(parse_message_request(bytes), src, Protocol::Udp)
}

// --- Response helpers ---

/// Run raw request bytes through the responder and return the parsed response.
pub async fn execute_bytes(authority: &ProbeAuthority, bytes: &[u8], src: SocketAddr) -> Message {
    let request = build_request(bytes, src);
    let handler = TestResponseHandler::new();
    authority.handle_request(&request, handler.clone()).await;
    handler.into_message()
}

/// Execute a query through the responder and return the parsed response.
pub async fn execute_query(
    authority: &ProbeAuthority,
    name: &str,
    record_type: RecordType,
    src: SocketAddr,
    id: u16,
) -> Message {
    execute_bytes(authority, &build_query_bytes(name, record_type, id), src).await
}

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Client subnet option echoed in a response, if any.
pub fn response_subnet(msg: &Message) -> Option<ClientSubnet> {
    match msg.extensions().as_ref()?.option(EdnsCode::Subnet)? {
        EdnsOption::Subnet(subnet) => Some(subnet.clone()),
        _ => None,
    }
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert an empty NOERROR answer with the zone SOA in authority.
pub fn assert_nodata(msg: &Message) {
    assert_response_code(msg, ResponseCode::NoError);
    assert!(msg.answers().is_empty(), "unexpected answers: {:?}", msg.answers());
    assert_eq!(msg.name_servers().len(), 1);
    assert_eq!(msg.name_servers()[0].record_type(), RecordType::SOA);
}
