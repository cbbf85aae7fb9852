//! Authoritative responder for the probe zone.
//!
//! Every A query for `<token>.<base_domain>` is answered with the service
//! address and records which resolver asked (and, with EDNS0, on behalf of
//! which client subnet) in the [`CorrelationCache`]. Everything else in the
//! zone gets a fixed NS/SOA/CNAME answer.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Header, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME, NS, SOA};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, trace};

use crate::cache::CorrelationCache;
use crate::config::ZoneConfig;
use crate::edns::{self, ClientSubnetMatch};
use crate::error::MapperError;
use crate::metrics::{self, AnswerKind, Timer};
use crate::token::{BaseDomain, ACME_CHALLENGE_LABEL, DEFAULT_HOST_TOKEN};

/// TTL of the SOA record.
pub const SOA_TTL: u32 = 3600;
/// TTL of the NS records.
pub const NS_TTL: u32 = 20800;
/// TTL of A answers for probe tokens. Shorter than the cache TTL so
/// resolvers come back before the observation expires.
pub const PROBE_TTL: u32 = 5;
/// TTL of A answers for the default host, which is never probed.
pub const DEFAULT_HOST_TTL: u32 = 120;
/// TTL of the ACME challenge CNAME.
pub const ACME_TTL: u32 = 600;

const SOA_SERIAL: u32 = 1;
const SOA_REFRESH: i32 = 5400;
const SOA_RETRY: i32 = 5400;
const SOA_EXPIRE: i32 = 2_419_200;
const SOA_MINIMUM: u32 = 300;

/// Parse a configured hostname as a fully qualified name.
fn fqdn(name: &str) -> Result<Name, MapperError> {
    let mut parsed = Name::from_ascii(name.trim())?;
    if parsed.is_root() {
        return Err(MapperError::Config(format!("'{name}' is not a hostname")));
    }
    parsed.set_fqdn(true);
    Ok(parsed)
}

fn record(name: Name, ttl: u32, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

/// Static records of the zone, validated once at startup.
#[derive(Debug)]
pub struct ZoneRecords {
    origin: LowerName,
    soa: Record,
    ns: Vec<Record>,
    acme_target: Option<Name>,
}

impl ZoneRecords {
    /// Build the SOA, NS set and optional ACME alias target for `zone`.
    pub fn new(zone: &ZoneConfig) -> Result<Self, MapperError> {
        let origin = fqdn(&zone.base_domain)?;

        let primary = zone.nameservers.first().ok_or_else(|| {
            MapperError::Config("zone needs at least one nameserver".to_string())
        })?;

        let hostmaster = if zone.hostmaster.ends_with('.') {
            fqdn(&zone.hostmaster)?
        } else {
            fqdn(&format!(
                "{}.{}",
                zone.hostmaster,
                zone.base_domain.trim_end_matches('.')
            ))?
        };

        let soa = record(
            origin.clone(),
            SOA_TTL,
            RData::SOA(SOA::new(
                fqdn(primary)?,
                hostmaster,
                SOA_SERIAL,
                SOA_REFRESH,
                SOA_RETRY,
                SOA_EXPIRE,
                SOA_MINIMUM,
            )),
        );

        let ns = zone
            .nameservers
            .iter()
            .map(|ns| Ok(record(origin.clone(), NS_TTL, RData::NS(NS(fqdn(ns)?)))))
            .collect::<Result<Vec<_>, MapperError>>()?;

        let acme_target = zone
            .acme_target
            .as_deref()
            .filter(|target| !target.trim().is_empty())
            .map(fqdn)
            .transpose()?;

        Ok(Self {
            origin: origin.into(),
            soa,
            ns,
            acme_target,
        })
    }

    /// Zone apex.
    pub fn origin(&self) -> &LowerName {
        &self.origin
    }
}

/// A fully decided response, before it is put on the wire.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Which branch of the responder produced it.
    pub kind: AnswerKind,
    /// Response code.
    pub response_code: ResponseCode,
    /// Answer section.
    pub answers: Vec<Record>,
    /// Authority section.
    pub authority: Vec<Record>,
    /// OPT record, present when the query carried one.
    pub edns: Option<Edns>,
}

impl Reply {
    fn new(kind: AnswerKind, response_code: ResponseCode) -> Self {
        Self {
            kind,
            response_code,
            answers: Vec::new(),
            authority: Vec::new(),
            edns: None,
        }
    }

    /// Whether the AA bit is set; true for everything inside the zone.
    pub fn authoritative(&self) -> bool {
        !matches!(self.kind, AnswerKind::Refused | AnswerKind::Malformed)
    }
}

/// The probe zone's responder.
#[derive(Debug, Clone)]
pub struct ProbeAuthority {
    zone: Arc<ZoneRecords>,
    base: BaseDomain,
    service_ip: IpAddr,
    cache: CorrelationCache,
}

impl ProbeAuthority {
    /// Create the responder. Fails on malformed zone configuration.
    pub fn new(zone: &ZoneConfig, cache: CorrelationCache) -> Result<Self, MapperError> {
        Ok(Self {
            zone: Arc::new(ZoneRecords::new(zone)?),
            base: BaseDomain::new(&zone.base_domain)?,
            service_ip: zone.service_ip,
            cache,
        })
    }

    /// Zone apex.
    pub fn origin(&self) -> &LowerName {
        self.zone.origin()
    }

    /// Decide the response to `query`, asked by `src`.
    ///
    /// Inserting into the correlation cache is the only side effect.
    pub fn answer(&self, query: &Query, src: IpAddr, request_edns: Option<&Edns>) -> Reply {
        let name = query.name();
        let qtype = query.query_type();
        let subnet = edns::extract_client_subnet(request_edns);

        if !self.zone.origin.zone_of(&LowerName::from(name)) {
            debug!(%name, src = %src, "query outside zone, refusing");
            return self.finish(
                Reply::new(AnswerKind::Refused, ResponseCode::Refused),
                request_edns,
                subnet.as_ref(),
                0,
            );
        }

        let token = self.base.extract_name_token(name);
        trace!(src = %src, token = ?token, qtype = ?qtype, "DNS request");

        let token = match token {
            None if qtype == RecordType::NS => {
                let mut reply = Reply::new(AnswerKind::Delegation, ResponseCode::NoError);
                reply.answers = self.zone.ns.clone();
                return self.finish(reply, request_edns, subnet.as_ref(), 0);
            }
            None => return self.no_data(request_edns, subnet.as_ref()),
            Some(token) => token,
        };

        if let Some(target) = &self.zone.acme_target {
            if token == ACME_CHALLENGE_LABEL {
                let mut reply = Reply::new(AnswerKind::AcmeAlias, ResponseCode::NoError);
                reply.answers = vec![record(
                    name.clone(),
                    ACME_TTL,
                    RData::CNAME(CNAME(target.clone())),
                )];
                return self.finish(reply, request_edns, subnet.as_ref(), 0);
            }
        }

        if qtype != RecordType::A {
            return self.no_data(request_edns, subnet.as_ref());
        }

        let IpAddr::V4(service_v4) = self.service_ip else {
            let mut reply = Reply::new(AnswerKind::NxDomain, ResponseCode::NXDomain);
            reply.authority = vec![self.zone.soa.clone()];
            return self.finish(reply, request_edns, subnet.as_ref(), 0);
        };

        let (kind, ttl, scope) = if token == DEFAULT_HOST_TOKEN {
            (AnswerKind::DefaultHost, DEFAULT_HOST_TTL, 0)
        } else {
            let cidr = subnet.as_ref().map(|s| s.cidr.as_str());
            let resolver_ip = src.to_canonical().to_string();
            match self.cache.insert(&token, &resolver_ip, cidr) {
                Ok(()) => debug!(token = %token, resolver = %resolver_ip, edns = ?cidr, "recorded probe"),
                Err(e) => debug!(error = %e, "probe answered without recording"),
            }
            let scope = subnet.as_ref().map_or(0, ClientSubnetMatch::matched_scope);
            (AnswerKind::Probe, PROBE_TTL, scope)
        };

        let mut reply = Reply::new(kind, ResponseCode::NoError);
        reply.answers = vec![record(name.clone(), ttl, RData::A(A::from(service_v4)))];
        self.finish(reply, request_edns, subnet.as_ref(), scope)
    }

    fn no_data(&self, request_edns: Option<&Edns>, subnet: Option<&ClientSubnetMatch>) -> Reply {
        let mut reply = Reply::new(AnswerKind::NoData, ResponseCode::NoError);
        reply.authority = vec![self.zone.soa.clone()];
        self.finish(reply, request_edns, subnet, 0)
    }

    fn finish(
        &self,
        mut reply: Reply,
        request_edns: Option<&Edns>,
        subnet: Option<&ClientSubnetMatch>,
        scope: u8,
    ) -> Reply {
        reply.edns = request_edns.map(|req| edns::response_edns(req, subnet, scope));
        reply
    }

    fn reply_to(&self, request: &Request) -> (Reply, String) {
        let header = request.header();
        if header.message_type() != MessageType::Query || header.op_code() != OpCode::Query {
            debug!(op_code = ?header.op_code(), src = %request.src(), "unsupported request");
            let mut reply = Reply::new(AnswerKind::Malformed, ResponseCode::NotImp);
            reply.edns = request.edns().map(|req| edns::response_edns(req, None, 0));
            return (reply, "none".to_string());
        }

        // Only the first question is answered.
        match request.queries().first() {
            Some(query) => (
                self.answer(query.original(), request.src().ip(), request.edns()),
                query.query_type().to_string(),
            ),
            None => {
                debug!(src = %request.src(), "request without a question");
                let mut reply = Reply::new(AnswerKind::Malformed, ResponseCode::FormErr);
                reply.edns = request.edns().map(|req| edns::response_edns(req, None, 0));
                (reply, "none".to_string())
            }
        }
    }
}

#[async_trait]
impl RequestHandler for ProbeAuthority {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();
        let (reply, rtype_str) = self.reply_to(request);

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(reply.authoritative());
        header.set_response_code(reply.response_code);

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = reply.edns.clone() {
            builder.edns(edns);
        }
        let response = builder.build(
            header,
            reply.answers.iter(),
            std::iter::empty(),
            reply.authority.iter(),
            std::iter::empty(),
        );

        let info = match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, src = %request.src(), "failed to send DNS response");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        };

        metrics::record_query(&rtype_str, reply.kind, timer.elapsed());
        info
    }
}
