//! EDNS0 handling for the responder: client subnet extraction (RFC 7871)
//! and construction of the OPT record sent back.

use hickory_proto::op::Edns;
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};

/// UDP payload size advertised in every response OPT record.
pub const EDNS_MAX_PAYLOAD: u16 = 4096;

/// A client subnet option found in a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubnetMatch {
    /// The option as the resolver sent it.
    pub subnet: ClientSubnet,
    /// `address/source-prefix`. A /0 is kept: the resolver speaks ECS but
    /// withholds the client.
    pub cidr: String,
}

impl ClientSubnetMatch {
    /// The option to echo back, carrying `scope_prefix`.
    pub fn echo(&self, scope_prefix: u8) -> EdnsOption {
        EdnsOption::Subnet(ClientSubnet::new(
            self.subnet.addr(),
            self.subnet.source_prefix(),
            scope_prefix,
        ))
    }

    /// Scope to report when the subnet was used for an answer.
    pub fn matched_scope(&self) -> u8 {
        self.subnet.source_prefix()
    }
}

/// Find the client subnet option in a query's EDNS section.
///
/// No EDNS, or EDNS without the option, is the common case and yields `None`.
pub fn extract_client_subnet(edns: Option<&Edns>) -> Option<ClientSubnetMatch> {
    let option = edns?.option(EdnsCode::Subnet)?;
    match option {
        EdnsOption::Subnet(subnet) => {
            Some(ClientSubnetMatch {
                subnet: subnet.clone(),
                cidr: format!("{}/{}", subnet.addr(), subnet.source_prefix()),
            })
        }
        _ => None,
    }
}

/// Build the OPT record for a response to a query that carried `request`.
///
/// The request's flags (DNSSEC OK in particular) are echoed, its options are
/// not; the client subnet option is added back with `scope_prefix` when
/// `subnet` is given.
pub fn response_edns(
    request: &Edns,
    subnet: Option<&ClientSubnetMatch>,
    scope_prefix: u8,
) -> Edns {
    let mut edns = request.clone();
    edns.set_max_payload(EDNS_MAX_PAYLOAD);
    edns.set_version(0);
    edns.set_rcode_high(0);

    let codes: Vec<EdnsCode> = edns
        .options()
        .as_ref()
        .iter()
        .map(|(code, _)| *code)
        .collect();
    for code in codes {
        edns.options_mut().remove(code);
    }

    if let Some(subnet) = subnet {
        edns.options_mut().insert(subnet.echo(scope_prefix));
    }

    edns
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn edns_with_subnet(addr: &str, source: u8) -> Edns {
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        let addr: IpAddr = addr.parse().unwrap();
        edns.options_mut()
            .insert(EdnsOption::Subnet(ClientSubnet::new(addr, source, 0)));
        edns
    }

    fn subnet_option(edns: &Edns) -> Option<ClientSubnet> {
        match edns.option(EdnsCode::Subnet)? {
            EdnsOption::Subnet(subnet) => Some(subnet.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_no_edns_is_absent() {
        assert_eq!(extract_client_subnet(None), None);
    }

    #[test]
    fn test_edns_without_subnet_is_absent() {
        let edns = Edns::new();
        assert_eq!(extract_client_subnet(Some(&edns)), None);
    }

    #[test]
    fn test_ipv4_subnet_extracted() {
        let edns = edns_with_subnet("203.0.113.0", 24);
        let found = extract_client_subnet(Some(&edns)).unwrap();
        assert_eq!(found.cidr, "203.0.113.0/24");
        assert_eq!(found.matched_scope(), 24);
    }

    #[test]
    fn test_ipv6_subnet_extracted() {
        let edns = edns_with_subnet("2001:db8:1200::", 40);
        let found = extract_client_subnet(Some(&edns)).unwrap();
        assert_eq!(found.cidr, "2001:db8:1200::/40");
    }

    #[test]
    fn test_zero_prefix_is_still_recorded() {
        let edns = edns_with_subnet("0.0.0.0", 0);
        let found = extract_client_subnet(Some(&edns)).unwrap();
        assert_eq!(found.cidr, "0.0.0.0/0");
        assert_eq!(found.matched_scope(), 0);
    }

    #[test]
    fn test_response_edns_echoes_subnet_with_scope() {
        let request = edns_with_subnet("203.0.113.0", 24);
        let found = extract_client_subnet(Some(&request)).unwrap();

        let response = response_edns(&request, Some(&found), 24);
        assert_eq!(response.max_payload(), EDNS_MAX_PAYLOAD);
        let echoed = subnet_option(&response).unwrap();
        assert_eq!(echoed.source_prefix(), 24);
        assert_eq!(echoed.scope_prefix(), 24);

        let response = response_edns(&request, Some(&found), 0);
        assert_eq!(subnet_option(&response).unwrap().scope_prefix(), 0);
    }

    #[test]
    fn test_response_edns_drops_request_options() {
        let request = edns_with_subnet("203.0.113.0", 24);
        let response = response_edns(&request, None, 0);
        assert!(subnet_option(&response).is_none());
        assert_eq!(response.max_payload(), EDNS_MAX_PAYLOAD);
    }
}
