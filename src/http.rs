//! HTTP half of a probe.
//!
//! A client that resolved `<token>.<base_domain>` fetches one of the
//! correlation endpoints from that host. The token is looked up in the
//! [`CorrelationCache`]; a hit yields the resolver the DNS responder saw
//! next to the address this request came from. Misses never fail: the
//! client is redirected to a fresh token and the probe starts over.

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Router};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::assets::{self, ProbeScheme};
use crate::cache::CorrelationCache;
use crate::metrics::{self, CorrelationResult, Timer};
use crate::report::{ReportEvent, ReportQueue};
use crate::token::{BaseDomain, TokenPool, DEFAULT_HOST_TOKEN};

/// `Cache-Control` on every correlation response, redirects included.
pub const NO_STORE: &str = "private, no-cache, no-store, must-revalidate";

/// Longest JSONP callback name accepted.
const MAX_CALLBACK_LEN: usize = 128;

/// Request extension marking a connection that arrived over TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureConnection;

/// What both halves of a probe observed, as returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Resolver address seen by the DNS responder.
    #[serde(rename = "DNS")]
    pub dns: String,
    /// EDNS0 client subnet, empty when the resolver sent none.
    #[serde(rename = "EDNS")]
    pub edns: String,
    /// Client address seen over HTTP.
    #[serde(rename = "HTTP")]
    pub http: String,
}

struct Scripts {
    mapper: String,
    mapper_v6compat: String,
    landing: String,
}

/// Shared state for every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    base: BaseDomain,
    cache: CorrelationCache,
    tokens: TokenPool,
    reports: ReportQueue,
    trusted: Arc<[IpNet]>,
    test_ip: IpAddr,
    scripts: Arc<Scripts>,
}

impl AppState {
    /// Bundle the handles the HTTP listeners need.
    pub fn new(
        base: BaseDomain,
        cache: CorrelationCache,
        tokens: TokenPool,
        reports: ReportQueue,
        trusted: Vec<IpNet>,
        test_ip: IpAddr,
    ) -> Self {
        let scripts = Scripts {
            mapper: assets::mapper_script(base.name(), ProbeScheme::Http),
            mapper_v6compat: assets::mapper_script(base.name(), ProbeScheme::PageScheme),
            landing: assets::landing_page(base.name()),
        };
        Self {
            base,
            cache,
            tokens,
            reports,
            trusted: trusted.into(),
            test_ip,
            scripts: Arc::new(scripts),
        }
    }
}

/// Build the router shared by the HTTP and HTTPS listeners.
///
/// Handlers expect a `ConnectInfo<SocketAddr>` extension, and a
/// [`SecureConnection`] extension on TLS connections.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/json", get(json))
        .route("/jsonp", get(json))
        .route("/none", get(none))
        .route("/ip", get(ip))
        .route("/gone", get(|| async { StatusCode::GONE }))
        .route("/notfound", get(not_found))
        .route("/", get(landing))
        .route("/mapper.js", get(mapper_js))
        .route("/mapper-v6compat.js", get(mapper_v6compat_js))
        .route("/robots.txt", get(robots))
        .route("/version", get(version))
        .fallback(not_found)
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

/// The client address to attribute a request to.
///
/// `X-Forwarded-For` is only believed when the direct peer is one of the
/// `trusted` proxies. The chain is then walked from the closest hop
/// outwards and the first address outside `trusted` wins. Without such an
/// address the peer itself is used.
pub fn remote_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> IpAddr {
    let peer = peer.to_canonical();
    let is_trusted = |ip: &IpAddr| trusted.iter().any(|net| net.contains(ip));
    if !is_trusted(&peer) {
        return peer;
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .collect();

    hops.iter()
        .rev()
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .map(|ip| ip.to_canonical())
        .find(|ip| !is_trusted(ip))
        .unwrap_or(peer)
}

/// Host the request was sent to, without a port.
fn request_host(headers: &HeaderMap) -> &str {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']')) =>
        {
            name
        }
        _ => host,
    }
}

fn valid_callback(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CALLBACK_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'.'))
}

/// Send the client to a brand-new probe host, keeping scheme and path.
async fn redirect_to_fresh_token(state: &AppState, uri: &Uri, secure: bool) -> Response {
    let token = state.tokens.next().await;
    let scheme = if secure { "https" } else { "http" };
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let location = format!("{scheme}://{}{path}", state.base.probe_host(&token));

    match HeaderValue::from_str(&location) {
        Ok(location) => (
            StatusCode::FOUND,
            [
                (header::LOCATION, location),
                (header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE)),
            ],
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, %location, "unrepresentable redirect target");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

struct Probe {
    peer: SocketAddr,
    headers: HeaderMap,
    uri: Uri,
    secure: bool,
}

/// Shared front half of every correlation endpoint.
///
/// Returns the redirect to send instead when the host carries no usable
/// token.
async fn correlate(state: &AppState, endpoint: &str, probe: &Probe) -> Result<ProbeResult, Response> {
    let host = request_host(&probe.headers);
    let token = state.base.extract_token(host);

    let observation = match token.as_deref() {
        Some(DEFAULT_HOST_TOKEN) => {
            metrics::record_correlation(endpoint, CorrelationResult::DefaultHost);
            None
        }
        Some(token) => {
            let found = state.cache.lookup(token);
            if found.is_none() {
                debug!(token, "no observation for token, restarting probe");
                metrics::record_correlation(endpoint, CorrelationResult::Miss);
            }
            found
        }
        None => {
            debug!(host, "request without a token, restarting probe");
            metrics::record_correlation(endpoint, CorrelationResult::Miss);
            None
        }
    };

    let Some(observation) = observation else {
        return Err(redirect_to_fresh_token(state, &probe.uri, probe.secure).await);
    };
    metrics::record_correlation(endpoint, CorrelationResult::Hit);

    let client_ip = remote_ip(probe.peer.ip(), &probe.headers, &state.trusted);
    let result = ProbeResult {
        dns: observation.resolver_ip,
        edns: observation.client_subnet.unwrap_or_default(),
        http: client_ip.to_string(),
    };

    state.reports.enqueue(ReportEvent {
        client_ip: result.http.clone(),
        server_ip: result.dns.clone(),
        edns_net: result.edns.clone(),
        test_ip: state.test_ip.to_string(),
    });

    Ok(result)
}

async fn json(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    secure: Option<Extension<SecureConnection>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let probe = Probe {
        peer,
        headers,
        uri,
        secure: secure.is_some(),
    };
    let result = match correlate(&state, probe.uri.path(), &probe).await {
        Ok(result) => result,
        Err(redirect) => return redirect,
    };

    let body = match serde_json::to_string(&result) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to encode probe result");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let callback = params
        .get("jsonp")
        .or_else(|| params.get("callback"))
        .filter(|name| valid_callback(name));

    match callback {
        Some(callback) => (
            [
                (header::CONTENT_TYPE, "text/javascript"),
                (header::CACHE_CONTROL, NO_STORE),
            ],
            format!("{callback}({body});\n"),
        )
            .into_response(),
        None => (
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CACHE_CONTROL, NO_STORE),
            ],
            format!("{body}\n"),
        )
            .into_response(),
    }
}

async fn none(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    secure: Option<Extension<SecureConnection>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let probe = Probe {
        peer,
        headers,
        uri,
        secure: secure.is_some(),
    };
    match correlate(&state, "/none", &probe).await {
        Ok(_) => (
            StatusCode::NO_CONTENT,
            [(header::CACHE_CONTROL, NO_STORE)],
        )
            .into_response(),
        Err(redirect) => redirect,
    }
}

async fn ip(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client_ip = remote_ip(peer.ip(), &headers, &state.trusted);
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, NO_STORE),
        ],
        format!("{client_ip}\n"),
    )
        .into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
}

async fn landing(State(state): State<AppState>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, assets::LANDING_CACHE_CONTROL),
        ],
        state.scripts.landing.clone(),
    )
        .into_response()
}

fn script(body: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/javascript; charset=utf-8"),
            (header::CACHE_CONTROL, assets::SCRIPT_CACHE_CONTROL),
        ],
        body.to_string(),
    )
        .into_response()
}

async fn mapper_js(State(state): State<AppState>) -> Response {
    script(&state.scripts.mapper)
}

async fn mapper_v6compat_js(State(state): State<AppState>) -> Response {
    script(&state.scripts.mapper_v6compat)
}

async fn robots() -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, assets::ROBOTS_CACHE_CONTROL),
        ],
        assets::ROBOTS_TXT,
    )
        .into_response()
}

async fn version() -> Response {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        assets::version_page(),
    )
        .into_response()
}

/// One log line per request.
async fn access_log(request: Request<Body>, next: Next) -> Response {
    let timer = Timer::start();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let host = request_host(request.headers()).to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let secure = request.extensions().get::<SecureConnection>().is_some();

    let response = next.run(request).await;

    info!(
        %method,
        host,
        path,
        status = response.status().as_u16(),
        peer = ?peer,
        secure,
        elapsed_ms = timer.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn trusted() -> Vec<IpNet> {
        vec!["10.0.0.0/8".parse().unwrap(), "127.0.0.0/8".parse().unwrap()]
    }

    fn xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_remote_ip_trusted_peer_uses_forwarded_for() {
        let ip = remote_ip(
            "10.1.2.3".parse().unwrap(),
            &xff("10.0.0.5, 203.0.113.9"),
            &trusted(),
        );
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_remote_ip_untrusted_peer_ignores_header() {
        let ip = remote_ip(
            "198.51.100.20".parse().unwrap(),
            &xff("10.0.0.5, 203.0.113.9"),
            &trusted(),
        );
        assert_eq!(ip, "198.51.100.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_remote_ip_skips_trusted_and_garbage_hops() {
        let ip = remote_ip(
            "127.0.0.1".parse().unwrap(),
            &xff("192.0.2.1, 203.0.113.9, not-an-ip, 10.9.9.9"),
            &trusted(),
        );
        assert_eq!(ip, "203.0.113.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_remote_ip_all_trusted_falls_back_to_peer() {
        let ip = remote_ip("10.1.2.3".parse().unwrap(), &xff("10.0.0.5"), &trusted());
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());

        let ip = remote_ip("10.1.2.3".parse().unwrap(), &HeaderMap::new(), &trusted());
        assert_eq!(ip, "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_remote_ip_unmaps_ipv4_mapped_peer() {
        let ip = remote_ip("::ffff:198.51.100.20".parse().unwrap(), &HeaderMap::new(), &[]);
        assert_eq!(ip, "198.51.100.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_request_host_strips_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("abc.probe.example.com:8080"));
        assert_eq!(request_host(&headers), "abc.probe.example.com");

        headers.insert(header::HOST, HeaderValue::from_static("[2001:db8::1]:80"));
        assert_eq!(request_host(&headers), "[2001:db8::1]");

        headers.insert(header::HOST, HeaderValue::from_static("abc.probe.example.com"));
        assert_eq!(request_host(&headers), "abc.probe.example.com");

        assert_eq!(request_host(&HeaderMap::new()), "");
    }

    #[test]
    fn test_callback_validation() {
        assert!(valid_callback("cb"));
        assert!(valid_callback("jQuery_123.done$"));
        assert!(!valid_callback(""));
        assert!(!valid_callback("alert(1)//"));
        assert!(!valid_callback(&"a".repeat(MAX_CALLBACK_LEN + 1)));
    }

    fn app() -> (Router, CorrelationCache) {
        let cache = CorrelationCache::new(100, std::time::Duration::from_secs(10)).unwrap();
        let (tokens, _) = TokenPool::spawn(4, CancellationToken::new());
        let (reports, _rx) = ReportQueue::bounded(16);
        let state = AppState::new(
            BaseDomain::new("probe.example.com").unwrap(),
            cache.clone(),
            tokens,
            reports,
            trusted(),
            "192.0.2.10".parse().unwrap(),
        );
        (router(state), cache)
    }

    fn get(uri: &str, host: &str) -> Request<Body> {
        let mut request = axum::http::Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([203, 0, 113, 50], 40000))));
        request
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_json_hit() {
        let (app, cache) = app();
        cache
            .insert("abc123", "198.51.100.7", Some("203.0.113.0/24"))
            .unwrap();

        let response = app
            .oneshot(get("/json", "abc123.probe.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[header::CACHE_CONTROL], NO_STORE);
        assert_eq!(
            body_string(response).await,
            "{\"DNS\":\"198.51.100.7\",\"EDNS\":\"203.0.113.0/24\",\"HTTP\":\"203.0.113.50\"}\n"
        );
    }

    #[tokio::test]
    async fn test_jsonp_wraps_callback() {
        let (app, cache) = app();
        cache.insert("abc123", "198.51.100.7", None).unwrap();

        let response = app
            .oneshot(get("/jsonp?jsonp=cb", "abc123.probe.example.com"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/javascript");
        assert_eq!(
            body_string(response).await,
            "cb({\"DNS\":\"198.51.100.7\",\"EDNS\":\"\",\"HTTP\":\"203.0.113.50\"});\n"
        );
    }

    #[tokio::test]
    async fn test_jsonp_invalid_callback_is_plain_json() {
        let (app, cache) = app();
        cache.insert("abc123", "198.51.100.7", None).unwrap();

        let response = app
            .oneshot(get("/jsonp?callback=alert(1)", "abc123.probe.example.com"))
            .await
            .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[tokio::test]
    async fn test_miss_redirects_to_fresh_token() {
        let (app, _) = app();
        let response = app
            .oneshot(get("/json?jsonp=cb", "unknown.probe.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::CACHE_CONTROL], NO_STORE);

        let location = response.headers()[header::LOCATION].to_str().unwrap();
        let rest = location.strip_prefix("http://").unwrap();
        let (token, path) = rest.split_once(".probe.example.com").unwrap();
        assert_eq!(token.len(), 32);
        assert_eq!(path, "/json?jsonp=cb");
    }

    #[tokio::test]
    async fn test_default_host_redirects_over_tls() {
        let (app, cache) = app();
        let mut request = get("/none", "www.probe.example.com");
        request.extensions_mut().insert(SecureConnection);

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://"));
        assert!(location.ends_with(".probe.example.com/none"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_none_hit_is_no_content() {
        let (app, cache) = app();
        cache.insert("abc123", "198.51.100.7", None).unwrap();

        let response = app
            .oneshot(get("/none", "abc123.probe.example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_does_not_consume_observation() {
        let (app, cache) = app();
        cache.insert("abc123", "198.51.100.7", None).unwrap();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(get("/json", "abc123.probe.example.com"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_ip_endpoint() {
        let (app, _) = app();
        let response = app.oneshot(get("/ip", "probe.example.com")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "203.0.113.50\n");
    }

    #[tokio::test]
    async fn test_static_routes() {
        let (app, _) = app();

        let response = app.clone().oneshot(get("/gone", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::GONE);

        let response = app.clone().oneshot(get("/notfound", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(get("/nope", "x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.clone().oneshot(get("/robots.txt", "x")).await.unwrap();
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            assets::ROBOTS_CACHE_CONTROL
        );
        assert_eq!(body_string(response).await, "# Hi Robot!\n");

        let response = app.clone().oneshot(get("/mapper.js", "x")).await.unwrap();
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            assets::SCRIPT_CACHE_CONTROL
        );
        assert!(body_string(response)
            .await
            .contains(".probe.example.com/none"));

        let response = app.clone().oneshot(get("/", "x")).await.unwrap();
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            assets::LANDING_CACHE_CONTROL
        );

        let response = app.oneshot(get("/version", "x")).await.unwrap();
        assert!(body_string(response)
            .await
            .contains(env!("CARGO_PKG_VERSION")));
    }
}
