//! Configuration types for dnsmapper.
//!
//! Every field has a default so the server starts with nothing but an
//! environment variable or two; see [`Config::validate`] for the checks
//! that run before anything binds a socket.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MapperError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Zone served by the authoritative responder.
    #[serde(default)]
    pub zone: ZoneConfig,

    /// DNS listener configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// HTTP(S) listener configuration.
    #[serde(default)]
    pub http: HttpConfig,

    /// Correlation cache sizing.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Aggregator reporting.
    #[serde(default)]
    pub report: ReportConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Check everything that cannot be expressed in the types.
    ///
    /// Zone names are validated separately when the zone records are built.
    pub fn validate(&self) -> Result<(), MapperError> {
        if self.zone.nameservers.is_empty() {
            return Err(MapperError::Config(
                "zone.nameservers must list at least one nameserver".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(MapperError::Config(
                "cache.capacity must be greater than zero".to_string(),
            ));
        }
        if self.report.workers == 0 || self.report.queue_factor == 0 {
            return Err(MapperError::Config(
                "report.workers and report.queue_factor must be greater than zero".to_string(),
            ));
        }
        if let Some(tls) = &self.http.tls {
            for path in [&tls.cert_path, &tls.key_path] {
                if !path.is_file() {
                    return Err(MapperError::Config(format!(
                        "TLS file {} does not exist",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The authoritative zone the probes live under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Base domain for probe hostnames (e.g. "probe.example.com").
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Address handed out in A answers; also reported as the test IP.
    #[serde(default = "default_service_ip")]
    pub service_ip: IpAddr,

    /// Nameserver hostnames for the zone. The first one is the SOA primary.
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,

    /// CNAME target for `_acme-challenge.<base_domain>`, if any.
    #[serde(default)]
    pub acme_target: Option<String>,

    /// SOA RNAME, relative to the base domain unless it ends with a dot.
    #[serde(default = "default_hostmaster")]
    pub hostmaster: String,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            service_ip: default_service_ip(),
            nameservers: default_nameservers(),
            acme_target: None,
            hostmaster: default_hostmaster(),
        }
    }
}

/// DNS listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    #[serde(default = "default_dns_listen")]
    pub listen_addr: SocketAddr,

    /// Idle timeout for DNS-over-TCP connections, in seconds.
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_dns_listen(),
            tcp_timeout_secs: default_tcp_timeout(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address for plain HTTP.
    #[serde(default = "default_http_listen")]
    pub listen_addr: SocketAddr,

    /// Peer ranges allowed to supply `X-Forwarded-For`.
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxies: Vec<IpNet>,

    /// Optional HTTPS listener.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_listen(),
            trusted_proxies: default_trusted_proxies(),
            tls: None,
        }
    }
}

/// HTTPS listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Address for HTTPS.
    #[serde(default = "default_https_listen")]
    pub listen_addr: SocketAddr,

    /// PEM certificate chain.
    pub cert_path: PathBuf,

    /// PEM private key.
    pub key_path: PathBuf,
}

/// Correlation cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live tokens before the oldest is evicted.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// How long an observation stays readable, in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl CacheConfig {
    /// Observation lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

/// Aggregator reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Aggregator `host[:port]`. Reporting is a no-op when unset.
    #[serde(default)]
    pub host: Option<String>,

    /// Number of poster workers.
    #[serde(default = "default_report_workers")]
    pub workers: usize,

    /// Queue capacity per worker.
    #[serde(default = "default_queue_factor")]
    pub queue_factor: usize,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_report_timeout")]
    pub timeout_ms: u64,

    /// Pause after a failed post, in milliseconds.
    #[serde(default = "default_report_backoff")]
    pub backoff_ms: u64,
}

impl ReportConfig {
    /// Full store-result URL, if an aggregator is configured.
    pub fn url(&self) -> Option<String> {
        let host = self.host.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        let base = if host.contains("://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        Some(format!("{base}/api/v1/store-result"))
    }

    /// Bounded queue capacity shared by all workers.
    pub fn queue_capacity(&self) -> usize {
        self.workers * self.queue_factor
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause after a failed post.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            host: None,
            workers: default_report_workers(),
            queue_factor: default_queue_factor(),
            timeout_ms: default_report_timeout(),
            backoff_ms: default_report_backoff(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "dnsmapper=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_base_domain() -> String {
    "example.com".to_string()
}

fn default_service_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_nameservers() -> Vec<String> {
    vec!["ns.example.com".to_string()]
}

fn default_hostmaster() -> String {
    "hostmaster".to_string()
}

fn default_dns_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 53))
}

fn default_tcp_timeout() -> u64 {
    30
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

fn default_https_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 443))
}

fn default_trusted_proxies() -> Vec<IpNet> {
    ["10.0.0.0/8", "192.168.0.0/16", "127.0.0.0/8", "::1/128"]
        .iter()
        .filter_map(|net| net.parse().ok())
        .collect()
}

fn default_cache_capacity() -> usize {
    50_000
}

fn default_cache_ttl() -> u64 {
    10
}

fn default_report_workers() -> usize {
    10
}

fn default_queue_factor() -> usize {
    20
}

fn default_report_timeout() -> u64 {
    5000
}

fn default_report_backoff() -> u64 {
    200
}

fn default_log_level() -> String {
    "info".to_string()
}
