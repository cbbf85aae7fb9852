//! Server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::authority::ProbeAuthority;
use crate::cache::CorrelationCache;
use crate::config::Config;
use crate::error::MapperError;
use crate::http::{self, AppState};
use crate::report::ReportPipeline;
use crate::tls;
use crate::token::{BaseDomain, TokenPool, TOKEN_BUFFER_DEPTH};

/// Interval for emitting cache metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit cache metrics.
async fn metrics_loop(cache: CorrelationCache, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let entries = cache.len();
                crate::metrics::record_cache_entries(entries);
                debug!(entries, "emitted cache metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Addresses actually bound, useful when the configuration asks for port 0.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    /// DNS, UDP and TCP.
    pub dns: SocketAddr,
    /// Plain HTTP.
    pub http: SocketAddr,
    /// HTTPS, when configured.
    pub https: Option<SocketAddr>,
}

/// The DNS and HTTP listeners plus the background tasks they share.
pub struct MapperServer {
    config: Config,
    cache: CorrelationCache,
}

impl MapperServer {
    /// Create a server. Fails when the configuration is invalid.
    pub fn new(config: Config) -> Result<Self, MapperError> {
        config.validate()?;
        let cache = CorrelationCache::new(config.cache.capacity, config.cache.ttl())?;
        Ok(Self { config, cache })
    }

    /// The correlation cache shared by both halves.
    pub fn cache(&self) -> &CorrelationCache {
        &self.cache
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), MapperError> {
        self.run_with(shutdown, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `on_bound` once every listener is up.
    pub async fn run_with<F>(self, shutdown: CancellationToken, on_bound: F) -> Result<(), MapperError>
    where
        F: FnOnce(BoundAddrs),
    {
        let zone = &self.config.zone;
        info!(
            base_domain = %zone.base_domain,
            service_ip = %zone.service_ip,
            nameservers = ?zone.nameservers,
            "Starting dnsmapper"
        );

        // Fail on bad zone data before anything binds.
        let authority = ProbeAuthority::new(zone, self.cache.clone())?;
        let base = BaseDomain::new(&zone.base_domain)?;
        let tls_acceptor = self.config.http.tls.as_ref().map(tls::acceptor).transpose()?;

        let (tokens, token_handle) = TokenPool::spawn(TOKEN_BUFFER_DEPTH, shutdown.clone());
        let (reports, report_handles) = ReportPipeline::spawn(&self.config.report, shutdown.clone())?;

        // DNS over UDP and TCP on the same address.
        let mut dns = ServerFuture::new(authority);
        let udp_socket = UdpSocket::bind(self.config.dns.listen_addr).await?;
        let dns_addr = udp_socket.local_addr()?;
        info!(addr = %dns_addr, "DNS UDP listening");
        dns.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(dns_addr).await?;
        info!(addr = %dns_addr, "DNS TCP listening");
        dns.register_listener(
            tcp_listener,
            Duration::from_secs(self.config.dns.tcp_timeout_secs),
        );

        let router = http::router(AppState::new(
            base,
            self.cache.clone(),
            tokens,
            reports,
            self.config.http.trusted_proxies.clone(),
            zone.service_ip,
        ));

        let http_listener = TcpListener::bind(self.config.http.listen_addr).await?;
        let http_addr = http_listener.local_addr()?;
        info!(addr = %http_addr, "HTTP listening");
        let http_shutdown = shutdown.clone();
        let http_router = router.clone();
        let http_handle: JoinHandle<()> = tokio::spawn(async move {
            let result = axum::serve(
                http_listener,
                http_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(http_shutdown.cancelled_owned())
            .await;
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        });

        let mut https_addr = None;
        let mut https_handle = None;
        if let (Some(acceptor), Some(tls_config)) = (tls_acceptor, &self.config.http.tls) {
            let listener = TcpListener::bind(tls_config.listen_addr).await?;
            let addr = listener.local_addr()?;
            info!(%addr, "HTTPS listening");
            https_addr = Some(addr);
            https_handle = Some(tokio::spawn(tls::serve(
                listener,
                acceptor,
                router,
                shutdown.clone(),
            )));
        }

        let metrics_handle = tokio::spawn(metrics_loop(self.cache.clone(), shutdown.clone()));

        info!(
            base_domain = %zone.base_domain,
            "dnsmapper ready to serve probes"
        );
        on_bound(BoundAddrs {
            dns: dns_addr,
            http: http_addr,
            https: https_addr,
        });

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested");
            }
            result = dns.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
                shutdown.cancel();
            }
        }

        if let Err(e) = dns.shutdown_gracefully().await {
            debug!("DNS server shutdown error: {}", e);
        }

        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = metrics_handle.await;
        let _ = token_handle.await;
        for handle in report_handles {
            let _ = handle.await;
        }

        info!("dnsmapper stopped");
        Ok(())
    }
}
