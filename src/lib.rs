//! dnsmapper - An authoritative DNS and HTTP probe server that maps clients
//! to the recursive resolvers they use.
//!
//! A probe is one DNS lookup followed by one HTTP request for the same
//! random hostname. The DNS half records which resolver asked (and the
//! EDNS0 client subnet, if the resolver forwarded one); the HTTP half reads
//! that back, pairs it with the client's own address and reports the pair
//! to an aggregator.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          dnsmapper                              │
//! │                                                                 │
//! │  UDP/TCP :53 ──▶ ProbeAuthority ──insert──▶ CorrelationCache   │
//! │                                                  │              │
//! │  HTTP(S) ──────▶ axum router ◀────lookup─────────┘              │
//! │                    │     ▲                                      │
//! │                    │     └── TokenPool (fresh tokens)           │
//! │                    ▼                                            │
//! │                 ReportQueue ──▶ workers ──POST──▶ aggregator    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Probe flow
//!
//! ```text
//! abc123.probe.example.com A?   (from resolver 198.51.100.7)
//!   → A 192.0.2.10, cache abc123 → 198.51.100.7
//! GET http://abc123.probe.example.com/json   (from 203.0.113.50)
//!   → {"DNS":"198.51.100.7","EDNS":"","HTTP":"203.0.113.50"}
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use dnsmapper::{Config, MapperServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = Config::default();
//!     config.zone.base_domain = "probe.example.com".to_string();
//!     config.zone.nameservers = vec!["ns1.example.com".to_string()];
//!
//!     let shutdown = CancellationToken::new();
//!     let server = MapperServer::new(config).unwrap();
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod assets;
pub mod authority;
pub mod cache;
pub mod config;
pub mod edns;
pub mod error;
pub mod http;
pub mod metrics;
pub mod report;
pub mod server;
pub mod telemetry;
pub mod tls;
pub mod token;

// Re-export main types
pub use authority::ProbeAuthority;
pub use cache::{CorrelationCache, Observation};
pub use config::{Config, TelemetryConfig};
pub use error::MapperError;
pub use report::{ReportEvent, ReportPipeline, ReportQueue};
pub use server::{BoundAddrs, MapperServer};
pub use token::{BaseDomain, TokenPool};
