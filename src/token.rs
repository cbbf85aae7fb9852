//! Correlation tokens: extraction from probe hostnames and generation of
//! fresh ones for redirects.
//!
//! A probe hostname is always `<token>.<base_domain>`. The token may itself
//! span several labels; everything left of the base domain is the token.

use hickory_proto::rr::Name;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MapperError;
use crate::metrics;

/// Token reserved for the default landing host. Never cached.
pub const DEFAULT_HOST_TOKEN: &str = "www";

/// Label answered with the ACME alias CNAME when one is configured.
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Bytes of entropy per generated token.
const TOKEN_ENTROPY_BYTES: usize = 20;

/// Lower-case RFC 4648 base-32 alphabet; 0, 1, 8 and 9 never appear.
const TOKEN_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Number of tokens buffered ahead of demand.
pub const TOKEN_BUFFER_DEPTH: usize = 10;

/// The fixed suffix every probe hostname lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDomain {
    name: String,
    labels: usize,
}

impl BaseDomain {
    /// Parse a base domain. A trailing dot is accepted and dropped.
    pub fn new(domain: &str) -> Result<Self, MapperError> {
        let labels = split_labels(domain);
        if labels.is_empty() {
            return Err(MapperError::Config(format!(
                "base domain '{domain}' has no labels"
            )));
        }
        Ok(Self {
            name: labels.join(".").to_ascii_lowercase(),
            labels: labels.len(),
        })
    }

    /// The base domain without a trailing dot, lower-cased.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of labels in the base domain.
    pub fn label_count(&self) -> usize {
        self.labels
    }

    /// Extract the token from a queried or requested name.
    ///
    /// Returns `None` when `name` has no more labels than the base domain;
    /// that is the zone apex (or something shorter), not a probe.
    pub fn extract_token(&self, name: &str) -> Option<String> {
        let labels = split_labels(name);
        if labels.len() <= self.labels {
            return None;
        }
        let token = labels[..labels.len() - self.labels].join(".");
        Some(token.to_ascii_lowercase())
    }

    /// Extract the token from a DNS question name.
    ///
    /// Labels are taken from the wire form, so an escaped dot inside a
    /// label never counts as a separator.
    pub fn extract_name_token(&self, name: &Name) -> Option<String> {
        let labels: Vec<&[u8]> = name.iter().collect();
        if labels.len() <= self.labels {
            return None;
        }
        let token = labels[..labels.len() - self.labels]
            .iter()
            .map(|label| String::from_utf8_lossy(label))
            .collect::<Vec<_>>()
            .join(".");
        Some(token.to_ascii_lowercase())
    }

    /// Hostname a client should visit to probe with `token`.
    pub fn probe_host(&self, token: &str) -> String {
        format!("{}.{}", token, self.name)
    }
}

fn split_labels(name: &str) -> Vec<&str> {
    name.trim_end_matches('.')
        .split('.')
        .filter(|label| !label.is_empty())
        .collect()
}

/// Mint a fresh token from the operating system's CSPRNG.
pub fn generate_token() -> String {
    let mut entropy = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut entropy);
    encode_base32(&entropy)
}

/// Unpadded base-32 with [`TOKEN_ALPHABET`].
fn encode_base32(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1f;
            out.push(char::from(TOKEN_ALPHABET[index as usize]));
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(char::from(TOKEN_ALPHABET[index as usize]));
    }
    out
}

/// A pool of fresh tokens, kept topped up by a background producer.
///
/// Cloning is cheap; all clones draw from the same buffer.
#[derive(Debug, Clone)]
pub struct TokenPool {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl TokenPool {
    /// Start the producer task. It stops when `shutdown` is cancelled or
    /// every pool handle has been dropped.
    pub fn spawn(depth: usize, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));

        let handle = tokio::spawn(async move {
            loop {
                let token = generate_token();
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        debug!("token producer shutting down");
                        return;
                    }
                    sent = tx.send(token) => {
                        if sent.is_err() {
                            debug!("token pool dropped, producer exiting");
                            return;
                        }
                        metrics::record_token_generated();
                    }
                }
            }
        });

        (
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
            handle,
        )
    }

    /// Take the next token, waiting only if the buffer is empty.
    pub async fn next(&self) -> String {
        let received = self.rx.lock().await.recv().await;
        match received {
            Some(token) => token,
            None => {
                warn!("token producer gone, minting inline");
                generate_token()
            }
        }
    }
}
