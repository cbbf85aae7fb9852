//! Metrics instrumentation for dnsmapper.
//!
//! All metrics are prefixed with `dnsmapper.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record an answered DNS query.
pub fn record_query(record_type: &str, answer: AnswerKind, duration: std::time::Duration) {
    let answer_str = match answer {
        AnswerKind::Delegation => "delegation",
        AnswerKind::AcmeAlias => "acme_alias",
        AnswerKind::NoData => "nodata",
        AnswerKind::Probe => "probe",
        AnswerKind::DefaultHost => "default_host",
        AnswerKind::NxDomain => "nxdomain",
        AnswerKind::Refused => "refused",
        AnswerKind::Malformed => "malformed",
    };

    counter!("dnsmapper.dns.query.count", "type" => record_type.to_string(), "answer" => answer_str)
        .increment(1);
    histogram!("dnsmapper.dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// What kind of answer the responder produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    /// NS set for the zone apex.
    Delegation,
    /// CNAME for the ACME challenge label.
    AcmeAlias,
    /// Empty answer with SOA in authority.
    NoData,
    /// A record for a probe token.
    Probe,
    /// A record for the default landing host.
    DefaultHost,
    /// Name error with SOA in authority.
    NxDomain,
    /// Query outside the zone.
    Refused,
    /// Query with no question or an unsupported opcode.
    Malformed,
}

/// Record the outcome of a correlation cache insert.
pub fn record_cache_insert(stored: bool) {
    let result = if stored { "stored" } else { "rejected" };
    counter!("dnsmapper.cache.insert.count", "result" => result).increment(1);
}

/// Record the number of entries physically held by the cache.
pub fn record_cache_entries(entries: usize) {
    gauge!("dnsmapper.cache.entries").set(entries as f64);
}

/// Record a request to a correlation endpoint.
pub fn record_correlation(endpoint: &str, result: CorrelationResult) {
    let result_str = match result {
        CorrelationResult::Hit => "hit",
        CorrelationResult::Miss => "miss",
        CorrelationResult::DefaultHost => "default_host",
    };

    counter!("dnsmapper.http.correlation.count", "endpoint" => endpoint.to_string(), "result" => result_str)
        .increment(1);
}

/// Correlation endpoint results.
#[derive(Debug, Clone, Copy)]
pub enum CorrelationResult {
    /// Token found in the cache.
    Hit,
    /// Token unknown or expired; client redirected.
    Miss,
    /// Default host; client redirected.
    DefaultHost,
}

/// Record what happened to a report event.
pub fn record_report(result: ReportResult) {
    let result_str = match result {
        ReportResult::Sent => "sent",
        ReportResult::Rejected => "rejected",
        ReportResult::Failed => "failed",
        ReportResult::Dropped => "dropped",
        ReportResult::Discarded => "discarded",
    };

    counter!("dnsmapper.report.count", "result" => result_str).increment(1);
}

/// Report event outcomes.
#[derive(Debug, Clone, Copy)]
pub enum ReportResult {
    /// Aggregator answered 2xx.
    Sent,
    /// Aggregator answered with a non-2xx status.
    Rejected,
    /// Transport error or timeout.
    Failed,
    /// Queue full at enqueue time.
    Dropped,
    /// No aggregator configured.
    Discarded,
}

/// Record a freshly minted token entering the pool.
pub fn record_token_generated() {
    counter!("dnsmapper.token.generated.count").increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
