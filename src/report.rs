//! Best-effort delivery of completed probes to the aggregator.
//!
//! HTTP handlers push a [`ReportEvent`] onto a bounded queue without ever
//! waiting; a fixed pool of workers drains it and POSTs each event once.
//! Failed events are logged and dropped, never re-queued.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReportConfig;
use crate::error::MapperError;
use crate::metrics::{self, ReportResult};

/// One completed probe, in the aggregator's wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEvent {
    /// Address the HTTP request came from.
    #[serde(rename = "ClientIP")]
    pub client_ip: String,
    /// Resolver address seen by the DNS responder.
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    /// EDNS0 client subnet, empty when none was sent.
    #[serde(rename = "EdnsNet")]
    pub edns_net: String,
    /// Service address of this probe server.
    #[serde(rename = "TestIP")]
    pub test_ip: String,
}

/// Producer side of the report queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReportQueue {
    tx: mpsc::Sender<ReportEvent>,
}

impl ReportQueue {
    /// A queue holding at most `capacity` events, and its consumer end.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ReportEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue `event` for delivery without waiting.
    ///
    /// Returns false when the event was dropped because the queue is full
    /// or the workers have stopped.
    pub fn enqueue(&self, event: ReportEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    client_ip = %event.client_ip,
                    server_ip = %event.server_ip,
                    "report queue full, dropping event"
                );
                metrics::record_report(ReportResult::Dropped);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("report workers stopped, dropping event");
                metrics::record_report(ReportResult::Dropped);
                false
            }
        }
    }
}

/// Where workers send events.
#[derive(Debug)]
enum Sink {
    /// No aggregator configured; events are drained and discarded.
    Disabled,
    Aggregator {
        client: reqwest::Client,
        url: String,
    },
}

impl Sink {
    fn from_config(config: &ReportConfig) -> Result<Self, MapperError> {
        let Some(url) = config.url() else {
            return Ok(Self::Disabled);
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self::Aggregator { client, url })
    }

    /// Deliver one event. Returns true when the worker should back off.
    async fn deliver(&self, event: &ReportEvent) -> bool {
        let (client, url) = match self {
            Self::Disabled => {
                metrics::record_report(ReportResult::Discarded);
                return false;
            }
            Self::Aggregator { client, url } => (client, url),
        };

        match client.post(url).json(event).send().await {
            Ok(response) if response.status().is_success() => {
                metrics::record_report(ReportResult::Sent);
                false
            }
            Ok(response) => {
                warn!(status = %response.status(), %url, "aggregator rejected report");
                metrics::record_report(ReportResult::Rejected);
                true
            }
            Err(e) => {
                warn!(error = %e, %url, "failed to post report");
                metrics::record_report(ReportResult::Failed);
                true
            }
        }
    }
}

/// The worker pool draining the report queue.
pub struct ReportPipeline;

impl ReportPipeline {
    /// Start `config.workers` workers on a queue of `config.queue_capacity()`.
    ///
    /// Workers stop when `shutdown` is cancelled or every [`ReportQueue`]
    /// handle is gone.
    pub fn spawn(
        config: &ReportConfig,
        shutdown: CancellationToken,
    ) -> Result<(ReportQueue, Vec<JoinHandle<()>>), MapperError> {
        let sink = Arc::new(Sink::from_config(config)?);
        match &*sink {
            Sink::Disabled => info!("no aggregator configured, reporting inactive"),
            Sink::Aggregator { url, .. } => {
                info!(%url, workers = config.workers, "reporting to aggregator")
            }
        }

        let (queue, rx) = ReportQueue::bounded(config.queue_capacity());
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    rx.clone(),
                    sink.clone(),
                    config.backoff(),
                    shutdown.clone(),
                ))
            })
            .collect();

        Ok((queue, handles))
    }
}

async fn worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<ReportEvent>>>,
    sink: Arc<Sink>,
    backoff: std::time::Duration,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(worker = id, "report worker shutting down");
                return;
            }
            event = async { rx.lock().await.recv().await } => match event {
                Some(event) => event,
                None => {
                    debug!(worker = id, "report queue closed");
                    return;
                }
            },
        };

        debug!(worker = id, ?event, "reporting");
        if sink.deliver(&event).await {
            tokio::time::sleep(backoff).await;
        }
    }
}
