//! Hand-off from the UDP monitor to the report endpoint.
//!
//! The monitor pushes enriched messages into a bounded queue; a [`Reporter`]
//! drains it on a fixed period and POSTs each batch as a JSON array. What
//! happens when the queue is full is an explicit [`OverflowPolicy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::{Client, Url, header::CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::message::EnrichedMessage;
use crate::stats::PipelineStats;

/// Default period between report POSTs.
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(30);

/// Default queue capacity in messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("message queue closed")]
    QueueClosed,

    #[error("invalid report URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("report endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// What to do with a new message when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for the reporter to make room.
    #[default]
    Block,
    /// Discard the incoming message and count it.
    DropNewest,
}

/// Result of offering one message to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    Dropped,
}

/// Create a bounded single-producer queue of enriched messages.
pub fn message_queue(capacity: usize, policy: OverflowPolicy) -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = MessageSender {
        tx,
        policy,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, MessageReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<EnrichedMessage>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl MessageSender {
    pub async fn send(&self, message: EnrichedMessage) -> Result<Enqueued, DeliveryError> {
        match self.policy {
            OverflowPolicy::Block => {
                self.tx
                    .send(message)
                    .await
                    .map_err(|_| DeliveryError::QueueClosed)?;
                Ok(Enqueued::Queued)
            }
            OverflowPolicy::DropNewest => match self.tx.try_send(message) {
                Ok(()) => Ok(Enqueued::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(Enqueued::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::QueueClosed),
            },
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Messages discarded so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::Receiver<EnrichedMessage>,
}

impl MessageReceiver {
    /// Wait for the next message; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<EnrichedMessage> {
        self.rx.recv().await
    }

    /// Take everything currently queued without waiting.
    pub fn drain(&mut self) -> Vec<EnrichedMessage> {
        let mut batch = Vec::with_capacity(self.rx.len());
        while let Ok(message) = self.rx.try_recv() {
            batch.push(message);
        }
        batch
    }
}

/// Check a report URL: http(s) with `id` and `band` query parameters.
pub fn parse_report_url(url: &str) -> Result<Url, DeliveryError> {
    let invalid = |reason: &str| DeliveryError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    for required in ["id", "band"] {
        if !parsed.query_pairs().any(|(k, v)| k == required && !v.is_empty()) {
            return Err(invalid(&format!("missing '{required}' query parameter")));
        }
    }
    Ok(parsed)
}

/// Periodically POSTs queued messages to the report endpoint.
///
/// Failed batches are logged and discarded; there is no retry.
pub struct Reporter {
    client: Client,
    url: Url,
    interval: Duration,
    stats: Arc<PipelineStats>,
}

impl Reporter {
    pub fn new(url: &str, interval: Duration, stats: Arc<PipelineStats>) -> Result<Self, DeliveryError> {
        let url = parse_report_url(url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url,
            interval,
            stats,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST one batch. An empty batch is still sent: it tells the server
    /// the monitor is alive.
    pub async fn post_batch(&self, batch: &[EnrichedMessage]) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(batch)?;
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Drain and deliver every `interval` until shutdown, then flush what
    /// is left.
    pub async fn run(self, mut queue: MessageReceiver, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        info!("Reporting to {} every {}s", self.url, self.interval.as_secs());

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let batch = queue.drain();
                    self.deliver(&batch).await;
                }
            }
        }

        let batch = queue.drain();
        if !batch.is_empty() {
            info!("Flushing {} queued messages", batch.len());
            self.deliver(&batch).await;
        }
    }

    async fn deliver(&self, batch: &[EnrichedMessage]) {
        match self.post_batch(batch).await {
            Ok(()) => {
                debug!("Delivered batch of {} messages", batch.len());
                self.stats.record_batch_delivered(batch.len() as u64);
            }
            Err(e) => {
                warn!("Dropping batch of {} messages: {}", batch.len(), e);
                self.stats.record_batch_failed();
            }
        }
    }
}
