//! Statistics tracking for the decode pipeline.
//!
//! Counts what happens to every datagram on its way from the UDP socket to
//! the report endpoint or the aggregation engine, with breakdowns by
//! message kind and caller country and an SNR distribution.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::message::{EnrichedMessage, MessageKind};

/// FT8 SNR floor is around -24 dB; shift so every value is positive.
const SNR_OFFSET: i64 = 50;

/// Thread-safe statistics collector for the pipeline.
#[derive(Debug)]
pub struct PipelineStats {
    /// UDP datagrams received
    pub datagrams: AtomicU64,

    /// Bytes of UDP payload received
    pub bytes_received: AtomicU64,

    /// Datagrams that failed to decode as telegrams
    pub decode_errors: AtomicU64,

    /// Decode telegrams that were new and on air
    pub decodes_handled: AtomicU64,

    /// Decodes whose text failed classification
    pub classify_errors: AtomicU64,

    /// Messages handed to the delivery queue
    pub messages_queued: AtomicU64,

    /// Messages discarded because the queue was full
    pub messages_dropped: AtomicU64,

    /// Report batches delivered successfully
    pub batches_delivered: AtomicU64,

    /// Messages in delivered batches
    pub messages_delivered: AtomicU64,

    /// Report batches discarded after a failure
    pub batches_failed: AtomicU64,

    /// Messages aggregated by the server
    pub messages_ingested: AtomicU64,

    /// Histogram of SNR values, offset by `SNR_OFFSET`
    snr_histogram: RwLock<Histogram<u64>>,

    messages_by_kind: RwLock<HashMap<MessageKind, u64>>,

    /// Caller countries
    top_countries: RwLock<HashMap<String, u64>>,

    start_time: Instant,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            datagrams: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            decodes_handled: AtomicU64::new(0),
            classify_errors: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            messages_ingested: AtomicU64::new(0),
            // -50 to +50 dB after offset, 2 significant figures
            snr_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 2 * SNR_OFFSET as u64, 2)
                    .expect("Failed to create SNR histogram"),
            ),
            messages_by_kind: RwLock::new(HashMap::new()),
            top_countries: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record one received datagram.
    pub fn record_datagram(&self, bytes: usize) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_classify_error(&self) {
        self.classify_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a classified message.
    pub fn record_message(&self, message: &EnrichedMessage) {
        self.decodes_handled.fetch_add(1, Ordering::Relaxed);

        let snr = (i64::from(message.snr) + SNR_OFFSET).clamp(1, 2 * SNR_OFFSET - 1) as u64;
        if let Ok(mut hist) = self.snr_histogram.write() {
            let _ = hist.record(snr);
        }

        if let Ok(mut map) = self.messages_by_kind.write() {
            *map.entry(message.kind).or_insert(0) += 1;
        }

        if let Some(country) = &message.country
            && let Ok(mut map) = self.top_countries.write()
        {
            *map.entry(country.clone()).or_insert(0) += 1;
        }
    }

    pub fn record_queued(&self) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_delivered(&self, messages: u64) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        self.messages_delivered.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingested(&self, messages: u64) {
        self.messages_ingested.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Handled decodes per minute since start.
    pub fn decodes_per_minute(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.decodes_handled.load(Ordering::Relaxed) as f64 * 60.0 / elapsed
        } else {
            0.0
        }
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let snr_percentiles = self
            .snr_histogram
            .read()
            .ok()
            .filter(|h| !h.is_empty())
            .map(|h| {
                let real = |v: u64| v as i64 - SNR_OFFSET;
                SnrPercentiles {
                    p50: real(h.value_at_quantile(0.50)),
                    p90: real(h.value_at_quantile(0.90)),
                    p99: real(h.value_at_quantile(0.99)),
                    min: real(h.min()),
                    max: real(h.max()),
                    mean: h.mean() - SNR_OFFSET as f64,
                    count: h.len(),
                }
            });

        let messages_by_kind = self
            .messages_by_kind
            .read()
            .map(|m| m.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        // Get top 10 countries
        let top_countries = self
            .top_countries
            .read()
            .map(|m| {
                let mut vec: Vec<_> = m.iter().map(|(k, v)| (k.clone(), *v)).collect();
                vec.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                vec.truncate(10);
                vec
            })
            .unwrap_or_default();

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            decodes_handled: self.decodes_handled.load(Ordering::Relaxed),
            classify_errors: self.classify_errors.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            messages_ingested: self.messages_ingested.load(Ordering::Relaxed),
            decodes_per_minute: self.decodes_per_minute(),
            snr_percentiles,
            messages_by_kind,
            top_countries,
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// SNR percentiles in dB.
#[derive(Debug, Clone, Serialize)]
pub struct SnrPercentiles {
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub count: u64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub datagrams: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub decodes_handled: u64,
    pub classify_errors: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub batches_delivered: u64,
    pub messages_delivered: u64,
    pub batches_failed: u64,
    pub messages_ingested: u64,
    pub decodes_per_minute: f64,
    pub snr_percentiles: Option<SnrPercentiles>,
    pub messages_by_kind: HashMap<String, u64>,
    pub top_countries: Vec<(String, u64)>,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                 FT8 MONITOR STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(
            f,
            "Datagrams: {} ({} KB), decode errors: {}",
            self.datagrams,
            self.bytes_received / 1024,
            self.decode_errors
        )?;
        writeln!(
            f,
            "Decodes: {} ({:.1}/min), classify errors: {}",
            self.decodes_handled, self.decodes_per_minute, self.classify_errors
        )?;
        writeln!(
            f,
            "Queue: {} queued, {} dropped",
            self.messages_queued, self.messages_dropped
        )?;
        writeln!(
            f,
            "Reports: {} batches ({} messages) delivered, {} failed",
            self.batches_delivered, self.messages_delivered, self.batches_failed
        )?;
        if self.messages_ingested > 0 {
            writeln!(f, "Ingested: {}", self.messages_ingested)?;
        }
        writeln!(f)?;

        if let Some(ref p) = self.snr_percentiles {
            writeln!(f, "SNR Distribution (dB):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}, P99: {}", p.p50, p.p90, p.p99)?;
            writeln!(f)?;
        }

        if !self.messages_by_kind.is_empty() {
            writeln!(f, "Messages by Kind:")?;
            let mut kinds: Vec<_> = self.messages_by_kind.iter().collect();
            kinds.sort_by(|a, b| b.1.cmp(a.1));
            for (kind, count) in kinds {
                writeln!(f, "  {}: {}", kind, count)?;
            }
            writeln!(f)?;
        }

        if !self.top_countries.is_empty() {
            writeln!(f, "Top 10 Countries:")?;
            for (i, (country, count)) in self.top_countries.iter().enumerate() {
                writeln!(f, "  {}. {}: {}", i + 1, country, count)?;
            }
        }

        Ok(())
    }
}
