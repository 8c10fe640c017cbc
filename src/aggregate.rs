//! Aggregation engine: folds batches of enriched messages into minute and
//! hour buckets through a [`BucketStore`].
//!
//! Every merge is a read-modify-write against the store. Batches for the
//! same (monitor, band) are serialized by a per-key lock so concurrent
//! callers cannot lose updates; different keys proceed in parallel. The
//! engine keeps no bucket state between calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::bucket::{HourBucket, MinuteBucket, hour_of, minute_of};
use crate::message::EnrichedMessage;
use crate::store::{BucketStore, StoreError};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("{op} failed for {monitor}/{band}: {source}")]
    Store {
        op: &'static str,
        monitor: String,
        band: String,
        #[source]
        source: StoreError,
    },

}

/// What one `ingest` call changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestOutcome {
    /// Messages with a caller that were aggregated.
    pub messages: usize,
    /// Minute buckets written.
    pub minutes: usize,
    /// Hour buckets written.
    pub hours: usize,
}

pub struct Aggregator {
    store: Arc<dyn BucketStore>,
    key_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self {
            store,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Aggregate a batch received now.
    pub fn ingest(
        &self,
        monitor: &str,
        band: &str,
        messages: Vec<EnrichedMessage>,
    ) -> Result<IngestOutcome, AggregateError> {
        self.ingest_at(monitor, band, messages, Utc::now().timestamp())
    }

    /// Aggregate a batch, using `now` (epoch seconds) for idle buckets.
    ///
    /// Messages without a caller are ignored. When nothing is left, an idle
    /// minute bucket for `now` and an idle hour bucket are written unless
    /// buckets already exist there.
    pub fn ingest_at(
        &self,
        monitor: &str,
        band: &str,
        messages: Vec<EnrichedMessage>,
        now: i64,
    ) -> Result<IngestOutcome, AggregateError> {
        let mut groups: BTreeMap<i64, Vec<EnrichedMessage>> = BTreeMap::new();
        for msg in messages.into_iter().filter(|m| m.caller.is_some()) {
            groups.entry(minute_of(msg.captured_at)).or_default().push(msg);
        }

        let lock = self.key_lock(monitor, band);
        let result = {
            // The guard protects no data, so a poisoned lock is still usable.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.merge_groups(monitor, band, groups, now)
        };
        drop(lock);
        self.release_key(monitor, band);
        result
    }

    fn merge_groups(
        &self,
        monitor: &str,
        band: &str,
        groups: BTreeMap<i64, Vec<EnrichedMessage>>,
        now: i64,
    ) -> Result<IngestOutcome, AggregateError> {
        let ctx = StoreCtx {
            store: self.store.as_ref(),
            monitor,
            band,
        };
        let mut outcome = IngestOutcome::default();

        if groups.is_empty() {
            let minute = minute_of(now);
            if ctx.read_minutes(minute, minute)?.is_empty() {
                ctx.upsert_minute(&MinuteBucket::idle(monitor, band, minute))?;
                outcome.minutes += 1;
            }
            let hour = hour_of(now);
            if ctx.read_hours(hour, hour)?.is_empty() {
                ctx.upsert_hour(&HourBucket::idle(monitor, band, hour))?;
                outcome.hours += 1;
            }
            debug!("{monitor}/{band}: idle batch at {minute}");
            return Ok(outcome);
        }

        let mut hour_deltas: BTreeMap<i64, HourBucket> = BTreeMap::new();
        for (minute, group) in groups {
            outcome.messages += group.len();
            let delta = MinuteBucket::from_group(monitor, band, minute, group);
            let hour = hour_of(minute);
            hour_deltas
                .entry(hour)
                .or_insert_with(|| HourBucket::idle(monitor, band, hour))
                .merge(&delta.hour_delta());

            let bucket = match ctx.read_minutes(minute, minute)?.into_iter().next() {
                Some(mut existing) => {
                    existing.merge(delta);
                    existing
                }
                None => delta,
            };
            ctx.upsert_minute(&bucket)?;
            outcome.minutes += 1;
        }

        for (hour, delta) in hour_deltas {
            let bucket = match ctx.read_hours(hour, hour)?.into_iter().next() {
                Some(mut existing) => {
                    existing.merge(&delta);
                    existing
                }
                None => delta,
            };
            ctx.upsert_hour(&bucket)?;
            outcome.hours += 1;
        }

        debug!(
            "{monitor}/{band}: aggregated {} messages into {} minutes, {} hours",
            outcome.messages, outcome.minutes, outcome.hours
        );
        Ok(outcome)
    }

    /// Minute buckets whose minute lies in `begin..=end`, both floored to
    /// the minute.
    pub fn fetch_minutes(
        &self,
        monitor: &str,
        band: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<MinuteBucket>, AggregateError> {
        let ctx = StoreCtx {
            store: self.store.as_ref(),
            monitor,
            band,
        };
        ctx.read_minutes(minute_of(begin), minute_of(end))
    }

    /// Hour buckets whose hour lies in `begin..=end`, both floored to the
    /// hour.
    pub fn fetch_hours(
        &self,
        monitor: &str,
        band: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<HourBucket>, AggregateError> {
        let ctx = StoreCtx {
            store: self.store.as_ref(),
            monitor,
            band,
        };
        ctx.read_hours(hour_of(begin), hour_of(end))
    }

    fn key_lock(&self, monitor: &str, band: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry((monitor.to_string(), band.to_string()))
            .or_default()
            .clone()
    }

    /// Forget the lock for a key once no caller holds it, so the table only
    /// holds keys with an ingest in flight.
    fn release_key(&self, monitor: &str, band: &str) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (monitor.to_string(), band.to_string());
        if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&key);
        }
    }
}

/// Store access for one (monitor, band) that tags errors with context.
struct StoreCtx<'a> {
    store: &'a dyn BucketStore,
    monitor: &'a str,
    band: &'a str,
}

impl StoreCtx<'_> {
    fn wrap(&self, op: &'static str) -> impl FnOnce(StoreError) -> AggregateError + '_ {
        move |source| AggregateError::Store {
            op,
            monitor: self.monitor.to_string(),
            band: self.band.to_string(),
            source,
        }
    }

    fn read_minutes(&self, begin: i64, end: i64) -> Result<Vec<MinuteBucket>, AggregateError> {
        self.store
            .read_minutes(self.monitor, self.band, begin, end)
            .map_err(self.wrap("read_minutes"))
    }

    fn upsert_minute(&self, bucket: &MinuteBucket) -> Result<(), AggregateError> {
        self.store
            .upsert_minute(bucket)
            .map_err(self.wrap("upsert_minute"))
    }

    fn read_hours(&self, begin: i64, end: i64) -> Result<Vec<HourBucket>, AggregateError> {
        self.store
            .read_hours(self.monitor, self.band, begin, end)
            .map_err(self.wrap("read_hours"))
    }

    fn upsert_hour(&self, bucket: &HourBucket) -> Result<(), AggregateError> {
        self.store
            .upsert_hour(bucket)
            .map_err(self.wrap("upsert_hour"))
    }
}
