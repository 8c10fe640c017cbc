//! Persistence port for aggregation buckets.
//!
//! The aggregation engine only talks to [`BucketStore`]; durable backends
//! live outside this crate. [`MemoryStore`] backs the HTTP server and the
//! tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::bucket::{HourBucket, MinuteBucket};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,

    #[error("backend error: {0}")]
    Backend(String),
}

/// Read/write contract for minute and hour buckets.
///
/// `upsert_*` replaces any bucket with the same (monitor, band, window)
/// key. `read_*` returns the buckets whose window start lies in
/// `begin..=end`, ordered by window start.
pub trait BucketStore: Send + Sync {
    fn upsert_minute(&self, bucket: &MinuteBucket) -> Result<(), StoreError>;

    fn read_minutes(
        &self,
        monitor: &str,
        band: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<MinuteBucket>, StoreError>;

    fn upsert_hour(&self, bucket: &HourBucket) -> Result<(), StoreError>;

    fn read_hours(
        &self,
        monitor: &str,
        band: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<HourBucket>, StoreError>;
}

type Key = (String, String, i64);

/// In-process store keyed by (monitor, band, window start).
#[derive(Debug, Default)]
pub struct MemoryStore {
    minutes: RwLock<BTreeMap<Key, MinuteBucket>>,
    hours: RwLock<BTreeMap<Key, HourBucket>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of minute buckets held.
    pub fn minute_count(&self) -> usize {
        self.minutes.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Number of hour buckets held.
    pub fn hour_count(&self) -> usize {
        self.hours.read().map(|h| h.len()).unwrap_or(0)
    }
}

fn range_of<V: Clone>(
    map: &BTreeMap<Key, V>,
    monitor: &str,
    band: &str,
    begin: i64,
    end: i64,
) -> Vec<V> {
    if begin > end {
        return Vec::new();
    }
    let lo = (monitor.to_string(), band.to_string(), begin);
    let hi = (monitor.to_string(), band.to_string(), end);
    map.range(lo..=hi).map(|(_, v)| v.clone()).collect()
}

impl BucketStore for MemoryStore {
    fn upsert_minute(&self, bucket: &MinuteBucket) -> Result<(), StoreError> {
        let key = (bucket.monitor.clone(), bucket.band.clone(), bucket.minute);
        let mut minutes = self.minutes.write().map_err(|_| StoreError::Poisoned)?;
        minutes.insert(key, bucket.clone());
        Ok(())
    }

    fn read_minutes(
        &self,
        monitor: &str,
        band: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<MinuteBucket>, StoreError> {
        let minutes = self.minutes.read().map_err(|_| StoreError::Poisoned)?;
        Ok(range_of(&minutes, monitor, band, begin, end))
    }

    fn upsert_hour(&self, bucket: &HourBucket) -> Result<(), StoreError> {
        let key = (bucket.monitor.clone(), bucket.band.clone(), bucket.hour);
        let mut hours = self.hours.write().map_err(|_| StoreError::Poisoned)?;
        hours.insert(key, bucket.clone());
        Ok(())
    }

    fn read_hours(
        &self,
        monitor: &str,
        band: &str,
        begin: i64,
        end: i64,
    ) -> Result<Vec<HourBucket>, StoreError> {
        let hours = self.hours.read().map_err(|_| StoreError::Poisoned)?;
        Ok(range_of(&hours, monitor, band, begin, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces() {
        let store = MemoryStore::new();
        let mut bucket = MinuteBucket::idle("ft8mon", "50.313", 60);
        store.upsert_minute(&bucket).unwrap();
        bucket.total = 3;
        store.upsert_minute(&bucket).unwrap();

        let read = store.read_minutes("ft8mon", "50.313", 60, 60).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].total, 3);
        assert_eq!(store.minute_count(), 1);
    }

    #[test]
    fn test_range_is_inclusive_and_keyed() {
        let store = MemoryStore::new();
        for minute in [0, 60, 120, 180] {
            store
                .upsert_minute(&MinuteBucket::idle("ft8mon", "50.313", minute))
                .unwrap();
        }
        store
            .upsert_minute(&MinuteBucket::idle("ft8mon", "14.074", 60))
            .unwrap();
        store
            .upsert_minute(&MinuteBucket::idle("other", "50.313", 60))
            .unwrap();

        let read = store.read_minutes("ft8mon", "50.313", 60, 120).unwrap();
        let minutes: Vec<i64> = read.iter().map(|b| b.minute).collect();
        assert_eq!(minutes, [60, 120]);

        assert!(store.read_minutes("ft8mon", "50.313", 120, 60).unwrap().is_empty());
        assert!(store.read_minutes("nobody", "50.313", 0, 180).unwrap().is_empty());
    }

    #[test]
    fn test_hours() {
        let store = MemoryStore::new();
        store.upsert_hour(&HourBucket::idle("m", "b", 3600)).unwrap();
        store.upsert_hour(&HourBucket::idle("m", "b", 7200)).unwrap();
        assert_eq!(store.read_hours("m", "b", 0, 3600).unwrap().len(), 1);
        assert_eq!(store.read_hours("m", "b", 0, 7200).unwrap().len(), 2);
        assert_eq!(store.hour_count(), 2);
    }
}
