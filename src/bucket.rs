//! Minute and hour statistics buckets and their merge rules.
//!
//! A bucket is keyed by (monitor, band, window start). Buckets are merged on
//! upsert: totals add, mean SNR becomes the total-weighted mean of both
//! sides, and counter maps add key-wise.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::EnrichedMessage;

pub const MINUTE_SECS: i64 = 60;
pub const HOUR_SECS: i64 = 3600;

/// Start of the minute containing epoch second `t`.
pub fn minute_of(t: i64) -> i64 {
    align(t, MINUTE_SECS)
}

/// Start of the hour containing epoch second `t`.
pub fn hour_of(t: i64) -> i64 {
    align(t, HOUR_SECS)
}

/// Floor `t` to a multiple of `window`. Below the earliest representable
/// window start, `t` maps to that start instead.
fn align(t: i64, window: i64) -> i64 {
    let offset = t.rem_euclid(window);
    t.checked_sub(offset).unwrap_or(t + (window - offset))
}

/// Round to nearest, ties to even.
fn round_mean(sum: f64, count: u64) -> i32 {
    if count == 0 {
        return 0;
    }
    (sum / count as f64).round_ties_even() as i32
}

/// Weighted mean of two (mean, count) pairs, rounded.
pub fn weighted_mean(mean_a: i32, total_a: u64, mean_b: i32, total_b: u64) -> i32 {
    let sum = f64::from(mean_a) * total_a as f64 + f64::from(mean_b) * total_b as f64;
    round_mean(sum, total_a + total_b)
}

fn add_counts<K: Ord + Clone>(into: &mut BTreeMap<K, u64>, from: &BTreeMap<K, u64>) {
    for (key, n) in from {
        *into.entry(key.clone()).or_insert(0) += n;
    }
}

/// Statistics for one (monitor, band, minute).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MinuteBucket {
    pub monitor: String,
    pub band: String,
    /// Minute-aligned epoch seconds.
    pub minute: i64,
    /// Every message received in this minute, in arrival order.
    pub messages: Vec<EnrichedMessage>,
    pub total: u64,
    /// Mean SNR in dB.
    pub snr: i32,
    pub countries: BTreeMap<String, u64>,
    pub cq_zones: BTreeMap<u8, u64>,
    pub callers: BTreeMap<String, u64>,
}

impl MinuteBucket {
    /// An empty bucket: the monitor was alive but heard nothing.
    pub fn idle(monitor: &str, band: &str, minute: i64) -> Self {
        Self {
            monitor: monitor.to_string(),
            band: band.to_string(),
            minute,
            ..Self::default()
        }
    }

    /// Seed a bucket from one group of messages sharing a minute.
    pub fn from_group(monitor: &str, band: &str, minute: i64, messages: Vec<EnrichedMessage>) -> Self {
        let mut bucket = Self::idle(monitor, band, minute);
        let mut snr_sum = 0i64;
        for msg in &messages {
            snr_sum += i64::from(msg.snr);
            if let Some(caller) = &msg.caller {
                *bucket.callers.entry(caller.clone()).or_insert(0) += 1;
            }
            if let Some(country) = &msg.country {
                *bucket.countries.entry(country.clone()).or_insert(0) += 1;
            }
            if let Some(zone) = msg.cq_zone {
                *bucket.cq_zones.entry(zone).or_insert(0) += 1;
            }
        }
        bucket.total = messages.len() as u64;
        bucket.snr = round_mean(snr_sum as f64, bucket.total);
        bucket.messages = messages;
        bucket
    }

    /// Fold `other` (same key) into this bucket.
    pub fn merge(&mut self, other: MinuteBucket) {
        self.snr = weighted_mean(self.snr, self.total, other.snr, other.total);
        self.total += other.total;
        add_counts(&mut self.countries, &other.countries);
        add_counts(&mut self.cq_zones, &other.cq_zones);
        add_counts(&mut self.callers, &other.callers);
        self.messages.extend(other.messages);
    }

    pub fn is_idle(&self) -> bool {
        self.total == 0
    }

    /// This minute's contribution to its hour bucket.
    pub fn hour_delta(&self) -> HourBucket {
        HourBucket {
            monitor: self.monitor.clone(),
            band: self.band.clone(),
            hour: hour_of(self.minute),
            total: self.total,
            snr: self.snr,
            countries: self.countries.clone(),
            cq_zones: self.cq_zones.clone(),
        }
    }
}

/// Statistics for one (monitor, band, hour), maintained incrementally.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HourBucket {
    pub monitor: String,
    pub band: String,
    /// Hour-aligned epoch seconds.
    pub hour: i64,
    pub total: u64,
    pub snr: i32,
    pub countries: BTreeMap<String, u64>,
    pub cq_zones: BTreeMap<u8, u64>,
}

impl HourBucket {
    pub fn idle(monitor: &str, band: &str, hour: i64) -> Self {
        Self {
            monitor: monitor.to_string(),
            band: band.to_string(),
            hour,
            ..Self::default()
        }
    }

    /// Fold `other` (same key) into this bucket.
    pub fn merge(&mut self, other: &HourBucket) {
        self.snr = weighted_mean(self.snr, self.total, other.snr, other.total);
        self.total += other.total;
        add_counts(&mut self.countries, &other.countries);
        add_counts(&mut self.cq_zones, &other.cq_zones);
    }

    pub fn is_idle(&self) -> bool {
        self.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn msg(caller: &str, snr: i32, country: Option<&str>, zone: Option<u8>) -> EnrichedMessage {
        EnrichedMessage {
            captured_at: 120,
            raw: format!("CQ {caller}"),
            snr,
            kind: MessageKind::Cq,
            caller: Some(caller.to_string()),
            country: country.map(str::to_string),
            cq_zone: zone,
            ..Default::default()
        }
    }

    fn group(total: u64, snr: i32) -> MinuteBucket {
        MinuteBucket {
            monitor: "ft8mon".into(),
            band: "50.313".into(),
            minute: 120,
            total,
            snr,
            ..Default::default()
        }
    }

    #[test]
    fn test_alignment() {
        assert_eq!(minute_of(0), 0);
        assert_eq!(minute_of(119), 60);
        assert_eq!(minute_of(120), 120);
        assert_eq!(minute_of(-1), -60);
        assert_eq!(hour_of(7199), 3600);
        assert_eq!(hour_of(1_700_000_123), 1_699_999_200);
    }

    #[test]
    fn test_alignment_at_extremes() {
        for t in [i64::MIN, i64::MIN + 1, i64::MIN + 59, i64::MAX] {
            for (aligned, window) in [(minute_of(t), MINUTE_SECS), (hour_of(t), HOUR_SECS)] {
                assert_eq!(aligned.rem_euclid(window), 0, "{t}");
                assert!(aligned.abs_diff(t) < window as u64, "{t}");
            }
        }
        assert_eq!(minute_of(i64::MIN), i64::MIN + 8);
        assert_eq!(minute_of(i64::MAX), i64::MAX - 7);
        assert!(minute_of(i64::MIN) <= minute_of(i64::MIN + 60));
    }

    #[test]
    fn test_weighted_merge() {
        let mut bucket = group(3, 10);
        bucket.merge(group(2, 20));
        assert_eq!(bucket.total, 5);
        assert_eq!(bucket.snr, 14);
    }

    #[test]
    fn test_merge_into_idle() {
        let mut bucket = group(0, 0);
        bucket.merge(group(4, -12));
        assert_eq!(bucket.total, 4);
        assert_eq!(bucket.snr, -12);

        let mut both_idle = group(0, 0);
        both_idle.merge(group(0, 0));
        assert!(both_idle.is_idle());
        assert_eq!(both_idle.snr, 0);
    }

    #[test]
    fn test_mean_rounds_half_to_even() {
        assert_eq!(weighted_mean(-5, 1, -6, 1), -6);
        assert_eq!(weighted_mean(-5, 1, -4, 1), -4);
        assert_eq!(weighted_mean(1, 1, 2, 1), 2);
        assert_eq!(weighted_mean(2, 1, 3, 1), 2);
    }

    #[test]
    fn test_from_group() {
        let bucket = MinuteBucket::from_group(
            "ft8mon",
            "50.313",
            120,
            vec![
                msg("WB9XYZ", -5, Some("United States"), Some(5)),
                msg("WB9XYZ", -15, Some("United States"), Some(5)),
                msg("ZS6ABC", -7, None, None),
            ],
        );
        assert_eq!(bucket.total, 3);
        assert_eq!(bucket.snr, -9);
        assert_eq!(bucket.callers["WB9XYZ"], 2);
        assert_eq!(bucket.callers["ZS6ABC"], 1);
        assert_eq!(bucket.countries.len(), 1);
        assert_eq!(bucket.countries["United States"], 2);
        assert_eq!(bucket.cq_zones[&5], 2);
        assert_eq!(bucket.messages.len(), 3);
    }

    #[test]
    fn test_counter_maps_add() {
        let mut a = MinuteBucket::from_group("m", "b", 0, vec![msg("K1A", 0, Some("United States"), Some(5))]);
        let b = MinuteBucket::from_group(
            "m",
            "b",
            0,
            vec![
                msg("K1A", 0, Some("United States"), Some(5)),
                msg("OE1ABC", 0, Some("Austria"), Some(15)),
            ],
        );
        a.merge(b);
        assert_eq!(a.callers["K1A"], 2);
        assert_eq!(a.countries["United States"], 2);
        assert_eq!(a.countries["Austria"], 1);
        assert_eq!(a.cq_zones[&15], 1);
        assert_eq!(a.messages.len(), 3);

        let mut hour = HourBucket::idle("m", "b", 0);
        hour.merge(&a.hour_delta());
        hour.merge(&a.hour_delta());
        assert_eq!(hour.total, 6);
        assert_eq!(hour.countries["United States"], 4);
    }

    #[test]
    fn test_json_roundtrip_keeps_zone_keys() {
        let bucket = MinuteBucket::from_group("m", "b", 60, vec![msg("K1A", -3, Some("United States"), Some(5))]);
        let json = serde_json::to_string(&bucket).unwrap();
        assert!(json.contains(r#""cq_zones":{"5":1}"#));
        let back: MinuteBucket = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bucket);
    }
}
