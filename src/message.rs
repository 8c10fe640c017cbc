//! The enriched message record produced for every qualifying decode.
//!
//! This is what flows from the UDP monitor through the delivery queue to the
//! aggregation engine, serialized as JSON on the way.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classify::{self, Classification};
use crate::cty::CountryTable;
use crate::telegram::Decode;

/// Protocol role of a decoded transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// General call
    Cq,
    /// "Who is calling me?"
    Qrz,
    /// Station identification
    De,
    /// One station answering another
    Reply,
    /// Free text, shorthand or unrecognized
    #[default]
    Unknown,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Cq,
        MessageKind::Qrz,
        MessageKind::De,
        MessageKind::Reply,
        MessageKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Cq => "CQ",
            MessageKind::Qrz => "QRZ",
            MessageKind::De => "DE",
            MessageKind::Reply => "REPLY",
            MessageKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded transmission with its classification and caller location.
///
/// # Example
///
/// A decode of `CQ WB9XYZ EN34` at -15 dB becomes:
/// - `kind`: MessageKind::Cq
/// - `caller`: "WB9XYZ"
/// - `country`: "United States", `cq_zone`: 5, `itu_zone`: 8
/// - `grid`: "EN34"
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnrichedMessage {
    /// Epoch seconds when the monitor received the decode.
    pub captured_at: i64,

    /// Message text exactly as decoded.
    pub raw: String,

    pub snr: i32,

    /// Time offset of the signal in seconds.
    pub delta_t: f64,

    /// Audio frequency offset in Hz.
    pub delta_f: u32,

    pub low_confidence: bool,

    pub kind: MessageKind,

    /// Sender callsign.
    #[serde(default)]
    pub caller: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub cq_zone: Option<u8>,
    #[serde(default)]
    pub itu_zone: Option<u8>,
    #[serde(default)]
    pub continent: Option<String>,
    /// Degrees, positive North.
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Degrees, positive West.
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Hours from UTC.
    #[serde(default)]
    pub utc_offset: Option<f64>,
    /// Sender's 4-character locator.
    #[serde(default)]
    pub grid: Option<String>,
    /// Callsign of the station being answered.
    #[serde(default)]
    pub peer: Option<String>,

    /// Why classification failed. Such messages must not be aggregated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnrichedMessage {
    /// Build the record for a decode received at `captured_at`.
    ///
    /// Classifier failures do not fail the call; they are recorded in
    /// `error`.
    pub fn from_decode(decode: &Decode, table: &CountryTable, captured_at: i64) -> Self {
        let raw = decode.message.clone().unwrap_or_default();
        let mut message = Self {
            captured_at,
            snr: decode.snr.unwrap_or_default(),
            delta_t: decode.delta_t.unwrap_or_default(),
            delta_f: decode.delta_f.unwrap_or_default(),
            low_confidence: decode.low_confidence.unwrap_or_default(),
            ..Self::default()
        };
        match classify::classify(&raw, table) {
            Ok(classification) => message.apply(classification),
            Err(e) => message.error = Some(e.to_string()),
        }
        message.raw = raw;
        message
    }

    fn apply(&mut self, c: Classification) {
        self.kind = c.kind;
        self.caller = c.caller;
        self.grid = c.grid;
        self.peer = c.peer;
        if let Some(info) = c.location {
            self.country = Some(info.country);
            self.cq_zone = Some(info.cq_zone);
            self.itu_zone = Some(info.itu_zone);
            self.continent = Some(info.continent);
            self.latitude = Some(info.latitude);
            self.longitude = Some(info.longitude);
            self.utc_offset = Some(info.utc_offset);
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Size of this message in bytes when serialized as JSON.
    pub fn json_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

impl fmt::Display for EnrichedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4} dB {:>5.1}s {:>5} Hz {:<7} {}", self.snr, self.delta_t, self.delta_f, self.kind, self.raw)?;
        if let Some(country) = &self.country {
            write!(f, " [{country}]")?;
        }
        Ok(())
    }
}
