//! Primitive field kinds of the WSJT-X UDP telegram format.
//!
//! Every multi-byte value is big-endian. Strings are a `u32` byte length
//! followed by UTF-8 bytes, with the length `0xFFFFFFFF` standing for a null
//! string (distinct from an empty one). Date-times and colors are packed Qt
//! structures.
//!
//! Newer WSJT-X releases only ever append fields to a telegram, so a reader
//! that runs out of bytes *before* a field starts yields `None` for that
//! field and every field after it. Running out of bytes *inside* a field is
//! a malformed telegram.

use chrono::{Datelike as _, NaiveDate, NaiveTime, TimeDelta, Timelike as _, Utc};
use nom::{
    IResult, Parser,
    bytes::complete::take,
    number::complete::{be_f64, be_i32, be_i64, be_u8, be_u16, be_u32, be_u64},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length value that encodes a null string.
pub const NULL_STRING: u32 = 0xFFFF_FFFF;

/// Errors raised while decoding or encoding telegrams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u32),

    #[error("telegram too short for header field '{0}'")]
    MissingHeader(&'static str),

    #[error("field '{field}' is truncated")]
    Truncated { field: &'static str },

    #[error("field '{field}' is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("string field '{field}' is too long to encode")]
    StringTooLong { field: &'static str },

    #[error("date-time field '{field}' has spec {spec} but offset present = {has_offset}")]
    DateTimeOffsetMismatch {
        field: &'static str,
        spec: u8,
        has_offset: bool,
    },

    #[error("field '{field}' has a value but earlier field '{missing}' is missing")]
    FieldAfterMissing {
        field: &'static str,
        missing: &'static str,
    },
}

/// Sequential, truncation-tolerant reader over a telegram buffer.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.buf.is_empty()
    }

    /// Read one fixed-width value, or `None` if the buffer is already empty.
    fn optional<T, P>(&mut self, field: &'static str, parse: P) -> Result<Option<T>, CodecError>
    where
        P: FnOnce(&'a [u8]) -> IResult<&'a [u8], T>,
    {
        if self.buf.is_empty() {
            return Ok(None);
        }
        self.required(field, parse).map(Some)
    }

    /// Read one fixed-width value that must be present.
    fn required<T, P>(&mut self, field: &'static str, parse: P) -> Result<T, CodecError>
    where
        P: FnOnce(&'a [u8]) -> IResult<&'a [u8], T>,
    {
        let (rest, value) = parse(self.buf).map_err(|_| CodecError::Truncated { field })?;
        self.buf = rest;
        Ok(value)
    }

    fn string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        let Some(len) = self.optional(field, be_u32)? else {
            return Ok(None);
        };
        if len == NULL_STRING {
            return Ok(None);
        }
        let bytes = self.required(field, |input| take(len as usize).parse(input))?;
        std::str::from_utf8(bytes)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| CodecError::InvalidUtf8 { field })
    }
}

/// Sequential writer that refuses to place a value after a missing one.
///
/// The wire format can only express absence by ending the telegram early,
/// so once a fixed-width field is `None` nothing else may follow it.
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: Vec<u8>,
    missing: Option<&'static str>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Append raw field bytes, or record the field as missing.
    pub fn put(&mut self, field: &'static str, bytes: Option<&[u8]>) -> Result<(), CodecError> {
        match (bytes, self.missing) {
            (Some(_), Some(missing)) => Err(CodecError::FieldAfterMissing { field, missing }),
            (Some(bytes), None) => {
                self.buf.extend_from_slice(bytes);
                Ok(())
            }
            (None, _) => {
                self.missing.get_or_insert(field);
                Ok(())
            }
        }
    }

    fn put_string(&mut self, field: &'static str, value: Option<&str>) -> Result<(), CodecError> {
        if let Some(missing) = self.missing {
            return match value {
                Some(_) => Err(CodecError::FieldAfterMissing { field, missing }),
                None => Ok(()),
            };
        }
        match value {
            None => self.buf.extend_from_slice(&NULL_STRING.to_be_bytes()),
            Some(s) => {
                let len = u32::try_from(s.len())
                    .ok()
                    .filter(|&len| len != NULL_STRING)
                    .ok_or(CodecError::StringTooLong { field })?;
                self.buf.extend_from_slice(&len.to_be_bytes());
                self.buf.extend_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }
}

/// A value that knows how to read and write itself as one telegram field.
pub trait WireField: Sized {
    fn read(r: &mut FieldReader<'_>, field: &'static str) -> Result<Option<Self>, CodecError>;

    fn write(value: Option<&Self>, w: &mut FieldWriter, field: &'static str)
    -> Result<(), CodecError>;
}

macro_rules! be_scalar_field {
    ($($ty:ty => $parse:ident),* $(,)?) => {$(
        impl WireField for $ty {
            fn read(r: &mut FieldReader<'_>, field: &'static str) -> Result<Option<Self>, CodecError> {
                r.optional(field, $parse)
            }

            fn write(
                value: Option<&Self>,
                w: &mut FieldWriter,
                field: &'static str,
            ) -> Result<(), CodecError> {
                let bytes = value.map(|v| v.to_be_bytes());
                w.put(field, bytes.as_ref().map(|b| &b[..]))
            }
        }
    )*};
}

be_scalar_field! {
    u8 => be_u8,
    u32 => be_u32,
    u64 => be_u64,
    i32 => be_i32,
    f64 => be_f64,
}

impl WireField for bool {
    fn read(r: &mut FieldReader<'_>, field: &'static str) -> Result<Option<Self>, CodecError> {
        Ok(r.optional(field, be_u8)?.map(|b| b != 0))
    }

    fn write(
        value: Option<&Self>,
        w: &mut FieldWriter,
        field: &'static str,
    ) -> Result<(), CodecError> {
        let byte = value.map(|&v| [u8::from(v)]);
        w.put(field, byte.as_ref().map(|b| &b[..]))
    }
}

impl WireField for String {
    fn read(r: &mut FieldReader<'_>, field: &'static str) -> Result<Option<Self>, CodecError> {
        r.string(field)
    }

    fn write(
        value: Option<&Self>,
        w: &mut FieldWriter,
        field: &'static str,
    ) -> Result<(), CodecError> {
        w.put_string(field, value.map(String::as_str))
    }
}

/// Julian day number of 0001-01-01 minus one, i.e. the offset between
/// Qt's Julian day and chrono's days-from-CE.
const JULIAN_DAY_CE_OFFSET: i64 = 1_721_425;

/// Packed `QDateTime`: Julian day, milliseconds since midnight, time spec and
/// (for [`DateTime::SPEC_OFFSET_FROM_UTC`] only) an offset in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateTime {
    pub julian_day: i64,
    pub msecs: u32,
    pub spec: u8,
    pub offset: Option<i32>,
}

impl DateTime {
    pub const SPEC_LOCAL: u8 = 0;
    pub const SPEC_UTC: u8 = 1;
    pub const SPEC_OFFSET_FROM_UTC: u8 = 2;
    pub const SPEC_TIME_ZONE: u8 = 3;

    /// Build a UTC date-time from a chrono timestamp.
    pub fn from_utc(at: chrono::DateTime<Utc>) -> Self {
        let naive = at.naive_utc();
        let day = i64::from(naive.date().num_days_from_ce()) + JULIAN_DAY_CE_OFFSET;
        let time = naive.time();
        let msecs = time.num_seconds_from_midnight() * 1000 + time.nanosecond() / 1_000_000;
        Self {
            julian_day: day,
            msecs,
            spec: Self::SPEC_UTC,
            offset: None,
        }
    }

    /// Convert to a UTC timestamp.
    ///
    /// Local-time and time-zone specs carry no zone on the wire and are taken
    /// as UTC. Returns `None` for out-of-range values.
    pub fn to_utc(&self) -> Option<chrono::DateTime<Utc>> {
        let days = i32::try_from(self.julian_day - JULIAN_DAY_CE_OFFSET).ok()?;
        let date = NaiveDate::from_num_days_from_ce_opt(days)?;
        let time = NaiveTime::from_num_seconds_from_midnight_opt(
            self.msecs / 1000,
            (self.msecs % 1000) * 1_000_000,
        )?;
        let local = date.and_time(time).and_utc();
        match self.offset {
            Some(offset) => local.checked_sub_signed(TimeDelta::seconds(i64::from(offset))),
            None => Some(local),
        }
    }

    fn check(&self, field: &'static str) -> Result<(), CodecError> {
        let wants_offset = self.spec == Self::SPEC_OFFSET_FROM_UTC;
        if wants_offset != self.offset.is_some() {
            return Err(CodecError::DateTimeOffsetMismatch {
                field,
                spec: self.spec,
                has_offset: self.offset.is_some(),
            });
        }
        Ok(())
    }
}

impl WireField for DateTime {
    fn read(r: &mut FieldReader<'_>, field: &'static str) -> Result<Option<Self>, CodecError> {
        let Some(julian_day) = r.optional(field, be_i64)? else {
            return Ok(None);
        };
        let msecs = r.required(field, be_u32)?;
        let spec = r.required(field, be_u8)?;
        let offset = if spec == Self::SPEC_OFFSET_FROM_UTC {
            Some(r.required(field, be_i32)?)
        } else {
            None
        };
        Ok(Some(Self {
            julian_day,
            msecs,
            spec,
            offset,
        }))
    }

    fn write(
        value: Option<&Self>,
        w: &mut FieldWriter,
        field: &'static str,
    ) -> Result<(), CodecError> {
        let Some(dt) = value else {
            return w.put(field, None);
        };
        dt.check(field)?;
        let mut bytes = Vec::with_capacity(17);
        bytes.extend_from_slice(&dt.julian_day.to_be_bytes());
        bytes.extend_from_slice(&dt.msecs.to_be_bytes());
        bytes.push(dt.spec);
        if let Some(offset) = dt.offset {
            bytes.extend_from_slice(&offset.to_be_bytes());
        }
        w.put(field, Some(&bytes))
    }
}

/// Packed `QColor`. Only RGB and invalid specs are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub spec: u8,
    pub alpha: u16,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

impl Color {
    pub const SPEC_INVALID: u8 = 0;
    pub const SPEC_RGB: u8 = 1;
    pub const MAX: u16 = 0xFFFF;

    pub const INVALID: Self = Self {
        spec: Self::SPEC_INVALID,
        alpha: Self::MAX,
        red: 0,
        green: 0,
        blue: 0,
    };
    pub const BLACK: Self = Self::rgb(0, 0, 0);
    pub const WHITE: Self = Self::rgb(Self::MAX, Self::MAX, Self::MAX);
    pub const RED: Self = Self::rgb(Self::MAX, 0, 0);
    pub const GREEN: Self = Self::rgb(0, Self::MAX, 0);
    pub const BLUE: Self = Self::rgb(0, 0, Self::MAX);
    pub const CYAN: Self = Self::rgb(0, Self::MAX, Self::MAX);
    pub const PINK: Self = Self::rgb(Self::MAX, 0, Self::MAX);
    pub const ORANGE: Self = Self::rgb(Self::MAX, 0xA0A0, 0);

    /// Fully opaque RGB color.
    pub const fn rgb(red: u16, green: u16, blue: u16) -> Self {
        Self {
            spec: Self::SPEC_RGB,
            alpha: Self::MAX,
            red,
            green,
            blue,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.spec != Self::SPEC_INVALID
    }
}

impl WireField for Color {
    fn read(r: &mut FieldReader<'_>, field: &'static str) -> Result<Option<Self>, CodecError> {
        let Some(spec) = r.optional(field, be_u8)? else {
            return Ok(None);
        };
        let alpha = r.required(field, be_u16)?;
        let red = r.required(field, be_u16)?;
        let green = r.required(field, be_u16)?;
        let blue = r.required(field, be_u16)?;
        // Trailing pad word, always zero.
        r.required(field, be_u16)?;
        Ok(Some(Self {
            spec,
            alpha,
            red,
            green,
            blue,
        }))
    }

    fn write(
        value: Option<&Self>,
        w: &mut FieldWriter,
        field: &'static str,
    ) -> Result<(), CodecError> {
        let bytes = value.map(|c| {
            let mut bytes = Vec::with_capacity(11);
            bytes.push(c.spec);
            for word in [c.alpha, c.red, c.green, c.blue, 0] {
                bytes.extend_from_slice(&word.to_be_bytes());
            }
            bytes
        });
        w.put(field, bytes.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write_one<T: WireField>(value: Option<&T>) -> Vec<u8> {
        let mut w = FieldWriter::new();
        T::write(value, &mut w, "f").unwrap();
        w.into_bytes()
    }

    fn read_one<T: WireField>(bytes: &[u8]) -> Result<Option<T>, CodecError> {
        let mut r = FieldReader::new(bytes);
        T::read(&mut r, "f")
    }

    #[test]
    fn test_string_encoding() {
        let s = "abcd".to_string();
        assert_eq!(write_one(Some(&s)), b"\x00\x00\x00\x04abcd");
        assert_eq!(read_one::<String>(b"\x00\x00\x00\x04abcd").unwrap(), Some(s));
    }

    #[test]
    fn test_null_string_differs_from_empty() {
        assert_eq!(write_one::<String>(None), b"\xff\xff\xff\xff");
        assert_eq!(write_one(Some(&String::new())), b"\x00\x00\x00\x00");
        assert_eq!(read_one::<String>(b"\xff\xff\xff\xff").unwrap(), None);
        assert_eq!(
            read_one::<String>(b"\x00\x00\x00\x00").unwrap(),
            Some(String::new())
        );
    }

    #[test]
    fn test_string_length_counts_bytes() {
        let s = "Sebastián".to_string();
        let bytes = write_one(Some(&s));
        assert_eq!(&bytes[..4], &10u32.to_be_bytes());
        assert_eq!(read_one::<String>(&bytes).unwrap(), Some(s));
    }

    #[test]
    fn test_exhausted_buffer_reads_none() {
        assert_eq!(read_one::<u32>(b"").unwrap(), None);
        assert_eq!(read_one::<String>(b"").unwrap(), None);
        assert_eq!(read_one::<DateTime>(b"").unwrap(), None);
        assert_eq!(read_one::<Color>(b"").unwrap(), None);
    }

    #[test]
    fn test_partial_field_is_truncated() {
        assert_eq!(
            read_one::<u32>(b"\x00\x01"),
            Err(CodecError::Truncated { field: "f" })
        );
        assert_eq!(
            read_one::<String>(b"\x00\x00\x00\x05ab"),
            Err(CodecError::Truncated { field: "f" })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(
            read_one::<String>(b"\x00\x00\x00\x02\xff\xfe"),
            Err(CodecError::InvalidUtf8 { field: "f" })
        );
    }

    #[test]
    fn test_value_after_missing_is_rejected() {
        let mut w = FieldWriter::new();
        u32::write(Some(&1), &mut w, "a").unwrap();
        u32::write(None, &mut w, "b").unwrap();
        String::write(None, &mut w, "c").unwrap();
        assert_eq!(
            u8::write(Some(&3), &mut w, "d"),
            Err(CodecError::FieldAfterMissing {
                field: "d",
                missing: "b"
            })
        );
        assert_eq!(w.into_bytes(), 1u32.to_be_bytes());
    }

    #[test]
    fn test_datetime_sizes() {
        let utc = DateTime {
            julian_day: 2_460_000,
            msecs: 1234,
            spec: DateTime::SPEC_UTC,
            offset: None,
        };
        assert_eq!(write_one(Some(&utc)).len(), 13);

        let offset = DateTime {
            spec: DateTime::SPEC_OFFSET_FROM_UTC,
            offset: Some(3600),
            ..utc
        };
        let bytes = write_one(Some(&offset));
        assert_eq!(bytes.len(), 17);
        assert_eq!(read_one::<DateTime>(&bytes).unwrap(), Some(offset));
    }

    #[test]
    fn test_datetime_offset_mismatch() {
        let bad = DateTime {
            julian_day: 2_460_000,
            msecs: 0,
            spec: DateTime::SPEC_UTC,
            offset: Some(60),
        };
        let mut w = FieldWriter::new();
        assert!(matches!(
            DateTime::write(Some(&bad), &mut w, "time_off"),
            Err(CodecError::DateTimeOffsetMismatch { spec: 1, .. })
        ));
    }

    #[test]
    fn test_datetime_chrono_conversion() {
        let epoch = DateTime {
            julian_day: 2_440_588,
            msecs: 0,
            spec: DateTime::SPEC_UTC,
            offset: None,
        };
        assert_eq!(epoch.to_utc(), Some(Utc.timestamp_opt(0, 0).unwrap()));

        let at = Utc.with_ymd_and_hms(2023, 6, 30, 12, 34, 56).unwrap();
        let dt = DateTime::from_utc(at);
        assert_eq!(dt.to_utc(), Some(at));

        let shifted = DateTime {
            spec: DateTime::SPEC_OFFSET_FROM_UTC,
            offset: Some(3600),
            ..dt
        };
        assert_eq!(shifted.to_utc(), Some(at - TimeDelta::hours(1)));
    }

    #[test]
    fn test_color_layout() {
        let bytes = write_one(Some(&Color::RED));
        assert_eq!(
            bytes,
            vec![1u8, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(read_one::<Color>(&bytes).unwrap(), Some(Color::RED));
        assert!(!Color::INVALID.is_valid());
    }
}
