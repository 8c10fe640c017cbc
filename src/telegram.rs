//! WSJT-X UDP telegrams.
//!
//! Every telegram starts with a common header (magic, schema version, type
//! tag, client id) followed by the fields of its type, in declared order.
//! Type tags without a known layout decode to [`Body::Unknown`], exposing
//! just the header.
//!
//! # Example
//!
//! ```
//! use ft8mon::telegram::{Body, Decode, Telegram};
//!
//! let telegram = Telegram::new(Decode {
//!     is_new: Some(true),
//!     snr: Some(-12),
//!     message: Some("CQ WB9XYZ EN34".to_string()),
//!     ..Default::default()
//! });
//! let bytes = telegram.encode().unwrap();
//! let back = Telegram::decode(&bytes).unwrap();
//! assert!(matches!(back.body, Body::Decode(ref d) if d.snr == Some(-12)));
//! ```

use std::fmt;

use serde::Serialize;

use crate::wire::{CodecError, Color, DateTime, FieldReader, FieldWriter, WireField};

/// Fixed magic number opening every telegram.
pub const MAGIC: u32 = 0xADBC_CBDA;

/// Highest schema version this codec understands.
pub const SCHEMA_VERSION: u32 = 3;

/// Client id used when none is given.
pub const DEFAULT_CLIENT_ID: &str = "wsjt-server";

/// Common telegram header. The type tag lives in [`Body::type_tag`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Header {
    pub magic: u32,
    pub schema_version: u32,
    /// Sending application instance; `None` for a null string.
    pub client_id: Option<String>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            schema_version: SCHEMA_VERSION,
            client_id: Some(DEFAULT_CLIENT_ID.to_string()),
        }
    }
}

macro_rules! telegram_bodies {
    ($(
        $(#[$meta:meta])*
        $tag:literal => $name:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default, PartialEq, Serialize)]
            pub struct $name {
                $( $(#[$fmeta])* pub $field: Option<$ty>, )*
            }

            impl $name {
                /// Type tag carried in the telegram header.
                pub const TYPE_TAG: u32 = $tag;

                #[allow(unused_variables)]
                fn read_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
                    Ok(Self {
                        $( $field: <$ty as WireField>::read(r, stringify!($field))?, )*
                    })
                }

                #[allow(unused_variables)]
                fn write_fields(&self, w: &mut FieldWriter) -> Result<(), CodecError> {
                    $( <$ty as WireField>::write(self.$field.as_ref(), w, stringify!($field))?; )*
                    Ok(())
                }
            }

            impl From<$name> for Body {
                fn from(body: $name) -> Self {
                    Body::$name(body)
                }
            }
        )*

        /// Telegram payload, one variant per known type tag.
        #[derive(Debug, Clone, PartialEq, Serialize)]
        pub enum Body {
            $( $(#[$meta])* $name($name), )*
            /// A type tag with no known layout; only the header was read.
            Unknown(u32),
        }

        impl Body {
            pub fn type_tag(&self) -> u32 {
                match self {
                    $( Body::$name(_) => $tag, )*
                    Body::Unknown(tag) => *tag,
                }
            }

            /// Short name of the telegram type.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Body::$name(_) => stringify!($name), )*
                    Body::Unknown(_) => "Unknown",
                }
            }

            fn read(tag: u32, r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
                match tag {
                    $( $tag => $name::read_fields(r).map(Body::$name), )*
                    other => Ok(Body::Unknown(other)),
                }
            }

            fn write(&self, w: &mut FieldWriter) -> Result<(), CodecError> {
                match self {
                    $( Body::$name(body) => body.write_fields(w), )*
                    Body::Unknown(_) => Ok(()),
                }
            }
        }
    };
}

telegram_bodies! {
    /// Liveness ping, exchanged in both directions.
    0 => Heartbeat {
        max_schema: u32,
        version: String,
        revision: String,
    }

    /// Application state: dial frequency, mode, TX state and so on.
    1 => Status {
        /// Dial frequency in Hz.
        dial_freq: u64,
        mode: String,
        dx_call: String,
        report: String,
        tx_mode: String,
        tx_enabled: bool,
        xmitting: bool,
        decoding: bool,
        rx_df: u32,
        tx_df: u32,
        de_call: String,
        de_grid: String,
        dx_grid: String,
        tx_watchdog: bool,
        sub_mode: String,
        fast_mode: bool,
        special_op: u8,
        freq_tolerance: u32,
        tr_period: u32,
        config_name: String,
        tx_message: String,
    }

    /// One decoded over-the-air transmission.
    2 => Decode {
        is_new: bool,
        /// Milliseconds since midnight UTC.
        time: u32,
        snr: i32,
        delta_t: f64,
        delta_f: u32,
        mode: String,
        message: String,
        low_confidence: bool,
        off_air: bool,
    }

    /// Clear the band activity and/or Rx frequency windows.
    3 => Clear {
        /// Optional window selector; absent on older senders.
        window: u8,
    }

    /// Reply to a CQ/QRZ as if the operator double-clicked the decode.
    4 => Reply {
        time: u32,
        snr: i32,
        delta_t: f64,
        delta_f: u32,
        mode: String,
        message: String,
        low_confidence: bool,
        modifiers: u8,
    }

    /// A QSO was logged.
    5 => QsoLogged {
        time_off: DateTime,
        dx_call: String,
        dx_grid: String,
        tx_freq: u64,
        mode: String,
        report_sent: String,
        report_recv: String,
        tx_power: String,
        comments: String,
        name: String,
        time_on: DateTime,
        operator_call: String,
        my_call: String,
        my_grid: String,
        exchange_sent: String,
        exchange_recv: String,
        adif_propmode: String,
    }

    /// The application is shutting down.
    6 => Close {}

    /// Ask the application to resend all decodes.
    7 => Replay {}

    /// Stop transmitting.
    8 => HaltTx {
        auto_tx_only: bool,
    }

    /// Set the free text message, optionally sending it.
    9 => FreeText {
        text: String,
        send: bool,
    }

    /// One decoded WSPR spot.
    10 => WsprDecode {
        is_new: bool,
        time: u32,
        snr: i32,
        delta_t: f64,
        freq: u64,
        drift: i32,
        callsign: String,
        grid: String,
        power: i32,
        off_air: bool,
    }

    /// Set the station grid locator.
    11 => Location {
        location: String,
    }

    /// A QSO was logged, as an ADIF record.
    12 => LoggedAdif {
        adif_txt: String,
    }

    /// Highlight a callsign in the band activity window.
    13 => HighlightCall {
        callsign: String,
        bg_color: Color,
        fg_color: Color,
        highlight_last: bool,
    }

    /// Switch to the named configuration.
    14 => SwitchConfig {
        adif_txt: String,
    }

    /// Change mode and receiver settings.
    15 => Configure {
        mode: String,
        freq_tolerance: u32,
        sub_mode: String,
        fast_mode: bool,
        tr_period: u32,
        rx_df: u32,
        dx_call: String,
        dx_grid: String,
        gen_messages: bool,
    }
}

/// A decoded or to-be-encoded telegram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telegram {
    pub header: Header,
    pub body: Body,
}

impl Telegram {
    /// Wrap a body with the default header.
    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            header: Header::default(),
            body: body.into(),
        }
    }

    /// Heartbeat announcing this program to a WSJT-X instance.
    pub fn heartbeat(client_id: &str, version: &str) -> Self {
        Self {
            header: Header {
                client_id: Some(client_id.to_string()),
                ..Header::default()
            },
            body: Body::Heartbeat(Heartbeat {
                max_schema: Some(SCHEMA_VERSION),
                version: Some(version.to_string()),
                revision: Some(String::new()),
            }),
        }
    }

    pub fn type_tag(&self) -> u32 {
        self.body.type_tag()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        decode(bytes)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {}",
            self.body.name(),
            self.header.client_id.as_deref().unwrap_or("<null>")
        )?;
        if let Body::Decode(d) = &self.body {
            write!(
                f,
                ": {} dB '{}'",
                d.snr.unwrap_or_default(),
                d.message.as_deref().unwrap_or_default()
            )?;
        }
        Ok(())
    }
}

/// Decode one telegram.
///
/// Fields missing from the end of the buffer come back as `None`. Bytes
/// beyond the last known field are ignored.
pub fn decode(bytes: &[u8]) -> Result<Telegram, CodecError> {
    let mut r = FieldReader::new(bytes);

    let magic = u32::read(&mut r, "magic")?.ok_or(CodecError::MissingHeader("magic"))?;
    if magic != MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let schema_version =
        u32::read(&mut r, "schema_version")?.ok_or(CodecError::MissingHeader("schema_version"))?;
    if schema_version > SCHEMA_VERSION {
        return Err(CodecError::UnsupportedSchema(schema_version));
    }
    let tag = u32::read(&mut r, "type")?.ok_or(CodecError::MissingHeader("type"))?;
    let client_id = String::read(&mut r, "client_id")?;

    let body = Body::read(tag, &mut r)?;

    Ok(Telegram {
        header: Header {
            magic,
            schema_version,
            client_id,
        },
        body,
    })
}

/// Encode one telegram; the inverse of [`decode`].
pub fn encode(telegram: &Telegram) -> Result<Vec<u8>, CodecError> {
    let header = &telegram.header;
    if header.magic != MAGIC {
        return Err(CodecError::BadMagic(header.magic));
    }
    if header.schema_version > SCHEMA_VERSION {
        return Err(CodecError::UnsupportedSchema(header.schema_version));
    }

    let mut w = FieldWriter::new();
    u32::write(Some(&header.magic), &mut w, "magic")?;
    u32::write(Some(&header.schema_version), &mut w, "schema_version")?;
    u32::write(Some(&telegram.type_tag()), &mut w, "type")?;
    String::write(header.client_id.as_ref(), &mut w, "client_id")?;
    telegram.body.write(&mut w)?;
    Ok(w.into_bytes())
}
