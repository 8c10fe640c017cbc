//! ft8mon - FT8 activity monitoring for WSJT-X.
//!
//! This crate provides:
//! - A codec for the WSJT-X UDP telegram protocol
//! - A cty.dat country/zone resolver and an FT8 message classifier
//! - A UDP monitor that enriches decodes and reports them in batches
//! - Minute/hour aggregation behind a pluggable bucket store
//! - An HTTP API for report ingestion and bucket queries
//!
//! # Example
//!
//! ```rust,no_run
//! use ft8mon::{classify::classify, cty::CountryTable};
//!
//! let table = CountryTable::load("cty.dat").expect("Failed to load cty.dat");
//! let result = classify("CQ DX W1AW FN31", &table).expect("Failed to classify");
//!
//! println!("{:?} from {:?}", result.kind, result.caller);
//! ```

pub mod aggregate;
pub mod bucket;
pub mod classify;
pub mod config;
pub mod cty;
pub mod delivery;
pub mod message;
pub mod metrics;
pub mod monitor;
pub mod server;
pub mod stats;
pub mod store;
pub mod telegram;
pub mod wire;

pub use aggregate::{AggregateError, Aggregator, IngestOutcome};
pub use bucket::{HourBucket, MinuteBucket};
pub use classify::{Classification, ClassifyError, classify};
pub use config::{Config, MonitorSettings, ServerSettings};
pub use cty::{CountryInfo, CountryTable, CtyError};
pub use delivery::{DeliveryError, OverflowPolicy, Reporter, message_queue};
pub use message::{EnrichedMessage, MessageKind};
pub use monitor::{Monitor, MonitorConfig};
pub use server::AppState;
pub use stats::{PipelineStats, StatsSummary};
pub use store::{BucketStore, MemoryStore, StoreError};
pub use telegram::{Body, Header, Telegram};
pub use wire::CodecError;
