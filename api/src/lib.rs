#![warn(
    // missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::upper_case_acronyms)]

use chrono::{DateTime, Utc};

pub mod bars;
pub mod config;
pub mod decode;
pub mod error;
pub mod feed;
pub mod gapfill;
pub mod orders;
pub mod scheduler;
mod shutdown;
pub mod snapshot;
pub mod store;
pub mod symbols;
pub mod ticker;
pub mod transport;

pub use error::{Error, Result};
pub use shutdown::{Shutdown, ShutdownHandle};

/// Wall-clock timestamp used for market data and rollover computation.
///
/// Deadlines and health intervals use the monotonic clock
/// (`tokio::time::Instant`); the two are never mixed.
pub type TimeStamp = DateTime<Utc>;

/// Microseconds since the Unix epoch.
pub type TimestampUs = i64;

/// Producer-assigned tick sequence number. Wraps at 2^16.
pub type SequenceNo = u16;

/// Main value type for streamed market data.
///
/// Instrument metadata (tick size, multiplier) and order prices stay
/// `rust_decimal::Decimal`; streamed prices are `f64` like the wire formats
/// that carry them.
pub type MarketDataValueType = f64;

pub mod prelude {
    #[doc(hidden)]
    pub use crate::{bars::*,
                    config::*,
                    decode::{daily::*, intraday::*, DecodeWarning},
                    error::{Error, Result},
                    feed::*,
                    gapfill::*,
                    orders::*,
                    scheduler::*,
                    snapshot::*,
                    store::{coverage::*, *},
                    symbols::*,
                    ticker::*,
                    transport::*,
                    MarketDataValueType,
                    SequenceNo,
                    TimeStamp,
                    TimestampUs};
}
