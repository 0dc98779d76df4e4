//! Error taxonomy shared by every component.
//!
//! Low-level failures are wrapped exactly once with context (operation,
//! symbol, path) and returned across component boundaries as values. The
//! top-level caller decides whether to retry, log and continue, or surface.

use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or contradictory configuration. Fatal at startup, never
    /// produced at runtime.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A logical root was queried that the registry does not know.
    #[error("unknown symbol root: {0}")]
    UnknownRoot(String),

    /// Transport-level failure, including request deadline overrun. Retried
    /// with backoff inside the transport before it surfaces.
    #[error("network error during {operation}: {source}")]
    Network {
        operation: &'static str,
        #[source]
        source:    reqwest::Error,
    },

    /// Remote 404. The caller decides: gap repairs mark the gap
    /// unrepairable for a cooldown, everything else surfaces it.
    #[error("remote has no file at {path}")]
    NotFound { path: String },

    /// Remote 403, or a path that failed the local allow-list check and was
    /// never transmitted.
    #[error("path not permitted: {path}")]
    PermissionDenied { path: String },

    /// Unparseable text or binary payload. The decoded prefix is discarded.
    #[error("decode error for {symbol}: {detail}")]
    Decode { symbol: String, detail: String },

    /// Store I/O or integrity failure. The ingest path pauses the affected
    /// symbol until the next poll interval.
    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source:    rusqlite::Error,
    },

    #[error("store file error at {path}: {source}")]
    StorageIo {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `submit` was called with an order id that is still unresolved.
    #[error("order id already in flight: {0}")]
    DuplicateOrderId(String),

    /// The order failed its pre-transmission invariant check.
    #[error("order {order_id} refused: {reason}")]
    InvalidOrder { order_id: String, reason: String },

    /// A deadline elapsed. Orders surface this as a `Failed` terminal
    /// response; bridge calls surface it as `Network`.
    #[error("deadline exceeded during {operation}")]
    Timeout { operation: &'static str },

    /// A subscriber's bounded buffer overflowed and it was disconnected.
    #[error("subscriber lagged by {missed} messages and was disconnected")]
    Lagged { missed: u64 },
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self { Self::Configuration(msg.into()) }

    pub fn decode(symbol: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Decode {
            symbol: symbol.into(),
            detail: detail.into(),
        }
    }

    /// True for failures the transport retry loop may run again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}
