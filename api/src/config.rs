//! Declarative configuration document.
//!
//! Everything the runtime consults lives in this single TOML document: the
//! bridge endpoint, the symbol table, poll cadences, store location, repair
//! policy and order timing. No symbol, host or port appears anywhere else.

use std::{collections::HashMap, path::{Path, PathBuf}, str::FromStr, time::Duration};

use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge:       BridgeConfig,
    pub symbols:      SymbolsConfig,
    #[serde(default)]
    pub ingestor:     IngestorConfig,
    pub store:        StoreConfig,
    #[serde(default)]
    pub gapfiller:    GapFillerConfig,
    #[serde(default)]
    pub orders:       OrdersConfig,
    #[serde(default)]
    pub logging:      LoggingConfig,
    pub market_hours: MarketHoursConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub host:                  String,
    pub port:                  u16,
    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms:            u64,
    /// Paths the client may request from the remote. Requests outside these
    /// prefixes are rejected before transmission.
    pub allowed_path_prefixes: Vec<String>,
}

impl BridgeConfig {
    pub fn base_url(&self) -> String { format!("http://{}:{}", self.host, self.port) }

    pub const fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SymbolsConfig {
    pub roots: Vec<RootConfig>,
}

/// One logical root in the registry table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RootConfig {
    pub root:          String,
    pub exchange:      String,
    /// Quarterly month codes this root trades, e.g. ["H","M","U","Z"].
    pub months:        Vec<String>,
    pub tick_size:     Decimal,
    pub multiplier:    Decimal,
    /// Expiration dates covering at least the next two years, ascending.
    pub expirations:   Vec<NaiveDate>,
    #[serde(default = "default_pre_roll_days")]
    pub pre_roll_days: u32,
    #[serde(default)]
    pub priority:      u32,
    /// Exchange holidays skipped by the business-day walk. Empty by default;
    /// no calendar is compiled in.
    #[serde(default)]
    pub holidays:      Vec<NaiveDate>,
    #[serde(default = "default_asset_class")]
    pub asset_class:   String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms:  u64,
    /// Per-root overrides of the poll cadence.
    #[serde(default)]
    pub per_symbol:        HashMap<String, u64>,
    #[serde(default = "default_stale_threshold_s")]
    pub stale_threshold_s: u64,
    #[serde(default = "default_fanout_buffer")]
    pub fanout_buffer:     usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms:  default_poll_interval_ms(),
            per_symbol:        HashMap::new(),
            stale_threshold_s: default_stale_threshold_s(),
            fanout_buffer:     default_fanout_buffer(),
        }
    }
}

impl IngestorConfig {
    pub fn poll_interval(&self, root: &str) -> Duration {
        let ms = self
            .per_symbol
            .get(root)
            .copied()
            .unwrap_or(self.poll_interval_ms)
            // cadence is specified in the 100ms..=1s band
            .clamp(100, 1_000);
        Duration::from_millis(ms)
    }

    pub const fn stale_threshold(&self) -> Duration { Duration::from_secs(self.stale_threshold_s) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_store_backend")]
    pub backend:  String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GapFillerConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days:  u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_gap_interval_s")]
    pub interval_s:     u64,
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s:     u64,
}

impl Default for GapFillerConfig {
    fn default() -> Self {
        Self {
            lookback_days:  default_lookback_days(),
            max_concurrent: default_max_concurrent(),
            interval_s:     default_gap_interval_s(),
            cooldown_s:     default_cooldown_s(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct OrdersConfig {
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_order_poll_ms")]
    pub poll_interval_ms:  u64,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: default_submit_timeout_ms(),
            poll_interval_ms:  default_order_poll_ms(),
        }
    }
}

impl OrdersConfig {
    pub const fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub const fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Weekly session table in the exchange time zone. Used for staleness
/// flagging and for the expected-coverage side of gap computation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarketHoursConfig {
    /// IANA zone name, e.g. "US/Central".
    pub timezone: String,
    pub sessions: Vec<SessionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Day the session opens, e.g. "Sun". A close at or before the open
    /// rolls into the following day.
    pub day:   String,
    pub open:  NaiveTime,
    pub close: NaiveTime,
}

impl MarketHoursConfig {
    pub fn tz(&self) -> Result<Tz> {
        Tz::from_str(&self.timezone)
            .map_err(|_| Error::configuration(format!("unknown timezone {}", self.timezone)))
    }

    pub fn weekdays(&self) -> Result<Vec<(Weekday, NaiveTime, NaiveTime)>> {
        self.sessions
            .iter()
            .map(|s| {
                let day = Weekday::from_str(&s.day).map_err(|_| {
                    Error::configuration(format!("unknown session day {:?}", s.day))
                })?;
                Ok((day, s.open, s.close))
            })
            .collect()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// All configuration errors are fatal at startup; nothing here is
    /// checked again at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.allowed_path_prefixes.is_empty() {
            return Err(Error::configuration("bridge.allowed_path_prefixes is empty"));
        }
        if self.symbols.roots.is_empty() {
            return Err(Error::configuration("symbols.roots is empty"));
        }
        for root in &self.symbols.roots {
            if root.tick_size <= Decimal::ZERO {
                return Err(Error::configuration(format!(
                    "{}: tick_size must be positive",
                    root.root
                )));
            }
            if root.expirations.is_empty() {
                return Err(Error::configuration(format!(
                    "{}: expirations is empty",
                    root.root
                )));
            }
            if root.expirations.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::configuration(format!(
                    "{}: expirations must be strictly ascending",
                    root.root
                )));
            }
            for month in &root.months {
                if !matches!(month.as_str(), "F" | "G" | "H" | "J" | "K" | "M" | "N" | "Q" | "U"
                    | "V" | "X" | "Z")
                {
                    return Err(Error::configuration(format!(
                        "{}: invalid month code {:?}",
                        root.root, month
                    )));
                }
            }
        }
        if self.store.backend != "sqlite" {
            return Err(Error::configuration(format!(
                "unsupported store backend {:?}",
                self.store.backend
            )));
        }
        self.market_hours.tz()?;
        self.market_hours.weekdays()?;
        if self.gapfiller.lookback_days == 0 || self.gapfiller.lookback_days > 730 {
            return Err(Error::configuration(
                "gapfiller.lookback_days must be in 1..=730",
            ));
        }
        if self.gapfiller.max_concurrent == 0 {
            return Err(Error::configuration("gapfiller.max_concurrent must be > 0"));
        }
        Ok(())
    }
}

const fn default_bridge_timeout_ms() -> u64 { 5_000 }
const fn default_pre_roll_days() -> u32 { 10 }
const fn default_poll_interval_ms() -> u64 { 100 }
const fn default_stale_threshold_s() -> u64 { 60 }
const fn default_fanout_buffer() -> usize { 1_024 }
const fn default_lookback_days() -> u32 { 30 }
const fn default_max_concurrent() -> usize { 4 }
const fn default_gap_interval_s() -> u64 { 3_600 }
const fn default_cooldown_s() -> u64 { 86_400 }
const fn default_submit_timeout_ms() -> u64 { 10_000 }
const fn default_order_poll_ms() -> u64 { 200 }
fn default_log_level() -> String { "info".to_string() }
fn default_store_backend() -> String { "sqlite".to_string() }
fn default_asset_class() -> String { "Future".to_string() }
