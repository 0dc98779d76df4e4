mod integration_tests;
mod market_data;

use std::sync::Arc;

use sierra_bridge_api::{config::Config, feed::MarketDataService};
use tempfile::TempDir;

pub(crate) const SAMPLE_CONFIG: &str = r#"
[bridge]
host = "192.168.1.48"
port = 8765
timeout_ms = 5000
allowed_path_prefixes = ["C:/SierraChart/Data"]

[[symbols.roots]]
root = "NQ"
exchange = "CME"
months = ["H", "M", "U", "Z"]
tick_size = "0.25"
multiplier = "20"
expirations = ["2025-09-19", "2025-12-19", "2026-03-20", "2026-06-19"]
pre_roll_days = 10
priority = 1

[ingestor]
poll_interval_ms = 100
stale_threshold_s = 60

[store]
data_dir = "__DATA_DIR__"

[gapfiller]
lookback_days = 30
max_concurrent = 4
interval_s = 3600

[orders]
submit_timeout_ms = 10000
poll_interval_ms = 200

[market_hours]
timezone = "US/Central"
sessions = [
    { day = "Sun", open = "17:00:00", close = "16:00:00" },
    { day = "Mon", open = "17:00:00", close = "16:00:00" },
    { day = "Tue", open = "17:00:00", close = "16:00:00" },
    { day = "Wed", open = "17:00:00", close = "16:00:00" },
    { day = "Thu", open = "17:00:00", close = "16:00:00" },
]
"#;

/// A fully wired service backed by a temp-dir store and the sample
/// configuration. No bridge is contacted unless a test drives the
/// transport explicitly.
pub(crate) fn service_fixture() -> (TempDir, Arc<MarketDataService>) {
    let dir = TempDir::new().unwrap();
    let raw = SAMPLE_CONFIG.replace("__DATA_DIR__", &dir.path().display().to_string());
    let config = Config::from_toml(&raw).unwrap();
    let now = "2025-08-01T00:00:00Z".parse().unwrap();
    let service = Arc::new(MarketDataService::new(config, now).unwrap());
    (dir, service)
}
