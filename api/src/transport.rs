//! HTTP client for the remote data/execution bridge.
//!
//! The bridge exposes file reads over the charting host's data directory,
//! a health endpoint and the order command/response pair. Every request is
//! checked against the configured path allow-list before it leaves the
//! process, carries a deadline, and is retried with jittered exponential
//! backoff on transport failures and 5xx responses.

use std::{sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
          time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{config::BridgeConfig,
            error::{Error, Result},
            TimeStamp};

const MAX_RETRIES: u32 = 5;
const FIRST_RETRY_DELAY: Duration = Duration::from_millis(100);
const RETRY_DELAY_CAP: Duration = Duration::from_secs(5);
/// Consecutive health failures before the transport reports degraded.
const DEGRADED_STREAK: u32 = 3;
const POOL_SIZE: usize = 16;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeHealth {
    pub status:           String,
    pub last_data_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirEntry {
    pub name:  String,
    pub size:  u64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct DirListing {
    entries: Vec<DirEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteAck {
    pub status:   String,
    pub order_id: String,
    #[serde(default)]
    pub message:  String,
}

/// A file read plus the freshness signal the remote attached to it.
#[derive(Debug, Clone)]
pub struct FileRead {
    pub body:          Vec<u8>,
    /// From the `Last-Modified` response header, when the bridge sets it.
    pub last_modified: Option<TimeStamp>,
}

#[derive(Debug)]
pub struct BridgeClient {
    http:            reqwest::Client,
    base_url:        String,
    allowed_prefixes: Vec<String>,
    timeout:         Duration,
    failure_streak:  AtomicU32,
    degraded:        AtomicBool,
    retries_total:   AtomicU64,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_SIZE)
            .tcp_nodelay(true)
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Network {
                operation: "client_build",
                source:    e,
            })?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            allowed_prefixes: config
                .allowed_path_prefixes
                .iter()
                .map(|p| normalize_path(p))
                .collect(),
            timeout: config.timeout(),
            failure_streak: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
            retries_total: AtomicU64::new(0),
        })
    }

    /// Reject a remote path before transmission unless it sits under an
    /// allow-listed prefix.
    pub fn validate_path(&self, path: &str) -> Result<()> {
        let normalized = normalize_path(path);
        if normalized.contains("..") {
            return Err(Error::PermissionDenied {
                path: path.to_string(),
            });
        }
        if self
            .allowed_prefixes
            .iter()
            .any(|prefix| normalized.starts_with(prefix.as_str()))
        {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                path: path.to_string(),
            })
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn read_text(&self, path: &str) -> Result<FileRead> {
        self.validate_path(path)?;
        let url = format!("{}/api/file/read", self.base_url);
        let response = self
            .request_with_retry("read_text", || {
                self.http.get(&url).query(&[("path", path)])
            })
            .await?;
        into_file_read(path, "read_text", response).await
    }

    /// Range-read of a binary file. `length == 0` reads to the end.
    #[instrument(level = "debug", skip(self))]
    pub async fn read_binary(&self, path: &str, offset: u64, length: u64) -> Result<FileRead> {
        self.validate_path(path)?;
        let url = format!("{}/api/file/read_binary", self.base_url);
        let offset_s = offset.to_string();
        let length_s = length.to_string();
        let response = self
            .request_with_retry("read_binary", || {
                self.http.get(&url).query(&[
                    ("path", path),
                    ("offset", offset_s.as_str()),
                    ("length", length_s.as_str()),
                ])
            })
            .await?;
        into_file_read(path, "read_binary", response).await
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.validate_path(path)?;
        let url = format!("{}/api/list", self.base_url);
        let response = self
            .request_with_retry("list_dir", || {
                self.http.get(&url).query(&[("path", path)])
            })
            .await?;
        let response = check_status(path, response)?;
        let listing: DirListing = response.json().await.map_err(|e| Error::Network {
            operation: "list_dir",
            source:    e,
        })?;
        Ok(listing.entries)
    }

    /// Submit an order command document. The bridge writes it to the
    /// command file the charting host watches.
    #[instrument(level = "debug", skip(self, body))]
    pub async fn submit_order(&self, body: &serde_json::Value) -> Result<ExecuteAck> {
        let url = format!("{}/api/trade/execute", self.base_url);
        // order submission is not idempotent; a single attempt only
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Network {
                operation: "submit_order",
                source:    e,
            })?;
        let response = check_status("trade_commands.json", response)?;
        response.json().await.map_err(|e| Error::Network {
            operation: "submit_order",
            source:    e,
        })
    }

    /// Poll for the response file of `order_id`. `Ok(None)` while the
    /// remote has not produced one yet.
    #[instrument(level = "debug", skip(self))]
    pub async fn order_status(&self, order_id: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/api/trade/status/{order_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network {
                operation: "order_status",
                source:    e,
            })?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(order_id, response)?;
        let body = response.bytes().await.map_err(|e| Error::Network {
            operation: "order_status",
            source:    e,
        })?;
        Ok(Some(body.to_vec()))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn health(&self) -> Result<BridgeHealth> {
        let url = format!("{}/health", self.base_url);
        let outcome = async {
            let response = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(3))
                .send()
                .await
                .map_err(|e| Error::Network {
                    operation: "health",
                    source:    e,
                })?;
            let response = check_status("health", response)?;
            response.json().await.map_err(|e| Error::Network {
                operation: "health",
                source:    e,
            })
        }
        .await;
        self.record_health(outcome.is_ok());
        outcome
    }

    /// Degraded state informs observability and retry heuristics only; it
    /// never blocks requests.
    pub fn is_degraded(&self) -> bool { self.degraded.load(Ordering::Relaxed) }

    pub fn retries_total(&self) -> u64 { self.retries_total.load(Ordering::Relaxed) }

    pub const fn request_timeout(&self) -> Duration { self.timeout }

    fn record_health(&self, ok: bool) {
        if ok {
            self.failure_streak.store(0, Ordering::Relaxed);
            if self.degraded.swap(false, Ordering::Relaxed) {
                debug!("bridge transport recovered");
            }
        } else {
            let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= DEGRADED_STREAK && !self.degraded.swap(true, Ordering::Relaxed) {
                warn!(streak, "bridge transport degraded");
            }
        }
    }

    async fn request_with_retry(
        &self,
        operation: &'static str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0u32;
        loop {
            let outcome = build().send().await;
            match outcome {
                Ok(response) if response.status().is_server_error() => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Ok(response);
                    }
                    debug!(operation, status = %response.status(), attempt, "retrying after 5xx");
                },
                Ok(response) => return Ok(response),
                Err(source) => {
                    if attempt + 1 >= MAX_RETRIES {
                        return Err(Error::Network { operation, source });
                    }
                    debug!(operation, error = %source, attempt, "retrying after network error");
                },
            }
            self.retries_total.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(backoff_delay(attempt)).await;
            attempt += 1;
        }
    }
}

/// Exponential backoff with ±20% jitter: 100ms, 200ms, ... capped at 5s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = FIRST_RETRY_DELAY
        .checked_mul(1 << attempt.min(16))
        .unwrap_or(RETRY_DELAY_CAP)
        .min(RETRY_DELAY_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(jitter)
}

fn check_status(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound {
            path: path.to_string(),
        }),
        reqwest::StatusCode::FORBIDDEN => Err(Error::PermissionDenied {
            path: path.to_string(),
        }),
        status if status.is_server_error() => {
            // retries exhausted; surface like any other transport failure
            let source = response.error_for_status().unwrap_err();
            Err(Error::Network {
                operation: "bridge",
                source,
            })
        },
        status if status.is_success() => Ok(response),
        status => Err(Error::decode(
            path,
            format!("unexpected bridge status {status}"),
        )),
    }
}

async fn into_file_read(
    path: &str,
    operation: &'static str,
    response: reqwest::Response,
) -> Result<FileRead> {
    let response = check_status(path, response)?;
    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let body = response.bytes().await.map_err(|e| Error::Network {
        operation,
        source: e,
    })?;
    Ok(FileRead {
        body: body.to_vec(),
        last_modified,
    })
}

/// Backslash-insensitive prefix comparison; the remote runs on Windows.
fn normalize_path(path: &str) -> String { path.replace('\\', "/") }

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Config;

    fn client() -> BridgeClient {
        let config = Config::from_toml(crate::config::tests::SAMPLE).unwrap();
        BridgeClient::new(&config.bridge).unwrap()
    }

    #[test]
    fn path_allow_list_is_enforced() {
        let client = client();
        assert!(client
            .validate_path("C:/SierraChart/Data/NQU25-CME.dly")
            .is_ok());
        assert!(client
            .validate_path("C:\\SierraChart\\Data\\NQU25-CME.scid")
            .is_ok());
        assert!(matches!(
            client.validate_path("C:/Windows/System32/config"),
            Err(Error::PermissionDenied { .. })
        ));
        assert!(matches!(
            client.validate_path("C:/SierraChart/Data/../../secrets"),
            Err(Error::PermissionDenied { .. })
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..32 {
            assert!(backoff_delay(0) >= Duration::from_millis(80));
            assert!(backoff_delay(0) <= Duration::from_millis(120));
            assert!(backoff_delay(4) >= Duration::from_millis(1_280));
            assert!(backoff_delay(20) <= Duration::from_secs(6));
        }
    }

    #[test]
    fn degraded_after_three_failures() {
        let client = client();
        assert!(!client.is_degraded());
        client.record_health(false);
        client.record_health(false);
        assert!(!client.is_degraded());
        client.record_health(false);
        assert!(client.is_degraded());
        client.record_health(true);
        assert!(!client.is_degraded());
    }

    #[test]
    fn health_payload_parses() {
        let raw = r#"{ "status": "healthy", "last_data_update": "2025-07-26T14:02:11Z" }"#;
        let health: BridgeHealth = serde_json::from_str(raw).unwrap();
        assert_eq!(health.status, "healthy");
        assert!(health.last_data_update.is_some());
    }

    #[test]
    fn dir_listing_parses() {
        let raw = r#"{ "entries": [ { "name": "NQU25-CME.scid", "size": 1048576, "mtime": 1722000000 } ] }"#;
        let listing: DirListing = serde_json::from_str(raw).unwrap();
        assert_eq!(listing.entries[0].name, "NQU25-CME.scid");
        assert_eq!(listing.entries[0].size, 1_048_576);
    }
}
