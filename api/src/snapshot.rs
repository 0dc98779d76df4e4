//! Tick snapshot ingestion.
//!
//! The remote study atomically renames a per-symbol JSON snapshot into the
//! charting host's data directory; this module polls those files through
//! the bridge, deduplicates by producer sequence and fans accepted ticks
//! out to the store and the live subscribers.

use std::{collections::{BTreeMap, HashMap, HashSet},
          str::FromStr,
          sync::{atomic::{AtomicU64, Ordering},
                 Arc},
          time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, instrument, warn};

use crate::{config::IngestorConfig,
            error::{Error, Result},
            feed::FeedEvent,
            store::TickStore,
            symbols::{Contract, ContractId},
            ticker::{sequence_step, SequenceStep, Side, Tick},
            transport::BridgeClient,
            TimeStamp};

/// One per-symbol JSON snapshot as the producer writes it. Unknown fields
/// survive only when their key starts with `x_`; everything else unknown is
/// dropped with a warning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotFrame {
    pub symbol:       String,
    pub timestamp_us: i64,
    pub price:        f64,
    #[serde(default)]
    pub volume:       u32,
    #[serde(default)]
    pub bid:          f64,
    #[serde(default)]
    pub ask:          f64,
    #[serde(default)]
    pub bid_size:     u32,
    #[serde(default)]
    pub ask_size:     u32,
    #[serde(default)]
    pub last_size:    u32,
    #[serde(default)]
    pub side:         String,
    #[serde(default)]
    pub sequence:     u16,
    #[serde(default)]
    pub vwap:         f64,
    #[serde(default)]
    pub total_volume: u64,
    #[serde(default)]
    pub trade_count:  u64,
    #[serde(default)]
    pub precision:    String,
    #[serde(default)]
    pub source:       String,
    #[serde(flatten)]
    pub extra:        BTreeMap<String, serde_json::Value>,
}

impl SnapshotFrame {
    pub fn from_json(symbol: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::decode(symbol, e.to_string()))
    }

    /// Drop unknown fields that are not `x_`-prefixed; returns the dropped
    /// keys so the caller can warn once.
    pub fn sanitize(&mut self) -> Vec<String> {
        let dropped: Vec<String> = self
            .extra
            .keys()
            .filter(|k| !k.starts_with("x_"))
            .cloned()
            .collect();
        for key in &dropped {
            self.extra.remove(key);
        }
        dropped
    }

    pub fn into_tick(self) -> Result<Tick> {
        let symbol = ContractId::from_str(&self.symbol)?;
        let size = if self.last_size > 0 {
            self.last_size
        } else {
            self.volume
        };
        Ok(Tick {
            symbol,
            timestamp_us: self.timestamp_us,
            price: self.price,
            size,
            bid: self.bid,
            ask: self.ask,
            bid_size: self.bid_size,
            ask_size: self.ask_size,
            side: Side::from_str(&self.side)?,
            sequence: self.sequence,
            vwap: self.vwap,
            total_volume: self.total_volume,
            trade_count: self.trade_count,
        })
    }
}

/// Observable drop counters. Nothing is silently swallowed.
#[derive(Debug, Default)]
pub struct IngestCounters {
    pub accepted:      AtomicU64,
    pub duplicates:    AtomicU64,
    pub out_of_order:  AtomicU64,
    pub decode_errors: AtomicU64,
    pub stale_events:  AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCountersSnapshot {
    pub accepted:      u64,
    pub duplicates:    u64,
    pub out_of_order:  u64,
    pub decode_errors: u64,
    pub stale_events:  u64,
}

impl IngestCounters {
    pub fn snapshot(&self) -> IngestCountersSnapshot {
        IngestCountersSnapshot {
            accepted:      self.accepted.load(Ordering::Relaxed),
            duplicates:    self.duplicates.load(Ordering::Relaxed),
            out_of_order:  self.out_of_order.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            stale_events:  self.stale_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct SymbolState {
    last_sequence:    Option<u16>,
    last_mtime:       Option<TimeStamp>,
    last_accepted_at: Option<Instant>,
    stale_flagged:    bool,
}

/// Per-symbol snapshot poller and deduplicator. Owns the deduplication
/// state of each in-flight producer session.
pub struct SnapshotIngestor {
    transport: Arc<BridgeClient>,
    store:     Arc<TickStore>,
    config:    IngestorConfig,
    data_root: String,
    events:    broadcast::Sender<FeedEvent>,
    counters:  Arc<IngestCounters>,
    states:    Mutex<HashMap<ContractId, SymbolState>>,
    warned:    Mutex<HashSet<String>>,
}

impl std::fmt::Debug for SnapshotIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SnapshotIngestor")
            .field("data_root", &self.data_root)
            .finish_non_exhaustive()
    }
}

impl SnapshotIngestor {
    pub fn new(
        transport: Arc<BridgeClient>,
        store: Arc<TickStore>,
        config: IngestorConfig,
        data_root: String,
        events: broadcast::Sender<FeedEvent>,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            data_root,
            events,
            counters: Arc::new(IngestCounters::default()),
            states: Mutex::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn counters(&self) -> Arc<IngestCounters> { Arc::clone(&self.counters) }

    pub fn snapshot_path(&self, contract: &Contract) -> String {
        format!("{}/{}.json", self.data_root, contract.id())
    }

    /// Poll one symbol's snapshot file once. Returns the accepted tick, or
    /// `None` when the snapshot was not fresh.
    #[instrument(level = "debug", skip(self, contract), fields(symbol = %contract.id()))]
    pub async fn poll_symbol(&self, contract: &Contract) -> Result<Option<Tick>> {
        let path = self.snapshot_path(contract);
        let file = match self.transport.read_text(&path).await {
            Ok(file) => file,
            // the producer has not written a first snapshot yet
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut frame = match SnapshotFrame::from_json(contract.id().as_str(), &file.body) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            },
        };
        for key in frame.sanitize() {
            if self.warned.lock().insert(key.clone()) {
                warn!(key, "ignoring unknown snapshot field");
            }
        }

        self.accept(contract.id(), frame, file.last_modified)
    }

    /// Apply the freshness rule and publish an accepted tick. Split from
    /// the poll so the dedup logic is testable without a bridge.
    pub fn accept(
        &self,
        symbol: ContractId,
        frame: SnapshotFrame,
        mtime: Option<TimeStamp>,
    ) -> Result<Option<Tick>> {
        let mut states = self.states.lock();
        let state = states.entry(symbol.clone()).or_default();

        // a snapshot is only fresh when the file advanced...
        if let (Some(new), Some(old)) = (mtime, state.last_mtime) {
            if new <= old {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }
        // ...and the sequence moved forward (mod 2^16). A backward jump of
        // more than half the space reads as forward, which deliberately
        // accepts a restarted producer session.
        if let Some(last) = state.last_sequence {
            match sequence_step(last, frame.sequence) {
                SequenceStep::Duplicate => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                },
                SequenceStep::Backward => {
                    self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
                    debug!(last, sequence = frame.sequence, "out-of-order snapshot dropped");
                    return Ok(None);
                },
                SequenceStep::Forward(_) => {},
            }
        }

        let tick = frame.into_tick()?;
        state.last_sequence = Some(tick.sequence);
        state.last_mtime = mtime.or(state.last_mtime);
        state.last_accepted_at = Some(Instant::now());
        state.stale_flagged = false;
        drop(states);

        // persist before fanning out; a storage failure pauses this symbol
        // until the next poll interval
        self.store.insert_ticks(&symbol, std::slice::from_ref(&tick))?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(FeedEvent::Tick(tick.clone()));
        Ok(Some(tick))
    }

    /// Flag symbols that stopped producing during market hours. Emits one
    /// `StaleSymbol` event per stale episode.
    pub fn check_staleness(&self, market_open: bool) {
        if !market_open {
            return;
        }
        let threshold = self.config.stale_threshold();
        let mut states = self.states.lock();
        for (symbol, state) in states.iter_mut() {
            let Some(last) = state.last_accepted_at else {
                continue;
            };
            if !state.stale_flagged && last.elapsed() > threshold {
                state.stale_flagged = true;
                self.counters.stale_events.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %symbol, "no fresh snapshot for {:?}", threshold);
                let _ = self.events.send(FeedEvent::StaleSymbol {
                    symbol: symbol.clone(),
                });
            }
        }
    }

    /// Forget dedup state for contracts that rolled away.
    pub fn retain_symbols(&self, keep: &[ContractId]) {
        self.states.lock().retain(|symbol, _| keep.contains(symbol));
    }

    /// Time since the last accepted snapshot, per known symbol. `None`
    /// before the first accept.
    pub fn freshness(&self) -> HashMap<ContractId, Option<Duration>> {
        self.states
            .lock()
            .iter()
            .map(|(symbol, state)| {
                (
                    symbol.clone(),
                    state.last_accepted_at.map(|at| at.elapsed()),
                )
            })
            .collect()
    }

    pub fn poll_interval(&self, contract: &Contract) -> Duration {
        self.config.poll_interval(&contract.root)
    }
}
