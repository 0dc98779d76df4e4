//! Live market data service: the composition root.
//!
//! Wires the registry, bridge transport, snapshot ingestor, store and gap
//! filler together and exposes the unified contract: a per-root live tick
//! stream, latest/historical queries and a status summary. This is the
//! only place that decides component lifecycles.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

use crate::{bars::{DailyBar, Timeframe},
            config::Config,
            error::{Error, Result},
            gapfill::{Gap, GapFiller, MarketCalendar},
            orders::{OrderBridge, OrderCommand, OrderResponse},
            scheduler::Scheduler,
            shutdown::ShutdownHandle,
            snapshot::{IngestCountersSnapshot, SnapshotIngestor},
            store::{coverage::Interval, TickStore},
            symbols::{Contract, ContractId, SymbolRegistry},
            ticker::Tick,
            transport::BridgeClient,
            TimeStamp};

/// Everything the fan-out channel carries.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Tick(Tick),
    /// One-shot per stale episode: no accepted snapshot for the stale
    /// threshold during market hours.
    StaleSymbol { symbol: ContractId },
    /// The service is shutting down.
    Cancelled,
}

/// What one subscriber observes.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Tick(Tick),
    Stale(ContractId),
    /// Terminal: the subscriber's buffer overflowed and it was
    /// disconnected. The ingestor is unaffected.
    Lagged { missed: u64 },
    /// Terminal: the service stopped.
    Cancelled,
}

/// A bounded, per-root view of the live stream. Keyed by logical root so
/// rollover is invisible to the consumer.
#[derive(Debug)]
pub struct TickSubscription {
    root: Option<String>,
    /// Dropped on the terminal item, which is what disconnects the
    /// subscriber from the fan-out channel.
    rx:   Option<broadcast::Receiver<FeedEvent>>,
    done: bool,
}

impl TickSubscription {
    /// Next stream item; `None` after a terminal item was delivered.
    pub async fn next(&mut self) -> Option<StreamItem> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(FeedEvent::Tick(tick)) => {
                    if let Some(root) = &self.root {
                        if tick.symbol.root() != root {
                            continue;
                        }
                    }
                    return Some(StreamItem::Tick(tick));
                },
                Ok(FeedEvent::StaleSymbol { symbol }) => {
                    if let Some(root) = &self.root {
                        if symbol.root() != root {
                            continue;
                        }
                    }
                    return Some(StreamItem::Stale(symbol));
                },
                Ok(FeedEvent::Cancelled) | Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    self.done = true;
                    return Some(StreamItem::Cancelled);
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.rx = None;
                    self.done = true;
                    return Some(StreamItem::Lagged { missed });
                },
            }
        }
    }

    /// Whether a terminal item has been delivered.
    pub const fn is_done(&self) -> bool { self.done }
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolFreshness {
    pub symbol:             ContractId,
    /// Seconds since the last accepted snapshot; `None` before the first.
    pub seconds_since_tick: Option<u64>,
    pub stale:              bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageSummary {
    pub symbol:    ContractId,
    pub timeframe: String,
    pub intervals: usize,
    pub covered_s: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub degraded: bool,
    pub ingest:   IngestCountersSnapshot,
    pub symbols:  Vec<SymbolFreshness>,
    pub coverage: Vec<CoverageSummary>,
}

/// Composition root for the market data integration core.
pub struct MarketDataService {
    config:    Config,
    registry:  Arc<SymbolRegistry>,
    transport: Arc<BridgeClient>,
    store:     Arc<TickStore>,
    ingestor:  Arc<SnapshotIngestor>,
    gapfiller: Arc<GapFiller>,
    orders:    Arc<OrderBridge>,
    calendar:  MarketCalendar,
    events:    broadcast::Sender<FeedEvent>,
    pollers:   tokio::sync::Mutex<HashMap<ContractId, ShutdownHandle>>,
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MarketDataService").finish_non_exhaustive()
    }
}

impl MarketDataService {
    /// Build every component from the configuration document. `now` seeds
    /// the registry; the daemon passes the wall clock.
    pub fn new(config: Config, now: TimeStamp) -> Result<Self> {
        let registry = Arc::new(SymbolRegistry::from_config(&config.symbols, now)?);
        let transport = Arc::new(BridgeClient::new(&config.bridge)?);
        let store = Arc::new(TickStore::open(&config.store.data_dir.join("market.db"))?);
        let calendar = MarketCalendar::from_config(&config.market_hours)?;
        let (events, _) = broadcast::channel(config.ingestor.fanout_buffer);
        let data_root = config
            .bridge
            .allowed_path_prefixes
            .first()
            .cloned()
            .ok_or_else(|| Error::configuration("no allowed path prefix"))?;
        let ingestor = Arc::new(SnapshotIngestor::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            config.ingestor.clone(),
            data_root.clone(),
            events.clone(),
        ));
        let gapfiller = Arc::new(GapFiller::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            calendar.clone(),
            config.gapfiller.clone(),
            data_root,
        ));
        let orders = Arc::new(OrderBridge::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            config.orders,
        ));
        Ok(Self {
            config,
            registry,
            transport,
            store,
            ingestor,
            gapfiller,
            orders,
            calendar,
            events,
            pollers: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> Arc<SymbolRegistry> { Arc::clone(&self.registry) }

    pub fn transport(&self) -> Arc<BridgeClient> { Arc::clone(&self.transport) }

    pub fn store(&self) -> Arc<TickStore> { Arc::clone(&self.store) }

    pub fn ingestor(&self) -> Arc<SnapshotIngestor> { Arc::clone(&self.ingestor) }

    /// Start the periodic machinery: snapshot pollers for every active
    /// contract, health poll, gap scan, rollover check and the coverage
    /// summary. Returns the scheduler; shutting it down stops everything.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new();

        self.reconcile_pollers().await;

        // initial gap scan over the full lookback runs in the background
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = service.run_gap_scan().await {
                error!(error = %e, "initial gap scan failed");
            }
        });

        let service = Arc::clone(self);
        scheduler.every("health-poll", Duration::from_secs(30), move || {
            let service = Arc::clone(&service);
            async move {
                if let Err(e) = service.transport.health().await {
                    debug!(error = %e, "bridge health poll failed");
                }
                service
                    .ingestor
                    .check_staleness(service.calendar.is_open(Utc::now()));
                service.orders.sweep_late_responses().await;
            }
        });

        let service = Arc::clone(self);
        scheduler.every(
            "gap-scan",
            Duration::from_secs(self.config.gapfiller.interval_s),
            move || {
                let service = Arc::clone(&service);
                async move {
                    if let Err(e) = service.run_gap_scan().await {
                        error!(error = %e, "gap scan failed");
                    }
                }
            },
        );

        let service = Arc::clone(self);
        scheduler.every("rollover-check", Duration::from_secs(3_600), move || {
            let service = Arc::clone(&service);
            async move {
                if let Err(e) = service.registry.refresh(Utc::now()) {
                    error!(error = %e, "rollover check failed");
                    return;
                }
                service.reconcile_pollers().await;
            }
        });

        let service = Arc::clone(self);
        scheduler.every("coverage-summary", Duration::from_secs(300), move || {
            let service = Arc::clone(&service);
            async move {
                match service.status() {
                    Ok(status) => info!(
                        degraded = status.degraded,
                        accepted = status.ingest.accepted,
                        duplicates = status.ingest.duplicates,
                        out_of_order = status.ingest.out_of_order,
                        "coverage summary"
                    ),
                    Err(e) => debug!(error = %e, "status unavailable"),
                }
            }
        });

        Ok(scheduler)
    }

    /// Stop pollers for contracts that rolled away and start pollers for
    /// newly active ones. Old pollers are fully drained before any new
    /// contract is polled, which is what makes the changeover atomic for
    /// subscribers.
    pub async fn reconcile_pollers(self: &Arc<Self>) {
        let active = self.registry.all_active();
        let active_ids: Vec<ContractId> = active.iter().map(Contract::id).collect();
        let mut pollers = self.pollers.lock().await;

        let stale: Vec<ContractId> = pollers
            .keys()
            .filter(|id| !active_ids.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(handle) = pollers.remove(&id) {
                info!(symbol = %id, "stopping snapshot poller");
                handle.shutdown().await;
            }
        }
        self.ingestor.retain_symbols(&active_ids);

        for contract in active {
            let id = contract.id();
            if pollers.contains_key(&id) {
                continue;
            }
            info!(symbol = %id, "starting snapshot poller");
            pollers.insert(id, self.spawn_poller(contract));
        }
    }

    fn spawn_poller(self: &Arc<Self>, contract: Contract) -> ShutdownHandle {
        let handle = ShutdownHandle::new();
        let mut shutdown = handle.subscribe();
        let ingestor = Arc::clone(&self.ingestor);
        let interval = ingestor.poll_interval(&contract);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {},
                    _ = shutdown.recv() => break,
                }
                let poll = tokio::time::timeout(
                    Duration::from_secs(2),
                    ingestor.poll_symbol(&contract),
                );
                match poll.await {
                    Ok(Ok(_)) => {},
                    Ok(Err(e)) => {
                        debug!(symbol = %contract.id(), error = %e, "snapshot poll failed");
                    },
                    Err(_) => {
                        debug!(symbol = %contract.id(), "snapshot poll exceeded its deadline");
                    },
                }
            }
        });
        handle
    }

    async fn run_gap_scan(&self) -> Result<()> {
        let symbols: Vec<(ContractId, u32)> = self
            .registry
            .all_active()
            .iter()
            .map(|c| (c.id(), c.priority))
            .collect();
        let rows = self.gapfiller.run_scan(&symbols, Utc::now()).await?;
        if rows > 0 {
            info!(rows, "gap repair inserted rows");
        }
        Ok(())
    }

    /// Subscribe to the live stream of one logical root.
    pub fn subscribe(&self, root: &str) -> Result<TickSubscription> {
        // resolves the root so unknown names fail fast
        let _ = self.registry.current(root)?;
        Ok(TickSubscription {
            root: Some(root.to_string()),
            rx:   Some(self.events.subscribe()),
            done: false,
        })
    }

    /// Subscribe to every symbol's events.
    pub fn subscribe_all(&self) -> TickSubscription {
        TickSubscription {
            root: None,
            rx:   Some(self.events.subscribe()),
            done: false,
        }
    }

    /// Most recent tick for the root's active contract.
    pub fn latest(&self, root: &str) -> Result<Option<Tick>> {
        let contract = self.registry.current(root)?;
        self.store.latest_tick(&contract.id())
    }

    /// Stored bars for the root's active contract over `[t0, t1)`.
    pub fn historical(
        &self,
        root: &str,
        timeframe: Timeframe,
        range: Interval,
    ) -> Result<Vec<DailyBar>> {
        let contract = self.registry.current(root)?;
        self.store.range_bars(&contract.id(), timeframe, range)
    }

    /// Gaps for one root without repairing them.
    pub fn report_gaps(&self, root: &str, lookback_days: u32, now: TimeStamp) -> Result<Vec<Gap>> {
        let contract = self.registry.current(root)?;
        let mut gaps = self.gapfiller.scan(
            &contract.id(),
            Timeframe::Daily,
            contract.priority,
            now,
            lookback_days,
        )?;
        gaps.extend(self.gapfiller.scan(
            &contract.id(),
            Timeframe::Tick,
            contract.priority,
            now,
            lookback_days,
        )?);
        Ok(GapFiller::prioritize(gaps, now))
    }

    /// Manual repair trigger for one root.
    pub async fn backfill(&self, root: &str, lookback_days: u32, now: TimeStamp) -> Result<usize> {
        let contract = self.registry.current(root)?;
        let mut rows = 0usize;
        for timeframe in [Timeframe::Daily, Timeframe::Tick] {
            let gaps = self.gapfiller.scan(
                &contract.id(),
                timeframe,
                contract.priority,
                now,
                lookback_days,
            )?;
            for gap in GapFiller::prioritize(gaps, now) {
                if let crate::gapfill::RepairOutcome::Repaired { rows_inserted } =
                    self.gapfiller.repair(&gap).await?
                {
                    rows += rows_inserted;
                }
            }
        }
        Ok(rows)
    }

    pub async fn submit_order(&self, command: OrderCommand) -> Result<OrderResponse> {
        self.orders.submit(command).await
    }

    pub fn status(&self) -> Result<ServiceStatus> {
        let active = self.registry.all_active();
        let mut symbols = Vec::with_capacity(active.len());
        let mut coverage = Vec::new();
        let freshness = self.ingestor.freshness();
        for contract in &active {
            let id = contract.id();
            let since = freshness.get(&id).copied().flatten();
            symbols.push(SymbolFreshness {
                symbol:             id.clone(),
                seconds_since_tick: since.map(|d| d.as_secs()),
                stale:              since
                    .map_or(false, |d| d > self.config.ingestor.stale_threshold()),
            });
            for timeframe in [Timeframe::Daily, Timeframe::Tick] {
                let index = self.store.coverage(&id, timeframe)?;
                if !index.is_empty() {
                    coverage.push(CoverageSummary {
                        symbol:    id.clone(),
                        timeframe: timeframe.to_string(),
                        intervals: index.intervals().len(),
                        covered_s: index.total_us() / 1_000_000,
                    });
                }
            }
        }
        Ok(ServiceStatus {
            degraded: self.transport.is_degraded(),
            ingest: self.ingestor.counters().snapshot(),
            symbols,
            coverage,
        })
    }

    /// Announce shutdown to every subscriber.
    pub fn cancel_subscribers(&self) {
        let _ = self.events.send(FeedEvent::Cancelled);
    }
}
