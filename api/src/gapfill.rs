//! Gap detection and repair.
//!
//! Expected coverage comes from the configured market-hours table; actual
//! coverage from the store. The difference is repaired newest-first by
//! range-reading the remote archive through the bridge, decoding, clamping
//! to the gap and inserting transactionally. A repair cancelled mid-flight
//! leaves the store unchanged because the insert is a single transaction.

use std::{collections::HashMap, str::FromStr, sync::{atomic::{AtomicU64, Ordering},
                                                     Arc}};

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::{bars::Timeframe,
            config::{GapFillerConfig, MarketHoursConfig},
            decode::{daily::{decode_daily, DailySeries},
                     intraday::{decode_records, ScidHeader, ScidRecord, SCID_HEADER_LEN,
                                SCID_RECORD_LEN}},
            error::{Error, Result},
            store::{coverage::{CoverageIndex, Interval},
                    day_start_us,
                    TickStore,
                    US_PER_DAY},
            symbols::ContractId,
            ticker::{Side, Tick},
            transport::BridgeClient,
            TimeStamp,
            TimestampUs};

/// Gaps ending within this window count as recent and repair first.
const RECENT_WINDOW_US: i64 = 7 * US_PER_DAY;
/// Suffix probe size for intraday repairs, doubled until the gap start is
/// covered.
const PROBE_RECORDS: u64 = 4_096;

/// Weekly session table resolved into the exchange time zone.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz:       Tz,
    sessions: Vec<(Weekday, NaiveTime, NaiveTime)>,
}

impl MarketCalendar {
    pub fn from_config(config: &MarketHoursConfig) -> Result<Self> {
        Ok(Self {
            tz:       config.tz()?,
            sessions: config.weekdays()?,
        })
    }

    /// Whether the market is open at `at`.
    pub fn is_open(&self, at: TimeStamp) -> bool {
        let local = at.with_timezone(&self.tz).naive_local();
        for offset in 0..=1i64 {
            let day = local.date() - ChronoDuration::days(offset);
            for (weekday, open, close) in &self.sessions {
                if day.weekday() != *weekday {
                    continue;
                }
                let start = day.and_time(*open);
                let end = if close <= open {
                    (day + ChronoDuration::days(1)).and_time(*close)
                } else {
                    day.and_time(*close)
                };
                if start <= local && local < end {
                    return true;
                }
            }
        }
        false
    }

    /// Session intervals intersected with `range`, in UTC microseconds.
    pub fn sessions_between(&self, range: Interval) -> CoverageIndex {
        let mut index = CoverageIndex::new();
        let Some(start_dt) = chrono::DateTime::from_timestamp_micros(range.start) else {
            return index;
        };
        let Some(end_dt) = chrono::DateTime::from_timestamp_micros(range.end) else {
            return index;
        };
        let first = start_dt.with_timezone(&self.tz).date_naive() - ChronoDuration::days(1);
        let last = end_dt.with_timezone(&self.tz).date_naive();
        let mut day = first;
        while day <= last {
            for (weekday, open, close) in &self.sessions {
                if day.weekday() != *weekday {
                    continue;
                }
                let start_local = day.and_time(*open);
                let end_local = if close <= open {
                    (day + ChronoDuration::days(1)).and_time(*close)
                } else {
                    day.and_time(*close)
                };
                let (Some(start), Some(end)) = (
                    self.tz.from_local_datetime(&start_local).earliest(),
                    self.tz.from_local_datetime(&end_local).earliest(),
                ) else {
                    continue;
                };
                let session = Interval::new(
                    start.timestamp_micros(),
                    end.timestamp_micros(),
                );
                if let Some(clamped) = session.intersect(&range) {
                    index.add(clamped);
                }
            }
            day += ChronoDuration::days(1);
        }
        index
    }

    /// Whole trading days (UTC day granularity, matching stored daily
    /// bars) intersected with `range`.
    pub fn trading_days_between(&self, range: Interval) -> CoverageIndex {
        let mut index = CoverageIndex::new();
        let Some(start_dt) = chrono::DateTime::from_timestamp_micros(range.start) else {
            return index;
        };
        let Some(end_dt) = chrono::DateTime::from_timestamp_micros(range.end) else {
            return index;
        };
        let mut day = start_dt.date_naive();
        let last = end_dt.date_naive();
        while day <= last {
            if self.sessions.iter().any(|(w, _, _)| *w == day.weekday()) {
                let start = day_start_us(day);
                if let Some(clamped) =
                    Interval::new(start, start + US_PER_DAY).intersect(&range)
                {
                    index.add(clamped);
                }
            }
            day += ChronoDuration::days(1);
        }
        index
    }
}

/// A missing sub-interval of expected coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub symbol:    ContractId,
    pub timeframe: Timeframe,
    pub interval:  Interval,
    pub priority:  u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    Repaired { rows_inserted: usize },
    /// The remote lacks the data; retried only after the cooldown.
    Unrepairable,
    /// Skipped because a previous `Unrepairable` is still cooling down.
    CoolingDown,
}

#[derive(Debug, Default)]
pub struct GapFillCounters {
    pub scans:        AtomicU64,
    pub gaps_found:   AtomicU64,
    pub repairs:      AtomicU64,
    pub rows:         AtomicU64,
    pub unrepairable: AtomicU64,
}

type CooldownKey = (ContractId, Timeframe, TimestampUs);

/// Computes and repairs coverage gaps for the symbols of interest.
pub struct GapFiller {
    transport: Arc<BridgeClient>,
    store:     Arc<TickStore>,
    calendar:  MarketCalendar,
    config:    GapFillerConfig,
    data_root: String,
    repairs:   Arc<Semaphore>,
    cooldowns: Mutex<HashMap<CooldownKey, Instant>>,
    counters:  Arc<GapFillCounters>,
}

impl std::fmt::Debug for GapFiller {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GapFiller")
            .field("data_root", &self.data_root)
            .finish_non_exhaustive()
    }
}

impl GapFiller {
    pub fn new(
        transport: Arc<BridgeClient>,
        store: Arc<TickStore>,
        calendar: MarketCalendar,
        config: GapFillerConfig,
        data_root: String,
    ) -> Self {
        let repairs = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            transport,
            store,
            calendar,
            config,
            data_root,
            repairs,
            cooldowns: Mutex::new(HashMap::new()),
            counters: Arc::new(GapFillCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<GapFillCounters> { Arc::clone(&self.counters) }

    /// `expected − actual` over the lookback window ending at `now`.
    pub fn scan(
        &self,
        symbol: &ContractId,
        timeframe: Timeframe,
        priority: u32,
        now: TimeStamp,
        lookback_days: u32,
    ) -> Result<Vec<Gap>> {
        let end = match timeframe {
            // today's bar does not exist until the session closes
            Timeframe::Daily => day_start_us(now.date_naive()),
            Timeframe::Tick => now.timestamp_micros(),
        };
        let start = end - i64::from(lookback_days) * US_PER_DAY;
        let window = Interval::new(start, end);
        let expected = match timeframe {
            Timeframe::Daily => self.calendar.trading_days_between(window),
            Timeframe::Tick => self.calendar.sessions_between(window),
        };
        let actual = self.store.coverage(symbol, timeframe)?;
        let gaps: Vec<Gap> = expected
            .subtract(&actual)
            .into_iter()
            .map(|interval| Gap {
                symbol: symbol.clone(),
                timeframe,
                interval,
                priority,
            })
            .collect();
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        self.counters
            .gaps_found
            .fetch_add(gaps.len() as u64, Ordering::Relaxed);
        Ok(gaps)
    }

    /// Order gaps for repair: anything recent first, then newest-first,
    /// ties broken by registry priority.
    pub fn prioritize(mut gaps: Vec<Gap>, now: TimeStamp) -> Vec<Gap> {
        let recent_floor = now.timestamp_micros() - RECENT_WINDOW_US;
        gaps.sort_by(|a, b| {
            let a_recent = a.interval.end > recent_floor;
            let b_recent = b.interval.end > recent_floor;
            b_recent
                .cmp(&a_recent)
                .then(b.interval.end.cmp(&a.interval.end))
                .then(a.priority.cmp(&b.priority))
        });
        gaps
    }

    /// Repair one gap. Bounded by the configured concurrency; callers may
    /// invoke this from many tasks.
    #[instrument(level = "debug", skip(self, gap), fields(symbol = %gap.symbol, timeframe = ?gap.timeframe))]
    pub async fn repair(&self, gap: &Gap) -> Result<RepairOutcome> {
        let key = (gap.symbol.clone(), gap.timeframe, gap.interval.start);
        if let Some(until) = self.cooldowns.lock().get(&key) {
            if Instant::now() < *until {
                return Ok(RepairOutcome::CoolingDown);
            }
        }
        let _permit = self
            .repairs
            .acquire()
            .await
            .expect("repair semaphore closed");

        let outcome = match gap.timeframe {
            Timeframe::Daily => self.repair_daily(gap).await,
            Timeframe::Tick => self.repair_intraday(gap).await,
        };
        match outcome {
            Ok(rows_inserted) => {
                self.counters.repairs.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .rows
                    .fetch_add(rows_inserted as u64, Ordering::Relaxed);
                debug!(rows_inserted, "gap repaired");
                Ok(RepairOutcome::Repaired { rows_inserted })
            },
            Err(Error::NotFound { path }) => {
                warn!(path, "remote lacks the data, gap marked unrepairable");
                self.counters.unrepairable.fetch_add(1, Ordering::Relaxed);
                self.cooldowns.lock().insert(
                    key,
                    Instant::now() + std::time::Duration::from_secs(self.config.cooldown_s),
                );
                Ok(RepairOutcome::Unrepairable)
            },
            Err(e) => Err(e),
        }
    }

    /// Scan and repair every (symbol, timeframe) pair in `symbols`.
    /// Returns total rows inserted.
    pub async fn run_scan(
        &self,
        symbols: &[(ContractId, u32)],
        now: TimeStamp,
    ) -> Result<usize> {
        let mut all = Vec::new();
        for (symbol, priority) in symbols {
            for timeframe in [Timeframe::Daily, Timeframe::Tick] {
                all.extend(self.scan(
                    symbol,
                    timeframe,
                    *priority,
                    now,
                    self.config.lookback_days,
                )?);
            }
        }
        let gaps = Self::prioritize(all, now);
        if !gaps.is_empty() {
            info!(gaps = gaps.len(), "gap scan found work");
        }
        let mut rows = 0usize;
        for gap in &gaps {
            // whole-gap deadline; the transactional insert makes an
            // abandoned repair invisible
            let attempt =
                tokio::time::timeout(std::time::Duration::from_secs(60), self.repair(gap)).await;
            match attempt {
                Ok(Ok(RepairOutcome::Repaired { rows_inserted })) => rows += rows_inserted,
                Ok(Ok(RepairOutcome::Unrepairable | RepairOutcome::CoolingDown)) => {},
                Ok(Err(e)) => {
                    warn!(symbol = %gap.symbol, error = %e, "gap repair failed");
                },
                Err(_) => {
                    warn!(symbol = %gap.symbol, "gap repair exceeded its deadline");
                },
            }
        }
        Ok(rows)
    }

    async fn repair_daily(&self, gap: &Gap) -> Result<usize> {
        let path = format!("{}/{}.dly", self.data_root, gap.symbol);
        let file = self.transport.read_text(&path).await?;
        let series = decode_daily(gap.symbol.as_str(), &file.body)?;
        self.apply_daily(gap, &series)
    }

    /// Clamp decoded bars to the gap and insert. Factored out of the
    /// transport path so the repair arithmetic is testable offline.
    fn apply_daily(&self, gap: &Gap, series: &DailySeries) -> Result<usize> {
        let bars: Vec<_> = series
            .bars
            .iter()
            .filter(|bar| gap.interval.contains(day_start_us(bar.date)))
            .copied()
            .collect();
        if bars.is_empty() {
            return Ok(0);
        }
        let outcome = self.store.insert_bars(&gap.symbol, Timeframe::Daily, &bars)?;
        Ok(outcome.inserted)
    }

    async fn repair_intraday(&self, gap: &Gap) -> Result<usize> {
        let path = format!("{}/{}.scid", self.data_root, gap.symbol);
        let listing = self.transport.list_dir(&self.data_root).await?;
        let file_name = format!("{}.scid", gap.symbol);
        let size = listing
            .iter()
            .find(|e| e.name == file_name)
            .map(|e| e.size)
            .ok_or(Error::NotFound { path: path.clone() })?;

        let header_read = self
            .transport
            .read_binary(&path, 0, SCID_HEADER_LEN as u64)
            .await?;
        let header = ScidHeader::decode(gap.symbol.as_str(), &header_read.body)?;
        let total = header.record_count(size);
        if total == 0 {
            return Ok(0);
        }

        // walk backwards in doubling suffixes until the probe reaches past
        // the gap start or the file begins
        let mut take = PROBE_RECORDS.min(total);
        let records = loop {
            let first = total - take;
            let offset = header.record_offset(first);
            let length = take * SCID_RECORD_LEN as u64;
            let read = self.transport.read_binary(&path, offset, length).await?;
            let series = decode_records(&header, &read.body);
            let covers_gap = series
                .records
                .first()
                .map_or(true, |r| r.timestamp_us() <= gap.interval.start);
            if covers_gap || first == 0 {
                break series.records;
            }
            take = (take * 2).min(total);
        };

        let ticks = ticks_in_gap(&gap.symbol, &records, gap.interval);
        if ticks.is_empty() {
            return Ok(0);
        }
        let outcome = self.store.insert_ticks(&gap.symbol, &ticks)?;
        Ok(outcome.inserted)
    }
}

/// Convert archive tick records inside `gap` into store ticks. Records
/// sharing a timestamp get consecutive sequence ordinals so the tick
/// primary key stays unique and repeated repairs stay idempotent.
pub fn ticks_in_gap(
    symbol: &ContractId,
    records: &[ScidRecord],
    gap: Interval,
) -> Vec<Tick> {
    let mut ticks: Vec<Tick> = Vec::new();
    let mut last_ts = TimestampUs::MIN;
    let mut ordinal = 0u16;
    for record in records {
        let ScidRecord::Tick(t) = record else {
            continue;
        };
        if !gap.contains(t.timestamp_us) {
            continue;
        }
        if t.timestamp_us == last_ts {
            ordinal = ordinal.wrapping_add(1);
        } else {
            ordinal = 0;
            last_ts = t.timestamp_us;
        }
        ticks.push(Tick {
            symbol:       symbol.clone(),
            timestamp_us: t.timestamp_us,
            price:        t.price,
            size:         t.volume,
            bid:          t.bid,
            ask:          t.ask,
            bid_size:     t.bid_volume,
            ask_size:     t.ask_volume,
            side:         Side::Unknown,
            sequence:     ordinal,
            vwap:         0.0,
            total_volume: 0,
            trade_count:  t.num_trades as u64,
        });
    }
    ticks
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{config::Config, decode::intraday};

    fn all_week_calendar() -> MarketCalendar {
        let config = MarketHoursConfig {
            timezone: "UTC".to_string(),
            sessions: ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"]
                .into_iter()
                .map(|day| crate::config::SessionConfig {
                    day:   day.to_string(),
                    open:  NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    close: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                })
                .collect(),
        };
        MarketCalendar::from_config(&config).unwrap()
    }

    fn filler(calendar: MarketCalendar) -> (TempDir, GapFiller) {
        let dir = TempDir::new().unwrap();
        let config = Config::from_toml(crate::config::tests::SAMPLE).unwrap();
        let store = Arc::new(TickStore::open(&dir.path().join("market.db")).unwrap());
        let transport = Arc::new(BridgeClient::new(&config.bridge).unwrap());
        let filler = GapFiller::new(
            transport,
            store,
            calendar,
            GapFillerConfig {
                lookback_days: 60,
                ..GapFillerConfig::default()
            },
            "C:/SierraChart/Data".to_string(),
        );
        (dir, filler)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, d).unwrap() }

    fn daily_file(days: &[NaiveDate]) -> DailySeries {
        let mut text = String::from(crate::decode::daily::HEADER_ROW);
        text.push('\n');
        for d in days {
            text.push_str(&format!(
                "{}, 100.0, 101.0, 99.0, 100.5, 10, 5\n",
                d.format("%Y/%m/%d")
            ));
        }
        decode_daily("NQU25-CME", text.as_bytes()).unwrap()
    }

    fn days_between(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut d = from;
        while d < to {
            out.push(d);
            d += ChronoDuration::days(1);
        }
        out
    }

    #[test]
    fn futures_calendar_is_closed_on_weekend() {
        let config = Config::from_toml(crate::config::tests::SAMPLE).unwrap();
        let calendar = MarketCalendar::from_config(&config.market_hours).unwrap();
        // Friday 14:00 UTC (08:00 Central) is inside the Thursday session
        assert!(calendar.is_open("2025-07-25T14:00:00Z".parse().unwrap()));
        // Saturday afternoon is closed
        assert!(!calendar.is_open("2025-07-26T18:00:00Z".parse().unwrap()));
        // Sunday evening reopen (17:30 Central = 22:30 UTC)
        assert!(calendar.is_open("2025-07-27T22:35:00Z".parse().unwrap()));
    }

    #[test]
    fn gap_scan_finds_missing_middle() {
        let (_dir, filler) = filler(all_week_calendar());
        let symbol: ContractId = "NQU25-CME".parse().unwrap();
        // store holds [01-01, 01-10) and [01-15, 02-01)
        filler
            .store
            .insert_bars(
                &symbol,
                Timeframe::Daily,
                &daily_file(&days_between(day(2025, 1, 1), day(2025, 1, 10))).bars,
            )
            .unwrap();
        filler
            .store
            .insert_bars(
                &symbol,
                Timeframe::Daily,
                &daily_file(&days_between(day(2025, 1, 15), day(2025, 2, 1))).bars,
            )
            .unwrap();

        let now: TimeStamp = "2025-02-01T00:00:00Z".parse().unwrap();
        let gaps = filler
            .scan(&symbol, Timeframe::Daily, 1, now, 60)
            .unwrap();
        let middle = Interval::new(
            day_start_us(day(2025, 1, 10)),
            day_start_us(day(2025, 1, 15)),
        );
        assert!(gaps.iter().any(|g| g.interval == middle), "gaps: {gaps:?}");
    }

    #[test]
    fn repair_is_idempotent() {
        // scenario: remote archive holds all of January; two scans, the
        // second inserts nothing
        let (_dir, filler) = filler(all_week_calendar());
        let symbol: ContractId = "NQU25-CME".parse().unwrap();
        let archive = daily_file(&days_between(day(2025, 1, 1), day(2025, 2, 1)));
        filler
            .store
            .insert_bars(
                &symbol,
                Timeframe::Daily,
                &daily_file(&days_between(day(2025, 1, 1), day(2025, 1, 10))).bars,
            )
            .unwrap();
        filler
            .store
            .insert_bars(
                &symbol,
                Timeframe::Daily,
                &daily_file(&days_between(day(2025, 1, 15), day(2025, 2, 1))).bars,
            )
            .unwrap();

        let now: TimeStamp = "2025-02-01T00:00:00Z".parse().unwrap();
        let gaps = filler.scan(&symbol, Timeframe::Daily, 1, now, 60).unwrap();
        let mut inserted = 0;
        for gap in &gaps {
            inserted += filler.apply_daily(gap, &archive).unwrap();
        }
        assert_eq!(inserted, 5, "the five missing January days");

        let coverage = filler.store.coverage(&symbol, Timeframe::Daily).unwrap();
        assert!(coverage.covers(Interval::new(
            day_start_us(day(2025, 1, 1)),
            day_start_us(day(2025, 2, 1)),
        )));

        // second scan: the January window is covered, nothing inserted
        let gaps = filler.scan(&symbol, Timeframe::Daily, 1, now, 60).unwrap();
        let mut inserted = 0;
        for gap in &gaps {
            inserted += filler.apply_daily(gap, &archive).unwrap();
        }
        assert_eq!(inserted, 0);
    }

    #[test]
    fn prioritize_recent_then_newest() {
        let now: TimeStamp = "2025-02-01T00:00:00Z".parse().unwrap();
        let symbol: ContractId = "NQU25-CME".parse().unwrap();
        let gap = |start_day: u32, end_day: u32, priority| Gap {
            symbol:    symbol.clone(),
            timeframe: Timeframe::Daily,
            interval:  Interval::new(
                day_start_us(day(2025, 1, start_day)),
                day_start_us(day(2025, 1, end_day)),
            ),
            priority,
        };
        let old_a = gap(2, 4, 1);
        let old_b = gap(10, 12, 1);
        let recent = gap(28, 31, 2);
        let ordered = GapFiller::prioritize(vec![old_a.clone(), recent.clone(), old_b.clone()], now);
        assert_eq!(ordered[0], recent);
        assert_eq!(ordered[1], old_b);
        assert_eq!(ordered[2], old_a);
    }

    #[test]
    fn archive_ticks_get_stable_ordinals() {
        let symbol: ContractId = "NQU25-CME".parse().unwrap();
        let file = intraday::tests::tick_file(0, &[
            (1_000, 1.0, 0.9, 1.1, 1),
            (1_000, 1.1, 1.0, 1.2, 2),
            (2_000, 1.2, 1.1, 1.3, 1),
        ]);
        let series = crate::decode::intraday::decode_scid("NQU25-CME", &file).unwrap();
        let ticks = ticks_in_gap(&symbol, &series.records, Interval::new(0, 10_000));
        assert_eq!(
            ticks.iter().map(|t| (t.timestamp_us, t.sequence)).collect::<Vec<_>>(),
            vec![(1_000, 0), (1_000, 1), (2_000, 0)]
        );
    }
}
