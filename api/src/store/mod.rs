//! Append-only persistent store for ticks and bars.
//!
//! Backed by embedded SQLite in WAL mode. All writes go through a single
//! `Mutex<Connection>` and commit before the insert call returns, so a
//! crash leaves the store in a consistent pre-insert state. Insertion is
//! idempotent and commutative for disjoint sets: backfill and live writes
//! can race without coordination.

pub mod coverage;

use std::{path::Path, str::FromStr};

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::{bars::{DailyBar, Timeframe},
            error::{Error, Result},
            store::coverage::{CoverageIndex, Interval},
            symbols::ContractId,
            ticker::{Side, Tick},
            TimestampUs};

pub const US_PER_DAY: i64 = 86_400_000_000;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS ticks (
    symbol       TEXT    NOT NULL,
    ts_us        INTEGER NOT NULL,
    sequence     INTEGER NOT NULL,
    price        REAL    NOT NULL,
    size         INTEGER NOT NULL,
    bid          REAL    NOT NULL,
    ask          REAL    NOT NULL,
    bid_size     INTEGER NOT NULL,
    ask_size     INTEGER NOT NULL,
    side         TEXT    NOT NULL,
    vwap         REAL    NOT NULL,
    total_volume INTEGER NOT NULL,
    trade_count  INTEGER NOT NULL,
    PRIMARY KEY (symbol, ts_us, sequence)
);

CREATE INDEX IF NOT EXISTS idx_ticks_symbol_sequence
    ON ticks(symbol, sequence);

CREATE TABLE IF NOT EXISTS bars (
    symbol        TEXT    NOT NULL,
    timeframe     TEXT    NOT NULL,
    start_ts      INTEGER NOT NULL,
    open          REAL    NOT NULL,
    high          REAL    NOT NULL,
    low           REAL    NOT NULL,
    close         REAL    NOT NULL,
    volume        INTEGER NOT NULL,
    open_interest INTEGER,
    PRIMARY KEY (symbol, timeframe, start_ts)
);

CREATE TABLE IF NOT EXISTS coverage (
    symbol    TEXT    NOT NULL,
    timeframe TEXT    NOT NULL,
    start_ts  INTEGER NOT NULL,
    end_ts    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_coverage_symbol_timeframe
    ON coverage(symbol, timeframe);
"#;

/// Outcome of one insert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Rows actually written; duplicates and dominated bars are no-ops.
    pub inserted: usize,
    pub ignored:  usize,
}

pub struct TickStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for TickStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TickStore").finish_non_exhaustive()
    }
}

impl TickStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::StorageIo {
                path:   parent.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path).map_err(|e| Error::Storage {
            operation: "open",
            source:    e,
        })?;
        conn.execute_batch(SCHEMA).map_err(|e| Error::Storage {
            operation: "schema",
            source:    e,
        })?;
        debug!(path = %path.display(), "tick store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert ticks for one symbol. A tick whose `(symbol, ts_us, sequence)`
    /// already exists is a no-op. Commits before returning.
    pub fn insert_ticks(&self, symbol: &ContractId, ticks: &[Tick]) -> Result<InsertOutcome> {
        if ticks.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage("insert_ticks"))?;
        let mut outcome = InsertOutcome::default();
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO ticks \
                     (symbol, ts_us, sequence, price, size, bid, ask, bid_size, ask_size, \
                      side, vwap, total_volume, trade_count) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )
                .map_err(storage("insert_ticks"))?;
            for tick in ticks {
                let changed = stmt
                    .execute(params![
                        symbol.as_str(),
                        tick.timestamp_us,
                        tick.sequence,
                        tick.price,
                        tick.size,
                        tick.bid,
                        tick.ask,
                        tick.bid_size,
                        tick.ask_size,
                        side_str(tick.side),
                        tick.vwap,
                        tick.total_volume,
                        tick.trade_count,
                    ])
                    .map_err(storage("insert_ticks"))?;
                if changed > 0 {
                    outcome.inserted += 1;
                } else {
                    outcome.ignored += 1;
                }
            }
        }
        let lo = ticks.iter().map(|t| t.timestamp_us).min().unwrap();
        let hi = ticks.iter().map(|t| t.timestamp_us).max().unwrap();
        extend_coverage(&tx, symbol, Timeframe::Tick, Interval::new(lo, hi + 1))?;
        tx.commit().map_err(storage("insert_ticks"))?;
        Ok(outcome)
    }

    /// Insert daily bars. An existing bar is replaced only when the new row
    /// strictly dominates it: higher volume, or a differing close.
    pub fn insert_bars(
        &self,
        symbol: &ContractId,
        timeframe: Timeframe,
        bars: &[DailyBar],
    ) -> Result<InsertOutcome> {
        if bars.is_empty() {
            return Ok(InsertOutcome::default());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage("insert_bars"))?;
        let mut outcome = InsertOutcome::default();
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO bars \
                     (symbol, timeframe, start_ts, open, high, low, close, volume, open_interest) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(symbol, timeframe, start_ts) DO UPDATE SET \
                       open = excluded.open, high = excluded.high, low = excluded.low, \
                       close = excluded.close, volume = excluded.volume, \
                       open_interest = excluded.open_interest \
                     WHERE excluded.volume > bars.volume OR excluded.close != bars.close",
                )
                .map_err(storage("insert_bars"))?;
            for bar in bars {
                let changed = stmt
                    .execute(params![
                        symbol.as_str(),
                        timeframe.to_string(),
                        day_start_us(bar.date),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        bar.open_interest,
                    ])
                    .map_err(storage("insert_bars"))?;
                if changed > 0 {
                    outcome.inserted += 1;
                } else {
                    outcome.ignored += 1;
                }
            }
        }
        for bar in bars {
            let start = day_start_us(bar.date);
            extend_coverage(&tx, symbol, timeframe, Interval::new(start, start + US_PER_DAY))?;
        }
        tx.commit().map_err(storage("insert_bars"))?;
        Ok(outcome)
    }

    /// Ticks in `[t0, t1)` ordered by `(ts_us, sequence)` insertion order.
    pub fn range_ticks(
        &self,
        symbol: &ContractId,
        range: Interval,
    ) -> Result<Vec<Tick>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT ts_us, sequence, price, size, bid, ask, bid_size, ask_size, side, \
                        vwap, total_volume, trade_count \
                 FROM ticks WHERE symbol = ?1 AND ts_us >= ?2 AND ts_us < ?3 \
                 ORDER BY ts_us, sequence",
            )
            .map_err(storage("range_ticks"))?;
        let rows = stmt
            .query_map(params![symbol.as_str(), range.start, range.end], |row| {
                Ok(Tick {
                    symbol:       symbol.clone(),
                    timestamp_us: row.get(0)?,
                    sequence:     row.get(1)?,
                    price:        row.get(2)?,
                    size:         row.get(3)?,
                    bid:          row.get(4)?,
                    ask:          row.get(5)?,
                    bid_size:     row.get(6)?,
                    ask_size:     row.get(7)?,
                    side:         side_from_row(&row.get::<_, String>(8)?),
                    vwap:         row.get(9)?,
                    total_volume: row.get(10)?,
                    trade_count:  row.get(11)?,
                })
            })
            .map_err(storage("range_ticks"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(storage("range_ticks"))
    }

    /// Bars with start times in `[t0, t1)`, ascending.
    pub fn range_bars(
        &self,
        symbol: &ContractId,
        timeframe: Timeframe,
        range: Interval,
    ) -> Result<Vec<DailyBar>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT start_ts, open, high, low, close, volume, open_interest \
                 FROM bars WHERE symbol = ?1 AND timeframe = ?2 \
                   AND start_ts >= ?3 AND start_ts < ?4 \
                 ORDER BY start_ts",
            )
            .map_err(storage("range_bars"))?;
        let rows = stmt
            .query_map(
                params![symbol.as_str(), timeframe.to_string(), range.start, range.end],
                |row| {
                    Ok(DailyBar {
                        date:          date_from_us(row.get(0)?),
                        open:          row.get(1)?,
                        high:          row.get(2)?,
                        low:           row.get(3)?,
                        close:         row.get(4)?,
                        volume:        row.get(5)?,
                        open_interest: row.get(6)?,
                    })
                },
            )
            .map_err(storage("range_bars"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(storage("range_bars"))
    }

    /// The most recent persisted tick for `symbol`, if any.
    pub fn latest_tick(&self, symbol: &ContractId) -> Result<Option<Tick>> {
        let end = TimestampUs::MAX;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT ts_us FROM ticks WHERE symbol = ?1 ORDER BY ts_us DESC, sequence DESC \
                 LIMIT 1",
            )
            .map_err(storage("latest_tick"))?;
        let ts: Option<TimestampUs> = stmt
            .query_row(params![symbol.as_str()], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })
            .map_err(storage("latest_tick"))?;
        drop(stmt);
        drop(conn);
        match ts {
            None => Ok(None),
            Some(ts) => Ok(self
                .range_ticks(symbol, Interval::new(ts, end))?
                .into_iter()
                .last()),
        }
    }

    pub fn coverage(&self, symbol: &ContractId, timeframe: Timeframe) -> Result<CoverageIndex> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT start_ts, end_ts FROM coverage WHERE symbol = ?1 AND timeframe = ?2",
            )
            .map_err(storage("coverage"))?;
        let rows = stmt
            .query_map(params![symbol.as_str(), timeframe.to_string()], |row| {
                Ok(Interval::new(row.get(0)?, row.get(1)?))
            })
            .map_err(storage("coverage"))?;
        let intervals = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage("coverage"))?;
        Ok(CoverageIndex::from_intervals(intervals))
    }

    /// Symbols that have any persisted data in `timeframe`.
    pub fn symbols(&self, timeframe: Timeframe) -> Result<Vec<ContractId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT DISTINCT symbol FROM coverage WHERE timeframe = ?1")
            .map_err(storage("symbols"))?;
        let rows = stmt
            .query_map(params![timeframe.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage("symbols"))?;
        let mut out = Vec::new();
        for raw in rows {
            let raw = raw.map_err(storage("symbols"))?;
            if let Ok(id) = ContractId::from_str(&raw) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

/// Merge `interval` into the stored coverage rows inside the caller's
/// transaction. Rows are rewritten as a merged set; intervals only grow.
fn extend_coverage(
    tx: &rusqlite::Transaction,
    symbol: &ContractId,
    timeframe: Timeframe,
    interval: Interval,
) -> Result<()> {
    let mut index = {
        let mut stmt = tx
            .prepare_cached(
                "SELECT start_ts, end_ts FROM coverage WHERE symbol = ?1 AND timeframe = ?2",
            )
            .map_err(storage("coverage"))?;
        let rows = stmt
            .query_map(params![symbol.as_str(), timeframe.to_string()], |row| {
                Ok(Interval::new(row.get(0)?, row.get(1)?))
            })
            .map_err(storage("coverage"))?;
        CoverageIndex::from_intervals(
            rows.collect::<Result<Vec<_>, _>>().map_err(storage("coverage"))?,
        )
    };
    index.add(interval);
    tx.execute(
        "DELETE FROM coverage WHERE symbol = ?1 AND timeframe = ?2",
        params![symbol.as_str(), timeframe.to_string()],
    )
    .map_err(storage("coverage"))?;
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO coverage (symbol, timeframe, start_ts, end_ts) VALUES (?1, ?2, ?3, ?4)",
        )
        .map_err(storage("coverage"))?;
    for iv in index.intervals() {
        stmt.execute(params![
            symbol.as_str(),
            timeframe.to_string(),
            iv.start,
            iv.end
        ])
        .map_err(storage("coverage"))?;
    }
    Ok(())
}

fn storage(operation: &'static str) -> impl Fn(rusqlite::Error) -> Error {
    move |source| Error::Storage { operation, source }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "B",
        Side::Sell => "S",
        Side::Unknown => "U",
    }
}

fn side_from_row(raw: &str) -> Side {
    match raw {
        "B" => Side::Buy,
        "S" => Side::Sell,
        _ => Side::Unknown,
    }
}

pub fn day_start_us(date: NaiveDate) -> TimestampUs {
    date.and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_micros()
}

fn date_from_us(ts: TimestampUs) -> NaiveDate {
    chrono::DateTime::from_timestamp_micros(ts)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn store() -> (TempDir, TickStore) {
        let dir = TempDir::new().unwrap();
        let store = TickStore::open(&dir.path().join("market.db")).unwrap();
        (dir, store)
    }

    fn symbol() -> ContractId { "NQU25-CME".parse().unwrap() }

    fn tick(ts: TimestampUs, sequence: u16) -> Tick {
        Tick {
            symbol: symbol(),
            timestamp_us: ts,
            price: 23_432.5,
            size: 2,
            bid: 23_432.0,
            ask: 23_433.0,
            bid_size: 10,
            ask_size: 15,
            side: Side::Buy,
            sequence,
            vwap: 23_432.3,
            total_volume: 1_000,
            trade_count: 400,
        }
    }

    fn bar(day: u32, volume: u64, close: f64) -> DailyBar {
        DailyBar {
            date: NaiveDate::from_ymd_opt(2025, 1, day).unwrap(),
            open: 100.0,
            high: 105.0,
            low: 99.0,
            close,
            volume,
            open_interest: None,
        }
    }

    #[test]
    fn insert_ticks_is_idempotent() {
        let (_dir, store) = store();
        let ticks = vec![tick(1_000, 1), tick(2_000, 2)];
        let first = store.insert_ticks(&symbol(), &ticks).unwrap();
        assert_eq!(first.inserted, 2);
        // inserting the same batch again changes nothing
        let second = store.insert_ticks(&symbol(), &ticks).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.ignored, 2);
        assert_eq!(
            store
                .range_ticks(&symbol(), Interval::new(0, 10_000))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn range_returns_inserted_ticks_in_order() {
        let (_dir, store) = store();
        store
            .insert_ticks(&symbol(), &[tick(3_000, 3), tick(1_000, 1), tick(2_000, 2)])
            .unwrap();
        let ticks = store
            .range_ticks(&symbol(), Interval::new(1_000, 3_000))
            .unwrap();
        assert_eq!(
            ticks.iter().map(|t| t.timestamp_us).collect::<Vec<_>>(),
            vec![1_000, 2_000]
        );
        assert_eq!(ticks[0].side, Side::Buy);
    }

    #[test]
    fn bar_update_requires_domination() {
        let (_dir, store) = store();
        let sym = symbol();
        store
            .insert_bars(&sym, Timeframe::Daily, &[bar(2, 100, 101.0)])
            .unwrap();
        // same volume, same close: no-op
        let outcome = store
            .insert_bars(&sym, Timeframe::Daily, &[bar(2, 100, 101.0)])
            .unwrap();
        assert_eq!(outcome.inserted, 0);
        // higher volume dominates
        let outcome = store
            .insert_bars(&sym, Timeframe::Daily, &[bar(2, 150, 101.0)])
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        // lower volume but different close still dominates
        let outcome = store
            .insert_bars(&sym, Timeframe::Daily, &[bar(2, 50, 102.0)])
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        // lower volume, same close: no-op
        let outcome = store
            .insert_bars(&sym, Timeframe::Daily, &[bar(2, 50, 102.0)])
            .unwrap();
        assert_eq!(outcome.inserted, 0);

        let day = day_start_us(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        let bars = store
            .range_bars(&sym, Timeframe::Daily, Interval::new(day, day + US_PER_DAY))
            .unwrap();
        assert_eq!(bars[0].close, 102.0);
    }

    #[test]
    fn coverage_merges_contiguous_days() {
        let (_dir, store) = store();
        let sym = symbol();
        store
            .insert_bars(&sym, Timeframe::Daily, &[bar(2, 10, 100.0), bar(3, 10, 100.0)])
            .unwrap();
        let coverage = store.coverage(&sym, Timeframe::Daily).unwrap();
        let start = day_start_us(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());
        assert_eq!(
            coverage.intervals(),
            &[Interval::new(start, start + 2 * US_PER_DAY)]
        );
    }

    #[test]
    fn durability_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("market.db");
        {
            let store = TickStore::open(&path).unwrap();
            store.insert_ticks(&symbol(), &[tick(1_000, 1)]).unwrap();
        }
        let store = TickStore::open(&path).unwrap();
        let ticks = store
            .range_ticks(&symbol(), Interval::new(0, 10_000))
            .unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].sequence, 1);
    }

    #[test]
    fn latest_tick_tracks_max_timestamp() {
        let (_dir, store) = store();
        assert!(store.latest_tick(&symbol()).unwrap().is_none());
        store
            .insert_ticks(&symbol(), &[tick(1_000, 1), tick(5_000, 2)])
            .unwrap();
        assert_eq!(
            store.latest_tick(&symbol()).unwrap().unwrap().timestamp_us,
            5_000
        );
    }
}
