//! `.dly` daily bar files: CSV text with a header line and
//! `Date, Open, High, Low, Close, Volume, OpenInterest` records.

use chrono::NaiveDate;

use crate::{bars::DailyBar,
            decode::DecodeWarning,
            error::{Error, Result}};

const DATE_FORMAT: &str = "%Y/%m/%d";
/// A stream with more than this share of malformed rows is rejected
/// outright instead of silently thinning out.
const MAX_MALFORMED_RATIO: f64 = 0.05;

#[derive(Debug, Clone)]
pub struct DailySeries {
    pub bars:     Vec<DailyBar>,
    pub warnings: Vec<DecodeWarning>,
}

/// Decode a `.dly` byte stream into bars sorted ascending by date.
///
/// Malformed rows are skipped and counted; an empty file (or header-only
/// file) decodes to an empty series.
pub fn decode_daily(symbol: &str, bytes: &[u8]) -> Result<DailySeries> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::decode(symbol, format!("not utf-8: {e}")))?;

    let mut bars = Vec::new();
    let mut warnings = Vec::new();
    let mut data_rows = 0usize;

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // header line carries the column names
        if index == 0 && line.to_ascii_lowercase().starts_with("date") {
            continue;
        }
        data_rows += 1;
        match parse_row(line) {
            Ok(bar) => bars.push(bar),
            Err(detail) => warnings.push(DecodeWarning::new(index, detail)),
        }
    }

    if data_rows > 0 {
        let ratio = warnings.len() as f64 / data_rows as f64;
        if ratio > MAX_MALFORMED_RATIO {
            return Err(Error::decode(
                symbol,
                format!(
                    "{} of {} rows malformed, stream rejected",
                    warnings.len(),
                    data_rows
                ),
            ));
        }
    }

    bars.sort_by_key(|b| b.date);
    Ok(DailySeries { bars, warnings })
}

fn parse_row(line: &str) -> Result<DailyBar, String> {
    let mut fields = line.split(',').map(str::trim);
    let date = fields
        .next()
        .ok_or("missing date")
        .and_then(|f| {
            NaiveDate::parse_from_str(f, DATE_FORMAT).map_err(|_| "unparseable date")
        })
        .map_err(str::to_string)?;

    let mut price = |name: &str| -> Result<f64, String> {
        fields
            .next()
            .ok_or_else(|| format!("missing {name}"))?
            .parse::<f64>()
            .map_err(|_| format!("unparseable {name}"))
    };
    let open = price("open")?;
    let high = price("high")?;
    let low = price("low")?;
    let close = price("close")?;

    let volume = fields
        .next()
        .ok_or("missing volume")?
        .parse::<i64>()
        .map_err(|_| "unparseable volume".to_string())?;
    if volume < 0 {
        return Err("negative volume".to_string());
    }
    let open_interest = match fields.next() {
        None | Some("") => None,
        Some(f) => Some(
            f.parse::<u64>()
                .map_err(|_| "unparseable open interest".to_string())?,
        ),
    };

    let bar = DailyBar {
        date,
        open,
        high,
        low,
        close,
        volume: volume as u64,
        open_interest,
    };
    if !bar.is_coherent() {
        return Err("incoherent ohlc range".to_string());
    }
    Ok(bar)
}

/// Canonical serializer for one bar, the inverse of [`decode_daily`] row
/// parsing.
pub fn encode_row(bar: &DailyBar) -> String {
    match bar.open_interest {
        Some(oi) => format!(
            "{}, {}, {}, {}, {}, {}, {}",
            bar.date.format(DATE_FORMAT),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            oi
        ),
        None => format!(
            "{}, {}, {}, {}, {}, {}, ",
            bar.date.format(DATE_FORMAT),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume
        ),
    }
}

pub const HEADER_ROW: &str = "Date, Open, High, Low, Close, Volume, OpenInterest";

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = "Date, Open, High, Low, Close, Volume, OpenInterest\n\
                          2025/01/02, 21301.25, 21410.5, 21250.0, 21388.75, 540210, 251000\n\
                          2025/01/03, 21390.0, 21455.25, 21344.5, 21401.0, 498332, 249800\n";

    #[test]
    fn decodes_ordered_bars() {
        let series = decode_daily("NQU25-CME", SAMPLE.as_bytes()).unwrap();
        assert_eq!(series.bars.len(), 2);
        assert!(series.warnings.is_empty());
        assert_eq!(
            series.bars[0].date,
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
        );
        assert_eq!(series.bars[0].volume, 540_210);
        assert_eq!(series.bars[1].close, 21_401.0);
    }

    #[test]
    fn sorts_out_of_order_input() {
        let shuffled = "Date, Open, High, Low, Close, Volume, OpenInterest\n\
                        2025/01/03, 21390.0, 21455.25, 21344.5, 21401.0, 498332, 249800\n\
                        2025/01/02, 21301.25, 21410.5, 21250.0, 21388.75, 540210, 251000\n";
        let series = decode_daily("NQU25-CME", shuffled.as_bytes()).unwrap();
        assert!(series.bars[0].date < series.bars[1].date);
    }

    #[test]
    fn empty_file_is_empty_series() {
        let series = decode_daily("NQU25-CME", b"").unwrap();
        assert!(series.bars.is_empty());
        assert!(series.warnings.is_empty());

        let header_only = decode_daily("NQU25-CME", HEADER_ROW.as_bytes()).unwrap();
        assert!(header_only.bars.is_empty());
    }

    #[test]
    fn malformed_row_is_skipped_with_warning() {
        // 21 good rows keep the bad one under the rejection threshold
        let mut input = String::from(HEADER_ROW);
        input.push('\n');
        for day in 1..=21 {
            input.push_str(&format!(
                "2025/03/{day:02}, 100.0, 101.0, 99.0, 100.5, 10, 5\n"
            ));
        }
        input.push_str("2025/04/01, 100.0, 99.0, 101.0, 100.5, 10, 5\n"); // low > high

        let series = decode_daily("NQU25-CME", input.as_bytes()).unwrap();
        assert_eq!(series.bars.len(), 21);
        assert_eq!(series.warnings.len(), 1);
        assert_eq!(series.warnings[0].detail, "incoherent ohlc range");
    }

    #[test]
    fn mostly_malformed_stream_is_rejected() {
        let input = "Date, Open, High, Low, Close, Volume, OpenInterest\n\
                     2025/01/02, x, 101.0, 99.0, 100.5, 10, 5\n\
                     2025/01/03, 100.0, 101.0, 99.0, 100.5, 10, 5\n";
        assert!(decode_daily("NQU25-CME", input.as_bytes()).is_err());
    }

    #[test]
    fn negative_volume_is_malformed() {
        let mut input = String::from(HEADER_ROW);
        input.push('\n');
        for day in 1..=20 {
            input.push_str(&format!(
                "2025/03/{day:02}, 100.0, 101.0, 99.0, 100.5, 10, 5\n"
            ));
        }
        input.push_str("2025/04/01, 100.0, 101.0, 99.0, 100.5, -3, 5\n");
        let series = decode_daily("NQU25-CME", input.as_bytes()).unwrap();
        assert_eq!(series.warnings.len(), 1);
        assert_eq!(series.warnings[0].detail, "negative volume");
    }

    #[test]
    fn encode_decode_round_trip() {
        let series = decode_daily("NQU25-CME", SAMPLE.as_bytes()).unwrap();
        for bar in &series.bars {
            let row = encode_row(bar);
            let mut rebuilt = String::from(HEADER_ROW);
            rebuilt.push('\n');
            rebuilt.push_str(&row);
            let again = decode_daily("NQU25-CME", rebuilt.as_bytes()).unwrap();
            assert_eq!(&again.bars[..], &[*bar]);
        }
    }
}
