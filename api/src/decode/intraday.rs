//! `.scid` intraday files: a fixed 56-byte header followed by fixed 40-byte
//! little-endian records.
//!
//! True tick records carry `open == 0.0` with `high`/`low` holding the
//! ask/bid at the trade and `close` the trade price; anything else is an
//! aggregated bar. The record epoch comes from the header of each file and
//! is never assumed.

use bytes::Buf;

use crate::{decode::DecodeWarning,
            error::{Error, Result},
            MarketDataValueType,
            TimestampUs};

pub const SCID_MAGIC: [u8; 4] = *b"SCID";
pub const SCID_HEADER_LEN: usize = 56;
pub const SCID_RECORD_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScidHeader {
    pub header_len: u32,
    pub record_len: u32,
    pub version:    u16,
    /// Microseconds between the Unix epoch and the file's record epoch.
    pub epoch_us:   i64,
}

impl ScidHeader {
    pub fn decode(symbol: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SCID_HEADER_LEN {
            return Err(Error::decode(symbol, "truncated header"));
        }
        let mut buf = &bytes[..SCID_HEADER_LEN];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SCID_MAGIC {
            return Err(Error::decode(symbol, format!("unknown magic {magic:02x?}")));
        }
        let header_len = buf.get_u32_le();
        let record_len = buf.get_u32_le();
        if header_len as usize != SCID_HEADER_LEN || record_len as usize != SCID_RECORD_LEN {
            return Err(Error::decode(
                symbol,
                format!("unsupported layout: header {header_len}, record {record_len}"),
            ));
        }
        let version = buf.get_u16_le();
        let _unused = buf.get_u16_le();
        let epoch_us = buf.get_i64_le();
        Ok(Self {
            header_len,
            record_len,
            version,
            epoch_us,
        })
    }

    /// Byte offset of record `index`.
    pub const fn record_offset(&self, index: u64) -> u64 {
        self.header_len as u64 + index * self.record_len as u64
    }

    /// Whole records contained in a file of `file_len` bytes.
    pub const fn record_count(&self, file_len: u64) -> u64 {
        if file_len <= self.header_len as u64 {
            0
        } else {
            (file_len - self.header_len as u64) / self.record_len as u64
        }
    }
}

/// A trade with the quote captured at execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScidTick {
    pub timestamp_us: TimestampUs,
    pub price:        MarketDataValueType,
    pub bid:          MarketDataValueType,
    pub ask:          MarketDataValueType,
    pub volume:       u32,
    pub num_trades:   u32,
    pub bid_volume:   u32,
    pub ask_volume:   u32,
}

/// An aggregated bar row stored among tick records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScidBar {
    pub timestamp_us: TimestampUs,
    pub open:         MarketDataValueType,
    pub high:         MarketDataValueType,
    pub low:          MarketDataValueType,
    pub close:        MarketDataValueType,
    pub volume:       u32,
    pub num_trades:   u32,
    pub bid_volume:   u32,
    pub ask_volume:   u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScidRecord {
    Tick(ScidTick),
    Bar(ScidBar),
}

impl ScidRecord {
    pub const fn timestamp_us(&self) -> TimestampUs {
        match self {
            Self::Tick(t) => t.timestamp_us,
            Self::Bar(b) => b.timestamp_us,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScidSeries {
    pub records:  Vec<ScidRecord>,
    pub warnings: Vec<DecodeWarning>,
}

/// Decode a whole file, header included.
pub fn decode_scid(symbol: &str, bytes: &[u8]) -> Result<ScidSeries> {
    let header = ScidHeader::decode(symbol, bytes)?;
    Ok(decode_records(
        &header,
        &bytes[header.header_len as usize..],
    ))
}

/// Decode a byte range of whole records (no header), as produced by a
/// range-read. Timestamps come out absolute, with the header epoch applied.
///
/// A trailing partial record is discarded with a warning; the valid prefix
/// is returned.
pub fn decode_records(header: &ScidHeader, bytes: &[u8]) -> ScidSeries {
    let mut buf = bytes;
    let mut records = Vec::with_capacity(bytes.len() / SCID_RECORD_LEN);
    let mut warnings = Vec::new();

    while buf.remaining() >= SCID_RECORD_LEN {
        let raw_ts = buf.get_i64_le();
        let open = buf.get_f32_le();
        let high = buf.get_f32_le();
        let low = buf.get_f32_le();
        let close = buf.get_f32_le();
        let num_trades = buf.get_u32_le();
        let total_volume = buf.get_u32_le();
        let bid_volume = buf.get_u32_le();
        let ask_volume = buf.get_u32_le();

        let timestamp_us = header.epoch_us + raw_ts;
        // open == 0.0 is the tick sentinel
        let record = if open == 0.0 {
            ScidRecord::Tick(ScidTick {
                timestamp_us,
                price: close as MarketDataValueType,
                bid: low as MarketDataValueType,
                ask: high as MarketDataValueType,
                volume: total_volume,
                num_trades,
                bid_volume,
                ask_volume,
            })
        } else {
            ScidRecord::Bar(ScidBar {
                timestamp_us,
                open: open as MarketDataValueType,
                high: high as MarketDataValueType,
                low: low as MarketDataValueType,
                close: close as MarketDataValueType,
                volume: total_volume,
                num_trades,
                bid_volume,
                ask_volume,
            })
        };
        records.push(record);
    }

    if buf.has_remaining() {
        warnings.push(DecodeWarning::new(
            records.len(),
            format!("partial trailing record of {} bytes discarded", buf.remaining()),
        ));
    }

    ScidSeries { records, warnings }
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::BufMut;
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn encode_header(epoch_us: i64) -> Vec<u8> {
        let mut out = Vec::with_capacity(SCID_HEADER_LEN);
        out.put_slice(&SCID_MAGIC);
        out.put_u32_le(SCID_HEADER_LEN as u32);
        out.put_u32_le(SCID_RECORD_LEN as u32);
        out.put_u16_le(1); // version
        out.put_u16_le(0);
        out.put_i64_le(epoch_us);
        out.resize(SCID_HEADER_LEN, 0);
        out
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn encode_record(
        out: &mut Vec<u8>,
        raw_ts: i64,
        open: f32,
        high: f32,
        low: f32,
        close: f32,
        num_trades: u32,
        total_volume: u32,
        bid_volume: u32,
        ask_volume: u32,
    ) {
        out.put_i64_le(raw_ts);
        out.put_f32_le(open);
        out.put_f32_le(high);
        out.put_f32_le(low);
        out.put_f32_le(close);
        out.put_u32_le(num_trades);
        out.put_u32_le(total_volume);
        out.put_u32_le(bid_volume);
        out.put_u32_le(ask_volume);
    }

    pub(crate) fn tick_file(epoch_us: i64, ticks: &[(i64, f32, f32, f32, u32)]) -> Vec<u8> {
        let mut out = encode_header(epoch_us);
        for &(ts, price, bid, ask, volume) in ticks {
            encode_record(&mut out, ts, 0.0, ask, bid, price, 1, volume, 0, 0);
        }
        out
    }

    #[test]
    fn decodes_tick_records_with_epoch() {
        let epoch = 1_700_000_000_000_000;
        let file = tick_file(epoch, &[
            (10, 23_432.5, 23_432.0, 23_433.0, 3),
            (25, 23_433.0, 23_432.5, 23_433.5, 1),
        ]);
        let series = decode_scid("NQU25-CME", &file).unwrap();
        assert!(series.warnings.is_empty());
        assert_eq!(series.records.len(), 2);
        match series.records[0] {
            ScidRecord::Tick(t) => {
                assert_eq!(t.timestamp_us, epoch + 10);
                assert_eq!(t.price, 23_432.5);
                assert_eq!(t.bid, 23_432.0);
                assert_eq!(t.ask, 23_433.0);
                assert_eq!(t.volume, 3);
            },
            ScidRecord::Bar(_) => panic!("expected a tick record"),
        }
    }

    #[test]
    fn nonzero_open_is_a_bar() {
        let mut file = encode_header(0);
        encode_record(&mut file, 1_000, 100.0, 104.0, 99.0, 103.0, 12, 400, 180, 220);
        let series = decode_scid("NQU25-CME", &file).unwrap();
        match series.records[0] {
            ScidRecord::Bar(b) => {
                assert_eq!(b.open, 100.0);
                assert_eq!(b.close, 103.0);
                assert_eq!(b.volume, 400);
            },
            ScidRecord::Tick(_) => panic!("expected a bar record"),
        }
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut file = encode_header(0);
        file[0] = b'X';
        assert!(decode_scid("NQU25-CME", &file).is_err());
    }

    #[test]
    fn partial_trailing_record_is_discarded() {
        let mut file = tick_file(0, &[(10, 1.0, 0.9, 1.1, 1)]);
        file.extend_from_slice(&[0u8; 17]); // not a whole record
        let series = decode_scid("NQU25-CME", &file).unwrap();
        assert_eq!(series.records.len(), 1);
        assert_eq!(series.warnings.len(), 1);
        assert!(series.warnings[0].detail.contains("partial trailing"));
    }

    #[test]
    fn range_decode_without_header() {
        let epoch = 500;
        let header = ScidHeader::decode("NQU25-CME", &encode_header(epoch)).unwrap();
        let mut body = Vec::new();
        encode_record(&mut body, 7, 0.0, 2.0, 1.0, 1.5, 1, 2, 0, 0);
        let series = decode_records(&header, &body);
        assert_eq!(series.records[0].timestamp_us(), epoch + 7);
    }

    #[test]
    fn record_arithmetic() {
        let header = ScidHeader::decode("NQU25-CME", &encode_header(0)).unwrap();
        assert_eq!(header.record_offset(0), 56);
        assert_eq!(header.record_offset(3), 56 + 120);
        assert_eq!(header.record_count(56), 0);
        assert_eq!(header.record_count(56 + 40 * 5 + 13), 5);
    }
}
