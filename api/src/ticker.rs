use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{symbols::ContractId, MarketDataValueType, SequenceNo, TimestampUs};

/// Half of the 16-bit sequence space. Jumps inside `(0, HALF]` are forward
/// progress; anything larger reads as a backward jump.
pub const SEQUENCE_FORWARD_WINDOW: u16 = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Default for Side {
    fn default() -> Self { Self::Unknown }
}

impl FromStr for Side {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let res = match s {
            "B" | "BUY" | "Buy" => Self::Buy,
            "S" | "SELL" | "Sell" => Self::Sell,
            _ => Self::Unknown,
        };
        Ok(res)
    }
}

/// A single trade or quote update. Immutable once created; persisted by the
/// store and delivered to subscribers in timestamp order per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol:       ContractId,
    pub timestamp_us: TimestampUs,
    pub price:        MarketDataValueType,
    pub size:         u32,
    /// Zero when unknown.
    pub bid:          MarketDataValueType,
    pub ask:          MarketDataValueType,
    pub bid_size:     u32,
    pub ask_size:     u32,
    pub side:         Side,
    /// Producer session sequence, wraps at 2^16.
    pub sequence:     SequenceNo,
    /// Producer-computed rolling vwap.
    pub vwap:         MarketDataValueType,
    /// Monotonically non-decreasing within a producer session.
    pub total_volume: u64,
    pub trade_count:  u64,
}

/// Relationship between two sequence numbers under modulo-2^16 arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStep {
    Duplicate,
    /// `k` steps ahead, `k` in `[1, 32768]`.
    Forward(u16),
    /// Behind, or ahead by more than half the space.
    Backward,
}

/// Classify `new` against `last` treating wrap-around as forward progress.
pub fn sequence_step(last: SequenceNo, new: SequenceNo) -> SequenceStep {
    let delta = new.wrapping_sub(last);
    if delta == 0 {
        SequenceStep::Duplicate
    } else if delta <= SEQUENCE_FORWARD_WINDOW {
        SequenceStep::Forward(delta)
    } else {
        SequenceStep::Backward
    }
}
