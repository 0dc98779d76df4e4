use std::{fmt::{Display, Formatter},
          str::FromStr};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{error::Error, MarketDataValueType};

/// Resolution of a stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    Tick,
    Daily,
}

impl Display for Timeframe {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Tick => write!(f, "tick"),
            Self::Daily => write!(f, "daily"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "tick" => Ok(Self::Tick),
            "daily" => Ok(Self::Daily),
            _ => Err(Error::decode(s, "unknown timeframe")),
        }
    }
}

/// OHLCV record at daily resolution, dated in the exchange time zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date:          NaiveDate,
    pub open:          MarketDataValueType,
    pub high:          MarketDataValueType,
    pub low:           MarketDataValueType,
    pub close:         MarketDataValueType,
    pub volume:        u64,
    pub open_interest: Option<u64>,
}

impl DailyBar {
    /// OHLC sanity: low ≤ open, close ≤ high and low ≤ high.
    pub fn is_coherent(&self) -> bool {
        self.low <= self.high
            && self.open >= self.low
            && self.open <= self.high
            && self.close >= self.low
            && self.close <= self.high
    }
}
