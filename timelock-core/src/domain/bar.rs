//! Bar — the fundamental market data unit.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Bar granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Minute1,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Daily,
}

impl Timeframe {
    /// Nominal spacing between two consecutive bars of this timeframe.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Timeframe::Minute1 => chrono::Duration::minutes(1),
            Timeframe::Minute5 => chrono::Duration::minutes(5),
            Timeframe::Minute15 => chrono::Duration::minutes(15),
            Timeframe::Minute30 => chrono::Duration::minutes(30),
            Timeframe::Hour1 => chrono::Duration::hours(1),
            Timeframe::Daily => chrono::Duration::days(1),
        }
    }

    pub fn is_intraday(&self) -> bool {
        !matches!(self, Timeframe::Daily)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Daily => "1d",
        }
    }

    /// Parse the short form used in CSV files ("5m", "1d", ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1m" | "minute1" => Some(Timeframe::Minute1),
            "5m" | "minute5" => Some(Timeframe::Minute5),
            "15m" | "minute15" => Some(Timeframe::Minute15),
            "30m" | "minute30" => Some(Timeframe::Minute30),
            "1h" | "hour1" => Some(Timeframe::Hour1),
            "1d" | "daily" => Some(Timeframe::Daily),
            _ => None,
        }
    }
}

/// Whether a bar printed during regular trading hours or extended hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Regular,
    Extended,
}

/// OHLCV bar for a single instrument at a single instant.
///
/// Bars are immutable once read from the store; the engine only ever borrows them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub timeframe: Timeframe,
    pub session: SessionKind,
}

impl Bar {
    /// Returns true if any OHLC field is NaN (void bar).
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic OHLC sanity check: high >= low, high >= open, high >= close, etc.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
    }

    pub fn is_regular(&self) -> bool {
        self.session == SessionKind::Regular
    }

    /// Trading date of this bar in the exchange's local time.
    pub fn local_date(&self, offset: FixedOffset) -> NaiveDate {
        self.timestamp.with_timezone(&offset).date_naive()
    }

    /// Wall-clock time of this bar in the exchange's local time.
    pub fn local_time(&self, offset: FixedOffset) -> NaiveTime {
        self.timestamp.with_timezone(&offset).time()
    }
}
