//! Trade — a completed round trip, and NoTrade — a signal that could not be entered.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::signal::Side;

/// The rule that closed an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    ProfitTarget,
    TrailingStop,
    TimeBasedClose,
    EndOfSession,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TimeBasedClose => "time_based_close",
            ExitReason::EndOfSession => "end_of_session",
        }
    }
}

/// A scale-out that closed part of the position before the final exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialExit {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub quantity: f64,
    pub reason: ExitReason,
    pub pnl: f64,
}

/// A complete round-trip trade record: entry → exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    // ── Identification ──
    pub instrument: String,
    pub session_date: NaiveDate,
    pub side: Side,
    pub policy: String,
    pub signal_timestamp: DateTime<Utc>,

    // ── Entry ──
    pub entry_timestamp: DateTime<Utc>,
    pub entry_price: f64,

    // ── Exit ──
    pub exit_timestamp: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: ExitReason,

    // ── Size ──
    /// Quantity at entry, including any part later scaled out.
    pub quantity: f64,

    // ── PnL ──
    /// Realized P&L over the whole position, partial exits included.
    pub pnl: f64,
    /// `pnl` as a percentage of entry notional.
    pub pnl_pct: f64,

    // ── Duration / excursion ──
    pub bars_held: usize,
    pub highest_price: f64,
    pub lowest_price: f64,

    #[serde(default)]
    pub partial_exits: Vec<PartialExit>,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.pnl > 0.0
    }
}

/// Why a signal never became a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoTradeReason {
    SignalTooLateInSession,
    /// The entry bar's reference price was zero, negative or not finite.
    InvalidEntryPrice,
}

/// A signal that resolved without an entry. Not an error and not a losing trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoTrade {
    pub instrument: String,
    pub session_date: NaiveDate,
    pub signal_timestamp: DateTime<Utc>,
    pub reason: NoTradeReason,
}
