//! Execution simulator: turns one signal plus the session's bars into a
//! `Trade` or a `NoTrade`.
//!
//! Per candidate: `AwaitingEntry → Open → Closed`.
//!
//! - Entry is the first bar strictly after the signal bar, never the signal
//!   bar itself.
//! - While open, every bar (starting with the entry bar) checks exits in a
//!   fixed order: stop-loss, profit target, trailing stop, session-close
//!   cutoff. The first that triggers wins; magnitude never matters.
//! - Stops and targets gapped through at the open fill at the open.
//! - Running out of bars closes at the last close (`EndOfSession`).
//!
//! The simulator is pure: same inputs, same record.

use chrono::{FixedOffset, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::domain::{Bar, ExitReason, NoTrade, NoTradeReason, PartialExit, Side, Signal, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPrice {
    /// Open of the entry bar.
    #[default]
    NextBarOpen,
    /// The price carried by the signal.
    SignalPrice,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStop {
    /// Favorable closes required before the trail arms.
    pub activate_after_bars: usize,
    /// Distance from the prior bar's favorable extreme (fraction).
    pub trail_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialTarget {
    pub target_pct: f64,
    /// Share of the position closed at the first touch.
    pub fraction: f64,
}

/// Exit rules. Percentages are fractions (0.02 = 2%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionPolicy {
    pub name: String,
    pub stop_pct: Option<f64>,
    pub target_pct: Option<f64>,
    pub trailing: Option<TrailingStop>,
    /// Local wall-clock cutoff; no entries at or after it, open positions
    /// close at the first bar at or after it.
    pub session_close: Option<NaiveTime>,
    pub entry_price: EntryPrice,
    pub position_notional: f64,
    pub partial: Option<PartialTarget>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            name: "default".into(),
            stop_pct: Some(0.02),
            target_pct: Some(0.04),
            trailing: None,
            session_close: NaiveTime::from_hms_opt(15, 55, 0),
            entry_price: EntryPrice::NextBarOpen,
            position_notional: 10_000.0,
            partial: None,
        }
    }
}

impl ExecutionPolicy {
    /// Reasons this policy cannot be simulated, if any.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut pct = |label: &str, value: Option<f64>| {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0 && v < 1.0) {
                    problems.push(format!("{label} must be in (0, 1), got {v}"));
                }
            }
        };
        pct("stop_pct", self.stop_pct);
        pct("target_pct", self.target_pct);
        pct("trailing.trail_pct", self.trailing.map(|t| t.trail_pct));
        pct("partial.target_pct", self.partial.map(|p| p.target_pct));
        pct("partial.fraction", self.partial.map(|p| p.fraction));
        if !(self.position_notional.is_finite() && self.position_notional > 0.0) {
            problems.push(format!("position_notional must be positive, got {}", self.position_notional));
        }
        problems
    }
}

/// Result of simulating one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOutcome {
    Trade(Trade),
    NoTrade(NoTrade),
}

/// Stop level that may tighten, never loosen.
#[derive(Debug, Clone, Copy)]
struct Ratchet {
    side: Side,
    level: Option<f64>,
}

impl Ratchet {
    fn new(side: Side) -> Self {
        Self { side, level: None }
    }

    fn apply(&mut self, proposed: f64) -> f64 {
        let next = match (self.level, self.side) {
            (None, _) => proposed,
            (Some(current), Side::Long) => current.max(proposed),
            (Some(current), Side::Short) => current.min(proposed),
        };
        self.level = Some(next);
        next
    }
}

/// Bookkeeping for an open position.
struct OpenPosition {
    side: Side,
    entry_price: f64,
    quantity: f64,
    remaining: f64,
    realized: f64,
    highest: f64,
    lowest: f64,
    favorable_closes: usize,
    trail: Ratchet,
    partial_exits: Vec<PartialExit>,
}

impl OpenPosition {
    fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        (price - self.entry_price) * self.side.sign() * quantity
    }
}

/// True when `level` is reached adversely (stop) on this bar.
fn stop_hit(side: Side, bar: &Bar, level: f64) -> bool {
    match side {
        Side::Long => bar.low <= level,
        Side::Short => bar.high >= level,
    }
}

/// True when `level` is reached favorably (target) on this bar.
fn target_hit(side: Side, bar: &Bar, level: f64) -> bool {
    match side {
        Side::Long => bar.high >= level,
        Side::Short => bar.low <= level,
    }
}

/// Fill for a stop: at the level, or at the open when the bar gapped past it.
fn stop_fill(side: Side, bar: &Bar, level: f64) -> f64 {
    match side {
        Side::Long if bar.open < level => bar.open,
        Side::Short if bar.open > level => bar.open,
        _ => level,
    }
}

/// Fill for a target: at the level, or at the (better) open on a gap.
fn target_fill(side: Side, bar: &Bar, level: f64) -> f64 {
    match side {
        Side::Long if bar.open > level => bar.open,
        Side::Short if bar.open < level => bar.open,
        _ => level,
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSimulator {
    policy: ExecutionPolicy,
    offset: FixedOffset,
}

impl ExecutionSimulator {
    /// `offset` converts bar timestamps to the local time `session_close` is in.
    pub fn new(policy: ExecutionPolicy, offset: FixedOffset) -> Self {
        Self { policy, offset }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    fn at_or_after_close(&self, bar: &Bar) -> bool {
        self.policy
            .session_close
            .is_some_and(|close| bar.local_time(self.offset) >= close)
    }

    /// Simulate `signal` against the session's bars (ascending).
    pub fn simulate(&self, signal: &Signal, session: &[Bar], session_date: NaiveDate) -> SimOutcome {
        let no_trade = |reason: NoTradeReason| {
            SimOutcome::NoTrade(NoTrade {
                instrument: signal.instrument.clone(),
                session_date,
                signal_timestamp: signal.timestamp,
                reason,
            })
        };
        let too_late = || no_trade(NoTradeReason::SignalTooLateInSession);

        // AwaitingEntry
        let entry_idx = session.partition_point(|b| b.timestamp <= signal.timestamp);
        let Some(entry_bar) = session.get(entry_idx) else {
            return too_late();
        };
        if self.at_or_after_close(entry_bar) {
            return too_late();
        }

        let entry_price = match self.policy.entry_price {
            EntryPrice::NextBarOpen => entry_bar.open,
            EntryPrice::SignalPrice => signal.price,
        };
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return no_trade(NoTradeReason::InvalidEntryPrice);
        }
        let quantity = (self.policy.position_notional / entry_price).floor().max(1.0);
        let side = signal.side;

        let stop = self.policy.stop_pct.map(|p| entry_price * (1.0 - side.sign() * p));
        let target = self.policy.target_pct.map(|p| entry_price * (1.0 + side.sign() * p));
        let partial_level = self
            .policy
            .partial
            .map(|p| (entry_price * (1.0 + side.sign() * p.target_pct), p.fraction));

        let mut pos = OpenPosition {
            side,
            entry_price,
            quantity,
            remaining: quantity,
            realized: 0.0,
            highest: entry_price,
            lowest: entry_price,
            favorable_closes: 0,
            trail: Ratchet::new(side),
            partial_exits: Vec::new(),
        };

        // Open
        let mut exit: Option<(usize, f64, ExitReason)> = None;
        for (idx, bar) in session.iter().enumerate().skip(entry_idx) {
            pos.highest = pos.highest.max(bar.high);
            pos.lowest = pos.lowest.min(bar.low);

            if let Some(level) = stop.filter(|&l| stop_hit(side, bar, l)) {
                exit = Some((idx, stop_fill(side, bar, level), ExitReason::StopLoss));
                break;
            }

            if let Some((level, fraction)) = partial_level {
                if pos.partial_exits.is_empty() && target_hit(side, bar, level) {
                    let price = target_fill(side, bar, level);
                    let qty = (pos.quantity * fraction).floor().min(pos.remaining - 1.0);
                    if qty >= 1.0 {
                        let pnl = pos.pnl_at(price, qty);
                        pos.realized += pnl;
                        pos.remaining -= qty;
                        pos.partial_exits.push(PartialExit {
                            timestamp: bar.timestamp,
                            price,
                            quantity: qty,
                            reason: ExitReason::ProfitTarget,
                            pnl,
                        });
                    }
                }
            }

            if let Some(level) = target.filter(|&l| target_hit(side, bar, l)) {
                exit = Some((idx, target_fill(side, bar, level), ExitReason::ProfitTarget));
                break;
            }

            if let Some(level) = pos.trail.level {
                if stop_hit(side, bar, level) {
                    exit = Some((idx, stop_fill(side, bar, level), ExitReason::TrailingStop));
                    break;
                }
            }

            if self.at_or_after_close(bar) {
                exit = Some((idx, bar.open, ExitReason::TimeBasedClose));
                break;
            }

            // The trail for the next bar comes from this bar's favorable extreme.
            if let Some(trailing) = self.policy.trailing {
                if (bar.close - entry_price) * side.sign() > 0.0 {
                    pos.favorable_closes += 1;
                }
                if pos.favorable_closes >= trailing.activate_after_bars {
                    let proposed = match side {
                        Side::Long => bar.high * (1.0 - trailing.trail_pct),
                        Side::Short => bar.low * (1.0 + trailing.trail_pct),
                    };
                    let level = pos.trail.apply(proposed);
                    trace!(instrument = %signal.instrument, level, "trailing stop moved");
                }
            }
        }

        // Closed
        let (exit_idx, exit_price, exit_reason) = match exit {
            Some(exit) => exit,
            None => {
                let last = session.len() - 1;
                (last, session[last].close, ExitReason::EndOfSession)
            }
        };

        let pnl = pos.realized + pos.pnl_at(exit_price, pos.remaining);
        let notional = entry_price * pos.quantity;
        SimOutcome::Trade(Trade {
            instrument: signal.instrument.clone(),
            session_date,
            side,
            policy: self.policy.name.clone(),
            signal_timestamp: signal.timestamp,
            entry_timestamp: entry_bar.timestamp,
            entry_price,
            exit_timestamp: session[exit_idx].timestamp,
            exit_price,
            exit_reason,
            quantity: pos.quantity,
            pnl,
            pnl_pct: pnl / notional * 100.0,
            bars_held: exit_idx - entry_idx + 1,
            highest_price: pos.highest,
            lowest_price: pos.lowest,
            partial_exits: pos.partial_exits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SessionKind, Timeframe};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn t(i: i64) -> DateTime<Utc> {
        // 09:30 local at UTC-5.
        Utc.with_ymd_and_hms(2024, 6, 3, 14, 30, 0).unwrap() + Duration::minutes(5 * i)
    }

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            instrument: "AAA".into(),
            timestamp: t(i),
            open,
            high,
            low,
            close,
            volume: 1_000,
            timeframe: Timeframe::Minute5,
            session: SessionKind::Regular,
        }
    }

    fn sim(policy: ExecutionPolicy) -> ExecutionSimulator {
        ExecutionSimulator::new(policy, FixedOffset::west_opt(5 * 3600).unwrap())
    }

    fn trade(outcome: SimOutcome) -> Trade {
        match outcome {
            SimOutcome::Trade(t) => t,
            SimOutcome::NoTrade(n) => panic!("expected trade, got {n:?}"),
        }
    }

    fn stop_only(stop: f64) -> ExecutionPolicy {
        ExecutionPolicy { stop_pct: Some(stop), target_pct: None, session_close: None, ..Default::default() }
    }

    #[test]
    fn reference_scenario_ends_at_session_close() {
        let bars = vec![
            bar(0, 100.0, 100.5, 99.5, 100.0),
            bar(1, 100.0, 101.5, 99.8, 101.0),
            bar(2, 101.0, 101.2, 98.8, 99.0),
            bar(3, 98.0, 98.6, 97.6, 98.0),
            bar(4, 98.0, 98.2, 96.5, 97.0),
        ];
        let signal = Signal::new("AAA", t(2), Side::Long, 99.0);
        let tr = trade(sim(stop_only(0.02)).simulate(&signal, &bars, date()));
        assert_eq!(tr.entry_timestamp, t(3));
        assert_eq!(tr.entry_price, 98.0);
        assert_eq!(tr.exit_timestamp, t(4));
        assert_eq!(tr.exit_price, 97.0);
        assert_eq!(tr.exit_reason, ExitReason::EndOfSession);
        assert!((tr.pnl_pct - (-1.0204)).abs() < 1e-3);
        assert_eq!(tr.quantity, 102.0);
        assert_eq!(tr.bars_held, 2);
    }

    #[test]
    fn stop_beats_target_on_same_bar_long() {
        let bars = vec![bar(0, 100.0, 100.0, 100.0, 100.0), bar(1, 100.0, 110.0, 90.0, 100.0)];
        let policy = ExecutionPolicy { session_close: None, ..Default::default() };
        let tr = trade(sim(policy).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date()));
        assert_eq!(tr.exit_reason, ExitReason::StopLoss);
        assert!((tr.exit_price - 98.0).abs() < 1e-9);
    }

    #[test]
    fn stop_beats_target_on_same_bar_short() {
        let bars = vec![bar(0, 100.0, 100.0, 100.0, 100.0), bar(1, 100.0, 110.0, 90.0, 100.0)];
        let policy = ExecutionPolicy { session_close: None, ..Default::default() };
        let tr = trade(sim(policy).simulate(&Signal::new("AAA", t(0), Side::Short, 100.0), &bars, date()));
        assert_eq!(tr.exit_reason, ExitReason::StopLoss);
        assert!((tr.exit_price - 102.0).abs() < 1e-9);
        assert!(tr.pnl < 0.0);
    }

    #[test]
    fn gap_through_stop_fills_at_open() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.5, 99.5, 100.0),
            bar(2, 95.0, 95.5, 94.0, 95.0),
        ];
        let tr = trade(sim(stop_only(0.02)).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date()));
        assert_eq!(tr.exit_reason, ExitReason::StopLoss);
        assert_eq!(tr.exit_price, 95.0);
    }

    #[test]
    fn signal_on_last_bar_is_no_trade() {
        let bars = vec![bar(0, 100.0, 100.0, 100.0, 100.0), bar(1, 100.0, 100.0, 100.0, 100.0)];
        let outcome = sim(ExecutionPolicy::default()).simulate(&Signal::new("AAA", t(1), Side::Long, 100.0), &bars, date());
        assert!(matches!(
            outcome,
            SimOutcome::NoTrade(NoTrade { reason: NoTradeReason::SignalTooLateInSession, .. })
        ));
    }

    #[test]
    fn non_positive_entry_open_is_invalid_entry_price() {
        let bars = vec![bar(0, 100.0, 100.0, 100.0, 100.0), bar(1, 0.0, 100.0, 0.0, 100.0)];
        let outcome = sim(ExecutionPolicy::default()).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date());
        assert!(matches!(
            outcome,
            SimOutcome::NoTrade(NoTrade { reason: NoTradeReason::InvalidEntryPrice, .. })
        ));
    }

    #[test]
    fn entry_at_or_after_cutoff_is_no_trade() {
        // Bars at 09:30, 09:35, 09:40 local; cutoff 09:35.
        let bars: Vec<Bar> = (0..3).map(|i| bar(i, 100.0, 100.0, 100.0, 100.0)).collect();
        let policy = ExecutionPolicy { session_close: NaiveTime::from_hms_opt(9, 35, 0), ..Default::default() };
        let outcome = sim(policy).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date());
        assert!(matches!(outcome, SimOutcome::NoTrade(_)));
    }

    #[test]
    fn time_based_close_at_cutoff_open() {
        let bars: Vec<Bar> = (0..6).map(|i| bar(i, 100.0 + i as f64 * 0.1, 100.6, 99.9, 100.0)).collect();
        // Cutoff at 09:45 local = bar 3.
        let policy = ExecutionPolicy { session_close: NaiveTime::from_hms_opt(9, 45, 0), ..Default::default() };
        let tr = trade(sim(policy).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date()));
        assert_eq!(tr.exit_reason, ExitReason::TimeBasedClose);
        assert_eq!(tr.exit_timestamp, t(3));
        assert!((tr.exit_price - 100.3).abs() < 1e-9);
    }

    #[test]
    fn trailing_stop_ratchets_and_fires() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 101.0, 99.9, 101.0), // entry, favorable close, trail -> 99.99
            bar(2, 101.0, 104.0, 100.5, 103.5), // trail -> 102.96
            bar(3, 103.5, 103.6, 101.0, 101.5), // low 101.0 <= 102.96
        ];
        let policy = ExecutionPolicy {
            stop_pct: Some(0.05),
            target_pct: Some(0.10),
            trailing: Some(TrailingStop { activate_after_bars: 1, trail_pct: 0.01 }),
            session_close: None,
            ..Default::default()
        };
        let tr = trade(sim(policy).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date()));
        assert_eq!(tr.exit_reason, ExitReason::TrailingStop);
        assert!((tr.exit_price - 104.0 * 0.99).abs() < 1e-9);
        assert_eq!(tr.highest_price, 104.0);
    }

    #[test]
    fn partial_exit_recorded_before_final_exit() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 101.2, 99.9, 101.0),
            bar(2, 101.0, 101.5, 100.5, 101.0),
        ];
        let policy = ExecutionPolicy {
            stop_pct: Some(0.05),
            target_pct: None,
            partial: Some(PartialTarget { target_pct: 0.01, fraction: 0.5 }),
            session_close: None,
            position_notional: 1_000.0,
            ..Default::default()
        };
        let tr = trade(sim(policy).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date()));
        assert_eq!(tr.partial_exits.len(), 1);
        assert_eq!(tr.partial_exits[0].quantity, 5.0);
        assert!((tr.partial_exits[0].price - 101.0).abs() < 1e-9);
        // 5 @ +1.0 partial, 5 @ +1.0 at the close.
        assert!((tr.pnl - 10.0).abs() < 1e-9);
        assert_eq!(tr.exit_reason, ExitReason::EndOfSession);
    }

    #[test]
    fn signal_price_entry() {
        let bars = vec![bar(0, 100.0, 100.0, 100.0, 100.0), bar(1, 101.0, 101.0, 100.0, 100.5)];
        let policy = ExecutionPolicy { entry_price: EntryPrice::SignalPrice, session_close: None, ..Default::default() };
        let tr = trade(sim(policy).simulate(&Signal::new("AAA", t(0), Side::Long, 100.0), &bars, date()));
        assert_eq!(tr.entry_price, 100.0);
        assert_eq!(tr.entry_timestamp, t(1));
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(ExecutionPolicy::default().problems().is_empty());
        let bad = ExecutionPolicy { stop_pct: Some(1.5), position_notional: 0.0, ..Default::default() };
        assert_eq!(bad.problems().len(), 2);
    }
}
