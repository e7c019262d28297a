//! Data-quality checks for one instrument-session.
//!
//! Warnings are informational: they are attached to session reports and
//! printed by `check-data`, never used to reject a session.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Opening gaps at least this large (percent) are reported.
    pub gap_threshold_pct: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self { gap_threshold_pct: 0.5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityWarning {
    OpeningGap {
        gap_pct: f64,
        open: f64,
        previous_close: f64,
    },
    MissingBars {
        after: DateTime<Utc>,
        missing: usize,
    },
    InsaneBar {
        timestamp: DateTime<Utc>,
    },
    ExtendedHoursFiltered {
        count: usize,
    },
    EmptySession,
}

impl fmt::Display for QualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpeningGap { gap_pct, open, previous_close } => {
                write!(f, "opening gap {gap_pct:+.2}% (open {open:.2}, previous close {previous_close:.2})")
            }
            Self::MissingBars { after, missing } => write!(f, "{missing} missing bar(s) after {after}"),
            Self::InsaneBar { timestamp } => write!(f, "insane bar at {timestamp}"),
            Self::ExtendedHoursFiltered { count } => write!(f, "{count} extended-hours bar(s) filtered"),
            Self::EmptySession => write!(f, "empty session"),
        }
    }
}

/// Split off extended-hours bars unless they are wanted.
///
/// Returns the kept bars and how many were dropped.
pub fn filter_extended(bars: Vec<Bar>, include_extended: bool) -> (Vec<Bar>, usize) {
    if include_extended {
        return (bars, 0);
    }
    let before = bars.len();
    let kept: Vec<Bar> = bars.into_iter().filter(Bar::is_regular).collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Check one session's bars. `previous_close` is the last close before the session.
pub fn check_session(
    previous_close: Option<f64>,
    session: &[Bar],
    filtered_extended: usize,
    cfg: &QualityConfig,
) -> Vec<QualityWarning> {
    let mut warnings = Vec::new();
    if filtered_extended > 0 {
        warnings.push(QualityWarning::ExtendedHoursFiltered { count: filtered_extended });
    }
    let Some(first) = session.first() else {
        warnings.push(QualityWarning::EmptySession);
        return warnings;
    };

    if let Some(prev) = previous_close.filter(|p| *p > 0.0) {
        let gap_pct = (first.open - prev) / prev * 100.0;
        if gap_pct.abs() >= cfg.gap_threshold_pct {
            warnings.push(QualityWarning::OpeningGap { gap_pct, open: first.open, previous_close: prev });
        }
    }

    for bar in session.iter().filter(|b| !b.is_sane()) {
        warnings.push(QualityWarning::InsaneBar { timestamp: bar.timestamp });
    }

    if first.timeframe.is_intraday() {
        let step = first.timeframe.duration();
        for pair in session.windows(2) {
            let gap = pair[1].timestamp - pair[0].timestamp;
            if gap > step {
                let missing = (gap.num_seconds() / step.num_seconds()).saturating_sub(1) as usize;
                warnings.push(QualityWarning::MissingBars { after: pair[0].timestamp, missing });
            }
        }
    }
    warnings
}

/// Per-session summary used by `check-data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionQuality {
    pub date: NaiveDate,
    pub bars: usize,
    pub warnings: Vec<QualityWarning>,
}

/// Group a full series into local sessions and check each one.
pub fn check_series(
    bars: &[Bar],
    offset: FixedOffset,
    include_extended: bool,
    cfg: &QualityConfig,
) -> Vec<SessionQuality> {
    let mut sessions: BTreeMap<NaiveDate, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        sessions.entry(bar.local_date(offset)).or_default().push(bar.clone());
    }

    let mut previous_close = None;
    let mut report = Vec::with_capacity(sessions.len());
    for (date, session) in sessions {
        let (kept, dropped) = filter_extended(session, include_extended);
        let warnings = check_session(previous_close, &kept, dropped, cfg);
        if let Some(last) = kept.last() {
            previous_close = Some(last.close);
        }
        report.push(SessionQuality { date, bars: kept.len(), warnings });
    }
    report
}
