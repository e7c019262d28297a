//! Run result: every signal, trade, no-trade and session report of one
//! orchestrator pass, plus run metadata.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use timelock_core::domain::{NoTrade, SessionKey, Signal, Trade};
use timelock_core::harness::PoolStats;
use timelock_core::quality::QualityWarning;

use crate::config::RunId;

/// Current schema version for persisted artifacts.
pub const SCHEMA_VERSION: u32 = 1;

/// How one instrument-session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Scanned to its first signal or to the last bar.
    Completed,
    /// Not enough warm-up history.
    Skipped { reason: String },
    /// Integrity violation (non-monotonic data). Marks the run suspect.
    Aborted { reason: String },
    /// Stopped by the run deadline or cancellation.
    Abandoned,
    /// Bar store read failed or no unit could be started.
    Failed { reason: String },
    /// No bars for this date.
    NoData,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::Skipped { .. } => "skipped",
            SessionStatus::Aborted { .. } => "aborted",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Failed { .. } => "failed",
            SessionStatus::NoData => "no_data",
        }
    }
}

/// One detection invocation that failed. Treated as "no signal at this bar".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionFailure {
    pub instrument: String,
    pub session_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

/// Per-session bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub key: SessionKey,
    #[serde(flatten)]
    pub status: SessionStatus,
    pub bars_scanned: usize,
    pub detection_errors: usize,
    /// Signals seen after the first one while scanning on.
    pub discarded_signals: usize,
    #[serde(default)]
    pub warnings: Vec<QualityWarning>,
}

/// Run-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: RunId,
    pub detector_id: String,
    pub policy: String,
    pub universe: Vec<String>,
    pub references: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Set when any session was aborted for an integrity violation.
    pub suspect: bool,
    /// Set when the deadline or a cancellation cut the run short.
    pub interrupted: bool,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Frozen outcome of one run. Built only by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub metadata: RunMetadata,
    pub signals: Vec<Signal>,
    pub trades: Vec<Trade>,
    pub no_trades: Vec<NoTrade>,
    pub sessions: Vec<SessionReport>,
    /// First `max_failure_records` failures, in session order.
    pub detection_failures: Vec<DetectionFailure>,
    pub detection_failure_count: usize,
    pub pool: PoolStats,
}

/// Counts for the one-screen summary. No performance statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub sessions: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub signals: usize,
    pub trades: usize,
    pub no_trades: usize,
    pub by_exit_reason: BTreeMap<&'static str, usize>,
    pub detection_failures: usize,
    pub failures_by_reason: BTreeMap<String, usize>,
}

impl RunResult {
    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            sessions: self.sessions.len(),
            signals: self.signals.len(),
            trades: self.trades.len(),
            no_trades: self.no_trades.len(),
            detection_failures: self.detection_failure_count,
            ..Default::default()
        };
        for session in &self.sessions {
            *summary.by_status.entry(session.status.label()).or_default() += 1;
        }
        for trade in &self.trades {
            *summary.by_exit_reason.entry(trade.exit_reason.as_str()).or_default() += 1;
        }
        for failure in &self.detection_failures {
            *summary.failures_by_reason.entry(failure.reason.clone()).or_default() += 1;
        }
        summary
    }
}
