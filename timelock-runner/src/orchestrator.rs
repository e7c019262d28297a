//! Session orchestrator: fans instrument-sessions out over a bounded rayon
//! pool and drives each one strictly bar by bar.
//!
//! Per session: load bars, open the snapshot with the warm-up history, lease
//! a detection unit, then for every session bar append it and invoke
//! detection at its timestamp. The first signal wins and goes to the
//! simulator together with the session bars. Detection failures count as
//! "no signal at this bar"; nothing a session does can fail the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

use timelock_core::detectors::{create_detector, FactoryError};
use timelock_core::domain::{Bar, NoTrade, SessionKey, Signal, Trade};
use timelock_core::harness::{
    Detection, DetectionHarness, DetectionRequest, InProcessFactory, ProcessFactory, ProcessSpec, UnitFactory,
};
use timelock_core::quality;
use timelock_core::simulator::{ExecutionSimulator, SimOutcome};
use timelock_core::snapshot::{IsolationSnapshot, SnapshotError};
use timelock_core::store::{BarStore, StoreError};

use crate::aggregate::ResultAggregator;
use crate::config::{ConfigError, RunConfig};
use crate::result::{DetectionFailure, RunMetadata, RunResult, SessionReport, SessionStatus, SCHEMA_VERSION};

/// Errors that stop a run before any session starts.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("detector error: {0}")]
    Detector(#[from] FactoryError),
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Everything one instrument-session produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub report: SessionReport,
    pub signal: Option<Signal>,
    pub trade: Option<Trade>,
    pub no_trade: Option<NoTrade>,
    pub failures: Vec<DetectionFailure>,
}

impl SessionOutcome {
    fn new(key: SessionKey) -> Self {
        Self {
            report: SessionReport {
                key,
                status: SessionStatus::Completed,
                bars_scanned: 0,
                detection_errors: 0,
                discarded_signals: 0,
                warnings: Vec::new(),
            },
            signal: None,
            trade: None,
            no_trade: None,
            failures: Vec::new(),
        }
    }

    fn with_status(mut self, status: SessionStatus) -> Self {
        self.report.status = status;
        self
    }
}

/// Build the harness the config describes: a built-in detector in-process,
/// or an external program behind process units.
pub fn build_harness(config: &RunConfig) -> Result<DetectionHarness, RunError> {
    let section = &config.detector;
    let id = section.detector_id();
    let factory: Arc<dyn UnitFactory> = match &section.name {
        Some(name) => Arc::new(InProcessFactory::new(id, create_detector(name)?)),
        None => {
            let Some((program, args)) = section.command.split_first() else {
                return Err(ConfigError::Invalid(vec!["detector.command is empty".into()]).into());
            };
            let mut spec = ProcessSpec::new(program)
                .args(args.iter().cloned())
                .mode(section.mode)
                .max_output_bytes(config.harness.max_output_bytes);
            spec.working_dir = section.working_dir.clone();
            spec.startup_deadline = StdDuration::from_millis(config.harness.startup_deadline_ms);
            Arc::new(ProcessFactory::new(id, spec))
        }
    };
    Ok(DetectionHarness::new(config.harness.harness_config(), factory, config.orchestrator.workers))
}

/// Bars for one session, already filtered.
struct SessionBars {
    history: Vec<Bar>,
    session: Vec<Bar>,
    references: Vec<(String, Vec<Bar>)>,
    extended_filtered: usize,
}

/// UTC instant of local midnight starting `date`.
fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(offset.local_minus_utc()))))
}

pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    store: &'a dyn BarStore,
    harness: &'a DetectionHarness,
    simulator: ExecutionSimulator,
    offset: FixedOffset,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a RunConfig, store: &'a dyn BarStore, harness: &'a DetectionHarness) -> Result<Self, RunError> {
        config.validate()?;
        let offset = config.utc_offset();
        Ok(Self {
            config,
            store,
            harness,
            simulator: ExecutionSimulator::new(config.execution.clone(), offset),
            offset,
            cancel: None,
        })
    }

    /// Cooperative cancellation, checked between bars.
    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Instrument × weekday in the configured range, in universe order.
    pub fn session_keys(&self) -> Vec<SessionKey> {
        let run = &self.config.run;
        let mut seen = std::collections::HashSet::new();
        let instruments: Vec<&String> = run.universe.iter().filter(|i| seen.insert(i.as_str())).collect();
        let dates: Vec<NaiveDate> = run
            .start
            .iter_days()
            .take_while(|d| *d <= run.end)
            .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .collect();
        instruments
            .into_iter()
            .flat_map(|inst| dates.iter().map(move |d| SessionKey::new(inst.as_str(), *d)))
            .collect()
    }

    /// Run every session and freeze the result.
    pub fn run(&self) -> Result<RunResult, RunError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let orchestration = &self.config.orchestrator;
        let deadline = orchestration.run_deadline_secs.map(|s| clock + StdDuration::from_secs(s));
        let keys = self.session_keys();
        let run_id = self.config.run_id();

        info!(
            run_id = %&run_id[..12],
            detector = %self.harness.detector_id(),
            sessions = keys.len(),
            workers = orchestration.workers,
            "run started"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(orchestration.workers)
            .thread_name(|i| format!("timelock-session-{i}"))
            .build()?;
        let outcomes: Vec<SessionOutcome> =
            pool.install(|| keys.par_iter().map(|key| self.drive(key, deadline)).collect());

        let mut aggregator = ResultAggregator::new(orchestration.max_failure_records);
        for outcome in outcomes {
            aggregator.add(outcome);
        }
        let metadata = RunMetadata {
            schema_version: SCHEMA_VERSION,
            run_id,
            detector_id: self.harness.detector_id().to_string(),
            policy: self.config.execution.name.clone(),
            universe: self.config.run.universe.clone(),
            references: self.config.run.references.clone(),
            start: self.config.run.start,
            end: self.config.run.end,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            suspect: false,
            interrupted: self.cancel_requested(),
        };
        let result = aggregator.finish(metadata, self.harness.pool().stats());

        info!(
            signals = result.signals.len(),
            trades = result.trades.len(),
            no_trades = result.no_trades.len(),
            detection_failures = result.detection_failure_count,
            suspect = result.metadata.suspect,
            duration_ms = result.metadata.duration_ms,
            "run finished"
        );
        Ok(result)
    }

    /// Run one instrument-session with no run deadline. Used by `scan`.
    pub fn run_session(&self, key: &SessionKey) -> SessionOutcome {
        self.drive(key, None)
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.is_some_and(|f| f.load(Ordering::Relaxed))
    }

    fn stop_requested(&self, deadline: Option<Instant>) -> bool {
        self.cancel_requested() || deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn load(&self, key: &SessionKey) -> Result<SessionBars, StoreError> {
        let run = &self.config.run;
        let session_start = local_midnight(key.date, self.offset);
        let session_end = local_midnight(key.date + Duration::days(1), self.offset);
        let history_start = session_start - Duration::days(i64::from(self.config.snapshot.warmup_lookback_days));

        let (history, _) = quality::filter_extended(
            self.store.range_query(&key.instrument, run.timeframe, history_start, session_start)?,
            run.include_extended_hours,
        );
        let (session, extended_filtered) = quality::filter_extended(
            self.store.range_query(&key.instrument, run.timeframe, session_start, session_end)?,
            run.include_extended_hours,
        );

        let mut references = Vec::new();
        for instrument in run.references.iter().filter(|r| **r != key.instrument) {
            let bars = self.store.range_query(instrument, run.timeframe, history_start, session_end)?;
            let (bars, _) = quality::filter_extended(bars, run.include_extended_hours);
            references.push((instrument.clone(), bars));
        }

        Ok(SessionBars { history, session, references, extended_filtered })
    }

    fn drive(&self, key: &SessionKey, deadline: Option<Instant>) -> SessionOutcome {
        let span = info_span!("session", instrument = %key.instrument, date = %key.date);
        let _enter = span.enter();

        let outcome = SessionOutcome::new(key.clone());
        if self.stop_requested(deadline) {
            return outcome.with_status(SessionStatus::Abandoned);
        }

        let bars = match self.load(key) {
            Ok(bars) => bars,
            Err(e) => {
                warn!(error = %e, "bar store read failed");
                return outcome.with_status(SessionStatus::Failed { reason: e.to_string() });
            }
        };
        if bars.session.is_empty() {
            debug!("no bars");
            return outcome.with_status(SessionStatus::NoData);
        }

        let mut outcome = outcome;
        outcome.report.warnings = quality::check_session(
            bars.history.last().map(|b| b.close),
            &bars.session,
            bars.extended_filtered,
            &self.config.quality,
        );
        self.scan(key, bars, outcome, deadline)
    }

    fn scan(
        &self,
        key: &SessionKey,
        bars: SessionBars,
        mut outcome: SessionOutcome,
        deadline: Option<Instant>,
    ) -> SessionOutcome {
        let SessionBars { history, session, references, .. } = bars;

        let snap_cfg = self.config.snapshot.snapshot_config();
        let prefix_len = self.config.snapshot.session_offset_bars.min(session.len());
        let mut snapshot = match IsolationSnapshot::open(
            key.clone(),
            &history,
            &session[..prefix_len],
            references,
            &snap_cfg,
            snap_cfg.warmup_bars + session.len(),
        ) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.snapshot_failed(outcome, e),
        };

        let mut lease = match self.harness.lease() {
            Ok(lease) => lease,
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "no detection unit");
                outcome.failures.push(DetectionFailure {
                    instrument: key.instrument.clone(),
                    session_date: key.date,
                    timestamp: session[prefix_len.min(session.len() - 1)].timestamp,
                    reason: e.reason().to_string(),
                    message: e.to_string(),
                });
                outcome.report.detection_errors = 1;
                return outcome.with_status(SessionStatus::Failed { reason: format!("no detection unit: {e}") });
            }
        };

        let universe = &self.config.run.universe;
        let params = &self.config.detector.params;
        let early_termination = self.config.orchestrator.early_termination;
        let mut first: Option<Signal> = None;

        for bar in &session[prefix_len..] {
            if self.stop_requested(deadline) {
                if first.is_none() {
                    outcome.report.status = SessionStatus::Abandoned;
                }
                break;
            }
            if let Err(e) = snapshot.append(bar.clone()) {
                outcome = self.snapshot_failed(outcome, e);
                first = None;
                break;
            }
            outcome.report.bars_scanned += 1;

            let handle = match snapshot.handle() {
                Ok(handle) => handle,
                Err(e) => {
                    outcome = self.snapshot_failed(outcome, e);
                    first = None;
                    break;
                }
            };
            let request = DetectionRequest { snapshot: handle, universe, timestamp: bar.timestamp, config: params };

            match self.harness.invoke(&mut lease, &request) {
                Ok(Detection::Signal(signal)) if first.is_none() => {
                    debug!(timestamp = %signal.timestamp, side = ?signal.side, "signal");
                    first = Some(signal);
                    if early_termination {
                        break;
                    }
                }
                Ok(Detection::Signal(_)) => outcome.report.discarded_signals += 1,
                Ok(Detection::NoSignal) => {}
                Err(e) => {
                    warn!(timestamp = %bar.timestamp, reason = e.reason(), error = %e, "detection failed");
                    outcome.report.detection_errors += 1;
                    outcome.failures.push(DetectionFailure {
                        instrument: key.instrument.clone(),
                        session_date: key.date,
                        timestamp: bar.timestamp,
                        reason: e.reason().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.harness.release(&mut lease, snapshot.id());
        snapshot.close();
        drop(lease);

        if let Some(signal) = first {
            match self.simulator.simulate(&signal, &session, key.date) {
                SimOutcome::Trade(trade) => {
                    debug!(exit_reason = trade.exit_reason.as_str(), pnl_pct = trade.pnl_pct, "trade");
                    outcome.trade = Some(trade);
                }
                SimOutcome::NoTrade(no_trade) => {
                    debug!(reason = ?no_trade.reason, "no trade");
                    outcome.no_trade = Some(no_trade);
                }
            }
            outcome.signal = Some(signal);
        }
        outcome
    }

    fn snapshot_failed(&self, outcome: SessionOutcome, e: SnapshotError) -> SessionOutcome {
        match e {
            SnapshotError::InsufficientHistory { .. } => {
                warn!(error = %e, "session skipped");
                outcome.with_status(SessionStatus::Skipped { reason: e.to_string() })
            }
            e if e.is_integrity_violation() => {
                error!(error = %e, "session aborted, run marked suspect");
                outcome.with_status(SessionStatus::Aborted { reason: e.to_string() })
            }
            e => {
                warn!(error = %e, "snapshot failed");
                outcome.with_status(SessionStatus::Failed { reason: e.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_midnight_applies_offset() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let ny = FixedOffset::west_opt(4 * 3600).unwrap();
        assert_eq!(local_midnight(date, ny), Utc.with_ymd_and_hms(2024, 6, 3, 4, 0, 0).unwrap());
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        assert_eq!(local_midnight(date, tokyo), Utc.with_ymd_and_hms(2024, 6, 2, 15, 0, 0).unwrap());
    }

    #[test]
    fn unknown_builtin_is_a_run_error() {
        let config = RunConfig::from_toml_str(
            r#"
[run]
universe = ["X"]
start = "2024-06-03"
end = "2024-06-03"
[detector]
name = "no_such_detector"
"#,
        )
        .unwrap();
        assert!(matches!(build_harness(&config), Err(RunError::Detector(_))));
    }
}
