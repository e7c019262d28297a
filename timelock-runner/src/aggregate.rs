//! Result aggregator: collects session outcomes as workers finish them and
//! freezes them into a [`RunResult`] with a deterministic order.
//!
//! Workers complete in any order; sorting by session key at the end makes
//! the result independent of scheduling and worker count.

use timelock_core::harness::PoolStats;

use crate::orchestrator::SessionOutcome;
use crate::result::{RunMetadata, RunResult, SessionStatus};

pub struct ResultAggregator {
    max_failure_records: usize,
    outcomes: Vec<SessionOutcome>,
}

impl ResultAggregator {
    pub fn new(max_failure_records: usize) -> Self {
        Self { max_failure_records, outcomes: Vec::new() }
    }

    pub fn add(&mut self, outcome: SessionOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Freeze. `suspect` and `interrupted` are derived from the sessions.
    pub fn finish(mut self, mut metadata: RunMetadata, pool: PoolStats) -> RunResult {
        self.outcomes.sort_by(|a, b| a.report.key.cmp(&b.report.key));

        metadata.suspect |= self
            .outcomes
            .iter()
            .any(|o| matches!(o.report.status, SessionStatus::Aborted { .. }));
        metadata.interrupted |= self.outcomes.iter().any(|o| o.report.status == SessionStatus::Abandoned);

        let mut result = RunResult {
            metadata,
            signals: Vec::new(),
            trades: Vec::new(),
            no_trades: Vec::new(),
            sessions: Vec::with_capacity(self.outcomes.len()),
            detection_failures: Vec::new(),
            detection_failure_count: 0,
            pool,
        };

        for outcome in self.outcomes {
            result.signals.extend(outcome.signal);
            result.trades.extend(outcome.trade);
            result.no_trades.extend(outcome.no_trade);
            result.detection_failure_count += outcome.failures.len();
            let room = self.max_failure_records.saturating_sub(result.detection_failures.len());
            result.detection_failures.extend(outcome.failures.into_iter().take(room));
            result.sessions.push(outcome.report);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use timelock_core::domain::{SessionKey, Side, Signal};

    use crate::result::{DetectionFailure, SessionReport};

    fn outcome(instrument: &str, day: u32, status: SessionStatus, failures: usize) -> SessionOutcome {
        let date = NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 6, day, 14, 0, 0).unwrap();
        SessionOutcome {
            report: SessionReport {
                key: SessionKey::new(instrument, date),
                status,
                bars_scanned: 10,
                detection_errors: failures,
                discarded_signals: 0,
                warnings: vec![],
            },
            signal: Some(Signal::new(instrument, ts, Side::Long, 10.0)),
            trade: None,
            no_trade: None,
            failures: (0..failures)
                .map(|i| DetectionFailure {
                    instrument: instrument.into(),
                    session_date: date,
                    timestamp: ts,
                    reason: "timeout".into(),
                    message: format!("#{i}"),
                })
                .collect(),
        }
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            schema_version: crate::result::SCHEMA_VERSION,
            run_id: "r".into(),
            detector_id: "d".into(),
            policy: "default".into(),
            universe: vec!["A".into(), "B".into()],
            references: vec![],
            start: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 6, 4).unwrap(),
            started_at: Utc.with_ymd_and_hms(2024, 6, 5, 0, 0, 0).unwrap(),
            duration_ms: 1,
            suspect: false,
            interrupted: false,
        }
    }

    #[test]
    fn order_is_independent_of_arrival() {
        let build = |order: &[(&str, u32)]| {
            let mut agg = ResultAggregator::new(10);
            for &(inst, day) in order {
                agg.add(outcome(inst, day, SessionStatus::Completed, 0));
            }
            agg.finish(metadata(), PoolStats::default())
        };
        let a = build(&[("B", 4), ("A", 3), ("A", 4), ("B", 3)]);
        let b = build(&[("A", 3), ("B", 3), ("B", 4), ("A", 4)]);
        assert_eq!(a, b);
        assert_eq!(a.sessions[0].key.instrument, "A");
        assert_eq!(a.signals.len(), 4);
    }

    #[test]
    fn aborted_session_marks_run_suspect() {
        let mut agg = ResultAggregator::new(10);
        agg.add(outcome("A", 3, SessionStatus::Completed, 0));
        agg.add(outcome("B", 3, SessionStatus::Aborted { reason: "non-monotonic".into() }, 0));
        let result = agg.finish(metadata(), PoolStats::default());
        assert!(result.metadata.suspect);
        assert!(!result.metadata.interrupted);
    }

    #[test]
    fn failure_list_is_capped_but_counted() {
        let mut agg = ResultAggregator::new(5);
        agg.add(outcome("A", 3, SessionStatus::Completed, 4));
        agg.add(outcome("B", 3, SessionStatus::Completed, 4));
        let result = agg.finish(metadata(), PoolStats::default());
        assert_eq!(result.detection_failure_count, 8);
        assert_eq!(result.detection_failures.len(), 5);
        assert_eq!(result.summary().failures_by_reason["timeout"], 5);
    }

    proptest::proptest! {
        #[test]
        fn any_arrival_order_freezes_identically(seed in 0u64..10_000) {
            use rand::{seq::SliceRandom, SeedableRng};

            let mut keys: Vec<(&str, u32)> = ["A", "B", "C"]
                .iter()
                .flat_map(|i| (3..8).map(move |d| (*i, d)))
                .collect();
            let freeze = |keys: &[(&str, u32)]| {
                let mut agg = ResultAggregator::new(3);
                for &(inst, day) in keys {
                    agg.add(outcome(inst, day, SessionStatus::Completed, (day % 3) as usize));
                }
                agg.finish(metadata(), PoolStats::default())
            };
            let sorted = freeze(&keys);
            keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
            proptest::prop_assert_eq!(freeze(&keys), sorted);
        }
    }
}
