//! Criterion benchmarks for the per-bar hot path.
//!
//! Benchmarks:
//! 1. Snapshot advance: incremental append vs re-materializing the prefix
//! 2. Harness invocation through an in-process unit
//! 3. Execution simulation of one signal over a full session

use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use timelock_core::detectors::create_detector;
use timelock_core::domain::{Bar, DetectorId, SessionKey, Side, Signal};
use timelock_core::harness::{DetectionHarness, DetectionRequest, HarnessConfig, InProcessFactory};
use timelock_core::simulator::{ExecutionPolicy, ExecutionSimulator};
use timelock_core::snapshot::{IsolationSnapshot, SnapshotConfig};
use timelock_core::store::{SyntheticConfig, SyntheticSessions};

// ── Helpers ──────────────────────────────────────────────────────────

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
}

/// One prior session of history and one session of `bars` bars.
fn fixture(bars: usize) -> (Vec<Bar>, Vec<Bar>) {
    let sessions = SyntheticSessions::new(SyntheticConfig { bars_per_session: bars, ..Default::default() });
    let history = sessions.generate("BENCH", day(3), day(3));
    let session = sessions.generate("BENCH", day(4), day(4));
    (history, session)
}

fn open(history: &[Bar], capacity: usize) -> IsolationSnapshot {
    IsolationSnapshot::open(
        SessionKey::new("BENCH", day(4)),
        history,
        &[],
        vec![],
        &SnapshotConfig { warmup_bars: 50, min_warmup_bars: 10 },
        capacity,
    )
    .unwrap()
}

// ── 1. Snapshot Advance ──────────────────────────────────────────────

fn bench_snapshot_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot_advance");

    for &bars in &[78, 390, 1560] {
        let (history, session) = fixture(bars);

        group.bench_with_input(BenchmarkId::new("incremental", bars), &bars, |b, _| {
            b.iter(|| {
                let mut snap = open(&history, 50 + session.len());
                for bar in &session {
                    snap.append(bar.clone()).unwrap();
                    black_box(snap.handle().unwrap().last());
                }
            });
        });

        // What per-bar re-materialization of bars[0..=i] costs.
        group.bench_with_input(BenchmarkId::new("clone_prefix", bars), &bars, |b, _| {
            let mut all = history[history.len().saturating_sub(50)..].to_vec();
            all.extend(session.iter().cloned());
            let warmup = all.len() - session.len();
            b.iter(|| {
                for i in 0..session.len() {
                    let prefix: Vec<Bar> = all[..=warmup + i].to_vec();
                    black_box(prefix.last());
                }
            });
        });
    }

    group.finish();
}

// ── 2. Harness Invocation ────────────────────────────────────────────

fn bench_harness_invoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("harness_invoke");
    let (history, session) = fixture(390);
    let detector = create_detector("opening_range_breakout").unwrap();
    let harness = DetectionHarness::new(
        HarnessConfig::default(),
        Arc::new(InProcessFactory::new(DetectorId::new("orb"), detector)),
        1,
    );
    let universe = vec!["BENCH".to_string()];
    let config = serde_json::json!({ "range_bars": 1000 });

    group.bench_function("in_process_390_bars", |b| {
        b.iter(|| {
            let mut snap = open(&history, 50 + session.len());
            let mut lease = harness.lease().unwrap();
            for bar in &session {
                snap.append(bar.clone()).unwrap();
                let request = DetectionRequest {
                    snapshot: snap.handle().unwrap(),
                    universe: &universe,
                    timestamp: bar.timestamp,
                    config: &config,
                };
                black_box(harness.invoke(&mut lease, &request).unwrap());
            }
        });
    });

    group.finish();
}

// ── 3. Execution Simulation ──────────────────────────────────────────

fn bench_simulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulate");
    let (_, session) = fixture(390);
    let signal = Signal::new("BENCH", session[0].timestamp, Side::Long, session[0].close);
    let offset = FixedOffset::west_opt(5 * 3600).unwrap();

    let wide = ExecutionSimulator::new(
        ExecutionPolicy { stop_pct: Some(0.5), target_pct: Some(0.5), session_close: None, ..Default::default() },
        offset,
    );
    group.bench_function("hold_to_end_390_bars", |b| {
        b.iter(|| wide.simulate(black_box(&signal), black_box(&session), day(4)));
    });

    let default = ExecutionSimulator::new(ExecutionPolicy::default(), offset);
    group.bench_function("default_policy_390_bars", |b| {
        b.iter(|| default.simulate(black_box(&signal), black_box(&session), day(4)));
    });

    group.finish();
}

criterion_group!(benches, bench_snapshot_advance, bench_harness_invoke, bench_simulate);
criterion_main!(benches);
