//! Artifact export: a real run written to disk and read back.

use chrono::{NaiveDate, Utc};
use timelock_core::domain::Timeframe;
use timelock_core::store::{MemoryBarStore, SyntheticConfig, SyntheticSessions};
use timelock_runner::{
    build_harness, export_run, import_json, DetectorSection, ExportError, Orchestrator, RunConfig, RunResult,
    RunSection, SCHEMA_VERSION,
};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
}

fn synthetic_run() -> RunResult {
    let sessions = SyntheticSessions::new(SyntheticConfig::default());
    let bars = ["AAA", "BBB"].into_iter().flat_map(|inst| sessions.generate(inst, date(3), date(7)));
    let store = MemoryBarStore::from_bars(bars).unwrap();
    let config = RunConfig {
        run: RunSection {
            universe: vec!["AAA".into(), "BBB".into()],
            references: vec![],
            start: date(4),
            end: date(7),
            timeframe: Timeframe::Minute5,
            utc_offset_minutes: -300,
            include_extended_hours: false,
        },
        snapshot: Default::default(),
        detector: DetectorSection::builtin("opening_range_breakout", serde_json::json!({ "range_bars": 3 })),
        harness: Default::default(),
        execution: Default::default(),
        orchestrator: Default::default(),
        quality: Default::default(),
    };
    let harness = build_harness(&config).unwrap();
    Orchestrator::new(&config, &store, &harness).unwrap().run().unwrap()
}

#[test]
fn export_writes_all_artifacts() {
    let result = synthetic_run();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("nested").join("run");

    let paths = export_run(&result, &out).unwrap();
    assert!(paths.run_json.exists());
    assert!(paths.signals_jsonl.exists());
    assert!(paths.trades_csv.exists());

    let jsonl = std::fs::read_to_string(&paths.signals_jsonl).unwrap();
    assert_eq!(jsonl.lines().count(), result.signals.len());
    for line in jsonl.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value.get("instrument").is_some());
        assert!(value.get("timestamp").is_some());
    }

    let csv = std::fs::read_to_string(&paths.trades_csv).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("instrument,session_date,side,policy"));
    assert_eq!(lines.count(), result.trades.len());
}

#[test]
fn run_json_round_trips() {
    let result = synthetic_run();
    let dir = tempfile::tempdir().unwrap();
    let paths = export_run(&result, dir.path()).unwrap();

    let loaded = import_json(&std::fs::read_to_string(&paths.run_json).unwrap()).unwrap();
    assert_eq!(loaded, result);
    assert_eq!(loaded.metadata.schema_version, SCHEMA_VERSION);
    assert_eq!(loaded.summary(), result.summary());
}

#[test]
fn newer_schema_is_rejected() {
    let mut result = synthetic_run();
    result.metadata.schema_version = SCHEMA_VERSION + 1;
    result.metadata.started_at = Utc::now();
    let json = serde_json::to_string(&result).unwrap();
    assert!(matches!(import_json(&json), Err(ExportError::UnsupportedSchema { found }) if found == SCHEMA_VERSION + 1));
}
