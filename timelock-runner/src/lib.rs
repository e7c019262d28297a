//! TimeLock Runner — session orchestration, run configuration, result
//! aggregation and export.
//!
//! This crate builds on `timelock-core` to provide:
//! - TOML run configuration with a content-derived run id
//! - The session orchestrator (bounded rayon pool, first-signal-wins)
//! - The result aggregator and the frozen `RunResult`
//! - Artifact export (run.json, signals.jsonl, trades.csv)

pub mod aggregate;
pub mod config;
pub mod export;
pub mod orchestrator;
pub mod result;

pub use aggregate::ResultAggregator;
pub use config::{
    ConfigError, DetectorSection, HarnessSection, OrchestratorSection, RunConfig, RunId, RunSection, SnapshotSection,
};
pub use export::{export_run, import_json, ExportError, ExportPaths};
pub use orchestrator::{build_harness, Orchestrator, RunError, SessionOutcome};
pub use result::{DetectionFailure, RunMetadata, RunResult, RunSummary, SessionReport, SessionStatus, SCHEMA_VERSION};
