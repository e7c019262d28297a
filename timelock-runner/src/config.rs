//! Serializable run configuration, loaded from TOML.
//!
//! ```toml
//! [run]
//! universe = ["NVDA", "TSLA"]
//! references = ["SPY"]
//! start = "2024-06-03"
//! end = "2024-06-07"
//! timeframe = "minute5"
//!
//! [detector]
//! name = "gap_down_vwap_reclaim"
//! [detector.params]
//! min_gap_pct = 2.0
//!
//! [execution]
//! stop_pct = 0.02
//! target_pct = 0.04
//! session_close = "15:55:00"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use timelock_core::domain::{DetectorId, Timeframe};
use timelock_core::harness::{HarnessConfig, ProcessMode};
use timelock_core::quality::QualityConfig;
use timelock_core::simulator::ExecutionPolicy;
use timelock_core::snapshot::SnapshotConfig;

/// Unique identifier for a run (content-addressable hash of its config).
pub type RunId = String;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Everything needed to reproduce one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub run: RunSection,
    #[serde(default)]
    pub snapshot: SnapshotSection,
    pub detector: DetectorSection,
    #[serde(default)]
    pub harness: HarnessSection,
    #[serde(default)]
    pub execution: ExecutionPolicy,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub quality: QualityConfig,
}

/// Universe and date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    pub universe: Vec<String>,
    /// Cross-instrument comparison series shipped with every snapshot.
    #[serde(default)]
    pub references: Vec<String>,
    /// First session date (inclusive).
    pub start: NaiveDate,
    /// Last session date (inclusive).
    pub end: NaiveDate,
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,
    /// Exchange-local offset from UTC, in minutes. Session dates and
    /// `execution.session_close` are in this local time.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub include_extended_hours: bool,
}

fn default_timeframe() -> Timeframe {
    Timeframe::Minute5
}

fn default_utc_offset() -> i32 {
    -5 * 60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub warmup_bars: usize,
    pub min_warmup_bars: usize,
    /// Calendar days before the session searched for warm-up bars.
    pub warmup_lookback_days: u32,
    /// Session bars loaded with the warm-up before the first decision.
    pub session_offset_bars: usize,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        let core = SnapshotConfig::default();
        Self {
            warmup_bars: core.warmup_bars,
            min_warmup_bars: core.min_warmup_bars,
            warmup_lookback_days: 5,
            session_offset_bars: 0,
        }
    }
}

impl SnapshotSection {
    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig { warmup_bars: self.warmup_bars, min_warmup_bars: self.min_warmup_bars }
    }
}

/// Either a built-in detector (`name`) or an external program (`command`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSection {
    #[serde(default)]
    pub name: Option<String>,
    /// Program and arguments of a process unit.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub mode: ProcessMode,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Passed verbatim as `config` in every detection request.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl DetectorSection {
    pub fn builtin(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self { name: Some(name.into()), command: Vec::new(), mode: ProcessMode::default(), working_dir: None, params }
    }

    pub fn process(command: Vec<String>, mode: ProcessMode, params: serde_json::Value) -> Self {
        Self { name: None, command, mode, working_dir: None, params }
    }

    /// Pool key: the detector plus its parameters.
    pub fn detector_id(&self) -> DetectorId {
        let label = match &self.name {
            Some(name) => name.clone(),
            None => self.command.join(" "),
        };
        DetectorId::from_parts(&label, &self.params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSection {
    pub deadline_ms: u64,
    pub ping_deadline_ms: u64,
    pub max_output_bytes: usize,
    pub startup_deadline_ms: u64,
}

impl Default for HarnessSection {
    fn default() -> Self {
        let core = HarnessConfig::default();
        Self {
            deadline_ms: core.deadline.as_millis() as u64,
            ping_deadline_ms: core.ping_deadline.as_millis() as u64,
            max_output_bytes: core.max_output_bytes,
            startup_deadline_ms: 10_000,
        }
    }
}

impl HarnessSection {
    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            deadline: Duration::from_millis(self.deadline_ms),
            ping_deadline: Duration::from_millis(self.ping_deadline_ms),
            max_output_bytes: self.max_output_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Concurrent instrument-sessions.
    pub workers: usize,
    /// Stop scanning a session at its first signal.
    pub early_termination: bool,
    /// Wall-clock budget for the whole run; in-flight sessions are abandoned after it.
    pub run_deadline_secs: Option<u64>,
    /// Detection failures enumerated in the result; the rest are only counted.
    pub max_failure_records: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self { workers: 4, early_termination: true, run_deadline_secs: None, max_failure_records: 500 }
    }
}

impl RunConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field consistency. Every problem is reported at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.run.universe.is_empty() {
            problems.push("run.universe is empty".to_string());
        }
        if self.run.universe.iter().any(|s| s.trim().is_empty()) {
            problems.push("run.universe contains an empty instrument".to_string());
        }
        if self.run.start > self.run.end {
            problems.push(format!("run.start {} is after run.end {}", self.run.start, self.run.end));
        }
        if FixedOffset::east_opt(self.run.utc_offset_minutes * 60).is_none() {
            problems.push(format!("run.utc_offset_minutes {} is out of range", self.run.utc_offset_minutes));
        }

        if self.snapshot.min_warmup_bars > self.snapshot.warmup_bars {
            problems.push(format!(
                "snapshot.min_warmup_bars {} exceeds snapshot.warmup_bars {}",
                self.snapshot.min_warmup_bars, self.snapshot.warmup_bars
            ));
        }

        match (&self.detector.name, self.detector.command.is_empty()) {
            (Some(_), false) => problems.push("detector: set either name or command, not both".to_string()),
            (None, true) => problems.push("detector: one of name or command is required".to_string()),
            _ => {}
        }

        if self.harness.deadline_ms == 0 {
            problems.push("harness.deadline_ms must be positive".to_string());
        }
        if self.harness.max_output_bytes == 0 {
            problems.push("harness.max_output_bytes must be positive".to_string());
        }

        if self.orchestrator.workers == 0 {
            problems.push("orchestrator.workers must be at least 1".to_string());
        }

        problems.extend(self.execution.problems().into_iter().map(|p| format!("execution.{p}")));

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Exchange-local offset. Falls back to UTC when out of range; `validate` rejects that case.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.run.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Deterministic hash of the canonical JSON form.
    ///
    /// Two runs with identical configs have the same RunId.
    pub fn run_id(&self) -> RunId {
        let json = serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"));
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[run]
universe = ["NVDA", "TSLA"]
references = ["SPY"]
start = "2024-06-03"
end = "2024-06-07"

[detector]
name = "close_threshold"
[detector.params]
level = 100.0
direction = "below"

[execution]
stop_pct = 0.015
session_close = "15:45:00"

[orchestrator]
workers = 2
"#;

    #[test]
    fn parses_with_defaults() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.run.universe, vec!["NVDA", "TSLA"]);
        assert_eq!(config.run.timeframe, Timeframe::Minute5);
        assert_eq!(config.snapshot, SnapshotSection::default());
        assert_eq!(config.execution.stop_pct, Some(0.015));
        // Unset fields in a present section keep their defaults.
        assert_eq!(config.execution.target_pct, Some(0.04));
        assert_eq!(config.orchestrator.workers, 2);
        assert!(config.orchestrator.early_termination);
        assert_eq!(config.detector.params["direction"], "below");
        assert_eq!(config.utc_offset(), FixedOffset::west_opt(5 * 3600).unwrap());
    }

    #[test]
    fn run_id_deterministic() {
        let a = RunConfig::from_toml_str(SAMPLE).unwrap();
        let b = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(a.run_id(), b.run_id());
        assert_eq!(a.run_id().len(), 64);
    }

    #[test]
    fn run_id_changes_with_params() {
        let a = RunConfig::from_toml_str(SAMPLE).unwrap();
        let mut b = a.clone();
        b.detector.params["level"] = serde_json::json!(101.0);
        assert_ne!(a.run_id(), b.run_id());
        assert_ne!(a.detector.detector_id(), b.detector.detector_id());
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.run.universe.clear();
        config.run.start = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        config.detector.command = vec!["python3".into()];
        config.orchestrator.workers = 0;
        config.execution.stop_pct = Some(2.0);

        let ConfigError::Invalid(problems) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert_eq!(problems.len(), 5, "{problems:?}");
        assert!(problems.iter().any(|p| p.starts_with("execution.stop_pct")));
    }

    #[test]
    fn missing_detector_is_rejected() {
        let text = SAMPLE.replace("name = \"close_threshold\"", "");
        assert!(matches!(RunConfig::from_toml_str(&text), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(RunConfig::from_toml_str("[run"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_reports_path() {
        let err = RunConfig::load(Path::new("/nonexistent/run.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.toml"));
    }
}
