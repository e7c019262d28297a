//! Run export — JSON, JSONL and CSV artifacts.
//!
//! - `run.json`: the full `RunResult`, schema-versioned
//! - `signals.jsonl`: one compact signal per line
//! - `trades.csv`: trade tape for external analysis tools
//!
//! Consumers rely only on field presence; unknown schema versions are
//! rejected on load.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use timelock_core::domain::Trade;

use crate::result::{RunResult, SCHEMA_VERSION};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unsupported schema version {found} (max supported: {SCHEMA_VERSION})")]
    UnsupportedSchema { found: u32 },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io { path: path.to_path_buf(), source }
}

/// Paths of the written artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub run_json: PathBuf,
    pub signals_jsonl: PathBuf,
    pub trades_csv: PathBuf,
}

/// Deserialize a `RunResult`, rejecting newer schema versions.
pub fn import_json(json: &str) -> Result<RunResult, ExportError> {
    let result: RunResult = serde_json::from_str(json)?;
    if result.metadata.schema_version > SCHEMA_VERSION {
        return Err(ExportError::UnsupportedSchema { found: result.metadata.schema_version });
    }
    Ok(result)
}

/// Trade tape as CSV. Partial exits are summarized by count.
pub fn trades_csv(trades: &[Trade]) -> Result<String, ExportError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "instrument",
        "session_date",
        "side",
        "policy",
        "signal_timestamp",
        "entry_timestamp",
        "entry_price",
        "exit_timestamp",
        "exit_price",
        "exit_reason",
        "quantity",
        "pnl",
        "pnl_pct",
        "bars_held",
        "highest_price",
        "lowest_price",
        "partial_exits",
    ])?;

    for t in trades {
        wtr.write_record([
            t.instrument.as_str(),
            &t.session_date.to_string(),
            match t.side {
                timelock_core::domain::Side::Long => "long",
                timelock_core::domain::Side::Short => "short",
            },
            &t.policy,
            &t.signal_timestamp.to_rfc3339(),
            &t.entry_timestamp.to_rfc3339(),
            &format!("{:.6}", t.entry_price),
            &t.exit_timestamp.to_rfc3339(),
            &format!("{:.6}", t.exit_price),
            t.exit_reason.as_str(),
            &format!("{}", t.quantity),
            &format!("{:.2}", t.pnl),
            &format!("{:.4}", t.pnl_pct),
            &t.bars_held.to_string(),
            &format!("{:.6}", t.highest_price),
            &format!("{:.6}", t.lowest_price),
            &t.partial_exits.len().to_string(),
        ])?;
    }

    let data = wtr.into_inner().map_err(|e| ExportError::Csv(e.into_error().into()))?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Write the artifact set into `dir`, creating it if needed.
pub fn export_run(result: &RunResult, dir: &Path) -> Result<ExportPaths, ExportError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let paths = ExportPaths {
        run_json: dir.join("run.json"),
        signals_jsonl: dir.join("signals.jsonl"),
        trades_csv: dir.join("trades.csv"),
    };

    let json = serde_json::to_string_pretty(result)?;
    fs::write(&paths.run_json, json).map_err(io_err(&paths.run_json))?;

    let file = File::create(&paths.signals_jsonl).map_err(io_err(&paths.signals_jsonl))?;
    let mut out = BufWriter::new(file);
    for signal in &result.signals {
        let line = serde_json::to_string(signal)?;
        writeln!(out, "{line}").map_err(io_err(&paths.signals_jsonl))?;
    }
    out.flush().map_err(io_err(&paths.signals_jsonl))?;

    fs::write(&paths.trades_csv, trades_csv(&result.trades)?).map_err(io_err(&paths.trades_csv))?;

    Ok(paths)
}
