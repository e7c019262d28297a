//! Bar Store access layer.
//!
//! The `BarStore` trait abstracts over where bars live (memory, CSV files, an
//! external database) so the engine only depends on range queries. Stores are
//! immutable once loaded and are shared across workers by reference.

pub mod csv_store;
pub mod memory;
pub mod synthetic;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Bar, Timeframe};

pub use csv_store::{write_csv, CsvBarStore};
pub use memory::MemoryBarStore;
pub use synthetic::{SyntheticConfig, SyntheticSessions};

/// Structured error types for bar store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown instrument '{instrument}' ({timeframe})")]
    UnknownInstrument { instrument: String, timeframe: String },

    #[error("bars for '{instrument}' are not strictly ascending at {at}")]
    Unordered { instrument: String, at: DateTime<Utc> },

    #[error("bar for '{found}' stored under '{expected}'")]
    Mismatch { expected: String, found: String },

    #[error("invalid query range for '{instrument}': {from} >= {to}")]
    InvalidRange {
        instrument: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("parse error in {path} at record {record}: {message}")]
    Parse {
        path: String,
        record: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only time-series accessor over OHLCV bars.
///
/// Implementations must return bars strictly ordered by timestamp with no
/// duplicates. Queries are half-open: `from` inclusive, `to` exclusive.
pub trait BarStore: Send + Sync {
    /// Human-readable name of this store.
    fn name(&self) -> &str;

    /// All instruments the store holds, sorted.
    fn instruments(&self) -> Vec<String>;

    /// Bars for one instrument with `from <= timestamp < to`.
    fn range_query(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError>;

    /// Bars for several instruments over the same range.
    fn batch_query(
        &self,
        instruments: &[String],
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Vec<Bar>>, StoreError> {
        instruments
            .iter()
            .map(|inst| Ok((inst.clone(), self.range_query(inst, timeframe, from, to)?)))
            .collect()
    }
}

/// Check the store contract on a series: one instrument, strictly ascending timestamps.
pub fn validate_series(instrument: &str, bars: &[Bar]) -> Result<(), StoreError> {
    for bar in bars {
        if bar.instrument != instrument {
            return Err(StoreError::Mismatch {
                expected: instrument.to_string(),
                found: bar.instrument.clone(),
            });
        }
    }
    for pair in bars.windows(2) {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(StoreError::Unordered {
                instrument: instrument.to_string(),
                at: pair[1].timestamp,
            });
        }
    }
    Ok(())
}
