//! In-memory bar store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{validate_series, BarStore, StoreError};
use crate::domain::{Bar, Timeframe};

/// Bar store backed by sorted vectors, one per (instrument, timeframe).
///
/// Series are validated on insert, so queries never need to re-check ordering.
#[derive(Debug, Clone, Default)]
pub struct MemoryBarStore {
    series: BTreeMap<(String, Timeframe), Vec<Bar>>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an unsorted pile of bars.
    ///
    /// Bars are grouped by instrument and timeframe and sorted; a duplicate
    /// timestamp within one series is rejected.
    pub fn from_bars(bars: impl IntoIterator<Item = Bar>) -> Result<Self, StoreError> {
        let mut grouped: BTreeMap<(String, Timeframe), Vec<Bar>> = BTreeMap::new();
        for bar in bars {
            grouped
                .entry((bar.instrument.clone(), bar.timeframe))
                .or_default()
                .push(bar);
        }
        let mut store = Self::new();
        for ((instrument, timeframe), mut series) in grouped {
            series.sort_by_key(|b| b.timestamp);
            store.insert_series(&instrument, timeframe, series)?;
        }
        Ok(store)
    }

    /// Insert (or replace) one series. It must already be strictly ascending.
    pub fn insert_series(
        &mut self,
        instrument: &str,
        timeframe: Timeframe,
        bars: Vec<Bar>,
    ) -> Result<(), StoreError> {
        validate_series(instrument, &bars)?;
        if let Some(bar) = bars.iter().find(|b| b.timeframe != timeframe) {
            return Err(StoreError::Mismatch {
                expected: format!("{instrument} {}", timeframe.as_str()),
                found: format!("{} {}", bar.instrument, bar.timeframe.as_str()),
            });
        }
        self.series.insert((instrument.to_string(), timeframe), bars);
        Ok(())
    }

    pub fn bar_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    /// Every bar of one series, for diagnostics.
    pub fn series(&self, instrument: &str, timeframe: Timeframe) -> Option<&[Bar]> {
        self.series
            .get(&(instrument.to_string(), timeframe))
            .map(Vec::as_slice)
    }
}

impl BarStore for MemoryBarStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn instruments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.keys().map(|(i, _)| i.clone()).collect();
        names.dedup();
        names
    }

    fn range_query(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError> {
        if from >= to {
            return Err(StoreError::InvalidRange {
                instrument: instrument.to_string(),
                from,
                to,
            });
        }
        let series = self
            .series
            .get(&(instrument.to_string(), timeframe))
            .ok_or_else(|| StoreError::UnknownInstrument {
                instrument: instrument.to_string(),
                timeframe: timeframe.as_str().to_string(),
            })?;
        let start = series.partition_point(|b| b.timestamp < from);
        let end = series.partition_point(|b| b.timestamp < to);
        Ok(series[start..end].to_vec())
    }
}
