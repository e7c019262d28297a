//! CSV-backed bar store: one file per instrument, loaded once.
//!
//! File layout: `<dir>/<INSTRUMENT>.csv` with header
//! `timestamp,open,high,low,close,volume[,timeframe][,session]`.
//! `timestamp` is RFC 3339 or epoch milliseconds. Missing `timeframe` falls
//! back to the store default; missing `session` means regular hours.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BarStore, MemoryBarStore, StoreError};
use crate::domain::{Bar, SessionKind, Timeframe};

#[derive(Debug, Deserialize, Serialize)]
struct CsvRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
    #[serde(default)]
    timeframe: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

/// Bar store that reads a directory of CSV files up front.
///
/// After `open` returns the store is immutable; queries are served from memory.
#[derive(Debug, Clone)]
pub struct CsvBarStore {
    dir: PathBuf,
    inner: MemoryBarStore,
}

impl CsvBarStore {
    /// Load every `*.csv` in `dir`. The file stem is the instrument id.
    pub fn open(dir: &Path, default_timeframe: Timeframe) -> Result<Self, StoreError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        paths.sort();

        let mut all = Vec::new();
        for path in &paths {
            let Some(instrument) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let bars = read_csv(path, instrument, default_timeframe)?;
            debug!(instrument, bars = bars.len(), "loaded csv series");
            all.extend(bars);
        }

        let inner = MemoryBarStore::from_bars(all)?;
        info!(
            dir = %dir.display(),
            files = paths.len(),
            bars = inner.bar_count(),
            "csv bar store ready"
        );
        Ok(Self { dir: dir.to_path_buf(), inner })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn as_memory(&self) -> &MemoryBarStore {
        &self.inner
    }
}

impl BarStore for CsvBarStore {
    fn name(&self) -> &str {
        "csv"
    }

    fn instruments(&self) -> Vec<String> {
        self.inner.instruments()
    }

    fn range_query(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, StoreError> {
        self.inner.range_query(instrument, timeframe, from, to)
    }
}

fn parse_error(path: &Path, record: usize, message: impl Into<String>) -> StoreError {
    StoreError::Parse {
        path: path.display().to_string(),
        record,
        message: message.into(),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_session(raw: Option<&str>) -> Option<SessionKind> {
    match raw.map(str::trim) {
        None | Some("") | Some("regular") => Some(SessionKind::Regular),
        Some("extended") => Some(SessionKind::Extended),
        Some(_) => None,
    }
}

fn read_csv(path: &Path, instrument: &str, default_timeframe: Timeframe) -> Result<Vec<Bar>, StoreError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| parse_error(path, 0, e.to_string()))?;
    let mut bars = Vec::new();
    for (i, row) in reader.deserialize::<CsvRow>().enumerate() {
        let record = i + 1;
        let row = row.map_err(|e| parse_error(path, record, e.to_string()))?;
        let timestamp = parse_timestamp(&row.timestamp)
            .ok_or_else(|| parse_error(path, record, format!("bad timestamp '{}'", row.timestamp)))?;
        let timeframe = match row.timeframe.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => Timeframe::parse(raw)
                .ok_or_else(|| parse_error(path, record, format!("bad timeframe '{raw}'")))?,
            None => default_timeframe,
        };
        let session = parse_session(row.session.as_deref())
            .ok_or_else(|| parse_error(path, record, "session must be 'regular' or 'extended'"))?;
        bars.push(Bar {
            instrument: instrument.to_string(),
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            timeframe,
            session,
        });
    }
    Ok(bars)
}

/// Write one instrument's bars in the format `CsvBarStore` reads.
pub fn write_csv(path: &Path, bars: &[Bar]) -> Result<(), StoreError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| parse_error(path, 0, e.to_string()))?;
    for (i, bar) in bars.iter().enumerate() {
        let session = match bar.session {
            SessionKind::Regular => "regular",
            SessionKind::Extended => "extended",
        };
        writer
            .serialize(CsvRow {
                timestamp: bar.timestamp.to_rfc3339(),
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
                timeframe: Some(bar.timeframe.as_str().to_string()),
                session: Some(session.to_string()),
            })
            .map_err(|e| parse_error(path, i + 1, e.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn reads_millis_and_rfc3339_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("QQQ.csv"),
            "timestamp,open,high,low,close,volume,timeframe,session\n\
             1704205800000,400,401,399,400.5,1000,5m,regular\n\
             2024-01-02T14:35:00Z,400.5,402,400,401,1200,5m,extended\n",
        )
        .unwrap();

        let store = CsvBarStore::open(dir.path(), Timeframe::Minute5).unwrap();
        assert_eq!(store.instruments(), vec!["QQQ".to_string()]);

        let from = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let bars = store
            .range_query("QQQ", Timeframe::Minute5, from, from + Duration::days(1))
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap());
        assert_eq!(bars[1].session, SessionKind::Extended);
    }

    #[test]
    fn missing_optional_columns_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("AAPL.csv"),
            "timestamp,open,high,low,close,volume\n2024-01-02T00:00:00Z,1,2,0.5,1.5,10\n",
        )
        .unwrap();
        let store = CsvBarStore::open(dir.path(), Timeframe::Daily).unwrap();
        let series = store.as_memory().series("AAPL", Timeframe::Daily).unwrap();
        assert_eq!(series[0].session, SessionKind::Regular);
    }

    #[test]
    fn bad_timestamp_reports_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("BAD.csv"),
            "timestamp,open,high,low,close,volume\nyesterday,1,2,0.5,1.5,10\n",
        )
        .unwrap();
        let err = CsvBarStore::open(dir.path(), Timeframe::Daily).unwrap_err();
        assert!(matches!(err, StoreError::Parse { record: 1, .. }));
    }

    #[test]
    fn write_then_open_preserves_bars() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        let bars: Vec<Bar> = (0..3)
            .map(|i| Bar {
                instrument: "MU".into(),
                timestamp: t0 + Duration::minutes(5 * i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10,
                timeframe: Timeframe::Minute5,
                session: SessionKind::Regular,
            })
            .collect();
        write_csv(&dir.path().join("MU.csv"), &bars).unwrap();
        let store = CsvBarStore::open(dir.path(), Timeframe::Minute5).unwrap();
        assert_eq!(store.as_memory().series("MU", Timeframe::Minute5).unwrap(), &bars[..]);
    }
}
