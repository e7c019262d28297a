use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identity of a piece of detection logic. Pooled execution units are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectorId(pub String);

impl DetectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Content-derived id: BLAKE3 over the name and its canonical parameters.
    ///
    /// Two detectors with the same name but different parameters must not share
    /// warmed-up units, so the parameters are part of the identity.
    pub fn from_parts(name: &str, params: &serde_json::Value) -> Self {
        let canonical = serde_json::json!({ "name": name, "params": params });
        let hash = blake3::hash(canonical.to_string().as_bytes());
        Self(format!("{name}:{}", &hash.to_hex()[..12]))
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique id of one opened isolation snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

impl SnapshotId {
    pub fn next() -> Self {
        Self(NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap-{}", self.0)
    }
}

/// One instrument's activity during one trading date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub instrument: String,
    pub date: NaiveDate,
}

impl SessionKey {
    pub fn new(instrument: impl Into<String>, date: NaiveDate) -> Self {
        Self { instrument: instrument.into(), date }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instrument, self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_id_deterministic() {
        let params = serde_json::json!({ "level": 101.0 });
        let a = DetectorId::from_parts("close_threshold", &params);
        let b = DetectorId::from_parts("close_threshold", &params);
        assert_eq!(a, b);
        assert!(a.0.starts_with("close_threshold:"));
    }

    #[test]
    fn detector_id_changes_with_params() {
        let a = DetectorId::from_parts("close_threshold", &serde_json::json!({ "level": 1.0 }));
        let b = DetectorId::from_parts("close_threshold", &serde_json::json!({ "level": 2.0 }));
        assert_ne!(a, b);
    }

    #[test]
    fn snapshot_ids_are_unique() {
        let a = SnapshotId::next();
        let b = SnapshotId::next();
        assert!(b.0 > a.0);
    }

    #[test]
    fn session_key_display() {
        let key = SessionKey::new("QQQ", NaiveDate::from_ymd_opt(2025, 11, 14).unwrap());
        assert_eq!(key.to_string(), "QQQ@2025-11-14");
    }
}
