//! Signal — a detected opportunity at one specific bar.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a signal or trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplies price deltas into P&L.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

/// A signal produced by detection logic at `timestamp`.
///
/// `metrics` is an ordered map so two identical signals always serialize to
/// identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub strength: f64,
    /// Reference price at the signal bar (defaults to its close).
    pub price: f64,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl Signal {
    pub fn new(
        instrument: impl Into<String>,
        timestamp: DateTime<Utc>,
        side: Side,
        price: f64,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            side,
            strength: 1.0,
            price,
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }
}
