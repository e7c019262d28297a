//! Built-in detectors.
//!
//! Each reads its parameters from the invocation's `config` on every call,
//! so the same detector instance serves any parameter set and a process unit
//! running `timelock detector` behaves exactly like the in-process version.

mod close_threshold;
mod gap_down_vwap;
mod opening_range;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::Bar;
use crate::harness::Detector;

pub use close_threshold::CloseThreshold;
pub use gap_down_vwap::GapDownVwapReclaim;
pub use opening_range::OpeningRangeBreakout;

pub const BUILTIN_DETECTORS: &[&str] = &["gap_down_vwap_reclaim", "opening_range_breakout", "close_threshold"];

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("unknown detector: {0} (built-ins: {list})", list = BUILTIN_DETECTORS.join(", "))]
    UnknownDetector(String),
}

/// Look up a built-in detector by name.
pub fn create_detector(name: &str) -> Result<Arc<dyn Detector>, FactoryError> {
    match name {
        "gap_down_vwap_reclaim" => Ok(Arc::new(GapDownVwapReclaim)),
        "opening_range_breakout" => Ok(Arc::new(OpeningRangeBreakout)),
        "close_threshold" => Ok(Arc::new(CloseThreshold)),
        other => Err(FactoryError::UnknownDetector(other.to_string())),
    }
}

/// Decode parameters; a null config means all defaults.
fn params<T: DeserializeOwned + Default>(config: &serde_json::Value) -> Result<T, String> {
    if config.is_null() {
        return Ok(T::default());
    }
    T::deserialize(config).map_err(|e| format!("invalid parameters: {e}"))
}

/// Cumulative session VWAP at each bar, from typical price.
fn session_vwap(session: &[Bar]) -> Vec<f64> {
    let mut pv = 0.0;
    let mut volume = 0.0;
    session
        .iter()
        .map(|bar| {
            let typical = (bar.high + bar.low + bar.close) / 3.0;
            pv += typical * bar.volume as f64;
            volume += bar.volume as f64;
            if volume > 0.0 {
                pv / volume
            } else {
                typical
            }
        })
        .collect()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
