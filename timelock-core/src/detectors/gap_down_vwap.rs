//! Gap-down VWAP reclaim — the session opens well below the previous close,
//! then price closes back above session VWAP on above-average volume.
//!
//! Fires Long on the bar whose close crosses VWAP from below.

use serde::Deserialize;

use super::{params, round2, session_vwap};
use crate::domain::{Side, Signal};
use crate::harness::{DetectionRequest, Detector};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Params {
    /// Minimum gap down, in percent of the previous close.
    min_gap_pct: f64,
    /// Signal-bar volume over the trailing average.
    min_volume_ratio: f64,
    volume_lookback: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self { min_gap_pct: 2.0, min_volume_ratio: 1.0, volume_lookback: 20 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GapDownVwapReclaim;

impl Detector for GapDownVwapReclaim {
    fn name(&self) -> &str {
        "gap_down_vwap_reclaim"
    }

    fn detect(&self, request: &DetectionRequest<'_>) -> Result<Option<Signal>, String> {
        let p: Params = params(request.config)?;
        let handle = request.snapshot;
        let session = handle.session_bars();
        if session.len() < 2 {
            return Ok(None);
        }
        let Some(prev_close) = handle.history().last().map(|b| b.close) else {
            return Ok(None);
        };
        if prev_close <= 0.0 {
            return Ok(None);
        }

        let gap_pct = (session[0].open - prev_close) / prev_close * 100.0;
        if gap_pct > -p.min_gap_pct {
            return Ok(None);
        }

        let vwap = session_vwap(session);
        let n = session.len();
        let crossed_up = |i: usize| session[i - 1].close <= vwap[i - 1] && session[i].close > vwap[i];
        if !crossed_up(n - 1) {
            return Ok(None);
        }

        // Average volume of the bars before the signal bar, warm-up included.
        let all = handle.bars();
        let before = &all[..all.len() - 1];
        let window = &before[before.len().saturating_sub(p.volume_lookback)..];
        if window.is_empty() {
            return Ok(None);
        }
        let avg_volume = window.iter().map(|b| b.volume as f64).sum::<f64>() / window.len() as f64;
        let current = &session[n - 1];
        let volume_ratio = if avg_volume > 0.0 { current.volume as f64 / avg_volume } else { 0.0 };
        if volume_ratio < p.min_volume_ratio {
            return Ok(None);
        }

        let vwap_crosses = (1..n).filter(|&i| crossed_up(i)).count();
        let gap_score = (gap_pct.abs() / (2.0 * p.min_gap_pct.max(f64::EPSILON))).min(1.0);
        let volume_score = (volume_ratio / (2.0 * p.min_volume_ratio.max(f64::EPSILON))).min(1.0);

        Ok(Some(
            Signal::new(handle.instrument(), current.timestamp, Side::Long, current.close)
                .with_strength(round2((gap_score + volume_score) / 2.0))
                .with_metric("gap_percent", round2(gap_pct))
                .with_metric("vwap", round2(vwap[n - 1]))
                .with_metric("vwap_crosses", vwap_crosses)
                .with_metric("volume_ratio", round2(volume_ratio)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::test_support::{bar, first_signal};
    use crate::domain::Bar;

    fn history() -> Vec<Bar> {
        (-10..0).map(|i| bar(i, 100.0, 100.5, 99.5, 100.0, 1_000)).collect()
    }

    #[test]
    fn fires_when_close_reclaims_vwap() {
        let session = vec![
            bar(0, 95.0, 95.2, 94.0, 94.2, 3_000),
            bar(1, 94.2, 94.4, 93.8, 94.0, 2_000),
            bar(2, 94.0, 96.0, 93.9, 95.8, 2_500),
            bar(3, 95.8, 96.5, 95.5, 96.2, 1_500),
        ];
        let (idx, signal) = first_signal(&GapDownVwapReclaim, &history(), &session, serde_json::Value::Null).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(signal.side, Side::Long);
        assert_eq!(signal.metrics["gap_percent"], serde_json::json!(-5.0));
        assert_eq!(signal.metrics["vwap_crosses"], serde_json::json!(1));
    }

    #[test]
    fn ignores_small_gaps() {
        let session = vec![
            bar(0, 99.5, 99.6, 99.0, 99.1, 3_000),
            bar(1, 99.1, 101.0, 99.0, 100.8, 3_000),
        ];
        assert!(first_signal(&GapDownVwapReclaim, &history(), &session, serde_json::Value::Null).is_none());
    }

    #[test]
    fn volume_filter_from_config() {
        let session = vec![
            bar(0, 95.0, 95.2, 94.0, 94.2, 3_000),
            bar(1, 94.2, 94.4, 93.8, 94.0, 2_000),
            bar(2, 94.0, 96.0, 93.9, 95.8, 2_500),
        ];
        let strict = serde_json::json!({ "min_volume_ratio": 10.0 });
        assert!(first_signal(&GapDownVwapReclaim, &history(), &session, strict).is_none());
    }
}
