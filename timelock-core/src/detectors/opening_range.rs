//! Opening-range breakout — first close beyond the range of the session's
//! first `range_bars` bars.

use serde::Deserialize;

use super::{params, round2};
use crate::domain::{Side, Signal};
use crate::harness::{DetectionRequest, Detector};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Params {
    range_bars: usize,
    side: Side,
}

impl Default for Params {
    fn default() -> Self {
        Self { range_bars: 6, side: Side::Long }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpeningRangeBreakout;

impl Detector for OpeningRangeBreakout {
    fn name(&self) -> &str {
        "opening_range_breakout"
    }

    fn detect(&self, request: &DetectionRequest<'_>) -> Result<Option<Signal>, String> {
        let p: Params = params(request.config)?;
        if p.range_bars == 0 {
            return Err("range_bars must be at least 1".into());
        }
        let session = request.snapshot.session_bars();
        if session.len() <= p.range_bars {
            return Ok(None);
        }

        let range = &session[..p.range_bars];
        let range_high = range.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let range_low = range.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);

        let n = session.len();
        let (prev, current) = (&session[n - 2], &session[n - 1]);
        let broke = match p.side {
            Side::Long => prev.close <= range_high && current.close > range_high,
            Side::Short => prev.close >= range_low && current.close < range_low,
        };
        if !broke {
            return Ok(None);
        }

        let level = match p.side {
            Side::Long => range_high,
            Side::Short => range_low,
        };
        let extension = (current.close - level).abs() / level * 100.0;
        Ok(Some(
            Signal::new(request.snapshot.instrument(), current.timestamp, p.side, current.close)
                .with_strength(round2(extension.min(1.0)))
                .with_metric("range_high", round2(range_high))
                .with_metric("range_low", round2(range_low))
                .with_metric("bars_into_session", n - 1),
        ))
    }
}
