//! Close crossing a fixed level. Simple enough to reason about in tests.

use serde::Deserialize;

use super::params;
use crate::domain::{Side, Signal};
use crate::harness::{DetectionRequest, Detector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Direction {
    #[default]
    Above,
    Below,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Params {
    level: Option<f64>,
    direction: Direction,
    side: Option<Side>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloseThreshold;

impl Detector for CloseThreshold {
    fn name(&self) -> &str {
        "close_threshold"
    }

    fn detect(&self, request: &DetectionRequest<'_>) -> Result<Option<Signal>, String> {
        let p: Params = params(request.config)?;
        let level = p.level.ok_or("close_threshold needs a 'level' parameter")?;

        // Only session bars fire; the previous close may be the last warm-up bar.
        if request.snapshot.session_bars().is_empty() {
            return Ok(None);
        }
        let bars = request.snapshot.bars();
        let [.., prev, current] = bars else {
            return Ok(None);
        };

        let crossed = match p.direction {
            Direction::Above => prev.close <= level && current.close > level,
            Direction::Below => prev.close >= level && current.close < level,
        };
        if !crossed {
            return Ok(None);
        }
        let side = p.side.unwrap_or(match p.direction {
            Direction::Above => Side::Long,
            Direction::Below => Side::Short,
        });
        Ok(Some(
            Signal::new(request.snapshot.instrument(), current.timestamp, side, current.close)
                .with_metric("level", level)
                .with_metric("previous_close", prev.close),
        ))
    }
}
