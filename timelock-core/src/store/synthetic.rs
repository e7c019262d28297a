//! Synthetic intraday sessions for demos, benches, and tests.
//!
//! Deterministic for a given seed: each instrument gets its own RNG stream
//! derived from the seed and the instrument name.

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Bar, SessionKind, Timeframe};

/// Parameters for generated sessions.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub seed: u64,
    pub timeframe: Timeframe,
    pub utc_offset: FixedOffset,
    pub session_open: NaiveTime,
    pub bars_per_session: usize,
    /// Extended-hours bars emitted before the regular open.
    pub premarket_bars: usize,
    pub start_price: f64,
    /// Per-bar return standard deviation (as a fraction).
    pub volatility: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            timeframe: Timeframe::Minute5,
            utc_offset: FixedOffset::west_opt(5 * 3600).unwrap(),
            session_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            bars_per_session: 78,
            premarket_bars: 0,
            start_price: 100.0,
            volatility: 0.002,
        }
    }
}

/// Generator of weekday sessions.
pub struct SyntheticSessions {
    config: SyntheticConfig,
}

impl SyntheticSessions {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }

    /// Bars for `instrument` on every weekday in `[start, end]`.
    pub fn generate(&self, instrument: &str, start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
        let cfg = &self.config;
        let stream = blake3::hash(instrument.as_bytes());
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&stream.as_bytes()[..8]);
        let mut rng = StdRng::seed_from_u64(cfg.seed ^ u64::from_le_bytes(seed_bytes));

        let step = cfg.timeframe.duration();
        let mut price = cfg.start_price;
        let mut bars = Vec::new();
        let mut date = start;

        while date <= end {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                // Overnight gap.
                price *= 1.0 + rng.gen_range(-0.02..0.02);
                let Some(open_local) = cfg.utc_offset.from_local_datetime(&date.and_time(cfg.session_open)).single() else {
                    date += Duration::days(1);
                    continue;
                };
                let open_utc = open_local.with_timezone(&Utc);
                let first = open_utc - step * cfg.premarket_bars as i32;

                for i in 0..(cfg.premarket_bars + cfg.bars_per_session) {
                    let open = price;
                    let ret: f64 = rng.gen_range(-1.0..1.0) * cfg.volatility * 1.7;
                    let close = (open * (1.0 + ret)).max(0.01);
                    let wiggle = open.max(close) * cfg.volatility * rng.gen_range(0.0..1.0);
                    let high = open.max(close) + wiggle;
                    let low = (open.min(close) - wiggle).max(0.005);
                    let session = if i < cfg.premarket_bars {
                        SessionKind::Extended
                    } else {
                        SessionKind::Regular
                    };
                    bars.push(Bar {
                        instrument: instrument.to_string(),
                        timestamp: first + step * i as i32,
                        open,
                        high,
                        low,
                        close,
                        volume: rng.gen_range(1_000..50_000),
                        timeframe: cfg.timeframe,
                        session,
                    });
                    price = close;
                }
            }
            date += Duration::days(1);
        }
        bars
    }
}
