//! Wire contract between the harness and out-of-process detection units.
//!
//! Newline-delimited JSON, one compact object per line, in both directions.
//! Every `detect` request carries the full invocation context (universe,
//! timestamp, configuration) so units never depend on ambient process state.
//!
//! Snapshot contents are synced incrementally: the first request for a
//! snapshot has `reset = true` and carries every visible bar; later requests
//! carry only bars appended since the previous request.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::DetectionError;
use crate::domain::{Bar, Side, Signal};

pub const PROTOCOL_VERSION: u32 = 1;

/// Default ceiling on one response line.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// A request as read by a detection unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Detect(DetectPayload),
    Release { v: u32, snapshot: u64 },
    Ping { v: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectPayload {
    pub v: u32,
    pub snapshot: u64,
    pub instrument: String,
    pub session_date: NaiveDate,
    /// True when `bars` is the whole snapshot rather than a delta.
    pub reset: bool,
    /// Leading bars of the snapshot that are warm-up history (meaningful on reset).
    pub warmup: usize,
    pub bars: Vec<Bar>,
    #[serde(default)]
    pub references: BTreeMap<String, Vec<Bar>>,
    pub universe: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Borrowed form of a `detect` request; serializes to the same shape as
/// `Request::Detect` without cloning bars.
#[derive(Debug, Serialize)]
pub(crate) struct DetectFrame<'a> {
    pub op: &'static str,
    pub v: u32,
    pub snapshot: u64,
    pub instrument: &'a str,
    pub session_date: NaiveDate,
    pub reset: bool,
    pub warmup: usize,
    pub bars: &'a [Bar],
    pub references: BTreeMap<&'a str, &'a [Bar]>,
    pub universe: &'a [String],
    pub timestamp: DateTime<Utc>,
    pub config: &'a serde_json::Value,
}

/// A unit's reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Signal { signal: WireSignal },
    NoSignal,
    Error { message: String },
    Pong,
    Ok,
}

/// Signal as reported by a unit. The harness fills in the instrument and
/// defaults the timestamp to the invocation instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSignal {
    pub side: Side,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

fn default_strength() -> f64 {
    1.0
}

impl From<&Signal> for WireSignal {
    fn from(signal: &Signal) -> Self {
        Self {
            side: signal.side,
            strength: signal.strength,
            price: Some(signal.price),
            timestamp: Some(signal.timestamp),
            metrics: signal.metrics.clone(),
        }
    }
}

impl WireSignal {
    pub fn into_signal(self, instrument: &str, now: DateTime<Utc>, fallback_price: f64) -> Signal {
        Signal {
            instrument: instrument.to_string(),
            timestamp: self.timestamp.unwrap_or(now),
            side: self.side,
            strength: self.strength,
            price: self.price.unwrap_or(fallback_price),
            metrics: self.metrics,
        }
    }
}

/// Serialize compactly and terminate with a newline.
pub fn encode_line<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one response line, enforcing the byte ceiling.
pub fn decode_response(line: &[u8], max_bytes: usize) -> Result<Response, DetectionError> {
    if line.len() > max_bytes {
        return Err(DetectionError::Oversized { limit: max_bytes });
    }
    serde_json::from_slice(line).map_err(|e| {
        let preview: String = String::from_utf8_lossy(&line[..line.len().min(80)]).into_owned();
        DetectionError::Malformed(format!("{e} (line starts: {preview:?})"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn decodes_no_signal() {
        let resp = decode_response(br#"{"status":"no_signal"}"#, 1024).unwrap();
        assert_eq!(resp, Response::NoSignal);
    }

    #[test]
    fn decodes_signal_with_defaults() {
        let resp = decode_response(br#"{"status":"signal","signal":{"side":"long"}}"#, 1024).unwrap();
        let Response::Signal { signal } = resp else {
            panic!("expected signal");
        };
        assert_eq!(signal.strength, 1.0);
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        let sig = signal.into_signal("QQQ", now, 401.5);
        assert_eq!(sig.timestamp, now);
        assert_eq!(sig.price, 401.5);
        assert_eq!(sig.instrument, "QQQ");
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let err = decode_response(br#"{"status":"signal","signal":{"si"#, 1024).unwrap_err();
        assert!(matches!(err, DetectionError::Malformed(_)));
    }

    #[test]
    fn oversized_payload_rejected_before_parsing() {
        let line = format!(r#"{{"status":"error","message":"{}"}}"#, "x".repeat(200));
        let err = decode_response(line.as_bytes(), 100).unwrap_err();
        assert_eq!(err, DetectionError::Oversized { limit: 100 });
    }

    #[test]
    fn requests_are_tagged_by_op() {
        let line = encode_line(&Request::Ping { v: PROTOCOL_VERSION }).unwrap();
        assert_eq!(line, b"{\"op\":\"ping\",\"v\":1}\n".to_vec());
        let parsed: Request = serde_json::from_slice(&line).unwrap();
        assert_eq!(parsed, Request::Ping { v: 1 });
    }

    #[test]
    fn detect_frame_parses_as_request() {
        let config = serde_json::json!({ "level": 100.0 });
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        let frame = DetectFrame {
            op: "detect",
            v: PROTOCOL_VERSION,
            snapshot: 9,
            instrument: "QQQ",
            session_date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            reset: true,
            warmup: 0,
            bars: &[],
            references: BTreeMap::new(),
            universe: &["QQQ".to_string()],
            timestamp: ts,
            config: &config,
        };
        let line = encode_line(&frame).unwrap();
        assert!(!line[..line.len() - 1].contains(&b'\n'));
        let Request::Detect(payload) = serde_json::from_slice(&line).unwrap() else {
            panic!("expected detect");
        };
        assert_eq!(payload.snapshot, 9);
        assert_eq!(payload.config, config);
        assert_eq!(payload.timestamp, ts);
    }
}
