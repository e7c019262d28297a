//! Unit side of the line protocol: serves a [`Detector`] over stdin/stdout.
//!
//! Keeps one mirrored [`IsolationSnapshot`] per wire snapshot id, rebuilt on
//! `reset` and grown from deltas otherwise, so detectors behind the server
//! read exactly what an in-process detector would.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::in_process::Detector;
use super::protocol::{self, DetectPayload, Request, Response, WireSignal, PROTOCOL_VERSION};
use super::DetectionRequest;
use crate::domain::SessionKey;
use crate::snapshot::{IsolationSnapshot, SnapshotConfig};

pub struct DetectorServer {
    detector: Arc<dyn Detector>,
    mirrors: HashMap<u64, IsolationSnapshot>,
}

impl DetectorServer {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self { detector, mirrors: HashMap::new() }
    }

    pub fn open_snapshots(&self) -> usize {
        self.mirrors.len()
    }

    /// Answer one request line.
    pub fn handle_line(&mut self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request),
            Err(e) => Response::Error { message: format!("bad request: {e}") },
        }
    }

    pub fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Ping { .. } => Response::Pong,
            Request::Release { snapshot, .. } => {
                self.mirrors.remove(&snapshot);
                Response::Ok
            }
            Request::Detect(payload) => {
                if payload.v != PROTOCOL_VERSION {
                    return Response::Error { message: format!("unsupported protocol version {}", payload.v) };
                }
                let snapshot = payload.snapshot;
                match self.detect(payload) {
                    Ok(response) => response,
                    Err(message) => {
                        // Out of sync: forget the mirror so the next reset rebuilds it.
                        self.mirrors.remove(&snapshot);
                        Response::Error { message }
                    }
                }
            }
        }
    }

    fn detect(&mut self, payload: DetectPayload) -> Result<Response, String> {
        let DetectPayload { snapshot, instrument, session_date, reset, warmup, bars, references, universe, timestamp, config, .. } =
            payload;

        if reset || !self.mirrors.contains_key(&snapshot) {
            if !reset {
                return Err(format!("delta for unknown snapshot {snapshot}"));
            }
            let warmup = warmup.min(bars.len());
            let cfg = SnapshotConfig { warmup_bars: warmup, min_warmup_bars: 0 };
            let mirror = IsolationSnapshot::open(
                SessionKey::new(instrument, session_date),
                &bars[..warmup],
                &bars[warmup..],
                references.into_iter().collect(),
                &cfg,
                bars.len(),
            )
            .map_err(|e| e.to_string())?;
            self.mirrors.insert(snapshot, mirror);
        } else {
            let mirror = self
                .mirrors
                .get_mut(&snapshot)
                .ok_or_else(|| format!("delta for unknown snapshot {snapshot}"))?;
            for (reference, delta) in references {
                mirror.extend_reference(&reference, delta).map_err(|e| e.to_string())?;
            }
            for bar in bars {
                mirror.append(bar).map_err(|e| e.to_string())?;
            }
        }

        let mirror = self
            .mirrors
            .get(&snapshot)
            .ok_or_else(|| format!("snapshot {snapshot} vanished"))?;
        let handle = mirror.handle().map_err(|e| e.to_string())?;
        let request = DetectionRequest { snapshot: handle, universe: &universe, timestamp, config: &config };

        let detector = &self.detector;
        match panic::catch_unwind(AssertUnwindSafe(|| detector.detect(&request))) {
            Ok(Ok(Some(signal))) => Ok(Response::Signal { signal: WireSignal::from(&signal) }),
            Ok(Ok(None)) => Ok(Response::NoSignal),
            Ok(Err(message)) => Ok(Response::Error { message }),
            Err(_) => Ok(Response::Error { message: format!("detector '{}' panicked", detector.name()) }),
        }
    }

    /// Serve requests until `input` ends. One response line per request line.
    pub fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> io::Result<()> {
        debug!(detector = self.detector.name(), "detector server ready");
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line);
            if let Response::Error { message } = &response {
                warn!(detector = self.detector.name(), %message, "request failed");
            }
            let bytes = protocol::encode_line(&response).map_err(io::Error::other)?;
            output.write_all(&bytes)?;
            output.flush()?;
        }
        debug!(open = self.mirrors.len(), "detector server input closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Bar, SessionKind, Side, Signal, Timeframe};
    use crate::harness::FnDetector;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn bar(i: i64, close: f64) -> Bar {
        Bar {
            instrument: "AAA".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap() + Duration::minutes(i),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1,
            timeframe: Timeframe::Minute1,
            session: SessionKind::Regular,
        }
    }

    fn payload(snapshot: u64, reset: bool, bars: Vec<Bar>) -> Request {
        let timestamp = bars.last().map(|b| b.timestamp).unwrap_or_else(Utc::now);
        Request::Detect(DetectPayload {
            v: PROTOCOL_VERSION,
            snapshot,
            instrument: "AAA".into(),
            session_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            reset,
            warmup: 2,
            bars,
            references: BTreeMap::new(),
            universe: vec!["AAA".into()],
            timestamp,
            config: serde_json::json!({ "min_len": 4 }),
        })
    }

    /// Signals once the mirror holds `min_len` bars; reports what it saw.
    fn server() -> DetectorServer {
        DetectorServer::new(Arc::new(FnDetector::new("len", |req: &DetectionRequest<'_>| {
            let min_len = req.config["min_len"].as_u64().unwrap_or(0) as usize;
            let last = req.snapshot.last().ok_or("empty")?;
            if req.snapshot.len() >= min_len {
                Ok(Some(
                    Signal::new(&last.instrument, last.timestamp, Side::Long, last.close)
                        .with_metric("seen", req.snapshot.len()),
                ))
            } else {
                Ok(None)
            }
        })))
    }

    #[test]
    fn mirror_grows_from_deltas() {
        let mut server = server();
        assert_eq!(server.handle(payload(1, true, vec![bar(0, 1.0), bar(1, 2.0), bar(2, 3.0)])), Response::NoSignal);
        let Response::Signal { signal } = server.handle(payload(1, false, vec![bar(3, 4.0)])) else {
            panic!("expected signal");
        };
        assert_eq!(signal.metrics["seen"], serde_json::json!(4));
        assert_eq!(server.handle(Request::Release { v: 1, snapshot: 1 }), Response::Ok);
        assert_eq!(server.open_snapshots(), 0);
    }

    #[test]
    fn delta_for_unknown_snapshot_is_error() {
        let mut server = server();
        assert!(matches!(server.handle(payload(7, false, vec![bar(0, 1.0)])), Response::Error { .. }));
    }

    #[test]
    fn non_monotonic_delta_drops_mirror() {
        let mut server = server();
        server.handle(payload(1, true, vec![bar(0, 1.0), bar(1, 2.0)]));
        assert!(matches!(server.handle(payload(1, false, vec![bar(1, 2.0)])), Response::Error { .. }));
        assert_eq!(server.open_snapshots(), 0);
    }

    #[test]
    fn serve_answers_line_per_line() {
        let mut server = server();
        let input = "{\"op\":\"ping\",\"v\":1}\n\nnot json\n";
        let mut out = Vec::new();
        server.serve(input.as_bytes(), &mut out).unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"status\":\"pong\"}");
        assert!(lines[1].starts_with("{\"status\":\"error\""));
    }
}
