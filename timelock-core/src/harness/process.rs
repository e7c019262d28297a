//! Sandboxed detection units: child processes speaking the line protocol.
//!
//! A reader thread owns the child's stdout and forwards complete lines over a
//! channel, so the deadline is enforced with `recv_timeout` and a unit that
//! never answers is killed instead of blocking the worker. A line longer than
//! the output ceiling is cut off at the ceiling, never buffered in full.
//!
//! `Persistent` units stay alive across invocations and receive each
//! snapshot incrementally. `OneShot` units are spawned for a single request
//! with the full snapshot and are never pooled.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::protocol::{self, DetectFrame, Request, Response, PROTOCOL_VERSION};
use super::{Detection, DetectionError, DetectionRequest, DetectionUnit, UnitFactory};
use crate::domain::{DetectorId, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    #[default]
    Persistent,
    OneShot,
}

/// How to launch a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub mode: ProcessMode,
    pub max_output_bytes: usize,
    /// Deadline for the startup handshake of a persistent unit.
    pub startup_deadline: Duration,
    /// Lines of stderr kept for error reports.
    pub stderr_tail: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            mode: ProcessMode::Persistent,
            max_output_bytes: protocol::DEFAULT_MAX_OUTPUT_BYTES,
            startup_deadline: Duration::from_secs(10),
            stderr_tail: 20,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }
}

enum ReadEvent {
    Line(Vec<u8>),
    /// Bytes before EOF with no terminating newline.
    Partial(Vec<u8>),
    Oversized,
    Eof,
    Failed(String),
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

struct LiveChild {
    child: Child,
    /// Lines queued for the writer thread; dropping it closes the child's stdin.
    input: Option<Sender<Vec<u8>>>,
    events: Receiver<ReadEvent>,
    stderr: StderrTail,
}

impl LiveChild {
    fn launch(spec: &ProcessSpec) -> Result<Self, DetectionError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .map_err(|e| DetectionError::Startup(format!("{}: {e}", spec.program.display())))?;

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            reap(&mut child);
            return Err(DetectionError::Startup("child pipes unavailable".into()));
        };

        let (input, lines) = mpsc::channel();
        let (tx, events) = mpsc::channel();
        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let started = spawn_stdin_writer(stdin, lines)
            .and_then(|_| spawn_stdout_reader(stdout, spec.max_output_bytes, tx))
            .and_then(|_| spawn_stderr_reader(stderr, Arc::clone(&tail), spec.stderr_tail));
        if let Err(e) = started {
            reap(&mut child);
            return Err(DetectionError::Startup(format!("pipe thread: {e}")));
        }

        debug!(program = %spec.program.display(), pid = child.id(), "detection unit started");
        Ok(Self { child, input: Some(input), events, stderr: tail })
    }

    /// Queue one line. Never blocks on a child that has stopped reading.
    fn send(&self, line: &[u8]) -> Result<(), DetectionError> {
        let Some(input) = self.input.as_ref() else {
            return Err(DetectionError::Crashed("stdin already closed".into()));
        };
        input
            .send(line.to_vec())
            .map_err(|_| DetectionError::Crashed(format!("stdin closed{}", self.stderr_suffix())))
    }

    fn close_input(&mut self) {
        self.input = None;
    }

    /// Wait for the next event until `until`.
    fn recv(&self, until: Instant, deadline: Duration) -> Result<ReadEvent, DetectionError> {
        let remaining = until.saturating_duration_since(Instant::now());
        match self.events.recv_timeout(remaining) {
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(DetectionError::Timeout(deadline)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(DetectionError::Crashed(format!("output stream closed{}", self.stderr_suffix())))
            }
        }
    }

    /// Exit status, if the child exits before `until`.
    fn wait_until(&mut self, until: Instant) -> Option<ExitStatus> {
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) if Instant::now() < until => thread::sleep(Duration::from_millis(5)),
                Ok(None) | Err(_) => return None,
            }
        }
    }

    fn stderr_suffix(&self) -> String {
        let tail = self.stderr.lock().unwrap_or_else(|e| e.into_inner());
        if tail.is_empty() {
            String::new()
        } else {
            format!("; stderr: {}", tail.iter().cloned().collect::<Vec<_>>().join(" | "))
        }
    }

    fn kill(mut self) {
        self.close_input();
        reap(&mut self.child);
    }
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        trace!(error = %e, "kill on exited unit");
    }
    if let Err(e) = child.wait() {
        warn!(error = %e, "failed to reap detection unit");
    }
}

fn spawn_stdin_writer(mut stdin: ChildStdin, lines: Receiver<Vec<u8>>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("timelock-unit-stdin".into())
        .spawn(move || {
            for line in lines {
                if let Err(e) = stdin.write_all(&line).and_then(|_| stdin.flush()) {
                    trace!(error = %e, "unit stdin closed");
                    break;
                }
            }
        })
        .map(|_| ())
}

fn spawn_stdout_reader(stdout: ChildStdout, limit: usize, tx: Sender<ReadEvent>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("timelock-unit-stdout".into())
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut buf = Vec::new();
                let read = reader.by_ref().take(limit as u64 + 1).read_until(b'\n', &mut buf);
                let event = match read {
                    Ok(0) => ReadEvent::Eof,
                    Ok(_) if buf.last() == Some(&b'\n') => {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        ReadEvent::Line(buf)
                    }
                    Ok(_) if buf.len() > limit => ReadEvent::Oversized,
                    Ok(_) => ReadEvent::Partial(buf),
                    Err(e) => ReadEvent::Failed(e.to_string()),
                };
                let last = !matches!(event, ReadEvent::Line(_));
                if tx.send(event).is_err() || last {
                    break;
                }
            }
        })
        .map(|_| ())
}

fn spawn_stderr_reader(stderr: ChildStderr, tail: StderrTail, keep: usize) -> std::io::Result<()> {
    thread::Builder::new()
        .name("timelock-unit-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else { break };
                trace!(target: "timelock::unit_stderr", "{line}");
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == keep {
                    tail.pop_front();
                }
                if keep > 0 {
                    tail.push_back(line);
                }
            }
        })
        .map(|_| ())
}

/// Bars already shipped to a persistent unit for one snapshot.
#[derive(Debug, Default)]
struct SyncState {
    primary: usize,
    references: BTreeMap<String, usize>,
}

pub struct ProcessUnit {
    id: DetectorId,
    spec: Arc<ProcessSpec>,
    live: Option<LiveChild>,
    synced: HashMap<SnapshotId, SyncState>,
}

impl ProcessUnit {
    /// Start a unit. Persistent units must answer a ping within the startup
    /// deadline, so a broken program surfaces as `Startup` rather than a
    /// timeout on its first real request.
    pub fn spawn(id: DetectorId, spec: Arc<ProcessSpec>) -> Result<Self, DetectionError> {
        let mut unit = Self { id, spec, live: None, synced: HashMap::new() };
        if unit.spec.mode == ProcessMode::Persistent {
            unit.live = Some(LiveChild::launch(&unit.spec)?);
            let deadline = unit.spec.startup_deadline;
            if let Err(e) = unit.roundtrip_ping(deadline) {
                let detail = unit.live.as_ref().map(LiveChild::stderr_suffix).unwrap_or_default();
                unit.terminate();
                return Err(DetectionError::Startup(format!("handshake failed: {e}{detail}")));
            }
        }
        Ok(unit)
    }

    pub fn mode(&self) -> ProcessMode {
        self.spec.mode
    }

    fn terminate(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(detector = %self.id, "terminating detection unit");
            live.kill();
        }
        self.synced.clear();
    }

    /// Send one line, read one response line, all inside `deadline`.
    ///
    /// A complete line that fails to decode leaves the stream aligned and the
    /// unit usable; every other failure kills the child.
    fn exchange(&mut self, line: &[u8], deadline: Duration) -> Result<Response, DetectionError> {
        let until = Instant::now() + deadline;
        let limit = self.spec.max_output_bytes;
        let Some(live) = self.live.as_ref() else {
            return Err(DetectionError::Crashed("unit is not running".into()));
        };

        let outcome = live
            .send(line)
            .and_then(|_| live.recv(until, deadline))
            .and_then(|event| match event {
                ReadEvent::Line(bytes) => Ok(protocol::decode_response(&bytes, limit)),
                ReadEvent::Partial(bytes) => Err(DetectionError::Malformed(format!(
                    "partial line of {} bytes before end of output",
                    bytes.len()
                ))),
                ReadEvent::Oversized => Err(DetectionError::Oversized { limit }),
                ReadEvent::Eof => Err(DetectionError::Crashed(format!(
                    "exited without a response{}",
                    live.stderr_suffix()
                ))),
                ReadEvent::Failed(e) => Err(DetectionError::Crashed(format!("read failed: {e}"))),
            });

        match outcome {
            Ok(decoded) => decoded,
            Err(e) => {
                self.terminate();
                Err(e)
            }
        }
    }

    fn roundtrip_ping(&mut self, deadline: Duration) -> Result<(), DetectionError> {
        let line = protocol::encode_line(&Request::Ping { v: PROTOCOL_VERSION })
            .map_err(|e| DetectionError::Runtime(format!("encode ping: {e}")))?;
        match self.exchange(&line, deadline)? {
            Response::Pong => Ok(()),
            other => Err(DetectionError::Malformed(format!("expected pong, got {other:?}"))),
        }
    }

    fn detect_persistent(&mut self, request: &DetectionRequest<'_>, deadline: Duration) -> Result<Detection, DetectionError> {
        let handle = request.snapshot;
        let snapshot_id = handle.id();
        let reset = !self.synced.contains_key(&snapshot_id);
        let state = self.synced.entry(snapshot_id).or_default();

        let bars = handle.bars();
        let from = state.primary.min(bars.len());
        let mut references = BTreeMap::new();
        let mut shipped_refs = Vec::new();
        for (instrument, visible) in handle.references() {
            let sent = state.references.get(instrument).copied().unwrap_or(0).min(visible.len());
            references.insert(instrument, &visible[sent..]);
            shipped_refs.push((instrument.to_string(), visible.len()));
        }

        let frame = DetectFrame {
            op: "detect",
            v: PROTOCOL_VERSION,
            snapshot: snapshot_id.0,
            instrument: handle.instrument(),
            session_date: handle.key().date,
            reset,
            warmup: handle.history().len(),
            bars: &bars[from..],
            references,
            universe: request.universe,
            timestamp: request.timestamp,
            config: request.config,
        };
        let line = protocol::encode_line(&frame).map_err(|e| DetectionError::Runtime(format!("encode request: {e}")))?;

        // The unit has the bars once the write succeeds; a crash clears all state.
        state.primary = bars.len();
        state.references.extend(shipped_refs);

        let response = self.exchange(&line, deadline)?;
        into_detection(response, request)
    }

    fn detect_one_shot(&mut self, request: &DetectionRequest<'_>, deadline: Duration) -> Result<Detection, DetectionError> {
        let handle = request.snapshot;
        let frame = DetectFrame {
            op: "detect",
            v: PROTOCOL_VERSION,
            snapshot: handle.id().0,
            instrument: handle.instrument(),
            session_date: handle.key().date,
            reset: true,
            warmup: handle.history().len(),
            bars: handle.bars(),
            references: handle.references().collect(),
            universe: request.universe,
            timestamp: request.timestamp,
            config: request.config,
        };
        let line = protocol::encode_line(&frame).map_err(|e| DetectionError::Runtime(format!("encode request: {e}")))?;

        self.live = Some(LiveChild::launch(&self.spec)?);
        let result = self.exchange_one_shot(&line, deadline);
        self.terminate();
        into_detection(result?, request)
    }

    fn exchange_one_shot(&mut self, line: &[u8], deadline: Duration) -> Result<Response, DetectionError> {
        let until = Instant::now() + deadline;
        let limit = self.spec.max_output_bytes;
        let Some(live) = self.live.as_mut() else {
            return Err(DetectionError::Crashed("unit is not running".into()));
        };
        live.send(line)?;
        // Closing stdin tells the program its input is complete.
        live.close_input();
        match live.recv(until, deadline)? {
            ReadEvent::Line(bytes) | ReadEvent::Partial(bytes) => protocol::decode_response(&bytes, limit),
            ReadEvent::Oversized => Err(DetectionError::Oversized { limit }),
            ReadEvent::Eof => match live.wait_until(until) {
                Some(status) if status.success() => Err(DetectionError::Malformed("no output".into())),
                Some(status) => Err(DetectionError::Runtime(format!("exited with {status}{}", live.stderr_suffix()))),
                None => Err(DetectionError::Timeout(deadline)),
            },
            ReadEvent::Failed(e) => Err(DetectionError::Crashed(format!("read failed: {e}"))),
        }
    }
}

fn into_detection(response: Response, request: &DetectionRequest<'_>) -> Result<Detection, DetectionError> {
    match response {
        Response::Signal { signal } => {
            let fallback = request.snapshot.last().map(|b| b.close).unwrap_or(f64::NAN);
            Ok(Detection::Signal(signal.into_signal(
                request.snapshot.instrument(),
                request.timestamp,
                fallback,
            )))
        }
        Response::NoSignal => Ok(Detection::NoSignal),
        Response::Error { message } => Err(DetectionError::Runtime(message)),
        other => Err(DetectionError::Malformed(format!("unexpected response to detect: {other:?}"))),
    }
}

impl DetectionUnit for ProcessUnit {
    fn detector_id(&self) -> &DetectorId {
        &self.id
    }

    fn detect(&mut self, request: &DetectionRequest<'_>, deadline: Duration) -> Result<Detection, DetectionError> {
        match self.spec.mode {
            ProcessMode::Persistent => self.detect_persistent(request, deadline),
            ProcessMode::OneShot => self.detect_one_shot(request, deadline),
        }
    }

    fn ping(&mut self, deadline: Duration) -> bool {
        match self.spec.mode {
            ProcessMode::OneShot => true,
            ProcessMode::Persistent => match self.roundtrip_ping(deadline) {
                Ok(()) => true,
                Err(e) => {
                    debug!(detector = %self.id, reason = e.reason(), "unit failed health check");
                    self.terminate();
                    false
                }
            },
        }
    }

    fn release_snapshot(&mut self, snapshot: SnapshotId, deadline: Duration) -> Result<(), DetectionError> {
        if self.synced.remove(&snapshot).is_none() || self.live.is_none() {
            return Ok(());
        }
        let line = protocol::encode_line(&Request::Release { v: PROTOCOL_VERSION, snapshot: snapshot.0 })
            .map_err(|e| DetectionError::Runtime(format!("encode release: {e}")))?;
        match self.exchange(&line, deadline)? {
            Response::Ok => Ok(()),
            other => Err(DetectionError::Malformed(format!("expected ok, got {other:?}"))),
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.spec.mode == ProcessMode::OneShot {
            return true;
        }
        let exited = match self.live.as_mut() {
            None => return false,
            Some(live) => !matches!(live.child.try_wait(), Ok(None)),
        };
        if exited {
            self.terminate();
        }
        !exited
    }

    fn is_reusable(&self) -> bool {
        self.spec.mode == ProcessMode::Persistent
    }

    fn shutdown(&mut self) {
        self.terminate();
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Factory for child-process units.
pub struct ProcessFactory {
    id: DetectorId,
    spec: Arc<ProcessSpec>,
}

impl ProcessFactory {
    pub fn new(id: DetectorId, spec: ProcessSpec) -> Self {
        Self { id, spec: Arc::new(spec) }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }
}

impl UnitFactory for ProcessFactory {
    fn detector_id(&self) -> &DetectorId {
        &self.id
    }

    fn spawn(&self) -> Result<Box<dyn DetectionUnit>, DetectionError> {
        Ok(Box::new(ProcessUnit::spawn(self.id.clone(), Arc::clone(&self.spec))?))
    }
}
