//! In-process detection units wrapping Rust [`Detector`] implementations.
//!
//! Rust code cannot be pre-empted safely, so the deadline is checked after
//! the call returns: an overrun is reported as `Timeout` and its result is
//! discarded. Panics are caught and reported as runtime errors.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Detection, DetectionError, DetectionRequest, DetectionUnit, UnitFactory};
use crate::domain::{DetectorId, Signal, SnapshotId};

/// Detection logic that runs inside the engine process.
///
/// Implementations see only the snapshot handle and the request, so they
/// inherit the snapshot's no-lookahead guarantee.
///
/// The deadline is only checked once `detect` returns: a call that never
/// returns blocks its worker for good. Logic that is not trusted to
/// terminate belongs behind a [`ProcessUnit`](super::ProcessUnit).
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means no signal at this instant.
    fn detect(&self, request: &DetectionRequest<'_>) -> Result<Option<Signal>, String>;
}

/// Adapter turning a closure into a [`Detector`].
///
/// Same caveat as [`Detector`]: the closure must terminate on its own.
pub struct FnDetector<F> {
    name: String,
    f: F,
}

impl<F> FnDetector<F>
where
    F: Fn(&DetectionRequest<'_>) -> Result<Option<Signal>, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Detector for FnDetector<F>
where
    F: Fn(&DetectionRequest<'_>) -> Result<Option<Signal>, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, request: &DetectionRequest<'_>) -> Result<Option<Signal>, String> {
        (self.f)(request)
    }
}

pub struct InProcessUnit {
    id: DetectorId,
    detector: Arc<dyn Detector>,
}

impl InProcessUnit {
    pub fn new(id: DetectorId, detector: Arc<dyn Detector>) -> Self {
        Self { id, detector }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl DetectionUnit for InProcessUnit {
    fn detector_id(&self) -> &DetectorId {
        &self.id
    }

    fn detect(&mut self, request: &DetectionRequest<'_>, deadline: Duration) -> Result<Detection, DetectionError> {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.detector.detect(request)));
        if started.elapsed() > deadline {
            return Err(DetectionError::Timeout(deadline));
        }
        match outcome {
            Ok(Ok(Some(signal))) => Ok(Detection::Signal(signal)),
            Ok(Ok(None)) => Ok(Detection::NoSignal),
            Ok(Err(message)) => Err(DetectionError::Runtime(message)),
            Err(payload) => Err(DetectionError::Runtime(format!(
                "detector '{}' panicked: {}",
                self.detector.name(),
                panic_message(payload.as_ref())
            ))),
        }
    }

    fn ping(&mut self, _deadline: Duration) -> bool {
        true
    }

    fn release_snapshot(&mut self, _snapshot: SnapshotId, _deadline: Duration) -> Result<(), DetectionError> {
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn is_reusable(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {}
}

/// Factory for in-process units sharing one detector.
pub struct InProcessFactory {
    id: DetectorId,
    detector: Arc<dyn Detector>,
}

impl InProcessFactory {
    pub fn new(id: DetectorId, detector: Arc<dyn Detector>) -> Self {
        Self { id, detector }
    }
}

impl UnitFactory for InProcessFactory {
    fn detector_id(&self) -> &DetectorId {
        &self.id
    }

    fn spawn(&self) -> Result<Box<dyn DetectionUnit>, DetectionError> {
        Ok(Box::new(InProcessUnit::new(self.id.clone(), Arc::clone(&self.detector))))
    }
}
