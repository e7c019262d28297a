//! Detection harness: runs detection logic against a snapshot handle under a
//! per-invocation deadline and output ceiling.
//!
//! Detection logic plugs in through [`DetectionUnit`] (one executing instance)
//! and [`UnitFactory`] (how to get another). Units live in a [`UnitPool`];
//! workers lease one per instrument-session and hand it back on drop.
//!
//! Every failure mode maps to a distinct [`DetectionError`] and the caller
//! treats it as "no signal at this bar"; nothing here aborts a run.

pub mod in_process;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::domain::{DetectorId, Signal, SnapshotId};
use crate::snapshot::SnapshotHandle;

pub use in_process::{Detector, FnDetector, InProcessFactory, InProcessUnit};
pub use pool::{PoolStats, UnitLease, UnitPool};
pub use process::{ProcessFactory, ProcessMode, ProcessSpec, ProcessUnit};
pub use server::DetectorServer;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectionError {
    #[error("unit failed to start: {0}")]
    Startup(String),

    #[error("detection logic failed: {0}")]
    Runtime(String),

    #[error("deadline of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("output exceeded {limit} bytes")]
    Oversized { limit: usize },

    #[error("unit crashed: {0}")]
    Crashed(String),
}

impl DetectionError {
    /// Stable short name, used in logs and run results.
    pub fn reason(&self) -> &'static str {
        match self {
            DetectionError::Startup(_) => "startup",
            DetectionError::Runtime(_) => "runtime",
            DetectionError::Timeout(_) => "timeout",
            DetectionError::Malformed(_) => "malformed",
            DetectionError::Oversized { .. } => "oversized",
            DetectionError::Crashed(_) => "crashed",
        }
    }
}

/// Outcome of one successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Signal(Signal),
    NoSignal,
}

impl Detection {
    pub fn signal(&self) -> Option<&Signal> {
        match self {
            Detection::Signal(s) => Some(s),
            Detection::NoSignal => None,
        }
    }
}

/// Everything one invocation may look at.
///
/// The configuration travels with every request; units read nothing from
/// their environment.
#[derive(Debug, Clone, Copy)]
pub struct DetectionRequest<'a> {
    pub snapshot: SnapshotHandle<'a>,
    pub universe: &'a [String],
    pub timestamp: DateTime<Utc>,
    pub config: &'a serde_json::Value,
}

/// One executing instance of detection logic.
pub trait DetectionUnit: Send {
    fn detector_id(&self) -> &DetectorId;

    /// Run detection once. Must return within `deadline` or fail with `Timeout`.
    fn detect(&mut self, request: &DetectionRequest<'_>, deadline: Duration) -> Result<Detection, DetectionError>;

    /// Liveness probe used before reusing an idle unit.
    fn ping(&mut self, deadline: Duration) -> bool;

    /// Drop any per-snapshot state the unit holds.
    fn release_snapshot(&mut self, snapshot: SnapshotId, deadline: Duration) -> Result<(), DetectionError>;

    /// False once the unit has died or been killed.
    fn is_alive(&mut self) -> bool;

    /// Whether the pool may hand this unit to another session.
    fn is_reusable(&self) -> bool;

    fn shutdown(&mut self);
}

/// Produces fresh units for one detector.
pub trait UnitFactory: Send + Sync {
    fn detector_id(&self) -> &DetectorId;

    fn spawn(&self) -> Result<Box<dyn DetectionUnit>, DetectionError>;
}

/// Budget applied to every invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarnessConfig {
    pub deadline: Duration,
    pub ping_deadline: Duration,
    pub max_output_bytes: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
            ping_deadline: Duration::from_secs(1),
            max_output_bytes: protocol::DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Entry point used by session workers.
pub struct DetectionHarness {
    config: HarnessConfig,
    factory: Arc<dyn UnitFactory>,
    pool: UnitPool,
}

impl DetectionHarness {
    pub fn new(config: HarnessConfig, factory: Arc<dyn UnitFactory>, max_idle: usize) -> Self {
        Self {
            pool: UnitPool::new(max_idle, config.ping_deadline),
            config,
            factory,
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn detector_id(&self) -> &DetectorId {
        self.factory.detector_id()
    }

    pub fn pool(&self) -> &UnitPool {
        &self.pool
    }

    /// Lease a unit for one instrument-session.
    pub fn lease(&self) -> Result<UnitLease<'_>, DetectionError> {
        self.pool.checkout(self.factory.as_ref())
    }

    /// Run detection once and validate what came back.
    ///
    /// A signal for another instrument, stamped at any instant other than
    /// the current one, or carrying a non-positive price is rejected as
    /// malformed.
    pub fn invoke(
        &self,
        lease: &mut UnitLease<'_>,
        request: &DetectionRequest<'_>,
    ) -> Result<Detection, DetectionError> {
        let unit = lease.unit_mut()?;
        let detection = unit.detect(request, self.config.deadline)?;
        if let Detection::Signal(signal) = &detection {
            validate_signal(signal, request)?;
        }
        Ok(detection)
    }

    /// Tell the unit a snapshot is gone. Failures are logged, never returned.
    pub fn release(&self, lease: &mut UnitLease<'_>, snapshot: SnapshotId) {
        let Some(unit) = lease.current_mut() else {
            return;
        };
        if let Err(e) = unit.release_snapshot(snapshot, self.config.ping_deadline) {
            warn!(%snapshot, reason = e.reason(), error = %e, "snapshot release failed");
            unit.shutdown();
        }
    }

    /// Shut down every idle unit.
    pub fn shutdown(&self) {
        self.pool.drain();
    }
}

fn validate_signal(signal: &Signal, request: &DetectionRequest<'_>) -> Result<(), DetectionError> {
    if signal.instrument != request.snapshot.instrument() {
        return Err(DetectionError::Malformed(format!(
            "signal for '{}' from a snapshot of '{}'",
            signal.instrument,
            request.snapshot.instrument()
        )));
    }
    // Entry is resolved from the signal timestamp, so it must be the decision bar itself.
    if signal.timestamp != request.timestamp {
        return Err(DetectionError::Malformed(format!(
            "signal timestamp {} is not the current instant {}",
            signal.timestamp, request.timestamp
        )));
    }
    if !(signal.price.is_finite() && signal.price > 0.0) || !signal.strength.is_finite() {
        return Err(DetectionError::Malformed(format!(
            "invalid signal price {} or strength {}",
            signal.price, signal.strength
        )));
    }
    Ok(())
}
