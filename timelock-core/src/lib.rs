//! TimeLock Core — temporal isolation for backtesting detection logic.
//!
//! This crate contains the engine pieces that never see the future:
//! - Domain types (bars, signals, trades, ids)
//! - Bar store access layer (memory, CSV, synthetic sessions)
//! - Isolation snapshot: the bars available "as of now" for one instrument-session
//! - Detection harness: sandboxed and pooled execution of detection logic
//! - Execution simulator: entry, stop, target, trailing and time-based exits
//! - Data-quality checks and built-in detectors

pub mod detectors;
pub mod domain;
pub mod harness;
pub mod quality;
pub mod simulator;
pub mod snapshot;
pub mod store;
