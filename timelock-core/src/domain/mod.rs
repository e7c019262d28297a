//! Domain types for TimeLock

pub mod bar;
pub mod ids;
pub mod signal;
pub mod trade;

pub use bar::{Bar, SessionKind, Timeframe};
pub use ids::{DetectorId, SessionKey, SnapshotId};
pub use signal::{Side, Signal};
pub use trade::{ExitReason, NoTrade, NoTradeReason, PartialExit, Trade};
