//! Isolation snapshot — the bars available "as of now" for one instrument-session.
//!
//! Invariant: at decision step *i* the snapshot holds the warm-up prefix and
//! session bars `[0..=i]`, nothing with a later timestamp. The backing store
//! is allocated once per session and grown one bar at a time, so advancing is
//! O(1) amortized instead of re-materializing `bars[0..i]` on every step.
//!
//! Reference instruments (cross-instrument comparison) share the primary
//! instrument's cutoff: only their bars with `timestamp <= last primary bar`
//! are reachable through a handle.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};

use crate::domain::{Bar, SessionKey, SnapshotId};

/// Warm-up sizing for snapshot open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Historical bars to load ahead of the session (most recent first).
    pub warmup_bars: usize,
    /// Fewer historical bars than this and the session is skipped.
    pub min_warmup_bars: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { warmup_bars: 50, min_warmup_bars: 10 }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SnapshotError {
    #[error("insufficient history for {key}: {available} warm-up bars, need {required}")]
    InsufficientHistory {
        key: SessionKey,
        available: usize,
        required: usize,
    },

    /// A bar at or before the current cutoff. Any such append could break
    /// the no-lookahead guarantee, so it is fatal for the session.
    #[error("non-monotonic bar for {key}: {offending} is not after {last}")]
    NonMonotonicBar {
        key: SessionKey,
        last: DateTime<Utc>,
        offending: DateTime<Utc>,
    },

    #[error("bar for '{found}' appended to snapshot of {key}")]
    ForeignBar { key: SessionKey, found: String },

    #[error("snapshot for {key} is closed")]
    Closed { key: SessionKey },
}

impl SnapshotError {
    /// Integrity violations abort the session and mark the run suspect.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, SnapshotError::NonMonotonicBar { .. } | SnapshotError::ForeignBar { .. })
    }
}

/// A reference instrument's bars for the session, revealed as time advances.
#[derive(Debug, Clone)]
struct ReferenceSeries {
    instrument: String,
    bars: Vec<Bar>,
    visible: usize,
}

impl ReferenceSeries {
    fn advance_to(&mut self, cutoff: DateTime<Utc>) {
        self.visible = self.bars.partition_point(|b| b.timestamp <= cutoff);
    }
}

/// Append-only bar sequence for exactly one (instrument, session-date).
#[derive(Debug)]
pub struct IsolationSnapshot {
    id: SnapshotId,
    key: SessionKey,
    bars: Vec<Bar>,
    warmup_len: usize,
    initial_len: usize,
    references: Vec<ReferenceSeries>,
    closed: bool,
}

impl IsolationSnapshot {
    /// Open the snapshot: bulk-load the warm-up history and the session prefix.
    ///
    /// `history` must be the bars immediately preceding the session, ascending;
    /// only the last `cfg.warmup_bars` are kept. `capacity` sizes the backing
    /// store so growing through the session never reallocates.
    pub fn open(
        key: SessionKey,
        history: &[Bar],
        session_prefix: &[Bar],
        references: Vec<(String, Vec<Bar>)>,
        cfg: &SnapshotConfig,
        capacity: usize,
    ) -> Result<Self, SnapshotError> {
        if history.len() < cfg.min_warmup_bars {
            return Err(SnapshotError::InsufficientHistory {
                key,
                available: history.len(),
                required: cfg.min_warmup_bars,
            });
        }

        let warmup = &history[history.len().saturating_sub(cfg.warmup_bars)..];
        let mut snapshot = Self {
            id: SnapshotId::next(),
            key,
            bars: Vec::with_capacity(capacity.max(warmup.len() + session_prefix.len())),
            warmup_len: warmup.len(),
            initial_len: 0,
            references: references
                .into_iter()
                .map(|(instrument, bars)| ReferenceSeries { instrument, bars, visible: 0 })
                .collect(),
            closed: false,
        };

        // The prefix goes through the same checks as every later append.
        for bar in warmup.iter().chain(session_prefix) {
            snapshot.push_checked(bar.clone())?;
        }
        snapshot.initial_len = snapshot.bars.len();

        debug!(
            snapshot = %snapshot.id,
            session = %snapshot.key,
            warmup = snapshot.warmup_len,
            prefix = session_prefix.len(),
            references = snapshot.references.len(),
            "snapshot opened"
        );
        Ok(snapshot)
    }

    /// Add exactly one bar, strictly after the current last bar.
    pub fn append(&mut self, bar: Bar) -> Result<usize, SnapshotError> {
        self.push_checked(bar)?;
        trace!(snapshot = %self.id, len = self.bars.len(), "snapshot grew");
        Ok(self.bars.len())
    }

    fn push_checked(&mut self, bar: Bar) -> Result<(), SnapshotError> {
        if self.closed {
            return Err(SnapshotError::Closed { key: self.key.clone() });
        }
        if bar.instrument != self.key.instrument {
            return Err(SnapshotError::ForeignBar {
                key: self.key.clone(),
                found: bar.instrument,
            });
        }
        if let Some(last) = self.bars.last() {
            if bar.timestamp <= last.timestamp {
                return Err(SnapshotError::NonMonotonicBar {
                    key: self.key.clone(),
                    last: last.timestamp,
                    offending: bar.timestamp,
                });
            }
        }
        let cutoff = bar.timestamp;
        self.bars.push(bar);
        for reference in &mut self.references {
            reference.advance_to(cutoff);
        }
        Ok(())
    }

    /// Extend a reference series, creating it if absent.
    ///
    /// Used when mirroring a snapshot that arrives in deltas. The new bars stay
    /// hidden until the primary cutoff reaches them.
    pub fn extend_reference(&mut self, instrument: &str, bars: Vec<Bar>) -> Result<(), SnapshotError> {
        if self.closed {
            return Err(SnapshotError::Closed { key: self.key.clone() });
        }
        let cutoff = self.last_timestamp();
        let pos = match self.references.iter().position(|r| r.instrument == instrument) {
            Some(pos) => pos,
            None => {
                self.references.push(ReferenceSeries {
                    instrument: instrument.to_string(),
                    bars: Vec::new(),
                    visible: 0,
                });
                self.references.len() - 1
            }
        };
        let series = &mut self.references[pos];
        for bar in bars {
            if let Some(last) = series.bars.last() {
                if bar.timestamp <= last.timestamp {
                    return Err(SnapshotError::NonMonotonicBar {
                        key: self.key.clone(),
                        last: last.timestamp,
                        offending: bar.timestamp,
                    });
                }
            }
            series.bars.push(bar);
        }
        if let Some(cutoff) = cutoff {
            series.advance_to(cutoff);
        }
        Ok(())
    }

    /// Read-only view for one detection invocation.
    ///
    /// The handle borrows the snapshot, so it cannot outlive the invocation or
    /// observe a later append.
    pub fn handle(&self) -> Result<SnapshotHandle<'_>, SnapshotError> {
        if self.closed {
            return Err(SnapshotError::Closed { key: self.key.clone() });
        }
        Ok(SnapshotHandle { snapshot: self })
    }

    /// Release the backing store. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.bars = Vec::new();
        self.references = Vec::new();
        debug!(snapshot = %self.id, session = %self.key, "snapshot closed");
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Historical bars loaded at open.
    pub fn warmup_len(&self) -> usize {
        self.warmup_len
    }

    /// Size right after open (warm-up plus session prefix).
    pub fn initial_len(&self) -> usize {
        self.initial_len
    }

    /// Bars appended since open.
    pub fn appended(&self) -> usize {
        self.bars.len().saturating_sub(self.initial_len)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }
}

impl Drop for IsolationSnapshot {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opaque read-only reference to a snapshot's contents.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotHandle<'a> {
    snapshot: &'a IsolationSnapshot,
}

impl<'a> SnapshotHandle<'a> {
    pub fn id(&self) -> SnapshotId {
        self.snapshot.id
    }

    pub fn key(&self) -> &'a SessionKey {
        &self.snapshot.key
    }

    pub fn instrument(&self) -> &'a str {
        &self.snapshot.key.instrument
    }

    /// Every bar visible at this instant, oldest first.
    pub fn bars(&self) -> &'a [Bar] {
        &self.snapshot.bars
    }

    /// Session bars only (warm-up history excluded).
    pub fn session_bars(&self) -> &'a [Bar] {
        &self.snapshot.bars[self.snapshot.warmup_len.min(self.snapshot.bars.len())..]
    }

    /// Warm-up history only.
    pub fn history(&self) -> &'a [Bar] {
        &self.snapshot.bars[..self.snapshot.warmup_len.min(self.snapshot.bars.len())]
    }

    pub fn last(&self) -> Option<&'a Bar> {
        self.snapshot.bars.last()
    }

    /// The simulated "now": timestamp of the newest visible bar.
    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.snapshot.last_timestamp()
    }

    pub fn len(&self) -> usize {
        self.snapshot.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.bars.is_empty()
    }

    /// A reference instrument's bars up to the current cutoff.
    pub fn reference(&self, instrument: &str) -> Option<&'a [Bar]> {
        self.snapshot
            .references
            .iter()
            .find(|r| r.instrument == instrument)
            .map(|r| &r.bars[..r.visible])
    }

    /// All reference instruments with their visible bars.
    pub fn references(&self) -> impl Iterator<Item = (&'a str, &'a [Bar])> + 'a {
        self.snapshot
            .references
            .iter()
            .map(|r| (r.instrument.as_str(), &r.bars[..r.visible]))
    }
}
