//! The transient (ongoing) state layer.
//!
//! During construction every attribute has exactly one *ongoing* value: the
//! value it holds right now, whose interval cannot be committed yet because
//! its end time is unknown. A modification at time `t` closes the ongoing
//! interval as `[ongoing_start, t - 1]`, hands it to the backend, and starts
//! a new ongoing interval at `t`. End times are inclusive throughout; the
//! `t - 1` convention is load-bearing and pinned by tests.
//!
//! Writing the same value again is coalesced into the ongoing interval
//! instead of producing back-to-back intervals with equal values.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use tracehist_error::{HistoryError, Result};
use tracehist_types::{Interval, Quark, StateValue, ValueKind};

use crate::backend::StateBackend;

#[derive(Debug, Clone)]
struct OngoingEntry {
    value: StateValue,
    start: i64,
    /// First non-null kind ever written to this quark. Later writes must
    /// match it; `Null` is compatible with every kind.
    kind: Option<ValueKind>,
}

/// Ongoing-state tracker feeding closed intervals into a backend.
pub struct TransientState {
    backend: Arc<dyn StateBackend>,
    /// False once the history is closed; all further changes are ignored.
    active: AtomicBool,
    /// Most recent modification time seen, for synthesizing ongoing
    /// intervals and validating monotonicity.
    latest_time: AtomicI64,
    entries: RwLock<Vec<OngoingEntry>>,
}

impl std::fmt::Debug for TransientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientState")
            .field("active", &self.is_active())
            .field("latest_time", &self.latest_time())
            .finish_non_exhaustive()
    }
}

impl TransientState {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        let start = backend.start_time();
        Self {
            backend,
            active: AtomicBool::new(true),
            latest_time: AtomicI64::new(start),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn latest_time(&self) -> i64 {
        self.latest_time.load(Ordering::Acquire)
    }

    fn check_quark(len: usize, quark: Quark) -> Result<()> {
        if quark.index() >= len {
            return Err(HistoryError::QuarkOutOfRange {
                quark: quark.get(),
                count: len,
            });
        }
        Ok(())
    }

    /// Ongoing value of `quark`. Quarks that were created but never
    /// modified report `Null`.
    pub fn ongoing_value(&self, quark: Quark) -> StateValue {
        let entries = self.entries.read();
        entries
            .get(quark.index())
            .map_or(StateValue::Null, |e| e.value.clone())
    }

    /// Start time of the ongoing interval of `quark`.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        let entries = self.entries.read();
        Self::check_quark(entries.len(), quark)?;
        Ok(entries[quark.index()].start)
    }

    /// Synthesize the ongoing interval of `quark` if it covers `t`.
    pub fn interval_at(&self, quark: Quark, t: i64) -> Option<Interval> {
        if !self.is_active() {
            return None;
        }
        let entries = self.entries.read();
        let entry = entries.get(quark.index())?;
        if t < entry.start {
            return None;
        }
        let end = self.latest_time().max(t);
        Interval::new(entry.start, end, quark, entry.value.clone()).ok()
    }

    /// Change the ongoing value without closing an interval. Used when a
    /// seek restores state or an analysis corrects the current value.
    pub fn update_ongoing(&self, quark: Quark, value: StateValue) -> Result<()> {
        let mut entries = self.entries.write();
        Self::check_quark(entries.len(), quark)?;
        entries[quark.index()].value = value;
        Ok(())
    }

    /// Dense snapshot of all ongoing `(start, value)` pairs, checkpoint
    /// material for the partial system.
    pub fn snapshot(&self) -> Vec<(i64, StateValue)> {
        let entries = self.entries.read();
        entries.iter().map(|e| (e.start, e.value.clone())).collect()
    }

    /// Replace the whole ongoing vector with a snapshot taken earlier.
    /// Value-kind discipline restarts from the snapshot's values.
    pub fn replace_ongoing(&self, snapshot: Vec<(i64, StateValue)>) {
        let mut entries = self.entries.write();
        *entries = snapshot
            .into_iter()
            .map(|(start, value)| OngoingEntry {
                kind: value.kind(),
                value,
                start,
            })
            .collect();
    }

    /// Make sure quarks `0..n` are all tracked. Called when the attribute
    /// tree grows; new entries start as `Null` from the backend's start.
    pub fn grow_to(&self, n: usize) {
        let mut entries = self.entries.write();
        let start = self.backend.start_time();
        while entries.len() < n {
            entries.push(OngoingEntry {
                value: StateValue::Null,
                start,
                kind: None,
            });
        }
    }

    /// Number of quarks the transient layer currently tracks.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Record a state change: close the current ongoing interval of `quark`
    /// at `event_time - 1`, push it to the backend and start a new ongoing
    /// interval. Grows the ongoing vector when `quark` is new.
    pub fn process_state_change(
        &self,
        event_time: i64,
        value: StateValue,
        quark: Quark,
    ) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let latest = self.latest_time();
        if event_time < latest {
            // Events arrive in time order across all quarks; a step
            // backwards is the provider's bug, and it can skip the event.
            return Err(HistoryError::TimeRange {
                time: event_time,
                start: latest,
                end: i64::MAX,
            });
        }
        let mut entries = self.entries.write();
        if quark.index() > entries.len() {
            // Quarks are dense; a jump past the end means the caller skipped
            // attribute creation.
            return Err(HistoryError::QuarkOutOfRange {
                quark: quark.get(),
                count: entries.len(),
            });
        }
        if quark.index() == entries.len() {
            entries.push(OngoingEntry {
                value: StateValue::Null,
                start: self.backend.start_time(),
                kind: None,
            });
        }
        let entry = &mut entries[quark.index()];

        if let Some(new_kind) = value.kind() {
            match entry.kind {
                None => entry.kind = Some(new_kind),
                Some(kind) if kind != new_kind => {
                    return Err(HistoryError::StateValueType {
                        quark: quark.get(),
                        expected: kind.name(),
                        actual: new_kind.name(),
                    });
                }
                Some(_) => {}
            }
        }

        if entry.value == value {
            // Same value again: stretch the ongoing interval, write nothing.
            self.latest_time.fetch_max(event_time, Ordering::AcqRel);
            return Ok(());
        }
        if event_time == entry.start {
            // Second change at the same timestamp: the earlier value lasted
            // zero time, overwrite it in place.
            entry.value = value;
            return Ok(());
        }
        if event_time < entry.start {
            return Err(HistoryError::TimeRange {
                time: event_time,
                start: entry.start,
                end: i64::MAX,
            });
        }

        let closed = Interval::new(entry.start, event_time - 1, quark, entry.value.clone())?;
        self.backend.insert(closed)?;
        entry.value = value;
        entry.start = event_time;
        self.latest_time.fetch_max(event_time, Ordering::AcqRel);
        Ok(())
    }

    /// Close every ongoing interval at `end_time` (inclusive) and push it to
    /// the backend, then deactivate. Idempotent.
    pub fn close(&self, end_time: i64) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let entries = self.entries.read();
        for (i, entry) in entries.iter().enumerate() {
            if end_time < entry.start {
                return Err(HistoryError::internal(format!(
                    "closing history at {end_time} before ongoing start {} of quark {i}",
                    entry.start
                )));
            }
            let closed = Interval::new(
                entry.start,
                end_time,
                Quark::new(i as u32),
                entry.value.clone(),
            )?;
            self.backend.insert(closed)?;
        }
        self.latest_time.fetch_max(end_time, Ordering::AcqRel);
        tracing::debug!(end_time, quarks = entries.len(), "closed transient state");
        Ok(())
    }
}
