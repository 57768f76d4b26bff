//! Storage backends for closed intervals.
//!
//! The state system pushes every closed interval into a [`StateBackend`].
//! The real one wraps a disk-backed history tree; the in-memory one serves
//! tests and short-lived analyses; the null one discards everything (the
//! partial system's replay path); the collecting one captures the intervals
//! matching a 2D query during a replay.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};

use tracehist_error::{HistoryError, Result};
use tracehist_types::{
    CancelToken, Interval, Quark, QuarkSelection, TimeRangeCondition, TreeConfig,
};
use tracehist_tree::HistoryTree;

/// Where closed intervals go, and where queries about the past are answered.
pub trait StateBackend: Send + Sync {
    /// Earliest timestamp the backend covers.
    fn start_time(&self) -> i64;

    /// Latest timestamp covered by committed intervals.
    fn end_time(&self) -> i64;

    /// Store one closed interval. Intervals arrive in non-decreasing
    /// end-time order.
    fn insert(&self, interval: Interval) -> Result<()>;

    /// Final flush: the history is complete up to `end_time`. `attr_bytes`
    /// is the serialized attribute tree, persisted by backends that have
    /// somewhere to put it.
    fn finish(&self, end_time: i64, attr_bytes: &[u8]) -> Result<()>;

    /// The committed interval of `quark` covering `t`, if any.
    fn query_single(&self, quark: Quark, t: i64) -> Result<Option<Interval>>;

    /// Fill `state_info` with the committed interval of every quark at `t`.
    fn query_full(&self, t: i64, state_info: &mut [Option<Interval>]) -> Result<()>;

    /// All committed intervals matching both conditions.
    fn query_2d(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
        cancel: &CancelToken,
    ) -> Result<Vec<Interval>>;
}

// --- History tree backend ---

/// The production backend: a disk-backed history tree.
#[derive(Debug)]
pub struct HistoryTreeBackend {
    tree: HistoryTree,
}

impl HistoryTreeBackend {
    /// Build a fresh history file at `path`.
    pub fn create(path: &Path, config: TreeConfig) -> Result<Self> {
        Ok(Self {
            tree: HistoryTree::create(path, config)?,
        })
    }

    /// Reopen a finished history file. Returns the backend and the raw
    /// attribute-region bytes.
    pub fn open(path: &Path, expected_provider_version: u32) -> Result<(Self, Vec<u8>)> {
        let (tree, attr_bytes) = HistoryTree::open(path, expected_provider_version)?;
        Ok((Self { tree }, attr_bytes))
    }

    pub fn is_finished(&self) -> bool {
        self.tree.is_closed()
    }
}

impl StateBackend for HistoryTreeBackend {
    fn start_time(&self) -> i64 {
        self.tree.start_time()
    }

    fn end_time(&self) -> i64 {
        self.tree.end_time()
    }

    fn insert(&self, interval: Interval) -> Result<()> {
        self.tree.insert(interval)
    }

    fn finish(&self, end_time: i64, attr_bytes: &[u8]) -> Result<()> {
        self.tree.close(end_time, attr_bytes)
    }

    fn query_single(&self, quark: Quark, t: i64) -> Result<Option<Interval>> {
        self.tree.query_single(quark, t)
    }

    fn query_full(&self, t: i64, state_info: &mut [Option<Interval>]) -> Result<()> {
        self.tree.query_full(t, state_info)
    }

    fn query_2d(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
        cancel: &CancelToken,
    ) -> Result<Vec<Interval>> {
        self.tree.query_2d(quarks, times, cancel)
    }
}

// --- In-memory backend ---

/// Keeps every interval in a vector sorted by end time. Fine for tests and
/// small histories; queries scan from the first interval that can cover `t`.
pub struct InMemoryBackend {
    start: i64,
    end: AtomicI64,
    intervals: RwLock<Vec<Interval>>,
}

impl InMemoryBackend {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            end: AtomicI64::new(start),
            intervals: RwLock::new(Vec::new()),
        }
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.read().len()
    }
}

impl StateBackend for InMemoryBackend {
    fn start_time(&self) -> i64 {
        self.start
    }

    fn end_time(&self) -> i64 {
        self.end.load(Ordering::Acquire)
    }

    fn insert(&self, interval: Interval) -> Result<()> {
        let mut intervals = self.intervals.write();
        let idx = intervals.partition_point(|iv| iv.end() <= interval.end());
        self.end.fetch_max(interval.end(), Ordering::AcqRel);
        intervals.insert(idx, interval);
        Ok(())
    }

    fn finish(&self, end_time: i64, _attr_bytes: &[u8]) -> Result<()> {
        self.end.fetch_max(end_time, Ordering::AcqRel);
        Ok(())
    }

    fn query_single(&self, quark: Quark, t: i64) -> Result<Option<Interval>> {
        let intervals = self.intervals.read();
        let from = intervals.partition_point(|iv| iv.end() < t);
        Ok(intervals[from..]
            .iter()
            .find(|iv| iv.quark() == quark && iv.start() <= t)
            .cloned())
    }

    fn query_full(&self, t: i64, state_info: &mut [Option<Interval>]) -> Result<()> {
        let intervals = self.intervals.read();
        let from = intervals.partition_point(|iv| iv.end() < t);
        for iv in &intervals[from..] {
            if iv.start() <= t {
                if let Some(slot) = state_info.get_mut(iv.quark().index()) {
                    *slot = Some(iv.clone());
                }
            }
        }
        Ok(())
    }

    fn query_2d(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
        cancel: &CancelToken,
    ) -> Result<Vec<Interval>> {
        if cancel.is_cancelled() {
            return Err(HistoryError::Cancelled);
        }
        let intervals = self.intervals.read();
        Ok(intervals
            .iter()
            .filter(|iv| quarks.contains(iv.quark()) && times.intersects(iv.start(), iv.end()))
            .cloned()
            .collect())
    }
}

// --- Null backend ---

/// Discards every interval. The partial system's replay runs over this so a
/// seek never re-writes history that is already on disk.
pub struct NullBackend {
    start: i64,
    end: AtomicI64,
}

impl NullBackend {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            end: AtomicI64::new(start),
        }
    }
}

impl StateBackend for NullBackend {
    fn start_time(&self) -> i64 {
        self.start
    }

    fn end_time(&self) -> i64 {
        self.end.load(Ordering::Acquire)
    }

    fn insert(&self, interval: Interval) -> Result<()> {
        self.end.fetch_max(interval.end(), Ordering::AcqRel);
        Ok(())
    }

    fn finish(&self, end_time: i64, _attr_bytes: &[u8]) -> Result<()> {
        self.end.fetch_max(end_time, Ordering::AcqRel);
        Ok(())
    }

    fn query_single(&self, _quark: Quark, _t: i64) -> Result<Option<Interval>> {
        Ok(None)
    }

    fn query_full(&self, _t: i64, _state_info: &mut [Option<Interval>]) -> Result<()> {
        Ok(())
    }

    fn query_2d(
        &self,
        _quarks: &QuarkSelection,
        _times: &TimeRangeCondition,
        _cancel: &CancelToken,
    ) -> Result<Vec<Interval>> {
        Ok(Vec::new())
    }
}

// --- Collecting backend ---

/// Captures the intervals matching a 2D query while a replay runs over it.
/// Everything else is discarded.
pub struct CollectingBackend {
    start: i64,
    end: AtomicI64,
    quarks: QuarkSelection,
    times: TimeRangeCondition,
    collected: Mutex<Vec<Interval>>,
}

impl CollectingBackend {
    pub fn new(start: i64, quarks: QuarkSelection, times: TimeRangeCondition) -> Self {
        Self {
            start,
            end: AtomicI64::new(start),
            quarks,
            times,
            collected: Mutex::new(Vec::new()),
        }
    }

    /// Take the matches accumulated so far.
    pub fn drain(&self) -> Vec<Interval> {
        std::mem::take(&mut *self.collected.lock())
    }
}

impl StateBackend for CollectingBackend {
    fn start_time(&self) -> i64 {
        self.start
    }

    fn end_time(&self) -> i64 {
        self.end.load(Ordering::Acquire)
    }

    fn insert(&self, interval: Interval) -> Result<()> {
        self.end.fetch_max(interval.end(), Ordering::AcqRel);
        if self.quarks.contains(interval.quark())
            && self.times.intersects(interval.start(), interval.end())
        {
            self.collected.lock().push(interval);
        }
        Ok(())
    }

    fn finish(&self, end_time: i64, _attr_bytes: &[u8]) -> Result<()> {
        self.end.fetch_max(end_time, Ordering::AcqRel);
        Ok(())
    }

    fn query_single(&self, _quark: Quark, _t: i64) -> Result<Option<Interval>> {
        Err(HistoryError::Unsupported(
            "point queries on a collecting backend",
        ))
    }

    fn query_full(&self, _t: i64, _state_info: &mut [Option<Interval>]) -> Result<()> {
        Err(HistoryError::Unsupported(
            "full queries on a collecting backend",
        ))
    }

    fn query_2d(
        &self,
        _quarks: &QuarkSelection,
        _times: &TimeRangeCondition,
        _cancel: &CancelToken,
    ) -> Result<Vec<Interval>> {
        Ok(self.collected.lock().clone())
    }
}
