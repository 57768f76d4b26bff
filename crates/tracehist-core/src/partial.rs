//! Partial (checkpoint + replay) state system.
//!
//! Keeping a full history tree on disk is not always worth it. The partial
//! system instead records periodic *checkpoints* — dense snapshots of every
//! ongoing value — while the real history is built once. A later query at
//! time `t` seeks to the floor checkpoint, restores its snapshot and replays
//! the original events over `(checkpoint, t]` through a non-persisting
//! backend. One mutex serializes the whole seek-replay-read sequence, since
//! every query rewrites the shared ongoing vector.
//!
//! The attribute tree is borrowed from the upstream system and never
//! mutated here; anything that would add attributes fails fast.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tracehist_attr::AttributeTree;
use tracehist_error::{HistoryError, Result};
use tracehist_types::{Interval, Quark, QuarkSelection, StateValue, TimeRangeCondition};

use crate::backend::{CollectingBackend, NullBackend, StateBackend};
use crate::transient::TransientState;
use crate::{EventSource, StateReceiver};

/// One saved snapshot: the ongoing `(start, value)` of every quark known at
/// `time`, after all events at `time` were applied.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub time: i64,
    pub snapshot: Vec<(i64, StateValue)>,
}

/// Checkpoints recorded during the real construction, indexed by time.
/// Record at a fixed granularity while building, then hand the arena to the
/// partial system.
#[derive(Debug)]
pub struct CheckpointArena {
    granularity: i64,
    next_due: i64,
    checkpoints: BTreeMap<i64, Arc<Checkpoint>>,
}

impl CheckpointArena {
    /// An arena recording roughly every `granularity` time units, starting
    /// at `start_time`.
    pub fn new(start_time: i64, granularity: i64) -> Self {
        Self {
            granularity: granularity.max(1),
            next_due: start_time,
            checkpoints: BTreeMap::new(),
        }
    }

    /// Whether the construction loop should snapshot at `time`.
    pub fn is_due(&self, time: i64) -> bool {
        time >= self.next_due
    }

    /// Record a snapshot taken at `time`.
    pub fn record(&mut self, time: i64, snapshot: Vec<(i64, StateValue)>) {
        self.next_due = time + self.granularity;
        self.checkpoints
            .insert(time, Arc::new(Checkpoint { time, snapshot }));
    }

    /// The latest checkpoint at or before `t`.
    pub fn floor(&self, t: i64) -> Option<Arc<Checkpoint>> {
        self.checkpoints
            .range(..=t)
            .next_back()
            .map(|(_, cp)| Arc::clone(cp))
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

/// Routes replayed modifications into a transient layer.
struct ReplayReceiver<'a> {
    transient: &'a TransientState,
}

impl StateReceiver for ReplayReceiver<'_> {
    fn modify(&self, time: i64, quark: Quark, value: StateValue) -> Result<()> {
        self.transient.process_state_change(time, value, quark)
    }
}

/// State for times in `[start, end]`, reconstructed on demand from
/// checkpoints plus event replay. Cheap on disk, more expensive per query.
pub struct PartialStateSystem<S: EventSource> {
    attr: Arc<RwLock<AttributeTree>>,
    arena: CheckpointArena,
    source: S,
    start: i64,
    end: i64,
    /// Held across every seek-replay-read sequence.
    query_lock: Mutex<()>,
}

impl<S: EventSource> PartialStateSystem<S> {
    /// `attr` is the upstream system's attribute tree, borrowed read-only.
    /// `arena` must hold at least the checkpoint at `start`.
    pub fn new(
        attr: Arc<RwLock<AttributeTree>>,
        arena: CheckpointArena,
        source: S,
        start: i64,
        end: i64,
    ) -> Result<Self> {
        if arena.floor(start).is_none() {
            return Err(HistoryError::internal(format!(
                "no checkpoint at or before the range start {start}"
            )));
        }
        Ok(Self {
            attr,
            arena,
            source,
            start,
            end,
            query_lock: Mutex::new(()),
        })
    }

    pub fn start_time(&self) -> i64 {
        self.start
    }

    pub fn end_time(&self) -> i64 {
        self.end
    }

    // --- Read-only attribute access; growth is refused ---

    pub fn get_quark_absolute(&self, path: &[&str]) -> Result<Quark> {
        self.attr.read().get_quark(None, path)
    }

    pub fn opt_quark_absolute(&self, path: &[&str]) -> Result<Option<Quark>> {
        self.attr.read().opt_quark(None, path)
    }

    pub fn sub_attributes(&self, base: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        self.attr.read().sub_attributes(base, recursive)
    }

    pub fn full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.attr.read().full_path_string(quark)
    }

    /// The partial system never grows the upstream attribute tree.
    pub fn get_quark_absolute_and_add(&self, _path: &[&str]) -> Result<Quark> {
        Err(HistoryError::Unsupported(
            "adding attributes through a partial state system",
        ))
    }

    pub fn get_quark_relative_and_add(&self, _base: Quark, _subpath: &[&str]) -> Result<Quark> {
        Err(HistoryError::Unsupported(
            "adding attributes through a partial state system",
        ))
    }

    // --- Seek + queries ---

    fn check_time(&self, t: i64) -> Result<()> {
        if t < self.start || t > self.end {
            return Err(HistoryError::TimeRange {
                time: t,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Restore the floor checkpoint of `t` and replay events up to and
    /// including `t` into a fresh transient layer. Must run under the query
    /// lock.
    fn fast_seek(&self, t: i64) -> Result<TransientState> {
        let checkpoint = self
            .arena
            .floor(t)
            .ok_or_else(|| HistoryError::internal(format!("no checkpoint covers {t}")))?;
        let transient = TransientState::new(Arc::new(NullBackend::new(self.start)));
        transient.replace_ongoing(checkpoint.snapshot.clone());
        // Quarks created after the checkpoint was taken still need a slot.
        transient.grow_to(self.attr.read().num_attributes());
        if t > checkpoint.time {
            let receiver = ReplayReceiver {
                transient: &transient,
            };
            self.source.replay(checkpoint.time + 1, t, &receiver)?;
        }
        tracing::trace!(target_time = t, checkpoint = checkpoint.time, "fast seek");
        Ok(transient)
    }

    /// The state of `quark` at `t`. The returned interval's start is exact;
    /// its end is only known to reach `t`.
    pub fn query_single_state(&self, t: i64, quark: Quark) -> Result<Option<Interval>> {
        self.check_time(t)?;
        let _guard = self.query_lock.lock();
        let transient = self.fast_seek(t)?;
        Ok(transient.interval_at(quark, t))
    }

    /// One slot per known quark at `t`.
    pub fn query_full_state(&self, t: i64) -> Result<Vec<Option<Interval>>> {
        self.check_time(t)?;
        let num = self.attr.read().num_attributes();
        let _guard = self.query_lock.lock();
        let transient = self.fast_seek(t)?;
        let mut out = Vec::with_capacity(num);
        for i in 0..num {
            out.push(transient.interval_at(Quark::new(i as u32), t));
        }
        Ok(out)
    }

    /// All intervals matching both conditions, rebuilt by one replay over
    /// the condition's whole span through a collecting backend.
    pub fn query_2d(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
    ) -> Result<Vec<Interval>> {
        let lo = times.min().max(self.start);
        let hi = times.max().min(self.end);
        if lo > hi {
            return Ok(Vec::new());
        }
        let _guard = self.query_lock.lock();
        let checkpoint = self
            .arena
            .floor(lo)
            .ok_or_else(|| HistoryError::internal(format!("no checkpoint covers {lo}")))?;
        let backend = Arc::new(CollectingBackend::new(
            checkpoint.time,
            quarks.clone(),
            times.clone(),
        ));
        let replay = TransientState::new(Arc::clone(&backend) as Arc<dyn StateBackend>);
        replay.replace_ongoing(checkpoint.snapshot.clone());
        replay.grow_to(self.attr.read().num_attributes());
        if hi > checkpoint.time {
            let receiver = ReplayReceiver { transient: &replay };
            self.source.replay(checkpoint.time + 1, hi, &receiver)?;
        }
        // Flush the still-ongoing values as intervals ending at the range's
        // edge; the collecting backend filters them like any other.
        replay.close(hi)?;
        Ok(backend.drain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted event stream standing in for a real trace.
    struct ScriptSource {
        events: Vec<(i64, Quark, StateValue)>,
    }

    impl EventSource for ScriptSource {
        fn replay(&self, from: i64, to: i64, receiver: &dyn StateReceiver) -> Result<()> {
            for (time, quark, value) in &self.events {
                if *time >= from && *time <= to {
                    receiver.modify(*time, *quark, value.clone())?;
                }
            }
            Ok(())
        }
    }

    fn int(v: i32) -> StateValue {
        StateValue::Int(v)
    }

    /// Build a partial system over a scripted history of one quark changing
    /// value every 10 units, with checkpoints every 25.
    fn setup() -> (PartialStateSystem<ScriptSource>, Quark) {
        let mut attr = AttributeTree::new();
        let q = attr.get_quark_and_add(None, &["counter"]).unwrap();
        let attr = Arc::new(RwLock::new(attr));

        let events: Vec<(i64, Quark, StateValue)> =
            (0..10).map(|n| (n * 10, q, int(n as i32))).collect();

        // Run the "real" construction once to produce checkpoints.
        let build = TransientState::new(Arc::new(NullBackend::new(0)));
        let mut arena = CheckpointArena::new(0, 25);
        for (time, quark, value) in &events {
            build
                .process_state_change(*time, value.clone(), *quark)
                .unwrap();
            if arena.is_due(*time) {
                arena.record(*time, build.snapshot());
            }
        }
        assert!(arena.len() >= 3, "granularity should yield several checkpoints");

        let source = ScriptSource { events };
        let partial = PartialStateSystem::new(attr, arena, source, 0, 100).unwrap();
        (partial, q)
    }

    #[test]
    fn floor_checkpoint_lookup() {
        let mut arena = CheckpointArena::new(0, 10);
        arena.record(0, vec![]);
        arena.record(10, vec![(10, int(1))]);
        arena.record(30, vec![(30, int(3))]);
        assert_eq!(arena.floor(0).unwrap().time, 0);
        assert_eq!(arena.floor(9).unwrap().time, 0);
        assert_eq!(arena.floor(10).unwrap().time, 10);
        assert_eq!(arena.floor(29).unwrap().time, 10);
        assert_eq!(arena.floor(1000).unwrap().time, 30);
        assert!(CheckpointArena::new(5, 10).floor(4).is_none());
    }

    #[test]
    fn seek_and_point_query() {
        let (partial, q) = setup();
        // Value n holds over [10n, 10n+9].
        for t in [0i64, 7, 34, 55, 99] {
            let iv = partial.query_single_state(t, q).unwrap().unwrap();
            let n = (t / 10) as i32;
            assert_eq!(iv.value(), &int(n), "at {t}");
            assert_eq!(iv.start(), i64::from(n) * 10, "at {t}");
        }
        // Seeks in arbitrary order must not contaminate each other.
        assert_eq!(
            partial.query_single_state(95, q).unwrap().unwrap().value(),
            &int(9)
        );
        assert_eq!(
            partial.query_single_state(5, q).unwrap().unwrap().value(),
            &int(0)
        );
    }

    #[test]
    fn out_of_range_query() {
        let (partial, q) = setup();
        assert!(matches!(
            partial.query_single_state(101, q).unwrap_err(),
            HistoryError::TimeRange { time: 101, .. }
        ));
    }

    #[test]
    fn attribute_growth_is_refused() {
        let (partial, q) = setup();
        assert!(matches!(
            partial.get_quark_absolute_and_add(&["new"]).unwrap_err(),
            HistoryError::Unsupported(_)
        ));
        assert!(matches!(
            partial.get_quark_relative_and_add(q, &["new"]).unwrap_err(),
            HistoryError::Unsupported(_)
        ));
        // Lookups still work.
        assert_eq!(partial.get_quark_absolute(&["counter"]).unwrap(), q);
        assert_eq!(partial.full_attribute_path(q).unwrap(), "counter");
    }

    #[test]
    fn full_state_from_seek() {
        let (partial, q) = setup();
        let full = partial.query_full_state(42).unwrap();
        assert_eq!(full.len(), 1);
        assert_eq!(full[q.index()].as_ref().unwrap().value(), &int(4));
    }

    #[test]
    fn range_query_via_replay() {
        let (partial, q) = setup();
        let quarks = QuarkSelection::new(vec![q]).unwrap();
        let times = TimeRangeCondition::continuous(15, 44);
        let mut got = partial.query_2d(&quarks, &times).unwrap();
        got.sort_by_key(Interval::start);
        // Values 1..=4 overlap [15, 44].
        let values: Vec<_> = got.iter().map(|iv| iv.value().clone()).collect();
        assert_eq!(values, vec![int(1), int(2), int(3), int(4)]);
        // Starts are exact even for the interval already open at the floor
        // checkpoint.
        assert_eq!(got[0].start(), 10);
    }
}
