//! The state system façade.
//!
//! One writer thread drives construction through the attribute and
//! modification operations; any number of reader threads issue queries
//! concurrently, during or after the build. Query results merge the
//! committed history from the backend with the synthesized ongoing interval
//! from the transient layer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use tracehist_attr::AttributeTree;
use tracehist_error::{HistoryError, Result};
use tracehist_types::{
    CancelToken, Interval, Quark, QuarkSelection, StateValue, TimeRangeCondition, TreeConfig,
};

use crate::backend::{HistoryTreeBackend, StateBackend};
use crate::latch::Latch;
use crate::transient::TransientState;
use crate::StateReceiver;

/// Query-facing façade over a backend, an attribute tree and the transient
/// ongoing state.
pub struct StateSystem {
    attr: Arc<RwLock<AttributeTree>>,
    backend: Arc<dyn StateBackend>,
    transient: TransientState,
    /// Saved pre-push ongoing values, per stack attribute.
    stacks: Mutex<HashMap<u32, Vec<StateValue>>>,
    finished: Latch,
    disposed: AtomicBool,
    cancel: CancelToken,
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("num_attributes", &self.num_attributes())
            .field("finished", &self.finished.is_open())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl StateSystem {
    /// A fresh, building state system over `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            attr: Arc::new(RwLock::new(AttributeTree::new())),
            transient: TransientState::new(Arc::clone(&backend)),
            backend,
            stacks: Mutex::new(HashMap::new()),
            finished: Latch::new(),
            disposed: AtomicBool::new(false),
            cancel: CancelToken::new(),
        }
    }

    /// A building state system persisting into a new history file.
    pub fn create(path: &Path, config: TreeConfig) -> Result<Self> {
        let backend = Arc::new(HistoryTreeBackend::create(path, config)?);
        Ok(Self::new(backend))
    }

    /// Reopen a finished history file: attribute tree restored from the
    /// file's attribute region, no transient state, already built.
    pub fn open(path: &Path, expected_provider_version: u32) -> Result<Self> {
        let (backend, attr_bytes) = HistoryTreeBackend::open(path, expected_provider_version)?;
        let attr = AttributeTree::from_bytes(&attr_bytes)?;
        let backend: Arc<dyn StateBackend> = Arc::new(backend);
        let system = Self {
            attr: Arc::new(RwLock::new(attr)),
            transient: TransientState::new(Arc::clone(&backend)),
            backend,
            stacks: Mutex::new(HashMap::new()),
            finished: Latch::new(),
            disposed: AtomicBool::new(false),
            cancel: CancelToken::new(),
        };
        system.transient.close(system.backend.end_time())?;
        system.finished.open();
        Ok(system)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(HistoryError::Disposed);
        }
        Ok(())
    }

    // --- Attribute tree access ---

    /// Shared handle on the attribute tree, for the partial system.
    pub fn attribute_tree(&self) -> Arc<RwLock<AttributeTree>> {
        Arc::clone(&self.attr)
    }

    pub fn num_attributes(&self) -> usize {
        self.attr.read().num_attributes()
    }

    pub fn get_quark_absolute_and_add(&self, path: &[&str]) -> Result<Quark> {
        self.check_disposed()?;
        let (quark, count) = {
            let mut attr = self.attr.write();
            let quark = attr.get_quark_and_add(None, path)?;
            (quark, attr.num_attributes())
        };
        self.transient.grow_to(count);
        Ok(quark)
    }

    pub fn get_quark_absolute(&self, path: &[&str]) -> Result<Quark> {
        self.check_disposed()?;
        self.attr.read().get_quark(None, path)
    }

    pub fn opt_quark_absolute(&self, path: &[&str]) -> Result<Option<Quark>> {
        self.check_disposed()?;
        self.attr.read().opt_quark(None, path)
    }

    pub fn get_quark_relative_and_add(&self, base: Quark, subpath: &[&str]) -> Result<Quark> {
        self.check_disposed()?;
        let (quark, count) = {
            let mut attr = self.attr.write();
            let quark = attr.get_quark_and_add(Some(base), subpath)?;
            (quark, attr.num_attributes())
        };
        self.transient.grow_to(count);
        Ok(quark)
    }

    pub fn get_quark_relative(&self, base: Quark, subpath: &[&str]) -> Result<Quark> {
        self.check_disposed()?;
        self.attr.read().get_quark(Some(base), subpath)
    }

    pub fn opt_quark_relative(&self, base: Quark, subpath: &[&str]) -> Result<Option<Quark>> {
        self.check_disposed()?;
        self.attr.read().opt_quark(Some(base), subpath)
    }

    pub fn sub_attributes(&self, base: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        self.check_disposed()?;
        self.attr.read().sub_attributes(base, recursive)
    }

    pub fn parent_quark(&self, quark: Quark) -> Result<Option<Quark>> {
        self.check_disposed()?;
        self.attr.read().parent_quark(quark)
    }

    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        self.check_disposed()?;
        Ok(self.attr.read().attribute_name(quark)?.to_owned())
    }

    pub fn full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.check_disposed()?;
        self.attr.read().full_path_string(quark)
    }

    // --- Construction ---

    pub fn start_time(&self) -> i64 {
        self.backend.start_time()
    }

    /// Latest timestamp known to the system: committed history or ongoing
    /// state, whichever is further.
    pub fn current_end_time(&self) -> i64 {
        self.backend.end_time().max(self.transient.latest_time())
    }

    /// Close `quark`'s ongoing interval at `time - 1` and start a new one
    /// carrying `value`.
    pub fn modify_attribute(&self, time: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        self.transient.process_state_change(time, value, quark)
    }

    /// Save the current ongoing value and overlay `value` on top of it.
    pub fn push_attribute(&self, time: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        let saved = self.transient.ongoing_value(quark);
        self.transient.process_state_change(time, value, quark)?;
        self.stacks.lock().entry(quark.get()).or_default().push(saved);
        Ok(())
    }

    /// Undo the matching push: restore the value that was ongoing before it.
    /// Popping an empty stack is recoverable; the caller logs and carries on.
    pub fn pop_attribute(&self, time: i64, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        let saved = self.stacks.lock().get_mut(&quark.get()).and_then(Vec::pop);
        match saved {
            Some(value) => self.transient.process_state_change(time, value, quark),
            None => {
                tracing::warn!(quark = quark.get(), time, "pop on an empty stack");
                Err(HistoryError::AttributeNotFound {
                    path: format!("stack under quark {quark}"),
                })
            }
        }
    }

    /// Null out the ongoing value of `quark` and every attribute below it.
    pub fn remove_attribute(&self, time: i64, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        let subtree = self.attr.read().sub_attributes(Some(quark), true)?;
        for q in subtree {
            self.transient.process_state_change(time, StateValue::Null, q)?;
        }
        self.transient.process_state_change(time, StateValue::Null, quark)
    }

    /// Current ongoing value of `quark`.
    pub fn query_ongoing_state(&self, quark: Quark) -> StateValue {
        self.transient.ongoing_value(quark)
    }

    pub fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        self.transient.ongoing_start_time(quark)
    }

    /// Change an ongoing value in place, without closing an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        self.transient.update_ongoing(quark, value)
    }

    /// Dense snapshot of all ongoing `(start, value)` pairs.
    pub fn snapshot_ongoing(&self) -> Vec<(i64, StateValue)> {
        self.transient.snapshot()
    }

    /// Replace the whole ongoing vector, e.g. when seeking to a checkpoint.
    pub fn replace_ongoing_state(&self, snapshot: Vec<(i64, StateValue)>) -> Result<()> {
        self.check_disposed()?;
        self.transient.replace_ongoing(snapshot);
        Ok(())
    }

    /// Close every ongoing interval, persist the attribute tree and finish
    /// the backend. The history ends at `end_time` or at the latest
    /// recorded change, whichever is later.
    pub fn close_history(&self, end_time: i64) -> Result<()> {
        self.check_disposed()?;
        let end = end_time.max(self.transient.latest_time());
        if end > end_time {
            tracing::warn!(
                requested = end_time,
                actual = end,
                "history extends past the requested end time"
            );
        }
        self.transient.close(end)?;
        let attr_bytes = self.attr.read().to_bytes();
        self.backend.finish(end, &attr_bytes)?;
        self.finished.open();
        tracing::debug!(end, "closed history");
        Ok(())
    }

    // --- Build synchronization ---

    pub fn is_finished(&self) -> bool {
        self.finished.is_open()
    }

    /// Block until the history is fully built (or the system is disposed).
    pub fn wait_until_built(&self) {
        self.finished.wait();
    }

    /// Like [`wait_until_built`](Self::wait_until_built) with a timeout.
    /// Returns whether the build is done.
    pub fn wait_until_built_timeout(&self, timeout: Duration) -> bool {
        self.finished.wait_timeout(timeout)
    }

    /// Cancellation flag handed to the construction loop; checked between
    /// events, never mid-write.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Tear the system down: all further operations fail with `Disposed`,
    /// the build loop's cancel flag is raised and waiters are released.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            self.finished.open();
            tracing::debug!("state system disposed");
        }
    }

    // --- Queries ---

    fn check_query_time(&self, t: i64) -> Result<()> {
        let start = self.start_time();
        let end = self.current_end_time();
        if t < start || t > end {
            return Err(HistoryError::TimeRange {
                time: t,
                start,
                end,
            });
        }
        Ok(())
    }

    /// The interval of `quark` covering `t`: the synthesized ongoing
    /// interval while it applies, the committed one otherwise, `None` for a
    /// genuine gap.
    pub fn query_single_state(&self, t: i64, quark: Quark) -> Result<Option<Interval>> {
        self.check_disposed()?;
        self.check_query_time(t)?;
        if let Some(ongoing) = self.transient.interval_at(quark, t) {
            return Ok(Some(ongoing));
        }
        self.backend.query_single(quark, t)
    }

    /// One slot per known quark: the interval covering `t`, or `None`.
    pub fn query_full_state(&self, t: i64) -> Result<Vec<Option<Interval>>> {
        self.check_disposed()?;
        self.check_query_time(t)?;
        let mut state_info: Vec<Option<Interval>> = vec![None; self.num_attributes()];
        if t <= self.backend.end_time() {
            self.backend.query_full(t, &mut state_info)?;
        }
        if self.transient.is_active() {
            for (i, slot) in state_info.iter_mut().enumerate() {
                if let Some(ongoing) = self.transient.interval_at(Quark::new(i as u32), t) {
                    *slot = Some(ongoing);
                }
            }
        }
        Ok(state_info)
    }

    /// All intervals matching both conditions, committed and ongoing.
    pub fn query_2d(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
        cancel: &CancelToken,
    ) -> Result<Vec<Interval>> {
        self.check_disposed()?;
        let mut results = self.backend.query_2d(quarks, times, cancel)?;
        if self.transient.is_active() {
            let latest = self.transient.latest_time();
            for quark in quarks.iter() {
                if let Some(ongoing) = self.transient.interval_at(quark, latest) {
                    if times.intersects(ongoing.start(), ongoing.end()) {
                        results.push(ongoing);
                    }
                }
            }
        }
        Ok(results)
    }
}

impl StateReceiver for StateSystem {
    fn modify(&self, time: i64, quark: Quark, value: StateValue) -> Result<()> {
        self.modify_attribute(time, value, quark)
    }
}
