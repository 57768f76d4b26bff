//! End-to-end pipeline test: build a persisted history, query it while
//! building, close it, reopen it from disk, and serve the same answers.
//!
//! ## Stages
//!
//! 1. **Build** - synthetic scheduler-like events through the façade
//! 2. **Live queries** - point queries against building state
//! 3. **Close + reopen** - persist, drop, reopen with version checks
//! 4. **Equivalence** - full query surface identical before/after reopen
//! 5. **Partial** - checkpoint/replay system agrees with the full one

use std::sync::Arc;

use tempfile::tempdir;

use tracehist_core::{
    CheckpointArena, EventSource, PartialStateSystem, StateReceiver, StateSystem,
};
use tracehist_error::{HistoryError, Result};
use tracehist_types::{
    CancelToken, Quark, QuarkSelection, StateValue, TimeRangeCondition, TreeConfig,
    IGNORE_PROVIDER_VERSION,
};

const PROVIDER_VERSION: u32 = 11;

fn config() -> TreeConfig {
    TreeConfig {
        block_size: 4096,
        max_children: 4,
        provider_version: PROVIDER_VERSION,
        tree_start: 0,
    }
}

/// A scripted trace: `num_cpus` CPUs cycling through run states every
/// `period` units, long enough to force node splits with 4 KiB blocks.
struct CpuTrace {
    num_cpus: u32,
    period: i64,
    end: i64,
}

impl CpuTrace {
    fn events(&self) -> impl Iterator<Item = (i64, u32, StateValue)> + '_ {
        (0..self.end / self.period).flat_map(move |n| {
            let t = n * self.period;
            (0..self.num_cpus).map(move |cpu| {
                let state = i32::try_from((n + i64::from(cpu)) % 3).unwrap_or(0);
                (t + i64::from(cpu), cpu, StateValue::Int(state))
            })
        })
    }

    fn feed(&self, sys: &StateSystem, quarks: &[Quark]) -> Result<()> {
        for (t, cpu, value) in self.events() {
            sys.modify_attribute(t, value, quarks[cpu as usize])?;
        }
        Ok(())
    }
}

fn cpu_quarks(sys: &StateSystem, num_cpus: u32) -> Vec<Quark> {
    (0..num_cpus)
        .map(|cpu| {
            sys.get_quark_absolute_and_add(&["CPUs", &cpu.to_string(), "Status"])
                .unwrap()
        })
        .collect()
}

#[test]
fn build_close_reopen_equivalence() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("history.ht");
    let trace = CpuTrace {
        num_cpus: 4,
        period: 10,
        end: 5_000,
    };

    // Stage 1: build.
    let sys = StateSystem::create(&path, config()).unwrap();
    let quarks = cpu_quarks(&sys, trace.num_cpus);
    trace.feed(&sys, &quarks).unwrap();

    // Stage 2: live queries see the ongoing state.
    assert!(!sys.is_finished());
    let live = sys
        .query_single_state(sys.current_end_time(), quarks[0])
        .unwrap();
    assert!(live.is_some(), "ongoing value visible while building");

    // Stage 3: close, record the full answer surface, reopen.
    sys.close_history(trace.end).unwrap();
    assert!(sys.is_finished());
    sys.wait_until_built(); // returns immediately once built

    let sample_times: Vec<i64> = (0..trace.end).step_by(137).collect();
    let before: Vec<_> = sample_times
        .iter()
        .map(|&t| sys.query_full_state(t).unwrap())
        .collect();
    drop(sys);

    assert!(matches!(
        StateSystem::open(&path, PROVIDER_VERSION + 1).unwrap_err(),
        HistoryError::VersionMismatch { .. }
    ));
    let reopened = StateSystem::open(&path, PROVIDER_VERSION).unwrap();
    assert!(reopened.is_finished());

    // Stage 4: equivalence over points, names and 2D.
    for (i, &t) in sample_times.iter().enumerate() {
        assert_eq!(reopened.query_full_state(t).unwrap(), before[i], "t={t}");
    }
    for (cpu, &q) in quarks.iter().enumerate() {
        assert_eq!(
            reopened.full_attribute_path(q).unwrap(),
            format!("CPUs/{cpu}/Status")
        );
    }
    let selection = QuarkSelection::new(quarks.clone()).unwrap();
    let times = TimeRangeCondition::continuous(1_000, 2_000);
    let cancel = CancelToken::new();
    let intervals = reopened.query_2d(&selection, &times, &cancel).unwrap();
    assert!(!intervals.is_empty());
    for iv in &intervals {
        assert!(times.intersects(iv.start(), iv.end()));
        assert!(quarks.contains(&iv.quark()));
    }

    // The sentinel version is accepted too.
    StateSystem::open(&path, IGNORE_PROVIDER_VERSION).unwrap();
}

/// Replays the scripted trace for the partial system.
struct TraceSource {
    trace: CpuTrace,
    quarks: Vec<Quark>,
}

impl EventSource for TraceSource {
    fn replay(&self, from: i64, to: i64, receiver: &dyn StateReceiver) -> Result<()> {
        for (t, cpu, value) in self.trace.events() {
            if t >= from && t <= to {
                receiver.modify(t, self.quarks[cpu as usize], value)?;
            }
        }
        Ok(())
    }
}

#[test]
fn partial_system_agrees_with_full_system() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("history.ht");
    let trace = CpuTrace {
        num_cpus: 3,
        period: 10,
        end: 2_000,
    };

    // Build the real history, recording checkpoints every 250 units.
    let sys = StateSystem::create(&path, config()).unwrap();
    let quarks = cpu_quarks(&sys, trace.num_cpus);
    let mut arena = CheckpointArena::new(0, 250);
    for (t, cpu, value) in trace.events() {
        sys.modify_attribute(t, value, quarks[cpu as usize]).unwrap();
        if arena.is_due(t) {
            arena.record(t, sys.snapshot_ongoing());
        }
    }
    sys.close_history(trace.end).unwrap();

    let source = TraceSource {
        trace: CpuTrace {
            num_cpus: 3,
            period: 10,
            end: 2_000,
        },
        quarks: quarks.clone(),
    };
    let partial = Arc::new(
        PartialStateSystem::new(sys.attribute_tree(), arena, source, 0, trace.end).unwrap(),
    );

    for t in [0i64, 3, 249, 250, 999, 1_500, 1_999] {
        for &q in &quarks {
            let full = sys.query_single_state(t, q).unwrap();
            let part = partial.query_single_state(t, q).unwrap();
            match (full, part) {
                (Some(f), Some(p)) => {
                    assert_eq!(f.value(), p.value(), "quark {q} at {t}");
                    assert_eq!(f.start(), p.start(), "quark {q} at {t}");
                }
                (f, p) => panic!("coverage mismatch for quark {q} at {t}: {f:?} vs {p:?}"),
            }
        }
    }

    // Concurrent partial queries serialize on the query lock and still
    // answer correctly.
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let partial = Arc::clone(&partial);
            let q = quarks[i % quarks.len()];
            std::thread::spawn(move || {
                for t in (0..2_000).step_by(401) {
                    partial.query_single_state(t, q).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
