//! State system façade over the history tree.
//!
//! [`StateSystem`] is what a state provider feeds (modify/push/pop) and what
//! query callers read (point, full-state and 2D queries). It owns the
//! attribute tree, the transient ongoing state, and a pluggable storage
//! [`StateBackend`]. [`PartialStateSystem`] answers queries over a history
//! that was never fully persisted, from checkpoints plus event replay.

use tracehist_error::Result;
use tracehist_types::{Quark, StateValue};

pub mod backend;
pub mod latch;
pub mod partial;
pub mod state_system;
pub mod transient;

pub use backend::{
    CollectingBackend, HistoryTreeBackend, InMemoryBackend, NullBackend, StateBackend,
};
pub use latch::Latch;
pub use partial::{Checkpoint, CheckpointArena, PartialStateSystem};
pub use state_system::StateSystem;
pub use transient::TransientState;

/// Anything that accepts timed state modifications. The seam between event
/// interpretation and state storage; a state system is one implementor, the
/// partial system's replay sink is another.
pub trait StateReceiver {
    fn modify(&self, time: i64, quark: Quark, value: StateValue) -> Result<()>;
}

/// Anything that can re-feed a time range of already-seen events into a
/// receiver. Implemented over the original trace by the caller; the partial
/// state system replays through it on every seek.
pub trait EventSource {
    /// Deliver every event with `from <= time <= to`, in time order.
    fn replay(&self, from: i64, to: i64, receiver: &dyn StateReceiver) -> Result<()>;
}
