//! Range conditions for 2D (time × attributes) queries.
//!
//! A time condition is either a continuous closed range or a sorted set of
//! discrete instants; the tree uses it to prune subtrees whose time window
//! cannot contain a match. A quark selection plays the same role on the
//! attribute axis.

use crate::Quark;

/// Condition on the time axis of a 2D query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeRangeCondition {
    /// Every instant in the closed range `[min, max]`.
    Continuous { min: i64, max: i64 },
    /// A sorted, deduplicated list of instants.
    Discrete(Vec<i64>),
}

impl TimeRangeCondition {
    /// Continuous condition over `[min, max]`. `min` and `max` are swapped
    /// if given in the wrong order.
    #[must_use]
    pub fn continuous(min: i64, max: i64) -> Self {
        if min <= max {
            Self::Continuous { min, max }
        } else {
            Self::Continuous { min: max, max: min }
        }
    }

    /// Discrete condition from an arbitrary list of instants. Returns `None`
    /// for an empty list.
    #[must_use]
    pub fn discrete(mut times: Vec<i64>) -> Option<Self> {
        if times.is_empty() {
            return None;
        }
        times.sort_unstable();
        times.dedup();
        Some(Self::Discrete(times))
    }

    /// Smallest instant that can satisfy the condition.
    #[must_use]
    pub fn min(&self) -> i64 {
        match self {
            Self::Continuous { min, .. } => *min,
            Self::Discrete(ts) => ts[0],
        }
    }

    /// Largest instant that can satisfy the condition.
    #[must_use]
    pub fn max(&self) -> i64 {
        match self {
            Self::Continuous { max, .. } => *max,
            Self::Discrete(ts) => ts[ts.len() - 1],
        }
    }

    /// Whether any instant of the condition falls inside `[lo, hi]`.
    #[must_use]
    pub fn intersects(&self, lo: i64, hi: i64) -> bool {
        match self {
            Self::Continuous { min, max } => *min <= hi && lo <= *max,
            Self::Discrete(ts) => {
                // First instant >= lo, if any, must also be <= hi.
                match ts.binary_search(&lo) {
                    Ok(_) => true,
                    Err(idx) => ts.get(idx).is_some_and(|&t| t <= hi),
                }
            }
        }
    }
}

/// Condition on the attribute axis of a 2D query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarkSelection {
    quarks: Vec<Quark>,
}

impl QuarkSelection {
    /// Build a selection from an arbitrary list of quarks. Returns `None`
    /// for an empty list.
    #[must_use]
    pub fn new(mut quarks: Vec<Quark>) -> Option<Self> {
        if quarks.is_empty() {
            return None;
        }
        quarks.sort_unstable();
        quarks.dedup();
        Some(Self { quarks })
    }

    #[must_use]
    pub fn contains(&self, quark: Quark) -> bool {
        self.quarks.binary_search(&quark).is_ok()
    }

    #[must_use]
    pub fn min(&self) -> Quark {
        self.quarks[0]
    }

    #[must_use]
    pub fn max(&self) -> Quark {
        self.quarks[self.quarks.len() - 1]
    }

    /// The selected quarks, in ascending order.
    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = Quark> + '_ {
        self.quarks.iter().copied()
    }
}
