//! Core types shared by every tracehist crate: attribute quarks, node
//! sequence numbers, state values, intervals, tree configuration, and the
//! range conditions used by 2D queries.

pub mod cancel;
pub mod condition;
pub mod interval;
pub mod value;

pub use cancel::CancelToken;
pub use condition::{QuarkSelection, TimeRangeCondition};
pub use interval::Interval;
pub use value::{StateValue, ValueKind};

use tracehist_error::{HistoryError, Result};

/// Small integer identifier for an attribute path, assigned once and stable
/// for the life of a state system. Quarks are dense, starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quark(u32);

impl Quark {
    /// Construct a quark from its raw value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw integer value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The quark as a dense-vector index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for Quark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of a history tree node. Doubles as the node's on-disk
/// identity: block offset = header size + seq * block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeSeq(u32);

impl NodeSeq {
    /// Sentinel used on disk for "no parent" (the root node).
    pub const NO_PARENT_RAW: u32 = u32::MAX;

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Provider version sentinel meaning "accept any provider version on reopen".
pub const IGNORE_PROVIDER_VERSION: u32 = u32::MAX;

/// Size in bytes of the history file header region. Node blocks start at
/// this offset. Must be at least as large as the serialized header.
pub const HEADER_SIZE: usize = 4096;

/// Configuration constants of a history tree, fixed at creation and persisted
/// in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Bytes per node block.
    pub block_size: usize,
    /// Maximum number of children per core node.
    pub max_children: usize,
    /// Version of the state provider that feeds this tree. Checked on reopen.
    pub provider_version: u32,
    /// Earliest timestamp the tree can store.
    pub tree_start: i64,
}

impl TreeConfig {
    /// Smallest sensible block size. A block must hold the node header, the
    /// reserved child-entry section of a core node, and at least one interval.
    pub const MIN_BLOCK_SIZE: usize = 4096;

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.block_size < Self::MIN_BLOCK_SIZE {
            return Err(HistoryError::internal(format!(
                "block size {} below minimum {}",
                self.block_size,
                Self::MIN_BLOCK_SIZE
            )));
        }
        if self.max_children < 2 {
            return Err(HistoryError::internal(format!(
                "max children {} must be at least 2",
                self.max_children
            )));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            max_children: 50,
            provider_version: 0,
            tree_start: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quark_roundtrip() {
        let q = Quark::new(42);
        assert_eq!(q.get(), 42);
        assert_eq!(q.index(), 42);
        assert_eq!(q.to_string(), "42");
    }

    #[test]
    fn default_config_is_valid() {
        assert!(TreeConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_tiny_blocks() {
        let cfg = TreeConfig {
            block_size: 512,
            ..TreeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_rejects_degenerate_fanout() {
        let cfg = TreeConfig {
            max_children: 1,
            ..TreeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
