//! Disk-backed history tree for state intervals.
//!
//! The tree stores end-inclusive `(quark, start, end, value)` intervals in
//! fixed-size node blocks and answers point, full-state and 2D range
//! queries, both while the tree is still being built and after it has been
//! closed and reopened from disk.

pub mod io;
pub mod node;
pub mod tree;

pub use io::{FileHeader, TreeIo, FILE_VERSION};
pub use node::{ChildLink, Node, NodeType};
pub use tree::HistoryTree;
