//! History tree nodes.
//!
//! A node owns a fixed-size block of the history file. Intervals inside a
//! node are kept sorted by end time, which lets point queries skip straight
//! to the first interval whose end can still cover the requested timestamp.
//!
//! A node is *open* while it sits on the latest branch and accepts inserts;
//! sealing it fixes its end time and freezes it forever. Mutating a sealed
//! node is a logic error and fails fast.

use parking_lot::RwLock;

use tracehist_error::{HistoryError, Result};
use tracehist_types::{Interval, NodeSeq, Quark, QuarkSelection, TimeRangeCondition};

/// Byte tags for the node type field on disk.
const TYPE_CORE: u8 = 1;
const TYPE_LEAF: u8 = 2;

/// Size of the header every node carries: type (1), start (8), end (8),
/// sequence number (4), parent (4), interval count (4).
pub const COMMON_HEADER_SIZE: usize = 29;

/// Size of one child entry in a core node: sequence number (4), start (8).
const CHILD_ENTRY_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Interior node: holds intervals and child links.
    Core,
    /// Bottom-level node: intervals only.
    Leaf,
}

impl NodeType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Core => TYPE_CORE,
            Self::Leaf => TYPE_LEAF,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            TYPE_CORE => Ok(Self::Core),
            TYPE_LEAF => Ok(Self::Leaf),
            other => Err(HistoryError::corrupt(format!("unknown node type {other}"))),
        }
    }
}

/// One child link of a core node: the child's sequence number and the start
/// of the time range it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLink {
    pub seq: NodeSeq,
    pub start: i64,
}

#[derive(Debug)]
struct NodeData {
    /// Meaningful once sealed. While open, queries use the tree's current
    /// end time instead.
    end: i64,
    parent: Option<NodeSeq>,
    sealed: bool,
    free_space: usize,
    /// Sorted by end time, ascending.
    intervals: Vec<Interval>,
    /// Core nodes only; children are appended in start-time order.
    children: Vec<ChildLink>,
}

/// A single history tree node. Cheap to share behind an `Arc`; interior
/// mutability covers the open-node write path and concurrent readers.
#[derive(Debug)]
pub struct Node {
    node_type: NodeType,
    seq: NodeSeq,
    start: i64,
    data: RwLock<NodeData>,
}

impl Node {
    fn new(
        node_type: NodeType,
        seq: NodeSeq,
        parent: Option<NodeSeq>,
        start: i64,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        let overhead = Self::header_overhead(node_type, max_children);
        Self {
            node_type,
            seq,
            start,
            data: RwLock::new(NodeData {
                end: start,
                parent,
                sealed: false,
                free_space: block_size.saturating_sub(overhead),
                intervals: Vec::new(),
                children: Vec::new(),
            }),
        }
    }

    pub fn new_core(
        seq: NodeSeq,
        parent: Option<NodeSeq>,
        start: i64,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        Self::new(NodeType::Core, seq, parent, start, block_size, max_children)
    }

    pub fn new_leaf(
        seq: NodeSeq,
        parent: Option<NodeSeq>,
        start: i64,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        Self::new(NodeType::Leaf, seq, parent, start, block_size, max_children)
    }

    /// Bytes of a block consumed by headers, before any interval is stored.
    /// Core nodes reserve the full child table up front so a child link can
    /// always be added to a non-full node.
    pub fn header_overhead(node_type: NodeType, max_children: usize) -> usize {
        match node_type {
            NodeType::Core => COMMON_HEADER_SIZE + 4 + max_children * CHILD_ENTRY_SIZE,
            NodeType::Leaf => COMMON_HEADER_SIZE,
        }
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn seq(&self) -> NodeSeq {
        self.seq
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    /// Sealed end time, or `None` while the node is still open.
    pub fn sealed_end(&self) -> Option<i64> {
        let data = self.data.read();
        data.sealed.then_some(data.end)
    }

    pub fn is_sealed(&self) -> bool {
        self.data.read().sealed
    }

    pub fn parent(&self) -> Option<NodeSeq> {
        self.data.read().parent
    }

    /// Re-parent the node. Happens exactly once, when a new root is pushed
    /// above the current one.
    pub fn set_parent(&self, parent: NodeSeq) {
        self.data.write().parent = Some(parent);
    }

    pub fn free_space(&self) -> usize {
        self.data.read().free_space
    }

    pub fn interval_count(&self) -> usize {
        self.data.read().intervals.len()
    }

    /// Insert an interval, keeping the node's by-end-time order. The caller
    /// is responsible for checking [`free_space`](Self::free_space) first;
    /// an oversized insert here is a logic error.
    pub fn add_interval(&self, interval: Interval) -> Result<()> {
        let mut data = self.data.write();
        if data.sealed {
            return Err(HistoryError::NodeSealed {
                seq: self.seq.get(),
            });
        }
        let size = interval.size_on_disk();
        if size > data.free_space {
            return Err(HistoryError::internal(format!(
                "interval of {size} bytes does not fit in node {} ({} bytes free)",
                self.seq, data.free_space
            )));
        }
        let idx = data
            .intervals
            .partition_point(|iv| iv.end() <= interval.end());
        data.intervals.insert(idx, interval);
        data.free_space -= size;
        Ok(())
    }

    /// Seal the node with the given end time. The node must still be open
    /// and `end` must cover every stored interval.
    pub fn seal(&self, end: i64) -> Result<()> {
        let mut data = self.data.write();
        if data.sealed {
            return Err(HistoryError::NodeSealed {
                seq: self.seq.get(),
            });
        }
        if let Some(last) = data.intervals.last() {
            if end < last.end() {
                return Err(HistoryError::internal(format!(
                    "sealing node {} at {end} would truncate an interval ending at {}",
                    self.seq,
                    last.end()
                )));
            }
        }
        data.end = end;
        data.sealed = true;
        tracing::trace!(seq = self.seq.get(), end, "sealed node");
        Ok(())
    }

    /// Index of the first interval whose end time can cover `t`.
    fn start_index_for(intervals: &[Interval], t: i64) -> usize {
        intervals.partition_point(|iv| iv.end() < t)
    }

    /// The interval of `quark` covering `t`, if this node holds it.
    pub fn interval_matching(&self, quark: Quark, t: i64) -> Option<Interval> {
        let data = self.data.read();
        for iv in &data.intervals[Self::start_index_for(&data.intervals, t)..] {
            if iv.quark() == quark && iv.start() <= t {
                return Some(iv.clone());
            }
        }
        None
    }

    /// Write every interval of this node covering `t` into the dense
    /// per-quark vector. Quarks beyond the vector's length are skipped
    /// (they were created after the vector was sized).
    pub fn write_matching(&self, t: i64, out: &mut [Option<Interval>]) {
        let data = self.data.read();
        for iv in &data.intervals[Self::start_index_for(&data.intervals, t)..] {
            if iv.start() <= t {
                if let Some(slot) = out.get_mut(iv.quark().index()) {
                    *slot = Some(iv.clone());
                }
            }
        }
    }

    /// Intervals of this node matching both query conditions.
    pub fn intervals_matching(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
    ) -> Vec<Interval> {
        let data = self.data.read();
        data.intervals
            .iter()
            .filter(|iv| quarks.contains(iv.quark()) && times.intersects(iv.start(), iv.end()))
            .cloned()
            .collect()
    }

    // --- Core node child table ---

    pub fn child_count(&self) -> usize {
        self.data.read().children.len()
    }

    pub fn children(&self) -> Vec<ChildLink> {
        self.data.read().children.clone()
    }

    /// Link a new child. Only valid on an open core node with a free slot.
    pub fn add_child(&self, seq: NodeSeq, start: i64, max_children: usize) -> Result<()> {
        if self.node_type != NodeType::Core {
            return Err(HistoryError::internal(format!(
                "leaf node {} cannot have children",
                self.seq
            )));
        }
        let mut data = self.data.write();
        if data.sealed {
            return Err(HistoryError::NodeSealed {
                seq: self.seq.get(),
            });
        }
        if data.children.len() >= max_children {
            return Err(HistoryError::internal(format!(
                "node {} already has {max_children} children",
                self.seq
            )));
        }
        data.children.push(ChildLink { seq, start });
        Ok(())
    }

    // --- Serialization ---

    /// Serialize into a full block of `block_size` bytes.
    pub fn to_bytes(&self, block_size: usize, max_children: usize) -> Result<Vec<u8>> {
        let data = self.data.read();
        let mut buf = Vec::with_capacity(block_size);
        buf.push(self.node_type.to_byte());
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&data.end.to_le_bytes());
        buf.extend_from_slice(&self.seq.get().to_le_bytes());
        let parent_raw = data.parent.map_or(NodeSeq::NO_PARENT_RAW, NodeSeq::get);
        buf.extend_from_slice(&parent_raw.to_le_bytes());
        buf.extend_from_slice(&(data.intervals.len() as u32).to_le_bytes());
        if self.node_type == NodeType::Core {
            buf.extend_from_slice(&(data.children.len() as u32).to_le_bytes());
            for link in &data.children {
                buf.extend_from_slice(&link.seq.get().to_le_bytes());
                buf.extend_from_slice(&link.start.to_le_bytes());
            }
            // Unused child slots stay zeroed so the block layout is stable.
            let padding = (max_children - data.children.len()) * CHILD_ENTRY_SIZE;
            buf.resize(buf.len() + padding, 0);
        }
        for iv in &data.intervals {
            iv.write_to(&mut buf);
        }
        if buf.len() > block_size {
            return Err(HistoryError::internal(format!(
                "node {} serialized to {} bytes, block size is {block_size}",
                self.seq,
                buf.len()
            )));
        }
        buf.resize(block_size, 0);
        Ok(buf)
    }

    /// Rebuild a node from a block read off disk. Nodes on disk are always
    /// sealed.
    pub fn from_bytes(buf: &[u8], block_size: usize, max_children: usize) -> Result<Self> {
        if buf.len() != block_size {
            return Err(HistoryError::ShortRead {
                expected: block_size,
                actual: buf.len(),
            });
        }
        let mut pos = 0usize;
        let node_type = NodeType::from_byte(read_u8(buf, &mut pos)?)?;
        let start = read_i64(buf, &mut pos)?;
        let end = read_i64(buf, &mut pos)?;
        let seq_raw = read_u32(buf, &mut pos)?;
        let parent_raw = read_u32(buf, &mut pos)?;
        let interval_count = read_u32(buf, &mut pos)? as usize;

        let mut children = Vec::new();
        if node_type == NodeType::Core {
            let child_count = read_u32(buf, &mut pos)? as usize;
            if child_count > max_children {
                return Err(HistoryError::corrupt(format!(
                    "node {seq_raw} claims {child_count} children, max is {max_children}"
                )));
            }
            for _ in 0..child_count {
                let child_seq = read_u32(buf, &mut pos)?;
                let child_start = read_i64(buf, &mut pos)?;
                children.push(ChildLink {
                    seq: NodeSeq::new(child_seq),
                    start: child_start,
                });
            }
            pos += (max_children - child_count) * CHILD_ENTRY_SIZE;
        }

        let mut intervals = Vec::with_capacity(interval_count);
        let mut payload = 0usize;
        for _ in 0..interval_count {
            let iv = Interval::read_from(buf, &mut pos)?;
            payload += iv.size_on_disk();
            intervals.push(iv);
        }
        if !intervals.windows(2).all(|w| w[0].end() <= w[1].end()) {
            return Err(HistoryError::corrupt(format!(
                "node {seq_raw} intervals are not sorted by end time"
            )));
        }

        let overhead = Self::header_overhead(node_type, max_children);
        let parent = if parent_raw == NodeSeq::NO_PARENT_RAW {
            None
        } else {
            Some(NodeSeq::new(parent_raw))
        };
        Ok(Self {
            node_type,
            seq: NodeSeq::new(seq_raw),
            start,
            data: RwLock::new(NodeData {
                end,
                parent,
                sealed: true,
                free_space: block_size.saturating_sub(overhead + payload),
                intervals,
                children,
            }),
        })
    }
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *buf.get(*pos).ok_or(HistoryError::ShortRead {
        expected: 1,
        actual: 0,
    })?;
    *pos += 1;
    Ok(b)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    if end > buf.len() {
        return Err(HistoryError::ShortRead {
            expected: 4,
            actual: buf.len().saturating_sub(*pos),
        });
    }
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[*pos..end]);
    *pos = end;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i64(buf: &[u8], pos: &mut usize) -> Result<i64> {
    let end = *pos + 8;
    if end > buf.len() {
        return Err(HistoryError::ShortRead {
            expected: 8,
            actual: buf.len().saturating_sub(*pos),
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[*pos..end]);
    *pos = end;
    Ok(i64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracehist_types::{Quark, StateValue};

    const BLOCK: usize = 4096;
    const MAX_CHILDREN: usize = 4;

    fn iv(start: i64, end: i64, quark: u32, value: i32) -> Interval {
        Interval::new(start, end, Quark::new(quark), StateValue::Int(value)).unwrap()
    }

    fn leaf() -> Node {
        Node::new_leaf(NodeSeq::new(0), None, 0, BLOCK, MAX_CHILDREN)
    }

    #[test]
    fn intervals_stay_sorted_by_end() {
        let node = leaf();
        node.add_interval(iv(0, 50, 1, 1)).unwrap();
        node.add_interval(iv(0, 10, 2, 2)).unwrap();
        node.add_interval(iv(5, 30, 3, 3)).unwrap();
        // The query for t=10 must not scan past intervals ending before 10.
        assert_eq!(node.interval_matching(Quark::new(2), 10).unwrap().end(), 10);
        assert_eq!(node.interval_matching(Quark::new(3), 10).unwrap().end(), 30);
        assert_eq!(node.interval_matching(Quark::new(1), 40).unwrap().end(), 50);
        assert!(node.interval_matching(Quark::new(2), 11).is_none());
    }

    #[test]
    fn free_space_accounting() {
        let node = leaf();
        let before = node.free_space();
        assert_eq!(before, BLOCK - COMMON_HEADER_SIZE);
        let interval = iv(0, 10, 1, 1);
        let size = interval.size_on_disk();
        node.add_interval(interval).unwrap();
        assert_eq!(node.free_space(), before - size);
    }

    #[test]
    fn core_reserves_child_table() {
        let node = Node::new_core(NodeSeq::new(1), None, 0, BLOCK, MAX_CHILDREN);
        assert_eq!(
            node.free_space(),
            BLOCK - COMMON_HEADER_SIZE - 4 - MAX_CHILDREN * CHILD_ENTRY_SIZE
        );
    }

    #[test]
    fn sealed_node_rejects_mutation() {
        let node = leaf();
        node.add_interval(iv(0, 10, 1, 1)).unwrap();
        node.seal(20).unwrap();
        assert!(matches!(
            node.add_interval(iv(15, 18, 1, 2)).unwrap_err(),
            HistoryError::NodeSealed { seq: 0 }
        ));
        assert!(matches!(
            node.seal(30).unwrap_err(),
            HistoryError::NodeSealed { seq: 0 }
        ));
        assert_eq!(node.sealed_end(), Some(20));
    }

    #[test]
    fn seal_cannot_truncate_intervals() {
        let node = leaf();
        node.add_interval(iv(0, 100, 1, 1)).unwrap();
        assert!(node.seal(50).is_err());
        assert!(!node.is_sealed());
        node.seal(100).unwrap();
    }

    #[test]
    fn leaf_round_trip() {
        let node = leaf();
        node.add_interval(iv(0, 10, 1, 7)).unwrap();
        node.add_interval(iv(3, 25, 2, 8)).unwrap();
        node.seal(30).unwrap();
        let bytes = node.to_bytes(BLOCK, MAX_CHILDREN).unwrap();
        assert_eq!(bytes.len(), BLOCK);
        let restored = Node::from_bytes(&bytes, BLOCK, MAX_CHILDREN).unwrap();
        assert_eq!(restored.node_type(), NodeType::Leaf);
        assert_eq!(restored.seq(), NodeSeq::new(0));
        assert_eq!(restored.start(), 0);
        assert_eq!(restored.sealed_end(), Some(30));
        assert_eq!(restored.interval_count(), 2);
        assert_eq!(restored.free_space(), node.free_space());
        assert_eq!(restored.interval_matching(Quark::new(2), 20).unwrap().end(), 25);
    }

    #[test]
    fn core_round_trip_keeps_children() {
        let node = Node::new_core(NodeSeq::new(3), Some(NodeSeq::new(9)), 5, BLOCK, MAX_CHILDREN);
        node.add_child(NodeSeq::new(0), 5, MAX_CHILDREN).unwrap();
        node.add_child(NodeSeq::new(1), 40, MAX_CHILDREN).unwrap();
        node.add_interval(iv(5, 60, 0, 1)).unwrap();
        node.seal(80).unwrap();
        let bytes = node.to_bytes(BLOCK, MAX_CHILDREN).unwrap();
        let restored = Node::from_bytes(&bytes, BLOCK, MAX_CHILDREN).unwrap();
        assert_eq!(restored.parent(), Some(NodeSeq::new(9)));
        assert_eq!(
            restored.children(),
            vec![
                ChildLink { seq: NodeSeq::new(0), start: 5 },
                ChildLink { seq: NodeSeq::new(1), start: 40 },
            ]
        );
    }

    #[test]
    fn child_table_is_bounded() {
        let node = Node::new_core(NodeSeq::new(0), None, 0, BLOCK, 2);
        node.add_child(NodeSeq::new(1), 0, 2).unwrap();
        node.add_child(NodeSeq::new(2), 10, 2).unwrap();
        assert!(node.add_child(NodeSeq::new(3), 20, 2).is_err());
    }

    #[test]
    fn write_matching_fills_dense_vector() {
        let node = leaf();
        node.add_interval(iv(0, 10, 0, 1)).unwrap();
        node.add_interval(iv(0, 20, 1, 2)).unwrap();
        node.add_interval(iv(11, 20, 0, 3)).unwrap();
        let mut out: Vec<Option<Interval>> = vec![None; 2];
        node.write_matching(15, &mut out);
        assert_eq!(out[0].as_ref().unwrap().value(), &StateValue::Int(3));
        assert_eq!(out[1].as_ref().unwrap().value(), &StateValue::Int(2));
        // A shorter vector is simply not written past its length.
        let mut short: Vec<Option<Interval>> = vec![None; 1];
        node.write_matching(15, &mut short);
        assert!(short[0].is_some());
    }

    #[test]
    fn from_bytes_rejects_bad_blocks() {
        assert!(Node::from_bytes(&[0u8; 16], BLOCK, MAX_CHILDREN).is_err());
        let mut garbage = vec![0u8; BLOCK];
        garbage[0] = 99; // unknown node type
        assert!(matches!(
            Node::from_bytes(&garbage, BLOCK, MAX_CHILDREN).unwrap_err(),
            HistoryError::Corrupt { .. }
        ));
    }
}
