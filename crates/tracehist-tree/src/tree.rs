//! The disk-backed history tree.
//!
//! Writes go through the *latest branch*: the rightmost path from the root
//! to the current leaf, the only open nodes in the tree. When an interval no
//! longer fits, the branch is split: the full nodes are sealed at the
//! current tree end and a fresh sibling branch starting one tick later is
//! spawned. Child time windows on a core node are therefore disjoint, and a
//! point query follows exactly one root-to-leaf path.
//!
//! Closing the tree seals the whole branch, appends the serialized attribute
//! tree and writes the file header. A closed or reopened tree is immutable.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use tracehist_error::{HistoryError, Result};
use tracehist_types::{
    CancelToken, Interval, NodeSeq, Quark, QuarkSelection, TimeRangeCondition, TreeConfig,
};

use crate::io::{FileHeader, TreeIo};
use crate::node::{ChildLink, Node, NodeType};

#[derive(Debug)]
struct TreeState {
    /// Root-first path of open nodes. Empty once the tree is closed.
    latest_branch: Vec<Arc<Node>>,
    node_count: u32,
    root_seq: NodeSeq,
    tree_end: i64,
    closed: bool,
}

/// A history tree over one file. Insertions come from a single builder
/// thread; queries may run concurrently from any thread, during or after
/// the build.
#[derive(Debug)]
pub struct HistoryTree {
    config: TreeConfig,
    io: TreeIo,
    state: RwLock<TreeState>,
}

impl HistoryTree {
    /// Create a new, empty tree backed by a fresh file at `path`.
    pub fn create(path: &Path, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let io = TreeIo::create(path, &config)?;
        let root = Arc::new(Node::new_leaf(
            NodeSeq::new(0),
            None,
            config.tree_start,
            config.block_size,
            config.max_children,
        ));
        tracing::debug!(path = %path.display(), tree_start = config.tree_start, "created history tree");
        Ok(Self {
            config,
            io,
            state: RwLock::new(TreeState {
                latest_branch: vec![root],
                node_count: 1,
                root_seq: NodeSeq::new(0),
                tree_end: config.tree_start,
                closed: false,
            }),
        })
    }

    /// Reopen a finished tree from disk. Returns the tree and the raw bytes
    /// of its attribute region. `expected_provider_version` must match the
    /// persisted one unless it is `IGNORE_PROVIDER_VERSION`.
    pub fn open(path: &Path, expected_provider_version: u32) -> Result<(Self, Vec<u8>)> {
        let (io, header) = TreeIo::open(path, expected_provider_version)?;
        let attr_bytes = io.read_attr_region(&header)?;
        let config = TreeConfig {
            block_size: header.block_size as usize,
            max_children: header.max_children as usize,
            provider_version: header.provider_version,
            tree_start: header.tree_start,
        };
        tracing::debug!(
            path = %path.display(),
            node_count = header.node_count,
            tree_end = header.tree_end,
            "reopened history tree"
        );
        Ok((
            Self {
                config,
                io,
                state: RwLock::new(TreeState {
                    latest_branch: Vec::new(),
                    node_count: header.node_count,
                    root_seq: NodeSeq::new(header.root_seq),
                    tree_end: header.tree_end,
                    closed: true,
                }),
            },
            attr_bytes,
        ))
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn start_time(&self) -> i64 {
        self.config.tree_start
    }

    /// Latest timestamp covered so far (the final end time once closed).
    pub fn end_time(&self) -> i64 {
        self.state.read().tree_end
    }

    pub fn node_count(&self) -> u32 {
        self.state.read().node_count
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Fetch a node: open nodes come from the latest branch, sealed ones
    /// from the I/O layer (cache or disk).
    fn get_node(&self, seq: NodeSeq) -> Result<Arc<Node>> {
        {
            let state = self.state.read();
            for node in &state.latest_branch {
                if node.seq() == seq {
                    return Ok(Arc::clone(node));
                }
            }
        }
        self.io.read_node(seq)
    }

    // --- Insertion ---

    /// Insert one interval. The interval's end time must not precede the end
    /// of anything already inserted; the state system's transient layer
    /// produces intervals in end-time order by construction.
    pub fn insert(&self, interval: Interval) -> Result<()> {
        let mut sealed = Vec::new();
        let mut state = self.state.write();
        let result = self.insert_locked(&mut state, interval, &mut sealed);
        if sealed.is_empty() {
            return result;
        }
        // Sealed nodes are immutable and already readable through the I/O
        // layer's staging area; their blocks are flushed under a read lock
        // so concurrent queries keep running during the disk writes.
        let state = RwLockWriteGuard::downgrade(state);
        for node in &sealed {
            self.io.write_node(node)?;
        }
        drop(state);
        result
    }

    fn insert_locked(
        &self,
        state: &mut TreeState,
        interval: Interval,
        sealed: &mut Vec<Arc<Node>>,
    ) -> Result<()> {
        if state.closed {
            return Err(HistoryError::TreeClosed);
        }
        if interval.start() < self.config.tree_start {
            return Err(HistoryError::TimeRange {
                time: interval.start(),
                start: self.config.tree_start,
                end: i64::MAX,
            });
        }
        if interval.end() < state.tree_end {
            return Err(HistoryError::internal(format!(
                "interval ending at {} inserted after tree end reached {}",
                interval.end(),
                state.tree_end
            )));
        }
        // A leaf is the roomiest node; an interval that cannot fit a fresh
        // one can never be stored, no matter how often the branch splits.
        let capacity = self
            .config
            .block_size
            .saturating_sub(Node::header_overhead(NodeType::Leaf, self.config.max_children));
        if interval.size_on_disk() > capacity {
            return Err(HistoryError::internal(format!(
                "interval of {} bytes exceeds the {capacity}-byte payload capacity \
                 of a {}-byte block",
                interval.size_on_disk(),
                self.config.block_size
            )));
        }

        let mut index = state.latest_branch.len() - 1;
        loop {
            let target = Arc::clone(&state.latest_branch[index]);
            if interval.size_on_disk() > target.free_space() {
                if target.interval_count() == 0 {
                    // The node is empty, so this is its whole capacity; a
                    // sibling of the same shape would be no roomier.
                    return Err(HistoryError::internal(format!(
                        "interval of {} bytes does not fit an empty node with {} bytes free",
                        interval.size_on_disk(),
                        target.free_space()
                    )));
                }
                self.add_sibling_branch(state, index, sealed)?;
                index = state.latest_branch.len() - 1;
                continue;
            }
            if interval.start() < target.start() {
                // Starts before this node's window; it belongs to an
                // ancestor. The root starts at tree_start, so this always
                // terminates.
                index -= 1;
                continue;
            }
            let end = interval.end();
            target.add_interval(interval)?;
            if end > state.tree_end {
                state.tree_end = end;
            }
            return Ok(());
        }
    }

    fn new_seq(state: &mut TreeState) -> NodeSeq {
        let seq = NodeSeq::new(state.node_count);
        state.node_count += 1;
        seq
    }

    /// Seal `branch[from..]` bottom-up and stage the nodes with the I/O
    /// layer. The caller flushes the blocks once it no longer holds the
    /// tree lock exclusively.
    fn seal_branch_from(
        &self,
        state: &TreeState,
        from: usize,
        end: i64,
        sealed: &mut Vec<Arc<Node>>,
    ) -> Result<()> {
        for node in state.latest_branch[from..].iter().rev() {
            node.seal(end)?;
            self.io.stage_node(node);
            sealed.push(Arc::clone(node));
        }
        Ok(())
    }

    /// Split the latest branch at `index`: seal everything from `index`
    /// down, then spawn a sibling branch starting right after the current
    /// tree end. Climbs (or grows a new root) when the parent is full.
    fn add_sibling_branch(
        &self,
        state: &mut TreeState,
        mut index: usize,
        sealed: &mut Vec<Arc<Node>>,
    ) -> Result<()> {
        while index > 0
            && state.latest_branch[index - 1].child_count() >= self.config.max_children
        {
            index -= 1;
        }
        if index == 0 {
            return self.add_new_root(state, sealed);
        }

        let split_time = state.tree_end;
        let new_start = split_time + 1;
        if state.latest_branch[index].start() > split_time {
            // The node at the split point was itself spawned after the
            // current tree end; sealing it here would truncate it.
            return Err(HistoryError::internal(format!(
                "cannot split at {split_time}: open node starts at {}",
                state.latest_branch[index].start()
            )));
        }
        self.seal_branch_from(state, index, split_time, sealed)?;

        for i in index..state.latest_branch.len() {
            let parent = Arc::clone(&state.latest_branch[i - 1]);
            let seq = Self::new_seq(state);
            let node = match state.latest_branch[i].node_type() {
                NodeType::Core => Node::new_core(
                    seq,
                    Some(parent.seq()),
                    new_start,
                    self.config.block_size,
                    self.config.max_children,
                ),
                NodeType::Leaf => Node::new_leaf(
                    seq,
                    Some(parent.seq()),
                    new_start,
                    self.config.block_size,
                    self.config.max_children,
                ),
            };
            parent.add_child(seq, new_start, self.config.max_children)?;
            state.latest_branch[i] = Arc::new(node);
        }
        Ok(())
    }

    /// The root itself is full: push a new core root above it and rebuild
    /// the latest branch one level deeper.
    fn add_new_root(&self, state: &mut TreeState, sealed: &mut Vec<Arc<Node>>) -> Result<()> {
        let split_time = state.tree_end;
        let new_start = split_time + 1;
        let depth = state.latest_branch.len();
        // Starts are non-decreasing down the branch; checking the leaf
        // covers every node about to be sealed.
        if state.latest_branch[depth - 1].start() > split_time {
            return Err(HistoryError::internal(format!(
                "cannot grow a new root at {split_time}: open leaf starts at {}",
                state.latest_branch[depth - 1].start()
            )));
        }

        let root_seq = Self::new_seq(state);
        let new_root = Arc::new(Node::new_core(
            root_seq,
            None,
            self.config.tree_start,
            self.config.block_size,
            self.config.max_children,
        ));
        let old_root = Arc::clone(&state.latest_branch[0]);
        old_root.set_parent(root_seq);
        self.seal_branch_from(state, 0, split_time, sealed)?;
        new_root.add_child(old_root.seq(), old_root.start(), self.config.max_children)?;
        state.root_seq = root_seq;

        let mut branch = vec![new_root];
        // Core levels of the new branch; one more than before, then the leaf.
        for level in 1..depth {
            let parent = Arc::clone(&branch[level - 1]);
            let seq = Self::new_seq(state);
            let node = Arc::new(Node::new_core(
                seq,
                Some(parent.seq()),
                new_start,
                self.config.block_size,
                self.config.max_children,
            ));
            parent.add_child(seq, new_start, self.config.max_children)?;
            branch.push(node);
        }
        let parent = Arc::clone(&branch[depth - 1]);
        let seq = Self::new_seq(state);
        let leaf = Arc::new(Node::new_leaf(
            seq,
            Some(parent.seq()),
            new_start,
            self.config.block_size,
            self.config.max_children,
        ));
        parent.add_child(seq, new_start, self.config.max_children)?;
        branch.push(leaf);

        state.latest_branch = branch;
        tracing::debug!(depth = depth + 1, "history tree grew a new root");
        Ok(())
    }

    // --- Close ---

    /// Seal every open node at `end_time`, append the attribute region and
    /// write the header. After this the tree only serves queries.
    pub fn close(&self, end_time: i64, attr_bytes: &[u8]) -> Result<()> {
        let mut sealed = Vec::new();
        let mut state = self.state.write();
        if state.closed {
            return Err(HistoryError::TreeClosed);
        }
        // Pin the final end to the requested time so queries never wander
        // into the empty nodes a root split may have left behind.
        state.tree_end = end_time;
        self.seal_branch_from(&state, 0, end_time, &mut sealed)?;
        let node_count = state.node_count;
        let root_seq = state.root_seq.get();
        state.latest_branch.clear();
        state.closed = true;

        // Everything left is immutable; flush under a read lock so queries
        // keep running while the file settles.
        let state = RwLockWriteGuard::downgrade(state);
        for node in &sealed {
            self.io.write_node(node)?;
        }
        let attr_offset = self.io.write_attr_region(node_count, attr_bytes)?;
        self.io.write_header(&FileHeader {
            provider_version: self.config.provider_version,
            block_size: self.config.block_size as u32,
            max_children: self.config.max_children as u32,
            node_count,
            root_seq,
            tree_start: self.config.tree_start,
            tree_end: end_time,
            attr_offset,
            attr_len: attr_bytes.len() as u64,
        })?;
        drop(state);
        tracing::debug!(end_time, node_count, "closed history tree");
        Ok(())
    }

    // --- Queries ---

    fn check_query_time(&self, t: i64) -> Result<(NodeSeq, i64)> {
        let state = self.state.read();
        if t < self.config.tree_start || t > state.tree_end {
            return Err(HistoryError::TimeRange {
                time: t,
                start: self.config.tree_start,
                end: state.tree_end,
            });
        }
        Ok((state.root_seq, state.tree_end))
    }

    /// Last child whose window starts at or before `t`. Child windows are
    /// disjoint, so this is the only child that can cover `t`.
    fn select_child(children: &[ChildLink], t: i64) -> Option<NodeSeq> {
        children
            .iter()
            .take_while(|link| link.start <= t)
            .last()
            .map(|link| link.seq)
    }

    /// The interval of `quark` covering `t`, or `None` if the attribute has
    /// no recorded state there.
    pub fn query_single(&self, quark: Quark, t: i64) -> Result<Option<Interval>> {
        let (root_seq, _) = self.check_query_time(t)?;
        let mut node = self.get_node(root_seq)?;
        loop {
            if let Some(iv) = node.interval_matching(quark, t) {
                return Ok(Some(iv));
            }
            if node.node_type() == NodeType::Leaf {
                return Ok(None);
            }
            match Self::select_child(&node.children(), t) {
                Some(seq) => node = self.get_node(seq)?,
                None => return Ok(None),
            }
        }
    }

    /// Fill `state_info` with the interval of every quark covering `t`, in
    /// one combined root-to-leaf descent. Slots beyond the vector's length
    /// and quarks with no state at `t` are left untouched.
    pub fn query_full(&self, t: i64, state_info: &mut [Option<Interval>]) -> Result<()> {
        let (root_seq, _) = self.check_query_time(t)?;
        let mut node = self.get_node(root_seq)?;
        loop {
            node.write_matching(t, state_info);
            if node.node_type() == NodeType::Leaf {
                return Ok(());
            }
            match Self::select_child(&node.children(), t) {
                Some(seq) => node = self.get_node(seq)?,
                None => return Ok(()),
            }
        }
    }

    /// Every interval matching both conditions, visiting only the subtrees
    /// whose time window intersects the condition. No particular order.
    pub fn query_2d(
        &self,
        quarks: &QuarkSelection,
        times: &TimeRangeCondition,
        cancel: &CancelToken,
    ) -> Result<Vec<Interval>> {
        let (root_seq, tree_end) = {
            let state = self.state.read();
            (state.root_seq, state.tree_end)
        };
        let mut results = Vec::new();
        if !times.intersects(self.config.tree_start, tree_end) {
            return Ok(results);
        }
        let mut stack = vec![root_seq];
        while let Some(seq) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(HistoryError::Cancelled);
            }
            let node = self.get_node(seq)?;
            results.extend(node.intervals_matching(quarks, times));
            if node.node_type() == NodeType::Core {
                let node_end = node.sealed_end().unwrap_or(tree_end);
                let children = node.children();
                for (i, link) in children.iter().enumerate() {
                    let window_end = children
                        .get(i + 1)
                        .map_or(node_end, |next| next.start - 1);
                    if times.intersects(link.start, window_end) {
                        stack.push(link.seq);
                    }
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tracehist_types::{StateValue, IGNORE_PROVIDER_VERSION};

    fn config() -> TreeConfig {
        TreeConfig {
            block_size: 4096,
            max_children: 3,
            provider_version: 2,
            tree_start: 0,
        }
    }

    fn iv(start: i64, end: i64, quark: u32, value: i64) -> Interval {
        Interval::new(start, end, Quark::new(quark), StateValue::Long(value)).unwrap()
    }

    /// Per-quark contiguous segments over [0, total), emitted in end-time
    /// order the way the transient layer produces them.
    fn segments(num_quarks: u32, total: i64, seg_len: i64) -> Vec<Interval> {
        let mut all = Vec::new();
        for q in 0..num_quarks {
            // Stagger the boundaries a bit per quark.
            let mut t = 0i64;
            let mut n = 0i64;
            while t < total {
                let end = (t + seg_len + i64::from(q % 3)).min(total - 1);
                all.push(iv(t, end, q, n));
                t = end + 1;
                n += 1;
            }
        }
        all.sort_by_key(Interval::end);
        all
    }

    #[test]
    fn single_node_insert_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        tree.insert(iv(0, 9, 0, 1)).unwrap();
        tree.insert(iv(10, 19, 0, 2)).unwrap();
        tree.insert(iv(0, 19, 1, 7)).unwrap();
        assert_eq!(tree.end_time(), 19);
        // Queries work while the tree is still building.
        assert_eq!(
            tree.query_single(Quark::new(0), 5).unwrap().unwrap().value(),
            &StateValue::Long(1)
        );
        assert_eq!(
            tree.query_single(Quark::new(0), 10).unwrap().unwrap().value(),
            &StateValue::Long(2)
        );
        assert_eq!(
            tree.query_single(Quark::new(1), 19).unwrap().unwrap().value(),
            &StateValue::Long(7)
        );
        // A quark with no state there is a gap, not an error.
        assert_eq!(tree.query_single(Quark::new(9), 5).unwrap(), None);
    }

    #[test]
    fn query_outside_range_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        tree.insert(iv(0, 10, 0, 1)).unwrap();
        assert!(matches!(
            tree.query_single(Quark::new(0), 11).unwrap_err(),
            HistoryError::TimeRange { time: 11, .. }
        ));
        assert!(matches!(
            tree.query_single(Quark::new(0), -1).unwrap_err(),
            HistoryError::TimeRange { .. }
        ));
    }

    #[test]
    fn closed_tree_rejects_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        tree.insert(iv(0, 5, 0, 1)).unwrap();
        tree.close(10, &[]).unwrap();
        assert!(matches!(
            tree.insert(iv(6, 8, 0, 2)).unwrap_err(),
            HistoryError::TreeClosed
        ));
        assert!(matches!(tree.close(12, &[]).unwrap_err(), HistoryError::TreeClosed));
    }

    #[test]
    fn splits_preserve_every_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ht.dat");
        let tree = HistoryTree::create(&path, config()).unwrap();
        let intervals = segments(8, 4000, 7);
        for interval in &intervals {
            tree.insert(interval.clone()).unwrap();
        }
        // Small blocks and max_children=3 force sibling splits and at least
        // one new root.
        assert!(tree.node_count() > 4, "expected splits, got {} nodes", tree.node_count());
        tree.close(4000, &[]).unwrap();

        for interval in &intervals {
            for t in [interval.start(), interval.end()] {
                let found = tree.query_single(interval.quark(), t).unwrap();
                assert_eq!(found.as_ref(), Some(interval), "quark {} at {t}", interval.quark());
            }
        }
    }

    #[test]
    fn oversized_interval_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        tree.insert(iv(0, 5, 0, 1)).unwrap();
        let big = "x".repeat(5000);
        let oversized =
            Interval::new(0, 10, Quark::new(1), StateValue::Text(big)).unwrap();
        let before = tree.node_count();
        assert!(matches!(
            tree.insert(oversized).unwrap_err(),
            HistoryError::Internal(_)
        ));
        // No wasted sibling branch was spawned.
        assert_eq!(tree.node_count(), before);
        tree.insert(iv(6, 10, 0, 2)).unwrap();
    }

    #[test]
    fn queries_run_while_the_branch_splits() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let tree =
            Arc::new(HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap());
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let tree = Arc::clone(&tree);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                // Time 0 is inside the tree's range from the start; every
                // read must succeed even mid-split, sealed blocks included.
                while !stop.load(Ordering::Acquire) {
                    tree.query_single(Quark::new(0), 0).unwrap();
                }
            })
        };
        let intervals = segments(8, 4000, 7);
        for interval in &intervals {
            tree.insert(interval.clone()).unwrap();
        }
        stop.store(true, Ordering::Release);
        reader.join().unwrap();
        assert!(tree.node_count() > 4);
        assert_eq!(
            tree.query_single(Quark::new(0), 0).unwrap().as_ref(),
            Some(&intervals[0])
        );
    }

    #[test]
    fn reopen_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ht.dat");
        let intervals = segments(4, 1200, 11);
        {
            let tree = HistoryTree::create(&path, config()).unwrap();
            for interval in &intervals {
                tree.insert(interval.clone()).unwrap();
            }
            tree.close(1500, b"attrs").unwrap();
        }
        let (tree, attr_bytes) = HistoryTree::open(&path, 2).unwrap();
        assert_eq!(attr_bytes, b"attrs");
        assert!(tree.is_closed());
        assert_eq!(tree.end_time(), 1500);
        for interval in &intervals {
            let mid = (interval.start() + interval.end()) / 2;
            assert_eq!(
                tree.query_single(interval.quark(), mid).unwrap().as_ref(),
                Some(interval)
            );
        }
    }

    #[test]
    fn reopen_checks_provider_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ht.dat");
        {
            let tree = HistoryTree::create(&path, config()).unwrap();
            tree.insert(iv(0, 5, 0, 1)).unwrap();
            tree.close(5, &[]).unwrap();
        }
        assert!(matches!(
            HistoryTree::open(&path, 3).unwrap_err(),
            HistoryError::VersionMismatch { expected: 3, actual: 2 }
        ));
        assert!(HistoryTree::open(&path, 2).is_ok());
        assert!(HistoryTree::open(&path, IGNORE_PROVIDER_VERSION).is_ok());
    }

    #[test]
    fn query_full_matches_single_queries() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        let intervals = segments(6, 2000, 13);
        for interval in &intervals {
            tree.insert(interval.clone()).unwrap();
        }
        tree.close(2000, &[]).unwrap();
        for t in [0i64, 37, 500, 1234, 1999] {
            let mut full: Vec<Option<Interval>> = vec![None; 6];
            tree.query_full(t, &mut full).unwrap();
            for q in 0..6u32 {
                assert_eq!(
                    full[q as usize],
                    tree.query_single(Quark::new(q), t).unwrap(),
                    "quark {q} at {t}"
                );
            }
        }
    }

    #[test]
    fn query_2d_continuous_and_discrete() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        let intervals = segments(5, 1500, 9);
        for interval in &intervals {
            tree.insert(interval.clone()).unwrap();
        }
        tree.close(1500, &[]).unwrap();

        let quarks = QuarkSelection::new(vec![Quark::new(1), Quark::new(3)]).unwrap();
        let cancel = CancelToken::new();

        let times = TimeRangeCondition::continuous(200, 400);
        let mut got = tree.query_2d(&quarks, &times, &cancel).unwrap();
        let mut want: Vec<Interval> = intervals
            .iter()
            .filter(|iv| quarks.contains(iv.quark()) && times.intersects(iv.start(), iv.end()))
            .cloned()
            .collect();
        got.sort_by_key(|iv| (iv.quark(), iv.start()));
        want.sort_by_key(|iv| (iv.quark(), iv.start()));
        assert_eq!(got, want);

        let times = TimeRangeCondition::discrete(vec![50, 700, 1400]).unwrap();
        let mut got = tree.query_2d(&quarks, &times, &cancel).unwrap();
        let mut want: Vec<Interval> = intervals
            .iter()
            .filter(|iv| quarks.contains(iv.quark()) && times.intersects(iv.start(), iv.end()))
            .cloned()
            .collect();
        got.sort_by_key(|iv| (iv.quark(), iv.start()));
        want.sort_by_key(|iv| (iv.quark(), iv.start()));
        assert_eq!(got, want);
    }

    #[test]
    fn query_2d_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();
        tree.insert(iv(0, 10, 0, 1)).unwrap();
        tree.close(10, &[]).unwrap();
        let quarks = QuarkSelection::new(vec![Quark::new(0)]).unwrap();
        let times = TimeRangeCondition::continuous(0, 10);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            tree.query_2d(&quarks, &times, &cancel).unwrap_err(),
            HistoryError::Cancelled
        ));
    }

    proptest! {
        /// Random per-quark contiguous timelines, inserted in end-time
        /// order: every stored interval must be found again at every
        /// timestamp it covers.
        #[test]
        fn point_queries_are_complete(
            boundaries in proptest::collection::vec(
                proptest::collection::vec(1i64..200, 1..12),
                1..5,
            )
        ) {
            let dir = tempfile::tempdir().unwrap();
            let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();

            let mut all = Vec::new();
            for (q, lens) in boundaries.iter().enumerate() {
                let mut t = 0i64;
                for (n, len) in lens.iter().enumerate() {
                    all.push(iv(t, t + len - 1, q as u32, n as i64));
                    t += len;
                }
            }
            all.sort_by_key(Interval::end);
            let end = all.iter().map(Interval::end).max().unwrap_or(0);
            for interval in &all {
                tree.insert(interval.clone()).unwrap();
            }
            tree.close(end, &[]).unwrap();

            let mut by_quark: BTreeMap<u32, Vec<&Interval>> = BTreeMap::new();
            for interval in &all {
                by_quark.entry(interval.quark().get()).or_default().push(interval);
            }
            for (q, ivs) in &by_quark {
                for interval in ivs {
                    for t in [interval.start(), (interval.start() + interval.end()) / 2, interval.end()] {
                        let got = tree.query_single(Quark::new(*q), t).unwrap();
                        prop_assert_eq!(got.as_ref(), Some(*interval));
                    }
                }
            }
        }

        /// `query_2d` over random quark timelines and random conditions
        /// must return exactly what a brute-force filter of every stored
        /// interval selects.
        #[test]
        fn range_queries_match_oracle(
            boundaries in proptest::collection::vec(
                proptest::collection::vec(1i64..200, 1..12),
                1..5,
            ),
            lo in 0i64..600,
            span in 0i64..400,
            instants in proptest::collection::vec(0i64..600, 1..8),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let tree = HistoryTree::create(&dir.path().join("ht.dat"), config()).unwrap();

            let mut all = Vec::new();
            for (q, lens) in boundaries.iter().enumerate() {
                let mut t = 0i64;
                for (n, len) in lens.iter().enumerate() {
                    all.push(iv(t, t + len - 1, q as u32, n as i64));
                    t += len;
                }
            }
            all.sort_by_key(Interval::end);
            let end = all.iter().map(Interval::end).max().unwrap_or(0);
            for interval in &all {
                tree.insert(interval.clone()).unwrap();
            }
            tree.close(end, &[]).unwrap();

            let quarks = QuarkSelection::new(
                (0..boundaries.len() as u32).map(Quark::new).collect(),
            )
            .unwrap();
            let cancel = CancelToken::new();
            let conditions = [
                TimeRangeCondition::continuous(lo, lo + span),
                TimeRangeCondition::discrete(instants).unwrap(),
            ];
            for times in &conditions {
                let mut got = tree.query_2d(&quarks, times, &cancel).unwrap();
                let mut want: Vec<Interval> = all
                    .iter()
                    .filter(|iv| {
                        quarks.contains(iv.quark()) && times.intersects(iv.start(), iv.end())
                    })
                    .cloned()
                    .collect();
                got.sort_by_key(|iv| (iv.quark(), iv.start()));
                want.sort_by_key(|iv| (iv.quark(), iv.start()));
                prop_assert_eq!(got, want);
            }
        }
    }
}
