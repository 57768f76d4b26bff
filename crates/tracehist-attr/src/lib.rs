//! Attribute tree: maps hierarchical string paths to dense integer quarks.
//!
//! Attributes form a tree rooted at an implicit, unnamed root. Each created
//! attribute is assigned the next quark in sequence; a quark, once assigned,
//! never changes and never refers to a different path. The mapping is
//! serialized alongside the history tree so a reopened file resolves the same
//! paths to the same quarks.
//!
//! The tree itself is not synchronized. Callers that share it across threads
//! wrap it in a lock; readers of a finished (closed) history can share it
//! freely behind a shared reference.

use std::collections::HashMap;

use tracehist_error::{HistoryError, Result};
use tracehist_types::Quark;

/// Separator used when rendering a full attribute path as a single string.
pub const PATH_SEPARATOR: char = '/';

#[derive(Debug, Clone)]
struct AttrNode {
    name: String,
    parent: Option<Quark>,
    children: HashMap<String, Quark>,
}

/// The attribute tree. Quarks index directly into the internal node vector.
#[derive(Debug, Clone, Default)]
pub struct AttributeTree {
    nodes: Vec<AttrNode>,
    /// Children of the implicit root.
    roots: HashMap<String, Quark>,
}

impl AttributeTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attributes created so far. Valid quarks are `0..count`.
    #[must_use]
    pub fn num_attributes(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, quark: Quark) -> Result<&AttrNode> {
        self.nodes
            .get(quark.index())
            .ok_or(HistoryError::QuarkOutOfRange {
                quark: quark.get(),
                count: self.nodes.len(),
            })
    }

    fn check_path(path: &[&str]) -> Result<()> {
        if path.is_empty() || path.iter().any(|seg| seg.is_empty()) {
            return Err(HistoryError::EmptyPathSegment);
        }
        Ok(())
    }

    fn child_of(&self, base: Option<Quark>, name: &str) -> Result<Option<Quark>> {
        let map = match base {
            None => &self.roots,
            Some(q) => &self.node(q)?.children,
        };
        Ok(map.get(name).copied())
    }

    /// Resolve `path` relative to `base` (`None` for the root), creating any
    /// missing attributes along the way. Returns the quark of the last
    /// segment. Creation is the only way quarks are assigned; repeated calls
    /// with the same path return the same quark.
    pub fn get_quark_and_add(&mut self, base: Option<Quark>, path: &[&str]) -> Result<Quark> {
        Self::check_path(path)?;
        let mut cursor = base;
        if let Some(q) = cursor {
            // Fail before creating anything if the base itself is bad.
            self.node(q)?;
        }
        for segment in path {
            let next = match self.child_of(cursor, segment)? {
                Some(q) => q,
                None => self.create_child(cursor, segment),
            };
            cursor = Some(next);
        }
        // `path` is non-empty, so the cursor has advanced at least once.
        cursor.ok_or_else(|| HistoryError::internal("empty path slipped through validation"))
    }

    fn create_child(&mut self, parent: Option<Quark>, name: &str) -> Quark {
        let quark = Quark::new(self.nodes.len() as u32);
        self.nodes.push(AttrNode {
            name: name.to_owned(),
            parent,
            children: HashMap::new(),
        });
        let map = match parent {
            None => &mut self.roots,
            // Parent was validated by the caller.
            Some(p) => &mut self.nodes[p.index()].children,
        };
        map.insert(name.to_owned(), quark);
        tracing::trace!(quark = quark.get(), name, "created attribute");
        quark
    }

    /// Resolve `path` relative to `base` without creating anything. Returns
    /// `Ok(None)` when some segment does not exist.
    pub fn opt_quark(&self, base: Option<Quark>, path: &[&str]) -> Result<Option<Quark>> {
        Self::check_path(path)?;
        let mut cursor = base;
        if let Some(q) = cursor {
            self.node(q)?;
        }
        for segment in path {
            match self.child_of(cursor, segment)? {
                Some(q) => cursor = Some(q),
                None => return Ok(None),
            }
        }
        Ok(cursor)
    }

    /// Like [`opt_quark`](Self::opt_quark) but a missing attribute is an error.
    pub fn get_quark(&self, base: Option<Quark>, path: &[&str]) -> Result<Quark> {
        self.opt_quark(base, path)?
            .ok_or_else(|| HistoryError::AttributeNotFound {
                path: path.join(&PATH_SEPARATOR.to_string()),
            })
    }

    /// Quarks of the direct (or, with `recursive`, all transitive) children
    /// of `base`. `None` means the implicit root. Order is by quark value.
    pub fn sub_attributes(&self, base: Option<Quark>, recursive: bool) -> Result<Vec<Quark>> {
        let mut out = Vec::new();
        let direct: Vec<Quark> = match base {
            None => self.roots.values().copied().collect(),
            Some(q) => self.node(q)?.children.values().copied().collect(),
        };
        let mut stack = direct;
        while let Some(q) = stack.pop() {
            out.push(q);
            if recursive {
                stack.extend(self.nodes[q.index()].children.values().copied());
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Parent quark of `quark`, or `None` for a top-level attribute.
    pub fn parent_quark(&self, quark: Quark) -> Result<Option<Quark>> {
        Ok(self.node(quark)?.parent)
    }

    /// Base name (last path segment) of `quark`.
    pub fn attribute_name(&self, quark: Quark) -> Result<&str> {
        Ok(&self.node(quark)?.name)
    }

    /// Full path of `quark`, root-first.
    pub fn full_path(&self, quark: Quark) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut cursor = Some(quark);
        while let Some(q) = cursor {
            let node = self.node(q)?;
            segments.push(node.name.clone());
            cursor = node.parent;
        }
        segments.reverse();
        Ok(segments)
    }

    /// Full path rendered as a single `/`-joined string.
    pub fn full_path_string(&self, quark: Quark) -> Result<String> {
        Ok(self.full_path(quark)?.join(&PATH_SEPARATOR.to_string()))
    }

    /// Serialize the tree. Nodes are written in quark order as
    /// `(parent raw u32, name length u32, name bytes)`, little-endian, with a
    /// leading count. Parent `u32::MAX` marks a top-level attribute.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for node in &self.nodes {
            let parent_raw = node.parent.map_or(u32::MAX, Quark::get);
            buf.extend_from_slice(&parent_raw.to_le_bytes());
            buf.extend_from_slice(&(node.name.len() as u32).to_le_bytes());
            buf.extend_from_slice(node.name.as_bytes());
        }
        buf
    }

    /// Rebuild a tree from [`to_bytes`](Self::to_bytes) output. Parents must
    /// precede children, which quark-order serialization guarantees.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let count = read_u32(buf, &mut pos)? as usize;
        let mut tree = Self::new();
        for i in 0..count {
            let parent_raw = read_u32(buf, &mut pos)?;
            let name_len = read_u32(buf, &mut pos)? as usize;
            let end = pos
                .checked_add(name_len)
                .filter(|&e| e <= buf.len())
                .ok_or_else(|| HistoryError::corrupt("attribute name overruns buffer"))?;
            let name = std::str::from_utf8(&buf[pos..end])
                .map_err(|_| HistoryError::corrupt("attribute name is not valid UTF-8"))?
                .to_owned();
            pos = end;
            let parent = if parent_raw == u32::MAX {
                None
            } else if (parent_raw as usize) < i {
                Some(Quark::new(parent_raw))
            } else {
                return Err(HistoryError::corrupt(format!(
                    "attribute {i} references forward parent {parent_raw}"
                )));
            };
            let quark = Quark::new(i as u32);
            tree.nodes.push(AttrNode {
                name: name.clone(),
                parent,
                children: HashMap::new(),
            });
            let map = match parent {
                None => &mut tree.roots,
                Some(p) => &mut tree.nodes[p.index()].children,
            };
            if map.insert(name, quark).is_some() {
                return Err(HistoryError::corrupt(format!(
                    "duplicate sibling name for attribute {i}"
                )));
            }
        }
        if pos != buf.len() {
            return Err(HistoryError::corrupt(format!(
                "{} trailing bytes after attribute tree",
                buf.len() - pos
            )));
        }
        Ok(tree)
    }
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
