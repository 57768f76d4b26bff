//! Block I/O for the history file.
//!
//! The file is a 4 KiB header, `node_count` fixed-size node blocks addressed
//! by sequence number, and a trailing attribute region written at close time.
//! Reads go through a small direct-mapped cache of decoded nodes keyed by
//! sequence number.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use tracehist_error::{HistoryError, Result};
use tracehist_types::{NodeSeq, TreeConfig, HEADER_SIZE, IGNORE_PROVIDER_VERSION};

use crate::node::Node;

/// Identifies a tracehist history file.
const FILE_MAGIC: u32 = 0x7453_4854;

/// Bumped on any incompatible change to the on-disk layout.
pub const FILE_VERSION: u32 = 1;

/// Number of slots in the direct-mapped node cache.
const CACHE_SLOTS: usize = 256;

/// Everything persisted in the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub provider_version: u32,
    pub block_size: u32,
    pub max_children: u32,
    pub node_count: u32,
    pub root_seq: u32,
    pub tree_start: i64,
    pub tree_end: i64,
    pub attr_offset: u64,
    pub attr_len: u64,
}

impl FileHeader {
    /// Serialized length of the meaningful prefix; the rest of the header
    /// block is zero padding.
    const ENCODED_LEN: usize = 4 * 6 + 4 + 8 * 2 + 8 * 2;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&FILE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.provider_version.to_le_bytes());
        buf.extend_from_slice(&self.block_size.to_le_bytes());
        buf.extend_from_slice(&self.max_children.to_le_bytes());
        buf.extend_from_slice(&self.node_count.to_le_bytes());
        buf.extend_from_slice(&self.root_seq.to_le_bytes());
        buf.extend_from_slice(&self.tree_start.to_le_bytes());
        buf.extend_from_slice(&self.tree_end.to_le_bytes());
        buf.extend_from_slice(&self.attr_offset.to_le_bytes());
        buf.extend_from_slice(&self.attr_len.to_le_bytes());
        debug_assert_eq!(buf.len(), Self::ENCODED_LEN);
        buf.resize(HEADER_SIZE, 0);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(HistoryError::ShortRead {
                expected: Self::ENCODED_LEN,
                actual: buf.len(),
            });
        }
        let mut pos = 0usize;
        let magic = read_u32(buf, &mut pos);
        if magic != FILE_MAGIC {
            return Err(HistoryError::corrupt(format!(
                "bad magic number {magic:#010x}"
            )));
        }
        let file_version = read_u32(buf, &mut pos);
        if file_version != FILE_VERSION {
            return Err(HistoryError::VersionMismatch {
                expected: FILE_VERSION,
                actual: file_version,
            });
        }
        Ok(Self {
            provider_version: read_u32(buf, &mut pos),
            block_size: read_u32(buf, &mut pos),
            max_children: read_u32(buf, &mut pos),
            node_count: read_u32(buf, &mut pos),
            root_seq: read_u32(buf, &mut pos),
            tree_start: read_i64(buf, &mut pos),
            tree_end: read_i64(buf, &mut pos),
            attr_offset: read_u64(buf, &mut pos),
            attr_len: read_u64(buf, &mut pos),
        })
    }

    /// Check the persisted provider version against what the caller expects.
    /// `IGNORE_PROVIDER_VERSION` accepts anything.
    pub fn check_provider_version(&self, expected: u32) -> Result<()> {
        if expected != IGNORE_PROVIDER_VERSION && expected != self.provider_version {
            return Err(HistoryError::VersionMismatch {
                expected,
                actual: self.provider_version,
            });
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], pos: &mut usize) -> u32 {
    // Caller has bounds-checked via ENCODED_LEN.
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[*pos..*pos + 4]);
    *pos += 4;
    u32::from_le_bytes(b)
}

fn read_i64(buf: &[u8], pos: &mut usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    i64::from_le_bytes(b)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    u64::from_le_bytes(b)
}

/// Handle on the history file. One writer thread and any number of query
/// threads share it; the file handle is serialized behind a mutex, the node
/// cache has per-slot locks.
pub struct TreeIo {
    file: Mutex<File>,
    block_size: usize,
    max_children: usize,
    cache: Vec<Mutex<Option<Arc<Node>>>>,
    /// Sealed nodes whose blocks have not been written yet. Keeps them
    /// readable even if a cache collision evicts them before the flush.
    staged: Mutex<HashMap<u32, Arc<Node>>>,
}

impl std::fmt::Debug for TreeIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeIo")
            .field("block_size", &self.block_size)
            .field("max_children", &self.max_children)
            .finish_non_exhaustive()
    }
}

impl TreeIo {
    fn with_file(file: File, config: &TreeConfig) -> Self {
        let mut cache = Vec::with_capacity(CACHE_SLOTS);
        cache.resize_with(CACHE_SLOTS, || Mutex::new(None));
        Self {
            file: Mutex::new(file),
            block_size: config.block_size,
            max_children: config.max_children,
            cache,
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or truncate) a history file for a fresh tree.
    pub fn create(path: &Path, config: &TreeConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_file(file, config))
    }

    /// Open an existing history file and verify its header. Returns the I/O
    /// handle along with the parsed header.
    pub fn open(path: &Path, expected_provider_version: u32) -> Result<(Self, FileHeader)> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let mut buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut buf)?;
        let header = FileHeader::from_bytes(&buf)?;
        header.check_provider_version(expected_provider_version)?;
        let config = TreeConfig {
            block_size: header.block_size as usize,
            max_children: header.max_children as usize,
            provider_version: header.provider_version,
            tree_start: header.tree_start,
        };
        config.validate()?;
        let expected_len =
            HEADER_SIZE as u64 + u64::from(header.node_count) * header.block_size as u64;
        let actual_len = file.metadata()?.len();
        if actual_len < expected_len {
            return Err(HistoryError::corrupt(format!(
                "file is {actual_len} bytes, header implies at least {expected_len}"
            )));
        }
        Ok((Self::with_file(file, &config), header))
    }

    fn node_offset(&self, seq: NodeSeq) -> u64 {
        HEADER_SIZE as u64 + u64::from(seq.get()) * self.block_size as u64
    }

    /// Make a sealed node readable before its block reaches disk. The
    /// caller must follow up with [`write_node`](Self::write_node).
    pub fn stage_node(&self, node: &Arc<Node>) {
        let slot = node.seq().get() as usize % CACHE_SLOTS;
        *self.cache[slot].lock() = Some(Arc::clone(node));
        self.staged.lock().insert(node.seq().get(), Arc::clone(node));
    }

    /// Write a node's block to disk, refresh the cache slot and clear any
    /// staging entry.
    pub fn write_node(&self, node: &Arc<Node>) -> Result<()> {
        let bytes = node.to_bytes(self.block_size, self.max_children)?;
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.node_offset(node.seq())))?;
            file.write_all(&bytes)?;
        }
        let slot = node.seq().get() as usize % CACHE_SLOTS;
        *self.cache[slot].lock() = Some(Arc::clone(node));
        self.staged.lock().remove(&node.seq().get());
        Ok(())
    }

    /// Read a node by sequence number, consulting the cache and the staging
    /// area before the file.
    pub fn read_node(&self, seq: NodeSeq) -> Result<Arc<Node>> {
        let slot = seq.get() as usize % CACHE_SLOTS;
        {
            let cached = self.cache[slot].lock();
            if let Some(node) = cached.as_ref() {
                if node.seq() == seq {
                    return Ok(Arc::clone(node));
                }
            }
        }
        if let Some(node) = self.staged.lock().get(&seq.get()) {
            return Ok(Arc::clone(node));
        }
        let mut buf = vec![0u8; self.block_size];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(self.node_offset(seq)))?;
            file.read_exact(&mut buf)?;
        }
        let node = Arc::new(Node::from_bytes(&buf, self.block_size, self.max_children)?);
        if node.seq() != seq {
            return Err(HistoryError::corrupt(format!(
                "block for node {seq} contains sequence number {}",
                node.seq()
            )));
        }
        *self.cache[slot].lock() = Some(Arc::clone(&node));
        Ok(node)
    }

    /// Write the header block at offset 0.
    pub fn write_header(&self, header: &FileHeader) -> Result<()> {
        let bytes = header.to_bytes();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Append the attribute region after the last node block. Returns its
    /// offset, for the header.
    pub fn write_attr_region(&self, node_count: u32, bytes: &[u8]) -> Result<u64> {
        let offset = HEADER_SIZE as u64 + u64::from(node_count) * self.block_size as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(offset)
    }

    /// Read the attribute region described by the header.
    pub fn read_attr_region(&self, header: &FileHeader) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; header.attr_len as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(header.attr_offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}
