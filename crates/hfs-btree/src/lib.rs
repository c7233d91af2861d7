#![forbid(unsafe_code)]
//! HFS B-tree engine.
//!
//! Search, insert, split, merge, and ordered scans over the fixed 512-byte
//! node trees used by the catalog and extents-overflow files.
//!
//! The tree file is an arena of nodes addressed by index. Node 0 is the
//! header node: header record, a reserved record, and the node-allocation
//! bitmap. When the tree file outgrows the 2048 nodes that bitmap covers,
//! map nodes chained from the header node's forward link extend it. Leaves
//! and index nodes at the same height are doubly linked through their
//! descriptors.
//!
//! Key ordering is a strategy type implementing [`KeyOrder`]; the engine
//! never inspects key bytes itself. All node I/O goes through a
//! [`NodeStore`], which also decides whether the tree file may grow.

pub mod node;

pub use node::{
    NODE_DESCRIPTOR_SIZE, Node, NodeKind, index_child, index_record, leaf_record, record_data,
    record_key,
};

use hfs_error::{HfsError, Result};
use hfs_types::{BTREE_NODE_SIZE, ParseError, put_be_u16, put_be_u32, read_be_u16, read_be_u32};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::marker::PhantomData;
use tracing::{debug, error, trace};

// ── Constants ───────────────────────────────────────────────────────────────

pub const NODE_SIZE: usize = BTREE_NODE_SIZE;

pub const HEADER_RECORD_SIZE: usize = 106;
const HEADER_RESERVED_SIZE: usize = 128;
const HEADER_MAP_SIZE: usize = 256;
/// 512 - descriptor - two offsets.
const MAP_NODE_RECORD_SIZE: usize = NODE_SIZE - NODE_DESCRIPTOR_SIZE - 4;

/// Largest leaf record accepted; any two such records fit in one node.
pub const MAX_RECORD_SIZE: usize = (NODE_SIZE - NODE_DESCRIPTOR_SIZE - 6) / 2;

const MAX_DEPTH: u16 = 8;

// ── Strategy traits ─────────────────────────────────────────────────────────

/// Total order over key bodies (the bytes after the key-length byte).
///
/// Index records pad keys with zeros up to `MAX_KEY_LEN`, so `compare`
/// must ignore trailing padding.
pub trait KeyOrder {
    const MAX_KEY_LEN: u8;
    const NAME: &'static str;

    fn compare(a: &[u8], b: &[u8]) -> Ordering;

    fn describe(key: &[u8]) -> String {
        key.iter().fold(String::new(), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }
}

/// Node-addressed storage for one tree file.
pub trait NodeStore {
    fn read_node(&mut self, index: u32) -> Result<Vec<u8>>;

    fn write_node(&mut self, index: u32, data: &[u8]) -> Result<()>;

    /// Nodes the tree file can hold right now.
    fn node_capacity(&self) -> u32;

    /// Extend the tree file to at least `min_nodes`; returns the new capacity.
    fn grow(&mut self, min_nodes: u32) -> Result<u32>;
}

/// Vec-backed store used for scratch trees and tests.
#[derive(Debug, Clone, Default)]
pub struct MemNodeStore {
    nodes: Vec<Vec<u8>>,
    max_nodes: u32,
    writes: usize,
}

impl MemNodeStore {
    #[must_use]
    pub fn new(initial_nodes: u32, max_nodes: u32) -> Self {
        Self {
            nodes: vec![vec![0_u8; NODE_SIZE]; initial_nodes as usize],
            max_nodes,
            writes: 0,
        }
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl NodeStore for MemNodeStore {
    fn read_node(&mut self, index: u32) -> Result<Vec<u8>> {
        self.nodes.get(index as usize).cloned().ok_or_else(|| {
            HfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("node {index} past end of tree file"),
            ))
        })
    }

    fn write_node(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let slot = self.nodes.get_mut(index as usize).ok_or_else(|| {
            HfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("node {index} past end of tree file"),
            ))
        })?;
        slot.clear();
        slot.extend_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn node_capacity(&self) -> u32 {
        u32::try_from(self.nodes.len()).unwrap_or(u32::MAX)
    }

    fn grow(&mut self, min_nodes: u32) -> Result<u32> {
        if min_nodes > self.max_nodes {
            return Err(HfsError::NoSpace);
        }
        if (min_nodes as usize) > self.nodes.len() {
            self.nodes.resize(min_nodes as usize, vec![0_u8; NODE_SIZE]);
        }
        Ok(self.node_capacity())
    }
}

// ── Header record ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub depth: u16,
    pub root: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_len: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
}

impl HeaderRecord {
    pub fn parse(data: &[u8]) -> std::result::Result<Self, ParseError> {
        Ok(Self {
            depth: read_be_u16(data, 0)?,
            root: read_be_u32(data, 2)?,
            leaf_records: read_be_u32(data, 6)?,
            first_leaf: read_be_u32(data, 10)?,
            last_leaf: read_be_u32(data, 14)?,
            node_size: read_be_u16(data, 18)?,
            max_key_len: read_be_u16(data, 20)?,
            total_nodes: read_be_u32(data, 22)?,
            free_nodes: read_be_u32(data, 26)?,
        })
    }

    #[must_use]
    pub fn serialize(&self) -> [u8; HEADER_RECORD_SIZE] {
        let mut buf = [0_u8; HEADER_RECORD_SIZE];
        put_be_u16(&mut buf, 0, self.depth);
        put_be_u32(&mut buf, 2, self.root);
        put_be_u32(&mut buf, 6, self.leaf_records);
        put_be_u32(&mut buf, 10, self.first_leaf);
        put_be_u32(&mut buf, 14, self.last_leaf);
        put_be_u16(&mut buf, 18, self.node_size);
        put_be_u16(&mut buf, 20, self.max_key_len);
        put_be_u32(&mut buf, 22, self.total_nodes);
        put_be_u32(&mut buf, 26, self.free_nodes);
        buf
    }
}

// ── Tree handle ─────────────────────────────────────────────────────────────

/// A leaf record split into key body and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// Counts gathered by [`BTree::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    pub depth: u16,
    pub index_nodes: u32,
    pub leaf_nodes: u32,
    pub map_nodes: u32,
    pub records: u32,
}

/// Index-record rewrites `(slot, new_first_key)` and an optional slot
/// removal, addressed to a parent node.
type ParentEdits = (Vec<(usize, Vec<u8>)>, Option<usize>);

#[derive(Debug)]
struct Step {
    index: u32,
    node: Node,
    /// Chosen child for index nodes; unused at the leaf.
    slot: usize,
}

/// In-memory state of one open tree: header record and allocation map.
#[derive(Debug, Clone)]
pub struct BTree<K: KeyOrder> {
    header: HeaderRecord,
    map: Vec<u8>,
    map_nodes: Vec<u32>,
    _order: PhantomData<fn() -> K>,
}

fn corrupt(node: u32, detail: impl Into<String>) -> HfsError {
    HfsError::Corruption {
        block: u64::from(node),
        detail: detail.into(),
    }
}

fn first_key(index: u32, node: &Node) -> Result<Vec<u8>> {
    let rec = node
        .records
        .first()
        .ok_or_else(|| corrupt(index, "empty node has no first key"))?;
    Ok(record_key(index, rec)?.to_vec())
}

fn keys_of(index: u32, node: &Node) -> Result<Vec<&[u8]>> {
    node.records
        .iter()
        .map(|rec| record_key(index, rec))
        .collect()
}

fn entry_at(index: u32, node: &Node, pos: usize) -> Result<LeafEntry> {
    let rec = &node.records[pos];
    Ok(LeafEntry {
        key: record_key(index, rec)?.to_vec(),
        data: record_data(index, rec)?.to_vec(),
    })
}

fn bit_is_set(map: &[u8], bit: usize) -> bool {
    map.get(bit / 8).is_some_and(|b| b & (0x80 >> (bit % 8)) != 0)
}

fn set_bit(map: &mut [u8], bit: usize, value: bool) {
    if let Some(b) = map.get_mut(bit / 8) {
        if value {
            *b |= 0x80 >> (bit % 8);
        } else {
            *b &= !(0x80 >> (bit % 8));
        }
    }
}

impl<K: KeyOrder> BTree<K> {
    /// Initialise an empty tree over every node the store currently holds.
    pub fn create(store: &mut dyn NodeStore) -> Result<Self> {
        let total = store.node_capacity();
        if total == 0 {
            return Err(HfsError::NoSpace);
        }
        let mut tree = Self {
            header: HeaderRecord {
                node_size: NODE_SIZE as u16,
                max_key_len: u16::from(K::MAX_KEY_LEN),
                total_nodes: total,
                free_nodes: total - 1,
                ..HeaderRecord::default()
            },
            map: vec![0_u8; HEADER_MAP_SIZE],
            map_nodes: Vec::new(),
            _order: PhantomData,
        };
        set_bit(&mut tree.map, 0, true);
        tree.cover_map()?;
        tree.save(store)?;
        debug!(tree = K::NAME, total_nodes = total, "btree_created");
        Ok(tree)
    }

    /// Load the header node and the map-node chain.
    pub fn open(store: &mut dyn NodeStore) -> Result<Self> {
        let raw = store.read_node(0)?;
        let head = Node::parse(0, &raw)?;
        if head.kind != NodeKind::Header || head.records.len() < 3 {
            error!(tree = K::NAME, kind = ?head.kind, records = head.records.len(), "btree_invariant_violation");
            return Err(corrupt(0, format!("{} node 0 is not a header node", K::NAME)));
        }
        let header =
            HeaderRecord::parse(&head.records[0]).map_err(|e| corrupt(0, e.to_string()))?;

        if usize::from(header.node_size) != NODE_SIZE {
            return Err(corrupt(0, format!("node size {} != {NODE_SIZE}", header.node_size)));
        }
        if header.max_key_len != u16::from(K::MAX_KEY_LEN) {
            return Err(corrupt(
                0,
                format!("{} max key length {} != {}", K::NAME, header.max_key_len, K::MAX_KEY_LEN),
            ));
        }
        if header.free_nodes >= header.total_nodes
            || header.total_nodes > store.node_capacity()
            || header.root >= header.total_nodes
            || (header.depth == 0) != (header.root == 0)
            || header.depth > MAX_DEPTH
        {
            error!(tree = K::NAME, ?header, capacity = store.node_capacity(), "btree_invariant_violation");
            return Err(corrupt(0, format!("{} header record inconsistent", K::NAME)));
        }

        let mut map = head.records[2].clone();
        let mut map_nodes = Vec::new();
        let mut next = head.flink;
        while next != 0 {
            if next >= header.total_nodes || map_nodes.len() as u32 >= header.total_nodes {
                return Err(corrupt(next, "map node chain leaves the tree file"));
            }
            let node = Node::parse(next, &store.read_node(next)?)?;
            if node.kind != NodeKind::Map || node.records.is_empty() {
                return Err(corrupt(next, "expected a map node"));
            }
            map.extend_from_slice(&node.records[0]);
            map_nodes.push(next);
            next = node.flink;
        }
        if map.len() * 8 < header.total_nodes as usize {
            return Err(corrupt(0, "allocation map shorter than tree file"));
        }

        trace!(tree = K::NAME, depth = header.depth, root = header.root, records = header.leaf_records, "btree_open");
        Ok(Self {
            header,
            map,
            map_nodes,
            _order: PhantomData,
        })
    }

    #[must_use]
    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    #[must_use]
    pub fn len(&self) -> u32 {
        self.header.leaf_records
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.depth == 0
    }

    // ── Node I/O ────────────────────────────────────────────────────────────

    fn read(&self, store: &mut dyn NodeStore, index: u32) -> Result<Node> {
        if index == 0 || index >= self.header.total_nodes {
            error!(tree = K::NAME, node = index, total = self.header.total_nodes, "btree_invariant_violation");
            return Err(corrupt(index, format!("{} node pointer out of range", K::NAME)));
        }
        Node::parse(index, &store.read_node(index)?)
    }

    fn write(store: &mut dyn NodeStore, index: u32, node: &Node) -> Result<()> {
        store.write_node(index, &node.serialize(index, NODE_SIZE)?)
    }

    fn expect_shape(index: u32, node: &Node, height: u8, is_root: bool) -> Result<()> {
        let kind = if height == 1 {
            NodeKind::Leaf
        } else {
            NodeKind::Index
        };
        if node.kind != kind || node.height != height {
            error!(
                tree = K::NAME,
                node = index,
                expected_height = height,
                got_height = node.height,
                kind = ?node.kind,
                "btree_invariant_violation"
            );
            return Err(corrupt(
                index,
                format!("{} node has kind {:?} height {}, expected {kind:?} height {height}", K::NAME, node.kind, node.height),
            ));
        }
        if node.records.is_empty() && !is_root {
            return Err(corrupt(index, format!("{} non-root node is empty", K::NAME)));
        }
        Ok(())
    }

    fn root_height(&self) -> Result<u8> {
        u8::try_from(self.header.depth).map_err(|_| corrupt(0, "tree depth overflow"))
    }

    /// Root-to-leaf path for `key`, choosing at each index node the last
    /// entry whose key is <= `key` (the first entry when none is).
    fn descend(&self, store: &mut dyn NodeStore, key: &[u8]) -> Result<Vec<Step>> {
        let mut height = self.root_height()?;
        let mut index = self.header.root;
        let mut path = Vec::with_capacity(usize::from(height));
        loop {
            let node = self.read(store, index)?;
            Self::expect_shape(index, &node, height, path.is_empty())?;
            if height == 1 {
                path.push(Step { index, node, slot: 0 });
                return Ok(path);
            }
            let slot = {
                let keys = keys_of(index, &node)?;
                keys.partition_point(|k| K::compare(k, key) != Ordering::Greater)
                    .saturating_sub(1)
            };
            let child = index_child(index, &node.records[slot])?;
            path.push(Step { index, node, slot });
            index = child;
            height -= 1;
        }
    }

    fn leaf_search(index: u32, node: &Node, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let keys = keys_of(index, node)?;
        Ok(keys.binary_search_by(|k| K::compare(k, key)))
    }

    // ── Search and cursors ──────────────────────────────────────────────────

    /// Exact-match lookup; returns the record data.
    pub fn search(&self, store: &mut dyn NodeStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let path = self.descend(store, key)?;
        let Some(leaf) = path.last() else {
            return Ok(None);
        };
        match Self::leaf_search(leaf.index, &leaf.node, key)? {
            Ok(pos) => Ok(Some(record_data(leaf.index, &leaf.node.records[pos])?.to_vec())),
            Err(_) => Ok(None),
        }
    }

    /// First record at or after the leaf position `pick` selects, following
    /// the forward link when the position falls off the end of the leaf.
    fn forward_from(
        &self,
        store: &mut dyn NodeStore,
        key: &[u8],
        inclusive: bool,
    ) -> Result<Option<LeafEntry>> {
        if self.is_empty() {
            return Ok(None);
        }
        let path = self.descend(store, key)?;
        let Some(leaf) = path.last() else {
            return Ok(None);
        };
        let pos = {
            let keys = keys_of(leaf.index, &leaf.node)?;
            keys.partition_point(|k| match K::compare(k, key) {
                Ordering::Less => true,
                Ordering::Equal => !inclusive,
                Ordering::Greater => false,
            })
        };
        if pos < leaf.node.records.len() {
            return entry_at(leaf.index, &leaf.node, pos).map(Some);
        }
        let next = leaf.node.flink;
        if next == 0 {
            return Ok(None);
        }
        let node = self.read(store, next)?;
        Self::expect_shape(next, &node, 1, false)?;
        entry_at(next, &node, 0).map(Some)
    }

    /// Smallest record with key >= `key`.
    pub fn seek_ge(&self, store: &mut dyn NodeStore, key: &[u8]) -> Result<Option<LeafEntry>> {
        self.forward_from(store, key, true)
    }

    /// Smallest record with key > `key`; drives resumable iteration.
    pub fn next_after(&self, store: &mut dyn NodeStore, key: &[u8]) -> Result<Option<LeafEntry>> {
        self.forward_from(store, key, false)
    }

    /// Largest record with key <= `key`.
    pub fn search_le(&self, store: &mut dyn NodeStore, key: &[u8]) -> Result<Option<LeafEntry>> {
        if self.is_empty() {
            return Ok(None);
        }
        let path = self.descend(store, key)?;
        let Some(leaf) = path.last() else {
            return Ok(None);
        };
        let pos = {
            let keys = keys_of(leaf.index, &leaf.node)?;
            keys.partition_point(|k| K::compare(k, key) != Ordering::Greater)
        };
        if pos > 0 {
            return entry_at(leaf.index, &leaf.node, pos - 1).map(Some);
        }
        let prev = leaf.node.blink;
        if prev == 0 {
            return Ok(None);
        }
        let node = self.read(store, prev)?;
        Self::expect_shape(prev, &node, 1, false)?;
        entry_at(prev, &node, node.records.len() - 1).map(Some)
    }

    /// Visit every leaf record in key order.
    pub fn walk(
        &self,
        store: &mut dyn NodeStore,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut next = self.header.first_leaf;
        let mut hops = 0_u32;
        while next != 0 {
            hops += 1;
            if hops > self.header.total_nodes {
                return Err(corrupt(next, format!("{} leaf chain loops", K::NAME)));
            }
            let node = self.read(store, next)?;
            Self::expect_shape(next, &node, 1, self.header.depth == 1)?;
            for rec in &node.records {
                visit(record_key(next, rec)?, record_data(next, rec)?)?;
            }
            next = node.flink;
        }
        Ok(())
    }

    /// All leaf records in key order.
    pub fn entries(&self, store: &mut dyn NodeStore) -> Result<Vec<LeafEntry>> {
        let mut out = Vec::with_capacity(self.header.leaf_records as usize);
        self.walk(store, &mut |key, data| {
            out.push(LeafEntry {
                key: key.to_vec(),
                data: data.to_vec(),
            });
            Ok(())
        })?;
        Ok(out)
    }

    // ── Insert ──────────────────────────────────────────────────────────────

    fn check_record(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() || key.len() > usize::from(K::MAX_KEY_LEN) {
            return Err(HfsError::InvalidArgument(format!(
                "{} key length {} outside 1..={}",
                K::NAME,
                key.len(),
                K::MAX_KEY_LEN
            )));
        }
        let record = leaf_record(key, data);
        if record.len() > MAX_RECORD_SIZE {
            return Err(HfsError::InvalidArgument(format!(
                "{} record of {} bytes exceeds {MAX_RECORD_SIZE}",
                K::NAME,
                record.len()
            )));
        }
        Ok(record)
    }

    /// Insert a new record. Fails with `Exists` if the key is present.
    pub fn insert(&mut self, store: &mut dyn NodeStore, key: &[u8], data: &[u8]) -> Result<()> {
        let record = Self::check_record(key, data)?;
        // One node per level for splits plus a new root.
        self.ensure_free(store, u32::from(self.header.depth) + 1)?;

        if self.is_empty() {
            let index = self.alloc_node()?;
            let mut leaf = Node::new(NodeKind::Leaf, 1);
            leaf.records.push(record);
            Self::write(store, index, &leaf)?;
            self.header.root = index;
            self.header.first_leaf = index;
            self.header.last_leaf = index;
            self.header.depth = 1;
            self.header.leaf_records = 1;
            trace!(tree = K::NAME, node = index, "btree_first_leaf");
            return self.save(store);
        }

        let mut path = self.descend(store, key)?;
        let leaf_level = path.len() - 1;
        let pos = {
            let leaf = &path[leaf_level];
            match Self::leaf_search(leaf.index, &leaf.node, key)? {
                Ok(_) => {
                    return Err(HfsError::Exists(format!("{} key {}", K::NAME, K::describe(key))));
                }
                Err(pos) => pos,
            }
        };
        path[leaf_level].node.records.insert(pos, record);

        let mut carry_first: Option<Vec<u8>> = None;
        let mut carry_split: Option<(Vec<u8>, u32)> = None;
        for level in (0..=leaf_level).rev() {
            let index = path[level].index;
            let mut touched_first = level == leaf_level && pos == 0;
            if level < leaf_level {
                let slot = path[level].slot;
                let node = &mut path[level].node;
                if let Some(first) = carry_first.take() {
                    let child = index_child(index, &node.records[slot])?;
                    node.records[slot] = index_record(&first, child, K::MAX_KEY_LEN);
                    touched_first |= slot == 0;
                }
                if let Some((first, child)) = carry_split.take() {
                    node.records
                        .insert(slot + 1, index_record(&first, child, K::MAX_KEY_LEN));
                }
            }

            if path[level].node.fits(NODE_SIZE) {
                Self::write(store, index, &path[level].node)?;
                if touched_first && level > 0 {
                    carry_first = Some(first_key(index, &path[level].node)?);
                    continue;
                }
                break;
            }

            let (right_index, right_first) = self.split(store, index, &mut path[level].node)?;
            let left_first = first_key(index, &path[level].node)?;
            if level == 0 {
                self.grow_root(store, index, &left_first, right_index, &right_first)?;
                break;
            }
            carry_first = touched_first.then_some(left_first);
            carry_split = Some((right_first, right_index));
        }

        self.header.leaf_records += 1;
        self.save(store)
    }

    /// Move the upper part of an overfull node into a new right sibling.
    /// Writes both nodes and returns the sibling's index and first key.
    fn split(&mut self, store: &mut dyn NodeStore, index: u32, node: &mut Node) -> Result<(u32, Vec<u8>)> {
        let count = node.records.len();
        let mut best: Option<(usize, usize)> = None;
        for mid in 1..count {
            let left = Node::size_of(&node.records[..mid]);
            let right = Node::size_of(&node.records[mid..]);
            if left <= NODE_SIZE && right <= NODE_SIZE {
                let skew = left.abs_diff(right);
                if best.is_none_or(|(_, b)| skew < b) {
                    best = Some((mid, skew));
                }
            }
        }
        let Some((mid, _)) = best else {
            error!(tree = K::NAME, node = index, count, "btree_invariant_violation");
            return Err(corrupt(index, "no split point leaves both halves within node size"));
        };

        let right_index = self.alloc_node()?;
        trace!(tree = K::NAME, new_node = right_index, purpose = "split", "btree_node_alloc");
        let mut right = Node::new(node.kind, node.height);
        right.records = node.records.split_off(mid);
        right.flink = node.flink;
        right.blink = index;
        let old_next = node.flink;
        node.flink = right_index;

        Self::write(store, index, node)?;
        Self::write(store, right_index, &right)?;
        if old_next != 0 {
            let mut next = self.read(store, old_next)?;
            next.blink = right_index;
            Self::write(store, old_next, &next)?;
        } else if node.kind == NodeKind::Leaf {
            self.header.last_leaf = right_index;
        }

        let right_first = first_key(right_index, &right)?;
        debug!(
            tree = K::NAME,
            old_node = index,
            new_node = right_index,
            height = node.height,
            left_records = node.records.len(),
            right_records = right.records.len(),
            "btree_node_split"
        );
        Ok((right_index, right_first))
    }

    fn grow_root(
        &mut self,
        store: &mut dyn NodeStore,
        left: u32,
        left_first: &[u8],
        right: u32,
        right_first: &[u8],
    ) -> Result<()> {
        let index = self.alloc_node()?;
        let height = self.root_height()? + 1;
        let mut root = Node::new(NodeKind::Index, height);
        root.records.push(index_record(left_first, left, K::MAX_KEY_LEN));
        root.records.push(index_record(right_first, right, K::MAX_KEY_LEN));
        Self::write(store, index, &root)?;
        self.header.root = index;
        self.header.depth += 1;
        debug!(tree = K::NAME, new_root = index, depth = self.header.depth, "btree_root_grow");
        Ok(())
    }

    /// Replace the data of an existing record.
    pub fn update(&mut self, store: &mut dyn NodeStore, key: &[u8], data: &[u8]) -> Result<()> {
        let record = Self::check_record(key, data)?;
        if self.is_empty() {
            return Err(HfsError::NotFound(format!("{} key {}", K::NAME, K::describe(key))));
        }
        let mut path = self.descend(store, key)?;
        let Some(leaf) = path.last_mut() else {
            return Err(corrupt(self.header.root, "empty descent path"));
        };
        let pos = Self::leaf_search(leaf.index, &leaf.node, key)?
            .map_err(|_| HfsError::NotFound(format!("{} key {}", K::NAME, K::describe(key))))?;
        let old = std::mem::replace(&mut leaf.node.records[pos], record);
        if leaf.node.fits(NODE_SIZE) {
            return Self::write(store, leaf.index, &leaf.node);
        }
        leaf.node.records[pos] = old;
        // Reserve split room first so a NoSpace leaves the old record alone.
        self.ensure_free(store, u32::from(self.header.depth) + 1)?;
        self.delete(store, key)?;
        self.insert(store, key, data)
    }

    // ── Delete ──────────────────────────────────────────────────────────────

    /// Remove the record with `key`. Fails with `NotFound` if absent.
    pub fn delete(&mut self, store: &mut dyn NodeStore, key: &[u8]) -> Result<()> {
        if self.is_empty() {
            return Err(HfsError::NotFound(format!("{} key {}", K::NAME, K::describe(key))));
        }
        let mut path = self.descend(store, key)?;
        let leaf_level = path.len() - 1;
        let pos = {
            let leaf = &path[leaf_level];
            Self::leaf_search(leaf.index, &leaf.node, key)?
                .map_err(|_| HfsError::NotFound(format!("{} key {}", K::NAME, K::describe(key))))?
        };
        path[leaf_level].node.records.remove(pos);
        self.header.leaf_records = self.header.leaf_records.saturating_sub(1);

        let mut touched_first = pos == 0;
        let mut level = leaf_level;
        loop {
            if level == 0 {
                self.settle_root(store, path.swap_remove(0))?;
                break;
            }
            let (fixes, removal) = self.rebalance(store, &mut path, level, touched_first)?;
            if fixes.is_empty() && removal.is_none() {
                break;
            }

            let parent_index = path[level - 1].index;
            let parent = &mut path[level - 1].node;
            touched_first = false;
            for (slot, first) in fixes {
                let child = index_child(parent_index, &parent.records[slot])?;
                parent.records[slot] = index_record(&first, child, K::MAX_KEY_LEN);
                touched_first |= slot == 0;
            }
            if let Some(slot) = removal {
                parent.records.remove(slot);
                touched_first |= slot == 0;
            }
            level -= 1;
        }
        self.save(store)
    }

    /// Resolve underflow of the node at `level` (never the root).
    ///
    /// Returns index-record fixes `(slot, new_first_key)` and an optional
    /// slot to remove, both addressed to the parent.
    fn rebalance(
        &mut self,
        store: &mut dyn NodeStore,
        path: &mut [Step],
        level: usize,
        touched_first: bool,
    ) -> Result<ParentEdits> {
        let (parents, rest) = path.split_at_mut(level);
        let parent = &parents[level - 1];
        let step = &mut rest[0];
        let slot = parent.slot;
        let index = step.index;
        let mut fixes = Vec::new();

        if step.node.records.is_empty() {
            self.unlink(store, index, &step.node)?;
            self.free_node(store, index)?;
            trace!(tree = K::NAME, node = index, "btree_node_freed");
            return Ok((fixes, Some(slot)));
        }

        let underfull = step.node.used_bytes() < NODE_SIZE / 2;
        let sibling_slot = if !underfull {
            None
        } else if slot > 0 {
            Some(slot - 1)
        } else if slot + 1 < parent.node.records.len() {
            Some(slot + 1)
        } else {
            None
        };

        let Some(sibling_slot) = sibling_slot else {
            Self::write(store, index, &step.node)?;
            if touched_first {
                fixes.push((slot, first_key(index, &step.node)?));
            }
            return Ok((fixes, None));
        };

        let sib_index = index_child(parent.index, &parent.node.records[sibling_slot])?;
        let mut sib = self.read(store, sib_index)?;
        Self::expect_shape(sib_index, &sib, step.node.height, false)?;
        let node = &mut step.node;

        let combined = node.used_bytes() + sib.used_bytes() - NODE_DESCRIPTOR_SIZE - 2;
        if sibling_slot < slot {
            // Sibling is on the left.
            if combined <= NODE_SIZE {
                sib.records.append(&mut node.records);
                sib.flink = node.flink;
                Self::write(store, sib_index, &sib)?;
                self.relink_next(store, node.flink, sib_index, node.kind)?;
                self.free_node(store, index)?;
                debug!(tree = K::NAME, survivor = sib_index, freed = index, "btree_node_merge");
                return Ok((fixes, Some(slot)));
            }
            Self::shift(&mut sib, node, true);
            Self::write(store, sib_index, &sib)?;
            Self::write(store, index, node)?;
            fixes.push((slot, first_key(index, node)?));
            trace!(tree = K::NAME, from = sib_index, to = index, "btree_redistribute");
            return Ok((fixes, None));
        }

        // Sibling is on the right.
        if combined <= NODE_SIZE {
            node.records.append(&mut sib.records);
            node.flink = sib.flink;
            Self::write(store, index, node)?;
            self.relink_next(store, sib.flink, index, node.kind)?;
            self.free_node(store, sib_index)?;
            if touched_first {
                fixes.push((slot, first_key(index, node)?));
            }
            debug!(tree = K::NAME, survivor = index, freed = sib_index, "btree_node_merge");
            return Ok((fixes, Some(sibling_slot)));
        }
        Self::shift(&mut sib, node, false);
        Self::write(store, sib_index, &sib)?;
        Self::write(store, index, node)?;
        if touched_first {
            fixes.push((slot, first_key(index, node)?));
        }
        fixes.push((sibling_slot, first_key(sib_index, &sib)?));
        trace!(tree = K::NAME, from = sib_index, to = index, "btree_redistribute");
        Ok((fixes, None))
    }

    /// Move records from `donor` into `receiver` while that narrows the
    /// size gap. `donor_is_left` selects which end records move from.
    fn shift(donor: &mut Node, receiver: &mut Node, donor_is_left: bool) {
        while donor.records.len() > 1 {
            let moving = if donor_is_left {
                donor.records[donor.records.len() - 1].len()
            } else {
                donor.records[0].len()
            };
            let r = receiver.used_bytes();
            let d = donor.used_bytes();
            if r + moving + 2 > NODE_SIZE || r + moving > d.saturating_sub(moving) {
                break;
            }
            if donor_is_left {
                if let Some(rec) = donor.records.pop() {
                    receiver.records.insert(0, rec);
                }
            } else {
                receiver.records.push(donor.records.remove(0));
            }
        }
    }

    fn relink_next(&mut self, store: &mut dyn NodeStore, next: u32, prev: u32, kind: NodeKind) -> Result<()> {
        if next != 0 {
            let mut node = self.read(store, next)?;
            node.blink = prev;
            Self::write(store, next, &node)?;
        } else if kind == NodeKind::Leaf {
            self.header.last_leaf = prev;
        }
        Ok(())
    }

    /// Detach an emptied node from its sibling chain.
    fn unlink(&mut self, store: &mut dyn NodeStore, index: u32, node: &Node) -> Result<()> {
        if node.blink != 0 {
            let mut prev = self.read(store, node.blink)?;
            prev.flink = node.flink;
            Self::write(store, node.blink, &prev)?;
        } else if node.kind == NodeKind::Leaf {
            self.header.first_leaf = node.flink;
        }
        self.relink_next(store, node.flink, node.blink, node.kind)?;
        trace!(tree = K::NAME, node = index, "btree_node_unlinked");
        Ok(())
    }

    /// Write the root back, then drop levels while the root is an index node
    /// with a single child. An empty root leaves an empty tree.
    fn settle_root(&mut self, store: &mut dyn NodeStore, root: Step) -> Result<()> {
        if root.node.records.is_empty() {
            self.free_node(store, root.index)?;
            self.header.root = 0;
            self.header.depth = 0;
            self.header.first_leaf = 0;
            self.header.last_leaf = 0;
            debug!(tree = K::NAME, "btree_now_empty");
            return Ok(());
        }
        Self::write(store, root.index, &root.node)?;

        let mut index = root.index;
        let mut node = root.node;
        while node.kind == NodeKind::Index && node.records.len() == 1 {
            let child = index_child(index, &node.records[0])?;
            self.free_node(store, index)?;
            self.header.root = child;
            self.header.depth -= 1;
            debug!(tree = K::NAME, new_root = child, depth = self.header.depth, "btree_root_shrink");
            index = child;
            node = self.read(store, child)?;
            Self::expect_shape(child, &node, self.root_height()?, true)?;
        }
        Ok(())
    }

    // ── Node allocation ─────────────────────────────────────────────────────

    fn alloc_node(&mut self) -> Result<u32> {
        let total = self.header.total_nodes as usize;
        let Some(bit) = (1..total).find(|&i| !bit_is_set(&self.map, i)) else {
            return Err(HfsError::NoSpace);
        };
        set_bit(&mut self.map, bit, true);
        self.header.free_nodes = self.header.free_nodes.saturating_sub(1);
        u32::try_from(bit).map_err(|_| corrupt(0, "node index overflow"))
    }

    fn free_node(&mut self, store: &mut dyn NodeStore, index: u32) -> Result<()> {
        if !bit_is_set(&self.map, index as usize) {
            error!(tree = K::NAME, node = index, "btree_invariant_violation");
            return Err(corrupt(index, format!("{} freeing node that is not allocated", K::NAME)));
        }
        set_bit(&mut self.map, index as usize, false);
        self.header.free_nodes += 1;
        store.write_node(index, &[0_u8; NODE_SIZE])
    }

    /// Grow the tree file until `needed` nodes are free.
    fn ensure_free(&mut self, store: &mut dyn NodeStore, needed: u32) -> Result<()> {
        if self.header.free_nodes >= needed {
            return Ok(());
        }
        let shortfall = needed - self.header.free_nodes;
        // Room for one extra map node in case coverage runs out.
        let want = self.header.total_nodes.saturating_add(shortfall + 1);
        let capacity = store.grow(want)?;
        if capacity <= self.header.total_nodes {
            return Err(HfsError::NoSpace);
        }
        let added = capacity - self.header.total_nodes;
        debug!(tree = K::NAME, old_total = self.header.total_nodes, new_total = capacity, "btree_file_grow");
        self.header.total_nodes = capacity;
        self.header.free_nodes += added;
        self.cover_map()?;
        self.save(store)?;
        if self.header.free_nodes < needed {
            return Err(HfsError::NoSpace);
        }
        Ok(())
    }

    /// Add map nodes until the bitmap covers every node of the file.
    fn cover_map(&mut self) -> Result<()> {
        while self.map.len() * 8 < self.header.total_nodes as usize {
            let index = u32::try_from(self.map.len() * 8).map_err(|_| corrupt(0, "map overflow"))?;
            self.map.resize(self.map.len() + MAP_NODE_RECORD_SIZE, 0);
            set_bit(&mut self.map, index as usize, true);
            self.header.free_nodes = self.header.free_nodes.saturating_sub(1);
            self.map_nodes.push(index);
            debug!(tree = K::NAME, map_node = index, "btree_map_node_added");
        }
        Ok(())
    }

    /// Persist the header node and every map node.
    fn save(&self, store: &mut dyn NodeStore) -> Result<()> {
        let mut head = Node::new(NodeKind::Header, 0);
        head.flink = self.map_nodes.first().copied().unwrap_or(0);
        head.records = vec![
            self.header.serialize().to_vec(),
            vec![0_u8; HEADER_RESERVED_SIZE],
            self.map[..HEADER_MAP_SIZE].to_vec(),
        ];
        Self::write(store, 0, &head)?;

        for (i, &index) in self.map_nodes.iter().enumerate() {
            let start = HEADER_MAP_SIZE + i * MAP_NODE_RECORD_SIZE;
            let mut node = Node::new(NodeKind::Map, 0);
            node.flink = self.map_nodes.get(i + 1).copied().unwrap_or(0);
            node.records = vec![self.map[start..start + MAP_NODE_RECORD_SIZE].to_vec()];
            Self::write(store, index, &node)?;
        }
        Ok(())
    }

    // ── Verification ────────────────────────────────────────────────────────

    /// Walk the whole tree and verify ordering, separator keys, equal leaf
    /// depth, sibling links, record and free-node counts.
    pub fn check(&self, store: &mut dyn NodeStore) -> Result<TreeStats> {
        let mut stats = TreeStats {
            depth: self.header.depth,
            map_nodes: u32::try_from(self.map_nodes.len()).unwrap_or(u32::MAX),
            ..TreeStats::default()
        };
        let mut levels: Vec<Vec<u32>> = vec![Vec::new(); usize::from(self.header.depth)];
        if !self.is_empty() {
            let height = self.root_height()?;
            self.check_subtree(store, self.header.root, height, None, None, &mut levels, &mut stats)?;
        }

        // Same-height nodes must form one doubly linked chain in key order.
        for chain in &levels {
            for (i, &index) in chain.iter().enumerate() {
                let node = self.read(store, index)?;
                let want_prev = if i == 0 { 0 } else { chain[i - 1] };
                let want_next = chain.get(i + 1).copied().unwrap_or(0);
                if node.blink != want_prev || node.flink != want_next {
                    return Err(corrupt(index, format!("{} sibling links broken", K::NAME)));
                }
            }
        }
        if let Some(leaves) = levels.first() {
            if leaves.first().copied().unwrap_or(0) != self.header.first_leaf
                || leaves.last().copied().unwrap_or(0) != self.header.last_leaf
            {
                return Err(corrupt(0, format!("{} first/last leaf mismatch", K::NAME)));
            }
        } else if self.header.first_leaf != 0 || self.header.last_leaf != 0 {
            return Err(corrupt(0, format!("{} empty tree has leaf pointers", K::NAME)));
        }
        if stats.records != self.header.leaf_records {
            return Err(corrupt(
                0,
                format!("{} leaf record count {} != header {}", K::NAME, stats.records, self.header.leaf_records),
            ));
        }

        let used = 1 + stats.index_nodes + stats.leaf_nodes + stats.map_nodes;
        let total = self.header.total_nodes;
        let set = (0..total as usize).filter(|&i| bit_is_set(&self.map, i)).count();
        if used + self.header.free_nodes != total || set != used as usize {
            return Err(corrupt(
                0,
                format!("{} node accounting: used={used} free={} total={total} bits={set}", K::NAME, self.header.free_nodes),
            ));
        }
        Ok(stats)
    }

    #[expect(clippy::too_many_arguments)]
    fn check_subtree(
        &self,
        store: &mut dyn NodeStore,
        index: u32,
        height: u8,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        levels: &mut [Vec<u32>],
        stats: &mut TreeStats,
    ) -> Result<()> {
        if !bit_is_set(&self.map, index as usize) {
            return Err(corrupt(index, format!("{} reachable node not marked allocated", K::NAME)));
        }
        let node = self.read(store, index)?;
        Self::expect_shape(index, &node, height, index == self.header.root)?;
        levels[usize::from(height) - 1].push(index);

        let keys = keys_of(index, &node)?;
        if keys.windows(2).any(|w| K::compare(w[0], w[1]) != Ordering::Less) {
            return Err(corrupt(index, format!("{} keys not strictly ascending", K::NAME)));
        }
        if let (Some(lo), Some(first)) = (lower, keys.first()) {
            if K::compare(first, lo) != Ordering::Equal {
                return Err(corrupt(index, format!("{} separator key differs from child's first key", K::NAME)));
            }
        }
        if let (Some(hi), Some(last)) = (upper, keys.last()) {
            if K::compare(last, hi) != Ordering::Less {
                return Err(corrupt(index, format!("{} key beyond next separator", K::NAME)));
            }
        }

        if height == 1 {
            stats.leaf_nodes += 1;
            stats.records += u32::try_from(node.records.len()).unwrap_or(u32::MAX);
            return Ok(());
        }
        stats.index_nodes += 1;
        for (i, rec) in node.records.iter().enumerate() {
            let child = index_child(index, rec)?;
            let next = keys.get(i + 1).copied().or(upper);
            self.check_subtree(store, child, height - 1, Some(keys[i]), next, levels, stats)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Big-endian u32 keys, zero padding ignored by construction.
    struct U32Order;

    impl KeyOrder for U32Order {
        const MAX_KEY_LEN: u8 = 7;
        const NAME: &'static str = "test";

        fn compare(a: &[u8], b: &[u8]) -> Ordering {
            a[..4].cmp(&b[..4])
        }
    }

    fn key(n: u32) -> Vec<u8> {
        let mut k = n.to_be_bytes().to_vec();
        k.extend_from_slice(&[0, 0, 0]);
        k
    }

    fn payload(n: u32, len: usize) -> Vec<u8> {
        let mut data = vec![(n % 251) as u8; len];
        data[..4].copy_from_slice(&n.to_be_bytes());
        data
    }

    fn new_tree(nodes: u32, max: u32) -> (MemNodeStore, BTree<U32Order>) {
        let mut store = MemNodeStore::new(nodes, max);
        let tree = BTree::<U32Order>::create(&mut store).expect("create");
        (store, tree)
    }

    fn keys_in_order(store: &mut MemNodeStore, tree: &BTree<U32Order>) -> Vec<u32> {
        tree.entries(store)
            .expect("entries")
            .iter()
            .map(|e| u32::from_be_bytes([e.key[0], e.key[1], e.key[2], e.key[3]]))
            .collect()
    }

    #[test]
    fn empty_tree_round_trips_through_header() {
        let (mut store, tree) = new_tree(8, 8);
        assert!(tree.is_empty());
        assert_eq!(tree.header().free_nodes, 7);
        let reopened = BTree::<U32Order>::open(&mut store).expect("open");
        assert_eq!(reopened.header(), tree.header());
        assert_eq!(tree.search(&mut store, &key(1)).expect("search"), None);
        tree.check(&mut store).expect("check");
    }

    #[test]
    fn insert_search_and_duplicate() {
        let (mut store, mut tree) = new_tree(8, 64);
        tree.insert(&mut store, &key(5), b"five").expect("insert");
        tree.insert(&mut store, &key(3), b"three").expect("insert");
        assert_eq!(
            tree.search(&mut store, &key(5)).expect("search"),
            Some(b"five".to_vec())
        );
        assert!(matches!(
            tree.insert(&mut store, &key(5), b"again"),
            Err(HfsError::Exists(_))
        ));
        assert_eq!(tree.len(), 2);
        assert_eq!(keys_in_order(&mut store, &tree), vec![3, 5]);
    }

    #[test]
    fn splits_grow_depth_and_keep_order() {
        let (mut store, mut tree) = new_tree(4, 512);
        for n in (0..400).rev() {
            tree.insert(&mut store, &key(n * 7), &payload(n, 40)).expect("insert");
        }
        let stats = tree.check(&mut store).expect("check");
        assert!(stats.depth >= 3, "depth {}", stats.depth);
        assert_eq!(stats.records, 400);
        let keys = keys_in_order(&mut store, &tree);
        assert_eq!(keys, (0..400).map(|n| n * 7).collect::<Vec<_>>());

        let reopened = BTree::<U32Order>::open(&mut store).expect("reopen");
        assert_eq!(
            reopened.search(&mut store, &key(7 * 123)).expect("search"),
            Some(payload(123, 40))
        );
    }

    #[test]
    fn cursors_cross_leaf_boundaries() {
        let (mut store, mut tree) = new_tree(4, 256);
        for n in 0..200 {
            tree.insert(&mut store, &key(n * 2), &payload(n, 30)).expect("insert");
        }
        for probe in 0..400 {
            let ge = tree.seek_ge(&mut store, &key(probe)).expect("ge");
            let want = probe.next_multiple_of(2);
            assert_eq!(ge.map(|e| e.key), (want < 400).then(|| key(want)));

            let after = tree.next_after(&mut store, &key(probe)).expect("after");
            let want = (probe / 2 + 1) * 2;
            assert_eq!(after.map(|e| e.key), (want < 400).then(|| key(want)));

            let le = tree.search_le(&mut store, &key(probe)).expect("le");
            assert_eq!(le.map(|e| e.key), Some(key(probe / 2 * 2)));
        }
        assert_eq!(tree.search_le(&mut store, &key(0)).expect("le").map(|e| e.key), Some(key(0)));
    }

    #[test]
    fn delete_everything_empties_tree_and_frees_nodes() {
        let (mut store, mut tree) = new_tree(4, 512);
        for n in 0..300 {
            tree.insert(&mut store, &key(n), &payload(n, 50)).expect("insert");
        }
        for n in (0..300).step_by(3).chain((1..300).step_by(3)).chain((2..300).step_by(3)) {
            tree.delete(&mut store, &key(n)).expect("delete");
            tree.check(&mut store).expect("check after delete");
        }
        assert!(tree.is_empty());
        assert_eq!(tree.header().free_nodes, tree.header().total_nodes - 1);
        assert!(matches!(
            tree.delete(&mut store, &key(1)),
            Err(HfsError::NotFound(_))
        ));
    }

    #[test]
    fn update_replaces_data_in_place() {
        let (mut store, mut tree) = new_tree(8, 64);
        tree.insert(&mut store, &key(1), b"aaaa").expect("insert");
        tree.update(&mut store, &key(1), b"bbbb").expect("update");
        assert_eq!(
            tree.search(&mut store, &key(1)).expect("search"),
            Some(b"bbbb".to_vec())
        );
        assert!(matches!(
            tree.update(&mut store, &key(2), b"x"),
            Err(HfsError::NotFound(_))
        ));
    }

    #[test]
    fn oversized_update_without_room_keeps_old_record() {
        let (mut store, mut tree) = new_tree(4, 4);
        let mut count = 0;
        while tree.insert(&mut store, &key(count), &payload(count, 40)).is_ok() {
            count += 1;
        }
        assert_eq!(tree.header().free_nodes, 0);

        let mut refused = None;
        for n in 0..count {
            match tree.update(&mut store, &key(n), &payload(n + 1000, 200)) {
                Ok(()) => {}
                Err(err) => {
                    assert!(matches!(err, HfsError::NoSpace), "{err}");
                    refused = Some(n);
                    break;
                }
            }
        }
        let n = refused.expect("two leaves cannot hold every widened record");
        assert_eq!(
            tree.search(&mut store, &key(n)).expect("search"),
            Some(payload(n, 40))
        );
        assert_eq!(tree.len(), count);
        tree.check(&mut store).expect("tree intact after refused update");
    }

    #[test]
    fn growth_is_bounded_by_store() {
        let (mut store, mut tree) = new_tree(2, 3);
        let mut inserted = 0;
        let err = loop {
            match tree.insert(&mut store, &key(inserted), &payload(inserted, 200)) {
                Ok(()) => inserted += 1,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, HfsError::NoSpace));
        tree.check(&mut store).expect("tree intact after NoSpace");
        assert_eq!(tree.len(), inserted);
    }

    #[test]
    fn large_file_adds_map_nodes() {
        let (mut store, mut tree) = new_tree(2040, 5000);
        for n in 0..6000 {
            tree.insert(&mut store, &key(n), &payload(n, 200)).expect("insert");
        }
        let stats = tree.check(&mut store).expect("check");
        assert!(stats.map_nodes >= 1);
        let reopened = BTree::<U32Order>::open(&mut store).expect("reopen");
        assert_eq!(reopened.header(), tree.header());
        reopened.check(&mut store).expect("check reopened");
    }

    #[test]
    fn corrupt_child_pointer_is_detected() {
        let (mut store, mut tree) = new_tree(4, 256);
        for n in 0..100 {
            tree.insert(&mut store, &key(n), &payload(n, 40)).expect("insert");
        }
        let root = tree.header().root;
        let mut raw = store.read_node(root).expect("root");
        raw[8] = NodeKind::Leaf.code();
        store.write_node(root, &raw).expect("write");
        assert!(matches!(
            tree.search(&mut store, &key(50)),
            Err(HfsError::Corruption { .. })
        ));
    }

    #[test]
    fn rejects_oversized_records() {
        let (mut store, mut tree) = new_tree(4, 16);
        assert!(matches!(
            tree.insert(&mut store, &key(1), &[0_u8; MAX_RECORD_SIZE]),
            Err(HfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            tree.insert(&mut store, &[0_u8; 8], b"x"),
            Err(HfsError::InvalidArgument(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn mutation_sequences_preserve_order_and_balance(
            ops in proptest::collection::vec((any::<bool>(), 0_u32..500, 1_usize..120), 1..400),
        ) {
            let (mut store, mut tree) = new_tree(4, 4096);
            let mut model = BTreeMap::<u32, Vec<u8>>::new();
            for (is_insert, k, len) in ops {
                if is_insert {
                    let data = payload(k, len.max(4));
                    let result = tree.insert(&mut store, &key(k), &data);
                    if let std::collections::btree_map::Entry::Vacant(slot) = model.entry(k) {
                        result.expect("insert");
                        slot.insert(data);
                    } else {
                        prop_assert!(matches!(result, Err(HfsError::Exists(_))));
                    }
                } else {
                    let result = tree.delete(&mut store, &key(k));
                    if model.remove(&k).is_some() {
                        result.expect("delete");
                    } else {
                        prop_assert!(matches!(result, Err(HfsError::NotFound(_))));
                    }
                }
            }

            tree.check(&mut store).expect("invariants");
            let walked = tree.entries(&mut store).expect("entries");
            prop_assert_eq!(walked.len(), model.len());
            for (entry, (k, data)) in walked.iter().zip(model.iter()) {
                prop_assert_eq!(&entry.key, &key(*k));
                prop_assert_eq!(&entry.data, data);
            }
        }
    }
}
