//! Hash-trie primitives: identifiers, paths, node tables and keys.
//!
//! A trie is a recursive 4-way index over the bits of each row's iid. Every
//! node is stored in a flat table written in post-order, so children always
//! precede their parent and the root is the last entry.

mod codec;
mod error;
mod key;
pub mod partition;
mod reader;
mod writer;

use std::{cmp::Ordering, fmt, ops::Deref};

pub use codec::{decode_metadata, encode_metadata, META_MAGIC, META_VERSION};
pub use error::TrieError;
pub use key::{TableName, TrieKey};
pub use partition::{
    write_relation, write_relation_by_recency, write_subtree, Selection, SortedRelation,
};
pub use reader::{read_page, PageReader};
pub(crate) use writer::write_row_group;
pub use writer::{TrieOutput, TrieWriter};

/// Number of iid bits consumed per trie level.
pub const LEVEL_BITS: usize = 2;
/// Fan-out of an iid branch.
pub const LEVEL_WIDTH: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: u8 = (LEVEL_WIDTH - 1) as u8;
/// Number of nibbles in an iid, hence the deepest possible branch level.
pub const MAX_DEPTH: usize = IID_LEN * 8 / LEVEL_BITS;
/// Width of an entity identifier in bytes.
pub const IID_LEN: usize = 16;

/// Index of a node inside a trie's node table.
pub type NodeIdx = u32;

/// Fixed-width entity identifier used for hash partitioning and merge order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Iid([u8; IID_LEN]);

impl Iid {
    /// Wrap raw identifier bytes.
    pub const fn new(bytes: [u8; IID_LEN]) -> Self {
        Self(bytes)
    }

    /// Big-endian identifier, handy for literals in tests and fixtures.
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; IID_LEN] {
        &self.0
    }

    /// Nibble of this iid at `level`.
    pub fn bucket(&self, level: usize) -> u8 {
        bucket_for(&self.0, level)
    }
}

impl TryFrom<&[u8]> for Iid {
    type Error = TrieError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; IID_LEN] = value
            .try_into()
            .map_err(|_| TrieError::MissingColumn("_iid"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iid({self})")
    }
}

impl fmt::Display for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Nibble of `iid` at trie `level`, counting from the most significant bits.
#[inline]
pub fn bucket_for(iid: &[u8], level: usize) -> u8 {
    let bit_idx = level * LEVEL_BITS;
    let byte_idx = bit_idx / 8;
    let bit_offset = bit_idx % 8;
    (iid[byte_idx] >> ((8 - LEVEL_BITS) - bit_offset)) & LEVEL_MASK
}

/// Compare the leading nibbles of `iid` with `path`.
///
/// `Equal` means the iid lives under `path`.
pub fn compare_to_path(iid: &[u8], path: &[u8]) -> Ordering {
    for (level, &nibble) in path.iter().enumerate() {
        match bucket_for(iid, level).cmp(&nibble) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Sequence of nibbles addressing a node from the root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TriePath(Vec<u8>);

impl TriePath {
    /// The root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from nibbles; values above 3 are masked.
    pub fn from_nibbles(nibbles: impl IntoIterator<Item = u8>) -> Self {
        Self(nibbles.into_iter().map(|n| n & LEVEL_MASK).collect())
    }

    /// Child path one level deeper.
    pub fn conj(&self, nibble: u8) -> Self {
        let mut path = Vec::with_capacity(self.0.len() + 1);
        path.extend_from_slice(&self.0);
        path.push(nibble);
        Self(path)
    }

    /// Whether either path is a prefix of the other.
    pub fn overlaps(&self, other: &[u8]) -> bool {
        let len = self.0.len().min(other.len());
        self.0[..len] == other[..len]
    }
}

impl Deref for TriePath {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for TriePath {
    fn from(value: Vec<u8>) -> Self {
        Self::from_nibbles(value)
    }
}

impl fmt::Debug for TriePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TriePath({self})")
    }
}

impl fmt::Display for TriePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for nibble in &self.0 {
            write!(f, "{nibble}")?;
        }
        Ok(())
    }
}

/// One entry of a trie's node table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrieNode {
    /// Explicit absent marker for an empty subtree.
    Null,
    /// A single data page.
    Leaf {
        /// Page (row group) index in the data file.
        page_idx: u32,
    },
    /// Branch keyed by the next iid nibble.
    IidBranch {
        /// Child per nibble; `None` when the bucket holds no rows.
        children: [Option<NodeIdx>; LEVEL_WIDTH],
    },
    /// Branch keyed by recency bucket boundary (micros), one iid subtree each.
    RecencyBranch {
        /// `(boundary, subtree)` pairs in ascending boundary order.
        children: Vec<(i64, NodeIdx)>,
    },
}

/// Temporal bounds and row count recorded while writing a trie.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrieStats {
    /// Rows across all pages.
    pub row_count: u64,
    /// Smallest `_valid_from`.
    pub min_valid_from: i64,
    /// Largest `_valid_from`.
    pub max_valid_from: i64,
    /// Smallest `_valid_to`.
    pub min_valid_to: i64,
    /// Largest `_valid_to`.
    pub max_valid_to: i64,
    /// Smallest `_system_from`.
    pub min_system_from: i64,
    /// Largest `_system_from`.
    pub max_system_from: i64,
}

impl TrieStats {
    /// Stats for a trie without rows.
    pub const fn empty() -> Self {
        Self {
            row_count: 0,
            min_valid_from: i64::MAX,
            max_valid_from: i64::MIN,
            min_valid_to: i64::MAX,
            max_valid_to: i64::MIN,
            min_system_from: i64::MAX,
            max_system_from: i64::MIN,
        }
    }
}

impl Default for TrieStats {
    fn default() -> Self {
        Self::empty()
    }
}

/// Decoded trie metadata: the node table plus stats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashTrie {
    nodes: Vec<TrieNode>,
    stats: TrieStats,
}

impl HashTrie {
    /// Assemble a trie from a post-order node table.
    pub fn new(nodes: Vec<TrieNode>, stats: TrieStats) -> Self {
        Self { nodes, stats }
    }

    /// Root node index, `None` for a trie without nodes.
    pub fn root(&self) -> Option<NodeIdx> {
        self.nodes.len().checked_sub(1).map(|idx| idx as NodeIdx)
    }

    /// Look up a node by index.
    pub fn node(&self, idx: NodeIdx) -> Result<&TrieNode, TrieError> {
        self.nodes
            .get(idx as usize)
            .ok_or(TrieError::NodeOutOfRange(idx as usize))
    }

    /// Full node table.
    pub fn nodes(&self) -> &[TrieNode] {
        &self.nodes
    }

    /// Stats recorded at write time.
    pub fn stats(&self) -> &TrieStats {
        &self.stats
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, TrieNode::Leaf { .. }))
            .count()
    }

    /// Number of iid branch nodes.
    pub fn iid_branch_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| matches!(node, TrieNode::IidBranch { .. }))
            .count()
    }

    /// Page indices reachable from the root, in path order.
    pub fn leaf_pages(&self) -> Result<Vec<u32>, TrieError> {
        let mut pages = Vec::new();
        let Some(root) = self.root() else {
            return Ok(pages);
        };
        let mut stack = vec![root];
        while let Some(idx) = stack.pop() {
            match self.node(idx)? {
                TrieNode::Null => {}
                TrieNode::Leaf { page_idx } => pages.push(*page_idx),
                TrieNode::IidBranch { children } => {
                    stack.extend(children.iter().rev().flatten());
                }
                TrieNode::RecencyBranch { children } => {
                    stack.extend(children.iter().rev().map(|(_, child)| *child));
                }
            }
        }
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_follow_most_significant_bits() {
        let iid = Iid::from_u128(0xd500_0000_0000_0000_0000_0000_0000_0000);
        assert_eq!(iid.bucket(0), 3);
        assert_eq!(iid.bucket(1), 1);
        assert_eq!(iid.bucket(2), 1);
        assert_eq!(iid.bucket(3), 1);
        assert_eq!(iid.bucket(4), 0);
        assert_eq!(iid.bucket(MAX_DEPTH - 1), 0);
    }

    #[test]
    fn compare_to_path_orders_by_prefix() {
        let iid = Iid::from_u128(0x4500_0000_0000_0000_0000_0000_0000_0000);
        assert_eq!(compare_to_path(iid.as_bytes(), &[]), Ordering::Equal);
        assert_eq!(compare_to_path(iid.as_bytes(), &[1, 0]), Ordering::Equal);
        assert_eq!(compare_to_path(iid.as_bytes(), &[0]), Ordering::Greater);
        assert_eq!(compare_to_path(iid.as_bytes(), &[1, 1]), Ordering::Less);
    }

    #[test]
    fn path_overlap_is_symmetric_prefix() {
        let path = TriePath::from_nibbles([1, 2]);
        assert!(path.overlaps(&[1]));
        assert!(path.overlaps(&[1, 2, 3]));
        assert!(!path.overlaps(&[2]));
        assert_eq!(path.conj(3).to_string(), "123");
    }

    #[test]
    fn leaf_pages_walks_in_path_order() {
        let trie = HashTrie::new(
            vec![
                TrieNode::Leaf { page_idx: 0 },
                TrieNode::Leaf { page_idx: 1 },
                TrieNode::IidBranch {
                    children: [Some(0), None, None, Some(1)],
                },
            ],
            TrieStats::empty(),
        );
        assert_eq!(trie.root(), Some(2));
        assert_eq!(trie.leaf_pages().expect("pages"), vec![0, 1]);
        assert_eq!(trie.leaf_count(), 2);
        assert_eq!(trie.iid_branch_count(), 1);
    }
}
