//! Binary encoding of trie metadata objects.
//!
//! Layout (little-endian): a fixed header of magic, version, payload length
//! and CRC32 of the payload, followed by the payload itself: trie stats, the
//! node count and one tagged record per node in post-order.

use super::{HashTrie, NodeIdx, TrieError, TrieNode, TrieStats, LEVEL_WIDTH};

/// Magic constant identifying trie metadata objects (`"CTRI"`).
pub const META_MAGIC: u32 = 0x4354_5249;

/// Current metadata format version.
pub const META_VERSION: u16 = 1;

const META_HEADER_SIZE: usize = 4 + 2 + 4 + 4;

const ABSENT_CHILD: u32 = u32::MAX;

const TAG_NULL: u8 = 0;
const TAG_LEAF: u8 = 1;
const TAG_IID_BRANCH: u8 = 2;
const TAG_RECENCY_BRANCH: u8 = 3;

/// Serialize trie metadata into a self-checking byte buffer.
pub fn encode_metadata(trie: &HashTrie) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64 + trie.nodes().len() * 8);
    let stats = trie.stats();
    payload.extend_from_slice(&stats.row_count.to_le_bytes());
    for value in [
        stats.min_valid_from,
        stats.max_valid_from,
        stats.min_valid_to,
        stats.max_valid_to,
        stats.min_system_from,
        stats.max_system_from,
    ] {
        payload.extend_from_slice(&value.to_le_bytes());
    }

    payload.extend_from_slice(&(trie.nodes().len() as u32).to_le_bytes());
    for node in trie.nodes() {
        match node {
            TrieNode::Null => payload.push(TAG_NULL),
            TrieNode::Leaf { page_idx } => {
                payload.push(TAG_LEAF);
                payload.extend_from_slice(&page_idx.to_le_bytes());
            }
            TrieNode::IidBranch { children } => {
                payload.push(TAG_IID_BRANCH);
                for child in children {
                    let raw = child.unwrap_or(ABSENT_CHILD);
                    payload.extend_from_slice(&raw.to_le_bytes());
                }
            }
            TrieNode::RecencyBranch { children } => {
                payload.push(TAG_RECENCY_BRANCH);
                payload.extend_from_slice(&(children.len() as u32).to_le_bytes());
                for (boundary, child) in children {
                    payload.extend_from_slice(&boundary.to_le_bytes());
                    payload.extend_from_slice(&child.to_le_bytes());
                }
            }
        }
    }

    let mut buf = Vec::with_capacity(META_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&META_MAGIC.to_le_bytes());
    buf.extend_from_slice(&META_VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}

/// Parse and validate metadata produced by [`encode_metadata`].
pub fn decode_metadata(bytes: &[u8]) -> Result<HashTrie, TrieError> {
    if bytes.len() < META_HEADER_SIZE {
        return Err(TrieError::Corrupt("metadata header truncated"));
    }
    let (header, rest) = bytes.split_at(META_HEADER_SIZE);
    let mut header = Reader::new(header);
    if header.u32()? != META_MAGIC {
        return Err(TrieError::Corrupt("metadata magic mismatch"));
    }
    if header.u16()? != META_VERSION {
        return Err(TrieError::Corrupt("unsupported metadata version"));
    }
    let len = header.u32()? as usize;
    let crc_expected = header.u32()?;
    if rest.len() != len {
        return Err(TrieError::Corrupt("metadata payload length mismatch"));
    }
    if crc32fast::hash(rest) != crc_expected {
        return Err(TrieError::Corrupt("metadata payload crc mismatch"));
    }

    let mut reader = Reader::new(rest);
    let stats = TrieStats {
        row_count: reader.u64()?,
        min_valid_from: reader.i64()?,
        max_valid_from: reader.i64()?,
        min_valid_to: reader.i64()?,
        max_valid_to: reader.i64()?,
        min_system_from: reader.i64()?,
        max_system_from: reader.i64()?,
    };

    let node_count = reader.u32()? as usize;
    let mut nodes = Vec::with_capacity(node_count.min(rest.len()));
    for idx in 0..node_count {
        // post-order: children always precede their parent
        let child = |raw: u32| -> Result<NodeIdx, TrieError> {
            if (raw as usize) < idx {
                Ok(raw)
            } else {
                Err(TrieError::NodeOutOfRange(raw as usize))
            }
        };
        let node = match reader.u8()? {
            TAG_NULL => TrieNode::Null,
            TAG_LEAF => TrieNode::Leaf {
                page_idx: reader.u32()?,
            },
            TAG_IID_BRANCH => {
                let mut children = [None; LEVEL_WIDTH];
                for slot in children.iter_mut() {
                    let raw = reader.u32()?;
                    if raw != ABSENT_CHILD {
                        *slot = Some(child(raw)?);
                    }
                }
                TrieNode::IidBranch { children }
            }
            TAG_RECENCY_BRANCH => {
                let count = reader.u32()? as usize;
                let mut children = Vec::with_capacity(count.min(reader.remaining() / 12));
                for _ in 0..count {
                    let boundary = reader.i64()?;
                    children.push((boundary, child(reader.u32()?)?));
                }
                TrieNode::RecencyBranch { children }
            }
            _ => return Err(TrieError::Corrupt("unknown node tag")),
        };
        nodes.push(node);
    }
    if reader.remaining() != 0 {
        return Err(TrieError::Corrupt("trailing bytes after node table"));
    }

    Ok(HashTrie::new(nodes, stats))
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], TrieError> {
        if self.bytes.len() < N {
            return Err(TrieError::Corrupt("metadata payload truncated"));
        }
        let (head, tail) = self.bytes.split_at(N);
        self.bytes = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, TrieError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, TrieError> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, TrieError> {
        self.take().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, TrieError> {
        self.take().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Result<i64, TrieError> {
        self.take().map(i64::from_le_bytes)
    }
}
