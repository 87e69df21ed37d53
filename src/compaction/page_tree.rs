//! Rewrites the flat page layout of a merge result as a trie.

use std::io::Write;

use arrow::{compute::concat_batches, record_batch::RecordBatch};
use tokio_util::sync::CancellationToken;

use crate::trie::{
    write_subtree, NodeIdx, SortedRelation, TrieError, TrieWriter, TriePath, LEVEL_WIDTH,
};

/// One staged page and the trie path its rows lie under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageLeaf {
    /// Row group of the staged data file.
    pub page_idx: u32,
    /// Path shared by every row of the page.
    pub path: TriePath,
    /// Rows in the page.
    pub row_count: usize,
}

/// Staged pages arranged by path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageTree {
    /// A single page covers this subtree.
    Leaf(PageLeaf),
    /// Pages spread over the next nibble.
    Node {
        /// Subtrees per nibble.
        children: [Option<Box<PageTree>>; LEVEL_WIDTH],
        /// Rows under this node.
        row_count: usize,
    },
}

impl PageTree {
    /// Arrange `leaves` by path; `None` when there are none.
    ///
    /// Leaves whose paths overlap (one a prefix of another) cannot share a
    /// trie and are rejected.
    pub fn build(mut leaves: Vec<PageLeaf>) -> Result<Option<PageTree>, TrieError> {
        leaves.sort_by(|l, r| l.path.cmp(&r.path));
        build_at(leaves, 0)
    }

    /// Rows under this subtree.
    pub fn row_count(&self) -> usize {
        match self {
            PageTree::Leaf(leaf) => leaf.row_count,
            PageTree::Node { row_count, .. } => *row_count,
        }
    }

    fn collect_pages(&self, out: &mut Vec<u32>) {
        match self {
            PageTree::Leaf(leaf) => out.push(leaf.page_idx),
            PageTree::Node { children, .. } => {
                for child in children.iter().flatten() {
                    child.collect_pages(out);
                }
            }
        }
    }
}

fn build_at(leaves: Vec<PageLeaf>, depth: usize) -> Result<Option<PageTree>, TrieError> {
    if leaves.len() <= 1 {
        return Ok(leaves.into_iter().next().map(PageTree::Leaf));
    }
    if leaves.iter().any(|leaf| leaf.path.len() <= depth) {
        return Err(TrieError::OverlappingPages);
    }

    let mut buckets: [Vec<PageLeaf>; LEVEL_WIDTH] = Default::default();
    for leaf in leaves {
        let nibble = usize::from(leaf.path[depth]);
        buckets[nibble].push(leaf);
    }

    let mut children: [Option<Box<PageTree>>; LEVEL_WIDTH] = Default::default();
    let mut row_count = 0;
    for (nibble, bucket) in buckets.into_iter().enumerate() {
        if let Some(child) = build_at(bucket, depth + 1)? {
            row_count += child.row_count();
            children[nibble] = Some(Box::new(child));
        }
    }
    Ok(Some(PageTree::Node {
        children,
        row_count,
    }))
}

impl<W: Write + Send> TrieWriter<W> {
    /// Write `tree` as a subtree, loading staged pages through `loader`.
    ///
    /// A page above `page_limit` is split by iid from its depth on; a node
    /// whose rows fit is written as one page, its pages concatenated in path
    /// order; any other node becomes an iid branch.
    pub fn write_page_tree<F>(
        &mut self,
        loader: &mut F,
        tree: &PageTree,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<NodeIdx, TrieError>
    where
        F: FnMut(u32) -> Result<RecordBatch, TrieError>,
    {
        self.write_page_tree_at(loader, tree, 0, page_limit, cancel)
    }

    fn write_page_tree_at<F>(
        &mut self,
        loader: &mut F,
        tree: &PageTree,
        depth: usize,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<NodeIdx, TrieError>
    where
        F: FnMut(u32) -> Result<RecordBatch, TrieError>,
    {
        if cancel.is_cancelled() {
            return Err(TrieError::Cancelled);
        }
        match tree {
            PageTree::Leaf(leaf) if leaf.row_count > page_limit => {
                let rel = SortedRelation::try_new(loader(leaf.page_idx)?)?;
                let all = (0..rel.num_rows() as u32).collect::<Vec<_>>();
                write_subtree(self, &rel, depth, &all, page_limit, cancel)
            }
            PageTree::Leaf(leaf) => {
                let page = loader(leaf.page_idx)?;
                self.write_leaf(&page)
            }
            PageTree::Node { row_count, .. } if *row_count <= page_limit => {
                let mut page_idxs = Vec::new();
                tree.collect_pages(&mut page_idxs);
                let pages = page_idxs
                    .into_iter()
                    .map(&mut *loader)
                    .collect::<Result<Vec<_>, _>>()?;
                let page = concat_batches(self.schema(), &pages)?;
                self.write_leaf(&page)
            }
            PageTree::Node { children, .. } => {
                let mut nodes = [None; LEVEL_WIDTH];
                for (nibble, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        nodes[nibble] = Some(self.write_page_tree_at(
                            loader,
                            child,
                            depth + 1,
                            page_limit,
                            cancel,
                        )?);
                    }
                }
                Ok(self.write_iid_branch(nodes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relation::{EventColumns, EventRelationBuilder, END_OF_TIME},
        trie::{Iid, TrieNode},
    };

    fn leaf(page_idx: u32, path: &[u8], row_count: usize) -> PageLeaf {
        PageLeaf {
            page_idx,
            path: TriePath::from_nibbles(path.iter().copied()),
            row_count,
        }
    }

    fn page(first_bytes: &[u8]) -> RecordBatch {
        let mut builder = EventRelationBuilder::new("v");
        for (i, b) in first_bytes.iter().enumerate() {
            builder.put(
                Iid::from_u128(u128::from(*b) << 120),
                i as i64,
                0,
                END_OF_TIME,
                "x",
            );
        }
        builder.finish().expect("page")
    }

    #[test]
    fn builds_by_path_and_rejects_overlap() {
        assert_eq!(PageTree::build(Vec::new()).expect("build"), None);

        let single = PageTree::build(vec![leaf(0, &[2, 1], 5)]).expect("build");
        assert_eq!(single, Some(PageTree::Leaf(leaf(0, &[2, 1], 5))));

        let tree = PageTree::build(vec![leaf(1, &[3], 2), leaf(0, &[0, 1], 3)])
            .expect("build")
            .expect("tree");
        assert_eq!(tree.row_count(), 5);
        let PageTree::Node { children, .. } = &tree else {
            panic!("expected a node");
        };
        assert!(children[0].is_some() && children[3].is_some());
        assert!(children[1].is_none() && children[2].is_none());

        assert!(matches!(
            PageTree::build(vec![leaf(0, &[1], 1), leaf(1, &[1, 2], 1)]),
            Err(TrieError::OverlappingPages)
        ));
    }

    #[test]
    fn small_nodes_collapse_and_large_leaves_split() {
        // pages under 0, 1 and 3
        let pages = vec![page(&[0x05, 0x25]), page(&[0x45]), page(&[0xc5, 0xd5, 0xe5, 0xf5])];
        let tree = PageTree::build(vec![
            leaf(0, &[0], 2),
            leaf(1, &[1], 1),
            leaf(2, &[3], 4),
        ])
        .expect("build")
        .expect("tree");
        let mut loader =
            |idx: u32| -> Result<RecordBatch, TrieError> { Ok(pages[idx as usize].clone()) };

        let mut writer = TrieWriter::new(Vec::new(), pages[0].schema(), None).expect("writer");
        writer
            .write_page_tree(&mut loader, &tree, 10, &CancellationToken::new())
            .expect("write");
        let out = writer.end().expect("end");
        assert_eq!(out.trie.leaf_count(), 1);
        assert_eq!(out.trie.stats().row_count, 7);

        let mut writer = TrieWriter::new(Vec::new(), pages[0].schema(), None).expect("writer");
        writer
            .write_page_tree(&mut loader, &tree, 2, &CancellationToken::new())
            .expect("write");
        let out = writer.end().expect("end");
        let root = out.trie.root().expect("root");
        let TrieNode::IidBranch { children } = out.trie.node(root).expect("node") else {
            panic!("root is not an iid branch");
        };
        assert!(children[2].is_none());
        // 0 and 1 stay whole, 3 splits into c, d, e, f
        assert_eq!(out.trie.leaf_count(), 6);

        let data = bytes::Bytes::from(out.data);
        let first = crate::trie::read_page(data, 0).expect("page");
        assert_eq!(EventColumns::try_new(&first).expect("columns").len(), 2);
    }
}
