use std::{fmt, sync::Arc};

use super::Segment;
use crate::trie::{NodeIdx, TrieError, TrieNode, TriePath, LEVEL_WIDTH};

/// Restricts a merge to the part of the trie under one path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PathFilter(TriePath);

impl PathFilter {
    /// Filter on `path`.
    pub fn new(path: TriePath) -> Self {
        Self(path)
    }

    /// The filtered path.
    pub fn path(&self) -> &TriePath {
        &self.0
    }

    /// Whether data at `path` can lie under the filter: either path is a
    /// prefix of the other.
    pub fn matches(&self, path: &[u8]) -> bool {
        self.0.overlaps(path)
    }

    /// The longer of `path` and the filter, the path rows are read under.
    pub fn effective_path(filter: Option<&PathFilter>, path: &TriePath) -> TriePath {
        match filter {
            Some(filter) if filter.0.len() >= path.len() => filter.0.clone(),
            _ => path.clone(),
        }
    }
}

/// One segment's contribution to a task.
#[derive(Clone)]
pub struct MergePlanNode {
    /// The contributing trie.
    pub segment: Arc<dyn Segment>,
    /// Node of that trie at the task's path.
    pub node: NodeIdx,
}

impl fmt::Debug for MergePlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergePlanNode")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl MergePlanNode {
    fn resolve(&self) -> Result<&TrieNode, TrieError> {
        self.segment.trie().node(self.node)
    }

    /// Page index when the node is a leaf.
    pub fn page_idx(&self) -> Result<Option<u32>, TrieError> {
        Ok(match self.resolve()? {
            TrieNode::Leaf { page_idx } => Some(*page_idx),
            _ => None,
        })
    }
}

/// All contributions to be merged into the output at one path.
#[derive(Clone, Debug)]
pub struct MergePlanTask {
    /// Path the task covers.
    pub path: TriePath,
    /// Leaf contributions, in segment order.
    pub nodes: Vec<MergePlanNode>,
}

/// Walk `segments` in lockstep and emit one task per path at which every
/// contribution is a leaf, in path-prefix order.
///
/// Recency branches are flattened into all of their subtrees at the same
/// path. Where any contribution branches on iid, a leaf of another segment
/// carries over to each child bucket unchanged. Segments whose partition
/// misses the filter are skipped and paths outside the filter are pruned.
pub fn to_merge_plan(
    segments: &[Arc<dyn Segment>],
    filter: Option<&PathFilter>,
) -> Result<Vec<MergePlanTask>, TrieError> {
    let mut initial = Vec::with_capacity(segments.len());
    for segment in segments {
        if let (Some(filter), Some(part)) = (filter, segment.part()) {
            if !filter.matches(part) {
                continue;
            }
        }
        if let Some(root) = segment.trie().root() {
            let node = MergePlanNode {
                segment: Arc::clone(segment),
                node: root,
            };
            if !matches!(node.resolve()?, TrieNode::Null) {
                initial.push(node);
            }
        }
    }

    let mut tasks = Vec::new();
    let mut stack = Vec::new();
    if !initial.is_empty() {
        stack.push(MergePlanTask {
            path: TriePath::root(),
            nodes: initial,
        });
    }

    while let Some(task) = stack.pop() {
        let mut has_recency = false;
        let mut has_iid_branch = false;
        for node in &task.nodes {
            match node.resolve()? {
                TrieNode::RecencyBranch { .. } => has_recency = true,
                TrieNode::IidBranch { .. } => has_iid_branch = true,
                TrieNode::Null | TrieNode::Leaf { .. } => {}
            }
        }

        if has_recency {
            let mut nodes = Vec::with_capacity(task.nodes.len());
            for node in task.nodes {
                match node.resolve()? {
                    TrieNode::RecencyBranch { children } => {
                        for (_, child) in children {
                            nodes.push(MergePlanNode {
                                segment: Arc::clone(&node.segment),
                                node: *child,
                            });
                        }
                    }
                    _ => nodes.push(node.clone()),
                }
            }
            nodes.retain(|node| !matches!(node.resolve(), Ok(TrieNode::Null)));
            if nodes.is_empty() {
                continue;
            }
            stack.push(MergePlanTask {
                path: task.path,
                nodes,
            });
            continue;
        }

        if filter.is_some_and(|filter| !filter.matches(&task.path)) {
            continue;
        }

        if !has_iid_branch {
            tasks.push(task);
            continue;
        }

        // pushed in reverse so they pop in path-prefix order
        for bucket in (0..LEVEL_WIDTH).rev() {
            let mut nodes = Vec::new();
            for node in &task.nodes {
                match node.resolve()? {
                    TrieNode::IidBranch { children } => {
                        if let Some(child) = children[bucket] {
                            let child = MergePlanNode {
                                segment: Arc::clone(&node.segment),
                                node: child,
                            };
                            if !matches!(child.resolve()?, TrieNode::Null) {
                                nodes.push(child);
                            }
                        }
                    }
                    _ => nodes.push(node.clone()),
                }
            }
            if !nodes.is_empty() {
                stack.push(MergePlanTask {
                    path: task.path.conj(bucket as u8),
                    nodes,
                });
            }
        }
    }

    Ok(tasks)
}
