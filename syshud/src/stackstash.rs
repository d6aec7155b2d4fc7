//! Shared-prefix call tree ("stack stash")
//!
//! A [`StackStash`] aggregates stack traces into a trie whose nodes live in
//! one arena and link to each other by index: first child, next sibling and
//! parent. Frames near the root are shared by almost every sample, so a
//! sibling list is cheaper than a per-node hash map.
//!
//! Every node with the same key is additionally threaded onto a per-key
//! `next` chain, which makes "all occurrences of function X" a linked walk.
//!
//! ## Weights
//!
//! Only the innermost node of a trace accumulates weight (`size`, the *self*
//! weight). Totals are computed on demand from self weights. A node is
//! *toplevel* when no ancestor carries the same key; summing only toplevel
//! nodes keeps recursion (`A -> B -> A`) from being counted twice.
//!
//! The stash is generic over its key: the tracker stores raw addresses, the
//! resolved profile stores interned symbol ids.

use std::collections::HashMap;
use std::hash::Hash;

/// Index of a node in a [`StackStash`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct StackNode<K> {
    data: K,
    size: u64,
    toplevel: bool,
    parent: Option<NodeId>,
    children: Option<NodeId>,
    siblings: Option<NodeId>,
    next: Option<NodeId>,
}

impl<K: Copy> StackNode<K> {
    #[must_use]
    pub fn data(&self) -> K {
        self.data
    }

    /// Self weight: samples whose innermost frame is this node
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_toplevel(&self) -> bool {
        self.toplevel
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn first_child(&self) -> Option<NodeId> {
        self.children
    }

    #[must_use]
    pub fn next_sibling(&self) -> Option<NodeId> {
        self.siblings
    }

    /// Next node carrying the same key, anywhere in the tree
    #[must_use]
    pub fn next_same_data(&self) -> Option<NodeId> {
        self.next
    }
}

/// Arena-backed call tree keyed by `K`
#[derive(Debug, Clone)]
pub struct StackStash<K> {
    nodes: Vec<StackNode<K>>,
    first_root: Option<NodeId>,
    nodes_by_data: HashMap<K, NodeId>,
    total_weight: u64,
}

impl<K: Copy + Eq + Hash> Default for StackStash<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> StackStash<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            first_root: None,
            nodes_by_data: HashMap::new(),
            total_weight: 0,
        }
    }

    /// Number of nodes in the arena
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of every weight passed to [`add_trace`](Self::add_trace)
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &StackNode<K> {
        &self.nodes[id.index()]
    }

    /// Add one trace, outermost frame first, and return its innermost node.
    ///
    /// Existing prefixes are followed; missing frames are created. A matched
    /// sibling is moved to the front of its list so hot paths stay short.
    pub fn add_trace(&mut self, frames: &[K], weight: u64) -> Option<NodeId> {
        let mut parent: Option<NodeId> = None;

        for &data in frames {
            let head = self.first_child_of(parent);

            let mut prev = None;
            let mut cursor = head;
            while let Some(id) = cursor {
                if self.nodes[id.index()].data == data {
                    break;
                }
                prev = cursor;
                cursor = self.nodes[id.index()].siblings;
            }

            let node = match cursor {
                Some(found) => {
                    if let Some(prev) = prev {
                        self.nodes[prev.index()].siblings = self.nodes[found.index()].siblings;
                        self.nodes[found.index()].siblings = head;
                        self.set_first_child_of(parent, Some(found));
                    }
                    found
                }
                None => {
                    let created = self.push_node(data, parent, head);
                    self.set_first_child_of(parent, Some(created));
                    created
                }
            };

            parent = Some(node);
        }

        let leaf = parent?;
        self.nodes[leaf.index()].size += weight;
        self.total_weight += weight;
        Some(leaf)
    }

    fn push_node(&mut self, data: K, parent: Option<NodeId>, siblings: Option<NodeId>) -> NodeId {
        let toplevel = !self.ancestors(parent).any(|a| self.nodes[a.index()].data == data);

        let index = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
        let id = NodeId(index);
        let next = self.nodes_by_data.insert(data, id);

        self.nodes.push(StackNode {
            data,
            size: 0,
            toplevel,
            parent,
            children: None,
            siblings,
            next,
        });
        id
    }

    fn first_child_of(&self, parent: Option<NodeId>) -> Option<NodeId> {
        match parent {
            Some(p) => self.nodes[p.index()].children,
            None => self.first_root,
        }
    }

    fn set_first_child_of(&mut self, parent: Option<NodeId>, child: Option<NodeId>) {
        match parent {
            Some(p) => self.nodes[p.index()].children = child,
            None => self.first_root = child,
        }
    }

    /// Every node id, in creation order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId(u32::try_from(i).unwrap_or(u32::MAX)))
    }

    /// Iterate `start` and then each of its ancestors up to the root
    pub fn ancestors(&self, start: Option<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(start, move |id| self.nodes[id.index()].parent)
    }

    /// Iterate the root nodes
    pub fn roots(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sibling_chain(self.first_root)
    }

    /// Iterate the direct children of `id`
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.sibling_chain(self.nodes[id.index()].children)
    }

    fn sibling_chain(&self, first: Option<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(first, move |id| self.nodes[id.index()].siblings)
    }

    /// Most recently created node carrying `data`, head of its `next` chain
    #[must_use]
    pub fn find_node(&self, data: &K) -> Option<NodeId> {
        self.nodes_by_data.get(data).copied()
    }

    /// Every node carrying `data`
    pub fn nodes_for(&self, data: &K) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.find_node(data), move |id| self.nodes[id.index()].next)
    }

    /// Keys from `id` up to its root, innermost first
    #[must_use]
    pub fn trace(&self, id: NodeId) -> Vec<K> {
        self.ancestors(Some(id)).map(|a| self.nodes[a.index()].data).collect()
    }

    /// Sum of self weights in the subtree rooted at `id`
    #[must_use]
    pub fn compute_total(&self, id: NodeId) -> u64 {
        let mut total = self.nodes[id.index()].size;
        let mut stack: Vec<NodeId> = self.nodes[id.index()].children.into_iter().collect();

        while let Some(n) = stack.pop() {
            let node = &self.nodes[n.index()];
            total += node.size;
            stack.extend(node.siblings);
            stack.extend(node.children);
        }
        total
    }

    /// Total weight attributed to `data`: subtree sums of its toplevel nodes
    #[must_use]
    pub fn total_for(&self, data: &K) -> u64 {
        self.nodes_for(data)
            .filter(|id| self.nodes[id.index()].toplevel)
            .map(|id| self.compute_total(id))
            .sum()
    }

    /// Call `func(data, self, total)` once per distinct key
    pub fn foreach_by_address<F>(&self, mut func: F)
    where
        F: FnMut(K, u64, u64),
    {
        for &data in self.nodes_by_data.keys() {
            let self_weight = self.nodes_for(&data).map(|id| self.nodes[id.index()].size).sum();
            func(data, self_weight, self.total_for(&data));
        }
    }

    /// Pre-order walk: `func(path, size)` for every node with self weight,
    /// `path` running root to leaf.
    pub fn foreach<F>(&self, mut func: F)
    where
        F: FnMut(&[K], u64),
    {
        let mut path = Vec::new();
        self.visit_subtrees(self.first_root, &mut path, |node, path| {
            if node.size > 0 {
                func(path, node.size);
            }
        });
    }

    /// Same walk as [`foreach`](Self::foreach), with each trace delivered
    /// leaf to root.
    pub fn foreach_reversed<F>(&self, mut func: F)
    where
        F: FnMut(&[K], u64),
    {
        let mut reversed = Vec::new();
        self.foreach(|path, size| {
            reversed.clear();
            reversed.extend(path.iter().rev().copied());
            func(&reversed, size);
        });
    }

    /// Walk the subtree under `id`: `func(path, size)` for `id` and each
    /// descendant with self weight, `path` starting at `id`.
    pub fn foreach_trace_from<F>(&self, id: NodeId, mut func: F)
    where
        F: FnMut(&[K], u64),
    {
        let node = &self.nodes[id.index()];
        let mut path = vec![node.data];
        if node.size > 0 {
            func(&path, node.size);
        }
        self.visit_subtrees(node.children, &mut path, |node, path| {
            if node.size > 0 {
                func(path, node.size);
            }
        });
    }

    /// Iterative pre-order over `first`, its siblings and all their descendants
    fn visit_subtrees<F>(&self, first: Option<NodeId>, path: &mut Vec<K>, mut visit: F)
    where
        F: FnMut(&StackNode<K>, &[K]),
    {
        let base = path.len();
        let mut stack: Vec<(NodeId, usize)> = first.map(|id| (id, base)).into_iter().collect();

        while let Some((id, depth)) = stack.pop() {
            let node = &self.nodes[id.index()];
            path.truncate(depth);
            path.push(node.data);
            visit(node, path.as_slice());

            if let Some(sibling) = node.siblings {
                stack.push((sibling, depth));
            }
            if let Some(child) = node.children {
                stack.push((child, depth + 1));
            }
        }
        path.truncate(base);
    }
}
