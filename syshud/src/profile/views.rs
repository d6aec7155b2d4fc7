//! Caller and descendant views over a resolved stash
//!
//! Both views must cope with recursion: a symbol that appears several times
//! on one stack contributes its time once.

use std::collections::{HashMap, HashSet};

use crate::domain::SymbolId;
use crate::stackstash::{NodeId, StackStash};

/// `(caller, self, total)` for every symbol that directly calls `callee`.
///
/// For each node of `callee`, the topmost node/parent pair on its path with
/// the same pair of symbols stands in for it, so `A -> B -> A -> B` credits
/// the outer `A -> B` call with the whole subtree once. The caller's self
/// weight is the callee's self weight as called from it. Root occurrences
/// have no caller and are grouped under `None`.
#[must_use]
pub fn callers(
    stash: &StackStash<SymbolId>,
    callee: SymbolId,
) -> Vec<(Option<SymbolId>, u64, u64)> {
    let mut order: Vec<Option<SymbolId>> = Vec::new();
    let mut by_symbol: HashMap<Option<SymbolId>, (u64, u64)> = HashMap::new();
    let mut processed: HashSet<Option<NodeId>> = HashSet::new();

    for id in stash.nodes_for(&callee) {
        let node = stash.node(id);
        let parent = node.parent();
        let caller_data = parent.map(|p| stash.node(p).data());

        let mut top_caller = parent;
        let mut top_callee = id;
        for n in stash.ancestors(Some(id)) {
            let Some(p) = stash.node(n).parent() else {
                break;
            };
            if stash.node(n).data() == callee && Some(stash.node(p).data()) == caller_data {
                top_caller = Some(p);
                top_callee = n;
            }
        }

        let entry = by_symbol.entry(caller_data).or_insert_with(|| {
            order.push(caller_data);
            (0, 0)
        });
        if processed.insert(top_caller) {
            entry.1 += stash.compute_total(top_callee);
        }
        entry.0 += node.size();
    }

    order
        .into_iter()
        .map(|symbol| {
            let (self_weight, total) = by_symbol[&symbol];
            (symbol, self_weight, total)
        })
        .collect()
}

/// One node of a [`DescendantTree`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descendant {
    pub symbol: SymbolId,
    pub self_weight: u64,
    pub total: u64,
    /// Weight of traces that do not recurse back above this node
    pub non_recursion: u64,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

/// Everything called below one symbol, merged over all its toplevel
/// occurrences, with recursive re-entries folded onto the earlier node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescendantTree {
    nodes: Vec<Descendant>,
    roots: Vec<usize>,
}

impl DescendantTree {
    #[must_use]
    pub fn nodes(&self) -> &[Descendant] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, index: usize) -> &Descendant {
        &self.nodes[index]
    }

    /// Indices of the top-level nodes
    #[must_use]
    pub fn root_indices(&self) -> &[usize] {
        &self.roots
    }

    pub fn roots(&self) -> impl Iterator<Item = &Descendant> + '_ {
        self.roots.iter().map(|&i| &self.nodes[i])
    }

    pub fn children(&self, index: usize) -> impl Iterator<Item = &Descendant> + '_ {
        self.nodes[index].children.iter().map(|&i| &self.nodes[i])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Child of `parent` (or root) carrying `symbol`, created when missing
    fn child(&mut self, parent: Option<usize>, symbol: SymbolId) -> usize {
        let siblings = match parent {
            Some(p) => &self.nodes[p].children,
            None => &self.roots,
        };
        if let Some(&found) = siblings.iter().find(|&&i| self.nodes[i].symbol == symbol) {
            return found;
        }

        let index = self.nodes.len();
        self.nodes.push(Descendant {
            symbol,
            self_weight: 0,
            total: 0,
            non_recursion: 0,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.nodes[p].children.push(index),
            None => self.roots.push(index),
        }
        index
    }

    /// Add one trace, outermost frame first.
    ///
    /// A frame already on the current path moves back up to that node
    /// instead of nesting deeper. The nodes it folds over, the target
    /// included, give back their non-recursive share of this trace; the
    /// target then takes it again.
    fn add_trace(&mut self, trace: &[SymbolId], weight: u64, marks: &mut TraceMarks) {
        let mut path: Vec<usize> = Vec::with_capacity(trace.len());

        for &symbol in trace {
            if let Some(depth) = path.iter().position(|&i| self.nodes[i].symbol == symbol) {
                for &folded in &path[depth..] {
                    if marks.non_recursive.remove(&folded) {
                        self.nodes[folded].non_recursion -= weight;
                    }
                }
                path.truncate(depth + 1);
            } else {
                let node = self.child(path.last().copied(), symbol);
                path.push(node);
            }
            if let Some(&current) = path.last() {
                if marks.total.insert(current) {
                    self.nodes[current].total += weight;
                }
                if marks.non_recursive.insert(current) {
                    self.nodes[current].non_recursion += weight;
                }
            }
        }

        if let Some(&leaf) = path.last() {
            self.nodes[leaf].self_weight += weight;
        }
        marks.total.clear();
        marks.non_recursive.clear();
    }
}

/// Nodes already credited by the trace being added
#[derive(Debug, Default)]
struct TraceMarks {
    total: HashSet<usize>,
    non_recursive: HashSet<usize>,
}

/// Tree of everything `symbol` calls.
///
/// Every trace below each toplevel occurrence of `symbol` is re-added rooted
/// at `symbol`. A node's total counts each trace that passes through it once,
/// however often recursion brings the trace back to it.
#[must_use]
pub fn descendants(stash: &StackStash<SymbolId>, symbol: SymbolId) -> DescendantTree {
    let mut tree = DescendantTree::default();
    let mut marks = TraceMarks::default();

    for id in stash.nodes_for(&symbol) {
        if !stash.node(id).is_toplevel() {
            continue;
        }
        stash.foreach_trace_from(id, |trace, size| tree.add_trace(trace, size, &mut marks));
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::profile_from;

    #[test]
    fn test_callers_recursion_counted_once() {
        // main -> a -> b -> a -> b
        let profile = profile_from(&[(&["main", "a", "b", "a", "b"], 4), (&["main", "a", "b"], 1)]);
        let b = profile.symbol("b").unwrap();
        let a = profile.symbol("a").unwrap();

        let result = callers(profile.stash(), b);
        assert_eq!(result, vec![(Some(a), 5, 5)]);
    }

    #[test]
    fn test_callers_of_root_are_spontaneous() {
        let profile = profile_from(&[(&["main"], 2), (&["main", "work"], 1), (&["work"], 3)]);
        let main = profile.symbol("main").unwrap();
        let work = profile.symbol("work").unwrap();

        assert_eq!(callers(profile.stash(), main), vec![(None, 2, 3)]);

        let mut result = callers(profile.stash(), work);
        result.sort_unstable();
        assert_eq!(result, vec![(None, 3, 3), (Some(main), 1, 1)]);
    }

    #[test]
    fn test_descendants_merges_occurrences() {
        let profile = profile_from(&[
            (&["main", "a", "work"], 3),
            (&["main", "b", "a", "work"], 2),
            (&["main", "b", "a"], 1),
        ]);
        let a = profile.symbol("a").unwrap();
        let work = profile.symbol("work").unwrap();

        let tree = descendants(profile.stash(), a);
        let roots: Vec<&Descendant> = tree.roots().collect();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].symbol, a);
        assert_eq!(roots[0].total, 6);
        assert_eq!(roots[0].self_weight, 1);

        let children: Vec<&Descendant> = tree.children(tree.roots[0]).collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].symbol, work);
        assert_eq!((children[0].self_weight, children[0].total), (5, 5));
    }

    #[test]
    fn test_descendants_fold_recursion() {
        // a -> b -> a -> c: the inner a folds onto the root
        let profile = profile_from(&[(&["a", "b", "a", "c"], 2), (&["a", "b"], 1)]);
        let a = profile.symbol("a").unwrap();
        let b = profile.symbol("b").unwrap();
        let c = profile.symbol("c").unwrap();

        let tree = descendants(profile.stash(), a);
        let root = tree.roots[0];
        assert_eq!(tree.node(root).total, 3);

        let kids: Vec<(SymbolId, u64, u64)> =
            tree.children(root).map(|d| (d.symbol, d.self_weight, d.total)).collect();
        assert!(kids.contains(&(b, 1, 3)));
        assert!(kids.contains(&(c, 2, 2)));
        assert_eq!(tree.nodes().len(), 3);
    }

    #[test]
    fn test_descendants_non_recursive_total() {
        // a -> b -> a -> c: b is skipped over by the re-entry into a
        let profile = profile_from(&[(&["a", "b", "a", "c"], 2), (&["a", "b"], 1)]);
        let a = profile.symbol("a").unwrap();

        let tree = descendants(profile.stash(), a);
        let weights: HashMap<&str, (u64, u64)> = tree
            .nodes()
            .iter()
            .map(|d| (profile.symbols().name(d.symbol), (d.total, d.non_recursion)))
            .collect();

        assert_eq!(weights["a"], (3, 3));
        assert_eq!(weights["b"], (3, 1));
        assert_eq!(weights["c"], (2, 2));
    }

    #[test]
    fn test_descendants_non_recursive_without_recursion() {
        let profile = profile_from(&[(&["main", "work", "leaf"], 4), (&["main", "work"], 1)]);
        let main = profile.symbol("main").unwrap();

        let tree = descendants(profile.stash(), main);
        assert!(tree.nodes().iter().all(|d| d.non_recursion == d.total));
    }
}
