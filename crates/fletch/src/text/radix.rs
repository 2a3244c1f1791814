//! Prefix-iterable map from word to a shared target, used as the word store
//! of every text index. In addition to plain insert/delete (expressed as a
//! single `mutate` closure), the tree supports lexically-ordered iteration
//! over a prefix-bounded word range and a path iterator that exposes child
//! edges for bounded-edit-distance walks.
//!
//! Structural invariants:
//! - no two children of a node share a first byte,
//! - every non-root edge carries at least one byte,
//! - a node without a target and with a single child is merged with it,
//! - a node without a target and without children is removed.

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOp {
    None,
    Add,
    Sub,
}

struct Node<T> {
    edge: Vec<u8>,
    target: Option<T>,
    /// Sum of per-word key counts in this subtree, adjusted by [`CountOp`].
    subtree_keys: u64,
    /// Sorted by first edge byte.
    children: Vec<Node<T>>,
}

impl<T> Node<T> {
    fn new(edge: Vec<u8>) -> Self {
        metrics::track_allocation(node_bytes(edge.len()));
        Node { edge, target: None, subtree_keys: 0, children: Vec::new() }
    }

    fn child_position(&self, byte: u8) -> Option<usize> {
        self.children.iter().position(|c| c.edge[0] == byte)
    }
}

impl<T> Drop for Node<T> {
    fn drop(&mut self) {
        metrics::track_deallocation(node_bytes(self.edge.len()));
    }
}

fn node_bytes(edge_len: usize) -> usize {
    std::mem::size_of::<Node<()>>() + edge_len
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub struct RadixTree<T> {
    root: Node<T>,
    word_count: u64,
    longest_word: usize,
}

impl<T> Default for RadixTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RadixTree<T> {
    pub fn new() -> Self {
        RadixTree { root: Node::new(Vec::new()), word_count: 0, longest_word: 0 }
    }

    pub fn total_unique_word_count(&self) -> u64 {
        self.word_count
    }

    pub fn longest_word(&self) -> usize {
        self.longest_word
    }

    /// Number of keys (per the `CountOp` bookkeeping) under `prefix`, in
    /// O(len(prefix)).
    pub fn subtree_key_count(&self, prefix: &[u8]) -> u64 {
        match self.locate(prefix) {
            Some((node, _)) => node.subtree_keys,
            None => 0,
        }
    }

    /// Applies `mutate` to the current target of `word`. Receives `None`
    /// when the word has no entry; returning `None` deletes the word.
    /// `count_op` adjusts the per-subtree key count along the word's path.
    pub fn mutate(
        &mut self,
        word: &[u8],
        mutate: impl FnOnce(Option<T>) -> Option<T>,
        count_op: CountOp,
    ) {
        debug_assert!(!word.is_empty(), "empty words are not indexable");
        let existed = self.get(word).is_some();
        // subtractions run while the word's path is still intact
        if existed && count_op == CountOp::Sub {
            self.adjust_counts(word, -1);
        }
        if existed {
            if self.modify_in_place(word, mutate) {
                self.prune_path(word);
                self.word_count -= 1;
            }
        } else if let Some(target) = mutate(None) {
            self.insert(word, target);
            self.word_count += 1;
            self.longest_word = self.longest_word.max(word.len());
        }
        if count_op == CountOp::Add && self.get(word).is_some() {
            self.adjust_counts(word, 1);
        }
    }

    /// Applies `mutate` to an existing word. Returns true when the target
    /// was deleted (the caller prunes the now-empty path).
    fn modify_in_place(
        &mut self,
        word: &[u8],
        mutate: impl FnOnce(Option<T>) -> Option<T>,
    ) -> bool {
        let mut node = &mut self.root;
        let mut remaining = word;
        loop {
            if remaining.is_empty() {
                let taken = node.target.take();
                debug_assert!(taken.is_some());
                return match mutate(taken) {
                    Some(target) => {
                        node.target = Some(target);
                        false
                    }
                    None => true,
                };
            }
            let idx = node.child_position(remaining[0]).expect("existence checked");
            let child = &mut node.children[idx];
            debug_assert!(remaining.starts_with(&child.edge));
            remaining = &remaining[child.edge.len()..];
            node = &mut node.children[idx];
        }
    }

    /// Restores the structural invariants along `word` after its target was
    /// removed: empty nodes go away, target-less single-child nodes merge.
    fn prune_path(&mut self, word: &[u8]) {
        fn rec<T>(node: &mut Node<T>, word: &[u8]) {
            if word.is_empty() {
                return;
            }
            let Some(idx) = node.child_position(word[0]) else { return };
            {
                let child = &mut node.children[idx];
                if !word.starts_with(&child.edge) {
                    return;
                }
                let rest_len = word.len() - child.edge.len();
                rec(child, &word[word.len() - rest_len..]);
            }
            let child = &mut node.children[idx];
            if child.target.is_none() && child.children.is_empty() {
                node.children.remove(idx);
            } else if child.target.is_none() && child.children.len() == 1 {
                let mut only = child.children.pop().expect("one child");
                metrics::track_deallocation(child.edge.len());
                let mut edge = std::mem::take(&mut child.edge);
                edge.extend_from_slice(&only.edge);
                let mut merged = Node::new(edge);
                merged.target = only.target.take();
                merged.subtree_keys = child.subtree_keys;
                merged.children = std::mem::take(&mut only.children);
                node.children[idx] = merged;
            }
        }
        rec(&mut self.root, word);
    }

    pub fn get(&self, word: &[u8]) -> Option<&T> {
        match self.locate(word) {
            Some((node, consumed)) if consumed == 0 => node.target.as_ref(),
            _ => None,
        }
    }

    /// Finds the node owning `prefix`. Returns the node and how many bytes
    /// of its edge extend past the prefix (non-zero when the prefix ends in
    /// the middle of a compressed edge).
    fn locate(&self, prefix: &[u8]) -> Option<(&Node<T>, usize)> {
        let mut node = &self.root;
        let mut remaining = prefix;
        loop {
            if remaining.is_empty() {
                return Some((node, 0));
            }
            let idx = node.child_position(remaining[0])?;
            let child = &node.children[idx];
            let common = common_prefix(&child.edge, remaining);
            if common == remaining.len() {
                return Some((child, child.edge.len() - common));
            }
            if common < child.edge.len() {
                return None;
            }
            node = child;
            remaining = &remaining[common..];
        }
    }

    fn adjust_counts(&mut self, word: &[u8], delta: i64) {
        fn apply(count: &mut u64, delta: i64) {
            *count = count.saturating_add_signed(delta);
        }
        let mut node = &mut self.root;
        let mut remaining = word;
        apply(&mut node.subtree_keys, delta);
        loop {
            if remaining.is_empty() {
                return;
            }
            let Some(idx) = node.child_position(remaining[0]) else { return };
            let child = &mut node.children[idx];
            let common = common_prefix(&child.edge, remaining);
            apply(&mut child.subtree_keys, delta);
            if common == remaining.len() || common < child.edge.len() {
                return;
            }
            node = &mut node.children[idx];
            remaining = &remaining[common..];
        }
    }

    fn insert(&mut self, word: &[u8], target: T) {
        let mut node = &mut self.root;
        let mut remaining = word;
        loop {
            if remaining.is_empty() {
                node.target = Some(target);
                return;
            }
            let Some(idx) = node.child_position(remaining[0]) else {
                let mut leaf = Node::new(remaining.to_vec());
                leaf.target = Some(target);
                let at = node
                    .children
                    .iter()
                    .position(|c| c.edge[0] > remaining[0])
                    .unwrap_or(node.children.len());
                node.children.insert(at, leaf);
                return;
            };
            let child = &mut node.children[idx];
            let common = common_prefix(&child.edge, remaining);
            if common == child.edge.len() {
                node = &mut node.children[idx];
                remaining = &remaining[common..];
                continue;
            }
            // split the compressed edge at the divergence point
            let tail = child.edge.split_off(common);
            metrics::track_deallocation(tail.len());
            let mut lower = Node::new(tail);
            lower.target = child.target.take();
            lower.subtree_keys = child.subtree_keys;
            lower.children = std::mem::take(&mut child.children);
            child.children.push(lower);
            if common == remaining.len() {
                child.target = Some(target);
            } else {
                let mut leaf = Node::new(remaining[common..].to_vec());
                leaf.target = Some(target);
                if leaf.edge[0] < child.children[0].edge[0] {
                    child.children.insert(0, leaf);
                } else {
                    child.children.push(leaf);
                }
            }
            return;
        }
    }

    pub fn word_iter(&self, prefix: &[u8]) -> WordIterator<'_, T> {
        WordIterator::new(self, prefix)
    }

    pub fn path_iter(&self, prefix: &[u8]) -> Option<PathIterator<'_, T>> {
        // a path iterator may start mid-edge; expose the remaining edge bytes
        let (node, pending) = self.locate(prefix)?;
        Some(PathIterator {
            node,
            path: prefix.to_vec(),
            pending_edge: node.edge[node.edge.len() - pending..].to_vec(),
            child_idx: 0,
        })
    }
}

struct Frame<'a, T> {
    node: &'a Node<T>,
    child_idx: usize,
    edge_len: usize,
    visited: bool,
}

/// In-order iteration over the words sharing a prefix. The tree must not be
/// mutated while an iterator is live (queries hold the schema read guard).
pub struct WordIterator<'a, T> {
    stack: Vec<Frame<'a, T>>,
    word: Vec<u8>,
    positioned: bool,
}

impl<'a, T> WordIterator<'a, T> {
    fn new(tree: &'a RadixTree<T>, prefix: &[u8]) -> Self {
        let mut iter = WordIterator { stack: Vec::new(), word: Vec::new(), positioned: false };
        match tree.locate(prefix) {
            Some((node, pending)) => {
                iter.word.extend_from_slice(&prefix[..prefix.len().saturating_sub(
                    node.edge.len().saturating_sub(pending),
                )]);
                iter.push(node);
                iter.advance();
            }
            None => iter.positioned = true, // exhausted
        }
        iter
    }

    fn push(&mut self, node: &'a Node<T>) {
        self.word.extend_from_slice(&node.edge);
        self.stack.push(Frame { node, child_idx: 0, edge_len: node.edge.len(), visited: false });
    }

    pub fn done(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn word(&self) -> &[u8] {
        debug_assert!(!self.done());
        &self.word
    }

    pub fn target(&self) -> &T {
        debug_assert!(!self.done());
        self.stack.last().and_then(|f| f.node.target.as_ref()).expect("positioned on a word")
    }

    pub fn next(&mut self) {
        debug_assert!(!self.done());
        self.advance();
    }

    /// Positions the iterator on the first word >= `word`. Returns true iff
    /// the landing spot equals `word`.
    pub fn seek_forward(&mut self, word: &[u8]) -> bool {
        while !self.done() && self.word.as_slice() < word {
            self.next();
        }
        !self.done() && self.word.as_slice() == word
    }

    fn advance(&mut self) {
        loop {
            let Some(top) = self.stack.last_mut() else { return };
            if !top.visited {
                top.visited = true;
                if top.node.target.is_some() {
                    return;
                }
            }
            if top.child_idx < top.node.children.len() {
                let child = &top.node.children[top.child_idx];
                top.child_idx += 1;
                self.push(child);
                continue;
            }
            let frame = self.stack.pop().expect("non-empty stack");
            self.word.truncate(self.word.len() - frame.edge_len);
        }
    }
}

/// Child-edge iteration for bounded-edit-distance search. Each iterator is
/// parked at one node; `descend_new` produces a fresh iterator for the child
/// currently under the cursor.
pub struct PathIterator<'a, T> {
    node: &'a Node<T>,
    path: Vec<u8>,
    /// Bytes of this node's edge not yet consumed by `path` (the iterator
    /// was created from a prefix ending inside a compressed edge).
    pending_edge: Vec<u8>,
    child_idx: usize,
}

impl<'a, T> Clone for PathIterator<'a, T> {
    fn clone(&self) -> Self {
        PathIterator {
            node: self.node,
            path: self.path.clone(),
            pending_edge: self.pending_edge.clone(),
            child_idx: self.child_idx,
        }
    }
}

impl<'a, T> PathIterator<'a, T> {
    /// True when this position spells a complete word.
    pub fn is_word(&self) -> bool {
        self.pending_edge.is_empty() && self.node.target.is_some()
    }

    pub fn target(&self) -> Option<&'a T> {
        if self.pending_edge.is_empty() {
            self.node.target.as_ref()
        } else {
            None
        }
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// Is the cursor on a valid child (or pending edge byte)?
    pub fn can_descend(&self) -> bool {
        if !self.pending_edge.is_empty() {
            return true;
        }
        self.child_idx < self.node.children.len()
    }

    /// The next byte under the cursor.
    pub fn current_byte(&self) -> Option<u8> {
        if let Some(&b) = self.pending_edge.first() {
            return Some(b);
        }
        self.node.children.get(self.child_idx).map(|c| c.edge[0])
    }

    /// Advances the cursor to the next sibling edge.
    pub fn next_child(&mut self) {
        if self.pending_edge.is_empty() {
            self.child_idx += 1;
        } else {
            // a mid-edge position has exactly one continuation
            self.pending_edge.clear();
            self.child_idx = self.node.children.len();
        }
    }

    /// Seeks the cursor to the first child byte >= `target`. Returns true
    /// iff the landing byte equals `target`.
    pub fn seek_forward(&mut self, target: u8) -> bool {
        if let Some(&b) = self.pending_edge.first() {
            if b >= target {
                return b == target;
            }
            self.next_child();
            return false;
        }
        while self.child_idx < self.node.children.len()
            && self.node.children[self.child_idx].edge[0] < target
        {
            self.child_idx += 1;
        }
        self.current_byte() == Some(target)
    }

    /// Descends one byte along the cursor.
    pub fn descend_new(&self) -> PathIterator<'a, T> {
        debug_assert!(self.can_descend());
        if !self.pending_edge.is_empty() {
            let mut path = self.path.clone();
            path.push(self.pending_edge[0]);
            return PathIterator {
                node: self.node,
                path,
                pending_edge: self.pending_edge[1..].to_vec(),
                child_idx: 0,
            };
        }
        let child = &self.node.children[self.child_idx];
        let mut path = self.path.clone();
        path.push(child.edge[0]);
        PathIterator { node: child, path, pending_edge: child.edge[1..].to_vec(), child_idx: 0 }
    }
}
