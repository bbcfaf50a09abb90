use std::ptr::NonNull;

use crate::{header::Header, Pointer};

/// Intrusive red-black tree of free regions, ordered by payload size.
///
/// This is not a general purpose tree: the nodes are region headers living
/// inside an arena mapping, so the tree allocates nothing itself (we are the
/// allocator, after all) and it never creates or destroys a node, it only
/// links and unlinks headers handed to it by [`crate::arena::Arena`]. It
/// touches exactly three pointer fields of [`Header`] plus the color bit and
/// size field of the packed word; the used bit and the spatial list are
/// invisible from here.
///
/// Equal sizes always descend to the right on insertion. That makes
/// [`FreeTree::lower_bound`] exact: descending left whenever a node
/// satisfies `size >= key` can never skip over an equal-sized node.
pub(crate) struct FreeTree {
    root: Pointer<Header>,
}

/// `None` leaves count as black, like every textbook nil node.
unsafe fn is_red(node: Pointer<Header>) -> bool {
    node.map_or(false, |n| n.as_ref().is_red())
}

unsafe fn is_black(node: Pointer<Header>) -> bool {
    !is_red(node)
}

unsafe fn copy_color(mut to: NonNull<Header>, from: NonNull<Header>) {
    if from.as_ref().is_red() {
        to.as_mut().set_red();
    } else {
        to.as_mut().set_black();
    }
}

impl FreeTree {
    pub const fn new() -> Self {
        Self { root: None }
    }

    /// Smallest node whose payload size is at least `key`, or `None` if no
    /// free region in this tree fits. O(log n): the best candidate is
    /// updated on every left turn.
    pub unsafe fn lower_bound(&self, key: usize) -> Pointer<Header> {
        let mut best = None;
        let mut current = self.root;

        while let Some(node) = current {
            if node.as_ref().size() >= key {
                best = Some(node);
                current = node.as_ref().left;
            } else {
                current = node.as_ref().right;
            }
        }

        best
    }

    /// Links `node` into the tree. Whatever the header's tree links held
    /// before (used regions leave them dangling) is overwritten here, so the
    /// caller only guarantees that `node` is a valid header that is not
    /// currently in the tree.
    pub unsafe fn insert(&mut self, mut node: NonNull<Header>) {
        node.as_mut().left = None;
        node.as_mut().right = None;
        node.as_mut().parent = None;

        let key = node.as_ref().size();

        let mut parent = None;
        let mut current = self.root;
        while let Some(c) = current {
            parent = Some(c);
            // Equal sizes go right. lower_bound depends on this tie break.
            current = if key < c.as_ref().size() {
                c.as_ref().left
            } else {
                c.as_ref().right
            };
        }

        node.as_mut().parent = parent;
        match parent {
            None => self.root = Some(node),
            Some(mut p) => {
                if key < p.as_ref().size() {
                    p.as_mut().left = Some(node);
                } else {
                    p.as_mut().right = Some(node);
                }
            }
        }

        node.as_mut().set_red();
        self.insert_fixup(node);
    }

    /// Restores the red-black properties after inserting a red `node`. The
    /// usual three cases, mirrored for both sides: red uncle recolors and
    /// walks up; black uncle with a zig-zag rotates the parent first; then
    /// the zig-zig rotation at the grandparent terminates.
    unsafe fn insert_fixup(&mut self, mut node: NonNull<Header>) {
        while is_red(node.as_ref().parent) {
            let mut parent = node.as_ref().parent.unwrap();
            // A red parent is never the root, so the grandparent exists.
            let mut grandparent = parent.as_ref().parent.unwrap();

            if Some(parent) == grandparent.as_ref().left {
                if let Some(mut uncle) = grandparent.as_ref().right.filter(|u| u.as_ref().is_red())
                {
                    parent.as_mut().set_black();
                    uncle.as_mut().set_black();
                    grandparent.as_mut().set_red();
                    node = grandparent;
                } else {
                    if Some(node) == parent.as_ref().right {
                        node = parent;
                        self.rotate_left(node);
                    }
                    let mut parent = node.as_ref().parent.unwrap();
                    let mut grandparent = parent.as_ref().parent.unwrap();
                    parent.as_mut().set_black();
                    grandparent.as_mut().set_red();
                    self.rotate_right(grandparent);
                }
            } else {
                if let Some(mut uncle) = grandparent.as_ref().left.filter(|u| u.as_ref().is_red())
                {
                    parent.as_mut().set_black();
                    uncle.as_mut().set_black();
                    grandparent.as_mut().set_red();
                    node = grandparent;
                } else {
                    if Some(node) == parent.as_ref().left {
                        node = parent;
                        self.rotate_right(node);
                    }
                    let mut parent = node.as_ref().parent.unwrap();
                    let mut grandparent = parent.as_ref().parent.unwrap();
                    parent.as_mut().set_black();
                    grandparent.as_mut().set_red();
                    self.rotate_left(grandparent);
                }
            }
        }

        self.root.unwrap().as_mut().set_black();
    }

    /// Unlinks `node` from the tree. `node` must currently be in this tree.
    ///
    /// Splicing by transplant: a node with fewer than two children is
    /// replaced by its only child (possibly a nil), otherwise the in-order
    /// successor takes its slot and inherits its color, so the potential
    /// black deficiency appears where the successor used to be. When the
    /// spliced-out position was black, [`Self::remove_fixup`] repairs the
    /// black heights from there.
    pub unsafe fn remove(&mut self, node: NonNull<Header>) {
        let removed_black;
        let fix_node;
        let fix_parent;

        if node.as_ref().left.is_none() {
            removed_black = node.as_ref().is_black();
            fix_node = node.as_ref().right;
            fix_parent = node.as_ref().parent;
            self.transplant(node, node.as_ref().right);
        } else if node.as_ref().right.is_none() {
            removed_black = node.as_ref().is_black();
            fix_node = node.as_ref().left;
            fix_parent = node.as_ref().parent;
            self.transplant(node, node.as_ref().left);
        } else {
            let mut successor = Self::minimum(node.as_ref().right.unwrap());
            removed_black = successor.as_ref().is_black();
            fix_node = successor.as_ref().right;

            if successor.as_ref().parent == Some(node) {
                fix_parent = Some(successor);
            } else {
                fix_parent = successor.as_ref().parent;
                self.transplant(successor, successor.as_ref().right);
                successor.as_mut().right = node.as_ref().right;
                let mut right = successor.as_ref().right.unwrap();
                right.as_mut().parent = Some(successor);
            }

            self.transplant(node, Some(successor));
            successor.as_mut().left = node.as_ref().left;
            let mut left = successor.as_ref().left.unwrap();
            left.as_mut().parent = Some(successor);
            copy_color(successor, node);
        }

        if removed_black {
            self.remove_fixup(fix_node, fix_parent);
        }
    }

    /// Repairs the black heights after a black node was spliced out.
    /// `node` is the child that took the spliced position (a nil when the
    /// removed node was a leaf, hence the separate `parent`). The four
    /// sibling cases, mirrored: red sibling rotates to expose a black one;
    /// black sibling with two black children recolors and walks up; black
    /// sibling with only the inner child red rotates the sibling to reduce
    /// to the last case; black sibling with a red outer child recolors,
    /// rotates the parent and terminates.
    unsafe fn remove_fixup(&mut self, mut node: Pointer<Header>, mut parent: Pointer<Header>) {
        while node != self.root && is_black(node) {
            let Some(mut p) = parent else { break };

            if node == p.as_ref().left {
                let mut sibling = p.as_ref().right.unwrap();

                if sibling.as_ref().is_red() {
                    sibling.as_mut().set_black();
                    p.as_mut().set_red();
                    self.rotate_left(p);
                    sibling = p.as_ref().right.unwrap();
                }

                if is_black(sibling.as_ref().left) && is_black(sibling.as_ref().right) {
                    sibling.as_mut().set_red();
                    node = Some(p);
                    parent = p.as_ref().parent;
                } else {
                    if is_black(sibling.as_ref().right) {
                        if let Some(mut inner) = sibling.as_ref().left {
                            inner.as_mut().set_black();
                        }
                        sibling.as_mut().set_red();
                        self.rotate_right(sibling);
                        sibling = p.as_ref().right.unwrap();
                    }

                    copy_color(sibling, p);
                    p.as_mut().set_black();
                    let mut outer = sibling.as_ref().right.unwrap();
                    outer.as_mut().set_black();
                    self.rotate_left(p);
                    node = self.root;
                    parent = None;
                }
            } else {
                let mut sibling = p.as_ref().left.unwrap();

                if sibling.as_ref().is_red() {
                    sibling.as_mut().set_black();
                    p.as_mut().set_red();
                    self.rotate_right(p);
                    sibling = p.as_ref().left.unwrap();
                }

                if is_black(sibling.as_ref().left) && is_black(sibling.as_ref().right) {
                    sibling.as_mut().set_red();
                    node = Some(p);
                    parent = p.as_ref().parent;
                } else {
                    if is_black(sibling.as_ref().left) {
                        if let Some(mut inner) = sibling.as_ref().right {
                            inner.as_mut().set_black();
                        }
                        sibling.as_mut().set_red();
                        self.rotate_left(sibling);
                        sibling = p.as_ref().left.unwrap();
                    }

                    copy_color(sibling, p);
                    p.as_mut().set_black();
                    let mut outer = sibling.as_ref().left.unwrap();
                    outer.as_mut().set_black();
                    self.rotate_right(p);
                    node = self.root;
                    parent = None;
                }
            }
        }

        if let Some(mut node) = node {
            node.as_mut().set_black();
        }
    }

    /// Replaces the subtree rooted at `u` with the subtree rooted at `v` in
    /// `u`'s parent. `u`'s own links are left untouched.
    unsafe fn transplant(&mut self, u: NonNull<Header>, v: Pointer<Header>) {
        match u.as_ref().parent {
            None => self.root = v,
            Some(mut p) => {
                if Some(u) == p.as_ref().left {
                    p.as_mut().left = v;
                } else {
                    p.as_mut().right = v;
                }
            }
        }

        if let Some(mut v) = v {
            v.as_mut().parent = u.as_ref().parent;
        }
    }

    /// Leftmost node of the subtree rooted at `node`.
    unsafe fn minimum(mut node: NonNull<Header>) -> NonNull<Header> {
        while let Some(left) = node.as_ref().left {
            node = left;
        }
        node
    }

    unsafe fn rotate_left(&mut self, mut x: NonNull<Header>) {
        let mut y = x.as_ref().right.unwrap();

        x.as_mut().right = y.as_ref().left;
        if let Some(mut child) = y.as_ref().left {
            child.as_mut().parent = Some(x);
        }

        y.as_mut().parent = x.as_ref().parent;
        match x.as_ref().parent {
            None => self.root = Some(y),
            Some(mut p) => {
                if Some(x) == p.as_ref().left {
                    p.as_mut().left = Some(y);
                } else {
                    p.as_mut().right = Some(y);
                }
            }
        }

        y.as_mut().left = Some(x);
        x.as_mut().parent = Some(y);
    }

    unsafe fn rotate_right(&mut self, mut x: NonNull<Header>) {
        let mut y = x.as_ref().left.unwrap();

        x.as_mut().left = y.as_ref().right;
        if let Some(mut child) = y.as_ref().right {
            child.as_mut().parent = Some(x);
        }

        y.as_mut().parent = x.as_ref().parent;
        match x.as_ref().parent {
            None => self.root = Some(y),
            Some(mut p) => {
                if Some(x) == p.as_ref().right {
                    p.as_mut().right = Some(y);
                } else {
                    p.as_mut().left = Some(y);
                }
            }
        }

        y.as_mut().right = Some(x);
        x.as_mut().parent = Some(y);
    }
}

#[cfg(test)]
impl FreeTree {
    /// In-order traversal. Only needed to check invariants from tests, both
    /// here and in the arena tests.
    pub(crate) unsafe fn in_order(&self) -> Vec<NonNull<Header>> {
        unsafe fn walk(node: Pointer<Header>, out: &mut Vec<NonNull<Header>>) {
            if let Some(node) = node {
                walk(node.as_ref().left, out);
                out.push(node);
                walk(node.as_ref().right, out);
            }
        }

        let mut nodes = Vec::new();
        walk(self.root, &mut nodes);
        nodes
    }

    /// Panics unless every red-black property holds: black root, no red node
    /// with a red child, equal black count on every root-to-nil path, parent
    /// links consistent, and in-order sizes sorted.
    pub(crate) unsafe fn assert_valid(&self) {
        unsafe fn black_height(node: NonNull<Header>) -> usize {
            if node.as_ref().is_red() {
                assert!(is_black(node.as_ref().left), "red node with red left child");
                assert!(is_black(node.as_ref().right), "red node with red right child");
            }

            let left = match node.as_ref().left {
                Some(left) => {
                    assert_eq!(left.as_ref().parent, Some(node), "broken parent link");
                    black_height(left)
                }
                None => 1,
            };
            let right = match node.as_ref().right {
                Some(right) => {
                    assert_eq!(right.as_ref().parent, Some(node), "broken parent link");
                    black_height(right)
                }
                None => 1,
            };
            assert_eq!(left, right, "black height mismatch");

            left + usize::from(node.as_ref().is_black())
        }

        if let Some(root) = self.root {
            assert!(root.as_ref().is_black(), "root must be black");
            assert_eq!(root.as_ref().parent, None);
            black_height(root);
        }

        let sizes: Vec<usize> = self.in_order().iter().map(|n| n.as_ref().size()).collect();
        assert!(
            sizes.windows(2).all(|pair| pair[0] <= pair[1]),
            "in-order sizes not sorted: {sizes:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Tree nodes normally live inside arena mappings, but the tree does not
    /// care, so tests grow them on the regular heap.
    fn node(size: usize) -> NonNull<Header> {
        NonNull::from(Box::leak(Box::new(Header::with_payload_size(size))))
    }

    fn destroy(nodes: impl IntoIterator<Item = NonNull<Header>>) {
        for n in nodes {
            unsafe { drop(Box::from_raw(n.as_ptr())) };
        }
    }

    unsafe fn sizes_of(tree: &FreeTree) -> Vec<usize> {
        tree.in_order().iter().map(|n| n.as_ref().size()).collect()
    }

    #[test]
    fn single_insertion_makes_a_black_root() {
        let mut tree = FreeTree::new();
        let n = node(10);

        unsafe {
            tree.insert(n);
            tree.assert_valid();

            assert_eq!(tree.root, Some(n));
            assert!(n.as_ref().is_black());
            assert_eq!(tree.lower_bound(10), Some(n));
        }

        destroy([n]);
    }

    #[test]
    fn ascending_insertions_stay_balanced() {
        let mut tree = FreeTree::new();
        let nodes: Vec<_> = (1..=64).map(|i| node(i * 10)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
                tree.assert_valid();
            }

            assert_eq!(tree.in_order().len(), 64);
            assert_eq!(sizes_of(&tree), (1..=64).map(|i| i * 10).collect::<Vec<_>>());
        }

        destroy(nodes);
    }

    #[test]
    fn shuffled_insertions_stay_balanced() {
        let mut tree = FreeTree::new();
        let values = [50, 25, 75, 10, 30, 60, 80, 5, 15, 27, 55, 65];
        let nodes: Vec<_> = values.iter().map(|&v| node(v)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            tree.assert_valid();

            let mut sorted = values.to_vec();
            sorted.sort_unstable();
            assert_eq!(sizes_of(&tree), sorted);
        }

        destroy(nodes);
    }

    #[test]
    fn duplicate_sizes_coexist() {
        let mut tree = FreeTree::new();
        let nodes: Vec<_> = (0..5).map(|_| node(128)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            tree.assert_valid();
            assert_eq!(tree.in_order().len(), 5);

            // Every duplicate must be reachable through repeated removal.
            for &n in &nodes {
                assert!(tree.lower_bound(128).is_some());
                tree.remove(n);
                tree.assert_valid();
            }
            assert_eq!(tree.root, None);
        }

        destroy(nodes);
    }

    #[test]
    fn removing_leaves_inner_nodes_and_the_root() {
        let mut tree = FreeTree::new();
        let values = [35, 30, 20, 25, 10, 40, 5];
        let nodes: Vec<_> = values.iter().map(|&v| node(v)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            tree.assert_valid();

            // Leaf, then a node with two children, then whatever currently
            // sits at the root.
            tree.remove(nodes[6]);
            tree.assert_valid();
            assert_eq!(sizes_of(&tree), [10, 20, 25, 30, 35, 40]);

            tree.remove(nodes[1]);
            tree.assert_valid();
            assert_eq!(sizes_of(&tree), [10, 20, 25, 35, 40]);

            let root = tree.root.unwrap();
            tree.remove(root);
            tree.assert_valid();
            assert_eq!(tree.in_order().len(), 4);
        }

        destroy(nodes);
    }

    #[test]
    fn removing_everything_empties_the_tree() {
        let mut tree = FreeTree::new();
        let nodes: Vec<_> = (1..=10).map(|i| node(i * 10)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }

            for &n in &nodes {
                tree.remove(n);
                tree.assert_valid();
            }

            assert_eq!(tree.root, None);
            assert_eq!(tree.lower_bound(0), None);
        }

        destroy(nodes);
    }

    #[test]
    fn lower_bound_cases() {
        let mut tree = FreeTree::new();

        unsafe {
            assert_eq!(tree.lower_bound(10), None);
        }

        let nodes: Vec<_> = [10, 20, 30, 40, 50].iter().map(|&v| node(v)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }

            // Exact match, between two keys, below all, above all.
            assert_eq!(tree.lower_bound(30).unwrap().as_ref().size(), 30);
            assert_eq!(tree.lower_bound(25).unwrap().as_ref().size(), 30);
            assert_eq!(tree.lower_bound(5).unwrap().as_ref().size(), 10);
            assert_eq!(tree.lower_bound(60), None);
        }

        destroy(nodes);
    }

    #[test]
    fn lower_bound_never_skips_duplicates() {
        let mut tree = FreeTree::new();
        let mut values = Vec::new();
        for _ in 0..3 {
            values.extend(1..=18);
        }
        let nodes: Vec<_> = values.iter().map(|&v| node(v)).collect();

        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            tree.assert_valid();

            let mut oracle = values.clone();
            oracle.sort_unstable();

            for key in [1, 23, 5, 6, 10, 20, 7, 9, 11, 14] {
                let expected = oracle.iter().copied().find(|&v| v >= key);
                let found = tree.lower_bound(key);
                assert_eq!(found.map(|n| n.as_ref().size()), expected, "key {key}");
            }
        }

        destroy(nodes);
    }

    #[test]
    fn stress_against_sorted_oracle() {
        let mut rng = StdRng::seed_from_u64(0xF17);
        let mut tree = FreeTree::new();
        let mut live: Vec<NonNull<Header>> = Vec::new();
        let mut graveyard: Vec<NonNull<Header>> = Vec::new();

        let rounds = if cfg!(miri) { 200 } else { 5_000 };

        unsafe {
            for _ in 0..rounds {
                if live.is_empty() || rng.gen_bool(0.6) {
                    let n = node(rng.gen_range(1..=1024));
                    tree.insert(n);
                    live.push(n);
                } else {
                    let n = live.swap_remove(rng.gen_range(0..live.len()));
                    tree.remove(n);
                    graveyard.push(n);
                }
            }

            tree.assert_valid();

            let mut oracle: Vec<usize> = live.iter().map(|n| n.as_ref().size()).collect();
            oracle.sort_unstable();
            assert_eq!(sizes_of(&tree), oracle);

            for _ in 0..500 {
                let key = rng.gen_range(1..=1100);
                let expected = oracle.iter().copied().find(|&v| v >= key);
                assert_eq!(tree.lower_bound(key).map(|n| n.as_ref().size()), expected);
            }
        }

        destroy(live.into_iter().chain(graveyard));
    }
}
