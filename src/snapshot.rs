//! The snapshot flag protocol.
//!
//! A snapshot runs in phases against a live tree: **scan** (mark nodes of
//! interest relevant, observe newness), **commit** (request newness clears
//! on what was serialised), **flush** (apply the clears and reap committed
//! tombstones). The tree may mutate freely between phases; this module owns
//! the transitions the phases are allowed to make.

use crate::tree::{EntryId, Tree};

/// Record that a node has just been deleted (it is already demoted to a
/// namespace; the caller still holds the tree-position count it is about to
/// release).
///
/// Nodes still marked NEW were never seen by a scan, so there is nothing to
/// record: they are left to die with the caller's release. Anything else is
/// tombstoned and pinned with an extra count until the next [`flush`].
pub fn record_node_deletion(tree: &mut Tree, entry: EntryId) {
    if tree.is_new(entry) {
        return;
    }
    tree.set_deleted(entry);
    tree.add_ref(entry);
}

/// The flush phase: clear newness wherever the snapshotter committed it,
/// then physically remove every committed tombstone.
///
/// A reaped zombie normally dies on the spot; if children still pin it, its
/// flags are cleared and it lives on as a plain namespace.
pub fn flush(tree: &mut Tree) {
    let mut ids = Vec::new();
    tree.walk_all(|id, _| ids.push(id));

    let mut to_reap = Vec::new();
    for id in ids {
        if tree.is_newness_clear_required(id) {
            tree.clear_newness(id);
        }
        if tree.is_deleted(id) && !tree.is_new(id) {
            to_reap.push(id);
        }
    }
    for id in to_reap {
        tree.clear_flags(id);
        tree.release(id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deleting_a_never_scanned_node_leaves_no_tombstone() {
        let mut tree = Tree::new(None);
        let root = tree.root();
        let a = tree.get_entry(root, "a").unwrap();
        assert!(tree.is_new(a));

        record_node_deletion(&mut tree, a);
        assert!(!tree.is_deleted(a));
        // The caller's release is the last count.
        tree.release(a);
        assert!(tree.find(root, "a").is_none());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn deleting_a_scanned_node_tombstones_it_until_flush() {
        let mut tree = Tree::new(None);
        let root = tree.root();
        let a = tree.get_entry(root, "a").unwrap();
        tree.set_clear_newness(a);
        tree.clear_newness(a);

        record_node_deletion(&mut tree, a);
        tree.release(a);

        // The zombie survives the release, invisible to lookup.
        assert!(tree.is_deleted(a));
        assert_eq!(tree.len(), 2);
        assert!(tree.find(root, "a").is_none());

        flush(&mut tree);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn flush_clears_committed_newness_only() {
        let mut tree = Tree::new(None);
        let root = tree.root();
        let a = tree.get_entry(root, "a").unwrap();
        let b = tree.get_entry(root, "b").unwrap();

        // The snapshotter committed a but never saw b.
        tree.set_clear_newness(a);
        flush(&mut tree);

        assert!(!tree.is_new(a));
        assert!(!tree.is_newness_clear_required(a));
        assert!(tree.is_new(b));
    }

    #[test]
    fn flush_spares_uncommitted_relevance() {
        let mut tree = Tree::new(None);
        let root = tree.root();
        let a = tree.get_entry(root, "a").unwrap();
        tree.set_relevance(a, true);
        flush(&mut tree);
        assert!(tree.is_relevant(a));
    }

    #[test]
    fn reaped_zombie_with_children_becomes_a_namespace() {
        let mut tree = Tree::new(None);
        let root = tree.root();
        let a = tree.get_entry(root, "a").unwrap();
        let b = tree.get_entry(root, "a/b").unwrap();
        tree.set_clear_newness(a);
        tree.clear_newness(a);

        record_node_deletion(&mut tree, a);
        tree.release(a);
        assert!(tree.is_deleted(a));

        flush(&mut tree);
        // b pins a; a is an ordinary namespace again.
        assert!(!tree.is_deleted(a));
        assert_eq!(tree.find(root, "a"), Some(a));
        assert_eq!(tree.find(root, "a/b"), Some(b));

        // A second flush must not release it again.
        flush(&mut tree);
        assert_eq!(tree.find(root, "a"), Some(a));
    }

    #[test]
    fn post_flush_invariant() {
        let mut tree = Tree::new(None);
        let root = tree.root();
        for p in ["a", "a/b", "c"] {
            tree.get_entry(root, p).unwrap();
        }
        let mut ids = Vec::new();
        tree.walk_all(|id, _| ids.push(id));
        for id in &ids {
            tree.set_clear_newness(*id);
        }
        flush(&mut tree);

        tree.walk_all(|id, _| {
            assert!(!tree.is_new(id));
            assert!(!(tree.is_deleted(id) && !tree.is_new(id)));
        });
    }
}
