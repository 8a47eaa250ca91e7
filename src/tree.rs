//! The resource tree: a hierarchical namespace of reference-counted entries.
//!
//! Entries live in an arena and are addressed by stable [`EntryId`] handles.
//! Ownership follows three rules: every entry holds one count for its place
//! in the tree, every child holds one count on its parent, and a tombstoned
//! ("zombie") entry holds one extra count until the snapshotter flushes it.
//! An entry is destroyed when its count reaches zero and it has no children;
//! destruction unlinks it from its parent and drops the parent count, so
//! empty ancestors unwind naturally.

use tracing::error;

use crate::error::{Error, Result};
use crate::path::{self, MAX_PATH_LEN};
use crate::res::Resource;

/// Snapshot bookkeeping flags carried by namespace entries (and mirrored
/// inside [`Resource`] for resource-attached entries).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct NodeFlags {
    bits: u8,
}

impl NodeFlags {
    const NEW: u8 = 1 << 0;
    const RELEVANT: u8 = 1 << 1;
    const CLEAR_NEW: u8 = 1 << 2;
    const DELETED: u8 = 1 << 3;

    /// Flags for a freshly created (or resurrected) entry.
    pub(crate) fn new_entry() -> Self {
        NodeFlags { bits: Self::NEW }
    }

    pub(crate) fn is_new(self) -> bool {
        self.bits & Self::NEW != 0
    }

    pub(crate) fn is_relevant(self) -> bool {
        self.bits & Self::RELEVANT != 0
    }

    pub(crate) fn set_relevant(&mut self, relevant: bool) {
        if relevant {
            self.bits |= Self::RELEVANT;
        } else {
            self.bits &= !Self::RELEVANT;
        }
    }

    pub(crate) fn is_clear_required(self) -> bool {
        self.bits & Self::CLEAR_NEW != 0
    }

    pub(crate) fn mark_clear_required(&mut self) {
        self.bits |= Self::CLEAR_NEW;
    }

    /// Clear both NEW and CLEAR_NEW: this node's newness has been committed.
    pub(crate) fn clear_newness(&mut self) {
        self.bits &= !(Self::NEW | Self::CLEAR_NEW);
    }

    pub(crate) fn is_deleted(self) -> bool {
        self.bits & Self::DELETED != 0
    }

    pub(crate) fn mark_deleted(&mut self) {
        self.bits |= Self::DELETED;
    }

    pub(crate) fn clear_all(&mut self) {
        self.bits = 0;
    }
}

/// What kind of thing an entry is.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryType {
    Namespace,
    Placeholder,
    Input,
    Output,
    Observation,
}

impl EntryType {
    pub fn name(self) -> &'static str {
        match self {
            EntryType::Namespace => "Namespace",
            EntryType::Placeholder => "Placeholder",
            EntryType::Input => "Input",
            EntryType::Output => "Output",
            EntryType::Observation => "Observation",
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable handle to an entry.
///
/// Handles carry a generation tag; using one after its entry has been
/// destroyed is a caller bug and panics.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

/// One node of the resource tree.
#[derive(Debug)]
pub struct Entry {
    name: String,
    parent: Option<EntryId>,
    /// Insertion order is preserved; all traversal sees it.
    children: Vec<EntryId>,
    kind: EntryType,
    /// Snapshot flags; only meaningful while `kind` is `Namespace`
    /// (resource-attached entries keep theirs inside the resource).
    flags: NodeFlags,
    resource: Option<Resource>,
}

impl Entry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_type(&self) -> EntryType {
        self.kind
    }

    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }

    pub fn is_resource(&self) -> bool {
        self.kind != EntryType::Namespace && self.resource.is_some()
    }

    #[inline]
    pub fn resource(&self) -> &Resource {
        match &self.resource {
            Some(r) => r,
            None => panic!("Expected a resource entry"),
        }
    }

    #[inline]
    pub fn resource_mut(&mut self) -> &mut Resource {
        match &mut self.resource {
            Some(r) => r,
            None => panic!("Expected a resource entry"),
        }
    }

    /// Attach a freshly built resource, turning this namespace into a
    /// placeholder. The namespace's snapshot flags move into the resource.
    pub(crate) fn promote_to_placeholder(&mut self, mut resource: Resource) {
        assert_eq!(self.kind, EntryType::Namespace, "Expected a namespace entry");
        *resource.snapshot_flags_mut() = self.flags;
        self.flags = NodeFlags::default();
        self.resource = Some(resource);
        self.kind = EntryType::Placeholder;
    }

    /// Detach the resource, turning this entry back into a namespace.
    /// Flags are cleared except for NEW, which carries over so the deletion
    /// record can tell scanned nodes from never-observed ones. Returns the
    /// resource so the caller can drop it.
    pub(crate) fn demote_to_namespace(&mut self) -> Resource {
        assert_ne!(self.kind, EntryType::Namespace, "Expected a resource entry");
        self.kind = EntryType::Namespace;
        let resource = self.resource.take().expect("resource entry had no resource");
        self.flags.clear_all();
        if resource.snapshot_flags().is_new() {
            self.flags = NodeFlags::new_entry();
        }
        resource
    }

    pub(crate) fn set_kind(&mut self, kind: EntryType) {
        self.kind = kind;
    }
}

struct Slot {
    refs: u32,
    generation: u32,
    entry: Option<Entry>,
}

/// The entry arena. There is exactly one root, named `""`, which is never
/// destroyed.
pub struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    max_entries: Option<usize>,
    root: EntryId,
}

impl Tree {
    pub fn new(max_entries: Option<usize>) -> Self {
        let mut tree = Tree {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_entries,
            root: EntryId { index: 0, generation: 0 },
        };
        // The root bypasses the capacity check; it always exists.
        let root = tree.alloc(Entry {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            kind: EntryType::Namespace,
            flags: NodeFlags::new_entry(),
            resource: None,
        });
        tree.root = root;
        tree
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    /// How many entries are currently live (zombies included).
    pub fn len(&self) -> usize {
        self.live
    }

    fn slot(&self, id: EntryId) -> &Slot {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "Stale entry handle");
        slot
    }

    fn slot_mut(&mut self, id: EntryId) -> &mut Slot {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "Stale entry handle");
        slot
    }

    pub fn entry(&self, id: EntryId) -> &Entry {
        self.slot(id).entry.as_ref().expect("Entry already destroyed")
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        self.slot_mut(id).entry.as_mut().expect("Entry already destroyed")
    }

    fn alloc(&mut self, entry: Entry) -> EntryId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.refs = 1;
            slot.entry = Some(entry);
            EntryId { index, generation: slot.generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { refs: 1, generation: 0, entry: Some(entry) });
            EntryId { index, generation: 0 }
        }
    }

    pub(crate) fn add_ref(&mut self, id: EntryId) {
        self.slot_mut(id).refs += 1;
    }

    /// Drop one count. At zero the entry is destroyed: unlinked from its
    /// parent and the parent count released, cascading up as far as it goes.
    pub(crate) fn release(&mut self, id: EntryId) {
        let mut current = Some(id);
        while let Some(id) = current.take() {
            let slot = self.slot_mut(id);
            assert!(slot.refs > 0, "Entry released too many times");
            slot.refs -= 1;
            if slot.refs > 0 {
                break;
            }

            let entry = slot.entry.as_ref().expect("Entry already destroyed");
            // Every child holds a count on us, so none can remain.
            assert!(entry.children.is_empty());
            let parent = entry.parent.expect("Refusing to destroy the root entry");

            // Unlink, free the slot, then drop our count on the parent.
            slot.entry = None;
            slot.generation += 1;
            self.free.push(id.index);
            self.live -= 1;

            let siblings = &mut self.entry_mut(parent).children;
            let position = siblings
                .iter()
                .position(|&c| c == id)
                .expect("Entry missing from its parent's child list");
            siblings.remove(position);

            current = Some(parent);
        }
    }

    /// Find a child by name. Without `with_zombies`, deleted children are
    /// skipped over.
    pub fn find_child_ex(
        &self,
        parent: EntryId,
        name: &str,
        with_zombies: bool,
    ) -> Option<EntryId> {
        for &child in &self.entry(parent).children {
            if !with_zombies && self.is_deleted(child) {
                continue;
            }
            if self.entry(child).name == name {
                return Some(child);
            }
        }
        None
    }

    pub fn find_child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        self.find_child_ex(parent, name, false)
    }

    /// Walk to the entry at `path` (already validated), relative to `base`.
    ///
    /// A zombie anywhere along the way blocks the lookup: it exists, but is
    /// treated as absent.
    pub fn find(&self, base: EntryId, path: &str) -> Option<EntryId> {
        let mut current = base;
        for name in path::segments(path) {
            let child = self.find_child_ex(current, name, true)?;
            if self.is_deleted(child) {
                return None;
            }
            current = child;
        }
        Some(current)
    }

    /// Create the entry at `path` (already validated; [`Self::find`] must
    /// have come up empty), materialising missing intermediates as fresh
    /// namespaces. Zombies along the way are resurrected in place.
    ///
    /// Returns the leaf and the first entry this call created, for rollback.
    /// On allocation failure everything created here is released in reverse,
    /// resurrected zombies get their tombstones back, and the tree is
    /// exactly as before.
    pub(crate) fn create(
        &mut self,
        base: EntryId,
        path: &str,
    ) -> Result<(EntryId, Option<EntryId>)> {
        let mut current = base;
        let mut first_new = None;
        let mut resurrected = Vec::new();

        let mut names = path::segments(path).peekable();
        while let Some(name) = names.next() {
            let found = self.find_child_ex(current, name, true);
            match found {
                Some(child) if !self.is_deleted(child) => {
                    assert!(
                        names.peek().is_some(),
                        "Attempting to create an entry that already exists"
                    );
                    current = child;
                }
                zombie => {
                    let child = match self.add_child(current, name, zombie) {
                        Ok(child) => child,
                        Err(err) => {
                            error!("Failed to add child, path: {path}");
                            self.rollback_chain(current, first_new);
                            for id in resurrected.into_iter().rev() {
                                self.restore_tombstone(id);
                            }
                            return Err(err);
                        }
                    };
                    if zombie.is_some() {
                        resurrected.push(child);
                    } else if first_new.is_none() {
                        first_new = Some(child);
                    }
                    current = child;
                }
            }
        }
        Ok((current, first_new))
    }

    fn restore_tombstone(&mut self, id: EntryId) {
        let entry = self.entry_mut(id);
        entry.flags.clear_all();
        entry.flags.mark_deleted();
    }

    /// Release the chain from `deepest` up to and including `first_new`.
    pub(crate) fn rollback_chain(&mut self, deepest: EntryId, first_new: Option<EntryId>) {
        let Some(first) = first_new else { return };
        let mut current = deepest;
        loop {
            let parent = self.entry(current).parent();
            let done = current == first;
            self.release(current);
            if done {
                break;
            }
            current = parent.expect("Rollback walked past the root");
        }
    }

    /// Gets the entry at the given path, creating it (and any missing
    /// ancestors) as namespaces if nothing lives there. Never yields a
    /// zombie.
    pub fn get_entry(&mut self, base: EntryId, path: &str) -> Result<EntryId> {
        path::validate(path)?;
        match self.find(base, path) {
            Some(entry) => Ok(entry),
            None => self.create(base, path).map(|(leaf, _)| leaf),
        }
    }

    fn add_child(
        &mut self,
        parent: EntryId,
        name: &str,
        resurrect: Option<EntryId>,
    ) -> Result<EntryId> {
        if let Some(id) = resurrect {
            let entry = self.entry_mut(id);
            assert_eq!(entry.kind, EntryType::Namespace);
            assert_eq!(entry.parent, Some(parent));
            assert!(entry.children.is_empty());
            entry.flags = NodeFlags::new_entry();
            return Ok(id);
        }

        if let Some(max) = self.max_entries {
            if self.live >= max {
                return Err(Error::NoMemory);
            }
        }
        debug_assert!(self.find_child_ex(parent, name, true).is_none());

        let child = self.alloc(Entry {
            name: name.to_owned(),
            parent: Some(parent),
            children: Vec::new(),
            kind: EntryType::Namespace,
            flags: NodeFlags::new_entry(),
            resource: None,
        });
        self.add_ref(parent);
        self.entry_mut(parent).children.push(child);
        Ok(child)
    }

    /// Render the path of `entry` relative to `base`: `/`-joined names,
    /// with a leading `/` when `base` is the root. `NotFound` if `entry`
    /// isn't under `base`, `Overflow` past [`MAX_PATH_LEN`].
    pub fn path_of(&self, base: EntryId, entry: EntryId) -> Result<String> {
        let mut out = String::new();
        self.write_path(base, entry, &mut out)?;
        Ok(out)
    }

    fn write_path(&self, base: EntryId, entry: EntryId, out: &mut String) -> Result<()> {
        if entry == base {
            return Ok(());
        }
        // Ascending reached the root without meeting the base.
        if entry == self.root {
            return Err(Error::NotFound);
        }

        let parent = self.entry(entry).parent().expect("non-root entry without a parent");
        if parent == base {
            if base == self.root {
                out.push('/');
            }
        } else {
            self.write_path(base, parent, out)?;
            out.push('/');
        }
        out.push_str(&self.entry(entry).name);
        if out.len() > MAX_PATH_LEN {
            return Err(Error::Overflow);
        }
        Ok(())
    }

    /// First child, or `None`. Without `with_zombies`, a deleted first
    /// child ends the walk (it is not skipped).
    pub fn first_child_ex(&self, id: EntryId, with_zombies: bool) -> Option<EntryId> {
        let &child = self.entry(id).children.first()?;
        if !with_zombies && self.is_deleted(child) {
            return None;
        }
        Some(child)
    }

    pub fn first_child(&self, id: EntryId) -> Option<EntryId> {
        self.first_child_ex(id, false)
    }

    /// Next sibling, or `None`. Without `with_zombies`, a deleted next
    /// sibling ends the walk (it is not skipped).
    pub fn next_sibling_ex(&self, id: EntryId, with_zombies: bool) -> Option<EntryId> {
        let parent = self.entry(id).parent()?;
        let siblings = &self.entry(parent).children;
        let position = siblings
            .iter()
            .position(|&c| c == id)
            .expect("Entry missing from its parent's child list");
        let &next = siblings.get(position + 1)?;
        if !with_zombies && self.is_deleted(next) {
            return None;
        }
        Some(next)
    }

    pub fn next_sibling(&self, id: EntryId) -> Option<EntryId> {
        self.next_sibling_ex(id, false)
    }

    /// Depth-first pre-order over every entry with an attached resource.
    /// Zombies have no resource, so none are exposed.
    pub fn for_each_resource(&self, mut f: impl FnMut(EntryId, &Entry)) {
        self.visit_resources(self.root, &mut f);
    }

    fn visit_resources(&self, id: EntryId, f: &mut impl FnMut(EntryId, &Entry)) {
        for &child in &self.entry(id).children {
            let entry = self.entry(child);
            if entry.is_resource() {
                f(child, entry);
            }
            self.visit_resources(child, f);
        }
    }

    /// Depth-first pre-order over *every* entry, zombies and root included.
    pub(crate) fn walk_all(&self, mut f: impl FnMut(EntryId, &Entry)) {
        f(self.root, self.entry(self.root));
        self.visit_all(self.root, &mut f);
    }

    fn visit_all(&self, id: EntryId, f: &mut impl FnMut(EntryId, &Entry)) {
        for &child in &self.entry(id).children {
            f(child, self.entry(child));
            self.visit_all(child, f);
        }
    }

    // Snapshot flag accessors. Namespace entries keep flags inline;
    // resource-attached entries mirror them inside the resource.

    pub fn set_relevance(&mut self, id: EntryId, relevant: bool) {
        let entry = self.entry_mut(id);
        match &mut entry.resource {
            None => entry.flags.set_relevant(relevant),
            Some(res) => res.snapshot_flags_mut().set_relevant(relevant),
        }
    }

    pub fn is_relevant(&self, id: EntryId) -> bool {
        let entry = self.entry(id);
        match &entry.resource {
            None => entry.flags.is_relevant(),
            Some(res) => res.snapshot_flags().is_relevant(),
        }
    }

    pub fn set_clear_newness(&mut self, id: EntryId) {
        let entry = self.entry_mut(id);
        match &mut entry.resource {
            None => entry.flags.mark_clear_required(),
            Some(res) => res.snapshot_flags_mut().mark_clear_required(),
        }
    }

    pub fn is_newness_clear_required(&self, id: EntryId) -> bool {
        let entry = self.entry(id);
        match &entry.resource {
            None => entry.flags.is_clear_required(),
            Some(res) => res.snapshot_flags().is_clear_required(),
        }
    }

    /// Mark a node as no longer new, dropping the clear-newness request
    /// along with it.
    pub fn clear_newness(&mut self, id: EntryId) {
        let entry = self.entry_mut(id);
        match &mut entry.resource {
            None => entry.flags.clear_newness(),
            Some(res) => res.snapshot_flags_mut().clear_newness(),
        }
    }

    pub fn is_new(&self, id: EntryId) -> bool {
        let entry = self.entry(id);
        match &entry.resource {
            None => entry.flags.is_new(),
            Some(res) => res.snapshot_flags().is_new(),
        }
    }

    /// Tombstone a node. Only namespaces can carry the flag (deletion
    /// demotes resource entries first), and never nodes still marked NEW:
    /// those aren't worth a deletion record.
    pub(crate) fn set_deleted(&mut self, id: EntryId) {
        let entry = self.entry_mut(id);
        assert_eq!(entry.kind, EntryType::Namespace);
        assert!(!entry.flags.is_new());
        entry.flags.mark_deleted();
    }

    pub fn is_deleted(&self, id: EntryId) -> bool {
        let entry = self.entry(id);
        // Deletion demotes to a namespace first, so anything else can't be
        // a zombie.
        match &entry.resource {
            None => entry.flags.is_deleted(),
            Some(_) => false,
        }
    }

    /// Clear a zombie's flags outright (used when the snapshotter reaps it
    /// but children still pin the slot).
    pub(crate) fn clear_flags(&mut self, id: EntryId) {
        self.entry_mut(id).flags.clear_all();
    }
}
