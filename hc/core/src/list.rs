//! Allocation-free doubly linked lists over a fixed node table
//!
//! The table holds `H` list heads followed by `N` entries. Heads are sentinel
//! nodes closing each ring; an empty list and an unlinked entry both point to
//! themselves. Owners keep their payload in a parallel array indexed by entry
//! number, so the list never owns or aliases the queued objects.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    next: u16,
    prev: u16,
}

impl Link {
    const fn to_self(node: u16) -> Self {
        Self {
            next: node,
            prev: node,
        }
    }
}

/// `H` intrusive lists sharing a pool of `N` entries
///
/// Every entry is either unlinked or a member of exactly one list: linking an
/// entry that already sits in some list unlinks it first. All mutations are
/// O(1). Callers sharing the table with interrupt handlers keep it behind a
/// critical section.
pub struct IntrusiveList<const H: usize, const N: usize> {
    heads: [Link; H],
    entries: [Link; N],
}

impl<const H: usize, const N: usize> IntrusiveList<H, N> {
    const _ASSERT: () = assert!(H + N <= u16::MAX as usize, "node table too large");

    /// Create a table with all lists empty and all entries unlinked
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_ASSERT;

        let mut heads = [Link::to_self(0); H];
        let mut i = 0;
        while i < H {
            heads[i] = Link::to_self(i as u16);
            i += 1;
        }

        let mut entries = [Link::to_self(0); N];
        let mut i = 0;
        while i < N {
            entries[i] = Link::to_self((H + i) as u16);
            i += 1;
        }

        Self { heads, entries }
    }

    /// Number of lists
    pub const fn list_count(&self) -> usize {
        H
    }

    /// Number of entries
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Check whether an entry is a member of any list
    pub fn is_linked(&self, entry: usize) -> bool {
        let node = Self::entry_node(entry);
        self.link(node).next != node
    }

    /// Check whether a list has no entries
    pub fn is_empty(&self, list: usize) -> bool {
        assert!(list < H);
        usize::from(self.heads[list].next) == list
    }

    /// First entry of a list
    pub fn front(&self, list: usize) -> Option<usize> {
        assert!(list < H);
        Self::node_entry(self.heads[list].next)
    }

    /// Last entry of a list
    pub fn back(&self, list: usize) -> Option<usize> {
        assert!(list < H);
        Self::node_entry(self.heads[list].prev)
    }

    /// Entry following `entry` in its list, `None` at the end or when unlinked
    pub fn next(&self, entry: usize) -> Option<usize> {
        if !self.is_linked(entry) {
            return None;
        }
        Self::node_entry(self.link(Self::entry_node(entry)).next)
    }

    /// Append an entry to a list
    pub fn push_back(&mut self, list: usize, entry: usize) {
        assert!(list < H);
        self.move_before(Self::entry_node(entry), list as u16);
    }

    /// Prepend an entry to a list
    pub fn push_front(&mut self, list: usize, entry: usize) {
        assert!(list < H);
        self.move_after(Self::entry_node(entry), list as u16);
    }

    /// Link `entry` right before `anchor`, in whatever list `anchor` belongs to
    pub fn insert_before(&mut self, entry: usize, anchor: usize) {
        assert!(entry != anchor);
        assert!(self.is_linked(anchor));
        self.move_before(Self::entry_node(entry), Self::entry_node(anchor));
    }

    /// Unlink an entry; returns whether it was linked
    pub fn remove(&mut self, entry: usize) -> bool {
        let node = Self::entry_node(entry);
        let linked = self.link(node).next != node;
        self.unbind(node);
        linked
    }

    /// Iterate over the entries of a list, front to back
    pub fn iter(&self, list: usize) -> Iter<'_, H, N> {
        assert!(list < H);
        Iter {
            table: self,
            cursor: self.heads[list].next,
            end: list as u16,
        }
    }

    fn entry_node(entry: usize) -> u16 {
        assert!(entry < N);
        (H + entry) as u16
    }

    fn node_entry(node: u16) -> Option<usize> {
        usize::from(node).checked_sub(H)
    }

    fn link(&self, node: u16) -> &Link {
        let node = usize::from(node);
        if node < H {
            &self.heads[node]
        } else {
            &self.entries[node - H]
        }
    }

    fn link_mut(&mut self, node: u16) -> &mut Link {
        let node = usize::from(node);
        if node < H {
            &mut self.heads[node]
        } else {
            &mut self.entries[node - H]
        }
    }

    fn unbind(&mut self, node: u16) {
        let Link { next, prev } = *self.link(node);
        *self.link_mut(node) = Link::to_self(node);
        self.link_mut(next).prev = prev;
        self.link_mut(prev).next = next;
    }

    fn move_after(&mut self, node: u16, prev: u16) {
        self.unbind(node);

        let next = self.link(prev).next;
        *self.link_mut(node) = Link { next, prev };
        self.link_mut(next).prev = node;
        self.link_mut(prev).next = node;
    }

    fn move_before(&mut self, node: u16, next: u16) {
        self.unbind(node);

        let prev = self.link(next).prev;
        *self.link_mut(node) = Link { next, prev };
        self.link_mut(next).prev = node;
        self.link_mut(prev).next = node;
    }
}

impl<const H: usize, const N: usize> Default for IntrusiveList<H, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over one list of an [`IntrusiveList`]
pub struct Iter<'a, const H: usize, const N: usize> {
    table: &'a IntrusiveList<H, N>,
    cursor: u16,
    end: u16,
}

impl<const H: usize, const N: usize> Iterator for Iter<'_, H, N> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == self.end {
            return None;
        }
        let entry = IntrusiveList::<H, N>::node_entry(self.cursor)?;
        self.cursor = self.table.link(self.cursor).next;
        Some(entry)
    }
}
