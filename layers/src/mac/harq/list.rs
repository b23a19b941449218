//! Index-linked lists over HARQ records
//!
//! Each record carries its own `prev`/`next` links per list kind, so a record
//! can be unlinked in O(1) from the pending-retx FIFO or from a wheel bucket
//! knowing only its reference.

use super::HarqRef;

/// Which of a record's link pairs a list threads through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListKind {
    PendingRetx,
    Timeout,
}

/// Link pair embedded in a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ListLinks {
    prev: Option<HarqRef>,
    next: Option<HarqRef>,
    linked: bool,
}

impl ListLinks {
    pub(crate) fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Storage able to hand out the links of a record
pub(crate) trait LinkStore {
    fn links(&self, node: HarqRef, kind: ListKind) -> &ListLinks;
    fn links_mut(&mut self, node: HarqRef, kind: ListKind) -> &mut ListLinks;
}

/// Doubly-linked, insertion-ordered list of record references
#[derive(Debug)]
pub(crate) struct HarqList {
    kind: ListKind,
    head: Option<HarqRef>,
    tail: Option<HarqRef>,
    len: usize,
}

impl HarqList {
    pub(crate) fn new(kind: ListKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn front(&self) -> Option<HarqRef> {
        self.head
    }

    pub(crate) fn next_of<S: LinkStore>(&self, store: &S, node: HarqRef) -> Option<HarqRef> {
        store.links(node, self.kind).next
    }

    pub(crate) fn push_back<S: LinkStore>(&mut self, store: &mut S, node: HarqRef) {
        let kind = self.kind;
        debug_assert!(!store.links(node, kind).linked, "{} linked twice in {:?}", node, kind);

        let tail = self.tail;
        *store.links_mut(node, kind) = ListLinks {
            prev: tail,
            next: None,
            linked: true,
        };
        match tail {
            Some(t) => store.links_mut(t, kind).next = Some(node),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// Unlink a record. Returns false if it was not linked.
    pub(crate) fn remove<S: LinkStore>(&mut self, store: &mut S, node: HarqRef) -> bool {
        let kind = self.kind;
        let links = *store.links(node, kind);
        if !links.linked {
            return false;
        }

        match links.prev {
            Some(p) => store.links_mut(p, kind).next = links.next,
            None => self.head = links.next,
        }
        match links.next {
            Some(n) => store.links_mut(n, kind).prev = links.prev,
            None => self.tail = links.prev,
        }
        *store.links_mut(node, kind) = ListLinks::default();
        self.len -= 1;
        true
    }

    pub(crate) fn iter<'a, S: LinkStore>(&'a self, store: &'a S) -> impl Iterator<Item = HarqRef> + 'a {
        let kind = self.kind;
        std::iter::successors(self.head, move |node| store.links(*node, kind).next)
    }
}
