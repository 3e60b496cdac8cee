//! Recency list for LRU bookkeeping
//!
//! A doubly linked list of keys stored in a slab, so promoting or removing a
//! key whose slot index is known is O(1).

/// Index of a key's slot in a [`RecencyList`]
pub(crate) type Slot = usize;

struct Node {
    key: String,
    prev: Option<Slot>,
    next: Option<Slot>,
}

/// Keys ordered from least recently used (front) to most recently used (back)
#[derive(Default)]
pub(crate) struct RecencyList {
    nodes: Vec<Node>,
    free: Vec<Slot>,
    head: Option<Slot>,
    tail: Option<Slot>,
    len: usize,
}

impl RecencyList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Append a key as most recently used and return its slot
    pub(crate) fn push_back(&mut self, key: String) -> Slot {
        let node = Node {
            key,
            prev: self.tail,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        slot
    }

    /// Mark a slot as most recently used
    pub(crate) fn move_to_back(&mut self, slot: Slot) {
        if self.tail == Some(slot) {
            return;
        }
        self.unlink(slot);

        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = None;
        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(slot);
        }
        self.tail = Some(slot);
        if self.head.is_none() {
            self.head = Some(slot);
        }
    }

    /// Remove a slot and return its key
    pub(crate) fn remove(&mut self, slot: Slot) -> String {
        self.unlink(slot);
        self.free.push(slot);
        self.len -= 1;
        std::mem::take(&mut self.nodes[slot].key)
    }

    /// Remove and return the least recently used key
    pub(crate) fn pop_front(&mut self) -> Option<String> {
        let head = self.head?;
        Some(self.remove(head))
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Keys from least to most recently used
    pub(crate) fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let node = &self.nodes[slot];
            cursor = node.next;
            Some(node.key.as_str())
        })
    }

    fn unlink(&mut self, slot: Slot) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[slot].prev = None;
        self.nodes[slot].next = None;
    }
}
