// Back-indexed binary heap keyed by an ordered priority.
//
// Elements carry their own heap position so an owner holding a reference can
// remove or reprioritise them in O(log n) without searching. Every swap
// updates the stored indices in lockstep; a popped element is marked with the
// sentinel index -1.
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

/// Index value carried by elements that are not currently in a heap.
pub const NOT_IN_HEAP: isize = -1;

/// Comparator for a min-heap over any partially ordered priority.
pub fn min<P: PartialOrd>(l: P, r: P) -> bool {
    l < r
}

/// Back-index slot an element embeds so the heap can report its position.
#[derive(Debug)]
pub struct HeapIndex(AtomicIsize);

impl HeapIndex {
    pub fn new() -> Self {
        Self(AtomicIsize::new(NOT_IN_HEAP))
    }

    pub fn get(&self) -> isize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, index: isize) {
        self.0.store(index, Ordering::Relaxed);
    }
}

impl Default for HeapIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by heap elements; gives the queue a place to write back the
/// element's current position.
pub trait BackIndexed {
    fn heap_index(&self) -> isize;
    fn set_heap_index(&self, index: isize);
}

impl<T: BackIndexed + ?Sized> BackIndexed for Arc<T> {
    fn heap_index(&self) -> isize {
        (**self).heap_index()
    }

    fn set_heap_index(&self, index: isize) {
        (**self).set_heap_index(index);
    }
}

/// One stored element plus the priority it is ordered by.
#[derive(Debug)]
pub struct Entry<T, P> {
    pub value: T,
    pub priority: P,
}

/// Binary heap with positional removal and in-place priority updates.
///
/// ```
/// use weir_pqueue::{BackIndexed, HeapIndex, PriorityQueue, min};
/// use std::sync::Arc;
///
/// struct Slot(HeapIndex);
///
/// impl BackIndexed for Slot {
///     fn heap_index(&self) -> isize {
///         self.0.get()
///     }
///     fn set_heap_index(&self, index: isize) {
///         self.0.set(index);
///     }
/// }
///
/// # impl Slot { fn new() -> Self { Slot(HeapIndex::new()) } }
/// let mut pq = PriorityQueue::new(4, min);
/// pq.push(Arc::new(Slot::new()), 3i64);
/// pq.push(Arc::new(Slot::new()), 1i64);
/// assert_eq!(pq.pop().expect("head").priority, 1);
/// ```
#[derive(Debug)]
pub struct PriorityQueue<T: BackIndexed, P: Copy> {
    entries: Vec<Entry<T, P>>,
    is_before: fn(P, P) -> bool,
}

impl<T: BackIndexed, P: Copy> PriorityQueue<T, P> {
    pub fn new(capacity: usize, is_before: fn(P, P) -> bool) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            is_before,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// The head entry, without removing it.
    pub fn peek(&self) -> Option<(&T, P)> {
        self.entries.first().map(|e| (&e.value, e.priority))
    }

    /// The priority stored at a given heap position.
    pub fn priority_at(&self, index: isize) -> Option<P> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(|e| e.priority)
    }

    pub fn push(&mut self, value: T, priority: P) {
        let n = self.entries.len();
        if n == self.entries.capacity() {
            // Double the backing store, mirroring pop's halving on drain.
            let cap = self.entries.capacity().max(1);
            self.entries.reserve_exact(cap);
        }
        value.set_heap_index(n as isize);
        self.entries.push(Entry { value, priority });
        self.up(n);
    }

    pub fn pop(&mut self) -> Option<Entry<T, P>> {
        let n = self.entries.len();
        if n == 0 {
            return None;
        }
        self.swap(0, n - 1);
        self.down(0, n - 1);
        Some(self.pop_tail())
    }

    /// Removes the entry at position `i`, restoring heap order around it.
    pub fn remove(&mut self, i: usize) -> Option<Entry<T, P>> {
        let n = self.entries.len();
        if i >= n {
            return None;
        }
        if i != n - 1 {
            self.swap(i, n - 1);
            if !self.down(i, n - 1) {
                self.up(i);
            }
        }
        Some(self.pop_tail())
    }

    /// Re-heapifies the entry at `index` with a new priority. No-op when the
    /// element has already been popped (sentinel index).
    pub fn update(&mut self, index: isize, priority: P) {
        let Ok(i) = usize::try_from(index) else {
            return;
        };
        if i >= self.entries.len() {
            return;
        }
        self.entries[i].priority = priority;
        let n = self.entries.len();
        if !self.down(i, n) {
            self.up(i);
        }
    }

    /// Removes and returns the head iff `keep_waiting(head.priority)` is
    /// false. Callers pass `|p| p > threshold`, so the head is yielded
    /// exactly when its priority has come due.
    pub fn peek_and_shift(&mut self, keep_waiting: impl Fn(P) -> bool) -> Option<Entry<T, P>> {
        let head = self.entries.first()?;
        if keep_waiting(head.priority) {
            return None;
        }
        self.remove(0)
    }

    fn less(&self, i: usize, j: usize) -> bool {
        (self.is_before)(self.entries[i].priority, self.entries[j].priority)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        self.entries[i].value.set_heap_index(i as isize);
        self.entries[j].value.set_heap_index(j as isize);
    }

    fn pop_tail(&mut self) -> Entry<T, P> {
        let n = self.entries.len();
        let c = self.entries.capacity();
        if n < c / 2 && c > 25 {
            // Reclaim memory after bursts; never below the resting size.
            self.entries.shrink_to(c / 2);
        }
        let entry = self.entries.pop().expect("pop_tail on empty heap");
        entry.value.set_heap_index(NOT_IN_HEAP);
        entry
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let i = (j - 1) / 2;
            if !self.less(j, i) {
                break;
            }
            self.swap(i, j);
            j = i;
        }
    }

    fn down(&mut self, i0: usize, n: usize) -> bool {
        let mut i = i0;
        loop {
            let j1 = 2 * i + 1;
            if j1 >= n {
                break;
            }
            let mut j = j1;
            let j2 = j1 + 1;
            if j2 < n && self.less(j2, j1) {
                j = j2;
            }
            if !self.less(j, i) {
                break;
            }
            self.swap(i, j);
            i = j;
        }
        i > i0
    }
}
