// Twin map+heap bookkeeping shared by the in-flight and deferred sets.
//
// The map detects duplicates and locates an entry in O(1); the heap orders
// entries by their next actionable time. Both structures are only mutated
// together, under this tracker's own lock, so consumer acks never contend
// with the channel's registry lock.
use crate::message::Message;
use crate::{ChannelError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use weir_common::ids::{ClientId, MessageId};
use weir_pqueue::{BackIndexed, HeapIndex, NOT_IN_HEAP, PriorityQueue, min};

/// One message plus its back-index into the tracker's heap.
#[derive(Debug)]
pub(crate) struct Tracked {
    pub(crate) msg: Message,
    index: HeapIndex,
}

impl Tracked {
    fn new(msg: Message) -> Arc<Self> {
        Arc::new(Self {
            msg,
            index: HeapIndex::new(),
        })
    }
}

impl BackIndexed for Tracked {
    fn heap_index(&self) -> isize {
        self.index.get()
    }

    fn set_heap_index(&self, index: isize) {
        self.index.set(index);
    }
}

#[derive(Debug)]
pub(crate) struct Tracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    by_id: HashMap<MessageId, Arc<Tracked>>,
    heap: PriorityQueue<Arc<Tracked>, i64>,
}

impl TrackerInner {
    fn new(capacity: usize) -> Self {
        Self {
            by_id: HashMap::new(),
            heap: PriorityQueue::new(capacity, min),
        }
    }
}

impl Tracker {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner::new(capacity)),
        }
    }

    /// Starts tracking `msg` with the given deadline (nanoseconds since
    /// epoch). Fails when the id is already tracked.
    pub(crate) fn push(&self, msg: Message, deadline: i64) -> Result<()> {
        let mut inner = self.inner.lock().expect("tracker lock");
        if inner.by_id.contains_key(&msg.id) {
            return Err(ChannelError::Duplicate(msg.id));
        }
        let tracked = Tracked::new(msg);
        inner.by_id.insert(tracked.msg.id, Arc::clone(&tracked));
        inner.heap.push(tracked, deadline);
        Ok(())
    }

    /// Looks up `id`, optionally verifying the owning consumer. Removes the
    /// entry from the map unless `peek`; heap removal is the caller's
    /// separate step via [`Tracker::remove_from_heap`].
    pub(crate) fn pop(
        &self,
        id: MessageId,
        owner: Option<ClientId>,
        peek: bool,
    ) -> Result<Arc<Tracked>> {
        let mut inner = self.inner.lock().expect("tracker lock");
        let tracked = inner.by_id.get(&id).cloned().ok_or(ChannelError::NotFound)?;
        if let Some(owner) = owner
            && tracked.msg.owner != Some(owner)
        {
            return Err(ChannelError::WrongOwner);
        }
        if !peek {
            inner.by_id.remove(&id);
        }
        Ok(tracked)
    }

    /// Drops the entry from the heap unless it was already popped.
    pub(crate) fn remove_from_heap(&self, tracked: &Arc<Tracked>) {
        let mut inner = self.inner.lock().expect("tracker lock");
        let index = tracked.heap_index();
        if index != NOT_IN_HEAP {
            inner.heap.remove(index as usize);
        }
    }

    /// Moves the entry to a new deadline, re-heapifying in place.
    pub(crate) fn update_deadline(&self, tracked: &Arc<Tracked>, deadline: i64) {
        let mut inner = self.inner.lock().expect("tracker lock");
        inner.heap.update(tracked.heap_index(), deadline);
    }

    /// Removes and returns the head iff its deadline has passed `t`.
    pub(crate) fn peek_due(&self, t: i64) -> Option<Arc<Tracked>> {
        let mut inner = self.inner.lock().expect("tracker lock");
        let entry = inner.heap.peek_and_shift(|deadline| deadline > t)?;
        inner.by_id.remove(&entry.value.msg.id);
        Some(entry.value)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("tracker lock").by_id.len()
    }

    /// Drops all state and rebuilds with the given heap capacity.
    pub(crate) fn reinit(&self, capacity: usize) {
        *self.inner.lock().expect("tracker lock") = TrackerInner::new(capacity);
    }

    /// Snapshot of every tracked message, for the shutdown flush.
    pub(crate) fn messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .expect("tracker lock")
            .by_id
            .values()
            .map(|tracked| tracked.msg.clone())
            .collect()
    }

    /// The deadline currently scheduled for `id`, if tracked and queued.
    pub(crate) fn deadline(&self, id: MessageId) -> Option<i64> {
        let inner = self.inner.lock().expect("tracker lock");
        let tracked = inner.by_id.get(&id)?;
        inner.heap.priority_at(tracked.heap_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use weir_common::ids::IdFactory;

    fn in_flight_message(factory: &IdFactory, owner: ClientId) -> Message {
        let mut msg = Message::new(factory.next_id(), Bytes::from_static(b"m"));
        msg.owner = Some(owner);
        msg
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        let msg = Message::new(factory.next_id(), Bytes::from_static(b"m"));

        tracker.push(msg.clone(), 10).expect("first push");
        let err = tracker.push(msg, 20).expect_err("second push");
        assert!(matches!(err, ChannelError::Duplicate(_)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn pop_verifies_ownership() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        let owner = ClientId::new(1);
        let msg = in_flight_message(&factory, owner);
        let id = msg.id;
        tracker.push(msg, 10).expect("push");

        let err = tracker
            .pop(id, Some(ClientId::new(2)), false)
            .expect_err("stranger");
        assert!(matches!(err, ChannelError::WrongOwner));

        tracker.pop(id, Some(owner), false).expect("owner pops");
        let err = tracker.pop(id, Some(owner), false).expect_err("gone");
        assert!(matches!(err, ChannelError::NotFound));
    }

    #[test]
    fn peek_leaves_the_entry_mapped() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        let msg = Message::new(factory.next_id(), Bytes::from_static(b"m"));
        let id = msg.id;
        tracker.push(msg, 10).expect("push");

        tracker.pop(id, None, true).expect("peek");
        assert_eq!(tracker.len(), 1);
        tracker.pop(id, None, false).expect("pop");
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn peek_due_honors_deadlines() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        let early = Message::new(factory.next_id(), Bytes::from_static(b"early"));
        let late = Message::new(factory.next_id(), Bytes::from_static(b"late"));
        tracker.push(early.clone(), 100).expect("push");
        tracker.push(late.clone(), 200).expect("push");

        assert!(tracker.peek_due(50).is_none());

        let due = tracker.peek_due(150).expect("early is due");
        assert_eq!(due.msg.id, early.id);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.peek_due(150).is_none());

        let due = tracker.peek_due(250).expect("late is due");
        assert_eq!(due.msg.id, late.id);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn update_deadline_reorders_the_heap() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        let a = Message::new(factory.next_id(), Bytes::from_static(b"a"));
        let b = Message::new(factory.next_id(), Bytes::from_static(b"b"));
        tracker.push(a.clone(), 100).expect("push");
        tracker.push(b.clone(), 200).expect("push");

        let tracked = tracker.pop(a.id, None, true).expect("peek");
        tracker.update_deadline(&tracked, 300);
        assert_eq!(tracker.deadline(a.id), Some(300));

        // b now owns the earliest deadline.
        let due = tracker.peek_due(250).expect("b is due");
        assert_eq!(due.msg.id, b.id);
    }

    #[test]
    fn remove_from_heap_tolerates_popped_entries() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        let msg = Message::new(factory.next_id(), Bytes::from_static(b"m"));
        let id = msg.id;
        tracker.push(msg, 100).expect("push");

        let tracked = tracker.peek_due(150).expect("due");
        assert_eq!(tracked.heap_index(), NOT_IN_HEAP);
        // Already shifted out of the heap; removal must be a no-op.
        tracker.remove_from_heap(&tracked);
        assert!(tracker.pop(id, None, false).is_err());
    }

    #[test]
    fn reinit_clears_all_state() {
        let factory = IdFactory::new();
        let tracker = Tracker::new(4);
        for _ in 0..3 {
            let msg = Message::new(factory.next_id(), Bytes::from_static(b"m"));
            tracker.push(msg, 100).expect("push");
        }
        assert_eq!(tracker.len(), 3);
        tracker.reinit(4);
        assert_eq!(tracker.len(), 0);
        assert!(tracker.peek_due(i64::MAX).is_none());
    }
}
