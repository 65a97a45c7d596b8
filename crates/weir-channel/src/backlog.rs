// Bounded in-memory hand-off fronting the durable backend.
use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO buffer between the publish side and connected consumers. Producers
/// never block: when the buffer is full the message is handed back so the
/// caller can spill it to the backend.
#[derive(Debug)]
pub(crate) struct Backlog {
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
}

impl Backlog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Deposits without blocking; returns the message when full.
    pub(crate) fn try_push(&self, msg: Message) -> std::result::Result<(), Message> {
        let mut queue = self.queue.lock().expect("backlog lock");
        if queue.len() >= self.capacity {
            return Err(msg);
        }
        queue.push_back(msg);
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        self.queue.lock().expect("backlog lock").pop_front()
    }

    /// Discards everything buffered.
    pub(crate) fn drain(&self) {
        self.queue.lock().expect("backlog lock").clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().expect("backlog lock").len()
    }
}
