use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    fmt::{self, Debug, Formatter},
    time::Instant,
};

use parking_lot::Mutex;

use crate::request::PendingRequest;

// Heap entry. The sequence number breaks ties between equal submission
// times in insertion order, so ordering is stable within one queue.
struct Entry<T> {
    submitted_at: Option<Instant>,
    seq: u64,
    request: PendingRequest<T>,
}

impl<T> Entry<T> {
    fn sort_key(&self) -> (Option<Instant>, u64) {
        (self.submitted_at, self.seq)
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; reverse so the earliest submission is on
    // top. A missing submission time sorts before every real one, so a
    // malformed request always surfaces at the head.
    fn cmp(&self, other: &Self) -> Ordering {
        other.sort_key().cmp(&self.sort_key())
    }
}

struct Heap<T> {
    entries: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// What [`WaitQueue::take_eligible`] found at the head of the queue.
pub(crate) enum Head<T> {
    /// The queue is empty.
    Empty,
    /// The head had no submission time. It was removed.
    Malformed(PendingRequest<T>),
    /// The head was submitted at or before the cutoff. It was removed.
    Eligible(PendingRequest<T>),
    /// The head was submitted after the cutoff; so was everything behind it.
    Later,
}

/// The requests waiting on one view, ordered by submission time.
pub struct WaitQueue<T> {
    view_key: String,
    capacity: Option<usize>,
    heap: Mutex<Heap<T>>,
}

impl<T> Debug for WaitQueue<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("view_key", &self.view_key)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> WaitQueue<T> {
    /// Create a queue for `view_key`. With no capacity the queue is
    /// unbounded.
    pub fn new(view_key: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            view_key: view_key.into(),
            capacity,
            heap: Mutex::new(Heap {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn view_key(&self) -> &str {
        &self.view_key
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().entries.is_empty()
    }

    /// Add a request. If the queue is full, the request is handed back.
    pub(crate) fn offer(&self, request: PendingRequest<T>) -> Result<(), PendingRequest<T>> {
        let mut heap = self.heap.lock();

        if matches!(self.capacity, Some(capacity) if heap.entries.len() >= capacity) {
            return Err(request);
        }

        let seq = heap.next_seq;
        heap.next_seq += 1;
        heap.entries.push(Entry {
            submitted_at: request.submitted_at(),
            seq,
            request,
        });

        Ok(())
    }

    /// Inspect the head and remove it unless it was submitted after
    /// `cutoff`.
    pub(crate) fn take_eligible(&self, cutoff: Instant) -> Head<T> {
        let mut heap = self.heap.lock();

        let head = match heap.entries.peek() {
            None => return Head::Empty,
            Some(entry) => entry.submitted_at,
        };

        match head {
            Some(submitted_at) if submitted_at > cutoff => Head::Later,
            Some(..) => match heap.entries.pop() {
                Some(entry) => Head::Eligible(entry.request),
                None => Head::Empty,
            },
            None => match heap.entries.pop() {
                Some(entry) => Head::Malformed(entry.request),
                None => Head::Empty,
            },
        }
    }
}

impl<T: Clone> WaitQueue<T> {
    /// The submission time of the earliest request that can still receive a
    /// result. Requests that already completed or timed out are dropped from
    /// the head along the way. The outer `None` means no such request; the
    /// inner `None` is a request with no submission time.
    pub(crate) fn earliest_unresolved(&self) -> Option<Option<Instant>> {
        let mut heap = self.heap.lock();

        loop {
            let entry = heap.entries.peek()?;
            if !entry.request.cell().is_resolved() {
                return Some(entry.submitted_at);
            }
            heap.entries.pop();
        }
    }
}
