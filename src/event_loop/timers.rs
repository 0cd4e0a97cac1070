//! Timer heap for the event loop.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;
use tokio::time::Instant;

/// Boxed callback run on the loop thread.
pub(crate) type Callback = Box<dyn FnOnce()>;

/// Heap entry (wraps for min-heap behavior).
struct TimerEntry {
    deadline: Instant,
    seq: u64, // FIFO within same deadline
    cancelled: Rc<Cell<bool>>,
    callback: Callback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap, so reverse
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of scheduled timers. Cancelled entries are dropped lazily.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerHeap {
    pub(crate) fn push(&mut self, deadline: Instant, callback: Callback) -> Rc<Cell<bool>> {
        let cancelled = Rc::new(Cell::new(false));
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(TimerEntry {
            deadline,
            seq: self.next_seq,
            cancelled: cancelled.clone(),
            callback,
        });
        cancelled
    }

    /// Earliest deadline among live timers.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if top.cancelled.get() {
                self.heap.pop();
            } else {
                return Some(top.deadline);
            }
        }
        None
    }

    /// Pop every live timer whose deadline is at or before `now`, in deadline order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<(Rc<Cell<bool>>, Callback)> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                if !entry.cancelled.get() {
                    due.push((entry.cancelled, entry.callback));
                }
            }
        }
        due
    }

    /// Live timer count.
    pub(crate) fn len(&self) -> usize {
        self.heap.iter().filter(|t| !t.cancelled.get()).count()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}

impl fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut heap = TimerHeap::default();
        let base = Instant::now();

        for (label, offset) in [("c", 30), ("a", 10), ("b", 20), ("a2", 10)] {
            let order = order.clone();
            heap.push(
                base + Duration::from_millis(offset),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }

        assert_eq!(heap.next_deadline(), Some(base + Duration::from_millis(10)));
        for (_, cb) in heap.pop_due(base + Duration::from_millis(20)) {
            cb();
        }
        assert_eq!(*order.borrow(), vec!["a", "a2", "b"]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_cancelled_timers_are_skipped() {
        let fired = Rc::new(Cell::new(false));
        let mut heap = TimerHeap::default();
        let base = Instant::now();

        let flag = fired.clone();
        let cancelled = heap.push(base, Box::new(move || flag.set(true)));
        cancelled.set(true);

        assert_eq!(heap.next_deadline(), None);
        assert!(heap.pop_due(base + Duration::from_secs(1)).is_empty());
        assert!(!fired.get());
    }
}
