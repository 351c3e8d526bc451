//! Min-heap of deadline-ordered callbacks for a single CPU.
//!
//! Grounded in the `timer.expire(now, &mut ready_wakers)` shape used by the
//! cross-CPU reactor in the broader examples pack: a per-CPU heap that the
//! event loop drains once per tick rather than a callback-per-syscall model.
//! Deletion is not supported — re-armed timers simply insert a new entry
//! (per the design note on tombstoning), since the expected lifetime of a
//! timer entry is short relative to the tick rate.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

struct Entry {
    deadline: Instant,
    seq: u64,
    callback: Box<dyn FnOnce()>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // to the top.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, callback: Box<dyn FnOnce()>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            callback,
        });
    }

    /// Removes and returns every callback whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut ready = Vec::new();
        while matches!(self.heap.peek(), Some(e) if e.deadline <= now) {
            ready.push(self.heap.pop().expect("just peeked").callback);
        }
        ready
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn expires_entries_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o1 = order.clone();
        wheel.schedule(base + Duration::from_millis(30), Box::new(move || o1.borrow_mut().push(30)));
        let o2 = order.clone();
        wheel.schedule(base + Duration::from_millis(10), Box::new(move || o2.borrow_mut().push(10)));
        let o3 = order.clone();
        wheel.schedule(base + Duration::from_millis(20), Box::new(move || o3.borrow_mut().push(20)));

        for cb in wheel.expire(base + Duration::from_millis(25)) {
            cb();
        }
        assert_eq!(*order.borrow(), vec![10, 20]);
        assert_eq!(wheel.next_deadline(), Some(base + Duration::from_millis(30)));
    }

    #[test]
    fn nothing_expires_before_its_deadline() {
        let mut wheel = TimerWheel::new();
        let base = Instant::now();
        wheel.schedule(base + Duration::from_millis(50), Box::new(|| {}));
        assert!(wheel.expire(base).is_empty());
        assert!(!wheel.is_empty());
    }
}
