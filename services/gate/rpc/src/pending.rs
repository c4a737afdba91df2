//! Pending-call table: hash map for lookup by sequence number plus an
//! index-tracking binary min-heap ordered by deadline.
//!
//! Every live entry records its position in the heap; swaps keep the
//! positions current so an arbitrary entry can be removed in O(log n).

use std::collections::HashMap;
use tokio::time::Instant;

const NOT_IN_HEAP: usize = usize::MAX;

/// One outstanding call
#[derive(Debug)]
pub struct PendingCall<T> {
    /// Sequence number the response will carry
    pub seq: u32,
    /// Command id of the request
    pub command: u32,
    /// When the call times out
    pub deadline: Instant,
    /// Caller payload (the completion callback)
    pub payload: T,
    heap_index: usize,
    order: u64,
}

/// Map plus deadline heap
#[derive(Debug)]
pub struct PendingTable<T> {
    calls: HashMap<u32, PendingCall<T>>,
    heap: Vec<u32>,
    inserted: u64,
}

impl<T> Default for PendingTable<T> {
    fn default() -> Self {
        Self {
            calls: HashMap::new(),
            heap: Vec::new(),
            inserted: 0,
        }
    }
}

impl<T> PendingTable<T> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whether `seq` is pending
    pub fn contains(&self, seq: u32) -> bool {
        self.calls.contains_key(&seq)
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        let seq = self.heap.first()?;
        self.calls.get(seq).map(|c| c.deadline)
    }

    /// Add a call. Returns false, leaving the table unchanged, if `seq` is taken.
    pub fn insert(&mut self, seq: u32, command: u32, deadline: Instant, payload: T) -> bool {
        if self.calls.contains_key(&seq) {
            return false;
        }
        let index = self.heap.len();
        self.inserted += 1;
        self.calls.insert(
            seq,
            PendingCall {
                seq,
                command,
                deadline,
                payload,
                heap_index: index,
                order: self.inserted,
            },
        );
        self.heap.push(seq);
        self.sift_up(index);
        true
    }

    /// Remove the call for `seq`
    pub fn remove(&mut self, seq: u32) -> Option<PendingCall<T>> {
        let index = self.calls.get(&seq)?.heap_index;
        self.remove_at(index);
        let mut call = self.calls.remove(&seq)?;
        call.heap_index = NOT_IN_HEAP;
        Some(call)
    }

    /// Remove and return every call whose deadline is at or before `now`,
    /// earliest first
    pub fn pop_expired(&mut self, now: Instant) -> Vec<PendingCall<T>> {
        let mut expired = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            let seq = self.heap[0];
            if let Some(call) = self.remove(seq) {
                expired.push(call);
            }
        }
        expired
    }

    /// Remove everything, in no particular order
    pub fn drain(&mut self) -> Vec<PendingCall<T>> {
        self.heap.clear();
        self.calls
            .drain()
            .map(|(_, mut call)| {
                call.heap_index = NOT_IN_HEAP;
                call
            })
            .collect()
    }

    fn key(&self, index: usize) -> (Instant, u64) {
        let call = &self.calls[&self.heap[index]];
        (call.deadline, call.order)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.key(a) < self.key(b)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        for index in [a, b] {
            let seq = self.heap[index];
            if let Some(call) = self.calls.get_mut(&seq) {
                call.heap_index = index;
            }
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn remove_at(&mut self, index: usize) {
        let last = self.heap.len() - 1;
        if index != last {
            self.swap(index, last);
        }
        self.heap.pop();
        if index < self.heap.len() {
            self.sift_down(index);
            self.sift_up(index);
        }
    }
}
