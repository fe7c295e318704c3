//! Envelopes and the time-ordered event queue
//!
//! Every effect in the simulation is an `Envelope` scheduled on the queue.
//! Envelopes are immutable after creation and consumed exactly once by the
//! run loop. The queue is strictly ordered by `(time, seq)`: the sequence
//! number is assigned monotonically and used only to break ties, so events
//! scheduled for the same instant are dispatched in scheduling order.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::process::{Payload, ProcessId};

/// Simulated time in milliseconds since the start of the run.
pub type SimTime = i64;

/// Handle to a scheduled envelope, usable for cancellation.
///
/// Cancelling an envelope that has already fired or already been cancelled
/// is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u64);

/// A scheduled, time-stamped delivery of a payload to a process.
#[derive(Debug)]
pub struct Envelope<M> {
    pub time: SimTime,
    pub seq: u64,
    pub target: ProcessId,
    pub payload: Payload<M>,
}

impl<M> PartialEq for Envelope<M> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<M> Eq for Envelope<M> {}

/// Ordering: smallest `(time, seq)` first.
///
/// Reversed so that `BinaryHeap` (a max-heap) pops the earliest envelope.
impl<M> Ord for Envelope<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<M> PartialOrd for Envelope<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending envelopes with lazy cancellation.
#[derive(Debug)]
pub(crate) struct EventQueue<M> {
    heap: BinaryHeap<Envelope<M>>,
    cancelled: HashSet<u64>,
    next_seq: u64,
}

impl<M> EventQueue<M> {
    pub(crate) fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Insert an envelope at an absolute time, minting the next sequence id.
    pub(crate) fn push(
        &mut self,
        time: SimTime,
        target: ProcessId,
        payload: Payload<M>,
    ) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Envelope {
            time,
            seq,
            target,
            payload,
        });
        TimerHandle(seq)
    }

    /// Pop the earliest live envelope, skipping cancelled ones.
    pub(crate) fn pop(&mut self) -> Option<Envelope<M>> {
        while let Some(env) = self.heap.pop() {
            if self.cancelled.remove(&env.seq) {
                continue;
            }
            return Some(env);
        }
        // An empty heap can hold no cancelled envelopes; drop tombstones
        // left by handles that had already fired.
        self.cancelled.clear();
        None
    }

    /// Delivery time of the earliest live envelope, pruning cancelled ones.
    pub(crate) fn peek_time(&mut self) -> Option<SimTime> {
        loop {
            let Some(head) = self.heap.peek() else {
                self.cancelled.clear();
                return None;
            };
            let seq = head.seq;
            if self.cancelled.contains(&seq) {
                self.heap.pop();
                self.cancelled.remove(&seq);
                continue;
            }
            return Some(self.heap.peek()?.time);
        }
    }

    /// Mark a pending envelope as cancelled. Idempotent; handles for
    /// envelopes that already fired leave a tombstone that never matches.
    pub(crate) fn cancel(&mut self, handle: TimerHandle) {
        if handle.0 < self.next_seq {
            self.cancelled.insert(handle.0);
        }
    }
}
