//! Worker plumbing shared by the driver and the supervisor.
//!
//! A `Worker` is the passive half of a service task: a control inbox
//! (init/die) plus an atomic signal word the interrupt handler or peer
//! workers raise. The embedding kernel parks a task on each worker and calls
//! its owner's `service` entry whenever signals are pending; tests pump the
//! same entries directly.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_queue::SegQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMsg {
    Init,
    Die,
}

pub struct Worker {
    inbox: SegQueue<WorkerMsg>,
    signals: AtomicU32,
    alive: AtomicBool,
}

impl Worker {
    pub fn new() -> Self {
        Worker {
            inbox: SegQueue::new(),
            signals: AtomicU32::new(0),
            alive: AtomicBool::new(true),
        }
    }

    /// Raise signal bits. Safe from interrupt context: no allocation, no
    /// locks.
    pub fn signal(&self, bits: u32) {
        self.signals.fetch_or(bits, Ordering::Release);
    }

    /// Consume and return all pending signal bits.
    pub fn take_signals(&self) -> u32 {
        self.signals.swap(0, Ordering::Acquire)
    }

    pub fn has_signals(&self) -> bool {
        self.signals.load(Ordering::Acquire) != 0
    }

    pub fn post(&self, msg: WorkerMsg) {
        self.inbox.push(msg);
    }

    /// Drain control messages. Returns false once a `Die` was seen; the
    /// owner finishes its current iteration and stops servicing.
    pub fn drain_control(&self) -> bool {
        while let Some(msg) = self.inbox.pop() {
            if msg == WorkerMsg::Die {
                self.alive.store(false, Ordering::Release);
            }
        }
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Ask the worker to exit and raise a wakeup so a parked task notices.
    pub fn kill(&self) {
        self.post(WorkerMsg::Die);
        self.signal(u32::MAX);
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_accumulate_and_clear() {
        let w = Worker::new();
        w.signal(0b01);
        w.signal(0b10);
        assert_eq!(w.take_signals(), 0b11);
        assert_eq!(w.take_signals(), 0);
    }

    #[test]
    fn die_is_sticky() {
        let w = Worker::new();
        assert!(w.drain_control());
        w.kill();
        assert!(!w.drain_control());
        assert!(!w.is_alive());
        // Idempotent.
        w.kill();
        assert!(!w.drain_control());
    }
}
