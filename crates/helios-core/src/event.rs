//! Event listener lists.
//!
//! Every long-lived object (hardware, device, class, the library base)
//! carries one of these. A listener subscribes a queue with an event mask;
//! deliveries are FIFO per listener. Two modes exist: `Queued` listeners get
//! a freshly allocated message per delivery and stay subscribed, `Fast`
//! listeners are removed from the list before their single message is
//! posted, so the subscriber re-arms explicitly.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::SegQueue;
use spin::Mutex;

/// Hardware lost/won a bus reset; result carries the generation.
pub const HW_BUSRESET: u32 = 1 << 0;
/// A validated self-ID stream is available; result carries the generation.
pub const HW_SELFID: u32 = 1 << 1;
/// A new topology has been published; result carries the generation.
pub const HW_TOPOLOGY: u32 = 1 << 2;
pub const DEVICE_NEW_UNIT: u32 = 1 << 3;
pub const DEVICE_SCANNED: u32 = 1 << 4;
pub const DEVICE_DEAD: u32 = 1 << 5;
pub const DEVICE_REMOVED: u32 = 1 << 6;
pub const DEVICE_UPDATED: u32 = 1 << 7;
pub const CLASS_REMOVED: u32 = 1 << 8;
pub const NEW_CLASS: u32 = 1 << 9;
pub const NEW_REPORTMSG: u32 = 1 << 10;

/// One delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMsg {
    pub event: u32,
    /// Event-specific payload (generation, unit index, ...).
    pub result: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Fast,
    Queued,
}

/// Opaque listener identity, returned by `add` and accepted by `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listener {
    id: u64,
    mask: u32,
    mode: ListenerMode,
    inbox: Arc<SegQueue<EventMsg>>,
}

pub struct EventListenerList {
    listeners: Mutex<Vec<Listener>>,
    next_id: AtomicU64,
}

impl EventListenerList {
    pub const fn new() -> Self {
        EventListenerList {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(
        &self,
        mask: u32,
        mode: ListenerMode,
        inbox: Arc<SegQueue<EventMsg>>,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener {
            id,
            mask,
            mode,
            inbox,
        });
        ListenerId(id)
    }

    pub fn remove(&self, id: ListenerId) {
        self.listeners.lock().retain(|l| l.id != id.0);
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Deliver `event` to every matching listener. Fast listeners are
    /// unsubscribed before their message is posted, so a delivery can never
    /// re-enter them through this list.
    pub fn send(&self, event: u32, result: u32) {
        let msg = EventMsg { event, result };
        let mut fast = Vec::new();
        {
            let mut listeners = self.listeners.lock();
            let mut i = 0;
            while i < listeners.len() {
                if listeners[i].mask & event == 0 {
                    i += 1;
                    continue;
                }
                match listeners[i].mode {
                    ListenerMode::Queued => {
                        listeners[i].inbox.push(msg);
                        i += 1;
                    }
                    ListenerMode::Fast => {
                        fast.push(listeners.swap_remove(i).inbox);
                    }
                }
            }
        }
        // Posted outside the list lock.
        for inbox in fast {
            inbox.push(msg);
        }
    }
}

impl Default for EventListenerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_listener_stays_subscribed() {
        let list = EventListenerList::new();
        let inbox = Arc::new(SegQueue::new());
        list.add(HW_SELFID | HW_TOPOLOGY, ListenerMode::Queued, inbox.clone());

        list.send(HW_SELFID, 7);
        list.send(HW_BUSRESET, 8); // masked out
        list.send(HW_TOPOLOGY, 9);

        assert_eq!(inbox.pop(), Some(EventMsg { event: HW_SELFID, result: 7 }));
        assert_eq!(inbox.pop(), Some(EventMsg { event: HW_TOPOLOGY, result: 9 }));
        assert_eq!(inbox.pop(), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn fast_listener_fires_once() {
        let list = EventListenerList::new();
        let inbox = Arc::new(SegQueue::new());
        list.add(HW_BUSRESET, ListenerMode::Fast, inbox.clone());

        list.send(HW_BUSRESET, 1);
        list.send(HW_BUSRESET, 2);

        assert_eq!(inbox.pop(), Some(EventMsg { event: HW_BUSRESET, result: 1 }));
        assert_eq!(inbox.pop(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_by_id() {
        let list = EventListenerList::new();
        let a = Arc::new(SegQueue::new());
        let b = Arc::new(SegQueue::new());
        let id_a = list.add(HW_SELFID, ListenerMode::Queued, a.clone());
        list.add(HW_SELFID, ListenerMode::Queued, b.clone());

        list.remove(id_a);
        list.send(HW_SELFID, 3);

        assert_eq!(a.pop(), None);
        assert!(b.pop().is_some());
    }
}
