//! The asynchronous transaction layer.
//!
//! Sixty-four transactions can be pending at once, one per tlabel. The
//! bitmap and the slot array always agree: a set bit means a live slot.
//! Completion is single-shot: exactly one of ack-complete, received
//! response, split-timeout, cancel or bus-reset flush fires the callback,
//! whichever claims the slot first.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use core::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use spin::{Mutex, RwLock};

use helios_core::csr::{split_timeout_ms, SPLIT_TIMEOUT_DEFAULT};
use helios_core::error::{HeliosError, Result};
use helios_core::log_warn;
use helios_core::packet::Packet;
use helios_core::platform::TimeSource;
use helios_core::types::{Ack, NodeId, RCode, TCode, TLABEL_COUNT};

use crate::atcontext::AtData;

pub type TxCallback = Box<dyn FnOnce(RCode, &[u8]) + Send>;

/// Identifies one pending transaction. The sequence number guards against
/// tlabel reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    pub tlabel: u8,
    pub seq: u64,
}

struct PendingTx {
    seq: u64,
    dest_id: NodeId,
    #[allow(dead_code)]
    tcode: TCode,
    complete: Option<TxCallback>,
    at: Arc<AtData>,
    #[allow(dead_code)]
    ack: Option<Ack>,
}

struct TlState {
    slots: Vec<Option<PendingTx>>,
    bitmap: u64,
    last_tlabel: u8,
    next_seq: u64,
    /// (deadline ms, tlabel, seq) triples for armed split timeouts.
    timeouts: Vec<(u64, u8, u64)>,
}

/// A registered inbound-request handler covering `[start, start+length)`.
struct RequestHandler {
    id: u64,
    start: u64,
    length: u64,
    callback: RequestCallback,
}

pub type RequestCallback = Arc<dyn Fn(&Packet) -> HandlerResponse + Send + Sync>;

/// What a request handler answers with. Payload memory is freed when the
/// response transmit completes (the AT ack drops the last reference).
pub struct HandlerResponse {
    pub rcode: RCode,
    pub payload: Vec<u8>,
}

impl HandlerResponse {
    pub fn error(rcode: RCode) -> HandlerResponse {
        HandlerResponse {
            rcode,
            payload: Vec::new(),
        }
    }
}

pub struct TransactionLayer {
    time: Arc<dyn TimeSource>,
    state: Mutex<TlState>,
    handlers: RwLock<Vec<RequestHandler>>,
    next_handler_id: AtomicU64,
    split_timeout_csr: AtomicU32,
}

impl TransactionLayer {
    pub fn new(time: Arc<dyn TimeSource>) -> TransactionLayer {
        let mut slots = Vec::with_capacity(TLABEL_COUNT);
        slots.resize_with(TLABEL_COUNT, || None);
        TransactionLayer {
            time,
            state: Mutex::new(TlState {
                slots,
                bitmap: 0,
                last_tlabel: (TLABEL_COUNT - 1) as u8,
                next_seq: 1,
                timeouts: Vec::new(),
            }),
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            split_timeout_csr: AtomicU32::new(SPLIT_TIMEOUT_DEFAULT),
        }
    }

    pub fn split_timeout_csr(&self) -> u32 {
        self.split_timeout_csr.load(Ordering::Relaxed)
    }

    pub fn set_split_timeout_csr(&self, value: u32) {
        self.split_timeout_csr.store(value, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().bitmap.count_ones() as usize
    }

    /// The allocation bitmap, for diagnostics and invariant checks.
    pub fn tlabel_bitmap(&self) -> u64 {
        self.state.lock().bitmap
    }

    /// Claim the next free tlabel round-robin and register the transaction.
    pub fn allocate(
        &self,
        dest_id: NodeId,
        tcode: TCode,
        at: Arc<AtData>,
        complete: TxCallback,
    ) -> Result<TransactionHandle> {
        let mut state = self.state.lock();
        if state.bitmap == u64::MAX {
            return Err(HeliosError::Busy);
        }
        let mut tlabel = state.last_tlabel;
        loop {
            tlabel = if tlabel >= 63 { 0 } else { tlabel + 1 };
            if state.bitmap & 1 << tlabel == 0 {
                break;
            }
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.last_tlabel = tlabel;
        state.bitmap |= 1 << tlabel;
        state.slots[tlabel as usize] = Some(PendingTx {
            seq,
            dest_id,
            tcode,
            complete: Some(complete),
            at,
            ack: None,
        });
        Ok(TransactionHandle { tlabel, seq })
    }

    /// Claim the slot for completion: frees the tlabel, disarms the timer
    /// and suppresses any still-armed AT callback.
    fn take_locked(
        state: &mut TlState,
        tlabel: u8,
        seq: Option<u64>,
    ) -> Option<(TxCallback, Arc<AtData>)> {
        let slot = state.slots[tlabel as usize].as_ref()?;
        if let Some(seq) = seq {
            if slot.seq != seq {
                return None;
            }
        }
        let mut tx = state.slots[tlabel as usize].take()?;
        state.bitmap &= !(1 << tlabel);
        state
            .timeouts
            .retain(|&(_, t, s)| !(t == tlabel && s == tx.seq));
        let callback = tx.complete.take()?;
        Some((callback, tx.at))
    }

    /// Terminal disposition from any path. The callback runs without the
    /// layer lock held.
    fn finish(&self, tlabel: u8, seq: Option<u64>, rcode: RCode, payload: &[u8]) {
        let taken = {
            let mut state = self.state.lock();
            Self::take_locked(&mut state, tlabel, seq)
        };
        if let Some((callback, at)) = taken {
            at.cancel();
            callback(rcode, payload);
        }
    }

    /// Ack disposition for a transmitted request (called from the AT
    /// worker).
    pub fn handle_at_ack(&self, handle: TransactionHandle, ack: Ack, timestamp: u16) {
        let _ = timestamp;
        match ack {
            Ack::Pending => {
                // Split transaction: arm the split-timeout and wait for the
                // response packet.
                let deadline =
                    self.time.now_ms() + split_timeout_ms(self.split_timeout_csr()) as u64;
                let mut state = self.state.lock();
                let armed = match state.slots[handle.tlabel as usize].as_mut() {
                    Some(slot) if slot.seq == handle.seq => {
                        slot.ack = Some(Ack::Pending);
                        true
                    }
                    _ => false,
                };
                if armed {
                    state.timeouts.push((deadline, handle.tlabel, handle.seq));
                }
            }
            other => {
                self.finish(handle.tlabel, Some(handle.seq), other.to_rcode(), &[]);
            }
        }
    }

    /// An inbound response packet (from the AR-response worker or the local
    /// short-circuit). Responses whose source does not match the request's
    /// destination are dropped as stale.
    pub fn handle_response(&self, packet: &Packet) {
        let tlabel = packet.tlabel;
        let seq = {
            let state = self.state.lock();
            let slot = match state.slots[tlabel as usize].as_ref() {
                Some(s) => s,
                None => {
                    log_warn!("unexpected response for tlabel {}", tlabel);
                    return;
                }
            };
            if slot.dest_id != packet.source_id {
                log_warn!(
                    "stale response: tlabel {} from {:04x}, expected {:04x}",
                    tlabel,
                    packet.source_id,
                    slot.dest_id
                );
                return;
            }
            slot.seq
        };

        let rcode = packet.rcode.unwrap_or(RCode::DataError);
        if packet.tcode == TCode::ReadQuadletResponse {
            let quadlet = packet.quadlet_data.to_be_bytes();
            self.finish(tlabel, Some(seq), rcode, &quadlet);
        } else {
            self.finish(tlabel, Some(seq), rcode, &packet.payload);
        }
    }

    /// Asynchronous cancel. Idempotent; a completed or reused slot is left
    /// alone.
    pub fn cancel(&self, handle: TransactionHandle) {
        self.finish(handle.tlabel, Some(handle.seq), RCode::Cancelled, &[]);
    }

    /// Bus-reset flush: every live transaction completes with `cancelled`
    /// and the tlabel space starts over.
    pub fn flush_all(&self) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            for tlabel in 0..TLABEL_COUNT as u8 {
                if let Some((callback, at)) = Self::take_locked(&mut state, tlabel, None) {
                    ready.push((callback, at));
                }
            }
            state.bitmap = 0;
            state.last_tlabel = (TLABEL_COUNT - 1) as u8;
            state.timeouts.clear();
        }
        for (callback, at) in ready {
            at.cancel();
            callback(RCode::Cancelled, &[]);
        }
    }

    /// Fire expired split-timeouts. Driven by the split-timeout worker.
    pub fn tick(&self, now_ms: u64) {
        let expired: Vec<(u8, u64)> = {
            let mut state = self.state.lock();
            let mut fired = Vec::new();
            state.timeouts.retain(|&(deadline, tlabel, seq)| {
                if deadline <= now_ms {
                    fired.push((tlabel, seq));
                    false
                } else {
                    true
                }
            });
            fired
        };
        for (tlabel, seq) in expired {
            self.finish(tlabel, Some(seq), RCode::Timeout, &[]);
        }
    }

    /// Earliest armed deadline, for the worker's sleep planning.
    pub fn next_deadline(&self) -> Option<u64> {
        self.state
            .lock()
            .timeouts
            .iter()
            .map(|&(deadline, _, _)| deadline)
            .min()
    }

    /// Install a request handler somewhere inside `[window_start,
    /// window_stop)`: the first `length`-byte sub-window that does not
    /// overlap an existing handler is allocated. Returns (handler id,
    /// allocated start).
    pub fn add_request_handler(
        &self,
        window_start: u64,
        window_stop: u64,
        length: u64,
        callback: RequestCallback,
    ) -> Result<(u64, u64)> {
        // Windows are quadlet aligned, inside the 48-bit space, non-empty.
        if window_start & 0xffff_0000_0000_0003 != 0
            || window_stop & 0xffff_0000_0000_0003 != 0
            || window_start >= window_stop
            || length == 0
            || length & 3 != 0
        {
            return Err(HeliosError::BadCall);
        }

        let mut handlers = self.handlers.write();
        let mut start = window_start;
        let mut insert_at = None;

        for (i, handler) in handlers.iter().enumerate() {
            if start + length <= window_stop && start + length <= handler.start {
                insert_at = Some(i);
                break;
            }
            if handler.start + handler.length > start {
                start = handler.start + handler.length;
            }
        }
        if start + length > window_stop {
            return Err(HeliosError::Busy);
        }
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let entry = RequestHandler {
            id,
            start,
            length,
            callback,
        };
        match insert_at {
            Some(i) => handlers.insert(i, entry),
            None => handlers.push(entry),
        }
        Ok((id, start))
    }

    pub fn remove_request_handler(&self, id: u64) {
        self.handlers.write().retain(|h| h.id != id);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Match an inbound request against the registry. `None` means nobody
    /// claims the address; the caller answers with an address error.
    pub fn dispatch_request(&self, packet: &Packet) -> Option<HandlerResponse> {
        let callback = {
            let handlers = self.handlers.read();
            handlers
                .iter()
                .find(|h| packet.offset >= h.start && packet.offset < h.start + h.length)
                .map(|h| h.callback.clone())
        };
        callback.map(|cb| cb(packet))
    }
}

/// Shared completion slot between a submitted transaction and the future
/// awaiting it.
pub struct Completion {
    result: Mutex<Option<(RCode, Vec<u8>)>>,
    waker: AtomicWaker,
}

impl Completion {
    pub fn new() -> Arc<Completion> {
        Arc::new(Completion {
            result: Mutex::new(None),
            waker: AtomicWaker::new(),
        })
    }

    pub fn complete(&self, rcode: RCode, data: &[u8]) {
        *self.result.lock() = Some((rcode, data.to_vec()));
        self.waker.wake();
    }

    pub fn try_take(&self) -> Option<(RCode, Vec<u8>)> {
        self.result.lock().take()
    }
}

/// Future view of a pending transaction for async embedders. Resolves with
/// the terminal (rcode, payload) pair exactly once.
pub struct TransactionFuture {
    completion: Arc<Completion>,
}

impl TransactionFuture {
    pub fn new(completion: Arc<Completion>) -> TransactionFuture {
        TransactionFuture { completion }
    }
}

impl Future for TransactionFuture {
    type Output = (RCode, Vec<u8>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.completion.waker.register(cx.waker());
        match self.completion.try_take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}
