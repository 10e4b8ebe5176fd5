//! The ISR-fed single-producer/single-consumer ingress ring.
//!
//! The ISR mutates only `isr_rcv_nb` and the slot at its index; the
//! dispatch loop mutates only `processed_nb` and the slot at its
//! index. The producer index is published (`Ordering::Release`) only
//! after the slot write; the consumer clears the slot's frame-type tag
//! (the write barrier) before advancing its index
//! (`Ordering::Acquire` on the read that gates the pull). This crate
//! never spawns a thread for the ISR itself — an embedder's interrupt
//! handler calls [`IngressRing::isr_push`] directly — so the atomics
//! exist to satisfy "word-sized locations the compiler will not tear"
//! rather than to arbitrate true multi-core contention.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{MTU_STORAGE, RECV_BUF_SIZE};
use crate::wire::EthernetProtocol;

/// One buffered frame plus the write-barrier tag: cleared by the
/// consumer before it advances past the slot, so a torn read can
/// never observe a half-written frame as already-processed.
#[derive(Clone, Copy)]
pub struct Slot {
    pub buf: [u8; MTU_STORAGE],
    pub len: usize,
    pub frame_type: Option<EthernetProtocol>,
}

impl Slot {
    const fn empty() -> Slot {
        Slot {
            buf: [0; MTU_STORAGE],
            len: 0,
            frame_type: None,
        }
    }
}

pub struct IngressRing {
    slots: UnsafeCell<[Slot; RECV_BUF_SIZE]>,
    isr_rcv_nb: AtomicU32,
    processed_nb: AtomicU32,
    /// Single-slot scratch buffer for outgoing control frames
    ///, and the sink a dropped frame is pulled into
    /// when the ring is full.
    scratch: UnsafeCell<Slot>,
    dropped: AtomicU32,
}

// SAFETY: the only concurrent accessors are the ISR (producer index +
// producer slot) and the dispatch loop (consumer index + consumer
// slot); they never touch the same slot at the same time as long as
// the ring is never observed full by both sides simultaneously, which
// the index arithmetic below guarantees.
unsafe impl Sync for IngressRing {}

impl IngressRing {
    pub const fn new() -> IngressRing {
        IngressRing {
            slots: UnsafeCell::new([Slot::empty(); RECV_BUF_SIZE]),
            isr_rcv_nb: AtomicU32::new(0),
            processed_nb: AtomicU32::new(0),
            scratch: UnsafeCell::new(Slot::empty()),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn pending(&self) -> u32 {
        self.isr_rcv_nb.load(Ordering::Acquire) - self.processed_nb.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.pending() as usize >= RECV_BUF_SIZE
    }

    pub fn dropped_count(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Called from ISR context: copies `frame` into the producer slot
    /// and commits by advancing `isr_rcv_nb`, unless the ring is full,
    /// in which case the frame is pulled into the sink buffer and
    /// silently dropped.
    pub fn isr_push(&self, frame: &[u8]) {
        if self.is_full() {
            // SAFETY: the sink is only ever touched here, from the ISR,
            // and is not read by the dispatch loop.
            let sink = unsafe { &mut *self.scratch.get() };
            let len = frame.len().min(MTU_STORAGE);
            sink.buf[..len].copy_from_slice(&frame[..len]);
            sink.len = len;
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let producer = self.isr_rcv_nb.load(Ordering::Relaxed);
        let index = (producer as usize) % RECV_BUF_SIZE;
        // SAFETY: only the ISR ever writes at `index` until `isr_rcv_nb`
        // is published below, and the consumer only reads slots it has
        // not yet passed (`processed_nb`).
        let slot = unsafe { &mut (*self.slots.get())[index] };
        let len = frame.len().min(MTU_STORAGE);
        slot.buf[..len].copy_from_slice(&frame[..len]);
        slot.len = len;
        slot.frame_type = Some(EthernetProtocol::from(0));
        self.isr_rcv_nb.fetch_add(1, Ordering::Release);
    }

    /// Called from the dispatch loop: if a frame is waiting, hands it
    /// to `f`, clears the slot's frame-type write barrier, and
    /// advances `processed_nb`. Returns whether a frame was processed.
    pub fn dispatch_one<F: FnOnce(&[u8])>(&self, f: F) -> bool {
        let processed = self.processed_nb.load(Ordering::Relaxed);
        if processed == self.isr_rcv_nb.load(Ordering::Acquire) {
            return false;
        }
        let index = (processed as usize) % RECV_BUF_SIZE;
        // SAFETY: this index has been published by the ISR (isr_rcv_nb
        // advanced past it) and the consumer is the only reader/writer
        // of consumer-side state.
        let slot = unsafe { &mut (*self.slots.get())[index] };
        f(&slot.buf[..slot.len]);
        slot.frame_type = None;
        self.processed_nb.fetch_add(1, Ordering::Release);
        true
    }
}

impl Default for IngressRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_tracks_producer_minus_consumer() {
        let ring = IngressRing::new();
        assert_eq!(ring.pending(), 0);
        ring.isr_push(&[1, 2, 3]);
        ring.isr_push(&[4, 5, 6]);
        assert_eq!(ring.pending(), 2);
        let mut seen = heapless::Vec::<u8, 4>::new();
        ring.dispatch_one(|f| seen.push(f[0]).unwrap());
        assert_eq!(ring.pending(), 1);
        assert_eq!(seen.as_slice(), &[1]);
    }

    #[test]
    fn overflow_drops_into_sink_without_advancing_producer() {
        let ring = IngressRing::new();
        for i in 0..RECV_BUF_SIZE {
            ring.isr_push(&[i as u8]);
        }
        assert!(ring.is_full());
        let before = ring.pending();
        ring.isr_push(&[0xEE]);
        ring.isr_push(&[0xEF]);
        assert_eq!(ring.pending(), before);
        assert_eq!(ring.dropped_count(), 2);

        // FIFO order of the 10 frames that did make it in is preserved.
        let mut order = heapless::Vec::<u8, RECV_BUF_SIZE>::new();
        while ring.dispatch_one(|f| order.push(f[0]).unwrap()) {}
        assert_eq!(order.len(), RECV_BUF_SIZE);
        for (i, v) in order.iter().enumerate() {
            assert_eq!(*v, i as u8);
        }
    }
}
