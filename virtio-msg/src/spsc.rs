//! Lock-free single-producer/single-consumer ring over a raw memory region
//! (spec.md §2 "SPSC queue (external, thin adapter)", §3 "SPSC pair").
//!
//! Both carriers share this ring: the shared-memory carrier backs it with an
//! mmap'd BAR, the local carrier with a named `shm_open` object. The ring
//! itself doesn't know or care which; it only owns index arithmetic and the
//! acquire/release discipline spec.md §5 requires ("32-bit MMIO accesses go
//! through volatile, naturally-aligned helpers... a slot is either fully
//! published or not visible").
//!
//! Layout: an 8-byte header (`head: u32`, `tail: u32`) followed by
//! `slot_count` fixed [`MSG_SIZE`]-byte slots. `slot_count` is derived from
//! the region length, so a 4 KiB region holds `(4096 - 8) / 40 = 102` slots.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::msg::{Msg, MSG_SIZE};

const HEADER_LEN: usize = 8;

/// A ring over a caller-owned byte region. The region must outlive the ring
/// and must not be touched by anyone but the ring while it's attached
/// (mirrors the "sender owns its ring's producer index, receiver owns its
/// consumer index" invariant of spec.md §3).
pub struct SpscRing {
    region: *mut u8,
    slot_count: usize,
}

// SAFETY: the ring is only ever driven from the single cooperative event
// loop described in spec.md §5; `Send` lets a carrier move the ring into
// place during construction.
unsafe impl Send for SpscRing {}

impl SpscRing {
    /// `region` must be at least `HEADER_LEN + MSG_SIZE` bytes and must stay
    /// valid and exclusively owned by this ring for as long as it's used.
    ///
    /// # Safety
    /// `region` must point to `len` valid, writable bytes for the lifetime
    /// of the returned `SpscRing`.
    pub unsafe fn new(region: *mut u8, len: usize) -> Self {
        assert!(len >= HEADER_LEN + MSG_SIZE, "SPSC region too small");
        let slot_count = (len - HEADER_LEN) / MSG_SIZE;
        Self { region, slot_count }
    }

    fn head(&self) -> &AtomicU32 {
        unsafe { &*(self.region as *const AtomicU32) }
    }

    fn tail(&self) -> &AtomicU32 {
        unsafe { &*(self.region.add(4) as *const AtomicU32) }
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        unsafe { self.region.add(HEADER_LEN + slot * MSG_SIZE) }
    }

    /// Reset both cursors to empty and zero the ring memory. Used by
    /// carriers honouring the `reset_queues` config option (spec.md §6).
    pub fn reset(&self) {
        self.head().store(0, Ordering::Relaxed);
        self.tail().store(0, Ordering::Relaxed);
        for slot in 0..self.slot_count {
            unsafe {
                std::ptr::write_bytes(self.slot_ptr(slot), 0, MSG_SIZE);
            }
        }
    }

    /// Non-blocking enqueue. Returns `false` if the ring is full; the caller
    /// busy-spins (spec.md §4.2 `send`).
    pub fn try_enqueue(&self, msg: &Msg) -> bool {
        let tail = self.tail().load(Ordering::Relaxed);
        let next_tail = (tail + 1) % self.slot_count as u32;
        if next_tail == self.head().load(Ordering::Acquire) {
            return false;
        }
        let bytes = msg.to_bytes();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_ptr(tail as usize), MSG_SIZE);
        }
        self.tail().store(next_tail, Ordering::Release);
        true
    }

    /// Non-blocking dequeue. Returns `true` iff a message was dequeued
    /// (spec.md §4.2 `recv`).
    pub fn try_dequeue(&self, out: &mut Msg) -> bool {
        let head = self.head().load(Ordering::Relaxed);
        if head == self.tail().load(Ordering::Acquire) {
            return false;
        }
        let mut bytes = [0u8; MSG_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot_ptr(head as usize), bytes.as_mut_ptr(), MSG_SIZE);
        }
        *out = Msg::from_bytes(&bytes);
        self.head()
            .store((head + 1) % self.slot_count as u32, Ordering::Release);
        true
    }
}
