// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity lock-free slab allocator for queue nodes.
//!
//! The pool owns a contiguous slab of `N` node slots plus an atomic bitmap
//! with one occupancy bit per slot. Claiming a slot is a bounded scan of
//! per-bit `fetch_or` attempts; releasing is a single `fetch_and`. No slot is
//! ever returned to the system allocator while the pool is alive, which is
//! what lets the queue traverse stale pointers without faulting.
//!
//! Every slot also carries a version seed. The seed of a free slot lives in
//! the slot's link word and feeds the tag of the next pointer constructed
//! there, so a recycled slot is never CAS-equal to any pointer issued for a
//! previous tenant.
//!
//! # Performance
//!
//! - claim: one `fetch_or` per probed bit, no retry loop on contention
//! - release: single `fetch_and`

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(feature = "hold-size", not(feature = "randomised-claim")))]
use crossbeam::utils::CachePadded;

use crate::tagged::{TaggedPtr, NULL, TAG_BITS, TAG_PERIOD};

/// Bits per bitmap word (natural machine word).
pub(crate) const WORD_BITS: usize = usize::BITS as usize;

/// One queue node: a payload and a tagged link to the successor.
///
/// The link word doubles as storage for the slot's version seed while the
/// slot is free. It is therefore accessed atomically for the whole lifetime
/// of the slab, so a stale traversal racing with slot reuse reads a garbage
/// value (discarded by the caller's CAS re-checks) instead of tearing. The
/// seed is biased into `1..=TAG_PERIOD` so a free slot's link word never
/// equals the null link.
///
/// The payload is only meaningful for nodes reachable behind the queue's
/// sentinel; the sentinel's payload is stale or uninitialized and must never
/// be read.
#[repr(C)]
pub(crate) struct Node<T> {
    /// Tagged successor while live; version seed while free. `NULL` ends the
    /// list.
    pub(crate) next: AtomicUsize,
    /// Payload. Written before the node is published, moved out by `pop`.
    pub(crate) value: MaybeUninit<T>,
}

/// One slab cell. Holds a live [`Node`] when the matching bitmap bit is set;
/// otherwise only the link word (version seed) is meaningful.
struct Slot<T> {
    node: UnsafeCell<MaybeUninit<Node<T>>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            node: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn node_ptr(&self) -> *mut Node<T> {
        self.node.get().cast()
    }
}

/// Fixed-capacity, thread-safe supplier of queue nodes.
///
/// `N` must be a positive multiple of [`WORD_BITS`]; violations are rejected
/// at compile time when the pool is instantiated.
pub(crate) struct NodePool<T, const N: usize> {
    /// Contiguous node storage. Never reallocated after construction.
    slots: Vec<Slot<T>>,
    /// Occupancy bitmap, one bit per slot. Set means live.
    words: Vec<AtomicUsize>,
    /// Rotating claim cursor. Each claim starts one slot further along, which
    /// spreads contention across the bitmap words.
    #[cfg(not(feature = "randomised-claim"))]
    hint: CachePadded<AtomicUsize>,
    /// Count of live slots, sentinel included.
    #[cfg(feature = "hold-size")]
    live: CachePadded<AtomicUsize>,
}

// SAFETY: NodePool is Send + Sync because:
// - slot payloads are reached only through tagged pointers handed out by the
//   claim path, and the bitmap fetch_or gives each claimant exclusive
//   ownership of its slot until release
// - the link/seed word is accessed atomically for the slab's whole lifetime
// - payloads of type T move between threads through the slab, hence T: Send
unsafe impl<T: Send, const N: usize> Send for NodePool<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for NodePool<T, N> {}

impl<T, const N: usize> NodePool<T, N> {
    /// Evaluated at monomorphization; rejects invalid capacities at compile
    /// time rather than at runtime.
    const CAPACITY_CHECK: () = assert!(
        N > 0 && N % WORD_BITS == 0,
        "pool capacity must be a positive multiple of the bitmap word width",
    );

    pub(crate) fn new() -> Self {
        let _: () = Self::CAPACITY_CHECK;

        let slots: Vec<Slot<T>> = (0..N).map(|_| Slot::new()).collect();
        for slot in &slots {
            // Seed every free slot's link word. Seeds are biased by one
            // (1..=TAG_PERIOD) so a free slot's link word is never zero:
            // zero is the null link, and a stale traversal of a freed slot
            // must never mistake the seed for an open splice point.
            // SAFETY: slot storage is exclusively ours during construction,
            // and the link word is in bounds for any T (Node starts with it).
            unsafe {
                ptr::addr_of_mut!((*slot.node_ptr()).next).write(AtomicUsize::new(1));
            }
        }

        let word_count = N / WORD_BITS;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(AtomicUsize::new(0));
        }

        Self {
            slots,
            words,
            #[cfg(not(feature = "randomised-claim"))]
            hint: CachePadded::new(AtomicUsize::new(0)),
            #[cfg(feature = "hold-size")]
            live: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Claim a slot and construct a node holding `value`.
    ///
    /// Returns `None` iff no free slot was found during one full bitmap pass.
    /// Never blocks; each probed bit is a single `fetch_or`.
    pub(crate) fn construct(&self, value: T) -> Option<TaggedPtr<Node<T>>> {
        self.construct_with(MaybeUninit::new(value))
    }

    /// Claim a slot for the queue's sentinel. The payload stays
    /// uninitialized; consumers never read a sentinel's payload.
    pub(crate) fn construct_sentinel(&self) -> Option<TaggedPtr<Node<T>>> {
        self.construct_with(MaybeUninit::uninit())
    }

    fn construct_with(&self, value: MaybeUninit<T>) -> Option<TaggedPtr<Node<T>>> {
        // Upper-bound gate: saves full-bitmap scans when the pool runs at
        // capacity. Deliberately decoupled from the bit scan below.
        #[cfg(feature = "hold-size")]
        {
            if self.live.fetch_add(1, Ordering::AcqRel) >= N {
                self.live.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        }

        let index = match self.claim() {
            Some(index) => index,
            None => {
                #[cfg(feature = "hold-size")]
                self.live.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
        };

        let node = self.slots[index].node_ptr();
        // SAFETY: the claim above made this slot exclusively ours. The link
        // word holds the biased seed left by the slot's previous tenant (or
        // the initial seed); Relaxed suffices because the bitmap
        // fetch_or/fetch_and pair orders it against the releasing thread.
        let seed = unsafe { (*node).next.load(Ordering::Relaxed) };
        debug_assert!((1..=TAG_PERIOD).contains(&seed), "corrupt version seed");
        let tag = seed % TAG_PERIOD;

        // SAFETY: exclusive ownership of the slot. Plain stores are fine for
        // the payload (the linking CAS in the queue is the publication
        // point); the link word stays atomic so stale traversals never race
        // non-atomically with it.
        unsafe {
            ptr::addr_of_mut!((*node).value).write(value);
            (*node).next.store(NULL, Ordering::Relaxed);
        }

        Some(TaggedPtr::from_parts(node, tag))
    }

    /// Drop the stored payload, then return the slot to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been issued by this pool's `construct`, the payload
    /// must still be initialized, and no other thread may still reach the
    /// node through the queue structure.
    pub(crate) unsafe fn release(&self, ptr: TaggedPtr<Node<T>>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.release_inner(ptr, true) }
    }

    /// Return a slot whose payload has already been moved out (or was never
    /// written, as for the sentinel).
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release), except the payload must be dead.
    pub(crate) unsafe fn release_taken(&self, ptr: TaggedPtr<Node<T>>) {
        // SAFETY: forwarded caller contract.
        unsafe { self.release_inner(ptr, false) }
    }

    unsafe fn release_inner(&self, ptr: TaggedPtr<Node<T>>, drop_value: bool) {
        let node = ptr.as_ptr();
        let index = self.slot_index(node);
        debug_assert!(index < N, "pointer does not belong to this pool");

        if drop_value {
            // SAFETY: caller asserts the payload is initialized and the node
            // unreachable; we are the last owner.
            unsafe { ptr::drop_in_place((*node).value.as_mut_ptr()) };
        }

        // The retiring tag, biased by one to keep the word non-null, becomes
        // the seed for the slot's next tenant. Must happen before the bit
        // clear so the next claimant reads a completed value.
        // SAFETY: node is in-slab and its link word is always a valid atomic.
        unsafe { (*node).next.store(ptr.tag() + 1, Ordering::Relaxed) };

        let mask = 1usize << (index % WORD_BITS);
        let prev = self.words[index / WORD_BITS].fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(prev & mask != 0, "slot released twice");

        #[cfg(feature = "hold-size")]
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// One full pass over the bitmap, claiming the first clear bit found.
    ///
    /// The pass starts at the hint bit and probes its word up to the word
    /// boundary; every following word is probed from bit zero. The starting
    /// word is visited once, so bits below the initial offset are not
    /// revisited within the pass. Callers that spin on a full pool regain
    /// them on a later attempt as the hint rotates.
    fn claim(&self) -> Option<usize> {
        let start = self.claim_start();
        let word_count = self.words.len();
        let first_word = start / WORD_BITS;
        let mut bit = start % WORD_BITS;

        for step in 0..word_count {
            let w = (first_word + step) % word_count;
            let word = &self.words[w];
            while bit < WORD_BITS {
                let mask = 1usize << bit;
                let prev = word.fetch_or(mask, Ordering::AcqRel);
                if prev & mask == 0 {
                    return Some(w * WORD_BITS + bit);
                }
                bit += 1;
            }
            bit = 0;
        }
        None
    }

    #[cfg(not(feature = "randomised-claim"))]
    fn claim_start(&self) -> usize {
        self.hint.fetch_add(1, Ordering::Relaxed) % N
    }

    #[cfg(feature = "randomised-claim")]
    fn claim_start(&self) -> usize {
        fastrand::usize(..N)
    }

    fn slot_index(&self, node: *mut Node<T>) -> usize {
        let base = self.slots.as_ptr() as usize;
        (node as usize - base) / mem::size_of::<Slot<T>>()
    }

    /// Live slots, sentinel included. Counter reads race with in-flight
    /// claims; exact only at quiescent points.
    #[cfg(feature = "hold-size")]
    pub(crate) fn used(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Free slots at this instant.
    #[cfg(feature = "hold-size")]
    pub(crate) fn available(&self) -> usize {
        N - self.used()
    }
}

impl<T, const N: usize> Drop for NodePool<T, N> {
    /// Teardown backstop: any slot still marked live holds a payload that
    /// was never handed back, so run its destructor here. The queue's own
    /// drop returns every node first, leaving this scan empty in normal use.
    fn drop(&mut self) {
        let mut reclaimed = 0usize;
        for w in 0..self.words.len() {
            let mut bits = *self.words[w].get_mut();
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let node = self.slots[w * WORD_BITS + bit].node_ptr();
                // SAFETY: the bit says this slot has a live tenant and no
                // thread can touch the pool during drop.
                unsafe { ptr::drop_in_place((*node).value.as_mut_ptr()) };
                reclaimed += 1;
            }
            *self.words[w].get_mut() = 0;
        }
        if reclaimed > 0 {
            log::debug!("[slabq] pool teardown reclaimed {reclaimed} leaked slot(s)");
        }
    }
}

// Tag bits fit any plausible node alignment; the link word alone guarantees
// word alignment, which leaves at least TAG_BITS zero low bits.
const _: () = assert!(mem::align_of::<AtomicUsize>() >= (1 << TAG_BITS));
