// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free MPMC FIFO queue over the slab pool.
//!
//! The list algorithm is the classic Michael & Scott two-CAS queue: `push`
//! splices at the tail, `pop` swings the head, and both sides opportunistically
//! advance a lagging tail. All three hot atomics (`head`, `tail`, every node's
//! `next`) store tagged pointers, so a CAS against a pointer whose slot has
//! been recycled fails on the tag even when the address matches.
//!
//! The list always contains at least one node, the sentinel. `head` points at
//! the sentinel; the first real element is the sentinel's successor. A
//! successful `pop` promotes the first element to sentinel and recycles the
//! old sentinel's slot, which is why a sentinel's payload is dead by
//! construction and must never be read.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::pool::{Node, NodePool};
use crate::tagged::{TaggedPtr, NULL};

/// Bounded lock-free multi-producer / multi-consumer FIFO queue.
///
/// Capacity `N` counts the sentinel, so `N - 1` elements fit at once. `N`
/// must be a positive multiple of the bitmap word width (64 on common
/// targets); other values fail to compile.
///
/// Both operations are lock-free: a thread may retry while others succeed,
/// but some thread always completes. Neither operation blocks, waits, or
/// allocates; `push` reports a full pool and `pop` reports emptiness through
/// their `bool` results.
///
/// # Example
///
/// ```
/// use slabq::Queue;
///
/// let queue: Queue<u64, 64> = Queue::new();
/// assert!(queue.push(1));
/// assert!(queue.push(2));
///
/// let mut out = 0;
/// assert!(queue.pop(&mut out));
/// assert_eq!(out, 1);
/// ```
pub struct Queue<T, const N: usize> {
    /// Tagged pointer to the sentinel. Never null while the queue is alive.
    head: CachePadded<AtomicUsize>,
    /// Tagged pointer to the last node, or transiently to its predecessor.
    tail: CachePadded<AtomicUsize>,
    pool: NodePool<T, N>,
}

impl<T, const N: usize> Queue<T, N> {
    /// Create an empty queue. Allocates the whole slab up front; the hot
    /// path never touches the system allocator afterwards.
    pub fn new() -> Self {
        let pool = NodePool::new();
        let sentinel = pool
            .construct_sentinel()
            .expect("fresh pool always yields the sentinel slot");
        let raw = sentinel.into_raw();
        Self {
            head: CachePadded::new(AtomicUsize::new(raw)),
            tail: CachePadded::new(AtomicUsize::new(raw)),
            pool,
        }
    }

    /// Append `value` at the tail.
    ///
    /// Returns `false` only when the pool is exhausted; callers typically
    /// spin-retry or back off. Never blocks.
    ///
    /// Protocol: allocate a node, then loop { re-read `tail` and its `next`;
    /// help a lagging tail forward; otherwise CAS the last node's `next` from
    /// null to the new node and best-effort swing `tail` }. The linking CAS
    /// is the publication point for the node's payload.
    pub fn push(&self, value: T) -> bool {
        let node = match self.pool.construct(value) {
            Some(node) => node,
            None => return false,
        };
        let new_raw = node.into_raw();

        loop {
            let tail_f = self.tail.load(Ordering::Acquire);
            let last: TaggedPtr<Node<T>> = TaggedPtr::from_raw(tail_f);
            // SAFETY: tail is never null and the slab never shrinks, so the
            // cleared address is always mapped. If the slot was recycled
            // under us, the re-check below discards what we read.
            let next_f = unsafe { (*last.as_ptr()).next.load(Ordering::Acquire) };

            if tail_f != self.tail.load(Ordering::Acquire) {
                continue;
            }

            if next_f != NULL {
                // Tail lags behind the real last node; help it forward.
                let _ = self.tail.compare_exchange_weak(
                    tail_f,
                    next_f,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            // SAFETY: same reasoning as the load above; a stale `last` makes
            // this CAS fail on the tag.
            let linked = unsafe {
                (*last.as_ptr())
                    .next
                    .compare_exchange_weak(next_f, new_raw, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };
            if linked {
                // Best effort; a failed swing means someone else already
                // helped, so the element is in either way.
                let _ = self.tail.compare_exchange_weak(
                    tail_f,
                    new_raw,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                return true;
            }
        }
    }

    /// Remove the oldest element into `out`.
    ///
    /// Returns `false` when the queue is observed empty. Never blocks.
    ///
    /// The payload is read **before** the head-swing CAS: once `head` moves,
    /// a concurrent consumer may promote our node to sentinel and recycle the
    /// slot behind it. A read that loses the CAS race is discarded without
    /// running any destructor.
    pub fn pop(&self, out: &mut T) -> bool {
        loop {
            let head_f = self.head.load(Ordering::Acquire);
            let tail_f = self.tail.load(Ordering::Acquire);
            let sentinel: TaggedPtr<Node<T>> = TaggedPtr::from_raw(head_f);
            // SAFETY: head is never null; slab memory stays mapped. Stale
            // reads are discarded by the re-check below.
            let first: TaggedPtr<Node<T>> =
                TaggedPtr::from_raw(unsafe { (*sentinel.as_ptr()).next.load(Ordering::Acquire) });

            if head_f != self.head.load(Ordering::Acquire) {
                continue;
            }

            if head_f == tail_f {
                if first.is_null() {
                    return false;
                }
                // An element exists but tail still points at the sentinel;
                // help before retrying, head must not overtake tail.
                let _ = self.tail.compare_exchange_weak(
                    tail_f,
                    first.into_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            debug_assert!(!first.is_null(), "non-empty queue with null first link");
            // Speculative copy of the payload bytes; see the method docs for
            // why this precedes the CAS. MaybeUninit keeps a losing copy from
            // running any destructor.
            // SAFETY: slab memory stays mapped; the copy is only promoted to
            // a value if our CAS wins, in which case no other thread could
            // have recycled `first` in between.
            let value = unsafe { std::ptr::read(std::ptr::addr_of!((*first.as_ptr()).value)) };

            if self
                .head
                .compare_exchange_weak(
                    head_f,
                    first.into_raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: the CAS won, so the bytes we copied were the
                // producer's published payload.
                *out = unsafe { value.assume_init() };
                // The old sentinel's payload was consumed by an earlier pop
                // (or never written); only the slot goes back.
                // SAFETY: head moved past the old sentinel, no new reader can
                // reach it, and we are the unique recycler.
                unsafe { self.pool.release_taken(sentinel) };
                return true;
            }
        }
    }

    /// Advisory emptiness snapshot: `head` and `tail` compare equal, tags
    /// included. May be stale the moment it returns; callers that need the
    /// answer should use [`pop`](Self::pop).
    pub fn empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Live slots, sentinel included. Exact only at quiescent points.
    #[cfg(feature = "hold-size")]
    pub fn used(&self) -> usize {
        self.pool.used()
    }

    /// Free slots at this instant.
    #[cfg(feature = "hold-size")]
    pub fn available(&self) -> usize {
        self.pool.available()
    }
}

impl<T, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for Queue<T, N> {
    /// Teardown contract: no other thread may touch the queue during or
    /// after drop. Walks the chain, runs destructors for unpopped payloads,
    /// and hands every slot back before the pool itself goes down.
    fn drop(&mut self) {
        let sentinel_raw = *self.head.get_mut();
        let mut cursor = sentinel_raw;
        let mut unpopped = 0usize;

        while cursor != NULL {
            let node: TaggedPtr<Node<T>> = TaggedPtr::from_raw(cursor);
            // Read the link before release: release recycles the link word
            // as the slot's version seed.
            // SAFETY: sole owner during drop; the chain is intact.
            let next = unsafe { (*node.as_ptr()).next.load(Ordering::Relaxed) };
            if cursor == sentinel_raw {
                // SAFETY: the sentinel payload is dead by the queue
                // invariant.
                unsafe { self.pool.release_taken(node) };
            } else {
                // SAFETY: nodes behind the sentinel hold live payloads.
                unsafe { self.pool.release(node) };
                unpopped += 1;
            }
            cursor = next;
        }

        *self.head.get_mut() = NULL;
        *self.tail.get_mut() = NULL;

        if unpopped > 0 {
            log::debug!("[slabq] queue dropped with {unpopped} unpopped element(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_queue_is_empty() {
        let queue: Queue<u64, 64> = Queue::new();
        assert!(queue.empty());
        let mut out = 0;
        assert!(!queue.pop(&mut out));
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let queue: Queue<i32, 512> = Queue::new();
        assert!(queue.push(5));
        assert!(!queue.empty());

        let mut out = 0;
        assert!(queue.pop(&mut out));
        assert_eq!(out, 5);
        assert!(queue.empty());
        assert!(!queue.pop(&mut out));
    }

    #[test]
    fn test_fifo_order_single_thread() {
        let queue: Queue<usize, 512> = Queue::new();
        for i in 0..400 {
            assert!(queue.push(i));
        }
        let mut out = 0;
        for i in 0..400 {
            assert!(queue.pop(&mut out));
            assert_eq!(out, i);
        }
        assert!(!queue.pop(&mut out));
        assert!(queue.empty());
    }

    #[test]
    fn test_fill_to_exhaustion() {
        let queue: Queue<i32, 64> = Queue::new();
        let mut pushed = 0;
        while queue.push(1) {
            pushed += 1;
        }
        // One slot of 64 belongs to the sentinel.
        assert_eq!(pushed, 63);

        // Freeing one slot makes a later push succeed. "Later" because the
        // claim start may take many attempts to come back around to the
        // freed bit.
        let mut out = 0;
        assert!(queue.pop(&mut out));
        let mut attempts = 0;
        while !queue.push(2) {
            attempts += 1;
            assert!(attempts < 10_000, "push did not recover after pop");
        }
    }

    #[test]
    fn test_pop_overwrites_out() {
        let queue: Queue<String, 64> = Queue::new();
        assert!(queue.push(String::from("fresh")));

        let mut out = String::from("stale");
        assert!(queue.pop(&mut out));
        assert_eq!(out, "fresh");
    }

    struct DropTicket(Arc<StdAtomicUsize>);

    impl Drop for DropTicket {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_reclaims_unpopped_values() {
        let drops = Arc::new(StdAtomicUsize::new(0));
        {
            let queue: Queue<DropTicket, 64> = Queue::new();
            for _ in 0..5 {
                assert!(queue.push(DropTicket(Arc::clone(&drops))));
            }

            let mut out = DropTicket(Arc::clone(&drops));
            assert!(queue.pop(&mut out)); // drops the placeholder ticket
            assert!(queue.pop(&mut out)); // drops the first popped ticket
            assert_eq!(drops.load(Ordering::SeqCst), 2);
            drop(out); // drops the second popped ticket
            assert_eq!(drops.load(Ordering::SeqCst), 3);
            // Three tickets remain queued when the queue goes down.
        }
        assert_eq!(drops.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        let queue = Arc::new(Queue::<usize, 64>::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..10_000 {
                    while !queue.push(i) {
                        thread::yield_now();
                    }
                }
            })
        };

        let mut out = 0;
        let mut expected = 0;
        while expected < 10_000 {
            if queue.pop(&mut out) {
                assert_eq!(out, expected);
                expected += 1;
            }
        }
        producer.join().expect("producer thread panicked");
        assert!(queue.empty());
    }

    #[cfg(feature = "hold-size")]
    #[test]
    fn test_hold_size_accessors() {
        let queue: Queue<i32, 512> = Queue::new();
        assert!(queue.empty());
        assert_eq!(queue.used(), 1); // sentinel
        assert_eq!(queue.available(), 511);

        assert!(queue.push(5));
        assert_eq!(queue.used(), 2);
        assert_eq!(queue.available(), 510);

        let mut out = 0;
        assert!(queue.pop(&mut out));
        assert_eq!(out, 5);
        assert_eq!(queue.used(), 1);
        assert_eq!(queue.available(), 511);
    }
}
