// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # slabq - bounded lock-free MPMC queue over a tagged slab pool
//!
//! A fixed-capacity multi-producer / multi-consumer FIFO queue for passing
//! values between threads where bounded, predictable latency matters more
//! than unbounded capacity. The hot path takes no mutex: enqueue and dequeue
//! are CAS loops over tagged pointers, and the nodes come from an in-crate
//! slab allocator, so the steady state performs no heap allocation.
//!
//! ## Quick Start
//!
//! ```
//! use slabq::Queue;
//!
//! // Capacity 64 (one slot is the permanent sentinel, 63 usable).
//! let queue: Queue<u32, 64> = Queue::new();
//!
//! assert!(queue.push(7));
//! let mut out = 0;
//! assert!(queue.pop(&mut out));
//! assert_eq!(out, 7);
//! assert!(queue.empty());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Queue<T, N>                           |
//! |   push: tail-splice CAS + lag helping                        |
//! |   pop:  head-swing CAS, payload read before the swing        |
//! +--------------------------------------------------------------+
//! |                      NodePool<T, N>                          |
//! |   slab of N node slots | atomic occupancy bitmap             |
//! |   per-slot version seeds feeding the pointer tags            |
//! +--------------------------------------------------------------+
//! |                       TaggedPtr<T>                           |
//! |   address | 2-bit version tag, period 3 (ABA defense)        |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Queue`] | Bounded lock-free MPMC FIFO queue, the only public type |
//!
//! ## Semantics
//!
//! - `push` returns `false` only on pool exhaustion; `pop` returns `false`
//!   only on an observed-empty queue. Both are non-fatal and non-blocking;
//!   there is no waiting API, consumers poll.
//! - Operations are lock-free, not wait-free: an individual thread may retry
//!   while others succeed.
//! - `empty()` is an advisory snapshot and may be stale under concurrency.
//! - Dropping the queue while any other thread still uses it is a contract
//!   violation; the destructor assumes exclusive access.
//!
//! ## Cargo Features
//!
//! - `hold-size` (off by default): the pool keeps an atomic live-slot
//!   counter, enabling `Queue::used` and `Queue::available`. Trades a
//!   contended counter for observability.
//! - `randomised-claim` (off by default): slab claims start at a uniformly
//!   drawn slot instead of a rotating cursor.

mod pool;
mod queue;
mod tagged;

pub use queue::Queue;
