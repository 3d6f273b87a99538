//! Lock-free queue primitives for the CSD data plane.
//!
//! Three multi-producer/multi-consumer building blocks used to hand work
//! requests, completions, and buffers between the network completion thread
//! and processing threads without taking a kernel lock on the hot path:
//!
//! - [`RingQueue`]: fixed-capacity ring with separate reserve/commit cursors.
//! - [`LinkedQueue`]: unbounded Michael-Scott style linked queue.
//! - [`SlotRing`]: slotted ring with deferred, in-order reclamation that
//!   tolerates out-of-order removal.
//!
//! Contended waits follow an injectable [`SpinPolicy`]: spin for a bounded
//! number of iterations, then yield, or fail immediately for callers that
//! must never block.
//!
//! # Example
//!
//! ```
//! use csd_queue::{RingQueue, SpinPolicy};
//!
//! let queue = RingQueue::with_policy(8, SpinPolicy::non_blocking());
//! queue.try_push(7u32).unwrap();
//! assert_eq!(queue.try_pop(), Some(7));
//! assert_eq!(queue.try_pop(), None);
//! ```

pub mod linked;
pub mod policy;
pub mod ring;
pub mod slot_ring;

mod sync;

pub use linked::LinkedQueue;
pub use policy::{SpinPolicy, SpinWait, WaitStrategy};
pub use ring::RingQueue;
pub use slot_ring::{SlotId, SlotRing};
