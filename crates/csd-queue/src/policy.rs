//! Spin/yield policy shared by the queue primitives.

use crate::sync::{spin_once, yield_now};

/// What a waiter does once the queue reports full (producer) or empty
/// (consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Busy-spin with the CPU pause hint and never give up.
    Spin,
    /// Spin for `max_spins` iterations, then yield the thread between retries.
    Yield,
    /// Give up immediately.
    Fail,
}

/// Bounded-retry policy for contended queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    /// Busy iterations before the waiter starts yielding
    pub max_spins: u32,
    /// Behaviour once the queue is full or empty
    pub strategy: WaitStrategy,
}

impl SpinPolicy {
    /// Default spin budget before yielding
    pub const DEFAULT_MAX_SPINS: u32 = 64;

    /// Create a policy
    pub const fn new(max_spins: u32, strategy: WaitStrategy) -> Self {
        Self {
            max_spins,
            strategy,
        }
    }

    /// Never wait on a full or empty queue
    pub const fn non_blocking() -> Self {
        Self::new(0, WaitStrategy::Fail)
    }

    /// Spin `max_spins` times, then yield until the operation succeeds
    pub const fn yielding(max_spins: u32) -> Self {
        Self::new(max_spins, WaitStrategy::Yield)
    }

    /// Start a wait sequence governed by this policy
    pub fn waiter(&self) -> SpinWait {
        SpinWait {
            policy: *self,
            spins: 0,
        }
    }
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self::yielding(Self::DEFAULT_MAX_SPINS)
    }
}

/// Per-call wait state.
#[derive(Debug)]
pub struct SpinWait {
    policy: SpinPolicy,
    spins: u32,
}

impl SpinWait {
    /// Wait one round before retrying a full/empty queue.
    ///
    /// Returns `false` when the policy says the caller should give up.
    pub fn wait(&mut self) -> bool {
        match self.policy.strategy {
            WaitStrategy::Fail => false,
            WaitStrategy::Spin => {
                spin_once();
                true
            }
            WaitStrategy::Yield => {
                self.snooze();
                true
            }
        }
    }

    /// Wait for another thread to finish a step it has already started
    /// (publishing a reserved slot, retiring a trim). Always retries: the
    /// other thread holds no lock and is guaranteed to get there.
    pub fn snooze(&mut self) {
        if self.spins < self.policy.max_spins {
            self.spins += 1;
            spin_once();
        } else {
            yield_now();
        }
    }

    /// Number of busy iterations spent so far
    pub fn spins(&self) -> u32 {
        self.spins
    }
}
