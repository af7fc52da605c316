//! Throttling primitives for remote downloads
//!
//! This crate provides the two knobs logfetch uses to stay gentle with constrained SSH servers:
//!
//! 1. **Transfer slots** - [`Limiter`] bounds how many downloads may be in progress at once
//! 2. **Link pacing** - [`Pacer`] inserts a short pause after every fixed amount of transferred data
//!
//! # Transfer slots
//!
//! ```rust,no_run
//! use throttle::Limiter;
//!
//! # async fn example() {
//! // at most 2 concurrent downloads
//! let slots = std::sync::Arc::new(Limiter::new(2));
//!
//! // acquire a slot before starting a download - the slot is released when the guard is dropped
//! let _slot = slots.acquire().await;
//! # }
//! ```
//!
//! A limit of `0` disables the limiter: [`Limiter::acquire`] returns immediately.
//!
//! # Link pacing
//!
//! ```rust
//! use throttle::Pacer;
//! use std::time::Duration;
//!
//! // pause 10ms after every 1 MiB
//! let mut pacer = Pacer::new(1024 * 1024, Duration::from_millis(10));
//! for _ in 0..32 {
//!     if let Some(pause) = pacer.record(32 * 1024) {
//!         std::thread::sleep(pause);
//!     }
//! }
//! assert_eq!(pacer.pauses(), 1);
//! ```
//!
//! # Thread Safety
//!
//! [`Limiter`] is `Send + Sync` and is meant to be shared behind an `Arc` across tasks. A
//! [`Pacer`] belongs to a single transfer and is not shared.

mod pacer;
mod semaphore;

pub use pacer::Pacer;

/// Bounds the number of concurrently held transfer slots.
pub struct Limiter {
    limit: usize,
    sem: semaphore::Semaphore,
}

/// Held for the duration of one transfer; dropping it frees the slot.
pub struct SlotGuard {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl Limiter {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let sem = semaphore::Semaphore::new();
        sem.setup(limit);
        tracing::debug!("transfer slots: {}", limit);
        Self { limit, sem }
    }

    pub async fn acquire(&self) -> SlotGuard {
        SlotGuard {
            _permit: self.sem.acquire_owned().await,
        }
    }

    /// Configured limit (0 = unlimited).
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free, `None` when the limiter is disabled.
    #[must_use]
    pub fn available(&self) -> Option<usize> {
        self.sem.available()
    }
}
