//! Bounded-rate reporting of retryable errors.
//!
//! Terminal events are always reported; retryable ones pass through this
//! throttle so a flapping connection cannot flood the front-end.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct NotificationThrottle {
    limiter: GovernorLimiter,
    suppressed: AtomicU64,
}

impl NotificationThrottle {
    /// `per_minute` of zero is treated as one.
    pub fn per_minute(per_minute: u32) -> Self {
        let rate = NonZeroU32::new(per_minute).unwrap_or(nonzero!(1u32));
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(rate)),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns true if the notification may be sent now.
    pub fn allow(&self) -> bool {
        if self.limiter.check().is_ok() {
            true
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Notifications dropped since the last call
    pub fn take_suppressed(&self) -> u64 {
        self.suppressed.swap(0, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for NotificationThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationThrottle")
            .field("suppressed", &self.suppressed.load(Ordering::Relaxed))
            .finish()
    }
}
