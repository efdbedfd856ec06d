//! Failure handling shared by the protocol client and trading sessions
//!
//! - Sliding-window circuit breaker for connection and order attempts
//! - Reconnect and order-retry backoff
//! - Rate limiting for user-facing error notifications

pub mod backoff;
pub mod circuit_breaker;
pub mod throttle;

pub use backoff::{order_retry_delay, ReconnectBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use throttle::NotificationThrottle;
