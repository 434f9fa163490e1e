//! Runtime integration layer.
//!
//! Keeps timing policy (retry budgets, backoff curves) in one place so the
//! control and data planes only decide *what* to retry, never *how long*.
//!
//! ```
//! use edge_bridge::RetryPolicy;
//!
//! let mut backoff = RetryPolicy::with_max_attempts(2).backoff();
//! assert!(backoff.next_delay().is_some());
//! assert!(backoff.next_delay().is_none());
//! ```

pub(crate) mod backoff;
