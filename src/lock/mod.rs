//! Distributed Lock
//!
//! Cross-instance mutual exclusion with ownership tokens:
//!
//! - Acquire: set-if-absent of `key -> token` with a lease
//! - Release: atomic check-then-delete, only the token holder succeeds
//! - Watchdog: renews the lease every `ttl / 2` while the holder works

mod distributed;
mod watchdog;

pub use distributed::{DistributedLock, LockConfig, LockToken, LOCK_KEY_PREFIX};
pub use watchdog::Watchdog;
