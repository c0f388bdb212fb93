//! Fault injection for the in-memory adapters.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Error, Result};

/// Makes an adapter fail upcoming operations with `StoreUnavailable`.
#[derive(Debug, Default)]
pub struct FaultInjector {
    remaining: AtomicU32,
    always: AtomicBool,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations.
    pub fn fail_next(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every operation until reset.
    pub fn fail_always(&self, enabled: bool) {
        self.always.store(enabled, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.remaining.store(0, Ordering::SeqCst);
        self.always.store(false, Ordering::SeqCst);
    }

    /// Consume one injected fault, if any.
    pub fn check(&self, op: &str) -> Result<()> {
        if self.always.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("injected fault in {}", op)));
        }
        let taken = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(Error::StoreUnavailable(format!("injected fault in {}", op))),
            Err(_) => Ok(()),
        }
    }
}
