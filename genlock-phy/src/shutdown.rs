//! Process-wide cancellation.
//!
//! Stepping loops and done-waiters poll the flag; once set, sessions restore
//! their captured registers instead of continuing towards a target.

use std::sync::{
    Arc, LazyLock,
    atomic::{AtomicBool, Ordering},
};

static GLOBAL: LazyLock<ShutdownSignal> = LazyLock::new(ShutdownSignal::new);

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    /// A private flag, independent of the global one.
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag shared by the whole process.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Sets the global flag, typically from a SIGINT/SIGTERM handler.
pub fn request_shutdown() {
    GLOBAL.request();
}

pub fn is_shutdown_requested() -> bool {
    GLOBAL.is_requested()
}

pub fn reset_shutdown() {
    GLOBAL.reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_signal_toggles() {
        let local = ShutdownSignal::new();
        local.request();
        assert!(local.is_requested());
        local.reset();
        assert!(!local.is_requested());
    }

    #[test]
    fn global_flag_round_trip() {
        request_shutdown();
        assert!(is_shutdown_requested());
        assert!(ShutdownSignal::global().is_requested());
        reset_shutdown();
        assert!(!is_shutdown_requested());
    }

    #[test]
    fn clones_share_the_flag() {
        let a = ShutdownSignal::new();
        let b = a.clone();
        b.request();
        assert!(a.is_requested());
    }
}
