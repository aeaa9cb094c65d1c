use alloc::boxed::Box;

/// Work handed back by a [`Scheduler`] when a timer expires.
pub type TimerPayload = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// One-shot timers used to schedule PLL rollback.
pub trait Scheduler: Send + Sync {
    /// Arms a timer that runs `payload` once after `duration_ms`.
    fn arm_timer(&self, duration_ms: u64, payload: TimerPayload) -> TimerId;

    /// Returns `false` if the timer already fired or is unknown.
    /// A timer cancelled successfully never runs its payload.
    fn cancel_timer(&self, id: TimerId) -> bool;
}
