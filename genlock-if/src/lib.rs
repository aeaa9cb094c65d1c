#![no_std]

extern crate alloc;

pub mod err;
pub mod mmio;
pub mod platform;
pub mod timer;

pub use err::PllError;
pub use mmio::RegisterAccess;
pub use platform::{DdiSelector, DpllRegs, PhyType, Platform};
pub use timer::{Scheduler, TimerId, TimerPayload};
