//! Display PHY PLL control for vsync genlock.
//!
//! A [`Phy`] wraps one hardware PLL family behind [`PhyOps`]; a
//! [`PhyController`] moves it towards a target frequency in bounded steps and
//! restores the captured configuration when its rollback timer fires.

#[macro_use]
extern crate log;

pub mod config;
pub mod controller;
pub mod discovery;
pub mod err;
pub mod msgbus;
pub mod phy;
pub mod regmap;
pub mod registry;
pub mod scheduler;
pub mod shutdown;

#[cfg(test)]
mod test_utils;

pub use genlock_if::mmio::RegisterAccess;
pub use genlock_if::platform::*;
pub use genlock_if::timer::*;

pub use config::{BusConfig, ProgramFlags, SyncConfig};
pub use controller::{PhyController, SessionState, StepOutcome};
pub use err::{PllError, Result};
pub use msgbus::{LaneMask, MsgBus};
pub use phy::{Phy, PhyOps, RegisterSlot};
pub use regmap::{MmioRegion, Regmap};
pub use registry::{PllGuard, PllRegistry};
pub use scheduler::ThreadScheduler;
pub use shutdown::{ShutdownSignal, is_shutdown_requested, request_shutdown, reset_shutdown};
