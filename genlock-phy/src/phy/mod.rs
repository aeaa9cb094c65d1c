use enum_dispatch::enum_dispatch;
use genlock_if::platform::{DdiSelector, PhyType, Platform};

use crate::{
    discovery,
    err::{PllError, Result},
    regmap::Regmap,
    registry::PllRegistry,
};

mod c10;
mod c20;
mod combo;
mod dkl;
mod dp_mn;

pub use c10::C10Phy;
pub use c20::{C20Phy, MpllBlock};
pub use combo::ComboPhy;
pub use dkl::DklPhy;
pub use dp_mn::DpMnPhy;

use std::sync::Arc;

/// One hardware register as found at capture time and as proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSlot<T = u32> {
    pub addr: u32,
    pub orig: T,
    pub modified: T,
}

impl<T: Copy + Default> RegisterSlot<T> {
    pub fn at(addr: u32) -> Self {
        Self {
            addr,
            orig: T::default(),
            modified: T::default(),
        }
    }

    /// Records the as-found value and uses it as the proposal baseline.
    pub fn capture(&mut self, val: T) {
        self.orig = val;
        self.modified = val;
    }

    pub fn value(&self, use_modified: bool) -> T {
        if use_modified { self.modified } else { self.orig }
    }
}

/// Capability set shared by every PLL family.
///
/// Frequencies are in the unit natural to the family: kHz for Combo, C10 and
/// C20, MHz for DKL and the raw M value for DP M/N. Callers only ever compare
/// them relative to each other.
#[enum_dispatch]
pub trait PhyOps {
    fn kind(&self) -> PhyType;

    /// Whether a complete register snapshot has been taken.
    fn is_captured(&self) -> bool;

    /// Reads the PLL registers from hardware into a fresh snapshot, which
    /// becomes both the restore baseline and the proposal starting point.
    fn read_registers(&mut self) -> Result;

    /// Frequency encoded by the captured snapshot.
    fn calculate_pll_clock(&self) -> f64;

    /// Frequency encoded by the proposed values.
    fn calculate_modified_pll_clock(&self) -> f64;

    /// Updates the proposed divider fields to approximate `target`.
    fn calculate_feedback_dividers(&mut self, target: f64) -> Result;

    /// Writes the proposed (`true`) or captured (`false`) values to hardware.
    fn program_mmio(&mut self, use_modified: bool) -> Result;

    fn print_registers(&self);
}

#[enum_dispatch(PhyOps)]
#[derive(Debug)]
pub enum Phy {
    Combo(ComboPhy),
    Dkl(DklPhy),
    C10(C10Phy),
    C20(C20Phy),
    DpMn(DpMnPhy),
}

impl Phy {
    /// Builds the PLL variant driving `selector`.
    ///
    /// Fails with [`PllError::ResourceConflict`] if another session owns the
    /// PLL, or [`PllError::NotInitialized`] when the output has no PLL routed
    /// to it.
    pub fn new(
        selector: &DdiSelector,
        platform: Platform,
        regmap: &Regmap,
        registry: &Arc<PllRegistry>,
    ) -> Result<Self> {
        let index = discovery::resolve_pll_index(selector, regmap).ok_or_else(|| {
            error!("{}: no PLL routed to this output", selector.name);
            PllError::NotInitialized
        })?;
        debug!("{}: {:?} PLL {index}", selector.name, selector.phy);

        let phy = match selector.phy {
            PhyType::Combo => {
                let regs = platform
                    .combo_dplls()
                    .get(index as usize)
                    .copied()
                    .ok_or(PllError::InvalidArgument("DPLL index out of range"))?;
                ComboPhy::new(regmap.clone(), registry, index, regs)?.into()
            }
            PhyType::Dkl => DklPhy::new(regmap.clone(), registry, index)?.into(),
            PhyType::C10 => C10Phy::new(regmap.clone(), registry, selector.port())?.into(),
            PhyType::C20 => C20Phy::new(regmap.clone(), registry, selector.port())?.into(),
            PhyType::DpMn => DpMnPhy::new(regmap.clone(), registry, index)?.into(),
        };
        Ok(phy)
    }

    /// Builds a DP M/N proxy for `pipe`, independent of the PHY family
    /// behind the output.
    pub fn new_dp_m_n(pipe: u8, regmap: &Regmap, registry: &Arc<PllRegistry>) -> Result<Self> {
        Ok(DpMnPhy::new(regmap.clone(), registry, pipe)?.into())
    }
}

/// Float-to-field conversion: truncates towards zero, clamps to `max`.
pub(crate) fn clamp_field(val: f64, max: u32) -> u32 {
    if val.is_nan() || val <= 0.0 {
        0
    } else if val >= max as f64 {
        max
    } else {
        val as u32
    }
}

/// Relative error between two frequencies.
#[cfg(test)]
pub(crate) fn rel_err(a: f64, b: f64) -> f64 {
    ((a - b) / b).abs()
}
