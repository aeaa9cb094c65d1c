use std::sync::Arc;

use genlock_if::platform::PhyType;

use super::{PhyOps, RegisterSlot};
use crate::{
    err::{PllError, Result, check_frequency},
    regmap::Regmap,
    registry::{PllGuard, PllRegistry},
};

const PIPE_LINK_M1_A: u32 = 0x60040;
const PIPE_STRIDE: u32 = 0x1000;
const PIPE_COUNT: u8 = 4;

/// DisplayPort link M/N pair of one pipe. The raw M value stands in for the
/// clock: raising M speeds the pipe up relative to the link.
#[derive(Debug)]
pub struct DpMnPhy {
    regmap: Regmap,
    pipe: u8,
    m: RegisterSlot,
    n: RegisterSlot,
    captured: bool,
    _guard: PllGuard,
}

impl DpMnPhy {
    pub fn new(regmap: Regmap, registry: &Arc<PllRegistry>, pipe: u8) -> Result<Self> {
        if pipe >= PIPE_COUNT {
            error!("DP M/N: pipe {pipe} out of range");
            return Err(PllError::InvalidArgument("pipe out of range"));
        }
        let guard = registry.claim(PhyType::DpMn, pipe)?;
        let m = Self::m_reg(pipe);
        Ok(Self {
            regmap,
            pipe,
            m: RegisterSlot::at(m),
            n: RegisterSlot::at(m + 4),
            captured: false,
            _guard: guard,
        })
    }

    pub const fn m_reg(pipe: u8) -> u32 {
        PIPE_LINK_M1_A + PIPE_STRIDE * pipe as u32
    }
}

impl PhyOps for DpMnPhy {
    fn kind(&self) -> PhyType {
        PhyType::DpMn
    }

    fn is_captured(&self) -> bool {
        self.captured
    }

    fn read_registers(&mut self) -> Result {
        self.m.capture(self.regmap.read(self.m.addr));
        self.n.capture(self.regmap.read(self.n.addr));
        self.captured = true;
        Ok(())
    }

    fn calculate_pll_clock(&self) -> f64 {
        self.m.orig as f64
    }

    fn calculate_modified_pll_clock(&self) -> f64 {
        self.m.modified as f64
    }

    fn calculate_feedback_dividers(&mut self, target: f64) -> Result {
        check_frequency(target, "link M")?;
        // Saturating float-to-int cast.
        self.m.modified = target.round() as u32;
        Ok(())
    }

    fn program_mmio(&mut self, use_modified: bool) -> Result {
        self.regmap.write(self.m.addr, self.m.value(use_modified));
        self.regmap.write(self.n.addr, self.n.value(use_modified));
        Ok(())
    }

    fn print_registers(&self) {
        for (name, slot) in [("M", &self.m), ("N", &self.n)] {
            debug!(
                "Pipe {} link {name} @{:#x}: orig {:#x} ({}) mod {:#x} ({})",
                self.pipe, slot.addr, slot.orig, slot.orig, slot.modified, slot.modified
            );
        }
    }
}
